//! SSH message dispatcher.
//!
//! One task per session owns the packet reader. It routes inbound connection
//! messages to channels by recipient ID, answers what the connection layer
//! must answer (CLOSE, global requests, unknown channel types) and drives
//! rekeys once the session is authenticated.
//!
//! Writes made by the dispatcher itself are queued in an outbox and flushed
//! through the shared writer between inbound messages. During a rekey the
//! dispatcher holds the writer for the whole exchange, so channel writers
//! wait and nothing is sealed under the wrong keys.

use crate::ssh::channel::{
    Channel, ChannelShared, ChannelTimeouts, Inbound, SharedWriter,
};
use crate::ssh::connection::{
    request_failure, ChannelClose, ChannelData, ChannelEof,
    ChannelExtendedData, ChannelFailure, ChannelOpen, ChannelOpenConfirmation, ChannelOpenFailure,
    ChannelOpenFailureReason, ChannelRequest, ChannelRequestType, ChannelSuccess, ChannelType,
    ChannelWindowAdjust, GlobalRequest,
};
use crate::ssh::logging;
use crate::ssh::message::{
    message_number, unimplemented_message, Disconnect, DisconnectReason, MessageType,
};
use crate::ssh::packet::PacketReader;
use crate::ssh::transport::{
    apply_kex_actions, KexContext, KeyExchange, RekeyTracker, Role, TransportState,
};
use ferry_platform::{FerryError, FerryResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// How long teardown waits for the writer before giving up on DISCONNECT.
const TEARDOWN_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Requests from session and channel handles to the dispatcher task.
pub(crate) enum Command {
    /// Open a channel; the reply fires on confirmation or failure.
    Open {
        kind: ChannelType,
        window: u32,
        max_packet: u32,
        reply: oneshot::Sender<FerryResult<Channel>>,
    },
    /// A channel handle was dropped without closing.
    Dropped(u32),
    /// Start a key exchange now.
    Rekey(oneshot::Sender<FerryResult<()>>),
    /// Send DISCONNECT and stop.
    Disconnect {
        reason: DisconnectReason,
        description: String,
        done: Option<oneshot::Sender<()>>,
    },
}

/// Session state visible to handles while the dispatcher runs.
#[derive(Debug)]
pub(crate) struct SessionStatus {
    role: Role,
    state: parking_lot::Mutex<TransportState>,
    rekeys: AtomicU64,
}

impl SessionStatus {
    pub(crate) fn new(role: Role, state: TransportState) -> Self {
        Self {
            role,
            state: parking_lot::Mutex::new(state),
            rekeys: AtomicU64::new(0),
        }
    }

    pub(crate) fn state(&self) -> TransportState {
        *self.state.lock()
    }

    pub(crate) fn rekeys(&self) -> u64 {
        self.rekeys.load(Ordering::Relaxed)
    }

    fn transition(&self, next: TransportState) -> FerryResult<()> {
        self.state.lock().transition(next, self.role)
    }

    fn close(&self) {
        let mut state = self.state.lock();
        if *state != TransportState::Closed {
            // Every state may close.
            let _ = state.transition(TransportState::Closed, self.role);
        }
    }
}

struct OpenSlot {
    shared: Arc<ChannelShared>,
    inbound: mpsc::UnboundedSender<Inbound>,
    /// Accepted session channel not yet handed out by a subsystem request.
    undelivered: Option<Channel>,
}

enum Slot {
    Opening {
        kind: String,
        window: u32,
        reply: oneshot::Sender<FerryResult<Channel>>,
    },
    Open(OpenSlot),
}

/// Settings for channels the dispatcher creates.
#[derive(Debug, Clone)]
pub(crate) struct ChannelDefaults {
    pub(crate) timeouts: ChannelTimeouts,
    pub(crate) window: u32,
    pub(crate) max_packet: u32,
    /// Subsystems accepted on incoming session channels.
    pub(crate) subsystems: Vec<String>,
}

/// The receive loop of one session.
pub(crate) struct Dispatcher {
    role: Role,
    reader: PacketReader,
    writer: SharedWriter,
    tracker: Arc<RekeyTracker>,
    kex: KexContext,
    status: Arc<SessionStatus>,
    commands: mpsc::UnboundedReceiver<Command>,
    command_tx: mpsc::UnboundedSender<Command>,
    channels: HashMap<u32, Slot>,
    next_id: u32,
    outbox: Vec<Vec<u8>>,
    incoming: Option<mpsc::UnboundedSender<(String, Channel)>>,
    defaults: ChannelDefaults,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        role: Role,
        reader: PacketReader,
        writer: SharedWriter,
        tracker: Arc<RekeyTracker>,
        kex: KexContext,
        status: Arc<SessionStatus>,
        commands: mpsc::UnboundedReceiver<Command>,
        command_tx: mpsc::UnboundedSender<Command>,
        incoming: Option<mpsc::UnboundedSender<(String, Channel)>>,
        defaults: ChannelDefaults,
    ) -> Self {
        Self {
            role,
            reader,
            writer,
            tracker,
            kex,
            status,
            commands,
            command_tx,
            channels: HashMap::new(),
            next_id: 0,
            outbox: Vec::new(),
            incoming,
            defaults,
        }
    }

    /// Runs until the session ends, then fails everything still pending.
    pub(crate) async fn run(mut self) {
        match self.serve().await {
            Ok(()) => self.teardown(None).await,
            Err(e) => {
                if matches!(e, FerryError::SessionClosed) {
                    info!(role = self.role.as_str(), "Session closed by peer");
                } else {
                    logging::log_session_failed(self.role.as_str(), &e.to_string());
                }
                self.teardown(Some(&e)).await;
            }
        }
    }

    async fn serve(&mut self) -> FerryResult<()> {
        loop {
            self.flush().await?;

            let tracker = Arc::clone(&self.tracker);
            tokio::select! {
                payload = self.reader.read_payload() => {
                    let payload = payload?;
                    if message_number(&payload)? == MessageType::KexInit as u8 {
                        self.rekey(Some(payload)).await?;
                    } else {
                        self.route(payload)?;
                    }
                }
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command).await? {
                            return Ok(());
                        }
                    }
                    None => return Ok(()),
                },
                _ = tracker.due() => {
                    debug!(bytes = tracker.bytes(), "Rekey limit reached");
                    self.rekey(None).await?;
                }
            }
        }
    }

    async fn flush(&mut self) -> FerryResult<()> {
        if self.outbox.is_empty() {
            return Ok(());
        }
        let mut writer = self.writer.lock().await;
        for payload in self.outbox.drain(..) {
            writer.write_payload(&payload).await?;
        }
        Ok(())
    }

    /// Returns false when the dispatcher should stop.
    async fn handle_command(&mut self, command: Command) -> FerryResult<bool> {
        match command {
            Command::Open {
                kind,
                window,
                max_packet,
                reply,
            } => {
                let id = self.allocate_id();
                debug!(channel = id, kind = kind.name(), "Opening channel");
                self.outbox
                    .push(ChannelOpen::new(kind.clone(), id, window, max_packet).to_bytes());
                self.channels.insert(
                    id,
                    Slot::Opening {
                        kind: kind.name().to_string(),
                        window,
                        reply,
                    },
                );
            }
            Command::Dropped(id) => {
                if let Some(Slot::Open(open)) = self.channels.get(&id) {
                    if open.shared.claim_close() {
                        logging::log_channel_closed(id, "dropped");
                        self.outbox
                            .push(ChannelClose::new(open.shared.remote_id).to_bytes());
                    }
                }
            }
            Command::Rekey(reply) => match self.rekey(None).await {
                Ok(()) => {
                    let _ = reply.send(Ok(()));
                }
                Err(e) => {
                    let _ = reply.send(Err(FerryError::SessionClosed));
                    return Err(e);
                }
            },
            Command::Disconnect {
                reason,
                description,
                done,
            } => {
                logging::log_disconnect("sent", reason as u32, &description);
                self.outbox
                    .push(Disconnect::new(reason, &description).to_bytes());
                let flushed = self.flush().await;
                if let Some(done) = done {
                    let _ = done.send(());
                }
                flushed?;
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn allocate_id(&mut self) -> u32 {
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if !self.channels.contains_key(&id) {
                return id;
            }
        }
    }

    /// Runs a key exchange over the authenticated transport.
    async fn rekey(&mut self, mut peer_kexinit: Option<Vec<u8>>) -> FerryResult<()> {
        self.status.transition(TransportState::Rekeying)?;
        logging::log_rekey_start(
            self.role.as_str(),
            if peer_kexinit.is_some() { "peer" } else { "local" },
            self.tracker.bytes(),
        );
        self.flush().await?;

        // Keep routing while a channel writer finishes its packet.
        let lock = Arc::clone(&self.writer).lock_owned();
        tokio::pin!(lock);
        let mut writer = if peer_kexinit.is_some() {
            lock.await
        } else {
            loop {
                tokio::select! {
                    guard = &mut lock => break guard,
                    payload = self.reader.read_payload() => {
                        let payload = payload?;
                        if message_number(&payload)? == MessageType::KexInit as u8 {
                            peer_kexinit = Some(payload);
                            break (&mut lock).await;
                        }
                        self.route(payload)?;
                    }
                }
            }
        };

        let (mut kex, kexinit) = KeyExchange::start(self.kex.clone());
        writer.write_payload(&kexinit).await?;

        if let Some(payload) = peer_kexinit {
            let actions = kex.handle(&payload)?;
            apply_kex_actions(actions, &mut self.reader, &mut writer).await?;
        }

        while !kex.is_done() {
            let payload = self.reader.read_payload().await?;
            match MessageType::from_u8(message_number(&payload)?) {
                Some(
                    MessageType::KexInit
                    | MessageType::NewKeys
                    | MessageType::KexEcdhInit
                    | MessageType::KexEcdhReply,
                ) => {
                    let actions = kex.handle(&payload)?;
                    apply_kex_actions(actions, &mut self.reader, &mut writer).await?;
                }
                _ => self.route(payload)?,
            }
        }
        drop(writer);

        let outcome = kex.into_outcome()?;
        self.kex.complete(&outcome);
        self.tracker.reset();
        self.status.rekeys.fetch_add(1, Ordering::Relaxed);
        logging::log_kex_complete(self.role.as_str(), &outcome.suite, true);
        self.status.transition(TransportState::Authenticated)?;
        self.flush().await
    }

    /// Routes one non-KEXINIT message.
    fn route(&mut self, payload: Vec<u8>) -> FerryResult<()> {
        let msg = message_number(&payload)?;
        match MessageType::from_u8(msg) {
            Some(MessageType::Ignore | MessageType::Debug) => Ok(()),
            Some(MessageType::Unimplemented) => {
                debug!("Peer sent UNIMPLEMENTED");
                Ok(())
            }
            Some(MessageType::Disconnect) => {
                match Disconnect::from_bytes(&payload) {
                    Ok(d) => logging::log_disconnect("received", d.reason_code, &d.description),
                    Err(e) => debug!(error = %e, "Malformed DISCONNECT"),
                }
                Err(FerryError::SessionClosed)
            }
            Some(MessageType::GlobalRequest) => {
                let request = GlobalRequest::from_bytes(&payload)?;
                debug!(name = %request.name, "Refusing global request");
                if request.want_reply {
                    self.outbox.push(request_failure());
                }
                Ok(())
            }
            Some(MessageType::RequestSuccess | MessageType::RequestFailure) => {
                debug!("Ignoring global request reply");
                Ok(())
            }
            Some(MessageType::ChannelOpen) => self.on_channel_open(&payload),
            Some(MessageType::ChannelOpenConfirmation) => self.on_open_confirmation(&payload),
            Some(MessageType::ChannelOpenFailure) => self.on_open_failure(&payload),
            Some(MessageType::ChannelWindowAdjust) => {
                let adjust = ChannelWindowAdjust::from_bytes(&payload)?;
                let id = adjust.recipient_channel();
                if let Some(open) = self.open_slot(id) {
                    logging::log_window_adjust(id, "received", adjust.bytes_to_add());
                    open.shared.on_window_adjust(adjust.bytes_to_add());
                }
                Ok(())
            }
            Some(MessageType::ChannelData) => {
                let data = ChannelData::from_bytes(&payload)?;
                let id = data.recipient_channel();
                if let Some(open) = self.open_slot(id) {
                    open.shared.on_data(data.data().len() as u32)?;
                    // A dropped handle discards the data.
                    let _ = open.inbound.send(Inbound::Data(data.into_data()));
                }
                Ok(())
            }
            Some(MessageType::ChannelExtendedData) => {
                let data = ChannelExtendedData::from_bytes(&payload)?;
                let id = data.recipient_channel();
                if let Some(open) = self.open_slot(id) {
                    let len = data.data().len() as u32;
                    open.shared.on_data(len)?;
                    debug!(channel = id, len, "Discarding extended data");
                    if let Some(bytes) = open.shared.record_discarded(len) {
                        let remote = open.shared.remote_id;
                        self.outbox
                            .push(ChannelWindowAdjust::new(remote, bytes).to_bytes());
                    }
                }
                Ok(())
            }
            Some(MessageType::ChannelEof) => {
                let id = ChannelEof::from_bytes(&payload)?.recipient_channel();
                if let Some(open) = self.open_slot(id) {
                    let _ = open.inbound.send(Inbound::Eof);
                }
                Ok(())
            }
            Some(MessageType::ChannelClose) => {
                let id = ChannelClose::from_bytes(&payload)?.recipient_channel();
                self.on_peer_close(id);
                Ok(())
            }
            Some(MessageType::ChannelRequest) => self.on_channel_request(&payload),
            Some(MessageType::ChannelSuccess) => {
                let id = ChannelSuccess::from_bytes(&payload)?.recipient_channel();
                if let Some(open) = self.open_slot(id) {
                    open.shared.on_request_reply(true);
                }
                Ok(())
            }
            Some(MessageType::ChannelFailure) => {
                let id = ChannelFailure::from_bytes(&payload)?.recipient_channel();
                if let Some(open) = self.open_slot(id) {
                    open.shared.on_request_reply(false);
                }
                Ok(())
            }
            Some(other) => Err(FerryError::Protocol(format!(
                "Unexpected {} after authentication",
                other
            ))),
            None => {
                debug!(msg, "Unknown message type");
                self.outbox
                    .push(unimplemented_message(self.reader.sequence().wrapping_sub(1)));
                Ok(())
            }
        }
    }

    fn open_slot(&self, id: u32) -> Option<&OpenSlot> {
        match self.channels.get(&id) {
            Some(Slot::Open(open)) => Some(open),
            Some(Slot::Opening { .. }) => {
                warn!(channel = id, "Message for a channel that is still opening");
                None
            }
            None => {
                warn!(channel = id, "Message for unknown channel");
                None
            }
        }
    }

    fn new_channel(&self, shared: &Arc<ChannelShared>) -> (Channel, mpsc::UnboundedSender<Inbound>) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let channel = Channel::new(
            Arc::clone(shared),
            inbound_rx,
            Arc::clone(&self.writer),
            self.command_tx.clone(),
            self.defaults.timeouts,
        );
        (channel, inbound_tx)
    }

    fn on_channel_open(&mut self, payload: &[u8]) -> FerryResult<()> {
        let open = ChannelOpen::from_bytes(payload)?;

        let refusal = match (open.channel_type(), &self.incoming) {
            (ChannelType::Session, Some(_)) => None,
            (ChannelType::Session, None) => Some(ChannelOpenFailureReason::AdministrativelyProhibited),
            (ChannelType::Other(_), _) => Some(ChannelOpenFailureReason::UnknownChannelType),
        };
        if let Some(reason) = refusal {
            debug!(kind = open.channel_type().name(), reason = reason.as_str(), "Refusing channel open");
            self.outbox
                .push(ChannelOpenFailure::new(open.sender_channel(), reason).to_bytes());
            return Ok(());
        }

        let id = self.allocate_id();
        let shared = Arc::new(ChannelShared::new(
            id,
            open.sender_channel(),
            self.defaults.window,
            open.initial_window_size(),
            open.maximum_packet_size(),
        ));
        let (channel, inbound) = self.new_channel(&shared);

        self.outbox.push(
            ChannelOpenConfirmation::new(
                open.sender_channel(),
                id,
                self.defaults.window,
                self.defaults.max_packet,
            )
            .to_bytes(),
        );
        logging::log_channel_opened(
            id,
            open.sender_channel(),
            open.channel_type().name(),
            open.initial_window_size(),
            open.maximum_packet_size(),
        );
        self.channels.insert(
            id,
            Slot::Open(OpenSlot {
                shared,
                inbound,
                undelivered: Some(channel),
            }),
        );
        Ok(())
    }

    fn on_open_confirmation(&mut self, payload: &[u8]) -> FerryResult<()> {
        let confirmation = ChannelOpenConfirmation::from_bytes(payload)?;
        let id = confirmation.recipient_channel();

        let (kind, window, reply) = match self.channels.remove(&id) {
            Some(Slot::Opening {
                kind,
                window,
                reply,
            }) => (kind, window, reply),
            Some(slot) => {
                self.channels.insert(id, slot);
                return Err(FerryError::Protocol(format!(
                    "Open confirmation for channel {} which is already open",
                    id
                )));
            }
            None => {
                return Err(FerryError::Protocol(format!(
                    "Open confirmation for unknown channel {}",
                    id
                )))
            }
        };

        let shared = Arc::new(ChannelShared::new(
            id,
            confirmation.sender_channel(),
            window,
            confirmation.initial_window_size(),
            confirmation.maximum_packet_size(),
        ));
        let (channel, inbound) = self.new_channel(&shared);
        logging::log_channel_opened(
            id,
            confirmation.sender_channel(),
            &kind,
            confirmation.initial_window_size(),
            confirmation.maximum_packet_size(),
        );
        self.channels.insert(
            id,
            Slot::Open(OpenSlot {
                shared,
                inbound,
                undelivered: None,
            }),
        );

        if let Err(Ok(channel)) = reply.send(Ok(channel)) {
            // The opener timed out; dropping the handle closes the channel.
            debug!(channel = id, "Open confirmed after the opener gave up");
            drop(channel);
        }
        Ok(())
    }

    fn on_open_failure(&mut self, payload: &[u8]) -> FerryResult<()> {
        let failure = ChannelOpenFailure::from_bytes(payload)?;
        let id = failure.recipient_channel();

        match self.channels.remove(&id) {
            Some(Slot::Opening { reply, kind, .. }) => {
                debug!(
                    channel = id,
                    kind = %kind,
                    reason = failure.reason_code(),
                    description = failure.description(),
                    "Channel open refused"
                );
                let _ = reply.send(Err(failure.into_error()));
                Ok(())
            }
            Some(slot) => {
                self.channels.insert(id, slot);
                Err(FerryError::Protocol(format!(
                    "Open failure for channel {} which is already open",
                    id
                )))
            }
            None => Err(FerryError::Protocol(format!(
                "Open failure for unknown channel {}",
                id
            ))),
        }
    }

    fn on_peer_close(&mut self, id: u32) {
        let Some(Slot::Open(open)) = self.channels.get(&id) else {
            warn!(channel = id, "CLOSE for unknown channel");
            return;
        };

        let both_closed = open.shared.on_peer_close();
        if !both_closed {
            if open.shared.claim_close() {
                self.outbox
                    .push(ChannelClose::new(open.shared.remote_id).to_bytes());
            }
            open.shared.mark_closed();
        }
        let _ = open.inbound.send(Inbound::Close);
        logging::log_channel_closed(id, "peer");
        self.channels.remove(&id);
    }

    fn on_channel_request(&mut self, payload: &[u8]) -> FerryResult<()> {
        let request = ChannelRequest::from_bytes(payload)?;
        let id = request.recipient_channel();

        let Some(Slot::Open(open)) = self.channels.get_mut(&id) else {
            warn!(channel = id, "Request for unknown channel");
            return Ok(());
        };
        let remote = open.shared.remote_id;

        let accepted = match request.request_type() {
            ChannelRequestType::Subsystem { name }
                if !self.defaults.subsystems.iter().any(|s| s == name) =>
            {
                debug!(channel = id, subsystem = %name, "Refusing unknown subsystem");
                false
            }
            ChannelRequestType::Subsystem { name } => match (open.undelivered.take(), &self.incoming) {
                (Some(channel), Some(incoming)) => match incoming.send((name.clone(), channel)) {
                    Ok(()) => {
                        info!(channel = id, subsystem = %name, "Subsystem requested");
                        true
                    }
                    Err(_) => false,
                },
                (channel, _) => {
                    open.undelivered = channel;
                    false
                }
            },
            other => {
                debug!(channel = id, request = other.name(), "Refusing channel request");
                false
            }
        };

        if request.want_reply() {
            let reply = if accepted {
                ChannelSuccess::new(remote).to_bytes()
            } else {
                ChannelFailure::new(remote).to_bytes()
            };
            self.outbox.push(reply);
        }
        Ok(())
    }

    async fn teardown(&mut self, err: Option<&FerryError>) {
        self.status.close();

        for (id, slot) in self.channels.drain() {
            match slot {
                Slot::Opening { reply, .. } => {
                    let _ = reply.send(Err(FerryError::SessionClosed));
                }
                Slot::Open(open) => {
                    open.shared.tear_down();
                    logging::log_channel_closed(id, "teardown");
                }
            }
        }
        self.incoming = None;

        let disconnect = match err {
            Some(FerryError::SessionClosed | FerryError::Io(_)) | None => None,
            Some(e) => Some(Disconnect::new(DisconnectReason::for_error(e), &e.to_string())),
        };

        match tokio::time::timeout(TEARDOWN_WRITE_TIMEOUT, self.writer.lock()).await {
            Ok(mut writer) => {
                if let Some(msg) = disconnect {
                    logging::log_disconnect("sent", msg.reason_code, &msg.description);
                    if let Err(e) = writer.write_payload(&msg.to_bytes()).await {
                        logging::log_teardown_failure("send disconnect", &e.to_string());
                    }
                }
                if let Err(e) = writer.shutdown().await {
                    logging::log_teardown_failure("shutdown stream", &e.to_string());
                }
            }
            Err(_) => logging::log_teardown_failure("lock writer", "timed out"),
        }
        debug!(role = self.role.as_str(), "Dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::connection::recipient_channel;
    use crate::ssh::hostkey::{Ed25519KeyPair, KeyPair};
    use crate::ssh::kex::AlgorithmPreferences;
    use crate::ssh::packet::{PacketWriter, BoxedReader, BoxedWriter};
    use crate::ssh::transport::{KexKeys, RekeyPolicy};
    use tokio::sync::Mutex;

    /// Recipient IDs in a batch of payloads.
    fn recipients(payloads: &[Vec<u8>]) -> Vec<u32> {
        payloads
            .iter()
            .filter_map(|p| recipient_channel(p).ok())
            .collect()
    }

    fn dispatcher(role: Role, incoming: Option<mpsc::UnboundedSender<(String, Channel)>>) -> Dispatcher {
        let (read_half, _peer_write) = tokio::io::duplex(1024);
        let (_peer_read, write_half) = tokio::io::duplex(1024);
        let reader: BoxedReader = Box::new(read_half);
        let writer: BoxedWriter = Box::new(write_half);
        let (command_tx, commands) = mpsc::unbounded_channel();

        let host_key: Arc<dyn KeyPair> = Arc::new(Ed25519KeyPair::generate());
        Dispatcher::new(
            role,
            PacketReader::new(reader),
            Arc::new(Mutex::new(PacketWriter::new(writer))),
            Arc::new(RekeyTracker::new(RekeyPolicy::default())),
            KexContext {
                keys: KexKeys::Server(host_key),
                preferences: AlgorithmPreferences::default(),
                client_version: "SSH-2.0-c".to_string(),
                server_version: "SSH-2.0-s".to_string(),
                session_id: Some(vec![1; 32]),
                host_key: None,
            },
            Arc::new(SessionStatus::new(role, TransportState::Authenticated)),
            commands,
            command_tx,
            incoming,
            ChannelDefaults {
                timeouts: ChannelTimeouts {
                    window: Duration::from_secs(1),
                    request: Duration::from_secs(1),
                },
                window: 1000,
                max_packet: 32768,
                subsystems: vec!["sftp".to_string()],
            },
        )
    }

    fn open_session(sender: u32) -> Vec<u8> {
        ChannelOpen::new(ChannelType::Session, sender, 4096, 32768).to_bytes()
    }

    #[tokio::test]
    async fn test_unknown_channel_type_refused() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut d = dispatcher(Role::Server, Some(tx));
        d.route(ChannelOpen::new(ChannelType::Other("x11".to_string()), 5, 4096, 32768).to_bytes())
            .unwrap();

        let failure = ChannelOpenFailure::from_bytes(&d.outbox[0]).unwrap();
        assert_eq!(failure.recipient_channel(), 5);
        assert_eq!(failure.reason_code(), ChannelOpenFailureReason::UnknownChannelType as u32);
        assert!(d.channels.is_empty());
    }

    #[tokio::test]
    async fn test_client_refuses_session_open() {
        let mut d = dispatcher(Role::Client, None);
        d.route(open_session(5)).unwrap();
        let failure = ChannelOpenFailure::from_bytes(&d.outbox[0]).unwrap();
        assert_eq!(
            failure.reason_code(),
            ChannelOpenFailureReason::AdministrativelyProhibited as u32
        );
    }

    #[tokio::test]
    async fn test_subsystem_request_delivers_channel() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut d = dispatcher(Role::Server, Some(tx));
        d.route(open_session(5)).unwrap();
        let confirmation = ChannelOpenConfirmation::from_bytes(&d.outbox[0]).unwrap();
        let local = confirmation.sender_channel();

        let request = ChannelRequest::new(
            local,
            ChannelRequestType::Subsystem { name: "sftp".to_string() },
            true,
        );
        d.route(request.to_bytes()).unwrap();

        let (name, channel) = rx.recv().await.unwrap();
        assert_eq!(name, "sftp");
        assert_eq!(channel.remote_id(), 5);
        assert_eq!(d.outbox[1], ChannelSuccess::new(5).to_bytes());

        // A second subsystem on the same channel is refused.
        d.route(request.to_bytes()).unwrap();
        assert_eq!(d.outbox[2], ChannelFailure::new(5).to_bytes());
    }

    #[tokio::test]
    async fn test_unknown_subsystem_refused() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut d = dispatcher(Role::Server, Some(tx));
        d.route(open_session(5)).unwrap();
        let local = ChannelOpenConfirmation::from_bytes(&d.outbox[0]).unwrap().sender_channel();

        let request = ChannelRequest::new(
            local,
            ChannelRequestType::Subsystem { name: "netconf".to_string() },
            true,
        );
        d.route(request.to_bytes()).unwrap();
        assert_eq!(d.outbox[1], ChannelFailure::new(5).to_bytes());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_window_overflow_is_fatal() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut d = dispatcher(Role::Server, Some(tx));
        d.route(open_session(5)).unwrap();
        let local = ChannelOpenConfirmation::from_bytes(&d.outbox[0]).unwrap().sender_channel();

        d.route(ChannelData::encode(local, &[0; 600])).unwrap();
        let result = d.route(ChannelData::encode(local, &[0; 600]));
        assert!(matches!(result, Err(FerryError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_peer_close_is_answered_and_released() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut d = dispatcher(Role::Server, Some(tx));
        d.route(open_session(5)).unwrap();
        let local = ChannelOpenConfirmation::from_bytes(&d.outbox[0]).unwrap().sender_channel();

        d.route(ChannelClose::new(local).to_bytes()).unwrap();
        assert_eq!(d.outbox[1], ChannelClose::new(5).to_bytes());
        assert!(d.channels.is_empty());
        assert_eq!(recipients(&d.outbox), vec![5, 5]);
    }

    #[tokio::test]
    async fn test_open_failure_reaches_opener() {
        let mut d = dispatcher(Role::Client, None);
        let (reply, rx) = oneshot::channel();
        d.handle_command(Command::Open {
            kind: ChannelType::Session,
            window: 1000,
            max_packet: 32768,
            reply,
        })
        .await
        .unwrap();
        let id = ChannelOpen::from_bytes(&d.outbox[0]).unwrap().sender_channel();

        d.route(
            ChannelOpenFailure::with_description(
                id,
                ChannelOpenFailureReason::ResourceShortage,
                "busy",
            )
            .to_bytes(),
        )
        .unwrap();
        match rx.await.unwrap() {
            Err(FerryError::ChannelOpenFailed { reason, description }) => {
                assert_eq!(reason, 4);
                assert_eq!(description, "busy");
            }
            other => panic!("unexpected {:?}", other.map(|c| c.local_id())),
        }
    }

    #[tokio::test]
    async fn test_late_confirmation_closes_channel() {
        let mut d = dispatcher(Role::Client, None);
        let (reply, rx) = oneshot::channel();
        d.handle_command(Command::Open {
            kind: ChannelType::Session,
            window: 1000,
            max_packet: 32768,
            reply,
        })
        .await
        .unwrap();
        let id = ChannelOpen::from_bytes(&d.outbox[0]).unwrap().sender_channel();
        drop(rx);

        d.route(ChannelOpenConfirmation::new(id, 9, 4096, 32768).to_bytes())
            .unwrap();
        let command = d.commands.recv().await.unwrap();
        assert!(matches!(command, Command::Dropped(dropped) if dropped == id));
        d.handle_command(command).await.unwrap();
        assert_eq!(d.outbox.last(), Some(&ChannelClose::new(9).to_bytes()));
    }

    #[tokio::test]
    async fn test_global_request_refused() {
        let mut d = dispatcher(Role::Client, None);
        let request = GlobalRequest {
            name: "keepalive@openssh.com".to_string(),
            want_reply: true,
            data: Vec::new(),
        };
        d.route(request.to_bytes()).unwrap();
        assert_eq!(d.outbox, vec![request_failure()]);
    }

    #[tokio::test]
    async fn test_teardown_fails_pending_open() {
        let mut d = dispatcher(Role::Client, None);
        let (reply, rx) = oneshot::channel();
        d.handle_command(Command::Open {
            kind: ChannelType::Session,
            window: 1000,
            max_packet: 32768,
            reply,
        })
        .await
        .unwrap();

        d.teardown(None).await;
        assert!(matches!(rx.await.unwrap(), Err(FerryError::SessionClosed)));
        assert_eq!(d.status.state(), TransportState::Closed);
    }
}
