//! Authenticated SSH sessions.
//!
//! An [`SshSession`] is what remains of a [`Transport`](crate::ssh::transport::Transport)
//! after authentication: a dispatcher task that owns the reader, a shared
//! writer, and an optional keep-alive. Channels are opened through the
//! session and run concurrently over it.

pub mod keepalive;

pub use keepalive::{keepalive_message, KeepaliveTask};

use crate::ssh::channel::{Channel, ChannelTimeouts};
use crate::ssh::connection::{
    ChannelType, DEFAULT_MAX_PACKET_SIZE, DEFAULT_WINDOW_SIZE, MAX_CHANNEL_PACKET_SIZE,
    MAX_WINDOW_SIZE,
};
use crate::ssh::dispatcher::{ChannelDefaults, Command, Dispatcher, SessionStatus};
use crate::ssh::kex::AlgorithmSuite;
use crate::ssh::message::DisconnectReason;
use crate::ssh::transport::{Role, SessionIdentity, TransportParts, TransportState};
use crate::ssh::version::Version;
use ferry_platform::{FerryError, FerryResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// How long `close` waits for the DISCONNECT to be written.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Per-session options applied once authentication completes.
#[derive(Debug, Clone)]
pub(crate) struct SessionOptions {
    pub(crate) open_timeout: Duration,
    pub(crate) timeouts: ChannelTimeouts,
    pub(crate) keepalive: Option<Duration>,
    /// Subsystems accepted on incoming `session` channels; empty refuses
    /// every incoming channel.
    pub(crate) subsystems: Vec<String>,
}

/// An authenticated SSH connection.
///
/// Dropping the session sends DISCONNECT and stops the dispatcher.
pub struct SshSession {
    role: Role,
    identity: SessionIdentity,
    suite: AlgorithmSuite,
    peer_version: Version,
    status: Arc<SessionStatus>,
    commands: mpsc::UnboundedSender<Command>,
    incoming: Mutex<mpsc::UnboundedReceiver<(String, Channel)>>,
    open_timeout: Duration,
    keepalive: Option<KeepaliveTask>,
    dispatcher: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for SshSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshSession")
            .field("role", &self.role)
            .field("state", &self.state())
            .field("peer_version", &self.peer_version.to_string())
            .finish()
    }
}

impl SshSession {
    /// Spawns the dispatcher over an authenticated transport.
    pub(crate) fn start(parts: TransportParts, options: SessionOptions) -> Self {
        let TransportParts {
            role,
            reader,
            writer,
            rekey,
            kex,
            identity,
            suite,
            peer_version,
        } = parts;

        let writer = Arc::new(Mutex::new(writer));
        let status = Arc::new(SessionStatus::new(role, TransportState::Authenticated));
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();

        let dispatcher = Dispatcher::new(
            role,
            reader,
            Arc::clone(&writer),
            rekey,
            kex,
            Arc::clone(&status),
            command_rx,
            command_tx.clone(),
            (!options.subsystems.is_empty()).then_some(incoming_tx),
            ChannelDefaults {
                timeouts: options.timeouts,
                window: DEFAULT_WINDOW_SIZE,
                max_packet: DEFAULT_MAX_PACKET_SIZE,
                subsystems: options.subsystems,
            },
        );
        let dispatcher = tokio::spawn(dispatcher.run());

        let keepalive = options.keepalive.map(|interval| {
            let mut task = KeepaliveTask::new(interval);
            task.start(Arc::clone(&writer));
            task
        });

        info!(role = role.as_str(), suite = %suite, "Session established");

        Self {
            role,
            identity,
            suite,
            peer_version,
            status,
            commands: command_tx,
            incoming: Mutex::new(incoming_rx),
            open_timeout: options.open_timeout,
            keepalive,
            dispatcher: Some(dispatcher),
        }
    }

    /// Returns the role of this end.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Returns the transport state.
    pub fn state(&self) -> TransportState {
        self.status.state()
    }

    /// Whether the session has ended.
    pub fn is_closed(&self) -> bool {
        self.state() == TransportState::Closed
    }

    /// Exchange hash of the first key exchange.
    pub fn session_id(&self) -> &[u8] {
        &self.identity.session_id
    }

    /// Version strings and session identifier.
    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    /// Algorithms negotiated by the first key exchange.
    pub fn suite(&self) -> &AlgorithmSuite {
        &self.suite
    }

    /// The peer's identification string.
    pub fn peer_version(&self) -> &Version {
        &self.peer_version
    }

    /// Number of completed rekeys.
    pub fn rekey_count(&self) -> u64 {
        self.status.rekeys()
    }

    fn command(&self, command: Command) -> FerryResult<()> {
        self.commands
            .send(command)
            .map_err(|_| FerryError::SessionClosed)
    }

    /// Opens a `session` channel with default window and packet sizes.
    pub async fn open_session_channel(&self) -> FerryResult<Channel> {
        self.open_channel(ChannelType::Session, DEFAULT_WINDOW_SIZE, DEFAULT_MAX_PACKET_SIZE)
            .await
    }

    /// Opens a channel and waits for the peer's answer.
    ///
    /// # Errors
    ///
    /// - [`FerryError::ChannelOpenFailed`] if the peer refuses
    /// - [`FerryError::Timeout`] if no answer arrives within the open timeout
    /// - [`FerryError::Config`] for a window or packet size out of range
    pub async fn open_channel(
        &self,
        kind: ChannelType,
        window: u32,
        max_packet: u32,
    ) -> FerryResult<Channel> {
        if window == 0 || window > MAX_WINDOW_SIZE {
            return Err(FerryError::Config(format!(
                "Channel window must be between 1 and {} bytes",
                MAX_WINDOW_SIZE
            )));
        }
        if max_packet == 0 || max_packet > MAX_CHANNEL_PACKET_SIZE {
            return Err(FerryError::Config(format!(
                "Channel packet size must be between 1 and {} bytes",
                MAX_CHANNEL_PACKET_SIZE
            )));
        }

        let (reply, answer) = oneshot::channel();
        self.command(Command::Open {
            kind: kind.clone(),
            window,
            max_packet,
            reply,
        })?;

        match tokio::time::timeout(self.open_timeout, answer).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(FerryError::SessionClosed),
            Err(_) => Err(FerryError::Timeout(format!("{} channel open", kind.name()))),
        }
    }

    /// Waits for the peer to request a subsystem on an accepted channel.
    ///
    /// Fails with `SessionClosed` when the session ends, and at once on
    /// sessions that accept no subsystems (every client session).
    pub async fn accept_subsystem(&self) -> FerryResult<(String, Channel)> {
        self.incoming
            .lock()
            .await
            .recv()
            .await
            .ok_or(FerryError::SessionClosed)
    }

    /// Runs a key exchange now.
    ///
    /// Channels stay open; their writes wait until the new keys are in use.
    pub async fn rekey(&self) -> FerryResult<()> {
        let (reply, done) = oneshot::channel();
        self.command(Command::Rekey(reply))?;
        done.await.map_err(|_| FerryError::SessionClosed)?
    }

    /// Sends DISCONNECT with `reason` and closes the session.
    pub async fn disconnect(&mut self, reason: DisconnectReason, description: &str) -> FerryResult<()> {
        if let Some(mut task) = self.keepalive.take() {
            task.stop();
        }
        let (done_tx, done_rx) = oneshot::channel();
        self.command(Command::Disconnect {
            reason,
            description: description.to_string(),
            done: Some(done_tx),
        })?;
        let _ = done_rx.await;
        self.join_dispatcher().await;
        Ok(())
    }

    /// Closes the session.
    ///
    /// Idempotent. Failures on the way down are logged, not returned.
    pub async fn close(&mut self) {
        if self.dispatcher.is_none() {
            return;
        }
        debug!(role = self.role.as_str(), "Closing session");
        let disconnect = self.disconnect(DisconnectReason::ByApplication, "closed by application");
        match tokio::time::timeout(CLOSE_TIMEOUT, disconnect).await {
            Ok(_) => {}
            Err(_) => crate::ssh::logging::log_teardown_failure("disconnect", "timed out"),
        }
        if let Some(handle) = self.dispatcher.take() {
            handle.abort();
        }
    }

    async fn join_dispatcher(&mut self) {
        if let Some(handle) = self.dispatcher.take() {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    crate::ssh::logging::log_teardown_failure("join dispatcher", &e.to_string());
                }
            }
        }
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        if self.dispatcher.is_some() {
            let _ = self.commands.send(Command::Disconnect {
                reason: DisconnectReason::ByApplication,
                description: "session dropped".to_string(),
                done: None,
            });
        }
    }
}
