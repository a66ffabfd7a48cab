//! SSH channels (RFC 4254).
//!
//! A [`Channel`] is one logical stream multiplexed over the session. Inbound
//! messages reach it through an unbounded queue fed by the dispatcher;
//! outbound data goes straight through the session's shared packet writer.
//!
//! # Flow control
//!
//! Each direction has a [`ChannelWindow`]. `send` never writes more than the
//! peer's remaining credit and waits for WINDOW_ADJUST when it runs out.
//! Received bytes are credited back once half of the local window has been
//! consumed.

use crate::ssh::connection::{
    ChannelClose, ChannelData, ChannelEof, ChannelRequest, ChannelRequestType,
    ChannelWindowAdjust, MAX_CHANNEL_PACKET_SIZE,
};
use crate::ssh::dispatcher::Command;
use crate::ssh::logging;
use crate::ssh::packet::PacketWriter;
use ferry_platform::{FerryError, FerryResult};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tracing::debug;

/// The single outbound write path of a session.
pub(crate) type SharedWriter = Arc<Mutex<PacketWriter>>;

/// SSH channel state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Open requested, no confirmation yet
    Opening,
    /// Open in both directions
    Open,
    /// One side sent CLOSE
    Closing,
    /// Both sides closed, or the session is gone
    Closed,
}

/// One direction's flow-control window.
///
/// ```rust
/// use ferry_proto::ssh::channel::ChannelWindow;
///
/// let mut window = ChannelWindow::new(100);
/// assert_eq!(window.consume_up_to(150), 100);
/// assert_eq!(window.consume_up_to(1), 0);
/// window.credit(10);
/// assert_eq!(window.available(), 10);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelWindow {
    available: u32,
    initial: u32,
    unacknowledged: u32,
}

impl ChannelWindow {
    /// Creates a window with `initial` bytes of credit.
    pub fn new(initial: u32) -> Self {
        Self {
            available: initial,
            initial,
            unacknowledged: 0,
        }
    }

    /// Remaining credit.
    pub fn available(&self) -> u32 {
        self.available
    }

    /// Size the window was opened with.
    pub fn initial(&self) -> u32 {
        self.initial
    }

    /// Takes up to `want` bytes of credit and returns how many were taken.
    pub fn consume_up_to(&mut self, want: u32) -> u32 {
        let n = want.min(self.available);
        self.available -= n;
        n
    }

    /// Takes exactly `n` bytes of credit.
    ///
    /// # Errors
    ///
    /// [`FerryError::Protocol`] if `n` exceeds the remaining credit.
    pub fn consume(&mut self, n: u32) -> FerryResult<()> {
        if n > self.available {
            return Err(FerryError::Protocol(format!(
                "Peer sent {} bytes with {} bytes of window left",
                n, self.available
            )));
        }
        self.available -= n;
        Ok(())
    }

    /// Adds credit from a WINDOW_ADJUST, saturating at `u32::MAX`.
    pub fn credit(&mut self, n: u32) {
        self.available = self.available.saturating_add(n);
    }

    /// Records `n` bytes handed to the application.
    ///
    /// Returns the amount to send in a WINDOW_ADJUST once half of the initial
    /// window is waiting to be acknowledged.
    pub fn record_consumed(&mut self, n: u32) -> Option<u32> {
        self.unacknowledged = self.unacknowledged.saturating_add(n);
        if self.unacknowledged == 0 || self.unacknowledged < self.initial / 2 {
            return None;
        }
        let adjust = std::mem::take(&mut self.unacknowledged);
        self.credit(adjust);
        Some(adjust)
    }
}

/// Inbound channel event delivered by the dispatcher.
#[derive(Debug)]
pub(crate) enum Inbound {
    Data(Vec<u8>),
    Eof,
    Close,
}

/// Timeouts a channel applies to its own waits.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ChannelTimeouts {
    pub(crate) window: Duration,
    pub(crate) request: Duration,
}

/// State shared between a [`Channel`] and the dispatcher.
#[derive(Debug)]
pub(crate) struct ChannelShared {
    pub(crate) local_id: u32,
    pub(crate) remote_id: u32,
    pub(crate) remote_max_packet: u32,
    state: parking_lot::Mutex<ChannelState>,
    remote_window: parking_lot::Mutex<ChannelWindow>,
    local_window: parking_lot::Mutex<ChannelWindow>,
    window_changed: Notify,
    close_sent: AtomicBool,
    eof_sent: AtomicBool,
    torn_down: AtomicBool,
    requests: parking_lot::Mutex<VecDeque<oneshot::Sender<bool>>>,
}

impl ChannelShared {
    pub(crate) fn new(
        local_id: u32,
        remote_id: u32,
        local_window: u32,
        remote_window: u32,
        remote_max_packet: u32,
    ) -> Self {
        Self {
            local_id,
            remote_id,
            remote_max_packet,
            state: parking_lot::Mutex::new(ChannelState::Open),
            remote_window: parking_lot::Mutex::new(ChannelWindow::new(remote_window)),
            local_window: parking_lot::Mutex::new(ChannelWindow::new(local_window)),
            window_changed: Notify::new(),
            close_sent: AtomicBool::new(false),
            eof_sent: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
            requests: parking_lot::Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    pub(crate) fn close_sent(&self) -> bool {
        self.close_sent.load(Ordering::Acquire)
    }

    /// Claims the right to send CLOSE; true for exactly one caller.
    pub(crate) fn claim_close(&self) -> bool {
        let first = !self.close_sent.swap(true, Ordering::AcqRel);
        if first {
            let mut state = self.state.lock();
            if *state == ChannelState::Open {
                *state = ChannelState::Closing;
            }
        }
        first
    }

    /// Peer WINDOW_ADJUST.
    pub(crate) fn on_window_adjust(&self, bytes: u32) {
        self.remote_window.lock().credit(bytes);
        self.window_changed.notify_waiters();
    }

    /// Peer CHANNEL_DATA; checks the peer stayed inside our window.
    pub(crate) fn on_data(&self, len: u32) -> FerryResult<()> {
        self.local_window.lock().consume(len)
    }

    /// Credits back data the dispatcher consumed without delivering.
    pub(crate) fn record_discarded(&self, len: u32) -> Option<u32> {
        self.local_window.lock().record_consumed(len)
    }

    /// Peer CLOSE. Returns true once both directions are closed.
    pub(crate) fn on_peer_close(&self) -> bool {
        let both = {
            let mut state = self.state.lock();
            *state = if self.close_sent() {
                ChannelState::Closed
            } else {
                ChannelState::Closing
            };
            *state == ChannelState::Closed
        };
        self.window_changed.notify_waiters();
        both
    }

    pub(crate) fn mark_closed(&self) {
        *self.state.lock() = ChannelState::Closed;
        self.window_changed.notify_waiters();
    }

    /// Session teardown: fails every waiter.
    pub(crate) fn tear_down(&self) {
        self.torn_down.store(true, Ordering::Release);
        self.requests.lock().clear();
        self.mark_closed();
    }

    /// CHANNEL_SUCCESS / CHANNEL_FAILURE, answered in request order.
    pub(crate) fn on_request_reply(&self, success: bool) {
        match self.requests.lock().pop_front() {
            Some(reply) => {
                let _ = reply.send(success);
            }
            None => debug!(channel = self.local_id, "Request reply with no request pending"),
        }
    }

    fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    fn closed_error(&self) -> FerryError {
        if self.is_torn_down() {
            FerryError::SessionClosed
        } else {
            FerryError::Protocol(format!("Channel {} is closed", self.local_id))
        }
    }
}

/// An open SSH channel.
pub struct Channel {
    shared: Arc<ChannelShared>,
    inbound: Mutex<mpsc::UnboundedReceiver<Inbound>>,
    writer: SharedWriter,
    commands: mpsc::UnboundedSender<Command>,
    timeouts: ChannelTimeouts,
    finished: AtomicBool,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("local_id", &self.shared.local_id)
            .field("remote_id", &self.shared.remote_id)
            .field("state", &self.shared.state())
            .finish()
    }
}

impl Channel {
    pub(crate) fn new(
        shared: Arc<ChannelShared>,
        inbound: mpsc::UnboundedReceiver<Inbound>,
        writer: SharedWriter,
        commands: mpsc::UnboundedSender<Command>,
        timeouts: ChannelTimeouts,
    ) -> Self {
        Self {
            shared,
            inbound: Mutex::new(inbound),
            writer,
            commands,
            timeouts,
            finished: AtomicBool::new(false),
        }
    }

    /// Local channel ID.
    pub fn local_id(&self) -> u32 {
        self.shared.local_id
    }

    /// Peer's channel ID.
    pub fn remote_id(&self) -> u32 {
        self.shared.remote_id
    }

    /// Current state.
    pub fn state(&self) -> ChannelState {
        self.shared.state()
    }

    /// Credit left in the peer's window.
    pub fn remote_window(&self) -> u32 {
        self.shared.remote_window.lock().available()
    }

    /// Largest data chunk `send` writes in one packet.
    pub fn max_chunk(&self) -> u32 {
        self.shared.remote_max_packet.min(MAX_CHANNEL_PACKET_SIZE)
    }

    async fn write(&self, payload: &[u8]) -> FerryResult<()> {
        self.writer.lock().await.write_payload(payload).await
    }

    /// Sends data, splitting it by the peer's packet size and window.
    ///
    /// # Errors
    ///
    /// - [`FerryError::Timeout`] if no window credit arrives in time
    /// - [`FerryError::SessionClosed`] if the session goes away meanwhile
    pub async fn send(&self, data: &[u8]) -> FerryResult<()> {
        if self.shared.close_sent() || self.shared.eof_sent.load(Ordering::Acquire) {
            return Err(self.shared.closed_error());
        }

        let max_chunk = self.max_chunk().max(1);
        let mut offset = 0;
        while offset < data.len() {
            let want = u32::try_from(data.len() - offset)
                .unwrap_or(u32::MAX)
                .min(max_chunk);
            let n = self.wait_for_credit(want).await? as usize;

            self.write(&ChannelData::encode(
                self.shared.remote_id,
                &data[offset..offset + n],
            ))
            .await?;
            offset += n;
        }
        Ok(())
    }

    async fn wait_for_credit(&self, want: u32) -> FerryResult<u32> {
        loop {
            // Registered before checking so a concurrent adjust is not missed.
            let changed = self.shared.window_changed.notified();

            if self.shared.state() != ChannelState::Open {
                return Err(self.shared.closed_error());
            }
            let n = self.shared.remote_window.lock().consume_up_to(want);
            if n > 0 {
                return Ok(n);
            }

            debug!(channel = self.shared.local_id, "Waiting for window credit");
            tokio::time::timeout(self.timeouts.window, changed)
                .await
                .map_err(|_| {
                    FerryError::Timeout(format!(
                        "window credit on channel {}",
                        self.shared.local_id
                    ))
                })?;
        }
    }

    /// Receives the next chunk of data.
    ///
    /// Returns `Ok(None)` once the peer sent EOF or CLOSE and everything
    /// before it has been delivered.
    ///
    /// # Errors
    ///
    /// [`FerryError::SessionClosed`] if the session ends first.
    /// Concurrent callers are served one at a time.
    pub async fn receive(&self) -> FerryResult<Option<Vec<u8>>> {
        let mut inbound = self.inbound.lock().await;
        if self.finished.load(Ordering::Acquire) {
            return Ok(None);
        }

        match inbound.recv().await {
            Some(Inbound::Data(data)) => {
                let adjust = self
                    .shared
                    .local_window
                    .lock()
                    .record_consumed(data.len() as u32);
                if let Some(bytes) = adjust {
                    logging::log_window_adjust(self.shared.local_id, "sent", bytes);
                    self.write(&ChannelWindowAdjust::new(self.shared.remote_id, bytes).to_bytes())
                        .await?;
                }
                Ok(Some(data))
            }
            Some(Inbound::Eof) | Some(Inbound::Close) => {
                self.finished.store(true, Ordering::Release);
                Ok(None)
            }
            None => Err(FerryError::SessionClosed),
        }
    }

    /// Half-closes the outbound direction.
    pub async fn send_eof(&self) -> FerryResult<()> {
        if self.shared.close_sent() || self.shared.eof_sent.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.write(&ChannelEof::new(self.shared.remote_id).to_bytes())
            .await
    }

    /// Sends CLOSE unless it was already sent.
    ///
    /// The table entry is released once the peer's CLOSE arrives.
    pub async fn close(&self) -> FerryResult<()> {
        if self.shared.is_torn_down() || !self.shared.claim_close() {
            return Ok(());
        }
        logging::log_channel_closed(self.shared.local_id, "local");
        self.write(&ChannelClose::new(self.shared.remote_id).to_bytes())
            .await
    }

    /// Requests a subsystem and waits for the reply.
    ///
    /// # Errors
    ///
    /// - [`FerryError::ChannelOpenFailed`] if the peer refuses
    /// - [`FerryError::Timeout`] if no reply arrives in time
    pub async fn request_subsystem(&self, name: &str) -> FerryResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.shared.requests.lock().push_back(reply_tx);

        let request = ChannelRequest::new(
            self.shared.remote_id,
            ChannelRequestType::Subsystem {
                name: name.to_string(),
            },
            true,
        );
        self.write(&request.to_bytes()).await?;

        match tokio::time::timeout(self.timeouts.request, reply_rx).await {
            Ok(Ok(true)) => {
                debug!(channel = self.shared.local_id, subsystem = name, "Subsystem started");
                Ok(())
            }
            Ok(Ok(false)) => Err(FerryError::ChannelOpenFailed {
                reason: 0,
                description: format!("subsystem '{}' refused", name),
            }),
            Ok(Err(_)) => Err(FerryError::SessionClosed),
            Err(_) => Err(FerryError::Timeout(format!("subsystem '{}' request", name))),
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if !self.shared.is_torn_down() && !self.shared.close_sent() {
            let _ = self.commands.send(Command::Dropped(self.shared.local_id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_window_consume() {
        let mut window = ChannelWindow::new(1000);
        assert!(window.consume(500).is_ok());
        assert_eq!(window.available(), 500);

        assert!(matches!(window.consume(600), Err(FerryError::Protocol(_))));
        assert_eq!(window.available(), 500);

        window.credit(500);
        assert_eq!(window.available(), 1000);
    }

    #[test]
    fn test_window_credit_saturates() {
        let mut window = ChannelWindow::new(u32::MAX - 1);
        window.credit(10);
        assert_eq!(window.available(), u32::MAX);
    }

    #[test]
    fn test_record_consumed_adjusts_at_half() {
        let mut window = ChannelWindow::new(1000);
        window.consume(800).unwrap();

        assert_eq!(window.record_consumed(300), None);
        assert_eq!(window.record_consumed(200), Some(500));
        assert_eq!(window.available(), 700);
        assert_eq!(window.record_consumed(0), None);
    }

    /// The sender never has more unacknowledged bytes in flight than the
    /// peer advertised, for any interleaving of sends and adjusts.
    #[test]
    fn test_window_never_exceeds_advertised() {
        let mut rng = StdRng::seed_from_u64(0x5eed);

        for _ in 0..200 {
            let initial = rng.gen_range(0..64 * 1024);
            let mut window = ChannelWindow::new(initial);
            let mut advertised = u64::from(initial);
            let mut sent = 0u64;

            for _ in 0..500 {
                if rng.gen_bool(0.6) {
                    let want = rng.gen_range(1..40_000);
                    let n = window.consume_up_to(want);
                    assert!(n <= want);
                    sent += u64::from(n);
                } else {
                    let adjust = rng.gen_range(0..20_000);
                    window.credit(adjust);
                    advertised += u64::from(adjust);
                }
                assert!(sent <= advertised);
                assert_eq!(u64::from(window.available()), advertised - sent);
            }
        }
    }

    #[test]
    fn test_shared_close_claimed_once() {
        let shared = ChannelShared::new(0, 7, 1000, 1000, 32768);
        assert!(shared.claim_close());
        assert!(!shared.claim_close());
        assert_eq!(shared.state(), ChannelState::Closing);
        assert!(shared.on_peer_close());
        assert_eq!(shared.state(), ChannelState::Closed);
    }

    #[test]
    fn test_peer_close_first() {
        let shared = ChannelShared::new(0, 7, 1000, 1000, 32768);
        assert!(!shared.on_peer_close());
        assert_eq!(shared.state(), ChannelState::Closing);
    }

    #[tokio::test]
    async fn test_request_replies_in_order() {
        let shared = ChannelShared::new(0, 7, 1000, 1000, 32768);
        let (first_tx, first_rx) = oneshot::channel();
        let (second_tx, second_rx) = oneshot::channel();
        shared.requests.lock().push_back(first_tx);
        shared.requests.lock().push_back(second_tx);

        shared.on_request_reply(true);
        shared.on_request_reply(false);
        assert!(first_rx.await.unwrap());
        assert!(!second_rx.await.unwrap());
    }

    #[tokio::test]
    async fn test_teardown_fails_pending_request() {
        let shared = ChannelShared::new(0, 7, 1000, 1000, 32768);
        let (tx, rx) = oneshot::channel();
        shared.requests.lock().push_back(tx);

        shared.tear_down();
        assert!(rx.await.is_err());
        assert!(matches!(shared.closed_error(), FerryError::SessionClosed));
    }
}
