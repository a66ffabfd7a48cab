//! SSH keep-alive.
//!
//! Periodically sends SSH_MSG_IGNORE through the session's shared writer so
//! idle connections are not dropped by middleboxes. The messages take the
//! same write path as channel data, so they queue behind a running rekey.

use crate::ssh::channel::SharedWriter;
use crate::ssh::message::ignore_message;
use ferry_platform::FerryResult;
use rand::RngCore;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Random padding carried by each keep-alive.
const KEEPALIVE_DATA_LEN: usize = 16;

/// Keep-alive task handle. Stops the task when dropped.
#[derive(Debug)]
pub struct KeepaliveTask {
    interval: Duration,
    handle: Option<JoinHandle<()>>,
}

impl KeepaliveTask {
    /// Creates a stopped task.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            handle: None,
        }
    }

    /// Returns the interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Starts sending through `writer`.
    pub(crate) fn start(&mut self, writer: SharedWriter) {
        self.start_with(move || {
            let writer = writer.clone();
            async move {
                let message = keepalive_message(KEEPALIVE_DATA_LEN);
                writer.lock().await.write_payload(&message).await
            }
        });
    }

    /// Starts the task with an arbitrary send function.
    ///
    /// The task stops at the first failed send.
    pub fn start_with<F, Fut>(&mut self, send_fn: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = FerryResult<()>> + Send + 'static,
    {
        self.stop();
        let interval = self.interval;

        self.handle = Some(tokio::spawn(async move {
            debug!(interval = ?interval, "Keep-alive started");
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                if let Err(e) = send_fn().await {
                    warn!(error = %e, "Keep-alive failed, stopping");
                    break;
                }
                debug!("Keep-alive sent");
            }
        }));
    }

    /// Stops the task.
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// Returns whether the task is running.
    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for KeepaliveTask {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Builds an SSH_MSG_IGNORE carrying `data_len` random bytes.
///
/// ```rust
/// use ferry_proto::ssh::session::keepalive::keepalive_message;
///
/// let msg = keepalive_message(8);
/// assert_eq!(msg[0], 2);
/// assert_eq!(msg.len(), 1 + 4 + 8);
/// ```
pub fn keepalive_message(data_len: usize) -> Vec<u8> {
    let mut data = vec![0u8; data_len];
    rand::thread_rng().fill_bytes(&mut data);
    ignore_message(&data)
}
