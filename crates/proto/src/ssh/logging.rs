//! Structured logging for SSH and SFTP sessions
//!
//! Provides structured, contextual logging using the `tracing` framework.
//! Session-level events go through these helpers so field names stay
//! consistent across the client, the server and the dispatcher.
//!
//! # Log Levels
//!
//! - **TRACE**: Individual packets (see `packet`)
//! - **DEBUG**: Message routing, window adjusts, SFTP requests
//! - **INFO**: State transitions, key exchange, authentication, channels
//! - **WARN**: Recoverable anomalies, teardown failures
//! - **ERROR**: Fatal session failures
//!
//! # Example
//!
//! ```no_run
//! use ferry_proto::ssh::logging;
//!
//! tracing_subscriber::fmt()
//!     .with_env_filter("ferry_proto::ssh=debug")
//!     .init();
//!
//! logging::log_state_transition("client", "KeyExchange", "Authenticating");
//! ```

use crate::ssh::kex::AlgorithmSuite;
use tracing::{debug, error, info, warn};

/// Log a transport state transition
///
/// # Arguments
///
/// * `role` - "client" or "server"
/// * `from` - Previous state
/// * `to` - New state
pub fn log_state_transition(role: &str, from: &str, to: &str) {
    info!(role = role, state_from = from, state_to = to, "Transport state transition");
}

/// Log the peer's identification string
pub fn log_peer_version(role: &str, peer_version: &str) {
    info!(role = role, peer_version = peer_version, "Version exchange complete");
}

/// Log key exchange completion
///
/// # Arguments
///
/// * `role` - "client" or "server"
/// * `suite` - Negotiated algorithms
/// * `rekey` - Whether this was a rekey
pub fn log_kex_complete(role: &str, suite: &AlgorithmSuite, rekey: bool) {
    info!(
        role = role,
        kex = suite.kex.name(),
        host_key = suite.host_key,
        cipher_c2s = suite.cipher_client_to_server.name(),
        cipher_s2c = suite.cipher_server_to_client.name(),
        rekey = rekey,
        "Key exchange complete"
    );
}

/// Log rekey start
///
/// # Arguments
///
/// * `role` - "client" or "server"
/// * `initiator` - "local" or "peer"
/// * `bytes` - Bytes transferred under the old keys
pub fn log_rekey_start(role: &str, initiator: &str, bytes: u64) {
    info!(role = role, initiator = initiator, bytes = bytes, "Rekey started");
}

/// Log the result of one authentication attempt
///
/// # Arguments
///
/// * `user` - User name
/// * `method` - Method name
/// * `result` - "success", "partial" or "failure"
pub fn log_auth_result(user: &str, method: &str, result: &str) {
    if result == "failure" {
        warn!(user = user, method = method, result = result, "Authentication attempt failed");
    } else {
        info!(user = user, method = method, result = result, "Authentication attempt");
    }
}

/// Log a channel open
pub fn log_channel_opened(local_id: u32, remote_id: u32, kind: &str, window: u32, max_packet: u32) {
    info!(
        channel = local_id,
        remote_channel = remote_id,
        kind = kind,
        window = window,
        max_packet = max_packet,
        "Channel opened"
    );
}

/// Log a channel close
///
/// # Arguments
///
/// * `local_id` - Local channel ID
/// * `reason` - "local", "peer" or "teardown"
pub fn log_channel_closed(local_id: u32, reason: &str) {
    info!(channel = local_id, reason = reason, "Channel closed");
}

/// Log a window adjust sent or received
pub fn log_window_adjust(local_id: u32, direction: &str, bytes: u32) {
    debug!(channel = local_id, direction = direction, bytes = bytes, "Window adjust");
}

/// Log a non-OK SFTP status
pub fn log_sftp_status(request_id: u32, code: u32, message: &str) {
    debug!(request_id = request_id, code = code, message = message, "SFTP status");
}

/// Log a disconnect sent or received
///
/// # Arguments
///
/// * `direction` - "sent" or "received"
/// * `reason_code` - SSH_DISCONNECT_* reason code
/// * `description` - Description text
pub fn log_disconnect(direction: &str, reason_code: u32, description: &str) {
    info!(direction = direction, reason_code = reason_code, description = description, "Disconnect");
}

/// Log a fatal session failure
pub fn log_session_failed(role: &str, error: &str) {
    error!(role = role, error = error, "Session failed");
}

/// Log a teardown step that failed but does not affect the caller
pub fn log_teardown_failure(what: &str, error: &str) {
    warn!(what = what, error = error, "Teardown step failed");
}
