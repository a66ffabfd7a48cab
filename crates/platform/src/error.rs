//! Error types for Ferry
//!
//! Errors fall into four groups:
//!
//! - **Session-fatal**: `Framing`, `Integrity`. The byte stream can no longer
//!   be trusted and the session is torn down.
//! - **Handshake-fatal**: `NoCommonAlgorithm`, `IncompatibleVersion`,
//!   `HostKeyVerification`, `Authentication`. The session never reaches the
//!   authenticated state.
//! - **Teardown**: `SessionClosed` is delivered to every operation that was
//!   pending when the session went away.
//! - **Operation-local**: timeouts, channel open refusals and SFTP status
//!   errors fail a single call and leave the session usable.

use thiserror::Error;

/// Unified error type for all Ferry operations
#[derive(Debug, Error)]
pub enum FerryError {
    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Protocol error (unexpected message, bad state transition)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Cryptographic primitive failure (key setup, signing)
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Malformed packet framing (length, padding or alignment)
    #[error("Framing error: {0}")]
    Framing(String),

    /// MAC or AEAD tag verification failed
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// Negotiation found no algorithm both sides support
    #[error("No common {category} algorithm (client: {client}; server: {server})")]
    NoCommonAlgorithm {
        /// Negotiation category, e.g. "cipher client->server"
        category: String,
        /// Client name-list
        client: String,
        /// Server name-list
        server: String,
    },

    /// Peer speaks an unsupported protocol version
    #[error("Incompatible protocol version: {0}")]
    IncompatibleVersion(String),

    /// Host key signature invalid or key rejected by policy
    #[error("Host key verification failed: {0}")]
    HostKeyVerification(String),

    /// All authentication methods exhausted
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The session (or channel) was closed while the operation was pending
    #[error("Session closed")]
    SessionClosed,

    /// A caller-configured timeout elapsed
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Peer refused to open a channel
    #[error("Channel open failed (reason {reason}): {description}")]
    ChannelOpenFailed {
        /// SSH_OPEN_* reason code
        reason: u32,
        /// Peer-supplied description
        description: String,
    },

    /// SFTP: no such file or directory
    #[error("No such file: {0}")]
    NoSuchFile(String),

    /// SFTP: permission denied
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// SFTP: end of file
    #[error("End of file")]
    Eof,

    /// SFTP: server does not support the operation
    #[error("Operation unsupported: {0}")]
    OpUnsupported(String),

    /// SFTP: any other non-OK status code
    #[error("SFTP status {code}: {message}")]
    SftpStatus {
        /// SSH_FX_* status code
        code: u32,
        /// Server-supplied message
        message: String,
    },

    /// SFTP message with an unknown type tag
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// A chunk of a put/get transfer failed
    #[error("Transfer failed at offset {offset} ({len} bytes): {source}")]
    TransferFailed {
        /// Byte offset of the failed chunk
        offset: u64,
        /// Length of the failed chunk
        len: u32,
        /// Underlying failure
        #[source]
        source: Box<FerryError>,
    },
}

impl FerryError {
    /// Returns true if the error leaves the session unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FerryError::Framing(_)
                | FerryError::Integrity(_)
                | FerryError::NoCommonAlgorithm { .. }
                | FerryError::IncompatibleVersion(_)
                | FerryError::HostKeyVerification(_)
                | FerryError::Authentication(_)
                | FerryError::SessionClosed
        )
    }

    /// Returns true for errors scoped to a single SFTP operation.
    pub fn is_sftp_status(&self) -> bool {
        matches!(
            self,
            FerryError::NoSuchFile(_)
                | FerryError::PermissionDenied(_)
                | FerryError::Eof
                | FerryError::OpUnsupported(_)
                | FerryError::SftpStatus { .. }
                | FerryError::UnsupportedOperation(_)
        )
    }

    /// SFTP status code (`SSH_FX_*`) carried by an SFTP-local error.
    ///
    /// ```
    /// use ferry_platform::FerryError;
    ///
    /// assert_eq!(FerryError::NoSuchFile("/x".into()).sftp_status_code(), Some(2));
    /// assert_eq!(FerryError::SessionClosed.sftp_status_code(), None);
    /// ```
    pub fn sftp_status_code(&self) -> Option<u32> {
        match self {
            FerryError::Eof => Some(1),
            FerryError::NoSuchFile(_) => Some(2),
            FerryError::PermissionDenied(_) => Some(3),
            FerryError::OpUnsupported(_) | FerryError::UnsupportedOperation(_) => Some(8),
            FerryError::SftpStatus { code, .. } => Some(*code),
            FerryError::TransferFailed { source, .. } => source.sftp_status_code(),
            _ => None,
        }
    }

    /// Maps an I/O error seen at a record boundary.
    ///
    /// A clean EOF between records means the peer went away, which every
    /// pending operation should observe as `SessionClosed`.
    pub fn from_stream_io(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe => FerryError::SessionClosed,
            _ => FerryError::Io(err),
        }
    }
}

/// Result type for Ferry operations
pub type FerryResult<T> = Result<T, FerryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FerryError::Config("Invalid configuration".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: Invalid configuration"
        );

        let err = FerryError::NoCommonAlgorithm {
            category: "cipher client->server".to_string(),
            client: "aes256-ctr".to_string(),
            server: "3des-cbc".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "No common cipher client->server algorithm (client: aes256-ctr; server: 3des-cbc)"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: FerryError = io_err.into();
        assert!(matches!(err, FerryError::Io(_)));
    }

    #[test]
    fn test_stream_eof_is_session_closed() {
        let io_err = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        assert!(matches!(
            FerryError::from_stream_io(io_err),
            FerryError::SessionClosed
        ));

        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        assert!(matches!(FerryError::from_stream_io(io_err), FerryError::Io(_)));
    }

    #[test]
    fn test_sftp_status_code() {
        assert_eq!(FerryError::Eof.sftp_status_code(), Some(1));
        assert_eq!(FerryError::PermissionDenied("/root".into()).sftp_status_code(), Some(3));
        let err = FerryError::TransferFailed {
            offset: 32768,
            len: 100,
            source: Box::new(FerryError::SftpStatus { code: 4, message: "Failure".into() }),
        };
        assert_eq!(err.sftp_status_code(), Some(4));
        assert_eq!(FerryError::Protocol("x".into()).sftp_status_code(), None);
    }

    #[test]
    fn test_fatal_classification() {
        assert!(FerryError::Integrity("bad mac".into()).is_fatal());
        assert!(FerryError::SessionClosed.is_fatal());
        assert!(!FerryError::Eof.is_fatal());
        assert!(!FerryError::Timeout("read".into()).is_fatal());
        assert!(FerryError::NoSuchFile("/x".into()).is_sftp_status());
        assert!(!FerryError::Framing("short".into()).is_sftp_status());
    }

    #[test]
    fn test_transfer_failed_keeps_source() {
        use std::error::Error;

        let err = FerryError::TransferFailed {
            offset: 32768,
            len: 4096,
            source: Box::new(FerryError::PermissionDenied("/ro".into())),
        };
        assert!(err.to_string().contains("offset 32768"));
        assert!(err.source().is_some());
    }
}
