//! SSH message numbers (RFC 4250 Section 4.1) and the transport-generic
//! messages that every layer may see: DISCONNECT, IGNORE, DEBUG and
//! UNIMPLEMENTED.
//!
//! # Example
//!
//! ```rust
//! use ferry_proto::ssh::message::MessageType;
//!
//! assert_eq!(MessageType::KexInit as u8, 20);
//! assert!(MessageType::KexInit.is_key_exchange());
//! assert!(!MessageType::ChannelData.is_key_exchange());
//! ```

use crate::ssh::wire::{read_string, read_u32, write_bytes, write_string};
use bytes::{BufMut, BytesMut};
use ferry_platform::{FerryError, FerryResult};

/// SSH message numbers.
///
/// Method-specific numbers (30-49 for key exchange, 60-79 for userauth) are
/// shared between methods. `KexEcdhInit`/`KexEcdhReply` also carry the
/// classic Diffie-Hellman KEXDH_INIT/KEXDH_REPLY, and `UserauthPkOk` also
/// carries keyboard-interactive INFO_REQUEST.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Terminates the connection.
    Disconnect = 1,
    /// Ignored by the receiver (keepalive, padding).
    Ignore = 2,
    /// Reply to a message number the peer does not understand.
    Unimplemented = 3,
    /// Debugging text.
    Debug = 4,
    /// Requests a service such as "ssh-userauth".
    ServiceRequest = 5,
    /// Accepts a service request.
    ServiceAccept = 6,
    /// Algorithm negotiation.
    KexInit = 20,
    /// Switch to the newly derived keys.
    NewKeys = 21,
    /// Client ephemeral public value.
    KexEcdhInit = 30,
    /// Server host key, ephemeral value and signature.
    KexEcdhReply = 31,
    /// Authentication request.
    UserauthRequest = 50,
    /// Authentication failure with the methods that can continue.
    UserauthFailure = 51,
    /// Authentication succeeded.
    UserauthSuccess = 52,
    /// Banner text shown before authentication.
    UserauthBanner = 53,
    /// Public key acceptable / keyboard-interactive info request.
    UserauthPkOk = 60,
    /// Keyboard-interactive info response.
    UserauthInfoResponse = 61,
    /// Global request.
    GlobalRequest = 80,
    /// Global request succeeded.
    RequestSuccess = 81,
    /// Global request failed.
    RequestFailure = 82,
    /// Channel open.
    ChannelOpen = 90,
    /// Channel open confirmation.
    ChannelOpenConfirmation = 91,
    /// Channel open failure.
    ChannelOpenFailure = 92,
    /// Window adjust.
    ChannelWindowAdjust = 93,
    /// Channel data.
    ChannelData = 94,
    /// Channel extended data.
    ChannelExtendedData = 95,
    /// Channel EOF.
    ChannelEof = 96,
    /// Channel close.
    ChannelClose = 97,
    /// Channel request.
    ChannelRequest = 98,
    /// Channel request succeeded.
    ChannelSuccess = 99,
    /// Channel request failed.
    ChannelFailure = 100,
}

impl MessageType {
    /// Converts a byte to a message type.
    pub fn from_u8(byte: u8) -> Option<Self> {
        use MessageType::*;

        let msg = match byte {
            1 => Disconnect,
            2 => Ignore,
            3 => Unimplemented,
            4 => Debug,
            5 => ServiceRequest,
            6 => ServiceAccept,
            20 => KexInit,
            21 => NewKeys,
            30 => KexEcdhInit,
            31 => KexEcdhReply,
            50 => UserauthRequest,
            51 => UserauthFailure,
            52 => UserauthSuccess,
            53 => UserauthBanner,
            60 => UserauthPkOk,
            61 => UserauthInfoResponse,
            80 => GlobalRequest,
            81 => RequestSuccess,
            82 => RequestFailure,
            90 => ChannelOpen,
            91 => ChannelOpenConfirmation,
            92 => ChannelOpenFailure,
            93 => ChannelWindowAdjust,
            94 => ChannelData,
            95 => ChannelExtendedData,
            96 => ChannelEof,
            97 => ChannelClose,
            98 => ChannelRequest,
            99 => ChannelSuccess,
            100 => ChannelFailure,
            _ => return None,
        };
        Some(msg)
    }

    /// Returns the RFC name of the message.
    pub fn name(&self) -> &'static str {
        use MessageType::*;

        match self {
            Disconnect => "SSH_MSG_DISCONNECT",
            Ignore => "SSH_MSG_IGNORE",
            Unimplemented => "SSH_MSG_UNIMPLEMENTED",
            Debug => "SSH_MSG_DEBUG",
            ServiceRequest => "SSH_MSG_SERVICE_REQUEST",
            ServiceAccept => "SSH_MSG_SERVICE_ACCEPT",
            KexInit => "SSH_MSG_KEXINIT",
            NewKeys => "SSH_MSG_NEWKEYS",
            KexEcdhInit => "SSH_MSG_KEX_ECDH_INIT",
            KexEcdhReply => "SSH_MSG_KEX_ECDH_REPLY",
            UserauthRequest => "SSH_MSG_USERAUTH_REQUEST",
            UserauthFailure => "SSH_MSG_USERAUTH_FAILURE",
            UserauthSuccess => "SSH_MSG_USERAUTH_SUCCESS",
            UserauthBanner => "SSH_MSG_USERAUTH_BANNER",
            UserauthPkOk => "SSH_MSG_USERAUTH_PK_OK",
            UserauthInfoResponse => "SSH_MSG_USERAUTH_INFO_RESPONSE",
            GlobalRequest => "SSH_MSG_GLOBAL_REQUEST",
            RequestSuccess => "SSH_MSG_REQUEST_SUCCESS",
            RequestFailure => "SSH_MSG_REQUEST_FAILURE",
            ChannelOpen => "SSH_MSG_CHANNEL_OPEN",
            ChannelOpenConfirmation => "SSH_MSG_CHANNEL_OPEN_CONFIRMATION",
            ChannelOpenFailure => "SSH_MSG_CHANNEL_OPEN_FAILURE",
            ChannelWindowAdjust => "SSH_MSG_CHANNEL_WINDOW_ADJUST",
            ChannelData => "SSH_MSG_CHANNEL_DATA",
            ChannelExtendedData => "SSH_MSG_CHANNEL_EXTENDED_DATA",
            ChannelEof => "SSH_MSG_CHANNEL_EOF",
            ChannelClose => "SSH_MSG_CHANNEL_CLOSE",
            ChannelRequest => "SSH_MSG_CHANNEL_REQUEST",
            ChannelSuccess => "SSH_MSG_CHANNEL_SUCCESS",
            ChannelFailure => "SSH_MSG_CHANNEL_FAILURE",
        }
    }

    /// Messages permitted while a key exchange is in progress
    /// (RFC 4253 Section 7.1).
    pub fn is_key_exchange(&self) -> bool {
        let n = *self as u8;
        matches!(n, 1..=4 | 20..=49)
    }

    /// Connection-protocol messages (RFC 4254).
    pub fn is_connection(&self) -> bool {
        (*self as u8) >= 80
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), *self as u8)
    }
}

/// Returns the message number of a payload, if any.
pub fn message_number(payload: &[u8]) -> FerryResult<u8> {
    payload
        .first()
        .copied()
        .ok_or_else(|| FerryError::Framing("Empty payload".to_string()))
}

/// Disconnect reason codes (RFC 4253 Section 11.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DisconnectReason {
    /// Host not allowed to connect.
    HostNotAllowedToConnect = 1,
    /// Protocol error.
    ProtocolError = 2,
    /// Key exchange failed.
    KeyExchangeFailed = 3,
    /// MAC error.
    MacError = 5,
    /// Service not available.
    ServiceNotAvailable = 7,
    /// Protocol version not supported.
    ProtocolVersionNotSupported = 8,
    /// Host key not verifiable.
    HostKeyNotVerifiable = 9,
    /// Connection lost.
    ConnectionLost = 10,
    /// Disconnect by application.
    ByApplication = 11,
    /// No more authentication methods available.
    NoMoreAuthMethodsAvailable = 14,
}

impl DisconnectReason {
    /// Picks the reason code reported to the peer for a local error.
    pub fn for_error(err: &FerryError) -> Self {
        match err {
            FerryError::Integrity(_) => DisconnectReason::MacError,
            FerryError::NoCommonAlgorithm { .. } => DisconnectReason::KeyExchangeFailed,
            FerryError::IncompatibleVersion(_) => DisconnectReason::ProtocolVersionNotSupported,
            FerryError::HostKeyVerification(_) => DisconnectReason::HostKeyNotVerifiable,
            FerryError::Authentication(_) => DisconnectReason::NoMoreAuthMethodsAvailable,
            _ => DisconnectReason::ProtocolError,
        }
    }
}

/// SSH_MSG_DISCONNECT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnect {
    /// Reason code
    pub reason_code: u32,
    /// Human-readable description
    pub description: String,
}

impl Disconnect {
    /// Creates a disconnect message.
    pub fn new(reason: DisconnectReason, description: &str) -> Self {
        Self {
            reason_code: reason as u32,
            description: description.to_string(),
        }
    }

    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::Disconnect as u8);
        buf.put_u32(self.reason_code);
        write_string(&mut buf, &self.description);
        write_string(&mut buf, "");
        buf.to_vec()
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> FerryResult<Self> {
        let mut offset = 1;
        let reason_code = read_u32(data, &mut offset)?;
        let description = read_string(data, &mut offset).unwrap_or_default();
        Ok(Self {
            reason_code,
            description,
        })
    }
}

/// Builds an SSH_MSG_IGNORE payload.
pub fn ignore_message(data: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(5 + data.len());
    buf.put_u8(MessageType::Ignore as u8);
    write_bytes(&mut buf, data);
    buf.to_vec()
}

/// Builds an SSH_MSG_UNIMPLEMENTED payload for the given sequence number.
pub fn unimplemented_message(sequence: u32) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(5);
    buf.put_u8(MessageType::Unimplemented as u8);
    buf.put_u32(sequence);
    buf.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_conversion() {
        assert_eq!(MessageType::from_u8(20), Some(MessageType::KexInit));
        assert_eq!(MessageType::from_u8(61), Some(MessageType::UserauthInfoResponse));
        assert_eq!(MessageType::from_u8(255), None);
    }

    #[test]
    fn test_message_type_display() {
        assert_eq!(MessageType::KexInit.to_string(), "SSH_MSG_KEXINIT(20)");
        assert_eq!(
            MessageType::ChannelWindowAdjust.to_string(),
            "SSH_MSG_CHANNEL_WINDOW_ADJUST(93)"
        );
    }

    #[test]
    fn test_kex_gate() {
        assert!(MessageType::NewKeys.is_key_exchange());
        assert!(MessageType::Ignore.is_key_exchange());
        assert!(!MessageType::ServiceRequest.is_key_exchange());
        assert!(!MessageType::ChannelData.is_key_exchange());
        assert!(MessageType::ChannelData.is_connection());
    }

    #[test]
    fn test_disconnect_roundtrip() {
        let msg = Disconnect::new(DisconnectReason::ByApplication, "bye");
        let bytes = msg.to_bytes();
        assert_eq!(bytes[0], MessageType::Disconnect as u8);
        assert_eq!(Disconnect::from_bytes(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_disconnect_reason_for_error() {
        let err = FerryError::Integrity("tag".into());
        assert_eq!(DisconnectReason::for_error(&err), DisconnectReason::MacError);
        let err = FerryError::Framing("len".into());
        assert_eq!(DisconnectReason::for_error(&err), DisconnectReason::ProtocolError);
    }
}
