//! SSH connection protocol messages (RFC 4254).
//!
//! This module defines the wire form of:
//! - Channel open, confirmation and failure
//! - Window adjust, data and extended data
//! - EOF and close
//! - Channel requests (subsystem, exec, shell, env, exit-status)
//! - Global requests and their replies
//!
//! Channel state and flow control live in [`crate::ssh::channel`].
//!
//! # Example
//!
//! ```rust
//! use ferry_proto::ssh::connection::{ChannelOpen, ChannelType};
//!
//! let open = ChannelOpen::new(
//!     ChannelType::Session,
//!     0,           // sender channel
//!     2097152,     // initial window size (2 MB)
//!     32768,       // maximum packet size (32 KB)
//! );
//! let parsed = ChannelOpen::from_bytes(&open.to_bytes()).unwrap();
//! assert_eq!(parsed, open);
//! ```

use crate::ssh::message::MessageType;
use crate::ssh::wire::{read_bool, read_bytes, read_string, read_u32, write_bool, write_bytes, write_string};
use bytes::{BufMut, BytesMut};
use ferry_platform::{FerryError, FerryResult};

/// Largest window either side may advertise (16 MB).
pub const MAX_WINDOW_SIZE: u32 = 16 * 1024 * 1024;

/// Default initial window for locally opened channels (2 MB).
pub const DEFAULT_WINDOW_SIZE: u32 = 2 * 1024 * 1024;

/// Default maximum packet size for locally opened channels (32 KB).
pub const DEFAULT_MAX_PACKET_SIZE: u32 = 32 * 1024;

/// Largest maximum packet size a peer may advertise.
///
/// A CHANNEL_DATA packet carrying that much payload still fits in one
/// transport packet.
pub const MAX_CHANNEL_PACKET_SIZE: u32 = 32 * 1024;

fn check_type(data: &[u8], expected: MessageType) -> FerryResult<usize> {
    match data.first() {
        None => Err(FerryError::Protocol(format!("{} message is empty", expected.name()))),
        Some(&t) if t != expected as u8 => Err(FerryError::Protocol(format!(
            "Invalid message type: expected {}, got {}",
            expected, t
        ))),
        Some(_) => Ok(1),
    }
}

/// Reads the recipient channel of any channel-scoped message.
pub fn recipient_channel(data: &[u8]) -> FerryResult<u32> {
    let mut offset = 1;
    read_u32(data, &mut offset)
}

/// Channel type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelType {
    /// Session channel (subsystem, exec, shell)
    Session,
    /// Any other type; refused with UNKNOWN_CHANNEL_TYPE
    Other(String),
}

impl ChannelType {
    /// Returns the channel type name.
    pub fn name(&self) -> &str {
        match self {
            ChannelType::Session => "session",
            ChannelType::Other(name) => name,
        }
    }
}

/// SSH_MSG_CHANNEL_OPEN (RFC 4254 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpen {
    channel_type: ChannelType,
    sender_channel: u32,
    initial_window_size: u32,
    maximum_packet_size: u32,
}

impl ChannelOpen {
    /// Creates a new channel open message.
    pub fn new(
        channel_type: ChannelType,
        sender_channel: u32,
        initial_window_size: u32,
        maximum_packet_size: u32,
    ) -> Self {
        Self {
            channel_type,
            sender_channel,
            initial_window_size,
            maximum_packet_size,
        }
    }

    /// Returns the channel type.
    pub fn channel_type(&self) -> &ChannelType {
        &self.channel_type
    }

    /// Returns the sender channel number.
    pub fn sender_channel(&self) -> u32 {
        self.sender_channel
    }

    /// Returns the initial window size.
    pub fn initial_window_size(&self) -> u32 {
        self.initial_window_size
    }

    /// Returns the maximum packet size.
    pub fn maximum_packet_size(&self) -> u32 {
        self.maximum_packet_size
    }

    /// Serializes to bytes.
    ///
    /// ```text
    /// byte      SSH_MSG_CHANNEL_OPEN (90)
    /// string    channel type
    /// uint32    sender channel
    /// uint32    initial window size
    /// uint32    maximum packet size
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelOpen as u8);
        write_string(&mut buf, self.channel_type.name());
        buf.put_u32(self.sender_channel);
        buf.put_u32(self.initial_window_size);
        buf.put_u32(self.maximum_packet_size);
        buf.to_vec()
    }

    /// Parses from bytes. Type-specific trailing data is ignored.
    pub fn from_bytes(data: &[u8]) -> FerryResult<Self> {
        let mut offset = check_type(data, MessageType::ChannelOpen)?;
        let type_name = read_string(data, &mut offset)?;
        let sender_channel = read_u32(data, &mut offset)?;
        let initial_window_size = read_u32(data, &mut offset)?;
        let maximum_packet_size = read_u32(data, &mut offset)?;

        let channel_type = match type_name.as_str() {
            "session" => ChannelType::Session,
            _ => ChannelType::Other(type_name),
        };

        Ok(Self {
            channel_type,
            sender_channel,
            initial_window_size,
            maximum_packet_size,
        })
    }
}

/// SSH_MSG_CHANNEL_OPEN_CONFIRMATION (RFC 4254 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpenConfirmation {
    recipient_channel: u32,
    sender_channel: u32,
    initial_window_size: u32,
    maximum_packet_size: u32,
}

impl ChannelOpenConfirmation {
    /// Creates a new channel open confirmation.
    pub fn new(
        recipient_channel: u32,
        sender_channel: u32,
        initial_window_size: u32,
        maximum_packet_size: u32,
    ) -> Self {
        Self {
            recipient_channel,
            sender_channel,
            initial_window_size,
            maximum_packet_size,
        }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the sender channel number.
    pub fn sender_channel(&self) -> u32 {
        self.sender_channel
    }

    /// Returns the initial window size.
    pub fn initial_window_size(&self) -> u32 {
        self.initial_window_size
    }

    /// Returns the maximum packet size.
    pub fn maximum_packet_size(&self) -> u32 {
        self.maximum_packet_size
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelOpenConfirmation as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.sender_channel);
        buf.put_u32(self.initial_window_size);
        buf.put_u32(self.maximum_packet_size);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> FerryResult<Self> {
        let mut offset = check_type(data, MessageType::ChannelOpenConfirmation)?;
        Ok(Self {
            recipient_channel: read_u32(data, &mut offset)?,
            sender_channel: read_u32(data, &mut offset)?,
            initial_window_size: read_u32(data, &mut offset)?,
            maximum_packet_size: read_u32(data, &mut offset)?,
        })
    }
}

/// Channel open failure reason codes (RFC 4254 Section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ChannelOpenFailureReason {
    /// SSH_OPEN_ADMINISTRATIVELY_PROHIBITED
    AdministrativelyProhibited = 1,
    /// SSH_OPEN_CONNECT_FAILED
    ConnectFailed = 2,
    /// SSH_OPEN_UNKNOWN_CHANNEL_TYPE
    UnknownChannelType = 3,
    /// SSH_OPEN_RESOURCE_SHORTAGE
    ResourceShortage = 4,
}

impl ChannelOpenFailureReason {
    /// Returns a short description of the reason.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AdministrativelyProhibited => "administratively prohibited",
            Self::ConnectFailed => "connect failed",
            Self::UnknownChannelType => "unknown channel type",
            Self::ResourceShortage => "resource shortage",
        }
    }
}

/// SSH_MSG_CHANNEL_OPEN_FAILURE (RFC 4254 Section 5.1).
///
/// The reason code is kept raw since peers may send codes outside the
/// RFC range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpenFailure {
    recipient_channel: u32,
    reason_code: u32,
    description: String,
}

impl ChannelOpenFailure {
    /// Creates a failure whose description is the reason text.
    pub fn new(recipient_channel: u32, reason: ChannelOpenFailureReason) -> Self {
        Self::with_description(recipient_channel, reason, reason.as_str())
    }

    /// Creates a failure with a custom description.
    pub fn with_description(
        recipient_channel: u32,
        reason: ChannelOpenFailureReason,
        description: &str,
    ) -> Self {
        Self {
            recipient_channel,
            reason_code: reason as u32,
            description: description.to_string(),
        }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the raw reason code.
    pub fn reason_code(&self) -> u32 {
        self.reason_code
    }

    /// Returns the description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Converts into the error reported to the opener.
    pub fn into_error(self) -> FerryError {
        FerryError::ChannelOpenFailed {
            reason: self.reason_code,
            description: self.description,
        }
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelOpenFailure as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.reason_code);
        write_string(&mut buf, &self.description);
        write_string(&mut buf, "");
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> FerryResult<Self> {
        let mut offset = check_type(data, MessageType::ChannelOpenFailure)?;
        let recipient_channel = read_u32(data, &mut offset)?;
        let reason_code = read_u32(data, &mut offset)?;
        let description = read_string(data, &mut offset)?;
        Ok(Self {
            recipient_channel,
            reason_code,
            description,
        })
    }
}

/// SSH_MSG_CHANNEL_WINDOW_ADJUST (RFC 4254 Section 5.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelWindowAdjust {
    recipient_channel: u32,
    bytes_to_add: u32,
}

impl ChannelWindowAdjust {
    /// Creates a new window adjust message.
    pub fn new(recipient_channel: u32, bytes_to_add: u32) -> Self {
        Self {
            recipient_channel,
            bytes_to_add,
        }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the credit granted.
    pub fn bytes_to_add(&self) -> u32 {
        self.bytes_to_add
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(9);
        buf.put_u8(MessageType::ChannelWindowAdjust as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.bytes_to_add);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> FerryResult<Self> {
        let mut offset = check_type(data, MessageType::ChannelWindowAdjust)?;
        Ok(Self {
            recipient_channel: read_u32(data, &mut offset)?,
            bytes_to_add: read_u32(data, &mut offset)?,
        })
    }
}

/// SSH_MSG_CHANNEL_DATA (RFC 4254 Section 5.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelData {
    recipient_channel: u32,
    data: Vec<u8>,
}

impl ChannelData {
    /// Creates a new data message.
    pub fn new(recipient_channel: u32, data: Vec<u8>) -> Self {
        Self {
            recipient_channel,
            data,
        }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the data.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Consumes the message, returning the data.
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Serializes a data message without building the struct first.
    pub fn encode(recipient_channel: u32, data: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(9 + data.len());
        buf.put_u8(MessageType::ChannelData as u8);
        buf.put_u32(recipient_channel);
        write_bytes(&mut buf, data);
        buf.to_vec()
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        Self::encode(self.recipient_channel, &self.data)
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> FerryResult<Self> {
        let mut offset = check_type(data, MessageType::ChannelData)?;
        Ok(Self {
            recipient_channel: read_u32(data, &mut offset)?,
            data: read_bytes(data, &mut offset)?,
        })
    }
}

/// SSH_MSG_CHANNEL_EXTENDED_DATA (RFC 4254 Section 5.2).
///
/// Only parsed; the payload counts against the window like regular data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelExtendedData {
    recipient_channel: u32,
    data_type_code: u32,
    data: Vec<u8>,
}

impl ChannelExtendedData {
    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the data type code (1 for stderr).
    pub fn data_type_code(&self) -> u32 {
        self.data_type_code
    }

    /// Returns the data.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> FerryResult<Self> {
        let mut offset = check_type(data, MessageType::ChannelExtendedData)?;
        Ok(Self {
            recipient_channel: read_u32(data, &mut offset)?,
            data_type_code: read_u32(data, &mut offset)?,
            data: read_bytes(data, &mut offset)?,
        })
    }
}

macro_rules! recipient_only_message {
    ($(#[$doc:meta])* $name:ident, $msg:expr) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name {
            recipient_channel: u32,
        }

        impl $name {
            /// Creates the message.
            pub fn new(recipient_channel: u32) -> Self {
                Self { recipient_channel }
            }

            /// Returns the recipient channel number.
            pub fn recipient_channel(&self) -> u32 {
                self.recipient_channel
            }

            /// Serializes to bytes.
            pub fn to_bytes(&self) -> Vec<u8> {
                let mut buf = BytesMut::with_capacity(5);
                buf.put_u8($msg as u8);
                buf.put_u32(self.recipient_channel);
                buf.to_vec()
            }

            /// Parses from bytes.
            pub fn from_bytes(data: &[u8]) -> FerryResult<Self> {
                let mut offset = check_type(data, $msg)?;
                Ok(Self {
                    recipient_channel: read_u32(data, &mut offset)?,
                })
            }
        }
    };
}

recipient_only_message!(
    /// SSH_MSG_CHANNEL_EOF (RFC 4254 Section 5.3).
    ChannelEof,
    MessageType::ChannelEof
);

recipient_only_message!(
    /// SSH_MSG_CHANNEL_CLOSE (RFC 4254 Section 5.3).
    ChannelClose,
    MessageType::ChannelClose
);

recipient_only_message!(
    /// SSH_MSG_CHANNEL_SUCCESS (RFC 4254 Section 5.4).
    ChannelSuccess,
    MessageType::ChannelSuccess
);

recipient_only_message!(
    /// SSH_MSG_CHANNEL_FAILURE (RFC 4254 Section 5.4).
    ChannelFailure,
    MessageType::ChannelFailure
);

/// Channel request type (RFC 4254 Section 6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRequestType {
    /// Start a subsystem such as "sftp"
    Subsystem {
        /// Subsystem name
        name: String,
    },
    /// Execute a command
    Exec {
        /// Command line
        command: String,
    },
    /// Start a shell
    Shell,
    /// Set an environment variable
    Env {
        /// Variable name
        name: String,
        /// Variable value
        value: String,
    },
    /// Exit status of the remote command
    ExitStatus {
        /// Exit status code
        exit_status: u32,
    },
    /// Any other request; type-specific data kept raw
    Other {
        /// Request name
        name: String,
        /// Type-specific data
        data: Vec<u8>,
    },
}

impl ChannelRequestType {
    /// Returns the request type name.
    pub fn name(&self) -> &str {
        match self {
            ChannelRequestType::Subsystem { .. } => "subsystem",
            ChannelRequestType::Exec { .. } => "exec",
            ChannelRequestType::Shell => "shell",
            ChannelRequestType::Env { .. } => "env",
            ChannelRequestType::ExitStatus { .. } => "exit-status",
            ChannelRequestType::Other { name, .. } => name,
        }
    }
}

/// SSH_MSG_CHANNEL_REQUEST (RFC 4254 Section 6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    recipient_channel: u32,
    request_type: ChannelRequestType,
    want_reply: bool,
}

impl ChannelRequest {
    /// Creates a new channel request.
    pub fn new(recipient_channel: u32, request_type: ChannelRequestType, want_reply: bool) -> Self {
        Self {
            recipient_channel,
            request_type,
            want_reply,
        }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the request type.
    pub fn request_type(&self) -> &ChannelRequestType {
        &self.request_type
    }

    /// Returns whether a reply is wanted.
    pub fn want_reply(&self) -> bool {
        self.want_reply
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelRequest as u8);
        buf.put_u32(self.recipient_channel);
        write_string(&mut buf, self.request_type.name());
        write_bool(&mut buf, self.want_reply);

        match &self.request_type {
            ChannelRequestType::Subsystem { name } => write_string(&mut buf, name),
            ChannelRequestType::Exec { command } => write_string(&mut buf, command),
            ChannelRequestType::Shell => {}
            ChannelRequestType::Env { name, value } => {
                write_string(&mut buf, name);
                write_string(&mut buf, value);
            }
            ChannelRequestType::ExitStatus { exit_status } => buf.put_u32(*exit_status),
            ChannelRequestType::Other { data, .. } => buf.put_slice(data),
        }

        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> FerryResult<Self> {
        let mut offset = check_type(data, MessageType::ChannelRequest)?;
        let recipient_channel = read_u32(data, &mut offset)?;
        let request_name = read_string(data, &mut offset)?;
        let want_reply = read_bool(data, &mut offset)?;

        let request_type = match request_name.as_str() {
            "subsystem" => ChannelRequestType::Subsystem {
                name: read_string(data, &mut offset)?,
            },
            "exec" => ChannelRequestType::Exec {
                command: read_string(data, &mut offset)?,
            },
            "shell" => ChannelRequestType::Shell,
            "env" => ChannelRequestType::Env {
                name: read_string(data, &mut offset)?,
                value: read_string(data, &mut offset)?,
            },
            "exit-status" => ChannelRequestType::ExitStatus {
                exit_status: read_u32(data, &mut offset)?,
            },
            _ => ChannelRequestType::Other {
                name: request_name,
                data: data[offset..].to_vec(),
            },
        };

        Ok(Self {
            recipient_channel,
            request_type,
            want_reply,
        })
    }
}

/// SSH_MSG_GLOBAL_REQUEST (RFC 4254 Section 4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalRequest {
    /// Request name
    pub name: String,
    /// Whether the sender waits for a reply
    pub want_reply: bool,
    /// Request-specific data
    pub data: Vec<u8>,
}

impl GlobalRequest {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::GlobalRequest as u8);
        write_string(&mut buf, &self.name);
        write_bool(&mut buf, self.want_reply);
        buf.put_slice(&self.data);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> FerryResult<Self> {
        let mut offset = check_type(data, MessageType::GlobalRequest)?;
        let name = read_string(data, &mut offset)?;
        let want_reply = read_bool(data, &mut offset)?;
        Ok(Self {
            name,
            want_reply,
            data: data[offset..].to_vec(),
        })
    }
}

/// Builds an SSH_MSG_REQUEST_FAILURE payload.
pub fn request_failure() -> Vec<u8> {
    vec![MessageType::RequestFailure as u8]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_open_session() {
        let open = ChannelOpen::new(ChannelType::Session, 3, 1048576, 32768);
        let bytes = open.to_bytes();
        assert_eq!(bytes[0], 90);

        let parsed = ChannelOpen::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.channel_type(), &ChannelType::Session);
        assert_eq!(parsed.sender_channel(), 3);
        assert_eq!(parsed.initial_window_size(), 1048576);
        assert_eq!(parsed.maximum_packet_size(), 32768);
    }

    #[test]
    fn test_channel_open_unknown_type_parses() {
        let mut buf = BytesMut::new();
        buf.put_u8(90);
        write_string(&mut buf, "direct-tcpip");
        buf.put_u32(1);
        buf.put_u32(1024);
        buf.put_u32(1024);
        write_string(&mut buf, "localhost");
        buf.put_u32(80);

        let parsed = ChannelOpen::from_bytes(&buf).unwrap();
        assert_eq!(
            parsed.channel_type(),
            &ChannelType::Other("direct-tcpip".to_string())
        );
    }

    #[test]
    fn test_open_failure_into_error() {
        let failure = ChannelOpenFailure::new(7, ChannelOpenFailureReason::UnknownChannelType);
        let parsed = ChannelOpenFailure::from_bytes(&failure.to_bytes()).unwrap();
        assert_eq!(parsed.recipient_channel(), 7);

        match parsed.into_error() {
            FerryError::ChannelOpenFailed {
                reason,
                description,
            } => {
                assert_eq!(reason, 3);
                assert_eq!(description, "unknown channel type");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_channel_data() {
        let bytes = ChannelData::encode(5, b"hello");
        assert_eq!(recipient_channel(&bytes).unwrap(), 5);

        let parsed = ChannelData::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.data(), b"hello");
        assert!(ChannelData::from_bytes(&bytes[..7]).is_err());
    }

    #[test]
    fn test_recipient_only_messages() {
        let eof = ChannelEof::new(1).to_bytes();
        assert_eq!(eof, vec![96, 0, 0, 0, 1]);
        assert_eq!(ChannelClose::from_bytes(&ChannelClose::new(2).to_bytes()).unwrap().recipient_channel(), 2);
        assert!(ChannelSuccess::from_bytes(&eof).is_err());
    }

    #[test]
    fn test_channel_request_subsystem() {
        let req = ChannelRequest::new(
            0,
            ChannelRequestType::Subsystem {
                name: "sftp".to_string(),
            },
            true,
        );
        let parsed = ChannelRequest::from_bytes(&req.to_bytes()).unwrap();
        assert_eq!(parsed, req);
    }

    #[test]
    fn test_channel_request_unknown_kept_raw() {
        let req = ChannelRequest::new(
            4,
            ChannelRequestType::Other {
                name: "pty-req".to_string(),
                data: vec![1, 2, 3],
            },
            true,
        );
        let parsed = ChannelRequest::from_bytes(&req.to_bytes()).unwrap();
        assert_eq!(parsed.request_type().name(), "pty-req");
        assert!(parsed.want_reply());
    }

    #[test]
    fn test_global_request() {
        let req = GlobalRequest {
            name: "keepalive@openssh.com".to_string(),
            want_reply: true,
            data: Vec::new(),
        };
        assert_eq!(GlobalRequest::from_bytes(&req.to_bytes()).unwrap(), req);
        assert_eq!(request_failure(), vec![82]);
    }
}
