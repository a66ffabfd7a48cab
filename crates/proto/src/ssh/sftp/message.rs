//! SFTP protocol messages.
//!
//! Every message on the subsystem channel is framed as
//!
//! ```text
//! uint32    length
//! byte      type
//! byte[n]   type-specific fields
//! ```
//!
//! [`encode_message`] produces a complete frame. [`FrameBuffer`] reassembles
//! frames from channel data, which may split or merge them arbitrarily, and
//! [`decode_message`] parses one frame body.

use super::types::{DirEntry, FileAttributes, OpenMode};
use crate::ssh::wire::{read_bytes, read_string, read_u32, read_u64, read_u8, write_bytes, write_string};
use bytes::{Buf, BufMut, BytesMut};
use ferry_platform::{FerryError, FerryResult};

/// SFTP protocol version (v3).
pub const SFTP_VERSION: u32 = 3;

/// Largest frame accepted from the peer.
pub const MAX_MESSAGE_LEN: usize = 256 * 1024;

/// SFTP message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SftpMessageType {
    /// SSH_FXP_INIT - Initialize SFTP session
    Init = 1,
    /// SSH_FXP_VERSION - Version response
    Version = 2,
    /// SSH_FXP_OPEN - Open file
    Open = 3,
    /// SSH_FXP_CLOSE - Close file/directory
    Close = 4,
    /// SSH_FXP_READ - Read from file
    Read = 5,
    /// SSH_FXP_WRITE - Write to file
    Write = 6,
    /// SSH_FXP_LSTAT - Get file attributes (no follow symlinks)
    LStat = 7,
    /// SSH_FXP_FSTAT - Get file attributes by handle
    FStat = 8,
    /// SSH_FXP_SETSTAT - Set file attributes
    SetStat = 9,
    /// SSH_FXP_FSETSTAT - Set file attributes by handle
    FSetStat = 10,
    /// SSH_FXP_OPENDIR - Open directory
    OpenDir = 11,
    /// SSH_FXP_READDIR - Read directory
    ReadDir = 12,
    /// SSH_FXP_REMOVE - Remove file
    Remove = 13,
    /// SSH_FXP_MKDIR - Create directory
    MkDir = 14,
    /// SSH_FXP_RMDIR - Remove directory
    RmDir = 15,
    /// SSH_FXP_REALPATH - Canonicalize path
    RealPath = 16,
    /// SSH_FXP_STAT - Get file attributes
    Stat = 17,
    /// SSH_FXP_RENAME - Rename file/directory
    Rename = 18,
    /// SSH_FXP_READLINK - Read symbolic link
    ReadLink = 19,
    /// SSH_FXP_SYMLINK - Create symbolic link
    Symlink = 20,

    // Response messages
    /// SSH_FXP_STATUS - Status response
    Status = 101,
    /// SSH_FXP_HANDLE - File handle response
    Handle = 102,
    /// SSH_FXP_DATA - Data response
    Data = 103,
    /// SSH_FXP_NAME - Name response
    Name = 104,
    /// SSH_FXP_ATTRS - Attributes response
    Attrs = 105,
}

impl SftpMessageType {
    /// Convert from u8.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Init),
            2 => Some(Self::Version),
            3 => Some(Self::Open),
            4 => Some(Self::Close),
            5 => Some(Self::Read),
            6 => Some(Self::Write),
            7 => Some(Self::LStat),
            8 => Some(Self::FStat),
            9 => Some(Self::SetStat),
            10 => Some(Self::FSetStat),
            11 => Some(Self::OpenDir),
            12 => Some(Self::ReadDir),
            13 => Some(Self::Remove),
            14 => Some(Self::MkDir),
            15 => Some(Self::RmDir),
            16 => Some(Self::RealPath),
            17 => Some(Self::Stat),
            18 => Some(Self::Rename),
            19 => Some(Self::ReadLink),
            20 => Some(Self::Symlink),
            101 => Some(Self::Status),
            102 => Some(Self::Handle),
            103 => Some(Self::Data),
            104 => Some(Self::Name),
            105 => Some(Self::Attrs),
            _ => None,
        }
    }
}

/// Client requests. Each travels with a request ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// SSH_FXP_OPEN
    Open {
        /// Path
        path: String,
        /// SSH_FXF_* flags
        mode: OpenMode,
        /// Attributes for a created file
        attrs: FileAttributes,
    },
    /// SSH_FXP_CLOSE
    Close {
        /// Handle
        handle: Vec<u8>,
    },
    /// SSH_FXP_READ
    Read {
        /// Handle
        handle: Vec<u8>,
        /// Byte offset
        offset: u64,
        /// Maximum bytes to return
        len: u32,
    },
    /// SSH_FXP_WRITE
    Write {
        /// Handle
        handle: Vec<u8>,
        /// Byte offset
        offset: u64,
        /// Data
        data: Vec<u8>,
    },
    /// SSH_FXP_LSTAT
    Lstat {
        /// Path
        path: String,
    },
    /// SSH_FXP_FSTAT
    Fstat {
        /// Handle
        handle: Vec<u8>,
    },
    /// SSH_FXP_SETSTAT
    Setstat {
        /// Path
        path: String,
        /// Attributes to change
        attrs: FileAttributes,
    },
    /// SSH_FXP_FSETSTAT
    Fsetstat {
        /// Handle
        handle: Vec<u8>,
        /// Attributes to change
        attrs: FileAttributes,
    },
    /// SSH_FXP_OPENDIR
    Opendir {
        /// Path
        path: String,
    },
    /// SSH_FXP_READDIR
    Readdir {
        /// Handle
        handle: Vec<u8>,
    },
    /// SSH_FXP_REMOVE
    Remove {
        /// Path
        path: String,
    },
    /// SSH_FXP_MKDIR
    Mkdir {
        /// Path
        path: String,
        /// Attributes of the new directory
        attrs: FileAttributes,
    },
    /// SSH_FXP_RMDIR
    Rmdir {
        /// Path
        path: String,
    },
    /// SSH_FXP_REALPATH
    Realpath {
        /// Path
        path: String,
    },
    /// SSH_FXP_STAT
    Stat {
        /// Path
        path: String,
    },
    /// SSH_FXP_RENAME
    Rename {
        /// Existing path
        old_path: String,
        /// New path
        new_path: String,
    },
    /// SSH_FXP_READLINK
    Readlink {
        /// Path of the link
        path: String,
    },
    /// SSH_FXP_SYMLINK
    ///
    /// Sent target first, as OpenSSH does.
    Symlink {
        /// What the link points to
        target: String,
        /// Path of the new link
        link: String,
    },
}

impl Request {
    /// Message type of the request.
    pub fn message_type(&self) -> SftpMessageType {
        match self {
            Request::Open { .. } => SftpMessageType::Open,
            Request::Close { .. } => SftpMessageType::Close,
            Request::Read { .. } => SftpMessageType::Read,
            Request::Write { .. } => SftpMessageType::Write,
            Request::Lstat { .. } => SftpMessageType::LStat,
            Request::Fstat { .. } => SftpMessageType::FStat,
            Request::Setstat { .. } => SftpMessageType::SetStat,
            Request::Fsetstat { .. } => SftpMessageType::FSetStat,
            Request::Opendir { .. } => SftpMessageType::OpenDir,
            Request::Readdir { .. } => SftpMessageType::ReadDir,
            Request::Remove { .. } => SftpMessageType::Remove,
            Request::Mkdir { .. } => SftpMessageType::MkDir,
            Request::Rmdir { .. } => SftpMessageType::RmDir,
            Request::Realpath { .. } => SftpMessageType::RealPath,
            Request::Stat { .. } => SftpMessageType::Stat,
            Request::Rename { .. } => SftpMessageType::Rename,
            Request::Readlink { .. } => SftpMessageType::ReadLink,
            Request::Symlink { .. } => SftpMessageType::Symlink,
        }
    }

    /// Short lowercase name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Request::Open { .. } => "open",
            Request::Close { .. } => "close",
            Request::Read { .. } => "read",
            Request::Write { .. } => "write",
            Request::Lstat { .. } => "lstat",
            Request::Fstat { .. } => "fstat",
            Request::Setstat { .. } => "setstat",
            Request::Fsetstat { .. } => "fsetstat",
            Request::Opendir { .. } => "opendir",
            Request::Readdir { .. } => "readdir",
            Request::Remove { .. } => "remove",
            Request::Mkdir { .. } => "mkdir",
            Request::Rmdir { .. } => "rmdir",
            Request::Realpath { .. } => "realpath",
            Request::Stat { .. } => "stat",
            Request::Rename { .. } => "rename",
            Request::Readlink { .. } => "readlink",
            Request::Symlink { .. } => "symlink",
        }
    }

    fn encode_fields(&self, buf: &mut BytesMut) {
        match self {
            Request::Open { path, mode, attrs } => {
                write_string(buf, path);
                buf.put_u32(mode.bits());
                attrs.encode(buf);
            }
            Request::Close { handle }
            | Request::Fstat { handle }
            | Request::Readdir { handle } => write_bytes(buf, handle),
            Request::Read {
                handle,
                offset,
                len,
            } => {
                write_bytes(buf, handle);
                buf.put_u64(*offset);
                buf.put_u32(*len);
            }
            Request::Write {
                handle,
                offset,
                data,
            } => {
                write_bytes(buf, handle);
                buf.put_u64(*offset);
                write_bytes(buf, data);
            }
            Request::Lstat { path }
            | Request::Opendir { path }
            | Request::Remove { path }
            | Request::Rmdir { path }
            | Request::Realpath { path }
            | Request::Stat { path }
            | Request::Readlink { path } => write_string(buf, path),
            Request::Setstat { path, attrs } | Request::Mkdir { path, attrs } => {
                write_string(buf, path);
                attrs.encode(buf);
            }
            Request::Fsetstat { handle, attrs } => {
                write_bytes(buf, handle);
                attrs.encode(buf);
            }
            Request::Rename { old_path, new_path } => {
                write_string(buf, old_path);
                write_string(buf, new_path);
            }
            Request::Symlink { target, link } => {
                write_string(buf, target);
                write_string(buf, link);
            }
        }
    }

    fn decode_fields(kind: SftpMessageType, data: &[u8], offset: &mut usize) -> FerryResult<Self> {
        let request = match kind {
            SftpMessageType::Open => Request::Open {
                path: read_string(data, offset)?,
                mode: OpenMode::from_bits(read_u32(data, offset)?),
                attrs: FileAttributes::decode(data, offset)?,
            },
            SftpMessageType::Close => Request::Close {
                handle: read_bytes(data, offset)?,
            },
            SftpMessageType::Read => Request::Read {
                handle: read_bytes(data, offset)?,
                offset: read_u64(data, offset)?,
                len: read_u32(data, offset)?,
            },
            SftpMessageType::Write => Request::Write {
                handle: read_bytes(data, offset)?,
                offset: read_u64(data, offset)?,
                data: read_bytes(data, offset)?,
            },
            SftpMessageType::LStat => Request::Lstat {
                path: read_string(data, offset)?,
            },
            SftpMessageType::FStat => Request::Fstat {
                handle: read_bytes(data, offset)?,
            },
            SftpMessageType::SetStat => Request::Setstat {
                path: read_string(data, offset)?,
                attrs: FileAttributes::decode(data, offset)?,
            },
            SftpMessageType::FSetStat => Request::Fsetstat {
                handle: read_bytes(data, offset)?,
                attrs: FileAttributes::decode(data, offset)?,
            },
            SftpMessageType::OpenDir => Request::Opendir {
                path: read_string(data, offset)?,
            },
            SftpMessageType::ReadDir => Request::Readdir {
                handle: read_bytes(data, offset)?,
            },
            SftpMessageType::Remove => Request::Remove {
                path: read_string(data, offset)?,
            },
            SftpMessageType::MkDir => Request::Mkdir {
                path: read_string(data, offset)?,
                attrs: FileAttributes::decode(data, offset)?,
            },
            SftpMessageType::RmDir => Request::Rmdir {
                path: read_string(data, offset)?,
            },
            SftpMessageType::RealPath => Request::Realpath {
                path: read_string(data, offset)?,
            },
            SftpMessageType::Stat => Request::Stat {
                path: read_string(data, offset)?,
            },
            SftpMessageType::Rename => Request::Rename {
                old_path: read_string(data, offset)?,
                new_path: read_string(data, offset)?,
            },
            SftpMessageType::ReadLink => Request::Readlink {
                path: read_string(data, offset)?,
            },
            SftpMessageType::Symlink => Request::Symlink {
                target: read_string(data, offset)?,
                link: read_string(data, offset)?,
            },
            other => {
                return Err(FerryError::Protocol(format!(
                    "{:?} is not a request",
                    other
                )))
            }
        };
        Ok(request)
    }
}

/// Server responses. Each names the request ID it answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// SSH_FXP_STATUS
    Status {
        /// SSH_FX_* code
        code: u32,
        /// Human-readable message
        message: String,
        /// Language tag
        language: String,
    },
    /// SSH_FXP_HANDLE
    Handle(Vec<u8>),
    /// SSH_FXP_DATA
    Data(Vec<u8>),
    /// SSH_FXP_NAME
    Name(Vec<DirEntry>),
    /// SSH_FXP_ATTRS
    Attrs(FileAttributes),
}

impl Response {
    /// SSH_FX_OK status.
    pub fn ok() -> Self {
        Self::status(0, "Success")
    }

    /// Status response with an English message.
    pub fn status(code: u32, message: &str) -> Self {
        Response::Status {
            code,
            message: message.to_string(),
            language: "en".to_string(),
        }
    }

    /// Message type of the response.
    pub fn message_type(&self) -> SftpMessageType {
        match self {
            Response::Status { .. } => SftpMessageType::Status,
            Response::Handle(_) => SftpMessageType::Handle,
            Response::Data(_) => SftpMessageType::Data,
            Response::Name(_) => SftpMessageType::Name,
            Response::Attrs(_) => SftpMessageType::Attrs,
        }
    }

    fn encode_fields(&self, buf: &mut BytesMut) {
        match self {
            Response::Status {
                code,
                message,
                language,
            } => {
                buf.put_u32(*code);
                write_string(buf, message);
                write_string(buf, language);
            }
            Response::Handle(handle) => write_bytes(buf, handle),
            Response::Data(data) => write_bytes(buf, data),
            Response::Name(entries) => {
                buf.put_u32(entries.len() as u32);
                for entry in entries {
                    write_string(buf, &entry.filename);
                    write_string(buf, &entry.longname);
                    entry.attrs.encode(buf);
                }
            }
            Response::Attrs(attrs) => attrs.encode(buf),
        }
    }

    fn decode_fields(kind: SftpMessageType, data: &[u8], offset: &mut usize) -> FerryResult<Self> {
        let response = match kind {
            SftpMessageType::Status => {
                let code = read_u32(data, offset)?;
                // Some v3 servers omit the message and language
                let message = if *offset < data.len() {
                    read_string(data, offset)?
                } else {
                    String::new()
                };
                let language = if *offset < data.len() {
                    read_string(data, offset)?
                } else {
                    String::new()
                };
                Response::Status {
                    code,
                    message,
                    language,
                }
            }
            SftpMessageType::Handle => Response::Handle(read_bytes(data, offset)?),
            SftpMessageType::Data => Response::Data(read_bytes(data, offset)?),
            SftpMessageType::Name => {
                let count = read_u32(data, offset)?;
                let mut entries = Vec::with_capacity(count.min(1024) as usize);
                for _ in 0..count {
                    entries.push(DirEntry {
                        filename: read_string(data, offset)?,
                        longname: read_string(data, offset)?,
                        attrs: FileAttributes::decode(data, offset)?,
                    });
                }
                Response::Name(entries)
            }
            SftpMessageType::Attrs => Response::Attrs(FileAttributes::decode(data, offset)?),
            other => {
                return Err(FerryError::Protocol(format!(
                    "{:?} is not a response",
                    other
                )))
            }
        };
        Ok(response)
    }
}

/// A decoded SFTP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SftpMessage {
    /// SSH_FXP_INIT
    Init {
        /// Client protocol version
        version: u32,
    },
    /// SSH_FXP_VERSION
    Version {
        /// Server protocol version
        version: u32,
        /// Extension (name, data) pairs
        extensions: Vec<(String, String)>,
    },
    /// A request with its ID.
    Request {
        /// Request ID
        id: u32,
        /// Request body
        request: Request,
    },
    /// A response with the ID it answers.
    Response {
        /// Request ID
        id: u32,
        /// Response body
        response: Response,
    },
}

/// Encodes a message as one complete frame.
///
/// ```rust
/// use ferry_proto::ssh::sftp::message::{encode_message, SftpMessage};
///
/// let frame = encode_message(&SftpMessage::Init { version: 3 });
/// assert_eq!(frame, vec![0, 0, 0, 5, 1, 0, 0, 0, 3]);
/// ```
pub fn encode_message(msg: &SftpMessage) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_u32(0);

    match msg {
        SftpMessage::Init { version } => {
            buf.put_u8(SftpMessageType::Init as u8);
            buf.put_u32(*version);
        }
        SftpMessage::Version {
            version,
            extensions,
        } => {
            buf.put_u8(SftpMessageType::Version as u8);
            buf.put_u32(*version);
            for (name, data) in extensions {
                write_string(&mut buf, name);
                write_string(&mut buf, data);
            }
        }
        SftpMessage::Request { id, request } => {
            buf.put_u8(request.message_type() as u8);
            buf.put_u32(*id);
            request.encode_fields(&mut buf);
        }
        SftpMessage::Response { id, response } => {
            buf.put_u8(response.message_type() as u8);
            buf.put_u32(*id);
            response.encode_fields(&mut buf);
        }
    }

    let length = (buf.len() - 4) as u32;
    buf[..4].copy_from_slice(&length.to_be_bytes());
    buf.to_vec()
}

/// Decodes one frame body (type byte and fields, without the length).
///
/// # Errors
///
/// - [`FerryError::UnsupportedOperation`] for an unknown type tag; use
///   [`request_id`] to find out which request it answered
/// - [`FerryError::Framing`] when a field runs past the end of the frame
pub fn decode_message(body: &[u8]) -> FerryResult<SftpMessage> {
    let mut offset = 0;
    let tag = read_u8(body, &mut offset)?;
    let kind = SftpMessageType::from_u8(tag).ok_or_else(|| {
        FerryError::UnsupportedOperation(format!("Unknown SFTP message type {}", tag))
    })?;

    let msg = match kind {
        SftpMessageType::Init => SftpMessage::Init {
            version: read_u32(body, &mut offset)?,
        },
        SftpMessageType::Version => {
            let version = read_u32(body, &mut offset)?;
            let mut extensions = Vec::new();
            while offset < body.len() {
                let name = read_string(body, &mut offset)?;
                let data = read_string(body, &mut offset)?;
                extensions.push((name, data));
            }
            SftpMessage::Version {
                version,
                extensions,
            }
        }
        SftpMessageType::Status
        | SftpMessageType::Handle
        | SftpMessageType::Data
        | SftpMessageType::Name
        | SftpMessageType::Attrs => {
            let id = read_u32(body, &mut offset)?;
            SftpMessage::Response {
                id,
                response: Response::decode_fields(kind, body, &mut offset)?,
            }
        }
        _ => {
            let id = read_u32(body, &mut offset)?;
            SftpMessage::Request {
                id,
                request: Request::decode_fields(kind, body, &mut offset)?,
            }
        }
    };
    Ok(msg)
}

/// Request ID of a frame body, if it carries one.
///
/// Works for unknown type tags too, which is how an unparsable response is
/// charged to the request it answered.
pub fn request_id(body: &[u8]) -> Option<u32> {
    match body.first().copied().and_then(SftpMessageType::from_u8) {
        Some(SftpMessageType::Init | SftpMessageType::Version) => None,
        _ => {
            let mut offset = 1;
            read_u32(body, &mut offset).ok()
        }
    }
}

/// Reassembles frames from a byte stream.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: BytesMut,
}

impl FrameBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends received bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes buffered but not yet returned.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Takes the next complete frame body, if one is buffered.
    ///
    /// # Errors
    ///
    /// [`FerryError::Framing`] for an empty or oversized frame.
    pub fn next_frame(&mut self) -> FerryResult<Option<Vec<u8>>> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let length = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if length == 0 || length > MAX_MESSAGE_LEN {
            return Err(FerryError::Framing(format!(
                "SFTP frame length {} out of range",
                length
            )));
        }
        if self.buf.len() < 4 + length {
            return Ok(None);
        }
        self.buf.advance(4);
        Ok(Some(self.buf.split_to(length).to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(msg: &SftpMessage) -> Vec<u8> {
        encode_message(msg)[4..].to_vec()
    }

    #[test]
    fn test_message_type_conversion() {
        assert_eq!(SftpMessageType::from_u8(1), Some(SftpMessageType::Init));
        assert_eq!(SftpMessageType::from_u8(101), Some(SftpMessageType::Status));
        assert_eq!(SftpMessageType::from_u8(255), None);
    }

    #[test]
    fn test_requests_decode_to_themselves() {
        let requests = vec![
            Request::Open {
                path: "/tmp/a".to_string(),
                mode: OpenMode::WRITE | OpenMode::CREATE,
                attrs: FileAttributes::with_permissions(0o644),
            },
            Request::Read {
                handle: b"h1".to_vec(),
                offset: 1 << 40,
                len: 32768,
            },
            Request::Write {
                handle: b"h1".to_vec(),
                offset: 7,
                data: vec![1, 2, 3],
            },
            Request::Rename {
                old_path: "a".to_string(),
                new_path: "b".to_string(),
            },
            Request::Symlink {
                target: "t".to_string(),
                link: "l".to_string(),
            },
        ];
        for (i, request) in requests.into_iter().enumerate() {
            let msg = SftpMessage::Request {
                id: i as u32,
                request,
            };
            assert_eq!(decode_message(&body(&msg)).unwrap(), msg);
        }
    }

    #[test]
    fn test_name_response() {
        let msg = SftpMessage::Response {
            id: 9,
            response: Response::Name(vec![DirEntry::new("x", FileAttributes::new())]),
        };
        assert_eq!(decode_message(&body(&msg)).unwrap(), msg);
    }

    #[test]
    fn test_status_without_message() {
        let raw = [101, 0, 0, 0, 4, 0, 0, 0, 1];
        match decode_message(&raw).unwrap() {
            SftpMessage::Response {
                id: 4,
                response: Response::Status { code, message, .. },
            } => {
                assert_eq!(code, 1);
                assert!(message.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_version_extensions() {
        let msg = SftpMessage::Version {
            version: 3,
            extensions: vec![("posix-rename@openssh.com".to_string(), "1".to_string())],
        };
        assert_eq!(decode_message(&body(&msg)).unwrap(), msg);
        assert_eq!(request_id(&body(&msg)), None);
    }

    #[test]
    fn test_unknown_type_keeps_request_id() {
        let raw = [150, 0, 0, 0, 42, 9, 9];
        assert!(matches!(
            decode_message(&raw),
            Err(FerryError::UnsupportedOperation(_))
        ));
        assert_eq!(request_id(&raw), Some(42));
    }

    #[test]
    fn test_truncated_fields() {
        let mut raw = body(&SftpMessage::Request {
            id: 1,
            request: Request::Stat {
                path: "/etc/passwd".to_string(),
            },
        });
        raw.truncate(raw.len() - 3);
        assert!(matches!(decode_message(&raw), Err(FerryError::Framing(_))));
    }

    #[test]
    fn test_frame_buffer_reassembles() {
        let a = encode_message(&SftpMessage::Init { version: 3 });
        let b = encode_message(&SftpMessage::Response {
            id: 1,
            response: Response::Data(vec![7; 100]),
        });
        let mut stream = a.clone();
        stream.extend_from_slice(&b);

        let mut frames = FrameBuffer::new();
        frames.extend(&stream[..3]);
        assert_eq!(frames.next_frame().unwrap(), None);
        frames.extend(&stream[3..20]);
        assert_eq!(frames.next_frame().unwrap(), Some(a[4..].to_vec()));
        assert_eq!(frames.next_frame().unwrap(), None);
        frames.extend(&stream[20..]);
        assert_eq!(frames.next_frame().unwrap(), Some(b[4..].to_vec()));
        assert_eq!(frames.buffered(), 0);
    }

    #[test]
    fn test_frame_buffer_rejects_oversize() {
        let mut frames = FrameBuffer::new();
        frames.extend(&((MAX_MESSAGE_LEN as u32) + 1).to_be_bytes());
        assert!(matches!(frames.next_frame(), Err(FerryError::Framing(_))));
    }
}
