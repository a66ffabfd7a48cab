//! SFTP data types and structures.

use crate::ssh::wire::{read_string, read_u32, read_u64};
use bytes::{BufMut, BytesMut};
use ferry_platform::{FerryError, FerryResult};
use std::fmt;

/// SFTP status codes (SSH_FX_*).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum StatusCode {
    /// SSH_FX_OK - Success
    Ok = 0,
    /// SSH_FX_EOF - End of file
    Eof = 1,
    /// SSH_FX_NO_SUCH_FILE - No such file
    NoSuchFile = 2,
    /// SSH_FX_PERMISSION_DENIED - Permission denied
    PermissionDenied = 3,
    /// SSH_FX_FAILURE - General failure
    Failure = 4,
    /// SSH_FX_BAD_MESSAGE - Bad message
    BadMessage = 5,
    /// SSH_FX_NO_CONNECTION - No connection
    NoConnection = 6,
    /// SSH_FX_CONNECTION_LOST - Connection lost
    ConnectionLost = 7,
    /// SSH_FX_OP_UNSUPPORTED - Operation not supported
    OpUnsupported = 8,
}

impl StatusCode {
    /// Convert from u32.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Ok),
            1 => Some(Self::Eof),
            2 => Some(Self::NoSuchFile),
            3 => Some(Self::PermissionDenied),
            4 => Some(Self::Failure),
            5 => Some(Self::BadMessage),
            6 => Some(Self::NoConnection),
            7 => Some(Self::ConnectionLost),
            8 => Some(Self::OpUnsupported),
            _ => None,
        }
    }

    /// Default message for the code.
    pub fn message(&self) -> &'static str {
        match self {
            Self::Ok => "Success",
            Self::Eof => "End of file",
            Self::NoSuchFile => "No such file or directory",
            Self::PermissionDenied => "Permission denied",
            Self::Failure => "Failure",
            Self::BadMessage => "Bad message",
            Self::NoConnection => "No connection",
            Self::ConnectionLost => "Connection lost",
            Self::OpUnsupported => "Operation not supported",
        }
    }

    /// Status code describing `err`, for the server side.
    pub fn for_error(err: &FerryError) -> Self {
        err.sftp_status_code()
            .and_then(Self::from_u32)
            .unwrap_or(Self::Failure)
    }

    /// Status code for a local filesystem error.
    pub fn for_io(err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NoSuchFile,
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied,
            std::io::ErrorKind::Unsupported => Self::OpUnsupported,
            _ => Self::Failure,
        }
    }
}

/// Converts a non-OK status into the matching error.
///
/// `context` names what the request was about (usually a path) and is used
/// when the server sends no message.
///
/// ```rust
/// use ferry_platform::FerryError;
/// use ferry_proto::ssh::sftp::types::status_error;
///
/// assert!(matches!(status_error(2, "", "/missing"), FerryError::NoSuchFile(p) if p == "/missing"));
/// assert!(matches!(status_error(1, "", ""), FerryError::Eof));
/// assert!(matches!(status_error(4, "boom", ""), FerryError::SftpStatus { code: 4, .. }));
/// ```
pub fn status_error(code: u32, message: &str, context: &str) -> FerryError {
    let detail = if context.is_empty() {
        message.to_string()
    } else {
        context.to_string()
    };
    match StatusCode::from_u32(code) {
        Some(StatusCode::Eof) => FerryError::Eof,
        Some(StatusCode::NoSuchFile) => FerryError::NoSuchFile(detail),
        Some(StatusCode::PermissionDenied) => FerryError::PermissionDenied(detail),
        Some(StatusCode::OpUnsupported) => FerryError::OpUnsupported(detail),
        _ => FerryError::SftpStatus {
            code,
            message: message.to_string(),
        },
    }
}

/// File open flags (SSH_FXF_*).
///
/// ```rust
/// use ferry_proto::ssh::sftp::OpenMode;
///
/// let mode: OpenMode = "w".parse().unwrap();
/// assert_eq!(mode, OpenMode::WRITE | OpenMode::CREATE | OpenMode::TRUNCATE);
/// assert!(mode.is_write());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenMode(u32);

impl OpenMode {
    /// SSH_FXF_READ - Open for reading
    pub const READ: Self = Self(0x0000_0001);
    /// SSH_FXF_WRITE - Open for writing
    pub const WRITE: Self = Self(0x0000_0002);
    /// SSH_FXF_APPEND - Force writes to append
    pub const APPEND: Self = Self(0x0000_0004);
    /// SSH_FXF_CREAT - Create if doesn't exist
    pub const CREATE: Self = Self(0x0000_0008);
    /// SSH_FXF_TRUNC - Truncate to 0 length
    pub const TRUNCATE: Self = Self(0x0000_0010);
    /// SSH_FXF_EXCL - Fail if file exists
    pub const EXCLUSIVE: Self = Self(0x0000_0020);

    /// Wraps raw pflags.
    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw pflags.
    pub fn bits(&self) -> u32 {
        self.0
    }

    /// Whether every flag in `other` is set.
    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether the mode reads.
    pub fn is_read(&self) -> bool {
        self.contains(Self::READ)
    }

    /// Whether the mode writes.
    pub fn is_write(&self) -> bool {
        self.contains(Self::WRITE) || self.contains(Self::APPEND)
    }
}

impl std::ops::BitOr for OpenMode {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for OpenMode {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Parses fopen-style modes: `r`, `w`, `a`, `x`, optionally with `+`.
/// A `b` anywhere is ignored.
impl std::str::FromStr for OpenMode {
    type Err = FerryError;

    fn from_str(s: &str) -> FerryResult<Self> {
        let mode: String = s.chars().filter(|&c| c != 'b').collect();
        let (base, plus) = match mode.strip_suffix('+') {
            Some(base) => (base, true),
            None => (mode.as_str(), false),
        };

        let mut flags = match base {
            "r" => Self::READ,
            "w" => Self::WRITE | Self::CREATE | Self::TRUNCATE,
            "a" => Self::WRITE | Self::APPEND | Self::CREATE,
            "x" => Self::WRITE | Self::CREATE | Self::EXCLUSIVE,
            _ => {
                return Err(FerryError::Config(format!("Invalid open mode '{}'", s)));
            }
        };
        if plus {
            flags |= Self::READ | Self::WRITE;
        }
        Ok(flags)
    }
}

/// File type, from the permission bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// Regular file
    Regular,
    /// Directory
    Directory,
    /// Symbolic link
    Symlink,
    /// Special file
    Special,
    /// Unknown type
    Unknown,
}

const S_IFMT: u32 = 0o170000;
const S_IFREG: u32 = 0o100000;
const S_IFDIR: u32 = 0o040000;
const S_IFLNK: u32 = 0o120000;

/// File attribute flags.
#[derive(Debug, Clone, Copy)]
pub struct AttrFlags;

impl AttrFlags {
    /// SSH_FILEXFER_ATTR_SIZE
    pub const SIZE: u32 = 0x0000_0001;
    /// SSH_FILEXFER_ATTR_UIDGID
    pub const UIDGID: u32 = 0x0000_0002;
    /// SSH_FILEXFER_ATTR_PERMISSIONS
    pub const PERMISSIONS: u32 = 0x0000_0004;
    /// SSH_FILEXFER_ATTR_ACMODTIME
    pub const ACMODTIME: u32 = 0x0000_0008;
    /// SSH_FILEXFER_ATTR_EXTENDED
    pub const EXTENDED: u32 = 0x8000_0000;
}

/// File attributes (ATTRS).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileAttributes {
    /// File size in bytes
    pub size: Option<u64>,
    /// User ID
    pub uid: Option<u32>,
    /// Group ID
    pub gid: Option<u32>,
    /// Permission and file type bits
    pub permissions: Option<u32>,
    /// Access time (Unix timestamp)
    pub atime: Option<u32>,
    /// Modification time (Unix timestamp)
    pub mtime: Option<u32>,
    /// Extended attributes (type, data)
    pub extended: Vec<(String, String)>,
}

impl FileAttributes {
    /// Creates empty attributes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attributes carrying only permissions.
    pub fn with_permissions(mode: u32) -> Self {
        Self {
            permissions: Some(mode),
            ..Self::default()
        }
    }

    /// File type from the permission bits.
    pub fn file_type(&self) -> FileType {
        match self.permissions.map(|p| p & S_IFMT) {
            Some(S_IFREG) => FileType::Regular,
            Some(S_IFDIR) => FileType::Directory,
            Some(S_IFLNK) => FileType::Symlink,
            Some(0) | None => FileType::Unknown,
            Some(_) => FileType::Special,
        }
    }

    /// Whether this is a directory.
    pub fn is_dir(&self) -> bool {
        self.file_type() == FileType::Directory
    }

    /// Whether this is a regular file.
    pub fn is_file(&self) -> bool {
        self.file_type() == FileType::Regular
    }

    /// Whether this is a symbolic link.
    pub fn is_symlink(&self) -> bool {
        self.file_type() == FileType::Symlink
    }

    /// Attributes of a local file.
    pub fn from_metadata(metadata: &std::fs::Metadata) -> Self {
        let seconds = |time: std::io::Result<std::time::SystemTime>| {
            time.ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs().min(u64::from(u32::MAX)) as u32)
        };

        let mut attrs = Self {
            size: Some(metadata.len()),
            atime: seconds(metadata.accessed()),
            mtime: seconds(metadata.modified()),
            ..Self::default()
        };

        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            attrs.uid = Some(metadata.uid());
            attrs.gid = Some(metadata.gid());
            attrs.permissions = Some(metadata.mode());
        }
        #[cfg(not(unix))]
        {
            let kind = if metadata.is_dir() {
                S_IFDIR | 0o755
            } else if metadata.file_type().is_symlink() {
                S_IFLNK | 0o777
            } else {
                S_IFREG | if metadata.permissions().readonly() { 0o444 } else { 0o644 }
            };
            attrs.permissions = Some(kind);
        }
        // Times are only meaningful as a pair
        if attrs.atime.is_none() || attrs.mtime.is_none() {
            attrs.atime = None;
            attrs.mtime = None;
        }
        attrs
    }

    /// Appends the wire encoding.
    pub fn encode(&self, buf: &mut BytesMut) {
        let mut flags = 0u32;
        if self.size.is_some() {
            flags |= AttrFlags::SIZE;
        }
        if self.uid.is_some() && self.gid.is_some() {
            flags |= AttrFlags::UIDGID;
        }
        if self.permissions.is_some() {
            flags |= AttrFlags::PERMISSIONS;
        }
        if self.atime.is_some() && self.mtime.is_some() {
            flags |= AttrFlags::ACMODTIME;
        }
        if !self.extended.is_empty() {
            flags |= AttrFlags::EXTENDED;
        }

        buf.put_u32(flags);
        if let Some(size) = self.size {
            buf.put_u64(size);
        }
        if let (Some(uid), Some(gid)) = (self.uid, self.gid) {
            buf.put_u32(uid);
            buf.put_u32(gid);
        }
        if let Some(permissions) = self.permissions {
            buf.put_u32(permissions);
        }
        if let (Some(atime), Some(mtime)) = (self.atime, self.mtime) {
            buf.put_u32(atime);
            buf.put_u32(mtime);
        }
        if !self.extended.is_empty() {
            buf.put_u32(self.extended.len() as u32);
            for (kind, data) in &self.extended {
                crate::ssh::wire::write_string(buf, kind);
                crate::ssh::wire::write_string(buf, data);
            }
        }
    }

    /// Reads the wire encoding at `offset`.
    pub fn decode(data: &[u8], offset: &mut usize) -> FerryResult<Self> {
        let flags = read_u32(data, offset)?;
        let mut attrs = Self::new();

        if flags & AttrFlags::SIZE != 0 {
            attrs.size = Some(read_u64(data, offset)?);
        }
        if flags & AttrFlags::UIDGID != 0 {
            attrs.uid = Some(read_u32(data, offset)?);
            attrs.gid = Some(read_u32(data, offset)?);
        }
        if flags & AttrFlags::PERMISSIONS != 0 {
            attrs.permissions = Some(read_u32(data, offset)?);
        }
        if flags & AttrFlags::ACMODTIME != 0 {
            attrs.atime = Some(read_u32(data, offset)?);
            attrs.mtime = Some(read_u32(data, offset)?);
        }
        if flags & AttrFlags::EXTENDED != 0 {
            let count = read_u32(data, offset)?;
            for _ in 0..count {
                let kind = read_string(data, offset)?;
                let value = read_string(data, offset)?;
                attrs.extended.push((kind, value));
            }
        }
        Ok(attrs)
    }
}

/// One entry of a NAME response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// File name (a full path for REALPATH and READLINK)
    pub filename: String,
    /// `ls -l` style line
    pub longname: String,
    /// Attributes
    pub attrs: FileAttributes,
}

impl DirEntry {
    /// Builds an entry with an `ls -l` style long name.
    pub fn new(filename: impl Into<String>, attrs: FileAttributes) -> Self {
        let filename = filename.into();
        let longname = long_name(&filename, &attrs);
        Self {
            filename,
            longname,
            attrs,
        }
    }
}

impl fmt::Display for DirEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.longname)
    }
}

fn long_name(filename: &str, attrs: &FileAttributes) -> String {
    let mode = attrs.permissions.unwrap_or(0);
    let kind = match attrs.file_type() {
        FileType::Directory => 'd',
        FileType::Symlink => 'l',
        FileType::Regular | FileType::Unknown => '-',
        FileType::Special => '?',
    };
    let mut perms = String::with_capacity(10);
    perms.push(kind);
    for shift in [6, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        perms.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        perms.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        perms.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    format!(
        "{} 1 {:<8} {:<8} {:>8} {}",
        perms,
        attrs.uid.unwrap_or(0),
        attrs.gid.unwrap_or(0),
        attrs.size.unwrap_or(0),
        filename
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_conversion() {
        assert_eq!(StatusCode::from_u32(0), Some(StatusCode::Ok));
        assert_eq!(StatusCode::from_u32(2), Some(StatusCode::NoSuchFile));
        assert_eq!(StatusCode::from_u32(999), None);
    }

    #[test]
    fn test_status_error_mapping() {
        assert!(matches!(status_error(3, "nope", "/etc"), FerryError::PermissionDenied(p) if p == "/etc"));
        assert!(matches!(status_error(8, "no", ""), FerryError::OpUnsupported(m) if m == "no"));
        match status_error(42, "strange", "/x") {
            FerryError::SftpStatus { code, message } => {
                assert_eq!(code, 42);
                assert_eq!(message, "strange");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_status_for_error_and_io() {
        assert_eq!(StatusCode::for_error(&FerryError::Eof), StatusCode::Eof);
        assert_eq!(StatusCode::for_error(&FerryError::Timeout("x".into())), StatusCode::Failure);
        let io = std::io::Error::from(std::io::ErrorKind::NotFound);
        assert_eq!(StatusCode::for_io(&io), StatusCode::NoSuchFile);
    }

    #[test]
    fn test_open_mode_parse() {
        assert_eq!("r".parse::<OpenMode>().unwrap(), OpenMode::READ);
        assert_eq!("rb".parse::<OpenMode>().unwrap(), OpenMode::READ);
        assert_eq!(
            "a+".parse::<OpenMode>().unwrap(),
            OpenMode::READ | OpenMode::WRITE | OpenMode::APPEND | OpenMode::CREATE
        );
        assert_eq!(
            "r+".parse::<OpenMode>().unwrap(),
            OpenMode::READ | OpenMode::WRITE
        );
        assert!("q".parse::<OpenMode>().is_err());
        assert!(!"r".parse::<OpenMode>().unwrap().is_write());
    }

    #[test]
    fn test_attributes_with_every_field() {
        let attrs = FileAttributes {
            size: Some(1024),
            uid: Some(1000),
            gid: Some(100),
            permissions: Some(S_IFREG | 0o644),
            atime: Some(1_700_000_000),
            mtime: Some(1_700_000_001),
            extended: vec![("user@example.com".to_string(), "v".to_string())],
        };
        let mut buf = BytesMut::new();
        attrs.encode(&mut buf);

        let mut offset = 0;
        assert_eq!(FileAttributes::decode(&buf, &mut offset).unwrap(), attrs);
        assert_eq!(offset, buf.len());
        assert!(attrs.is_file());
    }

    #[test]
    fn test_attributes_truncated() {
        let mut buf = BytesMut::new();
        FileAttributes {
            size: Some(1),
            ..FileAttributes::default()
        }
        .encode(&mut buf);
        let mut offset = 0;
        assert!(matches!(
            FileAttributes::decode(&buf[..8], &mut offset),
            Err(FerryError::Framing(_))
        ));
    }

    #[test]
    fn test_file_type_and_long_name() {
        let entry = DirEntry::new(
            "docs",
            FileAttributes {
                permissions: Some(S_IFDIR | 0o755),
                size: Some(4096),
                ..FileAttributes::default()
            },
        );
        assert!(entry.attrs.is_dir());
        assert!(entry.longname.starts_with("drwxr-xr-x"));
        assert!(entry.longname.ends_with(" docs"));
        assert_eq!(FileAttributes::new().file_type(), FileType::Unknown);
        assert_eq!(
            FileAttributes::with_permissions(0o020644).file_type(),
            FileType::Special
        );
    }
}
