//! SSH protocol version exchange (RFC 4253 Section 4.2).
//!
//! Both sides open the connection by sending an identification string:
//!
//! ```text
//! SSH-protoversion-softwareversion SP comments CR LF
//! ```
//!
//! A server may send other lines before its identification string; those are
//! skipped (up to [`MAX_PRE_BANNER_LINES`]). Any protocol version other than
//! `2.0` or `1.99` ends the exchange with
//! [`FerryError::IncompatibleVersion`].
//!
//! # Example
//!
//! ```rust
//! use ferry_proto::ssh::version::Version;
//!
//! let version = Version::new("Ferry_0.1.0", Some("sftp"));
//! assert_eq!(version.to_string(), "SSH-2.0-Ferry_0.1.0 sftp");
//!
//! let parsed = Version::parse("SSH-2.0-OpenSSH_8.9").unwrap();
//! assert_eq!(parsed.software(), "OpenSSH_8.9");
//! ```

use ferry_platform::{FerryError, FerryResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Maximum length of an identification line, CR LF included.
pub const MAX_VERSION_LENGTH: usize = 255;

/// Maximum number of non-identification lines accepted before the banner.
pub const MAX_PRE_BANNER_LINES: usize = 32;

/// SSH protocol version string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    proto_version: String,
    software_version: String,
    comments: Option<String>,
}

impl Version {
    /// Creates a version string with protocol version "2.0".
    pub fn new(software: &str, comments: Option<&str>) -> Self {
        Self {
            proto_version: "2.0".to_string(),
            software_version: software.to_string(),
            comments: comments.map(String::from),
        }
    }

    /// Returns the default Ferry identification.
    ///
    /// ```rust
    /// use ferry_proto::ssh::version::Version;
    ///
    /// assert!(Version::default_ferry().to_string().starts_with("SSH-2.0-Ferry_"));
    /// ```
    pub fn default_ferry() -> Self {
        Self::new(&format!("Ferry_{}", env!("CARGO_PKG_VERSION")), None)
    }

    /// Parses an identification line (with or without CR LF).
    ///
    /// # Errors
    ///
    /// - [`FerryError::Protocol`] for malformed lines (too long, null bytes,
    ///   missing `SSH-` prefix or software version).
    /// - [`FerryError::IncompatibleVersion`] when the protocol version is not
    ///   `2.0` or `1.99`.
    pub fn parse(line: &str) -> FerryResult<Self> {
        let line = line.trim_end_matches("\r\n").trim_end_matches('\n');

        if line.len() > MAX_VERSION_LENGTH {
            return Err(FerryError::Protocol(format!(
                "Version string too long: {} bytes (max {})",
                line.len(),
                MAX_VERSION_LENGTH
            )));
        }

        if line.contains('\0') {
            return Err(FerryError::Protocol(
                "Version string contains null byte".to_string(),
            ));
        }

        if !line.starts_with("SSH-") {
            return Err(FerryError::Protocol(format!(
                "Invalid version string: must start with 'SSH-', got '{}'",
                line
            )));
        }

        let parts: Vec<&str> = line.splitn(3, '-').collect();
        if parts.len() < 3 || parts[2].is_empty() {
            return Err(FerryError::Protocol(format!(
                "Invalid version string format: '{}'",
                line
            )));
        }

        let proto_version = parts[1];
        if proto_version != "2.0" && proto_version != "1.99" {
            return Err(FerryError::IncompatibleVersion(format!(
                "peer speaks protocol '{}' (expected '2.0' or '1.99')",
                proto_version
            )));
        }

        let rest = parts[2];
        let (software_version, comments) = match rest.find(' ') {
            Some(space_pos) => (
                rest[..space_pos].to_string(),
                Some(rest[space_pos + 1..].trim().to_string()),
            ),
            None => (rest.to_string(), None),
        };

        Ok(Self {
            proto_version: proto_version.to_string(),
            software_version,
            comments,
        })
    }

    /// Returns the protocol version (e.g. "2.0").
    pub fn proto_version(&self) -> &str {
        &self.proto_version
    }

    /// Returns the software version.
    pub fn software(&self) -> &str {
        &self.software_version
    }

    /// Returns the comments, if any.
    pub fn comments(&self) -> Option<&str> {
        self.comments.as_deref()
    }

    /// Converts to wire format (with CR LF).
    pub fn to_wire_format(&self) -> String {
        format!("{}\r\n", self)
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SSH-{}-{}", self.proto_version, self.software_version)?;
        if let Some(comments) = &self.comments {
            write!(f, " {}", comments)?;
        }
        Ok(())
    }
}

/// Sends the local identification line.
pub async fn send_version<W>(writer: &mut W, version: &Version) -> FerryResult<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer
        .write_all(version.to_wire_format().as_bytes())
        .await
        .map_err(FerryError::from_stream_io)?;
    writer.flush().await.map_err(FerryError::from_stream_io)?;
    Ok(())
}

/// Reads the peer's identification line.
///
/// Returns the parsed version together with the exact line (without CR LF),
/// which feeds the exchange hash. Reads one byte at a time so no binary
/// packet data is consumed past the line.
pub async fn read_version<R>(reader: &mut R) -> FerryResult<(Version, String)>
where
    R: AsyncRead + Unpin + ?Sized,
{
    for _ in 0..=MAX_PRE_BANNER_LINES {
        let line = read_line(reader).await?;
        if line.starts_with("SSH-") {
            let version = Version::parse(&line)?;
            return Ok((version, line));
        }
        debug!(line = %line, "Skipping pre-banner line");
    }

    Err(FerryError::Protocol(format!(
        "No identification string within {} lines",
        MAX_PRE_BANNER_LINES
    )))
}

async fn read_line<R>(reader: &mut R) -> FerryResult<String>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut line = Vec::with_capacity(64);

    loop {
        let byte = reader.read_u8().await.map_err(FerryError::from_stream_io)?;
        if byte == b'\n' {
            break;
        }
        line.push(byte);
        if line.len() > MAX_VERSION_LENGTH {
            return Err(FerryError::Protocol(format!(
                "Identification line exceeds {} bytes",
                MAX_VERSION_LENGTH
            )));
        }
    }

    if line.last() == Some(&b'\r') {
        line.pop();
    }

    String::from_utf8(line)
        .map_err(|_| FerryError::Protocol("Identification line is not UTF-8".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_comments() {
        let version = Version::parse("SSH-2.0-OpenSSH_9.6 Ubuntu-3ubuntu13\r\n").unwrap();
        assert_eq!(version.proto_version(), "2.0");
        assert_eq!(version.software(), "OpenSSH_9.6");
        assert_eq!(version.comments(), Some("Ubuntu-3ubuntu13"));
    }

    #[test]
    fn test_parse_199_accepted() {
        let version = Version::parse("SSH-1.99-Legacy_1.0").unwrap();
        assert_eq!(version.proto_version(), "1.99");
    }

    #[test]
    fn test_incompatible_major_version() {
        let result = Version::parse("SSH-1.5-OldServer");
        assert!(matches!(result, Err(FerryError::IncompatibleVersion(_))));

        let result = Version::parse("SSH-3.0-Future");
        assert!(matches!(result, Err(FerryError::IncompatibleVersion(_))));
    }

    #[test]
    fn test_malformed_lines() {
        assert!(matches!(
            Version::parse("HTTP/1.1 200 OK"),
            Err(FerryError::Protocol(_))
        ));
        assert!(matches!(
            Version::parse("SSH-2.0-"),
            Err(FerryError::Protocol(_))
        ));
        let long = format!("SSH-2.0-{}", "x".repeat(300));
        assert!(matches!(Version::parse(&long), Err(FerryError::Protocol(_))));
    }

    #[test]
    fn test_display_roundtrip() {
        let version = Version::new("Ferry_0.1.0", None);
        assert_eq!(version.to_wire_format(), "SSH-2.0-Ferry_0.1.0\r\n");
        assert_eq!(Version::parse(&version.to_wire_format()).unwrap(), version);
    }

    #[tokio::test]
    async fn test_read_version_skips_preamble() {
        let input: &[u8] = b"Welcome to the server\r\nSSH-2.0-TestServer_1.0\r\n\x00\x00\x00\x0c";
        let mut reader = input;

        let (version, line) = read_version(&mut reader).await.unwrap();
        assert_eq!(version.software(), "TestServer_1.0");
        assert_eq!(line, "SSH-2.0-TestServer_1.0");
        // Binary data after the banner must be left unread
        assert_eq!(reader, b"\x00\x00\x00\x0c");
    }

    #[tokio::test]
    async fn test_read_version_eof_is_session_closed() {
        let mut reader: &[u8] = b"SSH-2.0-trunc";
        let result = read_version(&mut reader).await;
        assert!(matches!(result, Err(FerryError::SessionClosed)));
    }
}
