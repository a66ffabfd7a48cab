//! SSH data type encoding (RFC 4251 Section 5).
//!
//! Writers append to a `BytesMut`; readers walk a byte slice with an explicit
//! offset and fail with [`FerryError::Framing`] when a field runs past the
//! end of the buffer.

use bytes::{BufMut, BytesMut};
use ferry_platform::{FerryError, FerryResult};

/// Writes a `string` from UTF-8 text.
pub fn write_string(buf: &mut BytesMut, s: &str) {
    write_bytes(buf, s.as_bytes());
}

/// Writes a `string` from raw bytes.
pub fn write_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
}

/// Writes a `boolean`.
pub fn write_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(u8::from(value));
}

/// Writes a `name-list`.
pub fn write_name_list(buf: &mut BytesMut, names: &[String]) {
    write_string(buf, &names.join(","));
}

/// Writes an `mpint` from an unsigned big-endian magnitude.
pub fn write_mpint(buf: &mut BytesMut, magnitude: &[u8]) {
    write_bytes(buf, &encode_mpint(magnitude));
}

/// Encodes an unsigned big-endian magnitude as the body of an `mpint`.
///
/// Leading zeros are stripped and a zero byte is prepended when the high bit
/// is set, so the value is never read back as negative.
pub fn encode_mpint(magnitude: &[u8]) -> Vec<u8> {
    let start = magnitude
        .iter()
        .position(|&b| b != 0)
        .unwrap_or(magnitude.len());
    let trimmed = &magnitude[start..];

    if trimmed.is_empty() {
        return Vec::new();
    }

    let mut out = Vec::with_capacity(trimmed.len() + 1);
    if trimmed[0] & 0x80 != 0 {
        out.push(0);
    }
    out.extend_from_slice(trimmed);
    out
}

fn ensure(data: &[u8], offset: usize, needed: usize, what: &str) -> FerryResult<()> {
    if offset.checked_add(needed).map_or(true, |end| end > data.len()) {
        return Err(FerryError::Framing(format!(
            "Cannot read {} at offset {} ({} bytes available)",
            what,
            offset,
            data.len().saturating_sub(offset)
        )));
    }
    Ok(())
}

/// Reads a `byte`.
pub fn read_u8(data: &[u8], offset: &mut usize) -> FerryResult<u8> {
    ensure(data, *offset, 1, "byte")?;
    let value = data[*offset];
    *offset += 1;
    Ok(value)
}

/// Reads a `boolean`.
pub fn read_bool(data: &[u8], offset: &mut usize) -> FerryResult<bool> {
    Ok(read_u8(data, offset)? != 0)
}

/// Reads a `uint32`.
pub fn read_u32(data: &[u8], offset: &mut usize) -> FerryResult<u32> {
    ensure(data, *offset, 4, "uint32")?;
    let value = u32::from_be_bytes([
        data[*offset],
        data[*offset + 1],
        data[*offset + 2],
        data[*offset + 3],
    ]);
    *offset += 4;
    Ok(value)
}

/// Reads a `uint64`.
pub fn read_u64(data: &[u8], offset: &mut usize) -> FerryResult<u64> {
    ensure(data, *offset, 8, "uint64")?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&data[*offset..*offset + 8]);
    *offset += 8;
    Ok(u64::from_be_bytes(raw))
}

/// Reads a `string` as raw bytes.
pub fn read_bytes(data: &[u8], offset: &mut usize) -> FerryResult<Vec<u8>> {
    let length = read_u32(data, offset)? as usize;
    ensure(data, *offset, length, "string body")?;
    let value = data[*offset..*offset + length].to_vec();
    *offset += length;
    Ok(value)
}

/// Reads a `string` as UTF-8 text.
pub fn read_string(data: &[u8], offset: &mut usize) -> FerryResult<String> {
    let bytes = read_bytes(data, offset)?;
    String::from_utf8(bytes)
        .map_err(|_| FerryError::Framing("String contains invalid UTF-8".to_string()))
}

/// Reads a `name-list`.
pub fn read_name_list(data: &[u8], offset: &mut usize) -> FerryResult<Vec<String>> {
    let joined = read_string(data, offset)?;
    if joined.is_empty() {
        return Ok(Vec::new());
    }
    Ok(joined.split(',').map(str::to_string).collect())
}

/// Reads `n` raw bytes without a length prefix.
pub fn read_raw(data: &[u8], offset: &mut usize, n: usize) -> FerryResult<Vec<u8>> {
    ensure(data, *offset, n, "raw bytes")?;
    let value = data[*offset..*offset + n].to_vec();
    *offset += n;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_roundtrip() {
        let mut buf = BytesMut::new();
        write_string(&mut buf, "ssh-userauth");
        write_u32_then_bool(&mut buf);

        let mut offset = 0;
        assert_eq!(read_string(&buf, &mut offset).unwrap(), "ssh-userauth");
        assert_eq!(read_u32(&buf, &mut offset).unwrap(), 7);
        assert!(read_bool(&buf, &mut offset).unwrap());
        assert_eq!(offset, buf.len());
    }

    fn write_u32_then_bool(buf: &mut BytesMut) {
        buf.put_u32(7);
        write_bool(buf, true);
    }

    #[test]
    fn test_truncated_string_is_framing_error() {
        let data = [0, 0, 0, 10, b'a', b'b'];
        let mut offset = 0;
        assert!(matches!(
            read_bytes(&data, &mut offset),
            Err(FerryError::Framing(_))
        ));
    }

    #[test]
    fn test_huge_length_does_not_overflow() {
        let data = [0xFF, 0xFF, 0xFF, 0xFF];
        let mut offset = 0;
        assert!(read_bytes(&data, &mut offset).is_err());
    }

    #[test]
    fn test_name_list() {
        let mut buf = BytesMut::new();
        write_name_list(&mut buf, &["aes256-ctr".to_string(), "aes128-ctr".to_string()]);
        write_name_list(&mut buf, &[]);

        let mut offset = 0;
        assert_eq!(
            read_name_list(&buf, &mut offset).unwrap(),
            vec!["aes256-ctr", "aes128-ctr"]
        );
        assert!(read_name_list(&buf, &mut offset).unwrap().is_empty());
    }

    #[test]
    fn test_mpint_encoding() {
        // RFC 4251 Section 5 examples
        assert_eq!(encode_mpint(&[0x00]), Vec::<u8>::new());
        assert_eq!(encode_mpint(&[0x00, 0x80]), vec![0x00, 0x80]);
        assert_eq!(
            encode_mpint(&[0x09, 0xa3, 0x78, 0xf9, 0xb2, 0xe3, 0x32, 0xa7]),
            vec![0x09, 0xa3, 0x78, 0xf9, 0xb2, 0xe3, 0x32, 0xa7]
        );
    }
}
