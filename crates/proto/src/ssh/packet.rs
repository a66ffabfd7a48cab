//! SSH binary packet protocol (RFC 4253 Section 6).
//!
//! # Packet Format
//!
//! ```text
//! uint32    packet_length
//! byte      padding_length
//! byte[n1]  payload (n1 = packet_length - padding_length - 1)
//! byte[n2]  random padding (n2 = padding_length)
//! byte[m]   mac or AEAD tag
//! ```
//!
//! # Constraints
//!
//! - `padding_length` is at least 4
//! - `packet_length || padding_length || payload || padding` is a multiple of
//!   the cipher block size (AEAD ciphers leave `packet_length` out)
//! - `packet_length` never exceeds [`MAX_PACKET_SIZE`]
//!
//! Length, padding or alignment violations are [`FerryError::Framing`]; MAC
//! and tag failures are [`FerryError::Integrity`]. Both are fatal.
//!
//! # Example
//!
//! ```rust
//! use ferry_proto::ssh::crypto::{OpeningContext, SealingContext};
//! use ferry_proto::ssh::packet::{decode_packet, encode_packet};
//!
//! # tokio_test_block_on(async {
//! let mut seal = SealingContext::none();
//! let mut open = OpeningContext::none();
//!
//! let wire = encode_packet(b"\x05ssh-userauth", &mut seal).unwrap();
//! let mut stream = &wire[..];
//! let payload = decode_packet(&mut stream, &mut open).await.unwrap();
//! assert_eq!(payload, b"\x05ssh-userauth");
//! # });
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
//! # }
//! ```

use crate::ssh::crypto::{OpeningContext, SealingContext};
use crate::ssh::transport::RekeyTracker;
use bytes::{BufMut, BytesMut};
use ferry_platform::{FerryError, FerryResult};
use rand::RngCore;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Maximum `packet_length` accepted (RFC 4253 Section 6.1 plus room for
/// padding and channel headers).
pub const MAX_PACKET_SIZE: usize = 35000;

/// Minimum padding length in bytes.
pub const MIN_PADDING_LEN: usize = 4;

/// Maximum padding length in bytes (fits in u8).
pub const MAX_PADDING_LEN: usize = 255;

/// Boxed read half of the transport stream.
pub type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;

/// Boxed write half of the transport stream.
pub type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// A plaintext SSH packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    payload: Vec<u8>,
    padding: Vec<u8>,
}

impl Packet {
    /// Creates a packet padded for the given block size.
    ///
    /// `length_excluded` is true for AEAD ciphers, whose alignment does not
    /// cover the 4-byte length field.
    pub fn new(payload: Vec<u8>, block_size: usize, length_excluded: bool) -> FerryResult<Self> {
        let block_size = block_size.max(8);
        let header = if length_excluded { 1 } else { 5 };
        let unpadded = header + payload.len();

        let mut padding_len = block_size - (unpadded % block_size);
        if padding_len < MIN_PADDING_LEN {
            padding_len += block_size;
        }
        if padding_len > MAX_PADDING_LEN {
            return Err(FerryError::Framing(format!(
                "Cannot pad to block size {}",
                block_size
            )));
        }

        let packet_length = 1 + payload.len() + padding_len;
        if packet_length > MAX_PACKET_SIZE {
            return Err(FerryError::Framing(format!(
                "Packet size {} exceeds maximum {}",
                packet_length, MAX_PACKET_SIZE
            )));
        }

        let mut padding = vec![0u8; padding_len];
        rand::thread_rng().fill_bytes(&mut padding);

        Ok(Self { payload, padding })
    }

    /// Returns the payload.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Consumes the packet, returning the payload.
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Returns the padding.
    pub fn padding(&self) -> &[u8] {
        &self.padding
    }

    /// Serializes to plaintext wire format (without MAC).
    pub fn to_bytes(&self) -> Vec<u8> {
        let packet_length = 1 + self.payload.len() + self.padding.len();
        let mut buf = BytesMut::with_capacity(4 + packet_length);
        buf.put_u32(packet_length as u32);
        buf.put_u8(self.padding.len() as u8);
        buf.put_slice(&self.payload);
        buf.put_slice(&self.padding);
        buf.to_vec()
    }

    /// Parses a plaintext packet (length field included, MAC excluded).
    ///
    /// # Errors
    ///
    /// Returns [`FerryError::Framing`] if:
    /// - the data is shorter than the header or the declared length
    /// - the declared length exceeds [`MAX_PACKET_SIZE`]
    /// - padding is shorter than 4 bytes or longer than the packet
    /// - the packet is not aligned to `block_size`
    pub fn from_bytes(data: &[u8], block_size: usize, length_excluded: bool) -> FerryResult<Self> {
        if data.len() < 5 {
            return Err(FerryError::Framing(format!(
                "Packet too short: {} bytes",
                data.len()
            )));
        }

        let packet_length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if packet_length > MAX_PACKET_SIZE {
            return Err(FerryError::Framing(format!(
                "Packet length {} exceeds maximum {}",
                packet_length, MAX_PACKET_SIZE
            )));
        }
        if data.len() != 4 + packet_length {
            return Err(FerryError::Framing(format!(
                "Length mismatch: header says {}, got {}",
                packet_length,
                data.len() - 4
            )));
        }

        let aligned = if length_excluded {
            packet_length
        } else {
            packet_length + 4
        };
        if aligned % block_size.max(8) != 0 {
            return Err(FerryError::Framing(format!(
                "Packet length {} not aligned to block size {}",
                packet_length, block_size
            )));
        }

        let padding_len = data[4] as usize;
        if padding_len < MIN_PADDING_LEN {
            return Err(FerryError::Framing(format!(
                "Padding too short: {} bytes",
                padding_len
            )));
        }
        if padding_len + 1 > packet_length {
            return Err(FerryError::Framing(format!(
                "Padding length {} exceeds packet length {}",
                padding_len, packet_length
            )));
        }

        let payload_end = 4 + packet_length - padding_len;
        Ok(Self {
            payload: data[5..payload_end].to_vec(),
            padding: data[payload_end..].to_vec(),
        })
    }
}

/// Frames and protects one payload.
pub fn encode_packet(payload: &[u8], ctx: &mut SealingContext) -> FerryResult<Vec<u8>> {
    let packet = Packet::new(
        payload.to_vec(),
        ctx.block_size(),
        ctx.excludes_length_from_alignment(),
    )?;
    ctx.seal(packet.to_bytes())
}

/// Reads exactly one packet from `reader` and returns its payload.
///
/// Reads only as many bytes as the record needs, so it can be interleaved
/// with other direct reads of the same stream.
pub async fn decode_packet<R>(reader: &mut R, ctx: &mut OpeningContext) -> FerryResult<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = BytesMut::new();
    let mut pending = None;

    loop {
        if let Some(payload) = try_decode(&mut buf, ctx, &mut pending)? {
            return Ok(payload);
        }

        let needed = bytes_needed(&buf, ctx, pending);
        let mut chunk = vec![0u8; needed];
        if let Err(e) = reader.read_exact(&mut chunk).await {
            return Err(eof_error(e, &buf));
        }
        buf.extend_from_slice(&chunk);
    }
}

fn bytes_needed(buf: &BytesMut, ctx: &OpeningContext, pending: Option<usize>) -> usize {
    let target = match pending {
        None => ctx.first_block_size(),
        Some(record_len) => record_len + ctx.trailer_size(),
    };
    target.saturating_sub(buf.len()).max(1)
}

fn eof_error(err: std::io::Error, buf: &BytesMut) -> FerryError {
    if buf.is_empty() {
        FerryError::from_stream_io(err)
    } else if err.kind() == std::io::ErrorKind::UnexpectedEof {
        FerryError::Framing(format!("Stream ended mid-record ({} bytes buffered)", buf.len()))
    } else {
        FerryError::Io(err)
    }
}

/// Attempts to decode one record from `buf`.
///
/// `pending` holds the total record length (length field included, trailer
/// excluded) once the first block has been processed, so the first block is
/// only decrypted once even when the record arrives in pieces.
fn try_decode(
    buf: &mut BytesMut,
    ctx: &mut OpeningContext,
    pending: &mut Option<usize>,
) -> FerryResult<Option<Vec<u8>>> {
    let record_len = match *pending {
        Some(len) => len,
        None => {
            let first = ctx.first_block_size();
            if buf.len() < first {
                return Ok(None);
            }

            let length = ctx.decrypt_length(&mut buf[..first])? as usize;
            if length > MAX_PACKET_SIZE {
                return Err(FerryError::Framing(format!(
                    "Packet length {} exceeds maximum {}",
                    length, MAX_PACKET_SIZE
                )));
            }
            if length + 4 < first {
                return Err(FerryError::Framing(format!(
                    "Packet length {} shorter than cipher block",
                    length
                )));
            }

            *pending = Some(length + 4);
            length + 4
        }
    };

    let trailer = ctx.trailer_size();
    if buf.len() < record_len + trailer {
        return Ok(None);
    }

    let mut record = buf.split_to(record_len).to_vec();
    let mac = buf.split_to(trailer);
    *pending = None;

    ctx.open(&mut record, &mac)?;
    let packet = Packet::from_bytes(
        &record,
        ctx.block_size(),
        ctx.excludes_length_from_alignment(),
    )?;

    trace!(
        sequence = ctx.sequence().wrapping_sub(1),
        len = packet.payload().len(),
        "Packet received"
    );
    Ok(Some(packet.into_payload()))
}

/// Buffered, cancel-safe reader for inbound packets.
///
/// Partially received records stay in the internal buffer, so
/// [`read_payload`](Self::read_payload) may be used inside `tokio::select!`.
pub struct PacketReader {
    reader: BoxedReader,
    buf: BytesMut,
    opening: OpeningContext,
    pending: Option<usize>,
    rekey: Option<Arc<RekeyTracker>>,
}

impl std::fmt::Debug for PacketReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketReader")
            .field("opening", &self.opening)
            .field("buffered", &self.buf.len())
            .finish()
    }
}

impl PacketReader {
    /// Wraps a read half with no encryption.
    pub fn new(reader: BoxedReader) -> Self {
        Self {
            reader,
            buf: BytesMut::with_capacity(8 * 1024),
            opening: OpeningContext::none(),
            pending: None,
            rekey: None,
        }
    }

    /// Counts inbound bytes toward the rekey limit.
    pub fn set_rekey_tracker(&mut self, tracker: Arc<RekeyTracker>) {
        self.rekey = Some(tracker);
    }

    /// Sequence number of the next inbound packet.
    pub fn sequence(&self) -> u32 {
        self.opening.sequence()
    }

    /// Active inbound cipher name.
    pub fn algorithm_name(&self) -> &'static str {
        self.opening.algorithm_name()
    }

    /// Installs a new inbound context after SSH_MSG_NEWKEYS.
    pub fn install(&mut self, opening: OpeningContext) {
        self.opening = opening;
    }

    /// Reads the next payload.
    ///
    /// # Errors
    ///
    /// - [`FerryError::SessionClosed`] on EOF between records
    /// - [`FerryError::Framing`] on EOF inside a record or malformed framing
    /// - [`FerryError::Integrity`] on MAC/tag failure
    pub async fn read_payload(&mut self) -> FerryResult<Vec<u8>> {
        loop {
            if let Some(payload) = try_decode(&mut self.buf, &mut self.opening, &mut self.pending)? {
                return Ok(payload);
            }

            let n = self
                .reader
                .read_buf(&mut self.buf)
                .await
                .map_err(FerryError::from_stream_io)?;

            if n == 0 {
                if self.buf.is_empty() && self.pending.is_none() {
                    return Err(FerryError::SessionClosed);
                }
                return Err(FerryError::Framing(format!(
                    "Stream ended mid-record ({} bytes buffered)",
                    self.buf.len()
                )));
            }

            if let Some(tracker) = &self.rekey {
                tracker.add_bytes(n as u64);
            }
        }
    }
}

/// Serialized writer for outbound packets.
///
/// Shared behind an async mutex; whoever holds the lock writes whole packets
/// so bytes from different callers never interleave.
pub struct PacketWriter {
    writer: BoxedWriter,
    sealing: SealingContext,
    rekey: Option<Arc<RekeyTracker>>,
}

impl std::fmt::Debug for PacketWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketWriter")
            .field("sealing", &self.sealing)
            .finish()
    }
}

impl PacketWriter {
    /// Wraps a write half with no encryption.
    pub fn new(writer: BoxedWriter) -> Self {
        Self {
            writer,
            sealing: SealingContext::none(),
            rekey: None,
        }
    }

    /// Counts outbound bytes toward the rekey limit.
    pub fn set_rekey_tracker(&mut self, tracker: Arc<RekeyTracker>) {
        self.rekey = Some(tracker);
    }

    /// Sequence number of the next outbound packet.
    pub fn sequence(&self) -> u32 {
        self.sealing.sequence()
    }

    /// Active outbound cipher name.
    pub fn algorithm_name(&self) -> &'static str {
        self.sealing.algorithm_name()
    }

    /// Installs a new outbound context right after sending SSH_MSG_NEWKEYS.
    pub fn install(&mut self, sealing: SealingContext) {
        self.sealing = sealing;
    }

    /// Frames, protects and writes one payload.
    pub async fn write_payload(&mut self, payload: &[u8]) -> FerryResult<()> {
        let wire = encode_packet(payload, &mut self.sealing)?;

        self.writer
            .write_all(&wire)
            .await
            .map_err(FerryError::from_stream_io)?;
        self.writer
            .flush()
            .await
            .map_err(FerryError::from_stream_io)?;

        trace!(
            sequence = self.sealing.sequence().wrapping_sub(1),
            len = payload.len(),
            "Packet sent"
        );

        if let Some(tracker) = &self.rekey {
            tracker.add_bytes(wire.len() as u64);
        }
        Ok(())
    }

    /// Shuts down the write half.
    pub async fn shutdown(&mut self) -> FerryResult<()> {
        self.writer.shutdown().await.map_err(FerryError::from_stream_io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::crypto::{CipherAlgorithm, DirectionKeys, MacAlgorithm};

    fn keys(cipher: CipherAlgorithm) -> DirectionKeys {
        DirectionKeys {
            cipher,
            mac: (!cipher.is_aead()).then_some(MacAlgorithm::HmacSha512),
            iv: vec![9; cipher.iv_size()],
            key: vec![3; cipher.key_size()],
            mac_key: vec![5; 64],
        }
    }

    #[test]
    fn test_packet_padding_rules() {
        for len in [0usize, 1, 7, 8, 100, 1000] {
            let packet = Packet::new(vec![0xAB; len], 8, false).unwrap();
            let bytes = packet.to_bytes();
            assert_eq!(bytes.len() % 8, 0);
            assert!(packet.padding().len() >= MIN_PADDING_LEN);

            let packet = Packet::new(vec![0xAB; len], 16, true).unwrap();
            let bytes = packet.to_bytes();
            assert_eq!((bytes.len() - 4) % 16, 0);
        }
    }

    #[test]
    fn test_packet_too_large() {
        let result = Packet::new(vec![0u8; MAX_PACKET_SIZE], 8, false);
        assert!(matches!(result, Err(FerryError::Framing(_))));
    }

    #[test]
    fn test_from_bytes_rejects_bad_framing() {
        let good = Packet::new(b"payload".to_vec(), 8, false).unwrap().to_bytes();
        assert_eq!(Packet::from_bytes(&good, 8, false).unwrap().payload(), b"payload");

        // Length mismatch
        let result = Packet::from_bytes(&good[..good.len() - 1], 8, false);
        assert!(matches!(result, Err(FerryError::Framing(_))));

        // Padding too short
        let mut short_pad = good.clone();
        short_pad[4] = 3;
        assert!(matches!(
            Packet::from_bytes(&short_pad, 8, false),
            Err(FerryError::Framing(_))
        ));

        // Padding longer than the packet
        let mut long_pad = good.clone();
        long_pad[4] = 200;
        assert!(matches!(
            Packet::from_bytes(&long_pad, 8, false),
            Err(FerryError::Framing(_))
        ));

        // Misaligned
        let mut misaligned = vec![0, 0, 0, 10, 4];
        misaligned.extend_from_slice(&[0u8; 9]);
        assert!(matches!(
            Packet::from_bytes(&misaligned, 8, false),
            Err(FerryError::Framing(_))
        ));
    }

    #[tokio::test]
    async fn test_roundtrip_every_cipher() {
        for cipher in CipherAlgorithm::ALL {
            let k = keys(cipher);
            let mut seal = SealingContext::new(&k, 7).unwrap();
            let mut open = OpeningContext::new(&k, 7).unwrap();

            let mut wire = Vec::new();
            let payloads: Vec<Vec<u8>> = vec![
                b"\x15".to_vec(),
                vec![0x5e; 32 * 1024],
                (0..=255u8).collect(),
            ];
            for p in &payloads {
                wire.extend(encode_packet(p, &mut seal).unwrap());
            }

            let mut stream = &wire[..];
            for p in &payloads {
                let decoded = decode_packet(&mut stream, &mut open).await.unwrap();
                assert_eq!(&decoded, p, "{}", cipher.name());
            }
            assert!(stream.is_empty());
            assert_eq!(open.sequence(), 10);
        }
    }

    #[tokio::test]
    async fn test_flipped_bit_is_integrity_error() {
        let k = keys(CipherAlgorithm::Aes256Gcm);
        let mut seal = SealingContext::new(&k, 0).unwrap();
        let mut open = OpeningContext::new(&k, 0).unwrap();

        let mut wire = encode_packet(b"channel data", &mut seal).unwrap();
        let n = wire.len();
        wire[n - 1] ^= 0x80;

        let mut stream = &wire[..];
        let result = decode_packet(&mut stream, &mut open).await;
        assert!(matches!(result, Err(FerryError::Integrity(_))));
    }

    #[tokio::test]
    async fn test_oversized_length_is_framing_error() {
        let mut open = OpeningContext::none();
        let wire = [0x00, 0x10, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00];
        let mut stream = &wire[..];
        let result = decode_packet(&mut stream, &mut open).await;
        assert!(matches!(result, Err(FerryError::Framing(_))));
    }

    #[tokio::test]
    async fn test_eof_handling() {
        let mut open = OpeningContext::none();
        let mut empty: &[u8] = &[];
        assert!(matches!(
            decode_packet(&mut empty, &mut open).await,
            Err(FerryError::SessionClosed)
        ));

        let mut seal = SealingContext::none();
        let wire = encode_packet(b"truncated", &mut seal).unwrap();
        let mut partial = &wire[..wire.len() - 3];
        let mut open = OpeningContext::none();
        assert!(matches!(
            decode_packet(&mut partial, &mut open).await,
            Err(FerryError::Framing(_))
        ));
    }

    #[tokio::test]
    async fn test_reader_handles_fragmented_stream() {
        let k = keys(CipherAlgorithm::ChaCha20Poly1305);
        let mut seal = SealingContext::new(&k, 0).unwrap();

        let (client, mut server) = tokio::io::duplex(64);
        let mut reader = PacketReader::new(Box::new(client));
        reader.install(OpeningContext::new(&k, 0).unwrap());

        let first = encode_packet(&[1u8; 300], &mut seal).unwrap();
        let second = encode_packet(b"second", &mut seal).unwrap();

        let writer = tokio::spawn(async move {
            for chunk in first.chunks(7).chain(second.chunks(3)) {
                server.write_all(chunk).await.unwrap();
            }
            server
        });

        assert_eq!(reader.read_payload().await.unwrap(), vec![1u8; 300]);
        assert_eq!(reader.read_payload().await.unwrap(), b"second");

        drop(writer.await.unwrap());
        assert!(matches!(
            reader.read_payload().await,
            Err(FerryError::SessionClosed)
        ));
    }
}
