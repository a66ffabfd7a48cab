//! SSH packet protection: ciphers, MACs and the directional cipher contexts.
//!
//! Supported ciphers:
//! - `chacha20-poly1305@openssh.com` (AEAD, encrypted length field)
//! - `aes256-gcm@openssh.com`, `aes128-gcm@openssh.com` (AEAD, RFC 5647)
//! - `aes256-ctr`, `aes128-ctr` (RFC 4344, paired with an HMAC)
//!
//! Supported MACs: `hmac-sha2-256`, `hmac-sha2-512` (RFC 6668), used in
//! encrypt-and-MAC mode over `sequence || plaintext packet`.
//!
//! A [`SealingContext`] protects outbound packets and an [`OpeningContext`]
//! verifies inbound ones. Each owns its packet sequence number, which keeps
//! counting across rekeys. Key material is zeroized on drop.

use ferry_platform::{FerryError, FerryResult};
use hmac::{Hmac, Mac};
use ring::aead::{
    chacha20_poly1305_openssh, Aad, BoundKey, Nonce, NonceSequence, OpeningKey, SealingKey,
    UnboundKey, AES_128_GCM, AES_256_GCM,
};
use sha2::{Sha256, Sha512};
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

/// Block size used for padding when no cipher is active.
pub const NONE_BLOCK_SIZE: usize = 8;

/// Size of the AEAD authentication tag.
pub const AEAD_TAG_SIZE: usize = 16;

/// Cipher algorithm for SSH encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherAlgorithm {
    /// ChaCha20-Poly1305 (OpenSSH construction)
    ChaCha20Poly1305,
    /// AES-256-GCM
    Aes256Gcm,
    /// AES-128-GCM
    Aes128Gcm,
    /// AES-256-CTR (requires a MAC)
    Aes256Ctr,
    /// AES-128-CTR (requires a MAC)
    Aes128Ctr,
}

impl CipherAlgorithm {
    /// All supported ciphers in default preference order.
    pub const ALL: [CipherAlgorithm; 5] = [
        CipherAlgorithm::ChaCha20Poly1305,
        CipherAlgorithm::Aes256Gcm,
        CipherAlgorithm::Aes128Gcm,
        CipherAlgorithm::Aes256Ctr,
        CipherAlgorithm::Aes128Ctr,
    ];

    /// Returns the SSH algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            CipherAlgorithm::ChaCha20Poly1305 => "chacha20-poly1305@openssh.com",
            CipherAlgorithm::Aes256Gcm => "aes256-gcm@openssh.com",
            CipherAlgorithm::Aes128Gcm => "aes128-gcm@openssh.com",
            CipherAlgorithm::Aes256Ctr => "aes256-ctr",
            CipherAlgorithm::Aes128Ctr => "aes128-ctr",
        }
    }

    /// Key length in bytes.
    pub fn key_size(&self) -> usize {
        match self {
            CipherAlgorithm::ChaCha20Poly1305 => chacha20_poly1305_openssh::KEY_LEN,
            CipherAlgorithm::Aes256Gcm | CipherAlgorithm::Aes256Ctr => 32,
            CipherAlgorithm::Aes128Gcm | CipherAlgorithm::Aes128Ctr => 16,
        }
    }

    /// IV length in bytes.
    pub fn iv_size(&self) -> usize {
        match self {
            CipherAlgorithm::ChaCha20Poly1305 => 0,
            CipherAlgorithm::Aes256Gcm | CipherAlgorithm::Aes128Gcm => 12,
            CipherAlgorithm::Aes256Ctr | CipherAlgorithm::Aes128Ctr => 16,
        }
    }

    /// Padding alignment in bytes.
    pub fn block_size(&self) -> usize {
        match self {
            CipherAlgorithm::ChaCha20Poly1305 => 8,
            _ => 16,
        }
    }

    /// Authentication tag length (0 for non-AEAD ciphers).
    pub fn tag_size(&self) -> usize {
        if self.is_aead() {
            AEAD_TAG_SIZE
        } else {
            0
        }
    }

    /// Returns true if the cipher authenticates on its own.
    pub fn is_aead(&self) -> bool {
        matches!(
            self,
            CipherAlgorithm::ChaCha20Poly1305
                | CipherAlgorithm::Aes256Gcm
                | CipherAlgorithm::Aes128Gcm
        )
    }

    /// Looks up a cipher by SSH name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.name() == name)
    }
}

/// MAC algorithm for SSH integrity protection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MacAlgorithm {
    /// HMAC-SHA-256
    HmacSha256,
    /// HMAC-SHA-512
    HmacSha512,
}

impl MacAlgorithm {
    /// All supported MACs in default preference order.
    pub const ALL: [MacAlgorithm; 2] = [MacAlgorithm::HmacSha256, MacAlgorithm::HmacSha512];

    /// Returns the SSH algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            MacAlgorithm::HmacSha256 => "hmac-sha2-256",
            MacAlgorithm::HmacSha512 => "hmac-sha2-512",
        }
    }

    /// Key length in bytes.
    pub fn key_size(&self) -> usize {
        self.mac_size()
    }

    /// Output length in bytes.
    pub fn mac_size(&self) -> usize {
        match self {
            MacAlgorithm::HmacSha256 => 32,
            MacAlgorithm::HmacSha512 => 64,
        }
    }

    /// Looks up a MAC by SSH name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|m| m.name() == name)
    }
}

/// HMAC key bound to one direction.
pub struct MacKey {
    algorithm: MacAlgorithm,
    key: Vec<u8>,
}

impl std::fmt::Debug for MacKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MacKey")
            .field("algorithm", &self.algorithm)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl MacKey {
    /// Creates a MAC key from derived key material.
    pub fn new(algorithm: MacAlgorithm, key_material: &[u8]) -> FerryResult<Self> {
        if key_material.len() < algorithm.key_size() {
            return Err(FerryError::Crypto(format!(
                "Insufficient key material for {}: expected {}, got {}",
                algorithm.name(),
                algorithm.key_size(),
                key_material.len()
            )));
        }

        Ok(Self {
            algorithm,
            key: key_material[..algorithm.key_size()].to_vec(),
        })
    }

    /// Computes `MAC(key, sequence || packet)`.
    pub fn compute(&self, sequence: u32, packet: &[u8]) -> FerryResult<Vec<u8>> {
        let seq = sequence.to_be_bytes();
        let mac = match self.algorithm {
            MacAlgorithm::HmacSha256 => {
                let mut mac = Hmac::<Sha256>::new_from_slice(&self.key)
                    .map_err(|e| FerryError::Crypto(format!("HMAC key rejected: {}", e)))?;
                mac.update(&seq);
                mac.update(packet);
                mac.finalize().into_bytes().to_vec()
            }
            MacAlgorithm::HmacSha512 => {
                let mut mac = Hmac::<Sha512>::new_from_slice(&self.key)
                    .map_err(|e| FerryError::Crypto(format!("HMAC key rejected: {}", e)))?;
                mac.update(&seq);
                mac.update(packet);
                mac.finalize().into_bytes().to_vec()
            }
        };
        Ok(mac)
    }

    /// Verifies a received MAC in constant time.
    pub fn verify(&self, sequence: u32, packet: &[u8], received: &[u8]) -> FerryResult<()> {
        let computed = self.compute(sequence, packet)?;

        if computed.len() == received.len() && bool::from(computed.ct_eq(received)) {
            Ok(())
        } else {
            Err(FerryError::Integrity(format!(
                "MAC verification failed for packet {}",
                sequence
            )))
        }
    }

    /// Returns the algorithm.
    pub fn algorithm(&self) -> MacAlgorithm {
        self.algorithm
    }
}

impl Drop for MacKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Derived key material for one direction.
pub struct DirectionKeys {
    /// Negotiated cipher
    pub cipher: CipherAlgorithm,
    /// Negotiated MAC (`None` for AEAD ciphers)
    pub mac: Option<MacAlgorithm>,
    /// Initial IV
    pub iv: Vec<u8>,
    /// Encryption key
    pub key: Vec<u8>,
    /// Integrity key
    pub mac_key: Vec<u8>,
}

impl std::fmt::Debug for DirectionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectionKeys")
            .field("cipher", &self.cipher)
            .field("mac", &self.mac)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl Drop for DirectionKeys {
    fn drop(&mut self) {
        self.iv.zeroize();
        self.key.zeroize();
        self.mac_key.zeroize();
    }
}

/// GCM invocation counter (RFC 5647 Section 7.1).
///
/// The 12-byte nonce is a fixed 4-byte field followed by a 64-bit counter
/// that increments once per packet.
struct GcmNonce {
    fixed: [u8; 4],
    invocation: u64,
}

impl GcmNonce {
    fn new(iv: &[u8]) -> FerryResult<Self> {
        if iv.len() < 12 {
            return Err(FerryError::Crypto(format!(
                "GCM IV too short: {} bytes",
                iv.len()
            )));
        }
        let mut fixed = [0u8; 4];
        fixed.copy_from_slice(&iv[..4]);
        let mut counter = [0u8; 8];
        counter.copy_from_slice(&iv[4..12]);
        Ok(Self {
            fixed,
            invocation: u64::from_be_bytes(counter),
        })
    }
}

impl NonceSequence for GcmNonce {
    fn advance(&mut self) -> Result<Nonce, ring::error::Unspecified> {
        let mut nonce = [0u8; 12];
        nonce[..4].copy_from_slice(&self.fixed);
        nonce[4..].copy_from_slice(&self.invocation.to_be_bytes());
        self.invocation = self.invocation.wrapping_add(1);
        Nonce::try_assume_unique_for_key(&nonce)
    }
}

enum AesCtr {
    Aes128(ctr::Ctr128BE<aes::Aes128>),
    Aes256(ctr::Ctr128BE<aes::Aes256>),
}

impl AesCtr {
    fn new(cipher: CipherAlgorithm, key: &[u8], iv: &[u8]) -> FerryResult<Self> {
        use cipher::KeyIvInit;

        let key = key.get(..cipher.key_size()).ok_or_else(|| {
            FerryError::Crypto(format!("Insufficient key material for {}", cipher.name()))
        })?;
        let iv = iv.get(..16).ok_or_else(|| {
            FerryError::Crypto(format!("Insufficient IV material for {}", cipher.name()))
        })?;
        let invalid = |_| FerryError::Crypto(format!("Invalid key/IV for {}", cipher.name()));

        match cipher {
            CipherAlgorithm::Aes128Ctr => Ok(AesCtr::Aes128(
                ctr::Ctr128BE::<aes::Aes128>::new_from_slices(key, iv).map_err(invalid)?,
            )),
            CipherAlgorithm::Aes256Ctr => Ok(AesCtr::Aes256(
                ctr::Ctr128BE::<aes::Aes256>::new_from_slices(key, iv).map_err(invalid)?,
            )),
            other => Err(FerryError::Crypto(format!(
                "{} is not a CTR cipher",
                other.name()
            ))),
        }
    }

    fn apply(&mut self, buf: &mut [u8]) {
        use cipher::StreamCipher;

        match self {
            AesCtr::Aes128(c) => c.apply_keystream(buf),
            AesCtr::Aes256(c) => c.apply_keystream(buf),
        }
    }
}

fn chacha_key(keys: &DirectionKeys) -> FerryResult<&[u8; chacha20_poly1305_openssh::KEY_LEN]> {
    keys.key
        .get(..chacha20_poly1305_openssh::KEY_LEN)
        .and_then(|k| k.try_into().ok())
        .ok_or_else(|| {
            FerryError::Crypto("Insufficient key material for chacha20-poly1305".to_string())
        })
}

fn gcm_unbound_key(keys: &DirectionKeys) -> FerryResult<UnboundKey> {
    let algorithm = match keys.cipher {
        CipherAlgorithm::Aes128Gcm => &AES_128_GCM,
        CipherAlgorithm::Aes256Gcm => &AES_256_GCM,
        other => {
            return Err(FerryError::Crypto(format!(
                "{} is not a GCM cipher",
                other.name()
            )))
        }
    };
    let key = keys.key.get(..keys.cipher.key_size()).ok_or_else(|| {
        FerryError::Crypto(format!("Insufficient key material for {}", keys.cipher.name()))
    })?;
    UnboundKey::new(algorithm, key)
        .map_err(|_| FerryError::Crypto(format!("Invalid key for {}", keys.cipher.name())))
}

fn ctr_mac(keys: &DirectionKeys) -> FerryResult<MacKey> {
    let mac = keys.mac.ok_or_else(|| {
        FerryError::Crypto(format!("{} requires a MAC algorithm", keys.cipher.name()))
    })?;
    MacKey::new(mac, &keys.mac_key)
}

enum SealState {
    None,
    ChaCha(chacha20_poly1305_openssh::SealingKey),
    Gcm(SealingKey<GcmNonce>),
    Ctr { cipher: AesCtr, mac: MacKey },
}

/// Outbound half of a cipher context.
pub struct SealingContext {
    state: SealState,
    algorithm: Option<CipherAlgorithm>,
    sequence: u32,
}

impl std::fmt::Debug for SealingContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealingContext")
            .field("algorithm", &self.algorithm_name())
            .field("sequence", &self.sequence)
            .finish()
    }
}

impl SealingContext {
    /// Unencrypted context used before the first NEWKEYS.
    pub fn none() -> Self {
        Self {
            state: SealState::None,
            algorithm: None,
            sequence: 0,
        }
    }

    /// Builds a context from derived keys, continuing at `sequence`.
    pub fn new(keys: &DirectionKeys, sequence: u32) -> FerryResult<Self> {
        let state = match keys.cipher {
            CipherAlgorithm::ChaCha20Poly1305 => {
                SealState::ChaCha(chacha20_poly1305_openssh::SealingKey::new(chacha_key(keys)?))
            }
            CipherAlgorithm::Aes128Gcm | CipherAlgorithm::Aes256Gcm => SealState::Gcm(
                SealingKey::new(gcm_unbound_key(keys)?, GcmNonce::new(&keys.iv)?),
            ),
            CipherAlgorithm::Aes128Ctr | CipherAlgorithm::Aes256Ctr => SealState::Ctr {
                cipher: AesCtr::new(keys.cipher, &keys.key, &keys.iv)?,
                mac: ctr_mac(keys)?,
            },
        };

        Ok(Self {
            state,
            algorithm: Some(keys.cipher),
            sequence,
        })
    }

    /// Padding alignment for outbound packets.
    pub fn block_size(&self) -> usize {
        self.algorithm
            .map_or(NONE_BLOCK_SIZE, |alg| alg.block_size())
    }

    /// True if the length field is excluded from padding alignment.
    pub fn excludes_length_from_alignment(&self) -> bool {
        self.algorithm.map_or(false, |alg| alg.is_aead())
    }

    /// Sequence number of the next packet.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Negotiated cipher name, or "none".
    pub fn algorithm_name(&self) -> &'static str {
        self.algorithm.map_or("none", |alg| alg.name())
    }

    /// Protects one plaintext packet (length field included) and returns the
    /// bytes to put on the wire.
    pub fn seal(&mut self, mut packet: Vec<u8>) -> FerryResult<Vec<u8>> {
        let sequence = self.sequence;

        match &mut self.state {
            SealState::None => {}
            SealState::ChaCha(key) => {
                let mut tag = [0u8; chacha20_poly1305_openssh::TAG_LEN];
                key.seal_in_place(sequence, &mut packet, &mut tag);
                packet.extend_from_slice(&tag);
            }
            SealState::Gcm(key) => {
                if packet.len() < 4 {
                    return Err(FerryError::Framing("Packet shorter than length field".into()));
                }
                let (length, body) = packet.split_at_mut(4);
                let tag = key
                    .seal_in_place_separate_tag(Aad::from(&*length), body)
                    .map_err(|_| FerryError::Crypto("AES-GCM sealing failed".to_string()))?;
                packet.extend_from_slice(tag.as_ref());
            }
            SealState::Ctr { cipher, mac } => {
                let tag = mac.compute(sequence, &packet)?;
                cipher.apply(&mut packet);
                packet.extend_from_slice(&tag);
            }
        }

        self.sequence = sequence.wrapping_add(1);
        Ok(packet)
    }
}

enum OpenState {
    None,
    ChaCha(chacha20_poly1305_openssh::OpeningKey),
    Gcm(OpeningKey<GcmNonce>),
    Ctr { cipher: AesCtr, mac: MacKey },
}

/// Inbound half of a cipher context.
///
/// Opening happens in two steps because the packet length may itself be
/// encrypted: [`decrypt_length`](Self::decrypt_length) on the first
/// [`first_block_size`](Self::first_block_size) bytes, then
/// [`open`](Self::open) on the complete record.
pub struct OpeningContext {
    state: OpenState,
    algorithm: Option<CipherAlgorithm>,
    sequence: u32,
    decrypted_length: Option<[u8; 4]>,
}

impl std::fmt::Debug for OpeningContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpeningContext")
            .field("algorithm", &self.algorithm_name())
            .field("sequence", &self.sequence)
            .finish()
    }
}

impl OpeningContext {
    /// Unencrypted context used before the first NEWKEYS.
    pub fn none() -> Self {
        Self {
            state: OpenState::None,
            algorithm: None,
            sequence: 0,
            decrypted_length: None,
        }
    }

    /// Builds a context from derived keys, continuing at `sequence`.
    pub fn new(keys: &DirectionKeys, sequence: u32) -> FerryResult<Self> {
        let state = match keys.cipher {
            CipherAlgorithm::ChaCha20Poly1305 => {
                OpenState::ChaCha(chacha20_poly1305_openssh::OpeningKey::new(chacha_key(keys)?))
            }
            CipherAlgorithm::Aes128Gcm | CipherAlgorithm::Aes256Gcm => OpenState::Gcm(
                OpeningKey::new(gcm_unbound_key(keys)?, GcmNonce::new(&keys.iv)?),
            ),
            CipherAlgorithm::Aes128Ctr | CipherAlgorithm::Aes256Ctr => OpenState::Ctr {
                cipher: AesCtr::new(keys.cipher, &keys.key, &keys.iv)?,
                mac: ctr_mac(keys)?,
            },
        };

        Ok(Self {
            state,
            algorithm: Some(keys.cipher),
            sequence,
            decrypted_length: None,
        })
    }

    /// Sequence number of the next expected packet.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Negotiated cipher name, or "none".
    pub fn algorithm_name(&self) -> &'static str {
        self.algorithm.map_or("none", |alg| alg.name())
    }

    /// Padding alignment for inbound packets.
    pub fn block_size(&self) -> usize {
        self.algorithm
            .map_or(NONE_BLOCK_SIZE, |alg| alg.block_size())
    }

    /// True if the length field is excluded from padding alignment.
    pub fn excludes_length_from_alignment(&self) -> bool {
        self.algorithm.map_or(false, |alg| alg.is_aead())
    }

    /// Bytes needed before the packet length can be read.
    pub fn first_block_size(&self) -> usize {
        match self.state {
            OpenState::Ctr { .. } => self.block_size(),
            _ => 4,
        }
    }

    /// Bytes of MAC or tag trailing each record.
    pub fn trailer_size(&self) -> usize {
        match &self.state {
            OpenState::None => 0,
            OpenState::ChaCha(_) | OpenState::Gcm(_) => AEAD_TAG_SIZE,
            OpenState::Ctr { mac, .. } => mac.algorithm().mac_size(),
        }
    }

    /// Recovers the packet length from the first block.
    ///
    /// For CTR ciphers the block is decrypted in place, so this must be
    /// called exactly once per record.
    pub fn decrypt_length(&mut self, first_block: &mut [u8]) -> FerryResult<u32> {
        if first_block.len() < 4 {
            return Err(FerryError::Framing("First block shorter than 4 bytes".into()));
        }

        let mut raw = [0u8; 4];
        match &mut self.state {
            OpenState::None | OpenState::Gcm(_) => raw.copy_from_slice(&first_block[..4]),
            OpenState::ChaCha(key) => {
                raw.copy_from_slice(&first_block[..4]);
                raw = key.decrypt_packet_length(self.sequence, raw);
            }
            OpenState::Ctr { cipher, .. } => {
                cipher.apply(first_block);
                raw.copy_from_slice(&first_block[..4]);
            }
        }

        self.decrypted_length = Some(raw);
        Ok(u32::from_be_bytes(raw))
    }

    /// Verifies and decrypts a complete record in place.
    ///
    /// `record` holds the length field and everything up to (not including)
    /// the trailer; for CTR ciphers the first block has already been
    /// decrypted by [`decrypt_length`](Self::decrypt_length). On success
    /// `record` holds the plaintext packet.
    ///
    /// # Errors
    ///
    /// [`FerryError::Integrity`] if the MAC or tag does not verify.
    pub fn open(&mut self, record: &mut Vec<u8>, trailer: &[u8]) -> FerryResult<()> {
        let sequence = self.sequence;
        let first_block = self.first_block_size();

        match &mut self.state {
            OpenState::None => {}
            OpenState::ChaCha(key) => {
                let tag: &[u8; chacha20_poly1305_openssh::TAG_LEN] =
                    trailer.try_into().map_err(|_| {
                        FerryError::Framing(format!("Tag must be {} bytes", AEAD_TAG_SIZE))
                    })?;
                key.open_in_place(sequence, record, tag).map_err(|_| {
                    FerryError::Integrity(format!("Poly1305 tag mismatch on packet {}", sequence))
                })?;
                let length = self.decrypted_length.ok_or_else(|| {
                    FerryError::Protocol("open() called before decrypt_length()".into())
                })?;
                record[..4].copy_from_slice(&length);
            }
            OpenState::Gcm(key) => {
                if record.len() < 4 {
                    return Err(FerryError::Framing("Record shorter than length field".into()));
                }
                let mut length = [0u8; 4];
                length.copy_from_slice(&record[..4]);
                let mut body = record.split_off(4);
                body.extend_from_slice(trailer);
                let plaintext_len = key
                    .open_in_place(Aad::from(length), &mut body)
                    .map_err(|_| {
                        FerryError::Integrity(format!("GCM tag mismatch on packet {}", sequence))
                    })?
                    .len();
                body.truncate(plaintext_len);
                record.extend_from_slice(&body);
            }
            OpenState::Ctr { cipher, mac } => {
                if record.len() > first_block {
                    cipher.apply(&mut record[first_block..]);
                }
                mac.verify(sequence, record, trailer)?;
            }
        }

        self.decrypted_length = None;
        self.sequence = sequence.wrapping_add(1);
        Ok(())
    }
}
