//! Key exchange methods and key derivation (RFC 4253, RFC 8268, RFC 8731).
//!
//! This module implements:
//! - curve25519-sha256 and curve25519-sha256@libssh.org (RFC 8731)
//! - diffie-hellman-group14-sha256 (RFC 8268)
//! - the exchange hash H (RFC 4253 Section 8)
//! - session key derivation (RFC 4253 Section 7.2)
//!
//! All three methods hash with SHA-256 and carry their ephemeral values in
//! message numbers 30 and 31.
//!
//! # Example
//!
//! ```rust
//! use ferry_proto::ssh::kex_dh::{EphemeralKey, KexMethod};
//!
//! let client = EphemeralKey::generate(KexMethod::Curve25519Sha256).unwrap();
//! let server = EphemeralKey::generate(KexMethod::Curve25519Sha256).unwrap();
//!
//! let client_public = client.public_value();
//! let server_public = server.public_value();
//!
//! let k1 = client.agree(&server_public).unwrap();
//! let k2 = server.agree(&client_public).unwrap();
//! assert_eq!(*k1, *k2);
//! ```

use crate::ssh::crypto::DirectionKeys;
use crate::ssh::kex::AlgorithmSuite;
use crate::ssh::message::MessageType;
use crate::ssh::wire::{encode_mpint, read_bytes, write_bytes, write_mpint};
use bytes::{BufMut, BytesMut};
use ferry_platform::{FerryError, FerryResult};
use num_bigint::{BigUint, RandBigInt};
use once_cell::sync::Lazy;
use ring::agreement::{agree_ephemeral, EphemeralPrivateKey, UnparsedPublicKey, X25519};
use ring::rand::SystemRandom;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, Zeroizing};

/// Diffie-Hellman Group 14 prime (2048-bit MODP, RFC 3526).
static GROUP14_P: Lazy<BigUint> = Lazy::new(|| {
    BigUint::parse_bytes(
        b"FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
          29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
          EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
          E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
          EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D\
          C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F\
          83655D23DCA3AD961C62F356208552BB9ED529077096966D\
          670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
          E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9\
          DE2BCBF6955817183995497CEA956AE515D2261898FA0510\
          15728E5A8AACAA68FFFFFFFFFFFFFFFF",
        16,
    )
    .unwrap_or_default()
});

/// Diffie-Hellman Group 14 generator.
static GROUP14_G: Lazy<BigUint> = Lazy::new(|| BigUint::from(2u32));

/// Key exchange method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KexMethod {
    /// curve25519-sha256
    Curve25519Sha256,
    /// curve25519-sha256@libssh.org (same algorithm, pre-standard name)
    Curve25519Sha256Libssh,
    /// diffie-hellman-group14-sha256
    DhGroup14Sha256,
}

impl KexMethod {
    /// All methods, in default preference order.
    pub const ALL: [KexMethod; 3] = [
        KexMethod::Curve25519Sha256,
        KexMethod::Curve25519Sha256Libssh,
        KexMethod::DhGroup14Sha256,
    ];

    /// Returns the method name.
    pub fn name(&self) -> &'static str {
        match self {
            KexMethod::Curve25519Sha256 => "curve25519-sha256",
            KexMethod::Curve25519Sha256Libssh => "curve25519-sha256@libssh.org",
            KexMethod::DhGroup14Sha256 => "diffie-hellman-group14-sha256",
        }
    }

    /// Parses a method name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|m| m.name() == name)
    }

    /// Whether ephemeral values are `mpint` (DH) rather than `string` (ECDH).
    fn uses_mpint(&self) -> bool {
        matches!(self, KexMethod::DhGroup14Sha256)
    }

    fn write_public(&self, buf: &mut BytesMut, value: &[u8]) {
        if self.uses_mpint() {
            write_mpint(buf, value);
        } else {
            write_bytes(buf, value);
        }
    }
}

impl std::fmt::Display for KexMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Ephemeral key for one key exchange.
pub enum EphemeralKey {
    /// X25519 private key
    Curve25519 {
        /// ring private key (consumed by agreement)
        private_key: EphemeralPrivateKey,
        /// Public key (32 bytes)
        public_key: [u8; 32],
    },
    /// Group 14 exponent
    DhGroup14 {
        /// Private exponent x (big-endian)
        private_key: Zeroizing<Vec<u8>>,
        /// Public value e = g^x mod p (big-endian)
        public_key: Vec<u8>,
    },
}

impl std::fmt::Debug for EphemeralKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EphemeralKey::Curve25519 { public_key, .. } => f
                .debug_struct("EphemeralKey::Curve25519")
                .field("public_key", &hex::encode(public_key))
                .finish_non_exhaustive(),
            EphemeralKey::DhGroup14 { public_key, .. } => f
                .debug_struct("EphemeralKey::DhGroup14")
                .field("public_len", &public_key.len())
                .finish_non_exhaustive(),
        }
    }
}

impl EphemeralKey {
    /// Generates a fresh ephemeral key for `method`.
    pub fn generate(method: KexMethod) -> FerryResult<Self> {
        match method {
            KexMethod::Curve25519Sha256 | KexMethod::Curve25519Sha256Libssh => {
                let rng = SystemRandom::new();
                let private_key = EphemeralPrivateKey::generate(&X25519, &rng)
                    .map_err(|_| FerryError::Crypto("Failed to generate Curve25519 key".to_string()))?;
                let public = private_key.compute_public_key().map_err(|_| {
                    FerryError::Crypto("Failed to compute Curve25519 public key".to_string())
                })?;

                let mut public_key = [0u8; 32];
                public_key.copy_from_slice(public.as_ref());
                Ok(EphemeralKey::Curve25519 {
                    private_key,
                    public_key,
                })
            }
            KexMethod::DhGroup14Sha256 => {
                // 1 < x < p - 1
                let p_minus_one = &*GROUP14_P - 1u32;
                let x = rand::thread_rng().gen_biguint_range(&BigUint::from(2u32), &p_minus_one);
                let e = GROUP14_G.modpow(&x, &GROUP14_P);

                Ok(EphemeralKey::DhGroup14 {
                    private_key: Zeroizing::new(x.to_bytes_be()),
                    public_key: e.to_bytes_be(),
                })
            }
        }
    }

    /// Public value to send to the peer (Q_C/Q_S, or e/f as magnitude).
    pub fn public_value(&self) -> Vec<u8> {
        match self {
            EphemeralKey::Curve25519 { public_key, .. } => public_key.to_vec(),
            EphemeralKey::DhGroup14 { public_key, .. } => public_key.clone(),
        }
    }

    /// Computes the shared secret K (big-endian magnitude).
    ///
    /// # Errors
    ///
    /// [`FerryError::Protocol`] if the peer's public value is out of range
    /// or the agreement yields an all-zero secret.
    pub fn agree(self, peer_public: &[u8]) -> FerryResult<Zeroizing<Vec<u8>>> {
        match self {
            EphemeralKey::Curve25519 { private_key, .. } => {
                if peer_public.len() != 32 {
                    return Err(FerryError::Protocol(format!(
                        "Invalid Curve25519 public key length: expected 32, got {}",
                        peer_public.len()
                    )));
                }
                let peer = UnparsedPublicKey::new(&X25519, peer_public);
                let secret = agree_ephemeral(private_key, &peer, |k| k.to_vec())
                    .map_err(|_| FerryError::Protocol("Curve25519 key agreement failed".to_string()))?;

                if secret.iter().all(|&b| b == 0) {
                    return Err(FerryError::Protocol(
                        "Curve25519 shared secret is zero".to_string(),
                    ));
                }
                Ok(Zeroizing::new(secret))
            }
            EphemeralKey::DhGroup14 { private_key, .. } => {
                let y = BigUint::from_bytes_be(peer_public);
                let p_minus_one = &*GROUP14_P - 1u32;
                if y <= BigUint::from(1u32) || y >= p_minus_one {
                    return Err(FerryError::Protocol(
                        "Invalid DH public value: out of range".to_string(),
                    ));
                }

                let x = BigUint::from_bytes_be(&private_key);
                let k = y.modpow(&x, &GROUP14_P);
                Ok(Zeroizing::new(k.to_bytes_be()))
            }
        }
    }
}

/// SSH_MSG_KEX_ECDH_INIT / SSH_MSG_KEXDH_INIT (30).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexEcdhInit {
    /// Client ephemeral public value
    pub public: Vec<u8>,
}

impl KexEcdhInit {
    /// Serializes the message for `method`.
    pub fn to_bytes(&self, method: KexMethod) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::KexEcdhInit as u8);
        method.write_public(&mut buf, &self.public);
        buf.to_vec()
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> FerryResult<Self> {
        expect_type(data, MessageType::KexEcdhInit)?;
        let mut offset = 1;
        let public = read_bytes(data, &mut offset)?;
        Ok(Self { public })
    }
}

/// SSH_MSG_KEX_ECDH_REPLY / SSH_MSG_KEXDH_REPLY (31).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexEcdhReply {
    /// Server host key blob (K_S)
    pub host_key: Vec<u8>,
    /// Server ephemeral public value
    pub public: Vec<u8>,
    /// Signature blob over H
    pub signature: Vec<u8>,
}

impl KexEcdhReply {
    /// Serializes the message for `method`.
    pub fn to_bytes(&self, method: KexMethod) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::KexEcdhReply as u8);
        write_bytes(&mut buf, &self.host_key);
        method.write_public(&mut buf, &self.public);
        write_bytes(&mut buf, &self.signature);
        buf.to_vec()
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> FerryResult<Self> {
        expect_type(data, MessageType::KexEcdhReply)?;
        let mut offset = 1;
        let host_key = read_bytes(data, &mut offset)?;
        let public = read_bytes(data, &mut offset)?;
        let signature = read_bytes(data, &mut offset)?;
        Ok(Self {
            host_key,
            public,
            signature,
        })
    }
}

fn expect_type(data: &[u8], expected: MessageType) -> FerryResult<()> {
    match data.first() {
        Some(&t) if t == expected as u8 => Ok(()),
        Some(&t) => Err(FerryError::Protocol(format!(
            "Expected {}, got message {}",
            expected, t
        ))),
        None => Err(FerryError::Protocol(format!("Empty {} message", expected))),
    }
}

/// Inputs of the exchange hash (RFC 4253 Section 8).
///
/// ```text
/// H = HASH(V_C || V_S || I_C || I_S || K_S || Q_C || Q_S || K)
/// ```
#[derive(Debug)]
pub struct ExchangeHash<'a> {
    /// Key exchange method
    pub method: KexMethod,
    /// V_C, client identification without CR LF
    pub client_version: &'a str,
    /// V_S, server identification without CR LF
    pub server_version: &'a str,
    /// I_C, client KEXINIT payload
    pub client_kexinit: &'a [u8],
    /// I_S, server KEXINIT payload
    pub server_kexinit: &'a [u8],
    /// K_S, server host key blob
    pub host_key: &'a [u8],
    /// Q_C or e
    pub client_public: &'a [u8],
    /// Q_S or f
    pub server_public: &'a [u8],
    /// K, shared secret magnitude
    pub shared_secret: &'a [u8],
}

impl ExchangeHash<'_> {
    /// Computes H.
    pub fn compute(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        write_bytes(&mut buf, self.client_version.as_bytes());
        write_bytes(&mut buf, self.server_version.as_bytes());
        write_bytes(&mut buf, self.client_kexinit);
        write_bytes(&mut buf, self.server_kexinit);
        write_bytes(&mut buf, self.host_key);
        self.method.write_public(&mut buf, self.client_public);
        self.method.write_public(&mut buf, self.server_public);
        write_mpint(&mut buf, self.shared_secret);

        let hash = Sha256::digest(&buf).to_vec();
        buf.as_mut().zeroize();
        hash
    }
}

/// Derives one key (RFC 4253 Section 7.2).
///
/// ```text
/// K1 = HASH(K || H || letter || session_id)
/// K2 = HASH(K || H || K1)
/// K3 = HASH(K || H || K1 || K2)
/// key = K1 || K2 || K3 || ...
/// ```
///
/// K is hashed in `mpint` encoding.
///
/// ```rust
/// use ferry_proto::ssh::kex_dh::derive_key;
///
/// let key = derive_key(&[0x42; 32], &[0x01; 32], &[0x02; 32], b'C', 64);
/// assert_eq!(key.len(), 64);
/// ```
pub fn derive_key(
    shared_secret: &[u8],
    exchange_hash: &[u8],
    session_id: &[u8],
    letter: u8,
    key_length: usize,
) -> Vec<u8> {
    let mut k_mpint = BytesMut::new();
    write_bytes(&mut k_mpint, &encode_mpint(shared_secret));

    let mut hasher = Sha256::new();
    hasher.update(&k_mpint);
    hasher.update(exchange_hash);
    hasher.update([letter]);
    hasher.update(session_id);
    let mut key = hasher.finalize().to_vec();

    while key.len() < key_length {
        let mut hasher = Sha256::new();
        hasher.update(&k_mpint);
        hasher.update(exchange_hash);
        hasher.update(&key);
        key.extend_from_slice(&hasher.finalize());
    }

    k_mpint.as_mut().zeroize();
    key.truncate(key_length);
    key
}

/// Keys for both directions of one key exchange.
#[derive(Debug)]
pub struct SessionKeys {
    /// Client to server keys (IV "A", key "C", MAC "E")
    pub client_to_server: DirectionKeys,
    /// Server to client keys (IV "B", key "D", MAC "F")
    pub server_to_client: DirectionKeys,
}

/// Derives the keys of both directions for the negotiated suite.
pub fn derive_keys(
    shared_secret: &[u8],
    exchange_hash: &[u8],
    session_id: &[u8],
    suite: &AlgorithmSuite,
) -> SessionKeys {
    let derive = |letter: u8, len: usize| derive_key(shared_secret, exchange_hash, session_id, letter, len);

    let c2s = suite.cipher_client_to_server;
    let s2c = suite.cipher_server_to_client;

    SessionKeys {
        client_to_server: DirectionKeys {
            cipher: c2s,
            mac: suite.mac_client_to_server,
            iv: derive(b'A', c2s.iv_size()),
            key: derive(b'C', c2s.key_size()),
            mac_key: suite
                .mac_client_to_server
                .map_or_else(Vec::new, |m| derive(b'E', m.key_size())),
        },
        server_to_client: DirectionKeys {
            cipher: s2c,
            mac: suite.mac_server_to_client,
            iv: derive(b'B', s2c.iv_size()),
            key: derive(b'D', s2c.key_size()),
            mac_key: suite
                .mac_server_to_client
                .map_or_else(Vec::new, |m| derive(b'F', m.key_size())),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::crypto::{CipherAlgorithm, MacAlgorithm};

    #[test]
    fn test_curve25519_agreement() {
        for method in [KexMethod::Curve25519Sha256, KexMethod::Curve25519Sha256Libssh] {
            let client = EphemeralKey::generate(method).unwrap();
            let server = EphemeralKey::generate(method).unwrap();
            let (cp, sp) = (client.public_value(), server.public_value());
            assert_eq!(cp.len(), 32);

            let k1 = client.agree(&sp).unwrap();
            let k2 = server.agree(&cp).unwrap();
            assert_eq!(*k1, *k2);
        }
    }

    #[test]
    fn test_curve25519_rejects_bad_length() {
        let key = EphemeralKey::generate(KexMethod::Curve25519Sha256).unwrap();
        assert!(matches!(key.agree(&[1u8; 31]), Err(FerryError::Protocol(_))));
    }

    #[test]
    fn test_dh_group14_agreement() {
        let client = EphemeralKey::generate(KexMethod::DhGroup14Sha256).unwrap();
        let server = EphemeralKey::generate(KexMethod::DhGroup14Sha256).unwrap();
        let (cp, sp) = (client.public_value(), server.public_value());

        let k1 = client.agree(&sp).unwrap();
        let k2 = server.agree(&cp).unwrap();
        assert_eq!(*k1, *k2);
        assert!(!k1.is_empty());
    }

    #[test]
    fn test_dh_group14_rejects_out_of_range() {
        for bad in [vec![1u8], vec![0u8], GROUP14_P.to_bytes_be()] {
            let key = EphemeralKey::generate(KexMethod::DhGroup14Sha256).unwrap();
            assert!(key.agree(&bad).is_err());
        }
    }

    #[test]
    fn test_kex_messages_roundtrip() {
        let init = KexEcdhInit { public: vec![7u8; 32] };
        let parsed = KexEcdhInit::from_bytes(&init.to_bytes(KexMethod::Curve25519Sha256)).unwrap();
        assert_eq!(parsed, init);

        let reply = KexEcdhReply {
            host_key: vec![1, 2, 3],
            public: vec![0x7f, 0x01],
            signature: vec![9; 83],
        };
        let parsed = KexEcdhReply::from_bytes(&reply.to_bytes(KexMethod::DhGroup14Sha256)).unwrap();
        assert_eq!(parsed, reply);

        assert!(KexEcdhReply::from_bytes(&init.to_bytes(KexMethod::Curve25519Sha256)).is_err());
    }

    #[test]
    fn test_derive_key_extension_hashes_all_previous_blocks() {
        let (k, h, sid) = (vec![0x42; 32], vec![0x01; 32], vec![0x02; 32]);
        let key = derive_key(&k, &h, &sid, b'C', 96);
        assert_eq!(key.len(), 96);

        let mut k_mpint = BytesMut::new();
        write_bytes(&mut k_mpint, &encode_mpint(&k));
        let mut hasher = Sha256::new();
        hasher.update(&k_mpint);
        hasher.update(&h);
        hasher.update(&key[..64]);
        assert_eq!(&key[64..], hasher.finalize().as_slice());

        // Prefix-stable
        assert_eq!(&derive_key(&k, &h, &sid, b'C', 32)[..], &key[..32]);
        assert_ne!(derive_key(&k, &h, &sid, b'A', 32), derive_key(&k, &h, &sid, b'C', 32));
    }

    #[test]
    fn test_derive_keys_sizes() {
        let suite = AlgorithmSuite {
            kex: KexMethod::Curve25519Sha256,
            host_key: "ssh-ed25519",
            cipher_client_to_server: CipherAlgorithm::ChaCha20Poly1305,
            cipher_server_to_client: CipherAlgorithm::Aes128Ctr,
            mac_client_to_server: None,
            mac_server_to_client: Some(MacAlgorithm::HmacSha512),
        };
        let keys = derive_keys(&[5; 32], &[6; 32], &[7; 32], &suite);

        assert_eq!(keys.client_to_server.key.len(), 64);
        assert!(keys.client_to_server.iv.is_empty());
        assert!(keys.client_to_server.mac_key.is_empty());
        assert_eq!(keys.server_to_client.key.len(), 16);
        assert_eq!(keys.server_to_client.iv.len(), 16);
        assert_eq!(keys.server_to_client.mac_key.len(), 64);
    }

    #[test]
    fn test_exchange_hash_depends_on_every_input() {
        let base = ExchangeHash {
            method: KexMethod::Curve25519Sha256,
            client_version: "SSH-2.0-a",
            server_version: "SSH-2.0-b",
            client_kexinit: b"ic",
            server_kexinit: b"is",
            host_key: b"ks",
            client_public: &[1; 32],
            server_public: &[2; 32],
            shared_secret: &[3; 32],
        };
        let h = base.compute();
        assert_eq!(h.len(), 32);

        let changed = ExchangeHash {
            shared_secret: &[4; 32],
            ..base
        };
        assert_ne!(changed.compute(), h);
    }
}
