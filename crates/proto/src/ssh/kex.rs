//! SSH key exchange negotiation (RFC 4253 Section 7).
//!
//! This module covers:
//! - SSH_MSG_KEXINIT message
//! - SSH_MSG_NEWKEYS message
//! - Algorithm preferences and negotiation
//!
//! # Key Exchange Flow
//!
//! 1. Both sides send SSH_MSG_KEXINIT
//! 2. Algorithm negotiation (first client preference the server lists wins)
//! 3. Key exchange (see [`kex_dh`](super::kex_dh))
//! 4. Both sides send SSH_MSG_NEWKEYS
//! 5. Each direction switches to the new keys after its NEWKEYS
//!
//! # Example
//!
//! ```rust
//! use ferry_proto::ssh::kex::{negotiate, KexInit, NewKeys};
//!
//! let client = KexInit::new_default();
//! let server = KexInit::new_default();
//!
//! let suite = negotiate(&client, &server).unwrap();
//! assert_eq!(suite.kex.name(), "curve25519-sha256");
//! assert_eq!(NewKeys::new().to_bytes(), vec![21]);
//! ```

use crate::ssh::crypto::{CipherAlgorithm, MacAlgorithm};
use crate::ssh::hostkey::ED25519_KEY_TYPE;
use crate::ssh::kex_dh::KexMethod;
use crate::ssh::message::MessageType;
use crate::ssh::wire::{read_bool, read_name_list, read_raw, read_u32, write_bool, write_name_list};
use bytes::{BufMut, BytesMut};
use ferry_platform::{FerryError, FerryResult};
use rand::RngCore;

/// Ordered algorithm preferences for one side of a negotiation.
///
/// Every list is most-preferred first. Unknown names are rejected by
/// [`validate`](Self::validate).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlgorithmPreferences {
    /// Key exchange methods
    pub kex: Vec<String>,
    /// Host key types
    pub host_key: Vec<String>,
    /// Ciphers (used for both directions)
    pub ciphers: Vec<String>,
    /// MACs (used for both directions, ignored with AEAD ciphers)
    pub macs: Vec<String>,
}

impl Default for AlgorithmPreferences {
    fn default() -> Self {
        Self {
            kex: KexMethod::ALL.iter().map(|m| m.name().to_string()).collect(),
            host_key: vec![ED25519_KEY_TYPE.to_string()],
            ciphers: CipherAlgorithm::ALL
                .iter()
                .map(|c| c.name().to_string())
                .collect(),
            macs: MacAlgorithm::ALL
                .iter()
                .map(|m| m.name().to_string())
                .collect(),
        }
    }
}

impl AlgorithmPreferences {
    /// Checks that every list is non-empty and names only supported algorithms.
    pub fn validate(&self) -> FerryResult<()> {
        check_list("key exchange", &self.kex, |n| KexMethod::from_name(n).is_some())?;
        check_list("host key", &self.host_key, |n| n == ED25519_KEY_TYPE)?;
        check_list("cipher", &self.ciphers, |n| CipherAlgorithm::from_name(n).is_some())?;
        check_list("MAC", &self.macs, |n| MacAlgorithm::from_name(n).is_some())?;
        Ok(())
    }
}

fn check_list(category: &str, names: &[String], known: impl Fn(&str) -> bool) -> FerryResult<()> {
    if names.is_empty() {
        return Err(FerryError::Config(format!("Empty {} preference list", category)));
    }
    if let Some(unknown) = names.iter().find(|n| !known(n)) {
        return Err(FerryError::Config(format!(
            "Unsupported {} algorithm: {}",
            category, unknown
        )));
    }
    Ok(())
}

/// SSH_MSG_KEXINIT message (RFC 4253 Section 7.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexInit {
    cookie: [u8; 16],
    kex_algorithms: Vec<String>,
    server_host_key_algorithms: Vec<String>,
    encryption_algorithms_client_to_server: Vec<String>,
    encryption_algorithms_server_to_client: Vec<String>,
    mac_algorithms_client_to_server: Vec<String>,
    mac_algorithms_server_to_client: Vec<String>,
    compression_algorithms_client_to_server: Vec<String>,
    compression_algorithms_server_to_client: Vec<String>,
    languages_client_to_server: Vec<String>,
    languages_server_to_client: Vec<String>,
    first_kex_packet_follows: bool,
}

impl KexInit {
    /// Creates a KEXINIT with a fresh random cookie from the given preferences.
    pub fn from_preferences(prefs: &AlgorithmPreferences) -> Self {
        let mut cookie = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut cookie);

        Self {
            cookie,
            kex_algorithms: prefs.kex.clone(),
            server_host_key_algorithms: prefs.host_key.clone(),
            encryption_algorithms_client_to_server: prefs.ciphers.clone(),
            encryption_algorithms_server_to_client: prefs.ciphers.clone(),
            mac_algorithms_client_to_server: prefs.macs.clone(),
            mac_algorithms_server_to_client: prefs.macs.clone(),
            compression_algorithms_client_to_server: vec!["none".to_string()],
            compression_algorithms_server_to_client: vec!["none".to_string()],
            languages_client_to_server: vec![],
            languages_server_to_client: vec![],
            first_kex_packet_follows: false,
        }
    }

    /// Creates a KEXINIT with the default preferences.
    pub fn new_default() -> Self {
        Self::from_preferences(&AlgorithmPreferences::default())
    }

    /// Returns the cookie.
    pub fn cookie(&self) -> &[u8; 16] {
        &self.cookie
    }

    /// Returns the key exchange algorithms.
    pub fn kex_algorithms(&self) -> &[String] {
        &self.kex_algorithms
    }

    /// Returns the server host key algorithms.
    pub fn server_host_key_algorithms(&self) -> &[String] {
        &self.server_host_key_algorithms
    }

    /// Returns the encryption algorithms (client to server).
    pub fn encryption_algorithms_client_to_server(&self) -> &[String] {
        &self.encryption_algorithms_client_to_server
    }

    /// Returns the encryption algorithms (server to client).
    pub fn encryption_algorithms_server_to_client(&self) -> &[String] {
        &self.encryption_algorithms_server_to_client
    }

    /// Returns the MAC algorithms (client to server).
    pub fn mac_algorithms_client_to_server(&self) -> &[String] {
        &self.mac_algorithms_client_to_server
    }

    /// Returns the MAC algorithms (server to client).
    pub fn mac_algorithms_server_to_client(&self) -> &[String] {
        &self.mac_algorithms_server_to_client
    }

    /// Returns whether a guessed first KEX packet follows.
    pub fn first_kex_packet_follows(&self) -> bool {
        self.first_kex_packet_follows
    }

    /// Serializes the KEXINIT message (without packet framing).
    ///
    /// ```text
    /// byte         SSH_MSG_KEXINIT (20)
    /// byte[16]     cookie (random bytes)
    /// name-list    kex_algorithms
    /// name-list    server_host_key_algorithms
    /// name-list    encryption_algorithms_client_to_server
    /// name-list    encryption_algorithms_server_to_client
    /// name-list    mac_algorithms_client_to_server
    /// name-list    mac_algorithms_server_to_client
    /// name-list    compression_algorithms_client_to_server
    /// name-list    compression_algorithms_server_to_client
    /// name-list    languages_client_to_server
    /// name-list    languages_server_to_client
    /// boolean      first_kex_packet_follows
    /// uint32       0 (reserved for future extension)
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::KexInit as u8);
        buf.put_slice(&self.cookie);

        write_name_list(&mut buf, &self.kex_algorithms);
        write_name_list(&mut buf, &self.server_host_key_algorithms);
        write_name_list(&mut buf, &self.encryption_algorithms_client_to_server);
        write_name_list(&mut buf, &self.encryption_algorithms_server_to_client);
        write_name_list(&mut buf, &self.mac_algorithms_client_to_server);
        write_name_list(&mut buf, &self.mac_algorithms_server_to_client);
        write_name_list(&mut buf, &self.compression_algorithms_client_to_server);
        write_name_list(&mut buf, &self.compression_algorithms_server_to_client);
        write_name_list(&mut buf, &self.languages_client_to_server);
        write_name_list(&mut buf, &self.languages_server_to_client);

        write_bool(&mut buf, self.first_kex_packet_follows);
        buf.put_u32(0);

        buf.to_vec()
    }

    /// Parses a KEXINIT message.
    ///
    /// # Errors
    ///
    /// - [`FerryError::Protocol`] if the message type is not SSH_MSG_KEXINIT
    /// - [`FerryError::Framing`] if a field is truncated
    pub fn from_bytes(data: &[u8]) -> FerryResult<Self> {
        match data.first() {
            Some(&t) if t == MessageType::KexInit as u8 => {}
            Some(&t) => {
                return Err(FerryError::Protocol(format!(
                    "Invalid message type: expected 20 (SSH_MSG_KEXINIT), got {}",
                    t
                )))
            }
            None => return Err(FerryError::Protocol("KEXINIT message is empty".to_string())),
        }

        let mut offset = 1;
        let mut cookie = [0u8; 16];
        cookie.copy_from_slice(&read_raw(data, &mut offset, 16)?);

        let kex_algorithms = read_name_list(data, &mut offset)?;
        let server_host_key_algorithms = read_name_list(data, &mut offset)?;
        let encryption_algorithms_client_to_server = read_name_list(data, &mut offset)?;
        let encryption_algorithms_server_to_client = read_name_list(data, &mut offset)?;
        let mac_algorithms_client_to_server = read_name_list(data, &mut offset)?;
        let mac_algorithms_server_to_client = read_name_list(data, &mut offset)?;
        let compression_algorithms_client_to_server = read_name_list(data, &mut offset)?;
        let compression_algorithms_server_to_client = read_name_list(data, &mut offset)?;
        let languages_client_to_server = read_name_list(data, &mut offset)?;
        let languages_server_to_client = read_name_list(data, &mut offset)?;
        let first_kex_packet_follows = read_bool(data, &mut offset)?;
        let _reserved = read_u32(data, &mut offset)?;

        Ok(Self {
            cookie,
            kex_algorithms,
            server_host_key_algorithms,
            encryption_algorithms_client_to_server,
            encryption_algorithms_server_to_client,
            mac_algorithms_client_to_server,
            mac_algorithms_server_to_client,
            compression_algorithms_client_to_server,
            compression_algorithms_server_to_client,
            languages_client_to_server,
            languages_server_to_client,
            first_kex_packet_follows,
        })
    }
}

/// SSH_MSG_NEWKEYS message (RFC 4253 Section 7.3).
///
/// After a side sends NEWKEYS, its outbound packets use the new keys; after
/// it receives NEWKEYS, its inbound packets do. Sequence numbers are not
/// reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NewKeys;

impl NewKeys {
    /// Creates a new SSH_MSG_NEWKEYS message.
    pub const fn new() -> Self {
        Self
    }

    /// Serializes the NEWKEYS message.
    pub fn to_bytes(&self) -> Vec<u8> {
        vec![MessageType::NewKeys as u8]
    }

    /// Parses a NEWKEYS message.
    pub fn from_bytes(data: &[u8]) -> FerryResult<Self> {
        match data.first() {
            Some(&t) if t == MessageType::NewKeys as u8 => Ok(Self),
            Some(&t) => Err(FerryError::Protocol(format!(
                "Invalid message type: expected 21 (SSH_MSG_NEWKEYS), got {}",
                t
            ))),
            None => Err(FerryError::Protocol("NEWKEYS message is empty".to_string())),
        }
    }
}

/// Algorithms chosen for one key exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlgorithmSuite {
    /// Key exchange method
    pub kex: KexMethod,
    /// Host key type
    pub host_key: &'static str,
    /// Cipher client to server
    pub cipher_client_to_server: CipherAlgorithm,
    /// Cipher server to client
    pub cipher_server_to_client: CipherAlgorithm,
    /// MAC client to server (`None` for AEAD ciphers)
    pub mac_client_to_server: Option<MacAlgorithm>,
    /// MAC server to client (`None` for AEAD ciphers)
    pub mac_server_to_client: Option<MacAlgorithm>,
}

impl std::fmt::Display for AlgorithmSuite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "kex={} hostkey={} c2s={}/{} s2c={}/{}",
            self.kex.name(),
            self.host_key,
            self.cipher_client_to_server.name(),
            self.mac_client_to_server.map_or("aead", |m| m.name()),
            self.cipher_server_to_client.name(),
            self.mac_server_to_client.map_or("aead", |m| m.name()),
        )
    }
}

/// Negotiates a full algorithm suite from both KEXINIT messages.
///
/// # Errors
///
/// [`FerryError::NoCommonAlgorithm`] naming the first category without a
/// match, or [`FerryError::Protocol`] if both sides agree on a name this
/// implementation does not support.
pub fn negotiate(client: &KexInit, server: &KexInit) -> FerryResult<AlgorithmSuite> {
    let kex_name = negotiate_algorithm("key exchange", &client.kex_algorithms, &server.kex_algorithms)?;
    let kex = KexMethod::from_name(&kex_name).ok_or_else(|| unsupported("key exchange", &kex_name))?;

    let host_key_name = negotiate_algorithm(
        "host key",
        &client.server_host_key_algorithms,
        &server.server_host_key_algorithms,
    )?;
    if host_key_name != ED25519_KEY_TYPE {
        return Err(unsupported("host key", &host_key_name));
    }

    let cipher_client_to_server = negotiate_cipher(
        "cipher client->server",
        &client.encryption_algorithms_client_to_server,
        &server.encryption_algorithms_client_to_server,
    )?;
    let cipher_server_to_client = negotiate_cipher(
        "cipher server->client",
        &client.encryption_algorithms_server_to_client,
        &server.encryption_algorithms_server_to_client,
    )?;

    let mac_client_to_server = negotiate_mac(
        "MAC client->server",
        cipher_client_to_server,
        &client.mac_algorithms_client_to_server,
        &server.mac_algorithms_client_to_server,
    )?;
    let mac_server_to_client = negotiate_mac(
        "MAC server->client",
        cipher_server_to_client,
        &client.mac_algorithms_server_to_client,
        &server.mac_algorithms_server_to_client,
    )?;

    negotiate_algorithm(
        "compression client->server",
        &client.compression_algorithms_client_to_server,
        &server.compression_algorithms_client_to_server,
    )?;
    negotiate_algorithm(
        "compression server->client",
        &client.compression_algorithms_server_to_client,
        &server.compression_algorithms_server_to_client,
    )?;

    Ok(AlgorithmSuite {
        kex,
        host_key: ED25519_KEY_TYPE,
        cipher_client_to_server,
        cipher_server_to_client,
        mac_client_to_server,
        mac_server_to_client,
    })
}

fn negotiate_cipher(category: &str, client: &[String], server: &[String]) -> FerryResult<CipherAlgorithm> {
    let name = negotiate_algorithm(category, client, server)?;
    CipherAlgorithm::from_name(&name).ok_or_else(|| unsupported(category, &name))
}

fn negotiate_mac(
    category: &str,
    cipher: CipherAlgorithm,
    client: &[String],
    server: &[String],
) -> FerryResult<Option<MacAlgorithm>> {
    if cipher.is_aead() {
        return Ok(None);
    }
    let name = negotiate_algorithm(category, client, server)?;
    MacAlgorithm::from_name(&name)
        .map(Some)
        .ok_or_else(|| unsupported(category, &name))
}

fn unsupported(category: &str, name: &str) -> FerryError {
    FerryError::Protocol(format!("Negotiated unsupported {} algorithm: {}", category, name))
}

/// Picks the first algorithm in `client_list` that `server_list` also
/// contains.
///
/// ```rust
/// use ferry_proto::ssh::kex::negotiate_algorithm;
///
/// let client = vec!["aes256-ctr".to_string(), "aes128-ctr".to_string()];
/// let server = vec!["aes128-ctr".to_string(), "aes256-ctr".to_string()];
///
/// let result = negotiate_algorithm("cipher", &client, &server).unwrap();
/// assert_eq!(result, "aes256-ctr");
/// ```
pub fn negotiate_algorithm(
    category: &str,
    client_list: &[String],
    server_list: &[String],
) -> FerryResult<String> {
    client_list
        .iter()
        .find(|alg| server_list.contains(alg))
        .cloned()
        .ok_or_else(|| FerryError::NoCommonAlgorithm {
            category: category.to_string(),
            client: client_list.join(","),
            server: server_list.join(","),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prefs_with_ciphers(ciphers: &[&str]) -> AlgorithmPreferences {
        AlgorithmPreferences {
            ciphers: ciphers.iter().map(|c| c.to_string()).collect(),
            ..AlgorithmPreferences::default()
        }
    }

    #[test]
    fn test_kexinit_round_trip() {
        let original = KexInit::new_default();
        let bytes = original.to_bytes();
        assert_eq!(bytes[0], 20);

        let parsed = KexInit::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn test_kexinit_parse_errors() {
        let mut data = vec![99];
        data.extend_from_slice(&[0u8; 20]);
        assert!(matches!(KexInit::from_bytes(&data), Err(FerryError::Protocol(_))));

        let data = vec![20, 1, 2, 3];
        assert!(matches!(KexInit::from_bytes(&data), Err(FerryError::Framing(_))));

        let bytes = KexInit::new_default().to_bytes();
        assert!(matches!(
            KexInit::from_bytes(&bytes[..bytes.len() - 2]),
            Err(FerryError::Framing(_))
        ));
    }

    #[test]
    fn test_negotiate_prefers_client_order() {
        let client = KexInit::from_preferences(&prefs_with_ciphers(&["aes256-ctr", "aes128-gcm@openssh.com"]));
        let server = KexInit::from_preferences(&prefs_with_ciphers(&["aes128-gcm@openssh.com", "aes256-ctr"]));

        let suite = negotiate(&client, &server).unwrap();
        assert_eq!(suite.cipher_client_to_server, CipherAlgorithm::Aes256Ctr);
        assert_eq!(suite.mac_client_to_server, Some(MacAlgorithm::HmacSha256));

        let suite = negotiate(&server, &client).unwrap();
        assert_eq!(suite.cipher_server_to_client, CipherAlgorithm::Aes128Gcm);
        assert_eq!(suite.mac_server_to_client, None);
    }

    #[test]
    fn test_mac_skipped_for_aead() {
        let mut client_prefs = prefs_with_ciphers(&["chacha20-poly1305@openssh.com"]);
        client_prefs.macs = vec!["hmac-sha2-512".to_string()];
        let mut server_prefs = prefs_with_ciphers(&["chacha20-poly1305@openssh.com"]);
        server_prefs.macs = vec!["hmac-sha2-256".to_string()];

        let suite = negotiate(
            &KexInit::from_preferences(&client_prefs),
            &KexInit::from_preferences(&server_prefs),
        )
        .unwrap();
        assert_eq!(suite.mac_client_to_server, None);
        assert_eq!(suite.mac_server_to_client, None);
    }

    #[test]
    fn test_no_common_cipher() {
        let client = KexInit::from_preferences(&prefs_with_ciphers(&["aes256-ctr"]));
        let server = KexInit::from_preferences(&prefs_with_ciphers(&["aes128-ctr"]));

        match negotiate(&client, &server) {
            Err(FerryError::NoCommonAlgorithm { category, client, server }) => {
                assert_eq!(category, "cipher client->server");
                assert_eq!(client, "aes256-ctr");
                assert_eq!(server, "aes128-ctr");
            }
            other => panic!("Expected NoCommonAlgorithm, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_preferences() {
        assert!(AlgorithmPreferences::default().validate().is_ok());
        assert!(matches!(
            prefs_with_ciphers(&["3des-cbc"]).validate(),
            Err(FerryError::Config(_))
        ));
        assert!(matches!(
            prefs_with_ciphers(&[]).validate(),
            Err(FerryError::Config(_))
        ));
    }

    #[test]
    fn test_newkeys() {
        assert_eq!(NewKeys::new().to_bytes(), vec![21]);
        assert_eq!(NewKeys::from_bytes(&[21]).unwrap(), NewKeys);
        assert!(NewKeys::from_bytes(&[]).is_err());
        assert!(NewKeys::from_bytes(&[20]).is_err());
    }
}
