//! Host key stores and the host key checking policy.
//!
//! A [`HostKeyStore`] remembers which key each `(host, port)` presented.
//! Two backends are provided:
//!
//! - [`MemoryHostKeyStore`]: an in-process map
//! - [`KnownHostsFile`]: an OpenSSH `known_hosts` file
//!
//! # known_hosts Format
//!
//! Each line has the form:
//! ```text
//! [hostnames] keytype base64-key [comment]
//! ```
//!
//! Hostnames can be:
//! - Standard: `example.com` or `[example.com]:2222`
//! - Hashed: `|1|salt|hash` (HMAC-SHA1 hashed hostname)
//! - Wildcard: `*.example.com`, `host?.example.com`
//! - Multiple: `host1,host2,host3`
//! - Negated: `*.example.com,!bad.example.com`
//!
//! # Example
//!
//! ```rust
//! use ferry_proto::ssh::known_hosts::{
//!     check_host_key, HostKeyStatus, MemoryHostKeyStore, StrictHostKeyChecking,
//! };
//!
//! let store = MemoryHostKeyStore::new();
//! let key = b"\x00\x00\x00\x0bssh-ed25519";
//!
//! let status = check_host_key(
//!     &store, StrictHostKeyChecking::AcceptNew, "example.com", 22, "ssh-ed25519", key,
//! ).unwrap();
//! assert_eq!(status, HostKeyStatus::Unknown);
//!
//! // Remembered on first use
//! let status = check_host_key(
//!     &store, StrictHostKeyChecking::Strict, "example.com", 22, "ssh-ed25519", key,
//! ).unwrap();
//! assert_eq!(status, HostKeyStatus::Known);
//! ```

use crate::ssh::hostkey::{fingerprint, ED25519_KEY_TYPE};
use base64::Engine;
use ferry_platform::{FerryError, FerryResult};
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use sha1::Sha1;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

type HmacSha1 = Hmac<Sha1>;

/// Storage for host keys seen on previous connections.
pub trait HostKeyStore: Send + Sync {
    /// Returns the remembered `(key_type, key_blob)` for a host, if any.
    ///
    /// When several keys are stored for the host, an `ssh-ed25519` key is
    /// preferred.
    fn lookup(&self, host: &str, port: u16) -> Option<(String, Vec<u8>)>;

    /// Remembers a host key.
    fn remember(&self, host: &str, port: u16, key_type: &str, key_blob: &[u8]) -> FerryResult<()>;
}

/// Strict host key checking policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StrictHostKeyChecking {
    /// Reject unknown and changed keys.
    #[default]
    Strict,
    /// Remember unknown hosts, reject changed keys.
    AcceptNew,
    /// Accept every key (testing only).
    No,
}

/// Host key verification status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyStatus {
    /// Host key is known and matches.
    Known,
    /// Host key is known but has changed.
    Changed {
        /// Old key type
        old_key_type: String,
        /// Old key data
        old_key_data: Vec<u8>,
    },
    /// Host is unknown.
    Unknown,
}

/// Compares a presented key with the store.
pub fn host_key_status(store: &dyn HostKeyStore, host: &str, port: u16, key_type: &str, key_blob: &[u8]) -> HostKeyStatus {
    match store.lookup(host, port) {
        Some((stored_type, stored_blob)) if stored_type == key_type && stored_blob == key_blob => {
            HostKeyStatus::Known
        }
        Some((stored_type, _)) if stored_type != key_type => HostKeyStatus::Unknown,
        Some((old_key_type, old_key_data)) => HostKeyStatus::Changed {
            old_key_type,
            old_key_data,
        },
        None => HostKeyStatus::Unknown,
    }
}

/// Applies `policy` to a presented host key.
///
/// Returns the status when the key is accepted. Unknown keys accepted under
/// [`StrictHostKeyChecking::AcceptNew`] are remembered.
///
/// # Errors
///
/// [`FerryError::HostKeyVerification`] when the policy rejects the key.
pub fn check_host_key(
    store: &dyn HostKeyStore,
    policy: StrictHostKeyChecking,
    host: &str,
    port: u16,
    key_type: &str,
    key_blob: &[u8],
) -> FerryResult<HostKeyStatus> {
    let status = host_key_status(store, host, port, key_type, key_blob);

    match (&status, policy) {
        (HostKeyStatus::Known, _) => {
            debug!(host, port, "Host key matches known_hosts");
            Ok(status)
        }
        (HostKeyStatus::Unknown, StrictHostKeyChecking::Strict) => {
            Err(FerryError::HostKeyVerification(format!(
                "Unknown host '{}:{}' ({} {}) under strict checking",
                host,
                port,
                key_type,
                fingerprint(key_blob)
            )))
        }
        (HostKeyStatus::Unknown, StrictHostKeyChecking::AcceptNew) => {
            store.remember(host, port, key_type, key_blob)?;
            info!(host, port, fingerprint = %fingerprint(key_blob), "Remembered new host key");
            Ok(status)
        }
        (HostKeyStatus::Unknown, StrictHostKeyChecking::No) => {
            warn!(host, port, fingerprint = %fingerprint(key_blob), "Accepting unknown host key without checking");
            Ok(status)
        }
        (HostKeyStatus::Changed { .. }, StrictHostKeyChecking::No) => {
            warn!(host, port, fingerprint = %fingerprint(key_blob), "Accepting changed host key without checking");
            Ok(status)
        }
        (HostKeyStatus::Changed { old_key_type, old_key_data }, _) => {
            Err(FerryError::HostKeyVerification(format!(
                "HOST KEY CHANGED for '{}:{}': was {} {}, now {} {}",
                host,
                port,
                old_key_type,
                fingerprint(old_key_data),
                key_type,
                fingerprint(key_blob)
            )))
        }
    }
}

/// In-memory host key store.
#[derive(Debug, Default)]
pub struct MemoryHostKeyStore {
    keys: Mutex<HashMap<(String, u16), (String, Vec<u8>)>>,
}

impl MemoryHostKeyStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-populated with one key.
    pub fn with_key(host: &str, port: u16, key_type: &str, key_blob: &[u8]) -> Self {
        let store = Self::new();
        store.keys.lock().insert(
            (host.to_string(), port),
            (key_type.to_string(), key_blob.to_vec()),
        );
        store
    }
}

impl HostKeyStore for MemoryHostKeyStore {
    fn lookup(&self, host: &str, port: u16) -> Option<(String, Vec<u8>)> {
        self.keys.lock().get(&(host.to_string(), port)).cloned()
    }

    fn remember(&self, host: &str, port: u16, key_type: &str, key_blob: &[u8]) -> FerryResult<()> {
        self.keys.lock().insert(
            (host.to_string(), port),
            (key_type.to_string(), key_blob.to_vec()),
        );
        Ok(())
    }
}

/// A single known_hosts entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownHost {
    hostname_pattern: String,
    key_type: String,
    key_data: Vec<u8>,
    comment: String,
}

impl KnownHost {
    /// Creates an entry.
    pub fn new(hostname_pattern: String, key_type: String, key_data: Vec<u8>) -> Self {
        Self {
            hostname_pattern,
            key_type,
            key_data,
            comment: String::new(),
        }
    }

    /// Returns the hostname pattern.
    pub fn hostname_pattern(&self) -> &str {
        &self.hostname_pattern
    }

    /// Returns the key type.
    pub fn key_type(&self) -> &str {
        &self.key_type
    }

    /// Returns the key blob.
    pub fn key_data(&self) -> &[u8] {
        &self.key_data
    }

    /// Returns the comment.
    pub fn comment(&self) -> &str {
        &self.comment
    }

    /// Checks if this entry applies to `hostname` and `port`.
    ///
    /// A negated pattern that matches excludes the entry even if another
    /// pattern matches.
    pub fn matches(&self, hostname: &str, port: u16) -> bool {
        let full_host = host_pattern(hostname, port);

        let mut matched = false;
        for pattern in self.hostname_pattern.split(',') {
            let pattern = pattern.trim();
            if let Some(negated) = pattern.strip_prefix('!') {
                if matches_pattern(negated, &full_host) {
                    return false;
                }
            } else if matches_pattern(pattern, &full_host) {
                matched = true;
            }
        }
        matched
    }

    /// Parses a single line of a known_hosts file.
    ///
    /// ```rust
    /// use ferry_proto::ssh::known_hosts::KnownHost;
    ///
    /// let line = "[example.com]:2222 ssh-ed25519 AAAAC3NzaC1lZDI1NTE5 user@host";
    /// let entry = KnownHost::parse_line(line).unwrap();
    /// assert_eq!(entry.hostname_pattern(), "[example.com]:2222");
    /// assert_eq!(entry.comment(), "user@host");
    /// ```
    pub fn parse_line(line: &str) -> FerryResult<Self> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Err(FerryError::Config("Empty or comment line".to_string()));
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 3 {
            return Err(FerryError::Config(
                "Invalid known_hosts line: need at least 3 fields".to_string(),
            ));
        }

        let key_data = base64::engine::general_purpose::STANDARD
            .decode(parts[2])
            .map_err(|e| FerryError::Config(format!("Invalid base64 key data: {}", e)))?;

        Ok(Self {
            hostname_pattern: parts[0].to_string(),
            key_type: parts[1].to_string(),
            key_data,
            comment: parts[3..].join(" "),
        })
    }

    fn to_line(&self) -> String {
        let key = base64::engine::general_purpose::STANDARD.encode(&self.key_data);
        if self.comment.is_empty() {
            format!("{} {} {}\n", self.hostname_pattern, self.key_type, key)
        } else {
            format!(
                "{} {} {} {}\n",
                self.hostname_pattern, self.key_type, key, self.comment
            )
        }
    }
}

/// Formats `host` the way known_hosts stores it (`[host]:port` off port 22).
pub fn host_pattern(hostname: &str, port: u16) -> String {
    if port == 22 {
        hostname.to_string()
    } else {
        format!("[{}]:{}", hostname, port)
    }
}

/// Hashes a host pattern into `|1|salt|hash` form.
pub fn hash_hostname(host: &str, salt: &[u8]) -> FerryResult<String> {
    let mut mac = HmacSha1::new_from_slice(salt)
        .map_err(|e| FerryError::Crypto(format!("HMAC creation failed: {}", e)))?;
    mac.update(host.as_bytes());
    let hash = mac.finalize().into_bytes();

    let engine = base64::engine::general_purpose::STANDARD;
    Ok(format!("|1|{}|{}", engine.encode(salt), engine.encode(hash)))
}

fn matches_pattern(pattern: &str, hostname: &str) -> bool {
    if pattern.starts_with("|1|") {
        return verify_hashed_hostname(pattern, hostname);
    }
    if pattern.contains('*') || pattern.contains('?') {
        return wildcard_match(pattern, hostname);
    }
    pattern == hostname
}

fn verify_hashed_hostname(hashed: &str, hostname: &str) -> bool {
    let parts: Vec<&str> = hashed.split('|').collect();
    if parts.len() != 4 || !parts[0].is_empty() || parts[1] != "1" {
        return false;
    }

    let engine = base64::engine::general_purpose::STANDARD;
    let (Ok(salt), Ok(expected)) = (engine.decode(parts[2]), engine.decode(parts[3])) else {
        debug!(pattern = hashed, "Ignoring hashed host with invalid base64");
        return false;
    };

    let Ok(mut mac) = HmacSha1::new_from_slice(&salt) else {
        return false;
    };
    mac.update(hostname.as_bytes());
    let computed = mac.finalize().into_bytes();

    computed.ct_eq(&expected[..]).into()
}

/// Wildcard matching: `*` matches any run of characters, `?` exactly one.
fn wildcard_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            backtrack = Some((p, t));
            p += 1;
        } else if let Some((star_p, star_t)) = backtrack {
            p = star_p + 1;
            t = star_t + 1;
            backtrack = Some((star_p, star_t + 1));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|&c| c == '*')
}

/// An OpenSSH known_hosts file.
///
/// Entries are loaded once; [`remember`](HostKeyStore::remember) appends to
/// the file on disk.
#[derive(Debug)]
pub struct KnownHostsFile {
    entries: Mutex<Vec<KnownHost>>,
    path: PathBuf,
    hash_new_entries: bool,
}

impl KnownHostsFile {
    /// Creates an empty store backed by `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            path: path.as_ref().to_path_buf(),
            hash_new_entries: false,
        }
    }

    /// Loads a known_hosts file.
    ///
    /// # Errors
    ///
    /// [`FerryError::Io`] if the file cannot be read (including when it does
    /// not exist).
    pub fn open<P: AsRef<Path>>(path: P) -> FerryResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let file = Self::new(path);
        *file.entries.lock() = parse_entries(&content);
        Ok(file)
    }

    /// Loads a known_hosts file, starting empty if it does not exist.
    pub fn open_or_create<P: AsRef<Path>>(path: P) -> FerryResult<Self> {
        match Self::open(path.as_ref()) {
            Ok(file) => Ok(file),
            Err(FerryError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new(path)),
            Err(e) => Err(e),
        }
    }

    /// Parses known_hosts content not tied to a file on disk.
    pub fn from_string(content: &str) -> Self {
        let file = Self::new(PathBuf::new());
        *file.entries.lock() = parse_entries(content);
        file
    }

    /// Hashes hostnames of entries added by [`remember`](HostKeyStore::remember).
    pub fn set_hash_new_entries(&mut self, hash: bool) {
        self.hash_new_entries = hash;
    }

    /// Returns the file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns a snapshot of the entries.
    pub fn entries(&self) -> Vec<KnownHost> {
        self.entries.lock().clone()
    }

    /// Adds an entry in memory.
    pub fn add_host(&self, hostname: &str, port: u16, key_type: &str, key_data: &[u8]) -> FerryResult<KnownHost> {
        let pattern = host_pattern(hostname, port);
        let pattern = if self.hash_new_entries {
            let mut salt = [0u8; 20];
            rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut salt);
            hash_hostname(&pattern, &salt)?
        } else {
            pattern
        };

        let entry = KnownHost::new(pattern, key_type.to_string(), key_data.to_vec());
        self.entries.lock().push(entry.clone());
        Ok(entry)
    }

    /// Removes every entry that applies to `hostname` and `port`.
    pub fn remove_host(&self, hostname: &str, port: u16) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|entry| !entry.matches(hostname, port));
        before - entries.len()
    }

    /// Rewrites the whole file from the in-memory entries.
    pub fn save(&self) -> FerryResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let content: String = self.entries.lock().iter().map(KnownHost::to_line).collect();

        let temp_path = self.path.with_extension("tmp");
        let mut file = std::fs::File::create(&temp_path)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
        drop(file);

        std::fs::rename(&temp_path, &self.path)?;
        Ok(())
    }

    fn append(&self, entry: &KnownHost) -> FerryResult<()> {
        if self.path.as_os_str().is_empty() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(entry.to_line().as_bytes())?;
        Ok(())
    }
}

impl HostKeyStore for KnownHostsFile {
    fn lookup(&self, host: &str, port: u16) -> Option<(String, Vec<u8>)> {
        let entries = self.entries.lock();
        let mut matching = entries.iter().filter(|e| e.matches(host, port));

        let first = matching.next()?;
        let preferred = std::iter::once(first)
            .chain(matching)
            .find(|e| e.key_type == ED25519_KEY_TYPE)
            .unwrap_or(first);

        Some((preferred.key_type.clone(), preferred.key_data.clone()))
    }

    fn remember(&self, host: &str, port: u16, key_type: &str, key_blob: &[u8]) -> FerryResult<()> {
        let entry = self.add_host(host, port, key_type, key_blob)?;
        self.append(&entry)
    }
}

fn parse_entries(content: &str) -> Vec<KnownHost> {
    let mut entries = Vec::new();

    for (line_num, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line.starts_with('@') {
            debug!(line = line_num + 1, "Skipping known_hosts marker line");
            continue;
        }

        match KnownHost::parse_line(line) {
            Ok(entry) => entries.push(entry),
            Err(e) => warn!(line = line_num + 1, error = %e, "Skipping unparsable known_hosts line"),
        }
    }

    entries
}

/// Candidate known_hosts locations for the current user, in lookup order.
///
/// `~/ssh/known_hosts` is included for platforms where a directory named
/// `.ssh` is awkward to create.
pub fn default_known_hosts_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").or_else(|| std::env::var_os("USERPROFILE"));
    match home {
        Some(home) => {
            let home = PathBuf::from(home);
            vec![
                home.join(".ssh").join("known_hosts"),
                home.join("ssh").join("known_hosts"),
            ]
        }
        None => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_B64: &str = "AAAAC3NzaC1lZDI1NTE5AAAAIBRanDK33/M2A9M0Lc/TQ/pF5kfd8rplxF34cupZF1gD";

    fn key_data() -> Vec<u8> {
        base64::engine::general_purpose::STANDARD.decode(KEY_B64).unwrap()
    }

    #[test]
    fn test_parse_lines() {
        let entry = KnownHost::parse_line(&format!("example.com ssh-ed25519 {} user@host", KEY_B64)).unwrap();
        assert_eq!(entry.hostname_pattern(), "example.com");
        assert_eq!(entry.key_type(), "ssh-ed25519");
        assert_eq!(entry.comment(), "user@host");

        assert!(KnownHost::parse_line("# comment").is_err());
        assert!(KnownHost::parse_line("   ").is_err());
        assert!(KnownHost::parse_line("host ssh-ed25519 !!!").is_err());
    }

    #[test]
    fn test_wildcard_match() {
        assert!(wildcard_match("*.example.com", "host.example.com"));
        assert!(wildcard_match("*.example.com", "sub.host.example.com"));
        assert!(!wildcard_match("*.example.com", "example.com"));
        assert!(!wildcard_match("*.example.com", "other.com"));
        assert!(wildcard_match("host?.example.com", "host1.example.com"));
        assert!(!wildcard_match("host?.example.com", "host12.example.com"));
        assert!(wildcard_match("*", "anything"));
    }

    #[test]
    fn test_negated_pattern_wins() {
        let entry = KnownHost::new(
            "*.example.com,!bad.example.com".to_string(),
            "ssh-ed25519".to_string(),
            key_data(),
        );
        assert!(entry.matches("good.example.com", 22));
        assert!(!entry.matches("bad.example.com", 22));

        let reordered = KnownHost::new(
            "!bad.example.com,*.example.com".to_string(),
            "ssh-ed25519".to_string(),
            key_data(),
        );
        assert!(!reordered.matches("bad.example.com", 22));
    }

    #[test]
    fn test_port_patterns() {
        let file = KnownHostsFile::from_string(&format!("[example.com]:2222 ssh-ed25519 {}", KEY_B64));
        assert!(file.lookup("example.com", 2222).is_some());
        assert!(file.lookup("example.com", 22).is_none());
    }

    #[test]
    fn test_hashed_hostnames() {
        let hashed = hash_hostname("secret.example.com", b"0123456789abcdefghij").unwrap();
        let file = KnownHostsFile::from_string(&format!("{} ssh-ed25519 {}", hashed, KEY_B64));

        assert_eq!(
            file.lookup("secret.example.com", 22),
            Some(("ssh-ed25519".to_string(), key_data()))
        );
        assert!(file.lookup("other.example.com", 22).is_none());
    }

    #[test]
    fn test_lookup_prefers_ed25519() {
        let content = format!(
            "example.com ssh-rsa AAAAB3NzaC1yc2EAAAADAQABAAABAQC/\nexample.com ssh-ed25519 {}\n",
            KEY_B64
        );
        let file = KnownHostsFile::from_string(&content);
        let (key_type, blob) = file.lookup("example.com", 22).unwrap();
        assert_eq!(key_type, "ssh-ed25519");
        assert_eq!(blob, key_data());
    }

    #[test]
    fn test_check_policies() {
        let store = MemoryHostKeyStore::with_key("example.com", 22, "ssh-ed25519", &key_data());

        let status = check_host_key(&store, StrictHostKeyChecking::Strict, "example.com", 22, "ssh-ed25519", &key_data()).unwrap();
        assert_eq!(status, HostKeyStatus::Known);

        let result = check_host_key(&store, StrictHostKeyChecking::Strict, "new.com", 22, "ssh-ed25519", &key_data());
        assert!(matches!(result, Err(FerryError::HostKeyVerification(_))));

        let result = check_host_key(&store, StrictHostKeyChecking::AcceptNew, "example.com", 22, "ssh-ed25519", &[1, 2, 3]);
        assert!(matches!(result, Err(FerryError::HostKeyVerification(_))));

        let status = check_host_key(&store, StrictHostKeyChecking::No, "example.com", 22, "ssh-ed25519", &[1, 2, 3]).unwrap();
        assert!(matches!(status, HostKeyStatus::Changed { .. }));

        check_host_key(&store, StrictHostKeyChecking::AcceptNew, "new.com", 22, "ssh-ed25519", &[4, 5]).unwrap();
        assert_eq!(store.lookup("new.com", 22), Some(("ssh-ed25519".to_string(), vec![4, 5])));
    }

    #[test]
    fn test_remember_appends_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");

        let file = KnownHostsFile::open_or_create(&path).unwrap();
        file.remember("example.com", 2222, "ssh-ed25519", &key_data()).unwrap();

        let reloaded = KnownHostsFile::open(&path).unwrap();
        let entries = reloaded.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].hostname_pattern(), "[example.com]:2222");
        assert_eq!(entries[0].key_data(), key_data().as_slice());
    }

    #[test]
    fn test_save_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("known_hosts");

        let mut file = KnownHostsFile::new(&path);
        file.set_hash_new_entries(true);
        file.add_host("example.com", 22, "ssh-ed25519", &[1, 2, 3, 4]).unwrap();
        file.add_host("other.com", 22, "ssh-ed25519", &[5, 6, 7, 8]).unwrap();
        file.save().unwrap();

        let loaded = KnownHostsFile::open(&path).unwrap();
        assert!(loaded.entries()[0].hostname_pattern().starts_with("|1|"));
        assert_eq!(loaded.lookup("other.com", 22).unwrap().1, vec![5, 6, 7, 8]);

        assert_eq!(loaded.remove_host("example.com", 22), 1);
        assert_eq!(loaded.remove_host("nonexistent.com", 22), 0);
        assert_eq!(loaded.entries().len(), 1);
    }

    #[test]
    fn test_open_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent");
        assert!(matches!(KnownHostsFile::open(&path), Err(FerryError::Io(_))));
        assert!(KnownHostsFile::open_or_create(&path).unwrap().entries().is_empty());
    }
}
