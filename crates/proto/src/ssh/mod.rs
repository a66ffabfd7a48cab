//! SSH (Secure Shell) protocol implementation.
//!
//! This module implements the SSH protocol according to RFC 4251-4254 and
//! the SFTP v3 subsystem on top of it.
//!
//! # Architecture
//!
//! The SSH implementation is layered:
//!
//! 1. **Packet Layer** ([`packet`]) - Binary packet protocol (RFC 4253 Section 6)
//! 2. **Crypto Layer** ([`crypto`]) - Ciphers, MACs and per-direction contexts
//! 3. **Transport Layer** ([`transport`]) - Version exchange, key exchange, rekeying (RFC 4253)
//! 4. **Authentication Layer** ([`auth`], [`gssapi`]) - User authentication (RFC 4252, RFC 4462)
//! 5. **Connection Layer** ([`connection`], [`channel`]) - Channels and flow control (RFC 4254)
//! 6. **Session** ([`session`]) - Dispatcher task, shared writer, keep-alive
//! 7. **Client/Server APIs** ([`client`], [`server`], [`sftp`])
//!
//! # Security Considerations
//!
//! - **Input Validation**: All packet parsing validates size limits (max 35000 bytes)
//! - **Constant-Time Operations**: MAC and password comparisons are constant-time
//! - **Memory Safety**: Key material is zeroized on drop using [`zeroize`]
//! - **Modern Algorithms**: Prefers ChaCha20-Poly1305, Curve25519, Ed25519
//!
//! # Example
//!
//! ```rust
//! use ferry_proto::ssh::Packet;
//!
//! let packet = Packet::new(b"SSH-MSG-KEXINIT payload".to_vec(), 8, false).unwrap();
//! let bytes = packet.to_bytes();
//!
//! let parsed = Packet::from_bytes(&bytes, 8, false).unwrap();
//! assert_eq!(parsed.payload(), b"SSH-MSG-KEXINIT payload");
//! ```
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4252](https://datatracker.ietf.org/doc/html/rfc4252) - SSH Authentication Protocol
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - SSH Connection Protocol

pub mod auth;
#[cfg(feature = "blocking")]
pub mod blocking;
pub mod channel;
pub mod client;
pub mod connection;
pub mod crypto;
pub(crate) mod dispatcher;
pub mod gssapi;
pub mod hostkey;
pub mod kex;
pub mod kex_dh;
pub mod known_hosts;
pub mod logging;
pub mod message;
pub mod packet;
pub mod server;
pub mod session;
pub mod sftp;
pub mod transport;
pub mod version;
pub mod wire;

// Re-export main types
pub use auth::{
    AuthContext, AuthDecision, AuthMethod, AuthOutcome, AuthPolicy, KeyboardInteractiveAuth,
    KeyboardInteractiveResponder, PasswordAuth, PublicKeyAuth, StaticAuthPolicy,
};
pub use channel::{Channel, ChannelState};
pub use client::{SshClient, SshClientConfig};
pub use connection::{ChannelOpenFailureReason, ChannelType};
pub use gssapi::{GssAcceptor, GssApiAuth, GssMechanism, GssStep};
pub use crypto::{CipherAlgorithm, MacAlgorithm};
pub use hostkey::{Ed25519KeyPair, KeyPair, PublicKey};
pub use kex::{AlgorithmPreferences, AlgorithmSuite};
pub use known_hosts::{
    HostKeyStore, KnownHostsFile, MemoryHostKeyStore, StrictHostKeyChecking,
};
pub use message::{DisconnectReason, MessageType};
pub use packet::Packet;
pub use server::{AcceptedSession, SshServer, SshServerConfig};
pub use session::SshSession;
pub use sftp::{SftpConfig, SftpServer, SftpSession};
pub use transport::{RekeyPolicy, Role, Transport, TransportState};
pub use version::Version;
