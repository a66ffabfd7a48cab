//! SSH transport and SFTP subsystem.
//!
//! This crate provides an async SSH-2 client and server over any
//! `AsyncRead + AsyncWrite` stream, and an SFTP v3 client and server
//! running as a channel subsystem.
//!
//! # Features
//!
//! - `ssh` (default) - SSH transport, channels and SFTP
//! - `blocking` (default) - Synchronous wrappers owning a Tokio runtime
//!
//! # Example
//!
//! ```rust,no_run
//! use ferry_proto::ssh::auth::PasswordAuth;
//! use ferry_proto::ssh::client::{SshClient, SshClientConfig};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = SshClientConfig::new("alice");
//! config.auth_methods.push(Box::new(PasswordAuth::new("secret")));
//!
//! let mut client = SshClient::connect("example.com", 22, config).await?;
//! let sftp = client.sftp().await?;
//! sftp.put("report.pdf", "uploads/report.pdf").await?;
//! sftp.close().await;
//! client.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Security
//!
//! - All cryptographic primitives come from vetted crates (`ring`, `dalek`, RustCrypto)
//! - Constant-time comparisons for MACs and passwords
//! - Key material is zeroized with `zeroize`
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [SFTP Draft v3](https://datatracker.ietf.org/doc/html/draft-ietf-secsh-filexfer-02)

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

#[cfg(feature = "ssh")]
pub mod ssh;
