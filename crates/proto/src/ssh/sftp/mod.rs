//! SFTP v3 (SSH File Transfer Protocol).
//!
//! SFTP runs as the `sftp` subsystem of a session channel:
//!
//! ```text
//! Client                          Server
//!   |                               |
//!   |-- SSH_MSG_CHANNEL_OPEN ------>|
//!   |<- SSH_MSG_CHANNEL_OPEN_CONF --|
//!   |-- SSH_MSG_CHANNEL_REQUEST --->|  (subsystem "sftp")
//!   |<- SSH_MSG_CHANNEL_SUCCESS ----|
//!   |                               |
//!   |-- SSH_FXP_INIT -------------->|
//!   |<- SSH_FXP_VERSION ------------|
//!   |                               |
//!   |-- SSH_FXP_OPEN (id 1) ------->|
//!   |<- SSH_FXP_HANDLE (id 1) ------|
//!   |-- SSH_FXP_WRITE (id 2) ------>|
//!   |-- SSH_FXP_WRITE (id 3) ------>|
//!   |<- SSH_FXP_STATUS (id 3) ------|
//!   |<- SSH_FXP_STATUS (id 2) ------|
//! ```
//!
//! [`SftpSession`] is the client and [`SftpServer`] serves a local
//! directory.
//!
//! # References
//!
//! - [SFTP Draft v3](https://datatracker.ietf.org/doc/html/draft-ietf-secsh-filexfer-02)

pub mod client;
pub mod file;
pub mod message;
pub mod server;
pub mod types;

pub use client::{SftpConfig, SftpSession};
pub use file::File;
pub use message::{SftpMessage, SftpMessageType};
pub use server::SftpServer;
pub use types::{DirEntry, FileAttributes, FileType, OpenMode, StatusCode};

/// Subsystem name requested on the channel.
pub const SFTP_SUBSYSTEM: &str = "sftp";
