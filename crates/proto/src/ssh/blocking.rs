//! Synchronous wrappers.
//!
//! Each [`SshClient`] owns a small Tokio runtime that keeps the session's
//! dispatcher running between calls. [`SftpSession`] and [`File`] share
//! their client's runtime and block on every call.
//!
//! These types must not be used from inside an async context.
//!
//! ```rust,no_run
//! use ferry_proto::ssh::auth::PasswordAuth;
//! use ferry_proto::ssh::blocking::SshClient;
//! use ferry_proto::ssh::client::SshClientConfig;
//!
//! # fn main() -> ferry_platform::FerryResult<()> {
//! let mut config = SshClientConfig::new("alice");
//! config.auth_methods.push(Box::new(PasswordAuth::new("secret")));
//!
//! let mut client = SshClient::connect("example.com", 22, config)?;
//! let sftp = client.sftp()?;
//! for name in sftp.listdir(".")? {
//!     println!("{}", name);
//! }
//! sftp.close();
//! client.close();
//! # Ok(())
//! # }
//! ```

use crate::ssh::client::{SshClient as AsyncSshClient, SshClientConfig};
use crate::ssh::session::SshSession;
use crate::ssh::sftp::{
    DirEntry, File as AsyncFile, FileAttributes, OpenMode, SftpConfig,
    SftpSession as AsyncSftpSession,
};
use ferry_platform::{FerryError, FerryResult};
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use tokio::runtime::Runtime;

fn runtime() -> FerryResult<Arc<Runtime>> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("ferry-blocking")
        .enable_all()
        .build()
        .map_err(FerryError::Io)?;
    Ok(Arc::new(runtime))
}

/// Blocking SSH client.
#[derive(Debug)]
pub struct SshClient {
    runtime: Arc<Runtime>,
    inner: AsyncSshClient,
}

impl SshClient {
    /// Connects and authenticates.
    pub fn connect(host: &str, port: u16, config: SshClientConfig) -> FerryResult<Self> {
        let runtime = runtime()?;
        let inner = runtime.block_on(AsyncSshClient::connect(host, port, config))?;
        Ok(Self { runtime, inner })
    }

    /// The underlying session.
    pub fn session(&self) -> &SshSession {
        self.inner.session()
    }

    /// Runs a key exchange now.
    pub fn rekey(&self) -> FerryResult<()> {
        self.runtime.block_on(self.inner.session().rekey())
    }

    /// Starts an SFTP session.
    pub fn sftp(&self) -> FerryResult<SftpSession> {
        let inner = self.runtime.block_on(self.inner.sftp())?;
        Ok(SftpSession {
            runtime: Arc::clone(&self.runtime),
            inner,
        })
    }

    /// Starts an SFTP session with explicit settings.
    pub fn sftp_with_config(&self, config: SftpConfig) -> FerryResult<SftpSession> {
        let inner = self.runtime.block_on(self.inner.sftp_with_config(config))?;
        Ok(SftpSession {
            runtime: Arc::clone(&self.runtime),
            inner,
        })
    }

    /// Closes the connection. Best-effort and idempotent.
    pub fn close(&mut self) {
        self.runtime.block_on(self.inner.close());
    }
}

/// Blocking SFTP session.
#[derive(Debug)]
pub struct SftpSession {
    runtime: Arc<Runtime>,
    inner: AsyncSftpSession,
}

impl SftpSession {
    /// Names in a directory, without `.` and `..`.
    pub fn listdir(&self, path: &str) -> FerryResult<Vec<String>> {
        self.runtime.block_on(self.inner.listdir(path))
    }

    /// Directory entries with attributes.
    pub fn listdir_attr(&self, path: &str) -> FerryResult<Vec<DirEntry>> {
        self.runtime.block_on(self.inner.listdir_attr(path))
    }

    /// Creates a directory.
    pub fn mkdir(&self, path: &str, mode: u32) -> FerryResult<()> {
        self.runtime.block_on(self.inner.mkdir(path, mode))
    }

    /// Removes an empty directory.
    pub fn rmdir(&self, path: &str) -> FerryResult<()> {
        self.runtime.block_on(self.inner.rmdir(path))
    }

    /// Removes a file.
    pub fn remove(&self, path: &str) -> FerryResult<()> {
        self.runtime.block_on(self.inner.remove(path))
    }

    /// Renames a file or directory.
    pub fn rename(&self, old_path: &str, new_path: &str) -> FerryResult<()> {
        self.runtime.block_on(self.inner.rename(old_path, new_path))
    }

    /// Attributes, following symlinks.
    pub fn stat(&self, path: &str) -> FerryResult<FileAttributes> {
        self.runtime.block_on(self.inner.stat(path))
    }

    /// Attributes of the path itself.
    pub fn lstat(&self, path: &str) -> FerryResult<FileAttributes> {
        self.runtime.block_on(self.inner.lstat(path))
    }

    /// Changes attributes.
    pub fn setstat(&self, path: &str, attrs: FileAttributes) -> FerryResult<()> {
        self.runtime.block_on(self.inner.setstat(path, attrs))
    }

    /// Canonical absolute path.
    pub fn realpath(&self, path: &str) -> FerryResult<String> {
        self.runtime.block_on(self.inner.realpath(path))
    }

    /// Target of a symbolic link.
    pub fn readlink(&self, path: &str) -> FerryResult<String> {
        self.runtime.block_on(self.inner.readlink(path))
    }

    /// Creates `link` pointing at `target`.
    pub fn symlink(&self, target: &str, link: &str) -> FerryResult<()> {
        self.runtime.block_on(self.inner.symlink(target, link))
    }

    /// Opens a remote file.
    pub fn open(&self, path: &str, mode: OpenMode) -> FerryResult<File> {
        let inner = self.runtime.block_on(self.inner.open(path, mode))?;
        Ok(File {
            runtime: Arc::clone(&self.runtime),
            inner,
        })
    }

    /// Uploads a local file.
    pub fn put(&self, local: impl AsRef<Path>, remote: &str) -> FerryResult<u64> {
        self.runtime.block_on(self.inner.put(local, remote))
    }

    /// Downloads a remote file.
    pub fn get(&self, remote: &str, local: impl AsRef<Path>) -> FerryResult<u64> {
        self.runtime.block_on(self.inner.get(remote, local))
    }

    /// Writes `data` to a remote file.
    pub fn put_bytes(&self, data: &[u8], remote: &str) -> FerryResult<u64> {
        self.runtime.block_on(self.inner.put_bytes(data, remote))
    }

    /// Reads a whole remote file.
    pub fn get_bytes(&self, remote: &str) -> FerryResult<Vec<u8>> {
        self.runtime.block_on(self.inner.get_bytes(remote))
    }

    /// Ends the SFTP session.
    pub fn close(&self) {
        self.runtime.block_on(self.inner.close());
    }
}

/// Blocking remote file.
#[derive(Debug)]
pub struct File {
    runtime: Arc<Runtime>,
    inner: AsyncFile,
}

impl File {
    /// Reads up to `n` bytes; empty at end of file.
    pub fn read(&mut self, n: u32) -> FerryResult<Vec<u8>> {
        self.runtime.block_on(self.inner.read(n))
    }

    /// Reads up to `n` bytes at `offset`.
    pub fn read_at(&self, offset: u64, n: u32) -> FerryResult<Vec<u8>> {
        self.runtime.block_on(self.inner.read_at(offset, n))
    }

    /// Writes all of `data` at the current position.
    pub fn write(&mut self, data: &[u8]) -> FerryResult<()> {
        self.runtime.block_on(self.inner.write(data))
    }

    /// Writes all of `data` at `offset`.
    pub fn write_at(&self, offset: u64, data: &[u8]) -> FerryResult<()> {
        self.runtime.block_on(self.inner.write_at(offset, data))
    }

    /// Moves the position.
    pub fn seek(&mut self, pos: SeekFrom) -> FerryResult<u64> {
        self.runtime.block_on(self.inner.seek(pos))
    }

    /// Attributes of the open file.
    pub fn stat(&self) -> FerryResult<FileAttributes> {
        self.runtime.block_on(self.inner.stat())
    }

    /// Closes the handle.
    pub fn close(&mut self) -> FerryResult<()> {
        self.runtime.block_on(self.inner.close())
    }
}

impl Drop for File {
    fn drop(&mut self) {
        // No-op when already closed
        if let Err(e) = self.runtime.block_on(self.inner.close()) {
            tracing::debug!(path = self.inner.path(), error = %e, "Close on drop failed");
        }
    }
}
