//! Remote file handles.

use super::client::{expect_attrs, expect_data, expect_status, Requester};
use super::message::Request;
use super::types::{FileAttributes, OpenMode};
use ferry_platform::{FerryError, FerryResult};
use std::io::SeekFrom;
use tracing::debug;

/// An open remote file.
///
/// Reads and writes start at the current position and advance it, like a
/// local file. Every call is one round trip, except `write`, which sends
/// data larger than the chunk size in several requests.
///
/// Dropping an open file closes it in the background.
pub struct File {
    requester: Requester,
    path: String,
    handle: Vec<u8>,
    mode: OpenMode,
    chunk_size: u32,
    position: u64,
    closed: bool,
}

impl std::fmt::Debug for File {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("File")
            .field("path", &self.path)
            .field("mode", &self.mode)
            .field("position", &self.position)
            .field("closed", &self.closed)
            .finish()
    }
}

impl File {
    pub(crate) fn new(
        requester: Requester,
        path: String,
        handle: Vec<u8>,
        mode: OpenMode,
        chunk_size: u32,
    ) -> Self {
        Self {
            requester,
            path,
            handle,
            mode,
            chunk_size,
            position: 0,
            closed: false,
        }
    }

    /// Remote path the file was opened with.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Mode the file was opened with.
    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// Current position.
    pub fn position(&self) -> u64 {
        self.position
    }

    pub(crate) fn handle(&self) -> &[u8] {
        &self.handle
    }

    fn check_open(&self) -> FerryResult<()> {
        if self.closed {
            return Err(FerryError::Protocol(format!("{} is closed", self.path)));
        }
        Ok(())
    }

    /// Reads up to `n` bytes at the current position.
    ///
    /// Returns an empty vector at end of file.
    pub async fn read(&mut self, n: u32) -> FerryResult<Vec<u8>> {
        let data = self.read_at(self.position, n).await?;
        self.position += data.len() as u64;
        Ok(data)
    }

    /// Reads up to `n` bytes at `offset` without moving the position.
    pub async fn read_at(&self, offset: u64, n: u32) -> FerryResult<Vec<u8>> {
        self.check_open()?;
        let request = Request::Read {
            handle: self.handle.clone(),
            offset,
            len: n,
        };
        Ok(expect_data(self.requester.call(request).await?, &self.path)?.unwrap_or_default())
    }

    /// Writes all of `data` at the current position.
    pub async fn write(&mut self, data: &[u8]) -> FerryResult<()> {
        self.write_at(self.position, data).await?;
        self.position += data.len() as u64;
        Ok(())
    }

    /// Writes all of `data` at `offset` without moving the position.
    pub async fn write_at(&self, offset: u64, data: &[u8]) -> FerryResult<()> {
        self.check_open()?;
        let mut at = offset;
        for chunk in data.chunks(self.chunk_size as usize) {
            let request = Request::Write {
                handle: self.handle.clone(),
                offset: at,
                data: chunk.to_vec(),
            };
            expect_status(self.requester.call(request).await?, &self.path)?;
            at += chunk.len() as u64;
        }
        Ok(())
    }

    /// Moves the position. Seeking from the end asks the server for the size.
    ///
    /// # Errors
    ///
    /// [`FerryError::Protocol`] if the new position would be negative.
    pub async fn seek(&mut self, pos: SeekFrom) -> FerryResult<u64> {
        let (base, delta) = match pos {
            SeekFrom::Start(offset) => {
                self.position = offset;
                return Ok(offset);
            }
            SeekFrom::Current(delta) => (self.position, delta),
            SeekFrom::End(delta) => {
                let size = self.stat().await?.size.ok_or_else(|| {
                    FerryError::Protocol(format!("Server did not report the size of {}", self.path))
                })?;
                (size, delta)
            }
        };
        self.position = base.checked_add_signed(delta).ok_or_else(|| {
            FerryError::Protocol(format!("Seek to a negative position in {}", self.path))
        })?;
        Ok(self.position)
    }

    /// Attributes of the open file.
    pub async fn stat(&self) -> FerryResult<FileAttributes> {
        self.check_open()?;
        let request = Request::Fstat {
            handle: self.handle.clone(),
        };
        expect_attrs(self.requester.call(request).await?, &self.path)
    }

    /// Changes attributes of the open file.
    pub async fn setstat(&self, attrs: FileAttributes) -> FerryResult<()> {
        self.check_open()?;
        let request = Request::Fsetstat {
            handle: self.handle.clone(),
            attrs,
        };
        expect_status(self.requester.call(request).await?, &self.path)
    }

    /// Closes the handle. Idempotent.
    pub async fn close(&mut self) -> FerryResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let request = Request::Close {
            handle: self.handle.clone(),
        };
        expect_status(self.requester.call(request).await?, &self.path)
    }
}

impl Drop for File {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(path = %self.path, "File dropped outside a runtime; handle left open");
            return;
        };
        let requester = self.requester.clone();
        let handle = std::mem::take(&mut self.handle);
        runtime.spawn(async move {
            if let Err(e) = requester.call(Request::Close { handle }).await {
                debug!(error = %e, "Background close failed");
            }
        });
    }
}
