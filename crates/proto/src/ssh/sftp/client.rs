//! SFTP client.
//!
//! An [`SftpSession`] owns one channel running the `sftp` subsystem. Calls
//! register a pending request under a fresh ID, send it, and wait for the
//! response with that ID. A reader task routes every response to its
//! waiter, so any number of requests can be in flight at once.

use super::file::File;
use super::message::{
    decode_message, encode_message, request_id, FrameBuffer, Request, Response, SftpMessage,
    SFTP_VERSION,
};
use super::types::{status_error, DirEntry, FileAttributes, OpenMode, StatusCode};
use super::SFTP_SUBSYSTEM;
use crate::ssh::channel::Channel;
use crate::ssh::logging;
use crate::ssh::session::SshSession;
use ferry_platform::{FerryError, FerryResult};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default transfer chunk size.
pub const DEFAULT_CHUNK_SIZE: u32 = 32 * 1024;

/// Default number of chunk requests in flight during a transfer.
pub const DEFAULT_PIPELINE_DEPTH: usize = 16;

/// Largest chunk a transfer may use. Leaves room for the message header.
pub const MAX_CHUNK_SIZE: u32 = 255 * 1024;

/// SFTP session settings.
#[derive(Debug, Clone)]
pub struct SftpConfig {
    /// Bytes per read or write request in `put`/`get`.
    pub chunk_size: u32,
    /// Requests sent before the first response is awaited.
    pub pipeline_depth: usize,
    /// How long one request may wait for its response.
    pub request_timeout: Duration,
}

impl Default for SftpConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            pipeline_depth: DEFAULT_PIPELINE_DEPTH,
            request_timeout: Duration::from_secs(60),
        }
    }
}

impl SftpConfig {
    /// Checks the settings.
    pub fn validate(&self) -> FerryResult<()> {
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(FerryError::Config(format!(
                "SFTP chunk size must be between 1 and {} bytes",
                MAX_CHUNK_SIZE
            )));
        }
        if self.pipeline_depth == 0 {
            return Err(FerryError::Config(
                "SFTP pipeline depth must be at least 1".to_string(),
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(FerryError::Config(
                "SFTP request timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

struct Pending {
    kind: &'static str,
    reply: oneshot::Sender<FerryResult<Response>>,
}

#[derive(Default)]
struct PendingTable {
    next_id: u32,
    waiters: HashMap<u32, Pending>,
    closed: bool,
}

/// Requests awaiting a response, keyed by request ID.
#[derive(Default)]
struct RequestTable {
    inner: Mutex<PendingTable>,
}

impl RequestTable {
    /// Takes the next ID that is not in flight and registers a waiter.
    fn register(&self, kind: &'static str) -> FerryResult<(u32, oneshot::Receiver<FerryResult<Response>>)> {
        let mut table = self.inner.lock();
        if table.closed {
            return Err(FerryError::SessionClosed);
        }
        let mut id = table.next_id;
        while table.waiters.contains_key(&id) {
            id = id.wrapping_add(1);
        }
        table.next_id = id.wrapping_add(1);

        let (reply, answer) = oneshot::channel();
        table.waiters.insert(id, Pending { kind, reply });
        Ok((id, answer))
    }

    fn complete(&self, id: u32, result: FerryResult<Response>) {
        let pending = self.inner.lock().waiters.remove(&id);
        match pending {
            // The waiter may have timed out; nothing to do then
            Some(pending) => {
                let _ = pending.reply.send(result);
            }
            None => warn!(request_id = id, "Response for unknown SFTP request"),
        }
    }

    fn cancel(&self, id: u32) {
        self.inner.lock().waiters.remove(&id);
    }

    fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Fails every waiter with `SessionClosed` and refuses new requests.
    fn close(&self) {
        let waiters = {
            let mut table = self.inner.lock();
            table.closed = true;
            std::mem::take(&mut table.waiters)
        };
        for (id, pending) in waiters {
            debug!(request_id = id, kind = pending.kind, "Failing pending SFTP request");
            let _ = pending.reply.send(Err(FerryError::SessionClosed));
        }
    }

    #[cfg(test)]
    fn in_flight(&self) -> usize {
        self.inner.lock().waiters.len()
    }
}

/// A request that has been sent and not yet answered.
pub(crate) struct InFlight {
    id: u32,
    answer: oneshot::Receiver<FerryResult<Response>>,
}

/// Sends requests and waits for their responses. Cheap to clone.
#[derive(Clone)]
pub(crate) struct Requester {
    channel: Arc<Channel>,
    table: Arc<RequestTable>,
    timeout: Duration,
}

impl Requester {
    pub(crate) async fn issue(&self, request: Request) -> FerryResult<InFlight> {
        let (id, answer) = self.table.register(request.name())?;
        let frame = encode_message(&SftpMessage::Request { id, request });
        if let Err(e) = self.channel.send(&frame).await {
            self.table.cancel(id);
            return Err(if self.table.is_closed() {
                FerryError::SessionClosed
            } else {
                e
            });
        }
        Ok(InFlight { id, answer })
    }

    pub(crate) async fn wait(&self, request: InFlight) -> FerryResult<Response> {
        let InFlight { id, answer } = request;
        let response = match tokio::time::timeout(self.timeout, answer).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => return Err(FerryError::SessionClosed),
            Err(_) => {
                self.table.cancel(id);
                return Err(FerryError::Timeout(format!("SFTP request {}", id)));
            }
        };
        if let Response::Status { code, message, .. } = &response {
            if *code != StatusCode::Ok as u32 {
                logging::log_sftp_status(id, *code, message);
            }
        }
        Ok(response)
    }

    pub(crate) async fn call(&self, request: Request) -> FerryResult<Response> {
        let in_flight = self.issue(request).await?;
        self.wait(in_flight).await
    }
}

pub(crate) fn expect_status(response: Response, context: &str) -> FerryResult<()> {
    match response {
        Response::Status { code: 0, .. } => Ok(()),
        Response::Status { code, message, .. } => Err(status_error(code, &message, context)),
        other => Err(unexpected(&other)),
    }
}

pub(crate) fn expect_handle(response: Response, context: &str) -> FerryResult<Vec<u8>> {
    match response {
        Response::Handle(handle) => Ok(handle),
        other => Err(other_than_status(other, context)),
    }
}

pub(crate) fn expect_attrs(response: Response, context: &str) -> FerryResult<FileAttributes> {
    match response {
        Response::Attrs(attrs) => Ok(attrs),
        other => Err(other_than_status(other, context)),
    }
}

/// `None` at end of file.
pub(crate) fn expect_data(response: Response, context: &str) -> FerryResult<Option<Vec<u8>>> {
    match response {
        Response::Data(data) => Ok(Some(data)),
        Response::Status { code: 1, .. } => Ok(None),
        other => Err(other_than_status(other, context)),
    }
}

/// `None` at the end of a directory listing.
fn expect_names(response: Response, context: &str) -> FerryResult<Option<Vec<DirEntry>>> {
    match response {
        Response::Name(entries) => Ok(Some(entries)),
        Response::Status { code: 1, .. } => Ok(None),
        other => Err(other_than_status(other, context)),
    }
}

fn expect_single_name(response: Response, context: &str) -> FerryResult<String> {
    match response {
        Response::Name(mut entries) if entries.len() == 1 => Ok(entries.remove(0).filename),
        Response::Name(entries) => Err(FerryError::Protocol(format!(
            "Expected one name, got {}",
            entries.len()
        ))),
        other => Err(other_than_status(other, context)),
    }
}

fn other_than_status(response: Response, context: &str) -> FerryError {
    match response {
        Response::Status { code: 0, .. } => unexpected(&response),
        Response::Status { code, message, .. } => status_error(code, &message, context),
        other => unexpected(&other),
    }
}

fn unexpected(response: &Response) -> FerryError {
    FerryError::Protocol(format!("Unexpected SFTP response {:?}", response.message_type()))
}

/// Reads until `buf` is full or the reader is exhausted.
async fn read_chunk<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> FerryResult<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn chunk_failed(offset: u64, len: u32, err: FerryError) -> FerryError {
    match err {
        // Whole-session failures are not about this chunk
        FerryError::SessionClosed | FerryError::Timeout(_) => err,
        other => FerryError::TransferFailed {
            offset,
            len,
            source: Box::new(other),
        },
    }
}

/// SFTP v3 session over one channel.
///
/// # Example
///
/// ```rust,no_run
/// # use ferry_proto::ssh::sftp::SftpSession;
/// # async fn demo(sftp: &SftpSession) -> ferry_platform::FerryResult<()> {
/// sftp.put_bytes(b"hello", "greeting.txt").await?;
/// assert_eq!(sftp.get_bytes("greeting.txt").await?, b"hello");
/// for entry in sftp.listdir_attr(".").await? {
///     println!("{}", entry);
/// }
/// # Ok(())
/// # }
/// ```
pub struct SftpSession {
    requester: Requester,
    config: SftpConfig,
    version: u32,
    extensions: Vec<(String, String)>,
    reader: JoinHandle<()>,
}

impl std::fmt::Debug for SftpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftpSession")
            .field("channel", &self.requester.channel.local_id())
            .field("version", &self.version)
            .field("config", &self.config)
            .finish()
    }
}

impl SftpSession {
    /// Opens a session channel, starts the `sftp` subsystem and negotiates
    /// the protocol version.
    ///
    /// # Errors
    ///
    /// - [`FerryError::ChannelOpenFailed`] if the server refuses the channel
    ///   or the subsystem
    /// - [`FerryError::IncompatibleVersion`] if the server speaks another
    ///   SFTP version
    pub async fn start(session: &SshSession, config: SftpConfig) -> FerryResult<Self> {
        config.validate()?;
        let channel = session.open_session_channel().await?;
        if let Err(e) = channel.request_subsystem(SFTP_SUBSYSTEM).await {
            let _ = channel.close().await;
            return Err(e);
        }
        Self::from_channel(channel, config).await
    }

    /// Runs the SFTP version exchange on a channel whose subsystem has
    /// already been started.
    pub async fn from_channel(channel: Channel, config: SftpConfig) -> FerryResult<Self> {
        config.validate()?;
        let channel = Arc::new(channel);
        let mut frames = FrameBuffer::new();

        channel
            .send(&encode_message(&SftpMessage::Init {
                version: SFTP_VERSION,
            }))
            .await?;
        let (version, extensions) =
            tokio::time::timeout(config.request_timeout, read_version(&channel, &mut frames))
                .await
                .map_err(|_| FerryError::Timeout("SFTP version exchange".to_string()))??;
        if version != SFTP_VERSION {
            let _ = channel.close().await;
            return Err(FerryError::IncompatibleVersion(format!(
                "SFTP server speaks version {}, expected {}",
                version, SFTP_VERSION
            )));
        }
        info!(
            channel = channel.local_id(),
            version,
            extensions = extensions.len(),
            "SFTP session started"
        );

        let table = Arc::new(RequestTable::default());
        let reader = tokio::spawn(route_responses(
            Arc::clone(&channel),
            Arc::clone(&table),
            frames,
        ));

        Ok(Self {
            requester: Requester {
                channel,
                table,
                timeout: config.request_timeout,
            },
            config,
            version,
            extensions,
            reader,
        })
    }

    /// Negotiated protocol version.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Extensions announced by the server.
    pub fn extensions(&self) -> &[(String, String)] {
        &self.extensions
    }

    /// Session settings.
    pub fn config(&self) -> &SftpConfig {
        &self.config
    }

    /// Names in a directory, without `.` and `..`.
    pub async fn listdir(&self, path: &str) -> FerryResult<Vec<String>> {
        Ok(self
            .listdir_attr(path)
            .await?
            .into_iter()
            .map(|entry| entry.filename)
            .collect())
    }

    /// Entries of a directory with their attributes, without `.` and `..`.
    pub async fn listdir_attr(&self, path: &str) -> FerryResult<Vec<DirEntry>> {
        let handle = expect_handle(
            self.requester
                .call(Request::Opendir {
                    path: path.to_string(),
                })
                .await?,
            path,
        )?;

        let listing = self.read_dir(&handle, path).await;
        let closed = self.close_handle(handle, path).await;
        let mut entries = listing?;
        closed?;

        entries.retain(|entry| entry.filename != "." && entry.filename != "..");
        debug!(path, entries = entries.len(), "Listed directory");
        Ok(entries)
    }

    async fn read_dir(&self, handle: &[u8], path: &str) -> FerryResult<Vec<DirEntry>> {
        let mut entries = Vec::new();
        loop {
            let response = self
                .requester
                .call(Request::Readdir {
                    handle: handle.to_vec(),
                })
                .await?;
            match expect_names(response, path)? {
                Some(batch) => entries.extend(batch),
                None => return Ok(entries),
            }
        }
    }

    pub(crate) async fn close_handle(&self, handle: Vec<u8>, context: &str) -> FerryResult<()> {
        expect_status(self.requester.call(Request::Close { handle }).await?, context)
    }

    /// Creates a directory with permission bits `mode`.
    pub async fn mkdir(&self, path: &str, mode: u32) -> FerryResult<()> {
        let request = Request::Mkdir {
            path: path.to_string(),
            attrs: FileAttributes::with_permissions(mode),
        };
        expect_status(self.requester.call(request).await?, path)
    }

    /// Removes an empty directory.
    pub async fn rmdir(&self, path: &str) -> FerryResult<()> {
        let request = Request::Rmdir {
            path: path.to_string(),
        };
        expect_status(self.requester.call(request).await?, path)
    }

    /// Removes a file.
    pub async fn remove(&self, path: &str) -> FerryResult<()> {
        let request = Request::Remove {
            path: path.to_string(),
        };
        expect_status(self.requester.call(request).await?, path)
    }

    /// Renames a file or directory. Fails if `new_path` exists.
    pub async fn rename(&self, old_path: &str, new_path: &str) -> FerryResult<()> {
        let request = Request::Rename {
            old_path: old_path.to_string(),
            new_path: new_path.to_string(),
        };
        expect_status(self.requester.call(request).await?, old_path)
    }

    /// Attributes of `path`, following symlinks.
    pub async fn stat(&self, path: &str) -> FerryResult<FileAttributes> {
        let request = Request::Stat {
            path: path.to_string(),
        };
        expect_attrs(self.requester.call(request).await?, path)
    }

    /// Attributes of `path` itself.
    pub async fn lstat(&self, path: &str) -> FerryResult<FileAttributes> {
        let request = Request::Lstat {
            path: path.to_string(),
        };
        expect_attrs(self.requester.call(request).await?, path)
    }

    /// Changes the attributes present in `attrs`.
    pub async fn setstat(&self, path: &str, attrs: FileAttributes) -> FerryResult<()> {
        let request = Request::Setstat {
            path: path.to_string(),
            attrs,
        };
        expect_status(self.requester.call(request).await?, path)
    }

    /// Canonical absolute form of `path`.
    pub async fn realpath(&self, path: &str) -> FerryResult<String> {
        let request = Request::Realpath {
            path: path.to_string(),
        };
        expect_single_name(self.requester.call(request).await?, path)
    }

    /// Target of a symbolic link.
    pub async fn readlink(&self, path: &str) -> FerryResult<String> {
        let request = Request::Readlink {
            path: path.to_string(),
        };
        expect_single_name(self.requester.call(request).await?, path)
    }

    /// Creates a symbolic link at `link` pointing to `target`.
    pub async fn symlink(&self, target: &str, link: &str) -> FerryResult<()> {
        let request = Request::Symlink {
            target: target.to_string(),
            link: link.to_string(),
        };
        expect_status(self.requester.call(request).await?, link)
    }

    /// Opens a remote file.
    ///
    /// ```rust,no_run
    /// # use ferry_proto::ssh::sftp::{OpenMode, SftpSession};
    /// # async fn demo(sftp: &SftpSession) -> ferry_platform::FerryResult<()> {
    /// let mut file = sftp.open("notes.txt", "a".parse()?).await?;
    /// file.write(b"one more line\n").await?;
    /// file.close().await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn open(&self, path: &str, mode: OpenMode) -> FerryResult<File> {
        let request = Request::Open {
            path: path.to_string(),
            mode,
            attrs: FileAttributes::new(),
        };
        let handle = expect_handle(self.requester.call(request).await?, path)?;
        debug!(path, mode = mode.bits(), "Opened remote file");
        Ok(File::new(
            self.requester.clone(),
            path.to_string(),
            handle,
            mode,
            self.config.chunk_size,
        ))
    }

    /// Uploads a local file. Returns the number of bytes written.
    pub async fn put(&self, local: impl AsRef<Path>, remote: &str) -> FerryResult<u64> {
        let mut source = tokio::fs::File::open(local.as_ref()).await?;
        self.upload(&mut source, remote).await
    }

    /// Downloads a remote file. Returns the number of bytes read.
    pub async fn get(&self, remote: &str, local: impl AsRef<Path>) -> FerryResult<u64> {
        let mut target = tokio::fs::File::create(local.as_ref()).await?;
        let n = self.download(remote, &mut target).await?;
        target.flush().await?;
        Ok(n)
    }

    /// Writes `data` to a remote file, replacing it.
    pub async fn put_bytes(&self, data: &[u8], remote: &str) -> FerryResult<u64> {
        let mut source = data;
        self.upload(&mut source, remote).await
    }

    /// Reads a whole remote file.
    pub async fn get_bytes(&self, remote: &str) -> FerryResult<Vec<u8>> {
        let mut data = Vec::new();
        self.download(remote, &mut data).await?;
        Ok(data)
    }

    /// Streams `source` into a remote file with pipelined writes.
    ///
    /// # Errors
    ///
    /// [`FerryError::TransferFailed`] names the first chunk the server
    /// rejected.
    pub async fn upload<R>(&self, source: &mut R, remote: &str) -> FerryResult<u64>
    where
        R: AsyncRead + Unpin,
    {
        let mut file = self
            .open(remote, OpenMode::WRITE | OpenMode::CREATE | OpenMode::TRUNCATE)
            .await?;
        let written = self.write_pipelined(file.handle(), source).await;
        let closed = file.close().await;
        let written = written?;
        closed?;
        info!(path = remote, bytes = written, "Upload complete");
        Ok(written)
    }

    /// Streams a remote file into `target` with pipelined reads.
    pub async fn download<W>(&self, remote: &str, target: &mut W) -> FerryResult<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let mut file = self.open(remote, OpenMode::READ).await?;
        let read = self.read_pipelined(file.handle(), target).await;
        let closed = file.close().await;
        let read = read?;
        closed?;
        info!(path = remote, bytes = read, "Download complete");
        Ok(read)
    }

    async fn write_pipelined<R>(&self, handle: &[u8], source: &mut R) -> FerryResult<u64>
    where
        R: AsyncRead + Unpin,
    {
        let chunk = self.config.chunk_size as usize;
        let mut queue: VecDeque<(u64, u32, InFlight)> = VecDeque::new();
        let mut offset = 0u64;
        let mut exhausted = false;

        loop {
            while !exhausted && queue.len() < self.config.pipeline_depth {
                let mut data = vec![0u8; chunk];
                let n = read_chunk(source, &mut data).await?;
                if n < chunk {
                    exhausted = true;
                }
                if n == 0 {
                    break;
                }
                data.truncate(n);
                let request = Request::Write {
                    handle: handle.to_vec(),
                    offset,
                    data,
                };
                let in_flight = self
                    .requester
                    .issue(request)
                    .await
                    .map_err(|e| chunk_failed(offset, n as u32, e))?;
                queue.push_back((offset, n as u32, in_flight));
                offset += n as u64;
            }

            let Some((at, len, in_flight)) = queue.pop_front() else {
                return Ok(offset);
            };
            let response = self
                .requester
                .wait(in_flight)
                .await
                .map_err(|e| chunk_failed(at, len, e))?;
            expect_status(response, "").map_err(|e| chunk_failed(at, len, e))?;
        }
    }

    async fn read_pipelined<W>(&self, handle: &[u8], target: &mut W) -> FerryResult<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let chunk = self.config.chunk_size;
        let mut queue: VecDeque<(u64, u32, InFlight)> = VecDeque::new();
        let mut next = 0u64;
        let mut written = 0u64;
        let mut eof = false;

        loop {
            while !eof && queue.len() < self.config.pipeline_depth {
                let in_flight = self.issue_read(handle, next, chunk).await?;
                queue.push_back((next, chunk, in_flight));
                next += u64::from(chunk);
            }

            let Some((at, len, in_flight)) = queue.pop_front() else {
                return Ok(written);
            };
            let response = self
                .requester
                .wait(in_flight)
                .await
                .map_err(|e| chunk_failed(at, len, e))?;

            match expect_data(response, "").map_err(|e| chunk_failed(at, len, e))? {
                Some(data) if data.len() > len as usize => {
                    return Err(chunk_failed(
                        at,
                        len,
                        FerryError::Protocol(format!(
                            "Server returned {} bytes for a {} byte read",
                            data.len(),
                            len
                        )),
                    ));
                }
                Some(data) => {
                    target.write_all(&data).await?;
                    written += data.len() as u64;
                    let got = data.len() as u32;
                    if got < len && !data.is_empty() {
                        // Short read: ask for the rest before anything later
                        let rest = at + u64::from(got);
                        let in_flight = self.issue_read(handle, rest, len - got).await?;
                        queue.push_front((rest, len - got, in_flight));
                    } else if data.is_empty() {
                        eof = true;
                        queue.clear();
                    }
                }
                None => {
                    // Everything after the end was requested too; the
                    // reader task discards those answers.
                    eof = true;
                    queue.clear();
                }
            }
        }
    }

    async fn issue_read(&self, handle: &[u8], offset: u64, len: u32) -> FerryResult<InFlight> {
        let request = Request::Read {
            handle: handle.to_vec(),
            offset,
            len,
        };
        self.requester
            .issue(request)
            .await
            .map_err(|e| chunk_failed(offset, len, e))
    }

    /// Ends the session and closes its channel.
    ///
    /// Idempotent and best-effort; failures are logged.
    pub async fn close(&self) {
        self.requester.table.close();
        if let Err(e) = self.requester.channel.send_eof().await {
            debug!(error = %e, "SFTP EOF not sent");
        }
        if let Err(e) = self.requester.channel.close().await {
            logging::log_teardown_failure("sftp channel close", &e.to_string());
        }
        self.reader.abort();
    }
}

impl Drop for SftpSession {
    fn drop(&mut self) {
        self.requester.table.close();
        self.reader.abort();
    }
}

async fn read_version(
    channel: &Channel,
    frames: &mut FrameBuffer,
) -> FerryResult<(u32, Vec<(String, String)>)> {
    loop {
        if let Some(body) = frames.next_frame()? {
            return match decode_message(&body)? {
                SftpMessage::Version {
                    version,
                    extensions,
                } => Ok((version, extensions)),
                other => Err(FerryError::Protocol(format!(
                    "Expected SFTP VERSION, got {:?}",
                    other
                ))),
            };
        }
        match channel.receive().await? {
            Some(data) => frames.extend(&data),
            None => return Err(FerryError::SessionClosed),
        }
    }
}

/// Routes responses to waiters until the channel ends.
async fn route_responses(channel: Arc<Channel>, table: Arc<RequestTable>, mut frames: FrameBuffer) {
    let reason = loop {
        match frames.next_frame() {
            Ok(Some(body)) => {
                route_frame(&table, &body);
                continue;
            }
            Ok(None) => {}
            Err(e) => break e.to_string(),
        }
        match channel.receive().await {
            Ok(Some(data)) => frames.extend(&data),
            Ok(None) => break "channel closed by peer".to_string(),
            Err(e) => break e.to_string(),
        }
    };

    debug!(channel = channel.local_id(), reason = %reason, "SFTP reader stopped");
    table.close();
    let _ = channel.close().await;
}

fn route_frame(table: &RequestTable, body: &[u8]) {
    match decode_message(body) {
        Ok(SftpMessage::Response { id, response }) => table.complete(id, Ok(response)),
        Ok(other) => warn!(message = ?other, "Unexpected SFTP message from server"),
        Err(e) => match request_id(body) {
            Some(id) => table.complete(id, Err(e)),
            None => warn!(error = %e, "Undecodable SFTP message"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validate() {
        assert!(SftpConfig::default().validate().is_ok());

        let mut config = SftpConfig::default();
        config.chunk_size = 0;
        assert!(matches!(config.validate(), Err(FerryError::Config(_))));

        let mut config = SftpConfig::default();
        config.chunk_size = MAX_CHUNK_SIZE + 1;
        assert!(config.validate().is_err());

        let mut config = SftpConfig::default();
        config.pipeline_depth = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ids_skip_pending() {
        let table = RequestTable::default();
        table.inner.lock().next_id = u32::MAX;

        let (a, _ra) = table.register("stat").unwrap();
        let (b, _rb) = table.register("stat").unwrap();
        assert_eq!(a, u32::MAX);
        assert_eq!(b, 0);

        // Wrap around onto a still-pending ID
        table.inner.lock().next_id = u32::MAX;
        let (c, _rc) = table.register("stat").unwrap();
        assert_eq!(c, 1);
        assert_eq!(table.in_flight(), 3);
    }

    #[tokio::test]
    async fn test_responses_routed_by_id() {
        let table = RequestTable::default();
        let (first, first_rx) = table.register("read").unwrap();
        let (second, second_rx) = table.register("read").unwrap();

        table.complete(second, Ok(Response::Data(vec![2])));
        table.complete(first, Ok(Response::Data(vec![1])));

        assert_eq!(first_rx.await.unwrap().unwrap(), Response::Data(vec![1]));
        assert_eq!(second_rx.await.unwrap().unwrap(), Response::Data(vec![2]));
        assert_eq!(table.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_close_fails_waiters() {
        let table = RequestTable::default();
        let (_, rx) = table.register("opendir").unwrap();
        table.close();

        assert!(matches!(rx.await.unwrap(), Err(FerryError::SessionClosed)));
        assert!(matches!(
            table.register("stat"),
            Err(FerryError::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn test_unknown_response_type_fails_its_request() {
        let table = RequestTable::default();
        let (id, rx) = table.register("stat").unwrap();
        let mut body = vec![200];
        body.extend_from_slice(&id.to_be_bytes());

        route_frame(&table, &body);
        assert!(matches!(
            rx.await.unwrap(),
            Err(FerryError::UnsupportedOperation(_))
        ));
    }

    #[test]
    fn test_status_mapping() {
        assert!(expect_status(Response::ok(), "x").is_ok());
        assert!(matches!(
            expect_status(Response::status(2, "gone"), "/a"),
            Err(FerryError::NoSuchFile(p)) if p == "/a"
        ));
        assert!(matches!(
            expect_attrs(Response::status(3, "no"), "/a"),
            Err(FerryError::PermissionDenied(_))
        ));
        assert!(matches!(
            expect_handle(Response::ok(), "/a"),
            Err(FerryError::Protocol(_))
        ));
        assert_eq!(expect_data(Response::status(1, "eof"), "").unwrap(), None);
    }

    #[test]
    fn test_chunk_failure_keeps_session_errors() {
        assert!(matches!(
            chunk_failed(0, 10, FerryError::SessionClosed),
            FerryError::SessionClosed
        ));
        match chunk_failed(65536, 32768, FerryError::PermissionDenied("x".into())) {
            FerryError::TransferFailed { offset, len, .. } => {
                assert_eq!(offset, 65536);
                assert_eq!(len, 32768);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_chunk_fills() {
        let data = vec![5u8; 100];
        let mut reader = &data[..];
        let mut buf = [0u8; 64];
        assert_eq!(read_chunk(&mut reader, &mut buf).await.unwrap(), 64);
        assert_eq!(read_chunk(&mut reader, &mut buf).await.unwrap(), 36);
        assert_eq!(read_chunk(&mut reader, &mut buf).await.unwrap(), 0);
    }
}
