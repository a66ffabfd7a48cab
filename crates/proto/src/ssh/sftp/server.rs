//! SFTP v3 server over a local directory.
//!
//! Client paths are resolved below a root directory. `..` never climbs
//! above the root, and absolute paths start at it.

use super::message::{
    decode_message, encode_message, request_id, FrameBuffer, Request, Response, SftpMessage,
    SFTP_VERSION,
};
use super::types::{DirEntry, FileAttributes, OpenMode, StatusCode};
use crate::ssh::channel::Channel;
use ferry_platform::{FerryError, FerryResult};
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Largest read answered in one DATA message.
const MAX_READ_LEN: u32 = 64 * 1024;

/// Directory entries per NAME message.
const READDIR_BATCH: usize = 100;

enum Handle {
    File { file: fs::File, path: PathBuf },
    Dir { entries: Vec<DirEntry> },
}

type Outcome = Result<Response, Response>;

fn io_status(err: std::io::Error) -> Response {
    let code = StatusCode::for_io(&err);
    Response::status(code as u32, &err.to_string())
}

fn status(code: StatusCode) -> Response {
    Response::status(code as u32, code.message())
}

/// Serves one SFTP session from a root directory.
#[derive(Debug)]
pub struct SftpServer {
    root: PathBuf,
    handles: HashMap<u32, Handle>,
    next_handle: u32,
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Handle::File { path, .. } => write!(f, "File({})", path.display()),
            Handle::Dir { entries } => write!(f, "Dir({} left)", entries.len()),
        }
    }
}

impl SftpServer {
    /// Creates a server rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            handles: HashMap::new(),
            next_handle: 0,
        }
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Answers requests on `channel` until the client closes it.
    ///
    /// The first message must be INIT. Requests are answered in order.
    pub async fn serve(mut self, channel: Channel) -> FerryResult<()> {
        let mut frames = FrameBuffer::new();
        let mut initialized = false;

        let result = loop {
            let body = match frames.next_frame() {
                Ok(Some(body)) => body,
                Ok(None) => match channel.receive().await {
                    Ok(Some(data)) => {
                        frames.extend(&data);
                        continue;
                    }
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(e),
                },
                Err(e) => break Err(e),
            };

            let reply = match decode_message(&body) {
                Ok(SftpMessage::Init { version }) if !initialized => {
                    initialized = true;
                    info!(
                        channel = channel.local_id(),
                        client_version = version,
                        root = %self.root.display(),
                        "SFTP client connected"
                    );
                    SftpMessage::Version {
                        version: SFTP_VERSION,
                        extensions: Vec::new(),
                    }
                }
                Ok(SftpMessage::Request { id, request }) if initialized => {
                    let response = self.handle(request).await;
                    SftpMessage::Response { id, response }
                }
                Ok(other) => {
                    break Err(FerryError::Protocol(format!(
                        "Unexpected SFTP message {:?}",
                        other
                    )))
                }
                Err(e) => match request_id(&body) {
                    Some(id) if initialized => {
                        debug!(request_id = id, error = %e, "Refusing SFTP request");
                        SftpMessage::Response {
                            id,
                            response: status(StatusCode::OpUnsupported),
                        }
                    }
                    _ => break Err(e),
                },
            };

            if let Err(e) = channel.send(&encode_message(&reply)).await {
                break Err(e);
            }
        };

        self.handles.clear();
        if let Err(e) = channel.close().await {
            debug!(error = %e, "SFTP channel close failed");
        }
        debug!(channel = channel.local_id(), "SFTP session ended");
        result
    }

    /// Answers one request.
    pub async fn handle(&mut self, request: Request) -> Response {
        let name = request.name();
        match self.dispatch(request).await {
            Ok(response) => response,
            Err(response) => {
                if let Response::Status { code, message, .. } = &response {
                    debug!(request = name, code, message = %message, "SFTP request failed");
                }
                response
            }
        }
    }

    async fn dispatch(&mut self, request: Request) -> Outcome {
        match request {
            Request::Open { path, mode, attrs } => self.open(&path, mode, &attrs).await,
            Request::Close { handle } => self.close(&handle).await,
            Request::Read {
                handle,
                offset,
                len,
            } => self.read(&handle, offset, len).await,
            Request::Write {
                handle,
                offset,
                data,
            } => self.write(&handle, offset, &data).await,
            Request::Lstat { path } => {
                let meta = fs::symlink_metadata(self.resolve(&path)).await.map_err(io_status)?;
                Ok(Response::Attrs(FileAttributes::from_metadata(&meta)))
            }
            Request::Stat { path } => {
                let meta = fs::metadata(self.resolve(&path)).await.map_err(io_status)?;
                Ok(Response::Attrs(FileAttributes::from_metadata(&meta)))
            }
            Request::Fstat { handle } => {
                let file = self.file(&handle)?;
                let meta = file.metadata().await.map_err(io_status)?;
                Ok(Response::Attrs(FileAttributes::from_metadata(&meta)))
            }
            Request::Setstat { path, attrs } => {
                apply_attrs(self.resolve(&path), attrs).await?;
                Ok(Response::ok())
            }
            Request::Fsetstat { handle, attrs } => {
                let path = match self.handles.get(&decode_handle(&handle)?) {
                    Some(Handle::File { path, .. }) => path.clone(),
                    _ => return Err(status(StatusCode::Failure)),
                };
                apply_attrs(path, attrs).await?;
                Ok(Response::ok())
            }
            Request::Opendir { path } => self.opendir(&path).await,
            Request::Readdir { handle } => self.readdir(&handle),
            Request::Remove { path } => {
                fs::remove_file(self.resolve(&path)).await.map_err(io_status)?;
                Ok(Response::ok())
            }
            Request::Mkdir { path, attrs } => {
                let target = self.resolve(&path);
                fs::create_dir(&target).await.map_err(io_status)?;
                if let Some(mode) = attrs.permissions {
                    set_mode(&target, mode).await?;
                }
                Ok(Response::ok())
            }
            Request::Rmdir { path } => {
                fs::remove_dir(self.resolve(&path)).await.map_err(io_status)?;
                Ok(Response::ok())
            }
            Request::Realpath { path } => {
                let virtual_path = virtual_path(&path);
                Ok(Response::Name(vec![DirEntry {
                    longname: virtual_path.clone(),
                    filename: virtual_path,
                    attrs: FileAttributes::new(),
                }]))
            }
            Request::Rename { old_path, new_path } => {
                let (from, to) = (self.resolve(&old_path), self.resolve(&new_path));
                // v3 rename never replaces
                if fs::symlink_metadata(&to).await.is_ok() {
                    return Err(Response::status(
                        StatusCode::Failure as u32,
                        "Target exists",
                    ));
                }
                fs::rename(from, to).await.map_err(io_status)?;
                Ok(Response::ok())
            }
            Request::Readlink { path } => {
                let target = fs::read_link(self.resolve(&path)).await.map_err(io_status)?;
                let target = target.to_string_lossy().into_owned();
                Ok(Response::Name(vec![DirEntry {
                    longname: target.clone(),
                    filename: target,
                    attrs: FileAttributes::new(),
                }]))
            }
            Request::Symlink { target, link } => self.symlink(&target, &link).await,
        }
    }

    /// Maps a client path below the root.
    fn resolve(&self, path: &str) -> PathBuf {
        let mut resolved = self.root.clone();
        for part in normalize(path) {
            resolved.push(part);
        }
        resolved
    }

    fn insert(&mut self, handle: Handle) -> Response {
        let mut id = self.next_handle;
        while self.handles.contains_key(&id) {
            id = id.wrapping_add(1);
        }
        self.next_handle = id.wrapping_add(1);
        self.handles.insert(id, handle);
        Response::Handle(id.to_string().into_bytes())
    }

    fn file(&mut self, handle: &[u8]) -> Result<&mut fs::File, Response> {
        match self.handles.get_mut(&decode_handle(handle)?) {
            Some(Handle::File { file, .. }) => Ok(file),
            _ => Err(status(StatusCode::Failure)),
        }
    }

    async fn open(&mut self, path: &str, mode: OpenMode, attrs: &FileAttributes) -> Outcome {
        let target = self.resolve(path);
        let mut options = fs::OpenOptions::new();
        options
            .read(mode.is_read())
            .write(mode.is_write() && !mode.contains(OpenMode::APPEND))
            .append(mode.contains(OpenMode::APPEND));
        if mode.contains(OpenMode::CREATE) {
            if mode.contains(OpenMode::EXCLUSIVE) {
                options.create_new(true);
            } else {
                options.create(true);
            }
        }
        if mode.contains(OpenMode::TRUNCATE) {
            options.truncate(true);
        }
        #[cfg(unix)]
        if let Some(permissions) = attrs.permissions {
            options.mode(permissions & 0o7777);
        }
        #[cfg(not(unix))]
        let _ = attrs;

        let file = options.open(&target).await.map_err(io_status)?;
        debug!(path = %target.display(), flags = mode.bits(), "Opened file");
        Ok(self.insert(Handle::File { file, path: target }))
    }

    async fn close(&mut self, handle: &[u8]) -> Outcome {
        match self.handles.remove(&decode_handle(handle)?) {
            Some(Handle::File { mut file, .. }) => {
                file.flush().await.map_err(io_status)?;
                Ok(Response::ok())
            }
            Some(Handle::Dir { .. }) => Ok(Response::ok()),
            None => Err(status(StatusCode::Failure)),
        }
    }

    async fn read(&mut self, handle: &[u8], offset: u64, len: u32) -> Outcome {
        let file = self.file(handle)?;
        file.seek(SeekFrom::Start(offset)).await.map_err(io_status)?;

        let mut data = vec![0u8; len.min(MAX_READ_LEN) as usize];
        let mut filled = 0;
        while filled < data.len() {
            let n = file.read(&mut data[filled..]).await.map_err(io_status)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 && len > 0 {
            return Err(status(StatusCode::Eof));
        }
        data.truncate(filled);
        Ok(Response::Data(data))
    }

    async fn write(&mut self, handle: &[u8], offset: u64, data: &[u8]) -> Outcome {
        let file = self.file(handle)?;
        file.seek(SeekFrom::Start(offset)).await.map_err(io_status)?;
        file.write_all(data).await.map_err(io_status)?;
        Ok(Response::ok())
    }

    async fn opendir(&mut self, path: &str) -> Outcome {
        let target = self.resolve(path);
        let mut reader = fs::read_dir(&target).await.map_err(io_status)?;

        let mut entries = Vec::new();
        for dot in [".", ".."] {
            if let Ok(meta) = fs::metadata(&target).await {
                entries.push(DirEntry::new(dot, FileAttributes::from_metadata(&meta)));
            }
        }
        while let Some(entry) = reader.next_entry().await.map_err(io_status)? {
            let attrs = match entry.metadata().await {
                Ok(meta) => FileAttributes::from_metadata(&meta),
                Err(e) => {
                    warn!(path = %entry.path().display(), error = %e, "Skipping unreadable entry");
                    continue;
                }
            };
            entries.push(DirEntry::new(entry.file_name().to_string_lossy(), attrs));
        }
        // Served back to front
        entries.reverse();
        Ok(self.insert(Handle::Dir { entries }))
    }

    fn readdir(&mut self, handle: &[u8]) -> Outcome {
        match self.handles.get_mut(&decode_handle(handle)?) {
            Some(Handle::Dir { entries }) if entries.is_empty() => Err(status(StatusCode::Eof)),
            Some(Handle::Dir { entries }) => {
                let keep = entries.len().saturating_sub(READDIR_BATCH);
                let mut batch = entries.split_off(keep);
                batch.reverse();
                Ok(Response::Name(batch))
            }
            _ => Err(status(StatusCode::Failure)),
        }
    }

    async fn symlink(&self, target: &str, link: &str) -> Outcome {
        if !target_stays_below_root(link, target) {
            warn!(link, target, "Refusing symlink out of the SFTP root");
            return Err(status(StatusCode::PermissionDenied));
        }
        let link = self.resolve(link);
        #[cfg(unix)]
        {
            fs::symlink(target, &link).await.map_err(io_status)?;
            Ok(Response::ok())
        }
        #[cfg(not(unix))]
        {
            let _ = (target, link);
            Err(status(StatusCode::OpUnsupported))
        }
    }
}

fn decode_handle(handle: &[u8]) -> Result<u32, Response> {
    std::str::from_utf8(handle)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| status(StatusCode::Failure))
}

/// Path components after resolving `.` and `..` lexically.
fn normalize(path: &str) -> Vec<String> {
    let mut parts: Vec<String> = Vec::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::ParentDir => {
                parts.pop();
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    parts
}

/// Whether a relative symlink `target`, followed from the directory holding
/// `link`, resolves inside the root. Absolute targets never do.
fn target_stays_below_root(link: &str, target: &str) -> bool {
    let mut parts = normalize(link);
    parts.pop();
    for component in Path::new(target).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return false;
                }
            }
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => return false,
        }
    }
    true
}

/// Absolute path as the client sees it.
fn virtual_path(path: &str) -> String {
    format!("/{}", normalize(path).join("/"))
}

async fn set_mode(path: &Path, mode: u32) -> Result<(), Response> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o7777))
            .await
            .map_err(io_status)
    }
    #[cfg(not(unix))]
    {
        let mut permissions = fs::metadata(path).await.map_err(io_status)?.permissions();
        permissions.set_readonly(mode & 0o200 == 0);
        fs::set_permissions(path, permissions).await.map_err(io_status)
    }
}

async fn apply_attrs(path: PathBuf, attrs: FileAttributes) -> Result<(), Response> {
    if let Some(size) = attrs.size {
        let file = fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .await
            .map_err(io_status)?;
        file.set_len(size).await.map_err(io_status)?;
    }
    if let Some(mode) = attrs.permissions {
        set_mode(&path, mode).await?;
    }
    if let (Some(atime), Some(mtime)) = (attrs.atime, attrs.mtime) {
        let at = |secs: u32| std::time::UNIX_EPOCH + std::time::Duration::from_secs(u64::from(secs));
        let times = std::fs::FileTimes::new()
            .set_accessed(at(atime))
            .set_modified(at(mtime));
        let target = path.clone();
        tokio::task::spawn_blocking(move || {
            std::fs::File::options()
                .write(true)
                .open(&target)
                .and_then(|file| file.set_times(times))
        })
        .await
        .map_err(|e| Response::status(StatusCode::Failure as u32, &e.to_string()))?
        .map_err(io_status)?;
    }
    if attrs.uid.is_some() || attrs.gid.is_some() {
        debug!(path = %path.display(), "Ignoring ownership change");
    }
    Ok(())
}
