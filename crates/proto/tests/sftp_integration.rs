//! Integration tests for the SFTP client against the in-crate SFTP server.

use ferry_platform::FerryError;
use ferry_proto::ssh::auth::{PasswordAuth, StaticAuthPolicy};
use ferry_proto::ssh::client::{SshClient, SshClientConfig};
use ferry_proto::ssh::hostkey::Ed25519KeyPair;
use ferry_proto::ssh::known_hosts::{MemoryHostKeyStore, StrictHostKeyChecking};
use ferry_proto::ssh::server::{SshServer, SshServerConfig};
use ferry_proto::ssh::sftp::message::{decode_message, encode_message, FrameBuffer, SftpMessage};
use ferry_proto::ssh::sftp::{FileAttributes, OpenMode, SftpConfig, SftpSession};
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};

fn server_config() -> SshServerConfig {
    SshServerConfig::new(
        Arc::new(Ed25519KeyPair::generate()),
        Arc::new(StaticAuthPolicy::new().with_password("alice", "secret")),
    )
}

fn client_config() -> SshClientConfig {
    let mut config = SshClientConfig::new("alice");
    config.strict_host_key_checking = StrictHostKeyChecking::No;
    config.host_key_store = Some(Arc::new(MemoryHostKeyStore::new()));
    config
        .auth_methods
        .push(Box::new(PasswordAuth::new("secret")));
    config
}

struct Fixture {
    client: SshClient,
    sftp: SftpSession,
    server: JoinHandle<()>,
}

/// Starts an SFTP server rooted at `root` and connects a client to it.
async fn start(root: &Path, config: SftpConfig) -> Fixture {
    let (client_io, server_io) = tokio::io::duplex(256 * 1024);
    let server = SshServer::new(server_config()).unwrap();
    let root = root.to_path_buf();
    let server = tokio::spawn(async move {
        let _ = server.serve_sftp(server_io, root).await;
    });

    let client = SshClient::connect_stream(client_io, "sftp-host", 22, client_config())
        .await
        .unwrap();
    let sftp = client.sftp_with_config(config).await.unwrap();
    Fixture {
        client,
        sftp,
        server,
    }
}

impl Fixture {
    async fn finish(mut self) {
        self.sftp.close().await;
        self.client.close().await;
        let _ = timeout(Duration::from_secs(5), self.server).await;
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 256) as u8).collect()
}

#[tokio::test]
async fn test_put_then_get_bytes() {
    let root = tempfile::tempdir().unwrap();
    let fixture = start(root.path(), SftpConfig::default()).await;
    assert_eq!(fixture.sftp.version(), 3);

    let data = pattern(10_000);
    assert_eq!(fixture.sftp.put_bytes(&data, "blob.bin").await.unwrap(), 10_000);
    assert_eq!(std::fs::read(root.path().join("blob.bin")).unwrap(), data);
    assert_eq!(fixture.sftp.get_bytes("blob.bin").await.unwrap(), data);

    fixture.finish().await;
}

#[tokio::test]
async fn test_pipelined_chunks_reassemble() {
    let root = tempfile::tempdir().unwrap();
    let config = SftpConfig {
        chunk_size: 1000,
        pipeline_depth: 4,
        ..SftpConfig::default()
    };
    let fixture = start(root.path(), config).await;

    // Ends mid-chunk
    let data = pattern(10_500);
    fixture.sftp.put_bytes(&data, "chunks.bin").await.unwrap();
    assert_eq!(std::fs::read(root.path().join("chunks.bin")).unwrap(), data);
    assert_eq!(fixture.sftp.get_bytes("chunks.bin").await.unwrap(), data);

    // Exactly on a chunk boundary, and empty
    let even = pattern(4000);
    fixture.sftp.put_bytes(&even, "even.bin").await.unwrap();
    assert_eq!(fixture.sftp.get_bytes("even.bin").await.unwrap(), even);
    fixture.sftp.put_bytes(&[], "empty.bin").await.unwrap();
    assert!(fixture.sftp.get_bytes("empty.bin").await.unwrap().is_empty());

    fixture.finish().await;
}

#[tokio::test]
async fn test_put_and_get_local_files() {
    let root = tempfile::tempdir().unwrap();
    let local = tempfile::tempdir().unwrap();
    let fixture = start(root.path(), SftpConfig::default()).await;

    let source = local.path().join("source.bin");
    let data = pattern(100_000);
    std::fs::write(&source, &data).unwrap();

    assert_eq!(fixture.sftp.put(&source, "remote.bin").await.unwrap(), 100_000);
    let copy = local.path().join("copy.bin");
    assert_eq!(fixture.sftp.get("remote.bin", &copy).await.unwrap(), 100_000);
    assert_eq!(std::fs::read(&copy).unwrap(), data);

    fixture.finish().await;
}

#[tokio::test]
async fn test_directory_operations() {
    let root = tempfile::tempdir().unwrap();
    let fixture = start(root.path(), SftpConfig::default()).await;
    let sftp = &fixture.sftp;

    sftp.mkdir("demo_sftp_folder", 0o755).await.unwrap();
    assert!(sftp.stat("demo_sftp_folder").await.unwrap().is_dir());
    sftp.put_bytes(b"hello\n", "demo_sftp_folder/README").await.unwrap();

    let names = sftp.listdir("demo_sftp_folder").await.unwrap();
    assert_eq!(names, vec!["README".to_string()]);
    let entries = sftp.listdir_attr(".").await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].filename, "demo_sftp_folder");
    assert!(entries[0].longname.starts_with('d'));

    let attrs = sftp.stat("demo_sftp_folder/README").await.unwrap();
    assert_eq!(attrs.size, Some(6));
    assert!(attrs.is_file());

    sftp.rename("demo_sftp_folder/README", "demo_sftp_folder/README.old")
        .await
        .unwrap();
    assert!(matches!(
        sftp.stat("demo_sftp_folder/README").await,
        Err(FerryError::NoSuchFile(_))
    ));

    // Not empty yet
    assert!(sftp.rmdir("demo_sftp_folder").await.is_err());
    sftp.remove("demo_sftp_folder/README.old").await.unwrap();
    sftp.rmdir("demo_sftp_folder").await.unwrap();
    assert!(sftp.listdir(".").await.unwrap().is_empty());

    assert_eq!(sftp.realpath(".").await.unwrap(), "/");
    assert_eq!(sftp.realpath("a/../b").await.unwrap(), "/b");

    fixture.finish().await;
}

#[tokio::test]
async fn test_setstat_changes_size() {
    let root = tempfile::tempdir().unwrap();
    let fixture = start(root.path(), SftpConfig::default()).await;

    fixture.sftp.put_bytes(&pattern(500), "f").await.unwrap();
    let attrs = FileAttributes {
        size: Some(100),
        ..FileAttributes::new()
    };
    fixture.sftp.setstat("f", attrs).await.unwrap();
    assert_eq!(fixture.sftp.stat("f").await.unwrap().size, Some(100));

    fixture.finish().await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_symlinks() {
    let root = tempfile::tempdir().unwrap();
    let fixture = start(root.path(), SftpConfig::default()).await;
    let sftp = &fixture.sftp;

    sftp.put_bytes(b"target", "target.txt").await.unwrap();
    sftp.symlink("target.txt", "link.txt").await.unwrap();

    assert_eq!(sftp.readlink("link.txt").await.unwrap(), "target.txt");
    assert!(sftp.lstat("link.txt").await.unwrap().is_symlink());
    assert!(sftp.stat("link.txt").await.unwrap().is_file());
    assert_eq!(sftp.get_bytes("link.txt").await.unwrap(), b"target");

    fixture.finish().await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_symlink_cannot_leave_root() {
    let outside = tempfile::tempdir().unwrap();
    let secret = outside.path().join("secret.txt");
    std::fs::write(&secret, b"outside-the-root").unwrap();

    let root = tempfile::tempdir().unwrap();
    let fixture = start(root.path(), SftpConfig::default()).await;
    let sftp = &fixture.sftp;

    let result = sftp.symlink(&secret.to_string_lossy(), "escape").await;
    assert!(matches!(result, Err(FerryError::PermissionDenied(_))), "{:?}", result);
    assert!(matches!(
        sftp.get_bytes("escape").await,
        Err(FerryError::NoSuchFile(_))
    ));

    // Relative links inside the root still work
    sftp.mkdir("sub", 0o755).await.unwrap();
    sftp.put_bytes(b"inside", "top.txt").await.unwrap();
    sftp.symlink("../top.txt", "sub/up.txt").await.unwrap();
    assert_eq!(sftp.get_bytes("sub/up.txt").await.unwrap(), b"inside");

    fixture.finish().await;
}

#[tokio::test]
async fn test_file_handle() {
    let root = tempfile::tempdir().unwrap();
    let fixture = start(root.path(), SftpConfig::default()).await;

    let mut file = fixture.sftp.open("notes.txt", "w+".parse().unwrap()).await.unwrap();
    file.write(b"hello world").await.unwrap();
    assert_eq!(file.position(), 11);

    assert_eq!(file.seek(SeekFrom::Start(6)).await.unwrap(), 6);
    assert_eq!(file.read(100).await.unwrap(), b"world");
    assert!(file.read(100).await.unwrap().is_empty());

    assert_eq!(file.seek(SeekFrom::End(-5)).await.unwrap(), 6);
    file.write_at(0, b"HELLO").await.unwrap();
    assert_eq!(file.read_at(0, 5).await.unwrap(), b"HELLO");
    assert_eq!(file.stat().await.unwrap().size, Some(11));
    assert!(file.seek(SeekFrom::Current(-100)).await.is_err());

    file.close().await.unwrap();
    file.close().await.unwrap();
    assert!(file.read(1).await.is_err());

    let mut appender = fixture.sftp.open("notes.txt", OpenMode::WRITE | OpenMode::APPEND).await.unwrap();
    appender.write(b"!").await.unwrap();
    appender.close().await.unwrap();
    assert_eq!(fixture.sftp.get_bytes("notes.txt").await.unwrap(), b"HELLO world!");

    fixture.finish().await;
}

#[tokio::test]
async fn test_error_mapping() {
    let root = tempfile::tempdir().unwrap();
    let fixture = start(root.path(), SftpConfig::default()).await;
    let sftp = &fixture.sftp;

    assert!(matches!(
        sftp.get_bytes("missing.txt").await,
        Err(FerryError::NoSuchFile(_))
    ));
    assert!(matches!(
        sftp.open("exists.txt", OpenMode::READ).await,
        Err(FerryError::NoSuchFile(_))
    ));
    sftp.put_bytes(b"x", "exists.txt").await.unwrap();
    assert!(matches!(
        sftp.open("exists.txt", "x".parse().unwrap()).await,
        Err(FerryError::SftpStatus { code: 4, .. })
    ));

    // The session stays usable after failed requests
    assert_eq!(sftp.listdir("/").await.unwrap(), vec!["exists.txt".to_string()]);

    fixture.finish().await;
}

#[tokio::test]
async fn test_concurrent_requests_share_session() {
    let root = tempfile::tempdir().unwrap();
    let fixture = start(root.path(), SftpConfig::default()).await;
    let sftp = &fixture.sftp;

    let round_trip = |i: usize| async move {
        let data = pattern(50_000 + i);
        let name = format!("file{}", i);
        sftp.put_bytes(&data, &name).await.unwrap();
        assert_eq!(sftp.get_bytes(&name).await.unwrap(), data);
    };
    tokio::join!(round_trip(0), round_trip(1), round_trip(2), round_trip(3));
    assert_eq!(sftp.listdir(".").await.unwrap().len(), 4);

    fixture.finish().await;
}

#[tokio::test]
async fn test_stream_close_fails_pending_listdir() {
    let (client_io, server_io) = tokio::io::duplex(256 * 1024);
    let server = SshServer::new(server_config()).unwrap();

    // Answers INIT, then goes away once the first request arrives
    let server = tokio::spawn(async move {
        let accepted = server.accept(server_io).await.unwrap();
        let (_, channel) = accepted.session.accept_subsystem().await.unwrap();
        let mut frames = FrameBuffer::new();
        let mut answered = false;
        loop {
            while let Some(body) = frames.next_frame().unwrap() {
                match decode_message(&body).unwrap() {
                    SftpMessage::Init { .. } => {
                        let version = SftpMessage::Version {
                            version: 3,
                            extensions: Vec::new(),
                        };
                        channel.send(&encode_message(&version)).await.unwrap();
                        answered = true;
                    }
                    SftpMessage::Request { .. } if answered => {
                        drop(channel);
                        drop(accepted);
                        return;
                    }
                    other => panic!("unexpected {:?}", other),
                }
            }
            match channel.receive().await.unwrap() {
                Some(data) => frames.extend(&data),
                None => return,
            }
        }
    });

    let client = SshClient::connect_stream(client_io, "sftp-host", 22, client_config())
        .await
        .unwrap();
    let sftp = client.sftp().await.unwrap();

    let result = timeout(Duration::from_secs(5), sftp.listdir("."))
        .await
        .expect("listdir must not hang");
    assert!(matches!(result, Err(FerryError::SessionClosed)));
    server.await.unwrap();

    // Later calls fail the same way
    assert!(matches!(sftp.stat(".").await, Err(FerryError::SessionClosed)));
}

#[tokio::test]
async fn test_request_timeout_leaves_session_usable() {
    let (client_io, server_io) = tokio::io::duplex(256 * 1024);
    let server = SshServer::new(server_config()).unwrap();

    // Ignores the first request, answers the rest with OK
    let server = tokio::spawn(async move {
        let accepted = server.accept(server_io).await.unwrap();
        let (_, channel) = accepted.session.accept_subsystem().await.unwrap();
        let mut frames = FrameBuffer::new();
        let mut seen = 0;
        while let Some(data) = channel.receive().await.unwrap() {
            frames.extend(&data);
            while let Some(body) = frames.next_frame().unwrap() {
                let reply = match decode_message(&body).unwrap() {
                    SftpMessage::Init { .. } => SftpMessage::Version {
                        version: 3,
                        extensions: Vec::new(),
                    },
                    SftpMessage::Request { id, .. } => {
                        seen += 1;
                        if seen == 1 {
                            continue;
                        }
                        SftpMessage::Response {
                            id,
                            response: ferry_proto::ssh::sftp::message::Response::ok(),
                        }
                    }
                    other => panic!("unexpected {:?}", other),
                };
                channel.send(&encode_message(&reply)).await.unwrap();
            }
        }
        accepted
    });

    let mut client = SshClient::connect_stream(client_io, "sftp-host", 22, client_config())
        .await
        .unwrap();
    let config = SftpConfig {
        request_timeout: Duration::from_millis(300),
        ..SftpConfig::default()
    };
    let sftp = client.sftp_with_config(config).await.unwrap();

    assert!(matches!(sftp.remove("a").await, Err(FerryError::Timeout(_))));
    sftp.remove("b").await.unwrap();

    sftp.close().await;
    client.close().await;
    let _ = server.await;
}

#[test]
fn test_blocking_facade() {
    let root = tempfile::tempdir().unwrap();
    let server_runtime = tokio::runtime::Runtime::new().unwrap();
    let listener = server_runtime
        .block_on(tokio::net::TcpListener::bind("127.0.0.1:0"))
        .unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = Arc::new(SshServer::new(server_config()).unwrap());
    server_runtime.spawn(server.listen_sftp(listener, root.path().to_path_buf()));

    let mut client =
        ferry_proto::ssh::blocking::SshClient::connect("127.0.0.1", port, client_config()).unwrap();
    let sftp = client.sftp().unwrap();

    sftp.mkdir("dir", 0o700).unwrap();
    sftp.put_bytes(b"blocking", "dir/file").unwrap();
    assert_eq!(sftp.get_bytes("dir/file").unwrap(), b"blocking");
    assert_eq!(sftp.listdir("dir").unwrap(), vec!["file".to_string()]);

    let mut file = sftp.open("dir/file", OpenMode::READ).unwrap();
    assert_eq!(file.read(4).unwrap(), b"bloc");
    file.close().unwrap();

    sftp.close();
    client.close();
}
