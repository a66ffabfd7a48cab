//! Integration tests for SSH client-server communication.
//!
//! The client and the in-crate server run over an in-memory duplex stream
//! and validate the complete protocol flow:
//! - Version exchange
//! - Key exchange with host key verification
//! - Authentication
//! - Channels, rekeying and disconnect

use ferry_platform::{FerryError, FerryResult};
use async_trait::async_trait;
use ferry_proto::ssh::auth::{AuthAttempt, AuthPolicy, PasswordAuth, PublicKeyAuth, StaticAuthPolicy};
use ferry_proto::ssh::gssapi::{GssAcceptor, GssApiAuth, GssMechanism, GssStep};
use ferry_proto::ssh::client::{SshClient, SshClientConfig};
use ferry_proto::ssh::hostkey::{Ed25519KeyPair, KeyPair};
use ferry_proto::ssh::known_hosts::{HostKeyStore, MemoryHostKeyStore, StrictHostKeyChecking};
use ferry_proto::ssh::server::{AcceptedSession, SshServer, SshServerConfig};
use ferry_proto::ssh::transport::TransportState;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Arc;
use tokio::time::{timeout, Duration};

const HOST: &str = "test-host";
const PORT: u16 = 2222;

fn server_config(host_key: Arc<Ed25519KeyPair>) -> SshServerConfig {
    SshServerConfig::new(
        host_key,
        Arc::new(StaticAuthPolicy::new().with_password("alice", "secret")),
    )
}

fn client_config(store: Arc<dyn HostKeyStore>, policy: StrictHostKeyChecking) -> SshClientConfig {
    let mut config = SshClientConfig::new("alice");
    config.strict_host_key_checking = policy;
    config.host_key_store = Some(store);
    config
        .auth_methods
        .push(Box::new(PasswordAuth::new("secret")));
    config
}

/// Connects a client and a server over a duplex stream.
async fn connect(
    client: SshClientConfig,
    server: SshServerConfig,
) -> (FerryResult<SshClient>, FerryResult<AcceptedSession>) {
    let (client_io, server_io) = tokio::io::duplex(256 * 1024);
    let server = SshServer::new(server).expect("valid server config");
    let accept = tokio::spawn(async move { server.accept(server_io).await });

    let client = timeout(
        Duration::from_secs(10),
        SshClient::connect_stream(client_io, HOST, PORT, client),
    )
    .await
    .expect("client handshake timed out");
    let server = timeout(Duration::from_secs(10), accept)
        .await
        .expect("server handshake timed out")
        .expect("server task panicked");
    (client, server)
}

#[tokio::test]
async fn test_password_login() {
    let host_key = Arc::new(Ed25519KeyPair::generate());
    let store = Arc::new(MemoryHostKeyStore::with_key(
        HOST,
        PORT,
        host_key.key_type(),
        &host_key.public_key_blob(),
    ));

    let (client, server) = connect(
        client_config(store, StrictHostKeyChecking::Strict),
        server_config(Arc::clone(&host_key)),
    )
    .await;
    let mut client = client.unwrap();
    let server = server.unwrap();

    assert_eq!(server.user, "alice");
    assert_eq!(client.session().state(), TransportState::Authenticated);
    assert_eq!(client.session().session_id(), server.session.session_id());
    assert_eq!(client.session().suite(), server.session.suite());
    assert!(client.session().peer_version().software().starts_with("Ferry_"));

    client.close().await;
    assert!(client.session().is_closed());
}

#[tokio::test]
async fn test_public_key_login() {
    let host_key = Arc::new(Ed25519KeyPair::generate());
    let user_key = Arc::new(Ed25519KeyPair::generate());

    let server = SshServerConfig::new(
        Arc::clone(&host_key) as Arc<dyn KeyPair>,
        Arc::new(StaticAuthPolicy::new().with_public_key("alice", user_key.public_key_blob())),
    );
    let mut client = SshClientConfig::new("alice");
    client.strict_host_key_checking = StrictHostKeyChecking::No;
    client.host_key_store = Some(Arc::new(MemoryHostKeyStore::new()));
    client.auth_methods.push(Box::new(PublicKeyAuth::new(user_key)));

    let (client, server) = connect(client, server).await;
    assert!(client.is_ok());
    assert_eq!(server.unwrap().user, "alice");
}

#[tokio::test]
async fn test_accept_new_remembers_host_key() {
    let host_key = Arc::new(Ed25519KeyPair::generate());
    let store = Arc::new(MemoryHostKeyStore::new());

    let (client, _server) = connect(
        client_config(Arc::clone(&store) as Arc<dyn HostKeyStore>, StrictHostKeyChecking::AcceptNew),
        server_config(Arc::clone(&host_key)),
    )
    .await;
    assert!(client.is_ok());

    let (key_type, blob) = store.lookup(HOST, PORT).expect("host key remembered");
    assert_eq!(key_type, "ssh-ed25519");
    assert_eq!(blob, host_key.public_key_blob());
}

#[tokio::test]
async fn test_changed_host_key_rejected() {
    let stale = Ed25519KeyPair::generate();
    let store = Arc::new(MemoryHostKeyStore::with_key(
        HOST,
        PORT,
        stale.key_type(),
        &stale.public_key_blob(),
    ));

    let (client, server) = connect(
        client_config(store, StrictHostKeyChecking::Strict),
        server_config(Arc::new(Ed25519KeyPair::generate())),
    )
    .await;
    assert!(matches!(client, Err(FerryError::HostKeyVerification(_))));
    assert!(server.is_err());
}

#[tokio::test]
async fn test_unknown_host_rejected_when_strict() {
    let (client, _server) = connect(
        client_config(Arc::new(MemoryHostKeyStore::new()), StrictHostKeyChecking::Strict),
        server_config(Arc::new(Ed25519KeyPair::generate())),
    )
    .await;
    assert!(matches!(client, Err(FerryError::HostKeyVerification(_))));
}

#[tokio::test]
async fn test_no_common_cipher() {
    let mut client = client_config(Arc::new(MemoryHostKeyStore::new()), StrictHostKeyChecking::No);
    client.preferences.ciphers = vec!["aes128-ctr".to_string()];
    let mut server = server_config(Arc::new(Ed25519KeyPair::generate()));
    server.preferences.ciphers = vec!["chacha20-poly1305@openssh.com".to_string()];

    let (client, server) = connect(client, server).await;
    assert!(matches!(client, Err(FerryError::NoCommonAlgorithm { .. })));
    assert!(matches!(server, Err(FerryError::NoCommonAlgorithm { .. })));
}

#[tokio::test]
async fn test_wrong_password() {
    let mut client = client_config(Arc::new(MemoryHostKeyStore::new()), StrictHostKeyChecking::No);
    client.auth_methods = vec![Box::new(PasswordAuth::new("wrong"))];

    let (client, _server) = connect(client, server_config(Arc::new(Ed25519KeyPair::generate()))).await;
    assert!(matches!(client, Err(FerryError::Authentication(_))));
}

#[tokio::test]
async fn test_every_cipher_suite_connects() {
    for cipher in [
        "chacha20-poly1305@openssh.com",
        "aes256-gcm@openssh.com",
        "aes128-gcm@openssh.com",
        "aes256-ctr",
        "aes128-ctr",
    ] {
        let mut client = client_config(Arc::new(MemoryHostKeyStore::new()), StrictHostKeyChecking::No);
        client.preferences.ciphers = vec![cipher.to_string()];

        let (client, server) =
            connect(client, server_config(Arc::new(Ed25519KeyPair::generate()))).await;
        let client = client.unwrap_or_else(|e| panic!("{}: {}", cipher, e));
        let server = server.unwrap();
        assert_eq!(client.session().suite().cipher_client_to_server.name(), cipher);

        // A channel round trip exercises both directions
        let channel = client.session().open_session_channel().await.unwrap();
        let accept = tokio::spawn(async move {
            let (name, channel) = server.session.accept_subsystem().await.unwrap();
            let data = channel.receive().await.unwrap().unwrap();
            channel.send(&data).await.unwrap();
            (name, server)
        });
        channel.request_subsystem("sftp").await.unwrap();
        channel.send(b"ping").await.unwrap();
        assert_eq!(channel.receive().await.unwrap().unwrap(), b"ping");
        let (name, _server) = accept.await.unwrap();
        assert_eq!(name, "sftp");
    }
}

#[tokio::test]
async fn test_unknown_subsystem_refused() {
    let (client, server) = connect(
        client_config(Arc::new(MemoryHostKeyStore::new()), StrictHostKeyChecking::No),
        server_config(Arc::new(Ed25519KeyPair::generate())),
    )
    .await;
    let client = client.unwrap();
    let _server = server.unwrap();

    let channel = client.session().open_session_channel().await.unwrap();
    let result = channel.request_subsystem("shell-please").await;
    assert!(matches!(result, Err(FerryError::ChannelOpenFailed { .. })));
}

#[tokio::test]
async fn test_rekey_keeps_channels_open() {
    let (client, server) = connect(
        client_config(Arc::new(MemoryHostKeyStore::new()), StrictHostKeyChecking::No),
        server_config(Arc::new(Ed25519KeyPair::generate())),
    )
    .await;
    let client = client.unwrap();
    let server = server.unwrap();

    let echo = tokio::spawn(async move {
        let (_, channel) = server.session.accept_subsystem().await.unwrap();
        while let Some(data) = channel.receive().await.unwrap() {
            channel.send(&data).await.unwrap();
        }
        server
    });

    let channel = client.session().open_session_channel().await.unwrap();
    channel.request_subsystem("sftp").await.unwrap();
    channel.send(b"before").await.unwrap();
    assert_eq!(channel.receive().await.unwrap().unwrap(), b"before");

    client.session().rekey().await.unwrap();
    assert_eq!(client.session().rekey_count(), 1);

    channel.send(b"after").await.unwrap();
    assert_eq!(channel.receive().await.unwrap().unwrap(), b"after");

    channel.send_eof().await.unwrap();
    let server = echo.await.unwrap();
    assert_eq!(server.session.rekey_count(), 1);
}

#[tokio::test]
async fn test_large_transfer_respects_window() {
    let (client, server) = connect(
        client_config(Arc::new(MemoryHostKeyStore::new()), StrictHostKeyChecking::No),
        server_config(Arc::new(Ed25519KeyPair::generate())),
    )
    .await;
    let client = client.unwrap();
    let server = server.unwrap();

    // Larger than the default 2 MiB window
    let payload: Vec<u8> = (0..3 * 1024 * 1024u32).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();

    let sink = tokio::spawn(async move {
        let (_, channel) = server.session.accept_subsystem().await.unwrap();
        let mut received = Vec::new();
        while let Some(data) = channel.receive().await.unwrap() {
            received.extend_from_slice(&data);
        }
        (received, server)
    });

    let channel = client.session().open_session_channel().await.unwrap();
    channel.request_subsystem("sftp").await.unwrap();
    channel.send(&payload).await.unwrap();
    channel.send_eof().await.unwrap();

    let (received, _server) = timeout(Duration::from_secs(30), sink).await.unwrap().unwrap();
    assert_eq!(received.len(), expected.len());
    assert!(received == expected);
}

#[tokio::test]
async fn test_disconnect_ends_peer_session() {
    let (client, server) = connect(
        client_config(Arc::new(MemoryHostKeyStore::new()), StrictHostKeyChecking::No),
        server_config(Arc::new(Ed25519KeyPair::generate())),
    )
    .await;
    let mut client = client.unwrap();
    let server = server.unwrap();

    client.close().await;
    let result = timeout(Duration::from_secs(5), server.session.accept_subsystem())
        .await
        .expect("server noticed the disconnect");
    assert!(matches!(result, Err(FerryError::SessionClosed)));
}

#[tokio::test]
async fn test_abrupt_close_fails_pending_open() {
    let (client_io, server_io) = tokio::io::duplex(256 * 1024);
    let server = SshServer::new(server_config(Arc::new(Ed25519KeyPair::generate()))).unwrap();
    let accept = tokio::spawn(async move { server.accept(server_io).await });
    let client = SshClient::connect_stream(
        client_io,
        HOST,
        PORT,
        client_config(Arc::new(MemoryHostKeyStore::new()), StrictHostKeyChecking::No),
    )
    .await
    .unwrap();

    // Dropping the server's session tears down its end of the stream
    drop(accept.await.unwrap().unwrap());

    let result = timeout(Duration::from_secs(5), client.session().open_session_channel())
        .await
        .expect("open did not hang");
    assert!(matches!(result, Err(FerryError::SessionClosed)));
}

/// Two-leg test mechanism: MICs are HMAC-SHA256 under a shared key.
const SHARED_KEY_OID: &[u8] = &[0x06, 0x03, 0x2a, 0x03, 0x04];

fn shared_key_mic(key: &[u8], message: &[u8]) -> Vec<u8> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).unwrap();
    mac.update(message);
    mac.finalize().into_bytes().to_vec()
}

struct SharedKeyMechanism {
    key: Vec<u8>,
    established: bool,
}

impl GssMechanism for SharedKeyMechanism {
    fn oid(&self) -> &[u8] {
        SHARED_KEY_OID
    }

    fn init_sec_context(&mut self, target: &str, input: Option<&[u8]>) -> FerryResult<GssStep> {
        match input {
            None => Ok(GssStep::Continue(format!("hello {}", target).into_bytes())),
            Some(b"welcome") => {
                self.established = true;
                Ok(GssStep::Complete(None))
            }
            Some(_) => Err(FerryError::Authentication("bad server token".to_string())),
        }
    }

    fn get_mic(&mut self, message: &[u8]) -> FerryResult<Vec<u8>> {
        assert!(self.established);
        Ok(shared_key_mic(&self.key, message))
    }
}

struct SharedKeyAcceptor;

impl GssAcceptor for SharedKeyAcceptor {
    fn oid(&self) -> &[u8] {
        SHARED_KEY_OID
    }

    fn accept_sec_context(&mut self, input: &[u8]) -> FerryResult<GssStep> {
        if input == format!("hello host@{}", HOST).as_bytes() {
            Ok(GssStep::Complete(Some(b"welcome".to_vec())))
        } else {
            Err(FerryError::Authentication("wrong service".to_string()))
        }
    }

    fn verify_mic(&mut self, message: &[u8], mic: &[u8]) -> FerryResult<()> {
        if shared_key_mic(b"realm-key", message) == mic {
            Ok(())
        } else {
            Err(FerryError::Integrity("MIC mismatch".to_string()))
        }
    }
}

struct GssPolicy;

#[async_trait]
impl AuthPolicy for GssPolicy {
    fn methods(&self) -> Vec<String> {
        vec!["gssapi-with-mic".to_string()]
    }

    async fn gssapi_acceptor(&self, attempt: &AuthAttempt<'_>) -> Option<Box<dyn GssAcceptor>> {
        (attempt.user == "alice").then(|| Box::new(SharedKeyAcceptor) as Box<dyn GssAcceptor>)
    }
}

fn gss_client(key: &[u8]) -> SshClientConfig {
    let mut config = client_config(Arc::new(MemoryHostKeyStore::new()), StrictHostKeyChecking::No);
    config.auth_methods = vec![Box::new(GssApiAuth::new(
        HOST,
        SharedKeyMechanism {
            key: key.to_vec(),
            established: false,
        },
    ))];
    config
}

#[tokio::test]
async fn test_gssapi_with_mic_login() {
    let server = SshServerConfig::new(Arc::new(Ed25519KeyPair::generate()), Arc::new(GssPolicy));
    let (client, server) = connect(gss_client(b"realm-key"), server).await;

    let mut client = client.unwrap();
    assert_eq!(server.unwrap().user, "alice");
    assert_eq!(client.session().state(), TransportState::Authenticated);
    client.close().await;
}

#[tokio::test]
async fn test_gssapi_bad_mic_rejected() {
    let server = SshServerConfig::new(Arc::new(Ed25519KeyPair::generate()), Arc::new(GssPolicy));
    let (client, _server) = connect(gss_client(b"other-key"), server).await;
    assert!(matches!(client, Err(FerryError::Authentication(_))));
}

#[tokio::test]
async fn test_gssapi_refused_by_password_server() {
    // StaticAuthPolicy offers no acceptor, so the method fails cleanly
    let (client, _server) = connect(
        gss_client(b"realm-key"),
        server_config(Arc::new(Ed25519KeyPair::generate())),
    )
    .await;
    assert!(matches!(client, Err(FerryError::Authentication(_))));
}
