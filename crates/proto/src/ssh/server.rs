//! SSH server.
//!
//! Runs the server side of version exchange, key exchange and user
//! authentication over any stream, then accepts `session` channels and
//! subsystem requests. [`SshServer::serve_sftp`] wires accepted `sftp`
//! subsystems to an [`SftpServer`].
//!
//! # Example
//!
//! ```rust,no_run
//! use ferry_proto::ssh::auth::StaticAuthPolicy;
//! use ferry_proto::ssh::hostkey::Ed25519KeyPair;
//! use ferry_proto::ssh::server::{SshServer, SshServerConfig};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SshServerConfig::new(
//!     Arc::new(Ed25519KeyPair::load("/etc/ferry/host_key")?),
//!     Arc::new(StaticAuthPolicy::new().with_password("alice", "secret")),
//! );
//! let server = Arc::new(SshServer::new(config)?);
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:2222").await?;
//! server.listen_sftp(listener, "/srv/sftp".into()).await?;
//! # Ok(())
//! # }
//! ```

use crate::ssh::auth::{AuthPolicy, StaticAuthPolicy};
use crate::ssh::channel::ChannelTimeouts;
use crate::ssh::hostkey::{Ed25519KeyPair, KeyPair};
use crate::ssh::kex::AlgorithmPreferences;
use crate::ssh::session::{SessionOptions, SshSession};
use crate::ssh::sftp::{SftpServer, SFTP_SUBSYSTEM};
use crate::ssh::transport::{KexKeys, RekeyPolicy, Transport};
use crate::ssh::version::Version;
use ferry_platform::{FerryError, FerryResult};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// SSH server configuration.
#[derive(Clone)]
pub struct SshServerConfig {
    /// Software version sent in the identification line.
    pub server_version: String,
    /// Host key proving the server's identity.
    pub host_key: Arc<dyn KeyPair>,
    /// Algorithm preferences, most preferred first.
    pub preferences: AlgorithmPreferences,
    /// Decides authentication attempts.
    pub auth_policy: Arc<dyn AuthPolicy>,
    /// Version exchange, key exchange and authentication.
    pub handshake_timeout: Duration,
    /// Channel open.
    pub open_timeout: Duration,
    /// Each wait for window credit.
    pub window_timeout: Duration,
    /// Channel requests.
    pub request_timeout: Duration,
    /// Rekey limits.
    pub rekey: RekeyPolicy,
    /// Keep-alive interval; disabled when `None`.
    pub keepalive_interval: Option<Duration>,
    /// Subsystems accepted on session channels.
    pub subsystems: Vec<String>,
}

// Manual Debug because the host key and policy are trait objects
impl std::fmt::Debug for SshServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshServerConfig")
            .field("server_version", &self.server_version)
            .field("host_key", &self.host_key.key_type())
            .field("preferences", &self.preferences)
            .field("auth_methods", &self.auth_policy.methods())
            .field("handshake_timeout", &self.handshake_timeout)
            .field("open_timeout", &self.open_timeout)
            .field("window_timeout", &self.window_timeout)
            .field("request_timeout", &self.request_timeout)
            .field("rekey", &self.rekey)
            .field("keepalive_interval", &self.keepalive_interval)
            .field("subsystems", &self.subsystems)
            .finish()
    }
}

/// An ephemeral host key and a policy that accepts nobody.
impl Default for SshServerConfig {
    fn default() -> Self {
        Self::new(
            Arc::new(Ed25519KeyPair::generate()),
            Arc::new(StaticAuthPolicy::new()),
        )
    }
}

impl SshServerConfig {
    /// Configuration with default timeouts and the `sftp` subsystem.
    pub fn new(host_key: Arc<dyn KeyPair>, auth_policy: Arc<dyn AuthPolicy>) -> Self {
        Self {
            server_version: format!("Ferry_{}", env!("CARGO_PKG_VERSION")),
            host_key,
            preferences: AlgorithmPreferences::default(),
            auth_policy,
            handshake_timeout: Duration::from_secs(120),
            open_timeout: Duration::from_secs(30),
            window_timeout: Duration::from_secs(60),
            request_timeout: Duration::from_secs(60),
            rekey: RekeyPolicy::default(),
            keepalive_interval: None,
            subsystems: vec![SFTP_SUBSYSTEM.to_string()],
        }
    }

    /// Checks the configuration.
    pub fn validate(&self) -> FerryResult<()> {
        if self.server_version.is_empty()
            || !self
                .server_version
                .bytes()
                .all(|b| b.is_ascii_graphic() && b != b'-')
        {
            return Err(FerryError::Config(format!(
                "Invalid server version: {:?}",
                self.server_version
            )));
        }
        self.preferences.validate()?;
        if !self
            .preferences
            .host_key
            .iter()
            .any(|name| name == self.host_key.key_type())
        {
            return Err(FerryError::Config(format!(
                "Host key type {} is not in the host key preferences",
                self.host_key.key_type()
            )));
        }
        if self.auth_policy.methods().is_empty() {
            return Err(FerryError::Config(
                "The auth policy offers no methods".to_string(),
            ));
        }
        for (name, timeout) in [
            ("handshake", self.handshake_timeout),
            ("open", self.open_timeout),
            ("window", self.window_timeout),
            ("request", self.request_timeout),
        ] {
            if timeout.is_zero() {
                return Err(FerryError::Config(format!(
                    "The {} timeout must be non-zero",
                    name
                )));
            }
        }
        self.rekey.validate()?;
        if self.keepalive_interval.is_some_and(|i| i.is_zero()) {
            return Err(FerryError::Config(
                "Keep-alive interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// A session that completed authentication on the server.
#[derive(Debug)]
pub struct AcceptedSession {
    /// The authenticated user.
    pub user: String,
    /// The session.
    pub session: SshSession,
}

/// SSH server.
#[derive(Debug)]
pub struct SshServer {
    config: SshServerConfig,
}

impl SshServer {
    /// Creates a server after validating `config`.
    pub fn new(config: SshServerConfig) -> FerryResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SshServerConfig {
        &self.config
    }

    /// Runs the handshake and authentication on `stream`.
    ///
    /// # Errors
    ///
    /// - [`FerryError::Timeout`] if the client does not finish in time
    /// - [`FerryError::Authentication`] if the client runs out of attempts
    pub async fn accept<S>(&self, stream: S) -> FerryResult<AcceptedSession>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let version = Version::new(&self.config.server_version, None);
        let accept = async {
            let mut transport = Transport::handshake(
                stream,
                &version,
                KexKeys::Server(Arc::clone(&self.config.host_key)),
                self.config.preferences.clone(),
                self.config.rekey,
            )
            .await?;
            let user = transport
                .serve_authentication(self.config.auth_policy.as_ref())
                .await?;
            Ok::<_, FerryError>((transport, user))
        };

        let (transport, user) = tokio::time::timeout(self.config.handshake_timeout, accept)
            .await
            .map_err(|_| FerryError::Timeout("client handshake".to_string()))??;

        let session = SshSession::start(
            transport.into_parts()?,
            SessionOptions {
                open_timeout: self.config.open_timeout,
                timeouts: ChannelTimeouts {
                    window: self.config.window_timeout,
                    request: self.config.request_timeout,
                },
                keepalive: self.config.keepalive_interval,
                subsystems: self.config.subsystems.clone(),
            },
        );
        info!(user = %user, "Client authenticated");
        Ok(AcceptedSession { user, session })
    }

    /// Accepts one connection and serves SFTP from `root` until it ends.
    pub async fn serve_sftp<S>(&self, stream: S, root: PathBuf) -> FerryResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let AcceptedSession { user, mut session } = self.accept(stream).await?;
        let mut handlers = JoinSet::new();

        loop {
            match session.accept_subsystem().await {
                Ok((name, channel)) if name == SFTP_SUBSYSTEM => {
                    debug!(user = %user, channel = channel.local_id(), "Starting SFTP server");
                    let server = SftpServer::new(root.clone());
                    handlers.spawn(server.serve(channel));
                }
                Ok((name, channel)) => {
                    warn!(subsystem = %name, "No handler for subsystem");
                    if let Err(e) = channel.close().await {
                        debug!(error = %e, "Closing unhandled subsystem channel failed");
                    }
                }
                Err(FerryError::SessionClosed) => break,
                Err(e) => return Err(e),
            }
        }

        while let Some(result) = handlers.join_next().await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(error = %e, "SFTP server ended with error"),
                Err(e) => warn!(error = %e, "SFTP server task failed"),
            }
        }
        session.close().await;
        info!(user = %user, "Client session ended");
        Ok(())
    }

    /// Accepts TCP connections forever, serving SFTP from `root` on each.
    pub async fn listen_sftp(self: Arc<Self>, listener: TcpListener, root: PathBuf) -> FerryResult<()> {
        info!(addr = ?listener.local_addr().ok(), root = %root.display(), "SFTP server listening");
        loop {
            let (stream, peer) = listener.accept().await?;
            stream.set_nodelay(true)?;
            let server = Arc::clone(&self);
            let root = root.clone();
            tokio::spawn(async move {
                if let Err(e) = server.serve_sftp(stream, root).await {
                    warn!(peer = %peer, error = %e, "Connection failed");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> Arc<dyn AuthPolicy> {
        Arc::new(StaticAuthPolicy::new().with_password("alice", "pw"))
    }

    #[test]
    fn test_default_config_offers_sftp() {
        let config = SshServerConfig::default();
        assert_eq!(config.subsystems, vec!["sftp".to_string()]);
        assert_eq!(config.host_key.key_type(), "ssh-ed25519");
        assert!(config.server_version.starts_with("Ferry_"));
    }

    #[test]
    fn test_validate() {
        let config = SshServerConfig::new(Arc::new(Ed25519KeyPair::generate()), policy());
        assert!(config.validate().is_ok());

        let mut bad = config.clone();
        bad.server_version = "two words".to_string();
        assert!(matches!(bad.validate(), Err(FerryError::Config(_))));

        let mut bad = config.clone();
        bad.handshake_timeout = Duration::ZERO;
        assert!(matches!(bad.validate(), Err(FerryError::Config(_))));

        let mut bad = config.clone();
        bad.preferences.host_key = vec!["ssh-ed25519".to_string()];
        bad.preferences.kex = Vec::new();
        assert!(matches!(bad.validate(), Err(FerryError::Config(_))));
    }

    #[test]
    fn test_server_new_validates() {
        let mut config = SshServerConfig::new(Arc::new(Ed25519KeyPair::generate()), policy());
        config.rekey.max_bytes = 0;
        assert!(SshServer::new(config).is_err());
    }
}
