//! SSH client.
//!
//! Connects, verifies the server's host key, authenticates with the
//! configured methods and hands back an [`SshClient`] wrapping the
//! authenticated [`SshSession`].
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
//! let mut client = SshClient::connect("server.example", 22, config).await?;
//! let mut sftp = client.sftp().await?;
//! for name in sftp.listdir(".").await? {
//!     println!("{}", name);
//! }
//! sftp.close().await;
//! client.close().await;
//! # Ok(())
//! # }
//! ```

use crate::ssh::auth::AuthMethod;
use crate::ssh::channel::ChannelTimeouts;
use crate::ssh::kex::AlgorithmPreferences;
use crate::ssh::known_hosts::{
    default_known_hosts_paths, HostKeyStore, KnownHostsFile, StrictHostKeyChecking,
};
use crate::ssh::session::{SessionOptions, SshSession};
use crate::ssh::sftp::{SftpConfig, SftpSession};
use crate::ssh::transport::{HostKeyVerifier, KexKeys, RekeyPolicy, Transport};
use crate::ssh::version::Version;
use ferry_platform::{FerryError, FerryResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::info;

/// SSH client configuration.
pub struct SshClientConfig {
    /// Software version sent in the identification line.
    pub user_agent: String,
    /// User to authenticate as.
    pub username: String,
    /// Algorithm preferences, most preferred first.
    pub preferences: AlgorithmPreferences,
    /// Host key checking policy.
    ///
    /// - `Strict`: reject unknown and changed host keys
    /// - `AcceptNew`: remember unknown hosts, reject changed keys
    /// - `No`: accept all host keys (insecure, testing only)
    pub strict_host_key_checking: StrictHostKeyChecking,
    /// Host key store.
    ///
    /// If not set, the user's `~/.ssh/known_hosts` is used.
    pub host_key_store: Option<Arc<dyn HostKeyStore>>,
    /// Authentication methods, tried in order.
    pub auth_methods: Vec<Box<dyn AuthMethod>>,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Version exchange and first key exchange.
    pub handshake_timeout: Duration,
    /// Channel open.
    pub open_timeout: Duration,
    /// Each wait for window credit.
    pub window_timeout: Duration,
    /// Channel requests and SFTP requests.
    pub request_timeout: Duration,
    /// Rekey limits.
    pub rekey: RekeyPolicy,
    /// Keep-alive interval; disabled when `None`.
    pub keepalive_interval: Option<Duration>,
}

// Manual Debug because auth methods and stores are trait objects
impl std::fmt::Debug for SshClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshClientConfig")
            .field("user_agent", &self.user_agent)
            .field("username", &self.username)
            .field("preferences", &self.preferences)
            .field("strict_host_key_checking", &self.strict_host_key_checking)
            .field("host_key_store", &self.host_key_store.as_ref().map(|_| "<store>"))
            .field(
                "auth_methods",
                &self.auth_methods.iter().map(|m| m.name()).collect::<Vec<_>>(),
            )
            .field("connect_timeout", &self.connect_timeout)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("open_timeout", &self.open_timeout)
            .field("window_timeout", &self.window_timeout)
            .field("request_timeout", &self.request_timeout)
            .field("rekey", &self.rekey)
            .field("keepalive_interval", &self.keepalive_interval)
            .finish()
    }
}

impl Default for SshClientConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("Ferry_{}", env!("CARGO_PKG_VERSION")),
            username: String::new(),
            preferences: AlgorithmPreferences::default(),
            strict_host_key_checking: StrictHostKeyChecking::Strict,
            host_key_store: None,
            auth_methods: Vec::new(),
            connect_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(30),
            open_timeout: Duration::from_secs(30),
            window_timeout: Duration::from_secs(60),
            request_timeout: Duration::from_secs(60),
            rekey: RekeyPolicy::default(),
            keepalive_interval: None,
        }
    }
}

impl SshClientConfig {
    /// Default configuration for `username`.
    pub fn new(username: &str) -> Self {
        Self {
            username: username.to_string(),
            ..Self::default()
        }
    }

    /// Checks the configuration.
    ///
    /// # Errors
    ///
    /// [`FerryError::Config`] describing the first problem found.
    pub fn validate(&self) -> FerryResult<()> {
        if self.username.is_empty() {
            return Err(FerryError::Config("Username must not be empty".to_string()));
        }
        // Printable ASCII without whitespace or '-'
        if self.user_agent.is_empty()
            || !self
                .user_agent
                .bytes()
                .all(|b| b.is_ascii_graphic() && b != b'-')
        {
            return Err(FerryError::Config(format!(
                "Invalid user agent: {:?}",
                self.user_agent
            )));
        }
        self.preferences.validate()?;
        if self.auth_methods.is_empty() {
            return Err(FerryError::Config(
                "At least one authentication method is required".to_string(),
            ));
        }
        for (name, timeout) in [
            ("connect", self.connect_timeout),
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

    fn version(&self) -> Version {
        Version::new(&self.user_agent, None)
    }

    fn store(&self) -> FerryResult<Arc<dyn HostKeyStore>> {
        if let Some(store) = &self.host_key_store {
            return Ok(Arc::clone(store));
        }
        let paths = default_known_hosts_paths();
        let path = paths
            .iter()
            .find(|p| p.exists())
            .or_else(|| paths.first())
            .ok_or_else(|| {
                FerryError::Config("No home directory for known_hosts".to_string())
            })?;
        Ok(Arc::new(KnownHostsFile::open_or_create(path)?))
    }

    fn session_options(&self) -> SessionOptions {
        SessionOptions {
            open_timeout: self.open_timeout,
            timeouts: ChannelTimeouts {
                window: self.window_timeout,
                request: self.request_timeout,
            },
            keepalive: self.keepalive_interval,
            subsystems: Vec::new(),
        }
    }
}

/// An authenticated SSH client connection.
#[derive(Debug)]
pub struct SshClient {
    session: SshSession,
    username: String,
    host: String,
    port: u16,
    request_timeout: Duration,
}

impl SshClient {
    /// Connects over TCP and authenticates.
    ///
    /// # Errors
    ///
    /// - [`FerryError::Config`] for an invalid configuration
    /// - [`FerryError::Timeout`] if connecting or the handshake takes too long
    /// - [`FerryError::HostKeyVerification`] if the host key is rejected
    /// - [`FerryError::Authentication`] if every method fails
    pub async fn connect(host: &str, port: u16, config: SshClientConfig) -> FerryResult<Self> {
        config.validate()?;
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| FerryError::Timeout(format!("connect to {}:{}", host, port)))??;
        stream.set_nodelay(true)?;
        info!(host, port, "TCP connection established");

        Self::connect_stream(stream, host, port, config).await
    }

    /// Runs the client over an established stream.
    ///
    /// `host` and `port` identify the server in the host key store.
    pub async fn connect_stream<S>(
        stream: S,
        host: &str,
        port: u16,
        mut config: SshClientConfig,
    ) -> FerryResult<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        config.validate()?;
        let mut transport = Self::handshake(stream, host, port, &config).await?;
        transport
            .authenticate(&config.username, &mut config.auth_methods)
            .await?;
        Self::from_transport(transport, host, port, &config)
    }

    /// Runs version exchange and key exchange only.
    ///
    /// The returned transport is ready for
    /// [`try_auth_method`](Transport::try_auth_method); pass it to
    /// [`from_transport`](Self::from_transport) once authenticated.
    pub async fn handshake<S>(
        stream: S,
        host: &str,
        port: u16,
        config: &SshClientConfig,
    ) -> FerryResult<Transport>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let verifier = HostKeyVerifier::new(host, port, config.store()?, config.strict_host_key_checking);
        let version = config.version();
        let handshake = Transport::handshake(
            stream,
            &version,
            KexKeys::Client(verifier),
            config.preferences.clone(),
            config.rekey,
        );
        tokio::time::timeout(config.handshake_timeout, handshake)
            .await
            .map_err(|_| FerryError::Timeout(format!("handshake with {}:{}", host, port)))?
    }

    /// Wraps an authenticated transport.
    pub fn from_transport(
        transport: Transport,
        host: &str,
        port: u16,
        config: &SshClientConfig,
    ) -> FerryResult<Self> {
        let parts = transport.into_parts()?;
        let session = SshSession::start(parts, config.session_options());
        info!(host, port, user = %config.username, "Client connected");

        Ok(Self {
            session,
            username: config.username.clone(),
            host: host.to_string(),
            port,
            request_timeout: config.request_timeout,
        })
    }

    /// The authenticated user.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Server host name as given to `connect`.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Server port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The underlying session.
    pub fn session(&self) -> &SshSession {
        &self.session
    }

    /// The underlying session, mutably.
    pub fn session_mut(&mut self) -> &mut SshSession {
        &mut self.session
    }

    /// Starts an SFTP session with default settings.
    ///
    /// The SFTP session needs this client alive; dropping the client closes
    /// the connection and fails outstanding SFTP requests with
    /// `SessionClosed`.
    pub async fn sftp(&self) -> FerryResult<SftpSession> {
        let config = SftpConfig {
            request_timeout: self.request_timeout,
            ..SftpConfig::default()
        };
        self.sftp_with_config(config).await
    }

    /// Starts an SFTP session.
    pub async fn sftp_with_config(&self, config: SftpConfig) -> FerryResult<SftpSession> {
        SftpSession::start(&self.session, config).await
    }

    /// Closes the connection. Idempotent and best-effort.
    pub async fn close(&mut self) {
        self.session.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::auth::PasswordAuth;

    fn valid() -> SshClientConfig {
        let mut config = SshClientConfig::new("alice");
        config.auth_methods.push(Box::new(PasswordAuth::new("pw")));
        config
    }

    #[test]
    fn test_default_config() {
        let config = SshClientConfig::default();
        assert_eq!(config.strict_host_key_checking, StrictHostKeyChecking::Strict);
        assert!(config.keepalive_interval.is_none());
        assert_eq!(config.rekey, RekeyPolicy::default());
        assert!(config.user_agent.starts_with("Ferry_"));
    }

    #[test]
    fn test_validate() {
        assert!(valid().validate().is_ok());

        let mut config = valid();
        config.username.clear();
        assert!(matches!(config.validate(), Err(FerryError::Config(_))));

        let config = SshClientConfig::new("alice");
        assert!(matches!(config.validate(), Err(FerryError::Config(_))));

        let mut config = valid();
        config.open_timeout = Duration::ZERO;
        assert!(matches!(config.validate(), Err(FerryError::Config(_))));

        let mut config = valid();
        config.keepalive_interval = Some(Duration::ZERO);
        assert!(matches!(config.validate(), Err(FerryError::Config(_))));

        let mut config = valid();
        config.preferences.ciphers = vec!["rot13".to_string()];
        assert!(matches!(config.validate(), Err(FerryError::Config(_))));

        let mut config = valid();
        config.user_agent = "has space\r\n".to_string();
        assert!(matches!(config.validate(), Err(FerryError::Config(_))));
    }

    #[test]
    fn test_debug_hides_secrets() {
        let debug = format!("{:?}", valid());
        assert!(debug.contains("password"));
        assert!(!debug.contains("pw\""));
    }
}
