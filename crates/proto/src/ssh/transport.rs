//! SSH transport layer (RFC 4253).
//!
//! This module drives one connection from the version exchange to an
//! authenticated transport:
//!
//! 1. **VersionExchange** - Exchange `SSH-2.0-...` identification lines
//! 2. **KeyExchange** - KEXINIT, ephemeral exchange, NEWKEYS
//! 3. **Authenticating** - `ssh-userauth` service (see [`crate::ssh::auth`])
//! 4. **Authenticated** - Handed to the dispatcher as an
//!    [`SshSession`](crate::ssh::session::SshSession)
//! 5. **Rekeying** - A later key exchange over the authenticated transport
//! 6. **Closed** - Terminal
//!
//! The [`KeyExchange`] state machine is shared by the initial handshake and
//! by rekeys driven from the dispatcher. It never touches the stream itself;
//! it returns [`KexAction`]s that the caller applies in order.
//!
//! # Rekeying
//!
//! [`RekeyTracker`] counts bytes in both directions and signals once the
//! [`RekeyPolicy`] byte or time limit is reached (1 GiB / 1 hour by default).
//!
//! # Example
//!
//! ```rust
//! use ferry_proto::ssh::transport::{Role, TransportState};
//!
//! let mut state = TransportState::VersionExchange;
//! state.transition(TransportState::KeyExchange, Role::Client).unwrap();
//! assert!(state.transition(TransportState::Authenticated, Role::Client).is_err());
//! ```

use crate::ssh::auth::{
    self, AuthContext, AuthMethod, AuthOutcome, AuthPolicy, ServiceAccept, ServiceRequest,
    USERAUTH_SERVICE,
};
use crate::ssh::crypto::{DirectionKeys, OpeningContext, SealingContext};
use crate::ssh::hostkey::{KeyPair, PublicKey};
use crate::ssh::kex::{negotiate, AlgorithmPreferences, AlgorithmSuite, KexInit, NewKeys};
use crate::ssh::kex_dh::{derive_keys, EphemeralKey, ExchangeHash, KexEcdhInit, KexEcdhReply};
use crate::ssh::known_hosts::{check_host_key, HostKeyStore, StrictHostKeyChecking};
use crate::ssh::logging;
use crate::ssh::message::{message_number, Disconnect, DisconnectReason, MessageType};
use crate::ssh::packet::{BoxedReader, BoxedWriter, PacketReader, PacketWriter};
use crate::ssh::version::{read_version, send_version, Version};
use ferry_platform::{FerryError, FerryResult};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

/// Which end of the connection this side is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Initiates the connection and authenticates.
    Client,
    /// Accepts the connection and owns the host key.
    Server,
}

impl Role {
    /// Lowercase role name, used in log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Server => "server",
        }
    }
}

/// Transport state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// Exchanging identification lines.
    VersionExchange,
    /// First key exchange, or a rekey before authentication finished.
    KeyExchange,
    /// Running the `ssh-userauth` service.
    Authenticating,
    /// Steady state; channels may be open.
    Authenticated,
    /// Key exchange over an authenticated transport.
    Rekeying,
    /// Terminal.
    Closed,
}

impl TransportState {
    /// State name.
    pub fn name(&self) -> &'static str {
        match self {
            TransportState::VersionExchange => "VersionExchange",
            TransportState::KeyExchange => "KeyExchange",
            TransportState::Authenticating => "Authenticating",
            TransportState::Authenticated => "Authenticated",
            TransportState::Rekeying => "Rekeying",
            TransportState::Closed => "Closed",
        }
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: TransportState) -> bool {
        use TransportState::*;

        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (VersionExchange, KeyExchange)
            | (KeyExchange, Authenticating)
            | (Authenticating, KeyExchange)
            | (Authenticating, Authenticated)
            | (Authenticated, Rekeying)
            | (Rekeying, Authenticated) => true,
            _ => false,
        }
    }

    /// Moves to `next`.
    ///
    /// # Errors
    ///
    /// [`FerryError::Protocol`] if the transition is not legal.
    pub fn transition(&mut self, next: TransportState, role: Role) -> FerryResult<()> {
        if !self.can_transition_to(next) {
            return Err(FerryError::Protocol(format!(
                "Invalid transport state transition {} -> {}",
                self.name(),
                next.name()
            )));
        }
        logging::log_state_transition(role.as_str(), self.name(), next.name());
        *self = next;
        Ok(())
    }
}

impl std::fmt::Display for TransportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// When to rekey.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RekeyPolicy {
    /// Bytes (both directions) before a rekey.
    pub max_bytes: u64,
    /// Time before a rekey.
    pub max_duration: Duration,
}

impl Default for RekeyPolicy {
    fn default() -> Self {
        Self {
            max_bytes: 1 << 30,
            max_duration: Duration::from_secs(3600),
        }
    }
}

impl RekeyPolicy {
    /// Checks that both limits are non-zero.
    pub fn validate(&self) -> FerryResult<()> {
        if self.max_bytes == 0 {
            return Err(FerryError::Config("Rekey byte limit must be non-zero".to_string()));
        }
        if self.max_duration.is_zero() {
            return Err(FerryError::Config("Rekey time limit must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// Counts traffic under the current keys and signals when a rekey is due.
///
/// Shared by the packet reader and writer.
#[derive(Debug)]
pub struct RekeyTracker {
    policy: RekeyPolicy,
    bytes: AtomicU64,
    started: Mutex<Instant>,
    signalled: AtomicBool,
    notify: Notify,
}

impl RekeyTracker {
    /// Creates a tracker starting now.
    pub fn new(policy: RekeyPolicy) -> Self {
        Self {
            policy,
            bytes: AtomicU64::new(0),
            started: Mutex::new(Instant::now()),
            signalled: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Returns the policy.
    pub fn policy(&self) -> RekeyPolicy {
        self.policy
    }

    /// Records `n` bytes sent or received.
    pub fn add_bytes(&self, n: u64) {
        let total = self.bytes.fetch_add(n, Ordering::Relaxed).saturating_add(n);
        if total >= self.policy.max_bytes && !self.signalled.swap(true, Ordering::AcqRel) {
            debug!(bytes = total, "Rekey byte limit reached");
            self.notify.notify_one();
        }
    }

    /// Bytes counted since the last reset.
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// When the time limit expires.
    pub fn deadline(&self) -> Instant {
        *self.started.lock() + self.policy.max_duration
    }

    /// Whether either limit has been reached.
    pub fn is_due(&self) -> bool {
        self.bytes() >= self.policy.max_bytes || Instant::now() >= self.deadline()
    }

    /// Completes once a rekey is due.
    pub async fn due(&self) {
        loop {
            if self.is_due() {
                return;
            }
            let deadline = self.deadline();
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    }

    /// Restarts counting after a key exchange.
    pub fn reset(&self) {
        self.bytes.store(0, Ordering::Relaxed);
        *self.started.lock() = Instant::now();
        self.signalled.store(false, Ordering::Release);
    }
}

/// Version strings and session identifier of an established transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    /// V_C without CR LF
    pub client_version: String,
    /// V_S without CR LF
    pub server_version: String,
    /// Exchange hash of the first key exchange
    pub session_id: Vec<u8>,
}

/// Client-side host key check against a [`HostKeyStore`].
#[derive(Clone)]
pub struct HostKeyVerifier {
    host: String,
    port: u16,
    store: Arc<dyn HostKeyStore>,
    policy: StrictHostKeyChecking,
}

impl HostKeyVerifier {
    /// Creates a verifier for `host:port`.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        store: Arc<dyn HostKeyStore>,
        policy: StrictHostKeyChecking,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            store,
            policy,
        }
    }

    /// Applies the policy to a presented key.
    pub fn verify(&self, key_type: &str, key_blob: &[u8]) -> FerryResult<()> {
        check_host_key(
            self.store.as_ref(),
            self.policy,
            &self.host,
            self.port,
            key_type,
            key_blob,
        )
        .map(|_| ())
    }
}

impl std::fmt::Debug for HostKeyVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostKeyVerifier")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// Role-specific key exchange input.
#[derive(Clone)]
pub(crate) enum KexKeys {
    Client(HostKeyVerifier),
    Server(Arc<dyn KeyPair>),
}

/// Everything a key exchange needs that outlives a single exchange.
#[derive(Clone)]
pub(crate) struct KexContext {
    pub(crate) keys: KexKeys,
    pub(crate) preferences: AlgorithmPreferences,
    pub(crate) client_version: String,
    pub(crate) server_version: String,
    /// Set by the first exchange.
    pub(crate) session_id: Option<Vec<u8>>,
    /// Host key of the first exchange; rekeys must present the same one.
    pub(crate) host_key: Option<Vec<u8>>,
}

impl KexContext {
    pub(crate) fn role(&self) -> Role {
        match self.keys {
            KexKeys::Client(_) => Role::Client,
            KexKeys::Server(_) => Role::Server,
        }
    }

    pub(crate) fn complete(&mut self, outcome: &KexOutcome) {
        self.session_id
            .get_or_insert_with(|| outcome.session_id.clone());
        self.host_key.get_or_insert_with(|| outcome.host_key.clone());
    }
}

/// Step the caller must perform for the key exchange, in order.
#[derive(Debug)]
pub(crate) enum KexAction {
    /// Write a payload under the current sealing context.
    Send(Vec<u8>),
    /// Switch outbound keys; follows our NEWKEYS.
    InstallSealing(DirectionKeys),
    /// Switch inbound keys; follows the peer's NEWKEYS.
    InstallOpening(DirectionKeys),
}

/// Result of a completed key exchange.
#[derive(Debug, Clone)]
pub struct KexOutcome {
    /// Negotiated algorithms
    pub suite: AlgorithmSuite,
    /// H of this exchange
    pub exchange_hash: Vec<u8>,
    /// Session identifier (H of the first exchange)
    pub session_id: Vec<u8>,
    /// Server host key blob
    pub host_key: Vec<u8>,
}

enum KexStage {
    AwaitKexInit,
    AwaitEcdhInit {
        suite: AlgorithmSuite,
    },
    AwaitEcdhReply {
        suite: AlgorithmSuite,
        ephemeral: EphemeralKey,
    },
    AwaitNewKeys {
        outcome: KexOutcome,
        opening: DirectionKeys,
    },
    Done(KexOutcome),
    Failed,
}

impl KexStage {
    fn name(&self) -> &'static str {
        match self {
            KexStage::AwaitKexInit => "awaiting KEXINIT",
            KexStage::AwaitEcdhInit { .. } => "awaiting KEX_ECDH_INIT",
            KexStage::AwaitEcdhReply { .. } => "awaiting KEX_ECDH_REPLY",
            KexStage::AwaitNewKeys { .. } => "awaiting NEWKEYS",
            KexStage::Done(_) => "done",
            KexStage::Failed => "failed",
        }
    }
}

/// One key exchange, initial or rekey.
pub(crate) struct KeyExchange {
    ctx: KexContext,
    local_kexinit: Vec<u8>,
    peer_kexinit: Vec<u8>,
    stage: KexStage,
    skip_wrong_guess: bool,
}

impl KeyExchange {
    /// Starts an exchange; the returned KEXINIT must be sent first.
    pub(crate) fn start(ctx: KexContext) -> (Self, Vec<u8>) {
        let kexinit = KexInit::from_preferences(&ctx.preferences).to_bytes();
        let kex = Self {
            ctx,
            local_kexinit: kexinit.clone(),
            peer_kexinit: Vec::new(),
            stage: KexStage::AwaitKexInit,
            skip_wrong_guess: false,
        };
        (kex, kexinit)
    }

    pub(crate) fn is_done(&self) -> bool {
        matches!(self.stage, KexStage::Done(_))
    }

    pub(crate) fn into_outcome(self) -> FerryResult<KexOutcome> {
        match self.stage {
            KexStage::Done(outcome) => Ok(outcome),
            other => Err(FerryError::Protocol(format!(
                "Key exchange not complete ({})",
                other.name()
            ))),
        }
    }

    /// Feeds one key exchange message.
    pub(crate) fn handle(&mut self, payload: &[u8]) -> FerryResult<Vec<KexAction>> {
        let msg = message_number(payload)?;

        if self.skip_wrong_guess
            && matches!(
                MessageType::from_u8(msg),
                Some(MessageType::KexEcdhInit | MessageType::KexEcdhReply)
            )
        {
            debug!("Discarding key exchange packet sent on a wrong guess");
            self.skip_wrong_guess = false;
            return Ok(Vec::new());
        }

        let stage = std::mem::replace(&mut self.stage, KexStage::Failed);
        match (stage, MessageType::from_u8(msg)) {
            (KexStage::AwaitKexInit, Some(MessageType::KexInit)) => self.on_kexinit(payload),
            (KexStage::AwaitEcdhInit { suite }, Some(MessageType::KexEcdhInit)) => {
                self.on_ecdh_init(suite, payload)
            }
            (KexStage::AwaitEcdhReply { suite, ephemeral }, Some(MessageType::KexEcdhReply)) => {
                self.on_ecdh_reply(suite, ephemeral, payload)
            }
            (KexStage::AwaitNewKeys { outcome, opening }, Some(MessageType::NewKeys)) => {
                NewKeys::from_bytes(payload)?;
                self.stage = KexStage::Done(outcome);
                Ok(vec![KexAction::InstallOpening(opening)])
            }
            (stage, _) => Err(FerryError::Protocol(format!(
                "Unexpected message {} during key exchange ({})",
                msg,
                stage.name()
            ))),
        }
    }

    fn on_kexinit(&mut self, payload: &[u8]) -> FerryResult<Vec<KexAction>> {
        let peer = KexInit::from_bytes(payload)?;
        let local = KexInit::from_bytes(&self.local_kexinit)?;
        self.peer_kexinit = payload.to_vec();

        let role = self.ctx.role();
        let suite = match role {
            Role::Client => negotiate(&local, &peer)?,
            Role::Server => negotiate(&peer, &local)?,
        };
        debug!(role = role.as_str(), suite = %suite, "Algorithms negotiated");

        if peer.first_kex_packet_follows() {
            let guessed_kex = peer.kex_algorithms().first().map(String::as_str);
            let guessed_host_key = peer.server_host_key_algorithms().first().map(String::as_str);
            self.skip_wrong_guess =
                guessed_kex != Some(suite.kex.name()) || guessed_host_key != Some(suite.host_key);
        }

        match role {
            Role::Client => {
                let ephemeral = EphemeralKey::generate(suite.kex)?;
                let init = KexEcdhInit {
                    public: ephemeral.public_value(),
                };
                self.stage = KexStage::AwaitEcdhReply { suite, ephemeral };
                Ok(vec![KexAction::Send(init.to_bytes(suite.kex))])
            }
            Role::Server => {
                self.stage = KexStage::AwaitEcdhInit { suite };
                Ok(Vec::new())
            }
        }
    }

    fn on_ecdh_init(&mut self, suite: AlgorithmSuite, payload: &[u8]) -> FerryResult<Vec<KexAction>> {
        let host_key = match &self.ctx.keys {
            KexKeys::Server(key) => Arc::clone(key),
            KexKeys::Client(_) => {
                return Err(FerryError::Protocol(
                    "Client received KEX_ECDH_INIT".to_string(),
                ))
            }
        };

        let init = KexEcdhInit::from_bytes(payload)?;
        let ephemeral = EphemeralKey::generate(suite.kex)?;
        let server_public = ephemeral.public_value();
        let shared_secret = ephemeral.agree(&init.public)?;
        let host_key_blob = host_key.public_key_blob();

        let exchange_hash = ExchangeHash {
            method: suite.kex,
            client_version: &self.ctx.client_version,
            server_version: &self.ctx.server_version,
            client_kexinit: &self.peer_kexinit,
            server_kexinit: &self.local_kexinit,
            host_key: &host_key_blob,
            client_public: &init.public,
            server_public: &server_public,
            shared_secret: &shared_secret,
        }
        .compute();

        let signature = host_key.sign(&exchange_hash)?;
        let session_id = self
            .ctx
            .session_id
            .clone()
            .unwrap_or_else(|| exchange_hash.clone());
        let keys = derive_keys(&shared_secret, &exchange_hash, &session_id, &suite);

        let reply = KexEcdhReply {
            host_key: host_key_blob.clone(),
            public: server_public,
            signature,
        };

        self.stage = KexStage::AwaitNewKeys {
            outcome: KexOutcome {
                suite,
                exchange_hash,
                session_id,
                host_key: host_key_blob,
            },
            opening: keys.client_to_server,
        };

        Ok(vec![
            KexAction::Send(reply.to_bytes(suite.kex)),
            KexAction::Send(NewKeys::new().to_bytes()),
            KexAction::InstallSealing(keys.server_to_client),
        ])
    }

    fn on_ecdh_reply(
        &mut self,
        suite: AlgorithmSuite,
        ephemeral: EphemeralKey,
        payload: &[u8],
    ) -> FerryResult<Vec<KexAction>> {
        let verifier = match &self.ctx.keys {
            KexKeys::Client(verifier) => verifier.clone(),
            KexKeys::Server(_) => {
                return Err(FerryError::Protocol(
                    "Server received KEX_ECDH_REPLY".to_string(),
                ))
            }
        };

        let reply = KexEcdhReply::from_bytes(payload)?;
        let client_public = ephemeral.public_value();
        let shared_secret = ephemeral.agree(&reply.public)?;

        let exchange_hash = ExchangeHash {
            method: suite.kex,
            client_version: &self.ctx.client_version,
            server_version: &self.ctx.server_version,
            client_kexinit: &self.local_kexinit,
            server_kexinit: &self.peer_kexinit,
            host_key: &reply.host_key,
            client_public: &client_public,
            server_public: &reply.public,
            shared_secret: &shared_secret,
        }
        .compute();

        let public_key = PublicKey::from_blob(&reply.host_key)
            .map_err(|e| FerryError::HostKeyVerification(e.to_string()))?;
        if public_key.key_type() != suite.host_key {
            return Err(FerryError::HostKeyVerification(format!(
                "Server sent a {} key, negotiated {}",
                public_key.key_type(),
                suite.host_key
            )));
        }
        public_key.verify(&exchange_hash, &reply.signature)?;

        match &self.ctx.host_key {
            Some(pinned) if pinned != &reply.host_key => {
                return Err(FerryError::HostKeyVerification(
                    "Server host key changed during rekey".to_string(),
                ))
            }
            Some(_) => {}
            None => verifier.verify(public_key.key_type(), &reply.host_key)?,
        }

        let session_id = self
            .ctx
            .session_id
            .clone()
            .unwrap_or_else(|| exchange_hash.clone());
        let keys = derive_keys(&shared_secret, &exchange_hash, &session_id, &suite);

        self.stage = KexStage::AwaitNewKeys {
            outcome: KexOutcome {
                suite,
                exchange_hash,
                session_id,
                host_key: reply.host_key,
            },
            opening: keys.server_to_client,
        };

        Ok(vec![
            KexAction::Send(NewKeys::new().to_bytes()),
            KexAction::InstallSealing(keys.client_to_server),
        ])
    }
}

/// Applies key exchange actions to the stream halves.
pub(crate) async fn apply_kex_actions(
    actions: Vec<KexAction>,
    reader: &mut PacketReader,
    writer: &mut PacketWriter,
) -> FerryResult<()> {
    for action in actions {
        match action {
            KexAction::Send(payload) => writer.write_payload(&payload).await?,
            KexAction::InstallSealing(keys) => {
                let sealing = SealingContext::new(&keys, writer.sequence())?;
                writer.install(sealing);
            }
            KexAction::InstallOpening(keys) => {
                let opening = OpeningContext::new(&keys, reader.sequence())?;
                reader.install(opening);
            }
        }
    }
    Ok(())
}

/// Parts of an authenticated transport handed to the dispatcher.
pub(crate) struct TransportParts {
    pub(crate) role: Role,
    pub(crate) reader: PacketReader,
    pub(crate) writer: PacketWriter,
    pub(crate) rekey: Arc<RekeyTracker>,
    pub(crate) kex: KexContext,
    pub(crate) identity: SessionIdentity,
    pub(crate) suite: AlgorithmSuite,
    pub(crate) peer_version: Version,
}

/// Handshake and authentication driver.
///
/// Owns both stream halves until authentication completes, then is turned
/// into an [`SshSession`](crate::ssh::session::SshSession).
pub struct Transport {
    role: Role,
    state: TransportState,
    reader: PacketReader,
    writer: PacketWriter,
    rekey: Arc<RekeyTracker>,
    kex: KexContext,
    suite: Option<AlgorithmSuite>,
    peer_version: Version,
    service_accepted: bool,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("peer_version", &self.peer_version)
            .finish_non_exhaustive()
    }
}

impl Transport {
    /// Runs the version exchange and the first key exchange.
    pub(crate) async fn handshake<S>(
        stream: S,
        local_version: &Version,
        keys: KexKeys,
        preferences: AlgorithmPreferences,
        rekey_policy: RekeyPolicy,
    ) -> FerryResult<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut read_half: BoxedReader = Box::new(read_half);
        let mut write_half: BoxedWriter = Box::new(write_half);

        let role = match keys {
            KexKeys::Client(_) => Role::Client,
            KexKeys::Server(_) => Role::Server,
        };
        let mut state = TransportState::VersionExchange;

        send_version(&mut write_half, local_version).await?;
        let (peer_version, peer_line) = read_version(&mut read_half).await?;
        logging::log_peer_version(role.as_str(), &peer_line);

        let local_line = local_version.to_string();
        let (client_version, server_version) = match role {
            Role::Client => (local_line, peer_line),
            Role::Server => (peer_line, local_line),
        };
        state.transition(TransportState::KeyExchange, role)?;

        let rekey = Arc::new(RekeyTracker::new(rekey_policy));
        let mut reader = PacketReader::new(read_half);
        reader.set_rekey_tracker(Arc::clone(&rekey));
        let mut writer = PacketWriter::new(write_half);
        writer.set_rekey_tracker(Arc::clone(&rekey));

        let mut transport = Self {
            role,
            state,
            reader,
            writer,
            rekey,
            kex: KexContext {
                keys,
                preferences,
                client_version,
                server_version,
                session_id: None,
                host_key: None,
            },
            suite: None,
            peer_version,
            service_accepted: false,
        };

        if let Err(e) = transport.run_key_exchange(None).await {
            transport.fail(&e).await;
            return Err(e);
        }
        transport.set_state(TransportState::Authenticating)?;
        Ok(transport)
    }

    /// Returns the role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Returns the current state.
    pub fn state(&self) -> TransportState {
        self.state
    }

    /// Returns the session identifier.
    pub fn session_id(&self) -> &[u8] {
        self.kex.session_id.as_deref().unwrap_or_default()
    }

    /// Returns the peer's identification.
    pub fn peer_version(&self) -> &Version {
        &self.peer_version
    }

    /// Returns the algorithms of the latest key exchange.
    pub fn suite(&self) -> Option<&AlgorithmSuite> {
        self.suite.as_ref()
    }

    fn set_state(&mut self, next: TransportState) -> FerryResult<()> {
        self.state.transition(next, self.role)
    }

    async fn run_key_exchange(&mut self, peer_kexinit: Option<Vec<u8>>) -> FerryResult<()> {
        let rekey = self.kex.session_id.is_some();
        if rekey {
            logging::log_rekey_start(
                self.role.as_str(),
                if peer_kexinit.is_some() { "peer" } else { "local" },
                self.rekey.bytes(),
            );
        }

        let (mut kex, kexinit) = KeyExchange::start(self.kex.clone());
        self.writer.write_payload(&kexinit).await?;

        if let Some(payload) = peer_kexinit {
            let actions = kex.handle(&payload)?;
            apply_kex_actions(actions, &mut self.reader, &mut self.writer).await?;
        }

        while !kex.is_done() {
            let payload = self.reader.read_payload().await?;
            match MessageType::from_u8(message_number(&payload)?) {
                Some(MessageType::Ignore | MessageType::Debug | MessageType::Unimplemented) => {
                    continue
                }
                Some(MessageType::Disconnect) => return Err(self.peer_disconnected(&payload)),
                _ => {}
            }
            let actions = kex.handle(&payload)?;
            apply_kex_actions(actions, &mut self.reader, &mut self.writer).await?;
        }

        let outcome = kex.into_outcome()?;
        self.kex.complete(&outcome);
        self.rekey.reset();
        logging::log_kex_complete(self.role.as_str(), &outcome.suite, rekey);
        self.suite = Some(outcome.suite);
        Ok(())
    }

    fn peer_disconnected(&mut self, payload: &[u8]) -> FerryError {
        match Disconnect::from_bytes(payload) {
            Ok(msg) => logging::log_disconnect("received", msg.reason_code, &msg.description),
            Err(e) => debug!(error = %e, "Malformed DISCONNECT"),
        }
        self.state = TransportState::Closed;
        FerryError::SessionClosed
    }

    /// Sends DISCONNECT for a fatal error and closes the transport.
    async fn fail(&mut self, err: &FerryError) {
        if self.state == TransportState::Closed {
            return;
        }
        logging::log_session_failed(self.role.as_str(), &err.to_string());
        if !matches!(err, FerryError::SessionClosed | FerryError::Io(_)) {
            let msg = Disconnect::new(DisconnectReason::for_error(err), &err.to_string());
            if let Err(e) = self.writer.write_payload(&msg.to_bytes()).await {
                logging::log_teardown_failure("send disconnect", &e.to_string());
            }
        }
        if let Err(e) = self.writer.shutdown().await {
            logging::log_teardown_failure("shutdown stream", &e.to_string());
        }
        self.state = TransportState::Closed;
    }

    /// Sends DISCONNECT and closes the transport.
    pub async fn disconnect(&mut self, reason: DisconnectReason, description: &str) -> FerryResult<()> {
        if self.state == TransportState::Closed {
            return Ok(());
        }
        logging::log_disconnect("sent", reason as u32, description);
        let result = self
            .writer
            .write_payload(&Disconnect::new(reason, description).to_bytes())
            .await;
        if let Err(e) = self.writer.shutdown().await {
            logging::log_teardown_failure("shutdown stream", &e.to_string());
        }
        self.state = TransportState::Closed;
        result
    }

    /// Sends one payload.
    pub(crate) async fn send(&mut self, payload: &[u8]) -> FerryResult<()> {
        self.writer.write_payload(payload).await
    }

    /// Receives the next payload the authentication layer cares about.
    ///
    /// IGNORE, DEBUG and UNIMPLEMENTED are consumed, a peer KEXINIT runs a
    /// rekey inline and DISCONNECT closes the transport.
    pub(crate) async fn recv(&mut self) -> FerryResult<Vec<u8>> {
        loop {
            let payload = self.reader.read_payload().await?;
            match MessageType::from_u8(message_number(&payload)?) {
                Some(MessageType::Ignore | MessageType::Debug) => continue,
                Some(MessageType::Unimplemented) => {
                    debug!("Peer sent UNIMPLEMENTED");
                    continue;
                }
                Some(MessageType::Disconnect) => return Err(self.peer_disconnected(&payload)),
                Some(MessageType::KexInit) => {
                    self.set_state(TransportState::KeyExchange)?;
                    self.run_key_exchange(Some(payload)).await?;
                    self.set_state(TransportState::Authenticating)?;
                }
                _ => return Ok(payload),
            }
        }
    }

    async fn ensure_userauth_service(&mut self) -> FerryResult<()> {
        if self.service_accepted {
            return Ok(());
        }
        self.send(&ServiceRequest::new(USERAUTH_SERVICE).to_bytes())
            .await?;
        let reply = self.recv().await?;
        let accept = ServiceAccept::from_bytes(&reply)?;
        if accept.service_name != USERAUTH_SERVICE {
            return Err(FerryError::Protocol(format!(
                "Server accepted service '{}', requested '{}'",
                accept.service_name, USERAUTH_SERVICE
            )));
        }
        self.service_accepted = true;
        Ok(())
    }

    /// Runs a single authentication attempt.
    ///
    /// On success the transport moves to
    /// [`TransportState::Authenticated`].
    pub async fn try_auth_method(
        &mut self,
        username: &str,
        method: &mut dyn AuthMethod,
    ) -> FerryResult<AuthOutcome> {
        if self.state != TransportState::Authenticating {
            return Err(FerryError::Protocol(format!(
                "Cannot authenticate in state {}",
                self.state
            )));
        }
        self.ensure_userauth_service().await?;

        let name = method.name();
        let outcome = {
            let mut ctx = AuthContext::new(self, username);
            method.try_auth(&mut ctx).await?
        };

        let result = match &outcome {
            AuthOutcome::Success => "success",
            AuthOutcome::Partial { .. } => "partial",
            AuthOutcome::Failure { .. } => "failure",
        };
        logging::log_auth_result(username, name, result);

        if outcome == AuthOutcome::Success {
            self.set_state(TransportState::Authenticated)?;
        }
        Ok(outcome)
    }

    /// Tries `methods` in order until one succeeds.
    ///
    /// After each failure or partial success only methods the server lists
    /// as able to continue are tried.
    ///
    /// # Errors
    ///
    /// [`FerryError::Authentication`] once no method is left. The transport
    /// is disconnected.
    pub async fn authenticate(
        &mut self,
        username: &str,
        methods: &mut [Box<dyn AuthMethod>],
    ) -> FerryResult<()> {
        let mut allowed: Option<Vec<String>> = None;
        let mut tried = vec![false; methods.len()];

        loop {
            let next = methods.iter().enumerate().position(|(i, m)| {
                !tried[i]
                    && allowed
                        .as_ref()
                        .map_or(true, |names| names.iter().any(|n| n == m.name()))
            });

            let Some(index) = next else {
                let err = FerryError::Authentication(format!(
                    "No more authentication methods for '{}' (server allows: {})",
                    username,
                    allowed.map(|a| a.join(",")).unwrap_or_default()
                ));
                self.fail(&err).await;
                return Err(err);
            };
            tried[index] = true;

            let outcome = match self.try_auth_method(username, methods[index].as_mut()).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.fail(&e).await;
                    return Err(e);
                }
            };

            match outcome {
                AuthOutcome::Success => return Ok(()),
                AuthOutcome::Partial { can_continue } | AuthOutcome::Failure { can_continue } => {
                    allowed = Some(can_continue);
                }
            }
        }
    }

    /// Serves the `ssh-userauth` service until a user is authenticated.
    ///
    /// Returns the authenticated user name.
    pub async fn serve_authentication(&mut self, policy: &dyn AuthPolicy) -> FerryResult<String> {
        if self.state != TransportState::Authenticating {
            return Err(FerryError::Protocol(format!(
                "Cannot authenticate in state {}",
                self.state
            )));
        }

        match auth::serve_userauth(self, policy).await {
            Ok(user) => {
                self.set_state(TransportState::Authenticated)?;
                Ok(user)
            }
            Err(e) => {
                self.fail(&e).await;
                Err(e)
            }
        }
    }

    /// Splits an authenticated transport for the dispatcher.
    pub(crate) fn into_parts(self) -> FerryResult<TransportParts> {
        if self.state != TransportState::Authenticated {
            return Err(FerryError::Protocol(format!(
                "Transport is not authenticated ({})",
                self.state
            )));
        }
        let suite = self
            .suite
            .ok_or_else(|| FerryError::Protocol("No key exchange completed".to_string()))?;
        let identity = SessionIdentity {
            client_version: self.kex.client_version.clone(),
            server_version: self.kex.server_version.clone(),
            session_id: self.kex.session_id.clone().unwrap_or_default(),
        };

        Ok(TransportParts {
            role: self.role,
            reader: self.reader,
            writer: self.writer,
            rekey: self.rekey,
            kex: self.kex,
            identity,
            suite,
            peer_version: self.peer_version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::hostkey::Ed25519KeyPair;
    use crate::ssh::known_hosts::MemoryHostKeyStore;

    fn client_keys(policy: StrictHostKeyChecking, store: Arc<dyn HostKeyStore>) -> KexKeys {
        KexKeys::Client(HostKeyVerifier::new("server", 22, store, policy))
    }

    fn context(keys: KexKeys, client_version: &str, server_version: &str) -> KexContext {
        KexContext {
            keys,
            preferences: AlgorithmPreferences::default(),
            client_version: client_version.to_string(),
            server_version: server_version.to_string(),
            session_id: None,
            host_key: None,
        }
    }

    /// Runs both state machines against each other, returning both outcomes.
    fn run_exchange(
        client_ctx: KexContext,
        server_ctx: KexContext,
    ) -> FerryResult<(KexOutcome, KexOutcome)> {
        let (mut client, client_init) = KeyExchange::start(client_ctx);
        let (mut server, server_init) = KeyExchange::start(server_ctx);

        let mut to_server = vec![client_init];
        let mut to_client = vec![server_init];

        while !(client.is_done() && server.is_done()) {
            if to_server.is_empty() && to_client.is_empty() {
                return Err(FerryError::Protocol("Exchange stalled".to_string()));
            }
            for payload in std::mem::take(&mut to_server) {
                for action in server.handle(&payload)? {
                    if let KexAction::Send(p) = action {
                        to_client.push(p);
                    }
                }
            }
            for payload in std::mem::take(&mut to_client) {
                for action in client.handle(&payload)? {
                    if let KexAction::Send(p) = action {
                        to_server.push(p);
                    }
                }
            }
        }

        Ok((client.into_outcome()?, server.into_outcome()?))
    }

    #[test]
    fn test_state_transitions() {
        let mut state = TransportState::VersionExchange;
        assert!(state.transition(TransportState::Authenticating, Role::Client).is_err());
        state.transition(TransportState::KeyExchange, Role::Client).unwrap();
        state.transition(TransportState::Authenticating, Role::Client).unwrap();
        state.transition(TransportState::Authenticated, Role::Client).unwrap();
        state.transition(TransportState::Rekeying, Role::Client).unwrap();
        state.transition(TransportState::Authenticated, Role::Client).unwrap();
        state.transition(TransportState::Closed, Role::Client).unwrap();

        assert!(matches!(
            state.transition(TransportState::Authenticated, Role::Client),
            Err(FerryError::Protocol(_))
        ));
        assert!(!TransportState::Closed.can_transition_to(TransportState::Closed));
    }

    #[test]
    fn test_rekey_policy_validate() {
        assert!(RekeyPolicy::default().validate().is_ok());
        assert_eq!(RekeyPolicy::default().max_bytes, 1024 * 1024 * 1024);

        let policy = RekeyPolicy {
            max_bytes: 0,
            ..RekeyPolicy::default()
        };
        assert!(matches!(policy.validate(), Err(FerryError::Config(_))));
    }

    #[tokio::test]
    async fn test_rekey_tracker_bytes() {
        let tracker = RekeyTracker::new(RekeyPolicy {
            max_bytes: 100,
            max_duration: Duration::from_secs(3600),
        });

        tracker.add_bytes(60);
        assert!(!tracker.is_due());
        tracker.add_bytes(60);
        assert!(tracker.is_due());
        tokio::time::timeout(Duration::from_secs(1), tracker.due())
            .await
            .unwrap();

        tracker.reset();
        assert_eq!(tracker.bytes(), 0);
        assert!(!tracker.is_due());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rekey_tracker_deadline() {
        let tracker = RekeyTracker::new(RekeyPolicy {
            max_bytes: u64::MAX,
            max_duration: Duration::from_secs(60),
        });
        assert!(!tracker.is_due());

        tokio::time::timeout(Duration::from_secs(61), tracker.due())
            .await
            .unwrap();
        assert!(tracker.is_due());
    }

    #[test]
    fn test_key_exchange_agrees() {
        let host_key: Arc<dyn KeyPair> = Arc::new(Ed25519KeyPair::generate());
        let store: Arc<dyn HostKeyStore> = Arc::new(MemoryHostKeyStore::new());

        let (client, server) = run_exchange(
            context(client_keys(StrictHostKeyChecking::AcceptNew, Arc::clone(&store)), "SSH-2.0-c", "SSH-2.0-s"),
            context(KexKeys::Server(Arc::clone(&host_key)), "SSH-2.0-c", "SSH-2.0-s"),
        )
        .unwrap();

        assert_eq!(client.exchange_hash, server.exchange_hash);
        assert_eq!(client.session_id, client.exchange_hash);
        assert_eq!(client.host_key, host_key.public_key_blob());
        assert!(store.lookup("server", 22).is_some());
    }

    #[test]
    fn test_key_exchange_every_method() {
        for method in crate::ssh::kex_dh::KexMethod::ALL {
            let host_key: Arc<dyn KeyPair> = Arc::new(Ed25519KeyPair::generate());
            let store: Arc<dyn HostKeyStore> = Arc::new(MemoryHostKeyStore::new());
            let mut client_ctx = context(client_keys(StrictHostKeyChecking::No, store), "SSH-2.0-c", "SSH-2.0-s");
            client_ctx.preferences.kex = vec![method.name().to_string()];

            let (client, _) = run_exchange(
                client_ctx,
                context(KexKeys::Server(host_key), "SSH-2.0-c", "SSH-2.0-s"),
            )
            .unwrap();
            assert_eq!(client.suite.kex, method);
        }
    }

    #[test]
    fn test_version_mismatch_breaks_signature() {
        let host_key: Arc<dyn KeyPair> = Arc::new(Ed25519KeyPair::generate());
        let store: Arc<dyn HostKeyStore> = Arc::new(MemoryHostKeyStore::new());

        let result = run_exchange(
            context(client_keys(StrictHostKeyChecking::No, store), "SSH-2.0-c", "SSH-2.0-s"),
            context(KexKeys::Server(host_key), "SSH-2.0-c", "SSH-2.0-tampered"),
        );
        assert!(matches!(result, Err(FerryError::HostKeyVerification(_))));
    }

    #[test]
    fn test_strict_unknown_host_rejected() {
        let host_key: Arc<dyn KeyPair> = Arc::new(Ed25519KeyPair::generate());
        let store: Arc<dyn HostKeyStore> = Arc::new(MemoryHostKeyStore::new());

        let result = run_exchange(
            context(client_keys(StrictHostKeyChecking::Strict, store), "SSH-2.0-c", "SSH-2.0-s"),
            context(KexKeys::Server(host_key), "SSH-2.0-c", "SSH-2.0-s"),
        );
        assert!(matches!(result, Err(FerryError::HostKeyVerification(_))));
    }

    #[test]
    fn test_rekey_keeps_session_id_and_pins_host_key() {
        let host_key: Arc<dyn KeyPair> = Arc::new(Ed25519KeyPair::generate());
        let store: Arc<dyn HostKeyStore> = Arc::new(MemoryHostKeyStore::new());
        let mut client_ctx = context(client_keys(StrictHostKeyChecking::AcceptNew, store), "SSH-2.0-c", "SSH-2.0-s");
        let mut server_ctx = context(KexKeys::Server(Arc::clone(&host_key)), "SSH-2.0-c", "SSH-2.0-s");

        let (first, _) = run_exchange(client_ctx.clone(), server_ctx.clone()).unwrap();
        client_ctx.complete(&first);
        server_ctx.complete(&first);

        let (second, _) = run_exchange(client_ctx.clone(), server_ctx).unwrap();
        assert_eq!(second.session_id, first.session_id);
        assert_ne!(second.exchange_hash, first.exchange_hash);

        // A different host key on rekey is rejected even with checking off.
        let other: Arc<dyn KeyPair> = Arc::new(Ed25519KeyPair::generate());
        let mut impostor = context(KexKeys::Server(other), "SSH-2.0-c", "SSH-2.0-s");
        impostor.complete(&first);
        let result = run_exchange(client_ctx, impostor);
        assert!(matches!(result, Err(FerryError::HostKeyVerification(_))));
    }

    #[test]
    fn test_no_common_cipher() {
        let host_key: Arc<dyn KeyPair> = Arc::new(Ed25519KeyPair::generate());
        let store: Arc<dyn HostKeyStore> = Arc::new(MemoryHostKeyStore::new());
        let mut client_ctx = context(client_keys(StrictHostKeyChecking::No, store), "SSH-2.0-c", "SSH-2.0-s");
        client_ctx.preferences.ciphers = vec!["aes128-ctr".to_string()];
        let mut server_ctx = context(KexKeys::Server(host_key), "SSH-2.0-c", "SSH-2.0-s");
        server_ctx.preferences.ciphers = vec!["aes256-gcm@openssh.com".to_string()];

        let result = run_exchange(client_ctx, server_ctx);
        assert!(matches!(result, Err(FerryError::NoCommonAlgorithm { .. })));
    }

    #[test]
    fn test_unexpected_message_during_kex() {
        let store: Arc<dyn HostKeyStore> = Arc::new(MemoryHostKeyStore::new());
        let (mut kex, _) = KeyExchange::start(context(client_keys(StrictHostKeyChecking::No, store), "a", "b"));
        let result = kex.handle(&NewKeys::new().to_bytes());
        assert!(matches!(result, Err(FerryError::Protocol(_))));
    }
}
