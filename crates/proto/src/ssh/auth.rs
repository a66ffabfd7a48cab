//! SSH authentication protocol (RFC 4252, RFC 4256).
//!
//! Client side, each method is an [`AuthMethod`] driven through an
//! [`AuthContext`]:
//! - "publickey" - [`PublicKeyAuth`], query then sign after PK_OK
//! - "password" - [`PasswordAuth`]
//! - "keyboard-interactive" - [`KeyboardInteractiveAuth`]
//! - "gssapi-with-mic" - [`GssApiAuth`](crate::ssh::gssapi::GssApiAuth)
//!
//! Server side, [`serve_userauth`] answers requests according to an
//! [`AuthPolicy`]. A policy may accept a method partially, in which case the
//! client is told to continue with the remaining methods.
//!
//! # Security
//!
//! - **Constant-time password comparison** in [`StaticAuthPolicy`]
//! - **Passwords are zeroized** when the method or request is dropped
//! - **Signatures are bound to the session identifier**
//!
//! # Example
//!
//! ```rust
//! use ferry_proto::ssh::auth::{AuthRequest, AuthRequestMethod};
//!
//! let request = AuthRequest::new(
//!     "user",
//!     "ssh-connection",
//!     AuthRequestMethod::Password("secret".to_string()),
//! );
//! assert_eq!(request.method().name(), "password");
//! ```

use crate::ssh::gssapi::{self, GssAcceptor, GSSAPI_WITH_MIC};
use crate::ssh::hostkey::{KeyPair, PublicKey};
use crate::ssh::message::MessageType;
use crate::ssh::transport::Transport;
use crate::ssh::wire::{
    read_bool, read_bytes, read_string, read_u32, write_bool, write_bytes, write_name_list,
    write_string,
};
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use ferry_platform::{FerryError, FerryResult};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};
use zeroize::{Zeroize, Zeroizing};

/// Service requested before authentication.
pub const USERAUTH_SERVICE: &str = "ssh-userauth";

/// Service started after authentication.
pub const CONNECTION_SERVICE: &str = "ssh-connection";

/// Failed attempts a server allows before disconnecting.
pub const MAX_AUTH_ATTEMPTS: usize = 20;

/// Mechanisms accepted in one "gssapi-with-mic" request.
const MAX_GSSAPI_MECHANISMS: usize = 32;

fn expect_message(data: &[u8], expected: MessageType) -> FerryResult<()> {
    match data.first() {
        Some(&t) if t == expected as u8 => Ok(()),
        Some(&t) => Err(FerryError::Protocol(format!(
            "Invalid message type: expected {}, got {}",
            expected, t
        ))),
        None => Err(FerryError::Protocol(format!("{} message is empty", expected.name()))),
    }
}

/// Method-specific part of a USERAUTH_REQUEST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthRequestMethod {
    /// "none", used to learn the server's methods.
    None,
    /// "password"
    Password(String),
    /// "publickey"
    PublicKey {
        /// Algorithm name
        algorithm: String,
        /// Public key blob
        public_key: Vec<u8>,
        /// Signature, absent for a query
        signature: Option<Vec<u8>>,
    },
    /// "keyboard-interactive"
    KeyboardInteractive {
        /// Requested submethods
        submethods: String,
    },
    /// "gssapi-with-mic" (RFC 4462)
    GssapiWithMic {
        /// DER-encoded mechanism OIDs, in preference order
        mechanisms: Vec<Vec<u8>>,
    },
}

impl AuthRequestMethod {
    /// Returns the method name.
    pub fn name(&self) -> &str {
        match self {
            AuthRequestMethod::None => "none",
            AuthRequestMethod::Password(_) => "password",
            AuthRequestMethod::PublicKey { .. } => "publickey",
            AuthRequestMethod::KeyboardInteractive { .. } => "keyboard-interactive",
            AuthRequestMethod::GssapiWithMic { .. } => GSSAPI_WITH_MIC,
        }
    }
}

impl Drop for AuthRequestMethod {
    fn drop(&mut self) {
        if let AuthRequestMethod::Password(ref mut password) = self {
            password.zeroize();
        }
    }
}

/// SSH_MSG_USERAUTH_REQUEST (RFC 4252 Section 5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    user_name: String,
    service_name: String,
    method: AuthRequestMethod,
}

impl AuthRequest {
    /// Creates a request.
    pub fn new(user_name: &str, service_name: &str, method: AuthRequestMethod) -> Self {
        Self {
            user_name: user_name.to_string(),
            service_name: service_name.to_string(),
            method,
        }
    }

    /// Returns the user name.
    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    /// Returns the service name.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Returns the method.
    pub fn method(&self) -> &AuthRequestMethod {
        &self.method
    }

    /// Serializes the request.
    ///
    /// ```text
    /// byte      SSH_MSG_USERAUTH_REQUEST (50)
    /// string    user name
    /// string    service name
    /// string    method name
    /// ....      method specific fields
    /// ```
    pub fn to_bytes(&self) -> Zeroizing<Vec<u8>> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthRequest as u8);
        write_string(&mut buf, &self.user_name);
        write_string(&mut buf, &self.service_name);
        write_string(&mut buf, self.method.name());

        match &self.method {
            AuthRequestMethod::None => {}
            AuthRequestMethod::Password(password) => {
                write_bool(&mut buf, false);
                write_string(&mut buf, password);
            }
            AuthRequestMethod::PublicKey {
                algorithm,
                public_key,
                signature,
            } => {
                write_bool(&mut buf, signature.is_some());
                write_string(&mut buf, algorithm);
                write_bytes(&mut buf, public_key);
                if let Some(sig) = signature {
                    write_bytes(&mut buf, sig);
                }
            }
            AuthRequestMethod::KeyboardInteractive { submethods } => {
                write_string(&mut buf, "");
                write_string(&mut buf, submethods);
            }
            AuthRequestMethod::GssapiWithMic { mechanisms } => {
                buf.put_u32(mechanisms.len() as u32);
                for oid in mechanisms {
                    write_bytes(&mut buf, oid);
                }
            }
        }

        Zeroizing::new(buf.to_vec())
    }

    /// Parses a request.
    ///
    /// Unknown method names are returned as [`FerryError::UnsupportedOperation`]
    /// so the server can answer with a failure instead of disconnecting.
    pub fn from_bytes(data: &[u8]) -> FerryResult<Self> {
        expect_message(data, MessageType::UserauthRequest)?;
        let mut offset = 1;

        let user_name = read_string(data, &mut offset)?;
        let service_name = read_string(data, &mut offset)?;
        let method_name = read_string(data, &mut offset)?;

        let method = match method_name.as_str() {
            "none" => AuthRequestMethod::None,
            "password" => {
                let changing = read_bool(data, &mut offset)?;
                if changing {
                    return Err(FerryError::UnsupportedOperation(
                        "password change".to_string(),
                    ));
                }
                AuthRequestMethod::Password(read_string(data, &mut offset)?)
            }
            "publickey" => {
                let has_signature = read_bool(data, &mut offset)?;
                let algorithm = read_string(data, &mut offset)?;
                let public_key = read_bytes(data, &mut offset)?;
                let signature = if has_signature {
                    Some(read_bytes(data, &mut offset)?)
                } else {
                    None
                };
                AuthRequestMethod::PublicKey {
                    algorithm,
                    public_key,
                    signature,
                }
            }
            "keyboard-interactive" => {
                let _language = read_string(data, &mut offset)?;
                AuthRequestMethod::KeyboardInteractive {
                    submethods: read_string(data, &mut offset)?,
                }
            }
            GSSAPI_WITH_MIC => {
                let count = read_u32(data, &mut offset)? as usize;
                if count > MAX_GSSAPI_MECHANISMS {
                    return Err(FerryError::Protocol(format!(
                        "{} GSS-API mechanisms offered",
                        count
                    )));
                }
                let mut mechanisms = Vec::with_capacity(count);
                for _ in 0..count {
                    mechanisms.push(read_bytes(data, &mut offset)?);
                }
                AuthRequestMethod::GssapiWithMic { mechanisms }
            }
            other => return Err(FerryError::UnsupportedOperation(other.to_string())),
        };

        Ok(Self {
            user_name,
            service_name,
            method,
        })
    }
}

/// SSH_MSG_USERAUTH_FAILURE (RFC 4252 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthFailure {
    methods_can_continue: Vec<String>,
    partial_success: bool,
}

impl AuthFailure {
    /// Creates a failure message.
    ///
    /// ```rust
    /// use ferry_proto::ssh::auth::AuthFailure;
    ///
    /// let failure = AuthFailure::new(vec!["publickey".to_string()], false);
    /// assert!(!failure.partial_success());
    /// ```
    pub fn new(methods: Vec<String>, partial_success: bool) -> Self {
        Self {
            methods_can_continue: methods,
            partial_success,
        }
    }

    /// Returns the methods that can continue.
    pub fn methods_can_continue(&self) -> &[String] {
        &self.methods_can_continue
    }

    /// Returns whether the attempt was a partial success.
    pub fn partial_success(&self) -> bool {
        self.partial_success
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthFailure as u8);
        write_name_list(&mut buf, &self.methods_can_continue);
        write_bool(&mut buf, self.partial_success);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> FerryResult<Self> {
        expect_message(data, MessageType::UserauthFailure)?;
        let mut offset = 1;

        let methods = read_string(data, &mut offset)?;
        let methods_can_continue = if methods.is_empty() {
            Vec::new()
        } else {
            methods.split(',').map(String::from).collect()
        };
        let partial_success = read_bool(data, &mut offset)?;

        Ok(Self {
            methods_can_continue,
            partial_success,
        })
    }
}

/// SSH_MSG_USERAUTH_SUCCESS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AuthSuccess;

impl AuthSuccess {
    /// Creates the message.
    pub fn new() -> Self {
        Self
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        vec![MessageType::UserauthSuccess as u8]
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> FerryResult<Self> {
        expect_message(data, MessageType::UserauthSuccess)?;
        Ok(Self)
    }
}

/// SSH_MSG_USERAUTH_BANNER.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthBanner {
    message: String,
}

impl AuthBanner {
    /// Creates a banner.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Returns the banner text.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthBanner as u8);
        write_string(&mut buf, &self.message);
        write_string(&mut buf, "");
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> FerryResult<Self> {
        expect_message(data, MessageType::UserauthBanner)?;
        let mut offset = 1;
        let message = read_string(data, &mut offset)?;
        Ok(Self { message })
    }
}

/// SSH_MSG_USERAUTH_PK_OK (RFC 4252 Section 7).
///
/// Tells the client the queried key is acceptable and a signed request may
/// follow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPkOk {
    algorithm: String,
    public_key: Vec<u8>,
}

impl AuthPkOk {
    /// Creates the message.
    pub fn new(algorithm: impl Into<String>, public_key: Vec<u8>) -> Self {
        Self {
            algorithm: algorithm.into(),
            public_key,
        }
    }

    /// Returns the algorithm name.
    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// Returns the public key blob.
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthPkOk as u8);
        write_string(&mut buf, &self.algorithm);
        write_bytes(&mut buf, &self.public_key);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> FerryResult<Self> {
        expect_message(data, MessageType::UserauthPkOk)?;
        let mut offset = 1;
        let algorithm = read_string(data, &mut offset)?;
        let public_key = read_bytes(data, &mut offset)?;
        Ok(Self {
            algorithm,
            public_key,
        })
    }
}

/// One keyboard-interactive prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    /// Prompt text
    pub text: String,
    /// Whether the answer may be echoed
    pub echo: bool,
}

/// SSH_MSG_USERAUTH_INFO_REQUEST (RFC 4256 Section 3.2).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InfoRequest {
    /// Name shown to the user
    pub name: String,
    /// Instruction shown to the user
    pub instruction: String,
    /// Prompts to answer, possibly none
    pub prompts: Vec<Prompt>,
}

impl InfoRequest {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthPkOk as u8);
        write_string(&mut buf, &self.name);
        write_string(&mut buf, &self.instruction);
        write_string(&mut buf, "");
        buf.put_u32(self.prompts.len() as u32);
        for prompt in &self.prompts {
            write_string(&mut buf, &prompt.text);
            write_bool(&mut buf, prompt.echo);
        }
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> FerryResult<Self> {
        expect_message(data, MessageType::UserauthPkOk)?;
        let mut offset = 1;
        let name = read_string(data, &mut offset)?;
        let instruction = read_string(data, &mut offset)?;
        let _language = read_string(data, &mut offset)?;
        let count = read_u32(data, &mut offset)? as usize;

        // Each prompt takes at least five bytes.
        if count > data.len().saturating_sub(offset) / 5 {
            return Err(FerryError::Protocol(format!(
                "INFO_REQUEST claims {} prompts in {} bytes",
                count,
                data.len()
            )));
        }

        let mut prompts = Vec::with_capacity(count);
        for _ in 0..count {
            let text = read_string(data, &mut offset)?;
            let echo = read_bool(data, &mut offset)?;
            prompts.push(Prompt { text, echo });
        }

        Ok(Self {
            name,
            instruction,
            prompts,
        })
    }
}

/// SSH_MSG_USERAUTH_INFO_RESPONSE (RFC 4256 Section 3.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoResponse {
    /// One answer per prompt
    pub responses: Vec<String>,
}

impl Drop for InfoResponse {
    fn drop(&mut self) {
        self.responses.iter_mut().for_each(Zeroize::zeroize);
    }
}

impl InfoResponse {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Zeroizing<Vec<u8>> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthInfoResponse as u8);
        buf.put_u32(self.responses.len() as u32);
        for response in &self.responses {
            write_string(&mut buf, response);
        }
        Zeroizing::new(buf.to_vec())
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> FerryResult<Self> {
        expect_message(data, MessageType::UserauthInfoResponse)?;
        let mut offset = 1;
        let count = read_u32(data, &mut offset)? as usize;
        if count > data.len().saturating_sub(offset) / 4 {
            return Err(FerryError::Protocol(format!(
                "INFO_RESPONSE claims {} answers in {} bytes",
                count,
                data.len()
            )));
        }
        let mut responses = Vec::with_capacity(count);
        for _ in 0..count {
            responses.push(read_string(data, &mut offset)?);
        }
        Ok(Self { responses })
    }
}

/// SSH_MSG_SERVICE_REQUEST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRequest {
    /// Requested service
    pub service_name: String,
}

impl ServiceRequest {
    /// Creates a request for `service`.
    pub fn new(service: &str) -> Self {
        Self {
            service_name: service.to_string(),
        }
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ServiceRequest as u8);
        write_string(&mut buf, &self.service_name);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> FerryResult<Self> {
        expect_message(data, MessageType::ServiceRequest)?;
        let mut offset = 1;
        Ok(Self {
            service_name: read_string(data, &mut offset)?,
        })
    }
}

/// SSH_MSG_SERVICE_ACCEPT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAccept {
    /// Accepted service
    pub service_name: String,
}

impl ServiceAccept {
    /// Creates an accept for `service`.
    pub fn new(service: &str) -> Self {
        Self {
            service_name: service.to_string(),
        }
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ServiceAccept as u8);
        write_string(&mut buf, &self.service_name);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> FerryResult<Self> {
        expect_message(data, MessageType::ServiceAccept)?;
        let mut offset = 1;
        Ok(Self {
            service_name: read_string(data, &mut offset)?,
        })
    }
}

/// Builds the data a client signs for public key authentication.
///
/// ```text
/// string    session identifier
/// byte      SSH_MSG_USERAUTH_REQUEST (50)
/// string    user name
/// string    service name
/// string    "publickey"
/// boolean   TRUE
/// string    public key algorithm name
/// string    public key blob
/// ```
pub fn construct_signature_data(
    session_id: &[u8],
    user_name: &str,
    service_name: &str,
    algorithm: &str,
    public_key_blob: &[u8],
) -> Vec<u8> {
    let mut buf = BytesMut::new();
    write_bytes(&mut buf, session_id);
    buf.put_u8(MessageType::UserauthRequest as u8);
    write_string(&mut buf, user_name);
    write_string(&mut buf, service_name);
    write_string(&mut buf, "publickey");
    write_bool(&mut buf, true);
    write_string(&mut buf, algorithm);
    write_bytes(&mut buf, public_key_blob);
    buf.to_vec()
}

/// Compares two secrets in constant time.
///
/// Both sides are hashed first so the comparison does not leak length.
///
/// ```rust
/// use ferry_proto::ssh::auth::constant_time_compare;
///
/// assert!(constant_time_compare("secret", "secret"));
/// assert!(!constant_time_compare("secret", "wrong"));
/// ```
pub fn constant_time_compare(a: &str, b: &str) -> bool {
    let hash_a = Sha256::digest(a.as_bytes());
    let hash_b = Sha256::digest(b.as_bytes());
    hash_a.ct_eq(&hash_b).into()
}

/// Result of one authentication attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Authenticated.
    Success,
    /// Rejected.
    Failure {
        /// Methods the server still accepts
        can_continue: Vec<String>,
    },
    /// Accepted, but more methods are required.
    Partial {
        /// Methods the server still accepts
        can_continue: Vec<String>,
    },
}

impl From<AuthFailure> for AuthOutcome {
    fn from(failure: AuthFailure) -> Self {
        let can_continue = failure.methods_can_continue.clone();
        if failure.partial_success {
            AuthOutcome::Partial { can_continue }
        } else {
            AuthOutcome::Failure { can_continue }
        }
    }
}

/// Client view of the transport during one authentication attempt.
pub struct AuthContext<'a> {
    transport: &'a mut Transport,
    username: &'a str,
}

impl<'a> AuthContext<'a> {
    pub(crate) fn new(transport: &'a mut Transport, username: &'a str) -> Self {
        Self {
            transport,
            username,
        }
    }

    /// User being authenticated.
    pub fn username(&self) -> &str {
        self.username
    }

    /// Session identifier to bind signatures to.
    pub fn session_id(&self) -> &[u8] {
        self.transport.session_id()
    }

    /// Sends a USERAUTH_REQUEST for this user.
    pub async fn send_request(&mut self, method: AuthRequestMethod) -> FerryResult<()> {
        let request = AuthRequest::new(self.username, CONNECTION_SERVICE, method);
        self.transport.send(&request.to_bytes()).await
    }

    /// Sends a raw payload.
    pub async fn send(&mut self, payload: &[u8]) -> FerryResult<()> {
        self.transport.send(payload).await
    }

    /// Receives the next userauth message, logging and skipping banners.
    pub async fn recv(&mut self) -> FerryResult<Vec<u8>> {
        loop {
            let payload = self.transport.recv().await?;
            if payload.first() == Some(&(MessageType::UserauthBanner as u8)) {
                let banner = AuthBanner::from_bytes(&payload)?;
                info!(banner = %banner.message(), "Server banner");
                continue;
            }
            return Ok(payload);
        }
    }

    /// Interprets SUCCESS or FAILURE; any other message is returned as is.
    pub fn outcome(payload: &[u8]) -> FerryResult<Option<AuthOutcome>> {
        match payload.first().copied().and_then(MessageType::from_u8) {
            Some(MessageType::UserauthSuccess) => Ok(Some(AuthOutcome::Success)),
            Some(MessageType::UserauthFailure) => {
                Ok(Some(AuthFailure::from_bytes(payload)?.into()))
            }
            _ => Ok(None),
        }
    }

    pub(crate) async fn expect_outcome(&mut self) -> FerryResult<AuthOutcome> {
        let payload = self.recv().await?;
        Self::outcome(&payload)?.ok_or_else(|| unexpected(&payload))
    }
}

pub(crate) fn unexpected(payload: &[u8]) -> FerryError {
    FerryError::Protocol(format!(
        "Unexpected message {} during authentication",
        payload.first().copied().unwrap_or_default()
    ))
}

/// A client authentication method.
#[async_trait]
pub trait AuthMethod: Send {
    /// Method name as sent on the wire.
    fn name(&self) -> &'static str;

    /// Runs one attempt.
    async fn try_auth(&mut self, ctx: &mut AuthContext<'_>) -> FerryResult<AuthOutcome>;
}

/// "password" authentication.
pub struct PasswordAuth {
    password: Zeroizing<String>,
}

impl PasswordAuth {
    /// Creates the method.
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: Zeroizing::new(password.into()),
        }
    }
}

impl std::fmt::Debug for PasswordAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PasswordAuth(..)")
    }
}

#[async_trait]
impl AuthMethod for PasswordAuth {
    fn name(&self) -> &'static str {
        "password"
    }

    async fn try_auth(&mut self, ctx: &mut AuthContext<'_>) -> FerryResult<AuthOutcome> {
        ctx.send_request(AuthRequestMethod::Password(self.password.to_string()))
            .await?;
        let payload = ctx.recv().await?;
        match AuthContext::outcome(&payload)? {
            Some(outcome) => Ok(outcome),
            // PASSWD_CHANGEREQ shares number 60
            None if payload.first() == Some(&(MessageType::UserauthPkOk as u8)) => {
                warn!(user = ctx.username(), "Server requested a password change");
                Ok(AuthOutcome::Failure {
                    can_continue: Vec::new(),
                })
            }
            None => Err(unexpected(&payload)),
        }
    }
}

/// "publickey" authentication with an Ed25519 key.
pub struct PublicKeyAuth {
    key: Arc<dyn KeyPair>,
}

impl PublicKeyAuth {
    /// Creates the method.
    pub fn new(key: Arc<dyn KeyPair>) -> Self {
        Self { key }
    }
}

impl std::fmt::Debug for PublicKeyAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublicKeyAuth")
            .field("key_type", &self.key.key_type())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl AuthMethod for PublicKeyAuth {
    fn name(&self) -> &'static str {
        "publickey"
    }

    async fn try_auth(&mut self, ctx: &mut AuthContext<'_>) -> FerryResult<AuthOutcome> {
        let algorithm = self.key.key_type();
        let blob = self.key.public_key_blob();

        ctx.send_request(AuthRequestMethod::PublicKey {
            algorithm: algorithm.to_string(),
            public_key: blob.clone(),
            signature: None,
        })
        .await?;

        let payload = ctx.recv().await?;
        if let Some(outcome) = AuthContext::outcome(&payload)? {
            return Ok(outcome);
        }
        let pk_ok = AuthPkOk::from_bytes(&payload)?;
        if pk_ok.public_key() != blob.as_slice() {
            return Err(FerryError::Protocol(
                "PK_OK names a different key".to_string(),
            ));
        }
        debug!(user = ctx.username(), algorithm, "Public key acceptable, signing");

        let data = construct_signature_data(
            ctx.session_id(),
            ctx.username(),
            CONNECTION_SERVICE,
            algorithm,
            &blob,
        );
        let signature = self.key.sign(&data)?;
        ctx.send_request(AuthRequestMethod::PublicKey {
            algorithm: algorithm.to_string(),
            public_key: blob,
            signature: Some(signature),
        })
        .await?;

        ctx.expect_outcome().await
    }
}

/// Answers keyboard-interactive prompts.
pub trait KeyboardInteractiveResponder: Send {
    /// Returns one answer per prompt.
    fn respond(&mut self, request: &InfoRequest) -> FerryResult<Vec<String>>;
}

impl<F> KeyboardInteractiveResponder for F
where
    F: FnMut(&InfoRequest) -> FerryResult<Vec<String>> + Send,
{
    fn respond(&mut self, request: &InfoRequest) -> FerryResult<Vec<String>> {
        self(request)
    }
}

/// "keyboard-interactive" authentication.
pub struct KeyboardInteractiveAuth {
    responder: Box<dyn KeyboardInteractiveResponder>,
}

impl KeyboardInteractiveAuth {
    /// Creates the method.
    pub fn new(responder: impl KeyboardInteractiveResponder + 'static) -> Self {
        Self {
            responder: Box::new(responder),
        }
    }
}

impl std::fmt::Debug for KeyboardInteractiveAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyboardInteractiveAuth(..)")
    }
}

#[async_trait]
impl AuthMethod for KeyboardInteractiveAuth {
    fn name(&self) -> &'static str {
        "keyboard-interactive"
    }

    async fn try_auth(&mut self, ctx: &mut AuthContext<'_>) -> FerryResult<AuthOutcome> {
        ctx.send_request(AuthRequestMethod::KeyboardInteractive {
            submethods: String::new(),
        })
        .await?;

        loop {
            let payload = ctx.recv().await?;
            if let Some(outcome) = AuthContext::outcome(&payload)? {
                return Ok(outcome);
            }

            let request = InfoRequest::from_bytes(&payload)?;
            let responses = self.responder.respond(&request)?;
            if responses.len() != request.prompts.len() {
                return Err(FerryError::Authentication(format!(
                    "Responder gave {} answers to {} prompts",
                    responses.len(),
                    request.prompts.len()
                )));
            }
            ctx.send(&InfoResponse { responses }.to_bytes()).await?;
        }
    }
}

/// A server's verdict on one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    /// The user is authenticated.
    Accept,
    /// The method succeeded but more are required.
    Partial,
    /// The attempt failed.
    Reject,
}

/// State of one user's authentication, passed to [`AuthPolicy`] checks.
#[derive(Debug, Clone, Copy)]
pub struct AuthAttempt<'a> {
    /// User name
    pub user: &'a str,
    /// Methods already partially accepted for this user
    pub completed: &'a [String],
}

/// Server-side authentication decisions.
#[async_trait]
pub trait AuthPolicy: Send + Sync {
    /// Methods offered to clients, in order.
    fn methods(&self) -> Vec<String>;

    /// Banner sent before the first reply.
    fn banner(&self) -> Option<String> {
        None
    }

    /// Checks a password.
    async fn check_password(&self, _attempt: &AuthAttempt<'_>, _password: &str) -> AuthDecision {
        AuthDecision::Reject
    }

    /// Checks a public key. Called for queries and, after the signature is
    /// verified, for signed requests.
    async fn check_public_key(&self, _attempt: &AuthAttempt<'_>, _key_blob: &[u8]) -> AuthDecision {
        AuthDecision::Reject
    }

    /// Prompts for keyboard-interactive, or `None` to refuse the method.
    async fn keyboard_interactive_prompts(&self, _attempt: &AuthAttempt<'_>) -> Option<InfoRequest> {
        None
    }

    /// Checks keyboard-interactive answers.
    async fn check_keyboard_interactive(
        &self,
        _attempt: &AuthAttempt<'_>,
        _responses: &[String],
    ) -> AuthDecision {
        AuthDecision::Reject
    }

    /// Acceptor for "gssapi-with-mic", or `None` to refuse the method.
    ///
    /// A user whose context is established and whose MIC verifies is
    /// authenticated.
    async fn gssapi_acceptor(&self, _attempt: &AuthAttempt<'_>) -> Option<Box<dyn GssAcceptor>> {
        None
    }
}

#[derive(Default)]
struct UserEntry {
    password: Option<Zeroizing<String>>,
    keys: Vec<Vec<u8>>,
}

/// An [`AuthPolicy`] over a fixed user table.
///
/// Keyboard-interactive asks a single "Password: " prompt and checks it like
/// a password. With [`require`](Self::require), every listed method must
/// succeed; each one before the last is a partial success.
#[derive(Default)]
pub struct StaticAuthPolicy {
    users: HashMap<String, UserEntry>,
    required: Vec<String>,
    banner: Option<String>,
}

impl StaticAuthPolicy {
    /// Creates an empty policy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a password for `user`.
    pub fn with_password(mut self, user: &str, password: &str) -> Self {
        self.users.entry(user.to_string()).or_default().password =
            Some(Zeroizing::new(password.to_string()));
        self
    }

    /// Authorizes a public key blob for `user`.
    pub fn with_public_key(mut self, user: &str, key_blob: Vec<u8>) -> Self {
        self.users.entry(user.to_string()).or_default().keys.push(key_blob);
        self
    }

    /// Requires every method in `methods`.
    pub fn require(mut self, methods: &[&str]) -> Self {
        self.required = methods.iter().map(|m| m.to_string()).collect();
        self
    }

    /// Sets the banner.
    pub fn with_banner(mut self, banner: impl Into<String>) -> Self {
        self.banner = Some(banner.into());
        self
    }

    fn password_matches(&self, user: &str, password: &str) -> bool {
        self.users
            .get(user)
            .and_then(|u| u.password.as_ref())
            .map_or(false, |expected| constant_time_compare(expected, password))
    }

    fn decide(&self, method: &str, attempt: &AuthAttempt<'_>, ok: bool) -> AuthDecision {
        if !ok {
            return AuthDecision::Reject;
        }
        if !self.required.iter().any(|m| m == method) {
            return if self.required.is_empty() {
                AuthDecision::Accept
            } else {
                AuthDecision::Reject
            };
        }
        let outstanding = self
            .required
            .iter()
            .filter(|m| m.as_str() != method && !attempt.completed.contains(m))
            .count();
        if outstanding == 0 {
            AuthDecision::Accept
        } else {
            AuthDecision::Partial
        }
    }
}

#[async_trait]
impl AuthPolicy for StaticAuthPolicy {
    fn methods(&self) -> Vec<String> {
        if !self.required.is_empty() {
            return self.required.clone();
        }
        ["publickey", "password", "keyboard-interactive"]
            .iter()
            .map(|m| m.to_string())
            .collect()
    }

    fn banner(&self) -> Option<String> {
        self.banner.clone()
    }

    async fn check_password(&self, attempt: &AuthAttempt<'_>, password: &str) -> AuthDecision {
        let ok = self.password_matches(attempt.user, password);
        self.decide("password", attempt, ok)
    }

    async fn check_public_key(&self, attempt: &AuthAttempt<'_>, key_blob: &[u8]) -> AuthDecision {
        let ok = self
            .users
            .get(attempt.user)
            .map_or(false, |u| u.keys.iter().any(|k| k == key_blob));
        self.decide("publickey", attempt, ok)
    }

    async fn keyboard_interactive_prompts(&self, attempt: &AuthAttempt<'_>) -> Option<InfoRequest> {
        self.users.get(attempt.user)?.password.as_ref()?;
        Some(InfoRequest {
            name: String::new(),
            instruction: String::new(),
            prompts: vec![Prompt {
                text: "Password: ".to_string(),
                echo: false,
            }],
        })
    }

    async fn check_keyboard_interactive(
        &self,
        attempt: &AuthAttempt<'_>,
        responses: &[String],
    ) -> AuthDecision {
        let ok = matches!(responses, [answer] if self.password_matches(attempt.user, answer));
        self.decide("keyboard-interactive", attempt, ok)
    }
}

/// Server side of `ssh-userauth`: accepts the service, then answers
/// requests until one user is fully authenticated.
///
/// Returns the authenticated user name.
pub async fn serve_userauth(transport: &mut Transport, policy: &dyn AuthPolicy) -> FerryResult<String> {
    let request = ServiceRequest::from_bytes(&transport.recv().await?)?;
    if request.service_name != USERAUTH_SERVICE {
        return Err(FerryError::Protocol(format!(
            "Unsupported service '{}'",
            request.service_name
        )));
    }
    transport
        .send(&ServiceAccept::new(USERAUTH_SERVICE).to_bytes())
        .await?;

    if let Some(banner) = policy.banner() {
        transport.send(&AuthBanner::new(banner).to_bytes()).await?;
    }

    let mut user = String::new();
    let mut completed: Vec<String> = Vec::new();
    let mut failures = 0;

    loop {
        let payload = transport.recv().await?;
        let request = match AuthRequest::from_bytes(&payload) {
            Ok(request) => request,
            Err(FerryError::UnsupportedOperation(method)) => {
                debug!(method = %method, "Unsupported authentication method");
                failures += 1;
                reject(transport, policy, &completed, failures).await?;
                continue;
            }
            Err(e) => return Err(e),
        };

        if request.user_name() != user {
            user = request.user_name().to_string();
            completed.clear();
        }
        if request.service_name() != CONNECTION_SERVICE {
            return Err(FerryError::Protocol(format!(
                "Unsupported service '{}' after authentication",
                request.service_name()
            )));
        }

        let method = request.method().name().to_string();
        let attempt = AuthAttempt {
            user: &user,
            completed: &completed,
        };

        let decision = match request.method() {
            AuthRequestMethod::None => AuthDecision::Reject,
            AuthRequestMethod::Password(password) => {
                policy.check_password(&attempt, password).await
            }
            AuthRequestMethod::PublicKey {
                algorithm,
                public_key,
                signature: None,
            } => {
                let acceptable = PublicKey::from_blob(public_key).is_ok()
                    && policy.check_public_key(&attempt, public_key).await != AuthDecision::Reject;
                if acceptable {
                    transport
                        .send(&AuthPkOk::new(algorithm.clone(), public_key.clone()).to_bytes())
                        .await?;
                    continue;
                }
                AuthDecision::Reject
            }
            AuthRequestMethod::PublicKey {
                algorithm,
                public_key,
                signature: Some(signature),
            } => {
                let data = construct_signature_data(
                    transport.session_id(),
                    &user,
                    CONNECTION_SERVICE,
                    algorithm,
                    public_key,
                );
                let verified = PublicKey::from_blob(public_key)
                    .and_then(|key| key.verify(&data, signature))
                    .is_ok();
                if verified {
                    policy.check_public_key(&attempt, public_key).await
                } else {
                    AuthDecision::Reject
                }
            }
            AuthRequestMethod::KeyboardInteractive { .. } => {
                match policy.keyboard_interactive_prompts(&attempt).await {
                    Some(prompts) => {
                        transport.send(&prompts.to_bytes()).await?;
                        let response = InfoResponse::from_bytes(&transport.recv().await?)?;
                        if response.responses.len() == prompts.prompts.len() {
                            policy
                                .check_keyboard_interactive(&attempt, &response.responses)
                                .await
                        } else {
                            AuthDecision::Reject
                        }
                    }
                    None => AuthDecision::Reject,
                }
            }
            AuthRequestMethod::GssapiWithMic { mechanisms } => {
                match policy.gssapi_acceptor(&attempt).await {
                    Some(mut acceptor) => {
                        let accepted =
                            gssapi::accept(transport, acceptor.as_mut(), &user, mechanisms).await?;
                        if accepted {
                            AuthDecision::Accept
                        } else {
                            AuthDecision::Reject
                        }
                    }
                    None => AuthDecision::Reject,
                }
            }
        };

        match decision {
            AuthDecision::Accept => {
                info!(user = %user, method = %method, "User authenticated");
                transport.send(&AuthSuccess::new().to_bytes()).await?;
                return Ok(user);
            }
            AuthDecision::Partial => {
                debug!(user = %user, method = %method, "Partial authentication");
                completed.push(method);
                let remaining = remaining_methods(policy, &completed);
                transport
                    .send(&AuthFailure::new(remaining, true).to_bytes())
                    .await?;
            }
            AuthDecision::Reject => {
                if !matches!(request.method(), AuthRequestMethod::None) {
                    failures += 1;
                    debug!(user = %user, method = %method, failures, "Authentication rejected");
                }
                reject(transport, policy, &completed, failures).await?;
            }
        }
    }
}

fn remaining_methods(policy: &dyn AuthPolicy, completed: &[String]) -> Vec<String> {
    policy
        .methods()
        .into_iter()
        .filter(|m| !completed.contains(m))
        .collect()
}

async fn reject(
    transport: &mut Transport,
    policy: &dyn AuthPolicy,
    completed: &[String],
    failures: usize,
) -> FerryResult<()> {
    if failures >= MAX_AUTH_ATTEMPTS {
        return Err(FerryError::Authentication(
            "Too many authentication failures".to_string(),
        ));
    }
    let remaining = remaining_methods(policy, completed);
    transport
        .send(&AuthFailure::new(remaining, false).to_bytes())
        .await
}
