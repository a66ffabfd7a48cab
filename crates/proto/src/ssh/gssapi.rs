//! GSS-API user authentication (RFC 4462 Section 3).
//!
//! The `gssapi-with-mic` exchange is implemented here; the security
//! mechanism itself is pluggable. Clients supply a [`GssMechanism`] (for
//! example a Kerberos binding), servers a [`GssAcceptor`] through
//! [`AuthPolicy::gssapi_acceptor`](crate::ssh::auth::AuthPolicy::gssapi_acceptor).
//!
//! ```text
//! client                                   server
//!   USERAUTH_REQUEST "gssapi-with-mic" --->
//!                          <--- GSSAPI_RESPONSE (chosen OID)
//!   GSSAPI_TOKEN ...                   <--> GSSAPI_TOKEN ...
//!   GSSAPI_MIC                         --->
//!                          <--- USERAUTH_SUCCESS / FAILURE
//! ```
//!
//! GSS-API key exchange (RFC 4462 Section 2) is not implemented; host keys
//! are always verified against the host-key store.

use crate::ssh::auth::{
    unexpected, AuthContext, AuthMethod, AuthOutcome, AuthRequestMethod, CONNECTION_SERVICE,
};
use crate::ssh::message::MessageType;
use crate::ssh::transport::Transport;
use crate::ssh::wire::{read_bytes, read_string, read_u32, write_bytes, write_string};
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use ferry_platform::{FerryError, FerryResult};
use tracing::{debug, warn};

/// Method name on the wire.
pub const GSSAPI_WITH_MIC: &str = "gssapi-with-mic";

/// DER encoding of the Kerberos V5 mechanism OID 1.2.840.113554.1.2.2.
pub const KERBEROS_V5_OID: &[u8] = &[
    0x06, 0x09, 0x2a, 0x86, 0x48, 0x86, 0xf7, 0x12, 0x01, 0x02, 0x02,
];

/// GSS_S_FAILURE major status.
const GSS_S_FAILURE: u32 = 0x000d_0000;

// Numbers 60 and 61 are shared with PK_OK and INFO_RESPONSE.
const MSG_GSSAPI_RESPONSE: u8 = 60;
const MSG_GSSAPI_TOKEN: u8 = 61;
const MSG_GSSAPI_EXCHANGE_COMPLETE: u8 = 63;
const MSG_GSSAPI_ERROR: u8 = 64;
const MSG_GSSAPI_ERRTOK: u8 = 65;
const MSG_GSSAPI_MIC: u8 = 66;

/// Result of one context-establishment call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GssStep {
    /// Send this token and wait for the peer's answer.
    Continue(Vec<u8>),
    /// The context is established; send the token if there is one.
    Complete(Option<Vec<u8>>),
}

/// Client side of a GSS-API mechanism.
pub trait GssMechanism: Send {
    /// DER-encoded mechanism OID.
    fn oid(&self) -> &[u8];

    /// `GSS_Init_sec_context`: `input` is `None` on the first call.
    fn init_sec_context(&mut self, target: &str, input: Option<&[u8]>) -> FerryResult<GssStep>;

    /// `GSS_GetMIC` over `message` with the established context.
    fn get_mic(&mut self, message: &[u8]) -> FerryResult<Vec<u8>>;
}

/// Server side of a GSS-API mechanism.
pub trait GssAcceptor: Send {
    /// DER-encoded mechanism OID.
    fn oid(&self) -> &[u8];

    /// `GSS_Accept_sec_context` on a client token.
    fn accept_sec_context(&mut self, input: &[u8]) -> FerryResult<GssStep>;

    /// `GSS_VerifyMIC`; an error rejects the user.
    fn verify_mic(&mut self, message: &[u8], mic: &[u8]) -> FerryResult<()>;
}

/// Messages exchanged after the initial request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GssapiMessage {
    /// Server's chosen mechanism
    Response(Vec<u8>),
    /// Context token, either direction
    Token(Vec<u8>),
    /// Client finished without integrity protection
    ExchangeComplete,
    /// Server-side failure details
    Error {
        /// Major status
        major: u32,
        /// Minor status
        minor: u32,
        /// Description
        message: String,
    },
    /// Client-side error token
    ErrorToken(Vec<u8>),
    /// Integrity check over the session
    Mic(Vec<u8>),
}

impl GssapiMessage {
    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        match self {
            GssapiMessage::Response(oid) => {
                buf.put_u8(MSG_GSSAPI_RESPONSE);
                write_bytes(&mut buf, oid);
            }
            GssapiMessage::Token(token) => {
                buf.put_u8(MSG_GSSAPI_TOKEN);
                write_bytes(&mut buf, token);
            }
            GssapiMessage::ExchangeComplete => buf.put_u8(MSG_GSSAPI_EXCHANGE_COMPLETE),
            GssapiMessage::Error {
                major,
                minor,
                message,
            } => {
                buf.put_u8(MSG_GSSAPI_ERROR);
                buf.put_u32(*major);
                buf.put_u32(*minor);
                write_string(&mut buf, message);
                write_string(&mut buf, "");
            }
            GssapiMessage::ErrorToken(token) => {
                buf.put_u8(MSG_GSSAPI_ERRTOK);
                write_bytes(&mut buf, token);
            }
            GssapiMessage::Mic(mic) => {
                buf.put_u8(MSG_GSSAPI_MIC);
                write_bytes(&mut buf, mic);
            }
        }
        buf.to_vec()
    }

    /// Parses a message.
    pub fn from_bytes(data: &[u8]) -> FerryResult<Self> {
        let Some(&kind) = data.first() else {
            return Err(FerryError::Protocol("Empty GSS-API message".to_string()));
        };
        let mut offset = 1;
        let message = match kind {
            MSG_GSSAPI_RESPONSE => GssapiMessage::Response(read_bytes(data, &mut offset)?),
            MSG_GSSAPI_TOKEN => GssapiMessage::Token(read_bytes(data, &mut offset)?),
            MSG_GSSAPI_EXCHANGE_COMPLETE => GssapiMessage::ExchangeComplete,
            MSG_GSSAPI_ERROR => {
                let major = read_u32(data, &mut offset)?;
                let minor = read_u32(data, &mut offset)?;
                let message = read_string(data, &mut offset)?;
                GssapiMessage::Error {
                    major,
                    minor,
                    message,
                }
            }
            MSG_GSSAPI_ERRTOK => GssapiMessage::ErrorToken(read_bytes(data, &mut offset)?),
            MSG_GSSAPI_MIC => GssapiMessage::Mic(read_bytes(data, &mut offset)?),
            other => {
                return Err(FerryError::Protocol(format!(
                    "Unexpected message {} during GSS-API exchange",
                    other
                )))
            }
        };
        Ok(message)
    }
}

/// Data covered by the MIC.
///
/// ```text
/// string    session identifier
/// byte      SSH_MSG_USERAUTH_REQUEST
/// string    user name
/// string    service
/// string    "gssapi-with-mic"
/// ```
pub fn mic_data(session_id: &[u8], user_name: &str, service_name: &str) -> Vec<u8> {
    let mut buf = BytesMut::new();
    write_bytes(&mut buf, session_id);
    buf.put_u8(MessageType::UserauthRequest as u8);
    write_string(&mut buf, user_name);
    write_string(&mut buf, service_name);
    write_string(&mut buf, GSSAPI_WITH_MIC);
    buf.to_vec()
}

/// "gssapi-with-mic" authentication over a pluggable mechanism.
pub struct GssApiAuth {
    target: String,
    mechanism: Box<dyn GssMechanism>,
}

impl GssApiAuth {
    /// Authenticates to the `host@<host>` service of `host`.
    pub fn new(host: &str, mechanism: impl GssMechanism + 'static) -> Self {
        Self {
            target: format!("host@{}", host),
            mechanism: Box::new(mechanism),
        }
    }

    /// Service name passed to the mechanism.
    pub fn target(&self) -> &str {
        &self.target
    }
}

impl std::fmt::Debug for GssApiAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GssApiAuth")
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

/// Next server message that is not an informational GSS-API error, or the
/// final outcome.
async fn next_message(ctx: &mut AuthContext<'_>) -> FerryResult<Result<GssapiMessage, AuthOutcome>> {
    loop {
        let payload = ctx.recv().await?;
        if let Some(outcome) = AuthContext::outcome(&payload)? {
            return Ok(Err(outcome));
        }
        match GssapiMessage::from_bytes(&payload).map_err(|_| unexpected(&payload))? {
            GssapiMessage::Error {
                major,
                minor,
                message,
            } => {
                warn!(major, minor, message = %message, "GSS-API error from server");
            }
            message => return Ok(Ok(message)),
        }
    }
}

#[async_trait]
impl AuthMethod for GssApiAuth {
    fn name(&self) -> &'static str {
        GSSAPI_WITH_MIC
    }

    async fn try_auth(&mut self, ctx: &mut AuthContext<'_>) -> FerryResult<AuthOutcome> {
        let oid = self.mechanism.oid().to_vec();
        ctx.send_request(AuthRequestMethod::GssapiWithMic {
            mechanisms: vec![oid.clone()],
        })
        .await?;

        match next_message(ctx).await? {
            Err(outcome) => return Ok(outcome),
            Ok(GssapiMessage::Response(chosen)) if chosen == oid => {}
            Ok(_) => {
                return Err(FerryError::Protocol(
                    "Server chose a GSS-API mechanism that was not offered".to_string(),
                ))
            }
        }
        debug!(user = ctx.username(), target = %self.target, "GSS-API mechanism accepted");

        let mut step = self.mechanism.init_sec_context(&self.target, None);
        loop {
            match step {
                Ok(GssStep::Continue(token)) => {
                    ctx.send(&GssapiMessage::Token(token).to_bytes()).await?;
                    match next_message(ctx).await? {
                        Err(outcome) => return Ok(outcome),
                        Ok(GssapiMessage::Token(input)) => {
                            step = self.mechanism.init_sec_context(&self.target, Some(&input));
                        }
                        Ok(other) => {
                            return Err(FerryError::Protocol(format!(
                                "Expected a GSS-API token, got {:?}",
                                other
                            )))
                        }
                    }
                }
                Ok(GssStep::Complete(token)) => {
                    if let Some(token) = token {
                        ctx.send(&GssapiMessage::Token(token).to_bytes()).await?;
                    }
                    break;
                }
                Err(e) => {
                    warn!(user = ctx.username(), error = %e, "GSS-API context failed");
                    ctx.send(&GssapiMessage::ErrorToken(Vec::new()).to_bytes())
                        .await?;
                    return match next_message(ctx).await? {
                        Err(outcome) => Ok(outcome),
                        Ok(_) => Err(e),
                    };
                }
            }
        }

        let data = mic_data(ctx.session_id(), ctx.username(), CONNECTION_SERVICE);
        let mic = self.mechanism.get_mic(&data)?;
        ctx.send(&GssapiMessage::Mic(mic).to_bytes()).await?;

        match next_message(ctx).await? {
            Err(outcome) => Ok(outcome),
            Ok(other) => Err(FerryError::Protocol(format!(
                "Unexpected {:?} after GSS-API MIC",
                other
            ))),
        }
    }
}

/// Server side of one "gssapi-with-mic" attempt, after the request.
///
/// Returns whether the user is authenticated. On `false` the caller sends
/// USERAUTH_FAILURE.
pub(crate) async fn accept(
    transport: &mut Transport,
    acceptor: &mut dyn GssAcceptor,
    user: &str,
    offered: &[Vec<u8>],
) -> FerryResult<bool> {
    let oid = acceptor.oid().to_vec();
    if !offered.iter().any(|m| *m == oid) {
        debug!(user, "No common GSS-API mechanism");
        return Ok(false);
    }
    transport
        .send(&GssapiMessage::Response(oid).to_bytes())
        .await?;

    loop {
        let payload = transport.recv().await?;
        let input = match GssapiMessage::from_bytes(&payload)? {
            GssapiMessage::Token(input) => input,
            GssapiMessage::ErrorToken(_) => {
                debug!(user, "Client abandoned the GSS-API context");
                return Ok(false);
            }
            other => {
                return Err(FerryError::Protocol(format!(
                    "Expected a GSS-API token, got {:?}",
                    other
                )))
            }
        };
        match acceptor.accept_sec_context(&input) {
            Ok(GssStep::Continue(token)) => {
                transport.send(&GssapiMessage::Token(token).to_bytes()).await?;
            }
            Ok(GssStep::Complete(token)) => {
                if let Some(token) = token {
                    transport.send(&GssapiMessage::Token(token).to_bytes()).await?;
                }
                break;
            }
            Err(e) => {
                let error = GssapiMessage::Error {
                    major: GSS_S_FAILURE,
                    minor: 0,
                    message: e.to_string(),
                };
                transport.send(&error.to_bytes()).await?;
                return Ok(false);
            }
        }
    }

    let payload = transport.recv().await?;
    match GssapiMessage::from_bytes(&payload)? {
        GssapiMessage::Mic(mic) => {
            let data = mic_data(transport.session_id(), user, CONNECTION_SERVICE);
            match acceptor.verify_mic(&data, &mic) {
                Ok(()) => Ok(true),
                Err(e) => {
                    debug!(user, error = %e, "GSS-API MIC rejected");
                    Ok(false)
                }
            }
        }
        // Integrity protection is required
        GssapiMessage::ExchangeComplete => Ok(false),
        other => Err(FerryError::Protocol(format!(
            "Expected a GSS-API MIC, got {:?}",
            other
        ))),
    }
}
