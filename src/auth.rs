//! Session state machine and two-phase authentication.
//!
//! After the transport opens, the session authenticates the application
//! (OAuth client credentials), then the trading account (access token).
//! Only in `Ready` may user requests flow. Non-retriable rejections latch
//! the session in `Fatal`.

use std::fmt;
use std::sync::Arc;

use log::{info, warn};
use prost::Message;

use crate::error::{is_non_retriable_auth_code, CTraderError, Result};
use crate::protocol::handler;
use crate::session::SessionShared;
use crate::types::{
    encode_payload, payload_type, AccountAuthReq, ApplicationAuthReq,
};

/// Connection/authentication state of a session.
///
/// Permitted transitions:
/// `Disconnected → Connecting → AppAuthenticating → AccountAuthenticating → Ready`,
/// `Ready → Reconnecting → AppAuthenticating → ...`, and any state to
/// `Fatal` on a non-retriable authentication failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    AppAuthenticating,
    AccountAuthenticating,
    Ready,
    Reconnecting,
    Fatal,
}

impl SessionState {
    /// Whether the state is a transient precursor to `Ready`, i.e. a
    /// request gate should wait rather than fail fast.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            SessionState::Connecting
                | SessionState::AppAuthenticating
                | SessionState::AccountAuthenticating
                | SessionState::Reconnecting
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::AppAuthenticating => "app-authenticating",
            SessionState::AccountAuthenticating => "account-authenticating",
            SessionState::Ready => "ready",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Fatal => "fatal",
        };
        f.write_str(name)
    }
}

/// Drives the two-phase authentication handshake over an open transport.
///
/// On success the session is left in `Ready`. Returns
/// [`CTraderError::AuthFailed`] for rejections that must not be retried;
/// other errors (timeouts, transport loss, transient server errors) are
/// retriable and left to the caller's policy.
pub(crate) async fn authenticate(shared: &Arc<SessionShared>) -> Result<()> {
    shared.set_state(SessionState::AppAuthenticating);
    info!("Authenticating application...");
    authenticate_application(shared).await?;
    info!("Application authenticated");

    shared.set_state(SessionState::AccountAuthenticating);
    info!("Authenticating account {}...", shared.config.account_id);
    authenticate_account(shared).await?;
    info!("Account authenticated");

    shared.set_state(SessionState::Ready);
    Ok(())
}

async fn authenticate_application(shared: &Arc<SessionShared>) -> Result<()> {
    let req = ApplicationAuthReq {
        client_id: shared.config.client_id.clone(),
        client_secret: shared.config.client_secret.clone(),
    };
    let result = handler::request_envelope(
        shared,
        payload_type::APPLICATION_AUTH_REQ,
        encode_payload(&req),
        shared.config.auth_timeout(),
        false,
    )
    .await;

    match result {
        Ok(envelope) => {
            if envelope.payload_type != payload_type::APPLICATION_AUTH_RES {
                warn!(
                    "Unexpected application auth response type: {}",
                    envelope.payload_type
                );
            }
            Ok(())
        }
        Err(CTraderError::Remote {
            code,
            description,
            maintenance_end,
        }) => {
            // Some servers reject a second AppAuth on the same credentials
            // with an "already authorized" error; repeated connects must
            // still work.
            if description.to_lowercase().contains("already authorized") {
                info!("Application already authorized; continuing");
                return Ok(());
            }
            Err(map_auth_rejection(code, description, maintenance_end))
        }
        Err(e) => Err(e),
    }
}

async fn authenticate_account(shared: &Arc<SessionShared>) -> Result<()> {
    let req = AccountAuthReq {
        ctid_trader_account_id: shared.config.account_id,
        access_token: shared.current_access_token(),
    };
    let result = handler::request_envelope(
        shared,
        payload_type::ACCOUNT_AUTH_REQ,
        encode_payload(&req),
        shared.config.auth_timeout(),
        false,
    )
    .await;

    match result {
        Ok(envelope) => {
            if envelope.payload_type != payload_type::ACCOUNT_AUTH_RES {
                warn!(
                    "Unexpected account auth response type: {}",
                    envelope.payload_type
                );
            }
            Ok(())
        }
        Err(CTraderError::Remote {
            code,
            description,
            maintenance_end,
        }) => Err(map_auth_rejection(code, description, maintenance_end)),
        Err(e) => Err(e),
    }
}

fn map_auth_rejection(
    code: String,
    description: String,
    maintenance_end: Option<i64>,
) -> CTraderError {
    if is_non_retriable_auth_code(&code) {
        CTraderError::AuthFailed(format!("{}: {}", code, description))
    } else {
        CTraderError::Remote {
            code,
            description,
            maintenance_end,
        }
    }
}

/// Decodes an error payload into the typed remote error. Both the
/// common-layer (50) and trading-layer (2142) shapes are accepted.
pub(crate) fn decode_remote_error(tag: u32, payload: &[u8]) -> CTraderError {
    if tag == payload_type::OA_ERROR_RES {
        if let Ok(res) = crate::types::OaErrorRes::decode(payload) {
            return CTraderError::Remote {
                code: res.error_code,
                description: res.description.unwrap_or_default(),
                maintenance_end: res.maintenance_end_timestamp,
            };
        }
    }
    if let Ok(res) = crate::types::CommonErrorRes::decode(payload) {
        return CTraderError::Remote {
            code: res.error_code,
            description: res.description.unwrap_or_default(),
            maintenance_end: res.maintenance_end_timestamp,
        };
    }
    CTraderError::Remote {
        code: "UNKNOWN".to_string(),
        description: "undecodable error response".to_string(),
        maintenance_end: None,
    }
}
