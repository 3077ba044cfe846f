//! Deribit Authentication
//!
//! The session authenticates once per connection with `public/auth` using the
//! `client_credentials` grant:
//!
//! 1. Connect to the WebSocket endpoint
//! 2. Send `{"method":"public/auth","params":{"grant_type":"client_credentials","client_id":"...","client_secret":"..."}}`
//! 3. Receive `{"result":{"access_token":"...","refresh_token":"...","expires_in":900,"scope":"..."}}`
//!    or an error such as `13004 invalid_credentials`
//!
//! Tokens are held for the lifetime of the connection. A handshake refused
//! for the credentials themselves is fatal to session setup and is never
//! retried silently. Any other venue error (rate limit, internal error) is
//! [`AuthError::Unavailable`] and the session may be re-established.
//!
//! # References
//!
//! - [public/auth](https://docs.deribit.com/#public-auth)

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::{Value, json};
use thiserror::Error;

use super::correlator::RequestError;
use super::messages::AuthResult;
use crate::infrastructure::config::Credentials;

/// Method used for the handshake.
pub const AUTH_METHOD: &str = "public/auth";

/// Venue error codes that mean the credentials themselves were refused.
///
/// - `13004` invalid_credentials
/// - `13007` user_not_found
/// - `13009` unauthorized
/// - `13021` forbidden
pub const CREDENTIAL_ERROR_CODES: [i64; 4] = [13_004, 13_007, 13_009, 13_021];

/// Whether a venue error code refuses the credentials.
#[must_use]
pub fn is_credential_error(code: i64) -> bool {
    CREDENTIAL_ERROR_CODES.contains(&code)
}

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur during authentication.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// The venue rejected the credentials.
    #[error("authentication rejected ({code}): {message}")]
    Rejected {
        /// Venue error code.
        code: i64,
        /// Venue error message.
        message: String,
    },

    /// The venue failed the handshake for a reason unrelated to the
    /// credentials, such as `10028 too_many_requests`.
    #[error("authentication unavailable ({code}): {message}")]
    Unavailable {
        /// Venue error code.
        code: i64,
        /// Venue error message.
        message: String,
    },

    /// The venue answered with something other than a token grant.
    #[error("invalid authentication response: {0}")]
    InvalidResponse(String),

    /// The handshake could not complete (transport failure, session closed).
    #[error("authentication interrupted: {0}")]
    Interrupted(String),
}

impl From<RequestError> for AuthError {
    fn from(err: RequestError) -> Self {
        match err {
            RequestError::Upstream(rpc) if is_credential_error(rpc.code) => Self::Rejected {
                code: rpc.code,
                message: rpc.message,
            },
            RequestError::Upstream(rpc) => Self::Unavailable {
                code: rpc.code,
                message: rpc.message,
            },
            other => Self::Interrupted(other.to_string()),
        }
    }
}

// =============================================================================
// Authentication State
// =============================================================================

/// Authentication state of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthState {
    /// No handshake attempted on the current connection.
    #[default]
    Unauthenticated,

    /// `public/auth` sent, awaiting response.
    Authenticating,

    /// Tokens granted.
    Authenticated,

    /// Session torn down.
    Closed,
}

impl AuthState {
    /// Check if currently authenticated.
    #[must_use]
    pub const fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated)
    }

    /// State name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::Authenticating => "authenticating",
            Self::Authenticated => "authenticated",
            Self::Closed => "closed",
        }
    }
}

// =============================================================================
// Session Tokens
// =============================================================================

/// Tokens granted by `public/auth`.
#[derive(Clone)]
pub struct SessionTokens {
    access_token: String,
    refresh_token: Option<String>,
    scope: Option<String>,
    granted_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
}

impl SessionTokens {
    /// Build from an auth result received at `now`.
    #[must_use]
    pub fn from_result(result: AuthResult, now: DateTime<Utc>) -> Self {
        let expires_at = result
            .expires_in
            .and_then(|secs| i64::try_from(secs).ok())
            .map(|secs| now + ChronoDuration::seconds(secs));

        Self {
            access_token: result.access_token,
            refresh_token: result.refresh_token,
            scope: result.scope,
            granted_at: now,
            expires_at,
        }
    }

    /// Bearer token.
    #[must_use]
    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    /// Refresh token, if granted.
    #[must_use]
    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref()
    }

    /// Granted scope.
    #[must_use]
    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    /// When the tokens were granted.
    #[must_use]
    pub const fn granted_at(&self) -> DateTime<Utc> {
        self.granted_at
    }

    /// When the access token expires, if the venue said.
    #[must_use]
    pub const fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// Whether the access token has expired at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

impl std::fmt::Debug for SessionTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionTokens")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("scope", &self.scope)
            .field("granted_at", &self.granted_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

// =============================================================================
// Handshake Helpers
// =============================================================================

/// `public/auth` parameters for the client-credentials grant.
#[must_use]
pub fn auth_params(credentials: &Credentials) -> Value {
    json!({
        "grant_type": "client_credentials",
        "client_id": credentials.client_id(),
        "client_secret": credentials.client_secret(),
    })
}

/// Interpret the result of `public/auth`.
///
/// # Errors
///
/// Returns [`AuthError::InvalidResponse`] if the result carries no access
/// token.
pub fn parse_auth_result(result: Value, now: DateTime<Utc>) -> Result<SessionTokens, AuthError> {
    let result: AuthResult = serde_json::from_value(result)
        .map_err(|e| AuthError::InvalidResponse(e.to_string()))?;
    if result.access_token.is_empty() {
        return Err(AuthError::InvalidResponse("empty access token".to_string()));
    }
    Ok(SessionTokens::from_result(result, now))
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;
    use crate::infrastructure::deribit::messages::RpcError;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn auth_params_shape() {
        let creds = Credentials::new("id".to_string(), "secret".to_string());
        let params = auth_params(&creds);
        assert_eq!(params["grant_type"], "client_credentials");
        assert_eq!(params["client_id"], "id");
        assert_eq!(params["client_secret"], "secret");
    }

    #[test]
    fn parse_full_grant() {
        let tokens = parse_auth_result(
            json!({
                "access_token": "acc",
                "refresh_token": "ref",
                "expires_in": 900,
                "scope": "connection mainaccount",
                "token_type": "bearer"
            }),
            now(),
        )
        .unwrap();

        assert_eq!(tokens.access_token(), "acc");
        assert_eq!(tokens.refresh_token(), Some("ref"));
        assert_eq!(tokens.scope(), Some("connection mainaccount"));
        assert_eq!(
            tokens.expires_at(),
            Some(now() + ChronoDuration::seconds(900))
        );
        assert!(!tokens.is_expired(now()));
        assert!(tokens.is_expired(now() + ChronoDuration::seconds(900)));
    }

    #[test]
    fn parse_rejects_missing_token() {
        assert!(matches!(
            parse_auth_result(json!({"scope": "x"}), now()),
            Err(AuthError::InvalidResponse(_))
        ));
        assert!(matches!(
            parse_auth_result(json!({"access_token": ""}), now()),
            Err(AuthError::InvalidResponse(_))
        ));
        assert!(matches!(
            parse_auth_result(Value::Null, now()),
            Err(AuthError::InvalidResponse(_))
        ));
    }

    #[test]
    fn tokens_debug_is_redacted() {
        let tokens = parse_auth_result(
            json!({"access_token": "secret-access", "refresh_token": "secret-refresh"}),
            now(),
        )
        .unwrap();
        let debug = format!("{tokens:?}");
        assert!(!debug.contains("secret-access"));
        assert!(!debug.contains("secret-refresh"));
    }

    #[test]
    fn request_error_conversion() {
        let rejected = AuthError::from(RequestError::Upstream(RpcError::new(
            13_004,
            "invalid_credentials",
        )));
        assert_eq!(
            rejected,
            AuthError::Rejected {
                code: 13_004,
                message: "invalid_credentials".to_string()
            }
        );

        let interrupted = AuthError::from(RequestError::Transport("reset".to_string()));
        assert!(matches!(interrupted, AuthError::Interrupted(_)));
    }

    #[test_case(13_004, "invalid_credentials", true; "invalid credentials")]
    #[test_case(13_007, "user_not_found", true; "user not found")]
    #[test_case(13_009, "unauthorized", true; "unauthorized")]
    #[test_case(13_021, "forbidden", true; "forbidden")]
    #[test_case(10_028, "too_many_requests", false; "rate limited")]
    #[test_case(11_094, "internal_server_error", false; "internal error")]
    #[test_case(10_040, "retry", false; "retry")]
    #[test_case(13_028, "temporarily_unavailable", false; "temporarily unavailable")]
    #[test_case(-32_000, "server error", false; "json rpc server error")]
    fn upstream_errors_classified_by_code(code: i64, message: &str, credential: bool) {
        let err = AuthError::from(RequestError::Upstream(RpcError::new(code, message)));
        if credential {
            assert_eq!(
                err,
                AuthError::Rejected {
                    code,
                    message: message.to_string()
                }
            );
        } else {
            assert_eq!(
                err,
                AuthError::Unavailable {
                    code,
                    message: message.to_string()
                }
            );
        }
        assert_eq!(is_credential_error(code), credential);
    }

    #[test]
    fn auth_state_predicates() {
        assert!(AuthState::Authenticated.is_authenticated());
        assert!(!AuthState::Authenticating.is_authenticated());
        assert_eq!(AuthState::default(), AuthState::Unauthenticated);
        assert_eq!(AuthState::Closed.as_str(), "closed");
    }
}
