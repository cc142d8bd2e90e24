//! Authentication middleware and session token verification

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

use crate::app::AppState;
use crate::util::time::unix_secs;

type HmacSha256 = Hmac<Sha256>;

/// Claims carried by a session token.
///
/// Tokens are minted by the login service (out of this server's scope) and
/// presented on the WebSocket upgrade and on protected HTTP routes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Session ID
    pub sid: Uuid,
    /// In-battle player ID
    pub player_id: u32,
    /// Battle this session may join
    pub battle_id: u32,
    /// Expiration time (Unix seconds)
    pub exp: u64,
    /// Issued at (Unix seconds)
    #[serde(default)]
    pub iat: u64,
}

/// Verify a session token and extract its claims
pub fn verify_session_token(token: &str, secret: &str) -> Result<SessionClaims, AuthError> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return Err(AuthError::InvalidToken);
    }

    let header_b64 = parts[0];
    let claims_b64 = parts[1];
    let signature_b64 = parts[2];

    // Verify signature (HMAC-SHA256 over the first two segments)
    let message = format!("{}.{}", header_b64, claims_b64);

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| AuthError::InvalidToken)?;
    mac.update(message.as_bytes());

    let expected_signature = mac.finalize().into_bytes();
    let provided_signature = URL_SAFE_NO_PAD
        .decode(signature_b64)
        .map_err(|_| AuthError::InvalidToken)?;

    if expected_signature.as_slice() != provided_signature.as_slice() {
        return Err(AuthError::InvalidToken);
    }

    let claims_json = URL_SAFE_NO_PAD
        .decode(claims_b64)
        .map_err(|_| AuthError::InvalidToken)?;

    let claims: SessionClaims =
        serde_json::from_slice(&claims_json).map_err(|_| AuthError::InvalidToken)?;

    if claims.exp < unix_secs() as u64 {
        return Err(AuthError::TokenExpired);
    }

    Ok(claims)
}

/// Mint a session token for the given claims. The login service owns token
/// issuance in production; this exists for tooling and tests.
pub fn issue_session_token(claims: &SessionClaims, secret: &str) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let body = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).unwrap_or_default());
    let message = format!("{}.{}", header, body);

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(message.as_bytes());
    let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

    format!("{}.{}", message, signature)
}

/// Extract a bearer token from an Authorization header
pub fn extract_bearer_token(auth_header: &str) -> Option<&str> {
    auth_header.strip_prefix("Bearer ")
}

/// Authentication error types
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing authorization header")]
    MissingHeader,

    #[error("Invalid authorization header format")]
    InvalidFormat,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Token expired")]
    TokenExpired,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = match &self {
            AuthError::MissingHeader => StatusCode::UNAUTHORIZED,
            AuthError::InvalidFormat => StatusCode::BAD_REQUEST,
            AuthError::InvalidToken => StatusCode::UNAUTHORIZED,
            AuthError::TokenExpired => StatusCode::UNAUTHORIZED,
        };

        (status, self.to_string()).into_response()
    }
}

/// Authenticated session extractor result
#[derive(Debug, Clone)]
pub struct AuthenticatedSession {
    pub session_id: Uuid,
    pub claims: SessionClaims,
}

/// Middleware to require authentication
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let auth_header = request
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .ok_or(AuthError::MissingHeader)?;

    let token = extract_bearer_token(auth_header).ok_or(AuthError::InvalidFormat)?;

    let claims = verify_session_token(token, &state.config.session_secret)?;

    let session = AuthenticatedSession {
        session_id: claims.sid,
        claims,
    };

    // Insert into request extensions for handlers to access
    request.extensions_mut().insert(session);

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims() -> SessionClaims {
        SessionClaims {
            sid: Uuid::new_v4(),
            player_id: 1,
            battle_id: 42,
            exp: unix_secs() as u64 + 3600,
            iat: unix_secs() as u64,
        }
    }

    #[test]
    fn issued_token_verifies() {
        let claims = claims();
        let token = issue_session_token(&claims, "secret");
        let verified = verify_session_token(&token, "secret").unwrap();
        assert_eq!(verified.sid, claims.sid);
        assert_eq!(verified.battle_id, claims.battle_id);
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = issue_session_token(&claims(), "secret");
        assert!(matches!(
            verify_session_token(&token, "other"),
            Err(AuthError::InvalidToken)
        ));
    }

    #[test]
    fn expired_token_is_rejected() {
        let mut expired = claims();
        expired.exp = 1;
        let token = issue_session_token(&expired, "secret");
        assert!(matches!(
            verify_session_token(&token, "secret"),
            Err(AuthError::TokenExpired)
        ));
    }

    #[test]
    fn malformed_token_is_rejected() {
        assert!(verify_session_token("not-a-token", "secret").is_err());
        assert!(verify_session_token("a.b", "secret").is_err());
    }
}
