use hmac::{Hmac, Mac};
use hyper::HeaderMap;
use jwt::{AlgorithmType, Header, Token, VerifyWithKey};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::config::JwtConfig;
use crate::error::AuthError;
use crate::middleware::auth::context::{AuthContext, IdentityType};

/// Claims carried by gateway tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    #[serde(default)]
    pub sub: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,

    #[serde(default)]
    pub roles: Vec<String>,

    #[serde(default)]
    pub scopes: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// Validate a JWT from the configured header. Only HMAC-SHA256 signatures
/// are accepted; any other algorithm is rejected before verification.
pub fn validate(headers: &HeaderMap, cfg: &JwtConfig) -> Result<AuthContext, AuthError> {
    let raw = extract_token(headers, cfg).ok_or(AuthError::MissingCredentials)?;

    let key: Hmac<Sha256> = Hmac::new_from_slice(cfg.secret_key.as_bytes())
        .map_err(|_| AuthError::Misconfigured("invalid jwt secret key".into()))?;

    let unverified: Token<Header, TokenClaims, _> =
        Token::parse_unverified(&raw).map_err(|_| AuthError::InvalidToken)?;

    if unverified.header().algorithm != AlgorithmType::Hs256 {
        return Err(AuthError::UnexpectedAlgorithm);
    }

    let verified = unverified
        .verify_with_key(&key)
        .map_err(|_| AuthError::InvalidToken)?;
    let claims = verified.claims();

    if cfg.expiry_check {
        if let Some(exp) = claims.exp {
            if exp < unix_now() {
                return Err(AuthError::TokenExpired);
            }
        }
    }

    if cfg.validate_roles && claims.roles.is_empty() {
        return Err(AuthError::InvalidToken);
    }

    if cfg.validate_scopes && claims.scopes.is_empty() {
        return Err(AuthError::InvalidToken);
    }

    let user_id = claims
        .user_id
        .clone()
        .filter(|id| !id.is_empty())
        .or_else(|| (!claims.sub.is_empty()).then(|| claims.sub.clone()));

    Ok(AuthContext {
        authenticated: true,
        identity_type: IdentityType::User,
        user_id,
        client_id: None,
        roles: claims.roles.clone(),
        scopes: claims.scopes.clone(),
        cert_common_name: None,
    })
}

fn extract_token(headers: &HeaderMap, cfg: &JwtConfig) -> Option<String> {
    let header = headers.get(cfg.header.as_str())?.to_str().ok()?;

    let prefix = cfg.prefix.trim();
    if prefix.is_empty() {
        return Some(header.to_string());
    }

    let mut parts = header.splitn(2, ' ');
    let scheme = parts.next()?;
    let token = parts.next()?;
    if scheme != prefix {
        return None;
    }

    Some(token.to_string())
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
