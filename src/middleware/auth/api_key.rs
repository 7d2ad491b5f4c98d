use hyper::HeaderMap;
use subtle::ConstantTimeEq;

use crate::config::ApiKeyConfig;
use crate::error::AuthError;
use crate::middleware::auth::context::{AuthContext, IdentityType};

/// Validate an API key from the configured header. Key comparison is
/// constant-time.
pub fn validate(headers: &HeaderMap, cfg: &ApiKeyConfig) -> Result<AuthContext, AuthError> {
    let provided = headers
        .get(cfg.header.as_str())
        .and_then(|v| v.to_str().ok())
        .ok_or(AuthError::MissingCredentials)?;

    for api_key in &cfg.keys {
        let matches: bool = api_key
            .key
            .as_bytes()
            .ct_eq(provided.as_bytes())
            .into();
        if matches {
            return Ok(AuthContext {
                authenticated: true,
                identity_type: IdentityType::Service,
                user_id: None,
                client_id: Some(api_key.client_id.clone()),
                roles: api_key.roles.clone(),
                scopes: api_key.scopes.clone(),
                cert_common_name: None,
            });
        }
    }

    Err(AuthError::InvalidApiKey)
}

#[cfg(test)]
mod tests {
    use crate::config::ApiKey;

    use super::*;

    fn config() -> ApiKeyConfig {
        ApiKeyConfig {
            enabled: true,
            header: "X-API-Key".to_string(),
            keys: vec![ApiKey {
                key: "k-123".to_string(),
                client_id: "sensor-fleet".to_string(),
                roles: vec!["device".to_string()],
                scopes: vec!["read:sensors".to_string()],
            }],
        }
    }

    fn with_key(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("X-API-Key", value.parse().unwrap());
        headers
    }

    #[test]
    fn accepts_known_key() {
        let ctx = validate(&with_key("k-123"), &config()).unwrap();
        assert!(ctx.authenticated);
        assert_eq!(ctx.identity_type, IdentityType::Service);
        assert_eq!(ctx.client_id.as_deref(), Some("sensor-fleet"));
        assert_eq!(ctx.roles, vec!["device"]);
    }

    #[test]
    fn rejects_unknown_key() {
        assert!(matches!(
            validate(&with_key("nope"), &config()),
            Err(AuthError::InvalidApiKey)
        ));
    }

    #[test]
    fn rejects_missing_header() {
        assert!(matches!(
            validate(&HeaderMap::new(), &config()),
            Err(AuthError::MissingCredentials)
        ));
    }
}
