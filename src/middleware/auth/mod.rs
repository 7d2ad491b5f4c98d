pub mod api_key;
pub mod authorization;
pub mod context;
pub mod jwt;
pub mod mtls;

use std::sync::Arc;

use async_trait::async_trait;
use hyper::header::HeaderValue;
use hyper::StatusCode;
use tracing::info;

use crate::config::{AuthConfig, AuthType, RouteAuth};
use crate::core::pipeline::{Middleware, MiddlewareHandler};
use crate::core::request::GatewayRequest;
use crate::core::response::GatewayResponse;
use crate::error::{AuthError, GatewayError};

pub use context::{AuthContext, IdentityType};

/// Authentication + authorization middleware, outermost layer of a route's
/// policy chain.
pub struct AuthMiddleware {
    route_auth: RouteAuth,
    global: AuthConfig,
}

impl AuthMiddleware {
    pub fn new(route_auth: RouteAuth, global: AuthConfig) -> Self {
        Self { route_auth, global }
    }

    fn authenticate(&self, request: &GatewayRequest) -> Result<AuthContext, AuthError> {
        if self.route_auth.require_either.is_empty() {
            return self.authenticate_single(request, self.route_auth.auth_type);
        }

        // Ordered fallback: first method that succeeds wins, the last
        // error surfaces when all fail.
        let mut last_err = AuthError::MissingCredentials;
        for method in &self.route_auth.require_either {
            let auth_type = match method.as_str() {
                "jwt" => AuthType::Jwt,
                "api_key" => AuthType::ApiKey,
                "client_cert" | "mtls" => AuthType::Mtls,
                _ => continue,
            };

            match self.authenticate_single(request, auth_type) {
                Ok(ctx) if ctx.authenticated => return Ok(ctx),
                Ok(_) => {}
                Err(e) => last_err = e,
            }
        }

        Err(last_err)
    }

    fn authenticate_single(
        &self,
        request: &GatewayRequest,
        auth_type: AuthType,
    ) -> Result<AuthContext, AuthError> {
        match auth_type {
            AuthType::Jwt => match &self.global.jwt {
                Some(cfg) if cfg.enabled => jwt::validate(&request.headers, cfg),
                _ => Err(AuthError::Misconfigured("jwt auth not enabled".into())),
            },
            AuthType::ApiKey => match &self.global.api_key {
                Some(cfg) if cfg.enabled => api_key::validate(&request.headers, cfg),
                _ => Err(AuthError::Misconfigured("api_key auth not enabled".into())),
            },
            AuthType::Mtls => mtls::validate(request.client_cert.as_ref(), &self.route_auth),
            AuthType::None => Ok(AuthContext {
                authenticated: true,
                ..Default::default()
            }),
        }
    }
}

#[async_trait]
impl Middleware for AuthMiddleware {
    async fn handle(
        &self,
        mut request: GatewayRequest,
        next: Arc<dyn MiddlewareHandler>,
    ) -> Result<GatewayResponse, GatewayError> {
        if !self.route_auth.required {
            return next.handle(request).await;
        }

        let ctx = match self.authenticate(&request) {
            Ok(ctx) if ctx.authenticated => ctx,
            outcome => {
                if let Err(e) = outcome {
                    info!(
                        request_id = %request.request_id,
                        error = %e,
                        "authentication failed"
                    );
                }
                let mut resp =
                    GatewayResponse::error(StatusCode::UNAUTHORIZED, "authentication failed");
                resp.headers
                    .insert("WWW-Authenticate", HeaderValue::from_static("Bearer"));
                return Ok(resp);
            }
        };

        // API-key clients carry their identifier forward so the rate
        // limiter can key on it.
        if ctx.identity_type == IdentityType::Service {
            if let Some(client_id) = &ctx.client_id {
                if let Ok(value) = HeaderValue::from_str(client_id) {
                    request.headers.insert("X-Client-ID", value);
                }
            }
        }

        if let Err(reason) = authorization::authorize(&request.method, &self.route_auth, &ctx) {
            info!(
                request_id = %request.request_id,
                user = ctx.user_id.as_deref().unwrap_or("-"),
                reason = %reason,
                "authorization failed"
            );
            return Ok(GatewayResponse::error(StatusCode::FORBIDDEN, &reason));
        }

        request.auth = Some(ctx);
        next.handle(request).await
    }

    fn name(&self) -> &str {
        "auth"
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use bytes::Bytes;
    use hmac::{Hmac, Mac};
    use hyper::{HeaderMap, Method, Uri};
    use ::jwt::SignWithKey;
    use sha2::Sha256;

    use crate::config::{JwtConfig, Permission};
    use crate::middleware::auth::jwt::TokenClaims;

    use super::*;

    struct Echo;

    #[async_trait]
    impl MiddlewareHandler for Echo {
        async fn handle(&self, request: GatewayRequest) -> Result<GatewayResponse, GatewayError> {
            let client_id = request.header("X-Client-ID").unwrap_or_default();
            Ok(GatewayResponse::new(
                StatusCode::OK,
                HeaderMap::new(),
                Bytes::from(client_id),
            ))
        }
    }

    fn global_with_jwt(secret: &str) -> AuthConfig {
        AuthConfig {
            jwt: Some(JwtConfig {
                enabled: true,
                secret_key: secret.to_string(),
                header: "Authorization".to_string(),
                prefix: "Bearer ".to_string(),
                expiry_check: true,
                validate_roles: false,
                validate_scopes: false,
            }),
            api_key: None,
        }
    }

    fn token(secret: &str, roles: &[&str]) -> String {
        let key: Hmac<Sha256> = Hmac::new_from_slice(secret.as_bytes()).unwrap();
        TokenClaims {
            sub: "u-1".into(),
            exp: None,
            roles: roles.iter().map(|s| s.to_string()).collect(),
            scopes: vec![],
            user_id: None,
        }
        .sign_with_key(&key)
        .unwrap()
    }

    fn request_with_bearer(method: Method, token: &str) -> GatewayRequest {
        let mut headers = HeaderMap::new();
        headers.insert(
            "Authorization",
            format!("Bearer {token}").parse().unwrap(),
        );
        let addr: SocketAddr = "10.0.0.1:55555".parse().unwrap();
        GatewayRequest::new(method, Uri::from_static("/x"), headers, Bytes::new(), addr)
    }

    fn permission_route_auth() -> RouteAuth {
        RouteAuth {
            auth_type: AuthType::Jwt,
            required: true,
            allowed_roles: vec![],
            required_scopes: vec![],
            permissions: vec![
                Permission {
                    role: Some("technician".into()),
                    identity_type: None,
                    methods: vec!["GET".into()],
                    scopes: vec![],
                },
                Permission {
                    role: Some("engineer".into()),
                    identity_type: None,
                    methods: vec!["GET".into(), "POST".into()],
                    scopes: vec![],
                },
            ],
            require_client_cert: false,
            cert_to_role_mapping: Default::default(),
            require_either: vec![],
        }
    }

    #[tokio::test]
    async fn technician_post_is_forbidden_get_is_forwarded() {
        let mw = AuthMiddleware::new(permission_route_auth(), global_with_jwt("s"));
        let t = token("s", &["technician"]);

        let resp = mw
            .handle(request_with_bearer(Method::POST, &t), Arc::new(Echo))
            .await
            .unwrap();
        assert_eq!(resp.status, StatusCode::FORBIDDEN);

        let resp = mw
            .handle(request_with_bearer(Method::GET, &t), Arc::new(Echo))
            .await
            .unwrap();
        assert_eq!(resp.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_token_is_unauthorized_with_challenge() {
        let mw = AuthMiddleware::new(permission_route_auth(), global_with_jwt("s"));
        let addr: SocketAddr = "10.0.0.1:55555".parse().unwrap();
        let req = GatewayRequest::new(
            Method::GET,
            Uri::from_static("/x"),
            HeaderMap::new(),
            Bytes::new(),
            addr,
        );

        let resp = mw.handle(req, Arc::new(Echo)).await.unwrap();
        assert_eq!(resp.status, StatusCode::UNAUTHORIZED);
        assert_eq!(resp.headers.get("WWW-Authenticate").unwrap(), "Bearer");
    }

    #[tokio::test]
    async fn api_key_sets_client_id_header() {
        let global = AuthConfig {
            jwt: None,
            api_key: Some(crate::config::ApiKeyConfig {
                enabled: true,
                header: "X-API-Key".into(),
                keys: vec![crate::config::ApiKey {
                    key: "abc".into(),
                    client_id: "meter-1".into(),
                    roles: vec![],
                    scopes: vec![],
                }],
            }),
        };
        let route_auth = RouteAuth {
            auth_type: AuthType::ApiKey,
            required: true,
            allowed_roles: vec![],
            required_scopes: vec![],
            permissions: vec![],
            require_client_cert: false,
            cert_to_role_mapping: Default::default(),
            require_either: vec![],
        };

        let mw = AuthMiddleware::new(route_auth, global);
        let mut headers = HeaderMap::new();
        headers.insert("X-API-Key", "abc".parse().unwrap());
        let addr: SocketAddr = "10.0.0.1:55555".parse().unwrap();
        let req =
            GatewayRequest::new(Method::GET, Uri::from_static("/x"), headers, Bytes::new(), addr);

        let resp = mw.handle(req, Arc::new(Echo)).await.unwrap();
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.body_bytes().unwrap(), &Bytes::from("meter-1"));
    }

    #[tokio::test]
    async fn require_either_falls_back_to_jwt() {
        let mut route_auth = permission_route_auth();
        route_auth.permissions.clear();
        route_auth.require_either = vec!["client_cert".into(), "jwt".into()];

        let mw = AuthMiddleware::new(route_auth, global_with_jwt("s"));
        let t = token("s", &[]);

        // No client certificate present; the JWT should still get through.
        let resp = mw
            .handle(request_with_bearer(Method::GET, &t), Arc::new(Echo))
            .await
            .unwrap();
        assert_eq!(resp.status, StatusCode::OK);
    }
}
