use serde::{Deserialize, Serialize};

/// What kind of principal authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityType {
    User,
    Device,
    Service,
    #[default]
    Unknown,
}

impl IdentityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentityType::User => "user",
            IdentityType::Device => "device",
            IdentityType::Service => "service",
            IdentityType::Unknown => "unknown",
        }
    }
}

/// Authentication result attached to the in-flight request; discarded when
/// the request completes.
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    pub authenticated: bool,
    pub identity_type: IdentityType,
    pub user_id: Option<String>,
    pub client_id: Option<String>,
    pub roles: Vec<String>,
    pub scopes: Vec<String>,
    pub cert_common_name: Option<String>,
}

impl AuthContext {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r.eq_ignore_ascii_case(role))
    }
}
