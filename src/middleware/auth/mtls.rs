use crate::config::RouteAuth;
use crate::core::request::ClientIdentity;
use crate::error::AuthError;
use crate::middleware::auth::context::{AuthContext, IdentityType};

/// Build an auth context from a verified client certificate identity.
pub fn validate(
    identity: Option<&ClientIdentity>,
    route_auth: &RouteAuth,
) -> Result<AuthContext, AuthError> {
    let identity = identity.ok_or(AuthError::CertificateRequired)?;
    let cn = identity.common_name.clone();

    let mut ctx = AuthContext {
        authenticated: true,
        identity_type: IdentityType::Device,
        user_id: None,
        client_id: (!cn.is_empty()).then(|| cn.clone()),
        roles: Vec::new(),
        scopes: Vec::new(),
        cert_common_name: Some(cn.clone()),
    };

    if let Some(role) = map_cn_to_role(&cn, route_auth) {
        ctx.roles.push(role);
    }

    // Organization values of the form "role:<name>" carry extra roles.
    for org in &identity.organizations {
        if let Some(role) = org.strip_prefix("role:") {
            ctx.roles.push(role.to_string());
        }
    }

    Ok(ctx)
}

fn map_cn_to_role(cn: &str, route_auth: &RouteAuth) -> Option<String> {
    let mapping = &route_auth.cert_to_role_mapping;
    if mapping.is_empty() {
        return None;
    }

    if let Some(role) = mapping.get(cn) {
        return Some(role.clone());
    }

    for (pattern, role) in mapping {
        if let Some(pattern) = pattern.strip_prefix("CN=") {
            if match_wildcard(cn, pattern) {
                return Some(role.clone());
            }
        }
    }

    None
}

/// Single-`*` wildcard match: "Device-*" matches "Device-42".
/// Patterns with more than one star never match.
fn match_wildcard(text: &str, pattern: &str) -> bool {
    if !pattern.contains('*') {
        return text == pattern;
    }

    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() != 2 {
        return false;
    }

    text.len() >= parts[0].len() + parts[1].len()
        && text.starts_with(parts[0])
        && text.ends_with(parts[1])
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use crate::config::AuthType;

    use super::*;

    fn route_auth(mapping: &[(&str, &str)]) -> RouteAuth {
        RouteAuth {
            auth_type: AuthType::Mtls,
            required: true,
            allowed_roles: vec![],
            required_scopes: vec![],
            permissions: vec![],
            require_client_cert: true,
            cert_to_role_mapping: mapping
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
            require_either: vec![],
        }
    }

    fn identity(cn: &str, orgs: &[&str]) -> ClientIdentity {
        ClientIdentity {
            common_name: cn.to_string(),
            organizations: orgs.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn requires_certificate() {
        assert!(matches!(
            validate(None, &route_auth(&[])),
            Err(AuthError::CertificateRequired)
        ));
    }

    #[test]
    fn exact_cn_mapping() {
        let auth = route_auth(&[("plc-7", "plc")]);
        let ctx = validate(Some(&identity("plc-7", &[])), &auth).unwrap();
        assert_eq!(ctx.identity_type, IdentityType::Device);
        assert_eq!(ctx.cert_common_name.as_deref(), Some("plc-7"));
        assert_eq!(ctx.roles, vec!["plc"]);
    }

    #[test]
    fn wildcard_cn_mapping() {
        let auth = route_auth(&[("CN=Device-*", "device")]);
        let ctx = validate(Some(&identity("Device-42", &[])), &auth).unwrap();
        assert_eq!(ctx.roles, vec!["device"]);

        let ctx = validate(Some(&identity("Sensor-42", &[])), &auth).unwrap();
        assert!(ctx.roles.is_empty());
    }

    #[test]
    fn wildcard_with_suffix() {
        let auth = route_auth(&[("CN=edge-*-prod", "edge")]);
        let ctx = validate(Some(&identity("edge-7-prod", &[])), &auth).unwrap();
        assert_eq!(ctx.roles, vec!["edge"]);

        let ctx = validate(Some(&identity("edge-7-dev", &[])), &auth).unwrap();
        assert!(ctx.roles.is_empty());
    }

    #[test]
    fn multi_star_patterns_never_match() {
        let auth = route_auth(&[("CN=a*b*c", "never")]);
        let ctx = validate(Some(&identity("aXbYc", &[])), &auth).unwrap();
        assert!(ctx.roles.is_empty());
    }

    #[test]
    fn organization_roles_are_appended() {
        let auth = route_auth(&[("CN=Device-*", "device")]);
        let ctx = validate(
            Some(&identity("Device-1", &["role:operator", "Acme Corp"])),
            &auth,
        )
        .unwrap();
        assert_eq!(ctx.roles, vec!["device", "operator"]);
    }
}
