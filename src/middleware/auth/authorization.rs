use hyper::Method;

use crate::config::{Permission, RouteAuth};
use crate::middleware::auth::context::AuthContext;

/// Evaluate role, scope and permission-matrix checks for an authenticated
/// context. Returns the human-readable denial reason on failure.
pub fn authorize(
    method: &Method,
    route_auth: &RouteAuth,
    ctx: &AuthContext,
) -> Result<(), String> {
    if !ctx.authenticated {
        return Err("not authenticated".to_string());
    }

    if !route_auth.allowed_roles.is_empty()
        && !has_any_role(&ctx.roles, &route_auth.allowed_roles)
    {
        return Err(format!(
            "insufficient role privileges: requires one of {:?}, has {:?}",
            route_auth.allowed_roles, ctx.roles
        ));
    }

    if !route_auth.required_scopes.is_empty()
        && !has_all_scopes(&ctx.scopes, &route_auth.required_scopes)
    {
        return Err(format!(
            "insufficient scopes: requires {:?}, has {:?}",
            route_auth.required_scopes, ctx.scopes
        ));
    }

    if !route_auth.permissions.is_empty()
        && !check_permissions(method, ctx, &route_auth.permissions)
    {
        return Err(format!(
            "method {} not allowed for roles {:?} or identity type {}",
            method,
            ctx.roles,
            ctx.identity_type.as_str()
        ));
    }

    Ok(())
}

/// A permission admits the request when it matches by role or identity
/// type, the method is listed, and any scopes it names are all held.
fn check_permissions(method: &Method, ctx: &AuthContext, permissions: &[Permission]) -> bool {
    for perm in permissions {
        let role_match = perm
            .role
            .as_deref()
            .is_some_and(|role| ctx.has_role(role));
        let identity_match = perm
            .identity_type
            .as_deref()
            .is_some_and(|ty| ty.eq_ignore_ascii_case(ctx.identity_type.as_str()));

        if !(role_match || identity_match) {
            continue;
        }

        if !has_method(&perm.methods, method) {
            continue;
        }

        if !perm.scopes.is_empty() && !has_all_scopes(&ctx.scopes, &perm.scopes) {
            continue;
        }

        return true;
    }

    false
}

fn has_any_role(user_roles: &[String], required: &[String]) -> bool {
    required
        .iter()
        .any(|r| user_roles.iter().any(|u| u.eq_ignore_ascii_case(r)))
}

fn has_all_scopes(user_scopes: &[String], required: &[String]) -> bool {
    required
        .iter()
        .all(|r| user_scopes.iter().any(|u| match_scope(u, r)))
}

/// Exact match, or wildcard `prefix:*` on either side:
/// a user scope `read:*` satisfies `read:sensors`, and a required scope
/// `read:*` is satisfied by `read:sensors`.
fn match_scope(user_scope: &str, required_scope: &str) -> bool {
    if user_scope == required_scope {
        return true;
    }

    if let Some(prefix) = user_scope.strip_suffix(":*") {
        return required_scope.starts_with(&format!("{prefix}:"));
    }

    if let Some(prefix) = required_scope.strip_suffix(":*") {
        return user_scope.starts_with(&format!("{prefix}:"));
    }

    false
}

fn has_method(allowed: &[String], method: &Method) -> bool {
    allowed
        .iter()
        .any(|m| m.eq_ignore_ascii_case(method.as_str()))
}

#[cfg(test)]
mod tests {
    use crate::config::AuthType;
    use crate::middleware::auth::context::IdentityType;

    use super::*;

    fn bare_auth() -> RouteAuth {
        RouteAuth {
            auth_type: AuthType::Jwt,
            required: true,
            allowed_roles: vec![],
            required_scopes: vec![],
            permissions: vec![],
            require_client_cert: false,
            cert_to_role_mapping: Default::default(),
            require_either: vec![],
        }
    }

    fn ctx(roles: &[&str], scopes: &[&str]) -> AuthContext {
        AuthContext {
            authenticated: true,
            identity_type: IdentityType::User,
            user_id: Some("u".into()),
            client_id: None,
            roles: roles.iter().map(|s| s.to_string()).collect(),
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            cert_common_name: None,
        }
    }

    #[test]
    fn scope_wildcards() {
        assert!(match_scope("read:*", "read:anything"));
        assert!(match_scope("read:sensors", "read:*"));
        assert!(match_scope("read:sensors", "read:sensors"));
        assert!(!match_scope("read:*", "write:anything"));
        assert!(!match_scope("write:anything", "read:*"));
    }

    #[test]
    fn roles_are_case_insensitive() {
        let mut auth = bare_auth();
        auth.allowed_roles = vec!["Technician".into()];
        assert!(authorize(&Method::GET, &auth, &ctx(&["technician"], &[])).is_ok());
        assert!(authorize(&Method::GET, &auth, &ctx(&["engineer"], &[])).is_err());
    }

    #[test]
    fn all_required_scopes_must_match() {
        let mut auth = bare_auth();
        auth.required_scopes = vec!["read:sensors".into(), "write:sensors".into()];

        assert!(authorize(
            &Method::GET,
            &auth,
            &ctx(&[], &["read:sensors", "write:sensors"])
        )
        .is_ok());
        assert!(authorize(&Method::GET, &auth, &ctx(&[], &["read:*"])).is_err());
        assert!(authorize(&Method::GET, &auth, &ctx(&[], &["read:*", "write:*"])).is_ok());
    }

    #[test]
    fn permission_matrix_by_role_and_method() {
        let mut auth = bare_auth();
        auth.permissions = vec![
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
        ];

        // technician may GET but not POST
        assert!(authorize(&Method::GET, &auth, &ctx(&["technician"], &[])).is_ok());
        assert!(authorize(&Method::POST, &auth, &ctx(&["technician"], &[])).is_err());

        // engineer may do both
        assert!(authorize(&Method::POST, &auth, &ctx(&["engineer"], &[])).is_ok());
    }

    #[test]
    fn permission_matrix_by_identity_type() {
        let mut auth = bare_auth();
        auth.permissions = vec![Permission {
            role: None,
            identity_type: Some("device".into()),
            methods: vec!["POST".into()],
            scopes: vec![],
        }];

        let mut device = ctx(&[], &[]);
        device.identity_type = IdentityType::Device;

        assert!(authorize(&Method::POST, &auth, &device).is_ok());
        assert!(authorize(&Method::POST, &auth, &ctx(&[], &[])).is_err());
    }

    #[test]
    fn permission_scopes_gate_the_grant() {
        let mut auth = bare_auth();
        auth.permissions = vec![Permission {
            role: Some("operator".into()),
            identity_type: None,
            methods: vec!["POST".into()],
            scopes: vec!["write:actuators".into()],
        }];

        assert!(authorize(
            &Method::POST,
            &auth,
            &ctx(&["operator"], &["write:actuators"])
        )
        .is_ok());
        assert!(authorize(&Method::POST, &auth, &ctx(&["operator"], &[])).is_err());
    }
}
