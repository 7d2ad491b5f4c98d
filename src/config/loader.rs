use std::collections::HashSet;
use std::path::Path;

use regex::Regex;
use url::Url;

use crate::config::{AuthType, GatewayConfig, Protocol, Route, Upstream};
use crate::error::ConfigError;

/// Load a configuration file, expanding `${NAME}` environment references in
/// the raw text before parsing. Format is detected by extension: `.json` is
/// JSON, everything else is YAML.
pub fn load(path: impl AsRef<Path>) -> Result<GatewayConfig, ConfigError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::LoadError(format!("{}: {e}", path.display())))?;

    let expanded = expand_env(&raw);

    let mut cfg: GatewayConfig = if path.extension().is_some_and(|ext| ext == "json") {
        serde_json::from_str(&expanded).map_err(|e| ConfigError::ParseError(e.to_string()))?
    } else {
        serde_yaml::from_str(&expanded).map_err(|e| ConfigError::ParseError(e.to_string()))?
    };

    apply_defaults(&mut cfg);
    validate(&cfg)?;

    Ok(cfg)
}

/// Replace `${NAME}` with the value of the environment variable NAME.
/// Undefined variables expand to the empty string.
fn expand_env(input: &str) -> String {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("static regex");
    re.replace_all(input, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_default()
    })
    .into_owned()
}

fn apply_defaults(cfg: &mut GatewayConfig) {
    for route in &mut cfg.routes {
        // Single-upstream shorthand
        if let Some(upstream) = route.upstream.take() {
            if route.upstreams.is_empty() {
                route.upstreams.push(Upstream {
                    url: upstream,
                    weight: 100,
                    health_check: None,
                });
            }
        }

        for upstream in &mut route.upstreams {
            if upstream.weight == 0 {
                upstream.weight = 100;
            }
        }

        for method in &mut route.methods {
            *method = method.to_ascii_uppercase();
        }
    }
}

fn validate(cfg: &GatewayConfig) -> Result<(), ConfigError> {
    if cfg.routes.is_empty() {
        return Err(ConfigError::ValidationError("no routes defined".into()));
    }

    if let Some(tls) = &cfg.server.tls {
        if tls.enabled {
            if tls.cert_file.is_empty() {
                return Err(ConfigError::ValidationError(
                    "tls enabled but cert_file not specified".into(),
                ));
            }
            if tls.key_file.is_empty() {
                return Err(ConfigError::ValidationError(
                    "tls enabled but key_file not specified".into(),
                ));
            }
        }
    }

    let mut names = HashSet::new();
    for (i, route) in cfg.routes.iter().enumerate() {
        if route.name.is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "route #{i}: name is required"
            )));
        }
        if !names.insert(route.name.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "route {}: duplicate name",
                route.name
            )));
        }
        if route.path.is_empty() || !route.path.starts_with('/') {
            return Err(ConfigError::ValidationError(format!(
                "route {}: path must start with '/'",
                route.name
            )));
        }

        validate_upstreams(route)?;

        if let Some(auth) = &route.auth {
            if auth.required
                && auth.auth_type == AuthType::Jwt
                && cfg.auth.jwt.as_ref().map_or(true, |jwt| !jwt.enabled)
            {
                return Err(ConfigError::ValidationError(format!(
                    "route {}: jwt auth required but no jwt config enabled",
                    route.name
                )));
            }
            if auth.required
                && auth.auth_type == AuthType::ApiKey
                && cfg.auth.api_key.as_ref().map_or(true, |ak| !ak.enabled)
            {
                return Err(ConfigError::ValidationError(format!(
                    "route {}: api_key auth required but no api_key config enabled",
                    route.name
                )));
            }

            for (k, perm) in auth.permissions.iter().enumerate() {
                if perm.methods.is_empty() {
                    return Err(ConfigError::ValidationError(format!(
                        "route {}: permission #{k} has no methods defined",
                        route.name
                    )));
                }
                if perm.role.is_none() && perm.identity_type.is_none() {
                    return Err(ConfigError::ValidationError(format!(
                        "route {}: permission #{k} must have either role or identity_type",
                        route.name
                    )));
                }
            }
        }
    }

    Ok(())
}

fn validate_upstreams(route: &Route) -> Result<(), ConfigError> {
    if route.upstreams.is_empty() {
        return Err(ConfigError::ValidationError(format!(
            "route {}: at least one upstream is required",
            route.name
        )));
    }

    for upstream in &route.upstreams {
        if upstream.url.is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "route {}: upstream URL is required",
                route.name
            )));
        }
        let parsed = Url::parse(&upstream.url).map_err(|e| {
            ConfigError::ValidationError(format!(
                "route {}: invalid upstream URL {}: {e}",
                route.name, upstream.url
            ))
        })?;
        if parsed.host_str().is_none() {
            return Err(ConfigError::ValidationError(format!(
                "route {}: upstream URL {} has no host",
                route.name, upstream.url
            )));
        }
        if route.protocol == Protocol::Grpc && !matches!(parsed.scheme(), "http" | "https") {
            return Err(ConfigError::ValidationError(format!(
                "route {}: grpc upstreams must use http or https URLs",
                route.name
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_config(contents: &str, ext: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(&format!(".{ext}"))
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_yaml_with_defaults() {
        let file = write_config(
            r#"
server:
  listen: "127.0.0.1:9000"
routes:
  - name: api
    path: /api/*
    upstream: http://localhost:3000
    strip_path: true
"#,
            "yaml",
        );

        let cfg = load(file.path()).unwrap();
        assert_eq!(cfg.server.listen, "127.0.0.1:9000");
        assert_eq!(cfg.routes.len(), 1);

        let route = &cfg.routes[0];
        assert_eq!(route.upstreams.len(), 1);
        assert_eq!(route.upstreams[0].weight, 100);
        assert_eq!(route.protocol, Protocol::Http);
        assert!(route.strip_path);
    }

    #[test]
    fn loads_json_by_extension() {
        let file = write_config(
            r#"{"routes":[{"name":"j","path":"/j","upstreams":[{"url":"http://localhost:1234"}]}]}"#,
            "json",
        );
        let cfg = load(file.path()).unwrap();
        assert_eq!(cfg.routes[0].name, "j");
    }

    #[test]
    fn expands_environment_variables() {
        std::env::set_var("GONK_TEST_UPSTREAM", "http://localhost:3131");
        let file = write_config(
            r#"
routes:
  - name: env
    path: /env
    upstream: "${GONK_TEST_UPSTREAM}"
"#,
            "yaml",
        );
        let cfg = load(file.path()).unwrap();
        assert_eq!(cfg.routes[0].upstreams[0].url, "http://localhost:3131");
    }

    #[test]
    fn rejects_route_without_upstreams() {
        let file = write_config(
            r#"
routes:
  - name: broken
    path: /broken
"#,
            "yaml",
        );
        assert!(load(file.path()).is_err());
    }

    #[test]
    fn rejects_permission_without_subject() {
        let file = write_config(
            r#"
auth:
  jwt:
    enabled: true
    secret_key: s
routes:
  - name: perm
    path: /perm
    upstream: http://localhost:3000
    auth:
      type: jwt
      required: true
      permissions:
        - methods: ["GET"]
"#,
            "yaml",
        );
        assert!(load(file.path()).is_err());
    }

    #[test]
    fn parses_durations_and_strategies() {
        let file = write_config(
            r#"
routes:
  - name: lb
    path: /lb/*
    upstreams:
      - url: http://localhost:3001
        weight: 70
      - url: http://localhost:3002
        weight: 30
    load_balancing:
      strategy: weighted
      health_check_interval: 3s
      health_check_timeout: 500ms
    circuit_breaker:
      enabled: true
      max_failures: 3
      reset_timeout: 1s
"#,
            "yaml",
        );
        let cfg = load(file.path()).unwrap();
        let lb = cfg.routes[0].load_balancing.as_ref().unwrap();
        assert_eq!(lb.strategy, crate::config::Strategy::Weighted);
        assert_eq!(lb.health_check_interval, std::time::Duration::from_secs(3));
        assert_eq!(
            lb.health_check_timeout,
            std::time::Duration::from_millis(500)
        );

        let cb = cfg.routes[0].circuit_breaker.as_ref().unwrap();
        assert_eq!(cb.max_failures, 3);
        assert_eq!(cb.reset_timeout, std::time::Duration::from_secs(1));
    }
}
