use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use rustls::server::{AllowAnyAnonymousOrAuthenticatedClient, AllowAnyAuthenticatedClient};
use rustls::{Certificate, PrivateKey, RootCertStore, ServerConfig};
use tokio_rustls::TlsAcceptor;
use tracing::info;

use crate::config::{ClientAuth, TlsConfig};
use crate::core::request::ClientIdentity;
use crate::error::{ConfigError, GatewayError};

/// Build the TLS acceptor: TLS 1.2 floor with the default ECDHE AEAD
/// suites, optional client CA for mTLS, ALPN per the h2 setting.
pub fn build_acceptor(cfg: &TlsConfig, http2: bool) -> Result<TlsAcceptor, GatewayError> {
    let certs = load_certs(&cfg.cert_file)?;
    let key = load_key(&cfg.key_file)?;

    let builder = ServerConfig::builder()
        .with_safe_default_cipher_suites()
        .with_safe_default_kx_groups()
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])
        .map_err(|e| ConfigError::ValidationError(format!("tls protocol versions: {e}")))?;

    let builder = match &cfg.client_ca {
        Some(ca_path) => {
            let mut roots = RootCertStore::empty();
            for cert in load_certs(ca_path)? {
                roots
                    .add(&cert)
                    .map_err(|e| ConfigError::ValidationError(format!("client ca: {e}")))?;
            }

            match cfg.client_auth {
                ClientAuth::Require => {
                    info!("mTLS enabled: requiring client certificates");
                    builder.with_client_cert_verifier(
                        AllowAnyAuthenticatedClient::new(roots).boxed(),
                    )
                }
                ClientAuth::Request => {
                    info!("mTLS enabled: client certificates optional");
                    builder.with_client_cert_verifier(
                        AllowAnyAnonymousOrAuthenticatedClient::new(roots).boxed(),
                    )
                }
                ClientAuth::None => builder.with_no_client_auth(),
            }
        }
        None => builder.with_no_client_auth(),
    };

    let mut server_config = builder
        .with_single_cert(certs, key)
        .map_err(|e| ConfigError::ValidationError(format!("tls certificate: {e}")))?;

    server_config.alpn_protocols = if http2 {
        vec![b"h2".to_vec(), b"http/1.1".to_vec()]
    } else {
        vec![b"http/1.1".to_vec()]
    };

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

fn load_certs(path: &str) -> Result<Vec<Certificate>, GatewayError> {
    let file = File::open(path)
        .map_err(|e| ConfigError::LoadError(format!("{path}: {e}")))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .map_err(|e| ConfigError::ParseError(format!("{path}: {e}")))?;

    if certs.is_empty() {
        return Err(ConfigError::ValidationError(format!("{path}: no certificates found")).into());
    }

    Ok(certs.into_iter().map(Certificate).collect())
}

fn load_key(path: &str) -> Result<PrivateKey, GatewayError> {
    let file = File::open(path)
        .map_err(|e| ConfigError::LoadError(format!("{path}: {e}")))?;
    let mut reader = BufReader::new(file);

    for item in rustls_pemfile::read_all(&mut reader)
        .map_err(|e| ConfigError::ParseError(format!("{path}: {e}")))?
    {
        match item {
            rustls_pemfile::Item::PKCS8Key(key)
            | rustls_pemfile::Item::RSAKey(key)
            | rustls_pemfile::Item::ECKey(key) => return Ok(PrivateKey(key)),
            _ => continue,
        }
    }

    Err(ConfigError::ValidationError(format!("{path}: no private key found")).into())
}

/// Parse the Subject CommonName and Organization values out of the peer's
/// leaf certificate.
pub fn client_identity(certs: &[Certificate]) -> Option<ClientIdentity> {
    let leaf = certs.first()?;
    let (_, parsed) = x509_parser::parse_x509_certificate(&leaf.0).ok()?;
    let subject = parsed.subject();

    let common_name = subject
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or_default()
        .to_string();

    let organizations = subject
        .iter_organization()
        .filter_map(|org| org.as_str().ok())
        .map(str::to_string)
        .collect();

    Some(ClientIdentity {
        common_name,
        organizations,
    })
}
