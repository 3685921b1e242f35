//! TLS configuration for STARTTLS upgrades
//!
//! Loads the server certificate and key once and hands out
//! `tokio_rustls` acceptors for in-band upgrades.

use crate::error::{LoginError, Result};
use rustls::ServerConfig;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Shared TLS server configuration.
#[derive(Clone, Debug)]
pub struct TlsProvider {
    server_config: Arc<ServerConfig>,
}

fn open_pem(path: &Path) -> Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| LoginError::Tls(format!("{}: {}", path.display(), e)))
}

impl TlsProvider {
    /// Load certificate chain and private key from PEM files.
    pub fn from_pem_files<P: AsRef<Path>>(cert_path: P, key_path: P) -> Result<Self> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();

        let chain: Vec<rustls::Certificate> = rustls_pemfile::certs(&mut open_pem(cert_path)?)
            .map_err(|e| LoginError::Tls(format!("{}: {}", cert_path.display(), e)))?
            .into_iter()
            .map(rustls::Certificate)
            .collect();
        if chain.is_empty() {
            return Err(LoginError::Tls(format!(
                "{}: no certificates found",
                cert_path.display()
            )));
        }

        let key = rustls_pemfile::pkcs8_private_keys(&mut open_pem(key_path)?)
            .map_err(|e| LoginError::Tls(format!("{}: {}", key_path.display(), e)))?
            .into_iter()
            .next()
            .ok_or_else(|| {
                LoginError::Tls(format!("{}: no PKCS#8 private key found", key_path.display()))
            })?;

        debug!(
            certs = chain.len(),
            "Loaded TLS identity from {}",
            cert_path.display()
        );

        let config = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(chain, rustls::PrivateKey(key))
            .map_err(|e| LoginError::Tls(e.to_string()))?;

        Ok(Self {
            server_config: Arc::new(config),
        })
    }

    /// Build from the `[tls]` config section; `Ok(None)` when disabled.
    pub fn from_config(config: &crate::config::TlsConfig) -> Result<Option<Self>> {
        if !config.enabled {
            return Ok(None);
        }
        match (&config.cert_path, &config.key_path) {
            (Some(cert), Some(key)) => Ok(Some(Self::from_pem_files(cert, key)?)),
            _ => Err(LoginError::Tls(
                "TLS enabled but certificate paths not configured".to_string(),
            )),
        }
    }

    /// Acceptor for upgrading one connection.
    pub fn acceptor(&self) -> tokio_rustls::TlsAcceptor {
        tokio_rustls::TlsAcceptor::from(self.server_config.clone())
    }
}

/// Generate a self-signed certificate for development and tests. Covers
/// the domain and its immediate wildcard.
pub fn generate_self_signed_cert(domain: &str, cert_output: &str, key_output: &str) -> Result<()> {
    let names = vec![domain.to_string(), format!("*.{}", domain)];
    let mut params = rcgen::CertificateParams::new(names);
    params.distinguished_name = rcgen::DistinguishedName::new();

    let cert = rcgen::Certificate::from_params(params)
        .map_err(|e| LoginError::Tls(e.to_string()))?;
    let cert_pem = cert
        .serialize_pem()
        .map_err(|e| LoginError::Tls(e.to_string()))?;
    let key_pem = cert.serialize_private_key_pem();

    for (path, pem) in [(cert_output, cert_pem), (key_output, key_pem)] {
        std::fs::write(path, pem).map_err(|e| LoginError::Tls(format!("{}: {}", path, e)))?;
    }

    info!("Wrote self-signed certificate for {} to {}", domain, cert_output);
    Ok(())
}
