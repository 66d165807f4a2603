//! TLS transport settings.
//!
//! Certificate *management* (issuance, rotation) is outside this crate; the
//! core only loads PEM material and hands out acceptors for STARTTLS and
//! implicit-TLS listeners.

use crate::error::{Result, SmtpError};
use rustls::ServerConfig;
use rustls_pemfile::{certs, pkcs8_private_keys};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Clone)]
pub struct TlsSettings {
    server_config: Arc<ServerConfig>,
}

impl TlsSettings {
    /// Load server TLS material from PEM certificate and key files.
    pub fn from_pem_files<P: AsRef<Path>>(cert_path: P, key_path: P) -> Result<Self> {
        info!("loading TLS certificate from {:?}", cert_path.as_ref());

        let cert_file = File::open(cert_path.as_ref())
            .map_err(|e| SmtpError::Tls(format!("failed to open certificate file: {e}")))?;
        let mut cert_reader = BufReader::new(cert_file);

        let certs = certs(&mut cert_reader)
            .map_err(|e| SmtpError::Tls(format!("failed to read certificates: {e}")))?;

        if certs.is_empty() {
            return Err(SmtpError::Tls("no certificates found in file".to_string()));
        }
        debug!("loaded {} certificate(s)", certs.len());

        let key_file = File::open(key_path.as_ref())
            .map_err(|e| SmtpError::Tls(format!("failed to open key file: {e}")))?;
        let mut key_reader = BufReader::new(key_file);

        let mut keys = pkcs8_private_keys(&mut key_reader)
            .map_err(|e| SmtpError::Tls(format!("failed to read private keys: {e}")))?;

        if keys.is_empty() {
            return Err(SmtpError::Tls("no private key found in file".to_string()));
        }
        let private_key = keys.remove(0);

        let config = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(
                certs.into_iter().map(rustls::Certificate).collect(),
                rustls::PrivateKey(private_key),
            )
            .map_err(|e| SmtpError::Tls(format!("failed to create TLS config: {e}")))?;

        Ok(Self {
            server_config: Arc::new(config),
        })
    }

    pub fn acceptor(&self) -> tokio_rustls::TlsAcceptor {
        tokio_rustls::TlsAcceptor::from(self.server_config.clone())
    }
}

/// Generate a self-signed certificate for development and tests.
///
/// Not suitable for production.
pub fn generate_self_signed_cert(domain: &str, cert_output: &str, key_output: &str) -> Result<()> {
    use rcgen::{CertificateParams, DistinguishedName};

    info!("generating self-signed certificate for {}", domain);

    let mut params = CertificateParams::default();
    params.distinguished_name = DistinguishedName::new();
    params.subject_alt_names = vec![
        rcgen::SanType::DnsName(domain.to_string()),
        rcgen::SanType::DnsName(format!("*.{domain}")),
    ];

    let cert = rcgen::Certificate::from_params(params)
        .map_err(|e| SmtpError::Tls(format!("failed to generate certificate: {e}")))?;

    let pem = cert
        .serialize_pem()
        .map_err(|e| SmtpError::Tls(format!("failed to serialize certificate: {e}")))?;
    std::fs::write(cert_output, pem)
        .map_err(|e| SmtpError::Tls(format!("failed to write certificate: {e}")))?;

    std::fs::write(key_output, cert.serialize_private_key_pem())
        .map_err(|e| SmtpError::Tls(format!("failed to write private key: {e}")))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_generate_and_load() {
        let cert_file = NamedTempFile::new().unwrap();
        let key_file = NamedTempFile::new().unwrap();

        generate_self_signed_cert(
            "test.local",
            cert_file.path().to_str().unwrap(),
            key_file.path().to_str().unwrap(),
        )
        .unwrap();

        let cert_content = std::fs::read_to_string(cert_file.path()).unwrap();
        assert!(cert_content.contains("BEGIN CERTIFICATE"));

        let settings = TlsSettings::from_pem_files(cert_file.path(), key_file.path()).unwrap();
        let _ = settings.acceptor();
    }

    #[test]
    fn test_missing_files_rejected() {
        let result = TlsSettings::from_pem_files("/nonexistent/cert.pem", "/nonexistent/key.pem");
        assert!(matches!(result, Err(SmtpError::Tls(_))));
    }
}
