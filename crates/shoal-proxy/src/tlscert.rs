//! Self-signed TLS material for the web listener, generated once into
//! the data dir and reused across restarts. Operators fronting the
//! proxy with real certificates just replace the files.

use std::path::Path;

use rcgen::{CertificateParams, DnType, KeyPair};

use shoal_common::persist;

use crate::ProxyError;

const CERT_FILE: &str = "webproxy_cert.pem";
const KEY_FILE: &str = "webproxy_key.pem";

/// Returns `(certificate_pem, key_pem)`, generating both on first use.
pub fn ensure_web_cert(data_dir: &Path) -> Result<(Vec<u8>, Vec<u8>), ProxyError> {
    let cert_path = data_dir.join(CERT_FILE);
    let key_path = data_dir.join(KEY_FILE);

    if cert_path.exists() && key_path.exists() {
        return Ok((std::fs::read(&cert_path)?, std::fs::read(&key_path)?));
    }

    let key = KeyPair::generate().map_err(|e| ProxyError::Tls(e.to_string()))?;
    let mut params = CertificateParams::new(vec!["localhost".to_string()])
        .map_err(|e| ProxyError::Tls(e.to_string()))?;
    params
        .distinguished_name
        .push(DnType::CommonName, "shoal web proxy");
    let cert = params
        .self_signed(&key)
        .map_err(|e| ProxyError::Tls(e.to_string()))?;

    let cert_pem = cert.pem().into_bytes();
    let key_pem = key.serialize_pem().into_bytes();
    persist::write_atomic(&cert_path, &cert_pem, false)?;
    persist::write_secret(&key_path, &key_pem)?;
    tracing::info!(path = %cert_path.display(), "Generated self-signed web certificate");

    Ok((cert_pem, key_pem))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_call_generates_later_calls_reuse() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_a, key_a) = ensure_web_cert(dir.path()).unwrap();
        assert!(String::from_utf8_lossy(&cert_a).contains("BEGIN CERTIFICATE"));
        assert!(String::from_utf8_lossy(&key_a).contains("PRIVATE KEY"));

        let (cert_b, key_b) = ensure_web_cert(dir.path()).unwrap();
        assert_eq!(cert_a, cert_b);
        assert_eq!(key_a, key_b);
    }
}
