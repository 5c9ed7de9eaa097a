//! Client-side trust: the on-disk cache of host CAs the user has
//! accepted from a proxy they authenticated against, the short-lived
//! key store, and host signature verification for SSH handshakes.

pub mod keystore;
pub mod trust;

pub use keystore::{local_agent_identities, AgentIdentity, KeyStore, LocalKey};
pub use trust::TrustCache;

use std::path::PathBuf;
use std::time::Duration;

use shoal_auth::protocol::{LoginRequest, LoginResponse};
use shoal_auth::{keys, AuthError};
use shoal_backend::BackendError;
use shoal_common::defaults;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("no matching authority")]
    UnknownAuthority,

    #[error("auth: {0}")]
    Auth(#[from] AuthError),

    #[error("backend: {0}")]
    Backend(#[from] BackendError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Internal(String),
}

/// `$HOME/.shoal`, the per-user client state directory.
pub fn default_client_dir() -> PathBuf {
    let base = std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir);
    base.join(defaults::CLIENT_DIR)
}

/// Interactive login against a proxy: generate a fresh keypair, post
/// both factors, and persist the returned certificate and host-CA
/// material into the client dir.
///
/// `insecure` skips TLS verification for proxies still on their
/// self-signed web certificate.
pub async fn login(
    client_dir: &std::path::Path,
    proxy_web_addr: &str,
    login: &str,
    password: &str,
    otp: &str,
    ttl: Duration,
    insecure: bool,
) -> Result<(), ClientError> {
    let private = keys::generate()?;
    let public = keys::encode_public(&ssh_key::PublicKey::from(&private))?;

    let request = LoginRequest {
        login: login.to_string(),
        password: password.to_string(),
        otp: otp.to_string(),
        public_key: String::from_utf8(public)
            .map_err(|e| ClientError::Internal(format!("public key encoding: {e}")))?,
        ttl_secs: ttl.as_secs(),
    };

    let http = reqwest::Client::builder()
        .timeout(defaults::AUTH_CALL_DEADLINE)
        .danger_accept_invalid_certs(insecure)
        .build()
        .map_err(|e| ClientError::Internal(format!("http client construction: {e}")))?;
    let response = http
        .post(format!("https://{proxy_web_addr}/v1/sessions"))
        .json(&request)
        .send()
        .await
        .map_err(|e| ClientError::Internal(format!("proxy unreachable: {e}")))?;

    if !response.status().is_success() {
        return Err(ClientError::AccessDenied("invalid credentials".into()));
    }
    let response: LoginResponse = response
        .json()
        .await
        .map_err(|e| ClientError::Internal(format!("login response decoding: {e}")))?;

    store_login(client_dir, login, &private, &response).await
}

/// Persist a login response: key + certificate under their deadline,
/// and the proxy-delivered host CAs into the trust cache.
pub async fn store_login(
    client_dir: &std::path::Path,
    login: &str,
    private: &ssh_key::PrivateKey,
    response: &LoginResponse,
) -> Result<(), ClientError> {
    let certificate = keys::parse_certificate(response.certificate.as_bytes())?;
    let deadline = chrono::DateTime::from_timestamp(certificate.valid_before() as i64, 0)
        .unwrap_or_else(chrono::Utc::now);

    let store = KeyStore::open(client_dir)?;
    store.save(
        login,
        &LocalKey {
            priv_bytes: keys::encode_private(private)?,
            cert: response.certificate.clone().into_bytes(),
            deadline,
        },
    )?;

    let cache = TrustCache::open(client_dir)?;
    cache.add_host_signers(&response.host_authorities).await?;
    Ok(())
}
