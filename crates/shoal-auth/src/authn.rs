//! Signed-request authentication for the control API.
//!
//! Every internal API call carries the caller's host certificate and an
//! `SshSig` over a canonical string of the request. The server checks
//! that the certificate validates against the host CA, that the
//! signature verifies against the certificate's own subject key, and
//! that the timestamp is within the skew window — the same trust
//! statement an SSH handshake with a host certificate would make.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use ssh_key::certificate::CertType;
use ssh_key::{Fingerprint, HashAlg, LineEnding, PublicKey, SshSig};

use shoal_common::Role;

use crate::error::AuthError;
use crate::identity::Identity;
use crate::keys;

/// Domain-separation namespace for request signatures.
pub const SIG_NAMESPACE: &str = "shoal-api";

pub const CERT_HEADER: &str = "x-shoal-cert";
pub const TIMESTAMP_HEADER: &str = "x-shoal-timestamp";
pub const SIGNATURE_HEADER: &str = "x-shoal-signature";

/// Accepted clock skew between cluster members.
pub const MAX_CLOCK_SKEW: Duration = Duration::from_secs(300);

/// The three headers a signed request carries.
#[derive(Debug, Clone)]
pub struct SignedHeaders {
    pub cert: String,
    pub timestamp: String,
    pub signature: String,
}

/// The identity the server extracted from a verified request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedPeer {
    pub principal: String,
    pub role: Role,
}

impl VerifiedPeer {
    pub fn require_role(&self, allowed: &[Role]) -> Result<(), AuthError> {
        if allowed.contains(&self.role) {
            return Ok(());
        }
        Err(AuthError::AccessDenied(format!(
            "role {} may not call this endpoint",
            self.role
        )))
    }
}

fn canonical_string(method: &str, path: &str, timestamp: &str, body: &[u8]) -> String {
    let body_digest = BASE64.encode(Sha256::digest(body));
    format!("{method}\n{path}\n{timestamp}\n{body_digest}")
}

/// Sign an outgoing request with the local host identity.
pub fn sign_request(
    identity: &Identity,
    method: &str,
    path: &str,
    body: &[u8],
) -> Result<SignedHeaders, AuthError> {
    let timestamp = Utc::now().to_rfc3339();
    let canonical = canonical_string(method, path, &timestamp, body);
    let sig = identity
        .private_key
        .sign(SIG_NAMESPACE, HashAlg::Sha256, canonical.as_bytes())
        .map_err(|e| AuthError::ssh("request signing", e))?;
    let sig_pem = sig
        .to_pem(LineEnding::LF)
        .map_err(|e| AuthError::ssh("signature encoding", e))?;

    Ok(SignedHeaders {
        cert: BASE64.encode(&identity.cert_bytes),
        timestamp,
        signature: BASE64.encode(sig_pem.as_bytes()),
    })
}

/// Verify an incoming request. `checkers` is the host CA's checking
/// key set. Every failure is the same denial; the reasons differ only
/// in the log.
pub fn verify_request(
    checkers: &[PublicKey],
    headers: &SignedHeaders,
    method: &str,
    path: &str,
    body: &[u8],
) -> Result<VerifiedPeer, AuthError> {
    let cert_bytes = BASE64
        .decode(&headers.cert)
        .map_err(|e| reject(&format!("certificate header decoding: {e}")))?;
    let cert = keys::parse_certificate(&cert_bytes)
        .map_err(|e| reject(&format!("certificate parsing: {e}")))?;

    if cert.cert_type() != CertType::Host {
        return Err(reject("presented certificate is not a host certificate"));
    }

    let fingerprints: Vec<Fingerprint> = checkers
        .iter()
        .map(|checker| checker.fingerprint(HashAlg::Sha256))
        .collect();
    cert.validate(fingerprints.iter())
        .map_err(|e| reject(&format!("certificate validation: {e}")))?;

    let timestamp: DateTime<Utc> = DateTime::parse_from_rfc3339(&headers.timestamp)
        .map_err(|e| reject(&format!("timestamp parsing: {e}")))?
        .with_timezone(&Utc);
    let skew = (Utc::now() - timestamp).abs();
    if skew.to_std().unwrap_or(Duration::MAX) > MAX_CLOCK_SKEW {
        return Err(reject("request timestamp outside the skew window"));
    }

    let sig_pem = BASE64
        .decode(&headers.signature)
        .map_err(|e| reject(&format!("signature header decoding: {e}")))?;
    let sig = SshSig::from_pem(&sig_pem)
        .map_err(|e| reject(&format!("signature parsing: {e}")))?;

    let canonical = canonical_string(method, path, &headers.timestamp, body);
    let subject = PublicKey::from(cert.public_key().clone());
    subject
        .verify(SIG_NAMESPACE, canonical.as_bytes(), &sig)
        .map_err(|e| reject(&format!("signature verification: {e}")))?;

    let principal = cert
        .valid_principals()
        .first()
        .cloned()
        .ok_or_else(|| reject("certificate carries no principal"))?;
    let role: Role = cert
        .key_id()
        .parse()
        .map_err(|_| reject("certificate carries no recognizable role"))?;

    Ok(VerifiedPeer { principal, role })
}

fn reject(detail: &str) -> AuthError {
    tracing::debug!(detail, "Rejected control API request");
    AuthError::AccessDenied("request authentication failed".into())
}
