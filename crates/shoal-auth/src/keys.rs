//! Ed25519 SSH key generation and OpenSSH encoding helpers. Every key
//! in the trust plane goes through these so the on-disk and on-wire
//! formats stay uniform.

use rand::rngs::OsRng;
use ssh_key::{Algorithm, Certificate, LineEnding, PrivateKey, PublicKey};

use crate::error::AuthError;

/// Generate a fresh Ed25519 keypair.
pub fn generate() -> Result<PrivateKey, AuthError> {
    PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
        .map_err(|e| AuthError::ssh("keypair generation", e))
}

/// Generate a keypair and return it OpenSSH-encoded as
/// `(private, public)` bytes, the shape the backend and identity files
/// store.
pub fn generate_key_pair() -> Result<(Vec<u8>, Vec<u8>), AuthError> {
    let key = generate()?;
    Ok((encode_private(&key)?, encode_public(&PublicKey::from(&key))?))
}

pub fn encode_private(key: &PrivateKey) -> Result<Vec<u8>, AuthError> {
    let pem = key
        .to_openssh(LineEnding::LF)
        .map_err(|e| AuthError::ssh("private key encoding", e))?;
    Ok(pem.as_bytes().to_vec())
}

pub fn encode_public(key: &PublicKey) -> Result<Vec<u8>, AuthError> {
    let line = key
        .to_openssh()
        .map_err(|e| AuthError::ssh("public key encoding", e))?;
    Ok(format!("{line}\n").into_bytes())
}

pub fn parse_private(bytes: &[u8]) -> Result<PrivateKey, AuthError> {
    PrivateKey::from_openssh(bytes).map_err(|e| AuthError::ssh("private key parsing", e))
}

pub fn parse_public(bytes: &[u8]) -> Result<PublicKey, AuthError> {
    let s = std::str::from_utf8(bytes)
        .map_err(|e| AuthError::BadParameter(format!("public key is not utf-8: {e}")))?;
    PublicKey::from_openssh(s.trim()).map_err(|e| AuthError::ssh("public key parsing", e))
}

pub fn parse_certificate(bytes: &[u8]) -> Result<Certificate, AuthError> {
    let s = std::str::from_utf8(bytes)
        .map_err(|e| AuthError::BadParameter(format!("certificate is not utf-8: {e}")))?;
    Certificate::from_openssh(s.trim()).map_err(|e| AuthError::ssh("certificate parsing", e))
}

pub fn encode_certificate(cert: &Certificate) -> Result<Vec<u8>, AuthError> {
    let line = cert
        .to_openssh()
        .map_err(|e| AuthError::ssh("certificate encoding", e))?;
    Ok(format!("{line}\n").into_bytes())
}
