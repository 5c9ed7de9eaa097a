//! Wire types for the auth control API, shared by the axum handlers
//! and the client. Keys and certificates travel OpenSSH-encoded;
//! binary payloads travel base64.

use serde::{Deserialize, Serialize};

use shoal_common::Role;

use crate::ca::{CaKind, CertAuthority};
use crate::error::AuthError;
use crate::server::Presence;

#[derive(Debug, Serialize, Deserialize)]
pub struct AddTokenRequest {
    pub role: Role,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AddTokenResponse {
    pub token: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub token: String,
    pub host_uuid: String,
    pub role: Role,
    /// OpenSSH public key line of the joiner's freshly generated key.
    pub public_key: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterResponse {
    /// OpenSSH host certificate for the joiner.
    pub certificate: String,
    /// Host-CA checking keys so the joiner can pin the cluster.
    pub host_ca_keys: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HostCertRequest {
    pub public_key: String,
    pub host_uuid: String,
    pub role: Role,
    /// `None` = no expiry.
    pub ttl_secs: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UserCertRequest {
    pub public_key: String,
    pub login: String,
    pub ttl_secs: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CertResponse {
    pub certificate: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SignInRequest {
    pub login: String,
    pub password: String,
    pub otp: String,
}

/// A certificate authority as served over the wire: checking material
/// only. Signing keys never leave the auth process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireAuthority {
    pub domain: String,
    pub kind: CaKind,
    pub checking_keys: Vec<String>,
}

impl WireAuthority {
    pub fn from_authority(ca: &CertAuthority) -> Result<Self, AuthError> {
        let checking_keys = ca
            .checking_keys
            .iter()
            .map(|k| {
                std::str::from_utf8(k)
                    .map(|s| s.trim().to_string())
                    .map_err(|e| AuthError::Internal(format!("checking key encoding: {e}")))
            })
            .collect::<Result<_, _>>()?;
        Ok(Self {
            domain: ca.domain.clone(),
            kind: ca.kind,
            checking_keys,
        })
    }

    pub fn to_authority(&self) -> CertAuthority {
        CertAuthority {
            domain: self.domain.clone(),
            kind: self.kind,
            signing_keys: Vec::new(),
            checking_keys: self
                .checking_keys
                .iter()
                .map(|k| format!("{k}\n").into_bytes())
                .collect(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuthoritiesResponse {
    pub authorities: Vec<WireAuthority>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AddUserRequest {
    pub login: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AddUserResponse {
    pub signup_token: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SignupRequest {
    pub token: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SignupResponse {
    pub login: String,
    /// Base64 of the raw TOTP secret; shown exactly once.
    pub totp_secret: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PresenceList {
    pub nodes: Vec<Presence>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionChunkRequest {
    pub seq: u64,
    /// Base64 payload.
    pub data: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionChunksResponse {
    pub chunks: Vec<String>,
}

/// The login response the proxy web endpoint returns to the user's
/// client: the short-lived certificate plus the cluster's host-CA
/// material to pin.
#[derive(Debug, Serialize, Deserialize)]
pub struct LoginResponse {
    pub certificate: String,
    pub host_authorities: Vec<WireAuthority>,
}

/// The web login request. Lives here so the proxy and the client crate
/// agree on one shape.
#[derive(Debug, Serialize, Deserialize)]
pub struct LoginRequest {
    pub login: String,
    pub password: String,
    pub otp: String,
    pub public_key: String,
    pub ttl_secs: u64,
}
