//! Certificate authorities and the service that persists them.
//!
//! One authority exists per `(cluster domain, kind)`. The key lists are
//! ordered: the head pair is the active signer, older pairs stay listed
//! so certificates issued before a rotation keep verifying through
//! their own lifetime.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use ssh_key::certificate::{Builder as CertBuilder, CertType, Certificate};
use ssh_key::{PrivateKey, PublicKey};

use shoal_backend::Backend;

use crate::error::AuthError;
use crate::keys;

const AUTHORITIES_BUCKET: &str = "authorities";

/// Issued certificates begin a minute in the past so modest clock skew
/// between cluster members does not reject a fresh certificate.
const ISSUE_SKEW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaKind {
    /// Signs host identities.
    Host,
    /// Signs short-lived user credentials.
    User,
}

impl CaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaKind::Host => "host",
            CaKind::User => "user",
        }
    }
}

impl std::str::FromStr for CaKind {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "host" => Ok(CaKind::Host),
            "user" => Ok(CaKind::User),
            other => Err(AuthError::BadParameter(format!(
                "unrecognized authority kind: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for CaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertAuthorityId {
    pub domain: String,
    pub kind: CaKind,
}

impl CertAuthorityId {
    pub fn new(domain: impl Into<String>, kind: CaKind) -> Self {
        Self {
            domain: domain.into(),
            kind,
        }
    }

    fn storage_key(&self) -> String {
        format!("{}@{}", self.kind, self.domain)
    }
}

/// A certificate authority record. `signing_keys` and `checking_keys`
/// are parallel, ordered, OpenSSH-encoded; the head pair is active.
/// The public form (`without_secrets`) has an empty signing list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CertAuthority {
    pub domain: String,
    pub kind: CaKind,
    pub signing_keys: Vec<Vec<u8>>,
    pub checking_keys: Vec<Vec<u8>>,
}

impl CertAuthority {
    pub fn id(&self) -> CertAuthorityId {
        CertAuthorityId::new(self.domain.clone(), self.kind)
    }

    /// Generate a fresh authority with a single keypair.
    pub fn generate(domain: &str, kind: CaKind) -> Result<Self, AuthError> {
        let (private, public) = keys::generate_key_pair()?;
        Ok(Self {
            domain: domain.to_string(),
            kind,
            signing_keys: vec![private],
            checking_keys: vec![public],
        })
    }

    /// Every checking key parsed, in order. Callers compare candidate
    /// signer keys for byte equality against these.
    pub fn checkers(&self) -> Result<Vec<PublicKey>, AuthError> {
        self.checking_keys.iter().map(|k| keys::parse_public(k)).collect()
    }

    /// The active signer: the head of the signing list.
    pub fn signer(&self) -> Result<PrivateKey, AuthError> {
        let head = self.signing_keys.first().ok_or_else(|| {
            AuthError::AccessDenied(format!(
                "authority {}@{} has no signing material loaded",
                self.kind, self.domain
            ))
        })?;
        keys::parse_private(head)
    }

    /// Public form: checking keys only.
    pub fn without_secrets(&self) -> Self {
        Self {
            domain: self.domain.clone(),
            kind: self.kind,
            signing_keys: Vec::new(),
            checking_keys: self.checking_keys.clone(),
        }
    }

    pub fn has_secrets(&self) -> bool {
        !self.signing_keys.is_empty()
    }

    /// Prepend a fresh keypair. Previous pairs stay in place so already
    /// issued certificates keep verifying; new issuance uses the head.
    pub fn rotate(&mut self) -> Result<(), AuthError> {
        let (private, public) = keys::generate_key_pair()?;
        self.signing_keys.insert(0, private);
        self.checking_keys.insert(0, public);
        Ok(())
    }

    fn validate(&self) -> Result<(), AuthError> {
        if self.domain.is_empty() {
            return Err(AuthError::BadParameter("authority domain is empty".into()));
        }
        if self.checking_keys.is_empty() {
            return Err(AuthError::BadParameter(format!(
                "authority {}@{} has no checking keys",
                self.kind, self.domain
            )));
        }
        Ok(())
    }
}

/// Sign a host certificate. `ttl = None` issues a certificate with no
/// expiry, which is what long-lived host identities use.
pub fn sign_host_cert(
    signer: &PrivateKey,
    subject: &PublicKey,
    principal: &str,
    role: &str,
    ttl: Option<Duration>,
) -> Result<Certificate, AuthError> {
    build_cert(signer, subject, CertType::Host, role, &[principal], ttl)
}

/// Sign a user certificate valid for exactly `ttl`.
pub fn sign_user_cert(
    signer: &PrivateKey,
    subject: &PublicKey,
    login: &str,
    ttl: Duration,
) -> Result<Certificate, AuthError> {
    build_cert(signer, subject, CertType::User, login, &[login], Some(ttl))
}

fn build_cert(
    signer: &PrivateKey,
    subject: &PublicKey,
    cert_type: CertType,
    key_id: &str,
    principals: &[&str],
    ttl: Option<Duration>,
) -> Result<Certificate, AuthError> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let valid_after = now.saturating_sub(ISSUE_SKEW.as_secs());
    let valid_before = match ttl {
        Some(ttl) => now + ttl.as_secs(),
        None => u64::MAX,
    };

    let mut builder = CertBuilder::new_with_random_nonce(
        &mut OsRng,
        subject.key_data().clone(),
        valid_after,
        valid_before,
    )
    .map_err(|e| AuthError::ssh("certificate builder", e))?;

    builder
        .serial(OsRng.next_u64())
        .map_err(|e| AuthError::ssh("certificate serial", e))?;
    builder
        .cert_type(cert_type)
        .map_err(|e| AuthError::ssh("certificate type", e))?;
    builder
        .key_id(key_id)
        .map_err(|e| AuthError::ssh("certificate key id", e))?;
    for principal in principals {
        builder
            .valid_principal(*principal)
            .map_err(|e| AuthError::ssh("certificate principal", e))?;
    }

    builder
        .sign(signer)
        .map_err(|e| AuthError::ssh("certificate signing", e))
}

/// Does any checker of `ca` match the signature key of `cert`, by byte
/// equality?
pub fn cert_signed_by(cert: &Certificate, ca: &CertAuthority) -> Result<bool, AuthError> {
    for checker in ca.checkers()? {
        if checker.key_data() == cert.signature_key() {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Full user-certificate admission check, shared by every listener
/// that accepts user credentials: certificate type, CA signature,
/// validity window, and the login being opened must appear among the
/// principals.
pub fn verify_user_certificate(
    cert: &Certificate,
    checkers: &[PublicKey],
    login: &str,
) -> Result<(), AuthError> {
    if cert.cert_type() != CertType::User {
        return Err(AuthError::AccessDenied(
            "presented certificate is not a user certificate".into(),
        ));
    }
    let fingerprints: Vec<ssh_key::Fingerprint> = checkers
        .iter()
        .map(|checker| checker.fingerprint(ssh_key::HashAlg::Sha256))
        .collect();
    if cert.validate(fingerprints.iter()).is_err() {
        return Err(AuthError::UnknownAuthority);
    }
    if !cert.valid_principals().iter().any(|p| p == login) {
        return Err(AuthError::AccessDenied(format!(
            "certificate is not valid for login {login}"
        )));
    }
    Ok(())
}

/// CRUD over certificate authorities. The `with_secrets` flag is the
/// single authorization gate for signing material; it must stay false
/// at every call site outside the auth server itself.
#[derive(Clone)]
pub struct CaService {
    backend: Arc<dyn Backend>,
}

impl CaService {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    pub async fn upsert(&self, ca: &CertAuthority, ttl: Option<Duration>) -> Result<(), AuthError> {
        ca.validate()?;
        let bytes = serde_json::to_vec(ca)
            .map_err(|e| AuthError::Internal(format!("authority encoding: {e}")))?;
        self.backend
            .put(&[AUTHORITIES_BUCKET], &ca.id().storage_key(), &bytes, ttl)
            .await?;
        Ok(())
    }

    pub async fn get(
        &self,
        id: &CertAuthorityId,
        with_secrets: bool,
    ) -> Result<CertAuthority, AuthError> {
        let bytes = self
            .backend
            .get(&[AUTHORITIES_BUCKET], &id.storage_key())
            .await?;
        let ca: CertAuthority = serde_json::from_slice(&bytes)
            .map_err(|e| AuthError::Internal(format!("authority decoding: {e}")))?;
        Ok(if with_secrets { ca } else { ca.without_secrets() })
    }

    pub async fn get_all(
        &self,
        kind: CaKind,
        with_secrets: bool,
    ) -> Result<Vec<CertAuthority>, AuthError> {
        let prefix = format!("{kind}@");
        let mut authorities = Vec::new();
        for key in self.backend.list(&[AUTHORITIES_BUCKET]).await? {
            if !key.starts_with(&prefix) {
                continue;
            }
            let bytes = self.backend.get(&[AUTHORITIES_BUCKET], &key).await?;
            let ca: CertAuthority = serde_json::from_slice(&bytes)
                .map_err(|e| AuthError::Internal(format!("authority decoding: {e}")))?;
            authorities.push(if with_secrets { ca } else { ca.without_secrets() });
        }
        Ok(authorities)
    }

    pub async fn delete(&self, id: &CertAuthorityId) -> Result<(), AuthError> {
        self.backend
            .delete(&[AUTHORITIES_BUCKET], &id.storage_key())
            .await?;
        Ok(())
    }

    /// Rotate under compare-and-swap: a concurrent rotation loses with
    /// `compare_failed` instead of silently dropping a keypair.
    pub async fn rotate(&self, id: &CertAuthorityId) -> Result<CertAuthority, AuthError> {
        let key = id.storage_key();
        let old_bytes = self.backend.get(&[AUTHORITIES_BUCKET], &key).await?;
        let mut ca: CertAuthority = serde_json::from_slice(&old_bytes)
            .map_err(|e| AuthError::Internal(format!("authority decoding: {e}")))?;
        ca.rotate()?;
        let new_bytes = serde_json::to_vec(&ca)
            .map_err(|e| AuthError::Internal(format!("authority encoding: {e}")))?;
        self.backend
            .compare_and_swap(
                &[AUTHORITIES_BUCKET],
                &key,
                Some(old_bytes.as_slice()),
                &new_bytes,
                None,
            )
            .await?;
        Ok(ca)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_backend::MemoryBackend;

    fn service() -> CaService {
        CaService::new(Arc::new(MemoryBackend::new()))
    }

    #[tokio::test]
    async fn upsert_then_get_round_trips() {
        let svc = service();
        let ca = CertAuthority::generate("example.com", CaKind::Host).unwrap();
        svc.upsert(&ca, None).await.unwrap();

        let public = svc.get(&ca.id(), false).await.unwrap();
        assert_eq!(public.checking_keys, ca.checking_keys);
        assert!(public.signing_keys.is_empty());

        let full = svc.get(&ca.id(), true).await.unwrap();
        assert_eq!(full, ca);
    }

    #[tokio::test]
    async fn get_all_filters_by_kind() {
        let svc = service();
        let host = CertAuthority::generate("example.com", CaKind::Host).unwrap();
        let user = CertAuthority::generate("example.com", CaKind::User).unwrap();
        svc.upsert(&host, None).await.unwrap();
        svc.upsert(&user, None).await.unwrap();

        let hosts = svc.get_all(CaKind::Host, false).await.unwrap();
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].kind, CaKind::Host);
        assert!(!hosts[0].has_secrets());
    }

    #[tokio::test]
    async fn missing_authority_is_not_found() {
        let svc = service();
        let err = svc
            .get(&CertAuthorityId::new("nowhere.example", CaKind::Host), false)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn rotation_prepends_and_keeps_old_checkers() {
        let svc = service();
        let ca = CertAuthority::generate("example.com", CaKind::Host).unwrap();
        svc.upsert(&ca, None).await.unwrap();

        let rotated = svc.rotate(&ca.id()).await.unwrap();
        assert_eq!(rotated.checking_keys.len(), 2);
        assert_eq!(rotated.checking_keys[1], ca.checking_keys[0]);
        assert_ne!(rotated.checking_keys[0], ca.checking_keys[0]);

        // A certificate signed before rotation still matches a checker.
        let subject = keys::generate().unwrap();
        let cert = sign_host_cert(
            &ca.signer().unwrap(),
            &PublicKey::from(&subject),
            "u1.example.com",
            "node",
            None,
        )
        .unwrap();
        assert!(cert_signed_by(&cert, &rotated).unwrap());
    }

    #[tokio::test]
    async fn host_cert_carries_principal_and_type() {
        let ca = CertAuthority::generate("example.com", CaKind::Host).unwrap();
        let subject = keys::generate().unwrap();
        let cert = sign_host_cert(
            &ca.signer().unwrap(),
            &PublicKey::from(&subject),
            "u1.example.com",
            "node",
            None,
        )
        .unwrap();

        assert_eq!(cert.cert_type(), CertType::Host);
        assert_eq!(cert.valid_principals(), ["u1.example.com".to_string()]);
        assert_eq!(cert.key_id(), "node");
        assert!(cert_signed_by(&cert, &ca).unwrap());
    }

    #[tokio::test]
    async fn user_cert_expiry_tracks_ttl() {
        let ca = CertAuthority::generate("example.com", CaKind::User).unwrap();
        let subject = keys::generate().unwrap();
        let ttl = Duration::from_secs(3600);
        let cert = sign_user_cert(
            &ca.signer().unwrap(),
            &PublicKey::from(&subject),
            "alice",
            ttl,
        )
        .unwrap();

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        let expires = cert.valid_before();
        assert!(expires >= now + 3590 && expires <= now + 3610);
        assert_eq!(cert.cert_type(), CertType::User);
        assert_eq!(cert.valid_principals(), ["alice".to_string()]);
    }

    #[tokio::test]
    async fn foreign_ca_does_not_match() {
        let ours = CertAuthority::generate("example.com", CaKind::Host).unwrap();
        let theirs = CertAuthority::generate("example.com", CaKind::Host).unwrap();
        let subject = keys::generate().unwrap();
        let cert = sign_host_cert(
            &theirs.signer().unwrap(),
            &PublicKey::from(&subject),
            "u1.example.com",
            "node",
            None,
        )
        .unwrap();
        assert!(!cert_signed_by(&cert, &ours).unwrap());
    }

    #[tokio::test]
    async fn user_certificate_admission_checks_every_gate() {
        let ca = CertAuthority::generate("example.com", CaKind::User).unwrap();
        let checkers = ca.checkers().unwrap();
        let subject = keys::generate().unwrap();
        let cert = sign_user_cert(
            &ca.signer().unwrap(),
            &PublicKey::from(&subject),
            "alice",
            Duration::from_secs(3600),
        )
        .unwrap();

        verify_user_certificate(&cert, &checkers, "alice").unwrap();

        // Wrong login.
        let err = verify_user_certificate(&cert, &checkers, "bob").unwrap_err();
        assert!(matches!(err, AuthError::AccessDenied(_)));

        // Untrusted CA.
        let other = CertAuthority::generate("example.com", CaKind::User).unwrap();
        let err = verify_user_certificate(&cert, &other.checkers().unwrap(), "alice").unwrap_err();
        assert!(matches!(err, AuthError::UnknownAuthority));

        // Host certificate in a user slot.
        let host_ca = CertAuthority::generate("example.com", CaKind::Host).unwrap();
        let host_cert = sign_host_cert(
            &host_ca.signer().unwrap(),
            &PublicKey::from(&subject),
            "alice",
            "node",
            None,
        )
        .unwrap();
        let err =
            verify_user_certificate(&host_cert, &host_ca.checkers().unwrap(), "alice").unwrap_err();
        assert!(matches!(err, AuthError::AccessDenied(_)));
    }

    #[test]
    fn public_form_cannot_sign() {
        let ca = CertAuthority::generate("example.com", CaKind::Host).unwrap();
        let public = ca.without_secrets();
        assert!(matches!(
            public.signer(),
            Err(AuthError::AccessDenied(_))
        ));
    }
}
