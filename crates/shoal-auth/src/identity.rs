//! The on-disk trust envelope of one host: a private key and the host
//! certificate binding it into the cluster. Files are named from the
//! `(uuid, role)` pair so one host keeps separate identities per role,
//! and are written atomically with owner-only permissions.

use std::future::Future;
use std::path::{Path, PathBuf};

use ssh_key::certificate::{CertType, Certificate};
use ssh_key::{PrivateKey, PublicKey};

use shoal_common::{persist, Role};

use crate::error::AuthError;
use crate::keys;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityId {
    pub host_uuid: String,
    pub role: Role,
}

impl IdentityId {
    pub fn new(host_uuid: impl Into<String>, role: Role) -> Self {
        Self {
            host_uuid: host_uuid.into(),
            role,
        }
    }

    pub fn key_path(&self, data_dir: &Path) -> PathBuf {
        data_dir.join(format!("host.{}.{}.key", self.host_uuid, self.role))
    }

    pub fn cert_path(&self, data_dir: &Path) -> PathBuf {
        data_dir.join(format!("host.{}.{}.cert", self.host_uuid, self.role))
    }
}

/// A parsed identity: raw bytes kept for re-serving, plus the parsed
/// key/certificate pair every outbound SSH handshake presents together.
#[derive(Clone, Debug)]
pub struct Identity {
    pub id: IdentityId,
    pub key_bytes: Vec<u8>,
    pub cert_bytes: Vec<u8>,
    pub private_key: PrivateKey,
    pub certificate: Certificate,
}

impl Identity {
    /// The certificate's principal, `<uuid>.<domain>`.
    pub fn principal(&self) -> Result<&str, AuthError> {
        self.certificate
            .valid_principals()
            .first()
            .map(String::as_str)
            .ok_or_else(|| AuthError::Internal("identity certificate has no principal".into()))
    }
}

/// Are both identity files in place?
pub fn have_keys(data_dir: &Path, id: &IdentityId) -> bool {
    id.key_path(data_dir).exists() && id.cert_path(data_dir).exists()
}

/// Persist a freshly issued key/certificate pair, key first, each via
/// temp-file + rename with mode 0600.
pub fn write_keys(
    data_dir: &Path,
    id: &IdentityId,
    key: &[u8],
    cert: &[u8],
) -> Result<(), AuthError> {
    tracing::debug!(
        key = %id.key_path(data_dir).display(),
        cert = %id.cert_path(data_dir).display(),
        "Writing host identity"
    );
    persist::write_secret(&id.key_path(data_dir), key)?;
    persist::write_secret(&id.cert_path(data_dir), cert)?;
    Ok(())
}

/// Read and parse the identity from disk. A parse failure names the
/// file that failed: an unbootstrapped host must be told which half of
/// its identity is broken.
pub fn read_identity(data_dir: &Path, id: &IdentityId) -> Result<Identity, AuthError> {
    let key_path = id.key_path(data_dir);
    let cert_path = id.cert_path(data_dir);

    let key_bytes = std::fs::read(&key_path)
        .map_err(|e| AuthError::NotFound(format!("identity key {}: {e}", key_path.display())))?;
    let cert_bytes = std::fs::read(&cert_path).map_err(|e| {
        AuthError::NotFound(format!("identity cert {}: {e}", cert_path.display()))
    })?;

    let private_key = keys::parse_private(&key_bytes).map_err(|e| {
        AuthError::BadParameter(format!("failed to parse {}: {e}", key_path.display()))
    })?;
    let certificate = keys::parse_certificate(&cert_bytes).map_err(|e| {
        AuthError::BadParameter(format!("failed to parse {}: {e}", cert_path.display()))
    })?;

    if certificate.cert_type() != CertType::Host {
        return Err(AuthError::BadParameter(format!(
            "{} holds a {:?} certificate, expected a host certificate",
            cert_path.display(),
            certificate.cert_type()
        )));
    }
    if certificate.public_key() != PublicKey::from(&private_key).key_data() {
        return Err(AuthError::BadParameter(format!(
            "{} does not certify the key in {}",
            cert_path.display(),
            key_path.display()
        )));
    }

    Ok(Identity {
        id: id.clone(),
        key_bytes,
        cert_bytes,
        private_key,
        certificate,
    })
}

/// Ensure an identity exists on disk, generating and enrolling one via
/// `issue` when absent, then re-read it so the runtime identity always
/// comes from the persisted bytes.
///
/// `issue` receives the OpenSSH public key and returns certificate
/// bytes — locally signed on the auth server, fetched over the join
/// protocol on every other host.
pub async fn bootstrap<F, Fut>(
    data_dir: &Path,
    id: &IdentityId,
    issue: F,
) -> Result<Identity, AuthError>
where
    F: FnOnce(Vec<u8>) -> Fut,
    Fut: Future<Output = Result<Vec<u8>, AuthError>>,
{
    if !have_keys(data_dir, id) {
        let (private, public) = keys::generate_key_pair()?;
        let cert = issue(public).await?;
        write_keys(data_dir, id, &private, &cert)?;
    }
    read_identity(data_dir, id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::{self, CaKind, CertAuthority};
    use shoal_common::role::principal;

    fn issue_with(
        ca: &CertAuthority,
        uuid: &str,
        role: Role,
    ) -> impl FnOnce(Vec<u8>) -> std::future::Ready<Result<Vec<u8>, AuthError>> {
        let signer = ca.signer().unwrap();
        let principal = principal(uuid, &ca.domain);
        move |public| {
            let subject = keys::parse_public(&public).unwrap();
            let cert =
                ca::sign_host_cert(&signer, &subject, &principal, role.as_str(), None).unwrap();
            std::future::ready(keys::encode_certificate(&cert))
        }
    }

    #[tokio::test]
    async fn bootstrap_writes_and_rereads_an_equivalent_identity() {
        let dir = tempfile::tempdir().unwrap();
        let ca = CertAuthority::generate("example.com", CaKind::Host).unwrap();
        let id = IdentityId::new("u-1", Role::Node);

        let identity = bootstrap(dir.path(), &id, issue_with(&ca, "u-1", Role::Node))
            .await
            .unwrap();
        assert_eq!(identity.principal().unwrap(), "u-1.example.com");
        assert!(ca::cert_signed_by(&identity.certificate, &ca).unwrap());

        let again = read_identity(dir.path(), &id).unwrap();
        assert_eq!(again.key_bytes, identity.key_bytes);
        assert_eq!(again.cert_bytes, identity.cert_bytes);
    }

    #[tokio::test]
    async fn bootstrap_is_idempotent_on_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let ca = CertAuthority::generate("example.com", CaKind::Host).unwrap();
        let id = IdentityId::new("u-1", Role::Node);

        let first = bootstrap(dir.path(), &id, issue_with(&ca, "u-1", Role::Node))
            .await
            .unwrap();
        // The second bootstrap must not regenerate: issue would panic on
        // a fresh CA mismatch, and the bytes must be identical.
        let second = bootstrap(dir.path(), &id, |_| {
            std::future::ready(Err(AuthError::Internal("must not be called".into())))
        })
        .await
        .unwrap();
        assert_eq!(first.key_bytes, second.key_bytes);
    }

    #[tokio::test]
    async fn separate_roles_get_separate_files() {
        let dir = tempfile::tempdir().unwrap();
        let node = IdentityId::new("u-1", Role::Node);
        let proxy = IdentityId::new("u-1", Role::Proxy);
        assert_ne!(node.key_path(dir.path()), proxy.key_path(dir.path()));
        assert_ne!(node.cert_path(dir.path()), proxy.cert_path(dir.path()));
    }

    #[test]
    fn corrupt_key_file_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let id = IdentityId::new("u-1", Role::Node);
        std::fs::write(id.key_path(dir.path()), b"garbage").unwrap();
        std::fs::write(id.cert_path(dir.path()), b"garbage").unwrap();

        let err = read_identity(dir.path(), &id).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("host.u-1.node.key"), "got: {msg}");
    }

    #[tokio::test]
    async fn plain_public_key_in_cert_slot_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let id = IdentityId::new("u-1", Role::Node);
        let (private, public) = keys::generate_key_pair().unwrap();
        write_keys(dir.path(), &id, &private, &public).unwrap();

        let err = read_identity(dir.path(), &id).unwrap_err();
        assert!(matches!(err, AuthError::BadParameter(_)));
    }

    #[tokio::test]
    async fn user_certificate_in_cert_slot_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ca = CertAuthority::generate("example.com", CaKind::User).unwrap();
        let id = IdentityId::new("u-1", Role::Node);

        let (private, public) = keys::generate_key_pair().unwrap();
        let subject = keys::parse_public(&public).unwrap();
        let cert = ca::sign_user_cert(
            &ca.signer().unwrap(),
            &subject,
            "alice",
            std::time::Duration::from_secs(60),
        )
        .unwrap();
        write_keys(
            dir.path(),
            &id,
            &private,
            &keys::encode_certificate(&cert).unwrap(),
        )
        .unwrap();

        let err = read_identity(dir.path(), &id).unwrap_err();
        assert!(err.to_string().contains("expected a host certificate"));
    }
}
