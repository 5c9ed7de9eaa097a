//! The trust cache: host CAs the user accepted from an authenticated
//! proxy, stored in `hostsigners.db` through the same backend and CA
//! service the server side uses. Only explicitly added CAs appear;
//! removal is an explicit user action.

use std::path::Path;
use std::sync::Arc;

use ssh_key::certificate::Certificate;

use shoal_auth::ca::{CaKind, CaService, CertAuthority};
use shoal_auth::protocol::WireAuthority;
use shoal_backend::{Backend, DirBackend};
use shoal_common::defaults;

use crate::ClientError;

/// Serializes trust-cache mutations: the design assumes one writer
/// per workstation and enforces it with the backend's advisory lock.
const WRITER_LOCK: &str = "trust-cache-writer";
const WRITER_LOCK_TTL: std::time::Duration = std::time::Duration::from_secs(30);

pub struct TrustCache {
    backend: Arc<DirBackend>,
    cas: CaService,
}

impl TrustCache {
    pub fn open(client_dir: &Path) -> Result<Self, ClientError> {
        let backend = Arc::new(DirBackend::open(
            client_dir.join(defaults::HOST_SIGNERS_STORE),
        )?);
        let shared: Arc<dyn Backend> = backend.clone();
        let cas = CaService::new(shared);
        Ok(Self { backend, cas })
    }

    /// Add host CAs received from a trusted proxy. Why trust them?
    /// Because the user just authenticated to that proxy over HTTPS
    /// with a password and a second factor.
    pub async fn add_host_signers(
        &self,
        authorities: &[WireAuthority],
    ) -> Result<(), ClientError> {
        self.backend.acquire_lock(WRITER_LOCK, WRITER_LOCK_TTL).await?;
        let result = self.add_host_signers_locked(authorities).await;
        self.backend.release_lock(WRITER_LOCK).await?;
        result
    }

    async fn add_host_signers_locked(
        &self,
        authorities: &[WireAuthority],
    ) -> Result<(), ClientError> {
        for authority in authorities {
            let ca = authority.to_authority();
            if ca.kind != CaKind::Host {
                continue;
            }
            self.cas.upsert(&ca, None).await?;
            tracing::info!(domain = %ca.domain, "Added host CA to trust cache");
        }
        Ok(())
    }

    pub async fn trusted_host_authorities(&self) -> Result<Vec<CertAuthority>, ClientError> {
        Ok(self.cas.get_all(CaKind::Host, false).await?)
    }

    /// Verify a host key presented during an SSH handshake to `remote`.
    /// Raw keys are rejected outright — trust-on-first-use is
    /// forbidden. Certificates are accepted only when their signature
    /// key byte-matches a checker of a cached host CA.
    pub async fn check_host_signature(
        &self,
        remote: &str,
        host_key: &[u8],
    ) -> Result<(), ClientError> {
        let Some(cert) = parse_presented_key(host_key) else {
            return Err(ClientError::AccessDenied(format!(
                "host {remote} presented a raw key, expected a certificate"
            )));
        };

        for ca in self.trusted_host_authorities().await? {
            for checker in ca.checkers()? {
                if checker.key_data() == cert.signature_key() {
                    return Ok(());
                }
            }
        }
        tracing::info!(%remote, "Host certificate matches no trusted authority");
        Err(ClientError::UnknownAuthority)
    }
}

/// The key arrives either as a wire blob or an OpenSSH text line;
/// anything that is not a certificate yields `None`.
fn parse_presented_key(host_key: &[u8]) -> Option<Certificate> {
    if let Ok(cert) = Certificate::from_bytes(host_key) {
        return Some(cert);
    }
    std::str::from_utf8(host_key)
        .ok()
        .and_then(|s| Certificate::from_openssh(s.trim()).ok())
}
