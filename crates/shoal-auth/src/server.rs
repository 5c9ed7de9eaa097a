//! The auth server: the only stateful role. Owns both certificate
//! authorities, validates join tokens, issues every certificate in the
//! cluster, and keeps presence and session records.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use shoal_backend::Backend;
use shoal_common::role::principal;
use shoal_common::{defaults, Role};

use crate::ca::{self, CaKind, CaService, CertAuthority, CertAuthorityId};
use crate::error::AuthError;
use crate::identity::{self, Identity, IdentityId};
use crate::keys;
use crate::lock::LockService;
use crate::protocol::RegisterResponse;
use crate::token::TokenService;
use crate::users::UserService;

const PRESENCE_BUCKET: &str = "presence";
const SESSIONS_BUCKET: &str = "sessions";

/// A node's liveness record, published with a short TTL so the record
/// expires on its own when the node dies.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Presence {
    pub host_uuid: String,
    pub principal: String,
    pub role: Role,
    pub addr: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// Everything `AuthServer::init` needs. Operator-supplied CA material
/// and static tokens are optional; everything else is mandatory.
pub struct AuthConfig {
    pub backend: Arc<dyn Backend>,
    pub domain: String,
    pub data_dir: PathBuf,
    pub host_uuid: String,
    pub host_ca: Option<CertAuthority>,
    pub user_ca: Option<CertAuthority>,
    /// `role:secret` strings installed on first start only.
    pub static_tokens: Vec<String>,
}

pub struct AuthServer {
    backend: Arc<dyn Backend>,
    domain: String,
    cas: CaService,
    tokens: TokenService,
    users: UserService,
}

impl AuthServer {
    /// First-start bootstrap. Serialized cluster-wide by an advisory
    /// lock named after the domain; concurrent replicas block, then
    /// observe the CAs the winner created. Any persistence failure here
    /// is fatal — partial initialization leaves ambiguous trust.
    pub async fn init(cfg: AuthConfig) -> Result<(Arc<AuthServer>, Identity), AuthError> {
        if cfg.data_dir.as_os_str().is_empty() {
            return Err(AuthError::BadParameter("data dir can not be empty".into()));
        }
        if cfg.host_uuid.is_empty() {
            return Err(AuthError::BadParameter("host UUID can not be empty".into()));
        }
        if cfg.domain.is_empty() {
            return Err(AuthError::BadParameter(
                "cluster domain can not be empty".into(),
            ));
        }
        std::fs::create_dir_all(&cfg.data_dir)?;

        let locks = LockService::new(cfg.backend.clone());
        locks
            .acquire(&cfg.domain, defaults::CLUSTER_LOCK_TTL)
            .await?;
        let result = Self::init_locked(&cfg).await;
        if let Err(e) = locks.release(&cfg.domain).await {
            tracing::warn!(error = %e, "Failed to release cluster init lock");
        }
        result
    }

    async fn init_locked(cfg: &AuthConfig) -> Result<(Arc<AuthServer>, Identity), AuthError> {
        let server = Arc::new(AuthServer {
            backend: cfg.backend.clone(),
            domain: cfg.domain.clone(),
            cas: CaService::new(cfg.backend.clone()),
            tokens: TokenService::new(cfg.backend.clone()),
            users: UserService::new(cfg.backend.clone()),
        });

        let mut first_start = false;
        for (kind, supplied) in [
            (CaKind::Host, cfg.host_ca.as_ref()),
            (CaKind::User, cfg.user_ca.as_ref()),
        ] {
            let id = CertAuthorityId::new(cfg.domain.clone(), kind);
            match server.cas.get(&id, false).await {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {
                    first_start = true;
                    let ca = match supplied {
                        Some(ca) => ca.clone(),
                        None => {
                            tracing::info!(domain = %cfg.domain, %kind, "First start: generating certificate authority");
                            CertAuthority::generate(&cfg.domain, kind)?
                        }
                    };
                    server.cas.upsert(&ca, None).await?;
                }
                Err(e) => return Err(e),
            }
        }

        if first_start && !cfg.static_tokens.is_empty() {
            tracing::info!("First start: installing provisioning tokens");
            for entry in &cfg.static_tokens {
                let (role, secret) = entry.split_once(':').ok_or_else(|| {
                    AuthError::BadParameter(format!(
                        "static token must be role:secret, got {entry:?}"
                    ))
                })?;
                let role: Role = role
                    .parse()
                    .map_err(|e| AuthError::BadParameter(format!("static token: {e}")))?;
                server
                    .tokens
                    .install(secret, role, defaults::PROVISIONING_TOKEN_TTL)
                    .await?;
            }
        }

        let id = IdentityId::new(cfg.host_uuid.clone(), Role::Admin);
        let identity = identity::bootstrap(&cfg.data_dir, &id, |public| {
            let server = server.clone();
            let host_uuid = cfg.host_uuid.clone();
            async move {
                server
                    .generate_host_cert(&public, &host_uuid, Role::Admin, None)
                    .await
            }
        })
        .await?;

        Ok((server, identity))
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn ca_service(&self) -> &CaService {
        &self.cas
    }

    pub fn token_service(&self) -> &TokenService {
        &self.tokens
    }

    pub fn user_service(&self) -> &UserService {
        &self.users
    }

    /// Checking keys of the host CA, parsed. The set signed requests
    /// and tunnel peers are verified against.
    pub async fn host_ca_checkers(&self) -> Result<Vec<ssh_key::PublicKey>, AuthError> {
        let ca = self
            .cas
            .get(&CertAuthorityId::new(self.domain.clone(), CaKind::Host), false)
            .await?;
        ca.checkers()
    }

    /// Issue a host certificate with principal `<uuid>.<domain>` and
    /// the role recorded as the certificate key id.
    pub async fn generate_host_cert(
        &self,
        public_key: &[u8],
        host_uuid: &str,
        role: Role,
        ttl: Option<Duration>,
    ) -> Result<Vec<u8>, AuthError> {
        let subject = keys::parse_public(public_key)?;
        let ca = self
            .cas
            .get(&CertAuthorityId::new(self.domain.clone(), CaKind::Host), true)
            .await?;
        let cert = ca::sign_host_cert(
            &ca.signer()?,
            &subject,
            &principal(host_uuid, &self.domain),
            role.as_str(),
            ttl,
        )?;
        keys::encode_certificate(&cert)
    }

    /// Issue a user certificate. The requested TTL is clamped into
    /// `[MIN_CERT_DURATION, MAX_CERT_DURATION]`.
    pub async fn generate_user_cert(
        &self,
        public_key: &[u8],
        login: &str,
        ttl: Duration,
    ) -> Result<Vec<u8>, AuthError> {
        if login.is_empty() {
            return Err(AuthError::BadParameter("login is empty".into()));
        }
        let subject = keys::parse_public(public_key)?;
        let ttl = ttl.clamp(defaults::MIN_CERT_DURATION, defaults::MAX_CERT_DURATION);
        let ca = self
            .cas
            .get(&CertAuthorityId::new(self.domain.clone(), CaKind::User), true)
            .await?;
        let cert = ca::sign_user_cert(&ca.signer()?, &subject, login, ttl)?;
        keys::encode_certificate(&cert)
    }

    /// The join protocol, auth side: validate and atomically consume
    /// the token, then issue a host certificate for the joiner.
    pub async fn register_using_token(
        &self,
        token: &str,
        host_uuid: &str,
        role: Role,
        public_key: &[u8],
    ) -> Result<RegisterResponse, AuthError> {
        if host_uuid.is_empty() {
            return Err(AuthError::BadParameter("host UUID can not be empty".into()));
        }
        // Parse before consuming: a malformed key must not burn a token.
        keys::parse_public(public_key)?;

        self.tokens.consume(token, role).await?;

        let cert = self
            .generate_host_cert(public_key, host_uuid, role, None)
            .await?;
        let host_ca = self
            .cas
            .get(&CertAuthorityId::new(self.domain.clone(), CaKind::Host), false)
            .await?;
        let host_ca_keys = host_ca
            .checking_keys
            .iter()
            .map(|k| {
                std::str::from_utf8(k)
                    .map(|s| s.trim().to_string())
                    .map_err(|e| AuthError::Internal(format!("checking key encoding: {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        tracing::info!(%host_uuid, %role, "Host joined the cluster");
        Ok(RegisterResponse {
            certificate: String::from_utf8(cert)
                .map_err(|e| AuthError::Internal(format!("certificate encoding: {e}")))?,
            host_ca_keys,
        })
    }

    /// Interactive sign-in: both factors must pass, and every failure
    /// mode is the same uniform denial.
    pub async fn sign_in(&self, login: &str, password: &str, otp: &str) -> Result<(), AuthError> {
        self.users
            .check_password(login, password)
            .await
            .map_err(|_| AuthError::invalid_credentials())?;
        self.users
            .check_otp(login, otp)
            .await
            .map_err(|_| AuthError::invalid_credentials())?;
        Ok(())
    }

    /// Record a node's presence; the record expires by TTL if the node
    /// stops publishing.
    pub async fn upsert_presence(&self, presence: &Presence) -> Result<(), AuthError> {
        let bytes = serde_json::to_vec(presence)
            .map_err(|e| AuthError::Internal(format!("presence encoding: {e}")))?;
        self.backend
            .put(
                &[PRESENCE_BUCKET],
                &presence.host_uuid,
                &bytes,
                Some(defaults::SERVER_HEARTBEAT_TTL),
            )
            .await?;
        Ok(())
    }

    pub async fn list_presence(&self) -> Result<Vec<Presence>, AuthError> {
        let mut nodes = Vec::new();
        for key in self.backend.list(&[PRESENCE_BUCKET]).await? {
            match self.backend.get(&[PRESENCE_BUCKET], &key).await {
                Ok(bytes) => {
                    let presence = serde_json::from_slice(&bytes)
                        .map_err(|e| AuthError::Internal(format!("presence decoding: {e}")))?;
                    nodes.push(presence);
                }
                // Expired between list and get; not an error.
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(nodes)
    }

    pub async fn append_session_chunk(
        &self,
        session_id: &str,
        seq: u64,
        data: &[u8],
    ) -> Result<(), AuthError> {
        self.backend
            .put(
                &[SESSIONS_BUCKET, session_id],
                &format!("{seq:012}"),
                data,
                None,
            )
            .await?;
        Ok(())
    }

    /// Session chunks in append order.
    pub async fn session_chunks(&self, session_id: &str) -> Result<Vec<Vec<u8>>, AuthError> {
        let mut chunks = Vec::new();
        for key in self.backend.list(&[SESSIONS_BUCKET, session_id]).await? {
            chunks.push(self.backend.get(&[SESSIONS_BUCKET, session_id], &key).await?);
        }
        Ok(chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_backend::MemoryBackend;
    use ssh_key::certificate::CertType;

    fn config(backend: Arc<dyn Backend>, dir: &std::path::Path, uuid: &str) -> AuthConfig {
        AuthConfig {
            backend,
            domain: "example.com".into(),
            data_dir: dir.to_path_buf(),
            host_uuid: uuid.into(),
            host_ca: None,
            user_ca: None,
            static_tokens: Vec::new(),
        }
    }

    #[tokio::test]
    async fn fresh_cluster_creates_both_authorities_and_admin_identity() {
        let dir = tempfile::tempdir().unwrap();
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let (server, identity) = AuthServer::init(config(backend, dir.path(), "u-auth"))
            .await
            .unwrap();

        for kind in [CaKind::Host, CaKind::User] {
            let ca = server
                .ca_service()
                .get(&CertAuthorityId::new("example.com", kind), false)
                .await
                .unwrap();
            assert_eq!(ca.kind, kind);
        }
        assert_eq!(identity.principal().unwrap(), "u-auth.example.com");
        assert_eq!(identity.certificate.key_id(), "admin");
    }

    #[tokio::test]
    async fn empty_inputs_fail_fast() {
        let dir = tempfile::tempdir().unwrap();
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());

        let mut cfg = config(backend.clone(), dir.path(), "");
        let err = match AuthServer::init(cfg).await {
            Err(err) => err,
            Ok(_) => panic!("expected AuthServer::init to fail"),
        };
        assert!(matches!(err, AuthError::BadParameter(_)));

        cfg = config(backend, dir.path(), "u-auth");
        cfg.domain = String::new();
        let err = match AuthServer::init(cfg).await {
            Err(err) => err,
            Ok(_) => panic!("expected AuthServer::init to fail"),
        };
        assert!(matches!(err, AuthError::BadParameter(_)));
    }

    #[tokio::test]
    async fn concurrent_first_starts_converge_on_one_ca_pair() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();

        let (a, b) = tokio::join!(
            AuthServer::init(config(backend.clone(), dir_a.path(), "u-a")),
            AuthServer::init(config(backend.clone(), dir_b.path(), "u-b")),
        );
        let (server_a, _) = a.unwrap();
        let (server_b, _) = b.unwrap();

        let ca_a = server_a
            .ca_service()
            .get(&CertAuthorityId::new("example.com", CaKind::Host), true)
            .await
            .unwrap();
        let ca_b = server_b
            .ca_service()
            .get(&CertAuthorityId::new("example.com", CaKind::Host), true)
            .await
            .unwrap();
        assert_eq!(ca_a, ca_b, "replicas must observe one shared host CA");
    }

    #[tokio::test]
    async fn second_start_reuses_existing_authorities() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let dir = tempfile::tempdir().unwrap();

        let (server, _) = AuthServer::init(config(backend.clone(), dir.path(), "u-auth"))
            .await
            .unwrap();
        let before = server
            .ca_service()
            .get(&CertAuthorityId::new("example.com", CaKind::Host), true)
            .await
            .unwrap();

        let (server, _) = AuthServer::init(config(backend, dir.path(), "u-auth"))
            .await
            .unwrap();
        let after = server
            .ca_service()
            .get(&CertAuthorityId::new("example.com", CaKind::Host), true)
            .await
            .unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn operator_supplied_ca_material_is_honored() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let dir = tempfile::tempdir().unwrap();
        let supplied = CertAuthority::generate("example.com", CaKind::Host).unwrap();

        let mut cfg = config(backend, dir.path(), "u-auth");
        cfg.host_ca = Some(supplied.clone());
        let (server, _) = AuthServer::init(cfg).await.unwrap();

        let stored = server
            .ca_service()
            .get(&CertAuthorityId::new("example.com", CaKind::Host), true)
            .await
            .unwrap();
        assert_eq!(stored, supplied);
    }

    #[tokio::test]
    async fn static_tokens_install_on_first_start_only() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let dir = tempfile::tempdir().unwrap();

        let mut cfg = config(backend.clone(), dir.path(), "u-auth");
        cfg.static_tokens = vec!["node:sekrit123".into()];
        let (server, _) = AuthServer::init(cfg).await.unwrap();

        server
            .token_service()
            .consume("sekrit123", Role::Node)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn malformed_static_token_is_fatal() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let dir = tempfile::tempdir().unwrap();

        let mut cfg = config(backend, dir.path(), "u-auth");
        cfg.static_tokens = vec!["no-colon-here".into()];
        let err = match AuthServer::init(cfg).await {
            Err(err) => err,
            Ok(_) => panic!("expected AuthServer::init to fail"),
        };
        assert!(matches!(err, AuthError::BadParameter(_)));
    }

    async fn started() -> (Arc<AuthServer>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let (server, _) = AuthServer::init(config(backend, dir.path(), "u-auth"))
            .await
            .unwrap();
        (server, dir)
    }

    #[tokio::test]
    async fn register_using_token_issues_and_burns() {
        let (server, _dir) = started().await;
        let token = server
            .token_service()
            .add(Role::Node, Duration::from_secs(60))
            .await
            .unwrap();
        let (_, public) = keys::generate_key_pair().unwrap();

        let response = server
            .register_using_token(&token, "u-node", Role::Node, &public)
            .await
            .unwrap();
        let cert = keys::parse_certificate(response.certificate.as_bytes()).unwrap();
        assert_eq!(cert.valid_principals(), ["u-node.example.com".to_string()]);
        assert_eq!(cert.cert_type(), CertType::Host);
        assert!(!response.host_ca_keys.is_empty());

        let err = server
            .register_using_token(&token, "u-other", Role::Node, &public)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::AccessDenied(_)));
    }

    #[tokio::test]
    async fn user_cert_ttl_is_clamped() {
        let (server, _dir) = started().await;
        let (_, public) = keys::generate_key_pair().unwrap();

        // Far below the minimum: clamped up to one minute.
        let cert_bytes = server
            .generate_user_cert(&public, "alice", Duration::from_secs(1))
            .await
            .unwrap();
        let cert = keys::parse_certificate(&cert_bytes).unwrap();
        let lifetime = cert.valid_before() - unix_now();
        assert!((50..=70).contains(&lifetime), "lifetime {lifetime}");

        // Far above the maximum: clamped down to thirty hours.
        let cert_bytes = server
            .generate_user_cert(&public, "alice", Duration::from_secs(1_000_000))
            .await
            .unwrap();
        let cert = keys::parse_certificate(&cert_bytes).unwrap();
        let lifetime = cert.valid_before() - unix_now();
        let max = defaults::MAX_CERT_DURATION.as_secs();
        assert!((max - 10..=max + 10).contains(&lifetime), "lifetime {lifetime}");
        assert_eq!(cert.cert_type(), CertType::User);
    }

    #[tokio::test]
    async fn sign_in_failures_are_indistinguishable() {
        let (server, _dir) = started().await;
        let signup = server.user_service().add_signup_token("alice").await.unwrap();
        let (_, secret) = server
            .user_service()
            .complete_signup(&signup, "correct horse")
            .await
            .unwrap();
        let secret = crate::totp::TotpSecret::from_bytes(secret);
        let otp = crate::totp::current_code(&secret).unwrap();

        server.sign_in("alice", "correct horse", &otp).await.unwrap();

        let wrong_password = server
            .sign_in("alice", "wrong", &otp)
            .await
            .unwrap_err()
            .to_string();
        let wrong_otp = server
            .sign_in("alice", "correct horse", "000000")
            .await
            .unwrap_err()
            .to_string();
        let unknown_user = server
            .sign_in("mallory", "wrong", "000000")
            .await
            .unwrap_err()
            .to_string();
        assert_eq!(wrong_password, wrong_otp);
        assert_eq!(wrong_password, unknown_user);
    }

    #[tokio::test]
    async fn presence_expires_on_its_own() {
        let (server, _dir) = started().await;
        server
            .upsert_presence(&Presence {
                host_uuid: "u-node".into(),
                principal: "u-node.example.com".into(),
                role: Role::Node,
                addr: "10.0.0.5:3022".into(),
                labels: HashMap::from([("env".to_string(), "prod".to_string())]),
            })
            .await
            .unwrap();

        let nodes = server.list_presence().await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].labels["env"], "prod");
    }

    #[tokio::test]
    async fn session_chunks_come_back_in_order() {
        let (server, _dir) = started().await;
        for seq in [2u64, 0, 1] {
            server
                .append_session_chunk("s-1", seq, format!("chunk-{seq}").as_bytes())
                .await
                .unwrap();
        }
        let chunks = server.session_chunks("s-1").await.unwrap();
        assert_eq!(
            chunks,
            vec![b"chunk-0".to_vec(), b"chunk-1".to_vec(), b"chunk-2".to_vec()]
        );
    }

    fn unix_now() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs()
    }
}
