//! The auth control API. Open routes (`/v1/register`, `/v1/signup`)
//! authenticate with their own one-shot tokens; everything else
//! requires a signed request from a host certificate whose role is on
//! the route's allowlist.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::{Extension, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use shoal_common::error::ErrorBody;
use shoal_common::{defaults, ErrorCode, Role};

use crate::authn::{self, SignedHeaders, VerifiedPeer};
use crate::ca::CaKind;
use crate::error::AuthError;
use crate::protocol::*;
use crate::server::{AuthServer, Presence};

/// Largest request body the API accepts. Session chunks dominate; the
/// recorder flushes well below this.
const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

pub struct ApiError(pub AuthError);

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = ErrorCode::from(&self.0);
        // Internal detail stays in the log; the wire gets a flat message.
        let message = if code == ErrorCode::Internal {
            tracing::error!(error = %self.0, "Internal error on control API");
            "internal error".to_string()
        } else {
            self.0.to_string()
        };
        let status = StatusCode::from_u16(code.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(ErrorBody { code, message })).into_response()
    }
}

pub fn router(auth: Arc<AuthServer>) -> Router {
    let open = Router::new()
        .route("/healthz", get(health))
        .route("/v1/register", post(register))
        .route("/v1/signup", post(signup));

    let signed = Router::new()
        .route("/v1/tokens", post(add_token))
        .route("/v1/users", post(add_user))
        .route("/v1/certs/host", post(host_cert))
        .route("/v1/certs/user", post(user_cert))
        .route("/v1/signin", post(sign_in))
        .route("/v1/authorities/{kind}", get(authorities))
        .route("/v1/presence", post(put_presence).get(list_presence))
        .route(
            "/v1/sessions/{id}/chunks",
            post(append_chunk).get(list_chunks),
        )
        .layer(middleware::from_fn_with_state(auth.clone(), authenticate));

    open.merge(signed).with_state(auth)
}

/// Serve the control API on `addr` until cancelled upstream.
pub async fn serve(auth: Arc<AuthServer>, addr: std::net::SocketAddr) -> Result<(), AuthError> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "Auth control API listening");
    axum::serve(listener, router(auth))
        .await
        .map_err(|e| AuthError::Internal(format!("control API server: {e}")))
}

/// Buffer the body, verify the signature headers against the host CA,
/// and stash the verified peer for the handler.
async fn authenticate(
    State(auth): State<Arc<AuthServer>>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let (parts, body) = req.into_parts();
    let bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| AuthError::BadParameter(format!("request body: {e}")))?;

    let header = |name: &str| -> Result<String, AuthError> {
        parts
            .headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| AuthError::AccessDenied("request authentication failed".into()))
    };
    let headers = SignedHeaders {
        cert: header(authn::CERT_HEADER)?,
        timestamp: header(authn::TIMESTAMP_HEADER)?,
        signature: header(authn::SIGNATURE_HEADER)?,
    };

    let checkers = auth.host_ca_checkers().await?;
    let peer = authn::verify_request(
        &checkers,
        &headers,
        parts.method.as_str(),
        parts.uri.path(),
        &bytes,
    )?;

    let mut req = Request::from_parts(parts, Body::from(bytes));
    req.extensions_mut().insert(peer);
    Ok(next.run(req).await)
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn register(
    State(auth): State<Arc<AuthServer>>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, ApiError> {
    let response = auth
        .register_using_token(&req.token, &req.host_uuid, req.role, req.public_key.as_bytes())
        .await?;
    Ok(Json(response))
}

async fn signup(
    State(auth): State<Arc<AuthServer>>,
    Json(req): Json<SignupRequest>,
) -> Result<Json<SignupResponse>, ApiError> {
    let (login, secret) = auth
        .user_service()
        .complete_signup(&req.token, &req.password)
        .await?;
    Ok(Json(SignupResponse {
        login,
        totp_secret: BASE64.encode(secret),
    }))
}

async fn add_token(
    State(auth): State<Arc<AuthServer>>,
    Extension(peer): Extension<VerifiedPeer>,
    Json(req): Json<AddTokenRequest>,
) -> Result<Json<AddTokenResponse>, ApiError> {
    peer.require_role(&[Role::Admin])?;
    let token = auth
        .token_service()
        .add(req.role, defaults::PROVISIONING_TOKEN_TTL)
        .await?;
    Ok(Json(AddTokenResponse { token }))
}

async fn add_user(
    State(auth): State<Arc<AuthServer>>,
    Extension(peer): Extension<VerifiedPeer>,
    Json(req): Json<AddUserRequest>,
) -> Result<Json<AddUserResponse>, ApiError> {
    peer.require_role(&[Role::Admin])?;
    let signup_token = auth.user_service().add_signup_token(&req.login).await?;
    Ok(Json(AddUserResponse { signup_token }))
}

async fn host_cert(
    State(auth): State<Arc<AuthServer>>,
    Extension(peer): Extension<VerifiedPeer>,
    Json(req): Json<HostCertRequest>,
) -> Result<Json<CertResponse>, ApiError> {
    peer.require_role(&[Role::Admin])?;
    let cert = auth
        .generate_host_cert(
            req.public_key.as_bytes(),
            &req.host_uuid,
            req.role,
            req.ttl_secs.map(std::time::Duration::from_secs),
        )
        .await?;
    Ok(Json(CertResponse {
        certificate: String::from_utf8(cert)
            .map_err(|e| AuthError::Internal(format!("certificate encoding: {e}")))?,
    }))
}

async fn user_cert(
    State(auth): State<Arc<AuthServer>>,
    Extension(peer): Extension<VerifiedPeer>,
    Json(req): Json<UserCertRequest>,
) -> Result<Json<CertResponse>, ApiError> {
    peer.require_role(&[Role::Proxy, Role::Admin])?;
    let cert = auth
        .generate_user_cert(
            req.public_key.as_bytes(),
            &req.login,
            std::time::Duration::from_secs(req.ttl_secs),
        )
        .await?;
    Ok(Json(CertResponse {
        certificate: String::from_utf8(cert)
            .map_err(|e| AuthError::Internal(format!("certificate encoding: {e}")))?,
    }))
}

async fn sign_in(
    State(auth): State<Arc<AuthServer>>,
    Extension(peer): Extension<VerifiedPeer>,
    Json(req): Json<SignInRequest>,
) -> Result<StatusCode, ApiError> {
    peer.require_role(&[Role::Proxy, Role::Admin])?;
    auth.sign_in(&req.login, &req.password, &req.otp).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn authorities(
    State(auth): State<Arc<AuthServer>>,
    Extension(peer): Extension<VerifiedPeer>,
    Path(kind): Path<String>,
) -> Result<Json<AuthoritiesResponse>, ApiError> {
    peer.require_role(&[Role::Node, Role::Proxy, Role::Admin])?;
    let kind: CaKind = kind.parse()?;
    // Secrets stay gated off: this endpoint serves checking material only.
    let authorities = auth
        .ca_service()
        .get_all(kind, false)
        .await?
        .iter()
        .map(WireAuthority::from_authority)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Json(AuthoritiesResponse { authorities }))
}

async fn put_presence(
    State(auth): State<Arc<AuthServer>>,
    Extension(peer): Extension<VerifiedPeer>,
    Json(presence): Json<Presence>,
) -> Result<StatusCode, ApiError> {
    peer.require_role(&[Role::Node, Role::Proxy, Role::Admin])?;
    auth.upsert_presence(&presence).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_presence(
    State(auth): State<Arc<AuthServer>>,
    Extension(peer): Extension<VerifiedPeer>,
) -> Result<Json<PresenceList>, ApiError> {
    peer.require_role(&[Role::Proxy, Role::Admin])?;
    Ok(Json(PresenceList {
        nodes: auth.list_presence().await?,
    }))
}

async fn append_chunk(
    State(auth): State<Arc<AuthServer>>,
    Extension(peer): Extension<VerifiedPeer>,
    Path(session_id): Path<String>,
    Json(req): Json<SessionChunkRequest>,
) -> Result<StatusCode, ApiError> {
    peer.require_role(&[Role::Proxy, Role::Admin])?;
    let data = BASE64
        .decode(&req.data)
        .map_err(|e| AuthError::BadParameter(format!("chunk data: {e}")))?;
    auth.append_session_chunk(&session_id, req.seq, &data).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_chunks(
    State(auth): State<Arc<AuthServer>>,
    Extension(peer): Extension<VerifiedPeer>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionChunksResponse>, ApiError> {
    peer.require_role(&[Role::Proxy, Role::Admin])?;
    let chunks = auth
        .session_chunks(&session_id)
        .await?
        .iter()
        .map(|c| BASE64.encode(c))
        .collect();
    Ok(Json(SessionChunksResponse { chunks }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authn::sign_request;
    use crate::identity::Identity;
    use crate::server::AuthConfig;
    use axum::http::Request as HttpRequest;
    use shoal_backend::MemoryBackend;
    use tower::ServiceExt;

    async fn started() -> (Arc<AuthServer>, Identity, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let backend: Arc<dyn shoal_backend::Backend> = Arc::new(MemoryBackend::new());
        let (server, identity) = AuthServer::init(AuthConfig {
            backend,
            domain: "example.com".into(),
            data_dir: dir.path().to_path_buf(),
            host_uuid: "u-auth".into(),
            host_ca: None,
            user_ca: None,
            static_tokens: Vec::new(),
        })
        .await
        .unwrap();
        (server, identity, dir)
    }

    fn signed_post(identity: &Identity, path: &str, body: &str) -> HttpRequest<Body> {
        let headers = sign_request(identity, "POST", path, body.as_bytes()).unwrap();
        HttpRequest::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json")
            .header(authn::CERT_HEADER, headers.cert)
            .header(authn::TIMESTAMP_HEADER, headers.timestamp)
            .header(authn::SIGNATURE_HEADER, headers.signature)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn unsigned_request_to_signed_route_is_denied() {
        let (server, _identity, _dir) = started().await;
        let app = router(server);

        let req = HttpRequest::builder()
            .method("POST")
            .uri("/v1/tokens")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"role":"node"}"#))
            .unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn admin_identity_can_mint_tokens_and_nodes_can_join() {
        let (server, identity, _dir) = started().await;
        let app = router(server);

        // Admin mints a provisioning token.
        let response = app
            .clone()
            .oneshot(signed_post(&identity, "/v1/tokens", r#"{"role":"node"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), MAX_BODY_BYTES)
            .await
            .unwrap();
        let token: AddTokenResponse = serde_json::from_slice(&bytes).unwrap();

        // The joiner redeems it on the open register route.
        let (_, public) = crate::keys::generate_key_pair().unwrap();
        let register = serde_json::to_string(&RegisterRequest {
            token: token.token,
            host_uuid: "u-node".into(),
            role: Role::Node,
            public_key: String::from_utf8(public).unwrap(),
        })
        .unwrap();
        let req = HttpRequest::builder()
            .method("POST")
            .uri("/v1/register")
            .header("content-type", "application/json")
            .body(Body::from(register))
            .unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), MAX_BODY_BYTES)
            .await
            .unwrap();
        let joined: RegisterResponse = serde_json::from_slice(&bytes).unwrap();
        let cert = crate::keys::parse_certificate(joined.certificate.as_bytes()).unwrap();
        assert_eq!(cert.valid_principals(), ["u-node.example.com".to_string()]);
    }

    #[tokio::test]
    async fn non_admin_cannot_mint_tokens() {
        let (server, _identity, _dir) = started().await;

        // Forge a node identity signed by the real host CA.
        let ca = server
            .ca_service()
            .get(
                &crate::ca::CertAuthorityId::new("example.com", CaKind::Host),
                true,
            )
            .await
            .unwrap();
        let private = crate::keys::generate().unwrap();
        let cert = crate::ca::sign_host_cert(
            &ca.signer().unwrap(),
            &ssh_key::PublicKey::from(&private),
            "u-node.example.com",
            "node",
            None,
        )
        .unwrap();
        let node_identity = Identity {
            id: crate::identity::IdentityId::new("u-node", Role::Node),
            key_bytes: crate::keys::encode_private(&private).unwrap(),
            cert_bytes: crate::keys::encode_certificate(&cert).unwrap(),
            private_key: private,
            certificate: cert,
        };

        let app = router(server);
        let response = app
            .oneshot(signed_post(&node_identity, "/v1/tokens", r#"{"role":"node"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn bad_register_token_is_denied_uniformly() {
        let (server, _identity, _dir) = started().await;
        let app = router(server);

        let (_, public) = crate::keys::generate_key_pair().unwrap();
        let register = serde_json::to_string(&RegisterRequest {
            token: "deadbeefdeadbeefdeadbeefdeadbeef".into(),
            host_uuid: "u-node".into(),
            role: Role::Node,
            public_key: String::from_utf8(public).unwrap(),
        })
        .unwrap();
        let req = HttpRequest::builder()
            .method("POST")
            .uri("/v1/register")
            .header("content-type", "application/json")
            .body(Body::from(register))
            .unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}
