//! The HTTPS login endpoint: the one place in the cluster that accepts
//! user passwords. Relays the two-factor check to auth, mints the user
//! certificate, and hands back the host-CA material the client pins.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use tokio_util::sync::CancellationToken;

use shoal_auth::protocol::{LoginRequest, LoginResponse, WireAuthority};
use shoal_auth::{AuthClient, AuthError};
use shoal_common::error::ErrorBody;
use shoal_common::ErrorCode;

use crate::tlscert;
use crate::ProxyError;

pub struct WebState {
    pub auth: AuthClient,
}

pub fn router(state: Arc<WebState>) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/v1/sessions", post(login))
        .with_state(state)
}

async fn health() -> StatusCode {
    StatusCode::OK
}

/// All credential failures leave as one uniform denial: a caller can
/// not learn whether the login, the password, or the second factor was
/// wrong.
fn uniform_denial() -> Response {
    (
        StatusCode::FORBIDDEN,
        Json(ErrorBody {
            code: ErrorCode::AccessDenied,
            message: "invalid credentials".into(),
        }),
    )
        .into_response()
}

async fn login(
    State(state): State<Arc<WebState>>,
    Json(req): Json<LoginRequest>,
) -> Response {
    if req.login.is_empty() || req.public_key.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorBody {
                code: ErrorCode::BadParameter,
                message: "login and public_key are required".into(),
            }),
        )
            .into_response();
    }

    if let Err(e) = state.auth.sign_in(&req.login, &req.password, &req.otp).await {
        tracing::info!(login = %req.login, error = %e, "Login rejected");
        return uniform_denial();
    }

    let certificate = match state
        .auth
        .generate_user_cert(
            &req.public_key,
            &req.login,
            std::time::Duration::from_secs(req.ttl_secs),
        )
        .await
    {
        Ok(cert) => cert,
        Err(AuthError::BadParameter(message)) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorBody {
                    code: ErrorCode::BadParameter,
                    message,
                }),
            )
                .into_response();
        }
        Err(e) => {
            tracing::error!(login = %req.login, error = %e, "Certificate issuance failed");
            return uniform_denial();
        }
    };

    let host_authorities: Vec<WireAuthority> = match state.auth.authorities("host").await {
        Ok(authorities) => authorities,
        Err(e) => {
            tracing::error!(error = %e, "Host authority fetch failed");
            return uniform_denial();
        }
    };

    tracing::info!(login = %req.login, "User signed in");
    Json(LoginResponse {
        certificate,
        host_authorities,
    })
    .into_response()
}

/// Serve the login endpoint over HTTPS with the proxy's (self-signed
/// by default) web certificate.
pub async fn serve(
    state: Arc<WebState>,
    data_dir: &Path,
    addr: SocketAddr,
    cancel: CancellationToken,
) -> Result<(), ProxyError> {
    let (cert_pem, key_pem) = tlscert::ensure_web_cert(data_dir)?;
    let tls = RustlsConfig::from_pem(cert_pem, key_pem)
        .await
        .map_err(|e| ProxyError::Tls(e.to_string()))?;

    tracing::info!(%addr, "Proxy web listening");
    let server = axum_server::bind_rustls(addr, tls).serve(router(state).into_make_service());

    tokio::select! {
        result = server => result.map_err(|e| ProxyError::Internal(format!("web server: {e}"))),
        _ = cancel.cancelled() => Ok(()),
    }
}
