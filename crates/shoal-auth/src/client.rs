//! HTTP client for the auth control API. Every request carries a
//! 30-second deadline and, when an identity is loaded, the signed
//! headers the server authenticates.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::Serialize;

use shoal_common::error::ErrorBody;
use shoal_common::{defaults, ErrorCode, Role};

use crate::authn::sign_request;
use crate::error::AuthError;
use crate::identity::Identity;
use crate::protocol::*;
use crate::server::Presence;

#[derive(Clone)]
pub struct AuthClient {
    base: String,
    identity: Option<Identity>,
    http: reqwest::Client,
}

impl AuthClient {
    /// `addr` is `host:port` of the auth API. Pass the local identity
    /// for signed calls; `None` is only useful for the open routes
    /// (join, signup).
    pub fn new(addr: &str, identity: Option<Identity>) -> Result<Self, AuthError> {
        let http = reqwest::Client::builder()
            .timeout(defaults::AUTH_CALL_DEADLINE)
            .build()
            .map_err(|e| AuthError::Internal(format!("http client construction: {e}")))?;
        Ok(Self {
            base: format!("http://{}", addr.trim_end_matches('/')),
            identity,
            http,
        })
    }

    pub async fn register_using_token(
        &self,
        token: &str,
        host_uuid: &str,
        role: Role,
        public_key: &[u8],
    ) -> Result<RegisterResponse, AuthError> {
        let req = RegisterRequest {
            token: token.to_string(),
            host_uuid: host_uuid.to_string(),
            role,
            public_key: String::from_utf8(public_key.to_vec())
                .map_err(|e| AuthError::BadParameter(format!("public key encoding: {e}")))?,
        };
        self.post_json("/v1/register", &req).await
    }

    pub async fn complete_signup(
        &self,
        token: &str,
        password: &str,
    ) -> Result<SignupResponse, AuthError> {
        let req = SignupRequest {
            token: token.to_string(),
            password: password.to_string(),
        };
        self.post_json("/v1/signup", &req).await
    }

    pub async fn add_token(&self, role: Role) -> Result<String, AuthError> {
        let response: AddTokenResponse = self.post_json("/v1/tokens", &AddTokenRequest { role }).await?;
        Ok(response.token)
    }

    pub async fn add_user(&self, login: &str) -> Result<String, AuthError> {
        let response: AddUserResponse = self
            .post_json(
                "/v1/users",
                &AddUserRequest {
                    login: login.to_string(),
                },
            )
            .await?;
        Ok(response.signup_token)
    }

    pub async fn sign_in(&self, login: &str, password: &str, otp: &str) -> Result<(), AuthError> {
        let req = SignInRequest {
            login: login.to_string(),
            password: password.to_string(),
            otp: otp.to_string(),
        };
        self.post_no_content("/v1/signin", &req).await
    }

    pub async fn generate_user_cert(
        &self,
        public_key: &str,
        login: &str,
        ttl: Duration,
    ) -> Result<String, AuthError> {
        let req = UserCertRequest {
            public_key: public_key.to_string(),
            login: login.to_string(),
            ttl_secs: ttl.as_secs(),
        };
        let response: CertResponse = self.post_json("/v1/certs/user", &req).await?;
        Ok(response.certificate)
    }

    pub async fn authorities(&self, kind: &str) -> Result<Vec<WireAuthority>, AuthError> {
        let response: AuthoritiesResponse = self.get_json(&format!("/v1/authorities/{kind}")).await?;
        Ok(response.authorities)
    }

    pub async fn upsert_presence(&self, presence: &Presence) -> Result<(), AuthError> {
        self.post_no_content("/v1/presence", presence).await
    }

    pub async fn list_presence(&self) -> Result<Vec<Presence>, AuthError> {
        let response: PresenceList = self.get_json("/v1/presence").await?;
        Ok(response.nodes)
    }

    pub async fn append_session_chunk(
        &self,
        session_id: &str,
        seq: u64,
        data: &[u8],
    ) -> Result<(), AuthError> {
        let req = SessionChunkRequest {
            seq,
            data: BASE64.encode(data),
        };
        self.post_no_content(&format!("/v1/sessions/{session_id}/chunks"), &req)
            .await
    }

    async fn post_json<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        path: &str,
        req: &Req,
    ) -> Result<Resp, AuthError> {
        let response = self.send("POST", path, req).await?;
        response
            .json()
            .await
            .map_err(|e| AuthError::Internal(format!("auth api response decoding: {e}")))
    }

    async fn post_no_content<Req: Serialize>(&self, path: &str, req: &Req) -> Result<(), AuthError> {
        self.send("POST", path, req).await?;
        Ok(())
    }

    async fn get_json<Resp: DeserializeOwned>(&self, path: &str) -> Result<Resp, AuthError> {
        let response = self.send("GET", path, &()).await?;
        response
            .json()
            .await
            .map_err(|e| AuthError::Internal(format!("auth api response decoding: {e}")))
    }

    async fn send<Req: Serialize>(
        &self,
        method: &str,
        path: &str,
        req: &Req,
    ) -> Result<reqwest::Response, AuthError> {
        let body = if method == "GET" {
            Vec::new()
        } else {
            serde_json::to_vec(req)
                .map_err(|e| AuthError::Internal(format!("request encoding: {e}")))?
        };

        let url = format!("{}{path}", self.base);
        let mut builder = match method {
            "GET" => self.http.get(&url),
            _ => self
                .http
                .post(&url)
                .header("content-type", "application/json")
                .body(body.clone()),
        };

        if let Some(identity) = &self.identity {
            let headers = sign_request(identity, method, path, &body)?;
            builder = builder
                .header(crate::authn::CERT_HEADER, headers.cert)
                .header(crate::authn::TIMESTAMP_HEADER, headers.timestamp)
                .header(crate::authn::SIGNATURE_HEADER, headers.signature);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| AuthError::Internal(format!("auth api unreachable: {e}")))?;

        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.bytes().await.unwrap_or_default();
        Err(decode_error(status.as_u16(), &body))
    }
}

/// Rebuild the typed error from a non-2xx response, preserving the
/// wire kind.
fn decode_error(status: u16, body: &[u8]) -> AuthError {
    match serde_json::from_slice::<ErrorBody>(body) {
        Ok(err) => match err.code {
            ErrorCode::BadParameter => AuthError::BadParameter(err.message),
            ErrorCode::NotFound => AuthError::NotFound(err.message),
            ErrorCode::AlreadyExists => AuthError::AlreadyExists(err.message),
            ErrorCode::AccessDenied => AuthError::AccessDenied(err.message),
            ErrorCode::UnknownAuthority => AuthError::UnknownAuthority,
            ErrorCode::CompareFailed | ErrorCode::Internal => AuthError::Internal(err.message),
        },
        Err(_) => AuthError::Internal(format!("auth api returned status {status}")),
    }
}
