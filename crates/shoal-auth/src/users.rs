//! The user store: argon2 password hashes, TOTP secrets, and one-shot
//! signup tokens. The store never answers *why* a credential check
//! failed — wrong login, wrong password, wrong code, and locked-out all
//! collapse into the same denial.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use shoal_backend::Backend;

use crate::error::AuthError;
use crate::token::random_secret;
use crate::totp::{self, RateLimiter, TotpSecret};

const USERS_BUCKET: &str = "users";
const SIGNUP_BUCKET: &str = "signup_tokens";

/// Signup tokens expire quickly; the URL is meant to be used right away.
pub const SIGNUP_TOKEN_TTL: Duration = Duration::from_secs(3600);

const TOMBSTONE: &[u8] = b"consumed";
const TOMBSTONE_TTL: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize, Deserialize)]
struct UserRecord {
    login: String,
    password_hash: String,
    totp_secret: Vec<u8>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SignupRecord {
    login: String,
}

#[derive(Clone)]
pub struct UserService {
    backend: Arc<dyn Backend>,
    limiters: Arc<Mutex<HashMap<String, RateLimiter>>>,
}

impl UserService {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            limiters: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Create a one-shot signup token for `login`. The caller renders it
    /// into a sign-up URL.
    pub async fn add_signup_token(&self, login: &str) -> Result<String, AuthError> {
        if login.is_empty() {
            return Err(AuthError::BadParameter("login is empty".into()));
        }
        if self.get_user(login).await?.is_some() {
            return Err(AuthError::AlreadyExists(format!("user {login}")));
        }
        let secret = random_secret();
        let record = serde_json::to_vec(&SignupRecord {
            login: login.to_string(),
        })
        .map_err(|e| AuthError::Internal(format!("signup token encoding: {e}")))?;
        self.backend
            .put(&[SIGNUP_BUCKET], &secret, &record, Some(SIGNUP_TOKEN_TTL))
            .await?;
        Ok(secret)
    }

    /// Consume a signup token, set the user's password, and mint their
    /// TOTP secret. Returns the secret exactly once; it is never
    /// readable again outside verification.
    pub async fn complete_signup(
        &self,
        token: &str,
        password: &str,
    ) -> Result<(String, Vec<u8>), AuthError> {
        if password.len() < 6 {
            return Err(AuthError::BadParameter(
                "password must be at least 6 characters".into(),
            ));
        }

        let current = match self.backend.get(&[SIGNUP_BUCKET], token).await {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => return Err(denied()),
            Err(e) => return Err(e.into()),
        };
        let record: SignupRecord = match serde_json::from_slice(&current) {
            Ok(record) => record,
            Err(_) => return Err(denied()),
        };

        // Single-use: the same CAS discipline provisioning tokens use.
        match self
            .backend
            .compare_and_swap(
                &[SIGNUP_BUCKET],
                token,
                Some(current.as_slice()),
                TOMBSTONE,
                Some(TOMBSTONE_TTL),
            )
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_compare_failed() => return Err(denied()),
            Err(e) => return Err(e.into()),
        }
        if let Err(e) = self.backend.delete(&[SIGNUP_BUCKET], token).await {
            if !e.is_not_found() {
                tracing::debug!(error = %e, "Failed to delete consumed signup token");
            }
        }

        let salt = SaltString::generate(&mut OsRng);
        let password_hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| AuthError::Internal(format!("password hashing: {e}")))?
            .to_string();
        let totp_secret = totp::generate_secret();

        let user = UserRecord {
            login: record.login.clone(),
            password_hash,
            totp_secret: totp_secret.as_bytes().to_vec(),
            created_at: Utc::now(),
        };
        let bytes = serde_json::to_vec(&user)
            .map_err(|e| AuthError::Internal(format!("user encoding: {e}")))?;
        self.backend
            .put(&[USERS_BUCKET], &record.login, &bytes, None)
            .await?;

        tracing::info!(login = %record.login, "User signup completed");
        Ok((record.login, totp_secret.as_bytes().to_vec()))
    }

    /// Verify the password factor.
    pub async fn check_password(&self, login: &str, password: &str) -> Result<(), AuthError> {
        let Some(user) = self.get_user(login).await? else {
            // Burn comparable time so an absent login is not
            // distinguishable by latency alone.
            let _ = Argon2::default().hash_password(password.as_bytes(), &SaltString::generate(&mut OsRng));
            return Err(AuthError::invalid_credentials());
        };
        let parsed = PasswordHash::new(&user.password_hash)
            .map_err(|e| AuthError::Internal(format!("stored hash parsing: {e}")))?;
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .map_err(|_| AuthError::invalid_credentials())
    }

    /// Verify the TOTP factor, with per-login lockout on repeated
    /// failures.
    pub async fn check_otp(&self, login: &str, code: &str) -> Result<(), AuthError> {
        let valid = match self.get_user(login).await? {
            Some(user) => {
                let secret = TotpSecret::from_bytes(user.totp_secret);
                totp::verify_code(&secret, code)
            }
            None => false,
        };

        let mut limiters = self.limiters.lock().unwrap();
        let limiter = limiters.entry(login.to_string()).or_default();
        limiter
            .check_and_record(valid)
            .map_err(|()| AuthError::invalid_credentials())
    }

    async fn get_user(&self, login: &str) -> Result<Option<UserRecord>, AuthError> {
        match self.backend.get(&[USERS_BUCKET], login).await {
            Ok(bytes) => {
                let user = serde_json::from_slice(&bytes)
                    .map_err(|e| AuthError::Internal(format!("user decoding: {e}")))?;
                Ok(Some(user))
            }
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

fn denied() -> AuthError {
    AuthError::AccessDenied("invalid or expired signup token".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_backend::MemoryBackend;

    fn service() -> UserService {
        UserService::new(Arc::new(MemoryBackend::new()))
    }

    async fn signed_up(svc: &UserService, login: &str, password: &str) -> Vec<u8> {
        let token = svc.add_signup_token(login).await.unwrap();
        let (completed_login, secret) = svc.complete_signup(&token, password).await.unwrap();
        assert_eq!(completed_login, login);
        secret
    }

    #[tokio::test]
    async fn signup_then_password_check_passes() {
        let svc = service();
        signed_up(&svc, "alice", "correct horse").await;

        svc.check_password("alice", "correct horse").await.unwrap();
        let err = svc.check_password("alice", "wrong").await.unwrap_err();
        assert!(matches!(err, AuthError::AccessDenied(_)));
    }

    #[tokio::test]
    async fn unknown_login_and_wrong_password_are_indistinguishable() {
        let svc = service();
        signed_up(&svc, "alice", "correct horse").await;

        let unknown = svc.check_password("mallory", "x").await.unwrap_err();
        let wrong = svc.check_password("alice", "x").await.unwrap_err();
        assert_eq!(unknown.to_string(), wrong.to_string());
    }

    #[tokio::test]
    async fn signup_token_is_single_use() {
        let svc = service();
        let token = svc.add_signup_token("alice").await.unwrap();
        svc.complete_signup(&token, "passw0rd").await.unwrap();

        let err = svc.complete_signup(&token, "other").await.unwrap_err();
        assert!(matches!(err, AuthError::AccessDenied(_)));
    }

    #[tokio::test]
    async fn duplicate_user_cannot_get_a_signup_token() {
        let svc = service();
        signed_up(&svc, "alice", "passw0rd").await;
        let err = svc.add_signup_token("alice").await.unwrap_err();
        assert!(matches!(err, AuthError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn otp_round_trip_and_lockout() {
        let svc = service();
        let secret_bytes = signed_up(&svc, "alice", "passw0rd").await;
        let secret = TotpSecret::from_bytes(secret_bytes);

        let code = totp::current_code(&secret).unwrap();
        svc.check_otp("alice", &code).await.unwrap();

        for _ in 0..3 {
            let _ = svc.check_otp("alice", "000000").await;
        }
        // Locked out now: even the valid code is rejected.
        let code = totp::current_code(&secret).unwrap();
        let err = svc.check_otp("alice", &code).await.unwrap_err();
        assert!(matches!(err, AuthError::AccessDenied(_)));
    }

    #[tokio::test]
    async fn short_password_is_a_bad_parameter() {
        let svc = service();
        let token = svc.add_signup_token("alice").await.unwrap();
        let err = svc.complete_signup(&token, "abc").await.unwrap_err();
        assert!(matches!(err, AuthError::BadParameter(_)));
    }
}
