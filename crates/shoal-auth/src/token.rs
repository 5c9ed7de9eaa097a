//! One-shot provisioning tokens. A token authorizes exactly one host
//! to join in a named role; consumption is atomic via backend
//! compare-and-swap so concurrent redemptions have one winner. Every
//! failure a prospective joiner can observe is `access denied` — tokens
//! are not probeable.

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use shoal_backend::Backend;
use shoal_common::Role;

use crate::error::AuthError;

const TOKENS_BUCKET: &str = "tokens";

/// How long a consumed-token tombstone lingers so a concurrent
/// redeemer fails its compare instead of observing absence.
const TOMBSTONE_TTL: Duration = Duration::from_secs(10);

const TOMBSTONE: &[u8] = b"consumed";

#[derive(Debug, Serialize, Deserialize)]
struct TokenRecord {
    role: Role,
}

#[derive(Clone)]
pub struct TokenService {
    backend: Arc<dyn Backend>,
}

impl TokenService {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    /// Mint a fresh token for `role` and store it with `ttl`.
    pub async fn add(&self, role: Role, ttl: Duration) -> Result<String, AuthError> {
        let secret = random_secret();
        self.install(&secret, role, ttl).await?;
        Ok(secret)
    }

    /// Install an operator-supplied token secret.
    pub async fn install(&self, secret: &str, role: Role, ttl: Duration) -> Result<(), AuthError> {
        if !role.joinable() {
            return Err(AuthError::BadParameter(format!(
                "role {role} cannot join via token"
            )));
        }
        if secret.is_empty() {
            return Err(AuthError::BadParameter("token secret is empty".into()));
        }
        let record = serde_json::to_vec(&TokenRecord { role })
            .map_err(|e| AuthError::Internal(format!("token encoding: {e}")))?;
        self.backend
            .put(&[TOKENS_BUCKET], secret, &record, Some(ttl))
            .await?;
        Ok(())
    }

    /// Redeem a token for the requested role. Exactly one concurrent
    /// caller succeeds; everyone else — wrong secret, wrong role,
    /// expired, already used — gets the same denial.
    pub async fn consume(&self, secret: &str, role: Role) -> Result<(), AuthError> {
        let current = match self.backend.get(&[TOKENS_BUCKET], secret).await {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => return Err(denied()),
            Err(e) => return Err(e.into()),
        };

        // A tombstone (or anything else unparseable) is not a live token.
        let record: TokenRecord = match serde_json::from_slice(&current) {
            Ok(record) => record,
            Err(_) => return Err(denied()),
        };
        if record.role != role {
            tracing::warn!(%role, expected = %record.role, "Join attempted with a token for another role");
            return Err(denied());
        }

        match self
            .backend
            .compare_and_swap(
                &[TOKENS_BUCKET],
                secret,
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

        // Best-effort cleanup; the tombstone TTL reaps it regardless.
        if let Err(e) = self.backend.delete(&[TOKENS_BUCKET], secret).await {
            if !e.is_not_found() {
                tracing::debug!(error = %e, "Failed to delete consumed token");
            }
        }
        Ok(())
    }
}

fn denied() -> AuthError {
    AuthError::AccessDenied("invalid or expired token".into())
}

/// 32 hex characters from the OS CSPRNG.
pub fn random_secret() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
