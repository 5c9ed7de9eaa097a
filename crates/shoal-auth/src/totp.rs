//! TOTP second factor: RFC 6238, SHA-1, 6 digits, 30-second steps —
//! the profile authenticator apps implement. Verification compares in
//! constant time and allows ±1 step of clock skew. A per-login rate
//! limiter locks out after repeated failures.

use std::time::{Duration, Instant};

use rand::rngs::OsRng;
use rand::RngCore;
use subtle::ConstantTimeEq;
use totp_rs::{Algorithm, TOTP};
use zeroize::Zeroize;

use crate::error::AuthError;

/// TOTP secret length in bytes (256 bits).
const SECRET_LEN: usize = 32;

const DIGITS: usize = 6;
const STEP_SECS: u64 = 30;

/// Maximum failed verification attempts before lockout.
const MAX_FAILURES: u32 = 3;

/// Duration of lockout after max failures.
const LOCKOUT_DURATION: Duration = Duration::from_secs(300);

/// TOTP secret material with zeroize-on-drop.
pub struct TotpSecret {
    secret: Vec<u8>,
}

impl TotpSecret {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { secret: bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.secret
    }
}

impl Drop for TotpSecret {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

/// Generate a fresh TOTP secret from the OS CSPRNG.
pub fn generate_secret() -> TotpSecret {
    let mut secret = vec![0u8; SECRET_LEN];
    OsRng.fill_bytes(&mut secret);
    TotpSecret { secret }
}

fn build_totp(secret: &TotpSecret) -> Result<TOTP, AuthError> {
    TOTP::new(
        Algorithm::SHA1,
        DIGITS,
        1,
        STEP_SECS,
        secret.secret.clone(),
    )
    .map_err(|e| AuthError::Internal(format!("totp construction: {e}")))
}

/// The code for the current time step; surfaced once at signup so the
/// operator can confirm their authenticator is in sync.
pub fn current_code(secret: &TotpSecret) -> Result<String, AuthError> {
    let totp = build_totp(secret)?;
    Ok(totp.generate(unix_now()))
}

/// Verify a 6-digit code against the secret using constant-time
/// comparison, accepting the previous and next time step for skew.
pub fn verify_code(secret: &TotpSecret, code: &str) -> bool {
    let Ok(totp) = build_totp(secret) else {
        return false;
    };

    let now = unix_now();
    for offset in [0i64, -1, 1] {
        let time = (now as i64 + offset * STEP_SECS as i64) as u64;
        let expected = totp.generate(time);
        let code_bytes = code.as_bytes();
        let expected_bytes = expected.as_bytes();
        if code_bytes.len() == expected_bytes.len() && code_bytes.ct_eq(expected_bytes).into() {
            return true;
        }
    }
    false
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Rate limiter for second-factor attempts. After `MAX_FAILURES`
/// consecutive failures, locks out for `LOCKOUT_DURATION`; resets on
/// success.
pub struct RateLimiter {
    failures: u32,
    locked_until: Option<Instant>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            failures: 0,
            locked_until: None,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked_until
            .map(|until| Instant::now() < until)
            .unwrap_or(false)
    }

    /// Record a verification attempt. `Err` means the attempt must be
    /// rejected regardless of the code's validity.
    pub fn check_and_record(&mut self, valid: bool) -> Result<(), ()> {
        if self.is_locked() {
            return Err(());
        }
        if self.locked_until.is_some() {
            self.locked_until = None;
            self.failures = 0;
        }

        if valid {
            self.failures = 0;
            Ok(())
        } else {
            self.failures += 1;
            if self.failures >= MAX_FAILURES {
                self.locked_until = Some(Instant::now() + LOCKOUT_DURATION);
            }
            Err(())
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
