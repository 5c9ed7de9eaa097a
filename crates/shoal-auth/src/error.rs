//! Trust-plane error type. Kinds are preserved across component
//! boundaries; the API edge additionally collapses absence into denial
//! for probing-sensitive calls.

use shoal_backend::BackendError;
use shoal_common::ErrorCode;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("bad parameter: {0}")]
    BadParameter(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("no matching authority")]
    UnknownAuthority,

    #[error("backend: {0}")]
    Backend(#[from] BackendError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Internal(String),
}

impl AuthError {
    /// Wrap an ssh-key failure; the library error alone rarely names
    /// which object was being handled.
    pub fn ssh(context: &str, e: ssh_key::Error) -> Self {
        AuthError::Internal(format!("{context}: {e}"))
    }

    /// Uniform credential failure: callers must not be able to tell
    /// which factor (or which lookup) failed.
    pub fn invalid_credentials() -> Self {
        AuthError::AccessDenied("invalid credentials".into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, AuthError::NotFound(_))
            || matches!(self, AuthError::Backend(e) if e.is_not_found())
    }
}

impl From<&AuthError> for ErrorCode {
    fn from(e: &AuthError) -> Self {
        match e {
            AuthError::BadParameter(_) => ErrorCode::BadParameter,
            AuthError::NotFound(_) => ErrorCode::NotFound,
            AuthError::AlreadyExists(_) => ErrorCode::AlreadyExists,
            AuthError::AccessDenied(_) => ErrorCode::AccessDenied,
            AuthError::UnknownAuthority => ErrorCode::UnknownAuthority,
            AuthError::Backend(e) => ErrorCode::from(e),
            AuthError::Io(_) | AuthError::Internal(_) => ErrorCode::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_kinds_pass_through() {
        let e = AuthError::Backend(BackendError::NotFound("x".into()));
        assert_eq!(ErrorCode::from(&e), ErrorCode::NotFound);
        assert!(e.is_not_found());
    }

    #[test]
    fn invalid_credentials_is_access_denied() {
        let e = AuthError::invalid_credentials();
        assert_eq!(ErrorCode::from(&e), ErrorCode::AccessDenied);
        assert_eq!(e.to_string(), "access denied: invalid credentials");
    }
}
