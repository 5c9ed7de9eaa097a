//! Key/value backend abstraction the rest of the cluster programs
//! against: buckets of keys with optional TTL, compare-and-swap, and
//! advisory locks. Two bindings ship in-tree — an in-memory store for
//! tests and embedded use, and a directory-backed store for a single
//! process. Replicated engines are external collaborators bound through
//! the same trait.

use std::time::Duration;

use async_trait::async_trait;

pub mod conformance;
pub mod dir;
pub mod memory;

pub use dir::DirBackend;
pub use memory::MemoryBackend;

use shoal_common::ErrorCode;

/// Bucket reserved for advisory locks.
const LOCKS_BUCKET: &str = "locks";

/// Poll interval while waiting on a held lock.
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("bad parameter: {0}")]
    BadParameter(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("compare failed: {0}")]
    CompareFailed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Internal(String),
}

impl BackendError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound(_))
    }

    pub fn is_compare_failed(&self) -> bool {
        matches!(self, BackendError::CompareFailed(_))
    }
}

impl From<&BackendError> for ErrorCode {
    fn from(e: &BackendError) -> Self {
        match e {
            BackendError::BadParameter(_) => ErrorCode::BadParameter,
            BackendError::NotFound(_) => ErrorCode::NotFound,
            BackendError::AlreadyExists(_) => ErrorCode::AlreadyExists,
            BackendError::CompareFailed(_) => ErrorCode::CompareFailed,
            BackendError::Io(_) | BackendError::Internal(_) => ErrorCode::Internal,
        }
    }
}

/// The capability set every backend must provide. Values are opaque
/// bytes; a `ttl` of `None` means forever. Expired entries behave as
/// absent to every reader; implementations may reap them lazily.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn put(
        &self,
        bucket: &[&str],
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<(), BackendError>;

    async fn get(&self, bucket: &[&str], key: &str) -> Result<Vec<u8>, BackendError>;

    /// Keys currently live in the bucket, sorted. A missing bucket is an
    /// empty bucket.
    async fn list(&self, bucket: &[&str]) -> Result<Vec<String>, BackendError>;

    async fn delete(&self, bucket: &[&str], key: &str) -> Result<(), BackendError>;

    async fn delete_bucket(&self, bucket: &[&str]) -> Result<(), BackendError>;

    /// Atomically replace the value of `key` if it currently equals
    /// `expected`. `expected = None` requires the key to be absent
    /// (insert-if-absent). A mismatch fails with
    /// [`BackendError::CompareFailed`]; nothing is written.
    async fn compare_and_swap(
        &self,
        bucket: &[&str],
        key: &str,
        expected: Option<&[u8]>,
        new: &[u8],
        ttl: Option<Duration>,
    ) -> Result<(), BackendError>;

    /// Acquire the named advisory lock, waiting for the current holder
    /// to release or for its TTL to lapse. The wait is bounded at twice
    /// the requested TTL; hitting the bound surfaces the terminal error
    /// instead of retrying forever.
    async fn acquire_lock(&self, name: &str, ttl: Duration) -> Result<(), BackendError> {
        let deadline = tokio::time::Instant::now() + ttl * 2;
        loop {
            match self
                .compare_and_swap(&[LOCKS_BUCKET], name, None, b"held", Some(ttl))
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) if e.is_compare_failed() => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(BackendError::CompareFailed(format!(
                            "lock {name:?} is held and did not free within {:?}",
                            ttl * 2
                        )));
                    }
                    tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Release the named advisory lock. Releasing a lock that is not
    /// held is a no-op: the holder may have crashed and the TTL may have
    /// already reaped it.
    async fn release_lock(&self, name: &str) -> Result<(), BackendError> {
        match self.delete(&[LOCKS_BUCKET], name).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Validate one bucket or key component. Components become file names in
/// the directory backend, so path metacharacters are rejected outright.
pub(crate) fn validate_component(component: &str) -> Result<(), BackendError> {
    if component.is_empty() {
        return Err(BackendError::BadParameter(
            "empty bucket or key component".into(),
        ));
    }
    if component == "." || component == ".." {
        return Err(BackendError::BadParameter(format!(
            "reserved component: {component:?}"
        )));
    }
    if component
        .chars()
        .any(|c| c == '/' || c == '\\' || c.is_control())
    {
        return Err(BackendError::BadParameter(format!(
            "component contains path characters: {component:?}"
        )));
    }
    Ok(())
}

pub(crate) fn validate_path(bucket: &[&str], key: Option<&str>) -> Result<(), BackendError> {
    if bucket.is_empty() {
        return Err(BackendError::BadParameter("empty bucket path".into()));
    }
    for component in bucket {
        validate_component(component)?;
    }
    if let Some(key) = key {
        validate_component(key)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_characters_are_rejected() {
        assert!(validate_component("../etc").is_err());
        assert!(validate_component("a/b").is_err());
        assert!(validate_component("a\\b").is_err());
        assert!(validate_component("").is_err());
        assert!(validate_component("..").is_err());
    }

    #[test]
    fn ordinary_components_pass() {
        for ok in ["tokens", "example.com@host", "alice", "host-01.example.com"] {
            assert!(validate_component(ok).is_ok(), "{ok} should be accepted");
        }
    }

    #[test]
    fn backend_errors_map_to_wire_codes() {
        let e = BackendError::CompareFailed("x".into());
        assert_eq!(ErrorCode::from(&e), ErrorCode::CompareFailed);
        let e = BackendError::NotFound("x".into());
        assert_eq!(ErrorCode::from(&e), ErrorCode::NotFound);
    }
}
