//! Named cluster-wide advisory locks, riding the backend's lock
//! capability. Used to serialize first-start initialization across
//! concurrently booting auth replicas.

use std::sync::Arc;
use std::time::Duration;

use shoal_backend::Backend;

use crate::error::AuthError;

#[derive(Clone)]
pub struct LockService {
    backend: Arc<dyn Backend>,
}

impl LockService {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    pub async fn acquire(&self, name: &str, ttl: Duration) -> Result<(), AuthError> {
        self.backend.acquire_lock(name, ttl).await?;
        Ok(())
    }

    pub async fn release(&self, name: &str) -> Result<(), AuthError> {
        self.backend.release_lock(name).await?;
        Ok(())
    }
}
