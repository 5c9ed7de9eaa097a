//! In-memory backend for tests and embedded single-process use.
//!
//! A mutex-guarded map of buckets; expiry is checked on every read and
//! expired entries are reaped in place. Compare-and-swap holds the map
//! lock across read-check-write, which makes it atomic within the
//! process — the only scope an in-memory store can serve.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::{validate_path, Backend, BackendError};

struct Entry {
    value: Vec<u8>,
    expires: Option<Instant>,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        self.expires.is_some_and(|at| at <= now)
    }
}

#[derive(Default)]
pub struct MemoryBackend {
    buckets: Mutex<HashMap<String, HashMap<String, Entry>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn bucket_id(bucket: &[&str]) -> String {
        bucket.join("/")
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn put(
        &self,
        bucket: &[&str],
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<(), BackendError> {
        validate_path(bucket, Some(key))?;
        let mut buckets = self.buckets.lock().unwrap();
        let entries = buckets.entry(Self::bucket_id(bucket)).or_default();
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                expires: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn get(&self, bucket: &[&str], key: &str) -> Result<Vec<u8>, BackendError> {
        validate_path(bucket, Some(key))?;
        let mut buckets = self.buckets.lock().unwrap();
        let id = Self::bucket_id(bucket);
        let now = Instant::now();
        let entries = buckets
            .get_mut(&id)
            .ok_or_else(|| BackendError::NotFound(format!("{id}/{key}")))?;
        match entries.get(key) {
            Some(entry) if !entry.expired(now) => Ok(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                Err(BackendError::NotFound(format!("{id}/{key}")))
            }
            None => Err(BackendError::NotFound(format!("{id}/{key}"))),
        }
    }

    async fn list(&self, bucket: &[&str]) -> Result<Vec<String>, BackendError> {
        validate_path(bucket, None)?;
        let mut buckets = self.buckets.lock().unwrap();
        let now = Instant::now();
        let Some(entries) = buckets.get_mut(&Self::bucket_id(bucket)) else {
            return Ok(Vec::new());
        };
        entries.retain(|_, entry| !entry.expired(now));
        let mut keys: Vec<String> = entries.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, bucket: &[&str], key: &str) -> Result<(), BackendError> {
        validate_path(bucket, Some(key))?;
        let mut buckets = self.buckets.lock().unwrap();
        let id = Self::bucket_id(bucket);
        let removed = buckets
            .get_mut(&id)
            .and_then(|entries| entries.remove(key))
            .is_some_and(|entry| !entry.expired(Instant::now()));
        if removed {
            Ok(())
        } else {
            Err(BackendError::NotFound(format!("{id}/{key}")))
        }
    }

    async fn delete_bucket(&self, bucket: &[&str]) -> Result<(), BackendError> {
        validate_path(bucket, None)?;
        self.buckets.lock().unwrap().remove(&Self::bucket_id(bucket));
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        bucket: &[&str],
        key: &str,
        expected: Option<&[u8]>,
        new: &[u8],
        ttl: Option<Duration>,
    ) -> Result<(), BackendError> {
        validate_path(bucket, Some(key))?;
        let mut buckets = self.buckets.lock().unwrap();
        let id = Self::bucket_id(bucket);
        let now = Instant::now();
        let entries = buckets.entry(id.clone()).or_default();

        let current = entries.get(key).filter(|entry| !entry.expired(now));
        let matches = match (current, expected) {
            (None, None) => true,
            (Some(entry), Some(expected)) => entry.value == expected,
            _ => false,
        };
        if !matches {
            return Err(BackendError::CompareFailed(format!("{id}/{key}")));
        }

        entries.insert(
            key.to_string(),
            Entry {
                value: new.to_vec(),
                expires: ttl.map(|t| now + t),
            },
        );
        Ok(())
    }
}
