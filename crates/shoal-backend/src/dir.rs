//! Directory-backed embedded store: one directory per bucket, one JSON
//! envelope file per key, written via temp-file + rename so readers
//! never observe a partial record. Expiry is stamped into the envelope
//! and expired files are unlinked by whichever reader finds them.
//!
//! The store is single-process: compare-and-swap is serialized by an
//! internal mutex, which is exactly the atomicity an embedded file
//! store can honestly offer.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use shoal_common::persist;

use crate::{validate_path, Backend, BackendError};

#[derive(Serialize, Deserialize)]
struct Envelope {
    value: Vec<u8>,
    expires: Option<DateTime<Utc>>,
}

impl Envelope {
    fn expired(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|at| at <= now)
    }
}

pub struct DirBackend {
    root: PathBuf,
    cas: Mutex<()>,
}

impl DirBackend {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, BackendError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            cas: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bucket_dir(&self, bucket: &[&str]) -> PathBuf {
        let mut dir = self.root.clone();
        for component in bucket {
            dir.push(component);
        }
        dir
    }

    fn key_path(&self, bucket: &[&str], key: &str) -> PathBuf {
        self.bucket_dir(bucket).join(key)
    }

    /// Read the live envelope at `path`, unlinking it if expired.
    fn read_live(&self, path: &Path) -> Result<Option<Envelope>, BackendError> {
        let Some(envelope) = persist::read_json_if_exists::<Envelope>(path)? else {
            return Ok(None);
        };
        if envelope.expired(Utc::now()) {
            if let Err(e) = std::fs::remove_file(path) {
                tracing::debug!(path = %path.display(), error = %e, "Failed to reap expired entry");
            }
            return Ok(None);
        }
        Ok(Some(envelope))
    }

    fn write_envelope(
        &self,
        path: &Path,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<(), BackendError> {
        let envelope = Envelope {
            value: value.to_vec(),
            expires: ttl.map(|t| {
                // TTLs beyond chrono's range collapse to a century out.
                let ttl = chrono::Duration::from_std(t)
                    .unwrap_or_else(|_| chrono::Duration::days(36525));
                Utc::now() + ttl
            }),
        };
        let json = serde_json::to_vec(&envelope)
            .map_err(|e| BackendError::Internal(format!("envelope encoding: {e}")))?;
        persist::write_secret(path, &json)?;
        Ok(())
    }
}

#[async_trait]
impl Backend for DirBackend {
    async fn put(
        &self,
        bucket: &[&str],
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<(), BackendError> {
        validate_path(bucket, Some(key))?;
        self.write_envelope(&self.key_path(bucket, key), value, ttl)
    }

    async fn get(&self, bucket: &[&str], key: &str) -> Result<Vec<u8>, BackendError> {
        validate_path(bucket, Some(key))?;
        let path = self.key_path(bucket, key);
        match self.read_live(&path)? {
            Some(envelope) => Ok(envelope.value),
            None => Err(BackendError::NotFound(format!(
                "{}/{key}",
                bucket.join("/")
            ))),
        }
    }

    async fn list(&self, bucket: &[&str]) -> Result<Vec<String>, BackendError> {
        validate_path(bucket, None)?;
        let dir = self.bucket_dir(bucket);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut keys = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.ends_with(".tmp") {
                continue;
            }
            if self.read_live(&entry.path())?.is_some() {
                keys.push(name);
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, bucket: &[&str], key: &str) -> Result<(), BackendError> {
        validate_path(bucket, Some(key))?;
        let path = self.key_path(bucket, key);
        // An expired file is already absent from the reader's view.
        let live = self.read_live(&path)?.is_some();
        if !live {
            return Err(BackendError::NotFound(format!(
                "{}/{key}",
                bucket.join("/")
            )));
        }
        std::fs::remove_file(&path)?;
        Ok(())
    }

    async fn delete_bucket(&self, bucket: &[&str]) -> Result<(), BackendError> {
        validate_path(bucket, None)?;
        let dir = self.bucket_dir(bucket);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
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
        let _guard = self.cas.lock().await;

        let path = self.key_path(bucket, key);
        let current = self.read_live(&path)?;
        let matches = match (&current, expected) {
            (None, None) => true,
            (Some(envelope), Some(expected)) => envelope.value == expected,
            _ => false,
        };
        if !matches {
            return Err(BackendError::CompareFailed(format!(
                "{}/{key}",
                bucket.join("/")
            )));
        }
        self.write_envelope(&path, new, ttl)
    }
}
