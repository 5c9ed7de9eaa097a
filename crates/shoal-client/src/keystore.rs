//! The short-lived key store: `shoal_<name>.tkey` files holding a
//! private key, its user certificate, and an absolute deadline. Any
//! read that meets an expired file unlinks it — expired credentials
//! are never served, not even once.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ssh_key::certificate::Certificate;
use ssh_key::PrivateKey;

use shoal_auth::keys;
use shoal_common::{defaults, persist};

use crate::ClientError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocalKey {
    #[serde(rename = "priv")]
    pub priv_bytes: Vec<u8>,
    pub cert: Vec<u8>,
    pub deadline: DateTime<Utc>,
}

/// A parsed key/certificate pair ready for an in-memory agent keyring.
pub struct AgentIdentity {
    pub private_key: PrivateKey,
    pub certificate: Certificate,
}

pub struct KeyStore {
    dir: PathBuf,
}

impl KeyStore {
    pub fn open(client_dir: &Path) -> Result<Self, ClientError> {
        std::fs::create_dir_all(client_dir)?;
        Ok(Self {
            dir: client_dir.to_path_buf(),
        })
    }

    fn key_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!(
            "{}{name}{}",
            defaults::KEY_FILE_PREFIX,
            defaults::KEY_FILE_SUFFIX
        ))
    }

    pub fn save(&self, name: &str, key: &LocalKey) -> Result<(), ClientError> {
        let json = serde_json::to_vec(key)
            .map_err(|e| ClientError::Internal(format!("key encoding: {e}")))?;
        persist::write_secret(&self.key_path(name), &json)?;
        Ok(())
    }

    /// Every live key in the store, in file-name order. Expired files
    /// are unlinked as they are found.
    pub fn load_all(&self) -> Result<Vec<LocalKey>, ClientError> {
        let mut names: Vec<String> = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.starts_with(defaults::KEY_FILE_PREFIX)
                && name.ends_with(defaults::KEY_FILE_SUFFIX)
            {
                names.push(name);
            }
        }
        names.sort();

        let now = Utc::now();
        let mut keys = Vec::new();
        for name in names {
            let path = self.dir.join(&name);
            let key: LocalKey = match persist::read_json(&path) {
                Ok(key) => key,
                Err(e) => {
                    tracing::warn!(file = %path.display(), error = %e, "Skipping unreadable key file");
                    continue;
                }
            };
            if key.deadline <= now {
                if let Err(e) = std::fs::remove_file(&path) {
                    tracing::warn!(file = %path.display(), error = %e, "Failed to prune expired key");
                }
                continue;
            }
            keys.push(key);
        }
        Ok(keys)
    }
}

/// Load every live local key, parsed into agent identities in order.
pub fn local_agent_identities(client_dir: &Path) -> Result<Vec<AgentIdentity>, ClientError> {
    let store = KeyStore::open(client_dir)?;
    let mut identities = Vec::new();
    for key in store.load_all()? {
        let private_key = keys::parse_private(&key.priv_bytes)?;
        let certificate = keys::parse_certificate(&key.cert)?;
        identities.push(AgentIdentity {
            private_key,
            certificate,
        });
    }
    Ok(identities)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_auth::ca::{self, CaKind, CertAuthority};
    use ssh_key::PublicKey;
    use std::time::Duration;

    fn make_key(ca: &CertAuthority, ttl_secs: i64) -> LocalKey {
        let private = keys::generate().unwrap();
        let cert = ca::sign_user_cert(
            &ca.signer().unwrap(),
            &PublicKey::from(&private),
            "alice",
            Duration::from_secs(3600),
        )
        .unwrap();
        LocalKey {
            priv_bytes: keys::encode_private(&private).unwrap(),
            cert: keys::encode_certificate(&cert).unwrap(),
            deadline: Utc::now() + chrono::Duration::seconds(ttl_secs),
        }
    }

    #[test]
    fn save_and_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::open(dir.path()).unwrap();
        let ca = CertAuthority::generate("example.com", CaKind::User).unwrap();

        let key = make_key(&ca, 3600);
        store.save("alice", &key).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded, vec![key]);
    }

    #[test]
    fn expired_key_is_pruned_on_read_and_never_served() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::open(dir.path()).unwrap();
        let ca = CertAuthority::generate("example.com", CaKind::User).unwrap();

        store.save("live", &make_key(&ca, 3600)).unwrap();
        store.save("dead", &make_key(&ca, -60)).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(
            !dir.path().join("shoal_dead.tkey").exists(),
            "expired key file must be unlinked"
        );

        let identities = local_agent_identities(dir.path()).unwrap();
        assert_eq!(identities.len(), 1);
    }

    #[test]
    fn unrelated_files_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::open(dir.path()).unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"not a key").unwrap();
        std::fs::write(dir.path().join("shoal_broken.tkey"), b"not json").unwrap();

        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn key_file_format_matches_the_wire_names() {
        let ca = CertAuthority::generate("example.com", CaKind::User).unwrap();
        let json = serde_json::to_value(make_key(&ca, 60)).unwrap();
        assert!(json.get("priv").is_some());
        assert!(json.get("cert").is_some());
        assert!(json.get("deadline").is_some());
    }
}
