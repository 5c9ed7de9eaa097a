//! Operator YAML configuration. Every field has a sane default so a
//! bare `shoal start --roles=auth,proxy,node --domain=example.com`
//! boots a single-host cluster.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use shoal_common::defaults;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Roles this daemon runs: any of auth, proxy, node.
    #[serde(default)]
    pub roles: Vec<String>,

    /// Cluster domain, the principal namespace of every host cert.
    #[serde(default)]
    pub domain: Option<String>,

    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Auth API addresses, `host:port`. Joining roles use the first.
    #[serde(default)]
    pub auth_servers: Vec<String>,

    /// Proxy tunnel addresses nodes keep reverse tunnels to.
    #[serde(default)]
    pub proxy_servers: Vec<String>,

    /// Provisioning token for joining roles.
    #[serde(default)]
    pub token: Option<String>,

    #[serde(default)]
    pub backend: BackendConfig,

    /// `role:secret` tokens installed on the auth server's first start.
    #[serde(default)]
    pub static_tokens: Vec<String>,

    #[serde(default)]
    pub listen: ListenConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    /// Static labels advertised by the node role.
    #[serde(default)]
    pub labels: HashMap<String, String>,

    /// Command labels: `key: "[<duration>:<shell tokens>]"`.
    #[serde(default)]
    pub command_labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// `dir` (embedded file-backed), `memory`, or `etcd` (external
    /// collaborator, rejected by this build with a clear error).
    #[serde(rename = "type")]
    pub kind: String,

    /// Store path for the `dir` backend; defaults under the data dir.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Peer URLs for a replicated backend.
    #[serde(default)]
    pub nodes: Vec<String>,

    /// Key prefix for a replicated backend.
    #[serde(default)]
    pub key: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: "dir".to_string(),
            path: None,
            nodes: Vec::new(),
            key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    pub node_ssh: SocketAddr,
    pub proxy_ssh: SocketAddr,
    pub tunnel: SocketAddr,
    pub auth_api: SocketAddr,
    pub web: SocketAddr,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            node_ssh: ([0, 0, 0, 0], defaults::NODE_SSH_PORT).into(),
            proxy_ssh: ([0, 0, 0, 0], defaults::PROXY_SSH_PORT).into(),
            tunnel: ([0, 0, 0, 0], defaults::PROXY_TUNNEL_PORT).into(),
            auth_api: ([0, 0, 0, 0], defaults::AUTH_API_PORT).into(),
            web: ([0, 0, 0, 0], defaults::PROXY_WEB_PORT).into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub max_connections: usize,
    pub max_users: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: defaults::LIMITER_MAX_CONNECTIONS,
            max_users: defaults::LIMITER_MAX_CONCURRENT_USERS,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Missing config file means defaults: the CLI flags carry the rest.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(defaults::DATA_DIR))
    }
}

/// Parse a human duration like `90s`, `10m`, `1h30m`, `2d`.
pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        bail!("empty duration");
    }
    let mut total = Duration::ZERO;
    let mut digits = String::new();
    for c in s.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let value: u64 = digits
            .parse()
            .with_context(|| format!("duration {s:?}: unit {c:?} has no number"))?;
        digits.clear();
        let unit = match c {
            's' => Duration::from_secs(1),
            'm' => Duration::from_secs(60),
            'h' => Duration::from_secs(3600),
            'd' => Duration::from_secs(86400),
            other => bail!("duration {s:?}: unrecognized unit {other:?}"),
        };
        total += unit * value as u32;
    }
    if !digits.is_empty() {
        bail!("duration {s:?}: trailing number without a unit");
    }
    Ok(total)
}

/// Parse a command label value of the form `[<duration>:<shell tokens>]`.
pub fn parse_command_label(key: &str, value: &str) -> anyhow::Result<shoal_node::CommandLabel> {
    let inner = value
        .strip_prefix('[')
        .and_then(|v| v.strip_suffix(']'))
        .with_context(|| format!("command label {key}: expected [duration:command]"))?;
    let (duration, command) = inner
        .split_once(':')
        .with_context(|| format!("command label {key}: missing ':' separator"))?;
    let period = parse_duration(duration)?;
    let command: Vec<String> = command.split_whitespace().map(str::to_string).collect();
    if command.is_empty() {
        bail!("command label {key}: empty command");
    }
    Ok(shoal_node::CommandLabel {
        key: key.to_string(),
        period,
        command,
    })
}

/// The persisted host UUID: generated on first start, stable after.
pub fn ensure_host_uuid(data_dir: &Path, explicit: Option<&str>) -> anyhow::Result<String> {
    if let Some(uuid) = explicit {
        return Ok(uuid.to_string());
    }
    let path = data_dir.join("host_uuid");
    if path.exists() {
        let uuid = std::fs::read_to_string(&path)?.trim().to_string();
        if !uuid.is_empty() {
            return Ok(uuid);
        }
    }
    let uuid = uuid::Uuid::new_v4().to_string();
    std::fs::create_dir_all(data_dir)?;
    std::fs::write(&path, format!("{uuid}\n"))?;
    Ok(uuid)
}
