//! The in-memory routing table: which principals are reachable over a
//! live reverse tunnel right now, and the resolution order a session
//! request walks to find its node.
//!
//! Registration and deregistration are serialized by the table mutex;
//! lookups are read-only. The table stores channel openers, not russh
//! types, so everything here is testable without a transport.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use shoal_auth::AuthClient;

use crate::TunnelError;

pub type TunnelStream = Box<dyn DuplexStream>;

pub trait DuplexStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> DuplexStream for T {}

/// Opens a fresh byte stream to the peer behind a tunnel.
#[async_trait]
pub trait ChannelOpener: Send + Sync {
    async fn open(&self, target: &str, port: u32) -> Result<TunnelStream, TunnelError>;
}

struct Registration {
    opener: std::sync::Arc<dyn ChannelOpener>,
    reg_id: u64,
}

#[derive(Default)]
pub struct RoutingTable {
    peers: Mutex<HashMap<String, Registration>>,
    next_reg_id: AtomicU64,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tunnel for `principal`, displacing any earlier one
    /// (a reconnecting node supersedes its dead tunnel). Returns the
    /// registration id to pass back at deregistration.
    pub fn register(
        &self,
        principal: &str,
        opener: std::sync::Arc<dyn ChannelOpener>,
    ) -> u64 {
        let reg_id = self.next_reg_id.fetch_add(1, Ordering::Relaxed);
        let mut peers = self.peers.lock().unwrap();
        peers.insert(
            principal.to_string(),
            Registration { opener, reg_id },
        );
        tracing::info!(%principal, "Tunnel registered");
        reg_id
    }

    /// Remove the registration, but only if it is still ours: a newer
    /// tunnel for the same principal must not be torn down by the old
    /// connection's cleanup.
    pub fn deregister(&self, principal: &str, reg_id: u64) {
        let mut peers = self.peers.lock().unwrap();
        if peers.get(principal).is_some_and(|r| r.reg_id == reg_id) {
            peers.remove(principal);
            tracing::info!(%principal, "Tunnel deregistered");
        }
    }

    pub fn lookup(&self, principal: &str) -> Option<std::sync::Arc<dyn ChannelOpener>> {
        self.peers
            .lock()
            .unwrap()
            .get(principal)
            .map(|r| r.opener.clone())
    }

    pub fn principals(&self) -> Vec<String> {
        let mut principals: Vec<String> =
            self.peers.lock().unwrap().keys().cloned().collect();
        principals.sort();
        principals
    }

    pub fn len(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Where a session should go.
pub enum Route {
    /// Open a channel over a live reverse tunnel.
    Tunnel(std::sync::Arc<dyn ChannelOpener>),
    /// Dial this address directly.
    Direct(String),
}

/// Resolve `host` in order: exact principal over a tunnel, then label
/// or identity match through the auth presence records, then plain
/// DNS. A `key=value` host string selects by label.
pub async fn resolve_route(
    table: &RoutingTable,
    auth: &AuthClient,
    host: &str,
    port: u16,
) -> Result<Route, TunnelError> {
    if let Some(opener) = table.lookup(host) {
        return Ok(Route::Tunnel(opener));
    }

    let label = host.split_once('=');
    match auth.list_presence().await {
        Ok(nodes) => {
            for node in nodes {
                let matched = match label {
                    Some((key, value)) => {
                        node.labels.get(key).map(String::as_str) == Some(value)
                    }
                    None => node.principal == host || node.host_uuid == host,
                };
                if !matched {
                    continue;
                }
                if let Some(opener) = table.lookup(&node.principal) {
                    return Ok(Route::Tunnel(opener));
                }
                return Ok(Route::Direct(node.addr));
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "Presence lookup failed; falling back to DNS");
        }
    }

    if label.is_some() {
        // A label selector that matched nothing has nowhere to fall.
        return Err(TunnelError::HostUnreachable);
    }
    Ok(Route::Direct(format!("{host}:{port}")))
}
