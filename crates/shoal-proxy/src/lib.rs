//! The proxy role: the only place users authenticate interactively.
//! Terminates the HTTPS login endpoint and the user-facing SSH
//! listener, and routes sessions to nodes directly or over the
//! reverse-tunnel hub.

pub mod ssh;
pub mod tlscert;
pub mod web;

use shoal_auth::AuthError;
use shoal_tunnel::TunnelError;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("auth: {0}")]
    Auth(#[from] AuthError),

    #[error("tunnel: {0}")]
    Tunnel(#[from] TunnelError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tls: {0}")]
    Tls(String),

    #[error("{0}")]
    Internal(String),
}
