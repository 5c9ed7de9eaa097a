//! The reverse-tunnel plane: firewalled nodes dial out to a proxy and
//! keep a long-lived SSH connection open; the proxy multiplexes later
//! inbound user sessions back over it. The hub and agent modules are
//! the only russh importers; routing and backoff are plain code.

pub mod agent;
pub mod backoff;
pub mod hub;
pub mod recorder;
pub mod router;

pub use agent::{run_agent, AgentConfig};
pub use hub::TunnelHub;
pub use router::{resolve_route, ChannelOpener, Route, RoutingTable, TunnelStream};

use shoal_auth::AuthError;

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("ssh transport: {0}")]
    Ssh(#[from] russh::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("auth: {0}")]
    Auth(#[from] AuthError),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("host unreachable")]
    HostUnreachable,

    #[error("{0}")]
    Internal(String),
}
