//! The node role: a host SSH listener that presents the host
//! certificate and admits users by their user-CA-signed certificates,
//! plus the presence heartbeat and command-label machinery. The
//! interactive shell and PTY plumbing live behind the [`Executor`]
//! seam.

pub mod exec;
pub mod heartbeat;
pub mod ssh;

pub use exec::{Executor, ShellExecutor};
pub use heartbeat::{run_command_labels, run_heartbeat, CommandLabel};
pub use ssh::NodeSsh;

use shoal_auth::AuthError;

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("auth: {0}")]
    Auth(#[from] AuthError),

    #[error("ssh transport: {0}")]
    Ssh(#[from] russh::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Internal(String),
}
