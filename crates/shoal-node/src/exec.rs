//! The seam between the trust plane and the shell. Interactive PTY
//! sessions are an external collaborator; what ships here is plain
//! command execution for `ssh host <command>` style requests.

use async_trait::async_trait;

#[async_trait]
pub trait Executor: Send + Sync {
    /// Run `command` on behalf of the authenticated `login` and return
    /// combined output plus exit code.
    async fn exec(&self, login: &str, command: &str) -> std::io::Result<(Vec<u8>, u32)>;
}

/// Runs commands through the configured shell, as the daemon's own
/// user. Per-login user switching belongs to the shell collaborator.
pub struct ShellExecutor {
    pub shell: String,
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self {
            shell: "/bin/sh".to_string(),
        }
    }
}

#[async_trait]
impl Executor for ShellExecutor {
    async fn exec(&self, login: &str, command: &str) -> std::io::Result<(Vec<u8>, u32)> {
        tracing::info!(%login, %command, "Executing command");
        let output = tokio::process::Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .output()
            .await?;

        let mut combined = output.stdout;
        combined.extend_from_slice(&output.stderr);
        let code = output.status.code().unwrap_or(1) as u32;
        Ok((combined, code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shell_executor_runs_and_reports_exit_code() {
        let executor = ShellExecutor::default();
        let (output, code) = executor.exec("alice", "echo hello").await.unwrap();
        assert_eq!(String::from_utf8_lossy(&output).trim(), "hello");
        assert_eq!(code, 0);

        let (_, code) = executor.exec("alice", "exit 3").await.unwrap();
        assert_eq!(code, 3);
    }
}
