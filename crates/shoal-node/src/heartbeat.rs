//! Presence heartbeats and command labels. Nodes publish a presence
//! record every half-TTL with a little jitter so a fleet does not beat
//! in lockstep; the record's TTL retires it on its own if the node
//! dies. Command labels re-run their command on a period and feed the
//! next beat.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use shoal_auth::{AuthClient, Presence};
use shoal_common::defaults;

/// A label whose value is the output of a command, refreshed on a
/// period (`[1h30m:uname -r]` style in the config).
#[derive(Debug, Clone, PartialEq)]
pub struct CommandLabel {
    pub key: String,
    pub period: Duration,
    pub command: Vec<String>,
}

pub type SharedLabels = Arc<Mutex<HashMap<String, String>>>;

/// Publish presence until cancelled. Failures log and the loop keeps
/// beating — presence is best-effort by design.
pub async fn run_heartbeat(
    auth: AuthClient,
    mut presence: Presence,
    dynamic_labels: SharedLabels,
    cancel: CancellationToken,
) {
    let period = defaults::SERVER_HEARTBEAT_TTL / 2;
    loop {
        {
            let dynamic = dynamic_labels.lock().unwrap();
            for (key, value) in dynamic.iter() {
                presence.labels.insert(key.clone(), value.clone());
            }
        }
        if let Err(e) = auth.upsert_presence(&presence).await {
            tracing::warn!(error = %e, "Presence heartbeat failed");
        }

        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..500));
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(period + jitter) => {}
        }
    }
}

/// Keep one command label fresh until cancelled.
pub async fn run_command_labels(
    labels: Vec<CommandLabel>,
    shared: SharedLabels,
    cancel: CancellationToken,
) {
    for label in labels {
        let shared = shared.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                match run_label_command(&label.command).await {
                    Ok(value) => {
                        shared.lock().unwrap().insert(label.key.clone(), value);
                    }
                    Err(e) => {
                        tracing::warn!(key = %label.key, error = %e, "Command label failed");
                    }
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(label.period) => {}
                }
            }
        });
    }
}

async fn run_label_command(command: &[String]) -> std::io::Result<String> {
    let (program, args) = command.split_first().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty label command")
    })?;
    let output = tokio::process::Command::new(program)
        .args(args)
        .output()
        .await?;
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn label_command_captures_trimmed_stdout() {
        let value = run_label_command(&["echo".to_string(), "linux".to_string()])
            .await
            .unwrap();
        assert_eq!(value, "linux");
    }

    #[tokio::test]
    async fn empty_label_command_is_invalid() {
        assert!(run_label_command(&[]).await.is_err());
    }

    #[tokio::test]
    async fn command_labels_populate_the_shared_map() {
        let shared: SharedLabels = Arc::new(Mutex::new(HashMap::new()));
        let cancel = CancellationToken::new();
        run_command_labels(
            vec![CommandLabel {
                key: "kernel".into(),
                period: Duration::from_secs(3600),
                command: vec!["echo".into(), "6.1".into()],
            }],
            shared.clone(),
            cancel.clone(),
        )
        .await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(shared.lock().unwrap().get("kernel").map(String::as_str), Some("6.1"));
        cancel.cancel();
    }
}
