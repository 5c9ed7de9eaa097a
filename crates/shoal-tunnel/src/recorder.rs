//! Session recording: the proxy tees the user→node byte stream into
//! chunks appended to the auth record store. Recording is best-effort
//! by design — a write failure is logged and never tears down the
//! session it observes.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use shoal_auth::AuthClient;

/// Flush the pending buffer at this size even before the timer fires.
const FLUSH_BYTES: usize = 64 * 1024;

/// Flush cadence for slow sessions.
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Bound on buffered-but-unflushed chunks; past it, recording drops
/// data rather than applying backpressure to the live session.
const QUEUE_DEPTH: usize = 256;

#[derive(Clone)]
pub struct RecorderHandle {
    tx: mpsc::Sender<Vec<u8>>,
    session_id: String,
}

impl RecorderHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn record(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if self.tx.try_send(data.to_vec()).is_err() {
            tracing::warn!(session_id = %self.session_id, "Session recorder queue full; dropping chunk");
        }
    }
}

/// Start the background flusher for one session. The task drains when
/// every handle is dropped.
pub fn start(auth: AuthClient, session_id: String) -> RecorderHandle {
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(QUEUE_DEPTH);
    let handle = RecorderHandle {
        tx,
        session_id: session_id.clone(),
    };

    tokio::spawn(async move {
        let mut buffer: Vec<u8> = Vec::new();
        let mut seq: u64 = 0;
        let mut ticker = tokio::time::interval(FLUSH_INTERVAL);

        loop {
            tokio::select! {
                chunk = rx.recv() => match chunk {
                    Some(chunk) => {
                        buffer.extend_from_slice(&chunk);
                        if buffer.len() >= FLUSH_BYTES {
                            flush(&auth, &session_id, &mut seq, &mut buffer).await;
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    flush(&auth, &session_id, &mut seq, &mut buffer).await;
                }
            }
        }
        flush(&auth, &session_id, &mut seq, &mut buffer).await;
    });

    handle
}

async fn flush(auth: &AuthClient, session_id: &str, seq: &mut u64, buffer: &mut Vec<u8>) {
    if buffer.is_empty() {
        return;
    }
    let data = std::mem::take(buffer);
    match auth.append_session_chunk(session_id, *seq, &data).await {
        Ok(()) => *seq += 1,
        Err(e) => {
            tracing::warn!(session_id, error = %e, "Failed to record session chunk");
        }
    }
}

/// Copy bytes both ways between the user and the node until either
/// side closes, teeing the user→node direction into the recorder.
pub async fn bridge<U, N>(
    mut user: U,
    mut node: N,
    recorder: Option<RecorderHandle>,
) -> std::io::Result<()>
where
    U: AsyncRead + AsyncWrite + Unpin,
    N: AsyncRead + AsyncWrite + Unpin,
{
    let mut user_buf = [0u8; 16 * 1024];
    let mut node_buf = [0u8; 16 * 1024];

    loop {
        tokio::select! {
            read = user.read(&mut user_buf) => {
                let n = read?;
                if n == 0 {
                    let _ = node.shutdown().await;
                    return Ok(());
                }
                if let Some(recorder) = &recorder {
                    recorder.record(&user_buf[..n]);
                }
                node.write_all(&user_buf[..n]).await?;
            }
            read = node.read(&mut node_buf) => {
                let n = read?;
                if n == 0 {
                    let _ = user.shutdown().await;
                    return Ok(());
                }
                user.write_all(&node_buf[..n]).await?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bridge_copies_both_directions_and_tees_upstream() {
        let (user_near, mut user_far) = tokio::io::duplex(1024);
        let (node_near, mut node_far) = tokio::io::duplex(1024);

        let bridge_task = tokio::spawn(bridge(user_near, node_near, None));

        user_far.write_all(b"from-user").await.unwrap();
        let mut buf = [0u8; 9];
        node_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"from-user");

        node_far.write_all(b"from-node").await.unwrap();
        let mut buf = [0u8; 9];
        user_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"from-node");

        drop(user_far);
        bridge_task.await.unwrap().unwrap();
    }
}
