//! Host SSH listener: presents the node's host key, admits users whose
//! certificates validate against the user CA and whose principals
//! cover the requested login, and hands exec requests to the executor
//! seam.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use russh::server::{self, Auth, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec};
use ssh_key::certificate::Certificate;
use ssh_key::PublicKey;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use shoal_auth::ca::verify_user_certificate;
use shoal_auth::Identity;

use crate::exec::Executor;
use crate::NodeError;

const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(3600);

pub struct NodeSsh {
    user_checkers: Arc<Vec<PublicKey>>,
    executor: Arc<dyn Executor>,
    config: Arc<server::Config>,
}

impl NodeSsh {
    pub fn new(
        identity: &Identity,
        user_checkers: Vec<PublicKey>,
        executor: Arc<dyn Executor>,
    ) -> Self {
        let config = Arc::new(server::Config {
            keys: vec![identity.private_key.clone()],
            inactivity_timeout: Some(INACTIVITY_TIMEOUT),
            auth_rejection_time: Duration::from_millis(300),
            ..Default::default()
        });
        Self {
            user_checkers: Arc::new(user_checkers),
            executor,
            config,
        }
    }

    pub async fn serve(
        self: Arc<Self>,
        addr: SocketAddr,
        cancel: CancellationToken,
    ) -> Result<(), NodeError> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(%addr, "Node SSH listening");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => {
                    let (socket, peer) = accepted?;
                    let node = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = node.handle_connection(socket, peer).await {
                            tracing::debug!(%peer, error = %e, "Node session ended with error");
                        }
                    });
                }
            }
        }
    }

    async fn handle_connection(
        &self,
        socket: TcpStream,
        peer: SocketAddr,
    ) -> Result<(), NodeError> {
        let handler = NodeSessionHandler {
            user_checkers: self.user_checkers.clone(),
            executor: self.executor.clone(),
            peer,
            login: None,
        };
        let session = server::run_stream(self.config.clone(), socket, handler).await?;
        session.await?;
        Ok(())
    }
}

struct NodeSessionHandler {
    user_checkers: Arc<Vec<PublicKey>>,
    executor: Arc<dyn Executor>,
    peer: SocketAddr,
    login: Option<String>,
}

impl server::Handler for NodeSessionHandler {
    type Error = russh::Error;

    async fn auth_publickey(
        &mut self,
        _user: &str,
        _public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        Ok(Auth::Reject {
            proceed_with_methods: None,
            partial_success: false,
        })
    }

    async fn auth_openssh_certificate(
        &mut self,
        user: &str,
        certificate: &Certificate,
    ) -> Result<Auth, Self::Error> {
        match verify_user_certificate(certificate, &self.user_checkers, user) {
            Ok(()) => {
                self.login = Some(user.to_string());
                Ok(Auth::Accept)
            }
            Err(e) => {
                tracing::info!(peer = %self.peer, %user, error = %e, "User rejected at node");
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                    partial_success: false,
                })
            }
        }
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let login = self.login.clone().unwrap_or_default();
        let command = String::from_utf8_lossy(data).to_string();
        let executor = self.executor.clone();
        let handle = session.handle();
        let _ = session.channel_success(channel);

        tokio::spawn(async move {
            let (output, code) = match executor.exec(&login, &command).await {
                Ok(result) => result,
                Err(e) => (format!("exec failed: {e}\n").into_bytes(), 1),
            };
            if !output.is_empty() {
                let _ = handle.data(channel, CryptoVec::from_slice(&output)).await;
            }
            let _ = handle.exit_status_request(channel, code).await;
            let _ = handle.eof(channel).await;
            let _ = handle.close(channel).await;
        });
        Ok(())
    }
}
