//! Proxy-side tunnel hub: accepts outbound dials from nodes on the
//! tunnel port, authenticates their host certificates against the host
//! CA, and registers a channel opener in the routing table. This
//! module (with `agent`) is the only russh importer in the crate.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::server::{self, Auth, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec};
use ssh_key::certificate::{CertType, Certificate};
use ssh_key::{Fingerprint, HashAlg, PublicKey};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use shoal_auth::Identity;

use crate::router::{ChannelOpener, RoutingTable, TunnelStream};
use crate::TunnelError;

/// App-level keepalives flow every few seconds; a quiet tunnel this
/// long is dead.
const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(90);

/// Validate a peer's host certificate against the host-CA checkers and
/// return its principal.
pub fn verify_host_certificate(
    cert: &Certificate,
    checkers: &[PublicKey],
) -> Result<String, TunnelError> {
    if cert.cert_type() != CertType::Host {
        return Err(TunnelError::AccessDenied(
            "peer presented a non-host certificate".into(),
        ));
    }
    let fingerprints: Vec<Fingerprint> = checkers
        .iter()
        .map(|checker| checker.fingerprint(HashAlg::Sha256))
        .collect();
    cert.validate(fingerprints.iter())
        .map_err(|e| TunnelError::AccessDenied(format!("certificate validation: {e}")))?;
    cert.valid_principals()
        .first()
        .cloned()
        .ok_or_else(|| TunnelError::AccessDenied("certificate carries no principal".into()))
}

pub struct TunnelHub {
    checkers: Arc<Vec<PublicKey>>,
    router: Arc<RoutingTable>,
    config: Arc<server::Config>,
}

impl TunnelHub {
    /// `identity` supplies the hub's SSH host key; `checkers` is the
    /// host CA's checking set used to admit peers.
    pub fn new(
        identity: &Identity,
        checkers: Vec<PublicKey>,
        router: Arc<RoutingTable>,
    ) -> Self {
        let config = Arc::new(server::Config {
            keys: vec![identity.private_key.clone()],
            inactivity_timeout: Some(INACTIVITY_TIMEOUT),
            auth_rejection_time: Duration::from_millis(300),
            ..Default::default()
        });
        Self {
            checkers: Arc::new(checkers),
            router,
            config,
        }
    }

    pub fn router(&self) -> Arc<RoutingTable> {
        self.router.clone()
    }

    /// Accept tunnels until cancelled. One task per accepted
    /// connection; a connection's registration dies with it.
    pub async fn serve(
        self: Arc<Self>,
        addr: SocketAddr,
        cancel: CancellationToken,
    ) -> Result<(), TunnelError> {
        let listener = TcpListener::bind(addr).await?;
        self.serve_listener(listener, cancel).await
    }

    /// Accept loop over an already-bound listener.
    pub async fn serve_listener(
        self: Arc<Self>,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> Result<(), TunnelError> {
        tracing::info!(addr = ?listener.local_addr(), "Reverse-tunnel hub listening");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => {
                    let (socket, peer) = accepted?;
                    let hub = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = hub.handle_connection(socket, peer).await {
                            tracing::debug!(%peer, error = %e, "Tunnel connection ended with error");
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
    ) -> Result<(), TunnelError> {
        let handler = HubHandler {
            checkers: self.checkers.clone(),
            router: self.router.clone(),
            peer,
            principal: None,
            registration: None,
        };
        let session = server::run_stream(self.config.clone(), socket, handler).await?;
        // Drives the connection to completion. When it returns, the
        // transport is gone and dropping the handler deregisters the
        // peer — no keepalive confirmation needed.
        session.await?;
        Ok(())
    }
}

/// Deregisters on drop, so every exit path of a tunnel connection —
/// clean close, transport loss, handler error — frees the routing
/// entry.
struct RegistrationGuard {
    router: Arc<RoutingTable>,
    principal: String,
    reg_id: u64,
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        self.router.deregister(&self.principal, self.reg_id);
    }
}

struct HubHandler {
    checkers: Arc<Vec<PublicKey>>,
    router: Arc<RoutingTable>,
    peer: SocketAddr,
    principal: Option<String>,
    registration: Option<RegistrationGuard>,
}

impl server::Handler for HubHandler {
    type Error = russh::Error;

    async fn auth_publickey(
        &mut self,
        _user: &str,
        _public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        // Raw keys carry no cluster identity; only certificates admit.
        Ok(Auth::Reject {
            proceed_with_methods: None,
            partial_success: false,
        })
    }

    async fn auth_openssh_certificate(
        &mut self,
        _user: &str,
        certificate: &Certificate,
    ) -> Result<Auth, Self::Error> {
        match verify_host_certificate(certificate, &self.checkers) {
            Ok(principal) => {
                self.principal = Some(principal);
                Ok(Auth::Accept)
            }
            Err(e) => {
                tracing::warn!(peer = %self.peer, error = %e, "Tunnel peer rejected");
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                    partial_success: false,
                })
            }
        }
    }

    async fn auth_succeeded(&mut self, session: &mut Session) -> Result<(), Self::Error> {
        if let Some(principal) = self.principal.clone() {
            let opener = Arc::new(HandleOpener {
                handle: session.handle(),
            });
            let reg_id = self.router.register(&principal, opener);
            self.registration = Some(RegistrationGuard {
                router: self.router.clone(),
                principal,
                reg_id,
            });
        }
        Ok(())
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        // The agent's keepalive channel.
        Ok(true)
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        // Echo keepalive bytes so the agent observes liveness.
        let _ = session.data(channel, CryptoVec::from_slice(data));
        Ok(())
    }
}

/// Opens forwarded channels back over a registered tunnel.
struct HandleOpener {
    handle: server::Handle,
}

#[async_trait]
impl ChannelOpener for HandleOpener {
    async fn open(&self, target: &str, port: u32) -> Result<TunnelStream, TunnelError> {
        let channel = self
            .handle
            .channel_open_forwarded_tcpip(target, port, "127.0.0.1", 0)
            .await
            .map_err(|e| TunnelError::Internal(format!("tunnel channel open: {e}")))?;
        Ok(Box::new(channel.into_stream()))
    }
}
