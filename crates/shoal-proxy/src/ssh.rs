//! The user-facing SSH listener. Users authenticate with their
//! short-lived certificates against the user CA; accepted sessions ask
//! for a target host via direct-tcpip and are routed over a reverse
//! tunnel or a direct dial, wrapped by the session recorder.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use russh::server::{self, Auth, Msg, Session};
use russh::Channel;
use ssh_key::certificate::Certificate;
use ssh_key::PublicKey;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use shoal_auth::ca::verify_user_certificate;
use shoal_auth::{AuthClient, Identity};
use shoal_tunnel::{recorder, resolve_route, Route, RoutingTable};

use crate::ProxyError;

const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(3600);

pub struct ProxySsh {
    user_checkers: Arc<Vec<PublicKey>>,
    router: Arc<RoutingTable>,
    auth: AuthClient,
    config: Arc<server::Config>,
}

impl ProxySsh {
    pub fn new(
        identity: &Identity,
        user_checkers: Vec<PublicKey>,
        router: Arc<RoutingTable>,
        auth: AuthClient,
    ) -> Self {
        let config = Arc::new(server::Config {
            keys: vec![identity.private_key.clone()],
            inactivity_timeout: Some(INACTIVITY_TIMEOUT),
            auth_rejection_time: Duration::from_millis(300),
            ..Default::default()
        });
        Self {
            user_checkers: Arc::new(user_checkers),
            router,
            auth,
            config,
        }
    }

    pub async fn serve(
        self: Arc<Self>,
        addr: SocketAddr,
        cancel: CancellationToken,
    ) -> Result<(), ProxyError> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(%addr, "Proxy SSH listening");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => {
                    let (socket, peer) = accepted?;
                    let proxy = self.clone();
                    tokio::spawn(async move {
                        let handler = UserSessionHandler {
                            user_checkers: proxy.user_checkers.clone(),
                            router: proxy.router.clone(),
                            auth: proxy.auth.clone(),
                            peer,
                            login: None,
                        };
                        match server::run_stream(proxy.config.clone(), socket, handler).await {
                            Ok(session) => {
                                if let Err(e) = session.await {
                                    tracing::debug!(%peer, error = %e, "User session ended with error");
                                }
                            }
                            Err(e) => {
                                tracing::debug!(%peer, error = %e, "User SSH handshake failed");
                            }
                        }
                    });
                }
            }
        }
    }
}

struct UserSessionHandler {
    user_checkers: Arc<Vec<PublicKey>>,
    router: Arc<RoutingTable>,
    auth: AuthClient,
    peer: SocketAddr,
    login: Option<String>,
}

impl server::Handler for UserSessionHandler {
    type Error = russh::Error;

    async fn auth_publickey(
        &mut self,
        _user: &str,
        _public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        // Trust-on-first-use is forbidden; only certificates admit.
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
                tracing::info!(peer = %self.peer, %user, error = %e, "User rejected at proxy");
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                    partial_success: false,
                })
            }
        }
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let login = self.login.clone().unwrap_or_default();
        let host = host_to_connect.to_string();
        let port = port_to_connect as u16;

        let node_stream = match resolve_route(&self.router, &self.auth, &host, port).await {
            Ok(Route::Tunnel(opener)) => match opener.open(&host, port_to_connect).await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!(%host, error = %e, "Tunnel channel open failed");
                    return Ok(false);
                }
            },
            Ok(Route::Direct(addr)) => match TcpStream::connect(&addr).await {
                Ok(tcp) => {
                    let stream: shoal_tunnel::TunnelStream = Box::new(tcp);
                    stream
                }
                Err(e) => {
                    tracing::warn!(%host, %addr, error = %e, "Direct dial failed");
                    return Ok(false);
                }
            },
            Err(e) => {
                tracing::warn!(%host, error = %e, "Host resolution failed");
                return Ok(false);
            }
        };

        let session_id = uuid::Uuid::new_v4().to_string();
        let handle = recorder::start(self.auth.clone(), session_id.clone());
        tracing::info!(%login, %host, %session_id, "Session routed");

        tokio::spawn(async move {
            if let Err(e) = recorder::bridge(channel.into_stream(), node_stream, Some(handle)).await
            {
                tracing::debug!(%session_id, error = %e, "Session bridge ended");
            }
        });
        Ok(true)
    }
}
