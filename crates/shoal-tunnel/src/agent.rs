//! Node-side tunnel agent: dial the proxy's tunnel port, authenticate
//! with the host certificate, keep the connection alive, and bridge
//! forwarded channels into the local SSH listener. One agent task per
//! configured proxy; reconnection uses jittered exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, Msg};
use russh::{Channel, ChannelMsg, Disconnect};
use ssh_key::PublicKey;
use tokio_util::sync::CancellationToken;

use shoal_auth::Identity;
use shoal_common::defaults;

use crate::backoff::Backoff;
use crate::recorder;
use crate::TunnelError;

/// First redial happens within this window; later ones grow toward
/// the cap.
const BACKOFF_BASE: Duration = Duration::from_millis(500);

pub struct AgentConfig {
    pub identity: Identity,
    /// `host:port` of the proxy's tunnel listener.
    pub proxy_tunnel_addr: String,
    /// Local node SSH listener forwarded channels bridge into.
    pub local_ssh_addr: String,
    pub keepalive_interval: Duration,
    pub keepalive_window: Duration,
}

impl AgentConfig {
    pub fn new(identity: Identity, proxy_tunnel_addr: String, local_ssh_addr: String) -> Self {
        Self {
            identity,
            proxy_tunnel_addr,
            local_ssh_addr,
            keepalive_interval: defaults::SERVER_HEARTBEAT_TTL / 2,
            keepalive_window: defaults::SERVER_HEARTBEAT_TTL,
        }
    }
}

/// Maintain one tunnel to one proxy until cancelled. Each connection
/// attempt surfaces its terminal error to the log before the next
/// backoff delay.
pub async fn run_agent(cfg: AgentConfig, cancel: CancellationToken) {
    let mut backoff = Backoff::new(BACKOFF_BASE, defaults::TUNNEL_BACKOFF_CAP);
    loop {
        if cancel.is_cancelled() {
            return;
        }
        match connect_once(&cfg, &cancel, &mut backoff).await {
            Ok(()) => return, // cancelled from inside the session
            Err(e) => {
                tracing::warn!(proxy = %cfg.proxy_tunnel_addr, error = %e, "Reverse tunnel dropped");
            }
        }
        let delay = backoff.next_delay();
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn connect_once(
    cfg: &AgentConfig,
    cancel: &CancellationToken,
    backoff: &mut Backoff,
) -> Result<(), TunnelError> {
    let config = Arc::new(client::Config::default());
    let handler = AgentHandler {
        local_ssh_addr: cfg.local_ssh_addr.clone(),
    };
    let mut session =
        client::connect(config, cfg.proxy_tunnel_addr.as_str(), handler).await?;

    let principal = cfg.identity.principal()?.to_string();
    let auth_result = session
        .authenticate_openssh_cert(
            principal.as_str(),
            Arc::new(cfg.identity.private_key.clone()),
            cfg.identity.certificate.clone(),
        )
        .await?;
    if !auth_result.success() {
        return Err(TunnelError::AccessDenied(
            "proxy rejected the tunnel certificate".into(),
        ));
    }
    backoff.reset();
    tracing::info!(proxy = %cfg.proxy_tunnel_addr, %principal, "Reverse tunnel established");

    // Dedicated keepalive channel: a byte out, an echo back. A missed
    // echo within the window tears the connection down for a redial.
    let mut channel = session.channel_open_session().await?;
    let mut ticker = tokio::time::interval(cfg.keepalive_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // first tick is immediate

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = session
                    .disconnect(Disconnect::ByApplication, "shutting down", "en")
                    .await;
                return Ok(());
            }
            _ = ticker.tick() => {
                channel.data(&b"k"[..]).await?;
                await_echo(&mut channel, cfg.keepalive_window).await?;
            }
        }
    }
}

async fn await_echo(
    channel: &mut Channel<Msg>,
    window: Duration,
) -> Result<(), TunnelError> {
    let deadline = tokio::time::sleep(window);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { .. }) => return Ok(()),
                Some(_) => continue,
                None => return Err(TunnelError::Internal("keepalive channel closed".into())),
            },
            _ = &mut deadline => {
                return Err(TunnelError::Internal(format!(
                    "no keep-alive reply within {window:?}"
                )));
            }
        }
    }
}

struct AgentHandler {
    local_ssh_addr: String,
}

impl client::Handler for AgentHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        // The proxy is trusted by its configured address; node
        // authenticity toward the user is enforced end-to-end by the
        // client's host-CA check on the nested SSH session.
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let local = self.local_ssh_addr.clone();
        tracing::debug!(
            target = %connected_address,
            port = connected_port,
            %local,
            "Routed session arriving over tunnel"
        );
        tokio::spawn(async move {
            match tokio::net::TcpStream::connect(&local).await {
                Ok(tcp) => {
                    if let Err(e) = recorder::bridge(channel.into_stream(), tcp, None).await {
                        tracing::debug!(error = %e, "Tunneled session bridge ended");
                    }
                }
                Err(e) => {
                    tracing::warn!(%local, error = %e, "Local SSH listener unreachable");
                }
            }
        });
        Ok(())
    }
}
