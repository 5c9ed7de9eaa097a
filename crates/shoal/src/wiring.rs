//! Role assembly: build the backend, bring up the auth server, obtain
//! identities for each configured role, and start the listeners. One
//! daemon can run any subset of roles; a fatal error anywhere during
//! bootstrap aborts the whole start.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context};
use tokio_util::sync::CancellationToken;

use shoal_auth::api;
use shoal_auth::protocol::WireAuthority;
use shoal_auth::{
    identity, keys, AuthClient, AuthConfig, AuthServer, Identity, Presence,
};
use shoal_backend::{Backend, DirBackend, MemoryBackend};
use shoal_common::{defaults, Role};
use shoal_node::{run_command_labels, run_heartbeat, NodeSsh, ShellExecutor};
use shoal_proxy::ssh::ProxySsh;
use shoal_proxy::web::{self, WebState};
use shoal_tunnel::{run_agent, AgentConfig, RoutingTable, TunnelHub};

use crate::config::{ensure_host_uuid, parse_command_label, Config};

#[derive(Debug, Default)]
pub struct StartOverrides {
    pub roles: Option<String>,
    pub domain: Option<String>,
    pub auth_server: Option<String>,
    pub token: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub uuid: Option<String>,
}

pub async fn start(mut cfg: Config, overrides: StartOverrides) -> anyhow::Result<()> {
    if let Some(domain) = overrides.domain {
        cfg.domain = Some(domain);
    }
    if let Some(data_dir) = overrides.data_dir {
        cfg.data_dir = Some(data_dir);
    }
    if let Some(auth_server) = overrides.auth_server {
        cfg.auth_servers.insert(0, auth_server);
    }
    if let Some(token) = overrides.token {
        cfg.token = Some(token);
    }

    let roles = resolve_roles(&cfg, overrides.roles.as_deref())?;
    let data_dir = cfg.data_dir();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data dir {}", data_dir.display()))?;
    let host_uuid = ensure_host_uuid(&data_dir, overrides.uuid.as_deref())?;
    let domain = cfg
        .domain
        .clone()
        .unwrap_or_else(|| local_hostname());

    tracing::info!(%host_uuid, %domain, ?roles, "Starting shoal");

    let cancel = CancellationToken::new();
    let mut tasks = tokio::task::JoinSet::new();

    // ── Auth ──────────────────────────────────────────────────────
    let mut local_auth: Option<Arc<AuthServer>> = None;
    if roles.contains(&Role::Auth) {
        let backend = build_backend(&cfg, &data_dir)?;
        let (server, _admin) = AuthServer::init(AuthConfig {
            backend,
            domain: domain.clone(),
            data_dir: data_dir.clone(),
            host_uuid: host_uuid.clone(),
            host_ca: None,
            user_ca: None,
            static_tokens: cfg.static_tokens.clone(),
        })
        .await
        .context("auth server bootstrap")?;

        let api_server = server.clone();
        let api_addr = cfg.listen.auth_api;
        let api_cancel = cancel.clone();
        tasks.spawn(async move {
            tokio::select! {
                result = api::serve(api_server, api_addr) => {
                    if let Err(e) = result {
                        tracing::error!(error = %e, "Auth API exited");
                    }
                }
                _ = api_cancel.cancelled() => {}
            }
        });
        local_auth = Some(server);
    }

    let auth_addr = cfg
        .auth_servers
        .first()
        .cloned()
        .unwrap_or_else(|| format!("127.0.0.1:{}", defaults::AUTH_API_PORT));

    // ── Proxy ─────────────────────────────────────────────────────
    if roles.contains(&Role::Proxy) {
        let identity = obtain_identity(
            &data_dir,
            &host_uuid,
            Role::Proxy,
            local_auth.as_ref(),
            &auth_addr,
            cfg.token.as_deref(),
        )
        .await
        .context("proxy identity")?;
        let auth_client = AuthClient::new(&auth_addr, Some(identity.clone()))?;

        let host_checkers = fetch_checkers(local_auth.as_ref(), &auth_client, "host").await?;
        let user_checkers = fetch_checkers(local_auth.as_ref(), &auth_client, "user").await?;

        let router = Arc::new(RoutingTable::new());
        let hub = Arc::new(TunnelHub::new(&identity, host_checkers, router.clone()));
        let tunnel_addr = cfg.listen.tunnel;
        let tunnel_cancel = cancel.clone();
        tasks.spawn(async move {
            if let Err(e) = hub.serve(tunnel_addr, tunnel_cancel).await {
                tracing::error!(error = %e, "Tunnel hub exited");
            }
        });

        let proxy_ssh = Arc::new(ProxySsh::new(
            &identity,
            user_checkers,
            router,
            auth_client.clone(),
        ));
        let ssh_addr = cfg.listen.proxy_ssh;
        let ssh_cancel = cancel.clone();
        tasks.spawn(async move {
            if let Err(e) = proxy_ssh.serve(ssh_addr, ssh_cancel).await {
                tracing::error!(error = %e, "Proxy SSH exited");
            }
        });

        let web_state = Arc::new(WebState { auth: auth_client });
        let web_addr = cfg.listen.web;
        let web_cancel = cancel.clone();
        let web_data_dir = data_dir.clone();
        tasks.spawn(async move {
            if let Err(e) = web::serve(web_state, &web_data_dir, web_addr, web_cancel).await {
                tracing::error!(error = %e, "Proxy web exited");
            }
        });
    }

    // ── Node ──────────────────────────────────────────────────────
    if roles.contains(&Role::Node) {
        let identity = obtain_identity(
            &data_dir,
            &host_uuid,
            Role::Node,
            local_auth.as_ref(),
            &auth_addr,
            cfg.token.as_deref(),
        )
        .await
        .context("node identity")?;
        let auth_client = AuthClient::new(&auth_addr, Some(identity.clone()))?;
        let user_checkers = fetch_checkers(local_auth.as_ref(), &auth_client, "user").await?;

        let node_ssh = Arc::new(NodeSsh::new(
            &identity,
            user_checkers,
            Arc::new(ShellExecutor::default()),
        ));
        let node_addr = cfg.listen.node_ssh;
        let node_cancel = cancel.clone();
        tasks.spawn(async move {
            if let Err(e) = node_ssh.serve(node_addr, node_cancel).await {
                tracing::error!(error = %e, "Node SSH exited");
            }
        });

        let dynamic_labels = Arc::new(Mutex::new(HashMap::new()));
        let mut command_labels = Vec::new();
        for (key, value) in &cfg.command_labels {
            command_labels.push(parse_command_label(key, value)?);
        }
        run_command_labels(command_labels, dynamic_labels.clone(), cancel.clone()).await;

        let presence = Presence {
            host_uuid: host_uuid.clone(),
            principal: identity.principal()?.to_string(),
            role: Role::Node,
            addr: format!("{}:{}", local_hostname(), cfg.listen.node_ssh.port()),
            labels: cfg.labels.clone(),
        };
        tasks.spawn(run_heartbeat(
            auth_client.clone(),
            presence,
            dynamic_labels,
            cancel.clone(),
        ));

        // One reverse tunnel per configured proxy. A daemon running
        // its own proxy keeps a loopback tunnel too, so routing works
        // the same in single- and multi-host layouts.
        let mut proxies = cfg.proxy_servers.clone();
        if proxies.is_empty() && roles.contains(&Role::Proxy) {
            proxies.push(format!("127.0.0.1:{}", cfg.listen.tunnel.port()));
        }
        let local_ssh = format!("127.0.0.1:{}", cfg.listen.node_ssh.port());
        for proxy in proxies {
            let agent_cfg = AgentConfig::new(identity.clone(), proxy, local_ssh.clone());
            tasks.spawn(run_agent(agent_cfg, cancel.clone()));
        }
    }

    if tasks.is_empty() {
        bail!("no roles configured; nothing to run");
    }

    tokio::signal::ctrl_c().await.ok();
    tracing::info!("Shutting down");
    cancel.cancel();
    while tasks.join_next().await.is_some() {}
    Ok(())
}

fn resolve_roles(cfg: &Config, cli_roles: Option<&str>) -> anyhow::Result<Vec<Role>> {
    let names: Vec<String> = match cli_roles {
        Some(roles) => roles.split(',').map(|r| r.trim().to_string()).collect(),
        None if !cfg.roles.is_empty() => cfg.roles.clone(),
        // A bare `start` runs everything, which is the single-host
        // quickstart experience.
        None => vec!["auth".into(), "proxy".into(), "node".into()],
    };
    let mut roles = Vec::new();
    for name in names {
        let role: Role = name.parse().context("bad parameter in --roles")?;
        if role == Role::Admin {
            bail!("bad parameter: admin is not a startable role");
        }
        if !roles.contains(&role) {
            roles.push(role);
        }
    }
    Ok(roles)
}

fn build_backend(cfg: &Config, data_dir: &Path) -> anyhow::Result<Arc<dyn Backend>> {
    match cfg.backend.kind.as_str() {
        "dir" => {
            let path = cfg
                .backend
                .path
                .clone()
                .unwrap_or_else(|| data_dir.join(defaults::KEYS_STORE));
            Ok(Arc::new(DirBackend::open(path)?))
        }
        "memory" => Ok(Arc::new(MemoryBackend::new())),
        "etcd" => bail!(
            "the replicated backend is an external collaborator; this build ships `dir` and `memory`"
        ),
        other => bail!("bad parameter: unrecognized backend type {other:?}"),
    }
}

/// Read the role identity from disk, or bootstrap it: locally signed
/// when this daemon also runs auth, via the join protocol otherwise.
async fn obtain_identity(
    data_dir: &Path,
    host_uuid: &str,
    role: Role,
    local_auth: Option<&Arc<AuthServer>>,
    auth_addr: &str,
    token: Option<&str>,
) -> anyhow::Result<Identity> {
    let id = identity::IdentityId::new(host_uuid, role);
    if identity::have_keys(data_dir, &id) {
        return Ok(identity::read_identity(data_dir, &id)?);
    }

    let identity = match local_auth {
        Some(auth) => {
            let auth = auth.clone();
            let uuid = host_uuid.to_string();
            identity::bootstrap(data_dir, &id, |public| async move {
                auth.generate_host_cert(&public, &uuid, role, None).await
            })
            .await?
        }
        None => {
            let token = token
                .with_context(|| format!("{role} has no identity and no join token was given"))?
                .to_string();
            let client = AuthClient::new(auth_addr, None)?;
            let uuid = host_uuid.to_string();
            identity::bootstrap(data_dir, &id, |public| async move {
                let response = client
                    .register_using_token(&token, &uuid, role, &public)
                    .await?;
                Ok(response.certificate.into_bytes())
            })
            .await?
        }
    };
    Ok(identity)
}

/// Checking keys for one CA kind, from the in-process auth server when
/// present, over the API otherwise.
async fn fetch_checkers(
    local_auth: Option<&Arc<AuthServer>>,
    client: &AuthClient,
    kind: &str,
) -> anyhow::Result<Vec<ssh_key::PublicKey>> {
    if kind == "host" {
        if let Some(auth) = local_auth {
            return Ok(auth.host_ca_checkers().await?);
        }
    }
    let authorities = client.authorities(kind).await?;
    checkers_from_wire(&authorities)
}

fn checkers_from_wire(authorities: &[WireAuthority]) -> anyhow::Result<Vec<ssh_key::PublicKey>> {
    let mut checkers = Vec::new();
    for authority in authorities {
        for key in &authority.checking_keys {
            checkers.push(keys::parse_public(key.as_bytes())?);
        }
    }
    Ok(checkers)
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}
