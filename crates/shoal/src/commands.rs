//! Operator commands that talk to a running auth server using the
//! local admin identity (written by the auth role's first start on
//! this host).

use anyhow::Context;

use shoal_auth::{identity, AuthClient, Identity};
use shoal_common::{defaults, Role};

use crate::config::Config;

fn admin_identity(cfg: &Config) -> anyhow::Result<Identity> {
    let data_dir = cfg.data_dir();
    let uuid_path = data_dir.join("host_uuid");
    let host_uuid = std::fs::read_to_string(&uuid_path)
        .with_context(|| {
            format!(
                "reading {} — is the auth role initialized on this host?",
                uuid_path.display()
            )
        })?
        .trim()
        .to_string();
    let id = identity::IdentityId::new(host_uuid, Role::Admin);
    Ok(identity::read_identity(&data_dir, &id)?)
}

fn auth_addr(cfg: &Config) -> String {
    cfg.auth_servers
        .first()
        .cloned()
        .unwrap_or_else(|| format!("127.0.0.1:{}", defaults::AUTH_API_PORT))
}

/// `shoal tokens add --role=<role>`: print a one-shot join token.
pub async fn tokens_add(cfg: &Config, role: &str) -> anyhow::Result<()> {
    let role: Role = role
        .parse()
        .context("bad parameter: --role must be node or proxy")?;
    let client = AuthClient::new(&auth_addr(cfg), Some(admin_identity(cfg)?))?;
    let token = client.add_token(role).await?;
    println!("{token}");
    Ok(())
}

/// `shoal users add <login>`: print the one-time sign-up URL.
pub async fn users_add(cfg: &Config, login: &str) -> anyhow::Result<()> {
    let client = AuthClient::new(&auth_addr(cfg), Some(admin_identity(cfg)?))?;
    let token = client.add_user(login).await?;

    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    println!(
        "https://{host}:{}/web/newuser/{token}",
        cfg.listen.web.port()
    );
    Ok(())
}
