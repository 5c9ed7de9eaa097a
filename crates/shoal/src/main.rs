use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;
mod commands;
mod config;
mod wiring;

use cli::{Cli, Command, TokensCommand, UsersCommand};
use config::Config;

#[tokio::main]
async fn main() {
    let args = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = run(args).await {
        tracing::error!(error = %e, "Fatal");
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(args: Cli) -> anyhow::Result<()> {
    let cfg = Config::load_or_default(&args.config)?;

    match args.command {
        Command::Start {
            roles,
            domain,
            auth_server,
            token,
            data_dir,
            uuid,
        } => {
            wiring::start(
                cfg,
                wiring::StartOverrides {
                    roles,
                    domain,
                    auth_server,
                    token,
                    data_dir,
                    uuid,
                },
            )
            .await
        }
        Command::Tokens {
            command: TokensCommand::Add { role },
        } => commands::tokens_add(&cfg, &role).await,
        Command::Users {
            command: UsersCommand::Add { login },
        } => commands::users_add(&cfg, &login).await,
    }
}
