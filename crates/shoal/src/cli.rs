use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "shoal", version, about = "Cluster SSH access plane")]
pub struct Cli {
    /// Path to the operator config file
    #[arg(long, global = true, env = "SHOAL_CONFIG", default_value = "/etc/shoal.yaml")]
    pub config: PathBuf,

    /// Log filter (error, warn, info, debug, trace)
    #[arg(long, global = true, env = "SHOAL_LOG", default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Boot one daemon with the configured roles
    Start {
        /// Comma-separated roles to run (auth,proxy,node); overrides config
        #[arg(long)]
        roles: Option<String>,

        /// Cluster domain; overrides config
        #[arg(long)]
        domain: Option<String>,

        /// Auth server address (host:port) for joining roles
        #[arg(long)]
        auth_server: Option<String>,

        /// Provisioning token to join with
        #[arg(long)]
        token: Option<String>,

        /// Data directory; overrides config
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Host UUID; overrides the persisted one
        #[arg(long)]
        uuid: Option<String>,
    },

    /// Provisioning token management
    Tokens {
        #[command(subcommand)]
        command: TokensCommand,
    },

    /// User management
    Users {
        #[command(subcommand)]
        command: UsersCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum TokensCommand {
    /// Mint a one-shot join token for a role
    Add {
        /// Role the token authorizes (node or proxy)
        #[arg(long)]
        role: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum UsersCommand {
    /// Create a user and print their one-time sign-up URL
    Add {
        /// OS login the user certificate will carry
        login: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_flags_parse() {
        let cli = Cli::parse_from([
            "shoal",
            "start",
            "--roles=auth,proxy",
            "--domain=example.com",
            "--token=abc",
        ]);
        match cli.command {
            Command::Start { roles, domain, token, .. } => {
                assert_eq!(roles.as_deref(), Some("auth,proxy"));
                assert_eq!(domain.as_deref(), Some("example.com"));
                assert_eq!(token.as_deref(), Some("abc"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn tokens_add_parses_role() {
        let cli = Cli::parse_from(["shoal", "tokens", "add", "--role=node"]);
        match cli.command {
            Command::Tokens {
                command: TokensCommand::Add { role },
            } => assert_eq!(role, "node"),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn users_add_parses_login() {
        let cli = Cli::parse_from(["shoal", "users", "add", "alice"]);
        match cli.command {
            Command::Users {
                command: UsersCommand::Add { login },
            } => assert_eq!(login, "alice"),
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
