//! Cluster roles and principal naming.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The role a host plays in the cluster. `Admin` is reserved for the
/// auth server's own local identity and is never joinable via token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Node,
    Proxy,
    Auth,
    Admin,
}

impl Role {
    /// Roles a provisioning token may be issued for.
    pub fn joinable(&self) -> bool {
        matches!(self, Role::Node | Role::Proxy)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Node => "node",
            Role::Proxy => "proxy",
            Role::Auth => "auth",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unrecognized role: {0}")]
pub struct UnknownRole(pub String);

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "node" => Ok(Role::Node),
            "proxy" => Ok(Role::Proxy),
            "auth" => Ok(Role::Auth),
            "admin" => Ok(Role::Admin),
            other => Err(UnknownRole(other.to_string())),
        }
    }
}

/// The certificate principal of a host: `<uuid>.<cluster-domain>`.
pub fn principal(host_uuid: &str, domain: &str) -> String {
    format!("{host_uuid}.{domain}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_round_trips_through_strings() {
        for role in [Role::Node, Role::Proxy, Role::Auth, Role::Admin] {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
    }

    #[test]
    fn unknown_role_is_rejected() {
        assert!("bastion".parse::<Role>().is_err());
    }

    #[test]
    fn only_node_and_proxy_are_joinable() {
        assert!(Role::Node.joinable());
        assert!(Role::Proxy.joinable());
        assert!(!Role::Auth.joinable());
        assert!(!Role::Admin.joinable());
    }

    #[test]
    fn principal_is_uuid_dot_domain() {
        assert_eq!(principal("abc-123", "example.com"), "abc-123.example.com");
    }

    #[test]
    fn role_serializes_lowercase() {
        assert_eq!(serde_json::to_value(Role::Proxy).unwrap(), "proxy");
    }
}
