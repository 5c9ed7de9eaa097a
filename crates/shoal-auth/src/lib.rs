//! The cluster trust plane: certificate-authority lifecycle, join
//! tokens, identity bootstrap, user credential issuance, and the auth
//! control API with its signed-request authentication.

pub mod api;
pub mod authn;
pub mod ca;
pub mod client;
pub mod error;
pub mod identity;
pub mod keys;
pub mod lock;
pub mod protocol;
pub mod server;
pub mod token;
pub mod totp;
pub mod users;

pub use ca::{CaKind, CaService, CertAuthority, CertAuthorityId};
pub use client::AuthClient;
pub use error::AuthError;
pub use identity::{Identity, IdentityId};
pub use server::{AuthConfig, AuthServer, Presence};
