// ABOUTME: SSH session module: connection, authentication and host-key trust.
// ABOUTME: Tunnels, shell bridges and file transfers are built on a connected Session.

mod auth;
mod error;
mod link;
mod prompt;
mod session;
mod trust;

pub use auth::{AuthMethod, AuthStatus};
pub use error::{Error, ErrorKind, Result};
pub use link::SessionLink;
pub use prompt::{
    CredentialPrompt, HostKeyChange, HostKeyPrompt, NoPrompt, SecretKind, SecretReply,
    TrustPrompt,
};
pub use session::{DEFAULT_PORT, Session, SessionConfig, TransportOptions};
pub use trust::{HostTrust, KnownState};
