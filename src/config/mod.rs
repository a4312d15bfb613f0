// ABOUTME: Connection profile and preference types loaded from YAML.
// ABOUTME: Profiles describe one remote endpoint; preferences tune transport behaviour.

mod identity;
mod server;
pub mod ssh_config;

pub use identity::{COMMON_IDENTITIES, find_identity, identity_path};
pub use server::ServerAddress;

use crate::error::{Error, Result};
use crate::ssh::{AuthMethod, SecretKind};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Connection parameters for one remote endpoint.
///
/// Every field is optional: a missing value means "use the default", never an
/// error. Field names follow the keys of the profile store.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Profile {
    /// Address of the remote service this profile ultimately targets.
    pub server: Option<String>,
    /// Address of the SSH server, when it differs from `server`.
    pub ssh_server: Option<String>,
    pub ssh_username: Option<String>,
    pub ssh_privatekey: Option<PathBuf>,
    pub ssh_auth: AuthMethod,
    /// Character set used by the remote side for text.
    pub ssh_charset: Option<String>,
    pub ssh_kex_algorithms: Option<String>,
    pub ssh_ciphers: Option<String>,
    pub ssh_hostkeytypes: Option<String>,
    pub ssh_proxycommand: Option<String>,
    pub ssh_stricthostkeycheck: bool,
    pub ssh_compression: bool,
    /// Remote command for shell sessions; empty means an interactive shell.
    pub exec: Option<String>,
    pub ssh_password: Option<String>,
    pub ssh_passphrase: Option<String>,
    pub kerberos_token: Option<String>,
    pub disablepasswordstoring: bool,
}

impl Profile {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(Error::from)
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::ConfigNotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Secret previously saved for the given kind, if any.
    pub fn saved_secret(&self, kind: SecretKind) -> Option<&str> {
        match kind {
            SecretKind::Password => self.ssh_password.as_deref(),
            SecretKind::Passphrase => self.ssh_passphrase.as_deref(),
            SecretKind::KerberosToken => self.kerberos_token.as_deref(),
        }
    }

    pub fn set_saved_secret(&mut self, kind: SecretKind, secret: &str) {
        let slot = match kind {
            SecretKind::Password => &mut self.ssh_password,
            SecretKind::Passphrase => &mut self.ssh_passphrase,
            SecretKind::KerberosToken => &mut self.kerberos_token,
        };
        *slot = Some(secret.to_string());
    }
}

/// Process-wide transport tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Preferences {
    /// Read `~/.ssh/config` after applying profile options.
    pub ssh_parseconfig: bool,
    /// Verbosity of transport diagnostics (0 disables them).
    pub ssh_loglevel: u8,
    #[serde(with = "humantime_serde")]
    pub tcp_keepidle: Duration,
    pub tcp_keepcnt: u32,
    #[serde(with = "humantime_serde")]
    pub tcp_keepintvl: Duration,
    #[serde(with = "humantime_serde")]
    pub tcp_user_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            ssh_parseconfig: true,
            ssh_loglevel: 1,
            tcp_keepidle: Duration::from_secs(20),
            tcp_keepcnt: 3,
            tcp_keepintvl: Duration::from_secs(10),
            tcp_user_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

impl Preferences {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(Error::from)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| Error::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content)
    }
}
