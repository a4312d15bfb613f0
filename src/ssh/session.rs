// ABOUTME: SSH session: connection parameters, transport handle and credentials.
// ABOUTME: Handles connect, fork, remote charset conversion and teardown.

use super::auth::AuthMethod;
use super::error::{Error, Result};
use super::link::SessionLink;
use crate::config::ssh_config::{self, SshConfig};
use crate::config::{Preferences, Profile, ServerAddress, find_identity, identity_path};
use crate::logging::{LogSink, TracingSink};
use crate::transport::{ConnectOptions, Connector, Keepalive, RusshConnector};
use encoding_rs::Encoding;
use std::borrow::Cow;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::Level;
use zeroize::Zeroizing;

pub const DEFAULT_PORT: u16 = 22;

/// Negotiable transport options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportOptions {
    /// Comma-separated key exchange algorithms.
    pub kex_algorithms: Option<String>,
    /// Comma-separated ciphers.
    pub ciphers: Option<String>,
    /// Comma-separated host key types.
    pub host_key_types: Option<String>,
    /// Command whose stdio carries the connection; `%h`, `%p`, `%r` are expanded.
    pub proxy_command: Option<String>,
    /// Refuse unknown or changed host keys without asking.
    pub strict_host_key_check: bool,
    pub compression: bool,
}

/// Configuration for establishing an SSH session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub host: String,
    pub port: u16,
    /// Login name; the local user when unset.
    pub user: Option<String>,
    pub auth: AuthMethod,
    pub key_path: Option<PathBuf>,
    /// Character set of remote text; UTF-8 when unset.
    pub charset: Option<String>,
    pub options: TransportOptions,
    /// Known hosts file; `~/.ssh/known_hosts` when unset.
    pub known_hosts_path: Option<PathBuf>,
    /// Client configuration file; `~/.ssh/config` when unset.
    pub ssh_config_path: Option<PathBuf>,
    /// Never hand secrets to the credential collaborator for saving.
    pub disable_password_storing: bool,
}

impl SessionConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            user: None,
            auth: AuthMethod::default(),
            key_path: None,
            charset: None,
            options: TransportOptions::default(),
            known_hosts_path: None,
            ssh_config_path: None,
            disable_password_storing: false,
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn auth(mut self, auth: AuthMethod) -> Self {
        self.auth = auth;
        self
    }

    pub fn key_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.key_path = Some(path.into());
        self
    }

    pub fn charset(mut self, charset: impl Into<String>) -> Self {
        self.charset = Some(charset.into());
        self
    }

    pub fn options(mut self, options: TransportOptions) -> Self {
        self.options = options;
        self
    }

    pub fn known_hosts_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.known_hosts_path = Some(path.into());
        self
    }

    pub fn ssh_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ssh_config_path = Some(path.into());
        self
    }

    /// Resolve a configuration from a profile. Missing or malformed values
    /// fall back to defaults instead of failing.
    pub fn from_profile(profile: &Profile) -> Self {
        let (host, port, addr_user) = resolve_server(profile);

        let key_path = match &profile.ssh_privatekey {
            Some(path) if !path.as_os_str().is_empty() => Some(identity_path(path)),
            _ => find_identity(),
        };

        let user = profile
            .ssh_username
            .clone()
            .filter(|u| !u.is_empty())
            .or(addr_user);

        Self {
            host,
            port,
            user,
            auth: profile.ssh_auth,
            key_path,
            charset: non_empty(&profile.ssh_charset),
            options: TransportOptions {
                kex_algorithms: non_empty(&profile.ssh_kex_algorithms),
                ciphers: non_empty(&profile.ssh_ciphers),
                host_key_types: non_empty(&profile.ssh_hostkeytypes),
                proxy_command: non_empty(&profile.ssh_proxycommand),
                strict_host_key_check: profile.ssh_stricthostkeycheck,
                compression: profile.ssh_compression,
            },
            known_hosts_path: None,
            ssh_config_path: None,
            disable_password_storing: profile.disablepasswordstoring,
        }
    }

    /// Fill options the configuration left unset from the client config.
    fn merge_ssh_config(&mut self, entry: ssh_config::HostOptions) {
        if let Some(hostname) = entry.hostname {
            tracing::debug!(alias = %self.host, %hostname, "resolved host alias from ssh config");
            self.host = hostname;
        }
        if self.port == DEFAULT_PORT {
            if let Some(port) = entry.port {
                self.port = port;
            }
        }
        if self.user.is_none() {
            self.user = entry.user;
        }
        if self.key_path.is_none() {
            self.key_path = entry.identity_file;
        }
        let opts = &mut self.options;
        if opts.proxy_command.is_none() {
            opts.proxy_command = entry.proxy_command;
        }
        if opts.ciphers.is_none() {
            opts.ciphers = entry.ciphers;
        }
        if opts.kex_algorithms.is_none() {
            opts.kex_algorithms = entry.kex_algorithms;
        }
        if opts.host_key_types.is_none() {
            opts.host_key_types = entry.host_key_algorithms;
        }
        opts.compression |= entry.compression.unwrap_or(false);
        opts.strict_host_key_check |= entry.strict_host_key_checking.unwrap_or(false);
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.clone().filter(|v| !v.trim().is_empty())
}

/// Host, port and optional user from `ssh_server`, falling back to `server`.
fn resolve_server(profile: &Profile) -> (String, u16, Option<String>) {
    let fallback_host = profile
        .server
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .and_then(|s| ServerAddress::parse(s, DEFAULT_PORT).ok())
        .map(|addr| addr.host)
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string());

    let ssh_server = profile.ssh_server.as_deref().filter(|s| !s.trim().is_empty());
    match ssh_server.map(|s| ServerAddress::parse(s, DEFAULT_PORT)) {
        Some(Ok(addr)) => {
            let host = if addr.host.is_empty() {
                fallback_host
            } else {
                addr.host
            };
            (host, addr.port, addr.user)
        }
        Some(Err(reason)) => {
            tracing::warn!(%reason, "ignoring malformed ssh_server value");
            (fallback_host, DEFAULT_PORT, None)
        }
        None => (fallback_host, DEFAULT_PORT, None),
    }
}

/// An SSH session to one server.
///
/// The transport handle lives in a [`SessionLink`] so tunnel and shell
/// workers can share it; every transport call takes the link's mutex.
pub struct Session {
    pub(super) config: SessionConfig,
    preferences: Preferences,
    connector: Arc<dyn Connector>,
    log: Arc<dyn LogSink>,
    pub(super) link: Arc<SessionLink>,
    pub(super) password: Option<Zeroizing<String>>,
    pub(super) passphrase: Option<Zeroizing<String>>,
    pub(super) authenticated: bool,
    pub(super) host_verified: bool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("link", &self.link)
            .field("authenticated", &self.authenticated)
            .field("host_verified", &self.host_verified)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(config: SessionConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            preferences: Preferences::default(),
            connector,
            log: Arc::new(TracingSink::default()),
            link: Arc::new(SessionLink::new()),
            password: None,
            passphrase: None,
            authenticated: false,
            host_verified: false,
        }
    }

    /// Session backed by the russh transport.
    pub fn russh(config: SessionConfig) -> Self {
        Self::new(config, Arc::new(RusshConnector))
    }

    pub fn from_profile(
        profile: &Profile,
        preferences: Preferences,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let sink = TracingSink::new(preferences.ssh_loglevel > 0);
        Self::new(SessionConfig::from_profile(profile), connector)
            .with_preferences(preferences)
            .with_log_sink(Arc::new(sink))
    }

    pub fn with_preferences(mut self, preferences: Preferences) -> Self {
        self.preferences = preferences;
        self
    }

    pub fn with_log_sink(mut self, log: Arc<dyn LogSink>) -> Self {
        self.log = log;
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn host(&self) -> &str {
        &self.config.host
    }

    pub fn port(&self) -> u16 {
        self.config.port
    }

    /// Effective login name.
    pub fn user(&self) -> String {
        match &self.config.user {
            Some(user) if !user.is_empty() => user.clone(),
            _ => whoami::username(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Whether the host key was accepted on the current connection.
    pub fn is_host_verified(&self) -> bool {
        self.host_verified
    }

    /// Message of the most recent failure, including failures on worker threads.
    pub fn last_error(&self) -> Option<String> {
        self.link.last_error()
    }

    pub(crate) fn link(&self) -> &Arc<SessionLink> {
        &self.link
    }

    /// Connect to the server and attempt the "none" authentication.
    pub fn connect(&mut self) -> Result<()> {
        if self.is_connected() {
            self.disconnect();
        }

        if self.preferences.ssh_parseconfig {
            self.apply_ssh_config();
        }

        let opts = self.connect_options();
        let mut transport = self
            .connector
            .create()
            .map_err(|e| self.link.fail(Error::connection("Failed to startup SSH session", e)))?;

        if let Err(e) = transport.connect(&opts) {
            transport.disconnect();
            return Err(self.link.fail(Error::connection("Failed to startup SSH session", e)));
        }

        let user = self.user();
        self.authenticated = match transport.auth_none(&user) {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::debug!(error = %e, "none authentication attempt failed");
                false
            }
        };
        self.host_verified = false;
        self.link.install(transport);

        tracing::info!(
            host = %self.config.host,
            port = self.config.port,
            %user,
            anonymous = self.authenticated,
            "SSH session connected"
        );
        Ok(())
    }

    fn apply_ssh_config(&mut self) {
        let path = match self.config.ssh_config_path.clone().or_else(ssh_config::default_path) {
            Some(path) => path,
            None => return,
        };
        match SshConfig::load(&path) {
            Ok(cfg) => {
                let entry = cfg.lookup(&self.config.host);
                self.config.merge_ssh_config(entry);
            }
            Err(e) => self.log.log(
                Level::WARN,
                &format!("cannot parse {}: {}", path.display(), e),
            ),
        }
    }

    fn connect_options(&self) -> ConnectOptions {
        let prefs = &self.preferences;
        ConnectOptions {
            host: self.config.host.clone(),
            port: self.config.port,
            user: self.user(),
            kex_algorithms: self.config.options.kex_algorithms.clone(),
            ciphers: self.config.options.ciphers.clone(),
            host_key_types: self.config.options.host_key_types.clone(),
            proxy_command: self.config.options.proxy_command.clone(),
            compression: self.config.options.compression,
            keepalive: Some(Keepalive {
                idle: prefs.tcp_keepidle,
                count: prefs.tcp_keepcnt,
                interval: prefs.tcp_keepintvl,
                user_timeout: prefs.tcp_user_timeout,
            }),
            connect_timeout: prefs.connect_timeout,
            log: Arc::clone(&self.log),
        }
    }

    /// New, unconnected session with this session's parameters and secrets.
    ///
    /// The fork has its own transport and must verify the host key again.
    pub fn fork(&self) -> Session {
        Session {
            config: self.config.clone(),
            preferences: self.preferences.clone(),
            connector: Arc::clone(&self.connector),
            log: Arc::clone(&self.log),
            link: Arc::new(SessionLink::new()),
            password: self.password.clone(),
            passphrase: self.passphrase.clone(),
            authenticated: false,
            host_verified: false,
        }
    }

    fn encoding(&self) -> Option<&'static Encoding> {
        let label = self.config.charset.as_deref().filter(|c| !c.is_empty())?;
        let encoding = Encoding::for_label(label.as_bytes());
        if encoding.is_none() {
            tracing::debug!(charset = %label, "unknown remote charset, passing text through");
        }
        encoding
    }

    /// Convert remote text to UTF-8. Returns the input unchanged if it cannot be converted.
    pub fn to_utf8<'a>(&self, input: &'a [u8]) -> Cow<'a, [u8]> {
        let Some(encoding) = self.encoding() else {
            return Cow::Borrowed(input);
        };
        let (text, had_errors) = encoding.decode_without_bom_handling(input);
        if had_errors {
            return Cow::Borrowed(input);
        }
        match text {
            Cow::Borrowed(s) => Cow::Borrowed(s.as_bytes()),
            Cow::Owned(s) => Cow::Owned(s.into_bytes()),
        }
    }

    /// Convert UTF-8 text to the remote charset. Returns the input unchanged if it cannot be converted.
    pub fn from_utf8<'a>(&self, input: &'a str) -> Cow<'a, [u8]> {
        let Some(encoding) = self.encoding() else {
            return Cow::Borrowed(input.as_bytes());
        };
        let (bytes, _, had_errors) = encoding.encode(input);
        if had_errors {
            return Cow::Borrowed(input.as_bytes());
        }
        bytes
    }

    /// Disconnect and release the transport. Safe to call when not connected.
    pub fn disconnect(&mut self) {
        if let Some(mut transport) = self.link.take() {
            transport.disconnect();
            tracing::info!(host = %self.config.host, "SSH session disconnected");
        }
        self.authenticated = false;
        self.host_verified = false;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.disconnect();
    }
}
