// ABOUTME: Blocking SSH transport seam used by sessions, tunnels and shell bridges.
// ABOUTME: Channels are addressed by ChannelId; every call is non-reentrant and serialized by the caller.

mod backend;
mod proxy;
pub mod select;

pub use backend::{RusshConnector, RusshTransport};

use crate::logging::LogSink;
use russh::keys::{PrivateKey, PublicKey};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Opaque handle for one channel on a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(pub u32);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which of a channel's two inbound streams to address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Regular,
    /// The extended data stream (stderr).
    Extended,
}

/// Result of polling a channel stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelPoll {
    Empty,
    /// Bytes available without blocking.
    Ready(usize),
    /// Remote side sent EOF or closed, and nothing is buffered.
    Eof,
}

/// Authentication methods the server offers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuthMethods {
    pub password: bool,
    pub public_key: bool,
    pub keyboard_interactive: bool,
    pub gssapi: bool,
    pub host_based: bool,
}

/// One keyboard-interactive prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KbdPrompt {
    pub prompt: String,
    pub echo: bool,
}

/// Socket keepalive tuning applied after the TCP connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keepalive {
    pub idle: Duration,
    pub count: u32,
    pub interval: Duration,
    pub user_timeout: Duration,
}

/// X11 forwarding credentials sent with an X11 request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct X11Request {
    pub single_connection: bool,
    pub protocol: String,
    pub cookie: String,
    pub screen: u32,
}

/// Everything a transport needs to open a connection.
#[derive(Clone)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub kex_algorithms: Option<String>,
    pub ciphers: Option<String>,
    pub host_key_types: Option<String>,
    pub proxy_command: Option<String>,
    pub compression: bool,
    pub keepalive: Option<Keepalive>,
    pub connect_timeout: Duration,
    pub log: Arc<dyn LogSink>,
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("proxy_command", &self.proxy_command)
            .field("compression", &self.compression)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("{0}")]
    Protocol(String),

    #[error("not connected")]
    NotConnected,

    #[error("unknown channel {0}")]
    UnknownChannel(ChannelId),

    #[error("{0} is not supported by this transport")]
    Unsupported(&'static str),

    #[error("{0} request refused by the server")]
    Refused(&'static str),

    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl From<russh::Error> for TransportError {
    fn from(e: russh::Error) -> Self {
        TransportError::Protocol(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Session and channel primitives of an SSH client.
///
/// Implementations never block indefinitely except in `connect` and the
/// authentication calls; channel reads go through `poll` first.
pub trait Transport: Send {
    fn connect(&mut self, opts: &ConnectOptions) -> Result<()>;
    /// Host key presented by the server during the last connect.
    fn server_public_key(&self) -> Option<PublicKey>;

    fn auth_none(&mut self, user: &str) -> Result<bool>;
    /// Methods the server offered after the last failed attempt.
    fn auth_methods(&mut self, user: &str) -> Result<AuthMethods>;
    fn auth_password(&mut self, user: &str, password: &str) -> Result<bool>;
    fn auth_keyboard_interactive(
        &mut self,
        user: &str,
        respond: &mut dyn FnMut(&[KbdPrompt]) -> Vec<String>,
    ) -> Result<bool>;
    fn auth_publickey(&mut self, user: &str, key: PrivateKey) -> Result<bool>;
    fn auth_agent(&mut self, user: &str) -> Result<bool>;
    /// Try the agent, then the conventional identity files.
    fn auth_publickey_auto(&mut self, user: &str, passphrase: Option<&str>) -> Result<bool>;
    fn auth_gssapi(&mut self, user: &str) -> Result<bool>;

    fn open_session(&mut self) -> Result<ChannelId>;
    fn open_forward(
        &mut self,
        host: &str,
        port: u16,
        origin_host: &str,
        origin_port: u16,
    ) -> Result<ChannelId>;
    fn poll(&mut self, channel: ChannelId, kind: StreamKind) -> Result<ChannelPoll>;
    /// Read what is buffered, never blocking. Returns 0 when nothing is available.
    fn read_nonblocking(
        &mut self,
        channel: ChannelId,
        kind: StreamKind,
        buf: &mut [u8],
    ) -> Result<usize>;
    fn write(&mut self, channel: ChannelId, data: &[u8]) -> Result<usize>;
    fn send_eof(&mut self, channel: ChannelId) -> Result<()>;
    fn close_channel(&mut self, channel: ChannelId);

    /// Ask the server to listen on `port`. Returns the bound port.
    fn listen_forward(&mut self, address: Option<&str>, port: u16) -> Result<u16>;
    fn cancel_forward(&mut self, address: Option<&str>, port: u16) -> Result<()>;
    /// Next inbound forwarded connection, with the port it arrived on.
    fn accept_forward(&mut self) -> Result<Option<(ChannelId, u16)>>;

    fn request_x11(&mut self, channel: ChannelId, request: &X11Request) -> Result<()>;
    fn accept_x11(&mut self) -> Result<Option<ChannelId>>;
    fn request_pty(&mut self, channel: ChannelId, term: &str, cols: u32, rows: u32) -> Result<()>;
    fn change_pty_size(&mut self, channel: ChannelId, cols: u32, rows: u32) -> Result<()>;
    fn request_shell(&mut self, channel: ChannelId) -> Result<()>;
    fn request_exec(&mut self, channel: ChannelId, command: &str) -> Result<()>;

    /// Open a session channel carrying the sftp subsystem.
    fn open_sftp(&mut self) -> Result<ChannelId>;
    fn init_sftp(&mut self, channel: ChannelId) -> Result<()>;
    fn sftp_canonicalize(&mut self, channel: ChannelId, path: &str) -> Result<String>;

    fn disconnect(&mut self);
}

/// Creates one fresh transport per connection attempt.
pub trait Connector: Send + Sync {
    fn create(&self) -> Result<Box<dyn Transport>>;
}
