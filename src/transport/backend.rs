// ABOUTME: Production transport on russh, driven by a private tokio runtime.
// ABOUTME: One pump task per channel buffers inbound data so polls and reads never block.

use super::proxy::{self, ProxyStream};
use super::{
    AuthMethods, ChannelId, ChannelPoll, ConnectOptions, Connector, KbdPrompt, Keepalive, Result,
    StreamKind, Transport, TransportError, X11Request,
};
use crate::config::{COMMON_IDENTITIES, identity_path};
use crate::logging::LogSink;
use bytes::BytesMut;
use parking_lot::Mutex;
use russh::client::{self, AuthResult, Handle, KeyboardInteractiveAuthResponse, Msg};
use russh::keys::agent::client::AgentClient;
use russh::keys::{Algorithm, PrivateKey, PrivateKeyWithHashAlg, PublicKey, load_secret_key};
use russh::{Channel, ChannelMsg, Disconnect, MethodKind, MethodSet, Preferred, cipher, kex};
use russh_sftp::client::SftpSession;
use std::borrow::Cow;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::runtime::Runtime;
use tokio::sync::{Notify, mpsc, oneshot};
use tracing::Level;

/// Extended data type carrying stderr.
const STDERR_EXT: u32 = 1;
/// The pump stops reading a channel once this much is buffered and unread.
const INBOX_LIMIT: usize = 256 * 1024;
/// How long a shell, exec or X11 request waits for the server's answer.
const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Creates russh transports, each with its own runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct RusshConnector;

impl Connector for RusshConnector {
    fn create(&self) -> Result<Box<dyn Transport>> {
        Ok(Box::new(RusshTransport::new()?))
    }
}

/// Data received on a channel and not read yet.
#[derive(Debug, Default)]
struct Inbox {
    regular: BytesMut,
    extended: BytesMut,
    eof: bool,
}

impl Inbox {
    fn buffered(&self) -> usize {
        self.regular.len() + self.extended.len()
    }

    /// Whether the pump may take more from the channel. A due request reply
    /// queues behind channel data, so reading continues while one is awaited.
    fn accepts_more(&self, awaiting_reply: bool) -> bool {
        awaiting_reply || self.buffered() < INBOX_LIMIT
    }

    fn stream(&mut self, kind: StreamKind) -> &mut BytesMut {
        match kind {
            StreamKind::Regular => &mut self.regular,
            StreamKind::Extended => &mut self.extended,
        }
    }
}

/// Inbox of one channel and the wakeup its pump waits on while the inbox is full.
#[derive(Default)]
struct Mailbox {
    inbox: Mutex<Inbox>,
    drained: Notify,
}

enum Request {
    Pty { term: String, cols: u32, rows: u32 },
    WindowChange { cols: u32, rows: u32 },
    Shell,
    Exec(String),
    X11(X11Request),
    Eof,
    Close,
}

impl Request {
    /// Name of a request the server must confirm before it counts as done.
    fn confirmed(&self) -> Option<&'static str> {
        match self {
            Request::Shell => Some("shell"),
            Request::Exec(_) => Some("exec"),
            Request::X11(_) => Some("x11-req"),
            _ => None,
        }
    }
}

type Reply = oneshot::Sender<Result<()>>;

struct Command {
    request: Request,
    reply: Reply,
}

struct ChannelEntry {
    remote: russh::ChannelId,
    mailbox: Arc<Mailbox>,
    requests: mpsc::UnboundedSender<Command>,
}

/// State the client handler shares with the transport.
#[derive(Default)]
struct Inbound {
    host_key: Mutex<Option<PublicKey>>,
    forwarded: Mutex<VecDeque<(Channel<Msg>, u16)>>,
    x11: Mutex<VecDeque<Channel<Msg>>>,
}

struct ClientHandler {
    inbound: Arc<Inbound>,
    log: Arc<dyn LogSink>,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    // Trust is decided by the session against known_hosts after the handshake.
    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        *self.inbound.host_key.lock() = Some(server_public_key.clone());
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> std::result::Result<(), Self::Error> {
        self.log.log(
            Level::DEBUG,
            &format!(
                "forwarded connection to {}:{} from {}:{}",
                connected_address, connected_port, originator_address, originator_port
            ),
        );
        let port = u16::try_from(connected_port).unwrap_or_default();
        self.inbound.forwarded.lock().push_back((channel, port));
        Ok(())
    }

    async fn server_channel_open_x11(
        &mut self,
        channel: Channel<Msg>,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> std::result::Result<(), Self::Error> {
        self.log.log(
            Level::DEBUG,
            &format!("X11 channel from {}:{}", originator_address, originator_port),
        );
        self.inbound.x11.lock().push_back(channel);
        Ok(())
    }
}

/// Blocking `Transport` over a russh client handle.
pub struct RusshTransport {
    runtime: Runtime,
    handle: Option<Handle<ClientHandler>>,
    inbound: Arc<Inbound>,
    channels: HashMap<ChannelId, ChannelEntry>,
    sftp_pending: HashMap<ChannelId, Channel<Msg>>,
    sftp: HashMap<ChannelId, SftpSession>,
    next_id: u32,
    methods: Option<AuthMethods>,
    log: Option<Arc<dyn LogSink>>,
}

impl std::fmt::Debug for RusshTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RusshTransport")
            .field("connected", &self.handle.is_some())
            .field("channels", &self.channels.len())
            .finish_non_exhaustive()
    }
}

impl RusshTransport {
    pub fn new() -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("sshplex-io")
            .enable_all()
            .build()?;
        Ok(Self {
            runtime,
            handle: None,
            inbound: Arc::new(Inbound::default()),
            channels: HashMap::new(),
            sftp_pending: HashMap::new(),
            sftp: HashMap::new(),
            next_id: 1,
            methods: None,
            log: None,
        })
    }

    fn log(&self, level: Level, message: &str) {
        if let Some(log) = &self.log {
            log.log(level, message);
        }
    }

    fn allocate_id(&mut self) -> ChannelId {
        let id = ChannelId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1).max(1);
        id
    }

    /// Start pumping `channel` and hand out its id.
    fn register(&mut self, channel: Channel<Msg>) -> ChannelId {
        let id = self.allocate_id();
        let mailbox = Arc::new(Mailbox::default());
        let (requests, rx) = mpsc::unbounded_channel();
        let entry = ChannelEntry {
            remote: channel.id(),
            mailbox: Arc::clone(&mailbox),
            requests,
        };
        self.runtime.spawn(pump(channel, mailbox, rx));
        self.channels.insert(id, entry);
        id
    }

    fn request(&mut self, channel: ChannelId, request: Request) -> Result<()> {
        let entry = self
            .channels
            .get(&channel)
            .ok_or(TransportError::UnknownChannel(channel))?;
        let (reply, rx) = oneshot::channel();
        entry
            .requests
            .send(Command { request, reply })
            .map_err(|_| channel_closed(channel))?;
        match self
            .runtime
            .block_on(async { tokio::time::timeout(REPLY_TIMEOUT, rx).await })
        {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(channel_closed(channel)),
            Err(_) => Err(TransportError::Protocol(format!(
                "no reply from the server on channel {}",
                channel
            ))),
        }
    }

    fn record_methods(&mut self, result: &AuthResult) -> bool {
        match result {
            AuthResult::Success => true,
            AuthResult::Failure {
                remaining_methods, ..
            } => {
                self.methods = Some(offered(remaining_methods));
                false
            }
        }
    }
}

impl Transport for RusshTransport {
    fn connect(&mut self, opts: &ConnectOptions) -> Result<()> {
        self.log = Some(Arc::clone(&opts.log));
        self.methods = None;
        let config = Arc::new(client_config(opts));
        let handler = ClientHandler {
            inbound: Arc::clone(&self.inbound),
            log: Arc::clone(&opts.log),
        };

        let handle = self.runtime.block_on(async {
            tokio::time::timeout(opts.connect_timeout, open(opts, config, handler))
                .await
                .map_err(|_| {
                    TransportError::Protocol(format!(
                        "connection to {}:{} timed out",
                        opts.host, opts.port
                    ))
                })?
        })?;
        self.handle = Some(handle);
        Ok(())
    }

    fn server_public_key(&self) -> Option<PublicKey> {
        self.inbound.host_key.lock().clone()
    }

    fn auth_none(&mut self, user: &str) -> Result<bool> {
        let handle = self.handle.as_mut().ok_or(TransportError::NotConnected)?;
        let result = self.runtime.block_on(handle.authenticate_none(user))?;
        Ok(self.record_methods(&result))
    }

    fn auth_methods(&mut self, user: &str) -> Result<AuthMethods> {
        if let Some(methods) = self.methods {
            return Ok(methods);
        }
        self.auth_none(user)?;
        Ok(self.methods.unwrap_or_default())
    }

    fn auth_password(&mut self, user: &str, password: &str) -> Result<bool> {
        let handle = self.handle.as_mut().ok_or(TransportError::NotConnected)?;
        let result = self
            .runtime
            .block_on(handle.authenticate_password(user, password))?;
        Ok(self.record_methods(&result))
    }

    fn auth_keyboard_interactive(
        &mut self,
        user: &str,
        responder: &mut dyn FnMut(&[KbdPrompt]) -> Vec<String>,
    ) -> Result<bool> {
        let handle = self.handle.as_mut().ok_or(TransportError::NotConnected)?;
        let mut response = self
            .runtime
            .block_on(handle.authenticate_keyboard_interactive_start(user, None::<String>))?;
        loop {
            match response {
                KeyboardInteractiveAuthResponse::Success => return Ok(true),
                KeyboardInteractiveAuthResponse::Failure { .. } => return Ok(false),
                KeyboardInteractiveAuthResponse::InfoRequest { prompts, .. } => {
                    let prompts: Vec<KbdPrompt> = prompts
                        .iter()
                        .map(|p| KbdPrompt {
                            prompt: p.prompt.clone(),
                            echo: p.echo,
                        })
                        .collect();
                    let answers = responder(&prompts);
                    response = self
                        .runtime
                        .block_on(handle.authenticate_keyboard_interactive_respond(answers))?;
                }
            }
        }
    }

    fn auth_publickey(&mut self, user: &str, key: PrivateKey) -> Result<bool> {
        let handle = self.handle.as_mut().ok_or(TransportError::NotConnected)?;
        let accepted = self.runtime.block_on(publickey(handle, user, key))?;
        Ok(accepted)
    }

    fn auth_agent(&mut self, user: &str) -> Result<bool> {
        let handle = self.handle.as_mut().ok_or(TransportError::NotConnected)?;
        self.runtime.block_on(agent(handle, user))
    }

    fn auth_publickey_auto(&mut self, user: &str, passphrase: Option<&str>) -> Result<bool> {
        match self.auth_agent(user) {
            Ok(true) => return Ok(true),
            Ok(false) => {}
            Err(e) => self.log(Level::DEBUG, &format!("agent authentication skipped: {}", e)),
        }

        for id in COMMON_IDENTITIES {
            let path = identity_path(Path::new(id));
            if !path.is_file() {
                continue;
            }
            let key = match load_secret_key(&path, passphrase) {
                Ok(key) => key,
                Err(e) => {
                    self.log(
                        Level::DEBUG,
                        &format!("cannot load identity {}: {}", path.display(), e),
                    );
                    continue;
                }
            };
            if self.auth_publickey(user, key)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn auth_gssapi(&mut self, _user: &str) -> Result<bool> {
        Err(TransportError::Unsupported("GSSAPI authentication"))
    }

    fn open_session(&mut self) -> Result<ChannelId> {
        let handle = self.handle.as_ref().ok_or(TransportError::NotConnected)?;
        let channel = self.runtime.block_on(handle.channel_open_session())?;
        Ok(self.register(channel))
    }

    fn open_forward(
        &mut self,
        host: &str,
        port: u16,
        origin_host: &str,
        origin_port: u16,
    ) -> Result<ChannelId> {
        let handle = self.handle.as_ref().ok_or(TransportError::NotConnected)?;
        let channel = self.runtime.block_on(handle.channel_open_direct_tcpip(
            host,
            u32::from(port),
            origin_host,
            u32::from(origin_port),
        ))?;
        Ok(self.register(channel))
    }

    fn poll(&mut self, channel: ChannelId, kind: StreamKind) -> Result<ChannelPoll> {
        let entry = self
            .channels
            .get(&channel)
            .ok_or(TransportError::UnknownChannel(channel))?;
        let mut inbox = entry.mailbox.inbox.lock();
        let eof = inbox.eof;
        let buffered = inbox.stream(kind).len();
        Ok(match (buffered, eof) {
            (0, true) => ChannelPoll::Eof,
            (0, false) => ChannelPoll::Empty,
            (n, _) => ChannelPoll::Ready(n),
        })
    }

    fn read_nonblocking(
        &mut self,
        channel: ChannelId,
        kind: StreamKind,
        buf: &mut [u8],
    ) -> Result<usize> {
        let entry = self
            .channels
            .get(&channel)
            .ok_or(TransportError::UnknownChannel(channel))?;
        let n = {
            let mut inbox = entry.mailbox.inbox.lock();
            let stream = inbox.stream(kind);
            let n = buf.len().min(stream.len());
            let chunk = stream.split_to(n);
            buf[..n].copy_from_slice(&chunk);
            n
        };
        entry.mailbox.drained.notify_one();
        Ok(n)
    }

    fn write(&mut self, channel: ChannelId, data: &[u8]) -> Result<usize> {
        let handle = self.handle.as_ref().ok_or(TransportError::NotConnected)?;
        let entry = self
            .channels
            .get(&channel)
            .ok_or(TransportError::UnknownChannel(channel))?;
        self.runtime
            .block_on(handle.data(entry.remote, data.to_vec().into()))
            .map_err(|_| channel_closed(channel))?;
        Ok(data.len())
    }

    fn send_eof(&mut self, channel: ChannelId) -> Result<()> {
        self.request(channel, Request::Eof)
    }

    fn close_channel(&mut self, channel: ChannelId) {
        if let Some(entry) = self.channels.remove(&channel) {
            let (reply, _) = oneshot::channel();
            let _ = entry.requests.send(Command {
                request: Request::Close,
                reply,
            });
        }
        if let Some(pending) = self.sftp_pending.remove(&channel) {
            let _ = self.runtime.block_on(pending.close());
        }
        if let Some(sftp) = self.sftp.remove(&channel) {
            let _ = self.runtime.block_on(sftp.close());
        }
    }

    fn listen_forward(&mut self, address: Option<&str>, port: u16) -> Result<u16> {
        let handle = self.handle.as_mut().ok_or(TransportError::NotConnected)?;
        let address = address.unwrap_or("");
        let bound = self
            .runtime
            .block_on(handle.tcpip_forward(address, u32::from(port)))?;
        if port != 0 {
            return Ok(port);
        }
        u16::try_from(bound)
            .map_err(|_| TransportError::Protocol(format!("server bound invalid port {}", bound)))
    }

    fn cancel_forward(&mut self, address: Option<&str>, port: u16) -> Result<()> {
        let handle = self.handle.as_mut().ok_or(TransportError::NotConnected)?;
        let address = address.unwrap_or("");
        self.runtime
            .block_on(handle.cancel_tcpip_forward(address, u32::from(port)))?;
        Ok(())
    }

    fn accept_forward(&mut self) -> Result<Option<(ChannelId, u16)>> {
        if self.handle.is_none() {
            return Err(TransportError::NotConnected);
        }
        let next = self.inbound.forwarded.lock().pop_front();
        Ok(next.map(|(channel, port)| (self.register(channel), port)))
    }

    fn request_x11(&mut self, channel: ChannelId, request: &X11Request) -> Result<()> {
        self.request(channel, Request::X11(request.clone()))
    }

    fn accept_x11(&mut self) -> Result<Option<ChannelId>> {
        if self.handle.is_none() {
            return Err(TransportError::NotConnected);
        }
        let next = self.inbound.x11.lock().pop_front();
        Ok(next.map(|channel| self.register(channel)))
    }

    fn request_pty(&mut self, channel: ChannelId, term: &str, cols: u32, rows: u32) -> Result<()> {
        self.request(
            channel,
            Request::Pty {
                term: term.to_string(),
                cols,
                rows,
            },
        )
    }

    fn change_pty_size(&mut self, channel: ChannelId, cols: u32, rows: u32) -> Result<()> {
        self.request(channel, Request::WindowChange { cols, rows })
    }

    fn request_shell(&mut self, channel: ChannelId) -> Result<()> {
        self.request(channel, Request::Shell)
    }

    fn request_exec(&mut self, channel: ChannelId, command: &str) -> Result<()> {
        self.request(channel, Request::Exec(command.to_string()))
    }

    fn open_sftp(&mut self) -> Result<ChannelId> {
        let handle = self.handle.as_ref().ok_or(TransportError::NotConnected)?;
        let channel = self.runtime.block_on(async {
            let channel = handle.channel_open_session().await?;
            channel.request_subsystem(true, "sftp").await?;
            Ok::<_, russh::Error>(channel)
        })?;
        let id = self.allocate_id();
        self.sftp_pending.insert(id, channel);
        Ok(id)
    }

    fn init_sftp(&mut self, channel: ChannelId) -> Result<()> {
        let pending = self
            .sftp_pending
            .remove(&channel)
            .ok_or(TransportError::UnknownChannel(channel))?;
        let sftp = self
            .runtime
            .block_on(SftpSession::new(pending.into_stream()))
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        self.sftp.insert(channel, sftp);
        Ok(())
    }

    fn sftp_canonicalize(&mut self, channel: ChannelId, path: &str) -> Result<String> {
        let sftp = self
            .sftp
            .get(&channel)
            .ok_or(TransportError::UnknownChannel(channel))?;
        self.runtime
            .block_on(sftp.canonicalize(path))
            .map_err(|e| TransportError::Protocol(e.to_string()))
    }

    fn disconnect(&mut self) {
        let ids: Vec<ChannelId> = self
            .channels
            .keys()
            .chain(self.sftp_pending.keys())
            .chain(self.sftp.keys())
            .copied()
            .collect();
        for id in ids {
            self.close_channel(id);
        }
        self.inbound.forwarded.lock().clear();
        self.inbound.x11.lock().clear();

        if let Some(handle) = self.handle.take() {
            if let Err(e) = self
                .runtime
                .block_on(handle.disconnect(Disconnect::ByApplication, "", "en"))
            {
                self.log(Level::DEBUG, &format!("disconnect failed: {}", e));
            }
        }
    }
}

fn channel_closed(channel: ChannelId) -> TransportError {
    TransportError::Protocol(format!("channel {} is closed", channel))
}

fn offered(methods: &MethodSet) -> AuthMethods {
    let mut offered = AuthMethods::default();
    for method in methods.iter() {
        match method {
            MethodKind::Password => offered.password = true,
            MethodKind::PublicKey => offered.public_key = true,
            MethodKind::KeyboardInteractive => offered.keyboard_interactive = true,
            MethodKind::HostBased => offered.host_based = true,
            _ => {}
        }
    }
    offered
}

async fn open(
    opts: &ConnectOptions,
    config: Arc<client::Config>,
    handler: ClientHandler,
) -> Result<Handle<ClientHandler>> {
    let handle = match &opts.proxy_command {
        Some(command) => {
            let command = proxy::expand(command, &opts.host, opts.port, &opts.user);
            opts.log
                .log(Level::DEBUG, &format!("using proxy command: {}", command));
            let stream = ProxyStream::spawn(&command)?;
            client::connect_stream(config, stream, handler).await?
        }
        None => {
            let stream = TcpStream::connect((opts.host.as_str(), opts.port)).await?;
            if let Some(keepalive) = &opts.keepalive {
                tune_socket(&stream, keepalive, opts.log.as_ref());
            }
            client::connect_stream(config, stream, handler).await?
        }
    };
    Ok(handle)
}

async fn publickey(
    handle: &mut Handle<ClientHandler>,
    user: &str,
    key: PrivateKey,
) -> Result<bool> {
    let hash_alg = handle.best_supported_rsa_hash().await?.flatten();
    let result = handle
        .authenticate_publickey(user, PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg))
        .await?;
    Ok(result.success())
}

async fn agent(handle: &mut Handle<ClientHandler>, user: &str) -> Result<bool> {
    let mut agent = AgentClient::connect_env()
        .await
        .map_err(|e| TransportError::Protocol(format!("SSH agent unavailable: {}", e)))?;
    let keys = agent
        .request_identities()
        .await
        .map_err(|e| TransportError::Protocol(format!("failed to list agent keys: {}", e)))?;

    for key in keys {
        match handle
            .authenticate_publickey_with(user, key, None, &mut agent)
            .await
        {
            Ok(result) if result.success() => return Ok(true),
            Ok(_) => continue,
            Err(e) => tracing::debug!(error = %e, "agent key rejected"),
        }
    }
    Ok(false)
}

/// Build the client config from the comma-separated algorithm lists.
fn client_config(opts: &ConnectOptions) -> client::Config {
    let mut preferred = if opts.compression {
        Preferred::COMPRESSED
    } else {
        Preferred::DEFAULT
    };
    let log = opts.log.as_ref();

    if let Some(list) = &opts.kex_algorithms {
        let names = parse_names(list, "key exchange", log, |n| kex::Name::try_from(n).ok());
        if !names.is_empty() {
            preferred.kex = Cow::Owned(names);
        }
    }
    if let Some(list) = &opts.ciphers {
        let names = parse_names(list, "cipher", log, |n| cipher::Name::try_from(n).ok());
        if !names.is_empty() {
            preferred.cipher = Cow::Owned(names);
        }
    }
    if let Some(list) = &opts.host_key_types {
        let names = parse_names(list, "host key", log, |n| Algorithm::from_str(n).ok());
        if !names.is_empty() {
            preferred.key = Cow::Owned(names);
        }
    }

    client::Config {
        preferred,
        inactivity_timeout: None,
        ..Default::default()
    }
}

fn parse_names<T>(
    list: &str,
    what: &str,
    log: &dyn LogSink,
    parse: impl Fn(&str) -> Option<T>,
) -> Vec<T> {
    list.split(',')
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .filter_map(|name| {
            let parsed = parse(name);
            if parsed.is_none() {
                log.log(
                    Level::WARN,
                    &format!("unsupported {} algorithm ignored: {}", what, name),
                );
            }
            parsed
        })
        .collect()
}

/// Apply keepalive tuning; each failing option is logged and skipped.
fn tune_socket(stream: &TcpStream, keepalive: &Keepalive, log: &dyn LogSink) {
    use nix::sys::socket::{setsockopt, sockopt};

    let report = |what: &str, result: nix::Result<()>| {
        if let Err(e) = result {
            log.log(Level::WARN, &format!("cannot set {}: {}", what, e));
        }
    };

    report("SO_KEEPALIVE", setsockopt(stream, sockopt::KeepAlive, &true));

    #[cfg(target_os = "linux")]
    {
        let secs = |d: Duration| u32::try_from(d.as_secs()).unwrap_or(u32::MAX);
        report(
            "TCP_KEEPIDLE",
            setsockopt(stream, sockopt::TcpKeepIdle, &secs(keepalive.idle)),
        );
        report(
            "TCP_KEEPCNT",
            setsockopt(stream, sockopt::TcpKeepCount, &keepalive.count),
        );
        report(
            "TCP_KEEPINTVL",
            setsockopt(stream, sockopt::TcpKeepInterval, &secs(keepalive.interval)),
        );
        let millis = u32::try_from(keepalive.user_timeout.as_millis()).unwrap_or(u32::MAX);
        report(
            "TCP_USER_TIMEOUT",
            setsockopt(stream, sockopt::TcpUserTimeout, &millis),
        );
    }
    #[cfg(not(target_os = "linux"))]
    let _ = (keepalive, Duration::ZERO);
}

/// Own one channel: buffer its inbound data and run its requests.
///
/// Reading stops while the inbox holds `INBOX_LIMIT` bytes, so the SSH window
/// throttles the peer until the consumer catches up.
async fn pump(
    mut channel: Channel<Msg>,
    mailbox: Arc<Mailbox>,
    mut requests: mpsc::UnboundedReceiver<Command>,
) {
    let mut awaiting: Option<(Reply, &'static str)> = None;
    loop {
        let reading = mailbox.inbox.lock().accepts_more(awaiting.is_some());
        tokio::select! {
            msg = channel.wait(), if reading => match msg {
                Some(ChannelMsg::Data { data }) => {
                    mailbox.inbox.lock().regular.extend_from_slice(&data)
                }
                Some(ChannelMsg::ExtendedData { data, ext }) => {
                    if ext == STDERR_EXT {
                        mailbox.inbox.lock().extended.extend_from_slice(&data);
                    }
                }
                Some(ChannelMsg::Success) => {
                    if let Some((reply, _)) = awaiting.take() {
                        let _ = reply.send(Ok(()));
                    }
                }
                Some(ChannelMsg::Failure) => match awaiting.take() {
                    Some((reply, name)) => {
                        let _ = reply.send(Err(TransportError::Refused(name)));
                    }
                    None => tracing::debug!("channel request refused"),
                },
                Some(ChannelMsg::Eof) => mailbox.inbox.lock().eof = true,
                Some(ChannelMsg::Close) | None => {
                    mailbox.inbox.lock().eof = true;
                    break;
                }
                Some(_) => {}
            },
            _ = mailbox.drained.notified(), if !reading => {}
            command = requests.recv() => {
                let Some(command) = command else {
                    let _ = channel.close().await;
                    break;
                };
                let closing = matches!(command.request, Request::Close);
                let confirmed = command.request.confirmed();
                let result = perform(&channel, command.request)
                    .await
                    .map_err(TransportError::from);
                match (result, confirmed) {
                    (Ok(()), Some(name)) => awaiting = Some((command.reply, name)),
                    (result, _) => {
                        let _ = command.reply.send(result);
                    }
                }
                if closing {
                    mailbox.inbox.lock().eof = true;
                    break;
                }
            }
        }
    }
}
async fn perform(channel: &Channel<Msg>, request: Request) -> std::result::Result<(), russh::Error> {
    match request {
        Request::Pty { term, cols, rows } => {
            channel
                .request_pty(false, &term, cols, rows, 0, 0, &[])
                .await
        }
        Request::WindowChange { cols, rows } => channel.window_change(cols, rows, 0, 0).await,
        Request::Shell => channel.request_shell(true).await,
        Request::Exec(command) => channel.exec(true, command).await,
        Request::X11(x11) => {
            channel
                .request_x11(
                    true,
                    x11.single_connection,
                    x11.protocol,
                    x11.cookie,
                    x11.screen,
                )
                .await
        }
        Request::Eof => channel.eof().await,
        Request::Close => channel.close().await,
    }
}
