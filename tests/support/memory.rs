// ABOUTME: In-memory transport that scripts the remote side of an SSH connection.
// ABOUTME: Tests drive inbound channels and inspect every request the engine made.

use parking_lot::Mutex;
use russh::keys::{PrivateKey, PublicKey};
use sshplex::transport::{
    AuthMethods, ChannelId, ChannelPoll, ConnectOptions, Connector, KbdPrompt, Result,
    StreamKind, Transport, TransportError, X11Request,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Port the fake server assigns when asked to listen on port 0.
pub const ASSIGNED_PORT: u16 = 40022;

pub fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

fn load_host_key(name: &str) -> PublicKey {
    let text = std::fs::read_to_string(fixture(name)).unwrap();
    PublicKey::from_openssh(text.trim()).unwrap()
}

pub fn host_key() -> PublicKey {
    load_host_key("id_ed25519_plain.pub")
}

pub fn other_host_key() -> PublicKey {
    load_host_key("id_ed25519_encrypted.pub")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Session,
    Forward,
    Inbound,
    Sftp,
}

#[derive(Debug)]
pub struct MemChannel {
    pub kind: ChannelKind,
    /// Remote → client.
    pub regular: VecDeque<u8>,
    pub extended: VecDeque<u8>,
    /// Client → remote.
    pub received: Vec<u8>,
    pub remote_eof: bool,
    pub client_eof: bool,
    pub closed: bool,
    /// Whatever the client writes comes straight back.
    pub echo: bool,
}

impl MemChannel {
    fn new(kind: ChannelKind, echo: bool) -> Self {
        Self {
            kind,
            regular: VecDeque::new(),
            extended: VecDeque::new(),
            received: Vec::new(),
            remote_eof: false,
            client_eof: false,
            closed: false,
            echo,
        }
    }
}

/// Scripted server behaviour plus everything the client asked for.
#[derive(Debug)]
pub struct RemoteState {
    pub host_key: PublicKey,
    pub refuse_connect: Option<String>,
    pub anonymous: bool,
    pub methods: AuthMethods,
    pub password: Option<String>,
    pub accept_publickey: bool,
    pub accept_agent: bool,
    pub accept_gssapi: bool,
    pub kbd_prompts: usize,
    pub refuse_forwards: bool,
    pub refuse_exec: bool,
    pub refuse_shell: bool,
    pub refuse_x11: bool,
    pub echo_forwards: bool,
    pub occupied_ports: HashSet<u16>,
    pub sftp_available: bool,
    pub sftp_init_fails: bool,
    pub home: String,

    pub connects: Vec<ConnectRecord>,
    pub auth_attempts: Vec<String>,
    pub opened_forwards: Vec<(String, u16)>,
    pub listening: Vec<(Option<String>, u16)>,
    pub cancelled: Vec<(Option<String>, u16)>,
    pub x11_requests: Vec<X11Request>,
    pub ptys: Vec<(String, u32, u32)>,
    pub resizes: Vec<(u32, u32)>,
    pub exec_commands: Vec<String>,
    pub shell_requests: usize,
    pub disconnects: usize,

    pub channels: HashMap<ChannelId, MemChannel>,
    pending_forwards: VecDeque<(ChannelId, u16)>,
    pending_x11: VecDeque<ChannelId>,
    next_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRecord {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub proxy_command: Option<String>,
    pub ciphers: Option<String>,
    pub compression: bool,
}

impl Default for RemoteState {
    fn default() -> Self {
        Self {
            host_key: host_key(),
            refuse_connect: None,
            anonymous: false,
            methods: AuthMethods {
                password: true,
                public_key: true,
                ..AuthMethods::default()
            },
            password: Some("s3cret".into()),
            accept_publickey: true,
            accept_agent: false,
            accept_gssapi: false,
            kbd_prompts: 1,
            refuse_forwards: false,
            refuse_exec: false,
            refuse_shell: false,
            refuse_x11: false,
            echo_forwards: true,
            occupied_ports: HashSet::new(),
            sftp_available: true,
            sftp_init_fails: false,
            home: "/home/tester".into(),
            connects: Vec::new(),
            auth_attempts: Vec::new(),
            opened_forwards: Vec::new(),
            listening: Vec::new(),
            cancelled: Vec::new(),
            x11_requests: Vec::new(),
            ptys: Vec::new(),
            resizes: Vec::new(),
            exec_commands: Vec::new(),
            shell_requests: 0,
            disconnects: 0,
            channels: HashMap::new(),
            pending_forwards: VecDeque::new(),
            pending_x11: VecDeque::new(),
            next_id: 100,
        }
    }
}

impl RemoteState {
    fn new_channel(&mut self, kind: ChannelKind, echo: bool) -> ChannelId {
        let id = ChannelId(self.next_id);
        self.next_id += 1;
        self.channels.insert(id, MemChannel::new(kind, echo));
        id
    }

    fn live(&mut self, channel: ChannelId) -> Result<&mut MemChannel> {
        match self.channels.get_mut(&channel) {
            Some(ch) if !ch.closed => Ok(ch),
            _ => Err(TransportError::UnknownChannel(channel)),
        }
    }
}

/// Handle on the fake server, shared by the test and every transport it creates.
#[derive(Debug, Clone, Default)]
pub struct Remote {
    state: Arc<Mutex<RemoteState>>,
}

impl Remote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(f: impl FnOnce(&mut RemoteState)) -> Self {
        let remote = Self::new();
        remote.configure(f);
        remote
    }

    pub fn configure(&self, f: impl FnOnce(&mut RemoteState)) {
        f(&mut self.state.lock());
    }

    pub fn inspect<T>(&self, f: impl FnOnce(&RemoteState) -> T) -> T {
        f(&self.state.lock())
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(MemoryConnector {
            remote: self.clone(),
        })
    }

    /// Queue an inbound forwarded connection arriving on `port`.
    pub fn push_forwarded(&self, port: u16) -> ChannelId {
        let mut state = self.state.lock();
        let id = state.new_channel(ChannelKind::Inbound, false);
        state.pending_forwards.push_back((id, port));
        id
    }

    /// Queue an inbound X11 connection.
    pub fn push_x11(&self) -> ChannelId {
        let mut state = self.state.lock();
        let id = state.new_channel(ChannelKind::Inbound, false);
        state.pending_x11.push_back(id);
        id
    }

    /// Remote side writes to the client.
    pub fn send(&self, channel: ChannelId, data: &[u8]) {
        let mut state = self.state.lock();
        let ch = state.channels.get_mut(&channel).unwrap();
        ch.regular.extend(data.iter().copied());
    }

    pub fn send_stderr(&self, channel: ChannelId, data: &[u8]) {
        let mut state = self.state.lock();
        let ch = state.channels.get_mut(&channel).unwrap();
        ch.extended.extend(data.iter().copied());
    }

    pub fn send_eof(&self, channel: ChannelId) {
        let mut state = self.state.lock();
        state.channels.get_mut(&channel).unwrap().remote_eof = true;
    }

    pub fn received(&self, channel: ChannelId) -> Vec<u8> {
        self.inspect(|s| s.channels[&channel].received.clone())
    }

    pub fn is_closed(&self, channel: ChannelId) -> bool {
        self.inspect(|s| s.channels[&channel].closed)
    }

    pub fn channels_of(&self, kind: ChannelKind) -> Vec<ChannelId> {
        self.inspect(|s| {
            let mut ids: Vec<ChannelId> = s
                .channels
                .iter()
                .filter(|(_, ch)| ch.kind == kind)
                .map(|(id, _)| *id)
                .collect();
            ids.sort_by_key(|id| id.0);
            ids
        })
    }

    /// Poll `cond` until it holds or `timeout` passes.
    pub fn wait_for(&self, timeout: Duration, cond: impl Fn(&RemoteState) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if cond(&self.state.lock()) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

pub struct MemoryConnector {
    remote: Remote,
}

impl Connector for MemoryConnector {
    fn create(&self) -> Result<Box<dyn Transport>> {
        Ok(Box::new(MemoryTransport {
            remote: self.remote.clone(),
            connected: false,
        }))
    }
}

pub struct MemoryTransport {
    remote: Remote,
    connected: bool,
}

impl MemoryTransport {
    fn state(&self) -> Result<parking_lot::MutexGuard<'_, RemoteState>> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        Ok(self.remote.state.lock())
    }
}

impl Transport for MemoryTransport {
    fn connect(&mut self, opts: &ConnectOptions) -> Result<()> {
        let mut state = self.remote.state.lock();
        state.connects.push(ConnectRecord {
            host: opts.host.clone(),
            port: opts.port,
            user: opts.user.clone(),
            proxy_command: opts.proxy_command.clone(),
            ciphers: opts.ciphers.clone(),
            compression: opts.compression,
        });
        if let Some(reason) = &state.refuse_connect {
            return Err(TransportError::Protocol(reason.clone()));
        }
        drop(state);
        self.connected = true;
        Ok(())
    }

    fn server_public_key(&self) -> Option<PublicKey> {
        Some(self.remote.state.lock().host_key.clone())
    }

    fn auth_none(&mut self, _user: &str) -> Result<bool> {
        let mut state = self.state()?;
        state.auth_attempts.push("none".into());
        Ok(state.anonymous)
    }

    fn auth_methods(&mut self, _user: &str) -> Result<AuthMethods> {
        Ok(self.state()?.methods)
    }

    fn auth_password(&mut self, _user: &str, password: &str) -> Result<bool> {
        let mut state = self.state()?;
        state.auth_attempts.push("password".into());
        Ok(state.password.as_deref() == Some(password))
    }

    fn auth_keyboard_interactive(
        &mut self,
        _user: &str,
        responder: &mut dyn FnMut(&[KbdPrompt]) -> Vec<String>,
    ) -> Result<bool> {
        let (prompts, expected) = {
            let mut state = self.state()?;
            state.auth_attempts.push("keyboard-interactive".into());
            let prompts: Vec<KbdPrompt> = (0..state.kbd_prompts)
                .map(|i| KbdPrompt {
                    prompt: format!("Verification {}: ", i + 1),
                    echo: false,
                })
                .collect();
            (prompts, state.password.clone())
        };
        let answers = responder(&prompts);
        Ok(answers.len() == prompts.len()
            && answers.iter().all(|a| Some(a.as_str()) == expected.as_deref()))
    }

    fn auth_publickey(&mut self, _user: &str, _key: PrivateKey) -> Result<bool> {
        let mut state = self.state()?;
        state.auth_attempts.push("publickey".into());
        Ok(state.accept_publickey)
    }

    fn auth_agent(&mut self, _user: &str) -> Result<bool> {
        let mut state = self.state()?;
        state.auth_attempts.push("agent".into());
        Ok(state.accept_agent)
    }

    fn auth_publickey_auto(&mut self, _user: &str, passphrase: Option<&str>) -> Result<bool> {
        let mut state = self.state()?;
        state
            .auth_attempts
            .push(format!("auto:{}", passphrase.unwrap_or("")));
        Ok(state.accept_publickey)
    }

    fn auth_gssapi(&mut self, _user: &str) -> Result<bool> {
        let mut state = self.state()?;
        state.auth_attempts.push("gssapi".into());
        Ok(state.accept_gssapi)
    }

    fn open_session(&mut self) -> Result<ChannelId> {
        Ok(self.state()?.new_channel(ChannelKind::Session, false))
    }

    fn open_forward(
        &mut self,
        host: &str,
        port: u16,
        _origin_host: &str,
        _origin_port: u16,
    ) -> Result<ChannelId> {
        let mut state = self.state()?;
        if state.refuse_forwards {
            return Err(TransportError::Protocol(
                "administratively prohibited".into(),
            ));
        }
        state.opened_forwards.push((host.to_string(), port));
        let echo = state.echo_forwards;
        Ok(state.new_channel(ChannelKind::Forward, echo))
    }

    fn poll(&mut self, channel: ChannelId, kind: StreamKind) -> Result<ChannelPoll> {
        let mut state = self.state()?;
        let ch = state.live(channel)?;
        let buffered = match kind {
            StreamKind::Regular => ch.regular.len(),
            StreamKind::Extended => ch.extended.len(),
        };
        Ok(match (buffered, ch.remote_eof) {
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
        let mut state = self.state()?;
        let ch = state.live(channel)?;
        let stream = match kind {
            StreamKind::Regular => &mut ch.regular,
            StreamKind::Extended => &mut ch.extended,
        };
        let n = buf.len().min(stream.len());
        for (slot, byte) in buf.iter_mut().zip(stream.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write(&mut self, channel: ChannelId, data: &[u8]) -> Result<usize> {
        let mut state = self.state()?;
        let ch = state.live(channel)?;
        ch.received.extend_from_slice(data);
        if ch.echo {
            ch.regular.extend(data.iter().copied());
        }
        Ok(data.len())
    }

    fn send_eof(&mut self, channel: ChannelId) -> Result<()> {
        let mut state = self.state()?;
        state.live(channel)?.client_eof = true;
        Ok(())
    }

    fn close_channel(&mut self, channel: ChannelId) {
        if let Some(ch) = self.remote.state.lock().channels.get_mut(&channel) {
            ch.closed = true;
        }
    }

    fn listen_forward(&mut self, address: Option<&str>, port: u16) -> Result<u16> {
        let mut state = self.state()?;
        if state.occupied_ports.contains(&port) {
            return Err(TransportError::Protocol(format!("port {} is in use", port)));
        }
        let bound = if port == 0 { ASSIGNED_PORT } else { port };
        state.listening.push((address.map(str::to_string), bound));
        Ok(bound)
    }

    fn cancel_forward(&mut self, address: Option<&str>, port: u16) -> Result<()> {
        let mut state = self.state()?;
        let address = address.map(str::to_string);
        state.listening.retain(|l| *l != (address.clone(), port));
        state.cancelled.push((address, port));
        Ok(())
    }

    fn accept_forward(&mut self) -> Result<Option<(ChannelId, u16)>> {
        Ok(self.state()?.pending_forwards.pop_front())
    }

    fn request_x11(&mut self, channel: ChannelId, request: &X11Request) -> Result<()> {
        let mut state = self.state()?;
        state.live(channel)?;
        if state.refuse_x11 {
            return Err(TransportError::Refused("x11-req"));
        }
        state.x11_requests.push(request.clone());
        Ok(())
    }

    fn accept_x11(&mut self) -> Result<Option<ChannelId>> {
        Ok(self.state()?.pending_x11.pop_front())
    }

    fn request_pty(&mut self, channel: ChannelId, term: &str, cols: u32, rows: u32) -> Result<()> {
        let mut state = self.state()?;
        state.live(channel)?;
        state.ptys.push((term.to_string(), cols, rows));
        Ok(())
    }

    fn change_pty_size(&mut self, channel: ChannelId, cols: u32, rows: u32) -> Result<()> {
        let mut state = self.state()?;
        state.live(channel)?;
        state.resizes.push((cols, rows));
        Ok(())
    }

    fn request_shell(&mut self, channel: ChannelId) -> Result<()> {
        let mut state = self.state()?;
        state.live(channel)?;
        if state.refuse_shell {
            return Err(TransportError::Refused("shell"));
        }
        state.shell_requests += 1;
        Ok(())
    }

    fn request_exec(&mut self, channel: ChannelId, command: &str) -> Result<()> {
        let mut state = self.state()?;
        state.live(channel)?;
        if state.refuse_exec {
            return Err(TransportError::Refused("exec"));
        }
        state.exec_commands.push(command.to_string());
        Ok(())
    }

    fn open_sftp(&mut self) -> Result<ChannelId> {
        let mut state = self.state()?;
        if !state.sftp_available {
            return Err(TransportError::Protocol("subsystem request failed".into()));
        }
        Ok(state.new_channel(ChannelKind::Sftp, false))
    }

    fn init_sftp(&mut self, channel: ChannelId) -> Result<()> {
        let mut state = self.state()?;
        state.live(channel)?;
        if state.sftp_init_fails {
            return Err(TransportError::Protocol("bad SFTP version".into()));
        }
        Ok(())
    }

    fn sftp_canonicalize(&mut self, channel: ChannelId, path: &str) -> Result<String> {
        let mut state = self.state()?;
        state.live(channel)?;
        if path.starts_with('/') {
            return Ok(path.to_string());
        }
        let relative = path.trim_start_matches("./");
        if relative.is_empty() || relative == "." {
            return Ok(state.home.clone());
        }
        Ok(format!("{}/{}", state.home, relative))
    }

    fn disconnect(&mut self) {
        if self.connected {
            self.connected = false;
            self.remote.state.lock().disconnects += 1;
        }
    }
}
