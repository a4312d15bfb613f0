// ABOUTME: Tunnel worker: topology setup, first connection and the pair relay loop.
// ABOUTME: Runs on its own thread and takes the session mutex one transport call at a time.

use super::pair::{LocalStream, Pair, PairSet, PendingOutput};
use super::{
    BUFFER_SIZE, Shared, TunnelKind, TunnelObserver, TunnelOptions, TunnelReady, TunnelState,
    X_PORT_BASE, XAuth, XDisplay, XPORT_DISPLAYS,
};
use crate::ssh::{Error, Result, SessionLink};
use crate::transport::{self, ChannelId, ChannelPoll, StreamKind, X11Request, select};
use std::io::{self, Read};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const ACCEPT_SLEEP: Duration = Duration::from_millis(20);
const X11_PROTOCOL: &str = "MIT-MAGIC-COOKIE-1";

/// What each topology needs before its first connection.
pub(super) enum Setup {
    Local {
        listener: TcpListener,
        dest_host: String,
        dest_port: u16,
    },
    X11 {
        command: String,
        display_name: String,
        target: XDisplay,
    },
    DynamicRemote {
        target: XDisplay,
        bind_localhost: bool,
    },
    Reverse {
        remote_port: u16,
        local_port: u16,
    },
}

/// Server-side listening left for the owner to cancel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct RemoteListen {
    pub address: Option<String>,
    pub port: u16,
}

enum Accept {
    Accepted,
    Nothing,
    Failed(Error),
}

pub(super) struct Relay {
    kind: TunnelKind,
    setup: Setup,
    link: Arc<SessionLink>,
    shared: Arc<Shared>,
    observer: Arc<dyn TunnelObserver>,
    options: TunnelOptions,
    pairs: PairSet<LocalStream>,
    buffer: Vec<u8>,
    listening: Option<RemoteListen>,
    /// Session channel running the X11 command.
    x11_channel: Option<ChannelId>,
    connected: bool,
}

impl Relay {
    pub(super) fn new(
        kind: TunnelKind,
        setup: Setup,
        link: Arc<SessionLink>,
        shared: Arc<Shared>,
        observer: Arc<dyn TunnelObserver>,
        options: TunnelOptions,
    ) -> Self {
        Self {
            kind,
            setup,
            link,
            shared,
            observer,
            options,
            pairs: PairSet::new(),
            buffer: vec![0; BUFFER_SIZE],
            listening: None,
            x11_channel: None,
            connected: false,
        }
    }

    /// Worker entry point. Returns the remote listening still registered.
    pub(super) fn run(mut self) -> Option<RemoteListen> {
        let result = self.serve();

        self.shared.set_state(TunnelState::Draining);
        for pair in self.pairs.drain() {
            close_pair(&self.link, pair);
        }
        if let Some(channel) = self.x11_channel.take() {
            let _ = self.link.call(|t| {
                t.close_channel(channel);
                Ok(())
            });
        }

        let error = match result {
            Ok(()) => None,
            Err(e) => {
                let e = self.link.fail(e);
                warn!(kind = ?self.kind, error = %e, "tunnel failed");
                Some(e.to_string())
            }
        };

        self.shared
            .running
            .store(false, std::sync::atomic::Ordering::SeqCst);
        self.observer.on_teardown(error.as_deref());
        self.shared.set_state(TunnelState::Closed);
        self.listening.take()
    }

    fn serve(&mut self) -> Result<()> {
        let ready = self.prepare()?;
        debug!(?ready, "tunnel ready");
        if !self.observer.on_ready(&ready) {
            info!("tunnel declined by its owner");
            return Ok(());
        }

        loop {
            if !self.first_connection()? {
                return Ok(());
            }
            if !self.connected {
                self.connected = true;
                self.observer.on_connect();
            }
            self.shared.set_state(TunnelState::Relaying);
            self.relay()?;

            // A local listener keeps serving after its connections drain.
            if self.kind == TunnelKind::LocalForward && self.shared.is_running() {
                debug!("all local connections closed, waiting for the next one");
                continue;
            }
            return Ok(());
        }
    }

    /// Transport-side setup of the topology.
    fn prepare(&mut self) -> Result<TunnelReady> {
        let mut ready = TunnelReady {
            kind: self.kind,
            local_port: None,
            remote_port: None,
            remote_display: None,
        };

        match &self.setup {
            Setup::Local { listener, .. } => {
                ready.local_port = listener.local_addr().ok().map(|a| a.port());
            }
            Setup::X11 {
                command,
                display_name,
                target,
            } => {
                let channel = self
                    .link
                    .call(|t| t.open_session())
                    .map_err(|e| Error::channel("Failed to open channel", e))?;
                self.x11_channel = Some(channel);

                let auth = match &self.options.x11_auth {
                    Some(auth) => auth.clone(),
                    None => XAuth::from_xauth(display_name)
                        .map_err(|e| Error::channel("Failed to read the X11 cookie", e))?,
                };
                let request = X11Request {
                    single_connection: true,
                    protocol: if auth.protocol.is_empty() {
                        X11_PROTOCOL.to_string()
                    } else {
                        auth.protocol
                    },
                    cookie: auth.cookie,
                    screen: target.screen(),
                };
                self.link
                    .call(|t| t.request_x11(channel, &request))
                    .map_err(|e| Error::channel("Failed to open channel", e))?;
                self.link
                    .call(|t| t.request_exec(channel, command))
                    .map_err(|e| {
                        Error::channel(format!("Failed to execute {} on SSH server", command), e)
                    })?;
                info!(%command, "X11 command started");
            }
            Setup::DynamicRemote { bind_localhost, .. } => {
                let address = bind_localhost.then(|| "localhost".to_string());
                let mut last_error = None;
                for display_num in XPORT_DISPLAYS {
                    let port = X_PORT_BASE + display_num;
                    match self
                        .link
                        .call(|t| t.listen_forward(address.as_deref(), port))
                    {
                        Ok(_) => {
                            info!(remote_display = display_num, port, "remote X port listening");
                            self.listening = Some(RemoteListen { address, port });
                            ready.remote_port = Some(port);
                            ready.remote_display = Some(display_num);
                            break;
                        }
                        Err(e) => {
                            debug!(port, error = %e, "remote X port unavailable");
                            last_error = Some(e);
                        }
                    }
                }
                if self.listening.is_none() {
                    let reason = last_error.map(|e| e.to_string()).unwrap_or_default();
                    return Err(Error::forwarding("Failed to request port forwarding", reason));
                }
            }
            Setup::Reverse {
                remote_port,
                local_port,
            } => {
                let remote_port = *remote_port;
                let bound = self
                    .link
                    .call(|t| t.listen_forward(None, remote_port))
                    .map_err(|e| Error::forwarding("Failed to request port forwarding", e))?;
                info!(remote_port = bound, local_port, "reverse forward listening");
                self.listening = Some(RemoteListen {
                    address: None,
                    port: bound,
                });
                ready.remote_port = Some(bound);
                ready.local_port = Some(*local_port);
            }
        }
        Ok(ready)
    }

    /// Wait for the first connection of a relay round.
    ///
    /// Returns `Ok(false)` when the tunnel was stopped while waiting.
    fn first_connection(&mut self) -> Result<bool> {
        if let Setup::Local {
            listener,
            dest_host,
            dest_port,
        } = &self.setup
        {
            listener.set_nonblocking(false)?;
            loop {
                match listener.accept() {
                    Ok((stream, peer)) => {
                        if !self.shared.is_running() {
                            return Ok(false);
                        }
                        let channel = open_forward(&self.link, dest_host, *dest_port, peer)?;
                        stream.set_nonblocking(true)?;
                        debug!(%channel, %peer, "local connection forwarded");
                        self.pairs.push(channel, LocalStream::Tcp(stream));
                        return Ok(true);
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(_) if !self.shared.is_running() => return Ok(false),
                    Err(e) => return Err(Error::resource("Failed to accept local connection", e)),
                }
            }
        }

        let deadline = Instant::now() + self.options.first_connection_timeout;
        loop {
            if !self.shared.is_running() {
                return Ok(false);
            }
            match self.accept_remote() {
                Accept::Accepted => break,
                Accept::Failed(e) => return Err(e),
                Accept::Nothing => {}
            }
            if Instant::now() >= deadline {
                return Err(Error::NoResponse);
            }
            thread::sleep(ACCEPT_SLEEP);
        }

        if self.kind == TunnelKind::Reverse {
            if let Some(listen) = self.listening.take() {
                let address = listen.address.as_deref();
                if let Err(e) = self.link.call(|t| t.cancel_forward(address, listen.port)) {
                    debug!(port = listen.port, error = %e, "failed to cancel reverse forward");
                }
            }
        }
        Ok(true)
    }

    /// Take one inbound channel and connect its local end.
    fn accept_remote(&mut self) -> Accept {
        let accepted = match self.kind {
            TunnelKind::X11 => self.link.call(|t| t.accept_x11()),
            _ => self
                .link
                .call(|t| t.accept_forward())
                .map(|c| c.map(|(channel, _)| channel)),
        };
        let channel = match accepted {
            Ok(Some(channel)) => channel,
            Ok(None) => return Accept::Nothing,
            Err(e) => return Accept::Failed(Error::channel("Failed to accept channel", e)),
        };

        let socket = match &self.setup {
            Setup::Reverse { local_port, .. } => TcpStream::connect(("127.0.0.1", *local_port))
                .map(LocalStream::Tcp)
                .map_err(|e| {
                    Error::resource(format!("Cannot connect to local port {}.", local_port), e)
                }),
            Setup::X11 { target, .. } | Setup::DynamicRemote { target, .. } => target
                .connect()
                .map_err(|e| Error::resource("Cannot connect to the local X display", e)),
            Setup::Local { .. } => return Accept::Nothing,
        };

        match socket.and_then(|s| {
            s.set_nonblocking(true)?;
            Ok(s)
        }) {
            Ok(socket) => {
                debug!(%channel, "inbound channel relayed");
                self.pairs.push(channel, socket);
                Accept::Accepted
            }
            Err(e) => {
                let _ = self.link.call(|t| {
                    t.close_channel(channel);
                    Ok(())
                });
                Accept::Failed(e)
            }
        }
    }

    fn relay(&mut self) -> Result<()> {
        let mut last_accept = Instant::now();

        while self.shared.is_running() {
            match self.kind {
                TunnelKind::LocalForward => self.accept_local(),
                TunnelKind::X11 | TunnelKind::DynamicRemote => {
                    if last_accept.elapsed() >= self.options.accept_interval {
                        last_accept = Instant::now();
                        self.accept_pending();
                    }
                }
                TunnelKind::Reverse => {}
            }

            if self.pairs.is_empty() {
                break;
            }

            let readiness = {
                let fds = self.pairs.fds();
                let channels = self.pairs.channels();
                select::wait(
                    &self.link,
                    &fds,
                    &channels,
                    &[StreamKind::Regular],
                    self.options.wait_timeout,
                )
            };
            let readiness = match readiness {
                Ok(readiness) => readiness,
                Err(transport::TransportError::Io(e)) if e.kind() == io::ErrorKind::Interrupted => {
                    continue;
                }
                Err(e) => return Err(Error::channel("Failed to wait for tunnel activity", e)),
            };
            if !self.shared.is_running() {
                break;
            }

            self.socket_to_channel(&readiness.sockets);
            self.channel_to_socket();
            for pair in self.pairs.sweep() {
                close_pair(&self.link, pair);
            }
        }
        Ok(())
    }

    /// Take every queued local connection without blocking.
    fn accept_local(&mut self) {
        let Setup::Local {
            listener,
            dest_host,
            dest_port,
        } = &self.setup
        else {
            return;
        };
        if let Err(e) = listener.set_nonblocking(true) {
            warn!(error = %e, "failed to make the local listener nonblocking");
            return;
        }

        loop {
            match listener.accept() {
                Ok((stream, peer)) => match open_forward(&self.link, dest_host, *dest_port, peer) {
                    Ok(channel) => {
                        if let Err(e) = stream.set_nonblocking(true) {
                            warn!(error = %e, "dropping local connection");
                            let _ = self.link.call(|t| {
                                t.close_channel(channel);
                                Ok(())
                            });
                            continue;
                        }
                        debug!(%channel, %peer, "local connection forwarded");
                        self.pairs.push(channel, LocalStream::Tcp(stream));
                    }
                    Err(e) => {
                        let e = self.link.fail(e);
                        warn!(%peer, error = %e, "dropping local connection");
                    }
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "accept on the local listener failed");
                    break;
                }
            }
        }
    }

    fn accept_pending(&mut self) {
        loop {
            match self.accept_remote() {
                Accept::Accepted => continue,
                Accept::Nothing => break,
                Accept::Failed(e) => {
                    let e = self.link.fail(e);
                    warn!(error = %e, "dropping inbound channel");
                    break;
                }
            }
        }
    }

    /// Move everything readable from local sockets into their channels.
    fn socket_to_channel(&mut self, readable: &[bool]) {
        for (pair, ready) in self.pairs.iter_mut().zip(readable) {
            if !*ready || pair.disconnected {
                continue;
            }
            loop {
                match pair.socket.read(&mut self.buffer) {
                    Ok(0) => {
                        debug!(channel = %pair.channel, "local end closed");
                        pair.disconnected = true;
                        break;
                    }
                    Ok(n) => {
                        if let Err(e) = write_all(&self.link, pair.channel, &self.buffer[..n]) {
                            self.link
                                .fail(Error::channel("Failed to write to the SSH channel", e));
                            pair.disconnected = true;
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        self.link
                            .fail(Error::resource("Failed to read from the tunnel socket", e));
                        pair.disconnected = true;
                        break;
                    }
                }
            }
        }
    }

    /// Fill empty pending buffers from channels and flush them to sockets.
    ///
    /// A pair with output still pending is not read from, so a slow local
    /// reader holds back its own channel only.
    fn channel_to_socket(&mut self) {
        for pair in self.pairs.iter_mut() {
            if pair.disconnected {
                continue;
            }
            if pair.pending.is_none() {
                let channel = pair.channel;
                match self.link.call(|t| t.poll(channel, StreamKind::Regular)) {
                    Ok(ChannelPoll::Empty) => {}
                    Ok(ChannelPoll::Ready(len)) => {
                        let mut data = vec![0; len];
                        match self
                            .link
                            .call(|t| t.read_nonblocking(channel, StreamKind::Regular, &mut data))
                        {
                            Ok(0) => {}
                            Ok(n) => {
                                data.truncate(n);
                                pair.pending = Some(PendingOutput::new(data));
                            }
                            Err(e) => {
                                self.link
                                    .fail(Error::channel("Failed to read from the SSH channel", e));
                                pair.disconnected = true;
                                continue;
                            }
                        }
                    }
                    Ok(ChannelPoll::Eof) => {
                        debug!(%channel, "remote end closed");
                        pair.disconnected = true;
                        continue;
                    }
                    Err(e) => {
                        self.link
                            .fail(Error::channel("Failed to poll the SSH channel", e));
                        pair.disconnected = true;
                        continue;
                    }
                }
            }

            if let Some(pending) = pair.pending.as_mut() {
                match pending.flush_into(&mut pair.socket) {
                    Ok(true) => pair.pending = None,
                    Ok(false) => {}
                    Err(e) => {
                        debug!(channel = %pair.channel, error = %e, "local write failed");
                        pair.disconnected = true;
                    }
                }
            }
        }
    }
}

fn open_forward(
    link: &SessionLink,
    dest_host: &str,
    dest_port: u16,
    peer: SocketAddr,
) -> Result<ChannelId> {
    let origin = peer.ip().to_string();
    link.call(|t| t.open_forward(dest_host, dest_port, &origin, peer.port()))
        .map_err(|e| Error::channel("Failed to connect to the SSH tunnel destination", e))
}

fn write_all(link: &SessionLink, channel: ChannelId, mut data: &[u8]) -> transport::Result<()> {
    while !data.is_empty() {
        let n = link.call(|t| t.write(channel, data))?;
        if n == 0 {
            return Err(io::Error::from(io::ErrorKind::WriteZero).into());
        }
        data = &data[n..];
    }
    Ok(())
}

fn close_pair(link: &SessionLink, pair: Pair<LocalStream>) {
    let channel = pair.channel;
    let _ = link.call(|t| {
        t.close_channel(channel);
        Ok(())
    });
    debug!(%channel, "tunnel pair closed");
}
