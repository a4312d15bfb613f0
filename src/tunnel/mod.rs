// ABOUTME: Tunnel multiplexer: relays N (local socket, remote channel) pairs on a worker thread.
// ABOUTME: Four topologies share one relay loop; only how pairs are created differs.

mod display;
mod pair;
mod relay;

pub use display::{X_PORT_BASE, XAuth, XDisplay};
pub use pair::{LocalStream, PendingOutput};

use crate::ssh::{Error, Result, Session};
use relay::{Relay, RemoteListen, Setup};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Relay buffer size for socket reads.
pub const BUFFER_SIZE: usize = 10240;
/// Display numbers scanned by a dynamic remote forward.
pub const XPORT_DISPLAYS: std::ops::RangeInclusive<u16> = 10..=99;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelKind {
    /// Local listener; each connection gets a forward channel to a fixed destination.
    LocalForward,
    /// X11 channels from a remote command are relayed to the local X display.
    X11,
    /// The server listens on the first free X port; connections go to the local display.
    DynamicRemote,
    /// The server listens on one port; a single connection goes to a local port.
    Reverse,
}

impl TunnelKind {
    fn label(self) -> &'static str {
        match self {
            TunnelKind::LocalForward => "local",
            TunnelKind::X11 => "x11",
            TunnelKind::DynamicRemote => "xport",
            TunnelKind::Reverse => "reverse",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TunnelState {
    Idle = 0,
    SettingUp = 1,
    Relaying = 2,
    Draining = 3,
    Closed = 4,
}

impl TunnelState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => TunnelState::SettingUp,
            2 => TunnelState::Relaying,
            3 => TunnelState::Draining,
            4 => TunnelState::Closed,
            _ => TunnelState::Idle,
        }
    }
}

/// Parameters reported once setup has completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelReady {
    pub kind: TunnelKind,
    /// Bound local port (local forward) or target local port (reverse).
    pub local_port: Option<u16>,
    /// Port the server listens on (dynamic and reverse forwards).
    pub remote_port: Option<u16>,
    /// X display number on the server (dynamic forward).
    pub remote_display: Option<u16>,
}

/// Lifecycle callbacks, invoked on the tunnel's worker thread.
pub trait TunnelObserver: Send + Sync {
    /// Setup finished. Returning false tears the tunnel down.
    fn on_ready(&self, _ready: &TunnelReady) -> bool {
        true
    }

    /// The first connection is being relayed.
    fn on_connect(&self) {}

    /// The worker is exiting; `error` is set when it failed.
    fn on_teardown(&self, _error: Option<&str>) {}
}

/// Observer that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoObserver;

impl TunnelObserver for NoObserver {}

#[derive(Debug, Clone)]
pub struct TunnelOptions {
    /// How long remote topologies wait for their first inbound connection.
    pub first_connection_timeout: Duration,
    /// How often remote topologies check for further inbound connections.
    pub accept_interval: Duration,
    /// Upper bound of one combined wait in the relay loop.
    pub wait_timeout: Duration,
    /// X11 cookie to send instead of asking `xauth`.
    pub x11_auth: Option<XAuth>,
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            first_connection_timeout: Duration::from_secs(15),
            accept_interval: Duration::from_millis(200),
            wait_timeout: Duration::from_millis(200),
            x11_auth: None,
        }
    }
}

/// State shared between a tunnel and its worker.
#[derive(Debug, Default)]
pub(crate) struct Shared {
    state: AtomicU8,
    running: AtomicBool,
}

impl Shared {
    pub(crate) fn state(&self) -> TunnelState {
        TunnelState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: TunnelState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// A tunnel over an authenticated session.
pub struct Tunnel {
    session: Session,
    options: TunnelOptions,
    kind: Option<TunnelKind>,
    shared: Arc<Shared>,
    /// Address of the local listener, used to wake its blocking accept.
    listener_addr: Option<SocketAddr>,
    worker: Option<JoinHandle<Option<RemoteListen>>>,
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("kind", &self.kind)
            .field("state", &self.state())
            .field("listener_addr", &self.listener_addr)
            .finish_non_exhaustive()
    }
}

impl Tunnel {
    pub fn new(session: Session) -> Self {
        Self::with_options(session, TunnelOptions::default())
    }

    pub fn with_options(session: Session, options: TunnelOptions) -> Self {
        Self {
            session,
            options,
            kind: None,
            shared: Arc::new(Shared::default()),
            listener_addr: None,
            worker: None,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn kind(&self) -> Option<TunnelKind> {
        self.kind
    }

    pub fn state(&self) -> TunnelState {
        self.shared.state()
    }

    /// Whether the worker has finished, naturally or after `close`.
    pub fn is_terminated(&self) -> bool {
        self.state() == TunnelState::Closed
    }

    /// Listen on 127.0.0.1:`local_port` (0 picks a free port) and forward every
    /// connection to `dest_host:dest_port` through the server.
    ///
    /// Returns the bound local port. The worker blocks until the first connection.
    pub fn open_local(
        &mut self,
        dest_host: &str,
        dest_port: u16,
        local_port: u16,
        observer: Arc<dyn TunnelObserver>,
    ) -> Result<u16> {
        self.check_startable()?;
        if dest_host.is_empty() {
            return Err(self.fail(Error::InvalidArgument(
                "tunnel destination host is empty".into(),
            )));
        }

        let listener = TcpListener::bind(("127.0.0.1", local_port))
            .map_err(|e| self.fail(Error::resource("Failed to bind on local port", e)))?;
        let addr = listener
            .local_addr()
            .map_err(|e| self.fail(Error::resource("Failed to bind on local port", e)))?;

        self.listener_addr = Some(addr);
        self.spawn(
            TunnelKind::LocalForward,
            Setup::Local {
                listener,
                dest_host: dest_host.to_string(),
                dest_port,
            },
            observer,
        )?;
        Ok(addr.port())
    }

    /// Run `command` on the server with X11 forwarding to the local `display`.
    pub fn open_x11(
        &mut self,
        command: &str,
        display: &str,
        observer: Arc<dyn TunnelObserver>,
    ) -> Result<()> {
        self.check_startable()?;
        let target = XDisplay::parse(display).map_err(|e| self.fail(Error::InvalidArgument(e)))?;
        self.spawn(
            TunnelKind::X11,
            Setup::X11 {
                command: command.to_string(),
                display_name: display.to_string(),
                target,
            },
            observer,
        )
    }

    /// Ask the server to listen on the first free X port and relay its
    /// connections to the local `display`. The chosen display is reported
    /// through `on_ready`.
    pub fn open_xport(
        &mut self,
        display: &str,
        bind_localhost: bool,
        observer: Arc<dyn TunnelObserver>,
    ) -> Result<()> {
        self.check_startable()?;
        let target = XDisplay::parse(display).map_err(|e| self.fail(Error::InvalidArgument(e)))?;
        self.spawn(
            TunnelKind::DynamicRemote,
            Setup::DynamicRemote {
                target,
                bind_localhost,
            },
            observer,
        )
    }

    /// Ask the server to listen on `remote_port` and relay exactly one
    /// connection to 127.0.0.1:`local_port`.
    pub fn open_reverse(
        &mut self,
        remote_port: u16,
        local_port: u16,
        observer: Arc<dyn TunnelObserver>,
    ) -> Result<()> {
        self.check_startable()?;
        self.spawn(
            TunnelKind::Reverse,
            Setup::Reverse {
                remote_port,
                local_port,
            },
            observer,
        )
    }

    fn fail(&self, err: Error) -> Error {
        self.session.link().fail(err)
    }

    fn check_startable(&self) -> Result<()> {
        if self.kind.is_some() {
            return Err(self.fail(Error::InvalidArgument("tunnel already started".into())));
        }
        if !self.session.is_connected() {
            return Err(self.fail(Error::NotConnected));
        }
        if !self.session.is_authenticated() {
            return Err(self.fail(Error::InvalidArgument(
                "session is not authenticated".into(),
            )));
        }
        Ok(())
    }

    fn spawn(
        &mut self,
        kind: TunnelKind,
        setup: Setup,
        observer: Arc<dyn TunnelObserver>,
    ) -> Result<()> {
        self.kind = Some(kind);
        self.shared.running.store(true, Ordering::SeqCst);
        self.shared.set_state(TunnelState::SettingUp);

        let relay = Relay::new(
            kind,
            setup,
            Arc::clone(self.session.link()),
            Arc::clone(&self.shared),
            observer,
            self.options.clone(),
        );
        let spawned = thread::Builder::new()
            .name(format!("tunnel-{}", kind.label()))
            .spawn(move || relay.run());

        match spawned {
            Ok(handle) => {
                tracing::info!(kind = kind.label(), "tunnel worker started");
                self.worker = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.shared.running.store(false, Ordering::SeqCst);
                self.shared.set_state(TunnelState::Closed);
                Err(self.fail(Error::resource("Failed to start the tunnel worker thread", e)))
            }
        }
    }

    /// Stop the worker, release every pair and cancel remote listening.
    pub fn close(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        self.shared.running.store(false, Ordering::SeqCst);

        if let Some(addr) = self.listener_addr.take() {
            // Wakes a worker parked in the blocking first accept.
            let _ = TcpStream::connect_timeout(&addr, Duration::from_secs(1));
        }

        let listen = worker.join().unwrap_or_else(|_| {
            tracing::warn!("tunnel worker panicked");
            None
        });

        if let Some(listen) = listen {
            let address = listen.address.as_deref();
            if let Err(e) = self
                .session
                .link()
                .call(|t| t.cancel_forward(address, listen.port))
            {
                tracing::debug!(port = listen.port, error = %e, "failed to cancel remote listening");
            }
        }

        self.shared.set_state(TunnelState::Closed);
        tracing::info!("tunnel closed");
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.close();
    }
}
