// ABOUTME: Shell bridge: relays one remote shell or exec channel to a local pseudo-terminal.
// ABOUTME: The worker owns the raw pty slave; the owner reads and writes the master side.

mod pty;

pub use pty::{PtyPair, open_raw, set_nonblocking};

use crate::dispatch::Poster;
use crate::ssh::{Error, Result, Session, SessionLink};
use crate::transport::select::{self, Watch};
use crate::transport::{self, ChannelId, ChannelPoll, StreamKind};
use crate::tunnel::PendingOutput;
use parking_lot::Mutex;
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

const TERM: &str = "xterm";
const INITIAL_COLS: u32 = 80;
const INITIAL_ROWS: u32 = 24;
const INITIAL_BUFFER: usize = 1000;
const WAIT_TIMEOUT: Duration = Duration::from_secs(1);

type ExitCallback = Box<dyn FnOnce() + Send>;

/// State shared with the worker.
#[derive(Default)]
struct ShellShared {
    closed: AtomicBool,
    channel: Mutex<Option<ChannelId>>,
}

/// A remote shell presented as a local terminal.
pub struct ShellBridge {
    session: Session,
    command: Option<String>,
    shared: Arc<ShellShared>,
    master: Option<OwnedFd>,
    worker: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for ShellBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellBridge")
            .field("command", &self.command)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl ShellBridge {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            command: None,
            shared: Arc::new(ShellShared::default()),
            master: None,
            worker: None,
        }
    }

    /// Run `command` instead of an interactive shell. Empty means a shell.
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        let command = command.into();
        self.command = (!command.is_empty()).then_some(command);
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Allocate the pty and start the worker.
    ///
    /// `on_exit` is posted to `poster` once, when the worker ends.
    pub fn open(
        &mut self,
        poster: Poster,
        on_exit: impl FnOnce() + Send + 'static,
    ) -> Result<()> {
        if self.worker.is_some() {
            return Err(self.fail(Error::InvalidArgument("shell already open".into())));
        }
        if !self.session.is_connected() {
            return Err(self.fail(Error::NotConnected));
        }
        if !self.session.is_authenticated() {
            return Err(self.fail(Error::InvalidArgument(
                "session is not authenticated".into(),
            )));
        }

        let pty = open_raw()
            .and_then(|pty| set_nonblocking(&pty.slave).map(|()| pty))
            .map_err(|e| self.fail(Error::resource("Failed to create pty device.", e)))?;

        let worker = ShellWorker {
            link: Arc::clone(self.session.link()),
            shared: Arc::clone(&self.shared),
            command: self.command.clone(),
            slave: pty.slave,
            poster,
            on_exit: Some(Box::new(on_exit)),
        };
        self.shared.closed.store(false, Ordering::SeqCst);
        let handle = thread::Builder::new()
            .name("shell".into())
            .spawn(move || worker.run())
            .map_err(|e| self.fail(Error::resource("Failed to start the shell worker thread", e)))?;

        self.master = Some(pty.master);
        self.worker = Some(handle);
        Ok(())
    }

    /// Master side of the pty, for the terminal that displays the shell.
    pub fn master(&self) -> Option<BorrowedFd<'_>> {
        self.master.as_ref().map(|fd| fd.as_fd())
    }

    /// A file handle on the pty master.
    pub fn terminal(&self) -> Result<File> {
        let master = self
            .master
            .as_ref()
            .ok_or_else(|| Error::InvalidArgument("shell is not open".into()))?;
        Ok(File::from(master.try_clone()?))
    }

    /// Forward a terminal resize to the remote pty.
    pub fn set_size(&self, cols: u32, rows: u32) -> Result<()> {
        let channel = *self.shared.channel.lock();
        let channel = channel
            .ok_or_else(|| self.fail(Error::InvalidArgument("shell channel is not open".into())))?;
        self.session
            .link()
            .call(|t| t.change_pty_size(channel, cols, rows))
            .map_err(|e| self.fail(Error::channel("Failed to change the pty size", e)))?;
        debug!(cols, rows, "remote pty resized");
        Ok(())
    }

    /// Stop the worker and release the channel and the pty.
    pub fn close(&mut self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("shell worker panicked");
            }
        }
        if let Some(channel) = self.shared.channel.lock().take() {
            let _ = self.session.link().call(|t| {
                t.close_channel(channel);
                Ok(())
            });
        }
        self.master = None;
    }

    fn fail(&self, err: Error) -> Error {
        self.session.link().fail(err)
    }
}

impl Drop for ShellBridge {
    fn drop(&mut self) {
        self.close();
    }
}

struct ShellWorker {
    link: Arc<SessionLink>,
    shared: Arc<ShellShared>,
    command: Option<String>,
    slave: File,
    poster: Poster,
    on_exit: Option<ExitCallback>,
}

impl ShellWorker {
    fn run(mut self) {
        match self.start() {
            Ok(channel) => {
                info!(%channel, command = ?self.command, "shell started");
                if let Err(e) = self.relay(channel) {
                    let e = self.link.fail(e);
                    debug!(error = %e, "shell relay ended");
                }
            }
            Err(e) => {
                let e = self.link.fail(e);
                warn!(error = %e, "shell setup failed");
            }
        }

        self.shared.closed.store(true, Ordering::SeqCst);
        if let Some(channel) = self.shared.channel.lock().take() {
            let _ = self.link.call(|t| {
                t.close_channel(channel);
                Ok(())
            });
        }
        if let Some(on_exit) = self.on_exit.take() {
            if !self.poster.post(on_exit) {
                debug!("shell owner is gone, exit notice dropped");
            }
        }
    }

    fn start(&self) -> Result<ChannelId> {
        let channel = self
            .link
            .call(|t| t.open_session())
            .map_err(|e| Error::channel("Failed to open channel", e))?;
        *self.shared.channel.lock() = Some(channel);

        self.link
            .call(|t| t.request_pty(channel, TERM, INITIAL_COLS, INITIAL_ROWS))
            .map_err(|e| Error::channel("Failed to request pty", e))?;
        match &self.command {
            Some(command) => self
                .link
                .call(|t| t.request_exec(channel, command))
                .map_err(|e| {
                    Error::channel(format!("Failed to execute {} on SSH server", command), e)
                })?,
            None => self
                .link
                .call(|t| t.request_shell(channel))
                .map_err(|e| Error::channel("Failed to request shell", e))?,
        }
        Ok(channel)
    }

    fn relay(&mut self, channel: ChannelId) -> Result<()> {
        let mut buffer = vec![0u8; INITIAL_BUFFER];
        // Channel output the terminal has not taken yet; the channel is not read meanwhile.
        let mut pending: Option<PendingOutput> = None;

        while !self.shared.closed.load(Ordering::SeqCst) {
            let watch = Watch {
                fd: self.slave.as_fd(),
                writable: pending.is_some(),
            };
            let single = [channel];
            let channels: &[ChannelId] = if pending.is_some() { &[] } else { &single };
            let readiness = select::wait_watches(
                &self.link,
                &[watch],
                channels,
                &[StreamKind::Regular, StreamKind::Extended],
                WAIT_TIMEOUT,
            )
            .map_err(|e| Error::channel("Failed to wait for shell activity", e))?;
            if self.shared.closed.load(Ordering::SeqCst) {
                break;
            }

            if let Some(out) = pending.as_mut() {
                if out
                    .flush_into(&mut self.slave)
                    .map_err(|e| Error::resource("Failed to write to the pty", e))?
                {
                    pending = None;
                }
            }

            if readiness.sockets.first().copied().unwrap_or(false) {
                match self.slave.read(&mut buffer) {
                    Ok(0) => return Ok(()),
                    Ok(n) => write_channel(&self.link, channel, &buffer[..n])
                        .map_err(|e| Error::channel("Failed to write to the SSH channel", e))?,
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                        ) => {}
                    // EIO once the master side is closed.
                    Err(e) => return Err(Error::resource("Failed to read from the pty", e)),
                }
            }

            if pending.is_none() && readiness.channels.first().copied().unwrap_or(false) {
                let mut eof = false;
                for kind in [StreamKind::Regular, StreamKind::Extended] {
                    if pending.is_some() {
                        break;
                    }
                    let len = match self
                        .link
                        .call(|t| t.poll(channel, kind))
                        .map_err(|e| Error::channel("Failed to poll the SSH channel", e))?
                    {
                        ChannelPoll::Empty => continue,
                        ChannelPoll::Eof => {
                            eof |= kind == StreamKind::Regular;
                            continue;
                        }
                        ChannelPoll::Ready(len) => len,
                    };
                    if len > buffer.len() {
                        buffer.resize(len, 0);
                    }
                    let n = self
                        .link
                        .call(|t| t.read_nonblocking(channel, kind, &mut buffer[..len]))
                        .map_err(|e| Error::channel("Failed to read from the SSH channel", e))?;
                    let mut out = PendingOutput::new(buffer[..n].to_vec());
                    if !out
                        .flush_into(&mut self.slave)
                        .map_err(|e| Error::resource("Failed to write to the pty", e))?
                    {
                        pending = Some(out);
                    }
                }
                if eof && pending.is_none() {
                    debug!(%channel, "remote shell closed");
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}

fn write_channel(link: &SessionLink, channel: ChannelId, mut data: &[u8]) -> transport::Result<()> {
    while !data.is_empty() {
        let n = link.call(|t| t.write(channel, data))?;
        if n == 0 {
            return Err(io::Error::from(io::ErrorKind::WriteZero).into());
        }
        data = &data[n..];
    }
    Ok(())
}
