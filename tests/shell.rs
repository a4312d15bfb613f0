// ABOUTME: Shell bridge tests: pty relay between a local terminal and a remote session channel.
// ABOUTME: The test plays the terminal on the pty master and the server through the in-memory remote.

mod support;

use sshplex::dispatch::OwnerQueue;
use sshplex::shell::ShellBridge;
use sshplex::ssh::{Error, SessionConfig};
use std::fs::File;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, mpsc};
use std::time::{Duration, Instant};
use support::memory::{ChannelKind, Remote};
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    remote: Remote,
    bridge: ShellBridge,
    queue: OwnerQueue,
    exits: Arc<AtomicUsize>,
    _dir: TempDir,
}

impl Harness {
    fn open(command: Option<&str>) -> Self {
        Self::open_on(Remote::new(), command)
    }

    fn open_on(remote: Remote, command: Option<&str>) -> Self {
        let dir = TempDir::new().unwrap();
        let mut bridge = ShellBridge::new(support::ready_session(&remote, dir.path()));
        if let Some(command) = command {
            bridge = bridge.with_command(command);
        }
        let queue = OwnerQueue::new();
        let exits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&exits);
        bridge
            .open(queue.poster(), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert!(remote.wait_for(WAIT, |s| !s.ptys.is_empty()));
        Self {
            remote,
            bridge,
            queue,
            exits,
            _dir: dir,
        }
    }

    fn channel(&self) -> sshplex::transport::ChannelId {
        self.remote.channels_of(ChannelKind::Session)[0]
    }

    fn terminal(&self) -> File {
        self.bridge.terminal().unwrap()
    }

    fn wait_exit(&mut self) -> bool {
        drain_until_exit(&mut self.queue, &self.exits)
    }
}

/// Drain the owner queue until the exit callback has run or time runs out.
fn drain_until_exit(queue: &mut OwnerQueue, exits: &AtomicUsize) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        queue.run_pending();
        if exits.load(Ordering::SeqCst) > 0 {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

fn read_n(terminal: &mut File, n: usize) -> Vec<u8> {
    let mut buf = vec![0; n];
    terminal.read_exact(&mut buf).unwrap();
    buf
}

/// Test: Open an interactive shell.
/// Expected: An 80x24 xterm pty is requested, then a shell.
#[test]
fn interactive_shell_requests_pty_and_shell() {
    support::init_tracing();
    let harness = Harness::open(None);

    assert!(harness.remote.wait_for(WAIT, |s| s.shell_requests == 1));
    harness.remote.inspect(|s| {
        assert_eq!(s.ptys, vec![("xterm".to_string(), 80, 24)]);
        assert!(s.exec_commands.is_empty());
    });
    assert!(!harness.bridge.is_closed());
    assert!(harness.bridge.master().is_some());
}

/// Test: Open a bridge with a remote command.
/// Expected: The command is executed instead of a shell.
#[test]
fn command_is_executed() {
    let harness = Harness::open(Some("top -b"));

    assert!(
        harness
            .remote
            .wait_for(WAIT, |s| s.exec_commands == vec!["top -b".to_string()])
    );
    harness.remote.inspect(|s| assert_eq!(s.shell_requests, 0));
}

/// Test: An empty command.
/// Expected: Treated as an interactive shell.
#[test]
fn empty_command_means_shell() {
    let harness = Harness::open(Some(""));
    assert!(harness.remote.wait_for(WAIT, |s| s.shell_requests == 1));
}

/// Test: Keystrokes typed into the terminal.
/// Expected: They reach the remote channel byte for byte.
#[test]
fn terminal_input_reaches_the_server() {
    let harness = Harness::open(None);
    let channel = harness.channel();
    let mut terminal = harness.terminal();

    terminal.write_all(b"ls -l\r").unwrap();

    assert!(
        harness
            .remote
            .wait_for(WAIT, |s| s.channels[&channel].received == b"ls -l\r")
    );
}

/// Test: The server writes to stderr and stdout.
/// Expected: Both appear on the terminal unchanged.
#[test]
fn server_output_reaches_the_terminal() {
    let harness = Harness::open(None);
    let channel = harness.channel();
    let mut terminal = harness.terminal();

    harness.remote.send_stderr(channel, b"warning\n");
    assert_eq!(read_n(&mut terminal, 8), b"warning\n");

    harness.remote.send(channel, b"total 0\r\n");
    assert_eq!(read_n(&mut terminal, 9), b"total 0\r\n");
}

/// Test: A burst larger than the initial relay buffer.
/// Expected: Delivered whole.
#[test]
fn large_output_is_not_truncated() {
    let harness = Harness::open(None);
    let channel = harness.channel();
    let mut terminal = harness.terminal();

    let burst: Vec<u8> = (0..3000u32).map(|i| b'a' + (i % 26) as u8).collect();
    harness.remote.send(channel, &burst);

    assert!(read_n(&mut terminal, burst.len()) == burst);
}

/// Test: Resize the terminal while the shell runs.
/// Expected: The new size reaches the remote pty.
#[test]
fn resize_is_forwarded() {
    let harness = Harness::open(None);

    harness.bridge.set_size(132, 43).unwrap();

    harness
        .remote
        .inspect(|s| assert_eq!(s.resizes, vec![(132, 43)]));
}

/// Test: Resize before the bridge is open.
/// Expected: Invalid argument.
#[test]
fn resize_before_open_fails() {
    let dir = TempDir::new().unwrap();
    let remote = Remote::new();
    let bridge = ShellBridge::new(support::ready_session(&remote, dir.path()));

    let err = bridge.set_size(100, 30).unwrap_err();
    assert!(err.to_string().contains("shell channel is not open"));
}

/// Test: The remote shell exits.
/// Expected: The exit callback runs once on the owner's queue; the channel is closed.
#[test]
fn remote_exit_notifies_owner() {
    let mut harness = Harness::open(None);
    let channel = harness.channel();

    harness.remote.send(channel, b"logout\r\n");
    harness.remote.send_eof(channel);

    assert!(harness.wait_exit());
    assert!(harness.bridge.is_closed());
    assert!(harness.remote.is_closed(channel));

    harness.bridge.close();
    harness.queue.run_pending();
    assert_eq!(harness.exits.load(Ordering::SeqCst), 1);
}

/// Test: The owner closes the bridge while the shell runs.
/// Expected: The worker stops, the channel is closed and the callback still runs once.
#[test]
fn owner_close_stops_worker() {
    let mut harness = Harness::open(None);
    let channel = harness.channel();

    harness.bridge.close();

    assert!(harness.bridge.is_closed());
    assert!(harness.bridge.master().is_none());
    assert!(harness.remote.is_closed(channel));
    assert!(harness.wait_exit());
    assert_eq!(harness.exits.load(Ordering::SeqCst), 1);
}

/// Test: The owner closes the bridge while a large burst sits unread on the terminal.
/// Expected: Close still returns promptly and the exit callback runs once.
#[test]
fn close_with_unread_output_returns() {
    let harness = Harness::open(None);
    let channel = harness.channel();
    let Harness {
        remote,
        mut bridge,
        mut queue,
        exits,
        _dir,
    } = harness;

    remote.send(channel, &vec![b'y'; 1_000_000]);
    assert!(remote.wait_for(WAIT, |s| s.channels[&channel].regular.is_empty()));

    let (done, closed) = mpsc::channel();
    std::thread::spawn(move || {
        bridge.close();
        let _ = done.send(bridge.is_closed());
    });

    assert_eq!(closed.recv_timeout(WAIT), Ok(true));
    assert!(remote.is_closed(channel));
    assert!(drain_until_exit(&mut queue, &exits));
    assert_eq!(exits.load(Ordering::SeqCst), 1);
}

/// Test: The server refuses the remote command.
/// Expected: The failure is recorded and the exit callback runs; the channel is closed.
#[test]
fn refused_command_ends_the_bridge() {
    let mut harness = Harness::open_on(Remote::with(|s| s.refuse_exec = true), Some("top -b"));
    let channel = harness.channel();

    assert!(harness.wait_exit());
    assert!(harness.bridge.is_closed());
    assert!(harness.remote.is_closed(channel));
    assert_eq!(
        harness.bridge.session().last_error().as_deref(),
        Some("Failed to execute top -b on SSH server: exec request refused by the server")
    );
}

/// Test: Open a bridge on a connected session that has not authenticated.
/// Expected: Invalid argument; no channel is opened.
#[test]
fn unauthenticated_session_is_refused() {
    let dir = TempDir::new().unwrap();
    let remote = Remote::new();
    let mut session = support::session(&remote, dir.path(), SessionConfig::new("server.test"));
    session.connect().unwrap();
    let mut bridge = ShellBridge::new(session);

    let err = bridge.open(OwnerQueue::new().poster(), || {}).unwrap_err();

    assert!(matches!(err, Error::InvalidArgument(_)));
    assert!(remote.channels_of(ChannelKind::Session).is_empty());
}

/// Test: Open twice, or on a session that is not connected.
/// Expected: Invalid argument and NotConnected.
#[test]
fn open_preconditions() {
    let mut harness = Harness::open(None);
    let again = harness.bridge.open(harness.queue.poster(), || {});
    assert!(matches!(again, Err(Error::InvalidArgument(_))));

    let dir = TempDir::new().unwrap();
    let remote = Remote::new();
    let session = support::session(&remote, dir.path(), SessionConfig::new("server.test"));
    let mut bridge = ShellBridge::new(session);
    let err = bridge.open(OwnerQueue::new().poster(), || {}).unwrap_err();
    assert!(matches!(err, Error::NotConnected));
    assert_eq!(bridge.session().last_error(), Some(err.to_string()));
}
