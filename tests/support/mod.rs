// ABOUTME: Test support utilities.
// ABOUTME: Provides the scripted in-memory server and session helpers for integration tests.

use sshplex::config::Preferences;
use sshplex::ssh::{HostKeyPrompt, NoPrompt, Session, SessionConfig};
use std::path::Path;
use std::sync::Once;
use std::time::{Duration, Instant};

// Each test binary only uses some of these modules, so allow dead_code.
#[allow(dead_code)]
pub mod memory;

use memory::Remote;

static TRACING_INIT: Once = Once::new();

/// Initialize tracing for tests. Safe to call multiple times.
#[allow(dead_code)]
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        use tracing_subscriber::EnvFilter;
        let filter = EnvFilter::from_default_env()
            .add_directive("sshplex=debug".parse().unwrap())
            .add_directive("russh=debug".parse().unwrap());
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Preferences that keep the user's real ~/.ssh/config out of tests.
#[allow(dead_code)]
pub fn test_preferences() -> Preferences {
    Preferences {
        ssh_parseconfig: false,
        ..Preferences::default()
    }
}

/// A session against `remote` whose known_hosts lives in `dir`.
#[allow(dead_code)]
pub fn session(remote: &Remote, dir: &Path, config: SessionConfig) -> Session {
    let config = config.known_hosts_path(dir.join("known_hosts"));
    Session::new(config, remote.connector()).with_preferences(test_preferences())
}

/// A connected, host-verified, password-authenticated session.
#[allow(dead_code)]
pub fn ready_session(remote: &Remote, dir: &Path) -> Session {
    init_tracing();
    let mut session = session(
        remote,
        dir,
        SessionConfig::new("server.test").user("tester"),
    );
    session.connect().unwrap();
    session
        .authenticate_with_prompts(Some("s3cret"), &|_: &HostKeyPrompt| true, &NoPrompt)
        .unwrap();
    assert!(session.is_authenticated());
    session
}

/// Poll `cond` until it holds or `timeout` passes.
#[allow(dead_code)]
pub fn eventually(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}
