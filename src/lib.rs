// ABOUTME: Library root for sshplex - SSH sessions, tunnels and shell bridges.
// ABOUTME: Exposes the engine modules and the transport seam used by tests.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod sftp;
pub mod shell;
pub mod ssh;
pub mod transport;
pub mod tunnel;
