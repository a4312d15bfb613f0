// ABOUTME: Injected logging capability for transport diagnostics.
// ABOUTME: Sinks carry an explicit enabled state instead of a process-wide gate.

use std::sync::atomic::{AtomicBool, Ordering};
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Decides whether a transport diagnostic is wanted and records it.
pub trait LogSink: Send + Sync {
    fn enabled(&self) -> bool;
    fn log(&self, level: Level, message: &str);
}

/// Sink that forwards to `tracing` while enabled.
#[derive(Debug)]
pub struct TracingSink {
    enabled: AtomicBool,
}

impl TracingSink {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }
}

impl Default for TracingSink {
    fn default() -> Self {
        Self::new(true)
    }
}

impl LogSink for TracingSink {
    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn log(&self, level: Level, message: &str) {
        if !self.enabled() {
            return;
        }
        match level {
            Level::ERROR => tracing::error!("[SSH] {}", message),
            Level::WARN => tracing::warn!("[SSH] {}", message),
            Level::INFO => tracing::info!("[SSH] {}", message),
            Level::DEBUG => tracing::debug!("[SSH] {}", message),
            Level::TRACE => tracing::trace!("[SSH] {}", message),
        }
    }
}

/// Install a fmt subscriber: `debug` when verbose, `warn` otherwise.
///
/// Safe to call more than once; later calls are ignored.
pub fn init(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .ok();
}
