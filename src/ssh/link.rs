// ABOUTME: Shared, mutex-guarded handle to a session's transport.
// ABOUTME: The lock is held for one transport call at a time, never across waits.

use super::error::Error;
use crate::transport::{Result as TransportResult, Transport, TransportError};
use parking_lot::Mutex;

/// Transport handle and last-error string shared by a session and its worker.
#[derive(Default)]
pub struct SessionLink {
    transport: Mutex<Option<Box<dyn Transport>>>,
    last_error: Mutex<Option<String>>,
}

impl SessionLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn install(&self, transport: Box<dyn Transport>) {
        *self.transport.lock() = Some(transport);
    }

    pub(crate) fn take(&self) -> Option<Box<dyn Transport>> {
        self.transport.lock().take()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.lock().is_some()
    }

    /// Run one transport call under the session mutex.
    pub fn call<T>(
        &self,
        f: impl FnOnce(&mut dyn Transport) -> TransportResult<T>,
    ) -> TransportResult<T> {
        let mut guard = self.transport.lock();
        match guard.as_mut() {
            Some(transport) => f(transport.as_mut()),
            None => Err(TransportError::NotConnected),
        }
    }

    /// Record `err` as the last error and hand it back.
    pub fn fail(&self, err: Error) -> Error {
        *self.last_error.lock() = Some(err.to_string());
        err
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }
}

impl std::fmt::Debug for SessionLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLink")
            .field("connected", &self.is_connected())
            .field("last_error", &self.last_error())
            .finish()
    }
}
