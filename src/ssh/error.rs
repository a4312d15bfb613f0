// ABOUTME: SSH engine error types.
// ABOUTME: Each variant belongs to one failure kind: connectivity, authentication, trust, channel or resource.

use crate::transport::TransportError;
use thiserror::Error;

/// Coarse failure classes used to decide how far a failure propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Connectivity,
    Authentication,
    Trust,
    Channel,
    Resource,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{context}: {reason}")]
    Connection { context: String, reason: String },

    #[error("{context}: {reason}")]
    Authentication { context: String, reason: String },

    #[error("{context}: {reason}")]
    Trust { context: String, reason: String },

    #[error("{context}: {reason}")]
    Channel { context: String, reason: String },

    #[error("{context}: {reason}")]
    Forwarding { context: String, reason: String },

    #[error("{context}: {reason}")]
    Resource { context: String, reason: String },

    #[error("the server's host key was not accepted")]
    HostKeyRejected,

    #[error("host key has not been verified for this connection")]
    HostNotVerified,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("No response from the server.")]
    NoResponse,

    #[error("not connected")]
    NotConnected,

    #[error("SSH key error: {0}")]
    Key(#[from] russh::keys::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Connection { .. } | Error::NotConnected | Error::NoResponse => {
                ErrorKind::Connectivity
            }
            Error::Authentication { .. } | Error::Key(_) => ErrorKind::Authentication,
            Error::Trust { .. } | Error::HostKeyRejected | Error::HostNotVerified => {
                ErrorKind::Trust
            }
            Error::Channel { .. } | Error::Forwarding { .. } | Error::InvalidArgument(_) => {
                ErrorKind::Channel
            }
            Error::Resource { .. } | Error::Io(_) => ErrorKind::Resource,
        }
    }

    pub(crate) fn connection(context: impl Into<String>, reason: impl ToString) -> Self {
        Error::Connection {
            context: context.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn authentication(context: impl Into<String>, reason: impl ToString) -> Self {
        Error::Authentication {
            context: context.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn trust(context: impl Into<String>, reason: impl ToString) -> Self {
        Error::Trust {
            context: context.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn channel(context: impl Into<String>, reason: impl ToString) -> Self {
        Error::Channel {
            context: context.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn forwarding(context: impl Into<String>, reason: impl ToString) -> Self {
        Error::Forwarding {
            context: context.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn resource(context: impl Into<String>, reason: impl ToString) -> Self {
        Error::Resource {
            context: context.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::NotConnected => Error::NotConnected,
            TransportError::Io(io) => Error::Io(io),
            other => Error::channel("Transport failure", other),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
