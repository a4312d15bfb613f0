// ABOUTME: File-transfer wrapper: a session carrying one SFTP subsystem channel.
// ABOUTME: Built from a forked session so transfers never share the parent's transport.

use crate::ssh::{Error, Result, Session};
use crate::transport::ChannelId;

/// An SFTP session over its own SSH session.
#[derive(Debug)]
pub struct FileTransfer {
    session: Session,
    channel: Option<ChannelId>,
}

impl FileTransfer {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            channel: None,
        }
    }

    /// Wrap a fork of `parent`. The fork must connect, verify the host and
    /// authenticate before `open`.
    pub fn from_session(parent: &Session) -> Self {
        Self::new(parent.fork())
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_some()
    }

    /// Open and initialise the SFTP subsystem.
    pub fn open(&mut self) -> Result<()> {
        if self.channel.is_some() {
            return Ok(());
        }
        let link = self.session.link();
        let channel = link
            .call(|t| t.open_sftp())
            .map_err(|e| link.fail(Error::channel("Failed to create SFTP session", e)))?;

        if let Err(e) = link.call(|t| t.init_sftp(channel)) {
            let _ = link.call(|t| {
                t.close_channel(channel);
                Ok(())
            });
            return Err(link.fail(Error::channel("Failed to initialize SFTP session", e)));
        }

        tracing::info!(%channel, "SFTP session opened");
        self.channel = Some(channel);
        Ok(())
    }

    /// Absolute form of `path` on the server.
    pub fn canonicalize(&self, path: &str) -> Result<String> {
        let link = self.session.link();
        let channel = self
            .channel
            .ok_or_else(|| link.fail(Error::InvalidArgument("SFTP session is not open".into())))?;
        link.call(|t| t.sftp_canonicalize(channel, path))
            .map_err(|e| link.fail(Error::channel(format!("Failed to resolve {}", path), e)))
    }

    pub fn close(&mut self) {
        if let Some(channel) = self.channel.take() {
            let _ = self.session.link().call(|t| {
                t.close_channel(channel);
                Ok(())
            });
            tracing::debug!(%channel, "SFTP session closed");
        }
    }
}

impl Drop for FileTransfer {
    fn drop(&mut self) {
        self.close();
    }
}
