// ABOUTME: Policy-driven authentication for a connected session.
// ABOUTME: Distinguishes success, "ask for other credentials" and fatal failures.

use super::error::{Error, Result};
use super::prompt::{CredentialPrompt, SecretKind, TrustPrompt};
use super::session::Session;
use super::trust::HostTrust;
use crate::transport::{AuthMethods, KbdPrompt};
use russh::keys::{load_public_key, load_secret_key};
use serde::Deserialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

/// How the session authenticates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    #[default]
    Password,
    PublicKey,
    Agent,
    /// Agent first, then the conventional identity files.
    AutoPublicKey,
    KeyboardInteractive,
    Gssapi,
}

impl AuthMethod {
    /// The saved secret this method consumes.
    pub fn secret_kind(self) -> SecretKind {
        match self {
            AuthMethod::Password | AuthMethod::KeyboardInteractive => SecretKind::Password,
            AuthMethod::PublicKey | AuthMethod::Agent | AuthMethod::AutoPublicKey => {
                SecretKind::Passphrase
            }
            AuthMethod::Gssapi => SecretKind::KerberosToken,
        }
    }
}

/// Non-fatal outcome of an authentication attempt.
///
/// Fatal failures are returned as `Err`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    Authenticated,
    /// The credentials were missing or wrong; prompt and try again.
    NeedCredentials,
}

const ACCESS_DENIED: &str = "Access denied";

impl Session {
    /// Authenticate with the configured method.
    ///
    /// A given `secret` replaces both the stored password and passphrase.
    /// Refuses to run until the host key has been verified on this connection.
    pub fn authenticate(
        &mut self,
        secret: Option<&str>,
        prompt: &dyn CredentialPrompt,
    ) -> Result<AuthStatus> {
        if !self.is_connected() {
            return Err(self.link.fail(Error::NotConnected));
        }
        if !self.host_verified {
            return Err(self.link.fail(Error::HostNotVerified));
        }

        if let Some(secret) = secret {
            self.password = Some(Zeroizing::new(secret.to_string()));
            self.passphrase = Some(Zeroizing::new(secret.to_string()));
        }

        if self.authenticated {
            return Ok(AuthStatus::Authenticated);
        }

        let user = self.user();
        let methods = self.link.call(|t| t.auth_methods(&user)).map_err(|e| {
            self.link
                .fail(Error::authentication("Failed to query authentication methods", e))
        })?;

        let status = match self.config.auth {
            AuthMethod::Password => self.auth_password(&user, methods)?,
            AuthMethod::PublicKey => self.auth_public_key(&user, methods)?,
            AuthMethod::Agent => self.auth_agent(&user)?,
            AuthMethod::AutoPublicKey => self.auth_auto_public_key(&user, prompt)?,
            AuthMethod::KeyboardInteractive => self.auth_keyboard_interactive(&user)?,
            AuthMethod::Gssapi => self.auth_gssapi(&user, methods)?,
        };

        if status == AuthStatus::Authenticated {
            self.authenticated = true;
            tracing::info!(user = %user, method = ?self.config.auth, "SSH authentication succeeded");
        } else {
            tracing::debug!(user = %user, method = ?self.config.auth, "SSH credentials rejected");
        }
        Ok(status)
    }

    /// Host-trust check followed by authentication, prompting at most once.
    ///
    /// `saved` is the stored secret for the method, tried before asking.
    pub fn authenticate_with_prompts(
        &mut self,
        saved: Option<&str>,
        trust: &dyn TrustPrompt,
        credentials: &dyn CredentialPrompt,
    ) -> Result<()> {
        match self.check_host_trust(trust)? {
            HostTrust::Trusted => {}
            HostTrust::Rejected => return Err(self.link.fail(Error::HostKeyRejected)),
        }

        if self.authenticate(saved, credentials)? == AuthStatus::Authenticated {
            return Ok(());
        }

        let kind = self.config.auth.secret_kind();
        let reply = credentials.request(kind).ok_or_else(|| {
            self.link
                .fail(Error::authentication("Authentication cancelled", kind.label()))
        })?;
        if reply.remember && !self.config.disable_password_storing {
            credentials.remember(kind, &reply.secret);
        }

        match self.authenticate(Some(&reply.secret), credentials)? {
            AuthStatus::Authenticated => Ok(()),
            AuthStatus::NeedCredentials => {
                let reason = self
                    .last_error()
                    .unwrap_or_else(|| ACCESS_DENIED.to_string());
                Err(self.link.fail(Error::authentication(
                    format!("{} was not accepted", kind.label()),
                    reason,
                )))
            }
        }
    }

    fn auth_password(&mut self, user: &str, methods: AuthMethods) -> Result<AuthStatus> {
        let Some(password) = self.password.clone() else {
            return Ok(AuthStatus::NeedCredentials);
        };
        if !methods.password && !methods.keyboard_interactive {
            return Err(self.link.fail(Error::authentication(
                "SSH password authentication failed",
                "the server accepts neither password nor keyboard-interactive authentication",
            )));
        }

        let mut reason = ACCESS_DENIED.to_string();
        if methods.password {
            match self.link.call(|t| t.auth_password(user, &password)) {
                Ok(true) => return Ok(AuthStatus::Authenticated),
                Ok(false) => {}
                Err(e) => reason = e.to_string(),
            }
        }
        if methods.keyboard_interactive {
            match self.interactive_with_secret(user, &password) {
                Ok(true) => return Ok(AuthStatus::Authenticated),
                Ok(false) => {}
                Err(e) => reason = e.to_string(),
            }
        }

        self.link
            .fail(Error::authentication("SSH password authentication failed", reason));
        Ok(AuthStatus::NeedCredentials)
    }

    fn auth_keyboard_interactive(&mut self, user: &str) -> Result<AuthStatus> {
        let Some(password) = self.password.clone() else {
            return Ok(AuthStatus::NeedCredentials);
        };
        match self.interactive_with_secret(user, &password) {
            Ok(true) => Ok(AuthStatus::Authenticated),
            Ok(false) => {
                self.link.fail(Error::authentication(
                    "SSH keyboard-interactive authentication failed",
                    ACCESS_DENIED,
                ));
                Ok(AuthStatus::NeedCredentials)
            }
            Err(e) => {
                self.link.fail(Error::authentication(
                    "SSH keyboard-interactive authentication failed",
                    e,
                ));
                Ok(AuthStatus::NeedCredentials)
            }
        }
    }

    /// Answer every keyboard-interactive prompt with the same secret.
    fn interactive_with_secret(
        &self,
        user: &str,
        secret: &str,
    ) -> crate::transport::Result<bool> {
        let mut respond = |prompts: &[KbdPrompt]| -> Vec<String> {
            prompts.iter().map(|_| secret.to_string()).collect()
        };
        self.link
            .call(|t| t.auth_keyboard_interactive(user, &mut respond))
    }

    fn auth_public_key(&mut self, user: &str, methods: AuthMethods) -> Result<AuthStatus> {
        const CONTEXT: &str = "SSH public key authentication failed";

        let Some(key_path) = self.config.key_path.clone() else {
            return Err(self
                .link
                .fail(Error::authentication(CONTEXT, "SSH Key file not yet set.")));
        };
        if !methods.public_key {
            return Err(self.link.fail(Error::authentication(
                CONTEXT,
                "the server does not accept public keys",
            )));
        }

        let public_path = public_key_path(&key_path);
        if public_path.exists() {
            if let Err(e) = load_public_key(&public_path) {
                tracing::warn!(path = %public_path.display(), error = %e, "SSH public key cannot be imported");
            }
        }

        let passphrase = self.passphrase.clone().filter(|p| !p.is_empty());
        let key = match load_secret_key(&key_path, passphrase.as_ref().map(|p| p.as_str())) {
            Ok(key) => key,
            Err(e) if passphrase.is_none() && key_is_encrypted(&key_path) => {
                tracing::debug!(error = %e, "private key needs a passphrase");
                self.link
                    .fail(Error::authentication(CONTEXT, "the private key is encrypted"));
                return Ok(AuthStatus::NeedCredentials);
            }
            Err(e) => return Err(self.link.fail(Error::authentication(CONTEXT, e))),
        };

        match self.link.call(|t| t.auth_publickey(user, key)) {
            Ok(true) => Ok(AuthStatus::Authenticated),
            Ok(false) => Err(self.link.fail(Error::authentication(CONTEXT, ACCESS_DENIED))),
            Err(e) => Err(self.link.fail(Error::authentication(CONTEXT, e))),
        }
    }

    fn auth_agent(&mut self, user: &str) -> Result<AuthStatus> {
        const CONTEXT: &str = "SSH public key authentication with SSH agent failed";
        match self.link.call(|t| t.auth_agent(user)) {
            Ok(true) => Ok(AuthStatus::Authenticated),
            Ok(false) => Err(self.link.fail(Error::authentication(CONTEXT, ACCESS_DENIED))),
            Err(e) => Err(self.link.fail(Error::authentication(CONTEXT, e))),
        }
    }

    fn auth_auto_public_key(
        &mut self,
        user: &str,
        prompt: &dyn CredentialPrompt,
    ) -> Result<AuthStatus> {
        const CONTEXT: &str = "SSH automatic public key authentication failed";

        if self.passphrase.is_none() {
            let Some(reply) = prompt.request(SecretKind::Passphrase) else {
                return Ok(AuthStatus::NeedCredentials);
            };
            if reply.remember && !self.config.disable_password_storing {
                prompt.remember(SecretKind::Passphrase, &reply.secret);
            }
            self.passphrase = Some(Zeroizing::new(reply.secret));
        }

        let passphrase = self.passphrase.clone().filter(|p| !p.is_empty());
        let result = self
            .link
            .call(|t| t.auth_publickey_auto(user, passphrase.as_ref().map(|p| p.as_str())));
        match result {
            Ok(true) => Ok(AuthStatus::Authenticated),
            Ok(false) => {
                self.link.fail(Error::authentication(CONTEXT, ACCESS_DENIED));
                Ok(AuthStatus::NeedCredentials)
            }
            Err(e) => {
                self.link.fail(Error::authentication(CONTEXT, e));
                Ok(AuthStatus::NeedCredentials)
            }
        }
    }

    fn auth_gssapi(&mut self, user: &str, methods: AuthMethods) -> Result<AuthStatus> {
        const CONTEXT: &str = "SSH Kerberos/GSSAPI authentication failed";
        if !methods.gssapi {
            return Err(self.link.fail(Error::authentication(
                CONTEXT,
                "the server does not offer GSSAPI",
            )));
        }
        match self.link.call(|t| t.auth_gssapi(user)) {
            Ok(true) => Ok(AuthStatus::Authenticated),
            Ok(false) => Err(self.link.fail(Error::authentication(CONTEXT, ACCESS_DENIED))),
            Err(e) => Err(self.link.fail(Error::authentication(CONTEXT, e))),
        }
    }
}

fn public_key_path(private: &Path) -> PathBuf {
    let mut name = OsString::from(private.as_os_str());
    name.push(".pub");
    PathBuf::from(name)
}

/// Whether the key file is protected by a passphrase.
fn key_is_encrypted(path: &Path) -> bool {
    let Ok(content) = std::fs::read_to_string(path) else {
        return false;
    };
    if content.contains("ENCRYPTED") {
        return true;
    }
    russh::keys::ssh_key::PrivateKey::from_openssh(&content)
        .map(|key| key.is_encrypted())
        .unwrap_or(false)
}
