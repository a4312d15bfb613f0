// ABOUTME: Host key verification against known_hosts.
// ABOUTME: Unknown or changed keys go to the trust collaborator; accepted keys are recorded.

use super::error::{Error, Result};
use super::prompt::{HostKeyChange, HostKeyPrompt, TrustPrompt};
use super::session::Session;
use russh::keys::PublicKey;
use russh::keys::known_hosts::{check_known_hosts_path, learn_known_hosts_path};
use russh::keys::ssh_key::HashAlg;
use std::path::{Path, PathBuf};

/// Known-hosts lookup result for the offered key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnownState {
    KnownOk,
    NotKnown,
    FileNotFound,
    Changed,
}

/// Decision reached by [`Session::check_host_trust`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostTrust {
    Trusted,
    Rejected,
}

impl Session {
    pub fn known_hosts_path(&self) -> PathBuf {
        if let Some(path) = &self.config.known_hosts_path {
            return path.clone();
        }
        dirs::home_dir()
            .unwrap_or_default()
            .join(".ssh")
            .join("known_hosts")
    }

    /// Look the server's host key up in known_hosts.
    pub fn known_state(&self) -> Result<KnownState> {
        let key = self
            .link
            .call(|t| Ok(t.server_public_key().map(without_comment)))?
            .ok_or_else(|| {
                self.link.fail(Error::trust(
                    "Failed to get the server's public key",
                    "no key was presented",
                ))
            })?;

        let path = self.known_hosts_path();
        if !path.exists() {
            return Ok(KnownState::FileNotFound);
        }
        match check_known_hosts_path(&self.config.host, self.config.port, &key, &path) {
            Ok(true) => Ok(KnownState::KnownOk),
            Ok(false) => Ok(KnownState::NotKnown),
            Err(russh::keys::Error::KeyChanged { .. }) => Ok(KnownState::Changed),
            Err(e) => Err(self
                .link
                .fail(Error::trust("SSH known host checking failed", e))),
        }
    }

    /// Verify the server's identity, asking `prompt` for unknown or changed keys.
    ///
    /// Must run on every new connection, forks included.
    pub fn check_host_trust(&mut self, prompt: &dyn TrustPrompt) -> Result<HostTrust> {
        let state = self.known_state()?;
        let change = match state {
            KnownState::KnownOk => {
                self.host_verified = true;
                return Ok(HostTrust::Trusted);
            }
            KnownState::NotKnown | KnownState::FileNotFound => HostKeyChange::New,
            KnownState::Changed => HostKeyChange::Changed,
        };

        if self.config.options.strict_host_key_check {
            tracing::warn!(host = %self.config.host, ?state, "strict host key checking refused the server key");
            self.link.fail(Error::trust(
                "The server's host key is not trusted",
                "strict host key checking is enabled",
            ));
            return Ok(HostTrust::Rejected);
        }

        let key = self
            .link
            .call(|t| Ok(t.server_public_key().map(without_comment)))?
            .ok_or(Error::NotConnected)?;
        let question = HostKeyPrompt {
            host: self.config.host.clone(),
            port: self.config.port,
            fingerprint: key.fingerprint(HashAlg::Sha256).to_string(),
            change,
        };

        if !prompt.confirm(&question) {
            tracing::info!(host = %question.host, fingerprint = %question.fingerprint, "host key rejected");
            return Ok(HostTrust::Rejected);
        }

        let path = self.known_hosts_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                self.link
                    .fail(Error::trust("Could not add server to list of known SSH hosts", e))
            })?;
        }
        if change == HostKeyChange::Changed {
            forget_host(&path, &self.config.host, self.config.port).map_err(|e| {
                self.link
                    .fail(Error::trust("Could not add server to list of known SSH hosts", e))
            })?;
        }
        learn_known_hosts_path(&self.config.host, self.config.port, &key, &path).map_err(|e| {
            self.link
                .fail(Error::trust("Could not add server to list of known SSH hosts", e))
        })?;

        tracing::info!(host = %question.host, fingerprint = %question.fingerprint, "host key accepted");
        self.host_verified = true;
        Ok(HostTrust::Trusted)
    }
}

/// known_hosts lines are compared without comments, so the presented key is too.
fn without_comment(mut key: PublicKey) -> PublicKey {
    key.set_comment("");
    key
}

/// Drop plain-text known_hosts entries for `host:port`. Hashed entries are kept.
fn forget_host(path: &Path, host: &str, port: u16) -> std::io::Result<()> {
    let content = std::fs::read_to_string(path)?;
    let wanted = if port == 22 {
        host.to_string()
    } else {
        format!("[{}]:{}", host, port)
    };
    let mut kept = Vec::new();
    for line in content.lines() {
        let trimmed = line.trim_start();
        let Some((hosts, rest)) = trimmed.split_once(char::is_whitespace) else {
            kept.push(line.to_string());
            continue;
        };
        if trimmed.starts_with('#') || !hosts.split(',').any(|entry| entry == wanted) {
            kept.push(line.to_string());
            continue;
        }
        let others: Vec<&str> = hosts.split(',').filter(|entry| *entry != wanted).collect();
        if !others.is_empty() {
            kept.push(format!("{} {}", others.join(","), rest.trim_start()));
        }
    }
    let mut out = kept.join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    std::fs::write(path, out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn learned_key_with_comment_reads_back_as_known() {
        let text = std::fs::read_to_string(
            Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/id_ed25519_plain.pub"),
        )
        .unwrap();
        let key = without_comment(PublicKey::from_openssh(text.trim()).unwrap());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");

        learn_known_hosts_path("server.test", 22, &key, &path).unwrap();

        assert!(check_known_hosts_path("server.test", 22, &key, &path).unwrap());
    }

    #[test]
    fn forget_host_removes_plain_entries_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        std::fs::write(
            &path,
            "a.example ssh-ed25519 AAAA1\n[a.example]:2222 ssh-ed25519 AAAA2\nb.example,a.example ssh-rsa AAAA3\n|1|salt|hash ssh-ed25519 AAAA4\n",
        )
        .unwrap();

        forget_host(&path, "a.example", 22).unwrap();

        let left = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            left,
            "[a.example]:2222 ssh-ed25519 AAAA2\nb.example ssh-rsa AAAA3\n|1|salt|hash ssh-ed25519 AAAA4\n"
        );
    }
}
