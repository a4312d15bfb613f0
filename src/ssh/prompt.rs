// ABOUTME: Capabilities the engine asks of its owner: secrets and host-key trust decisions.
// ABOUTME: Closures implement both traits so callers can pass a lambda.

/// Which saved secret a prompt is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecretKind {
    Password,
    Passphrase,
    KerberosToken,
}

impl SecretKind {
    pub fn label(self) -> &'static str {
        match self {
            SecretKind::Password => "SSH password",
            SecretKind::Passphrase => "SSH private key passphrase",
            SecretKind::KerberosToken => "SSH Kerberos/GSSAPI",
        }
    }
}

/// A secret typed by the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretReply {
    pub secret: String,
    /// The user asked for the secret to be saved.
    pub remember: bool,
}

impl SecretReply {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            remember: false,
        }
    }

    pub fn remembered(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            remember: true,
        }
    }
}

/// Asks the user for a secret. `None` means the user cancelled.
pub trait CredentialPrompt {
    fn request(&self, kind: SecretKind) -> Option<SecretReply>;

    /// Persist a secret the user asked to keep.
    fn remember(&self, _kind: SecretKind, _secret: &str) {}
}

impl<F> CredentialPrompt for F
where
    F: Fn(SecretKind) -> Option<SecretReply>,
{
    fn request(&self, kind: SecretKind) -> Option<SecretReply> {
        self(kind)
    }
}

/// Why the host key needs a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyChange {
    /// Host not present in known_hosts (or the file does not exist).
    New,
    /// Host present with a different key.
    Changed,
}

/// Question put to the trust collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostKeyPrompt {
    pub host: String,
    pub port: u16,
    /// `SHA256:...` fingerprint of the offered key.
    pub fingerprint: String,
    pub change: HostKeyChange,
}

impl HostKeyPrompt {
    /// Text suitable for a yes/no dialog.
    pub fn message(&self) -> String {
        let lead = match self.change {
            HostKeyChange::New => "The server is unknown. The public key fingerprint is:",
            HostKeyChange::Changed => {
                "WARNING: The server has changed its public key. This means either you are under attack,\nor the administrator has changed the key. The new public key fingerprint is:"
            }
        };
        format!("{}\n{}\n\nDo you trust the new public key?", lead, self.fingerprint)
    }
}

/// Decides whether to trust a new or changed host key.
pub trait TrustPrompt {
    fn confirm(&self, prompt: &HostKeyPrompt) -> bool;
}

impl<F> TrustPrompt for F
where
    F: Fn(&HostKeyPrompt) -> bool,
{
    fn confirm(&self, prompt: &HostKeyPrompt) -> bool {
        self(prompt)
    }
}

/// Credential prompt that always cancels.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPrompt;

impl CredentialPrompt for NoPrompt {
    fn request(&self, _kind: SecretKind) -> Option<SecretReply> {
        None
    }
}
