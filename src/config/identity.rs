// ABOUTME: Private key (identity) file resolution.
// ABOUTME: Expands relative paths against the home directory and probes conventional names.

use std::path::{Path, PathBuf};

/// Conventional identity files, probed in order.
pub const COMMON_IDENTITIES: [&str; 4] = [
    ".ssh/id_ed25519",
    ".ssh/id_rsa",
    ".ssh/id_dsa",
    ".ssh/identity",
];

/// Resolve an identity path: absolute paths are kept, relative ones are
/// taken from the home directory.
pub fn identity_path(id: &Path) -> PathBuf {
    if id.is_absolute() {
        return id.to_path_buf();
    }
    match dirs::home_dir() {
        Some(home) => home.join(id),
        None => id.to_path_buf(),
    }
}

/// First conventional identity file that exists as a regular file.
pub fn find_identity() -> Option<PathBuf> {
    COMMON_IDENTITIES
        .iter()
        .map(|id| identity_path(Path::new(id)))
        .find(|path| path.is_file())
}
