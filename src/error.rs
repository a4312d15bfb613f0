// ABOUTME: Crate-level errors raised while loading profiles, preferences and ssh client config.
// ABOUTME: Engine failures live in ssh::Error; this type only covers files on disk.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration file not found: {0}")]
    ConfigNotFound(PathBuf),

    #[error("ssh config line {line}: {message}")]
    SshConfigSyntax { line: usize, message: &'static str },

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
