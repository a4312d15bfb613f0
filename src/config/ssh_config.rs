// ABOUTME: OpenSSH client configuration (~/.ssh/config) parsing.
// ABOUTME: Resolves per-host options from Host blocks with glob patterns, first value wins.

use crate::error::{Error, Result};
use glob::Pattern;
use std::path::{Path, PathBuf};

/// One `Host` block: its patterns and the directives that follow it.
#[derive(Debug, Clone)]
struct HostBlock {
    patterns: Vec<String>,
    directives: Vec<(String, String)>,
}

impl HostBlock {
    fn matches(&self, host: &str) -> bool {
        let mut matched = false;
        for pattern in &self.patterns {
            let (negated, pattern) = match pattern.strip_prefix('!') {
                Some(rest) => (true, rest),
                None => (false, pattern.as_str()),
            };
            let hit = Pattern::new(pattern)
                .map(|p| p.matches(host))
                .unwrap_or(false);
            if hit && negated {
                return false;
            }
            matched |= hit && !negated;
        }
        matched
    }
}

/// Parsed client configuration.
#[derive(Debug, Clone, Default)]
pub struct SshConfig {
    blocks: Vec<HostBlock>,
}

/// Options that apply to one host after matching every block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostOptions {
    pub hostname: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub identity_file: Option<PathBuf>,
    pub proxy_command: Option<String>,
    pub ciphers: Option<String>,
    pub kex_algorithms: Option<String>,
    pub host_key_algorithms: Option<String>,
    pub compression: Option<bool>,
    pub strict_host_key_checking: Option<bool>,
}

/// Default location of the user's client configuration.
pub fn default_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".ssh").join("config"))
}

impl SshConfig {
    /// Load a configuration file; a missing file is an empty configuration.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::parse(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(Error::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn parse(content: &str) -> Result<Self> {
        // Directives before the first Host line apply to every host.
        let mut blocks = vec![HostBlock {
            patterns: vec!["*".to_string()],
            directives: Vec::new(),
        }];

        for (index, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (key, value) = split_directive(line).ok_or_else(|| {
                Error::SshConfigSyntax {
                    line: index + 1,
                    message: "missing value",
                }
            })?;
            let key = key.to_ascii_lowercase();

            if key == "host" {
                blocks.push(HostBlock {
                    patterns: value.split_whitespace().map(str::to_string).collect(),
                    directives: Vec::new(),
                });
            } else if key == "match" {
                // Match blocks are not evaluated; their directives are skipped.
                blocks.push(HostBlock {
                    patterns: Vec::new(),
                    directives: Vec::new(),
                });
            } else if let Some(block) = blocks.last_mut() {
                block.directives.push((key, unquote(value).to_string()));
            }
        }

        Ok(Self { blocks })
    }

    /// Resolve the options for `host`.
    pub fn lookup(&self, host: &str) -> HostOptions {
        let mut opts = HostOptions::default();
        for block in self.blocks.iter().filter(|b| b.matches(host)) {
            for (key, value) in &block.directives {
                apply(&mut opts, key, value);
            }
        }
        opts
    }
}

fn split_directive(line: &str) -> Option<(&str, &str)> {
    let split_at = line.find(|c: char| c.is_whitespace() || c == '=')?;
    let key = &line[..split_at];
    let value = line[split_at..]
        .trim_start_matches(|c: char| c.is_whitespace() || c == '=')
        .trim_end();
    if value.is_empty() {
        return None;
    }
    Some((key, value))
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

fn yes_no(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "yes" | "true" => Some(true),
        "no" | "false" => Some(false),
        _ => None,
    }
}

fn expand_home(value: &str) -> PathBuf {
    match (value.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(value),
    }
}

fn set_once<T>(slot: &mut Option<T>, value: Option<T>) {
    if slot.is_none() {
        *slot = value;
    }
}

fn apply(opts: &mut HostOptions, key: &str, value: &str) {
    match key {
        "hostname" => set_once(&mut opts.hostname, Some(value.to_string())),
        "port" => set_once(&mut opts.port, value.parse().ok()),
        "user" => set_once(&mut opts.user, Some(value.to_string())),
        "identityfile" => set_once(&mut opts.identity_file, Some(expand_home(value))),
        "proxycommand" if !value.eq_ignore_ascii_case("none") => {
            set_once(&mut opts.proxy_command, Some(value.to_string()))
        }
        "ciphers" => set_once(&mut opts.ciphers, Some(value.to_string())),
        "kexalgorithms" => set_once(&mut opts.kex_algorithms, Some(value.to_string())),
        "hostkeyalgorithms" => set_once(&mut opts.host_key_algorithms, Some(value.to_string())),
        "compression" => set_once(&mut opts.compression, yes_no(value)),
        "stricthostkeychecking" => set_once(&mut opts.strict_host_key_checking, yes_no(value)),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
# global
Compression yes

Host build-*
    User ci
    Port 2200

Host build-eu* !build-eu-old
    HostName eu.build.example.com
    Port 2201

Host *
    User fallback
    IdentityFile ~/.ssh/id_work
    ProxyCommand none
"#;

    #[test]
    fn first_value_wins_across_blocks() {
        let cfg = SshConfig::parse(SAMPLE).unwrap();
        let opts = cfg.lookup("build-eu");
        assert_eq!(opts.user.as_deref(), Some("ci"));
        assert_eq!(opts.port, Some(2200));
        assert_eq!(opts.hostname.as_deref(), Some("eu.build.example.com"));
        assert_eq!(opts.compression, Some(true));
    }

    #[test]
    fn negated_pattern_excludes_block() {
        let cfg = SshConfig::parse(SAMPLE).unwrap();
        let opts = cfg.lookup("build-eu-old");
        assert_eq!(opts.hostname, None);
        assert_eq!(opts.user.as_deref(), Some("ci"));
    }

    #[test]
    fn wildcard_block_fills_defaults() {
        let cfg = SshConfig::parse(SAMPLE).unwrap();
        let opts = cfg.lookup("db.internal");
        assert_eq!(opts.user.as_deref(), Some("fallback"));
        assert_eq!(opts.port, None);
        assert!(opts.identity_file.is_some());
        assert_eq!(opts.proxy_command, None);
    }

    #[test]
    fn equals_separator_and_quotes() {
        let cfg = SshConfig::parse("Host q\n  ProxyCommand=\"nc %h %p\"\n").unwrap();
        assert_eq!(cfg.lookup("q").proxy_command.as_deref(), Some("nc %h %p"));
    }

    #[test]
    fn missing_value_is_invalid() {
        assert!(SshConfig::parse("Host a\n  Port\n").is_err());
    }

    #[test]
    fn missing_file_is_empty() {
        let cfg = SshConfig::load(Path::new("/nonexistent/ssh/config")).unwrap();
        assert_eq!(cfg.lookup("any"), HostOptions::default());
    }
}
