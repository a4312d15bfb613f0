// ABOUTME: Local X display addressing and MIT cookie lookup.
// ABOUTME: Parses DISPLAY values and opens the socket forwarded X11 connections relay to.

use super::pair::LocalStream;
use std::io;
use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::process::Command;

/// First TCP port used by X displays.
pub const X_PORT_BASE: u16 = 6000;
const X_UNIX_DIR: &str = "/tmp/.X11-unix";

/// Where a local X server listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XDisplay {
    Unix { path: PathBuf, screen: u32 },
    Tcp { host: String, port: u16, screen: u32 },
}

impl XDisplay {
    /// Parse `:N[.S]`, `unix:N[.S]`, `host:N[.S]` or an absolute socket path.
    pub fn parse(display: &str) -> Result<Self, String> {
        let display = display.trim();
        if display.starts_with('/') {
            return Ok(XDisplay::Unix {
                path: PathBuf::from(display),
                screen: 0,
            });
        }

        let (host, rest) = display
            .rsplit_once(':')
            .ok_or_else(|| format!("invalid X display: {}", display))?;
        let (number, screen) = match rest.split_once('.') {
            Some((n, s)) => (n, s),
            None => (rest, "0"),
        };
        let number: u16 = number
            .parse()
            .map_err(|_| format!("invalid X display number: {}", display))?;
        let screen: u32 = screen
            .parse()
            .map_err(|_| format!("invalid X screen number: {}", display))?;

        if host.is_empty() || host == "unix" {
            return Ok(XDisplay::Unix {
                path: PathBuf::from(format!("{}/X{}", X_UNIX_DIR, number)),
                screen,
            });
        }
        let port = X_PORT_BASE
            .checked_add(number)
            .ok_or_else(|| format!("X display number out of range: {}", display))?;
        Ok(XDisplay::Tcp {
            host: host.to_string(),
            port,
            screen,
        })
    }

    pub fn screen(&self) -> u32 {
        match self {
            XDisplay::Unix { screen, .. } | XDisplay::Tcp { screen, .. } => *screen,
        }
    }

    pub fn connect(&self) -> io::Result<LocalStream> {
        match self {
            XDisplay::Unix { path, .. } => UnixStream::connect(path).map(LocalStream::Unix),
            XDisplay::Tcp { host, port, .. } => {
                TcpStream::connect((host.as_str(), *port)).map(LocalStream::Tcp)
            }
        }
    }
}

/// X11 authentication data sent with the forwarding request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XAuth {
    pub protocol: String,
    /// Hex-encoded cookie.
    pub cookie: String,
}

impl XAuth {
    /// Read the cookie for `display` with `xauth list`.
    pub fn from_xauth(display: &str) -> Result<Self, String> {
        let output = Command::new("xauth")
            .arg("list")
            .arg(display)
            .output()
            .map_err(|e| format!("Failed to run xauth: {}", e))?;
        if !output.status.success() {
            return Err(format!(
                "xauth returned error: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Self::parse_list(&String::from_utf8_lossy(&output.stdout))
            .ok_or_else(|| format!("xauth has no cookie for display {}", display))
    }

    /// First entry of `xauth list` output: `<display> <protocol> <hexcookie>`.
    pub fn parse_list(output: &str) -> Option<Self> {
        output.lines().find_map(|line| {
            let mut fields = line.split_whitespace();
            let _display = fields.next()?;
            let protocol = fields.next()?;
            let cookie = fields.next()?;
            Some(XAuth {
                protocol: protocol.to_string(),
                cookie: cookie.to_string(),
            })
        })
    }
}
