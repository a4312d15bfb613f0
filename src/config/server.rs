// ABOUTME: Server address parsing for profile values.
// ABOUTME: Parses formats like "host", "user@host", "host:port", "[::1]:port".

/// A parsed `[user@]host[:port]` address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
}

impl ServerAddress {
    /// Parse an address, using `default_port` when none is given.
    ///
    /// An empty host is allowed (`":2222"`) so callers can fall back to
    /// another host field while keeping the port.
    pub fn parse(s: &str, default_port: u16) -> Result<Self, String> {
        let s = s.trim();

        let (user, rest) = match s.rfind('@') {
            Some(at) => (Some(s[..at].to_string()), &s[at + 1..]),
            None => (None, s),
        };

        let (host, port) = if let Some(stripped) = rest.strip_prefix('[') {
            let close = stripped
                .find(']')
                .ok_or_else(|| format!("unterminated IPv6 address: {}", rest))?;
            let host = &stripped[..close];
            let tail = &stripped[close + 1..];
            let port = match tail.strip_prefix(':') {
                Some(p) => parse_port(p)?,
                None if tail.is_empty() => default_port,
                None => return Err(format!("unexpected text after address: {}", tail)),
            };
            (host, port)
        } else if rest.matches(':').count() == 1 {
            let colon = rest.rfind(':').unwrap_or(rest.len());
            (&rest[..colon], parse_port(&rest[colon + 1..])?)
        } else {
            // No port, or a bare IPv6 address.
            (rest, default_port)
        };

        Ok(ServerAddress {
            host: host.to_string(),
            port,
            user,
        })
    }
}

fn parse_port(s: &str) -> Result<u16, String> {
    s.parse::<u16>().map_err(|_| format!("invalid port: {}", s))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_only_takes_default_port() {
        let addr = ServerAddress::parse("example.com", 22).unwrap();
        assert_eq!(addr.host, "example.com");
        assert_eq!(addr.port, 22);
        assert_eq!(addr.user, None);
    }

    #[test]
    fn user_host_port() {
        let addr = ServerAddress::parse("deploy@example.com:2222", 22).unwrap();
        assert_eq!(addr.host, "example.com");
        assert_eq!(addr.port, 2222);
        assert_eq!(addr.user.as_deref(), Some("deploy"));
    }

    #[test]
    fn bracketed_ipv6() {
        let addr = ServerAddress::parse("[fe80::1]:2200", 22).unwrap();
        assert_eq!(addr.host, "fe80::1");
        assert_eq!(addr.port, 2200);
    }

    #[test]
    fn bare_ipv6_keeps_default_port() {
        let addr = ServerAddress::parse("::1", 22).unwrap();
        assert_eq!(addr.host, "::1");
        assert_eq!(addr.port, 22);
    }

    #[test]
    fn empty_host_keeps_port() {
        let addr = ServerAddress::parse(":2222", 22).unwrap();
        assert_eq!(addr.host, "");
        assert_eq!(addr.port, 2222);
    }

    #[test]
    fn invalid_port_is_rejected() {
        assert!(ServerAddress::parse("host:notaport", 22).is_err());
    }
}
