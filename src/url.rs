//! Server address parsing: `host[:port]`, port defaulting to 9876.

use crate::protocol::DEFAULT_PORT;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddr {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Parse `host`, `host:`, `host:port`, `[v6]`, `[v6]:port` or a bare
/// IPv6 literal. Returns `None` for an empty host or an invalid port.
pub fn parse_addr(s: &str) -> Option<ServerAddr> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    let (host, port) = if let Some(rest) = s.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        match after {
            "" | ":" => (host, None),
            p => (host, Some(p.strip_prefix(':')?)),
        }
    } else if s.matches(':').count() > 1 {
        // Bare IPv6 literal, no port
        (s, None)
    } else {
        match s.split_once(':') {
            Some((h, "")) => (h, None),
            Some((h, p)) => (h, Some(p)),
            None => (s, None),
        }
    };

    if host.is_empty() {
        return None;
    }
    let port = match port {
        Some(p) => p.parse().ok()?,
        None => DEFAULT_PORT,
    };
    Some(ServerAddr {
        host: host.to_string(),
        port,
    })
}
