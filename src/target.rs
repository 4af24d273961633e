//! Target specification parsing.
//!
//! A target is a single token like `10.0.0.1`, `ip6://example.org` or
//! `tcp://[2001:db8::1]:443`. Parsing never touches the network; DNS happens
//! when the probe starts.

use thiserror::Error;

/// Probe family selected by the scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// ICMP echo (or the system `ping` binary when so configured).
    Icmp,
    /// TCP port probe.
    Tcp,
}

/// Address-family preference carried by the scheme suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FamilyHint {
    #[default]
    Any,
    V4,
    V6,
}

/// Target spec parse failures.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TargetParseError {
    #[error("empty target")]
    Empty,
    #[error("unknown scheme: {0}")]
    UnknownScheme(String),
    #[error("tcp target requires a port: {0}")]
    MissingPort(String),
    #[error("invalid port {port:?} in {spec}: must be a decimal in [1,65535]")]
    InvalidPort { spec: String, port: String },
    #[error("IPv6 literal must be bracketed: {0}")]
    UnbracketedV6(String),
    #[error("missing host in {0}")]
    MissingHost(String),
}

/// A parsed target. Immutable after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSpec {
    /// The original user-supplied token.
    pub raw: String,
    pub scheme: Scheme,
    /// Host literal with IPv6 brackets stripped.
    pub host: String,
    pub port: Option<u16>,
    pub family: FamilyHint,
}

impl TargetSpec {
    /// Parse a single target token (case-insensitive scheme).
    pub fn parse(token: &str) -> Result<Self, TargetParseError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(TargetParseError::Empty);
        }

        let (scheme, family, rest) = match token.split_once("://") {
            None => (Scheme::Icmp, FamilyHint::Any, token),
            Some((prefix, rest)) => {
                let (scheme, family) = match prefix.to_ascii_lowercase().as_str() {
                    "ip" => (Scheme::Icmp, FamilyHint::Any),
                    "ip4" => (Scheme::Icmp, FamilyHint::V4),
                    "ip6" => (Scheme::Icmp, FamilyHint::V6),
                    "tcp" => (Scheme::Tcp, FamilyHint::Any),
                    "tcp4" => (Scheme::Tcp, FamilyHint::V4),
                    "tcp6" => (Scheme::Tcp, FamilyHint::V6),
                    other => return Err(TargetParseError::UnknownScheme(other.to_string())),
                };
                (scheme, family, rest)
            }
        };

        if rest.is_empty() {
            return Err(TargetParseError::MissingHost(token.to_string()));
        }

        match scheme {
            Scheme::Icmp => {
                let host = rest.trim_start_matches('[').trim_end_matches(']');
                if host.is_empty() {
                    return Err(TargetParseError::MissingHost(token.to_string()));
                }
                Ok(Self {
                    raw: token.to_string(),
                    scheme,
                    host: host.to_string(),
                    port: None,
                    family,
                })
            }
            Scheme::Tcp => {
                let (host, port_str) = split_host_port(token, rest)?;
                let port: u16 = port_str
                    .parse()
                    .ok()
                    .filter(|p| *p >= 1)
                    .ok_or_else(|| TargetParseError::InvalidPort {
                        spec: token.to_string(),
                        port: port_str.to_string(),
                    })?;
                Ok(Self {
                    raw: token.to_string(),
                    scheme,
                    host: host.to_string(),
                    port: Some(port),
                    family,
                })
            }
        }
    }

    /// Canonical re-emission of the spec.
    ///
    /// `tcp://[2001:db8::1]:80` parses and re-emits unchanged; bare ICMP hosts
    /// stay bare.
    pub fn canonical(&self) -> String {
        let scheme = match (self.scheme, self.family) {
            (Scheme::Icmp, FamilyHint::Any) => "ip",
            (Scheme::Icmp, FamilyHint::V4) => "ip4",
            (Scheme::Icmp, FamilyHint::V6) => "ip6",
            (Scheme::Tcp, FamilyHint::Any) => "tcp",
            (Scheme::Tcp, FamilyHint::V4) => "tcp4",
            (Scheme::Tcp, FamilyHint::V6) => "tcp6",
        };
        match self.port {
            Some(port) => format!("{}://{}:{}", scheme, bracket(&self.host), port),
            None if self.raw.contains("://") => format!("{}://{}", scheme, bracket(&self.host)),
            None => self.host.clone(),
        }
    }

    /// Initial display label, before any reverse DNS rewrite.
    pub fn display_label(&self) -> String {
        match self.port {
            Some(port) => format!("tcp://{}:{}", bracket(&self.host), port),
            None => self.host.clone(),
        }
    }
}

fn bracket(host: &str) -> String {
    if host.contains(':') {
        format!("[{}]", host)
    } else {
        host.to_string()
    }
}

/// Split the `host:port` tail of a TCP spec, honoring `[v6]` brackets.
fn split_host_port<'a>(
    token: &str,
    rest: &'a str,
) -> Result<(&'a str, &'a str), TargetParseError> {
    if let Some(stripped) = rest.strip_prefix('[') {
        let (host, tail) = stripped
            .split_once(']')
            .ok_or_else(|| TargetParseError::UnbracketedV6(token.to_string()))?;
        let port = tail
            .strip_prefix(':')
            .filter(|p| !p.is_empty())
            .ok_or_else(|| TargetParseError::MissingPort(token.to_string()))?;
        return Ok((host, port));
    }

    let (host, port) = rest
        .rsplit_once(':')
        .ok_or_else(|| TargetParseError::MissingPort(token.to_string()))?;
    if host.contains(':') {
        // Two or more colons without brackets means a raw IPv6 literal.
        return Err(TargetParseError::UnbracketedV6(token.to_string()));
    }
    if host.is_empty() {
        return Err(TargetParseError::MissingHost(token.to_string()));
    }
    if port.is_empty() {
        return Err(TargetParseError::MissingPort(token.to_string()));
    }
    Ok((host, port))
}
