//! CIDR expansion and host list loading.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

use ipnet::IpNet;

/// Expand a CIDR block into its host addresses.
///
/// Network and broadcast addresses are excluded whenever the prefix leaves
/// more than two addresses (IPv4). Returns `None` when the token is not a
/// CIDR.
pub fn expand_cidr(token: &str) -> Option<Vec<String>> {
    let net: IpNet = token.parse().ok()?;
    Some(net.hosts().map(|ip| ip.to_string()).collect())
}

/// Expand a mixed list of target tokens: CIDR blocks become their host IPs,
/// everything else passes through untouched.
pub fn expand_targets<I, S>(tokens: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = Vec::new();
    for token in tokens {
        let token = token.as_ref();
        match expand_cidr(token) {
            Some(ips) => {
                tracing::debug!("expanded {} to {} addresses", token, ips.len());
                out.extend(ips);
            }
            None => out.push(token.to_string()),
        }
    }
    out
}

/// Load hosts from a newline-delimited file; blank lines are skipped.
pub fn load_hosts_file<P: AsRef<Path>>(path: P) -> io::Result<Vec<String>> {
    let f = File::open(path)?;
    let mut hosts = Vec::new();
    for line in BufReader::new(f).lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        hosts.push(line.to_string());
    }
    Ok(hosts)
}
