//! One-shot mode.
//!
//! Probe every target exactly once with a one second timeout and at most a
//! hundred attempts in flight, then print a summary table and optionally a
//! JSON document for automation.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::Runtime;
use crate::probe::{connect_once, echo_once, ping_once, resolve_host};
use crate::resolver::reverse_lookup;
use crate::target::{Scheme, TargetSpec};
use crate::view::ip_key;

const MAX_INFLIGHT: usize = 100;
const ONCE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct OnceResult {
    pub ip: String,
    pub hostname: String,
    pub status: String,
    pub online: bool,
}

#[derive(Debug, Serialize)]
struct HostEntry {
    ip: String,
    hostname: String,
    status: String,
    online: bool,
}

#[derive(Debug, Serialize)]
struct OnceDocument {
    timestamp: String,
    total: usize,
    online_count: usize,
    offline_count: usize,
    hosts: Vec<HostEntry>,
}

/// Probe each target once and report. Returns the process exit code.
pub async fn run_once(
    specs: Vec<TargetSpec>,
    runtime: Arc<Runtime>,
    only_online: bool,
    only_offline: bool,
) -> i32 {
    println!("Probing {} targets...", specs.len());

    let sem = Arc::new(Semaphore::new(MAX_INFLIGHT));
    let mut attempts = JoinSet::new();
    for spec in specs {
        let runtime = runtime.clone();
        let sem = sem.clone();
        attempts.spawn(async move {
            let _permit = sem.acquire_owned().await.ok()?;
            Some(probe_target(spec, &runtime).await)
        });
    }

    let mut results = Vec::new();
    while let Some(res) = attempts.join_next().await {
        if let Ok(Some(result)) = res {
            results.push(result);
        }
    }

    retain_filtered(&mut results, only_online, only_offline);
    sort_results(&mut results);

    if let Some(path) = &runtime.log_path {
        match write_json_document(path, &results) {
            Ok((online, offline)) => eprintln!(
                "Results written to {} (JSON format, {} online, {} offline)",
                path.display(),
                online,
                offline
            ),
            Err(e) => eprintln!("Error writing JSON results: {}", e),
        }
    }

    print_table(&results);
    0
}

async fn probe_target(spec: TargetSpec, runtime: &Runtime) -> OnceResult {
    let ip = match resolve_host(&spec.host, spec.family).await {
        Ok(ip) => ip,
        Err(e) => {
            return OnceResult {
                ip: spec.raw.clone(),
                hostname: "-".to_string(),
                status: format!("Error ({})", e),
                online: false,
            }
        }
    };

    let attempt = match spec.scheme {
        Scheme::Tcp => {
            let port = spec.port.unwrap_or(0);
            connect_once(ip, port, ONCE_TIMEOUT).await
        }
        Scheme::Icmp if runtime.use_system_ping => {
            ping_once(
                ip.is_ipv6(),
                &ip.to_string(),
                ONCE_TIMEOUT,
                &runtime.system_ping_options,
            )
            .await
        }
        Scheme::Icmp => echo_once(ip, ONCE_TIMEOUT, runtime.payload_size, runtime.privileged).await,
    };

    let ip_str = ip.to_string();
    let hostname = if runtime.skip_dns {
        None
    } else {
        reverse_lookup(ip).await
    }
    .filter(|name| name != &ip_str && name != &spec.host)
    .unwrap_or_else(|| "-".to_string());

    let (status, online) = match attempt {
        Ok(Some(_)) => ("Online".to_string(), true),
        Ok(None) => ("Offline".to_string(), false),
        Err(e) => (format!("Error ({})", e), false),
    };

    OnceResult {
        ip: ip_str,
        hostname,
        status,
        online,
    }
}

/// Keep rows matching the requested polarity. Error rows count as offline.
/// Both flags together exclude everything.
fn retain_filtered(results: &mut Vec<OnceResult>, only_online: bool, only_offline: bool) {
    if only_online && only_offline {
        results.clear();
        return;
    }
    if !only_online && !only_offline {
        return;
    }
    results.retain(|r| if only_online { r.online } else { !r.online });
}

/// Deterministic output order: by binary IP key, unresolved rows last.
fn sort_results(results: &mut [OnceResult]) {
    results.sort_by(|a, b| match (ip_key(&a.ip), ip_key(&b.ip)) {
        (Some(ka), Some(kb)) => ka.cmp(&kb).then_with(|| a.ip.cmp(&b.ip)),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => a.ip.cmp(&b.ip),
    });
}

fn write_json_document(path: &Path, results: &[OnceResult]) -> std::io::Result<(usize, usize)> {
    let online_count = results.iter().filter(|r| r.online).count();
    let doc = OnceDocument {
        timestamp: chrono::Utc::now().to_rfc3339(),
        total: results.len(),
        online_count,
        offline_count: results.len() - online_count,
        hosts: results
            .iter()
            .map(|r| HostEntry {
                ip: r.ip.clone(),
                hostname: if r.hostname == "-" {
                    String::new()
                } else {
                    r.hostname.clone()
                },
                status: r.status.clone(),
                online: r.online,
            })
            .collect(),
    };

    let file = std::fs::File::create(path)?;
    serde_json::to_writer_pretty(file, &doc)?;
    Ok((doc.online_count, doc.offline_count))
}

fn print_table(results: &[OnceResult]) {
    println!("{:<15} │ {:<40} │ Status", "IP Address", "Hostname");
    println!("{}┼{}┼{}", "─".repeat(16), "─".repeat(42), "─".repeat(10));
    for r in results {
        println!("{:<15} │ {:<40} │ {}", r.ip, r.hostname, r.status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(ip: &str, online: bool) -> OnceResult {
        OnceResult {
            ip: ip.to_string(),
            hostname: "-".to_string(),
            status: if online { "Online" } else { "Offline" }.to_string(),
            online,
        }
    }

    #[test]
    fn test_retain_filtered() {
        let mut all = vec![result("10.0.0.1", true), result("10.0.0.2", false)];
        retain_filtered(&mut all, false, false);
        assert_eq!(all.len(), 2);

        let mut only_on = all.clone();
        retain_filtered(&mut only_on, true, false);
        assert_eq!(only_on.len(), 1);
        assert!(only_on[0].online);

        let mut only_off = all.clone();
        retain_filtered(&mut only_off, false, true);
        assert_eq!(only_off.len(), 1);
        assert!(!only_off[0].online);

        // Both flags together exclude every row.
        let mut both = all.clone();
        retain_filtered(&mut both, true, true);
        assert!(both.is_empty());
    }

    #[test]
    fn test_sort_results_by_ip() {
        let mut results = vec![
            result("10.0.0.10", true),
            result("badhost", false),
            result("10.0.0.2", true),
            result("::1", true),
        ];
        sort_results(&mut results);
        let ips: Vec<&str> = results.iter().map(|r| r.ip.as_str()).collect();
        assert_eq!(ips, vec!["10.0.0.2", "10.0.0.10", "::1", "badhost"]);
    }

    #[test]
    fn test_json_document_shape() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let results = vec![result("10.0.0.1", true), result("10.0.0.2", false)];
        write_json_document(tmp.path(), &results).unwrap();

        let doc: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(tmp.path()).unwrap()).unwrap();
        assert_eq!(doc["total"], 2);
        assert_eq!(doc["online_count"], 1);
        assert_eq!(doc["offline_count"], 1);
        assert_eq!(doc["hosts"][0]["ip"], "10.0.0.1");
        assert_eq!(doc["hosts"][0]["hostname"], "");
        assert_eq!(doc["hosts"][0]["online"], true);
        assert!(doc["timestamp"].as_str().unwrap().contains('T'));
    }
}
