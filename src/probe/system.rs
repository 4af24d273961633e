//! System `ping` subprocess probe.
//!
//! Spawns the OS `ping` (or `ping6`) in continuous mode and parses each
//! stdout line for a round-trip or a timeout marker. A dead subprocess is
//! recorded and respawned no sooner than a second later.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;

use super::{apply_outcome, record_failure, resolve_with_retry, Probe, ProbeOutcome};
use crate::config::Runtime;
use crate::stats::{unix_nanos, SharedStats};
use crate::target::TargetSpec;

const RESPAWN_BACKOFF: Duration = Duration::from_secs(1);
const KILL_GRACE: Duration = Duration::from_secs(2);

pub struct SystemPingProbe {
    spec: TargetSpec,
    runtime: Arc<Runtime>,
    stats: SharedStats,
    stop_tx: watch::Sender<bool>,
    started: AtomicBool,
}

impl SystemPingProbe {
    pub fn new(spec: TargetSpec, runtime: Arc<Runtime>, stats: SharedStats) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            spec,
            runtime,
            stats,
            stop_tx,
            started: AtomicBool::new(false),
        }
    }
}

impl Probe for SystemPingProbe {
    fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let spec = self.spec.clone();
        let runtime = self.runtime.clone();
        let stats = self.stats.clone();
        let stop_rx = self.stop_tx.subscribe();
        tokio::spawn(run_loop(spec, runtime, stats, stop_rx));
    }

    fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    fn host(&self) -> &str {
        &self.spec.raw
    }

    fn stats(&self) -> SharedStats {
        self.stats.clone()
    }
}

async fn run_loop(
    spec: TargetSpec,
    runtime: Arc<Runtime>,
    stats: SharedStats,
    mut stop_rx: watch::Receiver<bool>,
) {
    let Some(ip) = resolve_with_retry(&spec, &stats, &mut stop_rx).await else {
        return;
    };

    loop {
        let mut child = match spawn_ping(ip.is_ipv6(), &ip.to_string(), &runtime) {
            Ok(child) => child,
            Err(e) => {
                record_failure(&stats, format!("spawn ping: {}", e));
                tokio::select! {
                    _ = stop_rx.changed() => return,
                    _ = tokio::time::sleep(RESPAWN_BACKOFF) => continue,
                }
            }
        };

        let stdout = child.stdout.take().expect("stdout was piped");
        let mut lines = BufReader::new(stdout).lines();

        loop {
            tokio::select! {
                _ = stop_rx.changed() => {
                    terminate(&mut child).await;
                    return;
                }
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => handle_line(&stats, &line),
                        // EOF or read error: the subprocess is gone.
                        Ok(None) | Err(_) => break,
                    }
                }
            }
        }

        let status = child
            .wait()
            .await
            .map(|s| s.to_string())
            .unwrap_or_else(|e| e.to_string());
        tracing::warn!("system ping for {} exited: {}", spec.raw, status);
        apply_outcome(
            &stats,
            ProbeOutcome::failure(unix_nanos(), format!("ping exited: {}", status)),
        );

        tokio::select! {
            _ = stop_rx.changed() => return,
            _ = tokio::time::sleep(RESPAWN_BACKOFF) => {}
        }
    }
}

/// Single `ping -c 1` run for one-shot mode.
pub(crate) async fn ping_once(
    v6: bool,
    addr: &str,
    timeout: Duration,
    extra_options: &[String],
) -> Result<Option<Duration>, super::ProbeError> {
    let program = if v6 { "ping6" } else { "ping" };
    let timeout_secs = timeout.as_secs().max(1);
    let mut cmd = Command::new(program);
    cmd.args(["-c", "1", "-W", &timeout_secs.to_string()]);
    for opt in extra_options {
        cmd.arg(opt);
    }
    let output = cmd
        .arg(addr)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| super::ProbeError::Subprocess(format!("failed to run {}: {}", program, e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    // No parsable reply means no response, whatever the exit status says.
    Ok(stdout.lines().find_map(parse_rtt_line))
}

fn spawn_ping(v6: bool, addr: &str, runtime: &Runtime) -> std::io::Result<Child> {
    let program = if v6 { "ping6" } else { "ping" };
    let mut cmd = Command::new(program);
    // Continuous mode: no count flag. -O makes Linux ping report unanswered
    // probes, which is our timeout marker.
    #[cfg(target_os = "linux")]
    cmd.arg("-O");
    for opt in &runtime.system_ping_options {
        cmd.arg(opt);
    }
    cmd.arg(addr)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    cmd.spawn()
}

fn handle_line(stats: &SharedStats, line: &str) {
    let now = unix_nanos();
    if let Some(rtt) = parse_rtt_line(line) {
        apply_outcome(stats, ProbeOutcome::reply(now, rtt));
    } else if is_timeout_marker(line) {
        apply_outcome(stats, ProbeOutcome::silence(now));
    }
}

/// Extract the round-trip from a reply line such as
/// `64 bytes from 8.8.8.8: icmp_seq=1 ttl=117 time=12.3 ms`.
fn parse_rtt_line(line: &str) -> Option<Duration> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"time[=<](?P<val>[0-9.]+)\s*ms").unwrap());
    let caps = re.captures(line)?;
    let ms: f64 = caps.name("val")?.as_str().parse().ok()?;
    Some(Duration::from_nanos((ms * 1_000_000.0) as u64))
}

fn is_timeout_marker(line: &str) -> bool {
    line.contains("no answer yet")
        || line.contains("Request timeout")
        || line.contains("Destination Host Unreachable")
}

/// Signal first, kill after the grace window, then reap.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: sending a signal to our own child pid.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
    if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
        let _ = child.kill().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reply_line() {
        let rtt =
            parse_rtt_line("64 bytes from 8.8.8.8: icmp_seq=1 ttl=117 time=12.3 ms").unwrap();
        assert_eq!(rtt, Duration::from_micros(12_300));
    }

    #[test]
    fn test_parse_sub_millisecond_reply() {
        let rtt = parse_rtt_line("64 bytes from 10.0.0.1: icmp_seq=4 ttl=64 time=0.051 ms")
            .unwrap();
        assert_eq!(rtt, Duration::from_nanos(51_000));
    }

    #[test]
    fn test_parse_time_less_than() {
        // Windows-style output uses `time<1ms`.
        assert!(parse_rtt_line("Reply from 10.0.0.1: bytes=32 time<1ms TTL=64").is_some());
    }

    #[test]
    fn test_timeout_markers() {
        assert!(is_timeout_marker("no answer yet for icmp_seq=42"));
        assert!(is_timeout_marker("Request timeout for icmp_seq 3"));
        assert!(!is_timeout_marker("PING 8.8.8.8 (8.8.8.8) 56(84) bytes of data."));
    }

    #[test]
    fn test_statistics_lines_ignored() {
        assert!(parse_rtt_line("--- 8.8.8.8 ping statistics ---").is_none());
        assert!(parse_rtt_line("3 packets transmitted, 3 received, 0% packet loss").is_none());
    }
}
