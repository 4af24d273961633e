//! Probe strategies.
//!
//! Three interchangeable strategies (built-in ICMP, system `ping`, TCP) share
//! one capability set: start probing one target in the background, stop
//! cooperatively, and keep that target's [`Stats`] current. The orchestrator
//! only ever sees the [`Probe`] trait.

mod icmp;
mod system;
mod tcp;

pub use icmp::IcmpProbe;
pub use system::SystemPingProbe;
pub use tcp::TcpProbe;

pub(crate) use icmp::echo_once;
pub(crate) use system::ping_once;
pub(crate) use tcp::connect_once;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::config::Runtime;
use crate::stats::{unix_nanos, SharedStats, Stats};
use crate::target::{FamilyHint, Scheme, TargetSpec};
use crate::transition::TransitionSink;

/// Probe failures.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("resolution failed for {host}: {reason}")]
    Resolution { host: String, reason: String },
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("subprocess exited: {0}")]
    Subprocess(String),
}

/// Common capability set of all strategies.
pub trait Probe: Send + Sync {
    /// Begin probing. Returns promptly; resolution and socket setup happen in
    /// background tasks. A second call is a no-op.
    fn start(&self);
    /// Signal the strategy to cease. Idempotent and safe from any thread.
    fn stop(&self);
    /// The original user-supplied target string.
    fn host(&self) -> &str;
    /// Shared handle to this target's stats.
    fn stats(&self) -> SharedStats;
}

/// Result of a single probe attempt.
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    /// When the attempt completed.
    pub sent_nanos: i64,
    /// When the reply arrived; zero when there was none.
    pub recv_nanos: i64,
    pub rtt: Duration,
    /// First successful resolution, recorded once.
    pub resolved_ip: Option<IpAddr>,
    /// Hard failure description; `None` for a plain timeout.
    pub error: Option<String>,
}

impl ProbeOutcome {
    pub fn reply(now: i64, rtt: Duration) -> Self {
        Self {
            sent_nanos: now,
            recv_nanos: now,
            rtt,
            resolved_ip: None,
            error: None,
        }
    }

    pub fn silence(now: i64) -> Self {
        Self {
            sent_nanos: now,
            recv_nanos: 0,
            rtt: Duration::ZERO,
            resolved_ip: None,
            error: None,
        }
    }

    pub fn failure(now: i64, error: String) -> Self {
        Self {
            sent_nanos: now,
            recv_nanos: 0,
            rtt: Duration::ZERO,
            resolved_ip: None,
            error: Some(error),
        }
    }
}

/// Fold a probe outcome into the target's stats slot.
pub fn apply_outcome(stats: &SharedStats, outcome: ProbeOutcome) {
    let mut s = stats.lock().unwrap();
    s.last_sent_nano = outcome.sent_nanos;
    if let Some(ip) = outcome.resolved_ip {
        if s.ip_repr.is_empty() {
            s.ip_repr = ip.to_string();
        }
    }
    if outcome.recv_nanos > 0 {
        s.last_recv_nano = outcome.recv_nanos;
        s.last_rtt = outcome.rtt;
        s.has_ever_received = true;
        s.error_message.clear();
    }
    if let Some(err) = outcome.error {
        s.error_message = err;
    }
}

/// Record a resolved IP without touching the probe timestamps.
pub(crate) fn record_resolved(stats: &SharedStats, ip: IpAddr) {
    let mut s = stats.lock().unwrap();
    if s.ip_repr.is_empty() {
        s.ip_repr = ip.to_string();
    }
}

/// Record a hard failure (resolution, socket setup) outside a probe attempt.
pub(crate) fn record_failure(stats: &SharedStats, error: String) {
    let mut s = stats.lock().unwrap();
    s.last_sent_nano = unix_nanos();
    s.error_message = error;
}

/// Resolve a target in its background task, recording failures and retrying
/// until resolution succeeds or the strategy is stopped.
pub(crate) async fn resolve_with_retry(
    spec: &TargetSpec,
    stats: &SharedStats,
    stop_rx: &mut tokio::sync::watch::Receiver<bool>,
) -> Option<IpAddr> {
    const RETRY: Duration = Duration::from_secs(1);
    loop {
        match resolve_host(&spec.host, spec.family).await {
            Ok(ip) => {
                record_resolved(stats, ip);
                return Some(ip);
            }
            Err(e) => {
                record_failure(stats, e.to_string());
                tokio::select! {
                    _ = stop_rx.changed() => return None,
                    _ = tokio::time::sleep(RETRY) => {}
                }
            }
        }
    }
}

/// Resolve `host`, honoring the address-family hint.
pub async fn resolve_host(host: &str, family: FamilyHint) -> Result<IpAddr, ProbeError> {
    let family_matches = |ip: &IpAddr| match family {
        FamilyHint::Any => true,
        FamilyHint::V4 => ip.is_ipv4(),
        FamilyHint::V6 => ip.is_ipv6(),
    };

    if let Ok(ip) = host.parse::<IpAddr>() {
        if !family_matches(&ip) {
            return Err(ProbeError::Resolution {
                host: host.to_string(),
                reason: "literal does not match address-family hint".to_string(),
            });
        }
        return Ok(ip);
    }

    let addrs = tokio::net::lookup_host(format!("{}:0", host))
        .await
        .map_err(|e| ProbeError::Resolution {
            host: host.to_string(),
            reason: e.to_string(),
        })?;

    addrs
        .map(|sa| sa.ip())
        .find(family_matches)
        .ok_or_else(|| ProbeError::Resolution {
            host: host.to_string(),
            reason: "no address for requested family".to_string(),
        })
}

/// Construct the strategy for a parsed target.
///
/// ICMP targets become system-ping probes when the runtime asks for the
/// system binary.
pub fn build_probe(
    spec: TargetSpec,
    runtime: Arc<Runtime>,
    sink: Option<TransitionSink>,
) -> Arc<dyn Probe> {
    let stats = Stats::shared(spec.display_label(), sink);
    match spec.scheme {
        Scheme::Tcp => Arc::new(TcpProbe::new(spec, runtime, stats)),
        Scheme::Icmp if runtime.use_system_ping => {
            Arc::new(SystemPingProbe::new(spec, runtime, stats))
        }
        Scheme::Icmp => Arc::new(IcmpProbe::new(spec, runtime, stats)),
    }
}
