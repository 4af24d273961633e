//! Runtime configuration.
//!
//! Every knob is carried explicitly on a [`Runtime`] value constructed once
//! at startup and threaded into the components that need it. There is no
//! process-wide mutable state.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Immutable runtime configuration shared across components.
#[derive(Debug, Clone)]
pub struct Runtime {
    /// Enable debug-level diagnostics.
    pub debug: bool,
    /// Skip all reverse DNS lookups (faster startup for large subnets).
    pub skip_dns: bool,
    /// Prefer raw-socket ICMP even where unprivileged sockets would work.
    pub privileged: bool,
    /// Use the system `ping` binary instead of the built-in ICMP prober.
    pub use_system_ping: bool,
    /// Extra arguments passed through to the system `ping` command.
    pub system_ping_options: Vec<String>,
    /// ICMP payload size in bytes (without the 28-byte header).
    pub payload_size: usize,
    /// Per-attempt probe timeout.
    pub probe_timeout: Duration,
    /// Cadence of probe attempts per target.
    pub probe_interval: Duration,
    /// Aliveness cutoff: a target is up while `now - last_recv` stays below this.
    pub timeout_threshold_nanos: i64,
    /// Snapshot cache refresh cadence.
    pub tick_interval: Duration,
    /// Port for the read-only status server (0 disables it).
    pub web_port: u16,
    /// Transition log file, if any.
    pub log_path: Option<PathBuf>,
    /// Suppress the live terminal table.
    pub quiet: bool,
}

impl Default for Runtime {
    fn default() -> Self {
        Self {
            debug: false,
            skip_dns: false,
            privileged: false,
            use_system_ping: false,
            system_ping_options: Vec::new(),
            payload_size: 24,
            probe_timeout: Duration::from_secs(1),
            probe_interval: Duration::from_secs(1),
            timeout_threshold_nanos: 2_000_000_000,
            tick_interval: Duration::from_millis(100),
            web_port: 8080,
            log_path: None,
            quiet: false,
        }
    }
}

impl Runtime {
    /// Apply environment overrides for service knobs.
    ///
    /// Environment variables:
    /// - `PINGFLEET_WEB_PORT`: status server port
    /// - `PINGFLEET_TICK_MS`: snapshot refresh cadence in milliseconds
    pub fn apply_env(&mut self) {
        if let Ok(port_str) = env::var("PINGFLEET_WEB_PORT") {
            if let Ok(port) = port_str.parse() {
                self.web_port = port;
            }
        }

        if let Ok(ms_str) = env::var("PINGFLEET_TICK_MS") {
            if let Ok(ms) = ms_str.parse::<u64>() {
                if ms > 0 {
                    self.tick_interval = Duration::from_millis(ms);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_runtime() {
        let rt = Runtime::default();
        assert_eq!(rt.web_port, 8080);
        assert_eq!(rt.payload_size, 24);
        assert_eq!(rt.timeout_threshold_nanos, 2_000_000_000);
        assert_eq!(rt.tick_interval, Duration::from_millis(100));
        assert!(!rt.use_system_ping);
    }
}
