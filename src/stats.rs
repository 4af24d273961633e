//! Per-target derived state.
//!
//! Probes write receive timestamps into [`Stats`]; the snapshot tick folds
//! them into an up/down signal with [`Stats::compute_state`]. Each Stats is
//! guarded by its own mutex and shared as [`SharedStats`]; a plain `clone()`
//! of the inner value is the unit copied into snapshots.

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::transition::{TransitionRecord, TransitionSink};

pub type SharedStats = Arc<Mutex<Stats>>;

/// Wall-clock Unix nanoseconds, the time base for every Stats field.
pub fn unix_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Default)]
pub struct Stats {
    /// When the most recent probe attempt completed.
    pub last_sent_nano: i64,
    /// When the most recent reply arrived; zero until the first reply.
    pub last_recv_nano: i64,
    /// Round-trip of the last successful probe; meaningless while
    /// `last_recv_nano == 0`.
    pub last_rtt: Duration,
    /// Derived on every compute: `now - last_recv_nano`.
    pub last_seen_nano: i64,
    pub state: bool,
    pub state_initialized: bool,
    /// Monotonic: set on the first reply, never cleared.
    pub has_ever_received: bool,
    /// When the most recent down-to-up transition was recorded.
    pub last_loss_nano: i64,
    /// How long that outage lasted.
    pub last_loss_duration: i64,
    /// Down-to-up timestamp used for "newly online" highlighting.
    pub last_up_transition: i64,
    /// Total nanoseconds spent online, preserved across toggles.
    pub uptime_nano: i64,
    /// Non-empty iff the strategy hit a hard failure; cleared on success.
    pub error_message: String,
    /// Display label: IP, hostname, or reverse-DNS name (scheme/port kept
    /// for TCP targets).
    pub host_repr: String,
    /// Resolved IP as a string.
    pub ip_repr: String,

    suppress_next_up_highlight: bool,
    startup_time: i64,
    last_compute: i64,
    sink: Option<TransitionSink>,
}

impl Stats {
    pub fn new(host_repr: String, sink: Option<TransitionSink>) -> Self {
        Self {
            host_repr,
            sink,
            ..Default::default()
        }
    }

    pub fn shared(host_repr: String, sink: Option<TransitionSink>) -> SharedStats {
        Arc::new(Mutex::new(Self::new(host_repr, sink)))
    }

    /// Online means alive and free of hard errors.
    pub fn is_online(&self) -> bool {
        self.state && self.error_message.is_empty()
    }

    /// Fold the current receive timestamp into the up/down signal.
    pub fn compute_state(&mut self, timeout_threshold: i64) {
        self.compute_state_at(unix_nanos(), timeout_threshold);
    }

    /// Deterministic fold step; `now` is injected so tests control the clock.
    pub fn compute_state_at(&mut self, now: i64, timeout_threshold: i64) {
        if self.startup_time == 0 {
            self.startup_time = now;
        }
        if self.last_compute == 0 {
            self.last_compute = now;
        }

        let prev_state = self.state;
        let prev_seen = self.state_initialized;

        let old_last_seen = self.last_seen_nano;
        self.last_seen_nano = now - self.last_recv_nano;
        let new_state = self.last_seen_nano < timeout_threshold;

        if !prev_seen {
            // First observation establishes the baseline without marking a
            // transition or a highlight.
            self.state_initialized = true;
            self.suppress_next_up_highlight = true;
            self.state = new_state;
            self.last_compute = now;
            return;
        }

        if prev_state {
            self.uptime_nano += now - self.last_compute;
        }

        if !prev_state && new_state {
            if self.suppress_next_up_highlight {
                self.suppress_next_up_highlight = false;
            } else {
                self.last_up_transition = now;
            }
            self.last_loss_nano = now;
            self.last_loss_duration = old_last_seen;
        }

        if self.state != new_state {
            if let Some(sink) = &self.sink {
                sink.write(TransitionRecord::new(
                    now,
                    &self.host_repr,
                    &self.ip_repr,
                    new_state,
                ));
            }
        }

        self.state = new_state;
        self.last_compute = now;
    }

    /// Accumulated online time as of `now`, including the current up stretch.
    pub fn online_uptime(&self, now: i64) -> Duration {
        let mut total = self.uptime_nano;
        if self.state {
            total += now - self.last_compute;
        }
        Duration::from_nanos(total.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transition::TransitionRecord;
    use tokio::sync::mpsc;

    const SEC: i64 = 1_000_000_000;
    const THRESHOLD: i64 = 2 * SEC;

    fn capturing_stats() -> (Stats, mpsc::UnboundedReceiver<TransitionRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut s = Stats::new("host".to_string(), Some(TransitionSink::from_sender(tx)));
        s.ip_repr = "10.0.0.1".to_string();
        (s, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<TransitionRecord>) -> Vec<TransitionRecord> {
        let mut out = Vec::new();
        while let Ok(r) = rx.try_recv() {
            out.push(r);
        }
        out
    }

    #[test]
    fn test_first_compute_initializes_without_record() {
        let (mut s, mut rx) = capturing_stats();
        s.last_recv_nano = 10 * SEC;
        s.compute_state_at(10 * SEC + 1, THRESHOLD);
        assert!(s.state_initialized);
        assert!(s.state);
        assert_eq!(s.last_up_transition, 0);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_state_initialized_is_monotonic() {
        let (mut s, _rx) = capturing_stats();
        s.compute_state_at(SEC, THRESHOLD);
        assert!(s.state_initialized);
        for i in 2..50 {
            s.compute_state_at(i * SEC, THRESHOLD);
            assert!(s.state_initialized);
        }
    }

    #[test]
    fn test_alive_then_blackhole() {
        let (mut s, mut rx) = capturing_stats();
        let t0 = 100 * SEC;

        // Replies for 5 seconds, one per second.
        s.last_recv_nano = t0;
        s.compute_state_at(t0, THRESHOLD);
        for i in 1..=5 {
            s.last_recv_nano = t0 + i * SEC;
            s.compute_state_at(t0 + i * SEC, THRESHOLD);
            assert!(s.state);
        }
        assert!(drain(&mut rx).is_empty(), "no record while staying up");

        // Then silence for 10 seconds.
        let mut down_records = 0;
        for i in 6..=15 {
            s.compute_state_at(t0 + i * SEC, THRESHOLD);
            down_records += drain(&mut rx).len();
        }
        assert!(!s.state);
        assert_eq!(down_records, 1, "exactly one up-to-down record");
        // Uptime credit stops once the outage crosses the threshold, so the
        // total lands between the true 5 s and 5 s plus the detection lag.
        assert!(s.uptime_nano >= 5 * SEC && s.uptime_nano <= 5 * SEC + THRESHOLD);
        assert!(s.last_seen_nano >= 2 * SEC);
    }

    #[test]
    fn test_flap_records_and_loss_durations() {
        let (mut s, mut rx) = capturing_stats();
        let t0 = 1000 * SEC;

        // Baseline: up.
        s.last_recv_nano = t0;
        s.compute_state_at(t0, THRESHOLD);

        // Alternate 3 s down, 3 s up for 30 s; compute once per second.
        let mut ups = 0;
        let mut downs = 0;
        for i in 1..=30 {
            let now = t0 + i * SEC;
            let phase_down = ((i - 1) / 3) % 2 == 0;
            if !phase_down {
                s.last_recv_nano = now;
            }
            s.compute_state_at(now, THRESHOLD);
            for r in drain(&mut rx) {
                if r.state {
                    ups += 1;
                    assert_eq!(r.transition, "down to up");
                } else {
                    downs += 1;
                    assert_eq!(r.transition, "up to down");
                }
            }
        }
        assert_eq!(ups, 5);
        assert_eq!(downs, 5);
        // The last recorded outage lasted about 3 s (plus the threshold lag).
        assert!(s.last_loss_duration >= 3 * SEC && s.last_loss_duration <= 6 * SEC);
        // Roughly half the window was spent online (threshold lag credits a
        // second of each outage before it is detected).
        assert!((s.uptime_nano - 15 * SEC).abs() <= 6 * SEC);
    }

    #[test]
    fn test_uptime_never_decreases() {
        let (mut s, _rx) = capturing_stats();
        let t0 = 50 * SEC;
        s.last_recv_nano = t0;
        let mut prev = 0;
        for i in 0..100 {
            let now = t0 + i * SEC;
            if i % 7 != 0 {
                s.last_recv_nano = now;
            }
            s.compute_state_at(now, THRESHOLD);
            assert!(s.uptime_nano >= prev);
            prev = s.uptime_nano;
        }
    }

    #[test]
    fn test_online_uptime_monotonic_in_wall_time() {
        let (mut s, _rx) = capturing_stats();
        let t0 = 7 * SEC;
        s.last_recv_nano = t0;
        s.compute_state_at(t0, THRESHOLD);
        s.compute_state_at(t0 + SEC, THRESHOLD);
        let a = s.online_uptime(t0 + SEC);
        let b = s.online_uptime(t0 + 2 * SEC);
        let c = s.online_uptime(t0 + 3 * SEC);
        assert!(a <= b && b <= c);
    }

    #[test]
    fn test_first_up_edge_suppresses_highlight_but_records_loss() {
        let (mut s, mut rx) = capturing_stats();
        let t0 = 500 * SEC;

        // Baseline down: no reply yet.
        s.compute_state_at(t0, THRESHOLD);
        assert!(!s.state);

        // First reply arrives: up edge.
        s.last_recv_nano = t0 + 5 * SEC;
        s.compute_state_at(t0 + 5 * SEC, THRESHOLD);
        assert!(s.state);
        assert_eq!(s.last_up_transition, 0, "highlight suppressed");
        assert_eq!(s.last_loss_nano, t0 + 5 * SEC, "loss still recorded");
        let recs = drain(&mut rx);
        assert_eq!(recs.len(), 1);
        assert!(recs[0].state);

        // Second outage and recovery gets the highlight.
        s.compute_state_at(t0 + 10 * SEC, THRESHOLD);
        assert!(!s.state);
        s.last_recv_nano = t0 + 13 * SEC;
        s.compute_state_at(t0 + 13 * SEC, THRESHOLD);
        assert_eq!(s.last_up_transition, t0 + 13 * SEC);
    }

    #[test]
    fn test_up_record_matches_highlight_timestamp() {
        let (mut s, mut rx) = capturing_stats();
        let t0 = 300 * SEC;
        s.last_recv_nano = t0;
        s.compute_state_at(t0, THRESHOLD);

        // First outage/recovery consumes the startup suppression.
        s.compute_state_at(t0 + 5 * SEC, THRESHOLD);
        s.last_recv_nano = t0 + 9 * SEC;
        s.compute_state_at(t0 + 9 * SEC, THRESHOLD);
        drain(&mut rx);

        // The next recovery carries the highlight timestamp.
        s.compute_state_at(t0 + 14 * SEC, THRESHOLD);
        drain(&mut rx);
        s.last_recv_nano = t0 + 17 * SEC;
        s.compute_state_at(t0 + 17 * SEC, THRESHOLD);
        let recs = drain(&mut rx);
        assert_eq!(recs.len(), 1);
        assert!(recs[0].state);
        assert_eq!(recs[0].unix_nano, s.last_up_transition);
        assert_eq!(s.last_up_transition, t0 + 17 * SEC);
    }

    #[test]
    fn test_zero_threshold_means_down() {
        let (mut s, _rx) = capturing_stats();
        let now = 42 * SEC;
        s.last_recv_nano = now;
        s.compute_state_at(now, 0);
        // last_seen == 0 is not strictly below a zero threshold.
        assert!(!s.state);
    }

    #[test]
    fn test_silent_target_stays_zeroed() {
        let (mut s, mut rx) = capturing_stats();
        let t0 = 9000 * SEC;
        for i in 0..600 {
            s.compute_state_at(t0 + i * SEC, THRESHOLD);
        }
        assert!(!s.state);
        assert!(!s.has_ever_received);
        assert_eq!(s.last_loss_nano, 0);
        assert_eq!(s.uptime_nano, 0);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_stats_without_sink_is_silent() {
        let mut s = Stats::new("h".to_string(), None);
        s.last_recv_nano = SEC;
        s.compute_state_at(SEC, THRESHOLD);
        s.compute_state_at(10 * SEC, THRESHOLD);
        assert!(!s.state);
    }
}
