//! Snapshot cache.
//!
//! A single tick task folds every target's state and installs a fresh
//! point-in-time copy behind an atomic pointer. Views only ever read the
//! installed snapshot; they never walk the live probe list or run the fold
//! themselves, so render work stays O(N) no matter how many views are open.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::Runtime;
use crate::fleet::Fleet;
use crate::stats::{unix_nanos, Stats};

/// Point-in-time copy of every target's stats, in fleet order.
pub struct Snapshot {
    pub taken_nanos: i64,
    order: Vec<String>,
    entries: HashMap<String, Stats>,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self {
            taken_nanos: 0,
            order: Vec::new(),
            entries: HashMap::new(),
        }
    }

    /// Copy the current stats of every probe in the fleet.
    pub fn capture(fleet: &Fleet, taken_nanos: i64) -> Self {
        let wrappers = fleet.wrappers();
        let mut order = Vec::with_capacity(wrappers.len());
        let mut entries = HashMap::with_capacity(wrappers.len());
        for probe in wrappers {
            let host = probe.host().to_string();
            let stats = probe.stats().lock().unwrap().clone();
            order.push(host.clone());
            entries.insert(host, stats);
        }
        Self {
            taken_nanos,
            order,
            entries,
        }
    }

    /// Stats for `host`, or a zero-value record (`state == false`) when the
    /// host is not in this snapshot. Never blocks, never computes.
    pub fn get(&self, host: &str) -> Stats {
        self.entries.get(host).cloned().unwrap_or_default()
    }

    pub fn hosts(&self) -> &[String] {
        &self.order
    }

    /// Rows in fleet order.
    pub fn rows(&self) -> impl Iterator<Item = (&str, &Stats)> {
        self.order
            .iter()
            .filter_map(|h| self.entries.get(h).map(|s| (h.as_str(), s)))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Holder of the current snapshot; installs are a single pointer swap.
pub struct SnapshotCache {
    current: ArcSwap<Snapshot>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(Snapshot::empty()),
        }
    }

    /// One atomic pointer read.
    pub fn load(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }

    pub fn install(&self, snapshot: Snapshot) {
        self.current.store(Arc::new(snapshot));
    }
}

impl Default for SnapshotCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn the tick task: fold all stats, then swap a fresh snapshot in.
pub fn spawn_ticker(
    cache: Arc<SnapshotCache>,
    fleet: Arc<Fleet>,
    runtime: Arc<Runtime>,
    mut stop_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(runtime.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = stop_rx.wait_for(|s| *s) => return,
                _ = interval.tick() => {
                    fleet.compute_all(runtime.timeout_threshold_nanos);
                    cache.install(Snapshot::capture(&fleet, unix_nanos()));
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Runtime;
    use crate::fleet::tests::MockProbe;
    use crate::probe::Probe;
    use crate::target::TargetSpec;

    fn fleet_of(hosts: &[&str]) -> Arc<Fleet> {
        let probes = hosts
            .iter()
            .map(|h| MockProbe::new(h) as Arc<dyn Probe>)
            .collect();
        Fleet::with_probes(probes, Arc::new(Runtime::default()))
    }

    #[test]
    fn test_miss_returns_zero_value() {
        let snap = Snapshot::empty();
        let stats = snap.get("nowhere");
        assert!(!stats.state);
        assert!(!stats.has_ever_received);
        assert_eq!(stats.last_recv_nano, 0);
    }

    #[tokio::test]
    async fn test_capture_preserves_fleet_order() {
        let fleet = fleet_of(&["c", "a", "b"]);
        let snap = Snapshot::capture(&fleet, 1);
        assert_eq!(snap.hosts(), &["c", "a", "b"]);
        assert_eq!(snap.rows().count(), 3);
    }

    #[tokio::test]
    async fn test_install_swaps_whole_snapshot() {
        let cache = SnapshotCache::new();
        let fleet = fleet_of(&["a"]);
        cache.install(Snapshot::capture(&fleet, 1));
        let first = cache.load();
        cache.install(Snapshot::capture(&fleet, 2));
        let second = cache.load();
        // The earlier Arc stays valid and untouched.
        assert_eq!(first.taken_nanos, 1);
        assert_eq!(second.taken_nanos, 2);
    }

    #[tokio::test]
    async fn test_replace_never_yields_mixed_snapshot() {
        let fleet = fleet_of(&["203.0.113.1", "203.0.113.2"]);
        let cache = SnapshotCache::new();

        cache.install(Snapshot::capture(&fleet, unix_nanos()));
        let before = cache.load();
        assert_eq!(before.hosts(), &["203.0.113.1", "203.0.113.2"]);

        fleet
            .replace(vec![
                TargetSpec::parse("203.0.113.2").unwrap(),
                TargetSpec::parse("203.0.113.3").unwrap(),
            ])
            .await;
        cache.install(Snapshot::capture(&fleet, unix_nanos()));
        let after = cache.load();
        assert_eq!(after.hosts(), &["203.0.113.2", "203.0.113.3"]);

        // Neither snapshot mixes generations.
        assert!(!before.hosts().contains(&"203.0.113.3".to_string()));
        assert!(!after.hosts().contains(&"203.0.113.1".to_string()));
        fleet.stop();
    }
}
