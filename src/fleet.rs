//! Fleet orchestration.
//!
//! The fleet owns the ordered probe list, the transition sink handle and the
//! reverse-DNS updater. Startup of a large fleet is shaped by a concurrency
//! semaphore and a small stagger so hundreds of targets neither serialize on
//! DNS nor storm the local subnet with ARP traffic.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::Runtime;
use crate::probe::{build_probe, Probe};
use crate::resolver::DnsUpdater;
use crate::target::TargetSpec;
use crate::transition::TransitionSink;

const MAX_CONCURRENT_STARTS: usize = 20;
const STAGGER_DELAY: Duration = Duration::from_millis(1);
const STARTUP_BUDGET: Duration = Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("fleet startup exceeded {STARTUP_BUDGET:?}")]
    StartupTimeout,
}

/// Swappable, immutable probe list shared by the fleet and the resolver.
///
/// Writers replace the whole `Arc`; readers clone it and iterate without
/// holding the lock.
pub struct ProbeList {
    inner: RwLock<Arc<Vec<Arc<dyn Probe>>>>,
}

impl ProbeList {
    fn new() -> Self {
        Self {
            inner: RwLock::new(Arc::new(Vec::new())),
        }
    }

    pub fn all(&self) -> Arc<Vec<Arc<dyn Probe>>> {
        self.inner.read().unwrap().clone()
    }

    /// Install a new list, returning the previous one for teardown.
    fn install(&self, probes: Vec<Arc<dyn Probe>>) -> Arc<Vec<Arc<dyn Probe>>> {
        let mut guard = self.inner.write().unwrap();
        std::mem::replace(&mut *guard, Arc::new(probes))
    }
}

pub struct Fleet {
    list: Arc<ProbeList>,
    runtime: Arc<Runtime>,
    sink: Option<TransitionSink>,
    dns: DnsUpdater,
    replace_lock: tokio::sync::Mutex<()>,
}

impl Fleet {
    /// Construct one strategy per target without starting any of them.
    pub fn new(
        specs: Vec<TargetSpec>,
        runtime: Arc<Runtime>,
        sink: Option<TransitionSink>,
    ) -> Arc<Self> {
        let list = Arc::new(ProbeList::new());
        let probes = specs
            .into_iter()
            .map(|spec| build_probe(spec, runtime.clone(), sink.clone()))
            .collect();
        list.install(probes);

        let dns = DnsUpdater::new(list.clone(), runtime.clone());
        Arc::new(Self {
            list,
            runtime,
            sink,
            dns,
            replace_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Launch every strategy under the shaping rules, then the resolver.
    ///
    /// Bounded by a 60 s wall budget; exceeding it stops the fleet cleanly.
    pub async fn start(&self) -> Result<(), FleetError> {
        let probes = self.list.all();
        tracing::info!("starting {} probes", probes.len());

        match tokio::time::timeout(STARTUP_BUDGET, start_probes(&probes)).await {
            Ok(()) => {
                self.dns.start();
                Ok(())
            }
            Err(_) => {
                tracing::error!("fleet startup timed out, stopping");
                self.stop();
                Err(FleetError::StartupTimeout)
            }
        }
    }

    /// Stop the resolver, then every strategy. Idempotent.
    pub fn stop(&self) {
        self.dns.stop();
        for probe in self.list.all().iter() {
            probe.stop();
        }
    }

    /// Atomically swap in a new target set.
    ///
    /// Readers observe either the old list or the new one, never a mix; the
    /// old strategies are torn down off the lock.
    pub async fn replace(&self, specs: Vec<TargetSpec>) {
        let _guard = self.replace_lock.lock().await;

        self.dns.stop();

        let probes: Vec<Arc<dyn Probe>> = specs
            .into_iter()
            .map(|spec| build_probe(spec, self.runtime.clone(), self.sink.clone()))
            .collect();
        let old = self.list.install(probes);

        tokio::spawn(async move {
            for probe in old.iter() {
                probe.stop();
            }
        });

        start_probes(&self.list.all()).await;
        self.dns.start();
    }

    /// Defensive copy of the current ordered list.
    pub fn wrappers(&self) -> Vec<Arc<dyn Probe>> {
        self.list.all().as_ref().clone()
    }

    /// Run the state fold on every target. Safe alongside live probes since
    /// each Stats carries its own lock.
    pub fn compute_all(&self, timeout_threshold: i64) {
        for probe in self.list.all().iter() {
            probe.stats().lock().unwrap().compute_state(timeout_threshold);
        }
    }

    #[cfg(test)]
    pub(crate) fn with_probes(probes: Vec<Arc<dyn Probe>>, runtime: Arc<Runtime>) -> Arc<Self> {
        let list = Arc::new(ProbeList::new());
        list.install(probes);
        let dns = DnsUpdater::new(list.clone(), runtime.clone());
        Arc::new(Self {
            list,
            runtime,
            sink: None,
            dns,
            replace_lock: tokio::sync::Mutex::new(()),
        })
    }
}

/// Start strategies with bounded concurrency, a small stagger, and per-start
/// isolation: one panicking start is logged and marked failed without
/// touching its neighbors.
async fn start_probes(probes: &Arc<Vec<Arc<dyn Probe>>>) {
    let sem = Arc::new(Semaphore::new(MAX_CONCURRENT_STARTS));
    let mut starts = JoinSet::new();
    let total = probes.len();

    for (i, probe) in probes.iter().enumerate() {
        let probe = probe.clone();
        let sem = sem.clone();
        starts.spawn(async move {
            let _permit = match sem.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            let host = probe.host().to_string();
            let stats = probe.stats();
            let isolated = tokio::spawn(async move { probe.start() });
            if let Err(e) = isolated.await {
                if e.is_panic() {
                    tracing::error!("panic starting probe for {}: {}", host, e);
                    stats.lock().unwrap().error_message = format!("start failed: {}", e);
                }
            }
        });

        if i >= 10 && i + 1 < total && i % 10 == 0 {
            tokio::time::sleep(STAGGER_DELAY).await;
        }
    }

    while starts.join_next().await.is_some() {}
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::stats::{SharedStats, Stats};
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) struct MockProbe {
        host: String,
        stats: SharedStats,
        pub starts: AtomicUsize,
        pub stops: AtomicUsize,
    }

    impl MockProbe {
        pub(crate) fn new(host: &str) -> Arc<Self> {
            Arc::new(Self {
                host: host.to_string(),
                stats: Stats::shared(host.to_string(), None),
                starts: AtomicUsize::new(0),
                stops: AtomicUsize::new(0),
            })
        }
    }

    impl Probe for MockProbe {
        fn start(&self) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }
        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
        fn host(&self) -> &str {
            &self.host
        }
        fn stats(&self) -> SharedStats {
            self.stats.clone()
        }
    }

    fn hosts_of(fleet: &Fleet) -> Vec<String> {
        fleet
            .wrappers()
            .iter()
            .map(|p| p.host().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_start_reaches_every_probe() {
        let probes: Vec<Arc<MockProbe>> = (0..50)
            .map(|i| MockProbe::new(&format!("10.0.0.{}", i)))
            .collect();
        let dyn_probes: Vec<Arc<dyn Probe>> =
            probes.iter().map(|p| p.clone() as Arc<dyn Probe>).collect();
        let fleet = Fleet::with_probes(dyn_probes, Arc::new(Runtime::default()));

        fleet.start().await.unwrap();
        for p in &probes {
            assert_eq!(p.starts.load(Ordering::SeqCst), 1);
        }
        fleet.stop();
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let a = MockProbe::new("a");
        let fleet = Fleet::with_probes(
            vec![a.clone() as Arc<dyn Probe>],
            Arc::new(Runtime::default()),
        );
        fleet.stop();
        fleet.stop();
        assert_eq!(a.stops.load(Ordering::SeqCst), 2);
        // Stats untouched; a second stop is a no-op for the probe contract.
    }

    #[tokio::test]
    async fn test_wrappers_is_a_defensive_copy() {
        let fleet = Fleet::with_probes(
            vec![MockProbe::new("a") as Arc<dyn Probe>],
            Arc::new(Runtime::default()),
        );
        let mut copy = fleet.wrappers();
        copy.clear();
        assert_eq!(fleet.wrappers().len(), 1);
    }

    #[tokio::test]
    async fn test_compute_all_initializes_every_target() {
        let fleet = Fleet::with_probes(
            vec![
                MockProbe::new("a") as Arc<dyn Probe>,
                MockProbe::new("b") as Arc<dyn Probe>,
            ],
            Arc::new(Runtime::default()),
        );
        fleet.compute_all(2_000_000_000);
        for p in fleet.wrappers() {
            assert!(p.stats().lock().unwrap().state_initialized);
        }
    }

    #[tokio::test]
    async fn test_replace_swaps_whole_list() {
        let a = MockProbe::new("203.0.113.1");
        let b = MockProbe::new("203.0.113.2");
        let fleet = Fleet::with_probes(
            vec![a.clone() as Arc<dyn Probe>, b.clone() as Arc<dyn Probe>],
            Arc::new(Runtime::default()),
        );
        assert_eq!(hosts_of(&fleet), vec!["203.0.113.1", "203.0.113.2"]);

        let new_specs = vec![
            TargetSpec::parse("203.0.113.2").unwrap(),
            TargetSpec::parse("203.0.113.3").unwrap(),
        ];
        fleet.replace(new_specs.clone()).await;
        assert_eq!(hosts_of(&fleet), vec!["203.0.113.2", "203.0.113.3"]);

        // Old probes were handed to the teardown task.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(a.stops.load(Ordering::SeqCst) >= 1);
        assert!(b.stops.load(Ordering::SeqCst) >= 1);

        // Replacing with the same set is observably identical.
        fleet.replace(new_specs).await;
        assert_eq!(hosts_of(&fleet), vec!["203.0.113.2", "203.0.113.3"]);
        fleet.stop();
    }
}
