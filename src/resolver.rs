//! Periodic reverse-DNS updater.
//!
//! Gives online IP targets a friendly display label. An initial pass runs
//! three seconds after fleet start (so hosts have had a chance to come
//! online), then one pass per minute. Lookups are capped at twenty in flight
//! fleet-wide and 500 ms each; offline targets are skipped so unreachable
//! subnets never hammer the resolver.

use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

use crate::config::Runtime;
use crate::fleet::ProbeList;

const INITIAL_DELAY: Duration = Duration::from_secs(3);
const PASS_INTERVAL: Duration = Duration::from_secs(60);
const LOOKUP_TIMEOUT: Duration = Duration::from_millis(500);
const MAX_INFLIGHT: usize = 20;

pub struct DnsUpdater {
    list: Arc<ProbeList>,
    runtime: Arc<Runtime>,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
}

impl DnsUpdater {
    pub fn new(list: Arc<ProbeList>, runtime: Arc<Runtime>) -> Self {
        Self {
            list,
            runtime,
            stop_tx: Mutex::new(None),
        }
    }

    /// Spawn the periodic task. A second start while running is a no-op, as
    /// is any start with reverse DNS disabled.
    pub fn start(&self) {
        if self.runtime.skip_dns {
            return;
        }
        let mut guard = self.stop_tx.lock().unwrap();
        if guard.is_some() {
            return;
        }
        let (tx, rx) = watch::channel(false);
        *guard = Some(tx);

        let list = self.list.clone();
        tokio::spawn(run(list, rx));
    }

    /// Stop the periodic task. Idempotent.
    pub fn stop(&self) {
        if let Some(tx) = self.stop_tx.lock().unwrap().take() {
            tx.send_replace(true);
        }
    }
}

async fn run(list: Arc<ProbeList>, mut stop_rx: watch::Receiver<bool>) {
    tokio::select! {
        _ = stop_rx.changed() => return,
        _ = tokio::time::sleep(INITIAL_DELAY) => {}
    }
    run_pass(&list).await;

    loop {
        tokio::select! {
            _ = stop_rx.changed() => return,
            _ = tokio::time::sleep(PASS_INTERVAL) => run_pass(&list).await,
        }
    }
}

/// One pass: look up every online target's PTR record and rewrite its
/// display label when a name comes back.
async fn run_pass(list: &Arc<ProbeList>) {
    let sem = Arc::new(Semaphore::new(MAX_INFLIGHT));
    let mut lookups = JoinSet::new();

    for probe in list.all().iter() {
        let (online, ip_repr, current_repr) = {
            let s = probe.stats();
            let s = s.lock().unwrap();
            (s.is_online(), s.ip_repr.clone(), s.host_repr.clone())
        };
        if !online || ip_repr.is_empty() {
            continue;
        }
        let Ok(ip) = ip_repr.parse::<IpAddr>() else {
            continue;
        };

        let stats = probe.stats();
        let sem = sem.clone();
        lookups.spawn(async move {
            let _permit = match sem.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return false,
            };
            let Some(name) = reverse_lookup(ip).await else {
                return false;
            };
            let Some(new_repr) = rewrite_repr(&current_repr, &name) else {
                return false;
            };
            if new_repr == current_repr {
                return false;
            }
            stats.lock().unwrap().host_repr = new_repr;
            true
        });
    }

    let mut updated = 0;
    while let Some(res) = lookups.join_next().await {
        if matches!(res, Ok(true)) {
            updated += 1;
        }
    }
    if updated > 0 {
        tracing::debug!("updated reverse DNS names for {} hosts", updated);
    }
}

/// Best-effort PTR lookup bounded by the 500 ms deadline. A straggling
/// lookup keeps running on the blocking pool but its result is discarded.
pub(crate) async fn reverse_lookup(ip: IpAddr) -> Option<String> {
    let lookup = tokio::task::spawn_blocking(move || dns_lookup::lookup_addr(&ip));
    match tokio::time::timeout(LOOKUP_TIMEOUT, lookup).await {
        Ok(Ok(Ok(name))) => Some(name.trim_end_matches('.').to_string()),
        _ => None,
    }
}

/// Swap the name into the display label, keeping scheme and port for TCP
/// targets.
fn rewrite_repr(current: &str, name: &str) -> Option<String> {
    match current.strip_prefix("tcp://") {
        Some(rest) => {
            let (_, port) = rest.rsplit_once(':')?;
            Some(format!("tcp://{}:{}", name, port))
        }
        None => Some(name.to_string()),
    }
}
