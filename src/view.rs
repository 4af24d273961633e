//! View adapters.
//!
//! A view is a pure function from a snapshot and a [`ViewConfig`] to a
//! presentation order. Filters and sorts are total: equal keys fall back to
//! the host string so the output order is always deterministic. Column
//! rendering here is shared by the terminal table and the HTTP text surface.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashSet};
use std::net::IpAddr;
use std::time::Duration;

use crate::snapshot::Snapshot;
use crate::stats::Stats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterMode {
    All,
    #[default]
    Smart,
    Online,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortMode {
    Name,
    Status,
    Rtt,
    LastSeen,
    #[default]
    Ip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Column {
    Status,
    Name,
    Ip,
    Rtt,
    LastReply,
    LastLoss,
}

impl Column {
    pub fn all() -> BTreeSet<Column> {
        [
            Column::Status,
            Column::Name,
            Column::Ip,
            Column::Rtt,
            Column::LastReply,
            Column::LastLoss,
        ]
        .into_iter()
        .collect()
    }

    pub fn label(&self) -> &'static str {
        match self {
            Column::Status => "St",
            Column::Name => "Name",
            Column::Ip => "IP",
            Column::Rtt => "RTT",
            Column::LastReply => "Last Reply",
            Column::LastLoss => "Last Loss",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ViewConfig {
    pub filter: FilterMode,
    pub sort: SortMode,
    pub hidden: HashSet<String>,
    pub visible_columns: BTreeSet<Column>,
}

impl Default for ViewConfig {
    fn default() -> Self {
        Self {
            filter: FilterMode::default(),
            sort: SortMode::default(),
            hidden: HashSet::new(),
            visible_columns: Column::all(),
        }
    }
}

/// One presentable entry: the target's key plus its stats copy.
#[derive(Debug, Clone)]
pub struct Row {
    pub host: String,
    pub stats: Stats,
}

impl Row {
    /// Display name: the (possibly reverse-resolved) label, falling back to
    /// the original host string.
    pub fn display_name(&self) -> &str {
        if self.stats.host_repr.is_empty() {
            &self.host
        } else {
            &self.stats.host_repr
        }
    }
}

/// Filter and order a snapshot for presentation.
pub fn apply_view(snapshot: &Snapshot, cfg: &ViewConfig) -> Vec<Row> {
    let mut rows: Vec<Row> = snapshot
        .rows()
        .filter(|(host, stats)| !cfg.hidden.contains(*host) && passes_filter(cfg.filter, stats))
        .map(|(host, stats)| Row {
            host: host.to_string(),
            stats: stats.clone(),
        })
        .collect();

    sort_rows(&mut rows, cfg.sort);
    rows
}

fn passes_filter(filter: FilterMode, stats: &Stats) -> bool {
    match filter {
        FilterMode::All => true,
        FilterMode::Smart => stats.state || stats.has_ever_received,
        FilterMode::Online => stats.is_online(),
        FilterMode::Offline => !stats.is_online(),
    }
}

fn sort_rows(rows: &mut [Row], sort: SortMode) {
    match sort {
        SortMode::Name => rows.sort_by(|a, b| {
            online_first(a, b)
                .then_with(|| a.display_name().cmp(b.display_name()))
                .then_with(|| a.host.cmp(&b.host))
        }),
        SortMode::Status => rows.sort_by(|a, b| online_first(a, b).then_with(|| a.host.cmp(&b.host))),
        SortMode::Rtt => rows.sort_by(|a, b| {
            online_first(a, b)
                .then_with(|| a.stats.last_rtt.cmp(&b.stats.last_rtt))
                .then_with(|| a.host.cmp(&b.host))
        }),
        SortMode::LastSeen => rows.sort_by(|a, b| {
            let (oa, ob) = (a.stats.is_online(), b.stats.is_online());
            if oa != ob {
                // Offline first: the hosts needing attention float to the top.
                return oa.cmp(&ob);
            }
            let ord = if !oa {
                match (a.stats.last_recv_nano == 0, b.stats.last_recv_nano == 0) {
                    (true, true) => Ordering::Equal,
                    (true, false) => Ordering::Greater,
                    (false, true) => Ordering::Less,
                    (false, false) => b.stats.last_loss_nano.cmp(&a.stats.last_loss_nano),
                }
            } else {
                match (a.stats.last_loss_nano > 0, b.stats.last_loss_nano > 0) {
                    (true, false) => Ordering::Less,
                    (false, true) => Ordering::Greater,
                    (true, true) => b.stats.last_loss_nano.cmp(&a.stats.last_loss_nano),
                    (false, false) => a.display_name().cmp(b.display_name()),
                }
            };
            ord.then_with(|| a.host.cmp(&b.host))
        }),
        SortMode::Ip => rows.sort_by(|a, b| {
            match (ip_key(&a.stats.ip_repr), ip_key(&b.stats.ip_repr)) {
                (Some(ka), Some(kb)) => ka.cmp(&kb).then_with(|| a.host.cmp(&b.host)),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => a.host.cmp(&b.host),
            }
        }),
    }
}

fn online_first(a: &Row, b: &Row) -> Ordering {
    b.stats.is_online().cmp(&a.stats.is_online())
}

/// Binary sort key merging both families into one order: IPv4 addresses
/// keep their own numeric order in the trailing four bytes and sort as a
/// block ahead of IPv6. Unresolvable strings get no key and sort last.
pub fn ip_key(s: &str) -> Option<(u8, [u8; 16])> {
    let ip: IpAddr = s.parse().ok()?;
    match ip {
        IpAddr::V4(v4) => {
            let mut key = [0u8; 16];
            key[12..].copy_from_slice(&v4.octets());
            Some((0, key))
        }
        IpAddr::V6(v6) => Some((1, v6.octets())),
    }
}

// --- column rendering -------------------------------------------------------

/// Render the visible cells of one row; `now` is the wall clock in Unix nanos.
pub fn render_cells(row: &Row, columns: &BTreeSet<Column>, now: i64) -> Vec<String> {
    let s = &row.stats;
    let online = s.is_online();
    columns
        .iter()
        .map(|col| match col {
            Column::Status => (if online { "✓" } else { "✗" }).to_string(),
            Column::Name => row.display_name().to_string(),
            Column::Ip => {
                if s.ip_repr.is_empty() {
                    "-".to_string()
                } else {
                    s.ip_repr.clone()
                }
            }
            Column::Rtt => {
                if online && s.last_recv_nano > 0 {
                    format_rtt(s.last_rtt)
                } else {
                    "-".to_string()
                }
            }
            Column::LastReply => {
                if s.last_recv_nano > 0 {
                    format!("{} ago", format_duration(nanos_between(s.last_recv_nano, now)))
                } else {
                    "never".to_string()
                }
            }
            Column::LastLoss => {
                if s.last_loss_nano > 0 {
                    format!(
                        "{} ago ({})",
                        format_duration(nanos_between(s.last_loss_nano, now)),
                        format_duration(Duration::from_nanos(s.last_loss_duration.max(0) as u64)),
                    )
                } else {
                    "-".to_string()
                }
            }
        })
        .collect()
}

/// Pipe-delimited line shared by the terminal table and HTTP `/`.
pub fn render_line(row: &Row, columns: &BTreeSet<Column>, now: i64) -> String {
    render_cells(row, columns, now).join(" | ")
}

fn nanos_between(earlier: i64, now: i64) -> Duration {
    Duration::from_nanos((now - earlier).max(0) as u64)
}

/// Whole-second rendering: `5s`, `2m3s`, `1h2m3s`.
pub fn format_duration(d: Duration) -> String {
    let total = d.as_secs();
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    match (h, m) {
        (0, 0) => format!("{}s", s),
        (0, _) => format!("{}m{}s", m, s),
        _ => format!("{}h{}m{}s", h, m, s),
    }
}

/// Round-trip rendering with a unit fitting the magnitude.
pub fn format_rtt(d: Duration) -> String {
    let nanos = d.as_nanos();
    if nanos < 1_000_000 {
        format!("{}µs", nanos / 1_000)
    } else if nanos < 1_000_000_000 {
        format!("{:.1}ms", nanos as f64 / 1_000_000.0)
    } else {
        format!("{:.2}s", d.as_secs_f64())
    }
}
