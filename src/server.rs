//! Read-only HTTP status surface.
//!
//! Three endpoints over the snapshot cache: `/json` for machines, `/` for
//! pipe-delimited text, `/live` for a self-refreshing HTML page. Responses
//! are uncacheable and close their connection; the server enforces
//! aggressive timeouts so stray clients cannot pin resources.

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::extract::State;
use axum::http::{header, HeaderValue};
use axum::response::{Html, IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use tokio::sync::watch;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::timeout::TimeoutLayer;

use crate::snapshot::{Snapshot, SnapshotCache};
use crate::stats::unix_nanos;
use crate::view::{apply_view, format_duration, format_rtt, render_line, ViewConfig};

const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Public per-host record served by `/json`.
#[derive(Debug, Serialize)]
pub struct HostStatus {
    pub host: String,
    pub ip: String,
    pub online: bool,
    pub rtt: String,
    pub last_reply: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_loss_ago: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_loss_duration: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone)]
struct AppState {
    cache: Arc<SnapshotCache>,
    view: Arc<RwLock<ViewConfig>>,
}

/// Handle to the running server.
pub struct StatusServer {
    stop_tx: watch::Sender<bool>,
    pub local_addr: SocketAddr,
}

impl StatusServer {
    /// Bind and serve in a background task.
    pub async fn start(
        cache: Arc<SnapshotCache>,
        view: Arc<RwLock<ViewConfig>>,
        port: u16,
    ) -> std::io::Result<Self> {
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
        let local_addr = listener.local_addr()?;

        let state = AppState { cache, view };
        let router = Router::new()
            .route("/", get(text_handler))
            .route("/json", get(json_handler))
            .route("/live", get(live_handler))
            .layer(TimeoutLayer::new(WRITE_TIMEOUT))
            .layer(SetResponseHeaderLayer::overriding(
                header::CONNECTION,
                HeaderValue::from_static("close"),
            ))
            .layer(SetResponseHeaderLayer::overriding(
                header::CACHE_CONTROL,
                HeaderValue::from_static("no-store"),
            ))
            .with_state(state);

        let (stop_tx, mut stop_rx) = watch::channel(false);
        tokio::spawn(async move {
            let shutdown = async move {
                let _ = stop_rx.wait_for(|s| *s).await;
            };
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await
            {
                tracing::error!("status server error: {}", e);
            }
        });

        tracing::info!(
            "status server listening on http://{} (/: text, /json: JSON, /live: HTML)",
            local_addr
        );
        Ok(Self {
            stop_tx,
            local_addr,
        })
    }

    /// Trigger graceful shutdown. Idempotent.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }
}

async fn json_handler(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.cache.load();
    let cfg = state.view.read().unwrap().clone();
    Json(collect_statuses(&snapshot, &cfg, unix_nanos()))
}

async fn text_handler(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.cache.load();
    let cfg = state.view.read().unwrap().clone();
    let now = unix_nanos();
    let body: String = apply_view(&snapshot, &cfg)
        .iter()
        .map(|row| render_line(row, &cfg.visible_columns, now) + "\n")
        .collect();
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body,
    )
}

async fn live_handler() -> impl IntoResponse {
    Html(LIVE_PAGE)
}

/// Project the view's rows into the public JSON shape.
fn collect_statuses(snapshot: &Snapshot, cfg: &ViewConfig, now: i64) -> Vec<HostStatus> {
    apply_view(snapshot, cfg)
        .into_iter()
        .map(|row| {
            let s = &row.stats;
            let online = s.is_online();
            let rtt = if online && s.last_recv_nano > 0 {
                format_rtt(s.last_rtt)
            } else {
                "-".to_string()
            };
            let last_reply = if s.last_recv_nano > 0 {
                format!(
                    "{} ago",
                    format_duration(Duration::from_nanos((now - s.last_recv_nano).max(0) as u64))
                )
            } else {
                "never".to_string()
            };
            let (last_loss_ago, last_loss_duration) = if s.last_loss_nano > 0 {
                (
                    Some(format!(
                        "{} ago",
                        format_duration(Duration::from_nanos(
                            (now - s.last_loss_nano).max(0) as u64
                        ))
                    )),
                    Some(format_duration(Duration::from_nanos(
                        s.last_loss_duration.max(0) as u64,
                    ))),
                )
            } else {
                (None, None)
            };
            let error = if s.error_message.is_empty() {
                None
            } else {
                Some(s.error_message.clone())
            };
            HostStatus {
                host: row.display_name().to_string(),
                ip: s.ip_repr.clone(),
                online,
                rtt,
                last_reply,
                last_loss_ago,
                last_loss_duration,
                error,
            }
        })
        .collect()
}

const LIVE_PAGE: &str = r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="UTF-8">
  <meta name="viewport" content="width=device-width, initial-scale=1.0">
  <title>pingfleet status</title>
  <style>
    :root { color-scheme: dark; }
    body { font-family: -apple-system, "Segoe UI", sans-serif; background: #0d1117;
           color: #c9d1d9; padding: 24px; }
    h1 { font-size: 20px; margin-bottom: 4px; }
    .muted { color: #8b949e; font-size: 13px; margin-bottom: 16px; }
    table { border-collapse: collapse; min-width: 640px; }
    th, td { padding: 8px 14px; text-align: left; border-bottom: 1px solid #21262d; }
    th { color: #8b949e; font-size: 12px; text-transform: uppercase; }
    tr.offline { opacity: 0.4; }
    .online { color: #3fb950; font-weight: 600; }
    .offline-badge { color: #f85149; font-weight: 600; }
    td.ip, td.rtt { font-family: ui-monospace, monospace; }
  </style>
</head>
<body>
  <h1>pingfleet live status</h1>
  <p class="muted">Auto-refreshes every second &middot; <code>/json</code> for JSON &middot; <code>/</code> for text</p>
  <table id="status">
    <thead>
      <tr><th>Status</th><th>Name</th><th>IP</th><th>RTT</th><th>Last Reply</th><th>Last Loss</th></tr>
    </thead>
    <tbody></tbody>
  </table>
  <p class="muted" id="updated">Loading&hellip;</p>
  <script>
    const tbody = document.querySelector('#status tbody');
    const updated = document.querySelector('#updated');

    async function refresh() {
      try {
        const res = await fetch('/json', {cache: 'no-store'});
        const data = await res.json();
        tbody.innerHTML = '';
        for (const row of data) {
          const tr = document.createElement('tr');
          if (!row.online) tr.className = 'offline';
          const loss = row.last_loss_ago ? row.last_loss_ago + ' (' + row.last_loss_duration + ')' : '-';
          const cells = [
            row.online ? '<span class="online">&#9679; online</span>'
                       : '<span class="offline-badge">&#9675; offline</span>',
            row.host || '-', row.ip || '-',
            row.online ? (row.rtt || '-') : '-',
            row.last_reply || '-', loss,
          ];
          cells.forEach((html, i) => {
            const td = document.createElement('td');
            if (i === 2) td.className = 'ip';
            if (i === 3) td.className = 'rtt';
            if (i === 0) { td.innerHTML = html; } else { td.textContent = html; }
            tr.appendChild(td);
          });
          tbody.appendChild(tr);
        }
        updated.textContent = 'Updated ' + new Date().toLocaleTimeString();
      } catch (err) {
        updated.textContent = 'Disconnected';
      }
    }

    refresh();
    setInterval(refresh, 1000);
  </script>
</body>
</html>"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Runtime;
    use crate::fleet::tests::MockProbe;
    use crate::fleet::Fleet;
    use crate::probe::Probe;
    use crate::view::FilterMode;

    const SEC: i64 = 1_000_000_000;

    fn snapshot_with(hosts: &[(&str, bool)]) -> Snapshot {
        let probes: Vec<Arc<dyn Probe>> = hosts
            .iter()
            .map(|(h, online)| {
                let p = MockProbe::new(h);
                {
                    let stats = p.stats();
                    let mut s = stats.lock().unwrap();
                    s.state = *online;
                    if *online {
                        s.last_recv_nano = 9 * SEC;
                        s.last_rtt = Duration::from_millis(5);
                        s.has_ever_received = true;
                    }
                    s.ip_repr = format!("10.0.0.{}", h.len());
                }
                p as Arc<dyn Probe>
            })
            .collect();
        let fleet = Fleet::with_probes(probes, Arc::new(Runtime::default()));
        Snapshot::capture(&fleet, 10 * SEC)
    }

    #[tokio::test]
    async fn test_collect_statuses_shape() {
        let snap = snapshot_with(&[("up", true), ("downhost", false)]);
        let cfg = ViewConfig {
            filter: FilterMode::All,
            ..ViewConfig::default()
        };
        let statuses = collect_statuses(&snap, &cfg, 10 * SEC);
        assert_eq!(statuses.len(), 2);

        let up = statuses.iter().find(|s| s.host == "up").unwrap();
        assert!(up.online);
        assert_eq!(up.rtt, "5.0ms");
        assert_eq!(up.last_reply, "1s ago");
        assert!(up.last_loss_ago.is_none());
        assert!(up.error.is_none());

        let down = statuses.iter().find(|s| s.host == "downhost").unwrap();
        assert!(!down.online);
        assert_eq!(down.rtt, "-");
        assert_eq!(down.last_reply, "never");
    }

    #[tokio::test]
    async fn test_json_omits_empty_optionals() {
        let snap = snapshot_with(&[("up", true)]);
        let cfg = ViewConfig {
            filter: FilterMode::All,
            ..ViewConfig::default()
        };
        let json = serde_json::to_string(&collect_statuses(&snap, &cfg, 10 * SEC)).unwrap();
        assert!(json.contains("\"host\":\"up\""));
        assert!(!json.contains("last_loss_ago"));
        assert!(!json.contains("\"error\""));
    }
}
