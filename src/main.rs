//! pingfleet - concurrent multi-target reachability monitor.
//!
//! Probes many endpoints at once via ICMP echo, TCP port probes or the
//! system `ping`, and serves the live state to the terminal, a read-only
//! HTTP endpoint and an append-only transition log.

mod config;
mod fleet;
mod once;
mod probe;
mod resolver;
mod server;
mod snapshot;
mod stats;
mod subnet;
mod target;
mod transition;
mod view;

use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::Runtime;
use fleet::Fleet;
use server::StatusServer;
use snapshot::{spawn_ticker, SnapshotCache};
use stats::unix_nanos;
use target::TargetSpec;
use transition::TransitionWriter;
use view::{apply_view, render_line, Column, FilterMode, SortMode, ViewConfig};

#[derive(Parser, Debug)]
#[command(name = "pingfleet", version)]
#[command(about = "Monitor reachability of many hosts at once")]
#[command(after_help = "\
Targets can have the following forms:
  hostname, ip, or ip://host          ICMP ping (or system ping with -s)
  ip4://host, ip6://host              ICMP with an address-family hint
  tcp://host:port, tcp://[v6]:port    TCP probing (tcp4://, tcp6:// to pin the family)
  192.0.2.0/24                        CIDR blocks expand to their host addresses")]
struct Args {
    /// Targets: host specs or CIDR blocks
    targets: Vec<String>,

    /// File with targets, one per line (CIDR allowed)
    #[arg(long, value_name = "FILE")]
    hostfile: Option<PathBuf>,

    /// Use the system's ping binary
    #[arg(short = 's', long)]
    system: bool,

    /// Quoted options for the system ping (implies -s)
    #[arg(long, value_name = "OPTS", allow_hyphen_values = true)]
    ping_options: Option<String>,

    /// Prefer privileged (raw socket) ICMP mode
    #[arg(long)]
    privileged: bool,

    /// ICMP payload size in bytes (without the 28-byte header)
    #[arg(long, default_value_t = 24)]
    size: usize,

    /// Transition log filename
    #[arg(long, value_name = "FILE")]
    log: Option<PathBuf>,

    /// Port for the read-only status server (0 to disable)
    #[arg(long, value_name = "PORT")]
    web_port: Option<u16>,

    /// Probe every target once and exit
    #[arg(long)]
    once: bool,

    /// Show only online hosts
    #[arg(long)]
    only_online: bool,

    /// Show only offline hosts
    #[arg(long)]
    only_offline: bool,

    /// Quiet mode: no live terminal table
    #[arg(short, long)]
    quiet: bool,

    /// Enable debug output
    #[arg(long)]
    debug: bool,

    /// Skip reverse DNS lookups (faster startup for large subnets)
    #[arg(long)]
    no_dns: bool,

    /// Aliveness threshold in seconds
    #[arg(long, default_value_t = 2.0, value_name = "SECS")]
    threshold: f64,

    /// Snapshot refresh cadence in milliseconds
    #[arg(long, value_name = "MS")]
    interval: Option<u64>,
}

#[tokio::main]
async fn main() {
    let code = run().await;
    std::process::exit(code);
}

async fn run() -> i32 {
    let args = Args::parse();
    init_tracing(args.debug);

    let runtime = Arc::new(build_runtime(&args));

    // Assemble the target list: host file first, then positional args, with
    // CIDR blocks expanded to individual addresses.
    let mut raw_targets = Vec::new();
    if let Some(path) = &args.hostfile {
        match subnet::load_hosts_file(path) {
            Ok(hosts) => raw_targets.extend(hosts),
            Err(e) => {
                eprintln!("error reading host file {}: {}", path.display(), e);
                return 1;
            }
        }
    }
    raw_targets.extend(args.targets.iter().cloned());

    let tokens = subnet::expand_targets(raw_targets);
    let mut specs = Vec::with_capacity(tokens.len());
    for token in &tokens {
        match TargetSpec::parse(token) {
            Ok(spec) => specs.push(spec),
            Err(e) => {
                eprintln!("invalid target {:?}: {}", token, e);
                return 1;
            }
        }
    }

    if specs.is_empty() {
        eprintln!("no targets provided");
        return 1;
    }
    tracing::debug!("monitoring {} targets", specs.len());

    if args.once {
        return once::run_once(specs, runtime, args.only_online, args.only_offline).await;
    }

    run_monitor(specs, runtime, &args).await
}

async fn run_monitor(specs: Vec<TargetSpec>, runtime: Arc<Runtime>, args: &Args) -> i32 {
    let writer = match &runtime.log_path {
        Some(path) => match TransitionWriter::create(path) {
            Ok(writer) => Some(writer),
            Err(e) => {
                eprintln!("cannot open transition log {}: {}", path.display(), e);
                return 1;
            }
        },
        None => None,
    };
    let sink = writer.as_ref().map(|w| w.sink());

    let fleet = Fleet::new(specs, runtime.clone(), sink);
    if let Err(e) = fleet.start().await {
        eprintln!("{}", e);
        if let Some(writer) = writer {
            writer.close().await;
        }
        return 1;
    }

    let cache = Arc::new(SnapshotCache::new());
    let (stop_tx, stop_rx) = watch::channel(false);
    let ticker = spawn_ticker(cache.clone(), fleet.clone(), runtime.clone(), stop_rx);

    let view = Arc::new(RwLock::new(ViewConfig {
        filter: initial_filter(args.only_online, args.only_offline),
        sort: SortMode::Ip,
        ..ViewConfig::default()
    }));

    let http = if runtime.web_port > 0 {
        match StatusServer::start(cache.clone(), view.clone(), runtime.web_port).await {
            Ok(server) => Some(server),
            Err(e) => {
                tracing::error!("status server failed to start: {}", e);
                None
            }
        }
    } else {
        None
    };

    let mut render = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = render.tick() => {
                if !runtime.quiet {
                    render_table(&cache, &view);
                }
            }
        }
    }

    tracing::info!("interrupt received, stopping");
    stop_tx.send_replace(true);
    fleet.stop();
    if let Some(server) = &http {
        server.stop();
    }
    let _ = ticker.await;
    if let Some(writer) = writer {
        writer.close().await;
    }
    0
}

fn build_runtime(args: &Args) -> Runtime {
    let mut runtime = Runtime::default();
    runtime.apply_env();

    runtime.debug = args.debug;
    runtime.skip_dns = args.no_dns;
    runtime.privileged = args.privileged;
    runtime.use_system_ping = args.system || args.ping_options.is_some();
    runtime.system_ping_options = args
        .ping_options
        .as_deref()
        .unwrap_or_default()
        .split_whitespace()
        .map(str::to_string)
        .collect();
    runtime.payload_size = args.size;
    runtime.timeout_threshold_nanos = (args.threshold * 1e9) as i64;
    runtime.log_path = args.log.clone();
    runtime.quiet = args.quiet;
    if let Some(port) = args.web_port {
        runtime.web_port = port;
    }
    if let Some(ms) = args.interval {
        if ms > 0 {
            runtime.tick_interval = Duration::from_millis(ms);
        }
    }
    runtime
}

fn init_tracing(debug: bool) {
    let level = if debug { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("pingfleet={}", level)));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn initial_filter(only_online: bool, only_offline: bool) -> FilterMode {
    match (only_online, only_offline) {
        (true, false) => FilterMode::Online,
        (false, true) => FilterMode::Offline,
        // Smart is the continuous-mode default: a subnet sweep starts out
        // showing only hosts that are up or have ever answered.
        _ => FilterMode::Smart,
    }
}

/// Redraw the live terminal table from the current snapshot.
fn render_table(cache: &SnapshotCache, view: &RwLock<ViewConfig>) {
    let snapshot = cache.load();
    let cfg = view.read().unwrap().clone();
    let now = unix_nanos();
    let rows = apply_view(&snapshot, &cfg);

    let total = snapshot.len();
    let online = snapshot.rows().filter(|(_, s)| s.is_online()).count();

    let mut out = String::from("\x1b[2J\x1b[H");
    let header: Vec<&str> = cfg.visible_columns.iter().map(Column::label).collect();
    out.push_str(&header.join(" | "));
    out.push('\n');
    for row in &rows {
        out.push_str(&render_line(row, &cfg.visible_columns, now));
        out.push('\n');
    }
    out.push_str(&format!("\n{} targets, {} online\n", total, online));

    let mut stdout = std::io::stdout();
    let _ = stdout.write_all(out.as_bytes());
    let _ = stdout.flush();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_filter() {
        assert_eq!(initial_filter(true, false), FilterMode::Online);
        assert_eq!(initial_filter(false, true), FilterMode::Offline);
        assert_eq!(initial_filter(false, false), FilterMode::Smart);
        assert_eq!(initial_filter(true, true), FilterMode::Smart);
    }

    #[test]
    fn test_ping_options_imply_system() {
        let args = Args::parse_from(["pingfleet", "--ping-options", "-Q 2", "10.0.0.1"]);
        let runtime = build_runtime(&args);
        assert!(runtime.use_system_ping);
        assert_eq!(runtime.system_ping_options, vec!["-Q", "2"]);
    }

    #[test]
    fn test_threshold_flag_converts_to_nanos() {
        let args = Args::parse_from(["pingfleet", "--threshold", "0.5", "h"]);
        let runtime = build_runtime(&args);
        assert_eq!(runtime.timeout_threshold_nanos, 500_000_000);
    }

    #[test]
    fn test_cli_parses_mixed_targets() {
        let args = Args::parse_from(["pingfleet", "--once", "10.0.0.0/30", "tcp://h:80"]);
        assert!(args.once);
        assert_eq!(args.targets.len(), 2);
    }
}
