//! Append-only transition log.
//!
//! Producers hand complete records to a [`TransitionSink`]; a single flush
//! task serializes them as one JSON object per line and drains its buffer to
//! the file every 500 ms and on close. Write failures are reported and never
//! block a producer.

use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const FLUSH_INTERVAL: Duration = Duration::from_millis(500);

/// One up/down transition. Field names are the wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    #[serde(rename = "Timestamp")]
    pub timestamp: String,
    #[serde(rename = "UnixNano")]
    pub unix_nano: i64,
    #[serde(rename = "Host")]
    pub host: String,
    #[serde(rename = "Ip")]
    pub ip: String,
    #[serde(rename = "Transition")]
    pub transition: String,
    #[serde(rename = "State")]
    pub state: bool,
}

impl TransitionRecord {
    /// Build a record for a state change observed at `unix_nano`.
    pub fn new(unix_nano: i64, host: &str, ip: &str, new_state: bool) -> Self {
        let transition = if new_state { "down to up" } else { "up to down" };
        let timestamp = chrono::DateTime::from_timestamp_nanos(unix_nano)
            .with_timezone(&chrono::Local)
            .format("%Y-%m-%d %H:%M:%S%.9f %z")
            .to_string();
        Self {
            timestamp,
            unix_nano,
            host: host.to_string(),
            ip: ip.to_string(),
            transition: transition.to_string(),
            state: new_state,
        }
    }
}

/// Cheap cloneable producer handle. Sending never blocks.
#[derive(Debug, Clone)]
pub struct TransitionSink {
    tx: mpsc::UnboundedSender<TransitionRecord>,
}

impl TransitionSink {
    pub fn write(&self, record: TransitionRecord) {
        // The writer may already be closed during shutdown; late records are dropped.
        let _ = self.tx.send(record);
    }

    /// Capture-only sink for fold tests.
    #[cfg(test)]
    pub(crate) fn from_sender(tx: mpsc::UnboundedSender<TransitionRecord>) -> Self {
        Self { tx }
    }
}

/// Owns the log file and the flush task.
pub struct TransitionWriter {
    tx: mpsc::UnboundedSender<TransitionRecord>,
    close_tx: tokio::sync::oneshot::Sender<()>,
    flusher: JoinHandle<()>,
}

impl TransitionWriter {
    /// Open `path` in append mode and spawn the flush task.
    ///
    /// Failing to open the file is a hard error for the caller.
    pub fn create<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = tokio::sync::oneshot::channel();
        let flusher = tokio::spawn(run_flusher(rx, close_rx, BufWriter::new(file)));
        Ok(Self {
            tx,
            close_tx,
            flusher,
        })
    }

    /// Producer handle for stats records.
    pub fn sink(&self) -> TransitionSink {
        TransitionSink {
            tx: self.tx.clone(),
        }
    }

    /// Drain the buffer, flush to disk and release the file. Outstanding
    /// sink handles keep working as no-ops afterwards.
    pub async fn close(self) {
        let Self {
            tx,
            close_tx,
            flusher,
        } = self;
        drop(tx);
        let _ = close_tx.send(());
        if flusher.await.is_err() {
            tracing::error!("transition log flush task failed");
        }
    }
}

async fn run_flusher(
    mut rx: mpsc::UnboundedReceiver<TransitionRecord>,
    mut close_rx: tokio::sync::oneshot::Receiver<()>,
    mut out: BufWriter<std::fs::File>,
) {
    let mut interval = tokio::time::interval(FLUSH_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            record = rx.recv() => {
                match record {
                    Some(r) => write_record(&mut out, &r),
                    // Every sender is gone.
                    None => {
                        flush(&mut out);
                        break;
                    }
                }
            }
            // Close request (or the writer was dropped): drain what is
            // already queued, then flush and exit.
            _ = &mut close_rx => {
                while let Ok(r) = rx.try_recv() {
                    write_record(&mut out, &r);
                }
                flush(&mut out);
                break;
            }
            _ = interval.tick() => flush(&mut out),
        }
    }
}

fn write_record(out: &mut BufWriter<std::fs::File>, record: &TransitionRecord) {
    match serde_json::to_vec(record) {
        Ok(mut line) => {
            line.push(b'\n');
            if let Err(e) = out.write_all(&line) {
                tracing::error!("transition log write failed: {}", e);
            }
        }
        Err(e) => tracing::error!("transition record serialization failed: {}", e),
    }
}

fn flush(out: &mut BufWriter<std::fs::File>) {
    if let Err(e) = out.flush() {
        tracing::error!("transition log flush failed: {}", e);
    }
}
