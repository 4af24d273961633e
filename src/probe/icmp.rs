//! Built-in ICMP echo probe.
//!
//! One echo per second per target over a socket2 ICMP socket. Unprivileged
//! DGRAM sockets are preferred where the OS supports them; RAW sockets are
//! used when the process has permission (or `--privileged` asks for them).
//! The blocking send/recv pair runs in `spawn_blocking` so round-trip timing
//! is not at the mercy of the async scheduler.

use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::sync::watch;

use super::{
    apply_outcome, record_failure, resolve_with_retry, Probe, ProbeError, ProbeOutcome,
};
use crate::config::Runtime;
use crate::stats::{unix_nanos, SharedStats};
use crate::target::TargetSpec;

/// ICMP socket flavor, decided once at probe start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SocketMode {
    Raw,
    Dgram,
}

pub struct IcmpProbe {
    spec: TargetSpec,
    runtime: Arc<Runtime>,
    stats: SharedStats,
    stop_tx: watch::Sender<bool>,
    started: AtomicBool,
    sequence: Arc<AtomicU16>,
}

impl IcmpProbe {
    pub fn new(spec: TargetSpec, runtime: Arc<Runtime>, stats: SharedStats) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            spec,
            runtime,
            stats,
            stop_tx,
            started: AtomicBool::new(false),
            sequence: Arc::new(AtomicU16::new(0)),
        }
    }
}

impl Probe for IcmpProbe {
    fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let spec = self.spec.clone();
        let runtime = self.runtime.clone();
        let stats = self.stats.clone();
        let stop_rx = self.stop_tx.subscribe();
        let sequence = self.sequence.clone();
        tokio::spawn(run_loop(spec, runtime, stats, stop_rx, sequence));
    }

    fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    fn host(&self) -> &str {
        &self.spec.raw
    }

    fn stats(&self) -> SharedStats {
        self.stats.clone()
    }
}

async fn run_loop(
    spec: TargetSpec,
    runtime: Arc<Runtime>,
    stats: SharedStats,
    mut stop_rx: watch::Receiver<bool>,
    sequence: Arc<AtomicU16>,
) {
    // Resolution happens here, not in start(), so a slow resolver never
    // serializes fleet startup.
    let Some(ip) = resolve_with_retry(&spec, &stats, &mut stop_rx).await else {
        return;
    };

    let mode = match detect_socket_mode(ip.is_ipv6(), runtime.privileged) {
        Ok(mode) => mode,
        Err(e) => {
            record_failure(&stats, e.to_string());
            return;
        }
    };
    tracing::debug!("icmp probe for {} using {:?} socket", spec.raw, mode);

    let timeout = runtime.probe_timeout;
    let payload_size = runtime.payload_size;
    let mut interval = tokio::time::interval(runtime.probe_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop_rx.changed() => return,
            _ = interval.tick() => {
                let seq = sequence.fetch_add(1, Ordering::Relaxed);
                let result = tokio::task::spawn_blocking(move || {
                    blocking_echo(ip, timeout, payload_size, mode, rand::random(), seq)
                })
                .await;

                let now = unix_nanos();
                let outcome = match result {
                    Ok(Ok(rtt)) => ProbeOutcome::reply(now, rtt),
                    Ok(Err(ProbeError::Timeout(_))) => ProbeOutcome::silence(now),
                    Ok(Err(e)) => ProbeOutcome::failure(now, e.to_string()),
                    Err(e) => ProbeOutcome::failure(now, format!("echo task failed: {}", e)),
                };
                apply_outcome(&stats, outcome);
            }
        }
    }
}

/// Single echo attempt for one-shot mode.
pub(crate) async fn echo_once(
    ip: IpAddr,
    timeout: Duration,
    payload_size: usize,
    privileged: bool,
) -> Result<Option<Duration>, ProbeError> {
    let mode = detect_socket_mode(ip.is_ipv6(), privileged)?;
    let result = tokio::task::spawn_blocking(move || {
        blocking_echo(ip, timeout, payload_size, mode, rand::random(), 0)
    })
    .await
    .map_err(|e| ProbeError::Transport(format!("echo task failed: {}", e)))?;
    match result {
        Ok(rtt) => Ok(Some(rtt)),
        Err(ProbeError::Timeout(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Pick the socket flavor: DGRAM (unprivileged) first unless the runtime asks
/// for privileged mode, RAW as the permission-gated fallback.
fn detect_socket_mode(v6: bool, privileged: bool) -> Result<SocketMode, ProbeError> {
    let order = if privileged {
        [SocketMode::Raw, SocketMode::Dgram]
    } else {
        [SocketMode::Dgram, SocketMode::Raw]
    };
    for mode in order {
        if open_socket(v6, mode).is_ok() {
            return Ok(mode);
        }
    }
    Err(ProbeError::Transport(
        "no usable ICMP socket (try --privileged or CAP_NET_RAW)".to_string(),
    ))
}

fn open_socket(v6: bool, mode: SocketMode) -> std::io::Result<Socket> {
    let (domain, protocol) = if v6 {
        (Domain::IPV6, Protocol::ICMPV6)
    } else {
        (Domain::IPV4, Protocol::ICMPV4)
    };
    let ty = match mode {
        SocketMode::Raw => Type::RAW,
        SocketMode::Dgram => Type::DGRAM,
    };
    Socket::new(domain, ty, Some(protocol))
}

/// Send one echo request and wait for the matching reply.
fn blocking_echo(
    ip: IpAddr,
    timeout: Duration,
    payload_size: usize,
    mode: SocketMode,
    identifier: u16,
    sequence: u16,
) -> Result<Duration, ProbeError> {
    let socket = open_socket(ip.is_ipv6(), mode)
        .map_err(|e| ProbeError::Transport(format!("icmp socket: {}", e)))?;
    socket
        .set_read_timeout(Some(timeout))
        .and_then(|_| socket.set_write_timeout(Some(timeout)))
        .map_err(|e| ProbeError::Transport(format!("socket timeout: {}", e)))?;

    let dest = SocketAddr::new(ip, 0);
    socket
        .connect(&dest.into())
        .map_err(|e| ProbeError::Transport(format!("connect: {}", e)))?;

    let packet = build_echo_request(ip.is_ipv6(), identifier, sequence, payload_size);

    let start = Instant::now();
    socket
        .send(&packet)
        .map_err(|e| ProbeError::Transport(format!("send: {}", e)))?;

    loop {
        let mut buf = [MaybeUninit::<u8>::uninit(); 1500];
        let len = socket.recv(&mut buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::WouldBlock
                || e.kind() == std::io::ErrorKind::TimedOut
            {
                ProbeError::Timeout(timeout)
            } else {
                ProbeError::Transport(format!("recv: {}", e))
            }
        })?;
        // SAFETY: recv initialized `len` bytes.
        let buf: &[u8] = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(ProbeError::Timeout(timeout));
        }

        if matches_echo_reply(buf, ip.is_ipv6(), identifier, sequence, mode == SocketMode::Raw) {
            return Ok(elapsed);
        }
        // Someone else's reply; keep waiting for ours.
    }
}

/// Echo request packet: 8-byte header plus `payload_size` bytes of payload,
/// the first eight carrying a send timestamp.
fn build_echo_request(v6: bool, identifier: u16, sequence: u16, payload_size: usize) -> Vec<u8> {
    let mut packet = vec![0u8; 8 + payload_size];
    packet[0] = if v6 { 128 } else { 8 };
    packet[1] = 0;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    if payload_size >= 8 {
        let ts = unix_nanos() as u64;
        packet[8..16].copy_from_slice(&ts.to_be_bytes());
    }

    if !v6 {
        // ICMPv6 checksums are computed by the kernel.
        let checksum = icmp_checksum(&packet);
        packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    }

    packet
}

/// Check whether `buf` is the echo reply for our identifier/sequence pair.
///
/// RAW IPv4 sockets deliver the IP header; DGRAM sockets and IPv6 do not.
/// The identifier is only checked in raw mode: unprivileged sockets get a
/// kernel-assigned identifier and only ever see their own replies.
fn matches_echo_reply(buf: &[u8], v6: bool, identifier: u16, sequence: u16, match_id: bool) -> bool {
    if buf.len() < 8 {
        return false;
    }
    let offset = if !v6 && buf[0] >> 4 == 4 {
        ((buf[0] & 0x0f) as usize) * 4
    } else {
        0
    };
    if buf.len() < offset + 8 {
        return false;
    }
    let reply_type = buf[offset];
    let reply_id = u16::from_be_bytes([buf[offset + 4], buf[offset + 5]]);
    let reply_seq = u16::from_be_bytes([buf[offset + 6], buf[offset + 7]]);

    let expected_type = if v6 { 129 } else { 0 };
    reply_type == expected_type && (!match_id || reply_id == identifier) && reply_seq == sequence
}

/// RFC 1071 internet checksum.
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !sum as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_verifies_to_zero() {
        let packet = build_echo_request(false, 0x1234, 7, 24);
        // Re-summing a checksummed packet yields zero.
        assert_eq!(icmp_checksum(&packet), 0);
    }

    #[test]
    fn test_build_echo_request_layout() {
        let packet = build_echo_request(false, 0xbeef, 3, 24);
        assert_eq!(packet.len(), 32);
        assert_eq!(packet[0], 8);
        assert_eq!(packet[4..6], [0xbe, 0xef]);
        assert_eq!(packet[6..8], [0x00, 0x03]);

        let v6 = build_echo_request(true, 1, 1, 56);
        assert_eq!(v6.len(), 64);
        assert_eq!(v6[0], 128);
    }

    #[test]
    fn test_match_reply_without_ip_header() {
        let mut reply = vec![0u8; 16];
        reply[0] = 0; // echo reply
        reply[4..6].copy_from_slice(&0x1234u16.to_be_bytes());
        reply[6..8].copy_from_slice(&9u16.to_be_bytes());
        assert!(matches_echo_reply(&reply, false, 0x1234, 9, true));
        assert!(!matches_echo_reply(&reply, false, 0x1234, 10, true));
        assert!(!matches_echo_reply(&reply, false, 0x4321, 9, true));
        // Unprivileged sockets skip the identifier comparison.
        assert!(matches_echo_reply(&reply, false, 0x4321, 9, false));
    }

    #[test]
    fn test_match_reply_with_ip_header() {
        let mut packet = vec![0u8; 28];
        packet[0] = 0x45; // IPv4, 20-byte header
        packet[20] = 0; // echo reply
        packet[24..26].copy_from_slice(&7u16.to_be_bytes());
        packet[26..28].copy_from_slice(&1u16.to_be_bytes());
        assert!(matches_echo_reply(&packet, false, 7, 1, true));
    }

    #[test]
    fn test_match_v6_reply_type() {
        let mut reply = vec![0u8; 8];
        reply[0] = 129;
        reply[4..6].copy_from_slice(&5u16.to_be_bytes());
        reply[6..8].copy_from_slice(&2u16.to_be_bytes());
        assert!(matches_echo_reply(&reply, true, 5, 2, true));
        assert!(!matches_echo_reply(&reply, false, 5, 2, true));
    }
}
