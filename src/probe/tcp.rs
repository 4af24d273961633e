//! TCP port probe.
//!
//! One probe per second. Where the process can open a raw TCP socket the
//! IPv4 path uses a half-handshake (SYN, wait for SYN-ACK, reset); otherwise
//! a full handshake bounded by the probe timeout. RST, ICMP unreachable and
//! timeout all count as "no reply this tick", never as hard errors.

use std::io::ErrorKind;
use std::mem::MaybeUninit;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpStream;
use tokio::sync::watch;

use super::{apply_outcome, record_failure, resolve_with_retry, Probe, ProbeError, ProbeOutcome};
use crate::config::Runtime;
use crate::stats::{unix_nanos, SharedStats};
use crate::target::TargetSpec;

const FLAG_SYN: u8 = 0x02;
const FLAG_RST: u8 = 0x04;
const FLAG_ACK: u8 = 0x10;

/// Handshake depth, decided once per target at start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handshake {
    /// SYN / SYN-ACK / RST over a raw socket (IPv4 only).
    Half,
    /// Ordinary connect, torn down gracefully.
    Full,
}

pub struct TcpProbe {
    spec: TargetSpec,
    runtime: Arc<Runtime>,
    stats: SharedStats,
    stop_tx: watch::Sender<bool>,
    started: AtomicBool,
}

impl TcpProbe {
    pub fn new(spec: TargetSpec, runtime: Arc<Runtime>, stats: SharedStats) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            spec,
            runtime,
            stats,
            stop_tx,
            started: AtomicBool::new(false),
        }
    }
}

impl Probe for TcpProbe {
    fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let spec = self.spec.clone();
        let runtime = self.runtime.clone();
        let stats = self.stats.clone();
        let stop_rx = self.stop_tx.subscribe();
        tokio::spawn(run_loop(spec, runtime, stats, stop_rx));
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
) {
    // The parser guarantees a port for tcp schemes.
    let Some(port) = spec.port else {
        record_failure(&stats, "tcp target missing port".to_string());
        return;
    };

    let Some(ip) = resolve_with_retry(&spec, &stats, &mut stop_rx).await else {
        return;
    };

    let handshake = match ip {
        IpAddr::V4(_) if raw_tcp_available() => Handshake::Half,
        _ => Handshake::Full,
    };
    tracing::debug!("tcp probe for {} using {:?} handshake", spec.raw, handshake);

    let timeout = runtime.probe_timeout;
    let mut interval = tokio::time::interval(runtime.probe_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop_rx.changed() => return,
            _ = interval.tick() => {
                let result = match (handshake, ip) {
                    (Handshake::Half, IpAddr::V4(v4)) => {
                        tokio::task::spawn_blocking(move || syn_probe(v4, port, timeout))
                            .await
                            .unwrap_or_else(|e| {
                                Err(ProbeError::Transport(format!("syn task failed: {}", e)))
                            })
                    }
                    _ => connect_probe(ip, port, timeout).await,
                };

                let now = unix_nanos();
                let outcome = match result {
                    Ok(Some(rtt)) => ProbeOutcome::reply(now, rtt),
                    Ok(None) => ProbeOutcome::silence(now),
                    Err(e) => ProbeOutcome::failure(now, e.to_string()),
                };
                apply_outcome(&stats, outcome);
            }
        }
    }
}

fn raw_tcp_available() -> bool {
    Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::TCP)).is_ok()
}

/// Single connect attempt for one-shot mode.
pub(crate) async fn connect_once(
    ip: IpAddr,
    port: u16,
    timeout: Duration,
) -> Result<Option<Duration>, ProbeError> {
    connect_probe(ip, port, timeout).await
}

/// Full handshake: connected within the timeout means reachable.
///
/// Returns `Ok(None)` for refusals, resets, unreachables and timeouts.
async fn connect_probe(
    ip: IpAddr,
    port: u16,
    timeout: Duration,
) -> Result<Option<Duration>, ProbeError> {
    let start = Instant::now();
    match tokio::time::timeout(timeout, TcpStream::connect(SocketAddr::new(ip, port))).await {
        Ok(Ok(stream)) => {
            let rtt = start.elapsed();
            // Dropping the stream closes the connection gracefully.
            drop(stream);
            Ok(Some(rtt))
        }
        Ok(Err(e)) => match e.kind() {
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::TimedOut => Ok(None),
            _ if matches!(
                e.raw_os_error(),
                Some(libc::EHOSTUNREACH) | Some(libc::ENETUNREACH)
            ) =>
            {
                Ok(None)
            }
            _ => Err(ProbeError::Transport(format!("connect: {}", e))),
        },
        Err(_) => Ok(None),
    }
}

/// Half-handshake over a raw socket: send SYN, match the SYN-ACK, reset.
///
/// RTT is the time to the SYN-ACK. A RST answer means the port did not
/// accept, reported as no reply.
fn syn_probe(dst: Ipv4Addr, port: u16, timeout: Duration) -> Result<Option<Duration>, ProbeError> {
    let src_ip = local_source_for(dst, port);
    let src_port: u16 = 32768 + (rand::random::<u16>() % 28000);
    let seq: u32 = rand::random();

    let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::TCP))
        .map_err(|e| ProbeError::Transport(format!("raw tcp socket: {}", e)))?;
    socket
        .connect(&SocketAddr::new(IpAddr::V4(dst), 0).into())
        .map_err(|e| ProbeError::Transport(format!("raw connect: {}", e)))?;

    let syn = build_segment(src_ip, dst, src_port, port, seq, 0, FLAG_SYN);
    let start = Instant::now();
    socket
        .send(&syn)
        .map_err(|e| ProbeError::Transport(format!("send syn: {}", e)))?;

    loop {
        let remaining = match timeout.checked_sub(start.elapsed()) {
            Some(r) if !r.is_zero() => r,
            _ => return Ok(None),
        };
        socket
            .set_read_timeout(Some(remaining))
            .map_err(|e| ProbeError::Transport(format!("socket timeout: {}", e)))?;

        let mut buf = [MaybeUninit::<u8>::uninit(); 1500];
        let len = match socket.recv(&mut buf) {
            Ok(len) => len,
            Err(e)
                if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut =>
            {
                return Ok(None);
            }
            Err(e) => return Err(ProbeError::Transport(format!("recv: {}", e))),
        };
        // SAFETY: recv initialized `len` bytes.
        let buf: &[u8] = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };

        let Some(reply) = parse_reply(buf, port, src_port) else {
            continue;
        };
        if reply.flags & FLAG_RST != 0 {
            return Ok(None);
        }
        if reply.flags & (FLAG_SYN | FLAG_ACK) == FLAG_SYN | FLAG_ACK
            && reply.ack == seq.wrapping_add(1)
        {
            let rtt = start.elapsed();
            // Tear the embryonic connection down right away.
            let rst = build_segment(src_ip, dst, src_port, port, seq.wrapping_add(1), 0, FLAG_RST);
            let _ = socket.send(&rst);
            return Ok(Some(rtt));
        }
    }
}

/// Ask the routing table which source address reaches `dst`.
fn local_source_for(dst: Ipv4Addr, port: u16) -> Ipv4Addr {
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|s| {
            s.connect((dst, port))?;
            s.local_addr()
        })
        .map(|addr| match addr.ip() {
            IpAddr::V4(v4) => v4,
            IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
        })
        .unwrap_or(Ipv4Addr::UNSPECIFIED)
}

/// A bare 20-byte TCP segment with its pseudo-header checksum.
fn build_segment(
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: u8,
) -> [u8; 20] {
    let mut seg = [0u8; 20];
    seg[0..2].copy_from_slice(&src_port.to_be_bytes());
    seg[2..4].copy_from_slice(&dst_port.to_be_bytes());
    seg[4..8].copy_from_slice(&seq.to_be_bytes());
    seg[8..12].copy_from_slice(&ack.to_be_bytes());
    seg[12] = 5 << 4; // data offset: five 32-bit words
    seg[13] = flags;
    seg[14..16].copy_from_slice(&1024u16.to_be_bytes());

    let checksum = tcp_checksum(src_ip, dst_ip, &seg);
    seg[16..18].copy_from_slice(&checksum.to_be_bytes());
    seg
}

/// TCP checksum over the IPv4 pseudo-header and the segment.
fn tcp_checksum(src: Ipv4Addr, dst: Ipv4Addr, segment: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let src = src.octets();
    let dst = dst.octets();
    sum += u16::from_be_bytes([src[0], src[1]]) as u32;
    sum += u16::from_be_bytes([src[2], src[3]]) as u32;
    sum += u16::from_be_bytes([dst[0], dst[1]]) as u32;
    sum += u16::from_be_bytes([dst[2], dst[3]]) as u32;
    sum += libc::IPPROTO_TCP as u32;
    sum += segment.len() as u32;

    let mut chunks = segment.chunks_exact(2);
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

struct TcpReply {
    flags: u8,
    ack: u32,
}

/// Pull the TCP header out of a raw IPv4 packet and match it against our
/// four-tuple. Raw TCP sockets see every TCP packet for the host, so the
/// port filter matters.
fn parse_reply(packet: &[u8], remote_port: u16, local_port: u16) -> Option<TcpReply> {
    if packet.len() < 20 || packet[0] >> 4 != 4 {
        return None;
    }
    let ip_header_len = ((packet[0] & 0x0f) as usize) * 4;
    let tcp = packet.get(ip_header_len..ip_header_len + 20)?;

    let sport = u16::from_be_bytes([tcp[0], tcp[1]]);
    let dport = u16::from_be_bytes([tcp[2], tcp[3]]);
    if sport != remote_port || dport != local_port {
        return None;
    }
    Some(TcpReply {
        flags: tcp[13],
        ack: u32::from_be_bytes([tcp[8], tcp[9], tcp[10], tcp[11]]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_layout() {
        let seg = build_segment(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            40000,
            443,
            0xdeadbeef,
            0,
            FLAG_SYN,
        );
        assert_eq!(u16::from_be_bytes([seg[0], seg[1]]), 40000);
        assert_eq!(u16::from_be_bytes([seg[2], seg[3]]), 443);
        assert_eq!(
            u32::from_be_bytes([seg[4], seg[5], seg[6], seg[7]]),
            0xdeadbeef
        );
        assert_eq!(seg[12] >> 4, 5);
        assert_eq!(seg[13], FLAG_SYN);
    }

    #[test]
    fn test_checksum_round_trips() {
        let src = Ipv4Addr::new(192, 168, 1, 10);
        let dst = Ipv4Addr::new(192, 168, 1, 20);
        let seg = build_segment(src, dst, 50000, 80, 42, 0, FLAG_SYN);
        // Re-checksumming a valid segment folds to zero.
        assert_eq!(tcp_checksum(src, dst, &seg), 0);
    }

    #[test]
    fn test_parse_reply_matches_four_tuple() {
        let mut packet = vec![0u8; 40];
        packet[0] = 0x45;
        let tcp = &mut packet[20..];
        tcp[0..2].copy_from_slice(&443u16.to_be_bytes()); // from remote port
        tcp[2..4].copy_from_slice(&40000u16.to_be_bytes()); // to our port
        tcp[8..12].copy_from_slice(&100u32.to_be_bytes());
        tcp[13] = FLAG_SYN | FLAG_ACK;

        let reply = parse_reply(&packet, 443, 40000).unwrap();
        assert_eq!(reply.flags, FLAG_SYN | FLAG_ACK);
        assert_eq!(reply.ack, 100);

        assert!(parse_reply(&packet, 443, 40001).is_none());
        assert!(parse_reply(&packet, 80, 40000).is_none());
    }

    #[test]
    fn test_parse_reply_rejects_short_packets() {
        assert!(parse_reply(&[0x45, 0, 0], 1, 2).is_none());
        assert!(parse_reply(&[0u8; 40], 1, 2).is_none()); // not IPv4
    }
}
