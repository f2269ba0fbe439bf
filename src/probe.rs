//! Paris ICMP probe transport.
//!
//! The oracle accepts single-probe queries (destination TTL, flow id, try
//! budget) and eventually delivers exactly one reply per query: either the
//! responding router address with a measured RTT, or the star sentinel
//! once the tries are exhausted. Replies can arrive in any order.
//!
//! Flow identity must survive per-flow ECMP: the flow id rides the echo
//! sequence number, and the payload filler is chosen so that the ICMP
//! checksum, the field checksum-hashing balancers feed as their ECMP
//! key, becomes a flow-derived constant. Probes with equal flow ids
//! therefore take one deterministic link; distinct flow ids take
//! distinct links.

use std::collections::HashMap;
use std::mem::MaybeUninit;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, info, warn};

use crate::path::STAR_IP;

/// Maximum MTU size for received packets.
const MAX_MTU: usize = 1500;

/// Per-attempt reply timeout.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// How often the engine sweeps the socket and the timeout table.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Base value for the checksum-preserving flow encoding.
const PARIS_CHECKSUM_BASE: u16 = 0x2a00;

/// One probe to schedule: wire TTL, Paris flow id, total tries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeQuery {
    pub ttl: u8,
    pub flow_id: u16,
    pub tries: u8,
}

/// The outcome of a query. `addr` is the star sentinel when every try
/// timed out; that is a result, not an error.
#[derive(Debug, Clone, Copy)]
pub struct ProbeReply {
    pub ttl: u8,
    pub flow_id: u16,
    pub addr: Ipv4Addr,
    pub rtt: Duration,
}

impl ProbeReply {
    pub fn is_star(&self) -> bool {
        self.addr == STAR_IP
    }
}

/// Channel pair connecting a probe consumer to an oracle task. The real
/// engine sits behind one of these; tests substitute a scripted topology.
pub struct OracleHandle {
    pub query_tx: mpsc::UnboundedSender<ProbeQuery>,
    pub reply_rx: mpsc::UnboundedReceiver<ProbeReply>,
}

struct PendingProbe {
    query: ProbeQuery,
    tries_left: u8,
    sent_at: Instant,
}

/// Raw-socket ICMP engine. Owns the socket on its own task; all sends are
/// serialized through that task.
pub struct ProbeEngine {
    socket: Socket,
    dst: Ipv4Addr,
    icmp_id: u16,
    pending: HashMap<u16, PendingProbe>,
}

impl ProbeEngine {
    /// Create the raw ICMP socket (requires root) and start the engine
    /// task. Dropping the returned handle stops the task; late replies to
    /// outstanding queries are discarded.
    pub fn spawn(ifname: &str, dst: Ipv4Addr, icmp_id: u16) -> Result<OracleHandle> {
        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))
            .context("failed to create raw ICMP socket, need root privileges")?;
        socket.set_nonblocking(true)?;
        #[cfg(target_os = "linux")]
        socket
            .bind_device(Some(ifname.as_bytes()))
            .with_context(|| format!("failed to bind to interface {ifname}"))?;
        #[cfg(not(target_os = "linux"))]
        let _ = ifname;

        let engine = ProbeEngine {
            socket,
            dst,
            icmp_id,
            pending: HashMap::new(),
        };

        let (query_tx, query_rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        tokio::spawn(engine.run(query_rx, reply_tx));
        info!(dst = %dst, icmp_id, "probe engine started");

        Ok(OracleHandle { query_tx, reply_rx })
    }

    async fn run(
        mut self,
        mut query_rx: mpsc::UnboundedReceiver<ProbeQuery>,
        reply_tx: mpsc::UnboundedSender<ProbeReply>,
    ) {
        let mut tick = time::interval(POLL_INTERVAL);
        loop {
            tokio::select! {
                query = query_rx.recv() => {
                    let Some(query) = query else { break };
                    if let Err(e) = self.dispatch(query) {
                        warn!(ttl = query.ttl, flow_id = query.flow_id, error = %e,
                              "probe send failed");
                    }
                }
                _ = tick.tick() => {
                    self.collect_replies(&reply_tx);
                    self.expire_timeouts(&reply_tx);
                    if reply_tx.is_closed() {
                        break;
                    }
                }
            }
        }
        debug!("probe engine stopped");
    }

    fn dispatch(&mut self, query: ProbeQuery) -> Result<()> {
        self.send_attempt(&query)?;
        self.pending.insert(
            query.flow_id,
            PendingProbe {
                query,
                tries_left: query.tries.max(1) - 1,
                sent_at: Instant::now(),
            },
        );
        Ok(())
    }

    fn send_attempt(&self, query: &ProbeQuery) -> Result<()> {
        self.socket.set_ttl(u32::from(query.ttl))?;
        let packet = construct_paris_packet(self.icmp_id, query.flow_id);
        let addr = SocketAddr::V4(SocketAddrV4::new(self.dst, 0));
        self.socket.send_to(&packet, &addr.into())?;
        debug!(ttl = query.ttl, flow_id = query.flow_id, "sent probe");
        Ok(())
    }

    /// Drain everything the socket has and deliver matched replies.
    fn collect_replies(&mut self, reply_tx: &mpsc::UnboundedSender<ProbeReply>) {
        let mut buffer = [0u8; MAX_MTU];
        loop {
            let mut uninit = [MaybeUninit::<u8>::uninit(); MAX_MTU];
            let len = match self.socket.recv_from(&mut uninit) {
                Ok((len, _)) => len,
                Err(_) => break,
            };
            for i in 0..len {
                buffer[i] = unsafe { uninit[i].assume_init() };
            }
            if let Some(reply) = self.parse_icmp_response(&buffer[..len]) {
                let _ = reply_tx.send(reply);
            }
        }
    }

    /// Retry timed-out probes; exhausted ones become star replies.
    fn expire_timeouts(&mut self, reply_tx: &mpsc::UnboundedSender<ProbeReply>) {
        let expired: Vec<u16> = self
            .pending
            .iter()
            .filter(|(_, p)| p.sent_at.elapsed() >= PROBE_TIMEOUT)
            .map(|(flow_id, _)| *flow_id)
            .collect();

        for flow_id in expired {
            if self.pending[&flow_id].tries_left > 0 {
                let query = self.pending[&flow_id].query;
                if let Err(e) = self.send_attempt(&query) {
                    warn!(flow_id, error = %e, "probe retry failed");
                }
                let probe = self.pending.get_mut(&flow_id).expect("probe still pending");
                probe.tries_left -= 1;
                probe.sent_at = Instant::now();
            } else if let Some(probe) = self.pending.remove(&flow_id) {
                debug!(ttl = probe.query.ttl, flow_id, "probe timed out");
                let _ = reply_tx.send(ProbeReply {
                    ttl: probe.query.ttl,
                    flow_id,
                    addr: STAR_IP,
                    rtt: probe.sent_at.elapsed(),
                });
            }
        }
    }

    /// Parse an incoming IPv4 packet holding an ICMP message. Accepts echo
    /// replies from the destination and time-exceeded / unreachable errors
    /// from intermediate routers; the latter quote our echo header, which
    /// is where the (identifier, sequence) match lives.
    fn parse_icmp_response(&mut self, buf: &[u8]) -> Option<ProbeReply> {
        if buf.len() < 28 {
            return None; // IP header (20) + ICMP header (8)
        }
        let ip_header_len = usize::from(buf[0] & 0x0f) * 4;
        if buf.len() < ip_header_len + 8 {
            return None;
        }
        let source = Ipv4Addr::new(buf[12], buf[13], buf[14], buf[15]);
        let icmp = &buf[ip_header_len..];

        let (id, seq) = match icmp[0] {
            // Echo Reply: our header comes straight back.
            0 => (
                u16::from_be_bytes([icmp[4], icmp[5]]),
                u16::from_be_bytes([icmp[6], icmp[7]]),
            ),
            // Time Exceeded / Destination Unreachable: the original echo
            // header sits behind the quoted IP header.
            11 | 3 => {
                if icmp.len() < 8 + 20 {
                    return None;
                }
                let inner_ihl = usize::from(icmp[8] & 0x0f) * 4;
                let inner = 8 + inner_ihl;
                if icmp.len() < inner + 8 {
                    return None;
                }
                (
                    u16::from_be_bytes([icmp[inner + 4], icmp[inner + 5]]),
                    u16::from_be_bytes([icmp[inner + 6], icmp[inner + 7]]),
                )
            }
            _ => return None,
        };

        if id != self.icmp_id {
            return None;
        }
        let probe = self.pending.remove(&seq)?;
        Some(ProbeReply {
            ttl: probe.query.ttl,
            flow_id: probe.query.flow_id,
            addr: source,
            rtt: probe.sent_at.elapsed(),
        })
    }
}

/// Build an ICMP echo request whose checksum equals
/// `PARIS_CHECKSUM_BASE + flow_id`. The two payload filler bytes soak up
/// the difference so the checksum stays valid.
fn construct_paris_packet(id: u16, flow_id: u16) -> Vec<u8> {
    let target = PARIS_CHECKSUM_BASE.wrapping_add(flow_id);
    let mut packet = vec![0u8; 10];

    // ICMP Type (8 = Echo Request), Code 0.
    packet[0] = 8;
    packet[1] = 0;
    // Identifier and sequence; the sequence carries the flow id.
    packet[4..6].copy_from_slice(&id.to_be_bytes());
    packet[6..8].copy_from_slice(&flow_id.to_be_bytes());

    let filler = paris_filler(&packet, target);
    packet[8..10].copy_from_slice(&filler.to_be_bytes());
    debug_assert_eq!(calculate_checksum(&packet), target);
    packet[2..4].copy_from_slice(&target.to_be_bytes());
    packet
}

/// The 16-bit payload word that makes `packet`'s checksum come out as
/// `target` (ones'-complement subtraction of the partial sum).
fn paris_filler(packet: &[u8], target: u16) -> u16 {
    let partial = fold_sum(raw_sum(packet));
    let want = !target;
    let filler = u32::from(want) + 0xffff - u32::from(partial);
    (filler % 0xffff) as u16
}

fn raw_sum(packet: &[u8]) -> u32 {
    let mut sum = 0u32;
    for chunk in packet.chunks(2) {
        if chunk.len() == 2 {
            sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
        } else {
            sum += u32::from(chunk[0]) << 8;
        }
    }
    sum
}

fn fold_sum(mut sum: u32) -> u16 {
    while (sum >> 16) != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum as u16
}

/// Calculate the ICMP checksum over a complete packet.
pub fn calculate_checksum(packet: &[u8]) -> u16 {
    !fold_sum(raw_sum(packet))
}
