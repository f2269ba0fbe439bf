//! Hop resolution: the prober task and the Paris hop builder.
//!
//! The builder enumerates the load-balanced interfaces at one TTL by
//! spending probes with fresh flow ids until the MDA stopping rule says
//! another interface is unlikely to exist. All builder state is mutated by
//! the prober task alone, one reply at a time; the search driver parks on
//! a one-slot handoff until the finished hop arrives.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::ops::Range;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::path::PathHop;
use crate::probe::{OracleHandle, ProbeQuery, ProbeReply};

/// MDA stopping rule: total probes required at a TTL once `n` distinct
/// interfaces have been observed there.
pub const PARIS_IFACE2PROBES: [usize; 17] = [
    6, 6, 11, 16, 21, 27, 33, 38, 44, 51, 57, 63, 70, 76, 83, 90, 96,
];

/// Stop enumerating once a hop shows this many interfaces.
pub const PARIS_MAX_IFACES: usize = 15;

/// Tries per probe while building a hop.
const HOP_PROBE_TRIES: u8 = 1;

/// Probes it takes to enumerate a hop with `n_ifaces` interfaces. Used to
/// charge the budget in offline replay as if we had probed.
pub fn iface_count_to_probes(n_ifaces: usize) -> usize {
    if n_ifaces >= PARIS_MAX_IFACES {
        return 0;
    }
    PARIS_IFACE2PROBES[n_ifaces]
}

#[derive(Debug, Error)]
#[error("prober task terminated")]
pub struct ProberGone;

/// A finished hop: the wire TTL it was built for, the probes it consumed,
/// and the hop value itself.
#[derive(Debug)]
pub struct HopResult {
    pub ttl: u8,
    pub probes_sent: usize,
    pub hop: PathHop,
}

// ============================================================================
// HopRemap
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct IfaceSample {
    addr: Ipv4Addr,
    rtt_ms: f64,
}

/// Per-TTL builder state. Lives from the driver's request until the
/// completed hop is emitted.
struct HopRemap {
    ttl: u8,
    probes_sent: usize,
    pending_probes: usize,
    ips: BTreeSet<Ipv4Addr>,
    samples: BTreeMap<u16, IfaceSample>,
}

enum HopStep {
    /// Submit probes with these flow ids.
    Send(Range<u16>),
    /// Replies still outstanding.
    Wait,
    /// Stopping rule satisfied and every probe answered.
    Done { hop: PathHop, probes_sent: usize },
}

impl HopRemap {
    fn new(ttl: u8) -> HopRemap {
        HopRemap {
            ttl,
            probes_sent: 0,
            pending_probes: 0,
            ips: BTreeSet::new(),
            samples: BTreeMap::new(),
        }
    }

    /// The opening burst: flow ids `0..K[0]`.
    fn start(&mut self) -> Range<u16> {
        let needed = self.needed_probes();
        debug_assert_eq!(needed, PARIS_IFACE2PROBES[0]);
        self.issue(needed)
    }

    /// `K[|ips|] - probes_sent`; zero once the interface cap is reached.
    fn needed_probes(&self) -> usize {
        if self.ips.len() >= PARIS_MAX_IFACES {
            return 0;
        }
        PARIS_IFACE2PROBES[self.ips.len()] - self.probes_sent
    }

    fn issue(&mut self, count: usize) -> Range<u16> {
        let start = self.probes_sent as u16;
        self.probes_sent += count;
        self.pending_probes += count;
        start..start + count as u16
    }

    fn on_reply(&mut self, reply: ProbeReply) -> HopStep {
        debug_assert_eq!(reply.ttl, self.ttl);
        self.pending_probes -= 1;

        if !reply.is_star() {
            self.ips.insert(reply.addr);
            self.samples.insert(
                reply.flow_id,
                IfaceSample {
                    addr: reply.addr,
                    rtt_ms: reply.rtt.as_secs_f64() * 1000.0,
                },
            );
            debug!(ttl = self.ttl, ips = self.ips.len(), "distinct interfaces so far");
        }

        let needed = self.needed_probes();
        if needed > 0 {
            HopStep::Send(self.issue(needed))
        } else if self.pending_probes == 0 {
            HopStep::Done {
                hop: self.build_hop(),
                probes_sent: self.probes_sent,
            }
        } else {
            HopStep::Wait
        }
    }

    /// Aggregate the per-flow samples into one hop: for each distinct
    /// address, RTT min/avg/max/var over the flows that saw it and the
    /// flow id list itself. The hop is rendered to its string form and
    /// parsed back, so it obeys every hop invariant.
    fn build_hop(&self) -> PathHop {
        let tstamp = chrono::Utc::now().timestamp();
        if self.ips.is_empty() {
            return PathHop::star(self.ttl, tstamp);
        }

        let mut parts = Vec::with_capacity(self.ips.len());
        for ip in &self.ips {
            let mut flows = Vec::new();
            let mut rtts = Vec::new();
            for (flow_id, sample) in &self.samples {
                if sample.addr != *ip {
                    continue;
                }
                flows.push(flow_id.to_string());
                rtts.push(sample.rtt_ms);
            }
            let n = rtts.len() as f64;
            let sx: f64 = rtts.iter().sum();
            let ssx: f64 = rtts.iter().map(|r| r * r).sum();
            let rtt_min = rtts.iter().copied().fold(f64::INFINITY, f64::min);
            let rtt_max = rtts.iter().copied().fold(0.0, f64::max);
            let rtt_avg = sx / n;
            let rtt_var = ssx / n - rtt_avg * rtt_avg;
            parts.push(format!(
                "{}:{}:{:.2},{:.2},{:.2},{:.2}:",
                ip,
                flows.join(","),
                rtt_min,
                rtt_avg,
                rtt_max,
                rtt_var
            ));
        }

        let hopstr = parts.join(";");
        debug!(ttl = self.ttl, hop = %hopstr, "hop complete");
        PathHop::parse(&hopstr, tstamp, self.ttl).expect("hop built from replies parses")
    }
}

// ============================================================================
// Prober
// ============================================================================

/// Handle to the prober task. One hop is in flight at a time; the driver
/// requests a TTL and parks in [`recv_hop`](Self::recv_hop) until the
/// builder finishes.
pub struct Prober {
    request_tx: mpsc::UnboundedSender<u8>,
    hop_rx: mpsc::Receiver<HopResult>,
}

impl Prober {
    /// Start the prober task over `oracle`. Dropping the `Prober` closes
    /// the request channel, which stops the task and tears the oracle
    /// down with it.
    pub fn spawn(oracle: OracleHandle) -> Prober {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (hop_tx, hop_rx) = mpsc::channel(1);
        tokio::spawn(prober_task(oracle, request_rx, hop_tx));
        Prober { request_tx, hop_rx }
    }

    /// Ask for the hop at wire TTL `ttl` (1-based on the wire).
    pub fn remap_hop(&self, ttl: u8) -> Result<(), ProberGone> {
        debug!(ttl, "requesting hop");
        self.request_tx.send(ttl).map_err(|_| ProberGone)
    }

    /// Block the calling (driver) thread until the finished hop arrives.
    /// This is the search's only suspension point.
    pub fn recv_hop(&mut self) -> Result<HopResult, ProberGone> {
        self.hop_rx.blocking_recv().ok_or(ProberGone)
    }
}

async fn prober_task(
    mut oracle: OracleHandle,
    mut request_rx: mpsc::UnboundedReceiver<u8>,
    hop_tx: mpsc::Sender<HopResult>,
) {
    info!("prober started");
    while let Some(ttl) = request_rx.recv().await {
        let Some(result) = resolve_hop(&mut oracle, ttl).await else {
            break;
        };
        if hop_tx.send(result).await.is_err() {
            break;
        }
    }
    debug!("prober stopped");
}

/// Drive one `HopRemap` to completion against the oracle. Returns `None`
/// if the oracle went away mid-build.
async fn resolve_hop(oracle: &mut OracleHandle, ttl: u8) -> Option<HopResult> {
    let mut hr = HopRemap::new(ttl);
    submit(oracle, ttl, hr.start())?;

    loop {
        let reply = oracle.reply_rx.recv().await?;
        if reply.ttl != ttl {
            debug!(reply_ttl = reply.ttl, ttl, "discarding stale reply");
            continue;
        }
        match hr.on_reply(reply) {
            HopStep::Send(flows) => submit(oracle, ttl, flows)?,
            HopStep::Wait => {}
            HopStep::Done { hop, probes_sent } => {
                return Some(HopResult {
                    ttl,
                    probes_sent,
                    hop,
                })
            }
        }
    }
}

fn submit(oracle: &OracleHandle, ttl: u8, flows: Range<u16>) -> Option<()> {
    for flow_id in flows {
        oracle
            .query_tx
            .send(ProbeQuery {
                ttl,
                flow_id,
                tries: HOP_PROBE_TRIES,
            })
            .ok()?;
    }
    Some(())
}
