//! Path, hop and interface model for measured forward IP paths.
//!
//! A path is a sequence of hops indexed by zero-based TTL; each hop is the
//! set of router interfaces discovered at that TTL, sorted by address. An
//! unresponsive TTL is represented by a "star" hop whose sole interface
//! carries the sentinel address 255.255.255.255.

use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use thiserror::Error;
use tracing::{debug, warn};

/// Longest path we track; probing never goes past this TTL.
pub const MAX_PATH_LENGTH: usize = 32;

/// Widest load balancer observed in the wild.
pub const MAX_HOP_IFACES: usize = 32;

/// Sentinel address of an unresponsive interface.
pub const STAR_IP: Ipv4Addr = Ipv4Addr::BROADCAST;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid path: {0}")]
pub struct InvalidPath(pub String);

/// Knobs for [`path_diff`] and [`Path::search_hop`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffFlags {
    /// Absorb star hops that pair with a plausible single-interface hop.
    pub fix_stars: bool,
    /// Pad the shorter path with the longer path's tail when the only
    /// difference is length.
    pub fill_missing: bool,
    /// Compare hops by their first interface only.
    pub ignore_balancers: bool,
}

impl DiffFlags {
    pub const NONE: DiffFlags = DiffFlags {
        fix_stars: false,
        fill_missing: false,
        ignore_balancers: false,
    };
}

// ============================================================================
// Iface
// ============================================================================

/// One router interface observed at a TTL, with the flow identifiers that
/// exposed it and RTT statistics in milliseconds.
#[derive(Debug, Clone)]
pub struct Iface {
    pub ip: Ipv4Addr,
    pub ttl: u8,
    pub flow_ids: Vec<u16>,
    pub rtt_min: f64,
    pub rtt_avg: f64,
    pub rtt_max: f64,
    pub rtt_var: f64,
    /// Opaque trailing flags field, kept verbatim through round trips.
    pub flags: String,
}

impl Iface {
    /// Parse `ip:flowids:rttmin,rttavg,rttmax,rttvar:flags` (flags may be
    /// empty or absent).
    pub fn parse(s: &str, ttl: u8) -> Result<Iface, InvalidPath> {
        let mut parts = s.splitn(4, ':');
        let addr = parts.next().unwrap_or("");
        let flowstr = parts
            .next()
            .ok_or_else(|| InvalidPath(format!("iface missing flow ids: [{s}]")))?;
        let rttstr = parts
            .next()
            .ok_or_else(|| InvalidPath(format!("iface missing rtts: [{s}]")))?;
        let flags = parts.next().unwrap_or("").to_string();

        let ip = Ipv4Addr::from_str(addr)
            .map_err(|_| InvalidPath(format!("bad interface address: [{addr}]")))?;

        let flow_ids = flowstr
            .split(',')
            .map(|id| id.parse::<u16>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| InvalidPath(format!("bad flow id list: [{flowstr}]")))?;
        if flow_ids.is_empty() {
            return Err(InvalidPath(format!("empty flow id list: [{s}]")));
        }

        let rtts = rttstr
            .split(',')
            .map(|r| r.parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| InvalidPath(format!("bad rtt list: [{rttstr}]")))?;
        let &[rtt_min, rtt_avg, rtt_max, rtt_var] = rtts.as_slice() else {
            return Err(InvalidPath(format!("expected 4 rtt fields: [{rttstr}]")));
        };

        Ok(Iface {
            ip,
            ttl,
            flow_ids,
            rtt_min,
            rtt_avg,
            rtt_max,
            rtt_var,
            flags,
        })
    }

    pub fn star(ttl: u8) -> Iface {
        Iface {
            ip: STAR_IP,
            ttl,
            flow_ids: vec![0],
            rtt_min: 0.0,
            rtt_avg: 0.0,
            rtt_max: 0.0,
            rtt_var: 0.0,
            flags: String::new(),
        }
    }

    pub fn is_star(&self) -> bool {
        self.ip == STAR_IP
    }

    pub fn first_flowid(&self) -> u16 {
        self.flow_ids[0]
    }

    /// Pick one of the flow identifiers that reached this interface.
    pub fn random_flowid(&self) -> u16 {
        let i = rand::random::<usize>() % self.flow_ids.len();
        self.flow_ids[i]
    }
}

impl fmt::Display for Iface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flows = self
            .flow_ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        write!(
            f,
            "{}:{}:{:.2},{:.2},{:.2},{:.2}:{}",
            self.ip, flows, self.rtt_min, self.rtt_avg, self.rtt_max, self.rtt_var, self.flags
        )
    }
}

// ============================================================================
// PathHop
// ============================================================================

/// The interfaces discovered at one TTL, sorted by address ascending.
#[derive(Debug, Clone)]
pub struct PathHop {
    ttl: u8,
    tstamp: i64,
    ifaces: Vec<Iface>,
}

impl PathHop {
    /// Parse `iface(;iface)*`. Fails if any interface is malformed.
    pub fn parse(s: &str, tstamp: i64, ttl: u8) -> Result<PathHop, InvalidPath> {
        let mut ifaces = s
            .split(';')
            .map(|part| Iface::parse(part, ttl))
            .collect::<Result<Vec<_>, _>>()?;
        if ifaces.len() > MAX_HOP_IFACES {
            warn!(ttl, n = ifaces.len(), "truncating oversized hop");
            ifaces.truncate(MAX_HOP_IFACES);
        }
        ifaces.sort_by(|a, b| a.ip.cmp(&b.ip));
        Ok(PathHop { ttl, tstamp, ifaces })
    }

    /// A hop whose TTL went unanswered.
    pub fn star(ttl: u8, tstamp: i64) -> PathHop {
        PathHop {
            ttl,
            tstamp,
            ifaces: vec![Iface::star(ttl)],
        }
    }

    pub fn ttl(&self) -> u8 {
        self.ttl
    }

    pub fn set_ttl(&mut self, ttl: u8) {
        self.ttl = ttl;
        for iface in &mut self.ifaces {
            iface.ttl = ttl;
        }
    }

    pub fn tstamp(&self) -> i64 {
        self.tstamp
    }

    pub fn ifaces(&self) -> &[Iface] {
        &self.ifaces
    }

    pub fn nifaces(&self) -> usize {
        self.ifaces.len()
    }

    pub fn first_ip(&self) -> Ipv4Addr {
        self.ifaces[0].ip
    }

    pub fn is_star(&self) -> bool {
        self.ifaces.len() == 1 && self.ifaces[0].ip == STAR_IP
    }

    pub fn contains_ip(&self, ip: Ipv4Addr) -> bool {
        self.ifaces.iter().any(|iface| iface.ip == ip)
    }

    /// Hop identity under `flags`: first-interface address only when
    /// balancers are ignored, the full address sequence otherwise.
    pub fn eq_with(&self, other: &PathHop, flags: DiffFlags) -> bool {
        if flags.ignore_balancers {
            self.ifaces[0].ip == other.ifaces[0].ip
        } else {
            self.ifaces.len() == other.ifaces.len()
                && self
                    .ifaces
                    .iter()
                    .zip(&other.ifaces)
                    .all(|(a, b)| a.ip == b.ip)
        }
    }

    /// Move the destination interface to position 0; the rest stay sorted.
    /// Asymmetric load balancers may put extra addresses on the last hop,
    /// and joins between reachable paths must compare destination-first.
    fn dst_first(&mut self, dst: Ipv4Addr) {
        let di = self
            .ifaces
            .iter()
            .position(|iface| iface.ip == dst)
            .expect("destination interface present in last hop");
        self.ifaces.swap(0, di);
        self.ifaces[1..].sort_by(|a, b| a.ip.cmp(&b.ip));
    }
}

impl fmt::Display for PathHop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for iface in &self.ifaces {
            if !first {
                write!(f, ";")?;
            }
            write!(f, "{iface}")?;
            first = false;
        }
        Ok(())
    }
}

// ============================================================================
// Path
// ============================================================================

/// A measured forward path from `src` to `dst`.
#[derive(Debug, Clone)]
pub struct Path {
    src: Ipv4Addr,
    dst: Ipv4Addr,
    tstamp: i64,
    hops: Vec<PathHop>,
    /// Address index over every interface in the path. Value copies, not a
    /// second owner; rebuilt from the hops on construction and extended on
    /// mutation.
    ifaces: BTreeMap<Ipv4Addr, Iface>,
    no_reachability: bool,
    alias: Option<u32>,
}

impl Path {
    /// Parse a full path line: `<src> <dst> <tvsec> <hopstr>`.
    pub fn parse(line: &str) -> Result<Path, InvalidPath> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            debug!(line, "failed to parse path line");
            return Err(InvalidPath(format!("expected 4 fields, got {}", fields.len())));
        }
        let src = Ipv4Addr::from_str(fields[0])
            .map_err(|_| InvalidPath(format!("bad source address: [{}]", fields[0])))?;
        let dst = Ipv4Addr::from_str(fields[1])
            .map_err(|_| InvalidPath(format!("bad destination address: [{}]", fields[1])))?;
        let tstamp = fields[2]
            .parse::<i64>()
            .map_err(|_| InvalidPath(format!("bad timestamp: [{}]", fields[2])))?;

        let mut path = Path::from_hops(fields[3], dst)?;
        path.src = src;
        path.tstamp = tstamp;
        for hop in &mut path.hops {
            hop.tstamp = tstamp;
        }
        Ok(path)
    }

    /// Build a path from a hop string alone. The source is unknown and the
    /// timestamp is zero; hops that fail to parse are skipped.
    pub fn from_hops(hopstr: &str, dst: Ipv4Addr) -> Result<Path, InvalidPath> {
        let mut path = Path {
            src: STAR_IP,
            dst,
            tstamp: 0,
            hops: Vec::new(),
            ifaces: BTreeMap::new(),
            no_reachability: false,
            alias: None,
        };

        for hopstr in hopstr.split('|') {
            let ttl = path.hops.len();
            if ttl >= MAX_PATH_LENGTH {
                warn!(ttl, "path too long, truncating");
                break;
            }
            match PathHop::parse(hopstr, path.tstamp, ttl as u8) {
                Ok(hop) => {
                    path.add_ifaces(&hop);
                    path.hops.push(hop);
                }
                Err(e) => debug!(ttl, error = %e, "skipping unparseable hop"),
            }
        }
        if path.hops.is_empty() {
            debug!(hopstr, "path has no parseable hops");
            return Err(InvalidPath(format!("no parseable hops in [{hopstr}]")));
        }

        path.check_reachability();
        Ok(path)
    }

    /// Assemble a path from already-built hops, renumbering their TTLs.
    pub fn from_parts(src: Ipv4Addr, dst: Ipv4Addr, tstamp: i64, hops: Vec<PathHop>) -> Path {
        let mut path = Path {
            src,
            dst,
            tstamp,
            hops: Vec::new(),
            ifaces: BTreeMap::new(),
            no_reachability: false,
            alias: None,
        };
        for mut hop in hops.into_iter().take(MAX_PATH_LENGTH) {
            hop.set_ttl(path.hops.len() as u8);
            path.add_ifaces(&hop);
            path.hops.push(hop);
        }
        path.check_reachability();
        path
    }

    pub fn src(&self) -> Ipv4Addr {
        self.src
    }

    pub fn dst(&self) -> Ipv4Addr {
        self.dst
    }

    pub fn tstamp(&self) -> i64 {
        self.tstamp
    }

    pub fn len(&self) -> usize {
        self.hops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    pub fn hop(&self, ttl: usize) -> &PathHop {
        &self.hops[ttl]
    }

    pub fn hops(&self) -> &[PathHop] {
        &self.hops
    }

    pub fn reachable(&self) -> bool {
        !self.no_reachability
    }

    pub fn alias(&self) -> Option<u32> {
        self.alias
    }

    pub fn set_alias(&mut self, alias: u32) {
        self.alias = Some(alias);
    }

    /// Whether `ip` appears on any interface anywhere in the path.
    pub fn contains_ip(&self, ip: Ipv4Addr) -> bool {
        self.ifaces.contains_key(&ip)
    }

    pub fn iface(&self, ip: Ipv4Addr) -> Option<&Iface> {
        self.ifaces.get(&ip)
    }

    /// First TTL whose hop matches `hop` under `flags`. A probed hop that
    /// contains the destination of a reachable path matches the last hop
    /// even if the interface sets differ (the balancer may be asymmetric).
    ///
    /// Star hops have no identity; looking one up is a caller bug.
    pub fn search_hop(&self, hop: &PathHop, flags: DiffFlags) -> Option<usize> {
        assert!(!hop.is_star(), "searching for a star hop");
        for (ttl, own) in self.hops.iter().enumerate() {
            if own.eq_with(hop, flags) {
                return Some(ttl);
            }
        }
        if hop.contains_ip(self.dst) && !self.no_reachability {
            debug!(ttl = self.len() - 1, "hop contains dst of reachable path");
            return Some(self.len() - 1);
        }
        None
    }

    /// Replace the hop at `ttl`. Only star hops (or TTL 0) may be replaced;
    /// anything else indicates a bookkeeping bug upstream.
    pub fn set_hop(&mut self, ttl: usize, mut hop: PathHop) {
        assert!(
            ttl == 0 || self.hops[ttl].is_star(),
            "replacing a resolved hop at ttl {ttl}"
        );
        self.add_ifaces(&hop);
        hop.set_ttl(ttl as u8);
        self.hops[ttl] = hop;
    }

    fn add_ifaces(&mut self, hop: &PathHop) {
        if hop.is_star() {
            return;
        }
        for iface in hop.ifaces() {
            self.ifaces.entry(iface.ip).or_insert_with(|| iface.clone());
        }
    }

    fn remove_end_stars(&mut self) {
        while self.hops.last().is_some_and(PathHop::is_star) {
            self.hops.pop();
        }
    }

    /// Re-establish the path invariants after construction or mutation:
    /// no trailing stars, reachability flag in sync with the last hop, and
    /// the destination interface pivoted first when reachable.
    fn check_reachability(&mut self) {
        self.remove_end_stars();
        let dst = self.dst;
        match self.hops.last_mut() {
            Some(last) if last.contains_ip(dst) => {
                self.no_reachability = false;
                last.dst_first(dst);
            }
            _ => self.no_reachability = true,
        }
    }

    fn append_hop(&mut self, mut hop: PathHop) {
        hop.set_ttl(self.hops.len() as u8);
        self.add_ifaces(&hop);
        self.hops.push(hop);
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {} ", self.src, self.dst, self.tstamp)?;
        let mut first = true;
        for hop in &self.hops {
            if !first {
                write!(f, "|")?;
            }
            write!(f, "{hop}")?;
            first = false;
        }
        Ok(())
    }
}

// ============================================================================
// path_diff
// ============================================================================

/// Number of disjoint change segments between two paths to the same
/// destination. Walks both paths in lockstep; on a mismatch, realigns at
/// the next pair of equal hops and counts the skipped segment once.
pub fn path_diff(p1: &mut Path, p2: &mut Path, flags: DiffFlags) -> usize {
    let mut changes = 0;
    let mut i1 = 0;
    let mut i2 = 0;

    while i1 < p1.len() && i2 < p2.len() {
        if p1.hops[i1].eq_with(&p2.hops[i2], flags) {
            i1 += 1;
            i2 += 1;
            continue;
        }
        let (mut j1, mut j2) = path_diff_join(p1, p2, i1, i2, flags);
        if flags.fix_stars {
            path_diff_fix_stars(p1, p2, &mut i1, &mut i2, &mut j1, &mut j2);
        }
        if j1 > i1 || j2 > i2 {
            changes += 1;
        }
        i1 = j1;
        i2 = j2;
    }

    if flags.fill_missing && changes == 0 {
        debug_assert_eq!(i1, i2);
        path_diff_fill_missing(p1, p2, i1);
    } else if i1 != p1.len() || i2 != p2.len() {
        changes += 1;
    }

    changes
}

/// Find the next aligned pair `(j1, j2)` at or after `(i1, i2)`, skipping
/// stars on the second path. Returns both lengths if the paths never
/// rejoin.
fn path_diff_join(
    p1: &Path,
    p2: &Path,
    i1: usize,
    i2: usize,
    flags: DiffFlags,
) -> (usize, usize) {
    for j2 in i2..p2.len() {
        if p2.hops[j2].is_star() {
            continue;
        }
        for j1 in i1..p1.len() {
            if p1.hops[j1].eq_with(&p2.hops[j2], flags) {
                return (j1, j2);
            }
        }
    }
    (p1.len(), p2.len())
}

/// Shrink a mismatched segment from both ends by absorbing star hops into
/// their non-star counterparts.
fn path_diff_fix_stars(
    p1: &mut Path,
    p2: &mut Path,
    i1: &mut usize,
    i2: &mut usize,
    j1: &mut usize,
    j2: &mut usize,
) {
    let mut threshold = (*j1 - *i1).min(*j2 - *i2);
    let mut i = 0;
    while i < threshold {
        if !path_diff_fix_stars_1hop(p1, p2, *i1 + i, *i2 + i, *j1, *j2) {
            break;
        }
        i += 1;
    }
    *i1 += i;
    *i2 += i;

    threshold = (*j1 - *i1).min(*j2 - *i2);
    let mut j = 0;
    while j < threshold {
        if !path_diff_fix_stars_1hop(p1, p2, *j1 - j - 1, *j2 - j - 1, *j1, *j2) {
            break;
        }
        j += 1;
    }
    *j1 -= j;
    *j2 -= j;

    debug_assert!(*i1 <= *j1 && *i2 <= *j2);
    p1.check_reachability();
    p2.check_reachability();
}

/// Absorb one star/non-star pairing. The non-star side must be a single
/// interface not already elsewhere in the star path, and the destination
/// may only land on the last position of the segment.
fn path_diff_fix_stars_1hop(
    p1: &mut Path,
    p2: &mut Path,
    i1: usize,
    i2: usize,
    j1: usize,
    j2: usize,
) -> bool {
    let s1 = p1.hops[i1].is_star();
    let s2 = p2.hops[i2].is_star();
    if s1 && s2 {
        return true;
    }
    if !s1 && !s2 {
        return false;
    }

    let (starp, stari, starj, src) = if s1 {
        (&mut *p1, i1, j1, p2.hops[i2].clone())
    } else {
        (&mut *p2, i2, j2, p1.hops[i1].clone())
    };

    if src.nifaces() > 1 {
        return false;
    }
    if starp.contains_ip(src.first_ip()) {
        return false;
    }
    if src.first_ip() == starp.dst() && stari + 1 != starj {
        return false;
    }

    starp.set_hop(stari, src);
    true
}

/// A pure length difference is no change: copy the longer path's tail onto
/// the shorter one.
fn path_diff_fill_missing(p1: &mut Path, p2: &mut Path, ttl: usize) {
    debug_assert!(ttl == p1.len() || ttl == p2.len());
    fn fill(shorter: &mut Path, longer: &Path, ttl: usize) {
        for t in ttl..longer.len() {
            shorter.append_hop(longer.hops[t].clone());
        }
    }
    if p1.len() < p2.len() {
        fill(p1, p2, ttl);
    } else if p2.len() < p1.len() {
        fill(p2, p1, ttl);
    }
}
