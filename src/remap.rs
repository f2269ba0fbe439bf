//! The remap search driver.
//!
//! Starting from a TTL where the path is suspected to have changed, the
//! driver resolves as few hops as possible to find the diverged segment:
//! a binary search over TTLs handles pure shifts (hops inserted or
//! removed upstream), and a local branch/join expansion handles segments
//! whose routers the old path has never seen. Resolved hops are cached so
//! no TTL is ever probed twice.

use tracing::{debug, info, warn};

use crate::path::{DiffFlags, InvalidPath, Path, PathHop, MAX_PATH_LENGTH};
use crate::probedb::ProbeDb;
use crate::prober::{iface_count_to_probes, Prober, ProberGone};
use crate::report;
use thiserror::Error;

/// Shift of the new path against the old path at one TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shift {
    /// `new_ttl - old_ttl` for the router observed there.
    Known(i32),
    /// Interior of a diverged segment; no old-path counterpart.
    Change,
}

impl Default for Shift {
    fn default() -> Self {
        Shift::Known(0)
    }
}

#[derive(Debug, Error)]
pub enum RemapError {
    #[error(transparent)]
    InvalidPath(#[from] InvalidPath),
    #[error("start ttl {start} is past the old path (length {len})")]
    StartBeyondPath { start: usize, len: usize },
    #[error("no responsive hop at or below the start ttl")]
    NoResponsiveHop,
    #[error(transparent)]
    ProberGone(#[from] ProberGone),
}

/// Search state. Owns the old path, the probe cache, and (online) the
/// prober handle; the optional new path enables offline replay, where
/// hops are synthesized instead of probed and the budget is charged as if
/// probing.
pub struct Remap {
    old_path: Path,
    new_path: Option<Path>,
    prober: Option<Prober>,
    db: ProbeDb,
    start_ttl: usize,
    probes_sent: usize,
    shifts: [Shift; MAX_PATH_LENGTH],
}

impl Remap {
    /// Online driver: hops come from the prober. `start_ttl` is the
    /// one-based wire TTL from the command line.
    pub fn online(old_path: Path, prober: Prober, start_ttl: u8) -> Remap {
        Remap::new(old_path, None, Some(prober), start_ttl)
    }

    /// Offline replay against a known new path; no probes are sent.
    pub fn offline(old_path: Path, new_path: Path, start_ttl: u8) -> Remap {
        Remap::new(old_path, Some(new_path), None, start_ttl)
    }

    fn new(old_path: Path, new_path: Option<Path>, prober: Option<Prober>, start_ttl: u8) -> Remap {
        Remap {
            old_path,
            new_path,
            prober,
            db: ProbeDb::new(),
            // All search computation counts TTLs from zero.
            start_ttl: usize::from(start_ttl) - 1,
            probes_sent: 0,
            shifts: [Shift::default(); MAX_PATH_LENGTH],
        }
    }

    /// Run the search and return the result line.
    pub fn run(mut self) -> Result<String, RemapError> {
        if self.start_ttl > self.old_path.len() || self.start_ttl >= MAX_PATH_LENGTH {
            return Err(RemapError::StartBeyondPath {
                start: self.start_ttl,
                len: self.old_path.len(),
            });
        }

        // Resolve the start hop, walking left while the router at the
        // start TTL cannot be reached. If nothing answers down to TTL 0,
        // there is no anchor to remap from.
        let mut start = self.start_ttl;
        let mut hop = self.get_hop(start)?;
        while hop.is_star() && start > 0 {
            info!(ttl = start, "unresponsive hop, decreasing start ttl");
            start -= 1;
            hop = self.get_hop(start)?;
        }
        if hop.is_star() {
            warn!("no responsive hop found down to ttl 0");
            return Err(RemapError::NoResponsiveHop);
        }
        self.start_ttl = start;

        match self.old_path.search_hop(&hop, DiffFlags::NONE) {
            Some(ttl) if ttl == start => {
                // The start hop sits where the old path expects it.
                info!("no remap to do");
                let nprobes = if self.new_path.is_some() {
                    0
                } else {
                    self.probes_sent
                };
                Ok(report::render_path(nprobes, &self.old_path))
            }
            Some(_) => {
                // The hop exists in the old path at another TTL.
                info!("starting with binary search");
                self.remap_binary(0, start)?;
                self.finish()
            }
            None => {
                // The hop is foreign; expand around it directly.
                info!("starting with local remap");
                self.remap_local(start, 0, true)?;
                self.finish()
            }
        }
    }

    fn finish(&self) -> Result<String, RemapError> {
        debug!(hops = %self.db.dump_hops(), "resolved hops");
        Ok(report::render(self.probes_sent, &self.old_path, &self.db))
    }

    /// The driver's only probe entry point. Cached TTLs are returned as
    /// is; otherwise the hop is synthesized from the new path (offline)
    /// or requested from the prober, which parks this thread until the
    /// builder finishes.
    fn get_hop(&mut self, ttl: usize) -> Result<PathHop, RemapError> {
        if let Some(hop) = self.db.find_hop(ttl) {
            return Ok(hop.clone());
        }

        let mut hop = match &self.new_path {
            Some(new_path) => {
                if ttl < new_path.len() {
                    let hop = new_path.hop(ttl).clone();
                    self.probes_sent += iface_count_to_probes(hop.nifaces());
                    hop
                } else {
                    self.probes_sent += iface_count_to_probes(0);
                    PathHop::star(ttl as u8, chrono::Utc::now().timestamp())
                }
            }
            None => {
                let prober = self.prober.as_mut().ok_or(ProberGone)?;
                // Wire TTLs are one-based; path indices count from zero.
                prober.remap_hop(ttl as u8 + 1)?;
                let result = prober.recv_hop()?;
                self.probes_sent += result.probes_sent;
                result.hop
            }
        };

        hop.set_ttl(ttl as u8);
        Ok(self.db.add_hop(hop).clone())
    }

    /// Open a local branch..join segment around a TTL known to have
    /// diverged. Returns the join TTL.
    fn remap_local(&mut self, ttl: usize, minttl: usize, first: bool) -> Result<usize, RemapError> {
        // Branch search: walk left until a responsive hop the old path
        // knows. Falling past TTL 0 means the old path shares nothing
        // with the new one, which the caller ruled out.
        let mut probe = ttl as i64;
        let (branch, old_branch_ttl) = loop {
            assert!(probe >= 0, "branch search fell off the path");
            debug!(ttl = probe, "looking for branch");
            let hop = self.get_hop(probe as usize)?;
            if !hop.is_star() {
                if let Some(old_ttl) = self.old_path.search_hop(&hop, DiffFlags::NONE) {
                    break (probe as usize, old_ttl);
                }
            }
            probe -= 1;
        };

        // Join search: walk right until the paths converge again, the
        // destination answers, or (at the top level) the star gap grows
        // past 4 TTLs.
        let mut join = ttl + 1;
        let mut join_last_responsive = ttl;
        loop {
            if join > MAX_PATH_LENGTH - 1 {
                debug!("path too long");
            }
            if first && join - join_last_responsive > 4 {
                debug!("too many stars, giving up on a join");
                break;
            }
            debug!(ttl = join, "looking for join");
            let hop = self.get_hop(join)?;
            if !hop.is_star() {
                join_last_responsive = join;
            }
            join += 1;
            if hop.contains_ip(self.old_path.dst()) {
                debug!("hop contains dst");
                break;
            }
            let rejoined = !hop.is_star()
                && self
                    .old_path
                    .search_hop(&hop, DiffFlags::NONE)
                    .is_some_and(|old_ttl| old_ttl >= old_branch_ttl);
            if rejoined || join >= MAX_PATH_LENGTH {
                break;
            }
        }
        join -= 1;

        let join_hop = self.db.find_hop(join).expect("join hop resolved").clone();
        if !join_hop.is_star() && join < MAX_PATH_LENGTH {
            let old_join_ttl = self
                .old_path
                .search_hop(&join_hop, DiffFlags::NONE)
                .map(|t| t as i32)
                .unwrap_or(-1);
            self.shifts[join] = Shift::Known(join as i32 - old_join_ttl);
        }
        for i in branch + 1..join {
            self.shifts[i] = Shift::Change;
        }

        if self.shifts[branch] != Shift::Known(branch as i32 - old_branch_ttl as i32) {
            // The branch hop itself is displaced; resolve the left side.
            self.remap_binary(minttl, branch)?;
        }

        Ok(join)
    }

    /// Find the leftmost shifted hop in `(l, r]`. Both bounds point at
    /// resolved hops; the midpoint walk keeps `i` strictly interior.
    fn remap_binary(&mut self, l: usize, r: usize) -> Result<(), RemapError> {
        debug!(l, r, "binary search");
        let right_boundary = r;
        let mut l = l;
        let mut r = r;
        let mut p1left = 0i32;
        let mut p1right = MAX_PATH_LENGTH as i32;

        while r > l + 1 {
            let mut i = (l + r) / 2;
            let mut hop = self.get_hop(i)?;
            while hop.is_star() && i > l {
                i -= 1;
                hop = self.get_hop(i)?;
            }
            if i == l {
                // Stars pushed us onto the left limit; fall back to a
                // local expansion around the midpoint.
                r = self.remap_local((l + r) / 2, l, false)?;
                break;
            }

            let found = self.old_path.search_hop(&hop, DiffFlags::NONE);
            debug!(i, ?found, shift = ?self.shifts[i], "binary step");
            match found {
                Some(p1ttl) if Shift::Known(i as i32 - p1ttl as i32) == self.shifts[i] => {
                    // Hop where expected; the change is to the right.
                    l = i;
                    p1left = p1ttl as i32;
                }
                Some(p1ttl) if p1left <= p1ttl as i32 && (p1ttl as i32) <= p1right => {
                    // Displaced but consistent with the bracket. The
                    // bracket check matters when old and new paths are
                    // twisted (abcde vs aedcb).
                    r = i;
                    p1right = p1ttl as i32;
                }
                _ => {
                    // A hop the old path does not contain at all.
                    r = self.remap_local(i, l, false)?;
                    break;
                }
            }
        }

        let hop = self.db.find_hop(r).expect("hop at right boundary resolved").clone();
        let shift = r as i32
            - self
                .old_path
                .search_hop(&hop, DiffFlags::NONE)
                .map(|t| t as i32)
                .unwrap_or(-1);
        for i in r..=right_boundary.min(MAX_PATH_LENGTH - 1) {
            self.shifts[i] = Shift::Known(shift);
        }

        // Probes cached on the way down may disagree with the shift we
        // just settled on; re-examine them in TTL order and recurse on
        // any mismatch.
        let mut prev_ttl = 0;
        let cached: Vec<(usize, PathHop)> = self
            .db
            .hops()
            .map(|(ttl, hop)| (ttl, hop.clone()))
            .collect();
        for (ttl, hop) in cached {
            if ttl > right_boundary || ttl <= r {
                continue;
            }
            debug_assert!(self.shifts[ttl] != Shift::Change);
            if hop.is_star() {
                continue;
            }
            let true_shift = ttl as i32
                - self
                    .old_path
                    .search_hop(&hop, DiffFlags::NONE)
                    .map(|t| t as i32)
                    .unwrap_or(-1);
            if Shift::Known(true_shift) != self.shifts[ttl] {
                self.remap_binary(prev_ttl, ttl)?;
            }
            prev_ttl = ttl;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::STAR_IP;

    const STAR: &str = "255.255.255.255:0:0.00,0.00,0.00,0.00:";

    fn hopstr(names: &[&str]) -> String {
        names
            .iter()
            .map(|name| match *name {
                "*" => STAR.to_string(),
                ip => format!("{ip}:0:1.00,1.00,1.00,0.00:"),
            })
            .collect::<Vec<_>>()
            .join("|")
    }

    fn path(names: &[&str], dst: &str) -> Path {
        Path::from_hops(&hopstr(names), dst.parse().unwrap()).unwrap()
    }

    /// Split a result line into (nprobes, hopstr).
    fn parse_result(line: &str) -> (usize, String) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        assert_eq!(fields.len(), 5, "result line: [{line}]");
        (fields[0].parse().unwrap(), fields[4].to_string())
    }

    fn ips_of(hopstr: &str) -> Vec<String> {
        hopstr
            .split('|')
            .map(|h| h.split(':').next().unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_no_change_offline() {
        // S1: old == new, the start hop is exactly where expected.
        let old = path(&["10.0.0.1", "10.0.0.2", "10.0.0.3"], "10.0.0.3");
        let new = path(&["10.0.0.1", "10.0.0.2", "10.0.0.3"], "10.0.0.3");
        let expect = old.to_string();
        let line = Remap::offline(old, new, 3).run().unwrap();
        let (nprobes, hops) = parse_result(&line);
        assert_eq!(nprobes, 0);
        assert!(expect.ends_with(&hops));
    }

    #[test]
    fn test_pure_shift_insertion() {
        // S2: X inserted at TTL 1; the start hop is displaced, so the
        // binary search finds the insertion point.
        let old = path(&["1.1.1.1", "2.2.2.2", "3.3.3.3", "4.4.4.4"], "4.4.4.4");
        let new = path(
            &["1.1.1.1", "9.9.9.9", "2.2.2.2", "3.3.3.3", "4.4.4.4"],
            "4.4.4.4",
        );
        let line = Remap::offline(old, new, 3).run().unwrap();
        let (nprobes, hops) = parse_result(&line);
        assert_eq!(
            ips_of(&hops),
            vec!["1.1.1.1", "9.9.9.9", "2.2.2.2", "3.3.3.3", "4.4.4.4"]
        );
        // TTLs 2 (start), 1 (foreign hop), 0 (branch) and 2.. (join via
        // cache) resolved once each: three priced lookups.
        assert_eq!(nprobes, 18);
    }

    #[test]
    fn test_pure_shift_deletion() {
        // B removed from the old path; every probed hop exists in the old
        // path at ttl+1, so the search stays binary all the way.
        let old = path(
            &["1.1.1.1", "2.2.2.2", "3.3.3.3", "4.4.4.4", "5.5.5.5"],
            "5.5.5.5",
        );
        let new = path(&["1.1.1.1", "3.3.3.3", "4.4.4.4", "5.5.5.5"], "5.5.5.5");
        let line = Remap::offline(old, new, 4).run().unwrap();
        let (nprobes, hops) = parse_result(&line);
        assert_eq!(
            ips_of(&hops),
            vec!["1.1.1.1", "3.3.3.3", "4.4.4.4", "5.5.5.5"]
        );
        assert_eq!(nprobes, 12);
    }

    #[test]
    fn test_localized_divergence() {
        // S3: Y and Z replace C and D between branch B and join E.
        let old = path(
            &["1.1.1.1", "2.2.2.2", "3.3.3.3", "4.4.4.4", "5.5.5.5"],
            "5.5.5.5",
        );
        let new = path(
            &["1.1.1.1", "2.2.2.2", "7.7.7.7", "8.8.8.8", "5.5.5.5"],
            "5.5.5.5",
        );
        let line = Remap::offline(old, new, 4).run().unwrap();
        let (nprobes, hops) = parse_result(&line);
        assert_eq!(
            ips_of(&hops),
            vec!["1.1.1.1", "2.2.2.2", "7.7.7.7", "8.8.8.8", "5.5.5.5"]
        );
        // Start (3), branch walk (2, 1), join (4): four priced lookups,
        // and no TTL resolved twice.
        assert_eq!(nprobes, 24);
    }

    #[test]
    fn test_star_walkback_then_no_remap() {
        // The start TTL is beyond the new path, so probing it yields a
        // star; the driver walks left and finds the old path intact.
        let old = path(&["1.1.1.1", "2.2.2.2", "3.3.3.3"], "3.3.3.3");
        let new = path(&["1.1.1.1", "2.2.2.2"], "9.9.9.9");
        let expect = old.to_string();
        let line = Remap::offline(old, new, 3).run().unwrap();
        let (nprobes, hops) = parse_result(&line);
        assert_eq!(nprobes, 0);
        assert!(expect.ends_with(&hops));
    }

    #[test]
    fn test_no_responsive_hop() {
        let old = path(&["1.1.1.1", "2.2.2.2"], "2.2.2.2");
        let new = path(&["*", "9.9.9.9"], "9.9.9.9");
        let err = Remap::offline(old, new, 1).run().unwrap_err();
        assert!(matches!(err, RemapError::NoResponsiveHop));
    }

    #[test]
    fn test_start_beyond_old_path() {
        let old = path(&["1.1.1.1", "2.2.2.2"], "2.2.2.2");
        let new = path(&["1.1.1.1", "2.2.2.2"], "2.2.2.2");
        let err = Remap::offline(old, new, 5).run().unwrap_err();
        assert!(matches!(err, RemapError::StartBeyondPath { start: 4, len: 2 }));
    }

    #[test]
    fn test_divergence_with_interior_star() {
        // The diverged segment contains an unresponsive TTL; the local
        // expansion walks over it to the join.
        let old = path(
            &["1.1.1.1", "2.2.2.2", "3.3.3.3", "4.4.4.4", "5.5.5.5", "6.6.6.6"],
            "6.6.6.6",
        );
        let new = path(
            &["1.1.1.1", "2.2.2.2", "7.7.7.7", "*", "5.5.5.5", "6.6.6.6"],
            "6.6.6.6",
        );
        let line = Remap::offline(old, new, 3).run().unwrap();
        let (_, hops) = parse_result(&line);
        assert_eq!(
            ips_of(&hops),
            vec![
                "1.1.1.1",
                "2.2.2.2",
                "7.7.7.7",
                "255.255.255.255",
                "5.5.5.5",
                "6.6.6.6"
            ]
        );
    }

    #[test]
    fn test_longer_new_path_reaches_dst() {
        // The new path grew at the end: the old tail is displaced and the
        // destination-equivalence rule anchors the join on the last hop.
        let old = path(&["1.1.1.1", "2.2.2.2", "9.9.9.9"], "9.9.9.9");
        let new = path(
            &["1.1.1.1", "2.2.2.2", "3.3.3.3", "9.9.9.9"],
            "9.9.9.9",
        );
        let line = Remap::offline(old, new, 3).run().unwrap();
        let (_, hops) = parse_result(&line);
        assert_eq!(
            ips_of(&hops),
            vec!["1.1.1.1", "2.2.2.2", "3.3.3.3", "9.9.9.9"]
        );
    }

    #[tokio::test]
    async fn test_online_remap_scripted() {
        use crate::probe::{OracleHandle, ProbeQuery, ProbeReply};
        use std::time::Duration;
        use tokio::sync::mpsc;

        // Scripted current network A X B C D; old path A B C D.
        let topology = ["1.1.1.1", "9.9.9.9", "2.2.2.2", "3.3.3.3", "4.4.4.4"];
        let (query_tx, mut query_rx) = mpsc::unbounded_channel::<ProbeQuery>();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(q) = query_rx.recv().await {
                let addr = topology
                    .get(usize::from(q.ttl) - 1)
                    .map(|ip| ip.parse().unwrap())
                    .unwrap_or(STAR_IP);
                let _ = reply_tx.send(ProbeReply {
                    ttl: q.ttl,
                    flow_id: q.flow_id,
                    addr,
                    rtt: Duration::from_millis(10),
                });
            }
        });

        let old = path(&["1.1.1.1", "2.2.2.2", "3.3.3.3", "4.4.4.4"], "4.4.4.4");
        let prober = Prober::spawn(OracleHandle { query_tx, reply_rx });
        let line = tokio::task::spawn_blocking(move || Remap::online(old, prober, 3).run())
            .await
            .unwrap()
            .unwrap();
        let (nprobes, hops) = parse_result(&line);
        assert_eq!(
            ips_of(&hops),
            vec!["1.1.1.1", "9.9.9.9", "2.2.2.2", "3.3.3.3", "4.4.4.4"]
        );
        // Three single-interface hops, six probes each.
        assert_eq!(nprobes, 18);
    }
}
