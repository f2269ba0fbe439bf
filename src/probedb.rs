//! Memoization of probe results, so the search never resolves the same
//! TTL twice.

use std::cmp::Reverse;
use std::collections::BTreeMap;

use crate::path::{Iface, PathHop};

/// Cache of resolved hops (by TTL) and interfaces (by TTL and flow id).
/// The cache owns what it stores; callers get references.
#[derive(Debug, Default)]
pub struct ProbeDb {
    hops: BTreeMap<usize, PathHop>,
    ifaces: BTreeMap<(Reverse<u8>, Reverse<u16>), Iface>,
}

impl ProbeDb {
    pub fn new() -> ProbeDb {
        ProbeDb::default()
    }

    pub fn find_hop(&self, ttl: usize) -> Option<&PathHop> {
        self.hops.get(&ttl)
    }

    /// Insert the hop resolved for `ttl`. The driver must check
    /// [`find_hop`](Self::find_hop) first; resolving a TTL twice is a bug.
    pub fn add_hop(&mut self, hop: PathHop) -> &PathHop {
        let ttl = usize::from(hop.ttl());
        let prev = self.hops.insert(ttl, hop);
        assert!(prev.is_none(), "hop at ttl {ttl} resolved twice");
        &self.hops[&ttl]
    }

    pub fn find_iface(&self, ttl: u8, flow_id: u16) -> Option<&Iface> {
        self.ifaces.get(&(Reverse(ttl), Reverse(flow_id)))
    }

    pub fn add_iface(&mut self, iface: Iface) -> &Iface {
        let key = (Reverse(iface.ttl), Reverse(iface.first_flowid()));
        self.ifaces.insert(key, iface);
        &self.ifaces[&key]
    }

    /// Cached hops in ascending TTL order.
    pub fn hops(&self) -> impl Iterator<Item = (usize, &PathHop)> {
        self.hops.iter().map(|(ttl, hop)| (*ttl, hop))
    }

    pub fn last_hop_ttl(&self) -> Option<usize> {
        self.hops.keys().next_back().copied()
    }

    /// One hop per line in ascending TTL order, for debug logs.
    pub fn dump_hops(&self) -> String {
        self.hops
            .values()
            .map(PathHop::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hop(s: &str, ttl: u8) -> PathHop {
        PathHop::parse(s, 0, ttl).unwrap()
    }

    #[test]
    fn test_find_and_add_hop() {
        let mut db = ProbeDb::new();
        assert!(db.find_hop(3).is_none());
        db.add_hop(hop("10.0.0.4:0:1.00,1.00,1.00,0.00:", 3));
        let found = db.find_hop(3).unwrap();
        assert_eq!(found.ttl(), 3);
        assert_eq!(found.first_ip(), "10.0.0.4".parse::<std::net::Ipv4Addr>().unwrap());
    }

    #[test]
    #[should_panic(expected = "resolved twice")]
    fn test_duplicate_hop_panics() {
        let mut db = ProbeDb::new();
        db.add_hop(hop("10.0.0.4:0:1.00,1.00,1.00,0.00:", 3));
        db.add_hop(hop("10.0.0.5:0:1.00,1.00,1.00,0.00:", 3));
    }

    #[test]
    fn test_hops_iterate_in_ttl_order() {
        let mut db = ProbeDb::new();
        for ttl in [7u8, 2, 5, 0] {
            db.add_hop(hop(&format!("10.0.0.{}:0:1.00,1.00,1.00,0.00:", ttl + 1), ttl));
        }
        let ttls: Vec<usize> = db.hops().map(|(ttl, _)| ttl).collect();
        assert_eq!(ttls, vec![0, 2, 5, 7]);
        assert_eq!(db.last_hop_ttl(), Some(7));
        // Every cached hop carries the TTL it is keyed under.
        for (ttl, hop) in db.hops() {
            assert_eq!(ttl, usize::from(hop.ttl()));
        }
    }

    #[test]
    fn test_ifaces_keyed_by_ttl_and_flowid() {
        let mut db = ProbeDb::new();
        db.add_iface(Iface::parse("10.0.0.1:4:1.00,1.00,1.00,0.00:", 2).unwrap());
        db.add_iface(Iface::parse("10.0.0.2:9:1.00,1.00,1.00,0.00:", 2).unwrap());
        assert_eq!(db.find_iface(2, 4).unwrap().first_flowid(), 4);
        assert_eq!(db.find_iface(2, 9).unwrap().first_flowid(), 9);
        assert!(db.find_iface(2, 5).is_none());
        assert!(db.find_iface(3, 4).is_none());
    }

    #[test]
    fn test_dump_hops() {
        let mut db = ProbeDb::new();
        db.add_hop(hop("10.0.0.2:0:2.00,2.00,2.00,0.00:", 1));
        db.add_hop(hop("10.0.0.1:0:1.00,1.00,1.00,0.00:", 0));
        let dump = db.dump_hops();
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("10.0.0.1"));
        assert!(lines[1].starts_with("10.0.0.2"));
    }
}
