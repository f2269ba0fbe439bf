//! Result assembly: splice the resolved hops into the old path and render
//! the single output line.

use chrono::Utc;
use tracing::{debug, warn};

use crate::path::{DiffFlags, Path, PathHop, MAX_PATH_LENGTH};
use crate::probedb::ProbeDb;

/// Render `"<nprobes> <src> <dst> <epoch> <hopstr>"` for a finished path.
pub fn render_path(nprobes: usize, path: &Path) -> String {
    let hopstr = path
        .hops()
        .iter()
        .map(PathHop::to_string)
        .collect::<Vec<_>>()
        .join("|");
    format!(
        "{} {} {} {} {}",
        nprobes,
        path.src(),
        path.dst(),
        Utc::now().timestamp(),
        hopstr
    )
}

/// Splice the probe cache into the old path and render the result line.
pub fn render(nprobes: usize, old_path: &Path, db: &ProbeDb) -> String {
    render_path(nprobes, &splice(old_path, db))
}

/// Construct the current path from the resolved segment and the old path.
///
/// Every cached hop lands at the TTL it was resolved for. The last cached
/// non-star hop is the join; old-path hops after the join's old TTL
/// follow it directly. All other gaps consume the old path through a
/// cursor that resynchronizes whenever a cached hop maps back onto an
/// old TTL, so no old hop is emitted twice.
pub fn splice(old: &Path, db: &ProbeDb) -> Path {
    let cached: std::collections::BTreeMap<usize, &PathHop> = db.hops().collect();
    assert!(!cached.is_empty(), "splicing an empty probe cache");
    let now = Utc::now().timestamp();

    let last_cached = *cached.keys().next_back().expect("cache not empty");
    let join = cached
        .iter()
        .rev()
        .find(|(_, hop)| !hop.is_star())
        .and_then(|(ttl, hop)| {
            old.search_hop(hop, DiffFlags::NONE)
                .map(|old_ttl| (*ttl, old_ttl))
        });
    debug!(first = ?cached.keys().next(), last_cached, ?join, "splicing");

    let mut out_len = last_cached + 1;
    if let Some((join_new, join_old)) = join {
        out_len = out_len.max(join_new + 1 + (old.len() - join_old - 1));
    }
    if out_len > MAX_PATH_LENGTH {
        warn!(out_len, "result path too long, truncating");
        out_len = MAX_PATH_LENGTH;
    }

    let mut hops = Vec::with_capacity(out_len);
    let mut cursor = 0usize;
    for t in 0..out_len {
        if let Some(hop) = cached.get(&t) {
            hops.push((*hop).clone());
            if !hop.is_star() {
                if let Some(old_ttl) = old.search_hop(hop, DiffFlags::NONE) {
                    cursor = old_ttl + 1;
                }
            }
        } else if join.is_some_and(|(join_new, _)| t > join_new) {
            let (join_new, join_old) = join.expect("join checked above");
            let idx = join_old + (t - join_new);
            if idx < old.len() {
                hops.push(old.hop(idx).clone());
            } else {
                hops.push(PathHop::star(t as u8, now));
            }
        } else if cursor < old.len() {
            hops.push(old.hop(cursor).clone());
            cursor += 1;
        } else {
            hops.push(PathHop::star(t as u8, now));
        }
    }

    Path::from_parts(old.src(), old.dst(), now, hops)
}
