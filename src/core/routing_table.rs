use std::fmt;
use std::net::SocketAddr;

use super::identifier::NodeInfo;

/// Bounded table of known ring positions, used to pick the next hop when a
/// request must be forwarded.
///
/// The table holds at most `capacity` entries, plus one: the bound check
/// runs before the append, and deployed nodes rely on that exact policy. The
/// local node is never stored, duplicates are ignored, and the current
/// successor is never evicted so the ring stays traversable.
#[derive(Debug)]
pub struct RouteTable {
    entries: Vec<NodeInfo>,
    capacity: usize,
    local: SocketAddr,
}

impl RouteTable {
    pub fn new(capacity: usize, local: SocketAddr) -> Self {
        Self {
            entries: Vec::with_capacity(capacity + 1),
            capacity,
            local,
        }
    }

    /// Insert a learned route. `succ` is the current successor, which is
    /// exempt from eviction. Returns true when the stored set changed.
    pub fn insert(&mut self, route: NodeInfo, succ: &NodeInfo) -> bool {
        if route.addr == self.local || self.entries.contains(&route) {
            return false;
        }
        if self.entries.len() <= self.capacity {
            self.entries.push(route);
            return true;
        }
        // full: evict the first entry that is not the successor
        if let Some(pos) = self.entries.iter().position(|r| r != succ) {
            self.entries.remove(pos);
            self.entries.push(route);
            return true;
        }
        false
    }

    /// Remove every entry for this address, scanning back to front. Returns
    /// true when anything was removed.
    pub fn remove(&mut self, addr: SocketAddr) -> bool {
        let before = self.entries.len();
        for i in (0..self.entries.len()).rev() {
            if self.entries[i].addr == addr {
                self.entries.remove(i);
            }
        }
        self.entries.len() != before
    }

    /// Pick the route whose ring position minimizes the clockwise distance to
    /// `target`. Distance is `(target - firstHash) mod i32::MAX`; deployed
    /// nodes use that modulus rather than `2^31`, and route selection must
    /// agree with them. Ties go to the last-scanned entry.
    pub fn closest(&self, target: u32) -> Option<NodeInfo> {
        let mut min = i64::MAX;
        let mut choice = None;
        for route in &self.entries {
            let dist = (target as i64 - route.first_hash as i64).rem_euclid(i32::MAX as i64);
            if dist <= min {
                min = dist;
                choice = Some(*route);
            }
        }
        choice
    }

    pub fn contains(&self, route: &NodeInfo) -> bool {
        self.entries.contains(route)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeInfo> {
        self.entries.iter()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl fmt::Display for RouteTable {
    // the debug-contract rendering: rteTbl=[ip:port:hash, ...]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rteTbl=[")?;
        for (i, route) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{route}")?;
        }
        write!(f, "]")
    }
}
