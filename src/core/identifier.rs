use std::fmt;
use std::net::SocketAddr;

/// A node's identity on the ring: its UDP socket address plus the first hash
/// of the range it currently owns (its ring position).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeInfo {
    pub addr: SocketAddr,
    pub first_hash: u32,
}

impl NodeInfo {
    pub fn new(addr: SocketAddr, first_hash: u32) -> Self {
        Self { addr, first_hash }
    }
}

impl fmt::Display for NodeInfo {
    // wire form: ip:port:firstHash
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.first_hash)
    }
}

/// An inclusive range of hash values owned by one node.
///
/// Ranges never wrap: the full space is `(0, 2^31 - 1)` and every split keeps
/// both halves contiguous, so `low <= high` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashRange {
    pub low: u32,
    pub high: u32,
}

impl HashRange {
    /// Highest hash value in the space, `2^31 - 1`.
    pub const MAX_HASH: u32 = i32::MAX as u32;

    pub fn new(low: u32, high: u32) -> Self {
        Self { low, high }
    }

    /// The whole hash space, owned by a solo node.
    pub fn full() -> Self {
        Self::new(0, Self::MAX_HASH)
    }

    pub fn contains(&self, h: u32) -> bool {
        self.low <= h && h <= self.high
    }
}

impl fmt::Display for HashRange {
    // wire form: low:high
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.low, self.high)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn full_range_covers_everything() {
        let r = HashRange::full();
        assert!(r.contains(0));
        assert!(r.contains(1 << 30));
        assert!(r.contains(HashRange::MAX_HASH));
    }

    #[test]
    fn contains_is_inclusive_on_both_ends() {
        let r = HashRange::new(100, 200);
        assert!(r.contains(100));
        assert!(r.contains(200));
        assert!(!r.contains(99));
        assert!(!r.contains(201));
    }

    #[test]
    fn wire_rendering() {
        let info = NodeInfo::new("127.0.0.1:5000".parse().unwrap(), 42);
        assert_eq!(info.to_string(), "127.0.0.1:5000:42");
        assert_eq!(HashRange::new(0, 7).to_string(), "0:7");
    }
}
