use std::net::SocketAddr;

pub mod hash;
pub mod identifier;
pub mod routing_table;
pub mod storage;

use identifier::{HashRange, NodeInfo};
use routing_table::RouteTable;
use storage::Store;

/// All mutable per-node state, owned by the dispatcher task. Handlers take
/// `&mut NodeState`; nothing else may touch it.
#[derive(Debug)]
pub struct NodeState {
    pub my_info: NodeInfo,
    pub pred_info: NodeInfo,
    pub succ_info: NodeInfo,
    pub hash_range: HashRange,
    pub store: Store,
    pub routes: RouteTable,
}

impl NodeState {
    /// First node of a ring: owns the whole space and is its own neighbor.
    pub fn solo(addr: SocketAddr, num_routes: usize, cache: bool) -> Self {
        let my_info = NodeInfo::new(addr, 0);
        Self {
            my_info,
            pred_info: my_info,
            succ_info: my_info,
            hash_range: HashRange::full(),
            store: Store::new(cache),
            routes: RouteTable::new(num_routes, addr),
        }
    }

    /// State of a node that has completed the join exchange: range and
    /// neighbors as granted by the predecessor, store seeded with the pairs
    /// transferred during the exchange.
    pub fn joined(
        addr: SocketAddr,
        num_routes: usize,
        cache: bool,
        hash_range: HashRange,
        succ_info: NodeInfo,
        pred_info: NodeInfo,
        pairs: Vec<(String, String)>,
    ) -> Self {
        let mut store = Store::new(cache);
        for (k, v) in pairs {
            store.insert(k, v);
        }
        let mut routes = RouteTable::new(num_routes, addr);
        routes.insert(succ_info, &succ_info);
        Self {
            // ring position is the first hash of the granted range
            my_info: NodeInfo::new(addr, hash_range.low),
            pred_info,
            succ_info,
            hash_range,
            store,
            routes,
        }
    }

    pub fn owns(&self, h: u32) -> bool {
        self.hash_range.contains(h)
    }

    /// Learn a route, keeping the successor eviction-exempt. True when the
    /// stored set changed.
    pub fn add_route(&mut self, route: NodeInfo) -> bool {
        self.routes.insert(route, &self.succ_info)
    }

    /// Forget every route for an address. True when the stored set changed.
    pub fn remove_route(&mut self, addr: SocketAddr) -> bool {
        self.routes.remove(addr)
    }
}
