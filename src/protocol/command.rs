use std::collections::HashMap;
use tokio::sync::oneshot;

use crate::core::identifier::{HashRange, NodeInfo};

/// Commands are the operator-facing input into the dispatcher's event loop.
///
/// The loop is the sole owner of the socket and all node state, so anything
/// that must mutate that state from outside (a signal handler asking for a
/// graceful leave, a test inspecting the ring) is funneled through the same
/// `select!` that services the UDP socket. A graceful leave therefore needs
/// no locking and no busy-wait: the leave command and the circled-back leave
/// packet are serviced by the one task that owns the state.
pub enum Command {
    /// Leave the ring gracefully: announce the departure to the successor,
    /// wait for the announcement to circle back, hand the store to the
    /// predecessor and stitch the neighbors together. The oneshot resolves
    /// once the ring has been repaired and the loop is about to stop.
    Leave { done: oneshot::Sender<()> },

    /// Debug/test helper: snapshot the node's ring view and contents.
    Inspect { reply: oneshot::Sender<Snapshot> },
}

/// Point-in-time copy of a node's state, for tests and operator debugging.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub my_info: NodeInfo,
    pub pred_info: NodeInfo,
    pub succ_info: NodeInfo,
    pub hash_range: HashRange,
    pub routes: Vec<NodeInfo>,
    pub store: HashMap<String, String>,
    pub cache: HashMap<String, String>,
}
