//! The request dispatcher: one task owning the UDP socket and all node
//! state, servicing received packets and operator commands from a single
//! `select!` loop.
//!
//! Handlers are pure state transitions over [`NodeState`] that return the
//! side effects they want performed. The loop applies effects (tag
//! assignment, serialization, transmission), which keeps every handler
//! testable without touching the network.

use std::net::SocketAddr;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::core::hash::hash;
use crate::core::identifier::{HashRange, NodeInfo};
use crate::core::NodeState;
use crate::packet::{Packet, PacketKind};

mod bootstrap;
mod command;

pub use self::bootstrap::{join, JoinGrant};
pub use self::command::{Command, Snapshot};

/// A side effect a handler wants the event loop to perform. Decouples the
/// protocol logic from socket I/O.
#[derive(Debug)]
pub enum Effect {
    Send { dst: SocketAddr, pkt: Packet },
}

pub struct Dispatcher {
    pub node: NodeState,
    socket: UdpSocket,
    rx: Option<mpsc::Receiver<Command>>,
    /// Tag stamped onto server-originated packets that have none.
    send_tag: u32,
    /// Present while a leave is in flight; resolved when our own leave
    /// packet circles back and the ring has been repaired.
    leaving: Option<oneshot::Sender<()>>,
    stopped: bool,
}

impl Dispatcher {
    pub fn new(socket: UdpSocket, rx: mpsc::Receiver<Command>, node: NodeState) -> Self {
        Self {
            node,
            socket,
            rx: Some(rx),
            send_tag: 1,
            leaving: None,
            stopped: false,
        }
    }

    /// Construct a dispatcher without a command channel. Useful for tests
    /// that drive `handle_packet` directly.
    pub fn new_headless(socket: UdpSocket, node: NodeState) -> Self {
        Self {
            node,
            socket,
            rx: None,
            send_tag: 1,
            leaving: None,
            stopped: false,
        }
    }

    /// Service the socket and the command channel until a completed leave
    /// stops the loop.
    pub async fn run(mut self) {
        let mut buf = [0u8; 64 * 1024];
        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, sender)) => {
                            let pkt = match Packet::parse(&buf[..len]) {
                                Ok(pkt) => pkt,
                                Err(e) => {
                                    warn!(%sender, error = %e, "dropping unparseable packet");
                                    continue;
                                }
                            };
                            debug!(%sender, packet = %pkt, "received packet");
                            let effects = self.handle_packet(pkt, sender);
                            for eff in effects {
                                self.apply_effect(eff).await;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "udp receive failed");
                            continue;
                        }
                    }
                }

                maybe_command = async {
                    match self.rx.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    match maybe_command {
                        Some(command) => {
                            let effects = self.handle_command(command);
                            for eff in effects {
                                self.apply_effect(eff).await;
                            }
                        }
                        None => {
                            // handle dropped; keep serving the ring headless
                            self.rx = None;
                        }
                    }
                }
            }

            if self.stopped {
                info!("dispatcher stopped");
                return;
            }
        }
    }

    fn handle_command(&mut self, command: Command) -> Vec<Effect> {
        match command {
            Command::Leave { done } => {
                if self.leaving.is_some() {
                    warn!("leave already in progress");
                    return Vec::new();
                }
                info!(succ = %self.node.succ_info, "leaving the ring");
                self.leaving = Some(done);
                let mut leave = Packet::of_kind(PacketKind::Leave);
                leave.sender_info = Some(self.node.my_info);
                vec![Effect::Send {
                    dst: self.node.succ_info.addr,
                    pkt: leave,
                }]
            }
            Command::Inspect { reply } => {
                let _ = reply.send(self.snapshot());
                Vec::new()
            }
        }
    }

    /// Classify one received packet and run its handler. Returns the effects
    /// to apply, so tests can observe a handler's behavior directly.
    pub fn handle_packet(&mut self, pkt: Packet, sender: SocketAddr) -> Vec<Effect> {
        let kind = match pkt.check() {
            Ok(kind) => kind,
            Err(reason) => {
                let mut fail = Packet::of_kind(PacketKind::Failure);
                fail.reason = Some(reason.to_string());
                fail.tag = pkt.tag;
                fail.ttl = pkt.ttl;
                return vec![Effect::Send {
                    dst: sender,
                    pkt: fail,
                }];
            }
        };

        // every packet that names its sender's ring position teaches a route,
        // except a leave, whose sender is on the way out
        if kind != PacketKind::Leave {
            if let Some(route) = pkt.sender_info {
                self.learn_route(route);
            }
        }

        match kind {
            PacketKind::Get => self.handle_get(pkt, sender),
            PacketKind::Put => self.handle_put(pkt, sender),
            PacketKind::Transfer => self.handle_xfer(pkt),
            PacketKind::Join => self.handle_join(pkt, sender),
            PacketKind::Leave => self.handle_leave(pkt),
            PacketKind::Update => self.handle_update(pkt),
            PacketKind::Success | PacketKind::NoMatch | PacketKind::Failure => {
                self.handle_reply(pkt, sender)
            }
        }
    }

    /// Answer a get if this node owns the key's hash (or has it cached);
    /// otherwise stamp the relay fields and forward toward the owner.
    fn handle_get(&mut self, pkt: Packet, sender: SocketAddr) -> Vec<Effect> {
        let Some(key) = pkt.key.clone() else {
            return Vec::new(); // unreachable: check() requires the key
        };
        let h = hash(&key);
        let cached = self.node.store.cache_get(&key).cloned();

        if self.node.owns(h) || cached.is_some() {
            let mut reply = Packet::default();
            reply.key = Some(key.clone());
            reply.tag = pkt.tag;
            reply.ttl = pkt.ttl;
            reply.client_adr = pkt.client_adr;
            reply.relay_adr = pkt.relay_adr;
            reply.hash_range = Some(self.node.hash_range);
            if let Some(val) = self.node.store.get(&key) {
                reply.kind = Some(PacketKind::Success);
                reply.val = Some(val.clone());
            } else if let Some(val) = cached {
                reply.kind = Some(PacketKind::Success);
                reply.val = Some(val);
            } else {
                reply.kind = Some(PacketKind::NoMatch);
            }
            // a relayed request goes back to the relay, which learns our
            // position from senderInfo; a direct one goes back to the client
            let dst = match pkt.relay_adr {
                Some(relay) => {
                    reply.sender_info = Some(self.node.my_info);
                    relay
                }
                None => sender,
            };
            vec![Effect::Send { dst, pkt: reply }]
        } else {
            let mut pkt = pkt;
            if pkt.relay_adr.is_none() {
                pkt.relay_adr = Some(self.node.my_info.addr);
                pkt.client_adr = Some(sender);
            }
            self.forward(pkt, h)
        }
    }

    /// Apply a put (missing value deletes) if owned, else forward.
    fn handle_put(&mut self, pkt: Packet, sender: SocketAddr) -> Vec<Effect> {
        let Some(key) = pkt.key.clone() else {
            return Vec::new(); // unreachable: check() requires the key
        };
        let h = hash(&key);

        if self.node.owns(h) {
            self.node.store.put(&key, pkt.val.as_deref());
            let mut reply = Packet::of_kind(PacketKind::Success);
            reply.key = Some(key);
            reply.val = pkt.val;
            reply.tag = pkt.tag;
            reply.ttl = pkt.ttl;
            reply.client_adr = pkt.client_adr;
            reply.relay_adr = pkt.relay_adr;
            reply.hash_range = Some(self.node.hash_range);
            reply.sender_info = Some(self.node.my_info);
            // the owner answers the client directly; no relay round-trip
            let dst = pkt.client_adr.unwrap_or(sender);
            vec![Effect::Send { dst, pkt: reply }]
        } else {
            let mut pkt = pkt;
            if pkt.relay_adr.is_none() {
                pkt.relay_adr = Some(self.node.my_info.addr);
                pkt.client_adr = Some(sender);
            }
            self.forward(pkt, h)
        }
    }

    fn handle_xfer(&mut self, pkt: Packet) -> Vec<Effect> {
        if let (Some(key), Some(val)) = (pkt.key, pkt.val) {
            self.node.store.insert(key, val);
        }
        Vec::new()
    }

    /// A reply arriving here means this node is the relay: learn the
    /// responder's ring position, cache the answer, strip the addressing
    /// fields and deliver to the client.
    fn handle_reply(&mut self, pkt: Packet, sender: SocketAddr) -> Vec<Effect> {
        if let Some(range) = pkt.hash_range {
            // owners stamp their own range, so `low` is their first hash
            self.learn_route(NodeInfo::new(sender, range.low));
        }
        if let (Some(key), Some(val)) = (&pkt.key, &pkt.val) {
            self.node.store.cache_put(key.clone(), val.clone());
        }
        let Some(client) = pkt.client_adr else {
            warn!(%sender, "reply carries no client address; dropping");
            return Vec::new();
        };
        let mut out = pkt;
        out.client_adr = None;
        out.relay_adr = None;
        out.sender_info = None;
        vec![Effect::Send {
            dst: client,
            pkt: out,
        }]
    }

    /// Split our range, granting the upper half (and the pairs hashing into
    /// it) to the joiner, and splice it in as our new successor.
    fn handle_join(&mut self, _pkt: Packet, sender: SocketAddr) -> Vec<Effect> {
        let HashRange { low, high } = self.node.hash_range;

        // split point in wrapping 32-bit signed arithmetic, reflected
        // positive when the addition overflows; every node must compute the
        // same split for ownership to stay consistent
        let mut mid = 1 + (high as i32).wrapping_add(low as i32) / 2;
        if mid < 0 {
            mid = -mid + 1;
        }
        let mid = mid as u32;

        let mut success = Packet::of_kind(PacketKind::Success);
        success.pred_info = Some(self.node.my_info);
        success.succ_info = Some(self.node.succ_info);
        success.hash_range = Some(HashRange::new(mid, high));

        let old_succ = self.node.succ_info;
        // any route learned for the joiner predates its ring position
        self.forget_route(sender);
        self.node.succ_info = NodeInfo::new(sender, mid);
        self.node.hash_range = HashRange::new(low, mid - 1);
        let new_succ = self.node.succ_info;
        self.learn_route(new_succ);
        info!(joiner = %new_succ, range = %self.node.hash_range, "split range for joiner");

        let mut effects = Vec::new();

        // the old successor's predecessor is now the joiner
        let mut update = Packet::of_kind(PacketKind::Update);
        update.pred_info = Some(new_succ);
        update.sender_info = Some(self.node.my_info);
        effects.push(Effect::Send {
            dst: old_succ.addr,
            pkt: update,
        });

        // hand over the pairs that now hash into the joiner's range
        let moved: Vec<(String, String)> = self
            .node
            .store
            .entries()
            .filter(|(k, _)| hash(k) >= mid)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (key, val) in moved {
            self.node.store.remove(&key);
            let mut xfer = Packet::of_kind(PacketKind::Transfer);
            xfer.key = Some(key);
            xfer.val = Some(val);
            xfer.sender_info = Some(self.node.my_info);
            effects.push(Effect::Send {
                dst: sender,
                pkt: xfer,
            });
        }

        effects.push(Effect::Send {
            dst: sender,
            pkt: success,
        });
        effects
    }

    /// A leave either circles back to its originator (us: repair the ring
    /// and stop) or names another node (forget its routes, pass it along).
    fn handle_leave(&mut self, pkt: Packet) -> Vec<Effect> {
        let Some(leaver) = pkt.sender_info else {
            return Vec::new(); // unreachable: check() requires senderInfo
        };
        if leaver == self.node.my_info {
            return self.complete_leave();
        }
        self.forget_route(leaver.addr);
        vec![Effect::Send {
            dst: self.node.succ_info.addr,
            pkt,
        }]
    }

    /// Our own leave has traversed the whole ring: every node has dropped us
    /// from its routes. Hand the store to the predecessor, stitch
    /// predecessor and successor together, and stop.
    fn complete_leave(&mut self) -> Vec<Effect> {
        info!("own leave circled back; repairing the ring");
        let pred = self.node.pred_info;
        let succ = self.node.succ_info;
        let mut effects = Vec::new();

        for (key, val) in self.node.store.drain() {
            let mut xfer = Packet::of_kind(PacketKind::Transfer);
            xfer.key = Some(key);
            xfer.val = Some(val);
            xfer.sender_info = Some(self.node.my_info);
            effects.push(Effect::Send {
                dst: pred.addr,
                pkt: xfer,
            });
        }

        // the predecessor absorbs our range and inherits our successor
        let mut to_pred = Packet::of_kind(PacketKind::Update);
        to_pred.succ_info = Some(succ);
        to_pred.hash_range = Some(HashRange::new(pred.first_hash, self.node.hash_range.high));
        to_pred.sender_info = Some(self.node.my_info);
        effects.push(Effect::Send {
            dst: pred.addr,
            pkt: to_pred,
        });

        let mut to_succ = Packet::of_kind(PacketKind::Update);
        to_succ.pred_info = Some(pred);
        effects.push(Effect::Send {
            dst: succ.addr,
            pkt: to_succ,
        });

        self.node.store.clear();
        self.node.routes.clear();
        self.stopped = true;
        if let Some(done) = self.leaving.take() {
            let _ = done.send(());
        }
        effects
    }

    fn handle_update(&mut self, pkt: Packet) -> Vec<Effect> {
        if let Some(pred) = pkt.pred_info {
            self.node.pred_info = pred;
        }
        if let Some(succ) = pkt.succ_info {
            self.node.succ_info = succ;
            self.learn_route(succ);
        }
        if let Some(range) = pkt.hash_range {
            self.node.hash_range = range;
            // ring position is defined by the current range
            self.node.my_info.first_hash = range.low;
        }
        Vec::new()
    }

    /// Send toward the owner of `h` via the route minimizing the wrap-aware
    /// clockwise distance. A spent ttl fails the request back to the client.
    fn forward(&mut self, mut pkt: Packet, h: u32) -> Vec<Effect> {
        if pkt.ttl <= 0 {
            let Some(client) = pkt.client_adr else {
                warn!("ttl expired on a packet with no client address; dropping");
                return Vec::new();
            };
            let mut fail = Packet::of_kind(PacketKind::Failure);
            fail.reason = Some("time to live expired".to_string());
            fail.tag = pkt.tag;
            fail.ttl = pkt.ttl;
            return vec![Effect::Send {
                dst: client,
                pkt: fail,
            }];
        }
        let Some(hop) = self.node.routes.closest(h) else {
            error!(hash = h, "no route available to forward toward the owner");
            return Vec::new();
        };
        pkt.ttl -= 1;
        vec![Effect::Send {
            dst: hop.addr,
            pkt,
        }]
    }

    async fn apply_effect(&mut self, effect: Effect) {
        match effect {
            Effect::Send { dst, mut pkt } => {
                if pkt.tag.is_none() {
                    pkt.tag = Some(self.next_tag());
                }
                debug!(%dst, packet = %pkt, "sending packet");
                if let Err(e) = self.socket.send_to(&pkt.wire(), dst).await {
                    // best-effort transport; an unreachable peer is not fatal
                    warn!(%dst, error = %e, "send failed");
                }
            }
        }
    }

    fn next_tag(&mut self) -> u32 {
        let tag = self.send_tag;
        self.send_tag = self.send_tag.wrapping_add(1);
        tag
    }

    fn learn_route(&mut self, route: NodeInfo) {
        if self.node.add_route(route) {
            debug!("{}", self.node.routes);
        }
    }

    fn forget_route(&mut self, addr: SocketAddr) {
        if self.node.remove_route(addr) {
            debug!("{}", self.node.routes);
        }
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            my_info: self.node.my_info,
            pred_info: self.node.pred_info,
            succ_info: self.node.succ_info,
            hash_range: self.node.hash_range,
            routes: self.node.routes.iter().copied().collect(),
            store: self
                .node
                .store
                .entries()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            cache: self
                .node
                .store
                .cache_entries()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}
