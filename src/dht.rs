//! Owner-facing handle around a running DHT node.
//!
//! Binds the socket, performs the join exchange when a predecessor is given,
//! then spawns the dispatcher task. The handle talks to the task only through
//! its command channel, so all state stays confined to the event loop.

use std::net::SocketAddr;
use std::path::Path;

use anyhow::Context;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::info;

use crate::core::NodeState;
use crate::protocol::{self, Command, Dispatcher, Snapshot};

pub struct DhtNode {
    tx: mpsc::Sender<Command>,
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl DhtNode {
    /// Start the first node of a new ring; it owns the whole hash space.
    pub async fn start_solo(
        bind_addr: &str,
        num_routes: usize,
        cache: bool,
    ) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(bind_addr)
            .await
            .with_context(|| format!("binding {bind_addr}"))?;
        let local_addr = socket.local_addr()?;
        info!(%local_addr, "starting new ring");
        let node = NodeState::solo(local_addr, num_routes, cache);
        Ok(Self::spawn(socket, node, local_addr))
    }

    /// Join an existing ring by contacting `pred_addr`. Completes once the
    /// predecessor has granted us a range.
    pub async fn start_joining(
        bind_addr: &str,
        pred_addr: SocketAddr,
        num_routes: usize,
        cache: bool,
    ) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(bind_addr)
            .await
            .with_context(|| format!("binding {bind_addr}"))?;
        let local_addr = socket.local_addr()?;
        let grant = protocol::join(&socket, pred_addr).await?;
        let node = NodeState::joined(
            local_addr,
            num_routes,
            cache,
            grant.hash_range,
            grant.succ_info,
            grant.pred_info,
            grant.pairs,
        );
        Ok(Self::spawn(socket, node, local_addr))
    }

    fn spawn(socket: UdpSocket, node: NodeState, local_addr: SocketAddr) -> Self {
        let (tx, rx) = mpsc::channel::<Command>(100);
        let dispatcher = Dispatcher::new(socket, rx, node);
        let task = tokio::spawn(dispatcher.run());
        Self {
            tx,
            local_addr,
            task,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Leave the ring gracefully: the node announces its departure, waits for
    /// the announcement to circle the ring, hands its store to the
    /// predecessor and stops. Resolves once the ring has been repaired.
    pub async fn leave(self) -> anyhow::Result<()> {
        let (done, done_rx) = oneshot::channel();
        self.tx
            .send(Command::Leave { done })
            .await
            .context("dispatcher task is gone")?;
        done_rx.await.context("leave did not complete")?;
        self.task.await.context("dispatcher task panicked")?;
        Ok(())
    }

    /// Snapshot the node's ring view and contents (tests, debugging).
    pub async fn inspect(&self) -> anyhow::Result<Snapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Inspect { reply })
            .await
            .context("dispatcher task is gone")?;
        rx.await.context("dispatcher dropped the snapshot")
    }
}

/// Publish this node's `<ip> <port>` line so peers can find it.
pub fn write_cfg_file(path: &Path, addr: SocketAddr) -> anyhow::Result<()> {
    std::fs::write(path, format!("{} {}\n", addr.ip(), addr.port()))
        .with_context(|| format!("writing {}", path.display()))
}

/// Read a peer's `<ip> <port>` line written by `write_cfg_file`.
pub fn read_peer_addr(path: &Path) -> anyhow::Result<SocketAddr> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let line = text.lines().next().context("bootstrap file is empty")?;
    let mut parts = line.split_whitespace();
    let (ip, port) = (
        parts.next().context("bootstrap file missing ip")?,
        parts.next().context("bootstrap file missing port")?,
    );
    Ok(SocketAddr::new(
        ip.parse().context("bad ip in bootstrap file")?,
        port.parse().context("bad port in bootstrap file")?,
    ))
}
