//! Joining-side bootstrap: the one exchange a node performs before its
//! dispatcher loop starts.
//!
//! The joiner sends a `join` to the predecessor it was pointed at, then reads
//! datagrams until the predecessor's `success` arrives. Any `transfer`
//! received first carries a pair from the upper half of the predecessor's
//! range and is kept for the new store. Other packets can show up on the
//! socket (the ring does not pause for us); they are logged and dropped.

use std::net::SocketAddr;

use anyhow::Context;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::core::identifier::{HashRange, NodeInfo};
use crate::packet::{Packet, PacketKind};

/// What the predecessor granted: our range and neighbors, plus the pairs
/// transferred along the way.
pub struct JoinGrant {
    pub hash_range: HashRange,
    pub succ_info: NodeInfo,
    pub pred_info: NodeInfo,
    pub pairs: Vec<(String, String)>,
}

/// Run the join exchange on a freshly bound socket. Blocks until the
/// predecessor answers with `success`; there is no retransmission at this
/// layer, so an unreachable predecessor means waiting forever (the operator
/// owns that timeout).
pub async fn join(socket: &UdpSocket, pred_addr: SocketAddr) -> anyhow::Result<JoinGrant> {
    let my_addr = socket.local_addr()?;
    info!(%pred_addr, "joining ring");

    // our position is unknown until the split; 0 is the agreed placeholder
    let mut join_pkt = Packet::of_kind(PacketKind::Join);
    join_pkt.sender_info = Some(NodeInfo::new(my_addr, 0));
    join_pkt.pred_info = Some(NodeInfo::new(pred_addr, 0));
    socket
        .send_to(&join_pkt.wire(), pred_addr)
        .await
        .context("sending join packet")?;

    let mut pairs = Vec::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let (len, sender) = socket.recv_from(&mut buf).await.context("awaiting join reply")?;
        let pkt = match Packet::parse(&buf[..len]) {
            Ok(pkt) => pkt,
            Err(e) => {
                warn!(%sender, error = %e, "dropping unparseable packet during join");
                continue;
            }
        };
        match pkt.kind {
            Some(PacketKind::Transfer) => {
                if let (Some(key), Some(val)) = (pkt.key, pkt.val) {
                    debug!(%key, "received pair during join");
                    pairs.push((key, val));
                } else {
                    warn!(%sender, "transfer packet without key/val during join");
                }
            }
            Some(PacketKind::Success) => {
                let hash_range = pkt
                    .hash_range
                    .context("success packet missing hashRange")?;
                let succ_info = pkt.succ_info.context("success packet missing succInfo")?;
                let pred_info = pkt.pred_info.context("success packet missing predInfo")?;
                info!(%hash_range, %succ_info, %pred_info, "join complete");
                return Ok(JoinGrant {
                    hash_range,
                    succ_info,
                    pred_info,
                    pairs,
                });
            }
            other => {
                warn!(%sender, ?other, "ignoring packet that is not part of the join exchange");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn join_absorbs_transfers_then_success() -> anyhow::Result<()> {
        let joiner = UdpSocket::bind("127.0.0.1:0").await?;
        let pred = UdpSocket::bind("127.0.0.1:0").await?;
        let pred_addr = pred.local_addr()?;
        let pred_info = NodeInfo::new(pred_addr, 0);

        let join_task = async { join(&joiner, pred_addr).await };

        let pred_task = async {
            // consume the join packet first
            let mut buf = [0u8; 64 * 1024];
            let (len, joiner_addr) = pred.recv_from(&mut buf).await?;
            let pkt = Packet::parse(&buf[..len]).unwrap();
            assert_eq!(pkt.kind, Some(PacketKind::Join));
            assert_eq!(pkt.sender_info, Some(NodeInfo::new(joiner_addr, 0)));

            let mut xfer = Packet::of_kind(PacketKind::Transfer);
            xfer.key = Some("dungeons".into());
            xfer.val = Some("dragons".into());
            xfer.sender_info = Some(pred_info);
            pred.send_to(&xfer.wire(), joiner_addr).await?;

            let mut success = Packet::of_kind(PacketKind::Success);
            success.hash_range = Some(HashRange::new(1 << 30, HashRange::MAX_HASH));
            success.succ_info = Some(pred_info);
            success.pred_info = Some(pred_info);
            success.tag = Some(1);
            pred.send_to(&success.wire(), joiner_addr).await?;
            anyhow::Ok(())
        };

        let (grant, _) = tokio::try_join!(join_task, pred_task)?;
        assert_eq!(grant.hash_range, HashRange::new(1 << 30, HashRange::MAX_HASH));
        assert_eq!(grant.succ_info, pred_info);
        assert_eq!(grant.pred_info, pred_info);
        assert_eq!(grant.pairs, vec![("dungeons".into(), "dragons".into())]);
        Ok(())
    }

    #[tokio::test]
    async fn join_skips_unrelated_packets() -> anyhow::Result<()> {
        let joiner = UdpSocket::bind("127.0.0.1:0").await?;
        let pred = UdpSocket::bind("127.0.0.1:0").await?;
        let pred_addr = pred.local_addr()?;
        let pred_info = NodeInfo::new(pred_addr, 0);

        let join_task = async { join(&joiner, pred_addr).await };

        let pred_task = async {
            let mut buf = [0u8; 64 * 1024];
            let (_, joiner_addr) = pred.recv_from(&mut buf).await?;

            // a stray get should not derail the exchange
            let mut stray = Packet::of_kind(PacketKind::Get);
            stray.key = Some("k".into());
            stray.tag = Some(9);
            pred.send_to(&stray.wire(), joiner_addr).await?;

            let mut success = Packet::of_kind(PacketKind::Success);
            success.hash_range = Some(HashRange::new(100, 200));
            success.succ_info = Some(pred_info);
            success.pred_info = Some(pred_info);
            pred.send_to(&success.wire(), joiner_addr).await?;
            anyhow::Ok(())
        };

        let (grant, _) = tokio::try_join!(join_task, pred_task)?;
        assert_eq!(grant.hash_range, HashRange::new(100, 200));
        assert!(grant.pairs.is_empty());
        Ok(())
    }
}
