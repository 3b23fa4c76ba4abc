use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use ring_dht::dht::DhtNode;
use ring_dht::packet::{Packet, PacketKind};
use ring_dht::{hash, HashRange, NodeInfo};

const MID: u32 = 1 << 30;
const QUARTER: u32 = 1 << 29;
const TOP_HASH: u32 = HashRange::MAX_HASH;

/// A plain UDP client speaking the wire protocol, as external clients do.
struct Client {
    socket: UdpSocket,
}

impl Client {
    async fn new() -> anyhow::Result<Self> {
        Ok(Self {
            socket: UdpSocket::bind("127.0.0.1:0").await?,
        })
    }

    async fn request(&self, node: SocketAddr, pkt: Packet) -> anyhow::Result<Packet> {
        self.socket.send_to(&pkt.wire(), node).await?;
        let mut buf = [0u8; 64 * 1024];
        let (len, _) = timeout(Duration::from_secs(2), self.socket.recv_from(&mut buf))
            .await
            .context("timed out waiting for a reply")??;
        Ok(Packet::parse(&buf[..len])?)
    }

    async fn get(&self, node: SocketAddr, key: &str, tag: u32) -> anyhow::Result<Packet> {
        let mut pkt = Packet::of_kind(PacketKind::Get);
        pkt.key = Some(key.to_string());
        pkt.tag = Some(tag);
        self.request(node, pkt).await
    }

    async fn put(
        &self,
        node: SocketAddr,
        key: &str,
        val: Option<&str>,
        tag: u32,
    ) -> anyhow::Result<Packet> {
        let mut pkt = Packet::of_kind(PacketKind::Put);
        pkt.key = Some(key.to_string());
        pkt.val = val.map(str::to_string);
        pkt.tag = Some(tag);
        self.request(node, pkt).await
    }
}

/// Find a key whose hash the given range owns.
fn key_in(range: HashRange, salt: &str) -> String {
    (0..)
        .map(|i| format!("{salt}-{i}"))
        .find(|k| range.contains(hash(k)))
        .expect("the hash space is covered")
}

/// Build the standard three-node ring used below, both joins going through
/// the first node so the splits stay in the unwrapped half of the space:
/// a (0..2^29-1) -> mid (2^29..2^30-1) -> top (2^30..2^31-1) -> a.
async fn three_node_ring(cache: bool) -> anyhow::Result<(DhtNode, DhtNode, DhtNode)> {
    let a = DhtNode::start_solo("127.0.0.1:0", 4, cache).await?;
    let top = DhtNode::start_joining("127.0.0.1:0", a.local_addr(), 4, cache).await?;
    let mid = DhtNode::start_joining("127.0.0.1:0", a.local_addr(), 4, cache).await?;
    // let the neighbor updates from the joins settle
    tokio::time::sleep(Duration::from_millis(100)).await;
    Ok((a, mid, top))
}

#[tokio::test]
async fn join_splits_the_ring_down_the_middle() -> anyhow::Result<()> {
    let a = DhtNode::start_solo("127.0.0.1:0", 4, false).await?;
    let b = DhtNode::start_joining("127.0.0.1:0", a.local_addr(), 4, false).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let a_snap = a.inspect().await?;
    let b_snap = b.inspect().await?;

    assert_eq!(b_snap.hash_range, HashRange::new(1_073_741_824, 2_147_483_647));
    assert_eq!(a_snap.hash_range, HashRange::new(0, 1_073_741_823));
    assert_eq!(b_snap.my_info.first_hash, MID);

    let b_info = NodeInfo::new(b.local_addr(), MID);
    let a_info = NodeInfo::new(a.local_addr(), 0);
    assert_eq!(a_snap.succ_info, b_info);
    assert_eq!(a_snap.pred_info, b_info, "two-node ring: both neighbors are the peer");
    assert_eq!(b_snap.succ_info, a_info);
    assert_eq!(b_snap.pred_info, a_info);
    assert_eq!(a_snap.routes, vec![b_info], "the joiner's final position is the only route");
    Ok(())
}

#[tokio::test]
async fn join_carries_the_upper_half_of_the_store() -> anyhow::Result<()> {
    let a = DhtNode::start_solo("127.0.0.1:0", 4, false).await?;
    let client = Client::new().await?;

    // "dungeons" hashes into the half a joiner will take over
    assert!(hash("dungeons") >= MID);
    let low_key = key_in(HashRange::new(0, MID - 1), "low");
    client.put(a.local_addr(), "dungeons", Some("dragons"), 1).await?;
    client.put(a.local_addr(), &low_key, Some("stays"), 2).await?;

    let b = DhtNode::start_joining("127.0.0.1:0", a.local_addr(), 4, false).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let a_snap = a.inspect().await?;
    let b_snap = b.inspect().await?;
    assert_eq!(b_snap.store.get("dungeons").map(String::as_str), Some("dragons"));
    assert!(!a_snap.store.contains_key("dungeons"), "transferred pairs leave the old owner");
    assert_eq!(a_snap.store.get(&low_key).map(String::as_str), Some("stays"));

    // the pair is still reachable through the node that gave it away
    let reply = client.get(a.local_addr(), "dungeons", 3).await?;
    assert_eq!(reply.kind, Some(PacketKind::Success));
    assert_eq!(reply.val.as_deref(), Some("dragons"));
    assert_eq!(reply.tag, Some(3));
    assert_eq!(reply.client_adr, None, "the relay strips its addressing fields");
    assert_eq!(reply.relay_adr, None);
    Ok(())
}

#[tokio::test]
async fn put_then_get_via_any_node() -> anyhow::Result<()> {
    let (a, mid, top) = three_node_ring(false).await?;
    let client = Client::new().await?;

    let key = key_in(HashRange::new(MID, TOP_HASH), "ring");
    let put_reply = client.put(a.local_addr(), &key, Some("value-1"), 10).await?;
    assert_eq!(put_reply.kind, Some(PacketKind::Success));
    assert_eq!(put_reply.tag, Some(10));

    for (i, node) in [&a, &mid, &top].into_iter().enumerate() {
        let reply = client.get(node.local_addr(), &key, 20 + i as u32).await?;
        assert_eq!(reply.kind, Some(PacketKind::Success), "get via node {i}");
        assert_eq!(reply.val.as_deref(), Some("value-1"));
        assert_eq!(reply.tag, Some(20 + i as u32));
    }

    // a put without a value deletes the pair, everywhere
    let del_reply = client.put(mid.local_addr(), &key, None, 30).await?;
    assert_eq!(del_reply.kind, Some(PacketKind::Success));
    let reply = client.get(a.local_addr(), &key, 31).await?;
    assert_eq!(reply.kind, Some(PacketKind::NoMatch));
    assert_eq!(reply.key.as_deref(), Some(key.as_str()));
    assert_eq!(reply.tag, Some(31));
    Ok(())
}

#[tokio::test]
async fn relay_learns_a_shortcut_and_caches_the_answer() -> anyhow::Result<()> {
    let (a, mid, top) = three_node_ring(true).await?;
    let client = Client::new().await?;

    // owned by mid; asked via top, whose only route leads to a, so the
    // request takes two hops and the reply comes straight back to top
    let key = key_in(HashRange::new(QUARTER, MID - 1), "far");
    client.put(a.local_addr(), &key, Some("shortcut"), 40).await?;

    let reply = client.get(top.local_addr(), &key, 41).await?;
    assert_eq!(reply.kind, Some(PacketKind::Success));
    assert_eq!(reply.val.as_deref(), Some("shortcut"));
    assert_eq!(reply.tag, Some(41));
    assert_eq!(
        reply.hash_range,
        Some(HashRange::new(QUARTER, MID - 1)),
        "first answer is stamped with the owner's range"
    );

    let top_snap = top.inspect().await?;
    let mid_info = NodeInfo::new(mid.local_addr(), QUARTER);
    assert!(
        top_snap.routes.contains(&mid_info),
        "the relay learned the responder's position: {:?}",
        top_snap.routes
    );
    assert_eq!(top_snap.cache.get(&key).map(String::as_str), Some("shortcut"));

    // the second ask is answered from the relay's own cache
    let reply = client.get(top.local_addr(), &key, 42).await?;
    assert_eq!(reply.kind, Some(PacketKind::Success));
    assert_eq!(reply.val.as_deref(), Some("shortcut"));
    assert_eq!(
        reply.hash_range,
        Some(top_snap.hash_range),
        "second answer is stamped with the relay's range: served locally"
    );
    Ok(())
}

#[tokio::test]
async fn leaving_node_hands_over_its_range_and_store() -> anyhow::Result<()> {
    let (a, mid, top) = three_node_ring(false).await?;
    let client = Client::new().await?;

    let key = key_in(HashRange::new(QUARTER, MID - 1), "kept");
    client.put(a.local_addr(), &key, Some("survives"), 50).await?;

    // resolves only after mid's own leave has circled the whole ring
    let mid_addr = mid.local_addr();
    mid.leave().await?;

    let a_info = NodeInfo::new(a.local_addr(), 0);
    let top_info = NodeInfo::new(top.local_addr(), MID);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let a_snap = a.inspect().await?;
        let top_snap = top.inspect().await?;
        let repaired = a_snap.succ_info == top_info
            && a_snap.hash_range == HashRange::new(0, MID - 1)
            && top_snap.pred_info == a_info
            && a_snap.store.contains_key(&key);
        if repaired {
            assert!(
                !a_snap.routes.iter().any(|r| r.addr == mid_addr),
                "routes to the leaver are forgotten"
            );
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("ring did not repair after leave: a={a_snap:?} top={top_snap:?}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // the pair now lives with the predecessor and is still reachable
    let reply = client.get(top.local_addr(), &key, 51).await?;
    assert_eq!(reply.kind, Some(PacketKind::Success));
    assert_eq!(reply.val.as_deref(), Some("survives"));
    Ok(())
}

#[tokio::test]
async fn malformed_requests_earn_a_failure_reply() -> anyhow::Result<()> {
    let a = DhtNode::start_solo("127.0.0.1:0", 4, false).await?;
    let client = Client::new().await?;

    // a get without a key fails check() at the first node
    let mut pkt = Packet::of_kind(PacketKind::Get);
    pkt.tag = Some(60);
    let reply = client.request(a.local_addr(), pkt).await?;
    assert_eq!(reply.kind, Some(PacketKind::Failure));
    assert_eq!(reply.reason.as_deref(), Some("get packet requires a key"));
    assert_eq!(reply.tag, Some(60));
    Ok(())
}
