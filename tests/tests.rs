use futures_util::StreamExt;
use peernet_dht::{
    bencode::{self, Dictionary},
    ConnectionState, DhtConfig, DhtEvent, InfoHash, MainlineDht, NodeId, CLIENT_VERSION,
};
use serde::Deserialize;
use std::{
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    time::Duration,
};
use tokio::{net::UdpSocket, sync::mpsc, time};

const NETWORK_KEY: &str = "GEDKEEPER NETWORK";

#[tokio::test(flavor = "multi_thread")]
async fn announce_and_lookup_v4() {
    announce_and_lookup(AddrFamily::V4).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn announce_and_lookup_v6() {
    announce_and_lookup(AddrFamily::V6).await;
}

async fn announce_and_lookup(addr_family: AddrFamily) {
    // Start the router node for the other nodes to bootstrap against.
    let bootstrap_node_socket = UdpSocket::bind(localhost(addr_family)).await.unwrap();
    let bootstrap_node_addr = bootstrap_node_socket.local_addr().unwrap();
    let (_node, mut bootstrap_node_events) = MainlineDht::builder()
        .start(bootstrap_node_socket)
        .unwrap();

    wait_for_bootstrap(&mut bootstrap_node_events).await;

    // Start node A
    let a_socket = UdpSocket::bind(localhost(addr_family)).await.unwrap();
    let a_addr = a_socket.local_addr().unwrap();
    let (a_node, mut a_events) = MainlineDht::builder()
        .add_node(bootstrap_node_addr)
        .start(a_socket)
        .unwrap();

    // Start node B
    let b_socket = UdpSocket::bind(localhost(addr_family)).await.unwrap();
    let (b_node, mut b_events) = MainlineDht::builder()
        .add_node(bootstrap_node_addr)
        .start(b_socket)
        .unwrap();

    // Wait for both nodes to bootstrap
    wait_for_bootstrap(&mut a_events).await;
    wait_for_bootstrap(&mut b_events).await;

    assert_eq!(a_node.state().await, ConnectionState::Connected);

    let the_info_hash = InfoHash::sha1(b"foo");

    // Perform a lookup with announce by A. It should not return any peers initially but it should
    // make the network aware that A has the infohash.
    let mut search = a_node.announce_peer(the_info_hash);

    while let Some(peer) = search.next().await {
        panic!("found peer {} but none expected", peer)
    }

    // Now perform the lookup by B. It should find A.
    let mut search = b_node.get_peers(the_info_hash);
    let mut peer_found = false;

    while let Some(addr) = search.next().await {
        assert_eq!(addr, a_addr);
        peer_found = true;
    }

    assert!(peer_found);
}

#[tokio::test(flavor = "multi_thread")]
async fn join_network_finds_peers_of_the_same_network() {
    let (seed, mut seed_events) = MainlineDht::builder()
        .set_network_key(NETWORK_KEY)
        .bind(localhost(AddrFamily::V4))
        .await
        .unwrap();
    let seed_addr = seed.local_addr().await.unwrap();
    wait_for_bootstrap(&mut seed_events).await;

    let (a, mut a_events) = MainlineDht::builder()
        .set_network_key(NETWORK_KEY)
        .add_node(seed_addr)
        .bind(localhost(AddrFamily::V4))
        .await
        .unwrap();
    let a_addr = a.local_addr().await.unwrap();
    wait_for_bootstrap(&mut a_events).await;

    let network_hash = NodeId::from_network_key(NETWORK_KEY);
    assert_eq!(a.network_hash(), Some(network_hash));

    // A is the first one in the network, it finds nobody.
    let peers: Vec<_> = a.join_network().collect().await;
    assert!(peers.is_empty(), "unexpected peers {:?}", peers);

    // The seed stored A's announcement.
    assert_eq!(seed.stored_peers(network_hash).await.unwrap(), vec![a_addr]);
    wait_for(&mut seed_events, |event| {
        *event
            == DhtEvent::PeerFound {
                info_hash: network_hash,
                addr: a_addr,
            }
    })
    .await;

    let (b, mut b_events) = MainlineDht::builder()
        .set_network_key(NETWORK_KEY)
        .add_node(seed_addr)
        .bind(localhost(AddrFamily::V4))
        .await
        .unwrap();
    wait_for_bootstrap(&mut b_events).await;

    let peers: Vec<_> = b.join_network().collect().await;
    assert_eq!(peers, vec![a_addr]);

    wait_for(&mut b_events, |event| {
        matches!(event, DhtEvent::Announced { info_hash, accepted } if *info_hash == network_hash && *accepted > 0)
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn answers_raw_queries() {
    let (node, mut events) = MainlineDht::builder()
        .set_network_key(NETWORK_KEY)
        .bind(localhost(AddrFamily::V4))
        .await
        .unwrap();
    let node_addr = node.local_addr().await.unwrap();
    wait_for_bootstrap(&mut events).await;

    let client = UdpSocket::bind(localhost(AddrFamily::V4)).await.unwrap();
    let client_id = NodeId::sha1(b"raw client");
    let network_hash = NodeId::from_network_key(NETWORK_KEY);

    // ping
    let reply = query(
        &client,
        node_addr,
        b"aa",
        "ping",
        Dictionary::builder().insert("id", client_id.as_bytes()),
    )
    .await;
    assert_eq!(reply.get_bytes(b"t"), Some(&b"aa"[..]));
    assert_eq!(reply.get_bytes(b"y"), Some(&b"r"[..]));
    assert_eq!(reply.get_bytes(b"v"), Some(CLIENT_VERSION));
    assert_eq!(
        reply.get_dict(b"r").and_then(|r| r.get_bytes(b"id")),
        Some(node.node_id().as_bytes())
    );

    wait_for(&mut events, |event| {
        matches!(event, DhtEvent::NodePinged { id, compatible: false, .. } if *id == client_id)
    })
    .await;

    // find_node: the client itself is the only node known and is never returned to itself.
    let reply = query(
        &client,
        node_addr,
        b"ab",
        "find_node",
        Dictionary::builder()
            .insert("id", client_id.as_bytes())
            .insert("target", client_id.as_bytes()),
    )
    .await;
    let r = reply.get_dict(b"r").unwrap();
    assert!(r.get_bytes(b"nodes").map_or(true, |nodes| nodes.is_empty()));

    // get_peers hands out a token.
    let reply = query(
        &client,
        node_addr,
        b"ac",
        "get_peers",
        Dictionary::builder()
            .insert("id", client_id.as_bytes())
            .insert("info_hash", network_hash.as_bytes()),
    )
    .await;
    let r = reply.get_dict(b"r").unwrap();
    let token = r.get_bytes(b"token").unwrap().to_vec();
    assert!(r.get(b"values").is_none());

    // announce_peer with an explicit port.
    let reply = query(
        &client,
        node_addr,
        b"ad",
        "announce_peer",
        Dictionary::builder()
            .insert("id", client_id.as_bytes())
            .insert("implied_port", 0i64)
            .insert("info_hash", network_hash.as_bytes())
            .insert("port", 6881i64)
            .insert("token", token.clone()),
    )
    .await;
    assert_eq!(reply.get_bytes(b"y"), Some(&b"r"[..]));

    let announced: SocketAddr = (Ipv4Addr::LOCALHOST, 6881).into();
    assert_eq!(
        node.stored_peers(network_hash).await.unwrap(),
        vec![announced]
    );
    wait_for(&mut events, |event| {
        *event
            == DhtEvent::PeerFound {
                info_hash: network_hash,
                addr: announced,
            }
    })
    .await;

    // A get_peers now returns the stored peer.
    let reply = query(
        &client,
        node_addr,
        b"ae",
        "get_peers",
        Dictionary::builder()
            .insert("id", client_id.as_bytes())
            .insert("info_hash", network_hash.as_bytes()),
    )
    .await;
    let values = reply
        .get_dict(b"r")
        .and_then(|r| r.get_list(b"values"))
        .unwrap();
    assert_eq!(values.len(), 1);
    assert_eq!(values[0].as_bytes(), Some(&[127, 0, 0, 1, 0x1a, 0xe1][..]));

    // A made up token is refused.
    let reply = query(
        &client,
        node_addr,
        b"af",
        "announce_peer",
        Dictionary::builder()
            .insert("id", client_id.as_bytes())
            .insert("implied_port", 1i64)
            .insert("info_hash", network_hash.as_bytes())
            .insert("token", &b"nope"[..]),
    )
    .await;
    assert_eq!(error_code(&reply), Some(203));

    // Unknown method.
    let reply = query(
        &client,
        node_addr,
        b"ag",
        "vote",
        Dictionary::builder().insert("id", client_id.as_bytes()),
    )
    .await;
    assert_eq!(error_code(&reply), Some(204));

    // Malformed arguments.
    let reply = query(
        &client,
        node_addr,
        b"ah",
        "get_peers",
        Dictionary::builder()
            .insert("id", client_id.as_bytes())
            .insert("info_hash", &b"short"[..]),
    )
    .await;
    assert_eq!(reply.get_bytes(b"t"), Some(&b"ah"[..]));
    assert_eq!(error_code(&reply), Some(203));
}

#[tokio::test(flavor = "multi_thread")]
async fn full_storage_refuses_announces() {
    let config = DhtConfig {
        max_stored_peers: 1,
        ..DhtConfig::default()
    };
    let (node, mut events) = MainlineDht::builder()
        .set_config(config)
        .bind(localhost(AddrFamily::V4))
        .await
        .unwrap();
    let node_addr = node.local_addr().await.unwrap();
    wait_for_bootstrap(&mut events).await;

    let client = UdpSocket::bind(localhost(AddrFamily::V4)).await.unwrap();
    let client_id = NodeId::sha1(b"raw client");

    let reply = query(
        &client,
        node_addr,
        b"aa",
        "get_peers",
        Dictionary::builder()
            .insert("id", client_id.as_bytes())
            .insert("info_hash", InfoHash::sha1(b"first").as_bytes()),
    )
    .await;
    let token = reply
        .get_dict(b"r")
        .and_then(|r| r.get_bytes(b"token"))
        .unwrap()
        .to_vec();

    // The token is bound to our address only, so it is good for any info hash.
    let announce = |info_hash: InfoHash| {
        Dictionary::builder()
            .insert("id", client_id.as_bytes())
            .insert("implied_port", 1i64)
            .insert("info_hash", info_hash.as_bytes())
            .insert("token", token.clone())
    };

    let reply = query(
        &client,
        node_addr,
        b"ab",
        "announce_peer",
        announce(InfoHash::sha1(b"first")),
    )
    .await;
    assert_eq!(reply.get_bytes(b"y"), Some(&b"r"[..]));

    let reply = query(
        &client,
        node_addr,
        b"ac",
        "announce_peer",
        announce(InfoHash::sha1(b"second")),
    )
    .await;
    assert_eq!(error_code(&reply), Some(202));

    assert!(node
        .stored_peers(InfoHash::sha1(b"second"))
        .await
        .unwrap()
        .is_empty());
    assert_eq!(node.debug_state().await.unwrap().stored_info_hashes, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn read_only_node_ignores_queries() {
    let (node, _events) = MainlineDht::builder()
        .set_read_only(true)
        .bind(localhost(AddrFamily::V4))
        .await
        .unwrap();
    let node_addr = node.local_addr().await.unwrap();

    let client = UdpSocket::bind(localhost(AddrFamily::V4)).await.unwrap();
    let message = encode_query(
        b"aa",
        "ping",
        Dictionary::builder().insert("id", NodeId::random().as_bytes()),
    );
    client.send_to(&message, node_addr).await.unwrap();

    let mut buffer = [0u8; 1500];
    let result = time::timeout(Duration::from_millis(500), client.recv_from(&mut buffer)).await;
    assert!(result.is_err(), "read only node answered");
    assert!(node.nodes().await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn bootstrap_against_raw_node() {
    let remote = UdpSocket::bind(localhost(AddrFamily::V4)).await.unwrap();
    let remote_addr = remote.local_addr().unwrap();
    let remote_id = NodeId::sha1(b"remote");

    let (node, mut events) = MainlineDht::builder()
        .add_node(remote_addr)
        .bind(localhost(AddrFamily::V4))
        .await
        .unwrap();

    let (query, from) = recv(&remote).await;
    assert_eq!(query.get_bytes(b"q"), Some(&b"find_node"[..]));
    assert_eq!(
        query.get_dict(b"a").and_then(|a| a.get_bytes(b"target")),
        Some(node.node_id().as_bytes())
    );

    respond(&remote, from, query.get_bytes(b"t").unwrap(), remote_id).await;

    wait_for_bootstrap(&mut events).await;
    assert!(node.bootstrapped(Some(Duration::from_secs(1))).await);

    let nodes = node.nodes().await.unwrap();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].id, remote_id);
    assert_eq!(nodes[0].addr, remote_addr);
}

#[tokio::test(flavor = "multi_thread")]
async fn error_from_another_host_is_ignored() {
    let remote = UdpSocket::bind(localhost(AddrFamily::V4)).await.unwrap();
    let remote_addr = remote.local_addr().unwrap();
    let remote_id = NodeId::sha1(b"remote");
    // Any 127/8 address is local on Linux.
    let stranger = UdpSocket::bind((Ipv4Addr::new(127, 0, 0, 2), 0)).await.unwrap();

    let config = DhtConfig {
        bootstrap_retry_interval: Duration::from_secs(60),
        ..DhtConfig::default()
    };

    let (node, mut events) = MainlineDht::builder()
        .add_node(remote_addr)
        .set_config(config)
        .bind(localhost(AddrFamily::V4))
        .await
        .unwrap();

    let (query, from) = recv(&remote).await;
    let transaction_id = query.get_bytes(b"t").unwrap();

    let error = Dictionary::builder()
        .insert("e", vec![bencode::Value::from(201i64), bencode::Value::from("no")])
        .insert("t", transaction_id)
        .insert("y", "e")
        .build()
        .encode();
    stranger.send_to(&error, from).await.unwrap();
    time::sleep(Duration::from_millis(100)).await;

    // The query is still pending, the real answer completes the bootstrap.
    respond(&remote, from, transaction_id, remote_id).await;

    wait_for_bootstrap(&mut events).await;
    assert_eq!(node.nodes().await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn late_response_is_ignored() {
    let remote = UdpSocket::bind(localhost(AddrFamily::V4)).await.unwrap();
    let remote_addr = remote.local_addr().unwrap();

    let config = DhtConfig {
        query_timeout: Duration::from_millis(200),
        bootstrap_retry_interval: Duration::from_secs(60),
        ..DhtConfig::default()
    };

    let (node, _events) = MainlineDht::builder()
        .add_node(remote_addr)
        .set_config(config)
        .bind(localhost(AddrFamily::V4))
        .await
        .unwrap();

    let (query, from) = recv(&remote).await;

    time::sleep(Duration::from_millis(600)).await;

    // The query timed out and was dropped.
    let state = node.debug_state().await.unwrap();
    assert_eq!(state.pending_transactions, 0);
    assert_eq!(state.state, ConnectionState::Connecting);

    respond(
        &remote,
        from,
        query.get_bytes(b"t").unwrap(),
        NodeId::sha1(b"slow"),
    )
    .await;

    time::sleep(Duration::from_millis(200)).await;

    assert!(node.nodes().await.unwrap().is_empty());
    assert!(!node.bootstrapped(Some(Duration::from_millis(100))).await);
}

#[tokio::test(flavor = "multi_thread")]
async fn wire_format_is_plain_bencode() {
    #[derive(Deserialize)]
    struct Reply {
        #[serde(with = "serde_bytes")]
        t: Vec<u8>,
        y: String,
        #[serde(with = "serde_bytes")]
        v: Vec<u8>,
        r: ReplyBody,
    }

    #[derive(Deserialize)]
    struct ReplyBody {
        #[serde(with = "serde_bytes")]
        id: Vec<u8>,
    }

    let (node, _events) = MainlineDht::builder()
        .bind(localhost(AddrFamily::V4))
        .await
        .unwrap();
    let node_addr = node.local_addr().await.unwrap();

    let client = UdpSocket::bind(localhost(AddrFamily::V4)).await.unwrap();
    let message = b"d1:ad2:id20:abcdefghij0123456789e1:q4:ping1:t2:xy1:y1:qe";
    client.send_to(message, node_addr).await.unwrap();

    let mut buffer = [0u8; 1500];
    let (size, _) = time::timeout(Duration::from_secs(5), client.recv_from(&mut buffer))
        .await
        .unwrap()
        .unwrap();

    let reply: Reply = serde_bencode::from_bytes(&buffer[..size]).unwrap();
    assert_eq!(reply.t, b"xy");
    assert_eq!(reply.y, "r");
    assert_eq!(reply.v, CLIENT_VERSION);
    assert_eq!(reply.r.id, node.node_id().as_bytes());
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_stops_the_node() {
    let (node, mut events) = MainlineDht::builder()
        .bind(localhost(AddrFamily::V4))
        .await
        .unwrap();
    wait_for_bootstrap(&mut events).await;

    node.shutdown();

    wait_for(&mut events, |event| {
        *event == DhtEvent::StateChanged(ConnectionState::Disconnected)
    })
    .await;

    assert_eq!(node.state().await, ConnectionState::Disconnected);
    assert!(node.local_addr().await.is_err());
}

async fn wait_for_bootstrap(events: &mut mpsc::UnboundedReceiver<DhtEvent>) {
    wait_for(events, |event| match event {
        DhtEvent::BootstrapCompleted => true,
        DhtEvent::BootstrapFailed => panic!("bootstrap failed"),
        _ => false,
    })
    .await
}

async fn wait_for<F>(events: &mut mpsc::UnboundedReceiver<DhtEvent>, mut pred: F)
where
    F: FnMut(&DhtEvent) -> bool,
{
    let wait = async {
        while let Some(event) = events.recv().await {
            if pred(&event) {
                return;
            }
        }
        panic!("event channel closed");
    };

    time::timeout(Duration::from_secs(10), wait)
        .await
        .expect("timed out waiting for event")
}

fn encode_query(
    transaction_id: &[u8],
    method: &str,
    arguments: bencode::DictionaryBuilder,
) -> Vec<u8> {
    Dictionary::builder()
        .insert("a", arguments.build())
        .insert("q", method)
        .insert("t", transaction_id)
        .insert("y", "q")
        .build()
        .encode()
}

async fn query(
    client: &UdpSocket,
    to: SocketAddr,
    transaction_id: &[u8],
    method: &str,
    arguments: bencode::DictionaryBuilder,
) -> Dictionary {
    client
        .send_to(&encode_query(transaction_id, method, arguments), to)
        .await
        .unwrap();

    recv(client).await.0
}

async fn recv(socket: &UdpSocket) -> (Dictionary, SocketAddr) {
    let mut buffer = [0u8; 1500];
    let (size, from) = time::timeout(Duration::from_secs(5), socket.recv_from(&mut buffer))
        .await
        .expect("timed out waiting for a datagram")
        .unwrap();

    (bencode::decode_dictionary(&buffer[..size]).unwrap(), from)
}

async fn respond(socket: &UdpSocket, to: SocketAddr, transaction_id: &[u8], id: NodeId) {
    let message = Dictionary::builder()
        .insert("r", Dictionary::builder().insert("id", id.as_bytes()).build())
        .insert("t", transaction_id)
        .insert("y", "r")
        .build()
        .encode();

    socket.send_to(&message, to).await.unwrap();
}

fn error_code(reply: &Dictionary) -> Option<i64> {
    if reply.get_bytes(b"y") != Some(&b"e"[..]) {
        return None;
    }

    reply.get_list(b"e")?.first()?.as_integer()
}

#[derive(Copy, Clone)]
enum AddrFamily {
    V4,
    V6,
}

fn localhost(family: AddrFamily) -> SocketAddr {
    match family {
        AddrFamily::V4 => (Ipv4Addr::LOCALHOST, 0).into(),
        AddrFamily::V6 => (Ipv6Addr::LOCALHOST, 0).into(),
    }
}
