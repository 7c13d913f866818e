use crate::{
    action::{
        ConnectionState, DebugState, DhtEvent, LookupKind, LookupSink, OneshotTask, StartLookup,
    },
    config::DhtConfig,
    handler::{DhtHandler, HandlerOptions},
    id::{InfoHash, NodeId},
    routing::NodeHandle,
    socket::Socket,
    SocketTrait,
};
use futures_util::Stream;
use std::{
    collections::HashSet,
    io,
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};
use tokio::{
    net::UdpSocket,
    sync::{mpsc, oneshot},
    task, time,
};

/// Maintains a Distributed Hash (Routing) Table and finds the other peers of an application
/// network in it.
///
/// Peers of the same application share a network key. Its SHA-1 is the info hash every peer
/// announces itself under and looks up ([`MainlineDht::join_network`]).
///
/// Clones share the same running instance, so any task can hold one.
///
/// # IPv6
///
/// An instance speaks a single address family ([BEP32](https://www.bittorrent.org/beps/bep_0032.html)).
/// A dual-stack node is two instances, one per family, preferably sharing a node id
/// ([`DhtBuilder::set_node_id`]).
#[derive(Clone)]
pub struct MainlineDht {
    send: mpsc::UnboundedSender<OneshotTask>,
    node_id: NodeId,
    network_hash: Option<InfoHash>,
}

impl MainlineDht {
    /// Configure a new instance.
    pub fn builder() -> DhtBuilder {
        DhtBuilder {
            nodes: HashSet::new(),
            routers: HashSet::new(),
            read_only: false,
            announce_port: None,
            public_endpoint: None,
            node_id: None,
            network_key: None,
            config: DhtConfig::default(),
        }
    }

    /// Spawn the handler task on `socket` and queue the bootstrap.
    fn with_builder(
        builder: DhtBuilder,
        socket: Socket,
    ) -> (Self, mpsc::UnboundedReceiver<DhtEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let node_id = builder.node_id.unwrap_or_else(NodeId::random);
        let network_hash = builder
            .network_key
            .as_deref()
            .or(builder.config.network_key.as_deref())
            .map(NodeId::from_network_key);

        log::debug!(
            "{}: Starting node {:?} on {:?}",
            socket.ip_version(),
            node_id,
            socket.local_addr()
        );

        let handler = DhtHandler::new(
            HandlerOptions {
                node_id,
                network_hash,
                read_only: builder.read_only,
                announce_port: builder.announce_port,
                public_endpoint: builder.public_endpoint,
                routers: builder.routers,
                nodes: builder.nodes,
                config: builder.config,
            },
            socket,
            command_rx,
            event_tx,
        );

        // The handler holds the receiver, so this can't fail.
        command_tx.send(OneshotTask::StartBootstrap).unwrap_or(());

        task::spawn(handler.run());

        (
            Self {
                send: command_tx,
                node_id,
                network_hash,
            },
            event_rx,
        )
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Info hash of the application network, if a network key was configured.
    pub fn network_hash(&self) -> Option<InfoHash> {
        self.network_hash
    }

    /// Connection state. `Disconnected` once the DHT has shut down.
    pub async fn state(&self) -> ConnectionState {
        let (tx, rx) = oneshot::channel();

        if self.send.send(OneshotTask::GetState(tx)).is_err() {
            ConnectionState::Disconnected
        } else {
            rx.await.unwrap_or(ConnectionState::Disconnected)
        }
    }

    /// Resolves to `true` once the bootstrap has completed (immediately if it already has), or to
    /// `false` if it failed, the DHT shut down or `timeout` elapsed.
    pub async fn bootstrapped(&self, timeout: Option<Duration>) -> bool {
        let (tx, rx) = oneshot::channel();

        if self.send.send(OneshotTask::CheckBootstrap(tx)).is_err() {
            return false;
        }

        match timeout {
            Some(timeout) => time::timeout(timeout, rx)
                .await
                .map(|result| result.unwrap_or(false))
                .unwrap_or(false),
            None => rx.await.unwrap_or(false),
        }
    }

    /// Join the application network: find the nodes around our own id, then look up the
    /// network info hash and announce ourselves under it. The stream yields the peers found
    /// and ends once the announce is done. From then on the announce is repeated periodically.
    ///
    /// Without a network key only the first part happens and the stream is empty.
    pub fn join_network(&self) -> SearchStream {
        let (tx, rx) = mpsc::unbounded_channel();

        if self.send.send(OneshotTask::JoinNetwork(tx)).is_err() {
            log::error!("join not started, the DHT is shut down");
        }

        SearchStream(rx)
    }

    /// Look up the peers of `info_hash`. With `announce`, our endpoint is then stored on the
    /// closest nodes that handed out a token, and the stream ends when that is done too.
    ///
    /// Searches requested during the bootstrap wait for it to finish.
    pub fn search(&self, info_hash: InfoHash, announce: bool) -> SearchStream {
        let (tx, rx) = mpsc::unbounded_channel();

        if self
            .send
            .send(OneshotTask::StartLookup(StartLookup {
                target: info_hash,
                kind: LookupKind::GetPeers,
                announce,
                sink: LookupSink::Peers(tx),
            }))
            .is_err()
        {
            log::error!("search not started, the DHT is shut down");
        }

        SearchStream(rx)
    }

    /// Look up the peers of `info_hash` without announcing.
    pub fn get_peers(&self, info_hash: InfoHash) -> SearchStream {
        self.search(info_hash, false)
    }

    /// Look up the peers of `info_hash` and announce ourselves to the closest nodes.
    pub fn announce_peer(&self, info_hash: InfoHash) -> SearchStream {
        self.search(info_hash, true)
    }

    /// Find the nodes closest to `target`. Resolves to those that answered, closest first.
    pub async fn find_nodes(&self, target: NodeId) -> io::Result<Vec<NodeHandle>> {
        let (tx, rx) = oneshot::channel();

        self.send
            .send(OneshotTask::StartLookup(StartLookup {
                target,
                kind: LookupKind::FindNode,
                announce: false,
                sink: LookupSink::Nodes(tx),
            }))
            .map_err(|_| shut_down())?;

        rx.await.map_err(|_| shut_down())
    }

    /// Ping the node at `addr`. An answer shows up as a [`DhtEvent::NodePinged`] event.
    pub fn ping(&self, addr: SocketAddr) -> io::Result<()> {
        self.send
            .send(OneshotTask::Ping(addr))
            .map_err(|_| shut_down())
    }

    /// Address of the underlying socket.
    pub async fn local_addr(&self) -> io::Result<SocketAddr> {
        let (tx, rx) = oneshot::channel();

        self.send
            .send(OneshotTask::GetLocalAddr(tx))
            .map_err(|_| shut_down())?;

        rx.await.map_err(|_| shut_down())
    }

    /// Counters of the handler's internals. `None` once shut down.
    pub async fn debug_state(&self) -> Option<DebugState> {
        let (tx, rx) = oneshot::channel();

        if self.send.send(OneshotTask::GetDebugState(tx)).is_err() {
            None
        } else {
            rx.await.ok()
        }
    }

    /// All nodes of the routing table.
    pub async fn nodes(&self) -> io::Result<Vec<NodeHandle>> {
        let (tx, rx) = oneshot::channel();

        self.send
            .send(OneshotTask::GetNodes(tx))
            .map_err(|_| shut_down())?;

        rx.await.map_err(|_| shut_down())
    }

    /// Peers other nodes announced to us for `info_hash`.
    pub async fn stored_peers(&self, info_hash: InfoHash) -> io::Result<Vec<SocketAddr>> {
        let (tx, rx) = oneshot::channel();

        self.send
            .send(OneshotTask::GetStoredPeers(info_hash, tx))
            .map_err(|_| shut_down())?;

        rx.await.map_err(|_| shut_down())
    }

    /// Stop the DHT. Pending searches end, later calls fail.
    pub fn shutdown(&self) {
        self.send.send(OneshotTask::Shutdown).unwrap_or(())
    }
}

fn shut_down() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "DhtHandler has shut down")
}

/// Peers found by [`MainlineDht::search()`] or [`MainlineDht::join_network()`], each reported once.
#[must_use = "streams do nothing unless polled"]
pub struct SearchStream(mpsc::UnboundedReceiver<SocketAddr>);

impl Stream for SearchStream {
    type Item = SocketAddr;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.0).poll_recv(cx)
    }
}

/// Options of a DHT instance, consumed by [`DhtBuilder::start`] or [`DhtBuilder::bind`].
#[derive(Debug)]
pub struct DhtBuilder {
    nodes: HashSet<SocketAddr>,
    routers: HashSet<String>,
    read_only: bool,
    announce_port: Option<u16>,
    public_endpoint: Option<SocketAddr>,
    node_id: Option<NodeId>,
    network_key: Option<String>,
    config: DhtConfig,
}

impl DhtBuilder {
    /// A known node to bootstrap from. It is added to the routing table once it answers.
    pub fn add_node(mut self, node_addr: SocketAddr) -> DhtBuilder {
        self.nodes.insert(node_addr);
        self
    }

    /// A `host:port` bootstrap router, resolved on every bootstrap attempt. Routers help fill an
    /// empty table but never enter it.
    pub fn add_router(mut self, router: String) -> DhtBuilder {
        self.routers.insert(router);
        self
    }

    /// Several routers at once, see [`DhtBuilder::add_router`].
    pub fn add_routers<I, T>(mut self, routers: I) -> DhtBuilder
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.routers.extend(routers.into_iter().map(|r| r.into()));
        self
    }

    /// A read only node sends queries but ignores the ones it receives, so it never ends up in
    /// other routing tables. Useful behind a NAT that drops unsolicited datagrams anyway.
    /// Off by default.
    pub fn set_read_only(mut self, read_only: bool) -> DhtBuilder {
        self.read_only = read_only;

        self
    }

    /// Port to put in our `announce_peer` queries. Without it the public endpoint's port is
    /// used, and failing that `implied_port`.
    pub fn set_announce_port(mut self, port: u16) -> Self {
        self.announce_port = Some(port);
        self
    }

    /// Our address as seen from the internet (as found by a STUN client, say). Its port is
    /// announced, and it is never reported as a peer.
    pub fn set_public_endpoint(mut self, endpoint: SocketAddr) -> Self {
        self.public_endpoint = Some(endpoint);
        self
    }

    /// Use a fixed node id instead of a random one.
    pub fn set_node_id(mut self, id: NodeId) -> Self {
        self.node_id = Some(id);
        self
    }

    /// Key of the application network. Takes precedence over `DhtConfig::network_key`.
    pub fn set_network_key<K: Into<String>>(mut self, key: K) -> Self {
        self.network_key = Some(key.into());
        self
    }

    pub fn set_config(mut self, config: DhtConfig) -> Self {
        self.config = config;
        self
    }

    /// Run the DHT on `socket`. Returns the handle and the receiver of its events. Fails only if
    /// the socket can't report its local address.
    pub fn start<S: SocketTrait + Send + Sync + 'static>(
        self,
        socket: S,
    ) -> io::Result<(MainlineDht, mpsc::UnboundedReceiver<DhtEvent>)> {
        let socket = Socket::new(socket)?;
        Ok(MainlineDht::with_builder(self, socket))
    }

    /// Bind a UDP socket to `addr` and start on it.
    pub async fn bind(
        self,
        addr: SocketAddr,
    ) -> io::Result<(MainlineDht, mpsc::UnboundedReceiver<DhtEvent>)> {
        let socket = UdpSocket::bind(addr).await?;
        self.start(socket)
    }
}
