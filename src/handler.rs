use crate::action::{
    ActionStatus, Announce, BootstrapOutcome, BootstrapState, ConnectionState, DebugState,
    DhtEvent, IpVersion, Lookup, LookupKind, LookupOutcome, LookupSink, LookupStep, OneshotTask,
    ScheduledTaskCheck, StartLookup, TableBootstrap, TableRefresh, WorkerError,
};
use crate::{
    config::DhtConfig,
    id::{InfoHash, NodeId},
    message::{
        error_code, AnnouncePeerRequest, DecodeError, Message, MessageBody, PingRequest,
        QueryType, Request, Response, Want, CLIENT_VERSION,
    },
    routing::{NodeHandle, RoutingTable, MAX_BUCKET_SIZE},
    socket::Socket,
    storage::{AddOutcome, AnnounceStorage},
    timer::Timer,
    token::TokenStore,
    transaction::{LookupId, Owner, Transaction, TransactionId, TransactionManager},
};
use futures_util::StreamExt;
use std::{
    collections::{HashMap, HashSet},
    io,
    net::SocketAddr,
};
use tokio::{
    select,
    sync::{mpsc, oneshot},
    time::Instant,
};

/// Most peers returned in one `get_peers` response, so it fits in a datagram.
const MAX_VALUES: usize = 100;

/// Everything the handler is configured with at startup.
pub(crate) struct HandlerOptions {
    pub node_id: NodeId,
    pub network_hash: Option<InfoHash>,
    pub read_only: bool,
    pub announce_port: Option<u16>,
    pub public_endpoint: Option<SocketAddr>,
    pub routers: HashSet<String>,
    pub nodes: HashSet<SocketAddr>,
    pub config: DhtConfig,
}

/// The event loop of a DHT instance.
///
/// The handler is the only owner of the routing table, the peer storage and the pending
/// transactions: everything that touches them runs on its task, one event at a time.
pub(crate) struct DhtHandler {
    this_node_id: NodeId,
    network_hash: Option<InfoHash>,
    config: DhtConfig,
    running: bool,
    state: ConnectionState,
    command_rx: mpsc::UnboundedReceiver<OneshotTask>,
    event_tx: mpsc::UnboundedSender<DhtEvent>,
    timer: Timer,
    read_only: bool,
    announce_port: Option<u16>,
    public_endpoint: Option<SocketAddr>,
    socket: Socket,
    token_store: TokenStore,
    transactions: TransactionManager,
    routing_table: RoutingTable,
    active_stores: AnnounceStorage,

    bootstrap: TableBootstrap,
    // The lookup of the bootstrap attempt in progress.
    bootstrap_lookup: Option<LookupId>,
    bootstrap_txs: Vec<oneshot::Sender<bool>>,
    // Lookups requested while bootstrapping, started once it is over.
    future_lookups: Vec<StartLookup>,

    // TableRefresh action.
    refresh: TableRefresh,
    refresh_started: bool,

    next_action_id: u64,
    // Ongoing lookups, and the announces that follow some of them (under the same id).
    lookups: HashMap<LookupId, Lookup>,
    announces: HashMap<LookupId, Announce>,
    // Lookups that are done but not yet wrapped up.
    completed_lookups: Vec<LookupId>,

    // Set by `JoinNetwork`, the network info hash is then announced periodically.
    last_network_announce: Option<Instant>,
}

impl DhtHandler {
    pub fn new(
        options: HandlerOptions,
        socket: Socket,
        command_rx: mpsc::UnboundedReceiver<OneshotTask>,
        event_tx: mpsc::UnboundedSender<DhtEvent>,
    ) -> Self {
        let HandlerOptions {
            node_id,
            network_hash,
            read_only,
            announce_port,
            public_endpoint,
            routers,
            nodes,
            config,
        } = options;

        let bootstrap = TableBootstrap::new(socket.ip_version(), routers, nodes);
        let active_stores = AnnounceStorage::new(
            config.max_peers_per_hash,
            config.max_stored_peers,
            config.peer_ttl,
        );

        Self {
            this_node_id: node_id,
            network_hash,
            config,
            running: true,
            state: ConnectionState::Disconnected,
            command_rx,
            event_tx,
            timer: Timer::new(),
            read_only,
            announce_port,
            public_endpoint,
            socket,
            token_store: TokenStore::new(),
            transactions: TransactionManager::new(),
            routing_table: RoutingTable::new(node_id),
            active_stores,
            bootstrap,
            bootstrap_lookup: None,
            bootstrap_txs: Vec::new(),
            future_lookups: Vec::new(),
            refresh: TableRefresh::new(),
            refresh_started: false,
            next_action_id: 0,
            lookups: HashMap::new(),
            announces: HashMap::new(),
            completed_lookups: Vec::new(),
            last_network_announce: None,
        }
    }

    fn ip_version(&self) -> IpVersion {
        self.socket.ip_version()
    }

    pub async fn run(mut self) {
        self.timer.schedule_in(
            self.config.maintenance_interval,
            ScheduledTaskCheck::Maintenance,
        );

        while self.running {
            self.run_once().await;
            self.wrap_up_completed_lookups().await;
        }

        self.set_state(ConnectionState::Disconnected);
        log::debug!("{}: DhtHandler gracefully shut down", self.ip_version());
    }

    async fn run_once(&mut self) {
        select! {
            token = self.timer.next(), if !self.timer.is_empty() => {
                if let Some(token) = token {
                    self.handle_timeout(token).await
                }
            }
            command = self.command_rx.recv() => {
                if let Some(command) = command {
                    self.handle_command(command).await
                } else {
                    self.shutdown()
                }
            }
            message = self.socket.recv() => {
                match message {
                    Ok((Ok(message), addr)) => if let Err(error) = self.handle_incoming(message, addr).await {
                        log::debug!("{}: Failed to handle incoming message: {} from:{addr:?}", self.ip_version(), error);
                    }
                    Ok((Err(error), addr)) => self.handle_invalid_request(error, addr).await,
                    Err(error) => log::warn!("{}: Failed to receive incoming message: {}", self.ip_version(), error),
                }
            }
        }
    }

    async fn handle_command(&mut self, task: OneshotTask) {
        match task {
            OneshotTask::StartBootstrap => self.handle_start_bootstrap().await,
            OneshotTask::CheckBootstrap(tx) => self.handle_check_bootstrap(tx),
            OneshotTask::StartLookup(lookup) => self.handle_start_lookup(lookup).await,
            OneshotTask::JoinNetwork(tx) => self.handle_join_network(tx).await,
            OneshotTask::Ping(addr) => self.handle_ping(addr).await,
            OneshotTask::GetState(tx) => tx.send(self.state).unwrap_or(()),
            OneshotTask::GetLocalAddr(tx) => tx.send(self.socket.local_addr()).unwrap_or(()),
            OneshotTask::GetDebugState(tx) => self.handle_get_debug_state(tx),
            OneshotTask::GetNodes(tx) => tx
                .send(self.routing_table.nodes().map(|node| *node.handle()).collect())
                .unwrap_or(()),
            OneshotTask::GetStoredPeers(info_hash, tx) => tx
                .send(self.active_stores.find_items(&info_hash).collect())
                .unwrap_or(()),
            OneshotTask::Shutdown => self.shutdown(),
        }
    }

    async fn handle_timeout(&mut self, token: ScheduledTaskCheck) {
        match token {
            ScheduledTaskCheck::QueryTimeout(trans_id) => {
                self.handle_query_timeout(trans_id).await;
            }
            ScheduledTaskCheck::TableRefresh => {
                self.handle_check_table_refresh().await;
            }
            ScheduledTaskCheck::Maintenance => {
                self.handle_maintenance().await;
            }
            ScheduledTaskCheck::BootstrapRetry => {
                self.handle_start_bootstrap().await;
            }
        }
    }

    async fn handle_incoming(
        &mut self,
        message: Message,
        addr: SocketAddr,
    ) -> Result<(), WorkerError> {
        // Read only nodes stay silent.
        if self.read_only && matches!(message.body, MessageBody::Request(_)) {
            return Ok(());
        }

        log::trace!("{}: Received {:?}", self.ip_version(), message);

        let compatible = message.is_similar_to(CLIENT_VERSION);

        match message.body {
            MessageBody::Request(request) => {
                self.handle_incoming_request(
                    message.transaction_id,
                    message.version,
                    compatible,
                    request,
                    addr,
                )
                .await?
            }
            MessageBody::Response(rsp) => {
                self.handle_incoming_response(
                    &message.transaction_id,
                    message.version,
                    compatible,
                    rsp,
                    addr,
                )
                .await?
            }
            MessageBody::Error(error) => {
                let (trans_id, transaction) =
                    self.take_transaction(&message.transaction_id, addr)?;

                log::debug!(
                    "{}: Received error {} from {addr:?} for {:?}",
                    self.ip_version(),
                    error,
                    transaction.query_type()
                );

                self.handle_query_failure(trans_id, transaction, false)
                    .await;
            }
            MessageBody::Unknown { kind, .. } => {
                log::debug!(
                    "{}: Ignoring message of unknown kind {:?} from {addr:?}",
                    self.ip_version(),
                    String::from_utf8_lossy(&kind)
                );
            }
        }

        Ok(())
    }

    async fn handle_incoming_request(
        &mut self,
        transaction_id: Vec<u8>,
        version: Option<Vec<u8>>,
        compatible: bool,
        request: Request,
        addr: SocketAddr,
    ) -> Result<(), WorkerError> {
        // Node requested from us, mark it in the Routingtable
        if let Some(id) = request.sender_id() {
            if !self.bootstrap.is_router(&addr) {
                self.routing_table
                    .handle_remote_request(NodeHandle::new(id, addr), version.as_deref());
            }
        }

        let response_msg = match request {
            Request::Ping(p) => {
                self.send_event(DhtEvent::NodePinged {
                    id: p.id,
                    addr,
                    compatible,
                });

                Message::response(transaction_id, Response::new(self.this_node_id))
            }
            Request::FindNode(f) => {
                let (nodes_v4, nodes_v6) = self.find_closest_nodes(f.target, f.want, addr);

                let find_node_rsp = Response {
                    nodes_v4,
                    nodes_v6,
                    ..Response::new(self.this_node_id)
                };

                Message::response(transaction_id, find_node_rsp)
            }
            Request::GetPeers(g) => {
                let values: Vec<_> = self
                    .active_stores
                    .find_items(&g.info_hash)
                    // `values` only holds addresses of the family the request came from. The
                    // `want` field affects `nodes` and `nodes6` only (BEP-32).
                    .filter(|value_addr| value_addr.is_ipv4() == addr.is_ipv4())
                    .take(MAX_VALUES)
                    .collect();

                let (nodes_v4, nodes_v6) = self.find_closest_nodes(g.info_hash, g.want, addr);
                let token = self.token_store.checkout(addr.ip());

                let get_peers_rsp = Response {
                    id: self.this_node_id,
                    values,
                    nodes_v4,
                    nodes_v6,
                    token: Some(token.as_ref().to_vec()),
                };

                Message::response(transaction_id, get_peers_rsp)
            }
            Request::AnnouncePeer(a) => self.handle_announce_peer(transaction_id, a, addr),
            Request::Unknown(u) => {
                log::debug!(
                    "{}: Unknown method {:?} from {addr:?}",
                    self.ip_version(),
                    String::from_utf8_lossy(&u.method)
                );

                Message::error(transaction_id, error_code::METHOD_UNKNOWN, "Method Unknown")
            }
        };

        self.socket.send(&response_msg, addr).await?;

        Ok(())
    }

    fn handle_announce_peer(
        &mut self,
        transaction_id: Vec<u8>,
        a: AnnouncePeerRequest,
        addr: SocketAddr,
    ) -> Message {
        let is_valid =
            !self.config.validate_tokens || self.token_store.checkin(addr.ip(), &a.token);

        if !is_valid {
            // Node gave us an invalid token
            log::debug!(
                "{}: Remote node sent us an invalid token for an AnnounceRequest",
                self.ip_version()
            );
            return Message::error(
                transaction_id,
                error_code::PROTOCOL_ERROR,
                "received an invalid token",
            );
        }

        // Create a socket address based on the implied/explicit port number
        let connect_addr = match a.port {
            None => addr,
            Some(port) => {
                let mut addr = addr;
                addr.set_port(port);
                addr
            }
        };

        match self.active_stores.add_item(a.info_hash, connect_addr) {
            AddOutcome::Inserted | AddOutcome::Refreshed => {
                if Some(a.info_hash) == self.network_hash && !self.is_own_endpoint(&connect_addr)
                {
                    self.send_event(DhtEvent::PeerFound {
                        info_hash: a.info_hash,
                        addr: connect_addr,
                    });
                }

                Message::response(transaction_id, Response::new(self.this_node_id))
            }
            AddOutcome::Full => {
                log::debug!(
                    "{}: No room to store {addr:?} as a peer of {:?}",
                    self.ip_version(),
                    a.info_hash
                );

                Message::error(
                    transaction_id,
                    error_code::SERVER_ERROR,
                    "announce storage is full",
                )
            }
        }
    }

    /// A query with malformed arguments still gets an answer.
    async fn handle_invalid_request(&mut self, error: DecodeError, addr: SocketAddr) {
        if self.read_only {
            return;
        }

        if let DecodeError::InvalidArguments {
            transaction_id,
            field,
        } = error
        {
            log::debug!(
                "{}: Query from {addr:?} has an invalid `{}` argument",
                self.ip_version(),
                field
            );

            let message = Message::error(
                transaction_id,
                error_code::PROTOCOL_ERROR,
                format!("invalid argument: {}", field),
            );

            if let Err(error) = self.socket.send(&message, addr).await {
                log::debug!("{}: Failed to send error reply: {}", self.ip_version(), error);
            }
        }
    }

    async fn handle_incoming_response(
        &mut self,
        transaction_id: &[u8],
        version: Option<Vec<u8>>,
        compatible: bool,
        rsp: Response,
        addr: SocketAddr,
    ) -> Result<(), WorkerError> {
        let (trans_id, transaction) = self.take_transaction(transaction_id, addr)?;

        let node = NodeHandle::new(rsp.id, addr);

        if !self.bootstrap.is_router(&addr) && rsp.id != self.this_node_id {
            self.routing_table
                .handle_remote_response(node, version.as_deref());
        }

        let nodes = match self.ip_version() {
            IpVersion::V4 => &rsp.nodes_v4,
            IpVersion::V6 => &rsp.nodes_v6,
        };
        let nodes: Vec<_> = nodes
            .iter()
            .filter(|n| n.id != self.this_node_id && n.addr != self.socket.local_addr())
            .copied()
            .collect();

        self.routing_table.add_learned_nodes(&nodes);

        match (transaction.query_type(), transaction.owner) {
            (QueryType::Ping, _) => self.send_event(DhtEvent::NodePinged {
                id: rsp.id,
                addr,
                compatible,
            }),
            (QueryType::FindNode | QueryType::GetPeers, Owner::Lookup(id)) => {
                self.handle_lookup_response(id, trans_id, node, &rsp, &nodes)
                    .await
            }
            (QueryType::AnnouncePeer, Owner::Announce(id)) => {
                // The announce knows the node by the handle it was queried under.
                let queried = NodeHandle::new(
                    transaction.node_id.unwrap_or(rsp.id),
                    transaction.destination,
                );
                self.handle_announce_reply(id, queried, true).await
            }
            // Table refresh: updating the table is all there is to do.
            _ => (),
        }

        Ok(())
    }

    /// The pending query a response or error from `addr` answers. A reply from any other host
    /// than the one we asked leaves the query pending until its timeout.
    fn take_transaction(
        &mut self,
        transaction_id: &[u8],
        addr: SocketAddr,
    ) -> Result<(TransactionId, Transaction), WorkerError> {
        let trans_id =
            TransactionId::from_bytes(transaction_id).ok_or(WorkerError::InvalidTransactionId)?;
        let transaction = self
            .transactions
            .resolve_and_consume(transaction_id)
            .ok_or(WorkerError::UnsolicitedResponse)?;

        if transaction.destination.ip() != addr.ip() {
            self.transactions.record_query(transaction_id, transaction);
            return Err(WorkerError::UnsolicitedResponse);
        }

        self.timer.cancel_query_timeout(trans_id);

        Ok((trans_id, transaction))
    }

    async fn handle_lookup_response(
        &mut self,
        id: LookupId,
        trans_id: TransactionId,
        node: NodeHandle,
        rsp: &Response,
        nodes: &[NodeHandle],
    ) {
        let (peers, target) = match self.lookups.get_mut(&id) {
            Some(lookup) => (
                lookup.on_response(trans_id, node, rsp, nodes),
                lookup.target(),
            ),
            None => return,
        };

        for peer in peers {
            if self.is_own_endpoint(&peer) {
                continue;
            }

            if let Some(lookup) = self.lookups.get(&id) {
                lookup.sink().send_peer(peer);
            }

            self.send_event(DhtEvent::PeerFound {
                info_hash: target,
                addr: peer,
            });
        }

        self.drive_lookup(id).await;
    }

    async fn handle_query_timeout(&mut self, trans_id: TransactionId) {
        if let Some(transaction) = self
            .transactions
            .expire(trans_id, self.config.query_timeout)
        {
            log::trace!(
                "{}: {:?} query to {:?} timed out",
                self.ip_version(),
                transaction.query_type(),
                transaction.destination
            );

            self.handle_query_failure(trans_id, transaction, true).await;
        }
    }

    /// The query got an error reply, or no reply at all (`timed_out`).
    async fn handle_query_failure(
        &mut self,
        trans_id: TransactionId,
        transaction: Transaction,
        timed_out: bool,
    ) {
        if timed_out {
            if let Some(node) = self
                .routing_table
                .find_node_by_addr_mut(transaction.destination)
            {
                node.query_failed();
            }
        }

        match transaction.owner {
            Owner::Lookup(id) => {
                if let Some(lookup) = self.lookups.get_mut(&id) {
                    lookup.on_failure(trans_id);
                }
                self.drive_lookup(id).await;
            }
            Owner::Announce(id) => {
                if let Some(node_id) = transaction.node_id {
                    let node = NodeHandle::new(node_id, transaction.destination);
                    self.handle_announce_reply(id, node, false).await;
                }
            }
            Owner::Refresh | Owner::Ping => (),
        }
    }

    async fn send_query(
        &mut self,
        addr: SocketAddr,
        node_id: Option<NodeId>,
        request: Request,
        owner: Owner,
    ) -> io::Result<TransactionId> {
        let trans_id = self.transactions.next_transaction_id();
        let message = Message::request(trans_id.to_bytes().to_vec(), request);

        self.socket.send(&message, addr).await?;

        self.transactions.record_query(
            &trans_id.to_bytes(),
            Transaction {
                message,
                destination: addr,
                node_id,
                owner,
                issued: Instant::now(),
            },
        );
        self.timer.schedule_in(
            self.config.query_timeout,
            ScheduledTaskCheck::QueryTimeout(trans_id),
        );

        Ok(trans_id)
    }

    async fn handle_start_bootstrap(&mut self) {
        if self.bootstrap_lookup.is_some() {
            return;
        }

        if self.state != ConnectionState::Connected {
            self.set_state(ConnectionState::Connecting);
        }

        if !self.bootstrap.has_seeds() {
            log::debug!(
                "{}: Nothing to bootstrap from, starting a new network",
                self.ip_version()
            );
            self.bootstrap.complete_without_seeds();
            self.handle_bootstrap_success().await;
            return;
        }

        let seeds = self.bootstrap.start().await;
        let nodes = self
            .routing_table
            .closest_nodes(self.this_node_id, MAX_BUCKET_SIZE);

        let id = self.next_lookup_id();
        let lookup = Lookup::new(
            id,
            self.this_node_id,
            LookupKind::FindNode,
            false,
            self.config.lookup_concurrency,
            self.config.max_lookup_rounds,
            nodes,
            seeds,
            LookupSink::None,
        );

        self.bootstrap_lookup = Some(id);
        self.lookups.insert(id, lookup);
        self.drive_lookup(id).await;
    }

    fn handle_check_bootstrap(&mut self, tx: oneshot::Sender<bool>) {
        if self.bootstrap.state() == BootstrapState::Bootstrapped {
            tx.send(true).unwrap_or(())
        } else {
            self.bootstrap_txs.push(tx);
        }
    }

    async fn handle_bootstrap_lookup_completed(&mut self) {
        match self
            .bootstrap
            .on_lookup_completed(self.routing_table.num_good_nodes())
        {
            BootstrapOutcome::Completed => self.handle_bootstrap_success().await,
            BootstrapOutcome::Retry { failed } => {
                if failed {
                    log::warn!("{}: Bootstrap failed", self.ip_version());

                    self.send_event(DhtEvent::BootstrapFailed);

                    for tx in self.bootstrap_txs.drain(..) {
                        tx.send(false).unwrap_or(())
                    }

                    // Run what was waiting for the bootstrap with whatever we have.
                    self.start_future_lookups().await;
                }

                self.timer.schedule_in(
                    self.config.bootstrap_retry_interval,
                    ScheduledTaskCheck::BootstrapRetry,
                );
            }
        }
    }

    async fn handle_bootstrap_success(&mut self) {
        self.set_state(ConnectionState::Connected);
        self.send_event(DhtEvent::BootstrapCompleted);

        for tx in self.bootstrap_txs.drain(..) {
            tx.send(true).unwrap_or(())
        }

        if !self.refresh_started {
            self.refresh_started = true;
            self.handle_check_table_refresh().await;
        }

        self.start_future_lookups().await;
    }

    async fn start_future_lookups(&mut self) {
        for lookup in std::mem::take(&mut self.future_lookups) {
            self.start_lookup(lookup).await;
        }
    }

    async fn handle_start_lookup(&mut self, lookup: StartLookup) {
        // Queue the lookup while bootstrapping, the table has little to offer yet.
        if self.bootstrap_lookup.is_some() && self.bootstrap.state() == BootstrapState::Bootstrapping
        {
            self.future_lookups.push(lookup);
            return;
        }

        self.start_lookup(lookup).await
    }

    async fn start_lookup(&mut self, lookup: StartLookup) {
        let id = self.next_lookup_id();

        let nodes = self
            .routing_table
            .closest_nodes(lookup.target, MAX_BUCKET_SIZE);
        // With an empty table, go back to the seeds.
        let seeds = if nodes.is_empty() {
            self.bootstrap.seed_addrs()
        } else {
            Vec::new()
        };

        let table_lookup = Lookup::new(
            id,
            lookup.target,
            lookup.kind,
            lookup.announce,
            self.config.lookup_concurrency,
            self.config.max_lookup_rounds,
            nodes,
            seeds,
            lookup.sink,
        );

        self.lookups.insert(id, table_lookup);
        self.drive_lookup(id).await;
    }

    async fn handle_join_network(&mut self, tx: mpsc::UnboundedSender<SocketAddr>) {
        self.handle_start_lookup(StartLookup {
            target: self.this_node_id,
            kind: LookupKind::FindNode,
            announce: false,
            sink: LookupSink::None,
        })
        .await;

        if let Some(network_hash) = self.network_hash {
            self.last_network_announce = Some(Instant::now());
            self.handle_start_lookup(StartLookup {
                target: network_hash,
                kind: LookupKind::GetPeers,
                announce: true,
                sink: LookupSink::Peers(tx),
            })
            .await;
        } else {
            log::warn!(
                "{}: Joining without a network key, there is nothing to announce",
                self.ip_version()
            );
        }
    }

    async fn handle_ping(&mut self, addr: SocketAddr) {
        let request = Request::Ping(PingRequest {
            id: self.this_node_id,
        });

        if let Err(error) = self.send_query(addr, None, request, Owner::Ping).await {
            log::warn!("{}: Failed to ping {addr:?}: {}", self.ip_version(), error);
        }
    }

    /// Issue the queries of the lookup's next round, if it is time for one. A lookup that is
    /// done is queued for `wrap_up_completed_lookups`.
    async fn drive_lookup(&mut self, id: LookupId) {
        loop {
            let (step, request) = match self.lookups.get_mut(&id) {
                Some(lookup) => (lookup.step(), lookup.request(self.this_node_id)),
                None => return,
            };

            let targets = match step {
                LookupStep::Query(targets) => targets,
                LookupStep::Wait => return,
                LookupStep::Done => {
                    self.completed_lookups.push(id);
                    return;
                }
            };

            for (addr, node_id) in targets {
                let result = self
                    .send_query(addr, node_id, request.clone(), Owner::Lookup(id))
                    .await;

                if let Some(lookup) = self.lookups.get_mut(&id) {
                    match result {
                        Ok(trans_id) => lookup.query_sent(trans_id, node_id),
                        Err(error) => {
                            log::debug!(
                                "{}: Lookup failed to send a query to {addr:?}: {}",
                                self.socket.ip_version(),
                                error
                            );
                            lookup.send_failed(node_id);
                        }
                    }
                }
            }
            // If every send failed there is nothing to wait for, decide again.
        }
    }

    async fn wrap_up_completed_lookups(&mut self) {
        while let Some(id) = self.completed_lookups.pop() {
            self.handle_lookup_completed(id).await;
        }
    }

    async fn handle_lookup_completed(&mut self, id: LookupId) {
        let lookup = match self.lookups.remove(&id) {
            Some(lookup) => lookup,
            None => return,
        };

        log::debug!(
            "{}: Lookup {:?} for {:?} completed",
            self.ip_version(),
            lookup.kind(),
            lookup.target()
        );

        let LookupOutcome {
            target,
            kind,
            announce,
            closest,
            announce_targets,
            sink,
        } = lookup.finish();

        self.send_event(DhtEvent::LookupCompleted { target, kind });

        if self.bootstrap_lookup == Some(id) {
            self.bootstrap_lookup = None;
            self.handle_bootstrap_lookup_completed().await;
        }

        match sink {
            LookupSink::Nodes(tx) => tx.send(closest).unwrap_or(()),
            LookupSink::Peers(tx) if announce => {
                self.start_announce(id, target, announce_targets, Some(tx))
                    .await
            }
            LookupSink::None if announce => {
                self.start_announce(id, target, announce_targets, None)
                    .await
            }
            LookupSink::Peers(_) | LookupSink::None => (),
        }
    }

    async fn start_announce(
        &mut self,
        id: LookupId,
        info_hash: InfoHash,
        targets: Vec<(NodeHandle, Vec<u8>)>,
        tx: Option<mpsc::UnboundedSender<SocketAddr>>,
    ) {
        let port = self
            .announce_port
            .or_else(|| self.public_endpoint.map(|endpoint| endpoint.port()));

        self.announces
            .insert(id, Announce::new(info_hash, targets, port, tx));
        self.continue_announce(id).await;
    }

    async fn continue_announce(&mut self, id: LookupId) {
        loop {
            let picks = match self.announces.get_mut(&id) {
                Some(announce) => announce.pick_nodes(self.this_node_id),
                None => return,
            };

            if picks.is_empty() {
                break;
            }

            for (node, request) in picks {
                let result = self
                    .send_query(node.addr, Some(node.id), request, Owner::Announce(id))
                    .await;

                if let Some(announce) = self.announces.get_mut(&id) {
                    match result {
                        Ok(trans_id) => announce.query_sent(&node, trans_id),
                        Err(error) => {
                            log::debug!(
                                "{}: Failed to announce to {:?}: {}",
                                self.socket.ip_version(),
                                node.addr,
                                error
                            );
                            announce.on_reply(&node, false);
                        }
                    }
                }
            }
        }

        let completed = self
            .announces
            .get(&id)
            .map(|announce| announce.compute_status() == ActionStatus::Completed)
            .unwrap_or(false);

        if completed {
            self.handle_announce_completed(id);
        }
    }

    async fn handle_announce_reply(&mut self, id: LookupId, node: NodeHandle, is_success: bool) {
        let status = match self.announces.get_mut(&id) {
            Some(announce) => announce.on_reply(&node, is_success),
            None => return,
        };

        match status {
            ActionStatus::Ongoing => self.continue_announce(id).await,
            ActionStatus::Completed => self.handle_announce_completed(id),
        }
    }

    fn handle_announce_completed(&mut self, id: LookupId) {
        if let Some(announce) = self.announces.remove(&id) {
            log::debug!(
                "{}: Announced {:?} to {} nodes",
                self.ip_version(),
                announce.info_hash(),
                announce.accepted()
            );

            self.send_event(DhtEvent::Announced {
                info_hash: announce.info_hash(),
                accepted: announce.accepted(),
            });
        }
    }

    async fn handle_check_table_refresh(&mut self) {
        for (node, request) in self.refresh.continue_refresh(&self.routing_table) {
            if let Err(error) = self
                .send_query(node.addr, Some(node.id), request, Owner::Refresh)
                .await
            {
                log::error!(
                    "{}: TableRefresh failed to send a refresh message: {}",
                    self.ip_version(),
                    error
                );
            }
        }

        // Start a timer for the next refresh
        self.timer
            .schedule_in(self.config.refresh_interval, ScheduledTaskCheck::TableRefresh);
    }

    async fn handle_maintenance(&mut self) {
        let removed_nodes = self.routing_table.remove_stale(self.config.node_expiry);
        let removed_peers = self.active_stores.expire();

        // The timers take care of these, unless a timer entry got lost.
        let stale = self.transactions.expire_all(self.config.query_timeout * 2);
        for transaction in stale {
            if let Some(trans_id) = TransactionId::from_bytes(&transaction.message.transaction_id)
            {
                self.timer.cancel_query_timeout(trans_id);
                self.handle_query_failure(trans_id, transaction, true).await;
            }
        }

        log::debug!(
            "{}: Maintenance removed {} nodes and {} peers",
            self.ip_version(),
            removed_nodes,
            removed_peers
        );

        if self.routing_table.is_empty()
            && self.bootstrap.has_seeds()
            && self.bootstrap.state() == BootstrapState::Bootstrapped
        {
            log::info!(
                "{}: Routing table is empty, bootstrapping again",
                self.ip_version()
            );
            self.bootstrap.reset();
            self.set_state(ConnectionState::Connecting);
            self.handle_start_bootstrap().await;
        }

        if let (Some(network_hash), Some(last)) = (self.network_hash, self.last_network_announce) {
            if last.elapsed() >= self.config.announce_interval {
                self.last_network_announce = Some(Instant::now());
                self.handle_start_lookup(StartLookup {
                    target: network_hash,
                    kind: LookupKind::GetPeers,
                    announce: true,
                    sink: LookupSink::None,
                })
                .await;
            }
        }

        self.timer.schedule_in(
            self.config.maintenance_interval,
            ScheduledTaskCheck::Maintenance,
        );
    }

    fn handle_get_debug_state(&self, tx: oneshot::Sender<DebugState>) {
        tx.send(DebugState {
            is_running: self.running,
            state: self.state,
            good_node_count: self.routing_table.num_good_nodes(),
            questionable_node_count: self.routing_table.num_questionable_nodes(),
            bucket_count: self.routing_table.buckets().count(),
            pending_transactions: self.transactions.len(),
            active_lookups: self.lookups.len(),
            stored_info_hashes: self.active_stores.len(),
        })
        .unwrap_or(())
    }

    fn shutdown(&mut self) {
        self.running = false;
    }

    fn next_lookup_id(&mut self) -> LookupId {
        let id = LookupId(self.next_action_id);
        self.next_action_id += 1;
        id
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            log::debug!(
                "{}: State changed {:?} -> {:?}",
                self.ip_version(),
                self.state,
                state
            );
            self.state = state;
            self.send_event(DhtEvent::StateChanged(state));
        }
    }

    fn send_event(&self, event: DhtEvent) {
        // The application may have dropped the receiver, that's fine.
        self.event_tx.send(event).unwrap_or(())
    }

    fn is_own_endpoint(&self, addr: &SocketAddr) -> bool {
        *addr == self.socket.local_addr() || Some(*addr) == self.public_endpoint
    }

    /// Closest nodes to `target` in the families the requester wants, leaving out the
    /// requester itself.
    fn find_closest_nodes(
        &self,
        target: NodeId,
        want: Option<Want>,
        requester: SocketAddr,
    ) -> (Vec<NodeHandle>, Vec<NodeHandle>) {
        let want = match want {
            Some(want) => want,
            None => match self.ip_version() {
                IpVersion::V4 => Want::V4,
                IpVersion::V6 => Want::V6,
            },
        };

        let nodes_v4 = if matches!(want, Want::V4 | Want::Both) {
            self.routing_table
                .closest_nodes_where(target, MAX_BUCKET_SIZE, |node| {
                    node.addr.is_ipv4() && node.addr != requester
                })
        } else {
            vec![]
        };

        let nodes_v6 = if matches!(want, Want::V6 | Want::Both) {
            self.routing_table
                .closest_nodes_where(target, MAX_BUCKET_SIZE, |node| {
                    node.addr.is_ipv6() && node.addr != requester
                })
        } else {
            vec![]
        };

        (nodes_v4, nodes_v6)
    }
}
