//! The actions the DHT carries out on behalf of the handler: lookups, announces, bootstrap and
//! table refresh. Each is a state machine; the handler owns the socket and does the I/O.

pub(crate) use self::{
    announce::Announce,
    bootstrap::{BootstrapOutcome, State as BootstrapState, TableBootstrap},
    lookup::{Lookup, LookupOutcome, LookupStep},
    refresh::TableRefresh,
};
use crate::{
    id::{InfoHash, NodeId},
    routing::NodeHandle,
    transaction::TransactionId,
};
use std::{collections::HashSet, fmt, io, net::SocketAddr};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

mod announce;
mod bootstrap;
mod lookup;
mod refresh;

#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum IpVersion {
    V4,
    V6,
}

impl fmt::Display for IpVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::V4 => write!(f, "IPv4"),
            Self::V6 => write!(f, "IPv6"),
        }
    }
}

/// Whether the DHT is part of the network.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not started, or shut down.
    Disconnected,
    /// Bootstrapping.
    Connecting,
    /// The routing table holds at least one good node (or there was nobody to bootstrap from).
    Connected,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LookupKind {
    FindNode,
    GetPeers,
}

/// Notifications delivered to the application through the event receiver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DhtEvent {
    StateChanged(ConnectionState),
    BootstrapCompleted,
    /// Several bootstrap attempts in a row found nobody. The DHT keeps trying.
    BootstrapFailed,
    /// A node answered our ping, or pinged us. `compatible` tells whether it runs a client
    /// of the same family as ours.
    NodePinged {
        id: NodeId,
        addr: SocketAddr,
        compatible: bool,
    },
    /// A peer of `info_hash` was found by a lookup or announced itself to us.
    PeerFound { info_hash: InfoHash, addr: SocketAddr },
    LookupCompleted { target: NodeId, kind: LookupKind },
    /// An announce finished, `accepted` nodes stored us.
    Announced { info_hash: InfoHash, accepted: usize },
}

#[derive(Copy, Clone, Debug)]
pub struct DebugState {
    pub is_running: bool,
    pub state: ConnectionState,
    pub good_node_count: usize,
    pub questionable_node_count: usize,
    pub bucket_count: usize,
    pub pending_transactions: usize,
    pub active_lookups: usize,
    pub stored_info_hashes: usize,
}

/// Where the results of a lookup go.
pub(crate) enum LookupSink {
    /// Every newly found peer is sent as soon as it arrives. Closed when the lookup (and the
    /// announce that follows it, if any) is done.
    Peers(mpsc::UnboundedSender<SocketAddr>),
    /// The closest responding nodes, once the lookup finished.
    Nodes(oneshot::Sender<Vec<NodeHandle>>),
    None,
}

impl LookupSink {
    pub fn send_peer(&self, addr: SocketAddr) {
        if let Self::Peers(tx) = self {
            tx.send(addr).unwrap_or(())
        }
    }
}

/// Task that our DHT will execute immediately.
pub(crate) enum OneshotTask {
    /// Start (or restart) the bootstrap.
    StartBootstrap,
    /// Check bootstrap status. The given sender will be notified when the bootstrap completed
    /// (`true`) or failed (`false`).
    CheckBootstrap(oneshot::Sender<bool>),
    /// Start a lookup.
    StartLookup(StartLookup),
    /// Find nodes close to our id and look up (and announce to) the network info hash.
    JoinNetwork(mpsc::UnboundedSender<SocketAddr>),
    /// Ping a node. The outcome is reported as a `NodePinged` event.
    Ping(SocketAddr),
    GetState(oneshot::Sender<ConnectionState>),
    /// Get the local address the socket is bound to.
    GetLocalAddr(oneshot::Sender<SocketAddr>),
    /// Retrieve debug information.
    GetDebugState(oneshot::Sender<DebugState>),
    /// All nodes of the routing table.
    GetNodes(oneshot::Sender<Vec<NodeHandle>>),
    /// Peers announced to us for the info hash.
    GetStoredPeers(InfoHash, oneshot::Sender<Vec<SocketAddr>>),
    Shutdown,
}

pub(crate) struct StartLookup {
    pub target: NodeId,
    pub kind: LookupKind,
    pub announce: bool,
    pub sink: LookupSink,
}

/// Task that our DHT will execute some time later.
#[derive(Copy, Clone, Debug)]
pub(crate) enum ScheduledTaskCheck {
    /// The query with this id should have been answered by now.
    QueryTimeout(TransactionId),
    /// Refresh the next bucket of the routing table.
    TableRefresh,
    /// Expire nodes, peers and transactions. Re-announce.
    Maintenance,
    /// Start the next bootstrap attempt.
    BootstrapRetry,
}

#[derive(Error, Debug)]
pub(crate) enum WorkerError {
    #[error("invalid transaction id")]
    InvalidTransactionId,
    #[error("received unsolicited response")]
    UnsolicitedResponse,
    #[error("socket error")]
    SocketError(#[from] io::Error),
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ActionStatus {
    /// Action is in progress
    Ongoing,
    /// Action completed
    Completed,
}

pub(crate) async fn resolve(routers: &HashSet<String>, ip_v: IpVersion) -> HashSet<SocketAddr> {
    futures_util::future::join_all(routers.iter().map(tokio::net::lookup_host))
        .await
        .into_iter()
        .filter_map(|result| result.ok())
        .flatten()
        .filter(|addr| match ip_v {
            IpVersion::V4 => addr.is_ipv4(),
            IpVersion::V6 => addr.is_ipv6(),
        })
        .collect()
}
