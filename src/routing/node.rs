use crate::id::NodeId;
use std::{
    fmt::{self, Debug, Formatter},
    hash::{Hash, Hasher},
    net::SocketAddr,
    time::Duration,
};
use tokio::time::Instant;

/// Time after the last contact at which a node stops being good.
const MAX_LAST_SEEN: Duration = Duration::from_secs(15 * 60);

/// Number of consecutive unanswered (or failed) queries after which a node becomes bad.
const MAX_FAILED_QUERIES: usize = 2;

/// Status of the node.
/// Ordering of the enumerations is important, variants higher
/// up are considered to be less than those further down.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Ord, PartialOrd)]
pub enum NodeStatus {
    Bad,
    Questionable,
    Good,
}

/// Node participating in the dht.
#[derive(Clone)]
pub struct Node {
    handle: NodeHandle,
    version: Option<Vec<u8>>,
    first_seen: Instant,
    last_update: Option<Instant>,
    failed_queries: usize,
}

impl Node {
    /// Create a node we have just heard from directly.
    pub fn as_good(id: NodeId, addr: SocketAddr) -> Node {
        let now = Instant::now();

        Node {
            handle: NodeHandle { id, addr },
            version: None,
            first_seen: now,
            last_update: Some(now),
            failed_queries: 0,
        }
    }

    /// Create a node another node told us about but which we have never talked to.
    pub fn as_questionable(id: NodeId, addr: SocketAddr) -> Node {
        Node {
            handle: NodeHandle { id, addr },
            version: None,
            first_seen: Instant::now(),
            last_update: None,
            failed_queries: 0,
        }
    }

    /// Record that the node sent us a query.
    pub fn remote_request(&mut self) {
        self.last_update = Some(Instant::now());
    }

    /// Record that the node answered one of our queries.
    pub fn remote_response(&mut self) {
        self.last_update = Some(Instant::now());
        self.failed_queries = 0;
    }

    /// Record that a query to the node timed out or was answered with an error.
    pub fn query_failed(&mut self) {
        self.failed_queries = self.failed_queries.saturating_add(1);
    }

    pub fn set_version(&mut self, version: Option<&[u8]>) {
        if let Some(version) = version {
            self.version = Some(version.to_vec());
        }
    }

    /// Merge what we know about the same node from `other` into `self`.
    pub(crate) fn update(&mut self, other: Node) {
        if other.last_update > self.last_update {
            self.last_update = other.last_update;
            self.failed_queries = other.failed_queries;
        }

        if other.version.is_some() {
            self.version = other.version;
        }
    }

    pub fn id(&self) -> NodeId {
        self.handle.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.handle.addr
    }

    pub fn handle(&self) -> &NodeHandle {
        &self.handle
    }

    pub fn version(&self) -> Option<&[u8]> {
        self.version.as_deref()
    }

    pub fn last_update(&self) -> Option<Instant> {
        self.last_update
    }

    /// Time of the last contact, or of the moment we learned about the node if there was none.
    pub fn last_seen(&self) -> Instant {
        self.last_update.unwrap_or(self.first_seen)
    }

    /// Current status of the node.
    pub fn status(&self) -> NodeStatus {
        if self.failed_queries >= MAX_FAILED_QUERIES {
            return NodeStatus::Bad;
        }

        match self.last_update {
            Some(time) if time.elapsed() < MAX_LAST_SEEN => NodeStatus::Good,
            _ => NodeStatus::Questionable,
        }
    }

    /// Is node good or questionable?
    pub fn is_pingable(&self) -> bool {
        self.status() != NodeStatus::Bad
    }
}

impl Eq for Node {}

impl PartialEq<Node> for Node {
    fn eq(&self, other: &Node) -> bool {
        self.handle == other.handle
    }
}

impl Hash for Node {
    fn hash<H>(&self, state: &mut H)
    where
        H: Hasher,
    {
        self.handle.hash(state);
    }
}

impl Debug for Node {
    fn fmt(&self, f: &mut Formatter) -> Result<(), fmt::Error> {
        f.debug_struct("Node")
            .field("id", &self.handle.id)
            .field("addr", &self.handle.addr)
            .field("last_update", &self.last_update)
            .field("failed_queries", &self.failed_queries)
            .finish()
    }
}

/// Node id + its socket address.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct NodeHandle {
    pub id: NodeId,
    pub addr: SocketAddr,
}

impl NodeHandle {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self { id, addr }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test;

    #[test]
    fn positive_as_questionable() {
        let node = Node::as_questionable(test::dummy_node_id(), test::dummy_socket_addr_v4());

        assert_eq!(node.status(), NodeStatus::Questionable);
        assert!(node.is_pingable());
        assert_eq!(node.last_update(), None);
    }

    #[test]
    fn positive_as_good() {
        let node = Node::as_good(test::dummy_node_id(), test::dummy_socket_addr_v4());

        assert_eq!(node.status(), NodeStatus::Good);
    }

    #[test]
    fn positive_response_renewal() {
        let mut node = Node::as_questionable(test::dummy_node_id(), test::dummy_socket_addr_v4());

        node.remote_response();

        assert_eq!(node.status(), NodeStatus::Good);
    }

    #[test]
    fn positive_request_renewal() {
        let mut node = Node::as_questionable(test::dummy_node_id(), test::dummy_socket_addr_v4());

        node.remote_request();

        assert_eq!(node.status(), NodeStatus::Good);
    }

    #[test]
    fn positive_node_idle() {
        let mut node = Node::as_good(test::dummy_node_id(), test::dummy_socket_addr_v4());

        node.last_update = Instant::now().checked_sub(MAX_LAST_SEEN);

        assert_eq!(node.status(), NodeStatus::Questionable);
    }

    #[test]
    fn positive_failed_queries_make_node_bad() {
        let mut node = Node::as_good(test::dummy_node_id(), test::dummy_socket_addr_v4());

        for _ in 0..MAX_FAILED_QUERIES {
            node.query_failed();
        }

        assert_eq!(node.status(), NodeStatus::Bad);
        assert!(!node.is_pingable());

        node.remote_response();
        assert_eq!(node.status(), NodeStatus::Good);
    }

    #[test]
    fn positive_update_keeps_newest_contact() {
        let id = test::dummy_node_id();
        let addr = test::dummy_socket_addr_v4();

        let mut known = Node::as_good(id, addr);
        known.set_version(Some(b"PN01"));

        known.update(Node::as_questionable(id, addr));

        assert_eq!(known.status(), NodeStatus::Good);
        assert_eq!(known.version(), Some(&b"PN01"[..]));
    }

    #[test]
    fn positive_status_ordering() {
        assert!(NodeStatus::Good > NodeStatus::Questionable);
        assert!(NodeStatus::Questionable > NodeStatus::Bad);
    }
}
