use super::ActionStatus;
use crate::{
    id::InfoHash,
    message::{AnnouncePeerRequest, Request},
    routing::NodeHandle,
    transaction::TransactionId,
    NodeId,
};
use std::net::SocketAddr;
use tokio::sync::mpsc;

const ANNOUNCE_PICK_NUM: usize = 8; // # Announces

type Token = Vec<u8>;

/// Sends `announce_peer` to the closest nodes that handed us a token during the preceding
/// `get_peers` lookup. Nodes that fail are replaced by the next closest unused ones.
pub(crate) struct Announce {
    info_hash: InfoHash,
    port: Option<u16>,
    // Sorted by proximity to the info hash.
    sorted_nodes: Vec<(NodeHandle, Token, NodeStatus)>,
    // We don't send anything through `tx` here, but its destruction ends the search stream that
    // started this announce.
    _tx: Option<mpsc::UnboundedSender<SocketAddr>>,
}

#[derive(PartialEq, Eq, Copy, Clone, Debug)]
enum NodeStatus {
    Unused,
    // Picked, the query is not sent yet.
    Picked,
    Pending(TransactionId),
    Success,
    Failure,
}

impl Announce {
    pub fn new(
        info_hash: InfoHash,
        sorted_nodes: Vec<(NodeHandle, Token)>,
        port: Option<u16>,
        tx: Option<mpsc::UnboundedSender<SocketAddr>>,
    ) -> Self {
        let sorted_nodes = sorted_nodes
            .into_iter()
            .map(|(handle, token)| (handle, token, NodeStatus::Unused))
            .collect();

        Self {
            info_hash,
            port,
            sorted_nodes,
            _tx: tx,
        }
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    /// Pick the next nodes to announce to, so that successful and pending announces add up to
    /// `ANNOUNCE_PICK_NUM`. Each pick must be followed by `query_sent` or `on_reply(.., false)`.
    pub fn pick_nodes(&mut self, own_id: NodeId) -> Vec<(NodeHandle, Request)> {
        let active = self.count(|s| {
            matches!(
                s,
                NodeStatus::Picked | NodeStatus::Pending(_) | NodeStatus::Success
            )
        });
        let wanted = ANNOUNCE_PICK_NUM.saturating_sub(active);

        let info_hash = self.info_hash;
        let port = self.port;

        self.sorted_nodes
            .iter_mut()
            .filter(|(_, _, status)| *status == NodeStatus::Unused)
            .take(wanted)
            .map(|(node, token, status)| {
                *status = NodeStatus::Picked;

                let request = Request::AnnouncePeer(AnnouncePeerRequest {
                    id: own_id,
                    info_hash,
                    port,
                    token: token.clone(),
                });

                (*node, request)
            })
            .collect()
    }

    pub fn query_sent(&mut self, node: &NodeHandle, transaction_id: TransactionId) {
        if let Some(status) = self.status_mut(node) {
            *status = NodeStatus::Pending(transaction_id);
        }
    }

    /// Record the outcome of the announce to `node`: a response, or an error, a timeout or a
    /// failed send.
    pub fn on_reply(&mut self, node: &NodeHandle, is_success: bool) -> ActionStatus {
        if let Some(status) = self.status_mut(node) {
            *status = if is_success {
                NodeStatus::Success
            } else {
                NodeStatus::Failure
            };
        }

        self.compute_status()
    }

    /// Number of nodes that accepted the announce.
    pub fn accepted(&self) -> usize {
        self.count(|s| *s == NodeStatus::Success)
    }

    pub fn compute_status(&self) -> ActionStatus {
        let in_flight = self.count(|s| matches!(s, NodeStatus::Picked | NodeStatus::Pending(_)));

        if in_flight > 0 {
            return ActionStatus::Ongoing;
        }

        if self.accepted() >= ANNOUNCE_PICK_NUM || self.count(|s| *s == NodeStatus::Unused) == 0 {
            ActionStatus::Completed
        } else {
            // Failed nodes left room for unused ones, the caller picks again.
            ActionStatus::Ongoing
        }
    }

    fn count(&self, pred: impl Fn(&NodeStatus) -> bool) -> usize {
        self.sorted_nodes
            .iter()
            .filter(|(_, _, status)| pred(status))
            .count()
    }

    fn status_mut(&mut self, node: &NodeHandle) -> Option<&mut NodeStatus> {
        self.sorted_nodes
            .iter_mut()
            .find(|(handle, _, _)| handle == node)
            .map(|(_, _, status)| status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test;

    fn announce(count: u8) -> (Announce, Vec<NodeHandle>) {
        let ids = test::dummy_block_node_ids(count);
        let addrs = test::dummy_block_socket_addrs(u16::from(count));
        let nodes: Vec<_> = ids
            .into_iter()
            .zip(addrs)
            .map(|(id, addr)| NodeHandle::new(id, addr))
            .collect();

        let announce = Announce::new(
            test::dummy_node_id(),
            nodes.iter().map(|n| (*n, b"tokn".to_vec())).collect(),
            Some(6881),
            None,
        );

        (announce, nodes)
    }

    fn tid(n: u16) -> TransactionId {
        TransactionId::from_bytes(&n.to_be_bytes()).unwrap()
    }

    #[test]
    fn picks_at_most_eight_closest() {
        let (mut announce, nodes) = announce(10);

        let picks = announce.pick_nodes(test::dummy_node_id());

        assert_eq!(picks.len(), ANNOUNCE_PICK_NUM);
        assert_eq!(picks[0].0, nodes[0]);

        match &picks[0].1 {
            Request::AnnouncePeer(request) => {
                assert_eq!(request.port, Some(6881));
                assert_eq!(request.token, b"tokn");
            }
            request => panic!("unexpected request {:?}", request),
        }
    }

    #[test]
    fn failures_are_replaced_by_unused_nodes() {
        let (mut announce, nodes) = announce(10);

        let picks = announce.pick_nodes(test::dummy_node_id());
        for (i, (node, _)) in picks.iter().enumerate() {
            announce.query_sent(node, tid(i as u16));
        }

        assert_eq!(announce.on_reply(&nodes[0], false), ActionStatus::Ongoing);

        let more = announce.pick_nodes(test::dummy_node_id());
        assert_eq!(more.len(), 1);
        assert_eq!(more[0].0, nodes[8]);
    }

    #[test]
    fn completes_when_everything_answered() {
        let (mut announce, nodes) = announce(3);

        for (node, _) in announce.pick_nodes(test::dummy_node_id()) {
            announce.query_sent(&node, tid(0));
        }

        assert_eq!(announce.on_reply(&nodes[0], true), ActionStatus::Ongoing);
        assert_eq!(announce.on_reply(&nodes[1], false), ActionStatus::Ongoing);
        assert_eq!(announce.on_reply(&nodes[2], true), ActionStatus::Completed);
        assert_eq!(announce.accepted(), 2);
    }

    #[test]
    fn no_nodes_is_complete() {
        let mut announce = Announce::new(test::dummy_node_id(), Vec::new(), None, None);

        assert!(announce.pick_nodes(test::dummy_node_id()).is_empty());
        assert_eq!(announce.compute_status(), ActionStatus::Completed);
    }
}
