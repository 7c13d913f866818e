use super::{
    bucket::{Bucket, MAX_BUCKET_SIZE},
    node::{Node, NodeHandle, NodeStatus},
};
use crate::id::{NodeId, ID_LEN};
use std::{cmp::Ordering, net::SocketAddr, time::Duration};

pub const MAX_BUCKETS: usize = ID_LEN * 8;

/// Routing table containing a table of routing nodes as well
/// as the id of the local node participating in the dht.
pub struct RoutingTable {
    // Important: Our node id will always fall within the range
    // of the last bucket in the buckets array.
    buckets: Vec<Bucket>,
    node_id: NodeId,
}

impl RoutingTable {
    /// Create a new RoutingTable with the given node id as our id.
    pub fn new(node_id: NodeId) -> RoutingTable {
        let buckets = vec![Bucket::new()];

        RoutingTable { buckets, node_id }
    }

    /// Return the node id of the RoutingTable.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// The `count` good or questionable nodes closest to `target`, ordered by XOR distance with
    /// ties broken by the lower id. Nodes for which `filter` returns false are skipped.
    pub fn closest_nodes_where<F>(&self, target: NodeId, count: usize, filter: F) -> Vec<NodeHandle>
    where
        F: Fn(&NodeHandle) -> bool,
    {
        let mut nodes: Vec<_> = self
            .buckets
            .iter()
            .flat_map(|bucket| bucket.pingable_nodes())
            .map(|node| *node.handle())
            .filter(|handle| filter(handle))
            .collect();

        nodes.sort_by(|a, b| cmp_handles(&target, a, b));
        nodes.truncate(count);
        nodes
    }

    pub fn closest_nodes(&self, target: NodeId, count: usize) -> Vec<NodeHandle> {
        self.closest_nodes_where(target, count, |_| true)
    }

    /// Number of good nodes in the RoutingTable.
    pub fn num_good_nodes(&self) -> usize {
        self.nodes()
            .filter(|n| n.status() == NodeStatus::Good)
            .count()
    }

    /// Number of questionable nodes in the RoutingTable.
    pub fn num_questionable_nodes(&self) -> usize {
        self.nodes()
            .filter(|n| n.status() == NodeStatus::Questionable)
            .count()
    }

    /// Number of nodes of any status.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(Bucket::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(Bucket::is_empty)
    }

    /// Iterator over all buckets in the routing table.
    pub fn buckets(&self) -> impl Iterator<Item = &Bucket> + ExactSizeIterator {
        self.buckets.iter()
    }

    /// Iterator over every node in the table, bad ones included.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.buckets.iter().flat_map(|bucket| bucket.iter())
    }

    /// Questionable nodes closest to `target`, used to refresh the table.
    pub fn questionable_nodes(&self, target: NodeId, count: usize) -> Vec<NodeHandle> {
        let mut nodes: Vec<_> = self
            .nodes()
            .filter(|n| n.status() == NodeStatus::Questionable)
            .map(|n| *n.handle())
            .collect();

        nodes.sort_by(|a, b| cmp_handles(&target, a, b));
        nodes.truncate(count);
        nodes
    }

    /// Find an instance of the target node in the RoutingTable, if it exists.
    pub fn find_node(&self, node: &NodeHandle) -> Option<&Node> {
        let bucket_index = self.bucket_index_for_node(node.id);
        let bucket = self.buckets.get(bucket_index)?;
        bucket.iter().find(|n| n.handle() == node)
    }

    /// Find a mutable reference to an instance of the target node in the RoutingTable, if it
    /// exists.
    pub fn find_node_mut<'a>(&'a mut self, node: &'_ NodeHandle) -> Option<&'a mut Node> {
        let bucket_index = self.bucket_index_for_node(node.id);
        let bucket = self.buckets.get_mut(bucket_index)?;
        bucket.iter_mut().find(|n| n.handle() == node)
    }

    /// Find the node reachable at `addr`. Used when a query to an address times out, since we
    /// may not know which id answers there.
    pub fn find_node_by_addr_mut(&mut self, addr: SocketAddr) -> Option<&mut Node> {
        self.buckets
            .iter_mut()
            .flat_map(|bucket| bucket.iter_mut())
            .find(|n| n.addr() == addr)
    }

    /// Record that `handle` sent us a query. Inserts it as a good node if unknown.
    pub fn handle_remote_request(&mut self, handle: NodeHandle, version: Option<&[u8]>) {
        if let Some(node) = self.find_node_mut(&handle) {
            node.remote_request();
            node.set_version(version);
            return;
        }

        let mut node = Node::as_good(handle.id, handle.addr);
        node.set_version(version);
        self.add_node(node);
    }

    /// Record that `handle` answered one of our queries. Inserts it as a good node if unknown.
    pub fn handle_remote_response(&mut self, handle: NodeHandle, version: Option<&[u8]>) {
        if let Some(node) = self.find_node_mut(&handle) {
            node.remote_response();
            node.set_version(version);
            return;
        }

        let mut node = Node::as_good(handle.id, handle.addr);
        node.set_version(version);
        self.add_node(node);
    }

    /// Add nodes another node told us about. Nodes we already know are left untouched.
    pub fn add_learned_nodes(&mut self, handles: &[NodeHandle]) {
        for handle in handles {
            if self.find_node(handle).is_none() {
                self.add_node(Node::as_questionable(handle.id, handle.addr));
            }
        }
    }

    /// Drop bad nodes and nodes that we have not heard from within `expiry`.
    ///
    /// Returns the number of removed nodes.
    pub fn remove_stale(&mut self, expiry: Duration) -> usize {
        self.buckets
            .iter_mut()
            .map(|bucket| {
                bucket.retain(|node| {
                    node.is_pingable() && node.last_seen().elapsed() < expiry
                })
            })
            .sum()
    }

    fn bucket_index_for_node(&self, node_id: NodeId) -> usize {
        bucket_placement(leading_bit_count(self.node_id, node_id), self.buckets.len())
    }

    /// Add the node to the RoutingTable if there is space for it.
    pub fn add_node(&mut self, node: Node) {
        if node.status() == NodeStatus::Bad {
            return;
        }
        let num_same_bits = leading_bit_count(self.node_id, node.id());

        // Should not add a node that has the same id as us
        if num_same_bits != MAX_BUCKETS {
            self.bucket_node(node, num_same_bits);
        }
    }

    /// Recursively tries to place the node into some bucket.
    fn bucket_node(&mut self, node: Node, num_same_bits: usize) {
        let bucket_index = bucket_placement(num_same_bits, self.buckets.len());

        // Try to place in correct bucket
        if !self.buckets[bucket_index].add_node(node.clone()) {
            // Bucket was full, try to split it
            if self.split_bucket(bucket_index) {
                // Bucket split successfully, try to add again
                self.bucket_node(node, num_same_bits);
            }
        }
    }

    /// Tries to split the bucket at the specified index.
    ///
    /// Returns false if the split cannot be performed.
    fn split_bucket(&mut self, bucket_index: usize) -> bool {
        if !can_split_bucket(self.buckets.len(), bucket_index) {
            return false;
        }

        let mut split_bucket = match self.buckets.pop() {
            Some(bucket) => bucket,
            None => return false,
        };

        // Push two more buckets to distribute nodes between
        self.buckets.push(Bucket::new());
        self.buckets.push(Bucket::new());

        for node in split_bucket.drain() {
            self.add_node(node);
        }

        true
    }
}

fn cmp_handles(target: &NodeId, a: &NodeHandle, b: &NodeHandle) -> Ordering {
    target
        .cmp_distance(&a.id, &b.id)
        .then_with(|| a.addr.cmp(&b.addr))
}

/// Returns true if the bucket can be split.
fn can_split_bucket(num_buckets: usize, bucket_index: usize) -> bool {
    bucket_index == num_buckets - 1 && bucket_index != MAX_BUCKETS - 1
}

/// Number of leading bits that are identical between the local and remote node ids.
pub fn leading_bit_count(local_node: NodeId, remote_node: NodeId) -> usize {
    (local_node ^ remote_node).leading_zeros() as usize
}

/// Take the number of leading bits that are the same between our node and the remote
/// node and calculate a bucket index for that node id.
fn bucket_placement(num_same_bits: usize, num_buckets: usize) -> usize {
    // The index that the node should be placed in *eventually*, meaning
    // when we create enough buckets for that bucket to appear.
    num_same_bits.min(num_buckets - 1)
}
