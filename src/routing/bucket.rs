use super::node::{Node, NodeStatus};
use std::slice::Iter;

/// Maximum number of nodes that should reside in any bucket.
pub const MAX_BUCKET_SIZE: usize = 8;

/// Bucket containing Nodes with identical bit prefixes.
pub struct Bucket {
    nodes: Vec<Node>,
}

impl Bucket {
    pub fn new() -> Bucket {
        Bucket {
            nodes: Vec::with_capacity(MAX_BUCKET_SIZE),
        }
    }

    /// Iterator over all good nodes and questionable nodes in the bucket.
    pub fn pingable_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|node| node.is_pingable())
    }

    /// Iterator over each node within the bucket, bad ones included.
    pub fn iter(&self) -> Iter<Node> {
        self.nodes.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Node> {
        self.nodes.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Attempt to add the given Node to the bucket if it is not in a bad state.
    ///
    /// Returns false if the Node could not be placed in the bucket because it is full.
    pub fn add_node(&mut self, new_node: Node) -> bool {
        let new_node_status = new_node.status();
        if new_node_status == NodeStatus::Bad {
            return true;
        }

        // A node with the same id that moved to a new address is treated as the same node.
        if let Some(index) = self.nodes.iter().position(|node| node.id() == new_node.id()) {
            if self.nodes[index].addr() == new_node.addr() {
                // Merge instead of replacing, so we don't lose what we already know about it.
                self.nodes[index].update(new_node);
            } else {
                self.nodes[index] = new_node;
            }

            return true;
        }

        if self.nodes.len() < MAX_BUCKET_SIZE {
            self.nodes.push(new_node);
            return true;
        }

        // Only replace strictly worse nodes: with equal status we prefer the long lasting ones,
        // which helps with stability. Bad nodes go first, then stale (questionable) ones.
        let replace_index = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| node.status() < new_node_status)
            .min_by_key(|(_, node)| (node.status(), node.last_seen()))
            .map(|(index, _)| index);

        if let Some(index) = replace_index {
            self.nodes[index] = new_node;
            true
        } else {
            false
        }
    }

    /// Drop the nodes for which `f` returns false. Returns the number of removed nodes.
    pub fn retain<F>(&mut self, f: F) -> usize
    where
        F: FnMut(&Node) -> bool,
    {
        let before = self.nodes.len();
        self.nodes.retain(f);
        before - self.nodes.len()
    }

    /// Take all the nodes out of the bucket.
    pub(super) fn drain(&mut self) -> Vec<Node> {
        std::mem::take(&mut self.nodes)
    }

    /// Iterator over all good nodes in the bucket.
    #[cfg(test)]
    fn good_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes
            .iter()
            .filter(|node| node.status() == NodeStatus::Good)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test;

    #[test]
    fn positive_initial_no_nodes() {
        let bucket = Bucket::new();

        assert_eq!(bucket.good_nodes().count(), 0);
        assert_eq!(bucket.pingable_nodes().count(), 0);
    }

    #[test]
    fn positive_all_questionable_nodes() {
        let mut bucket = Bucket::new();

        let dummy_addr = test::dummy_socket_addr_v4();
        let dummy_ids = test::dummy_block_node_ids(MAX_BUCKET_SIZE as u8);
        for id in dummy_ids {
            bucket.add_node(Node::as_questionable(id, dummy_addr));
        }

        assert_eq!(bucket.good_nodes().count(), 0);
        assert_eq!(bucket.pingable_nodes().count(), MAX_BUCKET_SIZE);
    }

    #[test]
    fn positive_replace_questionable_node() {
        let mut bucket = Bucket::new();

        let dummy_addr = test::dummy_socket_addr_v4();
        let dummy_ids = test::dummy_block_node_ids(MAX_BUCKET_SIZE as u8 + 1);
        for id in &dummy_ids[..MAX_BUCKET_SIZE] {
            bucket.add_node(Node::as_questionable(*id, dummy_addr));
        }

        let good_node = Node::as_good(dummy_ids[MAX_BUCKET_SIZE], dummy_addr);
        assert!(bucket.add_node(good_node.clone()));

        assert_eq!(bucket.good_nodes().next().unwrap(), &good_node);
        assert_eq!(bucket.len(), MAX_BUCKET_SIZE);
    }

    #[test]
    fn positive_refresh_existing_node() {
        let mut bucket = Bucket::new();

        let dummy_addr = test::dummy_socket_addr_v4();
        let id = test::dummy_node_id();
        bucket.add_node(Node::as_questionable(id, dummy_addr));
        bucket.add_node(Node::as_good(id, dummy_addr));

        assert_eq!(bucket.len(), 1);
        assert_eq!(bucket.good_nodes().count(), 1);
    }

    #[test]
    fn positive_resist_good_node_churn() {
        let mut bucket = Bucket::new();

        let dummy_addr = test::dummy_socket_addr_v4();
        let dummy_ids = test::dummy_block_node_ids(MAX_BUCKET_SIZE as u8 + 1);
        for id in &dummy_ids[..MAX_BUCKET_SIZE] {
            bucket.add_node(Node::as_good(*id, dummy_addr));
        }

        let new_good_node = Node::as_good(dummy_ids[MAX_BUCKET_SIZE], dummy_addr);

        assert!(!bucket.add_node(new_good_node.clone()));
        assert!(!bucket.iter().any(|node| &new_good_node == node));
    }

    #[test]
    fn positive_replace_bad_node_first() {
        let mut bucket = Bucket::new();

        let dummy_addr = test::dummy_socket_addr_v4();
        let dummy_ids = test::dummy_block_node_ids(MAX_BUCKET_SIZE as u8 + 1);
        for id in &dummy_ids[..MAX_BUCKET_SIZE] {
            bucket.add_node(Node::as_questionable(*id, dummy_addr));
        }

        let bad_id = dummy_ids[3];
        for node in bucket.iter_mut().filter(|node| node.id() == bad_id) {
            node.query_failed();
            node.query_failed();
        }

        bucket.add_node(Node::as_questionable(dummy_ids[MAX_BUCKET_SIZE], dummy_addr));

        assert!(!bucket.iter().any(|node| node.id() == bad_id));
        assert_eq!(bucket.pingable_nodes().count(), MAX_BUCKET_SIZE);
    }
}
