use crate::{
    id::NodeId,
    message::{FindNodeRequest, Request},
    routing::{NodeHandle, RoutingTable, MAX_BUCKETS},
};

const REFRESH_CONCURRENCY: usize = 4;

/// Keeps the routing table fresh: each tick sends `find_node` for a target in the next bucket
/// to the closest questionable nodes, which either proves them alive or gets them marked bad.
pub(crate) struct TableRefresh {
    curr_refresh_bucket: usize,
}

impl TableRefresh {
    pub fn new() -> TableRefresh {
        TableRefresh {
            curr_refresh_bucket: 0,
        }
    }

    /// Nodes to query for this tick, with the query to send them.
    pub fn continue_refresh(&mut self, table: &RoutingTable) -> Vec<(NodeHandle, Request)> {
        if self.curr_refresh_bucket == MAX_BUCKETS {
            self.curr_refresh_bucket = 0;
        }

        let this_node_id = table.node_id();
        let target_id = this_node_id.flip_bit(self.curr_refresh_bucket);
        let nodes_to_contact = table.questionable_nodes(target_id, REFRESH_CONCURRENCY);

        log::debug!(
            "Performing a refresh for bucket {} (table total: num_good_nodes={}, num_questionable_nodes={})",
            self.curr_refresh_bucket,
            table.num_good_nodes(),
            table.num_questionable_nodes(),
        );

        self.curr_refresh_bucket += 1;

        nodes_to_contact
            .into_iter()
            .map(|node| (node, find_node(this_node_id, target_id)))
            .collect()
    }
}

fn find_node(id: NodeId, target: NodeId) -> Request {
    Request::FindNode(FindNodeRequest {
        id,
        target,
        want: None,
    })
}
