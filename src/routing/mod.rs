//! Kademlia routing table: nodes grouped into k-buckets by the length of the id prefix they
//! share with the local node.

pub(crate) use self::{
    bucket::MAX_BUCKET_SIZE,
    table::{RoutingTable, MAX_BUCKETS},
};
pub use self::node::{Node, NodeHandle, NodeStatus};

mod bucket;
mod node;
mod table;
