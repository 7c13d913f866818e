use crate::id::{NodeId, NODE_ID_LEN};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

pub fn dummy_socket_addr_v4() -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 0))
}

/// Addresses on localhost with consecutive ports, starting at 1.
pub fn dummy_block_socket_addrs(num_addrs: u16) -> Vec<SocketAddr> {
    (1..=num_addrs)
        .map(|port| SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), port)))
        .collect()
}

pub fn dummy_node_id() -> NodeId {
    NodeId::from([0u8; NODE_ID_LEN]).flip_bit(0)
}

/// Ids made of a single repeated byte, from 1 up to `num_ids`. None of them is all zeros.
pub fn dummy_block_node_ids(num_ids: u8) -> Vec<NodeId> {
    (1..=num_ids)
        .map(|byte| NodeId::from([byte; NODE_ID_LEN]))
        .collect()
}
