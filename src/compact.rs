//! Compact representation of nodes and peers, as used in `nodes`, `nodes6` and `values`.
//!
//! A compact peer is an IP address followed by a big-endian port (6 bytes for IPv4, 18 for
//! IPv6). A compact node is the 20-byte node id followed by a compact peer.

use crate::{
    bencode::Value,
    id::{NodeId, NODE_ID_LEN},
    routing::NodeHandle,
};
use std::{
    convert::{TryFrom, TryInto},
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
};
use thiserror::Error;

pub const SOCKET_ADDR_V4_LEN: usize = 6;
pub const SOCKET_ADDR_V6_LEN: usize = 18;
pub const NODE_HANDLE_V4_LEN: usize = NODE_ID_LEN + SOCKET_ADDR_V4_LEN;
pub const NODE_HANDLE_V6_LEN: usize = NODE_ID_LEN + SOCKET_ADDR_V6_LEN;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CompactError {
    #[error("compact node list length {0} is not a multiple of {1}")]
    NodeListLength(usize, usize),
    #[error("compact peer has invalid length {0}")]
    PeerLength(usize),
    #[error("compact peer list contains a non byte string")]
    PeerType,
}

/// Encode the IPv4 nodes of `nodes`, 26 bytes each, in order. IPv6 nodes are skipped.
pub fn encode_nodes_v4(nodes: &[NodeHandle]) -> Vec<u8> {
    encode_nodes(nodes.iter().filter(|node| node.addr.is_ipv4()), NODE_HANDLE_V4_LEN)
}

/// Encode the IPv6 nodes of `nodes`, 38 bytes each, in order. IPv4 nodes are skipped.
pub fn encode_nodes_v6(nodes: &[NodeHandle]) -> Vec<u8> {
    encode_nodes(nodes.iter().filter(|node| node.addr.is_ipv6()), NODE_HANDLE_V6_LEN)
}

fn encode_nodes<'a, I>(nodes: I, record_len: usize) -> Vec<u8>
where
    I: Iterator<Item = &'a NodeHandle>,
{
    let mut buffer = Vec::with_capacity(nodes.size_hint().0 * record_len);

    for node in nodes {
        buffer.extend_from_slice(node.id.as_ref());
        buffer.extend(encode_socket_addr(&node.addr));
    }

    buffer
}

pub fn decode_nodes_v4(bytes: &[u8]) -> Result<Vec<NodeHandle>, CompactError> {
    decode_nodes(bytes, NODE_HANDLE_V4_LEN)
}

pub fn decode_nodes_v6(bytes: &[u8]) -> Result<Vec<NodeHandle>, CompactError> {
    decode_nodes(bytes, NODE_HANDLE_V6_LEN)
}

fn decode_nodes(bytes: &[u8], record_len: usize) -> Result<Vec<NodeHandle>, CompactError> {
    let chunks = bytes.chunks_exact(record_len);

    if !chunks.remainder().is_empty() {
        return Err(CompactError::NodeListLength(bytes.len(), record_len));
    }

    let nodes = chunks
        .filter_map(|chunk| {
            let id = NodeId::try_from(&chunk[..NODE_ID_LEN]).ok()?;
            let addr = decode_socket_addr(&chunk[NODE_ID_LEN..])?;

            Some(NodeHandle { id, addr })
        })
        .collect();

    Ok(nodes)
}

/// Encode peers as a bencode list of compact peer strings.
pub fn encode_values(addrs: &[SocketAddr]) -> Value {
    Value::List(
        addrs
            .iter()
            .map(|addr| Value::Bytes(encode_socket_addr(addr)))
            .collect(),
    )
}

pub fn decode_values(values: &[Value]) -> Result<Vec<SocketAddr>, CompactError> {
    values
        .iter()
        .map(|value| {
            let bytes = value.as_bytes().ok_or(CompactError::PeerType)?;
            decode_socket_addr(bytes).ok_or(CompactError::PeerLength(bytes.len()))
        })
        .collect()
}

pub fn decode_socket_addr(src: &[u8]) -> Option<SocketAddr> {
    if src.len() == SOCKET_ADDR_V4_LEN {
        let addr: [u8; 4] = src.get(..4)?.try_into().ok()?;
        let addr = Ipv4Addr::from(addr);
        let port = u16::from_be_bytes(src.get(4..)?.try_into().ok()?);
        Some((addr, port).into())
    } else if src.len() == SOCKET_ADDR_V6_LEN {
        let addr: [u8; 16] = src.get(..16)?.try_into().ok()?;
        let addr = Ipv6Addr::from(addr);
        let port = u16::from_be_bytes(src.get(16..)?.try_into().ok()?);
        Some((addr, port).into())
    } else {
        None
    }
}

pub fn encode_socket_addr(addr: &SocketAddr) -> Vec<u8> {
    let mut buffer = match addr {
        SocketAddr::V4(addr) => {
            let mut buffer = Vec::with_capacity(SOCKET_ADDR_V4_LEN);
            buffer.extend_from_slice(&addr.ip().octets());
            buffer
        }
        SocketAddr::V6(addr) => {
            let mut buffer = Vec::with_capacity(SOCKET_ADDR_V6_LEN);
            buffer.extend_from_slice(&addr.ip().octets());
            buffer
        }
    };

    buffer.extend_from_slice(&addr.port().to_be_bytes());
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test;

    #[test]
    fn encode_decode_values() {
        let addrs: Vec<SocketAddr> = vec![
            (Ipv4Addr::new(127, 0, 0, 1), 6789).into(),
            (
                Ipv6Addr::new(0x2001, 0x0db8, 0x85a3, 0, 0, 0x8a2e, 0x0370, 0x7334),
                1234,
            )
                .into(),
        ];

        let encoded = encode_values(&addrs);
        assert_eq!(
            encoded.encode(),
            [
                &b"l6:"[..],
                &[127, 0, 0, 1, 26, 133],
                b"18:",
                &[
                    0x20, 0x01, 0x0d, 0xb8, 0x85, 0xa3, 0x00, 0x00, 0x00, 0x00, 0x8a, 0x2e, 0x03,
                    0x70, 0x73, 0x34, 4, 210
                ],
                b"e",
            ]
            .concat()
        );

        assert_eq!(decode_values(encoded.as_list().unwrap()).unwrap(), addrs);
    }

    #[test]
    fn decode_values_rejects_bad_peers() {
        assert_eq!(
            decode_values(&[Value::Bytes(vec![1, 2, 3])]),
            Err(CompactError::PeerLength(3))
        );
        assert_eq!(
            decode_values(&[Value::Integer(1)]),
            Err(CompactError::PeerType)
        );
    }

    #[test]
    fn encode_node_v4_layout() {
        let node = NodeHandle {
            id: NodeId::from(*b"0123456789abcdefghij"),
            addr: (Ipv4Addr::new(127, 0, 0, 1), 6789).into(),
        };

        let encoded = encode_nodes_v4(&[node]);
        assert_eq!(encoded.len(), NODE_HANDLE_V4_LEN);
        assert_eq!(&encoded[..20], b"0123456789abcdefghij");
        assert_eq!(&encoded[20..], &[127, 0, 0, 1, 26, 133]);
    }

    #[test]
    fn nodes_v4_keep_count_and_order() {
        let ids = test::dummy_block_node_ids(5);
        let addrs = test::dummy_block_socket_addrs(5);
        let nodes: Vec<_> = ids
            .into_iter()
            .zip(addrs)
            .map(|(id, addr)| NodeHandle { id, addr })
            .collect();

        let encoded = encode_nodes_v4(&nodes);
        assert_eq!(encoded.len(), 5 * NODE_HANDLE_V4_LEN);
        assert_eq!(decode_nodes_v4(&encoded).unwrap(), nodes);
    }

    #[test]
    fn nodes_v4_skip_v6_entries() {
        let v4 = NodeHandle {
            id: NodeId::from([1; NODE_ID_LEN]),
            addr: test::dummy_socket_addr_v4(),
        };
        let v6 = NodeHandle {
            id: NodeId::from([2; NODE_ID_LEN]),
            addr: (Ipv6Addr::LOCALHOST, 6881).into(),
        };

        assert_eq!(decode_nodes_v4(&encode_nodes_v4(&[v4, v6])).unwrap(), vec![v4]);
        assert_eq!(decode_nodes_v6(&encode_nodes_v6(&[v4, v6])).unwrap(), vec![v6]);
    }

    #[test]
    fn decode_nodes_rejects_partial_record() {
        assert_eq!(
            decode_nodes_v4(&[0u8; 27]),
            Err(CompactError::NodeListLength(27, NODE_HANDLE_V4_LEN))
        );
        assert_eq!(decode_nodes_v4(&[]).unwrap(), vec![]);
    }
}
