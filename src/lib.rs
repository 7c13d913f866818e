//! Serverless peer discovery over the Bittorrent Mainline Distributed Hash Table ([BEP-5]).
//!
//! Peers of an application share a network key. Each of them joins the DHT, announces itself
//! under the SHA-1 of that key and looks up the others announced there:
//!
//! ```no_run
//! # async fn run() -> std::io::Result<()> {
//! use futures_util::StreamExt;
//! use peernet_dht::{router, MainlineDht};
//!
//! let (dht, _events) = MainlineDht::builder()
//!     .add_router(router::BITTORRENT_DHT.to_owned())
//!     .set_network_key("GEDKEEPER NETWORK")
//!     .bind(([0, 0, 0, 0], 0).into())
//!     .await?;
//!
//! let mut peers = dht.join_network();
//! while let Some(peer) = peers.next().await {
//!     println!("found peer {}", peer);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! [BEP-5]: http://bittorrent.org/beps/bep_0005.html

// Mainline DHT extensions supported on behalf of libtorrent:
// - Always send 'nodes' on a get_peers response even if 'values' is present
// - Unrecognized requests which contain either an 'info_hash' or 'target' arguments are interpreted as 'find_node'
// - Client identification will be present in all outgoing messages in the form of the 'v' key

pub mod bencode;
pub mod compact;
pub mod router;

mod action;
mod config;
mod handler;
mod id;
mod mainline_dht;
mod message;
mod routing;
mod socket;
mod storage;
#[cfg(test)]
mod test;
mod timer;
mod token;
mod transaction;

pub use crate::action::{ConnectionState, DebugState, DhtEvent, IpVersion, LookupKind};
pub use crate::config::DhtConfig;
pub use crate::id::{InfoHash, LengthError, NodeId, INFO_HASH_LEN, NODE_ID_LEN};
pub use crate::mainline_dht::{DhtBuilder, MainlineDht, SearchStream};
pub use crate::message::{MessageType, QueryType, CLIENT_VERSION};
pub use crate::routing::{NodeHandle, NodeStatus};

use async_trait::async_trait;
use std::{io, net::SocketAddr};

/// The datagram transport the DHT runs on. Implemented for `tokio::net::UdpSocket`; other
/// implementations let the DHT share a socket with other protocols or run over a simulated
/// network.
#[async_trait]
pub trait SocketTrait {
    async fn send_to(&self, buf: &[u8], target: &SocketAddr) -> io::Result<()>;
    async fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
    fn local_addr(&self) -> io::Result<SocketAddr>;
}
