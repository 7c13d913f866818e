//! Public bootstrap routers of the Mainline DHT.
//!
//! Routers answer `find_node` but are never put in the routing table.

pub const BITTORRENT_DHT: &str = "router.bittorrent.com:6881";
pub const UTORRENT_DHT: &str = "router.utorrent.com:6881";
pub const TRANSMISSION_DHT: &str = "dht.transmissionbt.com:6881";
pub const LIBTORRENT_DHT: &str = "dht.libtorrent.org:25401";

/// The routers used when the application doesn't bring its own.
pub const DEFAULT_ROUTERS: &[&str] = &[BITTORRENT_DHT, TRANSMISSION_DHT, LIBTORRENT_DHT];
