//! Peers announced to us by other nodes, keyed by info hash.

use crate::id::InfoHash;
use std::{collections::HashMap, net::SocketAddr, time::Duration};
use tokio::time::Instant;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum AddOutcome {
    /// The peer was not stored before.
    Inserted,
    /// The peer was already stored, its announcement time was renewed.
    Refreshed,
    /// No room for another peer, under this info hash or in total.
    Full,
}

struct AnnouncedPeer {
    addr: SocketAddr,
    announced_at: Instant,
}

pub(crate) struct AnnounceStorage {
    peers: HashMap<InfoHash, Vec<AnnouncedPeer>>,
    // Peers stored across all info hashes.
    num_items: usize,
    max_per_hash: usize,
    max_items: usize,
    ttl: Duration,
}

impl AnnounceStorage {
    pub fn new(max_per_hash: usize, max_items: usize, ttl: Duration) -> Self {
        Self {
            peers: HashMap::new(),
            num_items: 0,
            max_per_hash,
            max_items,
            ttl,
        }
    }

    /// Store (or renew) `addr` as a peer of `info_hash`. Expired peers of that hash are dropped
    /// first so they don't count towards the limits. A new peer is refused when either its info
    /// hash or the whole storage is at capacity.
    pub fn add_item(&mut self, info_hash: InfoHash, addr: SocketAddr) -> AddOutcome {
        let ttl = self.ttl;
        let now = Instant::now();

        if let Some(peers) = self.peers.get_mut(&info_hash) {
            let before = peers.len();
            peers.retain(|p| now.duration_since(p.announced_at) < ttl);
            self.num_items -= before - peers.len();

            if let Some(peer) = peers.iter_mut().find(|p| p.addr == addr) {
                peer.announced_at = now;
                return AddOutcome::Refreshed;
            }

            if peers.len() >= self.max_per_hash {
                return AddOutcome::Full;
            }
        }

        if self.num_items >= self.max_items {
            self.expire();

            if self.num_items >= self.max_items {
                return AddOutcome::Full;
            }
        }

        self.peers.entry(info_hash).or_default().push(AnnouncedPeer {
            addr,
            announced_at: now,
        });
        self.num_items += 1;

        AddOutcome::Inserted
    }

    /// Live peers of `info_hash`, oldest announcement first.
    pub fn find_items<'a>(
        &'a self,
        info_hash: &InfoHash,
    ) -> impl Iterator<Item = SocketAddr> + 'a {
        let ttl = self.ttl;
        let now = Instant::now();

        self.peers
            .get(info_hash)
            .into_iter()
            .flatten()
            .filter(move |p| now.duration_since(p.announced_at) < ttl)
            .map(|p| p.addr)
    }

    /// Drop all expired peers. Returns the number of dropped peers.
    pub fn expire(&mut self) -> usize {
        let ttl = self.ttl;
        let now = Instant::now();
        let mut removed = 0;

        self.peers.retain(|_, peers| {
            let before = peers.len();
            peers.retain(|p| now.duration_since(p.announced_at) < ttl);
            removed += before - peers.len();
            !peers.is_empty()
        });

        self.num_items -= removed;
        removed
    }

    /// Number of info hashes with at least one stored peer.
    pub fn len(&self) -> usize {
        self.peers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test;

    #[tokio::test]
    async fn add_and_refresh() {
        let mut storage = AnnounceStorage::new(8, 1024, Duration::from_secs(60));
        let info_hash = test::dummy_node_id();
        let addr = test::dummy_socket_addr_v4();

        assert_eq!(storage.add_item(info_hash, addr), AddOutcome::Inserted);
        assert_eq!(storage.add_item(info_hash, addr), AddOutcome::Refreshed);
        assert_eq!(storage.find_items(&info_hash).collect::<Vec<_>>(), vec![addr]);
        assert_eq!(storage.find_items(&InfoHash::random()).count(), 0);
    }

    #[tokio::test]
    async fn full_hash_rejects_new_peers() {
        let mut storage = AnnounceStorage::new(2, 1024, Duration::from_secs(60));
        let info_hash = test::dummy_node_id();
        let addrs = test::dummy_block_socket_addrs(3);

        assert_eq!(storage.add_item(info_hash, addrs[0]), AddOutcome::Inserted);
        assert_eq!(storage.add_item(info_hash, addrs[1]), AddOutcome::Inserted);
        assert_eq!(storage.add_item(info_hash, addrs[2]), AddOutcome::Full);
        // Known peers can still be refreshed
        assert_eq!(storage.add_item(info_hash, addrs[0]), AddOutcome::Refreshed);
    }

    #[tokio::test(start_paused = true)]
    async fn peers_expire_after_ttl() {
        let ttl = Duration::from_secs(30 * 60);
        let mut storage = AnnounceStorage::new(8, 1024, ttl);
        let info_hash = test::dummy_node_id();
        let addrs = test::dummy_block_socket_addrs(2);

        storage.add_item(info_hash, addrs[0]);
        tokio::time::advance(ttl / 2).await;
        storage.add_item(info_hash, addrs[1]);
        tokio::time::advance(ttl / 2).await;

        assert_eq!(storage.find_items(&info_hash).collect::<Vec<_>>(), vec![addrs[1]]);
        assert_eq!(storage.expire(), 1);

        tokio::time::advance(ttl).await;
        assert_eq!(storage.expire(), 1);
        assert_eq!(storage.len(), 0);
    }

    #[tokio::test]
    async fn total_capacity_is_shared_by_all_info_hashes() {
        let mut storage = AnnounceStorage::new(8, 4, Duration::from_secs(60));
        let addr = test::dummy_socket_addr_v4();
        let info_hashes = test::dummy_block_node_ids(5);

        for info_hash in &info_hashes[..4] {
            assert_eq!(storage.add_item(*info_hash, addr), AddOutcome::Inserted);
        }

        assert_eq!(storage.add_item(info_hashes[4], addr), AddOutcome::Full);
        assert_eq!(storage.len(), 4);
        assert_eq!(storage.find_items(&info_hashes[4]).count(), 0);

        // Refreshing what is already stored needs no room.
        assert_eq!(storage.add_item(info_hashes[0], addr), AddOutcome::Refreshed);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_peers_make_room() {
        let ttl = Duration::from_secs(60);
        let mut storage = AnnounceStorage::new(8, 2, ttl);
        let addr = test::dummy_socket_addr_v4();
        let info_hashes = test::dummy_block_node_ids(3);

        storage.add_item(info_hashes[0], addr);
        storage.add_item(info_hashes[1], addr);
        assert_eq!(storage.add_item(info_hashes[2], addr), AddOutcome::Full);

        tokio::time::advance(ttl).await;

        assert_eq!(storage.add_item(info_hashes[2], addr), AddOutcome::Inserted);
        assert_eq!(storage.len(), 1);
    }
}
