use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables of a DHT instance.
///
/// Every field has a default, so a deserialized config only needs to name what it changes.
/// Durations are (de)serialized as milliseconds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DhtConfig {
    /// How long to wait for the response to a query.
    #[serde(with = "duration_ms")]
    pub query_timeout: Duration,
    /// Number of queries a lookup keeps in flight (alpha).
    pub lookup_concurrency: usize,
    /// Maximum number of request rounds of a lookup.
    pub max_lookup_rounds: usize,
    #[serde(with = "duration_ms")]
    pub refresh_interval: Duration,
    #[serde(with = "duration_ms")]
    pub maintenance_interval: Duration,
    /// How often the network info hash is announced again after joining.
    #[serde(with = "duration_ms")]
    pub announce_interval: Duration,
    /// Nodes we haven't heard from for this long are removed from the routing table.
    #[serde(with = "duration_ms")]
    pub node_expiry: Duration,
    /// How long announced peers are kept.
    #[serde(with = "duration_ms")]
    pub peer_ttl: Duration,
    pub max_peers_per_hash: usize,
    /// Limit on the peers stored across all info hashes.
    pub max_stored_peers: usize,
    #[serde(with = "duration_ms")]
    pub bootstrap_retry_interval: Duration,
    /// Reject `announce_peer` queries whose token we didn't issue.
    pub validate_tokens: bool,
    /// Key of the application network. Its SHA-1 is the info hash peers announce under.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_key: Option<String>,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            query_timeout: Duration::from_secs(2),
            lookup_concurrency: 3,
            max_lookup_rounds: 8,
            refresh_interval: Duration::from_secs(6),
            maintenance_interval: Duration::from_secs(60),
            announce_interval: Duration::from_secs(15 * 60),
            node_expiry: Duration::from_secs(60 * 60),
            peer_ttl: Duration::from_secs(30 * 60),
            max_peers_per_hash: 256,
            max_stored_peers: 16 * 1024,
            bootstrap_retry_interval: Duration::from_secs(10),
            validate_tokens: true,
            network_key: None,
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::{convert::TryFrom, time::Duration};

    pub(super) fn serialize<S: Serializer>(duration: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
