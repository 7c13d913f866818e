//! Correlation of outgoing queries with the responses, errors and timeouts they produce.
//!
//! Every query we send gets a 2-byte transaction id. Responses don't say which query they
//! answer, so the only way to know what a response is for is to look up the query that was
//! recorded under its transaction id.

use crate::{
    id::NodeId,
    message::{Message, QueryType},
};
use std::{
    collections::HashMap,
    convert::TryInto,
    fmt,
    net::SocketAddr,
    sync::atomic::{AtomicU16, Ordering},
    time::Duration,
};
use tokio::time::Instant;

pub const TRANSACTION_ID_LEN: usize = 2;

#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct TransactionId(u16);

impl TransactionId {
    pub fn to_bytes(self) -> [u8; TRANSACTION_ID_LEN] {
        self.0.to_be_bytes()
    }

    /// Interpret a wire transaction id. Ids we didn't generate may have any length, those are
    /// not ours and yield `None`.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        Some(Self(u16::from_be_bytes(bytes.try_into().ok()?)))
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:04x}", self.0)
    }
}

/// Identifies an in-progress lookup.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub(crate) struct LookupId(pub u64);

/// What the query was sent for, so the response can be routed to it.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) enum Owner {
    Lookup(LookupId),
    Refresh,
    Announce(LookupId),
    Ping,
}

pub(crate) struct Transaction {
    pub message: Message,
    pub destination: SocketAddr,
    /// Id of the queried node, when we know it.
    pub node_id: Option<NodeId>,
    pub owner: Owner,
    pub issued: Instant,
}

impl Transaction {
    pub fn query_type(&self) -> QueryType {
        self.message.query_type()
    }
}

/// Owned by a single DHT instance: every instance has its own id counter.
pub(crate) struct TransactionManager {
    next_id: AtomicU16,
    pending: HashMap<TransactionId, Transaction>,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self {
            // Random start so ids don't repeat across restarts on the same address.
            next_id: AtomicU16::new(rand::random()),
            pending: HashMap::new(),
        }
    }

    /// Next id, wrapping around after 65535. Unique only among the last 65536 ids, which is
    /// plenty given how short lived transactions are.
    pub fn next_transaction_id(&self) -> TransactionId {
        TransactionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Remember an outgoing query. Ids that are not exactly two bytes are ignored.
    pub fn record_query(&mut self, transaction_id: &[u8], transaction: Transaction) {
        match TransactionId::from_bytes(transaction_id) {
            Some(id) => {
                self.pending.insert(id, transaction);
            }
            None => log::debug!(
                "Not recording query with invalid transaction id {:?}",
                transaction_id
            ),
        }
    }

    /// Take the query recorded under `transaction_id`. A second call for the same id (a
    /// duplicate or late response) returns `None`.
    pub fn resolve_and_consume(&mut self, transaction_id: &[u8]) -> Option<Transaction> {
        let id = TransactionId::from_bytes(transaction_id)?;
        self.pending.remove(&id)
    }

    /// Like `resolve_and_consume` but only reports the query type.
    pub fn resolve_query_type(&mut self, transaction_id: &[u8]) -> QueryType {
        self.resolve_and_consume(transaction_id)
            .map(|transaction| transaction.query_type())
            .unwrap_or(QueryType::None)
    }

    /// Remove the transaction if it has been pending for at least `timeout`. A transaction
    /// that was replaced by a newer one with the same id (after a wrap around) is kept.
    pub fn expire(&mut self, id: TransactionId, timeout: Duration) -> Option<Transaction> {
        let overdue = self
            .pending
            .get(&id)
            .map(|transaction| transaction.issued.elapsed() >= timeout)?;

        if overdue {
            self.pending.remove(&id)
        } else {
            None
        }
    }

    /// Remove every transaction pending for at least `timeout`.
    pub fn expire_all(&mut self, timeout: Duration) -> Vec<Transaction> {
        let expired: Vec<_> = self
            .pending
            .iter()
            .filter(|(_, transaction)| transaction.issued.elapsed() >= timeout)
            .map(|(id, _)| *id)
            .collect();

        expired
            .into_iter()
            .filter_map(|id| self.pending.remove(&id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }
}
