//! Iterative `find_node` / `get_peers` lookup.
//!
//! The lookup proceeds in rounds. Each round queries up to `concurrency` of the closest
//! candidates not yet queried. When a round ends without discovering a node closer to the target
//! than the best one known at its start, one last round queries every remaining candidate among
//! the `MAX_BUCKET_SIZE` closest, then the lookup ends. It also ends after `max_rounds`.

use super::{LookupKind, LookupSink};
use crate::{
    id::NodeId,
    message::{FindNodeRequest, GetPeersRequest, Request, Response},
    routing::{NodeHandle, MAX_BUCKET_SIZE},
    transaction::{LookupId, TransactionId},
};
use std::{
    cmp::Ordering,
    collections::{HashMap, HashSet},
    net::SocketAddr,
};

/// Upper bound on the candidates a lookup remembers.
const MAX_CANDIDATES: usize = 64;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum CandidateState {
    Fresh,
    Queried,
    Responded,
    Failed,
}

struct Candidate {
    handle: NodeHandle,
    state: CandidateState,
    token: Option<Vec<u8>>,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum LookupStep {
    /// Send the lookup query to these destinations. The id is unknown for seed addresses.
    Query(Vec<(SocketAddr, Option<NodeId>)>),
    /// Queries are in flight.
    Wait,
    Done,
}

/// What a finished lookup produced.
pub(crate) struct LookupOutcome {
    pub target: NodeId,
    pub kind: LookupKind,
    pub announce: bool,
    /// Closest nodes that answered, closest first.
    pub closest: Vec<NodeHandle>,
    /// Closest nodes that answered with a token, closest first.
    pub announce_targets: Vec<(NodeHandle, Vec<u8>)>,
    pub sink: LookupSink,
}

pub(crate) struct Lookup {
    id: LookupId,
    target: NodeId,
    kind: LookupKind,
    announce: bool,
    concurrency: usize,
    max_rounds: usize,
    // Sorted by distance to the target, ties broken by the lower id.
    candidates: Vec<Candidate>,
    seeds: Vec<SocketAddr>,
    pending: HashMap<TransactionId, Option<NodeId>>,
    rounds: usize,
    round_start_best: Option<NodeId>,
    final_round: bool,
    done: bool,
    found_peers: HashSet<SocketAddr>,
    sink: LookupSink,
}

impl Lookup {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: LookupId,
        target: NodeId,
        kind: LookupKind,
        announce: bool,
        concurrency: usize,
        max_rounds: usize,
        nodes: Vec<NodeHandle>,
        seeds: Vec<SocketAddr>,
        sink: LookupSink,
    ) -> Self {
        let mut lookup = Self {
            id,
            target,
            kind,
            announce,
            concurrency: concurrency.max(1),
            max_rounds,
            candidates: Vec::new(),
            seeds,
            pending: HashMap::new(),
            rounds: 0,
            round_start_best: None,
            final_round: false,
            done: false,
            found_peers: HashSet::new(),
            sink,
        };

        lookup.add_candidates(&nodes);
        lookup
    }

    pub fn target(&self) -> NodeId {
        self.target
    }

    pub fn kind(&self) -> LookupKind {
        self.kind
    }

    #[cfg(test)]
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// The query this lookup sends, on behalf of `own_id`.
    pub fn request(&self, own_id: NodeId) -> Request {
        match self.kind {
            LookupKind::FindNode => Request::FindNode(FindNodeRequest {
                id: own_id,
                target: self.target,
                want: None,
            }),
            LookupKind::GetPeers => Request::GetPeers(GetPeersRequest {
                id: own_id,
                info_hash: self.target,
                want: None,
            }),
        }
    }

    /// Decide what to do next. Only starts a new round once all queries of the current one
    /// were answered or failed.
    pub fn step(&mut self) -> LookupStep {
        if self.done {
            return LookupStep::Done;
        }

        if !self.pending.is_empty() {
            return LookupStep::Wait;
        }

        if self.rounds == 0 && !self.seeds.is_empty() {
            self.rounds += 1;
            self.round_start_best = self.best();

            let seeds = std::mem::take(&mut self.seeds);
            let mut targets: Vec<_> = seeds.into_iter().map(|addr| (addr, None)).collect();
            targets.extend(self.pick(self.concurrency).into_iter().map(|h| (h.addr, Some(h.id))));

            return LookupStep::Query(targets);
        }

        if self.rounds > 0 {
            if self.improved() {
                self.final_round = false;
            } else if self.final_round {
                return self.finish_step();
            } else {
                self.final_round = true;
            }
        }

        if self.rounds >= self.max_rounds {
            return self.finish_step();
        }

        let count = if self.final_round {
            MAX_BUCKET_SIZE
        } else {
            self.concurrency
        };
        let picks = self.pick(count);

        if picks.is_empty() {
            return self.finish_step();
        }

        self.rounds += 1;
        self.round_start_best = self.best();

        LookupStep::Query(picks.into_iter().map(|h| (h.addr, Some(h.id))).collect())
    }

    /// A query of this lookup went out under `transaction_id`.
    pub fn query_sent(&mut self, transaction_id: TransactionId, node_id: Option<NodeId>) {
        self.pending.insert(transaction_id, node_id);
    }

    /// The query to `node_id` could not even be sent.
    pub fn send_failed(&mut self, node_id: Option<NodeId>) {
        if let Some(node_id) = node_id {
            self.set_state(&node_id, CandidateState::Failed);
        }
    }

    /// Handle a response. Returns the peers in it that this lookup had not seen before.
    pub fn on_response(
        &mut self,
        transaction_id: TransactionId,
        from: NodeHandle,
        response: &Response,
        nodes: &[NodeHandle],
    ) -> Vec<SocketAddr> {
        if self.pending.remove(&transaction_id).is_none() {
            log::debug!("Lookup {:?} got a response for an unknown transaction", self.id);
            return Vec::new();
        }

        // Seeds answer with their id, make them candidates like everyone else.
        self.add_candidates(&[from]);

        if let Some(candidate) = self.find_mut(&from.id) {
            candidate.state = CandidateState::Responded;
            candidate.token = response.token.clone();
        }

        self.add_candidates(nodes);

        let mut new_peers = Vec::new();
        if self.kind == LookupKind::GetPeers {
            for peer in &response.values {
                if self.found_peers.insert(*peer) {
                    new_peers.push(*peer);
                }
            }
        }

        new_peers
    }

    /// The query sent under `transaction_id` timed out or was answered with an error.
    pub fn on_failure(&mut self, transaction_id: TransactionId) {
        if let Some(node_id) = self.pending.remove(&transaction_id).flatten() {
            self.set_state(&node_id, CandidateState::Failed);
        }
    }

    /// Consume the lookup into its outcome.
    pub fn finish(self) -> LookupOutcome {
        let responded: Vec<_> = self
            .candidates
            .iter()
            .filter(|c| c.state == CandidateState::Responded)
            .take(MAX_BUCKET_SIZE)
            .collect();

        let announce_targets = self
            .candidates
            .iter()
            .filter(|c| c.state == CandidateState::Responded)
            .filter_map(|c| c.token.clone().map(|token| (c.handle, token)))
            .take(MAX_BUCKET_SIZE * 2)
            .collect();

        LookupOutcome {
            target: self.target,
            kind: self.kind,
            announce: self.announce,
            closest: responded.iter().map(|c| c.handle).collect(),
            announce_targets,
            sink: self.sink,
        }
    }

    pub fn sink(&self) -> &LookupSink {
        &self.sink
    }

    fn finish_step(&mut self) -> LookupStep {
        self.done = true;
        LookupStep::Done
    }

    fn improved(&self) -> bool {
        match (self.round_start_best, self.best()) {
            (None, Some(_)) => true,
            (Some(before), Some(now)) => self.target.cmp_distance(&now, &before) == Ordering::Less,
            (_, None) => false,
        }
    }

    /// Closest candidate that hasn't failed.
    fn best(&self) -> Option<NodeId> {
        self.candidates
            .iter()
            .find(|c| c.state != CandidateState::Failed)
            .map(|c| c.handle.id)
    }

    /// Mark up to `count` fresh candidates among the closest live ones as queried.
    fn pick(&mut self, count: usize) -> Vec<NodeHandle> {
        let picks: Vec<_> = self
            .candidates
            .iter_mut()
            .filter(|c| c.state != CandidateState::Failed)
            .take(MAX_BUCKET_SIZE)
            .filter(|c| c.state == CandidateState::Fresh)
            .take(count)
            .map(|c| {
                c.state = CandidateState::Queried;
                c.handle
            })
            .collect();

        picks
    }

    fn add_candidates(&mut self, nodes: &[NodeHandle]) {
        for node in nodes {
            let target = self.target;
            let position = self
                .candidates
                .binary_search_by(|c| target.cmp_distance(&c.handle.id, &node.id));

            if let Err(index) = position {
                if index < MAX_CANDIDATES {
                    self.candidates.insert(
                        index,
                        Candidate {
                            handle: *node,
                            state: CandidateState::Fresh,
                            token: None,
                        },
                    );
                    self.candidates.truncate(MAX_CANDIDATES);
                }
            }
        }
    }

    fn find_mut(&mut self, id: &NodeId) -> Option<&mut Candidate> {
        self.candidates.iter_mut().find(|c| c.handle.id == *id)
    }

    fn set_state(&mut self, id: &NodeId, state: CandidateState) {
        if let Some(candidate) = self.find_mut(id) {
            candidate.state = state;
        }
    }
}
