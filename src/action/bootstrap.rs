use super::{resolve, IpVersion};
use std::{collections::HashSet, net::SocketAddr};

/// After this many bootstrap attempts that left the table without good nodes the bootstrap is
/// reported as failed. Attempts continue afterwards.
pub(crate) const MAX_BOOTSTRAP_ATTEMPTS: usize = 3;

#[derive(Eq, PartialEq, Copy, Clone, Debug)]
pub(crate) enum State {
    AwaitStart,
    Bootstrapping,
    Bootstrapped,
    // After a failed attempt, until the retry timer fires.
    IdleBeforeRebootstrap,
}

#[derive(Eq, PartialEq, Copy, Clone, Debug)]
pub(crate) enum BootstrapOutcome {
    Completed,
    /// Retry later. `failed` is set exactly once, when the attempts run out.
    Retry { failed: bool },
}

/// Joins the routing table to the network through the routers and nodes given at startup.
///
/// The actual work is a `find_node` lookup towards our own id seeded with these contacts; this
/// type keeps track of the seeds, attempts and state around it.
pub(crate) struct TableBootstrap {
    ip_version: IpVersion,
    routers: HashSet<String>,
    starting_nodes: HashSet<SocketAddr>,
    // Resolved router addresses. Routers are only used as seeds, never put into the table.
    router_addrs: HashSet<SocketAddr>,
    attempts: usize,
    state: State,
}

impl TableBootstrap {
    pub fn new(
        ip_version: IpVersion,
        routers: HashSet<String>,
        starting_nodes: HashSet<SocketAddr>,
    ) -> TableBootstrap {
        TableBootstrap {
            ip_version,
            routers,
            starting_nodes,
            router_addrs: HashSet::new(),
            attempts: 0,
            state: State::AwaitStart,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Whether there is anyone to bootstrap from. Without seeds the node is the first one of
    /// its network and counts as bootstrapped right away.
    pub fn has_seeds(&self) -> bool {
        !self.routers.is_empty() || !self.starting_nodes.is_empty()
    }

    pub fn is_router(&self, addr: &SocketAddr) -> bool {
        self.router_addrs.contains(addr)
    }

    /// Begin an attempt. Resolves the routers (again, their addresses may change) and returns
    /// the addresses to seed the lookup with.
    pub async fn start(&mut self) -> Vec<SocketAddr> {
        self.state = State::Bootstrapping;

        let resolved = resolve(&self.routers, self.ip_version).await;
        if resolved.is_empty() && !self.routers.is_empty() {
            log::warn!("{}: Failed to resolve any bootstrap router", self.ip_version);
        }
        // Keep the old addresses if resolving failed this time.
        if !resolved.is_empty() {
            self.router_addrs = resolved;
        }

        self.seed_addrs()
    }

    /// Routers (as last resolved) and starting nodes of our address family.
    pub fn seed_addrs(&self) -> Vec<SocketAddr> {
        let mut seeds: Vec<_> = self
            .router_addrs
            .iter()
            .chain(self.starting_nodes.iter())
            .copied()
            .filter(|addr| match self.ip_version {
                IpVersion::V4 => addr.is_ipv4(),
                IpVersion::V6 => addr.is_ipv6(),
            })
            .collect();
        seeds.sort();
        seeds.dedup();
        seeds
    }

    /// The bootstrap lookup has finished, leaving `num_good_nodes` good nodes in the table.
    pub fn on_lookup_completed(&mut self, num_good_nodes: usize) -> BootstrapOutcome {
        if num_good_nodes > 0 {
            log::debug!(
                "{}: Bootstrap completed with {} good nodes",
                self.ip_version,
                num_good_nodes
            );
            self.attempts = 0;
            self.state = State::Bootstrapped;
            return BootstrapOutcome::Completed;
        }

        self.attempts += 1;
        self.state = State::IdleBeforeRebootstrap;

        log::debug!(
            "{}: Bootstrap attempt {} found no nodes",
            self.ip_version,
            self.attempts
        );

        BootstrapOutcome::Retry {
            failed: self.attempts == MAX_BOOTSTRAP_ATTEMPTS,
        }
    }

    /// The bootstrap is no longer valid (the table ran empty).
    pub fn reset(&mut self) {
        self.state = State::AwaitStart;
    }

    /// Bootstrap immediately, with nothing to contact.
    pub fn complete_without_seeds(&mut self) {
        self.state = State::Bootstrapped;
    }
}
