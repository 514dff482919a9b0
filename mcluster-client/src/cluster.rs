//! # Cluster Membership
//!
//! Purpose: Own the configured nodes, their shared liveness state, and the
//! ring that maps keys onto them.
//!
//! ## Design Principles
//! 1. **Atomic Transitions**: Each node's health sits behind its own mutex, so
//!    two callers reporting the same failure cannot lose an update.
//! 2. **Configurable Down Routing**: `DownPolicy::Exclude` skips down nodes on
//!    the ring; `DownPolicy::FailFast` keeps routing to them and fails the
//!    operation before any socket work.
//! 3. **Timed Probing**: A down node becomes `RetryPending` once the retry
//!    timeout passes; the next result decides whether it goes `Up` or back
//!    `Down`.
//!
//! ## State Machine
//!
//! ```text
//!            failures >= limit / mark_down
//!   Up  ─────────────────────────────────────▶ Down
//!   ▲                                           │ retry_timeout elapsed
//!   │ success / mark_up                         ▼
//!   └──────────────────────────────────── RetryPending
//!                 failure ──▶ Down (timer restarts)
//! ```

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{info, warn};

use mcluster_common::{McError, McResult};

use crate::config::ServerAddr;
use crate::hash::HashAlgorithm;
use crate::ring::{Distribution, Ring};

/// Routing behaviour for nodes marked down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownPolicy {
    /// Route around down nodes.
    #[default]
    Exclude,
    /// Keep the owner and fail immediately with `NodeDown`.
    FailFast,
}

/// Liveness of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Up,
    Down,
    /// Down long enough to be probed by the next operation.
    RetryPending,
}

#[derive(Debug)]
struct Health {
    state: NodeState,
    failures: u32,
    last_failure: Option<Instant>,
}

/// One server endpoint with its liveness.
#[derive(Debug)]
pub struct Node {
    addr: ServerAddr,
    label: String,
    health: Mutex<Health>,
}

impl Node {
    fn new(addr: ServerAddr) -> Self {
        Node {
            label: addr.label(),
            addr,
            health: Mutex::new(Health {
                state: NodeState::Up,
                failures: 0,
                last_failure: None,
            }),
        }
    }

    /// Configured endpoint.
    pub fn addr(&self) -> &ServerAddr {
        &self.addr
    }

    /// `host:port` label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Current state (without triggering the retry timer).
    pub fn state(&self) -> NodeState {
        self.health.lock().state
    }

    /// Time of the most recent recorded failure.
    pub fn last_failure(&self) -> Option<Instant> {
        self.health.lock().last_failure
    }
}

/// Node set, liveness table, and key distribution.
#[derive(Debug)]
pub struct Cluster {
    nodes: Vec<Node>,
    ring: Ring,
    policy: DownPolicy,
    failure_limit: u32,
    retry_timeout: Duration,
}

impl Cluster {
    /// Builds the cluster from validated server addresses.
    pub fn new(
        servers: Vec<ServerAddr>,
        distribution: Distribution,
        hash: HashAlgorithm,
        policy: DownPolicy,
        failure_limit: u32,
        retry_timeout: Duration,
    ) -> McResult<Self> {
        if servers.is_empty() {
            return Err(McError::Configuration("cluster needs at least one server".into()));
        }
        let ring = Ring::new(&servers, distribution, hash);
        Ok(Cluster {
            nodes: servers.into_iter().map(Node::new).collect(),
            ring,
            policy,
            failure_limit: failure_limit.max(1),
            retry_timeout,
        })
    }

    /// Nodes in configuration order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Node at `idx`.
    pub fn node(&self, idx: usize) -> &Node {
        &self.nodes[idx]
    }

    /// Configured down-node policy.
    pub fn policy(&self) -> DownPolicy {
        self.policy
    }

    /// Resolves the owner of `key`.
    ///
    /// Under `Exclude`, down nodes are skipped (`NoServers` if all are down).
    /// Under `FailFast`, the ring owner is returned regardless of liveness;
    /// `admit` rejects it later.
    pub fn owner_for(&self, key: &[u8]) -> McResult<usize> {
        let owner = match self.policy {
            DownPolicy::Exclude => self.ring.owner(key, |idx| self.is_routable(idx)),
            DownPolicy::FailFast => self.ring.owner(key, |_| true),
        };
        owner.ok_or(McError::NoServers)
    }

    /// Checks that an operation may talk to node `idx` right now.
    pub fn admit(&self, idx: usize) -> McResult<()> {
        if self.is_routable(idx) {
            Ok(())
        } else {
            Err(McError::NodeDown(self.nodes[idx].label.clone()))
        }
    }

    /// Indices of nodes an operation may contact, in configuration order.
    pub fn routable_nodes(&self) -> Vec<usize> {
        (0..self.nodes.len()).filter(|&idx| self.is_routable(idx)).collect()
    }

    /// Returns true unless the node is down and still inside its retry window.
    ///
    /// A down node whose window expired is moved to `RetryPending` here.
    pub fn is_routable(&self, idx: usize) -> bool {
        let node = &self.nodes[idx];
        let mut health = node.health.lock();
        match health.state {
            NodeState::Up | NodeState::RetryPending => true,
            NodeState::Down => {
                let expired = health
                    .last_failure
                    .map_or(true, |at| at.elapsed() >= self.retry_timeout);
                if expired {
                    health.state = NodeState::RetryPending;
                    info!(node = %node.label, "probing down node");
                }
                expired
            }
        }
    }

    /// Marks node `idx` down and restarts its retry window.
    pub fn mark_down(&self, idx: usize) {
        let node = &self.nodes[idx];
        let mut health = node.health.lock();
        let was = health.state;
        health.state = NodeState::Down;
        health.last_failure = Some(Instant::now());
        if was != NodeState::Down {
            warn!(node = %node.label, "node marked down");
        }
    }

    /// Marks node `idx` up and clears its failure count.
    pub fn mark_up(&self, idx: usize) {
        let node = &self.nodes[idx];
        let mut health = node.health.lock();
        if health.state != NodeState::Up {
            info!(node = %node.label, "node marked up");
        }
        health.state = NodeState::Up;
        health.failures = 0;
    }

    /// Records an I/O failure against node `idx`.
    ///
    /// A probing node goes straight back down; an up node goes down once
    /// `failure_limit` consecutive failures accumulate.
    pub fn record_failure(&self, idx: usize) {
        let node = &self.nodes[idx];
        let mut health = node.health.lock();
        health.failures = health.failures.saturating_add(1);
        health.last_failure = Some(Instant::now());

        let trip = match health.state {
            NodeState::RetryPending => true,
            NodeState::Up => health.failures >= self.failure_limit,
            NodeState::Down => false,
        };
        if trip {
            health.state = NodeState::Down;
            warn!(node = %node.label, failures = health.failures, "node marked down");
        }
    }

    /// Records a successful exchange with node `idx`.
    pub fn record_success(&self, idx: usize) {
        {
            let health = self.nodes[idx].health.lock();
            if health.state == NodeState::Up && health.failures == 0 {
                return;
            }
        }
        self.mark_up(idx);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    fn cluster(policy: DownPolicy, retry_timeout: Duration) -> Cluster {
        let servers = (1..=3)
            .map(|i| ServerAddr::new(format!("10.1.0.{i}"), 11211))
            .collect();
        Cluster::new(
            servers,
            Distribution::Ketama,
            HashAlgorithm::OneAtATime,
            policy,
            2,
            retry_timeout,
        )
        .unwrap()
    }

    fn key_owned_by(cluster: &Cluster, node: usize) -> String {
        (0..)
            .map(|i| format!("key-{i}"))
            .find(|key| cluster.owner_for(key.as_bytes()).unwrap() == node)
            .unwrap()
    }

    #[test]
    fn owner_is_stable() {
        let cluster = cluster(DownPolicy::Exclude, Duration::from_secs(30));
        for i in 0..200 {
            let key = format!("k{i}");
            let first = cluster.owner_for(key.as_bytes()).unwrap();
            assert_eq!(first, cluster.owner_for(key.as_bytes()).unwrap());
        }
    }

    #[test]
    fn exclude_routes_around_down_node() {
        let cluster = cluster(DownPolicy::Exclude, Duration::from_secs(30));
        let key = key_owned_by(&cluster, 0);

        cluster.mark_down(0);
        let fallback = cluster.owner_for(key.as_bytes()).unwrap();
        assert_ne!(fallback, 0);
        assert_eq!(fallback, cluster.owner_for(key.as_bytes()).unwrap());

        cluster.mark_up(0);
        assert_eq!(cluster.owner_for(key.as_bytes()).unwrap(), 0);
    }

    #[test]
    fn fail_fast_keeps_owner_and_rejects() {
        let cluster = cluster(DownPolicy::FailFast, Duration::from_secs(30));
        let key = key_owned_by(&cluster, 1);

        cluster.mark_down(1);
        assert_eq!(cluster.owner_for(key.as_bytes()).unwrap(), 1);
        assert!(matches!(cluster.admit(1), Err(McError::NodeDown(_))));
    }

    #[test]
    fn all_down_yields_no_servers() {
        let cluster = cluster(DownPolicy::Exclude, Duration::from_secs(30));
        for idx in 0..3 {
            cluster.mark_down(idx);
        }
        assert!(matches!(cluster.owner_for(b"key"), Err(McError::NoServers)));
        assert!(cluster.routable_nodes().is_empty());
    }

    #[test]
    fn failure_limit_trips_node() {
        let cluster = cluster(DownPolicy::Exclude, Duration::from_secs(30));
        cluster.record_failure(2);
        assert_eq!(cluster.node(2).state(), NodeState::Up);
        cluster.record_failure(2);
        assert_eq!(cluster.node(2).state(), NodeState::Down);
        assert!(cluster.node(2).last_failure().is_some());
    }

    #[test]
    fn success_resets_failure_count() {
        let cluster = cluster(DownPolicy::Exclude, Duration::from_secs(30));
        cluster.record_failure(0);
        cluster.record_success(0);
        cluster.record_failure(0);
        assert_eq!(cluster.node(0).state(), NodeState::Up);
    }

    #[test]
    fn retry_window_moves_to_pending_then_decides() {
        let cluster = cluster(DownPolicy::Exclude, Duration::from_millis(10));
        cluster.mark_down(0);
        assert!(!cluster.is_routable(0));

        thread::sleep(Duration::from_millis(20));
        assert!(cluster.is_routable(0));
        assert_eq!(cluster.node(0).state(), NodeState::RetryPending);

        // A failed probe goes straight back down.
        cluster.record_failure(0);
        assert_eq!(cluster.node(0).state(), NodeState::Down);

        thread::sleep(Duration::from_millis(20));
        assert!(cluster.is_routable(0));
        cluster.record_success(0);
        assert_eq!(cluster.node(0).state(), NodeState::Up);
    }

    #[test]
    fn concurrent_failures_are_not_lost() {
        let servers = vec![ServerAddr::new("10.2.0.1", 11211)];
        let cluster = Arc::new(
            Cluster::new(
                servers,
                Distribution::Modula,
                HashAlgorithm::OneAtATime,
                DownPolicy::Exclude,
                64,
                Duration::from_secs(30),
            )
            .unwrap(),
        );

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cluster = Arc::clone(&cluster);
                thread::spawn(move || {
                    for _ in 0..8 {
                        cluster.record_failure(0);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        // 64 failures exactly reach the limit.
        assert_eq!(cluster.node(0).state(), NodeState::Down);
    }
}
