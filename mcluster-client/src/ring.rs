//! # Key Distribution Ring
//!
//! Purpose: Deterministically map keys to node indices, either by modulo or
//! over a ketama continuum.
//!
//! ## Design Principles
//! 1. **Pure Lookup**: `owner` depends only on the key, the node list, and the
//!    routable predicate passed in. Liveness lives in `Cluster`, not here.
//! 2. **libketama Compatible**: Continuum points come from MD5 digests of
//!    `"host:port-N"`, four points per digest, 160 points per node at equal
//!    weight.
//! 3. **Minimal Disruption**: Skipping a down node moves only the keys it
//!    owned; every other key keeps its owner.
//!
//! ## Structure Overview
//!
//! ```text
//! Ring
//!   ├── distribution: Modula | Ketama
//!   ├── hash: HashAlgorithm (applied to keys)
//!   └── continuum: Vec<Point>   (sorted by value, ketama only)
//!         └── Point { value: u32, node: usize }
//! ```

use md5::{Digest, Md5};
use serde::Deserialize;

use crate::config::ServerAddr;
use crate::hash::HashAlgorithm;

/// Points per node at average weight.
pub const POINTS_PER_SERVER: usize = 160;

/// Points taken from a single MD5 digest.
const POINTS_PER_HASH: usize = 4;

/// Key-to-node distribution scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Distribution {
    /// `hash(key) % node_count`.
    Modula,
    /// Consistent hashing over a weighted continuum.
    #[default]
    Ketama,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Point {
    value: u32,
    node: usize,
}

/// Immutable key-to-node map built once from the configured servers.
#[derive(Debug, Clone)]
pub struct Ring {
    distribution: Distribution,
    hash: HashAlgorithm,
    node_count: usize,
    continuum: Vec<Point>,
}

impl Ring {
    /// Builds the ring for `servers` in configuration order.
    pub fn new(servers: &[ServerAddr], distribution: Distribution, hash: HashAlgorithm) -> Self {
        let continuum = match distribution {
            Distribution::Modula => Vec::new(),
            Distribution::Ketama => build_continuum(servers),
        };
        Ring {
            distribution,
            hash,
            node_count: servers.len(),
            continuum,
        }
    }

    /// Number of nodes the ring distributes over.
    pub fn node_count(&self) -> usize {
        self.node_count
    }

    /// Returns the owner of `key` among nodes accepted by `routable`.
    ///
    /// Returns `None` when no node is routable.
    pub fn owner(&self, key: &[u8], routable: impl Fn(usize) -> bool) -> Option<usize> {
        if self.node_count == 0 {
            return None;
        }
        let point = self.hash.hash(key);
        match self.distribution {
            Distribution::Modula => {
                // Probe forward from the primary so only its keys move.
                let start = point as usize % self.node_count;
                (0..self.node_count)
                    .map(|offset| (start + offset) % self.node_count)
                    .find(|&idx| routable(idx))
            }
            Distribution::Ketama => {
                let len = self.continuum.len();
                let start = self.continuum.partition_point(|p| p.value < point) % len;
                (0..len)
                    .map(|offset| self.continuum[(start + offset) % len].node)
                    .find(|&idx| routable(idx))
            }
        }
    }
}

fn build_continuum(servers: &[ServerAddr]) -> Vec<Point> {
    let total_weight: u64 = servers.iter().map(|s| s.weight.max(1) as u64).sum();
    let mut continuum = Vec::with_capacity(servers.len() * POINTS_PER_SERVER);

    for (node, server) in servers.iter().enumerate() {
        let pct = server.weight.max(1) as f64 / total_weight as f64;
        let digests = ((pct * (POINTS_PER_SERVER / POINTS_PER_HASH) as f64 * servers.len() as f64)
            + 0.000_000_000_1)
            .floor() as usize;

        for index in 0..digests.max(1) {
            let label = format!("{}:{}-{}", server.host, server.port, index);
            let digest = Md5::digest(label.as_bytes());
            for alignment in 0..POINTS_PER_HASH {
                let base = alignment * 4;
                let value = u32::from_le_bytes([
                    digest[base],
                    digest[base + 1],
                    digest[base + 2],
                    digest[base + 3],
                ]);
                continuum.push(Point { value, node });
            }
        }
    }

    continuum.sort_unstable();
    continuum
}
