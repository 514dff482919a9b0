//! # MemCluster Sync Client
//!
//! Purpose: Provide a blocking client for memcached-compatible clusters with
//! consistent-hash routing, per-node connection pooling, and bounded retry.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Reuse TCP connections per node.
//! 2. **Deterministic Routing**: The same key maps to the same node as long as
//!    the set of routable nodes is unchanged.
//! 3. **Length-Driven Framing**: Text and binary codecs read values by their
//!    declared length, so payloads are binary-safe.
//! 4. **Explicit Failure Model**: Transient failures retry within a budget;
//!    everything else surfaces on the first attempt.
//!
//! ```no_run
//! use mcluster_client::Client;
//!
//! let client = Client::connect(["10.0.0.1:11211", "10.0.0.2:11211"])?;
//! client.set(b"greeting", b"hello")?;
//! let item = client.get(b"greeting")?;
//! assert_eq!(item.map(|i| i.value), Some(b"hello".to_vec()));
//! # Ok::<(), mcluster_client::McError>(())
//! ```

mod client;
pub mod cluster;
pub mod codec;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod hash;
pub mod metrics;
pub mod pool;
pub mod retry;
pub mod ring;

pub use client::Client;
pub use cluster::{DownPolicy, NodeState};
pub use config::{ClientConfig, ServerAddr, Timeouts};
pub use hash::HashAlgorithm;
pub use metrics::{LatencySnapshot, MetricsSnapshot};
pub use retry::RetryPolicy;
pub use ring::Distribution;

pub use mcluster_common::{
    Item, McError, McResult, ProtocolVariant, StoreMode, StoreStatus, TouchStatus, Ttl,
};
