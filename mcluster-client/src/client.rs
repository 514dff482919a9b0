//! # Synchronous Cluster Client
//!
//! Purpose: Expose a compact, blocking API for memcached-compatible clusters
//! over the text or binary protocol.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `Client` hides routing, pooling, and framing.
//! 2. **Borrow-Friendly API**: Keys and values are accepted as `&[u8]`.
//! 3. **Bounded Retry**: Each public call is one logical operation with its
//!    own attempt budget; every attempt re-resolves the owner.
//! 4. **Misses Are Values**: Not-found is `None`/`false`/a status, never an
//!    error.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use tracing::info;

use mcluster_common::{Item, McError, McResult, StoreMode, StoreStatus, TouchStatus, Ttl};

use crate::cluster::Cluster;
use crate::config::{ClientConfig, ServerAddr};
use crate::dispatcher::{Dispatcher, OpResult, Operation};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::retry::RetryPolicy;

/// Cluster client with per-node connection pooling.
///
/// `Client` is `Send + Sync`; share it behind an `Arc`.
pub struct Client {
    dispatcher: Dispatcher,
    retry: RetryPolicy,
    metrics: Metrics,
    default_ttl: Ttl,
}

impl Client {
    /// Creates a client for `servers` with default configuration.
    pub fn connect<I, S>(servers: I) -> McResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_config(ClientConfig::with_servers(servers))
    }

    /// Creates a client with a custom configuration.
    ///
    /// No connection is opened here; each node connects on first use.
    pub fn with_config(config: ClientConfig) -> McResult<Self> {
        let servers = config.validate()?;
        let pool = ConnectionPool::new(
            &servers,
            PoolConfig {
                variant: config.protocol,
                timeouts: config.timeouts(),
                max_idle: config.max_idle_per_node,
                max_total: config.max_total_per_node,
            },
        );
        let nodes = servers.len();
        let cluster = Cluster::new(
            servers,
            config.distribution,
            config.hash,
            config.down_policy,
            config.server_failure_limit,
            config.retry_timeout(),
        )?;
        info!(
            nodes,
            protocol = ?config.protocol,
            distribution = ?config.distribution,
            "cluster client ready"
        );

        Ok(Client {
            dispatcher: Dispatcher::new(cluster, pool, config.protocol, config.prefix_key.as_deref()),
            retry: RetryPolicy::new(config.max_attempts, config.retry_backoff()),
            metrics: Metrics::new(),
            default_ttl: Ttl::from_secs(config.default_ttl),
        })
    }

    /// Fetches one item. Returns `Ok(None)` when the key is missing.
    pub fn get(&self, key: &[u8]) -> McResult<Option<Item>> {
        self.fetch_one(None, key, false, None)
    }

    /// Fetches one item together with its CAS token.
    pub fn gets(&self, key: &[u8]) -> McResult<Option<Item>> {
        self.fetch_one(None, key, true, None)
    }

    /// Fetches one item from the node owning `group`.
    pub fn get_by_key(&self, group: &[u8], key: &[u8]) -> McResult<Option<Item>> {
        self.fetch_one(Some(group), key, false, None)
    }

    /// Fetches one item, failing with `Oversize` if its value is larger
    /// than `max_bytes`.
    pub fn get_len(&self, key: &[u8], max_bytes: usize) -> McResult<Option<Item>> {
        self.fetch_one(None, key, false, Some(max_bytes))
    }

    /// Fetches many keys with one batched request per owning node.
    ///
    /// Missing keys are absent from the map.
    pub fn get_multi<K: AsRef<[u8]>>(&self, keys: &[K]) -> McResult<HashMap<Vec<u8>, Item>> {
        self.fetch(None, keys, false, None)
    }

    /// Like `get_multi`, with CAS tokens.
    pub fn gets_multi<K: AsRef<[u8]>>(&self, keys: &[K]) -> McResult<HashMap<Vec<u8>, Item>> {
        self.fetch(None, keys, true, None)
    }

    /// Like `get_multi`, but any value larger than `max_bytes` fails the
    /// whole call with `Oversize`.
    pub fn get_multi_len<K: AsRef<[u8]>>(
        &self,
        keys: &[K],
        max_bytes: usize,
    ) -> McResult<HashMap<Vec<u8>, Item>> {
        self.fetch(None, keys, false, Some(max_bytes))
    }

    /// Fetches many keys that all live on the node owning `group`.
    pub fn get_multi_by_key<K: AsRef<[u8]>>(
        &self,
        group: &[u8],
        keys: &[K],
    ) -> McResult<HashMap<Vec<u8>, Item>> {
        self.fetch(Some(group), keys, false, None)
    }

    /// Stores a value with the default TTL.
    pub fn set(&self, key: &[u8], value: &[u8]) -> McResult<StoreStatus> {
        self.store(StoreMode::Set, key, value, 0, self.default_ttl)
    }

    /// Stores a value that expires after `ttl`.
    pub fn set_with_ttl(&self, key: &[u8], value: &[u8], ttl: Duration) -> McResult<StoreStatus> {
        self.store(StoreMode::Set, key, value, 0, Ttl::from_duration(ttl))
    }

    /// Stores only if the key is absent.
    pub fn add(&self, key: &[u8], value: &[u8]) -> McResult<StoreStatus> {
        self.store(StoreMode::Add, key, value, 0, self.default_ttl)
    }

    /// Stores only if the key is present.
    pub fn replace(&self, key: &[u8], value: &[u8]) -> McResult<StoreStatus> {
        self.store(StoreMode::Replace, key, value, 0, self.default_ttl)
    }

    /// Appends bytes to an existing value.
    pub fn append(&self, key: &[u8], value: &[u8]) -> McResult<StoreStatus> {
        self.store(StoreMode::Append, key, value, 0, Ttl::NEVER)
    }

    /// Prepends bytes to an existing value.
    pub fn prepend(&self, key: &[u8], value: &[u8]) -> McResult<StoreStatus> {
        self.store(StoreMode::Prepend, key, value, 0, Ttl::NEVER)
    }

    /// Stores only if the item's CAS token still equals `cas`.
    ///
    /// Returns `Exists` when someone else modified it first.
    pub fn cas(&self, key: &[u8], value: &[u8], cas: u64) -> McResult<StoreStatus> {
        self.store(StoreMode::Cas(cas), key, value, 0, self.default_ttl)
    }

    /// Fully specified storage command.
    pub fn store(
        &self,
        mode: StoreMode,
        key: &[u8],
        value: &[u8],
        flags: u32,
        ttl: Ttl,
    ) -> McResult<StoreStatus> {
        self.store_routed(None, mode, key, value, flags, ttl)
    }

    /// Stores a value on the node owning `group`.
    pub fn set_by_key(
        &self,
        group: &[u8],
        key: &[u8],
        value: &[u8],
        flags: u32,
        ttl: Ttl,
    ) -> McResult<StoreStatus> {
        self.store_routed(Some(group), StoreMode::Set, key, value, flags, ttl)
    }

    /// Deletes a key. Returns true when an item was removed.
    pub fn delete(&self, key: &[u8]) -> McResult<bool> {
        self.delete_routed(None, key)
    }

    pub fn delete_by_key(&self, group: &[u8], key: &[u8]) -> McResult<bool> {
        self.delete_routed(Some(group), key)
    }

    /// Resets an item's expiration without touching its value.
    pub fn touch(&self, key: &[u8], ttl: Duration) -> McResult<TouchStatus> {
        self.touch_routed(None, key, Ttl::from_duration(ttl))
    }

    /// Resets an item's expiration to the configured default TTL.
    pub fn touch_default(&self, key: &[u8]) -> McResult<TouchStatus> {
        self.touch_routed(None, key, self.default_ttl)
    }

    pub fn touch_by_key(&self, group: &[u8], key: &[u8], ttl: Duration) -> McResult<TouchStatus> {
        self.touch_routed(Some(group), key, Ttl::from_duration(ttl))
    }

    /// Adds `delta` to a numeric value. Returns `None` when the key is missing.
    pub fn incr(&self, key: &[u8], delta: u64) -> McResult<Option<u64>> {
        self.arith(key, delta, true)
    }

    /// Subtracts `delta`, saturating at zero on the server.
    pub fn decr(&self, key: &[u8], delta: u64) -> McResult<Option<u64>> {
        self.arith(key, delta, false)
    }

    /// Invalidates every item on every routable node after `delay`.
    pub fn flush_all(&self, delay: Duration) -> McResult<()> {
        match self.run(Operation::Flush {
            delay: Ttl::from_duration(delay),
        })? {
            OpResult::Flushed => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Server version per node label.
    pub fn version(&self) -> McResult<BTreeMap<String, String>> {
        match self.run(Operation::Version)? {
            OpResult::Versions(versions) => Ok(versions),
            other => Err(unexpected(other)),
        }
    }

    /// General statistics per node label.
    pub fn stats(&self) -> McResult<BTreeMap<String, HashMap<String, String>>> {
        match self.run(Operation::Stats)? {
            OpResult::Stats(stats) => Ok(stats),
            other => Err(unexpected(other)),
        }
    }

    /// Node that currently serves `key`.
    pub fn server_for_key(&self, key: &[u8]) -> McResult<ServerAddr> {
        let node = self.dispatcher.owner_for(key)?;
        Ok(self.dispatcher.cluster().node(node).addr().clone())
    }

    /// Client-side counters and latency histogram.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Closes idle connections; in-flight ones close when released. The client
    /// stays usable and reconnects lazily.
    pub fn shutdown(&self) {
        self.dispatcher.pool().shutdown();
    }

    fn fetch_one(
        &self,
        group: Option<&[u8]>,
        key: &[u8],
        cas: bool,
        limit: Option<usize>,
    ) -> McResult<Option<Item>> {
        let mut items = self.fetch(group, &[key], cas, limit)?;
        Ok(items.remove(key))
    }

    fn fetch<K: AsRef<[u8]>>(
        &self,
        group: Option<&[u8]>,
        keys: &[K],
        cas: bool,
        limit: Option<usize>,
    ) -> McResult<HashMap<Vec<u8>, Item>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let keys: Vec<&[u8]> = keys.iter().map(AsRef::as_ref).collect();
        match self.run(Operation::Get {
            group,
            keys: &keys,
            cas,
            limit,
        })? {
            OpResult::Items(items) => Ok(items),
            other => Err(unexpected(other)),
        }
    }

    fn store_routed(
        &self,
        group: Option<&[u8]>,
        mode: StoreMode,
        key: &[u8],
        value: &[u8],
        flags: u32,
        ttl: Ttl,
    ) -> McResult<StoreStatus> {
        match self.run(Operation::Store {
            group,
            mode,
            key,
            value,
            flags,
            ttl,
        })? {
            OpResult::Stored(status) => Ok(status),
            other => Err(unexpected(other)),
        }
    }

    fn delete_routed(&self, group: Option<&[u8]>, key: &[u8]) -> McResult<bool> {
        match self.run(Operation::Delete { group, key })? {
            OpResult::Deleted(deleted) => Ok(deleted),
            other => Err(unexpected(other)),
        }
    }

    fn touch_routed(&self, group: Option<&[u8]>, key: &[u8], ttl: Ttl) -> McResult<TouchStatus> {
        match self.run(Operation::Touch { group, key, ttl })? {
            OpResult::Touched(status) => Ok(status),
            other => Err(unexpected(other)),
        }
    }

    fn arith(&self, key: &[u8], delta: u64, incr: bool) -> McResult<Option<u64>> {
        match self.run(Operation::Arith { key, delta, incr })? {
            OpResult::Counter(value) => Ok(value),
            other => Err(unexpected(other)),
        }
    }

    /// Executes `op` under the retry policy and records metrics.
    fn run(&self, op: Operation<'_>) -> McResult<OpResult> {
        let started = Instant::now();
        self.metrics.record_request_start();
        let result = self.retry.run(|attempt| {
            if attempt > 1 {
                self.metrics.record_retry();
            }
            self.dispatcher.execute(op)
        });
        self.metrics.record_request_end(started.elapsed());
        if result.is_err() {
            self.metrics.record_error();
        }
        result
    }
}

fn unexpected(result: OpResult) -> McError {
    McError::protocol(format!("unexpected result {result:?}"))
}
