//! # Dispatcher
//!
//! Purpose: Turn one logical operation into wire exchanges with the nodes
//! that own its keys, and fold the replies into one result.
//!
//! ## Design Principles
//! 1. **Stable Grouping**: Keys are partitioned by owner before any I/O; each
//!    owner receives exactly one batched request.
//! 2. **Scoped Fan-Out**: Multi-node batches run on scoped threads and are
//!    merged in node order, so the outcome never depends on timing.
//! 3. **Connection per Exchange**: A connection is held from send until the
//!    terminal frame, then released (or closed on failure).
//! 4. **Health Feedback**: Socket-level outcomes feed node liveness; server
//!    replies, even errors, count as a healthy exchange.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::thread;

use tracing::debug;

use mcluster_common::{
    validate_key, Item, McError, McResult, ProtocolVariant, StoreMode, StoreStatus, TouchStatus,
    Ttl,
};

use crate::cluster::{Cluster, DownPolicy};
use crate::codec::{Frame, Request};
use crate::connection::Connection;
use crate::pool::ConnectionPool;

/// One logical operation as issued by the client facade.
///
/// Keys are caller keys; the dispatcher applies the namespace prefix.
/// `group`, when set, picks the node instead of the item key.
#[derive(Debug, Clone, Copy)]
pub enum Operation<'a> {
    Get {
        group: Option<&'a [u8]>,
        keys: &'a [&'a [u8]],
        cas: bool,
        limit: Option<usize>,
    },
    Store {
        group: Option<&'a [u8]>,
        mode: StoreMode,
        key: &'a [u8],
        value: &'a [u8],
        flags: u32,
        ttl: Ttl,
    },
    Delete {
        group: Option<&'a [u8]>,
        key: &'a [u8],
    },
    Touch {
        group: Option<&'a [u8]>,
        key: &'a [u8],
        ttl: Ttl,
    },
    Arith {
        key: &'a [u8],
        delta: u64,
        incr: bool,
    },
    /// Broadcast to every routable node.
    Flush { delay: Ttl },
    /// Broadcast to every routable node.
    Version,
    /// Broadcast to every routable node.
    Stats,
}

/// Outcome of a completed operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpResult {
    /// Found items keyed by caller key; misses are absent.
    Items(HashMap<Vec<u8>, Item>),
    Stored(StoreStatus),
    Deleted(bool),
    Touched(TouchStatus),
    /// New counter value, `None` when the key is missing.
    Counter(Option<u64>),
    Flushed,
    /// Version string per node label.
    Versions(BTreeMap<String, String>),
    /// Stats map per node label.
    Stats(BTreeMap<String, HashMap<String, String>>),
}

/// Routes operations over the cluster using pooled connections.
pub struct Dispatcher {
    cluster: Cluster,
    pool: ConnectionPool,
    variant: ProtocolVariant,
    prefix: Vec<u8>,
}

impl Dispatcher {
    pub fn new(
        cluster: Cluster,
        pool: ConnectionPool,
        variant: ProtocolVariant,
        prefix: Option<&str>,
    ) -> Self {
        Dispatcher {
            cluster,
            pool,
            variant,
            prefix: prefix.map(|p| p.as_bytes().to_vec()).unwrap_or_default(),
        }
    }

    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Runs `op` once. Retrying is the caller's concern.
    pub fn execute(&self, op: Operation<'_>) -> McResult<OpResult> {
        match op {
            Operation::Get {
                group,
                keys,
                cas,
                limit,
            } => self.get(group, keys, cas, limit).map(OpResult::Items),
            Operation::Store {
                group,
                mode,
                key,
                value,
                flags,
                ttl,
            } => {
                let wire = self.wire_key(key)?;
                let request = Request::Store {
                    mode,
                    key: &wire,
                    value,
                    flags,
                    ttl,
                };
                let status = match self.single(group.unwrap_or(key), &request)? {
                    Frame::Stored => StoreStatus::Stored,
                    Frame::NotStored => StoreStatus::NotStored,
                    Frame::Exists => StoreStatus::Exists,
                    Frame::NotFound => StoreStatus::NotFound,
                    other => return Err(unexpected(&other)),
                };
                Ok(OpResult::Stored(status))
            }
            Operation::Delete { group, key } => {
                let wire = self.wire_key(key)?;
                match self.single(group.unwrap_or(key), &Request::Delete { key: &wire })? {
                    Frame::Deleted => Ok(OpResult::Deleted(true)),
                    Frame::NotFound => Ok(OpResult::Deleted(false)),
                    other => Err(unexpected(&other)),
                }
            }
            Operation::Touch { group, key, ttl } => {
                let wire = self.wire_key(key)?;
                let request = Request::Touch { key: &wire, ttl };
                match self.single(group.unwrap_or(key), &request)? {
                    Frame::Touched => Ok(OpResult::Touched(TouchStatus::Touched)),
                    Frame::NotFound => Ok(OpResult::Touched(TouchStatus::NotFound)),
                    other => Err(unexpected(&other)),
                }
            }
            Operation::Arith { key, delta, incr } => {
                let wire = self.wire_key(key)?;
                let request = Request::Arith {
                    key: &wire,
                    delta,
                    incr,
                };
                match self.single(key, &request)? {
                    Frame::Number(value) => Ok(OpResult::Counter(Some(value))),
                    Frame::NotFound => Ok(OpResult::Counter(None)),
                    other => Err(unexpected(&other)),
                }
            }
            Operation::Flush { delay } => {
                self.broadcast(|conn| match request_one(conn, &Request::Flush { delay })? {
                    Frame::Ok => Ok(()),
                    other => Err(unexpected(&other)),
                })?;
                Ok(OpResult::Flushed)
            }
            Operation::Version => {
                let versions = self.broadcast(|conn| match request_one(conn, &Request::Version)? {
                    Frame::Version(version) => Ok(version),
                    other => Err(unexpected(&other)),
                })?;
                Ok(OpResult::Versions(versions))
            }
            Operation::Stats => {
                let stats = self.broadcast(|conn| {
                    conn.send_request(&Request::Stats)?;
                    let mut stats = HashMap::new();
                    read_until_end(conn, None, |frame| match frame {
                        Frame::Stat { name, value } => {
                            stats.insert(name, value);
                            None
                        }
                        other => Some(other),
                    })?;
                    Ok(stats)
                })?;
                Ok(OpResult::Stats(stats))
            }
        }
    }

    /// Node index that would serve `key` right now.
    pub fn owner_for(&self, key: &[u8]) -> McResult<usize> {
        self.cluster.owner_for(key)
    }

    fn wire_key(&self, key: &[u8]) -> McResult<Vec<u8>> {
        let mut wire = Vec::with_capacity(self.prefix.len() + key.len());
        wire.extend_from_slice(&self.prefix);
        wire.extend_from_slice(key);
        validate_key(&wire, self.variant)?;
        Ok(wire)
    }

    /// Resolves and admits the owner of `route`.
    fn route(&self, route: &[u8]) -> McResult<usize> {
        let node = self.cluster.owner_for(route)?;
        if self.cluster.policy() == DownPolicy::FailFast {
            self.cluster.admit(node)?;
        }
        Ok(node)
    }

    /// Sends one request to the owner of `route` and reads one frame.
    fn single(&self, route: &[u8], request: &Request<'_>) -> McResult<Frame> {
        let node = self.route(route)?;
        self.exchange(node, |conn| request_one(conn, request))
    }

    /// Runs `f` on a pooled connection to `node` and feeds node health.
    fn exchange<T>(
        &self,
        node: usize,
        f: impl FnOnce(&mut Connection) -> McResult<T>,
    ) -> McResult<T> {
        let result = self.pool.acquire(node).and_then(|mut conn| f(&mut conn));
        match &result {
            Ok(_) => self.cluster.record_success(node),
            Err(err) if err.is_node_failure() => self.cluster.record_failure(node),
            Err(McError::Server { .. }) => self.cluster.record_success(node),
            Err(_) => {}
        }
        result
    }

    fn get(
        &self,
        group: Option<&[u8]>,
        keys: &[&[u8]],
        cas: bool,
        limit: Option<usize>,
    ) -> McResult<HashMap<Vec<u8>, Item>> {
        let mut batches: BTreeMap<usize, Vec<Vec<u8>>> = BTreeMap::new();
        let mut wanted = HashSet::with_capacity(keys.len());
        for &key in keys {
            let wire = self.wire_key(key)?;
            if !wanted.insert(wire.clone()) {
                continue;
            }
            let node = self.route(group.unwrap_or(key))?;
            batches.entry(node).or_default().push(wire);
        }
        debug!(keys = wanted.len(), nodes = batches.len(), "dispatching multi-get");

        let fetch = |node: usize, batch: &[Vec<u8>]| {
            self.exchange(node, |conn| {
                conn.send_request(&Request::Get { keys: batch, cas })?;
                let mut found = Vec::with_capacity(batch.len());
                read_until_end(conn, limit, |frame| match frame {
                    Frame::Value(item) => {
                        found.push(item);
                        None
                    }
                    Frame::NotFound => None,
                    other => Some(other),
                })?;
                Ok(found)
            })
        };

        let results: Vec<McResult<Vec<Item>>> = if batches.len() <= 1 {
            batches.iter().map(|(&node, batch)| fetch(node, batch.as_slice())).collect()
        } else {
            thread::scope(|scope| {
                let handles: Vec<_> = batches
                    .iter()
                    .map(|(&node, batch)| scope.spawn(move || fetch(node, batch.as_slice())))
                    .collect();
                handles.into_iter().map(join_scoped).collect()
            })
        };

        let mut merged = HashMap::with_capacity(wanted.len());
        for result in results {
            for mut item in result? {
                if !wanted.contains(&item.key) {
                    continue;
                }
                item.key.drain(..self.prefix.len());
                merged.insert(item.key.clone(), item);
            }
        }
        Ok(merged)
    }

    /// Runs `f` against every routable node and keys the results by label.
    fn broadcast<T: Send>(
        &self,
        f: impl Fn(&mut Connection) -> McResult<T> + Sync,
    ) -> McResult<BTreeMap<String, T>> {
        let targets = match self.cluster.policy() {
            DownPolicy::Exclude => self.cluster.routable_nodes(),
            DownPolicy::FailFast => {
                let all: Vec<usize> = (0..self.cluster.nodes().len()).collect();
                for &node in &all {
                    self.cluster.admit(node)?;
                }
                all
            }
        };
        if targets.is_empty() {
            return Err(McError::NoServers);
        }

        let results: Vec<McResult<T>> = thread::scope(|scope| {
            let handles: Vec<_> = targets
                .iter()
                .map(|&node| {
                    let f = &f;
                    scope.spawn(move || self.exchange(node, f))
                })
                .collect();
            handles.into_iter().map(join_scoped).collect()
        });

        let mut out = BTreeMap::new();
        for (node, result) in targets.into_iter().zip(results) {
            out.insert(self.cluster.node(node).label().to_string(), result?);
        }
        Ok(out)
    }
}

/// Sends `request` and reads exactly one frame.
fn request_one(conn: &mut Connection, request: &Request<'_>) -> McResult<Frame> {
    conn.send_request(request)?;
    match conn.read_frame(None)? {
        Frame::ServerError { message, temporary } => Err(McError::Server { message, temporary }),
        frame => Ok(frame),
    }
}

/// Feeds frames to `accept` until the terminal marker.
///
/// `accept` hands back a frame it cannot place; the reply's end is then
/// unknown, so the connection is closed and the frame becomes the error.
fn read_until_end(
    conn: &mut Connection,
    limit: Option<usize>,
    mut accept: impl FnMut(Frame) -> Option<Frame>,
) -> McResult<()> {
    let mut stray = None;
    for frame in conn.frames(limit) {
        if let Some(frame) = accept(frame?) {
            stray = Some(frame);
            break;
        }
    }
    match stray {
        Some(frame) => {
            conn.close();
            Err(unexpected(&frame))
        }
        None => Ok(()),
    }
}

fn unexpected(frame: &Frame) -> McError {
    match frame {
        Frame::ServerError { message, temporary } => McError::Server {
            message: message.clone(),
            temporary: *temporary,
        },
        other => McError::protocol(format!("unexpected reply {other:?}")),
    }
}

fn join_scoped<T>(handle: thread::ScopedJoinHandle<'_, McResult<T>>) -> McResult<T> {
    handle
        .join()
        .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
}
