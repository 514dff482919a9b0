//! # Connection Pool
//!
//! Purpose: Reuse TCP connections per node to cut handshake latency, while
//! guaranteeing a connection is only ever held by one operation.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Each node keeps a bounded set of idle
//!    connections, created lazily on first use.
//! 2. **Exclusive Hand-Out**: Idle connections are popped under the node's
//!    mutex, so two callers can never observe the same one.
//! 3. **RAII Return**: `PooledConnection` goes back to the idle set on drop,
//!    unless it was closed or checked out before the last `shutdown`, in
//!    which case it is closed and its slot released.
//! 4. **Fail Fast**: Exceeding the per-node limit returns an error immediately.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use mcluster_common::{McError, McResult, ProtocolVariant};

use crate::config::{ServerAddr, Timeouts};
use crate::connection::{ConnState, Connection};

/// Pool configuration shared by every node.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Wire framing for new connections.
    pub variant: ProtocolVariant,
    /// Socket deadlines for new connections.
    pub timeouts: Timeouts,
    /// Maximum number of idle connections to keep per node.
    pub max_idle: usize,
    /// Maximum total connections (idle + in-use) per node.
    pub max_total: usize,
}

struct NodeSlots {
    idle: VecDeque<Connection>,
    total: usize,
    /// Bumped by every shutdown; older checkouts are not pooled again.
    epoch: u64,
}

struct NodePool {
    addr: ServerAddr,
    config: PoolConfig,
    state: Mutex<NodeSlots>,
}

impl NodePool {
    fn pop_idle(&self) -> Option<(Connection, u64)> {
        let mut state = self.state.lock();
        let epoch = state.epoch;
        state.idle.pop_front().map(|conn| (conn, epoch))
    }

    fn try_reserve(&self) -> Option<u64> {
        let mut state = self.state.lock();
        if state.total >= self.config.max_total {
            return None;
        }
        state.total += 1;
        Some(state.epoch)
    }

    fn release_slot(&self) {
        let mut state = self.state.lock();
        state.total = state.total.saturating_sub(1);
    }

    fn return_connection(&self, mut conn: Connection, epoch: u64) {
        let mut state = self.state.lock();
        if epoch == state.epoch && state.idle.len() < self.config.max_idle {
            conn.set_state(ConnState::Idle);
            state.idle.push_back(conn);
            return;
        }
        state.total = state.total.saturating_sub(1);
        drop(state);
        conn.close();
    }
}

/// Per-node connection pools, indexed like `Cluster::nodes()`.
#[derive(Clone)]
pub struct ConnectionPool {
    nodes: Arc<Vec<Arc<NodePool>>>,
}

impl ConnectionPool {
    /// Creates empty pools for `servers`.
    pub fn new(servers: &[ServerAddr], config: PoolConfig) -> Self {
        let nodes = servers
            .iter()
            .map(|addr| {
                Arc::new(NodePool {
                    addr: addr.clone(),
                    config: config.clone(),
                    state: Mutex::new(NodeSlots {
                        idle: VecDeque::with_capacity(config.max_idle),
                        total: 0,
                        epoch: 0,
                    }),
                })
            })
            .collect();
        ConnectionPool {
            nodes: Arc::new(nodes),
        }
    }

    /// Acquires a connection to node `node`, connecting if none is idle.
    pub fn acquire(&self, node: usize) -> McResult<PooledConnection> {
        let pool = &self.nodes[node];
        if let Some((conn, epoch)) = pool.pop_idle() {
            return Ok(PooledConnection::new(Arc::clone(pool), conn, epoch));
        }

        let epoch = pool
            .try_reserve()
            .ok_or_else(|| McError::PoolExhausted(pool.addr.label()))?;

        match Connection::connect(&pool.addr, pool.config.variant, &pool.config.timeouts) {
            Ok(conn) => Ok(PooledConnection::new(Arc::clone(pool), conn, epoch)),
            Err(err) => {
                pool.release_slot();
                Err(err)
            }
        }
    }

    /// Number of idle connections parked for `node`.
    pub fn idle_count(&self, node: usize) -> usize {
        self.nodes[node].state.lock().idle.len()
    }

    /// Number of open connections (idle + in-use) for `node`.
    pub fn open_count(&self, node: usize) -> usize {
        self.nodes[node].state.lock().total
    }

    /// Closes every idle connection. In-use connections close when released.
    ///
    /// The pool stays usable: later acquires connect afresh.
    pub fn shutdown(&self) {
        for pool in self.nodes.iter() {
            let drained: Vec<Connection> = {
                let mut state = pool.state.lock();
                state.epoch += 1;
                let drained: Vec<_> = state.idle.drain(..).collect();
                state.total = state.total.saturating_sub(drained.len());
                drained
            };
            for mut conn in drained {
                conn.close();
            }
            debug!(node = %pool.addr, "idle connections closed");
        }
    }
}

/// RAII wrapper returning a connection to its node pool on drop.
pub struct PooledConnection {
    pool: Arc<NodePool>,
    conn: Option<Connection>,
    epoch: u64,
}

impl PooledConnection {
    fn new(pool: Arc<NodePool>, mut conn: Connection, epoch: u64) -> Self {
        conn.set_state(ConnState::InUse);
        PooledConnection {
            pool,
            conn: Some(conn),
            epoch,
        }
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        // Only `drop` takes the connection out.
        self.conn.as_ref().expect("connection exists")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection exists")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let conn = match self.conn.take() {
            Some(conn) => conn,
            None => return,
        };

        if conn.is_closed() {
            // Unknown protocol position: never hand this socket out again.
            self.pool.release_slot();
        } else {
            self.pool.return_connection(conn, self.epoch);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::thread;
    use std::time::Duration;

    use crate::codec::{Frame, Request};

    /// Answers `version` on every accepted connection; `silent` stays mute.
    fn spawn_server(silent: bool) -> ServerAddr {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { return };
                thread::spawn(move || {
                    let mut writer = stream.try_clone().expect("clone");
                    let mut reader = BufReader::new(stream);
                    let mut line = String::new();
                    while reader.read_line(&mut line).unwrap_or(0) > 0 {
                        if !silent {
                            let _ = writer.write_all(b"VERSION 1.6.0\r\n");
                        }
                        line.clear();
                    }
                });
            }
        });
        ServerAddr::new("127.0.0.1", port)
    }

    fn pool_for(addr: ServerAddr, max_idle: usize, max_total: usize) -> ConnectionPool {
        ConnectionPool::new(
            &[addr],
            PoolConfig {
                variant: ProtocolVariant::Text,
                timeouts: Timeouts {
                    connect: Duration::from_secs(1),
                    read: Duration::from_millis(100),
                    write: Duration::from_secs(1),
                },
                max_idle,
                max_total,
            },
        )
    }

    #[test]
    fn connection_is_reused_after_success() {
        let pool = pool_for(spawn_server(false), 2, 2);
        {
            let mut conn = pool.acquire(0).unwrap();
            assert_eq!(conn.state(), ConnState::InUse);
            conn.send_request(&Request::Version).unwrap();
            assert_eq!(conn.read_frame(None).unwrap(), Frame::Version("1.6.0".into()));
        }
        assert_eq!(pool.idle_count(0), 1);
        assert_eq!(pool.open_count(0), 1);

        let _again = pool.acquire(0).unwrap();
        assert_eq!(pool.idle_count(0), 0);
        assert_eq!(pool.open_count(0), 1);
    }

    #[test]
    fn exhausted_pool_fails_fast() {
        let pool = pool_for(spawn_server(false), 1, 1);
        let _held = pool.acquire(0).unwrap();
        assert!(matches!(pool.acquire(0), Err(McError::PoolExhausted(_))));
    }

    #[test]
    fn timed_out_connection_is_not_pooled() {
        let pool = pool_for(spawn_server(true), 2, 2);
        {
            let mut conn = pool.acquire(0).unwrap();
            conn.send_request(&Request::Version).unwrap();
            assert!(matches!(conn.read_frame(None), Err(McError::Timeout)));
        }
        assert_eq!(pool.idle_count(0), 0);
        assert_eq!(pool.open_count(0), 0);
    }

    #[test]
    fn concurrent_acquire_never_shares() {
        let pool = pool_for(spawn_server(false), 4, 4);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                thread::spawn(move || {
                    for _ in 0..20 {
                        let mut conn = pool.acquire(0).unwrap();
                        conn.send_request(&Request::Version).unwrap();
                        // A shared socket would interleave replies and break framing.
                        assert!(matches!(conn.read_frame(None).unwrap(), Frame::Version(_)));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(pool.open_count(0) <= 4);
    }

    #[test]
    fn shutdown_closes_idle_connections() {
        let pool = pool_for(spawn_server(false), 2, 2);
        drop(pool.acquire(0).unwrap());
        assert_eq!(pool.idle_count(0), 1);

        pool.shutdown();
        assert_eq!(pool.idle_count(0), 0);
        assert_eq!(pool.open_count(0), 0);
    }

    #[test]
    fn connection_in_use_at_shutdown_closes_on_release() {
        let pool = pool_for(spawn_server(false), 2, 2);
        let held = pool.acquire(0).unwrap();
        pool.shutdown();
        assert_eq!(pool.open_count(0), 1);

        drop(held);
        assert_eq!(pool.idle_count(0), 0);
        assert_eq!(pool.open_count(0), 0);

        // Checkouts after shutdown are pooled as usual.
        {
            let mut conn = pool.acquire(0).unwrap();
            conn.send_request(&Request::Version).unwrap();
            assert_eq!(conn.read_frame(None).unwrap(), Frame::Version("1.6.0".into()));
        }
        assert_eq!(pool.idle_count(0), 1);
        assert_eq!(pool.open_count(0), 1);
    }
}
