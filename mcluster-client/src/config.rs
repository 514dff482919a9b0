//! # Client Configuration
//!
//! Purpose: Describe the cluster and the client's behaviour in one plain
//! struct that can be built in code or deserialized from JSON.
//!
//! ## Notes
//! - Every field has a default, so a config file only names what it changes.
//! - Durations are integers (milliseconds for socket timeouts, seconds for
//!   TTLs and node retry) to keep the serialized form obvious.
//! - `validate()` runs once at client construction; nothing is re-checked on
//!   the request path.

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use serde::Deserialize;

use mcluster_common::{validate_key, McError, McResult, ProtocolVariant, MAX_KEY_LENGTH};

use crate::cluster::DownPolicy;
use crate::hash::HashAlgorithm;
use crate::ring::Distribution;

/// Port assumed when a server entry omits one.
pub const DEFAULT_PORT: u16 = 11211;

/// Default item TTL: one week.
pub const DEFAULT_TTL_SECS: u64 = 604_800;

/// One configured server endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerAddr {
    pub host: String,
    pub port: u16,
    /// Relative share of the ketama continuum.
    pub weight: u32,
}

impl ServerAddr {
    /// Creates an endpoint with weight 1.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        ServerAddr {
            host: host.into(),
            port,
            weight: 1,
        }
    }

    /// Parses `host`, `host:port`, `host:port:weight` or `[v6]:port[:weight]`.
    pub fn parse(raw: &str) -> McResult<Self> {
        let invalid = || McError::Configuration(format!("invalid server address {raw:?}"));
        let raw = raw.trim();

        let (host, rest) = if let Some(stripped) = raw.strip_prefix('[') {
            let end = stripped.find(']').ok_or_else(invalid)?;
            let rest = &stripped[end + 1..];
            let rest = match rest.strip_prefix(':') {
                Some(rest) => rest,
                None if rest.is_empty() => rest,
                None => return Err(invalid()),
            };
            (&stripped[..end], rest)
        } else {
            match raw.split_once(':') {
                Some((host, rest)) => (host, rest),
                None => (raw, ""),
            }
        };

        if host.is_empty() {
            return Err(invalid());
        }

        let mut parts = rest.split(':').filter(|p| !p.is_empty());
        let port = match parts.next() {
            Some(port) => port.parse::<u16>().map_err(|_| invalid())?,
            None => DEFAULT_PORT,
        };
        let weight = match parts.next() {
            Some(weight) => weight.parse::<u32>().map_err(|_| invalid())?,
            None => 1,
        };
        if parts.next().is_some() || port == 0 || weight == 0 {
            return Err(invalid());
        }

        Ok(ServerAddr {
            host: host.to_string(),
            port,
            weight,
        })
    }

    /// `host:port` label used in logs and errors.
    pub fn label(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Socket deadlines applied to every connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    pub read: Duration,
    pub write: Duration,
}

/// Configuration for the cluster client, its pool, and its retry policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server list, e.g. `["10.0.0.1:11211", "10.0.0.2:11211:2"]`.
    pub servers: Vec<String>,
    /// Wire framing.
    pub protocol: ProtocolVariant,
    /// Key distribution scheme.
    pub distribution: Distribution,
    /// Key hash function.
    pub hash: HashAlgorithm,
    /// TTL in seconds for store calls that do not pass one.
    pub default_ttl: u64,
    /// TCP connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Socket read timeout in milliseconds.
    pub read_timeout_ms: u64,
    /// Socket write timeout in milliseconds.
    pub write_timeout_ms: u64,
    /// Total attempts per logical call (first try included).
    pub max_attempts: u32,
    /// Pause between attempts in milliseconds.
    pub retry_backoff_ms: u64,
    /// Routing behaviour for nodes marked down.
    pub down_policy: DownPolicy,
    /// Consecutive I/O failures before a node is marked down.
    pub server_failure_limit: u32,
    /// Seconds a down node waits before it is probed again.
    pub retry_timeout_secs: u64,
    /// Idle connections kept per node.
    pub max_idle_per_node: usize,
    /// Connections (idle + in-use) allowed per node.
    pub max_total_per_node: usize,
    /// Namespace prepended to every key on the wire.
    pub prefix_key: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            servers: vec![format!("127.0.0.1:{DEFAULT_PORT}")],
            protocol: ProtocolVariant::Text,
            distribution: Distribution::Ketama,
            hash: HashAlgorithm::OneAtATime,
            default_ttl: DEFAULT_TTL_SECS,
            connect_timeout_ms: 1_000,
            read_timeout_ms: 1_000,
            write_timeout_ms: 1_000,
            max_attempts: 2,
            retry_backoff_ms: 0,
            down_policy: DownPolicy::Exclude,
            server_failure_limit: 2,
            retry_timeout_secs: 30,
            max_idle_per_node: 8,
            max_total_per_node: 16,
            prefix_key: None,
        }
    }
}

impl ClientConfig {
    /// Creates a default config pointing at `servers`.
    pub fn with_servers<I, S>(servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ClientConfig {
            servers: servers.into_iter().map(Into::into).collect(),
            ..ClientConfig::default()
        }
    }

    /// Parses a JSON document; missing fields keep their defaults.
    pub fn from_json(raw: &str) -> McResult<Self> {
        serde_json::from_str(raw).map_err(|err| McError::Configuration(err.to_string()))
    }

    /// Checks the options and parses the server list.
    pub fn validate(&self) -> McResult<Vec<ServerAddr>> {
        if self.servers.is_empty() {
            return Err(McError::Configuration("server list is empty".into()));
        }

        let mut seen = HashSet::new();
        let mut addrs = Vec::with_capacity(self.servers.len());
        for raw in &self.servers {
            let addr = ServerAddr::parse(raw)?;
            if !seen.insert((addr.host.clone(), addr.port)) {
                return Err(McError::Configuration(format!("duplicate server {addr}")));
            }
            addrs.push(addr);
        }

        if self.max_attempts == 0 {
            return Err(McError::Configuration("max_attempts must be at least 1".into()));
        }
        if self.max_total_per_node == 0 {
            return Err(McError::Configuration("max_total_per_node must be at least 1".into()));
        }
        if self.max_idle_per_node > self.max_total_per_node {
            return Err(McError::Configuration(
                "max_idle_per_node exceeds max_total_per_node".into(),
            ));
        }
        if self.connect_timeout_ms == 0 || self.read_timeout_ms == 0 || self.write_timeout_ms == 0 {
            return Err(McError::Configuration("socket timeouts must be non-zero".into()));
        }
        if self.server_failure_limit == 0 {
            return Err(McError::Configuration("server_failure_limit must be at least 1".into()));
        }
        if let Some(prefix) = &self.prefix_key {
            // The prefix must leave room for at least one key byte.
            if prefix.len() >= MAX_KEY_LENGTH {
                return Err(McError::Configuration("prefix_key is too long".into()));
            }
            validate_key(prefix.as_bytes(), self.protocol)
                .map_err(|_| McError::Configuration("prefix_key contains invalid bytes".into()))?;
        }

        Ok(addrs)
    }

    /// Socket deadlines as durations.
    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            connect: Duration::from_millis(self.connect_timeout_ms),
            read: Duration::from_millis(self.read_timeout_ms),
            write: Duration::from_millis(self.write_timeout_ms),
        }
    }

    /// Pause between retry attempts.
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// How long a down node stays excluded before it is probed.
    pub fn retry_timeout(&self) -> Duration {
        Duration::from_secs(self.retry_timeout_secs)
    }
}
