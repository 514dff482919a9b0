//! # Client Benchmark Harness
//!
//! Purpose: Provide a repeatable load driver for the cluster client so
//! throughput and tail latency can be compared across cluster layouts.
//!
//! ## Design Principles
//! 1. **Deterministic Workload**: Use a fixed PRNG seed for stable comparisons.
//! 2. **Allocation Control**: Pre-build keys/values to keep setup costs off the hot path.
//! 3. **Machine-Readable Output**: The summary is printed as JSON.
//!
//! Usage: `bench_client [servers] [keys] [ops] [value_size] [batch]`, where
//! `servers` is a comma-separated list. Set `MCLUSTER_CONFIG` to a JSON file
//! to configure the client fully instead.

use std::env;
use std::fs;
use std::hint::black_box;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use mcluster_client::{Client, ClientConfig, MetricsSnapshot};

const DEFAULT_SERVERS: &str = "127.0.0.1:11211";
const DEFAULT_KEY_COUNT: usize = 1 << 12;
const DEFAULT_OP_COUNT: usize = 100_000;
const DEFAULT_VALUE_SIZE: usize = 128;
const DEFAULT_BATCH: usize = 16;

struct BenchConfig {
    client: ClientConfig,
    key_count: usize,
    key_mask: usize,
    op_count: usize,
    value_size: usize,
    batch: usize,
}

impl BenchConfig {
    fn from_args() -> Result<Self> {
        let mut args = env::args().skip(1);
        let servers = args.next().unwrap_or_else(|| DEFAULT_SERVERS.to_string());
        let requested_keys = parse_usize(args.next(), DEFAULT_KEY_COUNT);
        let op_count = parse_usize(args.next(), DEFAULT_OP_COUNT);
        let value_size = parse_usize(args.next(), DEFAULT_VALUE_SIZE);
        let batch = parse_usize(args.next(), DEFAULT_BATCH).max(1);

        let client = match env::var("MCLUSTER_CONFIG") {
            Ok(path) => {
                let raw = fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
                ClientConfig::from_json(&raw)?
            }
            Err(_) => ClientConfig::with_servers(servers.split(',').map(str::trim)),
        };

        let key_count = requested_keys.max(1).next_power_of_two();
        Ok(BenchConfig {
            client,
            key_count,
            key_mask: key_count - 1,
            op_count,
            value_size,
            batch,
        })
    }
}

fn parse_usize(value: Option<String>, fallback: usize) -> usize {
    value.and_then(|raw| raw.parse().ok()).unwrap_or(fallback)
}

/// Tiny deterministic PRNG; keeps the workload reproducible.
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    #[inline]
    fn next_index(&mut self, mask: usize) -> usize {
        (self.next_u64() as usize) & mask
    }
}

fn build_keys(count: usize) -> Vec<Vec<u8>> {
    (0..count).map(|i| format!("bench:{i:08x}").into_bytes()).collect()
}

fn build_values(count: usize, size: usize, seed: u64) -> Vec<Vec<u8>> {
    let mut rng = XorShift64::new(seed);
    (0..count)
        .map(|_| {
            let mut value = vec![0u8; size];
            for chunk in value.chunks_mut(8) {
                let bytes = rng.next_u64().to_le_bytes();
                chunk.copy_from_slice(&bytes[..chunk.len()]);
            }
            value
        })
        .collect()
}

#[derive(Serialize)]
struct PhaseReport {
    label: &'static str,
    ops: usize,
    secs: f64,
    ops_per_sec: f64,
    hits: usize,
}

impl PhaseReport {
    fn new(label: &'static str, ops: usize, hits: usize, elapsed: Duration) -> Self {
        let secs = elapsed.as_secs_f64();
        PhaseReport {
            label,
            ops,
            secs,
            ops_per_sec: if secs > 0.0 { ops as f64 / secs } else { 0.0 },
            hits,
        }
    }
}

#[derive(Serialize)]
struct Summary {
    servers: Vec<String>,
    keys: usize,
    value_size: usize,
    batch: usize,
    phases: Vec<PhaseReport>,
    p50_us: Option<u64>,
    p99_us: Option<u64>,
    metrics: MetricsSnapshot,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = run() {
        eprintln!("bench_client failed: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let config = BenchConfig::from_args()?;
    let servers = config.client.servers.clone();
    let client = Client::with_config(config.client).context("building client")?;

    let keys = build_keys(config.key_count);
    let values = build_values(config.key_count, config.value_size, 0x5A5A_5A5A_5A5A_5A5A);
    info!(keys = config.key_count, ops = config.op_count, "starting workload");

    let mut phases = Vec::with_capacity(3);

    let start = Instant::now();
    for (key, value) in keys.iter().zip(&values) {
        client.set(key, value)?;
    }
    phases.push(PhaseReport::new("SET", config.key_count, 0, start.elapsed()));

    let mut rng = XorShift64::new(0x1234_5678_9ABC_DEF0);
    let mut hits = 0;
    let start = Instant::now();
    for _ in 0..config.op_count {
        let idx = rng.next_index(config.key_mask);
        if let Some(item) = client.get(&keys[idx])? {
            hits += 1;
            black_box(item);
        }
    }
    phases.push(PhaseReport::new("GET", config.op_count, hits, start.elapsed()));

    let mut rng = XorShift64::new(0x0FED_CBA9_8765_4321);
    let rounds = config.op_count / config.batch;
    let mut batch: Vec<&[u8]> = Vec::with_capacity(config.batch);
    let mut hits = 0;
    let start = Instant::now();
    for _ in 0..rounds {
        batch.clear();
        batch.extend((0..config.batch).map(|_| keys[rng.next_index(config.key_mask)].as_slice()));
        hits += black_box(client.get_multi(&batch)?).len();
    }
    phases.push(PhaseReport::new("GET_MULTI", rounds * config.batch, hits, start.elapsed()));

    let metrics = client.metrics();
    let summary = Summary {
        servers,
        keys: config.key_count,
        value_size: config.value_size,
        batch: config.batch,
        phases,
        p50_us: metrics.latency.quantile_us(0.50),
        p99_us: metrics.latency.quantile_us(0.99),
        metrics,
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);

    client.shutdown();
    Ok(())
}
