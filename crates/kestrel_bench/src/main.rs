//! TPC-C-style workload driver for a single-process kestrel cluster.

mod datagen;
mod schema;
mod workload;

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use rand::rngs::SmallRng;
use rand::SeedableRng;

use kestrel_client::KestrelClient;
use kestrel_cluster::LocalCluster;
use kestrel_common::api::Deadline;
use kestrel_common::collection::{
    CollectionCapacity, CollectionMetadata, HashScheme, StorageDriver,
};
use kestrel_common::config::{ClientConfig, PartitionConfig};

use workload::{pick_txn, Outcome, RunContext};

const COLLECTION: &str = "tpcc";

#[derive(Debug, Parser)]
#[command(name = "kestrel-bench", about = "Transactional KV workload driver")]
struct Args {
    /// Number of warehouses to load and drive.
    #[arg(long, default_value_t = 2)]
    warehouses: i32,

    /// Number of partitions for the collection.
    #[arg(long, default_value_t = 2)]
    partitions: u32,

    /// How long to run the mix.
    #[arg(long, default_value_t = 5)]
    duration_secs: u64,

    /// RNG seed for a reproducible mix.
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Delivery batch size (clamped to 1..=10; out-of-range falls back to 10).
    #[arg(long)]
    delivery_batch: Option<u32>,
}

/// Warehouse-aligned range ends: each partition takes a contiguous share of
/// warehouse ids; the final end is the open bound.
fn range_ends(warehouses: i32, partitions: u32) -> Vec<String> {
    let share = (warehouses / partitions as i32).max(1);
    let mut ends: Vec<String> = (1..=partitions as i32)
        .map(|i| schema::warehouse_range_key(i * share + 1))
        .collect();
    if let Some(last) = ends.last_mut() {
        *last = String::new();
    }
    ends
}

#[derive(Debug, Default, Clone, Copy)]
struct VerbStats {
    attempts: u64,
    committed: u64,
    aborted: u64,
    total_latency_us: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();
    let args = Args::parse();
    anyhow::ensure!(args.warehouses >= 1, "need at least one warehouse");
    anyhow::ensure!(args.partitions >= 1, "need at least one partition");

    let metadata = CollectionMetadata {
        name: COLLECTION.into(),
        hash_scheme: HashScheme::Range,
        storage_driver: StorageDriver::InMemory,
        capacity: CollectionCapacity::default(),
        retention_period: Duration::from_secs(3600),
        heartbeat_deadline: Duration::from_millis(500),
    };

    let cluster = LocalCluster::new(ClientConfig::default(), PartitionConfig::default());
    cluster
        .create_collection(metadata, range_ends(args.warehouses, args.partitions))
        .context("create collection")?;
    for s in schema::all_schemas() {
        cluster
            .create_schema(COLLECTION, s, Deadline::after(Duration::from_secs(5)))
            .await
            .context("push schema")?;
    }

    let client = KestrelClient::new(
        cluster.cpo_client.clone(),
        cluster.tso_client.clone(),
        cluster.transport.clone(),
        ClientConfig::default(),
    );
    datagen::load(&client, COLLECTION, args.warehouses)
        .await
        .context("data load")?;

    let ctx = RunContext {
        client,
        collection: COLLECTION.into(),
    };
    let mut rng = SmallRng::seed_from_u64(args.seed);
    let mut stats: BTreeMap<&'static str, VerbStats> = BTreeMap::new();
    let started = Instant::now();
    let run_for = Duration::from_secs(args.duration_secs);

    while started.elapsed() < run_for {
        let txn = pick_txn(&mut rng, args.warehouses, args.delivery_batch);
        let label = txn.label();
        let t0 = Instant::now();
        let outcome = txn.run(&ctx).await;
        let elapsed_us = t0.elapsed().as_micros() as u64;

        let entry = stats.entry(label).or_default();
        entry.attempts += 1;
        entry.total_latency_us += elapsed_us;
        match outcome {
            Ok(Outcome::Committed) => entry.committed += 1,
            Ok(Outcome::Aborted) => entry.aborted += 1,
            Err(e) => {
                tracing::error!(txn = label, error = %e, "transaction failed");
                anyhow::bail!("driver error in {label}: {e}");
            }
        }
    }

    let elapsed = started.elapsed().as_secs_f64();
    let total_committed: u64 = stats.values().map(|s| s.committed).sum();
    println!();
    println!(
        "{:<14} {:>9} {:>10} {:>9} {:>12}",
        "transaction", "attempts", "committed", "aborted", "avg_us"
    );
    for (label, s) in &stats {
        let avg = if s.attempts > 0 {
            s.total_latency_us / s.attempts
        } else {
            0
        };
        println!(
            "{label:<14} {:>9} {:>10} {:>9} {:>12}",
            s.attempts, s.committed, s.aborted, avg
        );
    }
    println!();
    println!(
        "{} committed transactions in {elapsed:.1}s ({:.0} txn/s)",
        total_committed,
        total_committed as f64 / elapsed
    );

    cluster.shutdown().await;
    Ok(())
}
