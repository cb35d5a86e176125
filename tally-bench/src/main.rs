// Copyright 2026 tally Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Multi-threaded benchmark of the tally voting counters.

mod analyze;

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use analyze::{Analysis, Latency};
use anyhow::Context;
use clap::{Parser, ValueEnum};
use itertools::Itertools;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use tally::prelude::*;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StrategyArg {
    LockBased,
    NonBlocking,
}

impl From<StrategyArg> for Strategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::LockBased => Strategy::LockBased,
            StrategyArg::NonBlocking => Strategy::NonBlocking,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendArg {
    Table,
    Kv,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ConsistencyArg {
    Disabled,
    Warn,
    Strict,
}

impl From<ConsistencyArg> for ConsistencyCheck {
    fn from(arg: ConsistencyArg) -> Self {
        match arg {
            ConsistencyArg::Disabled => ConsistencyCheck::Disabled,
            ConsistencyArg::Warn => ConsistencyCheck::Warn,
            ConsistencyArg::Strict => ConsistencyCheck::Strict,
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
struct Args {
    /// Counter strategy.
    #[arg(long, value_enum, default_value_t = StrategyArg::NonBlocking)]
    strategy: StrategyArg,

    /// Storage backend.
    #[arg(long, value_enum, default_value_t = BackendArg::Table)]
    backend: BackendArg,

    /// Consistency check of flush baselines.
    #[arg(long, value_enum, default_value_t = ConsistencyArg::Disabled)]
    consistency: ConsistencyArg,

    /// Voter thread count.
    #[arg(long, default_value_t = 8)]
    threads: usize,

    /// Distinct keys, voted in `1..=keys`.
    #[arg(long, default_value_t = 1000)]
    keys: i32,

    /// Distinct actors, voting as `1..=actors`.
    #[arg(long, default_value_t = 100)]
    actors: i32,

    /// Votes per thread.
    #[arg(long, default_value_t = 100_000)]
    ops: usize,

    /// Ratio of reads among operations.
    #[arg(long, default_value_t = 0.5)]
    read_ratio: f64,

    /// Interval between background flushes, e.g. "50ms". "0s" disables background flushes.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "100ms")]
    flush_interval: Duration,

    /// Stripes of each per-key aggregate of the non-blocking counter.
    #[arg(long, default_value_t = DEFAULT_STRIPES)]
    stripes: usize,

    /// Load every persisted key up front.
    #[arg(long, default_value_t = false)]
    prefill: bool,

    /// Seed of the voter threads.
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Print the prometheus metrics after the run.
    #[arg(long, default_value_t = false)]
    metrics: bool,
}

fn init_logger() {
    use tracing_subscriber::{prelude::*, EnvFilter};

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_line_number(true))
        .with(EnvFilter::from_default_env())
        .init();
}

#[cfg(feature = "deadlock")]
fn detect_deadlocks() {
    thread::spawn(move || loop {
        thread::sleep(Duration::from_secs(1));
        let deadlocks = parking_lot::deadlock::check_deadlock();
        if deadlocks.is_empty() {
            continue;
        }

        println!("{} deadlocks detected", deadlocks.len());
        for (i, threads) in deadlocks.iter().enumerate() {
            println!("Deadlock #{}", i);
            for t in threads {
                println!("Thread Id {:#?}", t.thread_id());
                println!("{:#?}", t.backtrace());
            }
        }
        panic!()
    });
}

fn storage(args: &Args) -> Arc<dyn VoteStorage> {
    let consistency = args.consistency.into();
    match args.backend {
        BackendArg::Table => Arc::new(
            TableBackend::new(MemoryVoteTable::new("votes"))
                .into_storage()
                .with_consistency_check(consistency),
        ),
        BackendArg::Kv => Arc::new(
            KvBackend::new(MemoryKvDb::new("votes"))
                .into_storage()
                .with_consistency_check(consistency),
        ),
    }
}

fn vote(args: &Args, counter: &Counter, id: usize) -> anyhow::Result<Latency> {
    let mut rng = SmallRng::seed_from_u64(args.seed + id as u64);
    let mut latency = Latency::new()?;
    for _ in 0..args.ops {
        let key = rng.random_range(1..=args.keys);
        let actor = rng.random_range(1..=args.actors);
        let now = Instant::now();
        if rng.random_bool(args.read_ratio) {
            counter.estimate_count(key)?;
            latency.record_read(now.elapsed())?;
        } else {
            if rng.random_bool(0.5) {
                counter.increment(key, actor)?;
            } else {
                counter.decrement(key, actor)?;
            }
            latency.record_write(now.elapsed())?;
        }
    }
    Ok(latency)
}

fn flush_loop(counter: &Counter, interval: Duration, stop: &AtomicBool, flushes: &AtomicUsize) -> anyhow::Result<()> {
    if interval.is_zero() {
        return Ok(());
    }
    while !stop.load(Ordering::Acquire) {
        thread::sleep(interval);
        let now = Instant::now();
        counter.flush()?;
        let n = flushes.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!("[bench]: flush #{n} took {:?}", now.elapsed());
    }
    tracing::info!("[bench]: flusher stopped after {} flushes", flushes.load(Ordering::Relaxed));
    Ok(())
}

/// After the final flush every resident total must match the persisted ballot set.
fn verify(counter: &Counter, storage: &dyn VoteStorage) -> anyhow::Result<()> {
    let persisted = storage.load_all_map()?;
    let counts = counter.estimate_all_counts();
    for (key, count) in counts.iter() {
        let expected = persisted.get(key).map(BallotSet::aggregate).unwrap_or_default();
        anyhow::ensure!(*count == expected, "key {key}: counter says {count}, storage says {expected}");
    }
    let sum = counts.values().sum::<i64>();
    anyhow::ensure!(
        sum == total(&persisted),
        "sum of totals {sum} differs from persisted {}",
        total(&persisted)
    );
    Ok(())
}

fn main() -> anyhow::Result<()> {
    init_logger();

    #[cfg(feature = "deadlock")]
    detect_deadlocks();

    let args = Args::parse();
    println!("{:#?}", args);
    anyhow::ensure!(args.keys > 0, "\"--keys\" value must be greater than 0");
    anyhow::ensure!(args.actors > 0, "\"--actors\" value must be greater than 0");
    anyhow::ensure!(
        (0.0..=1.0).contains(&args.read_ratio),
        "\"--read-ratio\" value must be within [0, 1]"
    );

    let registry = prometheus::Registry::new();
    let storage = storage(&args);
    let counter = CounterBuilder::new(storage.clone())
        .with_name("bench")
        .with_strategy(args.strategy.into())
        .with_stripes(args.stripes)
        .with_prefill(args.prefill)
        .with_metrics_registry(Box::new(PrometheusMetricsRegistry::new(registry.clone())))
        .build()
        .context("failed to build the counter")?;

    let stop = AtomicBool::new(false);
    let flushes = AtomicUsize::new(0);
    let start = Instant::now();

    let latency = thread::scope(|s| -> anyhow::Result<Latency> {
        let flusher = s.spawn(|| flush_loop(&counter, args.flush_interval, &stop, &flushes));
        let voters = (0..args.threads)
            .map(|id| {
                let args = &args;
                let counter = &counter;
                s.spawn(move || vote(args, counter, id))
            })
            .collect_vec();

        let results = voters
            .into_iter()
            .map(|voter| -> anyhow::Result<Latency> {
                voter.join().map_err(|_| anyhow::anyhow!("voter thread panicked"))?
            })
            .collect_vec();

        stop.store(true, Ordering::Release);
        flusher
            .join()
            .map_err(|_| anyhow::anyhow!("flusher thread panicked"))??;

        let mut latency = Latency::new()?;
        for res in results {
            latency.merge(&res?)?;
        }
        Ok(latency)
    })?;
    let elapsed = start.elapsed();

    let now = Instant::now();
    counter.close()?;
    let final_flush = now.elapsed();
    tracing::info!("[bench]: final flush took {final_flush:?}");

    let ops = args.threads * args.ops;
    let analysis = Analysis {
        elapsed,
        ops,
        flushes: flushes.load(Ordering::Relaxed),
        final_flush,
        resident_keys: counter.estimate_all_counts().len(),
        latency,
    };
    println!("\nTotal:\n{analysis}");

    verify(&counter, storage.as_ref())?;
    println!("sum invariant: ok");

    if args.metrics {
        let text = prometheus::TextEncoder::new().encode_to_string(&registry.gather())?;
        println!("\n{text}");
    }

    Ok(())
}
