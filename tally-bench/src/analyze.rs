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

use std::{fmt::Display, time::Duration};

use hdrhistogram::Histogram;

/// Latencies in nanoseconds, split by operation kind.
#[derive(Debug)]
pub struct Latency {
    reads: Histogram<u64>,
    writes: Histogram<u64>,
}

impl Latency {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            reads: Histogram::new(3)?,
            writes: Histogram::new(3)?,
        })
    }

    pub fn record_read(&mut self, elapsed: Duration) -> anyhow::Result<()> {
        self.reads.record(elapsed.as_nanos() as u64)?;
        Ok(())
    }

    pub fn record_write(&mut self, elapsed: Duration) -> anyhow::Result<()> {
        self.writes.record(elapsed.as_nanos() as u64)?;
        Ok(())
    }

    pub fn merge(&mut self, other: &Self) -> anyhow::Result<()> {
        self.reads.add(&other.reads)?;
        self.writes.add(&other.writes)?;
        Ok(())
    }
}

#[derive(Debug)]
pub struct Analysis {
    pub elapsed: Duration,
    pub ops: usize,
    pub flushes: usize,
    pub final_flush: Duration,
    pub resident_keys: usize,
    pub latency: Latency,
}

fn line(f: &mut std::fmt::Formatter<'_>, name: &str, hist: &Histogram<u64>) -> std::fmt::Result {
    if hist.is_empty() {
        return writeln!(f, "{name:>7}: -");
    }
    let us = |q: f64| hist.value_at_quantile(q) as f64 / 1000.0;
    writeln!(
        f,
        "{name:>7}: {} ops, p50 {:.3}us, p90 {:.3}us, p99 {:.3}us, p999 {:.3}us, max {:.3}us",
        hist.len(),
        us(0.5),
        us(0.9),
        us(0.99),
        us(0.999),
        hist.max() as f64 / 1000.0,
    )
}

impl Display for Analysis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let secs = self.elapsed.as_secs_f64();
        writeln!(
            f,
            "elapsed: {}",
            humantime::format_duration(Duration::from_millis(self.elapsed.as_millis() as u64))
        )?;
        writeln!(f, "throughput: {:.0} ops/s", self.ops as f64 / secs)?;
        line(f, "reads", &self.latency.reads)?;
        line(f, "writes", &self.latency.writes)?;
        writeln!(f, "background flushes: {}", self.flushes)?;
        writeln!(f, "final flush: {:?}", self.final_flush)?;
        write!(f, "resident keys: {}", self.resident_keys)
    }
}
