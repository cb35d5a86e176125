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

use std::borrow::Cow;

use crate::metrics::{
    BoxedCounter, BoxedCounterVec, BoxedGauge, BoxedGaugeVec, BoxedHistogram, BoxedHistogramVec, Boxer, CounterOps,
    CounterVecOps, GaugeOps, GaugeVecOps, HistogramOps, HistogramVecOps, RegistryOps,
};

/// Registry that discards every record. Used when no registry is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetricsRegistry;

/// Every metric and metric vector handed out by [`NoopMetricsRegistry`].
#[derive(Debug, Clone, Copy)]
struct Discard;

impl CounterOps for Discard {
    fn increase(&self, _: u64) {}
}

impl GaugeOps for Discard {
    fn increase(&self, _: u64) {}

    fn decrease(&self, _: u64) {}

    fn absolute(&self, _: u64) {}
}

impl HistogramOps for Discard {
    fn record(&self, _: f64) {}
}

impl CounterVecOps for Discard {
    fn counter(&self, _: &[Cow<'static, str>]) -> BoxedCounter {
        Discard.boxed()
    }
}

impl GaugeVecOps for Discard {
    fn gauge(&self, _: &[Cow<'static, str>]) -> BoxedGauge {
        Discard.boxed()
    }
}

impl HistogramVecOps for Discard {
    fn histogram(&self, _: &[Cow<'static, str>]) -> BoxedHistogram {
        Discard.boxed()
    }
}

impl RegistryOps for NoopMetricsRegistry {
    fn register_counter_vec(&self, _: Cow<'static, str>, _: Cow<'static, str>, _: &'static [&'static str]) -> BoxedCounterVec {
        Discard.boxed()
    }

    fn register_gauge_vec(&self, _: Cow<'static, str>, _: Cow<'static, str>, _: &'static [&'static str]) -> BoxedGaugeVec {
        Discard.boxed()
    }

    fn register_histogram_vec(
        &self,
        _: Cow<'static, str>,
        _: Cow<'static, str>,
        _: &'static [&'static str],
    ) -> BoxedHistogramVec {
        Discard.boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;

    #[test]
    fn test_noop_metrics() {
        let metrics = Metrics::new("votes", &NoopMetricsRegistry);
        metrics.counter_increment.increase(1);
        metrics.counter_resident_keys.absolute(1000);
        metrics.counter_resident_keys.decrease(1);
        metrics.storage_store_duration.record(0.25);
    }
}
