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

use std::{borrow::Cow, collections::HashMap, sync::Arc};

use itertools::Itertools;
use parking_lot::Mutex;
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
};

use crate::metrics::{
    BoxedCounter, BoxedCounterVec, BoxedGauge, BoxedGaugeVec, BoxedHistogram, BoxedHistogramVec, Boxer, CounterOps,
    CounterVecOps, GaugeOps, GaugeVecOps, HistogramOps, HistogramVecOps, RegistryOps,
};

impl CounterOps for IntCounter {
    fn increase(&self, val: u64) {
        self.inc_by(val);
    }
}

impl GaugeOps for IntGauge {
    fn increase(&self, val: u64) {
        self.add(val as _);
    }

    fn decrease(&self, val: u64) {
        self.sub(val as _);
    }

    fn absolute(&self, val: u64) {
        self.set(val as _);
    }
}

impl HistogramOps for Histogram {
    fn record(&self, val: f64) {
        self.observe(val);
    }
}

fn label_values<'a>(labels: &'a [Cow<'static, str>]) -> Vec<&'a str> {
    labels.iter().map(Cow::as_ref).collect_vec()
}

impl CounterVecOps for IntCounterVec {
    fn counter(&self, labels: &[Cow<'static, str>]) -> BoxedCounter {
        self.with_label_values(&label_values(labels)).boxed()
    }
}

impl GaugeVecOps for IntGaugeVec {
    fn gauge(&self, labels: &[Cow<'static, str>]) -> BoxedGauge {
        self.with_label_values(&label_values(labels)).boxed()
    }
}

impl HistogramVecOps for HistogramVec {
    fn histogram(&self, labels: &[Cow<'static, str>]) -> BoxedHistogram {
        self.with_label_values(&label_values(labels)).boxed()
    }
}

#[derive(Debug, Clone)]
enum MetricVec {
    Counter(IntCounterVec),
    Gauge(IntGaugeVec),
    Histogram(HistogramVec),
}

/// Prometheus metrics registry with lib `prometheus`.
///
/// Every counter and storage registers the same metric names, told apart by the `name` label. Clones share the
/// registered vectors, so one registry can be handed to any number of counters and storages.
#[derive(Debug, Clone)]
pub struct PrometheusMetricsRegistry {
    registry: Registry,
    vecs: Arc<Mutex<HashMap<Cow<'static, str>, MetricVec>>>,
}

impl PrometheusMetricsRegistry {
    /// Create a Prometheus metrics registry.
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            vecs: Arc::default(),
        }
    }

    /// The wrapped registry, e.g. to gather the metrics.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn get_or_register(
        &self,
        name: Cow<'static, str>,
        register: impl FnOnce(&Registry) -> prometheus::Result<MetricVec>,
    ) -> MetricVec {
        let mut vecs = self.vecs.lock();
        if let Some(vec) = vecs.get(&name) {
            return vec.clone();
        }
        // Registration only fails on malformed or conflicting metadata, both fixed at compile time.
        let vec = register(&self.registry).unwrap_or_else(|e| panic!("failed to register metric {name}: {e}"));
        vecs.insert(name, vec.clone());
        vec
    }
}

impl RegistryOps for PrometheusMetricsRegistry {
    fn register_counter_vec(
        &self,
        name: Cow<'static, str>,
        desc: Cow<'static, str>,
        label_names: &'static [&'static str],
    ) -> BoxedCounterVec {
        let vec = self.get_or_register(name.clone(), |r| {
            let vec = IntCounterVec::new(Opts::new(name.as_ref(), desc.as_ref()), label_names)?;
            r.register(Box::new(vec.clone()))?;
            Ok(MetricVec::Counter(vec))
        });
        match vec {
            MetricVec::Counter(v) => v.boxed(),
            _ => panic!("metric {name} was registered with another type"),
        }
    }

    fn register_gauge_vec(
        &self,
        name: Cow<'static, str>,
        desc: Cow<'static, str>,
        label_names: &'static [&'static str],
    ) -> BoxedGaugeVec {
        let vec = self.get_or_register(name.clone(), |r| {
            let vec = IntGaugeVec::new(Opts::new(name.as_ref(), desc.as_ref()), label_names)?;
            r.register(Box::new(vec.clone()))?;
            Ok(MetricVec::Gauge(vec))
        });
        match vec {
            MetricVec::Gauge(v) => v.boxed(),
            _ => panic!("metric {name} was registered with another type"),
        }
    }

    fn register_histogram_vec(
        &self,
        name: Cow<'static, str>,
        desc: Cow<'static, str>,
        label_names: &'static [&'static str],
    ) -> BoxedHistogramVec {
        let vec = self.get_or_register(name.clone(), |r| {
            let vec = HistogramVec::new(HistogramOpts::new(name.as_ref(), desc.as_ref()), label_names)?;
            r.register(Box::new(vec.clone()))?;
            Ok(MetricVec::Histogram(vec))
        });
        match vec {
            MetricVec::Histogram(v) => v.boxed(),
            _ => panic!("metric {name} was registered with another type"),
        }
    }
}
