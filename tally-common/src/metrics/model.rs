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

use super::{BoxedCounter, BoxedGauge, BoxedHistogram, RegistryOps};

/// Metrics shared by the in-memory counters and the vote storages.
#[derive(Debug)]
pub struct Metrics {
    /* in-memory counter metrics */
    /// Successful increments, including idempotent re-votes.
    pub counter_increment: BoxedCounter,
    /// Successful decrements, including idempotent re-votes.
    pub counter_decrement: BoxedCounter,
    /// Vote and estimate lookups served by a resident cell.
    pub counter_hit: BoxedCounter,
    /// Lookups that had to load the key from the storage.
    pub counter_miss: BoxedCounter,
    /// Flushes issued by the counter.
    pub counter_flush: BoxedCounter,
    /// Snapshot compare-and-swap attempts lost to a concurrent flush.
    pub counter_cas_drop: BoxedCounter,
    /// Cache clears.
    pub counter_clear: BoxedCounter,

    /// Resident keys.
    pub counter_resident_keys: BoxedGauge,

    /// Flush durations (s).
    pub counter_flush_duration: BoxedHistogram,

    /* storage metrics */
    /// Rows inserted by diff flushes.
    pub storage_added: BoxedCounter,
    /// Rows updated by diff flushes.
    pub storage_modified: BoxedCounter,
    /// Rows deleted by diff flushes.
    pub storage_deleted: BoxedCounter,
    /// Flushes that fell back to the per-entry path.
    pub storage_fallback: BoxedCounter,
    /// Keys whose persisted state did not match the caller snapshot.
    pub storage_mismatch: BoxedCounter,

    /// Batched store durations (s).
    pub storage_store_duration: BoxedHistogram,
    /// Load durations (s).
    pub storage_load_duration: BoxedHistogram,
}

impl Metrics {
    /// Create a new metric with the given name.
    pub fn new(name: impl Into<Cow<'static, str>>, registry: &dyn RegistryOps) -> Self {
        let name: Cow<'static, str> = name.into();

        /* in-memory counter metrics */

        let tally_counter_op_total = registry.register_counter_vec(
            "tally_counter_op_total".into(),
            "tally in-memory counter operations".into(),
            &["name", "op"],
        );
        let tally_counter_resident_keys = registry.register_gauge_vec(
            "tally_counter_resident_keys".into(),
            "tally in-memory counter resident keys".into(),
            &["name"],
        );
        let tally_counter_op_duration = registry.register_histogram_vec(
            "tally_counter_op_duration".into(),
            "tally in-memory counter op durations".into(),
            &["name", "op"],
        );

        let counter_increment = tally_counter_op_total.counter(&[name.clone(), "increment".into()]);
        let counter_decrement = tally_counter_op_total.counter(&[name.clone(), "decrement".into()]);
        let counter_hit = tally_counter_op_total.counter(&[name.clone(), "hit".into()]);
        let counter_miss = tally_counter_op_total.counter(&[name.clone(), "miss".into()]);
        let counter_flush = tally_counter_op_total.counter(&[name.clone(), "flush".into()]);
        let counter_cas_drop = tally_counter_op_total.counter(&[name.clone(), "cas_drop".into()]);
        let counter_clear = tally_counter_op_total.counter(&[name.clone(), "clear".into()]);

        let counter_resident_keys = tally_counter_resident_keys.gauge(&[name.clone()]);

        let counter_flush_duration = tally_counter_op_duration.histogram(&[name.clone(), "flush".into()]);

        /* storage metrics */

        let tally_storage_row_total = registry.register_counter_vec(
            "tally_storage_row_total".into(),
            "tally vote storage rows written by diff".into(),
            &["name", "op"],
        );
        let tally_storage_op_total = registry.register_counter_vec(
            "tally_storage_op_total".into(),
            "tally vote storage operations".into(),
            &["name", "op"],
        );
        let tally_storage_op_duration = registry.register_histogram_vec(
            "tally_storage_op_duration".into(),
            "tally vote storage op durations".into(),
            &["name", "op"],
        );

        let storage_added = tally_storage_row_total.counter(&[name.clone(), "added".into()]);
        let storage_modified = tally_storage_row_total.counter(&[name.clone(), "modified".into()]);
        let storage_deleted = tally_storage_row_total.counter(&[name.clone(), "deleted".into()]);

        let storage_fallback = tally_storage_op_total.counter(&[name.clone(), "fallback".into()]);
        let storage_mismatch = tally_storage_op_total.counter(&[name.clone(), "mismatch".into()]);

        let storage_store_duration = tally_storage_op_duration.histogram(&[name.clone(), "store".into()]);
        let storage_load_duration = tally_storage_op_duration.histogram(&[name, "load".into()]);

        Self {
            counter_increment,
            counter_decrement,
            counter_hit,
            counter_miss,
            counter_flush,
            counter_cas_drop,
            counter_clear,
            counter_resident_keys,
            counter_flush_duration,

            storage_added,
            storage_modified,
            storage_deleted,
            storage_fallback,
            storage_mismatch,
            storage_store_duration,
            storage_load_duration,
        }
    }

    /// Build noop metrics.
    ///
    /// Note: `noop` is only supposed to be called by other tally components.
    #[doc(hidden)]
    pub fn noop() -> Self {
        use super::registry::noop::NoopMetricsRegistry;

        Self::new("test", &NoopMetricsRegistry)
    }
}
