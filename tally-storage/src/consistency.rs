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

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tally_common::{error::Result, event::StoreId};

use crate::{
    ballot::{BallotMap, BallotSet, Key},
    engine::DiffBackend,
};

/// Max mismatched keys reported per check.
pub const MAX_REPORTED_MISMATCHES: usize = 10;

/// Verification of a caller snapshot against the persisted state before it is used as a diff baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencyCheck {
    /// Trust the snapshot.
    Disabled,
    /// Load the persisted state and log the mismatches.
    Warn,
    /// Like [`ConsistencyCheck::Warn`], then panic on any mismatch.
    ///
    /// Only for single-flusher setups: concurrent flushes legitimately observe each other's writes.
    Strict,
}

impl Default for ConsistencyCheck {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            ConsistencyCheck::Warn
        } else {
            ConsistencyCheck::Disabled
        }
    }
}

/// A key whose persisted set differs from the expected one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatch {
    /// Mismatched key.
    pub key: Key,
    /// Set the caller expected to be persisted.
    pub expected: BallotSet,
    /// Set actually persisted.
    pub actual: BallotSet,
}

impl Mismatch {
    /// Entries persisted by someone else.
    pub fn added(&self) -> Vec<i32> {
        self.actual.iter().filter(|e| !self.expected.contains(*e)).sorted_unstable().collect()
    }

    /// Entries removed by someone else.
    pub fn removed(&self) -> Vec<i32> {
        self.expected.iter().filter(|e| !self.actual.contains(*e)).sorted_unstable().collect()
    }
}

/// Compare `prev`, extended with empty sets for the keys only present in `curr`, with the persisted state.
///
/// Mismatches are returned in key order.
pub fn collect_mismatches<B>(backend: &B, curr: &BallotMap, prev: &BallotMap) -> Result<Vec<Mismatch>>
where
    B: DiffBackend + ?Sized,
{
    let keys = curr.keys().chain(prev.keys()).copied().sorted_unstable().dedup().collect_vec();

    let mut actual = BallotMap::with_capacity(keys.len());
    backend.load_batch(&keys, &mut |key, set| {
        actual.insert(key, set);
    })?;

    let empty = BallotSet::new();
    let mismatches = keys
        .into_iter()
        .filter_map(|key| {
            let expected = prev.get(&key).unwrap_or(&empty);
            let persisted = actual.remove(&key).unwrap_or_default();
            (expected != &persisted).then(|| Mismatch {
                key,
                expected: expected.clone(),
                actual: persisted,
            })
        })
        .collect();
    Ok(mismatches)
}

/// Log the mismatches according to `mode`.
pub fn report(store: &StoreId, mode: ConsistencyCheck, mismatches: &[Mismatch]) {
    if mismatches.is_empty() {
        return;
    }

    tracing::warn!(
        "[consistency]: storage {store} state changed for {} keys and will be overwritten from cache",
        mismatches.len()
    );
    for mismatch in mismatches.iter().take(MAX_REPORTED_MISMATCHES) {
        tracing::warn!(
            "[consistency]: key={} added={:?} removed={:?}",
            mismatch.key,
            mismatch.added(),
            mismatch.removed()
        );
    }

    assert!(
        mode != ConsistencyCheck::Strict,
        "storage {store} diverged from the flushed snapshot for {} keys",
        mismatches.len()
    );
}
