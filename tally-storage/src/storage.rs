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

use std::fmt::Debug;

use tally_common::{error::Result, event::StoreId};

use crate::ballot::{BallotMap, BallotSet, Key};

/// What a flush is diffed against.
#[derive(Debug, Clone, Copy)]
pub enum Baseline<'a> {
    /// The state the caller believes is persisted for every key it flushes.
    ///
    /// Keys present here but missing from `curr` lose all their votes.
    Snapshot(&'a BallotMap),
    /// Read the persisted state of the keys of `curr` from the backend right before diffing.
    Fresh,
}

/// Outcome of [`VoteStorage::store_batch`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreReport {
    /// Rows recorded for actors that had no persisted vote.
    pub added: usize,
    /// Rows whose direction flipped.
    pub modified: usize,
    /// Rows dropped.
    pub deleted: usize,
    /// `true` if the batched path failed and every entry was written one by one instead.
    ///
    /// The fallback never removes rows, so stale votes may stay persisted until the next fresh flush.
    pub fallback: bool,
}

impl StoreReport {
    /// Returns `true` if nothing was written.
    pub fn is_noop(&self) -> bool {
        !self.fallback && self.added == 0 && self.modified == 0 && self.deleted == 0
    }
}

/// Durable backend of ballot sets.
///
/// Implementations need no locking of their own: the counters serialize flushes of the same key where required.
pub trait VoteStorage: Send + Sync + Debug + 'static {
    /// Identity of the backend.
    fn store_id(&self) -> &StoreId;

    /// Load the persisted set of one key. Unknown keys load as an empty set.
    fn load(&self, key: Key) -> Result<BallotSet>;

    /// Load the persisted sets of `keys`, calling `consumer` once per key that has at least one vote.
    fn load_batch(&self, keys: &[Key], consumer: &mut dyn FnMut(Key, BallotSet)) -> Result<()>;

    /// Load every persisted set, calling `consumer` once per key that has at least one vote.
    fn load_all(&self, consumer: &mut dyn FnMut(Key, BallotSet)) -> Result<()>;

    /// Persist `curr` by writing only the difference against `baseline`.
    fn store_batch(&self, curr: &BallotMap, baseline: Baseline<'_>) -> Result<StoreReport>;

    /// [`VoteStorage::load_batch`] collected into a map.
    fn load_batch_map(&self, keys: &[Key]) -> Result<BallotMap> {
        let mut map = BallotMap::with_capacity(keys.len());
        self.load_batch(keys, &mut |key, set| {
            map.insert(key, set);
        })?;
        Ok(map)
    }

    /// [`VoteStorage::load_all`] collected into a map.
    fn load_all_map(&self) -> Result<BallotMap> {
        let mut map = BallotMap::new();
        self.load_all(&mut |key, set| {
            map.insert(key, set);
        })?;
        Ok(map)
    }
}
