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

use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tally_common::strict_assert_eq;
use tally_storage::ballot::{Actor, BallotSet, Vote};

use crate::striped::StripedCounter;

/// Per-key state of the lock-based counter. Guarded by the counter lock.
#[derive(Debug, Clone, Default)]
pub struct LockedCell {
    ballots: BallotSet,
    aggregate: i64,
}

impl LockedCell {
    /// Create a cell, computing the aggregate from scratch.
    pub fn new(ballots: BallotSet) -> Self {
        let aggregate = ballots.aggregate();
        Self { ballots, aggregate }
    }

    /// Up vote. Returns the aggregate after the vote.
    pub fn increment(&mut self, actor: Actor) -> i64 {
        self.aggregate += self.ballots.increment(actor);
        strict_assert_eq!(self.aggregate, self.ballots.aggregate());
        self.aggregate
    }

    /// Down vote. Returns the aggregate after the vote.
    pub fn decrement(&mut self, actor: Actor) -> i64 {
        self.aggregate += self.ballots.decrement(actor);
        strict_assert_eq!(self.aggregate, self.ballots.aggregate());
        self.aggregate
    }

    /// The vote of `actor`.
    pub fn vote_of(&self, actor: Actor) -> Vote {
        self.ballots.vote_of(actor)
    }

    /// The aggregate.
    pub fn aggregate(&self) -> i64 {
        self.aggregate
    }

    /// The live ballot set.
    pub fn ballots(&self) -> &BallotSet {
        &self.ballots
    }
}

/// Per-key state of the non-blocking counter.
///
/// Votes are serialized by the cell mutex. The aggregate can be read without it. The snapshot is the ballot set
/// believed to be persisted and is only replaced by flushes.
#[derive(Debug)]
pub struct SharedCell {
    ballots: Mutex<BallotSet>,
    aggregate: StripedCounter,
    snapshot: ArcSwap<BallotSet>,
}

impl SharedCell {
    /// Create a cell from the persisted set.
    pub fn new(ballots: BallotSet, stripes: usize) -> Self {
        let aggregate = StripedCounter::new(stripes, ballots.aggregate());
        let snapshot = ArcSwap::from_pointee(ballots.clone());
        Self {
            ballots: Mutex::new(ballots),
            aggregate,
            snapshot,
        }
    }

    /// Up vote. Returns the aggregate after the vote.
    pub fn increment(&self, actor: Actor) -> i64 {
        let mut ballots = self.ballots.lock();
        let delta = ballots.increment(actor);
        self.apply(delta)
    }

    /// Down vote. Returns the aggregate after the vote.
    pub fn decrement(&self, actor: Actor) -> i64 {
        let mut ballots = self.ballots.lock();
        let delta = ballots.decrement(actor);
        self.apply(delta)
    }

    // Must be called with the ballots locked: the sum is exact only while no other vote can land.
    fn apply(&self, delta: i64) -> i64 {
        if delta != 0 {
            self.aggregate.add(delta);
        }
        self.aggregate.sum()
    }

    /// The vote of `actor`.
    pub fn vote_of(&self, actor: Actor) -> Vote {
        self.ballots.lock().vote_of(actor)
    }

    /// The aggregate, read without locking.
    pub fn estimate(&self) -> i64 {
        self.aggregate.sum()
    }

    /// Copy of the live ballot set.
    pub fn copy_ballots(&self) -> BallotSet {
        self.ballots.lock().clone()
    }

    /// The ballot set believed to be persisted.
    pub fn snapshot(&self) -> Arc<BallotSet> {
        self.snapshot.load_full()
    }

    /// Replace the snapshot with `snapshot` if it is still `expected`.
    ///
    /// Single attempt: returns `false` if another flush replaced it first.
    pub fn update_snapshot(&self, expected: &Arc<BallotSet>, snapshot: Arc<BallotSet>) -> bool {
        let prev = self.snapshot.compare_and_swap(expected, snapshot);
        Arc::ptr_eq(&prev, expected)
    }
}
