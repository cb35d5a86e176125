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

use std::{collections::HashMap, fmt::Debug};

use hashbrown::HashSet;
use itertools::Itertools;
use tally_common::{assert_actor, strict_assert};

/// Identifier of the voted-on subject. Always positive.
pub type Key = i32;

/// Identifier of a voter. Always positive.
pub type Actor = i32;

/// Ballot sets of many keys.
pub type BallotMap = HashMap<Key, BallotSet>;

/// The vote of one actor for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Vote {
    /// `-1`
    Down,
    /// `0`
    #[default]
    None,
    /// `+1`
    Up,
}

impl Vote {
    /// Numeric value of the vote, one of `-1`, `0`, `1`.
    pub fn value(self) -> i8 {
        match self {
            Vote::Down => -1,
            Vote::None => 0,
            Vote::Up => 1,
        }
    }

    /// Vote encoded by the sign of `value`.
    pub fn from_sign(value: i64) -> Self {
        match value.signum() {
            1 => Vote::Up,
            -1 => Vote::Down,
            _ => Vote::None,
        }
    }
}

impl From<Vote> for i32 {
    fn from(vote: Vote) -> Self {
        vote.value() as _
    }
}

/// The set of signed actor ids voted for one key.
///
/// An entry `+a` is an up vote of actor `a`, `-a` a down vote. `0` is never stored and at most one of `+a` and `-a`
/// is present at any time.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct BallotSet {
    entries: HashSet<i32>,
}

impl Debug for BallotSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.sorted()).finish()
    }
}

impl FromIterator<i32> for BallotSet {
    fn from_iter<T: IntoIterator<Item = i32>>(iter: T) -> Self {
        let mut set = Self::new();
        for entry in iter {
            set.insert(entry);
        }
        set
    }
}

impl<const N: usize> From<[i32; N]> for BallotSet {
    fn from(entries: [i32; N]) -> Self {
        entries.into_iter().collect()
    }
}

impl BallotSet {
    /// Create an empty ballot set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries, which is also the number of actors that voted.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nobody voted.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns `true` if the signed entry is present.
    pub fn contains(&self, entry: i32) -> bool {
        self.entries.contains(&entry)
    }

    /// Iterate the signed entries in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = i32> + '_ {
        self.entries.iter().copied()
    }

    /// Signed entries in ascending order.
    pub fn sorted(&self) -> Vec<i32> {
        self.entries.iter().copied().sorted_unstable().collect()
    }

    /// Insert a raw signed entry, replacing the opposite vote of the same actor if present.
    ///
    /// Used to materialize persisted rows. Votes must go through [`BallotSet::toggle`].
    pub fn insert(&mut self, entry: i32) {
        strict_assert!(entry != 0, "ballot entry must not be zero");
        self.entries.remove(&-entry);
        self.entries.insert(entry);
    }

    /// Remove a raw signed entry. Returns `true` if it was present.
    pub fn remove(&mut self, entry: i32) -> bool {
        self.entries.remove(&entry)
    }

    /// The vote of `actor`.
    pub fn vote_of(&self, actor: Actor) -> Vote {
        assert_actor!(actor);
        if self.entries.contains(&actor) {
            Vote::Up
        } else if self.entries.contains(&-actor) {
            Vote::Down
        } else {
            Vote::None
        }
    }

    /// Apply one vote toggle and return the change of the aggregate.
    ///
    /// `signed` is `actor` with `delta = 1` for an up vote and `-actor` with `delta = -1` for a down vote.
    ///
    /// 1. The opposite vote is withdrawn if present.
    /// 2. Otherwise the vote is recorded if absent.
    /// 3. Otherwise nothing changes and `0` is returned.
    pub fn toggle(&mut self, signed: i32, delta: i64) -> i64 {
        strict_assert!(signed != 0);
        strict_assert!(delta == 1 || delta == -1);
        strict_assert!(signed.signum() as i64 == delta, "sign of the entry must match delta");

        if self.entries.remove(&-signed) {
            return delta;
        }
        if self.entries.insert(signed) {
            return delta;
        }
        0
    }

    /// Up vote of `actor`. Returns the change of the aggregate.
    pub fn increment(&mut self, actor: Actor) -> i64 {
        assert_actor!(actor);
        self.toggle(actor, 1)
    }

    /// Down vote of `actor`. Returns the change of the aggregate.
    pub fn decrement(&mut self, actor: Actor) -> i64 {
        assert_actor!(actor);
        self.toggle(-actor, -1)
    }

    /// Signed sum of the entries, recomputed from scratch.
    pub fn aggregate(&self) -> i64 {
        self.entries.iter().map(|e| e.signum() as i64).sum()
    }

    /// Actors that voted, in ascending order.
    pub fn actors(&self) -> Vec<Actor> {
        self.entries.iter().map(|e| e.abs()).sorted_unstable().collect()
    }

    /// Returns `true` if no actor has both an up and a down entry.
    pub fn is_consistent(&self) -> bool {
        self.entries.iter().all(|e| *e != 0 && !self.entries.contains(&-e))
    }
}

/// Signed sum of every set in the map.
pub fn total(map: &BallotMap) -> i64 {
    map.values().map(BallotSet::aggregate).sum()
}

#[cfg(test)]
mod tests {
    use rand::{rngs::SmallRng, Rng, SeedableRng};

    use super::*;

    #[test]
    fn test_toggle_idempotence() {
        let mut set = BallotSet::new();
        assert_eq!(set.increment(1), 1);
        assert_eq!(set.increment(1), 0);
        assert_eq!(set.sorted(), vec![1]);

        assert_eq!(set.decrement(2), -1);
        assert_eq!(set.decrement(2), 0);
        assert_eq!(set.sorted(), vec![-2, 1]);
    }

    #[test]
    fn test_flip_withdraws_opposite_vote() {
        let mut set = BallotSet::from([1]);
        assert_eq!(set.decrement(1), -1);
        assert!(set.is_empty());
        assert_eq!(set.vote_of(1), Vote::None);

        assert_eq!(set.decrement(1), -1);
        assert_eq!(set.vote_of(1), Vote::Down);
        assert_eq!(set.increment(1), 1);
        assert_eq!(set.vote_of(1), Vote::None);
    }

    #[test]
    fn test_toggle_sequence() {
        let mut set = BallotSet::new();
        let mut count = 0;
        let mut seen = vec![];
        for up in [false, false, true, true, true, false, false] {
            count += if up { set.increment(1) } else { set.decrement(1) };
            seen.push(count);
        }
        assert_eq!(seen, vec![-1, -1, 0, 1, 1, 0, -1]);
    }

    #[test]
    fn test_insert_replaces_opposite() {
        let mut set = BallotSet::from([3, -4]);
        set.insert(-3);
        set.insert(4);
        assert_eq!(set.sorted(), vec![-3, 4]);
        assert!(set.is_consistent());
        assert_eq!(set.actors(), vec![3, 4]);
    }

    #[test]
    fn test_random_votes_keep_sum_invariant() {
        let mut rng = SmallRng::seed_from_u64(114514);
        let mut set = BallotSet::new();
        let mut aggregate = 0;
        for _ in 0..10000 {
            let actor = rng.random_range(1..=20);
            aggregate += if rng.random_bool(0.5) {
                set.increment(actor)
            } else {
                set.decrement(actor)
            };
            assert_eq!(aggregate, set.aggregate());
            assert!(set.is_consistent());
        }
    }

    #[test]
    #[should_panic]
    fn test_zero_actor() {
        BallotSet::new().increment(0);
    }

    #[test]
    fn test_vote_value() {
        assert_eq!(Vote::from_sign(-7), Vote::Down);
        assert_eq!(Vote::from_sign(0), Vote::None);
        assert_eq!(i32::from(Vote::Up), 1);
    }

    #[test]
    fn test_debug_is_sorted() {
        let set = BallotSet::from([99, -2, 1]);
        assert_eq!(format!("{set:?}"), "{-2, 1, 99}");
    }
}
