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

use std::collections::BTreeMap;

use itertools::Itertools;

use crate::ballot::{Actor, BallotMap, BallotSet, Key};

/// One persisted vote: `(key, actor, value)` with `value` in `{-1, 1}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VoteRow {
    /// Voted-on key.
    pub key: Key,
    /// Voter, always positive.
    pub actor: Actor,
    /// `1` for an up vote, `-1` for a down vote.
    pub value: i8,
}

impl VoteRow {
    /// Row of a signed ballot entry.
    pub fn from_entry(key: Key, entry: i32) -> Self {
        Self {
            key,
            actor: entry.abs(),
            value: if entry >= 0 { 1 } else { -1 },
        }
    }

    /// Signed ballot entry of the row.
    pub fn entry(&self) -> i32 {
        if self.value > 0 {
            self.actor
        } else {
            -self.actor
        }
    }
}

/// Minimal change set between two snapshots of ballot sets.
///
/// Rows are ordered by `(key, actor)` so that applying a diff is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diff {
    /// Votes of actors that had none.
    pub added: Vec<VoteRow>,
    /// Votes whose direction flipped, carrying the new direction.
    pub modified: Vec<VoteRow>,
    /// Actors whose vote disappeared, grouped by key.
    pub deleted: BTreeMap<Key, Vec<Actor>>,
}

impl Diff {
    /// Compute the diff transforming `prev` into `curr`.
    ///
    /// A key present only in `prev` deletes all of its actors.
    pub fn compute(curr: &BallotMap, prev: &BallotMap) -> Self {
        let empty = BallotSet::new();
        let mut diff = Diff::default();

        for key in curr.keys().chain(prev.keys()).copied().sorted_unstable().dedup() {
            let now = curr.get(&key);
            let before = prev.get(&key).unwrap_or(&empty);

            let Some(now) = now else {
                diff.delete(key, before.actors());
                continue;
            };

            for entry in now.sorted() {
                if before.contains(-entry) {
                    diff.modified.push(VoteRow::from_entry(key, entry));
                } else if !before.contains(entry) {
                    diff.added.push(VoteRow::from_entry(key, entry));
                }
            }

            let gone = before
                .iter()
                .filter(|e| !now.contains(*e) && !now.contains(-*e))
                .map(i32::abs)
                .sorted_unstable()
                .collect_vec();
            diff.delete(key, gone);
        }

        diff
    }

    fn delete(&mut self, key: Key, actors: Vec<Actor>) {
        if !actors.is_empty() {
            self.deleted.entry(key).or_default().extend(actors);
        }
    }

    /// Total number of deleted rows.
    pub fn deleted_rows(&self) -> usize {
        self.deleted.values().map(Vec::len).sum()
    }

    /// Returns `true` if applying the diff changes nothing.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    /// Keys touched by any part of the diff, in ascending order.
    pub fn keys(&self) -> Vec<Key> {
        self.added
            .iter()
            .chain(self.modified.iter())
            .map(|row| row.key)
            .chain(self.deleted.keys().copied())
            .sorted_unstable()
            .dedup()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map<const N: usize>(entries: [(Key, &[i32]); N]) -> BallotMap {
        entries
            .into_iter()
            .map(|(key, set)| (key, set.iter().copied().collect()))
            .collect()
    }

    fn row(key: Key, entry: i32) -> VoteRow {
        VoteRow::from_entry(key, entry)
    }

    #[test]
    fn test_diff_same_state_is_empty() {
        let state = map([(1, &[1, -2, 3]), (2, &[-5])]);
        let diff = Diff::compute(&state, &state);
        assert!(diff.is_empty());
    }

    #[test]
    fn test_diff_new_key_is_added() {
        let diff = Diff::compute(&map([(1000, &[1, 2, 99])]), &BallotMap::new());
        assert_eq!(diff.added, vec![row(1000, 1), row(1000, 2), row(1000, 99)]);
        assert!(diff.modified.is_empty());
        assert!(diff.deleted.is_empty());
    }

    #[test]
    fn test_diff_added_modified_deleted() {
        let prev = map([(1, &[1, -2, 3]), (2, &[4])]);
        let curr = map([(1, &[-1, -2, 5]), (2, &[4])]);
        let diff = Diff::compute(&curr, &prev);

        assert_eq!(diff.added, vec![row(1, 5)]);
        assert_eq!(diff.modified, vec![row(1, -1)]);
        assert_eq!(diff.deleted, BTreeMap::from([(1, vec![3])]));
        assert_eq!(diff.keys(), vec![1]);
    }

    #[test]
    fn test_diff_deleted_actors_are_positive() {
        let prev = map([(7, &[-3, -8, 2])]);
        let curr = map([(7, &[2])]);
        let diff = Diff::compute(&curr, &prev);
        assert_eq!(diff.deleted, BTreeMap::from([(7, vec![3, 8])]));
        assert_eq!(diff.deleted_rows(), 2);
    }

    #[test]
    fn test_diff_missing_key_deletes_all() {
        let prev = map([(1, &[1]), (2, &[-4, 6])]);
        let curr = map([(1, &[1])]);
        let diff = Diff::compute(&curr, &prev);
        assert_eq!(diff.deleted, BTreeMap::from([(2, vec![4, 6])]));
    }

    #[test]
    fn test_row_entry() {
        assert_eq!(row(1, -7), VoteRow { key: 1, actor: 7, value: -1 });
        assert_eq!(row(1, -7).entry(), -7);
        assert_eq!(row(1, 7).entry(), 7);
    }
}
