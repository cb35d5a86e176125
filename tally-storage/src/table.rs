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

use std::{collections::BTreeMap, fmt::Debug, sync::Arc};

use tally_common::{
    error::Result,
    event::{StorageKind, StoreId},
    strict_assert,
};

use crate::{
    ballot::{Actor, BallotMap, BallotSet, Key},
    diff::{Diff, VoteRow},
    engine::{DiffBackend, DiffStorage},
};

/// Default max number of keys bound to one batched select.
pub const DEFAULT_MAX_PARAMS: usize = 1000;

/// A relational table with one row per `(key, actor)` and a unique constraint over the pair.
pub trait VoteTable: Send + Sync + Debug + 'static {
    /// Table name.
    fn name(&self) -> &str;

    /// Select the rows of `keys`, or of the whole table if `keys` is `None`.
    fn select(&self, keys: Option<&[Key]>, consumer: &mut dyn FnMut(VoteRow)) -> Result<()>;

    /// Insert rows. Fails on a duplicated `(key, actor)`.
    fn insert_batch(&self, rows: &[VoteRow]) -> Result<()>;

    /// Update the value of each row matched by `(key, actor)`.
    fn update_batch(&self, rows: &[VoteRow]) -> Result<()>;

    /// Delete the rows of `key` voted by `actors`.
    fn delete_actors(&self, key: Key, actors: &[Actor]) -> Result<()>;

    /// Update the row matched by `(key, actor)`, or insert it if there is none.
    fn update_or_insert(&self, row: VoteRow) -> Result<()>;
}

impl<T> VoteTable for Arc<T>
where
    T: VoteTable,
{
    fn name(&self) -> &str {
        self.as_ref().name()
    }

    fn select(&self, keys: Option<&[Key]>, consumer: &mut dyn FnMut(VoteRow)) -> Result<()> {
        self.as_ref().select(keys, consumer)
    }

    fn insert_batch(&self, rows: &[VoteRow]) -> Result<()> {
        self.as_ref().insert_batch(rows)
    }

    fn update_batch(&self, rows: &[VoteRow]) -> Result<()> {
        self.as_ref().update_batch(rows)
    }

    fn delete_actors(&self, key: Key, actors: &[Actor]) -> Result<()> {
        self.as_ref().delete_actors(key, actors)
    }

    fn update_or_insert(&self, row: VoteRow) -> Result<()> {
        self.as_ref().update_or_insert(row)
    }
}

/// [`DiffBackend`] over a [`VoteTable`].
#[derive(Debug)]
pub struct TableBackend<T>
where
    T: VoteTable,
{
    id: StoreId,
    table: T,
    max_params: usize,
}

impl<T> TableBackend<T>
where
    T: VoteTable,
{
    /// Create a backend over `table`.
    pub fn new(table: T) -> Self {
        let id = StoreId::new(StorageKind::Sql, table.name());
        Self {
            id,
            table,
            max_params: DEFAULT_MAX_PARAMS,
        }
    }

    /// Set the max number of keys bound to one select. Larger batches are split.
    ///
    /// Default: [`DEFAULT_MAX_PARAMS`].
    pub fn with_max_params(mut self, max_params: usize) -> Self {
        assert!(max_params > 0, "max params must be positive");
        self.max_params = max_params;
        self
    }

    /// Wrap into a [`DiffStorage`].
    pub fn into_storage(self) -> DiffStorage<Self> {
        DiffStorage::new(self)
    }

    /// The wrapped table.
    pub fn table(&self) -> &T {
        &self.table
    }

    fn group(&self, keys: Option<&[Key]>, consumer: &mut dyn FnMut(Key, BallotSet)) -> Result<()> {
        // Rows of one key may arrive in any order.
        let mut grouped: BTreeMap<Key, BallotSet> = BTreeMap::new();
        self.table.select(keys, &mut |row| {
            strict_assert!(row.value == 1 || row.value == -1, "value outside of range: {}", row.value);
            grouped.entry(row.key).or_default().insert(row.entry());
        })?;
        for (key, set) in grouped {
            consumer(key, set);
        }
        Ok(())
    }
}

impl<T> DiffBackend for TableBackend<T>
where
    T: VoteTable,
{
    fn store_id(&self) -> &StoreId {
        &self.id
    }

    fn load(&self, key: Key) -> Result<BallotSet> {
        let mut set = BallotSet::new();
        self.table.select(Some(std::slice::from_ref(&key)), &mut |row| set.insert(row.entry()))?;
        Ok(set)
    }

    fn load_batch(&self, keys: &[Key], consumer: &mut dyn FnMut(Key, BallotSet)) -> Result<()> {
        for chunk in keys.chunks(self.max_params) {
            self.group(Some(chunk), consumer)?;
        }
        Ok(())
    }

    fn load_all(&self, consumer: &mut dyn FnMut(Key, BallotSet)) -> Result<()> {
        self.group(None, consumer)
    }

    fn apply(&self, diff: &Diff, _: &BallotMap) -> Result<()> {
        if !diff.added.is_empty() {
            self.table.insert_batch(&diff.added)?;
        }
        if !diff.modified.is_empty() {
            self.table.update_batch(&diff.modified)?;
        }
        for (key, actors) in diff.deleted.iter() {
            self.table.delete_actors(*key, actors)?;
        }
        Ok(())
    }

    fn apply_ultra_safe(&self, curr: &BallotMap) -> Result<()> {
        for (key, set) in curr.iter() {
            for entry in set.iter() {
                self.table.update_or_insert(VoteRow::from_entry(*key, entry))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{memory::MemoryVoteTable, storage::VoteStorage};

    fn rows(entries: &[(Key, i32)]) -> Vec<VoteRow> {
        entries.iter().map(|(key, entry)| VoteRow::from_entry(*key, *entry)).collect()
    }

    #[test]
    fn test_store_id() {
        let backend = TableBackend::new(MemoryVoteTable::new("user_rate"));
        assert_eq!(backend.store_id(), &StoreId::new(StorageKind::Sql, "user_rate"));
    }

    #[test]
    fn test_load_groups_rows() {
        let table = MemoryVoteTable::new("votes");
        table.insert_batch(&rows(&[(1, 1), (1, -2), (2, 3), (3, -4)])).unwrap();
        let backend = TableBackend::new(table);

        assert_eq!(backend.load(1).unwrap(), BallotSet::from([1, -2]));
        assert!(backend.load(42).unwrap().is_empty());

        let mut loaded = BallotMap::new();
        backend
            .load_all(&mut |key, set| {
                loaded.insert(key, set);
            })
            .unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded[&3], BallotSet::from([-4]));
    }

    #[test]
    fn test_load_batch_is_chunked() {
        let table = MemoryVoteTable::new("votes");
        let entries = (1..=10).map(|key| (key, key)).collect::<Vec<_>>();
        table.insert_batch(&rows(&entries)).unwrap();
        let storage = TableBackend::new(table).with_max_params(3).into_storage();

        let keys = (1..=12).collect::<Vec<_>>();
        let loaded = storage.load_batch_map(&keys).unwrap();
        assert_eq!(loaded.len(), 10);
        assert_eq!(storage.backend().table().selects(), 4);
        for key in 1..=10 {
            assert_eq!(loaded[&key], BallotSet::from([key]));
        }
    }

    #[test]
    fn test_apply_ultra_safe_overwrites() {
        let table = MemoryVoteTable::new("votes");
        table.insert_batch(&rows(&[(1, 1), (1, 2)])).unwrap();
        let backend = TableBackend::new(table);

        let curr = BallotMap::from([(1, BallotSet::from([-1, 3]))]);
        backend.apply_ultra_safe(&curr).unwrap();
        assert_eq!(backend.load(1).unwrap(), BallotSet::from([-1, 2, 3]));
    }
}
