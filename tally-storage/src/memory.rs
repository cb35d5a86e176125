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

//! In-memory backends with failure injection.

use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use bytes::Bytes;
use hashbrown::HashSet;
use parking_lot::RwLock;
use tally_common::error::{Error, ErrorKind, Result};

use crate::{
    ballot::{Actor, Key},
    diff::VoteRow,
    kv::{KeyValueDb, KvWrite},
    table::VoteTable,
};

#[derive(Debug, Default)]
struct Faults {
    batches: AtomicUsize,
    offline: AtomicBool,
}

impl Faults {
    fn check(&self, name: &str, op: &'static str) -> Result<()> {
        if self.offline.load(Ordering::Acquire) {
            return Err(Self::error(name, op, "backend is offline"));
        }
        Ok(())
    }

    fn check_batch(&self, name: &str, op: &'static str) -> Result<()> {
        self.check(name, op)?;
        if self
            .batches
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Self::error(name, op, "injected batch failure"));
        }
        Ok(())
    }

    fn error(name: &str, op: &'static str, message: &'static str) -> Error {
        Error::new(ErrorKind::Connection, message)
            .with_context("store", name)
            .with_context("op", op)
    }
}

/// Relational table kept in memory.
///
/// Batches are not transactional: a failing batch keeps the rows it wrote before the failure.
#[derive(Debug)]
pub struct MemoryVoteTable {
    name: String,
    rows: RwLock<BTreeMap<(Key, Actor), i8>>,
    faults: Faults,
    selects: AtomicUsize,
}

impl MemoryVoteTable {
    /// Create an empty table.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rows: RwLock::new(BTreeMap::new()),
            faults: Faults::default(),
            selects: AtomicUsize::new(0),
        }
    }

    /// Fail the next `n` batched writes.
    pub fn fail_batches(&self, n: usize) {
        self.faults.batches.store(n, Ordering::Release);
    }

    /// Fail every operation while `offline` is set.
    pub fn set_offline(&self, offline: bool) {
        self.faults.offline.store(offline, Ordering::Release);
    }

    /// All rows ordered by `(key, actor)`.
    pub fn rows(&self) -> Vec<VoteRow> {
        self.rows
            .read()
            .iter()
            .map(|(&(key, actor), &value)| VoteRow { key, actor, value })
            .collect()
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    /// Returns `true` if the table has no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    /// Number of selects served so far.
    pub fn selects(&self) -> usize {
        self.selects.load(Ordering::Relaxed)
    }
}

impl VoteTable for MemoryVoteTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn select(&self, keys: Option<&[Key]>, consumer: &mut dyn FnMut(VoteRow)) -> Result<()> {
        self.faults.check(&self.name, "select")?;
        self.selects.fetch_add(1, Ordering::Relaxed);

        let rows = {
            let rows = self.rows.read();
            match keys {
                Some(keys) => {
                    let keys = keys.iter().copied().collect::<HashSet<_>>();
                    rows.iter()
                        .filter(|((key, _), _)| keys.contains(key))
                        .map(|(&(key, actor), &value)| VoteRow { key, actor, value })
                        .collect::<Vec<_>>()
                }
                None => rows
                    .iter()
                    .map(|(&(key, actor), &value)| VoteRow { key, actor, value })
                    .collect(),
            }
        };
        rows.into_iter().for_each(consumer);
        Ok(())
    }

    fn insert_batch(&self, rows: &[VoteRow]) -> Result<()> {
        self.faults.check_batch(&self.name, "insert")?;
        let mut table = self.rows.write();
        for row in rows {
            if table.contains_key(&(row.key, row.actor)) {
                return Err(Error::duplicated_vote(row.key, row.actor).with_context("store", &self.name));
            }
            table.insert((row.key, row.actor), row.value);
        }
        Ok(())
    }

    fn update_batch(&self, rows: &[VoteRow]) -> Result<()> {
        self.faults.check_batch(&self.name, "update")?;
        let mut table = self.rows.write();
        for row in rows {
            if let Some(value) = table.get_mut(&(row.key, row.actor)) {
                *value = row.value;
            }
        }
        Ok(())
    }

    fn delete_actors(&self, key: Key, actors: &[Actor]) -> Result<()> {
        self.faults.check_batch(&self.name, "delete")?;
        let mut table = self.rows.write();
        for actor in actors {
            table.remove(&(key, *actor));
        }
        Ok(())
    }

    fn update_or_insert(&self, row: VoteRow) -> Result<()> {
        self.faults.check(&self.name, "update_or_insert")?;
        self.rows.write().insert((row.key, row.actor), row.value);
        Ok(())
    }
}

/// Key-value store kept in memory.
#[derive(Debug)]
pub struct MemoryKvDb {
    name: String,
    map: RwLock<BTreeMap<Key, Bytes>>,
    faults: Faults,
}

impl MemoryKvDb {
    /// Create an empty store.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            map: RwLock::new(BTreeMap::new()),
            faults: Faults::default(),
        }
    }

    /// Fail the next `n` batched writes.
    pub fn fail_batches(&self, n: usize) {
        self.faults.batches.store(n, Ordering::Release);
    }

    /// Fail every operation while `offline` is set.
    pub fn set_offline(&self, offline: bool) {
        self.faults.offline.store(offline, Ordering::Release);
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    /// Returns `true` if the store has no keys.
    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    /// Remove one key.
    pub fn delete(&self, key: Key) -> Result<()> {
        self.faults.check(&self.name, "delete")?;
        self.map.write().remove(&key);
        Ok(())
    }
}

impl KeyValueDb for MemoryKvDb {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: Key) -> Result<Option<Bytes>> {
        self.faults.check(&self.name, "get")?;
        Ok(self.map.read().get(&key).cloned())
    }

    fn get_batch(&self, keys: &[Key], consumer: &mut dyn FnMut(Key, Bytes)) -> Result<()> {
        self.faults.check(&self.name, "get_batch")?;
        let values = {
            let map = self.map.read();
            keys.iter()
                .filter_map(|key| map.get(key).map(|value| (*key, value.clone())))
                .collect::<Vec<_>>()
        };
        for (key, value) in values {
            consumer(key, value);
        }
        Ok(())
    }

    fn scan(&self, consumer: &mut dyn FnMut(Key, Bytes)) -> Result<()> {
        self.faults.check(&self.name, "scan")?;
        let values = self
            .map
            .read()
            .iter()
            .map(|(key, value)| (*key, value.clone()))
            .collect::<Vec<_>>();
        for (key, value) in values {
            consumer(key, value);
        }
        Ok(())
    }

    fn write_batch(&self, writes: &[KvWrite]) -> Result<()> {
        self.faults.check_batch(&self.name, "write_batch")?;
        let mut map = self.map.write();
        for write in writes {
            match write {
                KvWrite::Put(key, value) => {
                    map.insert(*key, value.clone());
                }
                KvWrite::Delete(key) => {
                    map.remove(key);
                }
            }
        }
        Ok(())
    }

    fn put(&self, key: Key, value: Bytes) -> Result<()> {
        self.faults.check(&self.name, "put")?;
        self.map.write().insert(key, value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(key: Key, actor: Actor, value: i8) -> VoteRow {
        VoteRow { key, actor, value }
    }

    #[test]
    fn test_insert_duplicated_is_partial() {
        let table = MemoryVoteTable::new("votes");
        table.insert_batch(&[row(1, 2, 1)]).unwrap();

        let err = table
            .insert_batch(&[row(1, 1, 1), row(1, 2, -1), row(1, 3, 1)])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Constraint);
        assert_eq!(table.rows(), vec![row(1, 1, 1), row(1, 2, 1)]);
    }

    #[test]
    fn test_update_skips_missing_rows() {
        let table = MemoryVoteTable::new("votes");
        table.insert_batch(&[row(1, 1, 1)]).unwrap();
        table.update_batch(&[row(1, 1, -1), row(1, 2, -1)]).unwrap();
        assert_eq!(table.rows(), vec![row(1, 1, -1)]);

        table.update_or_insert(row(1, 2, -1)).unwrap();
        table.delete_actors(1, &[1]).unwrap();
        assert_eq!(table.rows(), vec![row(1, 2, -1)]);
    }

    #[test]
    fn test_fail_batches() {
        let table = MemoryVoteTable::new("votes");
        table.fail_batches(2);
        assert_eq!(table.insert_batch(&[row(1, 1, 1)]).unwrap_err().kind(), ErrorKind::Connection);
        assert!(table.delete_actors(1, &[1]).is_err());
        // Single writes are not batches.
        table.update_or_insert(row(1, 1, 1)).unwrap();
        table.update_batch(&[row(1, 1, -1)]).unwrap();
        assert_eq!(table.rows(), vec![row(1, 1, -1)]);
    }

    #[test]
    fn test_offline() {
        let db = MemoryKvDb::new("votes");
        db.put(1, Bytes::from_static(b"v")).unwrap();
        db.set_offline(true);
        assert!(db.get(1).is_err());
        assert!(db.scan(&mut |_, _| {}).is_err());
        db.set_offline(false);
        assert_eq!(db.get(1).unwrap(), Some(Bytes::from_static(b"v")));

        db.fail_batches(1);
        assert!(db.write_batch(&[KvWrite::Delete(1)]).is_err());
        db.write_batch(&[KvWrite::Delete(1)]).unwrap();
        assert!(db.is_empty());
    }
}
