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

use std::{fmt::Debug, sync::Arc};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tally_common::{
    error::{Error, Result},
    event::{StorageKind, StoreId},
};

use crate::{
    ballot::{BallotMap, BallotSet, Key},
    diff::Diff,
    engine::{DiffBackend, DiffStorage},
};

/// One write of a key-value batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvWrite {
    /// Set the value of the key.
    Put(Key, Bytes),
    /// Remove the key.
    Delete(Key),
}

/// A key-value store holding one encoded [`BallotSet`] per key.
pub trait KeyValueDb: Send + Sync + Debug + 'static {
    /// Database name.
    fn name(&self) -> &str;

    /// Value of `key`, if any.
    fn get(&self, key: Key) -> Result<Option<Bytes>>;

    /// Values of the present `keys`.
    fn get_batch(&self, keys: &[Key], consumer: &mut dyn FnMut(Key, Bytes)) -> Result<()>;

    /// Every key and value.
    fn scan(&self, consumer: &mut dyn FnMut(Key, Bytes)) -> Result<()>;

    /// Apply the writes in order.
    fn write_batch(&self, writes: &[KvWrite]) -> Result<()>;

    /// Set the value of one key.
    fn put(&self, key: Key, value: Bytes) -> Result<()>;
}

impl<D> KeyValueDb for Arc<D>
where
    D: KeyValueDb,
{
    fn name(&self) -> &str {
        self.as_ref().name()
    }

    fn get(&self, key: Key) -> Result<Option<Bytes>> {
        self.as_ref().get(key)
    }

    fn get_batch(&self, keys: &[Key], consumer: &mut dyn FnMut(Key, Bytes)) -> Result<()> {
        self.as_ref().get_batch(keys, consumer)
    }

    fn scan(&self, consumer: &mut dyn FnMut(Key, Bytes)) -> Result<()> {
        self.as_ref().scan(consumer)
    }

    fn write_batch(&self, writes: &[KvWrite]) -> Result<()> {
        self.as_ref().write_batch(writes)
    }

    fn put(&self, key: Key, value: Bytes) -> Result<()> {
        self.as_ref().put(key, value)
    }
}

/// Encode a ballot set as a big-endian `i32` count followed by the entries in ascending order.
pub fn encode(set: &BallotSet) -> Bytes {
    let entries = set.sorted();
    let mut buf = BytesMut::with_capacity(4 + entries.len() * 4);
    buf.put_i32(entries.len() as _);
    for entry in entries {
        buf.put_i32(entry);
    }
    buf.freeze()
}

/// Decode a ballot set written by [`encode`].
pub fn decode(mut buf: &[u8]) -> Result<BallotSet> {
    let len = buf.len();
    if buf.remaining() < 4 {
        return Err(Error::malformed("ballot set header is truncated", len));
    }
    let count = buf.get_i32();
    if count < 0 || buf.remaining() != count as usize * 4 {
        return Err(Error::malformed("ballot set length mismatch", len).with_context("count", count));
    }

    let mut set = BallotSet::new();
    for _ in 0..count {
        let entry = buf.get_i32();
        if entry == 0 || entry == i32::MIN || set.contains(-entry) {
            return Err(Error::malformed("invalid ballot entry", len).with_context("entry", entry));
        }
        set.insert(entry);
    }
    Ok(set)
}

/// [`DiffBackend`] over a [`KeyValueDb`].
///
/// A changed key is rewritten as a whole, or deleted once nobody votes for it.
#[derive(Debug)]
pub struct KvBackend<D>
where
    D: KeyValueDb,
{
    id: StoreId,
    db: D,
}

impl<D> KvBackend<D>
where
    D: KeyValueDb,
{
    /// Create a backend over `db`.
    pub fn new(db: D) -> Self {
        let id = StoreId::new(StorageKind::KeyValue, db.name());
        Self { id, db }
    }

    /// Wrap into a [`DiffStorage`].
    pub fn into_storage(self) -> DiffStorage<Self> {
        DiffStorage::new(self)
    }

    /// The wrapped database.
    pub fn db(&self) -> &D {
        &self.db
    }

    fn decode_each(
        consumer: &mut dyn FnMut(Key, BallotSet),
        visit: impl FnOnce(&mut dyn FnMut(Key, Bytes)) -> Result<()>,
    ) -> Result<()> {
        let mut res = Ok(());
        visit(&mut |key, value| {
            if res.is_err() {
                return;
            }
            match decode(&value) {
                Ok(set) if set.is_empty() => {}
                Ok(set) => consumer(key, set),
                Err(e) => res = Err(e.with_context("key", key)),
            }
        })?;
        res
    }
}

impl<D> DiffBackend for KvBackend<D>
where
    D: KeyValueDb,
{
    fn store_id(&self) -> &StoreId {
        &self.id
    }

    fn load(&self, key: Key) -> Result<BallotSet> {
        match self.db.get(key)? {
            Some(value) => decode(&value).map_err(|e| e.with_context("key", key)),
            None => Ok(BallotSet::new()),
        }
    }

    fn load_batch(&self, keys: &[Key], consumer: &mut dyn FnMut(Key, BallotSet)) -> Result<()> {
        Self::decode_each(consumer, |visit| self.db.get_batch(keys, visit))
    }

    fn load_all(&self, consumer: &mut dyn FnMut(Key, BallotSet)) -> Result<()> {
        Self::decode_each(consumer, |visit| self.db.scan(visit))
    }

    fn apply(&self, diff: &Diff, curr: &BallotMap) -> Result<()> {
        let writes = diff
            .keys()
            .into_iter()
            .map(|key| match curr.get(&key) {
                Some(set) if !set.is_empty() => KvWrite::Put(key, encode(set)),
                _ => KvWrite::Delete(key),
            })
            .collect::<Vec<_>>();
        self.db.write_batch(&writes)
    }

    fn apply_ultra_safe(&self, curr: &BallotMap) -> Result<()> {
        for (key, set) in curr.iter() {
            if !set.is_empty() {
                self.db.put(*key, encode(set))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tally_common::error::ErrorKind;

    use super::*;
    use crate::{
        memory::MemoryKvDb,
        storage::{Baseline, VoteStorage},
    };

    #[test]
    fn test_encode_layout() {
        let bytes = encode(&BallotSet::from([99, -2]));
        assert_eq!(&bytes[..], &[0, 0, 0, 2, 0xff, 0xff, 0xff, 0xfe, 0, 0, 0, 99]);
        assert_eq!(decode(&bytes).unwrap(), BallotSet::from([-2, 99]));
        assert_eq!(&encode(&BallotSet::new())[..], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_decode_malformed() {
        let cases: [&[u8]; 3] = [&[0, 0], &[0, 0, 0, 2, 0, 0, 0, 1], &[0, 0, 0, 1, 0, 0, 0, 0]];
        for bad in cases {
            assert_eq!(decode(bad).unwrap_err().kind(), ErrorKind::Codec);
        }
        let conflicting = [0, 0, 0, 2, 0, 0, 0, 5, 0xff, 0xff, 0xff, 0xfb];
        assert_eq!(decode(&conflicting).unwrap_err().kind(), ErrorKind::Codec);
    }

    #[test_log::test]
    fn test_kv_store_batch() {
        let db = Arc::new(MemoryKvDb::new("votes"));
        let storage = KvBackend::new(db.clone()).into_storage();
        assert_eq!(storage.store_id().to_string(), "kv:votes");

        let curr = BallotMap::from([(1, BallotSet::from([1, -2])), (2, BallotSet::from([3]))]);
        let report = storage.store_batch(&curr, Baseline::Fresh).unwrap();
        assert_eq!(report.added, 3);
        assert_eq!(storage.load_all_map().unwrap(), curr);

        let next = BallotMap::from([(1, BallotSet::from([1])), (2, BallotSet::new())]);
        let report = storage.store_batch(&next, Baseline::Snapshot(&curr)).unwrap();
        assert_eq!(report.deleted, 2);
        assert_eq!(db.len(), 1);
        assert_eq!(storage.load(1).unwrap(), BallotSet::from([1]));
        assert!(storage.load(2).unwrap().is_empty());
    }

    #[test_log::test]
    fn test_kv_corrupted_value() {
        let db = MemoryKvDb::new("votes");
        db.put(7, Bytes::from_static(&[0, 0, 0, 3])).unwrap();
        let backend = KvBackend::new(db);
        let err = backend.load_all(&mut |_, _| {}).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Codec);
    }
}
