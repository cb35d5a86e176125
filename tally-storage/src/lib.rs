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

//! Durable vote storage for tally.
//!
//! A [`VoteStorage`](storage::VoteStorage) persists ballot sets by diffing them against a baseline and applying only
//! the difference to a relational table or a key-value store.

/// Ballot sets, votes and the shared toggle.
pub mod ballot;
/// Verification of flush baselines.
pub mod consistency;
/// Minimal change sets between two snapshots.
pub mod diff;
/// Diff-driven storage over raw backends.
pub mod engine;
/// Key-value backend and its value codec.
pub mod kv;
pub mod memory;
/// The storage port.
pub mod storage;
/// Relational table backend.
pub mod table;

/// The prelude.
pub mod prelude;

/// Diff-driven storage over a relational table.
pub type TableStorage<T> = engine::DiffStorage<table::TableBackend<T>>;
/// Diff-driven storage over a key-value store.
pub type KvStorage<D> = engine::DiffStorage<kv::KvBackend<D>>;
