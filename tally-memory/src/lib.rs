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

//! In-memory voting counters for tally.
//!
//! Both strategies keep every vote in memory and persist it through a
//! [`VoteStorage`](tally_storage::storage::VoteStorage) on [`flush`](counter::VotingCounter::flush).

mod cell;
/// The counter trait, its builder and the strategy switch.
pub mod counter;
/// Counter guarding all keys with one reader-writer lock.
pub mod lock_based;
/// Counter with independent per-key cells.
pub mod non_blocking;
mod striped;

/// The prelude.
pub mod prelude;

pub use striped::DEFAULT_STRIPES;
