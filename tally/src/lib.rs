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

#![cfg_attr(docsrs, feature(doc_cfg))]

//! tally - concurrent vote-aggregation cache for Rust.
//!
//! A voting counter keeps a persistent `(key, actor) -> vote` map in memory and serves the per-key totals without
//! touching the backend. Votes reach the backend on [`flush`](prelude::VotingCounter::flush), as the minimal diff
//! against what is believed to be persisted.
//!
//! ```
//! use std::sync::Arc;
//!
//! use tally::prelude::*;
//!
//! let storage = Arc::new(TableBackend::new(MemoryVoteTable::new("votes")).into_storage());
//! let counter = CounterBuilder::new(storage.clone())
//!     .with_strategy(Strategy::NonBlocking)
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(counter.increment(1000, 1).unwrap(), 1);
//! assert_eq!(counter.decrement(1000, 2).unwrap(), 0);
//! counter.flush().unwrap();
//! assert_eq!(storage.load(1000).unwrap(), BallotSet::from([1, -2]));
//! ```

pub use tally_common as common;
pub use tally_memory as memory;
pub use tally_storage as storage;

/// The prelude.
pub mod prelude;
