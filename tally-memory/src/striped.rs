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

use std::{
    cell::Cell,
    sync::atomic::{AtomicI64, Ordering},
};

/// Default number of stripes of a per-key aggregate.
pub const DEFAULT_STRIPES: usize = 4;

thread_local! {
    static NEXT_STRIPE: Cell<usize> = const { Cell::new(0) };
}

/// A signed counter spread over several atomics.
///
/// Writers pick a stripe round-robin per thread, readers sum all stripes.
#[derive(Debug)]
pub struct StripedCounter {
    stripes: Box<[AtomicI64]>,
}

impl StripedCounter {
    /// Create a counter with `stripes` stripes, starting at `initial`.
    pub fn new(stripes: usize, initial: i64) -> Self {
        assert!(stripes > 0, "stripes must be positive");
        let stripes = (0..stripes).map(|_| AtomicI64::new(0)).collect::<Box<[_]>>();
        stripes[0].store(initial, Ordering::Relaxed);
        Self { stripes }
    }

    /// Add `delta`.
    pub fn add(&self, delta: i64) {
        let stripe = NEXT_STRIPE.with(|next| {
            let v = next.get();
            next.set(v.wrapping_add(1));
            v % self.stripes.len()
        });
        self.stripes[stripe].fetch_add(delta, Ordering::Relaxed);
    }

    /// Sum of all stripes.
    pub fn sum(&self) -> i64 {
        self.stripes.iter().map(|s| s.load(Ordering::Relaxed)).sum()
    }

    /// Number of stripes.
    pub fn stripes(&self) -> usize {
        self.stripes.len()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    #[test]
    fn test_striped_counter() {
        let counter = StripedCounter::new(DEFAULT_STRIPES, -3);
        assert_eq!(counter.sum(), -3);
        for _ in 0..10 {
            counter.add(1);
        }
        counter.add(-2);
        assert_eq!(counter.sum(), 5);
    }

    #[test]
    fn test_striped_counter_concurrent() {
        let counter = Arc::new(StripedCounter::new(8, 0));
        let handles = (0..8)
            .map(|i| {
                let counter = counter.clone();
                thread::spawn(move || {
                    let delta = if i % 2 == 0 { 1 } else { -1 };
                    for _ in 0..1000 {
                        counter.add(delta);
                        counter.add(1);
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.sum(), 8000);
    }
}
