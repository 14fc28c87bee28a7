//! Time bucketed replay filter.
//!
//! Two pools are kept and one of them is cleared every interval, alternating.
//! A fingerprint is accepted only when it is new to both pools, so it is
//! remembered for at least one full interval and at most two.

use std::sync::{Arc, Mutex, PoisonError};

use fnv::FnvHashSet;
use log::{debug, warn};

use crate::clock::{Clock, SystemClock};

/// Entries per pool. A full pool rejects new fingerprints.
pub const DEFAULT_POOL_CAPACITY: usize = 100_000;

struct Pools {
    a: FnvHashSet<Box<[u8]>>,
    b: FnvHashSet<Box<[u8]>>,
    clear_b_next: bool,
    last_swap: i64,
}

impl Pools {
    fn new(now: i64) -> Self {
        Self {
            a: FnvHashSet::default(),
            b: FnvHashSet::default(),
            clear_b_next: false,
            last_swap: now,
        }
    }
}

/// Inserts unless present or full. Returns whether it was newly inserted.
fn insert_unique(pool: &mut FnvHashSet<Box<[u8]>>, fingerprint: &[u8], capacity: usize) -> bool {
    if pool.contains(fingerprint) {
        return false;
    }
    if pool.len() >= capacity {
        warn!("anti-replay pool is full ({} entries), rejecting", capacity);
        return false;
    }
    pool.insert(fingerprint.into())
}

pub struct AntiReplayWindow {
    interval: i64,
    capacity: usize,
    clock: Arc<dyn Clock>,
    pools: Mutex<Option<Pools>>,
}

impl AntiReplayWindow {
    pub fn new(interval_secs: i64) -> Self {
        Self::with_clock(interval_secs, Arc::new(SystemClock))
    }

    pub fn with_clock(interval_secs: i64, clock: Arc<dyn Clock>) -> Self {
        Self {
            interval: interval_secs,
            capacity: DEFAULT_POOL_CAPACITY,
            clock,
            pools: Mutex::new(None),
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Returns true if `fingerprint` has not been seen recently.
    pub fn check(&self, fingerprint: &[u8]) -> bool {
        let now = self.clock.now();
        let mut guard = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
        let pools = guard.get_or_insert_with(|| Pools::new(now));

        if now - pools.last_swap >= self.interval {
            if pools.clear_b_next {
                pools.b.clear();
            } else {
                pools.a.clear();
            }
            debug!(
                "anti-replay swap, cleared pool {}",
                if pools.clear_b_next { "b" } else { "a" }
            );
            pools.clear_b_next = !pools.clear_b_next;
            pools.last_swap = now;
        }

        let fresh_in_a = insert_unique(&mut pools.a, fingerprint, self.capacity);
        let fresh_in_b = insert_unique(&mut pools.b, fingerprint, self.capacity);
        fresh_in_a && fresh_in_b
    }
}
