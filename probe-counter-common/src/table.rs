//! Counter tables and the update protocol every hook shares.

use core::ffi::c_long;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::TABLE_CAPACITY;

/// Returned by [`CounterTable::insert`] when a new key does not fit, the same
/// code the kernel reports for a full hash map.
pub const E2BIG: c_long = -7;

/// A fixed-capacity `u32 -> u64` counter table.
///
/// Implemented by the eBPF hash maps in the eBPF crate and by [`FixedTable`]
/// on the host.
pub trait CounterTable {
    /// Atomically adds `delta` to the counter stored under `key`.
    ///
    /// Returns `false` without touching the table when `key` has no entry yet.
    fn add(&self, key: u32, delta: u64) -> bool;

    /// Stores `value` under `key`, creating the entry if needed.
    ///
    /// Whether a racing writer's value is overwritten or added to is up to
    /// the implementation.
    fn insert(&self, key: u32, value: u64) -> Result<(), c_long>;
}

/// Counts one occurrence of `key`.
///
/// An existing entry takes a single atomic add. A missing entry is created
/// with a count of one. On a kernel hash map, CPUs racing on the first
/// observation of a key may all write that initial value, under-counting by
/// at most the number of racers; [`FixedTable`] adds instead and loses
/// nothing. A full table drops the insert and the event goes uncounted.
#[inline(always)]
pub fn increment<T: CounterTable + ?Sized>(table: &T, key: u32) {
    if !table.add(key, 1) {
        let _ = table.insert(key, 1);
    }
}

const EMPTY: u64 = 0;
const OCCUPIED: u64 = 1 << 32;

/// Lock-free open-addressing table with `N` slots and no deletion.
///
/// Slots are claimed with a compare-and-swap on the key word and never
/// released, so a lookup may stop at the first empty slot. A slot
/// whose count is still zero is claimed but not yet materialized and reads as
/// absent. `insert` only sets the count of an unmaterialized slot; once a
/// concurrent writer has materialized it, the value is added instead, so
/// counts never go backwards.
pub struct FixedTable<const N: usize = { TABLE_CAPACITY as usize }> {
    keys: [AtomicU64; N],
    counts: [AtomicU64; N],
}

impl<const N: usize> FixedTable<N> {
    pub const fn new() -> Self {
        Self {
            keys: [const { AtomicU64::new(EMPTY) }; N],
            counts: [const { AtomicU64::new(0) }; N],
        }
    }

    /// Point lookup. A miss is a logical zero.
    pub fn get(&self, key: u32) -> Option<u64> {
        let slot = self.find(key)?;
        match self.counts[slot].load(Ordering::Acquire) {
            0 => None,
            count => Some(count),
        }
    }

    /// Number of materialized entries.
    pub fn len(&self) -> usize {
        self.counts
            .iter()
            .filter(|count| count.load(Ordering::Acquire) != 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn home(key: u32) -> usize {
        (key.wrapping_mul(0x9e37_79b9) as usize) % N
    }

    fn find(&self, key: u32) -> Option<usize> {
        if N == 0 {
            return None;
        }
        let tag = OCCUPIED | key as u64;
        let start = Self::home(key);
        for step in 0..N {
            let slot = (start + step) % N;
            match self.keys[slot].load(Ordering::Acquire) {
                EMPTY => return None,
                current if current == tag => return Some(slot),
                _ => {}
            }
        }
        None
    }
}

impl<const N: usize> Default for FixedTable<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> CounterTable for FixedTable<N> {
    fn add(&self, key: u32, delta: u64) -> bool {
        let Some(slot) = self.find(key) else {
            return false;
        };
        let count = &self.counts[slot];
        if count.load(Ordering::Acquire) == 0 {
            return false;
        }
        count.fetch_add(delta, Ordering::Relaxed);
        true
    }

    fn insert(&self, key: u32, value: u64) -> Result<(), c_long> {
        if N == 0 {
            return Err(E2BIG);
        }
        let tag = OCCUPIED | key as u64;
        let start = Self::home(key);
        for step in 0..N {
            let slot = (start + step) % N;
            let claimed = match self.keys[slot].compare_exchange(
                EMPTY,
                tag,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => true,
                Err(current) => current == tag,
            };
            if claimed {
                let count = &self.counts[slot];
                if count
                    .compare_exchange(0, value, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    count.fetch_add(value, Ordering::Relaxed);
                }
                return Ok(());
            }
        }
        Err(E2BIG)
    }
}
