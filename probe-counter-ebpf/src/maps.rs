// Counter tables shared with userspace.
//
// Both maps are plain hash maps keyed by category id. Userspace reads them by
// name (see `probe_counter_common::{TCP_METRICS_MAP, HTTP_METRICS_MAP}`) and may
// resize them at load time; the capacity below is the default.

use core::{
    ffi::c_long,
    sync::atomic::{AtomicU64, Ordering},
};

use aya_ebpf::{bindings::BPF_ANY, macros::map, maps::HashMap};
use probe_counter_common::{CounterTable, TABLE_CAPACITY};

#[map(name = "tcp_metrics")]
static TCP_METRICS: HashMap<u32, u64> = HashMap::<u32, u64>::with_max_entries(TABLE_CAPACITY, 0);

#[map(name = "http_metrics")]
static HTTP_METRICS: HashMap<u32, u64> =
    HashMap::<u32, u64>::with_max_entries(TABLE_CAPACITY, 0);

pub struct Metrics(&'static HashMap<u32, u64>);

pub fn tcp() -> Metrics {
    Metrics(&TCP_METRICS)
}

pub fn http() -> Metrics {
    Metrics(&HTTP_METRICS)
}

impl CounterTable for Metrics {
    #[inline(always)]
    fn add(&self, key: u32, delta: u64) -> bool {
        match self.0.get_ptr_mut(&key) {
            Some(ptr) => {
                // Map values are 8-byte aligned and live as long as the map.
                let count = unsafe { AtomicU64::from_ptr(ptr) };
                count.fetch_add(delta, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    #[inline(always)]
    fn insert(&self, key: u32, value: u64) -> Result<(), c_long> {
        self.0.insert(&key, &value, BPF_ANY as u64)
    }
}
