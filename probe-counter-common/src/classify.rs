//! Event classifiers.
//!
//! Each hook body is a classifier composed with [`increment`]. The TCP hooks
//! are classified by hook identity alone; the write hook peeks at the first
//! bytes of the caller's buffer.

use core::ffi::c_long;

use crate::table::{CounterTable, increment};
use crate::{HttpCategory, TcpCategory};

/// Bytes copied from the start of every `write(2)` buffer.
pub const WRITE_PREFIX_LEN: usize = 4;

/// Reported by the host [`SourceMemory`] impl when fewer than
/// [`WRITE_PREFIX_LEN`] bytes are readable.
pub const EFAULT: c_long = -14;

const GET_PREFIX: [u8; WRITE_PREFIX_LEN] = *b"GET ";

/// Memory owned by another execution context, only reachable through a
/// bounds-checked copy that may fail.
pub trait SourceMemory {
    fn read_prefix(&self) -> Result<[u8; WRITE_PREFIX_LEN], c_long>;
}

impl SourceMemory for [u8] {
    fn read_prefix(&self) -> Result<[u8; WRITE_PREFIX_LEN], c_long> {
        self.first_chunk::<WRITE_PREFIX_LEN>()
            .copied()
            .ok_or(EFAULT)
    }
}

/// Best-effort HTTP request detection: a write counts as `GET` when its first
/// four bytes are exactly `GET `. Requests split across writes, other methods
/// and unreadable buffers are not counted.
pub fn classify_write<M: SourceMemory + ?Sized>(source: &M) -> Option<HttpCategory> {
    let prefix = source.read_prefix().ok()?;
    (prefix == GET_PREFIX).then_some(HttpCategory::Get)
}

#[inline(always)]
pub fn on_outbound_connect<T: CounterTable + ?Sized>(tcp: &T) {
    increment(tcp, TcpCategory::Connect.key());
}

#[inline(always)]
pub fn on_inbound_accept<T: CounterTable + ?Sized>(tcp: &T) {
    increment(tcp, TcpCategory::Accept.key());
}

#[inline(always)]
pub fn on_write_entry<T, M>(http: &T, source: &M)
where
    T: CounterTable + ?Sized,
    M: SourceMemory + ?Sized,
{
    if let Some(category) = classify_write(source) {
        increment(http, category.key());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FixedTable;

    struct Unmapped;

    impl SourceMemory for Unmapped {
        fn read_prefix(&self) -> Result<[u8; WRITE_PREFIX_LEN], c_long> {
            Err(EFAULT)
        }
    }

    const GET: u32 = HttpCategory::Get.key();
    const CONNECT: u32 = TcpCategory::Connect.key();
    const ACCEPT: u32 = TcpCategory::Accept.key();

    #[test]
    fn connect_hook_counts_every_invocation() {
        let tcp: FixedTable = FixedTable::new();
        for _ in 0..5 {
            on_outbound_connect(&tcp);
        }
        assert_eq!(tcp.get(CONNECT), Some(5));
        assert_eq!(tcp.get(ACCEPT), None);
    }

    #[test]
    fn accept_hook_never_touches_connect() {
        let tcp: FixedTable = FixedTable::new();
        on_inbound_accept(&tcp);
        on_inbound_accept(&tcp);
        assert_eq!(tcp.get(ACCEPT), Some(2));
        assert_eq!(tcp.get(CONNECT), None);
    }

    #[test]
    fn get_prefix_is_matched_exactly() {
        assert_eq!(classify_write(&b"GET /index.html"[..]), Some(HttpCategory::Get));
        assert_eq!(classify_write(&b"GET "[..]), Some(HttpCategory::Get));
        assert_eq!(classify_write(&b"GETX /"[..]), None);
        assert_eq!(classify_write(&b"get /"[..]), None);
        assert_eq!(classify_write(&b" GET /"[..]), None);
        assert_eq!(classify_write(&b"POST /"[..]), None);
    }

    #[test]
    fn short_or_unreadable_buffers_are_skipped() {
        let http: FixedTable = FixedTable::new();
        on_write_entry(&http, &b"GET"[..]);
        on_write_entry(&http, &b""[..]);
        on_write_entry(&http, &Unmapped);
        assert_eq!(http.get(GET), None);
        assert!(http.is_empty());
    }

    #[test]
    fn non_http_write_starting_with_get_is_counted() {
        let http: FixedTable = FixedTable::new();
        on_write_entry(&http, &b"GET ready\n"[..]);
        assert_eq!(http.get(GET), Some(1));
    }

    #[test]
    fn tcp_hooks_leave_http_table_alone() {
        let tcp: FixedTable = FixedTable::new();
        let http: FixedTable = FixedTable::new();
        on_outbound_connect(&tcp);
        on_inbound_accept(&tcp);
        assert!(http.is_empty());

        on_write_entry(&http, &b"GET /"[..]);
        assert_eq!(tcp.get(CONNECT), Some(1));
        assert_eq!(tcp.get(ACCEPT), Some(1));
    }

    #[test]
    fn mixed_traffic_scenario() {
        let tcp: FixedTable = FixedTable::new();
        let http: FixedTable = FixedTable::new();

        for _ in 0..3 {
            on_outbound_connect(&tcp);
        }
        for _ in 0..2 {
            on_inbound_accept(&tcp);
        }
        on_write_entry(&http, &b"GET /x"[..]);
        on_write_entry(&http, &b"PUT /x"[..]);

        assert_eq!(tcp.get(CONNECT), Some(3));
        assert_eq!(tcp.get(ACCEPT), Some(2));
        assert_eq!(tcp.len(), 2);
        assert_eq!(http.get(GET), Some(1));
        assert_eq!(http.len(), 1);
    }

    #[test]
    fn concurrent_connects_are_all_counted() {
        let tcp: FixedTable = FixedTable::new();
        on_outbound_connect(&tcp);

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..5_000 {
                        on_outbound_connect(&tcp);
                    }
                });
            }
        });

        assert_eq!(tcp.get(CONNECT), Some(1 + 4 * 5_000));
    }
}
