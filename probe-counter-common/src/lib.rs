#![cfg_attr(not(test), no_std)]

// Types and logic shared between userspace and the eBPF programs.
// Keep this crate `no_std` friendly so it can be used from eBPF code:
// no allocation, no unbounded loops, every foreign read goes through a
// fallible copy.

pub mod classify;
pub mod hooks;
pub mod table;

pub use classify::{SourceMemory, WRITE_PREFIX_LEN};
pub use hooks::{HOOK_POINTS, HookKind, HookPoint};
pub use table::{CounterTable, FixedTable};

/// Name of the table holding TCP connection counters.
pub const TCP_METRICS_MAP: &str = "tcp_metrics";
/// Name of the table holding HTTP request counters.
pub const HTTP_METRICS_MAP: &str = "http_metrics";
/// Entries provisioned per table unless the loader overrides it.
pub const TABLE_CAPACITY: u32 = 1024;

/// Categories counted in [`TCP_METRICS_MAP`].
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum TcpCategory {
    Connect = 1,
    Accept = 2,
}

impl TcpCategory {
    pub const ALL: [TcpCategory; 2] = [TcpCategory::Connect, TcpCategory::Accept];

    pub const fn key(self) -> u32 {
        self as u32
    }

    pub const fn label(self) -> &'static str {
        match self {
            TcpCategory::Connect => "connect",
            TcpCategory::Accept => "accept",
        }
    }
}

/// Categories counted in [`HTTP_METRICS_MAP`].
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum HttpCategory {
    Get = 1,
}

impl HttpCategory {
    pub const ALL: [HttpCategory; 1] = [HttpCategory::Get];

    pub const fn key(self) -> u32 {
        self as u32
    }

    pub const fn label(self) -> &'static str {
        match self {
            HttpCategory::Get => "GET",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_keys_match_wire_values() {
        assert_eq!(TcpCategory::Connect.key(), 1);
        assert_eq!(TcpCategory::Accept.key(), 2);
        assert_eq!(HttpCategory::Get.key(), 1);
    }

    #[test]
    fn labels_are_distinct_within_a_table() {
        assert_ne!(TcpCategory::Connect.label(), TcpCategory::Accept.label());
        assert_eq!(HttpCategory::Get.label(), "GET");
    }
}
