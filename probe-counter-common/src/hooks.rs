//! Hook registration: which kernel hook point runs which eBPF program, and
//! which table that program writes.

use crate::{HTTP_METRICS_MAP, TCP_METRICS_MAP};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HookKind {
    /// Function-entry kprobe on a kernel symbol.
    KProbe { function: &'static str },
    /// Static tracepoint, `category/name` under tracefs.
    TracePoint {
        category: &'static str,
        name: &'static str,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct HookPoint {
    /// Name of the hook point on the attach surface.
    pub name: &'static str,
    /// Program symbol inside the eBPF object.
    pub program: &'static str,
    pub kind: HookKind,
    /// Table the program increments.
    pub table: &'static str,
}

pub const OUTBOUND_CONNECT: HookPoint = HookPoint {
    name: "outbound-connect",
    program: "kprobe_tcp_v4_connect",
    kind: HookKind::KProbe {
        function: "tcp_v4_connect",
    },
    table: TCP_METRICS_MAP,
};

pub const INBOUND_ACCEPT: HookPoint = HookPoint {
    name: "inbound-accept",
    program: "kprobe_inet_csk_accept",
    kind: HookKind::KProbe {
        function: "inet_csk_accept",
    },
    table: TCP_METRICS_MAP,
};

pub const WRITE_SYSCALL_ENTRY: HookPoint = HookPoint {
    name: "write-syscall-entry",
    program: "tracepoint_sys_enter_write",
    kind: HookKind::TracePoint {
        category: "syscalls",
        name: "sys_enter_write",
    },
    table: HTTP_METRICS_MAP,
};

/// Every hook point the eBPF object provides, in attach order.
pub static HOOK_POINTS: [HookPoint; 3] = [OUTBOUND_CONNECT, INBOUND_ACCEPT, WRITE_SYSCALL_ENTRY];

/// Byte offset of the `buf` argument in the `sys_enter_write` record:
/// 8 bytes of common fields, `__syscall_nr` padded to 8, `fd` as 8, then `buf`.
pub const SYS_ENTER_WRITE_BUF_OFFSET: usize = 24;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn each_hook_point_has_a_single_program() {
        for (i, a) in HOOK_POINTS.iter().enumerate() {
            for b in &HOOK_POINTS[i + 1..] {
                assert_ne!(a.name, b.name);
                assert_ne!(a.program, b.program);
                assert_ne!(a.kind, b.kind);
            }
        }
    }

    #[test]
    fn hooks_write_the_expected_tables() {
        let tables: Vec<_> = HOOK_POINTS.iter().map(|h| (h.name, h.table)).collect();
        assert_eq!(
            tables,
            [
                ("outbound-connect", TCP_METRICS_MAP),
                ("inbound-accept", TCP_METRICS_MAP),
                ("write-syscall-entry", HTTP_METRICS_MAP),
            ]
        );
    }
}
