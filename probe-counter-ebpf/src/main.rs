#![no_std]
#![no_main]

use core::ffi::c_long;

use aya_ebpf::helpers::bpf_probe_read_user;
use aya_ebpf::macros::{kprobe, tracepoint};
use aya_ebpf::programs::{ProbeContext, TracePointContext};
use probe_counter_common::classify::{on_inbound_accept, on_outbound_connect, on_write_entry};
use probe_counter_common::hooks::SYS_ENTER_WRITE_BUF_OFFSET;
use probe_counter_common::{SourceMemory, WRITE_PREFIX_LEN};

mod maps;

#[kprobe]
pub fn kprobe_tcp_v4_connect(_ctx: ProbeContext) -> u32 {
    on_outbound_connect(&maps::tcp());
    0
}

#[kprobe]
pub fn kprobe_inet_csk_accept(_ctx: ProbeContext) -> u32 {
    on_inbound_accept(&maps::tcp());
    0
}

#[tracepoint]
pub fn tracepoint_sys_enter_write(ctx: TracePointContext) -> u32 {
    // Unreadable arguments mean the write is simply not classified.
    let _ = try_sys_enter_write(&ctx);
    0
}

fn try_sys_enter_write(ctx: &TracePointContext) -> Result<(), c_long> {
    let buf: *const u8 = unsafe { ctx.read_at(SYS_ENTER_WRITE_BUF_OFFSET)? };
    on_write_entry(&maps::http(), &UserBuffer(buf));
    Ok(())
}

/// The `buf` argument of `write(2)`, still in the caller's address space.
struct UserBuffer(*const u8);

impl SourceMemory for UserBuffer {
    #[inline(always)]
    fn read_prefix(&self) -> Result<[u8; WRITE_PREFIX_LEN], c_long> {
        unsafe { bpf_probe_read_user(self.0 as *const [u8; WRITE_PREFIX_LEN]) }
    }
}

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}

// bpf_probe_read_user is only available to GPL-compatible programs.
#[unsafe(link_section = "license")]
#[unsafe(no_mangle)]
static LICENSE: [u8; 13] = *b"Dual BSD/GPL\0";
