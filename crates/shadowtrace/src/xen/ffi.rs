//! Declarations matching `shim.c`.

use libc::{c_char, c_int, c_void};

pub(super) const ST_EVENT_INTERRUPT: u32 = 0;
pub(super) const ST_EVENT_MEMACCESS: u32 = 1;
pub(super) const ST_EVENT_SINGLESTEP: u32 = 2;

#[repr(C)]
pub(super) struct StEvent {
    pub kind: u32,
    pub vcpu: u32,
    pub gla: u64,
    pub gfn: u64,
    pub access: u32,
    pub rip: u64,
    pub rsp: u64,
    pub cr3: u64,
    pub rax: u64,
}

#[repr(C)]
pub(super) struct StResponse {
    pub set_view: u32,
    pub view: u16,
    pub toggle_singlestep: u32,
    pub reinject: u32,
}

pub(super) type StEventFn =
    unsafe extern "C" fn(ev: *const StEvent, resp: *mut StResponse, ctx: *mut c_void);

extern "C" {
    pub(super) fn st_init(name: *const c_char, vmi_out: *mut *mut c_void) -> c_int;
    pub(super) fn st_destroy(vmi: *mut c_void);
    pub(super) fn st_pause(vmi: *mut c_void) -> c_int;
    pub(super) fn st_resume(vmi: *mut c_void) -> c_int;
    pub(super) fn st_ostype(vmi: *mut c_void) -> u32;
    pub(super) fn st_word_width(vmi: *mut c_void) -> u32;
    pub(super) fn st_num_vcpus(vmi: *mut c_void) -> u32;
    pub(super) fn st_memsize(vmi: *mut c_void) -> u64;
    pub(super) fn st_domid(vmi: *mut c_void) -> u32;
    pub(super) fn st_read_phys(vmi: *mut c_void, pa: u64, buf: *mut u8, len: u64) -> c_int;
    pub(super) fn st_write_phys(vmi: *mut c_void, pa: u64, buf: *const u8, len: u64) -> c_int;
    pub(super) fn st_translate_kv2p(vmi: *mut c_void, va: u64) -> u64;
    pub(super) fn st_ksym2v(vmi: *mut c_void, symbol: *const c_char) -> u64;
    pub(super) fn st_read_lstar(vmi: *mut c_void, vcpu: u32, value: *mut u64) -> c_int;
    pub(super) fn st_dtb_to_pid(vmi: *mut c_void, dtb: u64) -> i32;
    pub(super) fn st_set_ip(vmi: *mut c_void, vcpu: u32, addr: u64) -> c_int;
    pub(super) fn st_set_mem_watch(vmi: *mut c_void, gfn: u64, view: u16, on: c_int) -> c_int;
    pub(super) fn st_monitor_interrupts(vmi: *mut c_void) -> c_int;
    pub(super) fn st_monitor_memory(vmi: *mut c_void) -> c_int;
    pub(super) fn st_register_singlestep(vmi: *mut c_void, vcpu: u32) -> c_int;
    pub(super) fn st_events_listen(
        vmi: *mut c_void,
        timeout_ms: u32,
        cb: StEventFn,
        ctx: *mut c_void,
    ) -> c_int;

    pub(super) fn st_xc_open() -> *mut c_void;
    pub(super) fn st_xc_close(xch: *mut c_void);
    pub(super) fn st_set_max_mem(xch: *mut c_void, domid: u32, bytes: u64) -> c_int;
    pub(super) fn st_alloc_frame(xch: *mut c_void, domid: u32, gfn_out: *mut u64) -> c_int;
    pub(super) fn st_free_frame(xch: *mut c_void, domid: u32, gfn: u64) -> c_int;
    pub(super) fn st_altp2m_set_state(xch: *mut c_void, domid: u32, on: c_int) -> c_int;
    pub(super) fn st_altp2m_create_view(xch: *mut c_void, domid: u32, view_out: *mut u16)
        -> c_int;
    pub(super) fn st_altp2m_destroy_view(xch: *mut c_void, domid: u32, view: u16) -> c_int;
    pub(super) fn st_altp2m_switch(xch: *mut c_void, domid: u32, view: u16) -> c_int;
    pub(super) fn st_altp2m_remap(
        xch: *mut c_void,
        domid: u32,
        view: u16,
        gfn: u64,
        shadow: u64,
    ) -> c_int;
    pub(super) fn st_altp2m_reset(xch: *mut c_void, domid: u32, view: u16, gfn: u64) -> c_int;
}
