//! Shared guest fixture: a tiny Linux-shaped kernel image.
//!
//! Layout:
//!
//! - The syscall entry stub sits at [`ENTRY_VA`] (LSTAR): `swapgs`, the
//!   dispatch `call`, nop padding, and one `int3` byte at offset `0x20`,
//!   the byte the trampoline locator is expected to reuse. The canonical
//!   return point is the instruction after the `call`, [`RETURN_POINT`].
//! - `sys_open` lives at [`SYS_OPEN_VA`] (first byte `0x55`), with
//!   `sys_close` on the same page at [`SYS_CLOSE_VA`].
//! - One stack page holds the return slots threads push before entering.

use shadowtrace::{
    EntryCallback, Gfn, Hypervisor, OsKind, Pa, Pid, ReturnCallback, ThreadId, Tracer,
    TrapContext, Va, View,
};
use shadowtrace_sim::SimHypervisor;
use std::any::Any;
use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

pub const ENTRY_VA: Va = Va(0xffff_ffff_8100_0000);
pub const ENTRY_PA: Pa = Pa(0x0100_0000);
pub const ENTRY_GFN: Gfn = Gfn(0x1000);

/// Address of the instruction after the dispatch `call` in the entry stub.
pub const RETURN_POINT: Va = Va(ENTRY_VA.0 + 8);

/// The pre-existing `int3` byte in the entry page.
pub const TRAMPOLINE: Va = Va(ENTRY_VA.0 + 0x20);

pub const SYS_OPEN_VA: Va = Va(0xffff_ffff_8120_0100);
pub const SYS_OPEN_PA: Pa = Pa(0x0120_0100);
pub const SYS_CLOSE_VA: Va = Va(0xffff_ffff_8120_0180);
pub const HANDLER_GFN: Gfn = Gfn(0x1200);

pub const STACK_VA: Va = Va(0xffff_8800_0a5f_3e00);
pub const STACK_PA: Pa = Pa(0x0a5f_3e00);

pub const CR3: u64 = 0x1aa000;
pub const PID: Pid = Pid(4242);

/// The first view the sim hands out, i.e. the tracer's shadow view.
pub const SHADOW_VIEW: View = View(1);

pub fn boot_guest(os: OsKind, vcpus: usize) -> SimHypervisor {
    let sim = SimHypervisor::new(os, vcpus);

    sim.add_frame(ENTRY_GFN);
    sim.map_kernel(ENTRY_VA, ENTRY_PA);
    sim.set_lstar(ENTRY_VA);
    let mut stub = [0x90u8; 0x40];
    stub[0..3].copy_from_slice(&[0x0f, 0x01, 0xf8]); // swapgs
    stub[3..8].copy_from_slice(&[0xe8, 0x28, 0x00, 0x00, 0x00]); // call rel32
    stub[0x20] = 0xcc;
    sim.write_bytes(ENTRY_PA, &stub);

    sim.add_frame(HANDLER_GFN);
    sim.map_kernel(SYS_OPEN_VA, SYS_OPEN_PA);
    sim.write_bytes(SYS_OPEN_PA, &[0x55, 0x48, 0x89, 0xe5]); // push rbp; mov rbp, rsp
    sim.add_symbol("sys_open", SYS_OPEN_VA);
    sim.add_symbol("sys_close", SYS_CLOSE_VA);

    sim.add_frame(STACK_PA.gfn());
    sim.map_kernel(STACK_VA, STACK_PA);

    sim.set_pid(Pa(CR3), PID);
    sim
}

pub fn boot_linux_guest() -> SimHypervisor {
    boot_guest(OsKind::Linux, 2)
}

/// Place the canonical return word in a stack slot, as the dispatch `call`
/// would have.
pub fn push_return_addr(sim: &SimHypervisor, slot: Pa) {
    sim.write_bytes(slot, &RETURN_POINT.0.to_le_bytes());
}

pub fn read_word(sim: &SimHypervisor, pa: Pa) -> u64 {
    let mut word = [0u8; 8];
    for (i, byte) in word.iter_mut().enumerate() {
        *byte = sim.read_byte(Pa(pa.0 + i as u64));
    }
    u64::from_le_bytes(word)
}

/// Service everything the sim has queued; extra polls are no-ops.
pub fn drain<H: Hypervisor>(tracer: &mut Tracer<H>) -> shadowtrace::Result<()> {
    for _ in 0..32 {
        tracer.poll(Duration::from_millis(0))?;
    }
    Ok(())
}

/// An entry/return pair that only counts invocations.
pub fn counters<H: Hypervisor>() -> (
    EntryCallback<H>,
    ReturnCallback<H>,
    Rc<Cell<usize>>,
    Rc<Cell<usize>>,
) {
    let entries = Rc::new(Cell::new(0));
    let returns = Rc::new(Cell::new(0));
    let e = Rc::clone(&entries);
    let r = Rc::clone(&returns);

    let entry = Box::new(move |_cx: &TrapContext<'_, H>, _reg: &mut dyn Any| -> Box<dyn Any> {
        e.set(e.get() + 1);
        Box::new(())
    });
    let ret = Box::new(move |_cx: &TrapContext<'_, H>, _payload: Box<dyn Any>| {
        r.set(r.get() + 1);
    });
    (entry, ret, entries, returns)
}

/// An entry/return pair that records (pid, thread) at entry, threads the
/// entry-time identity through the payload, and records it again with the
/// return value at return.
#[allow(clippy::type_complexity)]
pub fn recorders<H: Hypervisor>() -> (
    EntryCallback<H>,
    ReturnCallback<H>,
    Rc<std::cell::RefCell<Vec<(Pid, ThreadId)>>>,
    Rc<std::cell::RefCell<Vec<(ThreadId, u64)>>>,
) {
    let entries = Rc::new(std::cell::RefCell::new(Vec::new()));
    let returns = Rc::new(std::cell::RefCell::new(Vec::new()));
    let e = Rc::clone(&entries);
    let r = Rc::clone(&returns);

    let entry = Box::new(move |cx: &TrapContext<'_, H>, _reg: &mut dyn Any| -> Box<dyn Any> {
        e.borrow_mut().push((cx.pid, cx.thread));
        Box::new(cx.thread)
    });
    let ret = Box::new(move |cx: &TrapContext<'_, H>, payload: Box<dyn Any>| {
        let entered_as = *payload.downcast::<ThreadId>().expect("payload is the entry thread");
        r.borrow_mut().push((entered_as, cx.event.regs.rax));
    });
    (entry, ret, entries, returns)
}
