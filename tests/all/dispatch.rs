use crate::support::*;
use anyhow::Result;
use shadowtrace::{Pa, ThreadId, Tracer, TrapContext, Va, VcpuId, UNMODIFIED_VIEW};
use shadowtrace_sim::SimHypervisor;
use std::any::Any;
use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

const VCPU0: VcpuId = VcpuId(0);
const VCPU1: VcpuId = VcpuId(1);

fn armed_tracer(
    sim: &SimHypervisor,
) -> Result<(
    Tracer<SimHypervisor>,
    Rc<std::cell::RefCell<Vec<(shadowtrace::Pid, ThreadId)>>>,
    Rc<std::cell::RefCell<Vec<(ThreadId, u64)>>>,
)> {
    let mut tracer = Tracer::new(sim.clone())?;
    let (entry, ret, entries, returns) = recorders();
    tracer.set_callback("sys_open", entry, ret, Box::new(()))?;
    tracer.start()?;
    Ok((tracer, entries, returns))
}

#[test]
fn entry_hijacks_the_return_slot() -> Result<()> {
    let sim = boot_linux_guest();
    push_return_addr(&sim, STACK_PA);
    let (mut tracer, entries, _) = armed_tracer(&sim)?;

    sim.queue_exec(VCPU0, SYS_OPEN_VA, STACK_VA.0, CR3);
    tracer.poll(Duration::from_millis(0))?;

    // Callback saw the right identity.
    assert_eq!(entries.borrow().as_slice(), &[(PID, ThreadId(STACK_VA.0))]);

    // The return slot now points at the trampoline, and the VCPU is inside
    // its one-instruction window.
    assert_eq!(read_word(&sim, STACK_PA), TRAMPOLINE.0);
    assert_eq!(sim.vcpu_view(VCPU0), UNMODIFIED_VIEW);
    assert!(sim.vcpu_singlestep(VCPU0));
    assert_eq!(tracer.in_flight(), 1);

    // The step completes: shadow view active, stepping off.
    tracer.poll(Duration::from_millis(0))?;
    assert_eq!(sim.vcpu_view(VCPU0), SHADOW_VIEW);
    assert!(!sim.vcpu_singlestep(VCPU0));
    Ok(())
}

#[test]
fn return_redirects_to_the_canonical_point() -> Result<()> {
    let sim = boot_linux_guest();
    push_return_addr(&sim, STACK_PA);
    let (mut tracer, entries, returns) = armed_tracer(&sim)?;

    sim.queue_exec(VCPU0, SYS_OPEN_VA, STACK_VA.0, CR3);
    sim.queue_ret(VCPU0, STACK_VA, CR3, 0x2a);
    drain(&mut tracer)?;

    assert_eq!(entries.borrow().len(), 1);
    assert_eq!(
        returns.borrow().as_slice(),
        &[(ThreadId(STACK_VA.0), 0x2a)]
    );
    assert_eq!(tracer.in_flight(), 0);

    // Control continues where the caller expected.
    assert_eq!(sim.vcpu_regs(VCPU0).rip, RETURN_POINT.0);

    // Servicing a return does not open a step window.
    assert_eq!(sim.vcpu_view(VCPU0), SHADOW_VIEW);
    assert!(!sim.vcpu_singlestep(VCPU0));
    Ok(())
}

#[test]
fn entry_and_return_pair_across_vcpus() -> Result<()> {
    let sim = boot_linux_guest();
    push_return_addr(&sim, STACK_PA);
    let (mut tracer, entries, returns) = armed_tracer(&sim)?;

    // The scheduler migrates the thread: enters on VCPU 0, returns on
    // VCPU 1. Identity is the stack pointer, so the pairing holds.
    sim.queue_exec(VCPU0, SYS_OPEN_VA, STACK_VA.0, CR3);
    sim.queue_ret(VCPU1, STACK_VA, CR3, 7);
    drain(&mut tracer)?;

    assert_eq!(entries.borrow().len(), 1);
    assert_eq!(returns.borrow().as_slice(), &[(ThreadId(STACK_VA.0), 7)]);
    assert_eq!(sim.vcpu_regs(VCPU1).rip, RETURN_POINT.0);
    Ok(())
}

#[test]
fn interleaved_threads_keep_their_payloads() -> Result<()> {
    let sim = boot_linux_guest();
    let slot_a = STACK_PA;
    let slot_b = Pa(STACK_PA.0 + 0x100);
    let sp_a = STACK_VA;
    let sp_b = Va(STACK_VA.0 + 0x100);
    push_return_addr(&sim, slot_a);
    push_return_addr(&sim, slot_b);
    let (mut tracer, entries, returns) = armed_tracer(&sim)?;

    sim.queue_exec(VCPU0, SYS_OPEN_VA, sp_a.0, CR3);
    sim.queue_exec(VCPU1, SYS_OPEN_VA, sp_b.0, CR3);
    // B returns before A.
    sim.queue_ret(VCPU1, sp_b, CR3, 2);
    sim.queue_ret(VCPU0, sp_a, CR3, 1);
    drain(&mut tracer)?;

    assert_eq!(entries.borrow().len(), 2);
    assert_eq!(
        returns.borrow().as_slice(),
        &[(ThreadId(sp_b.0), 2), (ThreadId(sp_a.0), 1)]
    );
    assert_eq!(tracer.in_flight(), 0);
    Ok(())
}

#[test]
fn unexpected_return_word_records_nothing() -> Result<()> {
    let sim = boot_linux_guest();
    // The slot holds garbage instead of the canonical return address; the
    // call did not come through the normal handler path.
    sim.write_bytes(STACK_PA, &0xdead_beefu64.to_le_bytes());
    let (mut tracer, entries, returns) = armed_tracer(&sim)?;

    sim.queue_exec(VCPU0, SYS_OPEN_VA, STACK_VA.0, CR3);
    drain(&mut tracer)?;

    assert_eq!(entries.borrow().len(), 0);
    assert_eq!(returns.borrow().len(), 0);
    assert_eq!(tracer.in_flight(), 0);
    // Stack untouched, trap not reinjected, and the guest still made
    // progress through its window.
    assert_eq!(read_word(&sim, STACK_PA), 0xdead_beef);
    assert!(sim.reinjected().is_empty());
    assert_eq!(sim.vcpu_view(VCPU0), SHADOW_VIEW);
    assert!(!sim.vcpu_singlestep(VCPU0));
    Ok(())
}

#[test]
fn stale_breakpoints_are_reinjected() -> Result<()> {
    let sim = boot_linux_guest();
    // A breakpoint byte the guest owns, on a page we never shadowed.
    let own_bp_va = Va(0xffff_ffff_8130_0040);
    let own_bp_pa = Pa(0x0130_0040);
    sim.add_frame(own_bp_pa.gfn());
    sim.map_kernel(own_bp_va, own_bp_pa);
    sim.write_bytes(own_bp_pa, &[0xcc]);

    let (mut tracer, entries, _) = armed_tracer(&sim)?;
    sim.queue_exec(VCPU0, own_bp_va, STACK_VA.0, CR3);
    drain(&mut tracer)?;

    assert_eq!(sim.reinjected(), vec![own_bp_va]);
    assert_eq!(entries.borrow().len(), 0);
    // No window was opened for a trap that was not ours.
    assert_eq!(sim.vcpu_view(VCPU0), SHADOW_VIEW);
    assert!(!sim.vcpu_singlestep(VCPU0));
    Ok(())
}

#[test]
fn spurious_trampoline_trap_is_ignored() -> Result<()> {
    let sim = boot_linux_guest();
    let (mut tracer, _, returns) = armed_tracer(&sim)?;

    // The trampoline byte executes with no call in flight.
    sim.queue_exec(VCPU0, TRAMPOLINE, STACK_VA.0 + 8, CR3);
    drain(&mut tracer)?;

    assert_eq!(returns.borrow().len(), 0);
    assert_eq!(tracer.in_flight(), 0);
    // No redirect happened; the instruction pointer still sits on the
    // trampoline.
    assert_eq!(sim.vcpu_regs(VCPU0).rip, TRAMPOLINE.0);
    assert!(sim.reinjected().is_empty());
    Ok(())
}

#[test]
fn removal_mid_call_still_restores_control() -> Result<()> {
    let sim = boot_linux_guest();
    push_return_addr(&sim, STACK_PA);
    let mut tracer = Tracer::new(sim.clone())?;

    // The per-call payload tracks whether it was dropped.
    let drops = Rc::new(Cell::new(0usize));
    struct DropFlag(Rc<Cell<usize>>);
    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.set(self.0.get() + 1);
        }
    }

    let d = Rc::clone(&drops);
    let entry = Box::new(
        move |_cx: &TrapContext<'_, SimHypervisor>, _reg: &mut dyn Any| -> Box<dyn Any> {
            Box::new(DropFlag(Rc::clone(&d)))
        },
    );
    let returned = Rc::new(Cell::new(0usize));
    let r = Rc::clone(&returned);
    let ret = Box::new(move |_cx: &TrapContext<'_, SimHypervisor>, _payload: Box<dyn Any>| {
        r.set(r.get() + 1);
    });
    let id = tracer.set_callback("sys_open", entry, ret, Box::new(()))?;
    tracer.start()?;

    sim.queue_exec(VCPU0, SYS_OPEN_VA, STACK_VA.0, CR3);
    drain(&mut tracer)?;
    assert_eq!(tracer.in_flight(), 1);
    assert_eq!(drops.get(), 0);

    // The breakpoint goes away while the call is still out.
    tracer.remove_callback(id)?;

    sim.queue_ret(VCPU0, STACK_VA, CR3, 0);
    drain(&mut tracer)?;

    // No callback left to run, but the guest still gets its control flow
    // back and the payload is released.
    assert_eq!(returned.get(), 0);
    assert_eq!(drops.get(), 1);
    assert_eq!(tracer.in_flight(), 0);
    assert_eq!(sim.vcpu_regs(VCPU0).rip, RETURN_POINT.0);
    Ok(())
}
