use crate::support::*;
use anyhow::Result;
use shadowtrace::{Tracer, VcpuId, UNMODIFIED_VIEW};
use std::time::Duration;

const VCPU0: VcpuId = VcpuId(0);
const VCPU1: VcpuId = VcpuId(1);

#[test]
fn integrity_scan_reads_original_bytes() -> Result<()> {
    let sim = boot_linux_guest();
    let mut tracer = Tracer::new(sim.clone())?;
    let (entry, ret, _, _) = counters();
    tracer.set_callback("sys_open", entry, ret, Box::new(()))?;
    tracer.start()?;

    // A scanner on VCPU 1 reads the first byte of sys_open. The shadow
    // holds 0xcc there, but the scan must observe the pristine kernel.
    sim.queue_read(VCPU1, SYS_OPEN_VA);
    drain(&mut tracer)?;

    assert_eq!(sim.read_results(), vec![(SYS_OPEN_VA, 0x55)]);

    // Window closed behind the scan.
    assert_eq!(sim.vcpu_view(VCPU1), SHADOW_VIEW);
    assert!(!sim.vcpu_singlestep(VCPU1));
    Ok(())
}

#[test]
fn scan_of_unwatched_frame_is_not_trapped() -> Result<()> {
    let sim = boot_linux_guest();
    let mut tracer = Tracer::new(sim.clone())?;
    let (entry, ret, _, _) = counters();
    tracer.set_callback("sys_open", entry, ret, Box::new(()))?;
    tracer.start()?;

    // The entry page is not shadowed, so reading it never faults.
    sim.queue_read(VCPU1, ENTRY_VA);
    drain(&mut tracer)?;

    assert_eq!(sim.read_results(), vec![(ENTRY_VA, 0x0f)]);
    Ok(())
}

#[test]
fn scan_window_is_independent_of_another_vcpus_entry() -> Result<()> {
    let sim = boot_linux_guest();
    push_return_addr(&sim, STACK_PA);
    let mut tracer = Tracer::new(sim.clone())?;
    let (entry, ret, entries, _) = counters();
    tracer.set_callback("sys_open", entry, ret, Box::new(()))?;
    tracer.start()?;

    sim.queue_exec(VCPU0, SYS_OPEN_VA, STACK_VA.0, CR3);
    sim.queue_read(VCPU1, SYS_OPEN_VA);

    // Entry trap on VCPU 0 opens its window.
    tracer.poll(Duration::from_millis(0))?;
    assert_eq!(sim.vcpu_view(VCPU0), UNMODIFIED_VIEW);
    assert!(sim.vcpu_singlestep(VCPU0));

    // VCPU 0 steps; back to the shadow view.
    tracer.poll(Duration::from_millis(0))?;
    assert_eq!(sim.vcpu_view(VCPU0), SHADOW_VIEW);

    // Scan trap on VCPU 1 opens *its* window; VCPU 0 is unaffected and the
    // call it started is still in flight.
    tracer.poll(Duration::from_millis(0))?;
    assert_eq!(sim.vcpu_view(VCPU1), UNMODIFIED_VIEW);
    assert!(sim.vcpu_singlestep(VCPU1));
    assert_eq!(sim.vcpu_view(VCPU0), SHADOW_VIEW);
    assert!(!sim.vcpu_singlestep(VCPU0));
    assert_eq!(tracer.in_flight(), 1);
    assert_eq!(entries.get(), 1);

    drain(&mut tracer)?;
    assert_eq!(sim.read_results(), vec![(SYS_OPEN_VA, 0x55)]);

    // Quiescent again: every VCPU on the shadow view, stepping off.
    for vcpu in [VCPU0, VCPU1] {
        assert_eq!(sim.vcpu_view(vcpu), SHADOW_VIEW);
        assert!(!sim.vcpu_singlestep(vcpu));
    }
    Ok(())
}
