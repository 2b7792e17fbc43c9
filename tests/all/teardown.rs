use crate::support::*;
use anyhow::Result;
use shadowtrace::{Pa, Tracer, VcpuId, UNMODIFIED_VIEW};
use shadowtrace_sim::{SimHypervisor, DEFAULT_MEMORY};

const VCPU0: VcpuId = VcpuId(0);
const VCPU1: VcpuId = VcpuId(1);

/// Three threads mid-call, none returned.
fn three_in_flight(sim: &SimHypervisor) -> Result<(Tracer<SimHypervisor>, [Pa; 3])> {
    let slots = [STACK_PA, Pa(STACK_PA.0 + 0x40), Pa(STACK_PA.0 + 0x80)];
    for slot in slots {
        push_return_addr(sim, slot);
    }

    let mut tracer = Tracer::new(sim.clone())?;
    let (entry, ret, _, _) = counters();
    tracer.set_callback("sys_open", entry, ret, Box::new(()))?;
    tracer.start()?;

    for (i, slot) in slots.iter().enumerate() {
        let sp = STACK_VA.0 + (slot.0 - STACK_PA.0);
        sim.queue_exec(VcpuId((i % 2) as u32), SYS_OPEN_VA, sp, CR3);
    }
    drain(&mut tracer)?;
    assert_eq!(tracer.in_flight(), 3);
    for slot in slots {
        assert_eq!(read_word(sim, slot), TRAMPOLINE.0);
    }
    Ok((tracer, slots))
}

#[test]
fn quit_restores_every_hijacked_slot() -> Result<()> {
    let sim = boot_linux_guest();
    let (mut tracer, slots) = three_in_flight(&sim)?;

    tracer.quit();

    for slot in slots {
        assert_eq!(read_word(&sim, slot), RETURN_POINT.0);
    }
    assert_eq!(tracer.in_flight(), 0);
    assert_eq!(tracer.breakpoint_count(), 0);
    assert!(sim.allocated_frames().is_empty());
    for vcpu in [VCPU0, VCPU1] {
        assert_eq!(sim.vcpu_view(vcpu), UNMODIFIED_VIEW);
    }
    assert_eq!(sim.pause_depth(), 0);

    // quit leaves the view and SLAT facility alone; close tears them down.
    assert!(sim.view_exists(SHADOW_VIEW));
    tracer.close();
    assert!(!sim.view_exists(SHADOW_VIEW));
    assert!(!sim.altp2m_enabled());
    assert_eq!(sim.max_memory(), DEFAULT_MEMORY);
    assert_eq!(sim.pause_depth(), 0);
    Ok(())
}

#[test]
fn close_without_quit_is_equivalent() -> Result<()> {
    let sim = boot_linux_guest();
    let (tracer, slots) = three_in_flight(&sim)?;

    tracer.close();

    for slot in slots {
        assert_eq!(read_word(&sim, slot), RETURN_POINT.0);
    }
    assert!(!sim.view_exists(SHADOW_VIEW));
    assert!(!sim.altp2m_enabled());
    assert!(sim.allocated_frames().is_empty());
    assert_eq!(sim.max_memory(), DEFAULT_MEMORY);
    assert_eq!(sim.pause_depth(), 0);
    Ok(())
}

#[test]
fn dropping_the_tracer_tears_down() -> Result<()> {
    let sim = boot_linux_guest();
    let (tracer, slots) = three_in_flight(&sim)?;

    drop(tracer);

    for slot in slots {
        assert_eq!(read_word(&sim, slot), RETURN_POINT.0);
    }
    assert!(!sim.view_exists(SHADOW_VIEW));
    assert_eq!(sim.max_memory(), DEFAULT_MEMORY);
    assert_eq!(sim.pause_depth(), 0);
    Ok(())
}

#[test]
fn quit_twice_then_close_is_harmless() -> Result<()> {
    let sim = boot_linux_guest();
    let (mut tracer, _) = three_in_flight(&sim)?;

    tracer.quit();
    tracer.quit();
    tracer.close();

    assert_eq!(sim.pause_depth(), 0);
    assert!(!sim.view_exists(SHADOW_VIEW));
    Ok(())
}

#[test]
fn a_failed_restore_does_not_abort_teardown() -> Result<()> {
    let sim = boot_linux_guest();
    let (mut tracer, slots) = three_in_flight(&sim)?;

    // The first stack write fails; the remaining slots must still be
    // restored and the teardown must run to completion.
    sim.fail_next("write_phys");
    tracer.quit();

    assert_eq!(read_word(&sim, slots[0]), TRAMPOLINE.0);
    assert_eq!(read_word(&sim, slots[1]), RETURN_POINT.0);
    assert_eq!(read_word(&sim, slots[2]), RETURN_POINT.0);
    assert_eq!(tracer.in_flight(), 0);
    assert_eq!(tracer.breakpoint_count(), 0);
    for vcpu in [VCPU0, VCPU1] {
        assert_eq!(sim.vcpu_view(vcpu), UNMODIFIED_VIEW);
    }
    Ok(())
}

#[test]
fn teardown_with_nothing_installed_is_clean() -> Result<()> {
    let sim = boot_linux_guest();
    let tracer = Tracer::new(sim.clone())?;
    tracer.close();

    assert!(!sim.altp2m_enabled());
    assert_eq!(sim.max_memory(), DEFAULT_MEMORY);
    assert_eq!(sim.pause_depth(), 0);
    Ok(())
}
