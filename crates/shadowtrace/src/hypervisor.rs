//! The platform port: what the engine needs from a hypervisor.
//!
//! Everything the tracer does to a guest goes through this trait, so the
//! engine itself never speaks to a particular virtualization stack. The
//! production driver (`xen` feature) binds it to libvmi and xenctrl; the
//! `shadowtrace-sim` crate binds it to an in-memory guest for tests.
//!
//! Methods take `&self`: drivers wrap stateful handles and are free to use
//! interior mutability. Event delivery is single-threaded and cooperative:
//! [`Hypervisor::listen`] hands each event to the handler and applies the
//! returned response before the affected VCPU resumes.

use crate::arch::{Gfn, Pa, Pid, Registers, Va, VcpuId, View};
use crate::error::Result;
use crate::os::OsKind;
use std::time::Duration;

bitflags::bitflags! {
    /// Memory access kinds, used for per-frame watch filters and reported
    /// with memory-access events.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Access: u8 {
        /// Read access.
        const R = 1 << 0;
        /// Write access.
        const W = 1 << 1;
        /// Execute access.
        const X = 1 << 2;
    }
}

/// A breakpoint interrupt raised by a guest VCPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptEvent {
    /// The VCPU that trapped.
    pub vcpu: VcpuId,
    /// The virtual address of the breakpoint instruction.
    pub gla: Va,
    /// Register snapshot at the trap.
    pub regs: Registers,
}

/// A read or write of a watched frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemAccessEvent {
    /// The VCPU that faulted.
    pub vcpu: VcpuId,
    /// The frame that was touched.
    pub gfn: Gfn,
    /// The kind of access attempted.
    pub access: Access,
    /// Register snapshot at the fault.
    pub regs: Registers,
}

/// Completion of a single-stepped instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinglestepEvent {
    /// The VCPU that stepped.
    pub vcpu: VcpuId,
    /// Register snapshot after the step.
    pub regs: Registers,
}

/// One event from the guest, delivered serially to the registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// A breakpoint interrupt.
    Interrupt(InterruptEvent),
    /// A watched-frame access.
    MemAccess(MemAccessEvent),
    /// A single-step completion.
    Singlestep(SinglestepEvent),
}

/// What the hypervisor should do with the VCPU that raised an event.
///
/// The flags are applied together, before the VCPU resumes, which is what
/// makes the one-instruction unmodified-view window atomic.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EventResponse {
    /// Point the VCPU at this SLAT view.
    pub switch_view: Option<View>,
    /// Invert the VCPU's single-step state.
    pub toggle_singlestep: bool,
    /// For interrupt events only: deliver the breakpoint to the guest's own
    /// handler instead of swallowing it.
    pub reinject: bool,
}

impl EventResponse {
    /// Take no action; the VCPU resumes as it was.
    pub fn none() -> Self {
        Self::default()
    }

    /// Flip the VCPU to `view` and invert its single-step state: the two
    /// halves of the one-instruction window, used in both directions.
    pub fn step_through(view: View) -> Self {
        EventResponse {
            switch_view: Some(view),
            toggle_singlestep: true,
            reinject: false,
        }
    }

    /// Hand the interrupt back to the guest.
    pub fn reinject() -> Self {
        EventResponse {
            reinject: true,
            ..Self::default()
        }
    }
}

/// The receiving side of [`Hypervisor::listen`].
pub trait EventHandler<H: Hypervisor> {
    /// Service one event. Runs to completion before the VCPU resumes; must
    /// not block.
    fn handle_event(&mut self, hypervisor: &H, event: &Event) -> EventResponse;
}

/// A hypervisor offering multi-view SLAT with per-VCPU view selection.
///
/// Frame-granular operations take guest frame numbers; the numbering is
/// shared across views; a remap changes which backing a view presents for a
/// frame, not the frame's number.
pub trait Hypervisor: Sized {
    /// The operating system the guest runs.
    fn guest_os(&self) -> Result<OsKind>;

    /// Number of virtual CPUs.
    fn vcpu_count(&self) -> Result<u32>;

    /// The guest's word width in bytes (8 on x86-64).
    fn word_width(&self) -> Result<usize>;

    /// Current guest memory size in bytes.
    fn memory_size(&self) -> Result<u64>;

    /// Set the guest's maximum memory in bytes.
    fn set_max_memory(&self, bytes: u64) -> Result<()>;

    /// Pause all VCPUs. Pause/resume nest.
    fn pause(&self) -> Result<()>;

    /// Resume all VCPUs.
    fn resume(&self) -> Result<()>;

    /// Read guest-physical memory. Spans contiguous frames.
    fn read_phys(&self, pa: Pa, buf: &mut [u8]) -> Result<()>;

    /// Write guest-physical memory. Spans contiguous frames.
    fn write_phys(&self, pa: Pa, buf: &[u8]) -> Result<()>;

    /// Translate a kernel virtual address to a physical address.
    fn translate_kernel_va(&self, va: Va) -> Result<Pa>;

    /// Resolve a kernel symbol to its virtual address.
    fn translate_kernel_symbol(&self, symbol: &str) -> Result<Va>;

    /// Read a model-specific register on one VCPU.
    fn read_msr(&self, vcpu: VcpuId, msr: u32) -> Result<u64>;

    /// The process whose page-table hierarchy is rooted at `root`.
    fn pid_from_translation_root(&self, root: Pa) -> Result<Pid>;

    /// Move a VCPU's instruction pointer.
    fn set_instruction_pointer(&self, vcpu: VcpuId, va: Va) -> Result<()>;

    /// Allocate and populate one fresh guest-physical frame. The domain's
    /// memory cap must already have room for it.
    fn allocate_frame(&self) -> Result<Gfn>;

    /// Release a frame previously obtained from
    /// [`allocate_frame`](Hypervisor::allocate_frame).
    fn free_frame(&self, gfn: Gfn) -> Result<()>;

    /// Enable multi-view SLAT on the domain.
    fn enable_slat_views(&self) -> Result<()>;

    /// Disable multi-view SLAT on the domain.
    fn disable_slat_views(&self) -> Result<()>;

    /// Create an empty view (every frame mapped as in view 0).
    fn create_view(&self) -> Result<View>;

    /// Destroy a view. Any VCPU still pointing at it reverts to view 0.
    fn destroy_view(&self, view: View) -> Result<()>;

    /// Point every VCPU at `view`.
    fn switch_view(&self, view: View) -> Result<()>;

    /// In `view`, present `replacement` wherever the guest addresses `gfn`.
    fn remap_frame(&self, view: View, gfn: Gfn, replacement: Gfn) -> Result<()>;

    /// Drop the remap for `gfn` in `view`, restoring the identity mapping.
    fn reset_frame(&self, view: View, gfn: Gfn) -> Result<()>;

    /// Raise memory-access events for the given kinds of access to `gfn`
    /// while a VCPU runs on `view`.
    fn watch_frame(&self, gfn: Gfn, view: View, access: Access) -> Result<()>;

    /// Stop watching `gfn` in `view`.
    fn unwatch_frame(&self, gfn: Gfn, view: View) -> Result<()>;

    /// Subscribe to breakpoint interrupts, swallowing them from the guest
    /// unless a response asks for reinjection.
    fn monitor_interrupts(&self) -> Result<()>;

    /// Subscribe to watched-frame access events.
    fn monitor_memory_access(&self) -> Result<()>;

    /// Pre-register the single-step event for one VCPU. Registration happens
    /// once at startup so that trap servicing never allocates.
    fn register_singlestep(&self, vcpu: VcpuId) -> Result<()>;

    /// Wait up to `timeout` for pending events and feed them to `handler`,
    /// applying each returned response before the VCPU resumes. Returns
    /// normally on timeout with nothing delivered.
    fn listen(&self, timeout: Duration, handler: &mut dyn EventHandler<Self>) -> Result<()>;
}

/// Read a guest word of the advertised width, zero-extended.
pub(crate) fn read_guest_word<H: Hypervisor>(hv: &H, width: usize, pa: Pa) -> Result<u64> {
    if width == 4 {
        let mut buf = [0u8; 4];
        hv.read_phys(pa, &mut buf)?;
        Ok(u64::from(u32::from_le_bytes(buf)))
    } else {
        let mut buf = [0u8; 8];
        hv.read_phys(pa, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }
}

/// Write a guest word of the advertised width.
pub(crate) fn write_guest_word<H: Hypervisor>(
    hv: &H,
    width: usize,
    pa: Pa,
    value: u64,
) -> Result<()> {
    if width == 4 {
        hv.write_phys(pa, &(value as u32).to_le_bytes())
    } else {
        hv.write_phys(pa, &value.to_le_bytes())
    }
}
