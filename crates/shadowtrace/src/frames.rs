//! Shadow-frame allocation against the domain's memory cap.

use crate::arch::{Gfn, PAGE_SIZE};
use crate::error::Result;
use crate::hypervisor::Hypervisor;
use log::warn;

/// Hands out tracer-owned guest frames, growing the domain's maximum memory
/// one page at a time and shrinking it again as frames are released. The
/// initial size is kept so teardown can restore the cap exactly.
pub(crate) struct FrameAllocator {
    initial: u64,
    current: u64,
}

impl FrameAllocator {
    pub fn new(memory_size: u64) -> Self {
        FrameAllocator {
            initial: memory_size,
            current: memory_size,
        }
    }

    pub fn initial(&self) -> u64 {
        self.initial
    }

    /// Raise the cap by one page and populate a fresh frame. If population
    /// fails the cap raise is undone, so a failed allocation leaves the
    /// domain untouched.
    pub fn allocate<H: Hypervisor>(&mut self, hv: &H) -> Result<Gfn> {
        let proposed = self.current + PAGE_SIZE;
        hv.set_max_memory(proposed)?;
        self.current = proposed;

        match hv.allocate_frame() {
            Ok(gfn) => Ok(gfn),
            Err(err) => {
                self.current -= PAGE_SIZE;
                if let Err(undo) = hv.set_max_memory(self.current) {
                    warn!("failed to lower memory cap after allocation failure: {undo}");
                }
                Err(err)
            }
        }
    }

    /// Release a frame and give the page back to the cap.
    pub fn release<H: Hypervisor>(&mut self, hv: &H, gfn: Gfn) -> Result<()> {
        hv.free_frame(gfn)?;
        self.current -= PAGE_SIZE;
        if let Err(err) = hv.set_max_memory(self.current) {
            warn!("failed to lower memory cap after releasing {gfn}: {err}");
        }
        Ok(())
    }

    /// Force the cap back to the domain's original size.
    pub fn restore_cap<H: Hypervisor>(&mut self, hv: &H) -> Result<()> {
        hv.set_max_memory(self.initial)?;
        self.current = self.initial;
        Ok(())
    }
}
