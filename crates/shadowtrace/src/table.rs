//! The breakpoint table: which guest bytes are ours, and what to run when
//! they fire.
//!
//! Two-level index keyed the way lookups arrive from the event stream: a
//! faulting physical address resolves frame → page record, then offset →
//! breakpoint record. Page records own their shadow frame; breakpoint
//! records own the registered callbacks. All cross-references are slab keys,
//! so removal and teardown never chase pointers.

use crate::arch::{Gfn, Pa, View, BREAKPOINT, PAGE_SIZE};
use crate::error::{Error, Result};
use crate::frames::FrameAllocator;
use crate::hypervisor::{Access, Hypervisor};
use crate::slab::{slab_key, Slab};
use crate::tracer::{EntryCallback, ReturnCallback};
use log::{debug, error, warn};
use std::any::Any;
use std::collections::HashMap;

slab_key! {
    /// Stable identity of an installed breakpoint. Installing twice at the
    /// same address yields the same id.
    pub struct BreakpointId;
}

slab_key! {
    pub(crate) struct PageId;
}

pub(crate) struct PageRecord {
    /// The frame of the original kernel page.
    pub frame: Gfn,
    /// The tracer-owned replacement presented by the shadow view.
    pub shadow: Gfn,
    /// Breakpoints within this page, by in-frame offset.
    pub children: HashMap<u64, BreakpointId>,
}

pub(crate) struct BreakpointRecord<H: Hypervisor> {
    pub offset: u64,
    pub page: PageId,
    pub entry: EntryCallback<H>,
    pub ret: ReturnCallback<H>,
    /// The payload registered alongside the callbacks, handed to the entry
    /// callback on every firing.
    pub payload: Box<dyn Any>,
}

pub(crate) struct BreakpointTable<H: Hypervisor> {
    frames: HashMap<Gfn, PageId>,
    pages: Slab<PageId, PageRecord>,
    records: Slab<BreakpointId, BreakpointRecord<H>>,
}

impl<H: Hypervisor> BreakpointTable<H> {
    pub fn new() -> Self {
        BreakpointTable {
            frames: HashMap::new(),
            pages: Slab::new(),
            records: Slab::new(),
        }
    }

    /// Two map hops from a faulting physical address to our record, if any.
    pub fn lookup(&self, pa: Pa) -> Option<BreakpointId> {
        let page = self.pages.get(*self.frames.get(&pa.gfn())?)?;
        page.children.get(&pa.offset()).copied()
    }

    pub fn record_mut(&mut self, id: BreakpointId) -> Option<&mut BreakpointRecord<H>> {
        self.records.get_mut(id)
    }

    pub fn breakpoint_count(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Install a breakpoint at `pa`. Idempotent: a second install at an
    /// already-trapped address returns the existing record untouched.
    ///
    /// First trap in a frame stages the shadow: raise the memory cap and
    /// populate a frame, copy the original bytes across, remap the shadow
    /// view, arm the access watch. The shadow is populated before the view
    /// can reach it, and any step that fails unwinds the completed ones in
    /// reverse, so a failed install leaves no partial SLAT state behind.
    pub fn install(
        &mut self,
        hv: &H,
        frames: &mut FrameAllocator,
        view: View,
        pa: Pa,
        entry: EntryCallback<H>,
        ret: ReturnCallback<H>,
        payload: Box<dyn Any>,
    ) -> Result<BreakpointId> {
        let frame = pa.gfn();
        let offset = pa.offset();

        let page_id = match self.frames.get(&frame) {
            Some(&page_id) => {
                let page = self.pages.get(page_id).expect("frame map points at live page");
                if let Some(&existing) = page.children.get(&offset) {
                    debug!("breakpoint already installed at {pa}; reusing");
                    return Ok(existing);
                }
                write_breakpoint_byte(hv, page.shadow, offset)
                    .map_err(|e| Error::install("writing the breakpoint byte", e))?;
                page_id
            }
            None => self.install_page(hv, frames, view, frame, offset)?,
        };

        let id = self.records.insert(BreakpointRecord {
            offset,
            page: page_id,
            entry,
            ret,
            payload,
        });
        self.pages
            .get_mut(page_id)
            .expect("page just installed")
            .children
            .insert(offset, id);
        Ok(id)
    }

    fn install_page(
        &mut self,
        hv: &H,
        frames: &mut FrameAllocator,
        view: View,
        frame: Gfn,
        offset: u64,
    ) -> Result<PageId> {
        let shadow = frames
            .allocate(hv)
            .map_err(|e| Error::install("allocating the shadow frame", e))?;

        if let Err(e) = stage_page(hv, view, frame, shadow, offset) {
            if let Err(undo) = frames.release(hv, shadow) {
                warn!("failed to release shadow frame {shadow} during rollback: {undo}");
            }
            return Err(e);
        }

        debug!("new page trap on {frame} -> {shadow}");
        let page_id = self.pages.insert(PageRecord {
            frame,
            shadow,
            children: HashMap::new(),
        });
        self.frames.insert(frame, page_id);
        Ok(page_id)
    }

    /// Remove one breakpoint: rewrite the shadow byte from the *current*
    /// original byte (preserving any patching the kernel has done since),
    /// and release the page once its last child is gone.
    pub fn remove(
        &mut self,
        hv: &H,
        frames: &mut FrameAllocator,
        view: View,
        id: BreakpointId,
    ) -> Result<()> {
        let Some(record) = self.records.remove(id) else {
            warn!("remove of unknown breakpoint id; ignoring");
            return Ok(());
        };
        let page = self
            .pages
            .get_mut(record.page)
            .expect("record points at live page");

        let restored = restore_byte(hv, page.frame, page.shadow, record.offset);
        page.children.remove(&record.offset);

        if page.children.is_empty() {
            let page = self.pages.remove(record.page).expect("page is live");
            self.frames.remove(&page.frame);
            self.release_page(hv, frames, view, &page);
        }

        restored
    }

    /// Drop every record, restoring bytes and releasing pages. Failures are
    /// logged and skipped; the table always ends empty.
    pub fn clear(&mut self, hv: &H, frames: &mut FrameAllocator, view: View) {
        let page_ids: Vec<PageId> = self.pages.keys().collect();
        for page_id in page_ids {
            let page = self.pages.remove(page_id).expect("page key is live");
            for (&offset, &child) in &page.children {
                if let Err(e) = restore_byte(hv, page.frame, page.shadow, offset) {
                    error!("failed to restore byte {offset:#x} in {}: {e}", page.frame);
                }
                self.records.remove(child);
            }
            self.frames.remove(&page.frame);
            self.release_page(hv, frames, view, &page);
        }
        debug_assert!(self.records.is_empty());
        self.frames.clear();
    }

    /// Stop watching, restore the SLAT mapping, and give the shadow frame
    /// back. Teardown must not abort partway, so failures only log.
    fn release_page(&self, hv: &H, frames: &mut FrameAllocator, view: View, page: &PageRecord) {
        if let Err(e) = hv.unwatch_frame(page.frame, view) {
            error!("failed to disarm the watch on {}: {e}", page.frame);
        }
        if let Err(e) = hv.reset_frame(view, page.frame) {
            error!("failed to restore the mapping of {}: {e}", page.frame);
        }
        if let Err(e) = frames.release(hv, page.shadow) {
            error!("failed to release shadow frame {}: {e}", page.shadow);
        }
    }
}

/// Copy the original page into the shadow, remap the view, arm the watch,
/// and plant the breakpoint byte. A failing step unwinds the completed ones
/// in reverse before the error propagates; the caller still owns the frame.
fn stage_page<H: Hypervisor>(
    hv: &H,
    view: View,
    frame: Gfn,
    shadow: Gfn,
    offset: u64,
) -> Result<()> {
    let mut bytes = vec![0u8; PAGE_SIZE as usize];
    hv.read_phys(frame.base(), &mut bytes)
        .and_then(|()| hv.write_phys(shadow.base(), &bytes))
        .map_err(|e| Error::install("populating the shadow frame", e))?;

    hv.remap_frame(view, frame, shadow)
        .map_err(|e| Error::install("remapping the shadow view", e))?;

    if let Err(e) = hv.watch_frame(frame, view, Access::R | Access::W) {
        undo_remap(hv, view, frame);
        return Err(Error::install("arming the access watch", e));
    }

    if let Err(e) = write_breakpoint_byte(hv, shadow, offset) {
        undo_watch(hv, view, frame);
        undo_remap(hv, view, frame);
        return Err(Error::install("writing the breakpoint byte", e));
    }

    Ok(())
}

fn undo_remap<H: Hypervisor>(hv: &H, view: View, frame: Gfn) {
    if let Err(e) = hv.reset_frame(view, frame) {
        warn!("rollback failed to restore the mapping of {frame}: {e}");
    }
}

fn undo_watch<H: Hypervisor>(hv: &H, view: View, frame: Gfn) {
    if let Err(e) = hv.unwatch_frame(frame, view) {
        warn!("rollback failed to disarm the watch on {frame}: {e}");
    }
}

fn write_breakpoint_byte<H: Hypervisor>(hv: &H, shadow: Gfn, offset: u64) -> Result<()> {
    hv.write_phys(Pa(shadow.base().0 + offset), &[BREAKPOINT])
}

fn restore_byte<H: Hypervisor>(hv: &H, frame: Gfn, shadow: Gfn, offset: u64) -> Result<()> {
    let mut current = [0u8; 1];
    hv.read_phys(Pa(frame.base().0 + offset), &mut current)?;
    hv.write_phys(Pa(shadow.base().0 + offset), &current)
}
