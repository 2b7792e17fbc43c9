//! The loop controller: lifecycle of a traced guest.
//!
//! Construction pauses the guest, enables multi-view SLAT, and creates the
//! shadow view. Callback registration installs breakpoints under pause.
//! [`Tracer::run`] finalizes the two run-constant addresses (canonical
//! return point and trampoline), arms the event monitors, and polls the
//! event stream until interrupted. [`Tracer::quit`] and [`Tracer::close`]
//! unwind everything, in-flight calls included, so the guest keeps running
//! after the tracer is gone.

use crate::arch::{Pid, ThreadId, Va, VcpuId, View, UNMODIFIED_VIEW};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::frames::FrameAllocator;
use crate::hypervisor::{Hypervisor, InterruptEvent};
use crate::os::{self, OsKind};
use crate::table::BreakpointId;
use crate::trampoline;
use log::{debug, error, warn};
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How long one listen round waits before re-checking the interrupt flag.
const EVENT_POLL: Duration = Duration::from_millis(500);

/// Context handed to entry and return callbacks. Callbacks may read guest
/// state through [`TrapContext::hypervisor`]; they must not reach back into
/// the tracer.
pub struct TrapContext<'a, H: Hypervisor> {
    /// The platform, for reading guest memory or registers.
    pub hypervisor: &'a H,
    /// The trap that fired.
    pub event: &'a InterruptEvent,
    /// The process the guest was running, or pid 0 if unresolved.
    pub pid: Pid,
    /// The calling thread's identity.
    pub thread: ThreadId,
}

/// Per-call state produced by an entry callback and consumed by the matching
/// return callback, which is responsible for whatever release the concrete
/// type needs (usually just dropping it).
pub type CallPayload = Box<dyn Any>;

/// Invoked when a traced call enters. Receives the payload registered with
/// the breakpoint; returns the per-call payload.
pub type EntryCallback<H> = Box<dyn FnMut(&TrapContext<'_, H>, &mut dyn Any) -> CallPayload>;

/// Invoked when a traced call returns, with the payload its entry produced.
pub type ReturnCallback<H> = Box<dyn FnMut(&TrapContext<'_, H>, CallPayload)>;

/// One registration for [`Tracer::set_callbacks`].
pub struct CallbackSpec<H: Hypervisor> {
    /// Kernel symbol naming the per-syscall handler to trap.
    pub symbol: String,
    /// Entry callback.
    pub entry: EntryCallback<H>,
    /// Return callback.
    pub ret: ReturnCallback<H>,
    /// Opaque payload handed to every entry invocation.
    pub payload: Box<dyn Any>,
}

impl<H: Hypervisor> CallbackSpec<H> {
    /// Bundle a registration.
    pub fn new(
        symbol: impl Into<String>,
        entry: EntryCallback<H>,
        ret: ReturnCallback<H>,
        payload: Box<dyn Any>,
    ) -> Self {
        CallbackSpec {
            symbol: symbol.into(),
            entry,
            ret,
            payload,
        }
    }
}

/// A set-only view of the tracer's interrupt flag, safe to hand to signal
/// glue. The tracer reads the flag between listen rounds, so the poll
/// interval bounds how quickly an interrupt is observed.
#[derive(Clone)]
pub struct InterruptHandle {
    flag: Arc<AtomicBool>,
}

impl InterruptHandle {
    /// Ask the run loop to stop.
    pub fn interrupt(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// The underlying flag, for APIs (such as `signal_hook::flag::register`)
    /// that store `true` into an `Arc<AtomicBool>` directly.
    pub fn flag(&self) -> &Arc<AtomicBool> {
        &self.flag
    }
}

/// A stealth system-call tracer attached to one guest.
pub struct Tracer<H: Hypervisor> {
    hv: H,
    engine: Engine<H>,
    frames: FrameAllocator,
    os: OsKind,
    interrupted: Arc<AtomicBool>,
    closed: bool,
}

impl<H: Hypervisor> std::fmt::Debug for Tracer<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracer")
            .field("os", &self.os)
            .field("closed", &self.closed)
            .finish()
    }
}

impl<H: Hypervisor> Tracer<H> {
    /// Attach to the guest behind `hv`: pause it, detect its OS, enable
    /// multi-view SLAT, and create the shadow view. The guest is resumed
    /// before this returns, on success and failure alike.
    pub fn new(hv: H) -> Result<Self> {
        hv.pause()?;
        let prepared = Self::prepare_domain(&hv);
        if let Err(e) = hv.resume() {
            error!("failed to resume guest after construction: {e}");
            prepared?;
            return Err(e);
        }
        let (os, word_width, memory_size, shadow_view) = prepared?;
        debug!("attached: {os} guest, {word_width}-byte words, shadow {shadow_view}");

        Ok(Tracer {
            hv,
            engine: Engine::new(shadow_view, word_width),
            frames: FrameAllocator::new(memory_size),
            os,
            interrupted: Arc::new(AtomicBool::new(false)),
            closed: false,
        })
    }

    fn prepare_domain(hv: &H) -> Result<(OsKind, usize, u64, View)> {
        let os = match hv.guest_os()? {
            OsKind::Unknown => return Err(Error::UnsupportedOs),
            os => os,
        };
        let word_width = hv.word_width()?;
        let memory_size = hv.memory_size()?;

        hv.enable_slat_views()?;
        let shadow_view = match hv.create_view() {
            Ok(view) => view,
            Err(e) => {
                if let Err(undo) = hv.disable_slat_views() {
                    warn!("failed to disable SLAT views after setup failure: {undo}");
                }
                return Err(e);
            }
        };
        Ok((os, word_width, memory_size, shadow_view))
    }

    /// The guest's operating system.
    pub fn os(&self) -> OsKind {
        self.os
    }

    /// The platform this tracer drives, for reading guest state outside a
    /// callback.
    pub fn hypervisor(&self) -> &H {
        &self.hv
    }

    /// The return-site trap address, once [`Tracer::run`] (or
    /// [`Tracer::start`]) has located it.
    pub fn trampoline_addr(&self) -> Option<Va> {
        self.engine.armed.map(|a| a.trampoline)
    }

    /// The canonical return address, once finalized.
    pub fn canonical_return_addr(&self) -> Option<Va> {
        self.engine.armed.map(|a| a.return_point)
    }

    /// Number of calls currently between entry and return.
    pub fn in_flight(&self) -> usize {
        self.engine.tracker.len()
    }

    /// Number of installed breakpoints.
    pub fn breakpoint_count(&self) -> usize {
        self.engine.table.breakpoint_count()
    }

    /// A handle with which signal glue (or another thread) may stop
    /// [`Tracer::run`].
    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle {
            flag: Arc::clone(&self.interrupted),
        }
    }

    fn interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Trap the named kernel symbol. Pauses the guest around the install.
    /// Installing a symbol that is already trapped returns the existing
    /// breakpoint.
    pub fn set_callback(
        &mut self,
        symbol: &str,
        entry: EntryCallback<H>,
        ret: ReturnCallback<H>,
        payload: Box<dyn Any>,
    ) -> Result<BreakpointId> {
        self.hv.pause()?;
        let result = self.install_symbol(symbol, entry, ret, payload);
        if let Err(e) = self.hv.resume() {
            error!("failed to resume guest after install: {e}");
            return result.and(Err(e));
        }
        result
    }

    fn install_symbol(
        &mut self,
        symbol: &str,
        entry: EntryCallback<H>,
        ret: ReturnCallback<H>,
        payload: Box<dyn Any>,
    ) -> Result<BreakpointId> {
        let va = self.hv.translate_kernel_symbol(symbol)?;
        if va.0 == 0 {
            return Err(Error::SymbolUnresolved(symbol.to_string()));
        }
        let pa = self.hv.translate_kernel_va(va)?;
        self.engine.table.install(
            &self.hv,
            &mut self.frames,
            self.engine.shadow_view,
            pa,
            entry,
            ret,
            payload,
        )
    }

    /// Register a batch of callbacks. Failures are logged per entry and do
    /// not stop the batch; returns how many were installed.
    pub fn set_callbacks(
        &mut self,
        callbacks: impl IntoIterator<Item = CallbackSpec<H>>,
    ) -> usize {
        let mut installed = 0;
        for spec in callbacks {
            if self.interrupted() {
                break;
            }
            let CallbackSpec {
                symbol,
                entry,
                ret,
                payload,
            } = spec;
            match self.set_callback(&symbol, entry, ret, payload) {
                Ok(_) => installed += 1,
                Err(e) => warn!("skipping `{symbol}`: {e}"),
            }
        }
        installed
    }

    /// Remove one breakpoint, restoring the shadow byte from the current
    /// original byte; the last breakpoint in a page releases its shadow
    /// frame. A call in flight over the removed breakpoint still gets its
    /// instruction pointer restored at return, but its return callback no
    /// longer exists and its payload will simply be dropped.
    pub fn remove_callback(&mut self, id: BreakpointId) -> Result<()> {
        self.hv.pause()?;
        let result =
            self.engine
                .table
                .remove(&self.hv, &mut self.frames, self.engine.shadow_view, id);
        if let Err(e) = self.hv.resume() {
            error!("failed to resume guest after removal: {e}");
            return result.and(Err(e));
        }
        result
    }

    /// Finalize the run-constant addresses and arm the event monitors.
    /// Idempotent; [`Tracer::run`] calls this first. On failure the guest is
    /// put back on the unmodified view and resumed before the error is
    /// returned.
    pub fn start(&mut self) -> Result<()> {
        if self.engine.armed.is_some() {
            return Ok(());
        }
        self.hv.pause()?;
        match self.finalize() {
            Ok(()) => {
                self.hv.resume()?;
                Ok(())
            }
            Err(e) => {
                if let Err(undo) = self.hv.switch_view(UNMODIFIED_VIEW) {
                    error!("failed to revert the active view after setup failure: {undo}");
                }
                if let Err(undo) = self.hv.resume() {
                    error!("failed to resume guest after setup failure: {undo}");
                }
                Err(e)
            }
        }
    }

    fn finalize(&mut self) -> Result<()> {
        self.hv.switch_view(self.engine.shadow_view)?;
        self.hv.monitor_interrupts()?;
        self.hv.monitor_memory_access()?;

        // One step event per VCPU, registered now so trap servicing never
        // has to set one up.
        for vcpu in 0..self.hv.vcpu_count()? {
            self.hv.register_singlestep(VcpuId(vcpu))?;
        }

        let return_point = os::find_return_point(self.os, &self.hv)?;
        let trampoline = trampoline::locate(&self.hv)?;
        debug!("canonical return point {return_point}, trampoline {trampoline}");
        self.engine.arm(trampoline, return_point);
        Ok(())
    }

    /// One listen round: wait up to `timeout` for events and service them.
    /// [`Tracer::run`] is this in a loop; embedders with their own loop can
    /// call it directly.
    pub fn poll(&mut self, timeout: Duration) -> Result<()> {
        self.hv.listen(timeout, &mut self.engine)
    }

    /// Trace until [`Tracer::quit`] or an [`InterruptHandle`] stops the
    /// loop, or until listening for events fails.
    pub fn run(&mut self) -> Result<()> {
        self.start()?;
        while !self.interrupted() {
            self.poll(EVENT_POLL)?;
        }
        Ok(())
    }

    /// Stop the loop and strip the guest of all instrumentation: restore
    /// every in-flight return slot, clear the breakpoint table, and put all
    /// VCPUs back on the unmodified view. The guest is left running.
    /// Failures are logged; teardown never aborts partway.
    pub fn quit(&mut self) {
        self.interrupted.store(true, Ordering::SeqCst);

        if let Err(e) = self.hv.pause() {
            error!("failed to pause guest for quit: {e}");
        }
        self.engine.restore_in_flight(&self.hv);
        self.engine
            .table
            .clear(&self.hv, &mut self.frames, self.engine.shadow_view);
        if let Err(e) = self.hv.switch_view(UNMODIFIED_VIEW) {
            error!("failed to revert to the unmodified view: {e}");
        }
        if let Err(e) = self.hv.resume() {
            error!("failed to resume guest after quit: {e}");
        }
    }

    /// Detach from the guest: everything [`Tracer::quit`] does, plus
    /// destroying the shadow view, disabling multi-view SLAT, and restoring
    /// the domain's memory cap. Dropping the tracer does the same.
    pub fn close(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Err(e) = self.hv.pause() {
            error!("failed to pause guest for teardown: {e}");
        }
        self.engine.restore_in_flight(&self.hv);
        self.engine
            .table
            .clear(&self.hv, &mut self.frames, self.engine.shadow_view);
        if let Err(e) = self.hv.switch_view(UNMODIFIED_VIEW) {
            error!("failed to revert to the unmodified view: {e}");
        }
        if let Err(e) = self.hv.destroy_view(self.engine.shadow_view) {
            error!("failed to destroy the shadow view: {e}");
        }
        if let Err(e) = self.hv.disable_slat_views() {
            error!("failed to disable SLAT views: {e}");
        }
        if let Err(e) = self.frames.restore_cap(&self.hv) {
            error!("failed to restore the guest memory cap: {e}");
        }
        if let Err(e) = self.hv.resume() {
            error!("failed to resume guest after teardown: {e}");
        }
    }
}

impl<H: Hypervisor> Drop for Tracer<H> {
    fn drop(&mut self) {
        self.teardown();
    }
}
