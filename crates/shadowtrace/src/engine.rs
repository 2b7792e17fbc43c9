//! The trap dispatcher: one handler for every event the guest raises.
//!
//! Interrupt events split on the faulting address: the shared return-site
//! trampoline means a traced call is returning, anything else is a
//! (potential) call-site breakpoint. Memory-access and single-step events
//! are the two halves of the one-instruction unmodified-view window.
//!
//! Nothing in here returns an error. A trap handler that fails must still
//! hand the hypervisor a response the guest can survive, so every failure
//! path logs and falls back to re-injection or a plain step-through.

use crate::arch::{Pid, ThreadId, Va, View, UNMODIFIED_VIEW};
use crate::hypervisor::{
    read_guest_word, write_guest_word, Event, EventHandler, EventResponse, Hypervisor,
    InterruptEvent, MemAccessEvent, SinglestepEvent,
};
use crate::table::BreakpointTable;
use crate::tracer::TrapContext;
use crate::tracker::{CallState, CallStateTracker};
use log::{debug, error, trace};

/// The two addresses finalized when the loop starts; immutable afterwards.
#[derive(Clone, Copy)]
pub(crate) struct Armed {
    /// The return-site trap: a breakpoint byte the guest image already
    /// contains.
    pub trampoline: Va,
    /// Where a system call would normally resume after dispatch.
    pub return_point: Va,
}

pub(crate) struct Engine<H: Hypervisor> {
    pub table: BreakpointTable<H>,
    pub tracker: CallStateTracker,
    pub shadow_view: View,
    pub word_width: usize,
    pub armed: Option<Armed>,
}

impl<H: Hypervisor> Engine<H> {
    pub fn new(shadow_view: View, word_width: usize) -> Self {
        Engine {
            table: BreakpointTable::new(),
            tracker: CallStateTracker::new(),
            shadow_view,
            word_width,
            armed: None,
        }
    }

    pub fn arm(&mut self, trampoline: Va, return_point: Va) {
        self.armed = Some(Armed {
            trampoline,
            return_point,
        });
    }

    /// A call-site trap: the guest is entering a traced system call.
    fn on_call(&mut self, hv: &H, ev: &InterruptEvent, armed: Armed) -> EventResponse {
        let pa = match hv.translate_kernel_va(ev.gla) {
            Ok(pa) => pa,
            Err(_) => return EventResponse::reinject(),
        };
        let Some(id) = self.table.lookup(pa) else {
            // Not a byte we planted; the guest's own handler gets it.
            return EventResponse::reinject();
        };

        // The trap is ours. Whatever happens below, the VCPU steps through
        // the unmodified view so the real first instruction executes.
        let response = EventResponse::step_through(UNMODIFIED_VIEW);

        let thread = ThreadId(ev.regs.rsp);
        let slot = match hv.translate_kernel_va(Va(thread.0)) {
            Ok(slot) => slot,
            Err(e) => {
                debug!("cannot translate stack pointer {thread}: {e}");
                return response;
            }
        };
        let word = match read_guest_word(hv, self.word_width, slot) {
            Ok(word) => word,
            Err(e) => {
                debug!("cannot read return slot of {thread}: {e}");
                return response;
            }
        };
        if word != armed.return_point.0 {
            // The call did not arrive through the normal handler path.
            // Leave the stack alone and record nothing.
            debug!("return slot of {thread} holds {word:#x}, not the canonical return point");
            return response;
        }

        let pid = hv
            .pid_from_translation_root(ev.regs.translation_root())
            .unwrap_or(Pid(0));

        let payload = {
            let record = self.table.record_mut(id).expect("record was just looked up");
            let cx = TrapContext {
                hypervisor: hv,
                event: ev,
                pid,
                thread,
            };
            (record.entry)(&cx, record.payload.as_mut())
        };

        // Hijack before recording: a call-state entry exists only while the
        // guest stack actually holds the trampoline address.
        if let Err(e) = write_guest_word(hv, self.word_width, slot, armed.trampoline.0) {
            error!("failed to hijack return slot of {thread}: {e}; dropping the call");
            return response;
        }
        self.tracker.record(
            thread,
            CallState {
                breakpoint: id,
                payload,
                thread,
            },
        );

        response
    }

    /// The return-site trap: a traced call is coming back through the
    /// trampoline.
    fn on_return(&mut self, hv: &H, ev: &InterruptEvent, armed: Armed) -> EventResponse {
        // The return already popped the slot; the entry-time stack pointer
        // sits one word below the current one. This assumes call/return
        // discipline held in between; kernel-internal unwinding that skips
        // the return entirely is not handled.
        let thread = ThreadId(ev.regs.rsp.wrapping_sub(self.word_width as u64));
        let Some(state) = self.tracker.take(thread) else {
            trace!("return-site trap with no call in flight; ignoring");
            return EventResponse::none();
        };
        debug_assert_eq!(state.thread, thread);

        let pid = hv
            .pid_from_translation_root(ev.regs.translation_root())
            .unwrap_or(Pid(0));

        match self.table.record_mut(state.breakpoint) {
            Some(record) => {
                let cx = TrapContext {
                    hypervisor: hv,
                    event: ev,
                    pid,
                    thread,
                };
                (record.ret)(&cx, state.payload);
            }
            None => {
                // The breakpoint was removed while this call was in flight,
                // so there is no callback left to run. The payload is
                // released here.
                debug!("call on {thread} returned after its breakpoint was removed");
            }
        }

        if let Err(e) = hv.set_instruction_pointer(ev.vcpu, armed.return_point) {
            error!(
                "failed to redirect {} to the return point: {e}; guest will likely fault",
                ev.vcpu
            );
        }
        EventResponse::none()
    }

    /// An integrity scan (or any read/write) touched a monitored frame: let
    /// the instruction run once against the pristine image.
    fn on_mem_access(&mut self, ev: &MemAccessEvent) -> EventResponse {
        trace!("{} touched watched frame {}; stepping through view 0", ev.vcpu, ev.gfn);
        EventResponse::step_through(UNMODIFIED_VIEW)
    }

    /// The one-instruction reprieve is over; breakpoints come back.
    fn on_step(&mut self, ev: &SinglestepEvent) -> EventResponse {
        trace!("{} stepped; back to the shadow view", ev.vcpu);
        EventResponse::step_through(self.shadow_view)
    }

    /// Write the canonical return address back into every in-flight call's
    /// stack slot so the guest outlives the tracer. Failures are logged and
    /// skipped; the tracker always ends empty.
    pub fn restore_in_flight(&mut self, hv: &H) {
        let Some(armed) = self.armed else {
            debug_assert_eq!(self.tracker.len(), 0);
            return;
        };
        let width = self.word_width;
        self.tracker.drain_all(|state| {
            let slot = match hv.translate_kernel_va(Va(state.thread.0)) {
                Ok(slot) => slot,
                Err(e) => {
                    error!(
                        "cannot translate stack of {} during teardown: {e}; guest will likely fail",
                        state.thread
                    );
                    return;
                }
            };
            if let Err(e) = write_guest_word(hv, width, slot, armed.return_point.0) {
                error!(
                    "failed to restore return slot of {}: {e}; guest will likely fail",
                    state.thread
                );
            }
            // The payload drops here; its return callback never ran.
        });
    }
}

impl<H: Hypervisor> EventHandler<H> for Engine<H> {
    fn handle_event(&mut self, hv: &H, event: &Event) -> EventResponse {
        match event {
            Event::Interrupt(ev) => {
                let Some(armed) = self.armed else {
                    // No trap of ours can fire before the addresses are
                    // finalized.
                    return EventResponse::reinject();
                };
                if ev.gla == armed.trampoline {
                    self.on_return(hv, ev, armed)
                } else {
                    self.on_call(hv, ev, armed)
                }
            }
            Event::MemAccess(ev) => self.on_mem_access(ev),
            Event::Singlestep(ev) => self.on_step(ev),
        }
    }
}
