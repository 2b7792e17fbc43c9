//! In-flight call state, keyed by thread identity.

use crate::arch::ThreadId;
use crate::table::BreakpointId;
use indexmap::IndexMap;
use log::warn;
use std::any::Any;

/// Everything remembered between a call-site trap and its return trap.
pub(crate) struct CallState {
    /// The breakpoint that fired at entry.
    pub breakpoint: BreakpointId,
    /// Whatever the entry callback returned; owned here until the return
    /// callback takes it.
    pub payload: Box<dyn Any>,
    /// The identity this state is filed under, kept in the value so teardown
    /// can find the hijacked stack slot.
    pub thread: ThreadId,
}

/// Tracks calls between entry and return. Entries and returns may land on
/// different VCPUs; the key is the thread's entry-time stack pointer, which
/// survives migration.
#[derive(Default)]
pub(crate) struct CallStateTracker {
    calls: IndexMap<ThreadId, CallState>,
}

impl CallStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, thread: ThreadId, state: CallState) {
        if self.calls.insert(thread, state).is_some() {
            // The same stack pointer re-entered without a matching return;
            // the guest unwound in a way we cannot follow. The replaced
            // payload is dropped.
            warn!("thread {thread} re-entered with a call still in flight");
        }
    }

    pub fn take(&mut self, thread: ThreadId) -> Option<CallState> {
        self.calls.swap_remove(&thread)
    }

    /// Remove every entry, oldest first, feeding each to `visitor`.
    pub fn drain_all(&mut self, mut visitor: impl FnMut(CallState)) {
        for (_, state) in self.calls.drain(..) {
            visitor(state);
        }
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }
}
