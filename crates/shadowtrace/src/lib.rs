//! Stealth tracing of guest-kernel system calls over multi-view SLAT.
//!
//! The engine keeps two second-level address translation views over a guest:
//! view 0 maps the kernel unmodified, while the *shadow view* substitutes
//! tracer-owned frames carrying `0xcc` breakpoint bytes for the frames that
//! hold traced system-call handlers. The guest normally runs on the shadow
//! view, so traced calls trap into the tracer; whenever something must
//! observe the real kernel image (the trapped instruction itself, or an
//! integrity scan reading a monitored frame) the affected VCPU is flipped to
//! view 0 for exactly one single-stepped instruction and then flipped back.
//!
//! Two kinds of breakpoint exist. A *call-site* breakpoint sits on the first
//! byte of a per-syscall handler. The *return-site* breakpoint is a single
//! `0xcc` byte the guest kernel already contains within its syscall entry
//! page; while servicing a call-site trap the tracer rewrites the return slot
//! on the guest stack to point at it, so the matching return traps without a
//! single new byte appearing in the guest's memory image. After servicing a
//! return trap the instruction pointer is moved to the address the caller
//! originally pushed.
//!
//! The [`Tracer`] is generic over a [`Hypervisor`], the platform port
//! covering view management, guest memory access, and the event stream. The
//! `xen` cargo feature provides the production driver; the companion
//! `shadowtrace-sim` crate provides an in-memory one for tests.

#![deny(missing_docs)]

pub mod arch;
mod engine;
mod error;
mod frames;
pub mod hypervisor;
pub mod os;
mod slab;
mod table;
mod tracker;
mod tracer;
mod trampoline;

#[cfg(feature = "xen")]
pub mod xen;

pub use crate::arch::{
    Gfn, Pa, Pid, Registers, ThreadId, Va, VcpuId, View, BREAKPOINT, MSR_LSTAR, PAGE_SHIFT,
    PAGE_SIZE, UNMODIFIED_VIEW,
};
pub use crate::error::{Error, Result};
pub use crate::hypervisor::{
    Access, Event, EventHandler, EventResponse, Hypervisor, InterruptEvent, MemAccessEvent,
    SinglestepEvent,
};
pub use crate::os::OsKind;
pub use crate::table::BreakpointId;
pub use crate::tracer::{
    CallPayload, CallbackSpec, EntryCallback, InterruptHandle, ReturnCallback, Tracer,
    TrapContext,
};

#[cfg(feature = "xen")]
pub use crate::xen::XenDriver;
