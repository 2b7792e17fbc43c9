//! Typed failures surfaced by the engine and its drivers.

use crate::arch::Va;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Errors produced by the tracer and by [`Hypervisor`](crate::Hypervisor)
/// implementations.
///
/// Only user-facing operations return these; trap servicing absorbs its own
/// failures with logging and a safe default response so the guest always
/// makes progress.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A hypervisor primitive failed outright.
    #[error("hypervisor failure in {op}: {reason}")]
    Hypervisor {
        /// The primitive that failed.
        op: &'static str,
        /// Driver-specific detail.
        reason: String,
    },

    /// The named guest does not exist or could not be opened.
    #[error("guest `{0}` not found")]
    GuestNotFound(String),

    /// The guest runs an operating system the tracer has no support for.
    #[error("unsupported guest operating system")]
    UnsupportedOs,

    /// A kernel virtual address has no physical mapping.
    #[error("virtual address {0} does not translate")]
    Translation(Va),

    /// A requested kernel symbol did not resolve to a virtual address.
    #[error("kernel symbol `{0}` does not resolve")]
    SymbolUnresolved(String),

    /// No pre-existing breakpoint byte was found within the first page of
    /// the system-call entry path, so there is nowhere to land returns
    /// without injecting a new byte into the guest image.
    #[error("no breakpoint byte within the first page of the syscall entry")]
    TrampolineNotFound,

    /// The dispatch call inside the system-call handler was not found, so
    /// the canonical return address cannot be derived.
    #[error("return point not found in the syscall entry path")]
    ReturnPointNotFound,

    /// Disassembly of guest code failed.
    #[error("disassembly failed: {0}")]
    Disassembly(String),

    /// Installing a breakpoint failed partway; every completed step was
    /// rolled back before this was returned.
    #[error("breakpoint install failed while {step}")]
    Install {
        /// The install step that failed.
        step: &'static str,
        /// The underlying failure.
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Shorthand for driver code reporting a failed primitive.
    pub fn hypervisor(op: &'static str, reason: impl ToString) -> Self {
        Error::Hypervisor {
            op,
            reason: reason.to_string(),
        }
    }

    pub(crate) fn install(step: &'static str, source: Error) -> Self {
        Error::Install {
            step,
            source: Box::new(source),
        }
    }
}
