//! Windows return-point discovery.

use crate::arch::Va;
use crate::error::Result;
use crate::hypervisor::Hypervisor;

/// Windows enters through `KiSystemCall64` at LSTAR; the service dispatch is
/// the first `call` reachable from the stub, and traced services resume at
/// the instruction after it.
pub(super) fn find_return_point<H: Hypervisor>(hv: &H) -> Result<Va> {
    let entry = super::syscall_entry(hv)?;
    super::find_addr_after_instruction(hv, entry, "call", None)
}
