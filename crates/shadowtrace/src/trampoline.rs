//! Return-site trap selection.
//!
//! Rather than injecting a new byte somewhere in the guest, the return trap
//! reuses a breakpoint instruction the kernel image already contains near
//! the system-call entry point. An integrity scan of the monitored frames
//! therefore sees exactly the bytes it has always seen.

use crate::arch::{Va, VcpuId, BREAKPOINT, MSR_LSTAR, PAGE_SIZE};
use crate::error::{Error, Result};
use crate::hypervisor::Hypervisor;
use log::debug;

/// Find an existing `int3` byte within the first page of the system-call
/// entry path. LSTAR is constant across VCPUs, so VCPU 0 is as good as any.
pub(crate) fn locate<H: Hypervisor>(hv: &H) -> Result<Va> {
    let entry = Va(hv.read_msr(VcpuId(0), MSR_LSTAR)?);
    let pa = hv.translate_kernel_va(entry)?;

    let mut code = vec![0u8; PAGE_SIZE as usize];
    hv.read_phys(pa, &mut code)?;

    match code.iter().position(|&byte| byte == BREAKPOINT) {
        Some(offset) => {
            let trampoline = entry + offset as u64;
            debug!("return trampoline at {trampoline}");
            Ok(trampoline)
        }
        None => Err(Error::TrampolineNotFound),
    }
}
