//! Guest operating-system specifics.
//!
//! The only per-OS behavior the engine needs is where a system call would
//! normally resume after the entry stub dispatches it. Dispatch is a plain
//! `match`: the variant is resolved once at construction and adding an OS
//! means adding an arm.

mod linux;
mod windows;

use crate::arch::{Va, VcpuId, MSR_LSTAR, PAGE_SIZE};
use crate::error::{Error, Result};
use crate::hypervisor::Hypervisor;
use capstone::arch::x86::ArchMode;
use capstone::arch::BuildsCapstone;
use capstone::Capstone;
use core::fmt;

/// The operating system a guest runs, as reported by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsKind {
    /// A Linux kernel.
    Linux,
    /// A Windows kernel.
    Windows,
    /// Anything else; such guests cannot be traced.
    Unknown,
}

impl fmt::Display for OsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OsKind::Linux => f.write_str("linux"),
            OsKind::Windows => f.write_str("windows"),
            OsKind::Unknown => f.write_str("unknown"),
        }
    }
}

/// The address where the kernel's system-call handler resumes after
/// dispatching to the per-call routine, i.e. the canonical return address.
pub(crate) fn find_return_point<H: Hypervisor>(os: OsKind, hv: &H) -> Result<Va> {
    match os {
        OsKind::Linux => linux::find_return_point(hv),
        OsKind::Windows => windows::find_return_point(hv),
        OsKind::Unknown => Err(Error::UnsupportedOs),
    }
}

/// The virtual address of the system-call entry stub.
fn syscall_entry<H: Hypervisor>(hv: &H) -> Result<Va> {
    Ok(Va(hv.read_msr(VcpuId(0), MSR_LSTAR)?))
}

/// Disassemble one page starting at `start` and return the address of the
/// instruction immediately following the first one whose mnemonic (and
/// operand string, when given) matches.
fn find_addr_after_instruction<H: Hypervisor>(
    hv: &H,
    start: Va,
    mnemonic: &str,
    operand: Option<&str>,
) -> Result<Va> {
    let pa = hv.translate_kernel_va(start)?;
    let mut code = vec![0u8; PAGE_SIZE as usize];
    hv.read_phys(pa, &mut code)?;

    let cs = Capstone::new()
        .x86()
        .mode(ArchMode::Mode64)
        .build()
        .map_err(|e| Error::Disassembly(e.to_string()))?;
    let insns = cs
        .disasm_all(&code, start.0)
        .map_err(|e| Error::Disassembly(e.to_string()))?;

    for (insn, next) in insns.iter().zip(insns.iter().skip(1)) {
        if insn.mnemonic() == Some(mnemonic)
            && operand.map_or(true, |op| insn.op_str() == Some(op))
        {
            return Ok(Va(next.address()));
        }
    }
    Err(Error::ReturnPointNotFound)
}
