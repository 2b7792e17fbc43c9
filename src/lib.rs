//! The `shadowtrace` command-line tracer.
//!
//! One positional argument (the guest name) plus an optional syscall list.
//! The built-in callbacks are a printing pair: the entry logs the call and
//! the calling thread, the return logs the value the call came back with.
//! Programs wanting richer decoding should use the `shadowtrace` crate
//! directly and register their own callbacks.

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::info;
use shadowtrace::{
    CallbackSpec, Hypervisor, InterruptHandle, OsKind, Tracer, TrapContext,
};
use std::any::Any;
use std::sync::Arc;

/// Handlers traced when no `--syscall` is given on a Linux guest.
const LINUX_SYSCALLS: &[&str] = &[
    "sys_open",
    "sys_openat",
    "sys_read",
    "sys_write",
    "sys_close",
    "sys_execve",
];

/// Handlers traced when no `--syscall` is given on a Windows guest.
const WINDOWS_SYSCALLS: &[&str] = &[
    "NtCreateFile",
    "NtOpenFile",
    "NtReadFile",
    "NtWriteFile",
    "NtClose",
];

/// Trace system calls inside a running guest without leaving fingerprints.
#[derive(Parser)]
#[command(name = "shadowtrace", version, about)]
pub struct TraceCommand {
    /// Name of the running guest domain to trace.
    guest: String,

    /// Kernel symbol to trap; may be given multiple times. Defaults to a
    /// small per-OS set of common system calls.
    #[arg(long = "syscall", value_name = "SYMBOL")]
    syscalls: Vec<String>,

    /// Stop tracing after this many seconds.
    #[arg(long, value_name = "SECONDS")]
    timeout: Option<u32>,
}

impl TraceCommand {
    /// Run the trace to completion. Returns only after the guest has been
    /// stripped of all instrumentation.
    pub fn execute(self) -> Result<()> {
        #[cfg(feature = "xen")]
        {
            let driver = shadowtrace::XenDriver::new(&self.guest)
                .with_context(|| format!("failed to open guest `{}`", self.guest))?;
            run_trace(driver, self.syscalls, self.timeout)
        }
        #[cfg(not(feature = "xen"))]
        {
            let TraceCommand { guest, .. } = self;
            bail!(
                "no hypervisor driver in this build, so guest `{guest}` is unreachable; \
                 rebuild with `--features xen`"
            );
        }
    }
}

/// Attach, register the printing callbacks, and trace until interrupted.
pub fn run_trace<H: Hypervisor>(
    hypervisor: H,
    syscalls: Vec<String>,
    timeout: Option<u32>,
) -> Result<()> {
    let mut tracer = Tracer::new(hypervisor).context("failed to attach to the guest")?;
    let os = tracer.os();
    info!("attached to {os} guest");

    let symbols = if syscalls.is_empty() {
        let defaults = match os {
            OsKind::Windows => WINDOWS_SYSCALLS,
            _ => LINUX_SYSCALLS,
        };
        defaults.iter().map(|s| s.to_string()).collect()
    } else {
        syscalls
    };

    let installed = tracer.set_callbacks(printer_callbacks(&symbols));
    if installed == 0 {
        tracer.close();
        bail!("none of the requested syscalls could be traced");
    }
    info!("tracing {installed} of {} requested syscalls", symbols.len());

    install_signal_handlers(&tracer.interrupt_handle())?;
    #[cfg(unix)]
    if let Some(seconds) = timeout {
        // SIGALRM lands in the handler set installed above.
        unsafe {
            libc::alarm(seconds);
        }
    }

    let outcome = tracer.run();
    tracer.quit();
    tracer.close();
    outcome.context("event loop failed")?;

    info!("clean shutdown");
    Ok(())
}

/// The degenerate callback pair: entry and return both print.
pub fn printer_callbacks<H: Hypervisor>(symbols: &[String]) -> Vec<CallbackSpec<H>> {
    symbols
        .iter()
        .map(|symbol| {
            let name = symbol.clone();
            let entry = Box::new(
                move |cx: &TrapContext<'_, H>, _registered: &mut dyn Any| -> Box<dyn Any> {
                    info!("[{}] {name} thread {}", cx.pid, cx.thread);
                    Box::new(name.clone()) as Box<dyn Any>
                },
            );
            let ret = Box::new(|cx: &TrapContext<'_, H>, payload: Box<dyn Any>| {
                let name = payload
                    .downcast::<String>()
                    .map(|n| *n)
                    .unwrap_or_default();
                info!("[{}] {name} -> {:#x}", cx.pid, cx.event.regs.rax);
            });
            CallbackSpec::new(symbol.clone(), entry, ret, Box::new(()))
        })
        .collect()
}

/// SIGINT, SIGTERM, SIGHUP, and SIGALRM all stop the trace; teardown then
/// proceeds normally so the guest is never left instrumented.
fn install_signal_handlers(handle: &InterruptHandle) -> Result<()> {
    use signal_hook::consts::{SIGALRM, SIGHUP, SIGINT, SIGTERM};

    for signal in [SIGHUP, SIGINT, SIGTERM, SIGALRM] {
        signal_hook::flag::register(signal, Arc::clone(handle.flag()))
            .with_context(|| format!("failed to install handler for signal {signal}"))?;
    }
    Ok(())
}
