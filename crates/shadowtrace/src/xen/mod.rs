//! The production driver: Xen altp2m through libvmi and xenctrl.
//!
//! Control-plane calls go straight through the shim; the event plane stashes
//! the handler for the duration of one `st_events_listen` call, during which
//! the shim forwards each libvmi event as a flat [`ffi::StEvent`] and turns
//! the returned [`EventResponse`] back into libvmi response flags.

mod ffi;

use crate::arch::{Gfn, Pa, Pid, Registers, Va, VcpuId, View, MSR_LSTAR};
use crate::error::{Error, Result};
use crate::hypervisor::{
    Access, Event, EventHandler, EventResponse, Hypervisor, InterruptEvent, MemAccessEvent,
    SinglestepEvent,
};
use crate::os::OsKind;
use libc::c_void;
use log::warn;
use std::ffi::CString;
use std::time::Duration;

/// A tracee reached over Xen.
pub struct XenDriver {
    vmi: *mut c_void,
    xch: *mut c_void,
    domid: u32,
}

impl XenDriver {
    /// Open the named domain for introspection and events.
    pub fn new(guest_name: &str) -> Result<Self> {
        let name = CString::new(guest_name)
            .map_err(|_| Error::GuestNotFound(guest_name.to_string()))?;

        let mut vmi = std::ptr::null_mut();
        if unsafe { ffi::st_init(name.as_ptr(), &mut vmi) } != 0 {
            return Err(Error::GuestNotFound(guest_name.to_string()));
        }

        let xch = unsafe { ffi::st_xc_open() };
        if xch.is_null() {
            unsafe { ffi::st_destroy(vmi) };
            return Err(Error::hypervisor("xc_interface_open", "no control interface"));
        }

        let domid = unsafe { ffi::st_domid(vmi) };
        Ok(XenDriver { vmi, xch, domid })
    }
}

impl Drop for XenDriver {
    fn drop(&mut self) {
        unsafe {
            ffi::st_xc_close(self.xch);
            ffi::st_destroy(self.vmi);
        }
    }
}

fn check(op: &'static str, rc: libc::c_int) -> Result<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(Error::hypervisor(op, format!("rc={rc}")))
    }
}

struct ListenCx<'a> {
    driver: &'a XenDriver,
    handler: &'a mut dyn EventHandler<XenDriver>,
}

unsafe extern "C" fn forward_event(
    ev: *const ffi::StEvent,
    resp: *mut ffi::StResponse,
    ctx: *mut c_void,
) {
    let cx = &mut *(ctx as *mut ListenCx<'_>);
    let ev = &*ev;

    let regs = Registers {
        rip: ev.rip,
        rsp: ev.rsp,
        cr3: ev.cr3,
        rax: ev.rax,
    };
    let vcpu = VcpuId(ev.vcpu);

    let event = match ev.kind {
        ffi::ST_EVENT_INTERRUPT => Event::Interrupt(InterruptEvent {
            vcpu,
            gla: Va(ev.gla),
            regs,
        }),
        ffi::ST_EVENT_MEMACCESS => Event::MemAccess(MemAccessEvent {
            vcpu,
            gfn: Gfn(ev.gfn),
            access: Access::from_bits_truncate(ev.access as u8),
            regs,
        }),
        ffi::ST_EVENT_SINGLESTEP => Event::Singlestep(SinglestepEvent { vcpu, regs }),
        other => {
            warn!("unknown event kind {other} from shim; ignoring");
            return;
        }
    };

    let response = cx.handler.handle_event(cx.driver, &event);

    let resp = &mut *resp;
    if let Some(view) = response.switch_view {
        resp.set_view = 1;
        resp.view = view.0;
    }
    resp.toggle_singlestep = response.toggle_singlestep.into();
    resp.reinject = response.reinject.into();
}

impl Hypervisor for XenDriver {
    fn guest_os(&self) -> Result<OsKind> {
        Ok(match unsafe { ffi::st_ostype(self.vmi) } {
            1 => OsKind::Linux,
            2 => OsKind::Windows,
            _ => OsKind::Unknown,
        })
    }

    fn vcpu_count(&self) -> Result<u32> {
        match unsafe { ffi::st_num_vcpus(self.vmi) } {
            0 => Err(Error::hypervisor("vmi_get_num_vcpus", "zero VCPUs")),
            n => Ok(n),
        }
    }

    fn word_width(&self) -> Result<usize> {
        match unsafe { ffi::st_word_width(self.vmi) } {
            width @ (4 | 8) => Ok(width as usize),
            other => Err(Error::hypervisor(
                "vmi_get_address_width",
                format!("unsupported width {other}"),
            )),
        }
    }

    fn memory_size(&self) -> Result<u64> {
        match unsafe { ffi::st_memsize(self.vmi) } {
            0 => Err(Error::hypervisor("vmi_get_memsize", "zero memory size")),
            size => Ok(size),
        }
    }

    fn set_max_memory(&self, bytes: u64) -> Result<()> {
        check("xc_domain_setmaxmem", unsafe {
            ffi::st_set_max_mem(self.xch, self.domid, bytes)
        })
    }

    fn pause(&self) -> Result<()> {
        check("vmi_pause_vm", unsafe { ffi::st_pause(self.vmi) })
    }

    fn resume(&self) -> Result<()> {
        check("vmi_resume_vm", unsafe { ffi::st_resume(self.vmi) })
    }

    fn read_phys(&self, pa: Pa, buf: &mut [u8]) -> Result<()> {
        check("vmi_read_pa", unsafe {
            ffi::st_read_phys(self.vmi, pa.0, buf.as_mut_ptr(), buf.len() as u64)
        })
    }

    fn write_phys(&self, pa: Pa, buf: &[u8]) -> Result<()> {
        check("vmi_write_pa", unsafe {
            ffi::st_write_phys(self.vmi, pa.0, buf.as_ptr(), buf.len() as u64)
        })
    }

    fn translate_kernel_va(&self, va: Va) -> Result<Pa> {
        match unsafe { ffi::st_translate_kv2p(self.vmi, va.0) } {
            0 => Err(Error::Translation(va)),
            pa => Ok(Pa(pa)),
        }
    }

    fn translate_kernel_symbol(&self, symbol: &str) -> Result<Va> {
        let name = CString::new(symbol)
            .map_err(|_| Error::SymbolUnresolved(symbol.to_string()))?;
        match unsafe { ffi::st_ksym2v(self.vmi, name.as_ptr()) } {
            0 => Err(Error::SymbolUnresolved(symbol.to_string())),
            va => Ok(Va(va)),
        }
    }

    fn read_msr(&self, vcpu: VcpuId, msr: u32) -> Result<u64> {
        // The only MSR the engine reads; libvmi exposes it as a named
        // register rather than by number.
        if msr != MSR_LSTAR {
            return Err(Error::hypervisor("vmi_get_vcpureg", format!("msr {msr:#x}")));
        }
        let mut value = 0u64;
        check("vmi_get_vcpureg", unsafe {
            ffi::st_read_lstar(self.vmi, vcpu.0, &mut value)
        })?;
        Ok(value)
    }

    fn pid_from_translation_root(&self, root: Pa) -> Result<Pid> {
        match unsafe { ffi::st_dtb_to_pid(self.vmi, root.0) } {
            pid if pid > 0 => Ok(Pid(pid as u32)),
            _ => Err(Error::hypervisor("vmi_dtb_to_pid", "unresolved")),
        }
    }

    fn set_instruction_pointer(&self, vcpu: VcpuId, va: Va) -> Result<()> {
        check("vmi_set_vcpureg", unsafe {
            ffi::st_set_ip(self.vmi, vcpu.0, va.0)
        })
    }

    fn allocate_frame(&self) -> Result<Gfn> {
        let mut gfn = 0u64;
        check("xc_domain_populate_physmap_exact", unsafe {
            ffi::st_alloc_frame(self.xch, self.domid, &mut gfn)
        })?;
        Ok(Gfn(gfn))
    }

    fn free_frame(&self, gfn: Gfn) -> Result<()> {
        check("xc_domain_decrease_reservation_exact", unsafe {
            ffi::st_free_frame(self.xch, self.domid, gfn.0)
        })
    }

    fn enable_slat_views(&self) -> Result<()> {
        check("xc_altp2m_set_domain_state", unsafe {
            ffi::st_altp2m_set_state(self.xch, self.domid, 1)
        })
    }

    fn disable_slat_views(&self) -> Result<()> {
        check("xc_altp2m_set_domain_state", unsafe {
            ffi::st_altp2m_set_state(self.xch, self.domid, 0)
        })
    }

    fn create_view(&self) -> Result<View> {
        let mut view = 0u16;
        check("xc_altp2m_create_view", unsafe {
            ffi::st_altp2m_create_view(self.xch, self.domid, &mut view)
        })?;
        Ok(View(view))
    }

    fn destroy_view(&self, view: View) -> Result<()> {
        check("xc_altp2m_destroy_view", unsafe {
            ffi::st_altp2m_destroy_view(self.xch, self.domid, view.0)
        })
    }

    fn switch_view(&self, view: View) -> Result<()> {
        check("xc_altp2m_switch_to_view", unsafe {
            ffi::st_altp2m_switch(self.xch, self.domid, view.0)
        })
    }

    fn remap_frame(&self, view: View, gfn: Gfn, replacement: Gfn) -> Result<()> {
        check("xc_altp2m_change_gfn", unsafe {
            ffi::st_altp2m_remap(self.xch, self.domid, view.0, gfn.0, replacement.0)
        })
    }

    fn reset_frame(&self, view: View, gfn: Gfn) -> Result<()> {
        check("xc_altp2m_change_gfn", unsafe {
            ffi::st_altp2m_reset(self.xch, self.domid, view.0, gfn.0)
        })
    }

    fn watch_frame(&self, gfn: Gfn, view: View, _access: Access) -> Result<()> {
        check("vmi_set_mem_event", unsafe {
            ffi::st_set_mem_watch(self.vmi, gfn.0, view.0, 1)
        })
    }

    fn unwatch_frame(&self, gfn: Gfn, view: View) -> Result<()> {
        check("vmi_set_mem_event", unsafe {
            ffi::st_set_mem_watch(self.vmi, gfn.0, view.0, 0)
        })
    }

    fn monitor_interrupts(&self) -> Result<()> {
        check("vmi_register_event", unsafe {
            ffi::st_monitor_interrupts(self.vmi)
        })
    }

    fn monitor_memory_access(&self) -> Result<()> {
        check("vmi_register_event", unsafe {
            ffi::st_monitor_memory(self.vmi)
        })
    }

    fn register_singlestep(&self, vcpu: VcpuId) -> Result<()> {
        check("vmi_register_event", unsafe {
            ffi::st_register_singlestep(self.vmi, vcpu.0)
        })
    }

    fn listen(&self, timeout: Duration, handler: &mut dyn EventHandler<Self>) -> Result<()> {
        let mut cx = ListenCx {
            driver: self,
            handler,
        };
        check("vmi_events_listen", unsafe {
            ffi::st_events_listen(
                self.vmi,
                timeout.as_millis() as u32,
                forward_event,
                &mut cx as *mut ListenCx<'_> as *mut c_void,
            )
        })
    }
}
