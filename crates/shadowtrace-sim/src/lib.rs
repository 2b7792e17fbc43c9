//! An in-memory [`Hypervisor`] for exercising the engine without a domain.
//!
//! [`SimHypervisor`] models exactly what the engine relies on: guest frames,
//! SLAT views with per-VCPU selection and frame remaps, per-view watch sets,
//! single-step windows, and a serially drained event stream. Tests script the
//! guest by queueing operations (execute an address, return from a call,
//! read a byte) and the sim turns each into the event sequence the real
//! platform would deliver: a breakpoint fetch raises an interrupt, a watched
//! read raises a memory-access event, and any response that opens a step
//! window executes the trapped instruction under the switched view before
//! queueing the single-step completion.
//!
//! The handle is a cheap clone over shared state, so a test can keep one
//! half while the tracer owns the other. Clones must stay on one thread;
//! event delivery is single-threaded by design, matching the engine.
//!
//! Failure injection: [`SimHypervisor::fail_next`] makes the next call of a
//! named primitive fail, which is how the install-rollback paths get tested.

use log::warn;
use shadowtrace::{
    Access, Error, Event, EventHandler, EventResponse, Gfn, Hypervisor, InterruptEvent,
    MemAccessEvent, OsKind, Pa, Pid, Registers, Result, SinglestepEvent, Va, VcpuId, View,
    MSR_LSTAR, PAGE_SIZE, UNMODIFIED_VIEW,
};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const PAGE: usize = PAGE_SIZE as usize;

/// Default guest memory size reported by the sim.
pub const DEFAULT_MEMORY: u64 = 64 * 1024 * 1024;

struct VcpuState {
    view: View,
    singlestep: bool,
    regs: Registers,
}

#[derive(Default)]
struct ViewState {
    remaps: BTreeMap<Gfn, Gfn>,
    watches: BTreeMap<Gfn, Access>,
}

/// One scripted guest action.
enum GuestOp {
    /// Fetch and execute the instruction at `va`.
    Exec { vcpu: VcpuId, va: Va, regs: Registers },
    /// Pop the word at `sp` and jump to it, as `ret` would.
    Ret { vcpu: VcpuId, sp: Va, cr3: u64, rax: u64 },
    /// Read one byte at `va`, the way an integrity scanner would.
    Read { vcpu: VcpuId, va: Va },
}

/// What the VCPU was doing when it trapped; replayed under the switched
/// view once the response opens a step window.
enum TrappedInstr {
    Exec,
    Read { va: Va },
}

struct SimState {
    os: OsKind,
    word_width: usize,
    mem_size: u64,
    max_mem: u64,
    populated: u64,
    frames: BTreeMap<Gfn, Box<[u8; PAGE]>>,
    hv_frames: Vec<Gfn>,
    next_gfn: u64,
    altp2m: bool,
    views: BTreeMap<View, ViewState>,
    next_view: u16,
    vcpus: Vec<VcpuState>,
    pause_depth: i32,
    symbols: HashMap<String, Va>,
    vmap: BTreeMap<u64, u64>,
    msrs: HashMap<u32, u64>,
    pids: HashMap<u64, u32>,
    interrupts_on: bool,
    memory_on: bool,
    step_registered: Vec<bool>,
    ops: VecDeque<GuestOp>,
    step_events: VecDeque<SinglestepEvent>,
    reinjected: Vec<Va>,
    read_results: Vec<(Va, u8)>,
    faults: HashSet<&'static str>,
    idle_flag: Option<Arc<AtomicBool>>,
}

impl SimState {
    fn take_fault(&mut self, op: &'static str) -> bool {
        self.faults.remove(op)
    }

    fn resolve(&self, view: View, gfn: Gfn) -> Gfn {
        self.views
            .get(&view)
            .and_then(|v| v.remaps.get(&gfn).copied())
            .unwrap_or(gfn)
    }

    fn byte_via_view(&self, view: View, pa: Pa) -> Option<u8> {
        let backing = self.resolve(view, pa.gfn());
        self.frames
            .get(&backing)
            .map(|frame| frame[pa.offset() as usize])
    }

    fn kernel_pa(&self, va: Va) -> Option<Pa> {
        let page = va.0 & !(PAGE_SIZE - 1);
        let base = self.vmap.get(&page)?;
        Some(Pa(base + (va.0 & (PAGE_SIZE - 1))))
    }

    fn watched(&self, view: View, gfn: Gfn, access: Access) -> bool {
        self.views
            .get(&view)
            .and_then(|v| v.watches.get(&gfn))
            .map_or(false, |filter| filter.intersects(access))
    }
}

/// The shared handle. Cloning is cheap; all clones see the same guest.
#[derive(Clone)]
pub struct SimHypervisor {
    state: Rc<RefCell<SimState>>,
}

impl SimHypervisor {
    /// A fresh guest with `vcpus` virtual CPUs and no memory; tests add
    /// frames and mappings as needed.
    pub fn new(os: OsKind, vcpus: usize) -> Self {
        let state = SimState {
            os,
            word_width: 8,
            mem_size: DEFAULT_MEMORY,
            max_mem: DEFAULT_MEMORY,
            populated: 0,
            frames: BTreeMap::new(),
            hv_frames: Vec::new(),
            next_gfn: 0x10_0000,
            altp2m: false,
            views: BTreeMap::from([(UNMODIFIED_VIEW, ViewState::default())]),
            next_view: 1,
            vcpus: (0..vcpus)
                .map(|_| VcpuState {
                    view: UNMODIFIED_VIEW,
                    singlestep: false,
                    regs: Registers::default(),
                })
                .collect(),
            pause_depth: 0,
            symbols: HashMap::new(),
            vmap: BTreeMap::new(),
            msrs: HashMap::new(),
            pids: HashMap::new(),
            interrupts_on: false,
            memory_on: false,
            step_registered: vec![false; vcpus],
            ops: VecDeque::new(),
            step_events: VecDeque::new(),
            reinjected: Vec::new(),
            read_results: Vec::new(),
            faults: HashSet::new(),
            idle_flag: None,
        };
        SimHypervisor {
            state: Rc::new(RefCell::new(state)),
        }
    }

    // --- guest construction ------------------------------------------------

    /// Back `gfn` with a zeroed frame.
    pub fn add_frame(&self, gfn: Gfn) {
        self.state
            .borrow_mut()
            .frames
            .insert(gfn, Box::new([0u8; PAGE]));
    }

    /// Write raw bytes at a physical address, bypassing views and faults.
    pub fn write_bytes(&self, pa: Pa, bytes: &[u8]) {
        let mut state = self.state.borrow_mut();
        write_phys_raw(&mut state, pa, bytes).expect("write_bytes outside backed frames");
    }

    /// Read one raw byte at a physical address.
    pub fn read_byte(&self, pa: Pa) -> u8 {
        let state = self.state.borrow();
        state.frames.get(&pa.gfn()).expect("read_byte outside backed frames")
            [pa.offset() as usize]
    }

    /// Map one page of kernel virtual address space onto a physical page.
    pub fn map_kernel(&self, va: Va, pa: Pa) {
        let mut state = self.state.borrow_mut();
        state
            .vmap
            .insert(va.0 & !(PAGE_SIZE - 1), pa.0 & !(PAGE_SIZE - 1));
    }

    /// Register a kernel symbol.
    pub fn add_symbol(&self, name: &str, va: Va) {
        self.state.borrow_mut().symbols.insert(name.to_string(), va);
    }

    /// Set the system-call entry MSR.
    pub fn set_lstar(&self, va: Va) {
        self.state.borrow_mut().msrs.insert(MSR_LSTAR, va.0);
    }

    /// Associate a page-table root with a process id.
    pub fn set_pid(&self, root: Pa, pid: Pid) {
        self.state.borrow_mut().pids.insert(root.0, pid.0);
    }

    // --- guest behavior ----------------------------------------------------

    /// The guest executes the instruction at `va` on `vcpu`.
    pub fn queue_exec(&self, vcpu: VcpuId, va: Va, rsp: u64, cr3: u64) {
        let regs = Registers {
            rip: va.0,
            rsp,
            cr3,
            rax: 0,
        };
        self.state
            .borrow_mut()
            .ops
            .push_back(GuestOp::Exec { vcpu, va, regs });
    }

    /// The guest returns from a call frame whose slot sits at `sp`: the word
    /// there is popped *at execution time* and jumped to, so a slot the
    /// tracer hijacked in the meantime lands on the trampoline.
    pub fn queue_ret(&self, vcpu: VcpuId, sp: Va, cr3: u64, rax: u64) {
        self.state
            .borrow_mut()
            .ops
            .push_back(GuestOp::Ret { vcpu, sp, cr3, rax });
    }

    /// The guest reads one byte at `va` on `vcpu`, as an integrity scan
    /// would.
    pub fn queue_read(&self, vcpu: VcpuId, va: Va) {
        self.state.borrow_mut().ops.push_back(GuestOp::Read { vcpu, va });
    }

    /// Once the script has fully drained, store `true` into `flag` on the
    /// next idle listen round. Wired to the tracer's interrupt flag this
    /// ends [`run`](shadowtrace::Tracer::run) after all queued activity.
    pub fn interrupt_when_idle(&self, flag: Arc<AtomicBool>) {
        self.state.borrow_mut().idle_flag = Some(flag);
    }

    /// Make the next invocation of the named primitive fail. Known names:
    /// `allocate_frame`, `set_max_memory`, `remap_frame`, `watch_frame`,
    /// `write_phys`, `listen`.
    pub fn fail_next(&self, op: &'static str) {
        self.state.borrow_mut().faults.insert(op);
    }

    // --- inspection --------------------------------------------------------

    /// Is `gfn` backed by a frame?
    pub fn frame_exists(&self, gfn: Gfn) -> bool {
        self.state.borrow().frames.contains_key(&gfn)
    }

    /// Frames currently held by the tracer.
    pub fn allocated_frames(&self) -> Vec<Gfn> {
        self.state.borrow().hv_frames.clone()
    }

    /// The remap for `gfn` in `view`, if any.
    pub fn view_mapping(&self, view: View, gfn: Gfn) -> Option<Gfn> {
        self.state
            .borrow()
            .views
            .get(&view)
            .and_then(|v| v.remaps.get(&gfn).copied())
    }

    /// The watch filter for `gfn` in `view`, if any.
    pub fn watch_on(&self, view: View, gfn: Gfn) -> Option<Access> {
        self.state
            .borrow()
            .views
            .get(&view)
            .and_then(|v| v.watches.get(&gfn).copied())
    }

    /// Does `view` exist?
    pub fn view_exists(&self, view: View) -> bool {
        self.state.borrow().views.contains_key(&view)
    }

    /// Is multi-view SLAT enabled?
    pub fn altp2m_enabled(&self) -> bool {
        self.state.borrow().altp2m
    }

    /// The view `vcpu` currently runs on.
    pub fn vcpu_view(&self, vcpu: VcpuId) -> View {
        self.state.borrow().vcpus[vcpu.0 as usize].view
    }

    /// Is `vcpu` single-stepping?
    pub fn vcpu_singlestep(&self, vcpu: VcpuId) -> bool {
        self.state.borrow().vcpus[vcpu.0 as usize].singlestep
    }

    /// The last registers observed on `vcpu`.
    pub fn vcpu_regs(&self, vcpu: VcpuId) -> Registers {
        self.state.borrow().vcpus[vcpu.0 as usize].regs
    }

    /// The domain's current memory cap.
    pub fn max_memory(&self) -> u64 {
        self.state.borrow().max_mem
    }

    /// Net pause depth; zero means the guest is running.
    pub fn pause_depth(&self) -> i32 {
        self.state.borrow().pause_depth
    }

    /// Breakpoint addresses handed back to the guest's own handler.
    pub fn reinjected(&self) -> Vec<Va> {
        self.state.borrow().reinjected.clone()
    }

    /// Results of completed scripted reads, in completion order.
    pub fn read_results(&self) -> Vec<(Va, u8)> {
        self.state.borrow().read_results.clone()
    }

    // --- event pump --------------------------------------------------------

    /// Derive the next deliverable event, executing non-trapping ops along
    /// the way.
    fn next_event(&self) -> Option<(Event, Option<TrappedInstr>)> {
        let mut state = self.state.borrow_mut();

        if let Some(step) = state.step_events.pop_front() {
            return Some((Event::Singlestep(step), None));
        }

        while let Some(op) = state.ops.pop_front() {
            match op {
                GuestOp::Exec { vcpu, va, regs } => {
                    if let Some(event) = begin_exec(&mut state, vcpu, va, regs) {
                        return Some((Event::Interrupt(event), Some(TrappedInstr::Exec)));
                    }
                }
                GuestOp::Ret { vcpu, sp, cr3, rax } => {
                    let Some(slot) = state.kernel_pa(sp) else {
                        warn!("scripted ret at unmapped stack {sp}");
                        continue;
                    };
                    let view = state.vcpus[vcpu.0 as usize].view;
                    let mut word = [0u8; 8];
                    for (i, byte) in word.iter_mut().enumerate() {
                        *byte = state
                            .byte_via_view(view, Pa(slot.0 + i as u64))
                            .unwrap_or(0);
                    }
                    let target = Va(u64::from_le_bytes(word));
                    let regs = Registers {
                        rip: target.0,
                        rsp: sp.0 + state.word_width as u64,
                        cr3,
                        rax,
                    };
                    if let Some(event) = begin_exec(&mut state, vcpu, target, regs) {
                        return Some((Event::Interrupt(event), Some(TrappedInstr::Exec)));
                    }
                }
                GuestOp::Read { vcpu, va } => {
                    let Some(pa) = state.kernel_pa(va) else {
                        warn!("scripted read at unmapped address {va}");
                        continue;
                    };
                    let view = state.vcpus[vcpu.0 as usize].view;
                    if state.memory_on && state.watched(view, pa.gfn(), Access::R) {
                        let regs = state.vcpus[vcpu.0 as usize].regs;
                        let event = MemAccessEvent {
                            vcpu,
                            gfn: pa.gfn(),
                            access: Access::R,
                            regs,
                        };
                        return Some((
                            Event::MemAccess(event),
                            Some(TrappedInstr::Read { va }),
                        ));
                    }
                    let value = state.byte_via_view(view, pa).unwrap_or(0);
                    state.read_results.push((va, value));
                }
            }
        }

        None
    }

    fn apply_response(
        &self,
        event: &Event,
        trapped: Option<TrappedInstr>,
        response: EventResponse,
    ) {
        let mut state = self.state.borrow_mut();

        let vcpu = match event {
            Event::Interrupt(ev) => ev.vcpu,
            Event::MemAccess(ev) => ev.vcpu,
            Event::Singlestep(ev) => ev.vcpu,
        };

        if let Event::Interrupt(ev) = event {
            if response.reinject {
                state.reinjected.push(ev.gla);
                return;
            }
        }

        if let Some(view) = response.switch_view {
            state.vcpus[vcpu.0 as usize].view = view;
        }
        if response.toggle_singlestep {
            let stepping = !state.vcpus[vcpu.0 as usize].singlestep;
            state.vcpus[vcpu.0 as usize].singlestep = stepping;

            if stepping {
                // The step window just opened: the trapped instruction runs
                // once under the switched view, then the step completes.
                if let Some(TrappedInstr::Read { va }) = trapped {
                    let view = state.vcpus[vcpu.0 as usize].view;
                    let value = state
                        .kernel_pa(va)
                        .and_then(|pa| state.byte_via_view(view, pa))
                        .unwrap_or(0);
                    state.read_results.push((va, value));
                }
                if state.step_registered[vcpu.0 as usize] {
                    let regs = state.vcpus[vcpu.0 as usize].regs;
                    state.step_events.push_back(SinglestepEvent { vcpu, regs });
                } else {
                    warn!("{vcpu} entered a step window with no step event registered");
                }
            }
        }
    }
}

/// Fetch at `va` on `vcpu`: a breakpoint byte under the VCPU's current view
/// raises an interrupt; anything else just executes.
fn begin_exec(
    state: &mut SimState,
    vcpu: VcpuId,
    va: Va,
    regs: Registers,
) -> Option<InterruptEvent> {
    state.vcpus[vcpu.0 as usize].regs = regs;

    let Some(pa) = state.kernel_pa(va) else {
        warn!("scripted exec at unmapped address {va}");
        return None;
    };
    let view = state.vcpus[vcpu.0 as usize].view;
    let byte = state.byte_via_view(view, pa)?;

    if byte == shadowtrace::BREAKPOINT && state.interrupts_on {
        Some(InterruptEvent { vcpu, gla: va, regs })
    } else {
        None
    }
}

fn write_phys_raw(state: &mut SimState, pa: Pa, bytes: &[u8]) -> Result<()> {
    let mut addr = pa.0;
    for byte in bytes {
        let gfn = Gfn(addr >> 12);
        let frame = state
            .frames
            .get_mut(&gfn)
            .ok_or_else(|| Error::hypervisor("write_phys", format!("no frame at {gfn}")))?;
        frame[(addr & (PAGE_SIZE - 1)) as usize] = *byte;
        addr += 1;
    }
    Ok(())
}

fn read_phys_raw(state: &SimState, pa: Pa, buf: &mut [u8]) -> Result<()> {
    let mut addr = pa.0;
    for byte in buf {
        let gfn = Gfn(addr >> 12);
        let frame = state
            .frames
            .get(&gfn)
            .ok_or_else(|| Error::hypervisor("read_phys", format!("no frame at {gfn}")))?;
        *byte = frame[(addr & (PAGE_SIZE - 1)) as usize];
        addr += 1;
    }
    Ok(())
}

impl Hypervisor for SimHypervisor {
    fn guest_os(&self) -> Result<OsKind> {
        Ok(self.state.borrow().os)
    }

    fn vcpu_count(&self) -> Result<u32> {
        Ok(self.state.borrow().vcpus.len() as u32)
    }

    fn word_width(&self) -> Result<usize> {
        Ok(self.state.borrow().word_width)
    }

    fn memory_size(&self) -> Result<u64> {
        Ok(self.state.borrow().mem_size)
    }

    fn set_max_memory(&self, bytes: u64) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.take_fault("set_max_memory") {
            return Err(Error::hypervisor("set_max_memory", "injected fault"));
        }
        state.max_mem = bytes;
        Ok(())
    }

    fn pause(&self) -> Result<()> {
        self.state.borrow_mut().pause_depth += 1;
        Ok(())
    }

    fn resume(&self) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.pause_depth -= 1;
        if state.pause_depth < 0 {
            warn!("guest resumed more often than paused");
        }
        Ok(())
    }

    fn read_phys(&self, pa: Pa, buf: &mut [u8]) -> Result<()> {
        read_phys_raw(&self.state.borrow(), pa, buf)
    }

    fn write_phys(&self, pa: Pa, buf: &[u8]) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.take_fault("write_phys") {
            return Err(Error::hypervisor("write_phys", "injected fault"));
        }
        write_phys_raw(&mut state, pa, buf)
    }

    fn translate_kernel_va(&self, va: Va) -> Result<Pa> {
        self.state
            .borrow()
            .kernel_pa(va)
            .ok_or(Error::Translation(va))
    }

    fn translate_kernel_symbol(&self, symbol: &str) -> Result<Va> {
        self.state
            .borrow()
            .symbols
            .get(symbol)
            .copied()
            .ok_or_else(|| Error::SymbolUnresolved(symbol.to_string()))
    }

    fn read_msr(&self, _vcpu: VcpuId, msr: u32) -> Result<u64> {
        self.state
            .borrow()
            .msrs
            .get(&msr)
            .copied()
            .ok_or_else(|| Error::hypervisor("read_msr", format!("msr {msr:#x} unset")))
    }

    fn pid_from_translation_root(&self, root: Pa) -> Result<Pid> {
        self.state
            .borrow()
            .pids
            .get(&root.0)
            .copied()
            .map(Pid)
            .ok_or_else(|| Error::hypervisor("pid_from_translation_root", "unknown root"))
    }

    fn set_instruction_pointer(&self, vcpu: VcpuId, va: Va) -> Result<()> {
        self.state.borrow_mut().vcpus[vcpu.0 as usize].regs.rip = va.0;
        Ok(())
    }

    fn allocate_frame(&self) -> Result<Gfn> {
        let mut state = self.state.borrow_mut();
        if state.take_fault("allocate_frame") {
            return Err(Error::hypervisor("allocate_frame", "injected fault"));
        }
        if state.populated + PAGE_SIZE > state.max_mem {
            return Err(Error::hypervisor("allocate_frame", "memory cap reached"));
        }
        let gfn = Gfn(state.next_gfn);
        state.next_gfn += 1;
        state.frames.insert(gfn, Box::new([0u8; PAGE]));
        state.hv_frames.push(gfn);
        state.populated += PAGE_SIZE;
        Ok(gfn)
    }

    fn free_frame(&self, gfn: Gfn) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.frames.remove(&gfn).is_none() {
            return Err(Error::hypervisor("free_frame", format!("no frame at {gfn}")));
        }
        state.hv_frames.retain(|&g| g != gfn);
        state.populated -= PAGE_SIZE;
        Ok(())
    }

    fn enable_slat_views(&self) -> Result<()> {
        self.state.borrow_mut().altp2m = true;
        Ok(())
    }

    fn disable_slat_views(&self) -> Result<()> {
        self.state.borrow_mut().altp2m = false;
        Ok(())
    }

    fn create_view(&self) -> Result<View> {
        let mut state = self.state.borrow_mut();
        if !state.altp2m {
            return Err(Error::hypervisor("create_view", "multi-view SLAT disabled"));
        }
        let view = View(state.next_view);
        state.next_view += 1;
        state.views.insert(view, ViewState::default());
        Ok(view)
    }

    fn destroy_view(&self, view: View) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.views.remove(&view).is_none() {
            return Err(Error::hypervisor("destroy_view", format!("no {view}")));
        }
        for vcpu in &mut state.vcpus {
            if vcpu.view == view {
                vcpu.view = UNMODIFIED_VIEW;
            }
        }
        Ok(())
    }

    fn switch_view(&self, view: View) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if !state.views.contains_key(&view) {
            return Err(Error::hypervisor("switch_view", format!("no {view}")));
        }
        for vcpu in &mut state.vcpus {
            vcpu.view = view;
        }
        Ok(())
    }

    fn remap_frame(&self, view: View, gfn: Gfn, replacement: Gfn) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.take_fault("remap_frame") {
            return Err(Error::hypervisor("remap_frame", "injected fault"));
        }
        if !state.frames.contains_key(&replacement) {
            return Err(Error::hypervisor(
                "remap_frame",
                format!("no frame at {replacement}"),
            ));
        }
        let views = state
            .views
            .get_mut(&view)
            .ok_or_else(|| Error::hypervisor("remap_frame", format!("no {view}")))?;
        views.remaps.insert(gfn, replacement);
        Ok(())
    }

    fn reset_frame(&self, view: View, gfn: Gfn) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let views = state
            .views
            .get_mut(&view)
            .ok_or_else(|| Error::hypervisor("reset_frame", format!("no {view}")))?;
        views.remaps.remove(&gfn);
        Ok(())
    }

    fn watch_frame(&self, gfn: Gfn, view: View, access: Access) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.take_fault("watch_frame") {
            return Err(Error::hypervisor("watch_frame", "injected fault"));
        }
        let views = state
            .views
            .get_mut(&view)
            .ok_or_else(|| Error::hypervisor("watch_frame", format!("no {view}")))?;
        views.watches.insert(gfn, access);
        Ok(())
    }

    fn unwatch_frame(&self, gfn: Gfn, view: View) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let views = state
            .views
            .get_mut(&view)
            .ok_or_else(|| Error::hypervisor("unwatch_frame", format!("no {view}")))?;
        views.watches.remove(&gfn);
        Ok(())
    }

    fn monitor_interrupts(&self) -> Result<()> {
        self.state.borrow_mut().interrupts_on = true;
        Ok(())
    }

    fn monitor_memory_access(&self) -> Result<()> {
        self.state.borrow_mut().memory_on = true;
        Ok(())
    }

    fn register_singlestep(&self, vcpu: VcpuId) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let slot = state
            .step_registered
            .get_mut(vcpu.0 as usize)
            .ok_or_else(|| Error::hypervisor("register_singlestep", format!("no {vcpu}")))?;
        *slot = true;
        Ok(())
    }

    fn listen(&self, _timeout: Duration, handler: &mut dyn EventHandler<Self>) -> Result<()> {
        if self.state.borrow_mut().take_fault("listen") {
            return Err(Error::hypervisor("listen", "injected fault"));
        }

        match self.next_event() {
            Some((event, trapped)) => {
                let response = handler.handle_event(self, &event);
                self.apply_response(&event, trapped, response);
            }
            None => {
                // Idle: everything scripted has drained.
                if let Some(flag) = &self.state.borrow().idle_flag {
                    flag.store(true, Ordering::SeqCst);
                }
            }
        }
        Ok(())
    }
}
