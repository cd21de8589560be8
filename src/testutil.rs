//! Test support: a scripted mock hypervisor and a fully wired runtime rig.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;
use std::time::Duration;

use crate::api::{
    Aarch64CpuState, Arch, CpuState, DebugFeature, Event, Hypervisor, LbrState, PagePerms,
    SlpTrapRequest, TaskSwitchKey, X86CpuState, PAGE_SIZE,
};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::event::EventManager;
use crate::plugins::{
    breakpoint, machine, singlestep, slp, taskswitch, BreakpointPlugin, RuntimeContext,
    SingleStepPlugin, SlpPlugin, TaskSwitchPlugin, VirtualMachine,
};
use crate::runtime::Runtime;
use crate::service::ServiceManager;

const MOCK_RAM_SIZE: usize = 4 * 1024 * 1024;

/// A feature toggle observed by the mock hypervisor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FeatureCall {
    Debug {
        cpu: Option<u32>,
        enable: bool,
        gpa: Option<u64>,
        single_step: bool,
    },
    Mtf {
        cpu: u32,
        enable: bool,
    },
    Lbr {
        cpu: Option<u32>,
        enable: bool,
    },
    Slp {
        enable: bool,
        req: SlpTrapRequest,
    },
    TaskSwitch {
        enable: bool,
        key: TaskSwitchKey,
    },
}

/// Scripted hypervisor: records every feature call and replays queued trap
/// batches, one batch per `wait_event`. Once the script is exhausted it
/// delivers a single `VmShutdown` so run loops terminate.
pub struct MockHypervisor {
    arch: Arch,
    ncpus: u32,
    batches: RefCell<VecDeque<Vec<Event>>>,
    pending: RefCell<VecDeque<Event>>,
    exhausted: Cell<bool>,
    features: RefCell<Vec<FeatureCall>>,
    slp_updates: RefCell<Vec<(u64, PagePerms)>>,
    fail_slp: Cell<bool>,
    debug_bps: RefCell<HashSet<u64>>,
    cpu_states: RefCell<HashMap<u32, CpuState>>,
    vtop_map: RefCell<HashMap<(u64, u64), u64>>,
    ram: RefCell<Vec<u8>>,
    lbr_reads: Cell<u32>,
    uninit_called: Cell<bool>,
}

impl MockHypervisor {
    pub fn new(arch: Arch, ncpus: u32) -> Rc<Self> {
        Rc::new(Self {
            arch,
            ncpus,
            batches: RefCell::new(VecDeque::new()),
            pending: RefCell::new(VecDeque::new()),
            exhausted: Cell::new(false),
            features: RefCell::new(Vec::new()),
            slp_updates: RefCell::new(Vec::new()),
            fail_slp: Cell::new(false),
            debug_bps: RefCell::new(HashSet::new()),
            cpu_states: RefCell::new(HashMap::new()),
            vtop_map: RefCell::new(HashMap::new()),
            ram: RefCell::new(vec![0; MOCK_RAM_SIZE]),
            lbr_reads: Cell::new(0),
            uninit_called: Cell::new(false),
        })
    }

    /// Queue one stop's worth of trap events.
    pub fn push_events(&self, events: Vec<Event>) {
        self.batches.borrow_mut().push_back(events);
    }

    pub fn feature_calls(&self) -> Vec<FeatureCall> {
        self.features.borrow().clone()
    }

    pub fn slp_updates(&self) -> Vec<(u64, PagePerms)> {
        self.slp_updates.borrow().clone()
    }

    pub fn fail_slp_updates(&self, fail: bool) {
        self.fail_slp.set(fail);
    }

    pub fn debug_bp_installed(&self, gpa: u64) -> bool {
        self.debug_bps.borrow().contains(&gpa)
    }

    pub fn lbr_reads(&self) -> u32 {
        self.lbr_reads.get()
    }

    pub fn uninit_called(&self) -> bool {
        self.uninit_called.get()
    }

    /// Map one guest virtual page to a physical frame in address space
    /// `dtb`.
    pub fn map_page(&self, gva_page: u64, dtb: u64, gpa_page: u64) {
        self.vtop_map
            .borrow_mut()
            .insert((gva_page & !(PAGE_SIZE - 1), dtb), gpa_page & !(PAGE_SIZE - 1));
    }

    pub fn write_phys(&self, gpa: u64, data: &[u8]) {
        let start = gpa as usize;
        self.ram.borrow_mut()[start..start + data.len()].copy_from_slice(data);
    }

    pub fn read_phys(&self, gpa: u64, size: usize) -> Vec<u8> {
        let start = gpa as usize;
        self.ram.borrow()[start..start + size].to_vec()
    }

    fn default_state(&self, cpu: u32) -> CpuState {
        match self.arch {
            Arch::X86_64 => CpuState::X86_64(X86CpuState {
                cpu,
                ..Default::default()
            }),
            Arch::Aarch64 => CpuState::Aarch64(Aarch64CpuState {
                cpu,
                ..Default::default()
            }),
        }
    }

    fn with_x86_state(&self, cpu: u32, update: impl FnOnce(&mut X86CpuState)) {
        let mut states = self.cpu_states.borrow_mut();
        let state = states.entry(cpu).or_insert_with(|| self.default_state(cpu));
        match state {
            CpuState::X86_64(state) => update(state),
            CpuState::Aarch64(_) => panic!("x86 register on an aarch64 mock"),
        }
    }

    pub fn set_rip(&self, cpu: u32, rip: u64) {
        self.with_x86_state(cpu, |state| state.rip = rip);
    }

    pub fn set_cr3(&self, cpu: u32, cr3: u64) {
        self.with_x86_state(cpu, |state| state.cr3 = cr3);
    }
}

impl Hypervisor for MockHypervisor {
    fn arch(&self) -> Arch {
        self.arch
    }

    fn init(&self) -> Result<()> {
        Ok(())
    }

    fn uninit(&self) {
        self.uninit_called.set(true);
    }

    fn wait_event(&self, _timeout: Duration) -> Result<()> {
        let batch = self.batches.borrow_mut().pop_front();
        match batch {
            Some(events) => self.pending.borrow_mut().extend(events),
            None if !self.exhausted.get() => {
                self.exhausted.set(true);
                self.pending.borrow_mut().push_back(Event::VmShutdown);
            }
            None => {}
        }
        Ok(())
    }

    fn pop_event(&self) -> Option<Event> {
        self.pending.borrow_mut().pop_front()
    }

    fn request_stop(&self) -> Result<()> {
        Ok(())
    }

    fn request_shutdown(&self) -> Result<()> {
        self.batches.borrow_mut().push_back(vec![Event::VmShutdown]);
        Ok(())
    }

    fn mouse_out(&self) -> Result<()> {
        Ok(())
    }

    fn ram_size(&self) -> u64 {
        self.ram.borrow().len() as u64
    }

    fn read_phys_mem(&self, gpa: u64, buf: &mut [u8]) -> Result<()> {
        let start = gpa as usize;
        let ram = self.ram.borrow();
        let end = start
            .checked_add(buf.len())
            .filter(|end| *end <= ram.len())
            .ok_or_else(|| Error::InvalidRequest(format!("physical read past ram at {gpa:#x}")))?;
        buf.copy_from_slice(&ram[start..end]);
        Ok(())
    }

    fn write_phys_mem(&self, gpa: u64, data: &[u8]) -> Result<()> {
        let start = gpa as usize;
        let mut ram = self.ram.borrow_mut();
        let end = start
            .checked_add(data.len())
            .filter(|end| *end <= ram.len())
            .ok_or_else(|| Error::InvalidRequest(format!("physical write past ram at {gpa:#x}")))?;
        ram[start..end].copy_from_slice(data);
        Ok(())
    }

    fn vtop(&self, gva: u64, dtb: u64) -> Result<u64> {
        let page = gva & !(PAGE_SIZE - 1);
        self.vtop_map
            .borrow()
            .get(&(page, dtb))
            .map(|gpa_page| gpa_page | (gva & (PAGE_SIZE - 1)))
            .ok_or(Error::Translation { gva, dtb })
    }

    fn num_cpus(&self) -> u32 {
        self.ncpus
    }

    fn cpu_state(&self, cpu: u32) -> Result<CpuState> {
        if cpu >= self.ncpus {
            return Err(Error::InvalidRequest(format!("no cpu {cpu}")));
        }
        Ok(self
            .cpu_states
            .borrow()
            .get(&cpu)
            .cloned()
            .unwrap_or_else(|| self.default_state(cpu)))
    }

    fn update_feature_debug(&self, req: DebugFeature) -> Result<()> {
        self.features.borrow_mut().push(FeatureCall::Debug {
            cpu: req.cpu,
            enable: req.enable,
            gpa: req.gpa,
            single_step: req.single_step,
        });
        if let Some(gpa) = req.gpa {
            if req.enable {
                self.debug_bps.borrow_mut().insert(gpa);
            } else {
                self.debug_bps.borrow_mut().remove(&gpa);
            }
        }
        Ok(())
    }

    fn update_feature_mtf(&self, cpu: u32, enable: bool) -> Result<()> {
        self.features
            .borrow_mut()
            .push(FeatureCall::Mtf { cpu, enable });
        Ok(())
    }

    fn update_feature_lbr(&self, cpu: Option<u32>, enable: bool, _flags: u64) -> Result<()> {
        self.features
            .borrow_mut()
            .push(FeatureCall::Lbr { cpu, enable });
        Ok(())
    }

    fn lbr_state(&self, _cpu: u32) -> Result<LbrState> {
        self.lbr_reads.set(self.lbr_reads.get() + 1);
        Ok(LbrState {
            tos: 0,
            from: vec![0x1000, 0x2000],
            to: vec![0x1004, 0x2004],
        })
    }

    fn update_feature_slp(&self, enable: bool, req: SlpTrapRequest) -> Result<()> {
        self.features
            .borrow_mut()
            .push(FeatureCall::Slp { enable, req });
        Ok(())
    }

    fn slp_update(&self, gpa: u64, perms: PagePerms) -> Result<()> {
        if self.fail_slp.get() {
            return Err(Error::Feature("slp update refused".to_string()));
        }
        self.slp_updates.borrow_mut().push((gpa, perms));
        Ok(())
    }

    fn update_feature_taskswitch(&self, enable: bool, key: TaskSwitchKey) -> Result<()> {
        self.features
            .borrow_mut()
            .push(FeatureCall::TaskSwitch { enable, key });
        Ok(())
    }
}

/// A bare construction context: services and event manager only, no
/// plugins. For tests that drive a single component.
pub fn test_context() -> RuntimeContext {
    let hv = MockHypervisor::new(Arch::X86_64, 1);
    let services = ServiceManager::new();
    let em = EventManager::new(hv.clone());
    let em_service: Rc<dyn std::any::Any> = em;
    services.register("EventManager", em_service).unwrap();
    RuntimeContext {
        arch: Arch::X86_64,
        hypervisor: hv,
        services,
        config: Rc::new(Config::default()),
    }
}

/// A fully wired runtime over the mock hypervisor, with accessors for the
/// core plugins.
pub struct TestRig {
    pub hv: Rc<MockHypervisor>,
    rt: Runtime,
}

impl TestRig {
    pub fn x86(ncpus: u32) -> Self {
        Self::new(Arch::X86_64, ncpus)
    }

    pub fn aarch64(ncpus: u32) -> Self {
        Self::new(Arch::Aarch64, ncpus)
    }

    fn new(arch: Arch, ncpus: u32) -> Self {
        let hv = MockHypervisor::new(arch, ncpus);
        let rt = Runtime::builder(hv.clone())
            .with_logging(false)
            .with_config(Config::default())
            .build()
            .unwrap();
        Self { hv, rt }
    }

    pub fn services(&self) -> Rc<ServiceManager> {
        self.rt.services()
    }

    pub fn em(&self) -> Rc<EventManager> {
        self.rt.event_manager()
    }

    pub fn vm(&self) -> Rc<VirtualMachine> {
        self.services().get_as(machine::NAME).unwrap()
    }

    pub fn slp(&self) -> Rc<SlpPlugin> {
        self.services().get_as(slp::NAME).unwrap()
    }

    pub fn singlestep(&self) -> Rc<SingleStepPlugin> {
        self.services().get_as(singlestep::NAME).unwrap()
    }

    pub fn breakpoint(&self) -> Rc<BreakpointPlugin> {
        self.services().get_as(breakpoint::NAME).unwrap()
    }

    #[allow(dead_code)]
    pub fn taskswitch(&self) -> Rc<TaskSwitchPlugin> {
        self.services().get_as(taskswitch::NAME).unwrap()
    }

    pub fn dispatch(&self, event: Event) {
        self.em().dispatch(&event);
    }
}
