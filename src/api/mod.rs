//! Guest-observable events and the hypervisor trap surface
//!
//! Everything the runtime consumes from the hypervisor passes through the
//! [`Hypervisor`] trait: trap delivery, guest memory access and the feature
//! toggles (debug traps, second-level paging permissions, monitor trap flag,
//! LBR, task-switch trapping). Events are a tagged sum type; each kind
//! carries its own filter parameters with unset-is-wildcard semantics.

use std::time::Duration;

use serde::Serialize;

use crate::error::Result;

pub mod aarch64;
pub mod x86_64;

pub use aarch64::{Aarch64CpuState, TsReg};
pub use x86_64::{LbrState, X86CpuState};

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Guest frame number of a physical address.
pub fn gfn(gpa: u64) -> u64 {
    gpa >> PAGE_SHIFT
}

/// Guest CPU architectures supported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Arch {
    X86_64,
    Aarch64,
}

/// Guest operating system families, reported by the OS facade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OsType {
    Windows,
    Linux,
}

/// How a CPU is single-stepped.
///
/// `Debug` uses the architectural debug trap and works everywhere. `Mtf`
/// uses the monitor trap flag and exists only on x86-64.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SingleStepMethod {
    Debug,
    Mtf,
}

bitflags::bitflags! {
    /// Guest page access permissions as enforced by second-level paging.
    pub struct PagePerms: u8 {
        const R = 0b001;
        const W = 0b010;
        const X = 0b100;
    }
}

impl PagePerms {
    pub fn from_rwx(r: bool, w: bool, x: bool) -> Self {
        let mut perms = PagePerms::empty();
        perms.set(PagePerms::R, r);
        perms.set(PagePerms::W, w);
        perms.set(PagePerms::X, x);
        perms
    }

    /// True when the set contains both `W` and `X`.
    pub fn violates_wx(self) -> bool {
        self.contains(PagePerms::W | PagePerms::X)
    }
}

/// Discriminant for an event kind. Used to key producer registrations and
/// subscription buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    VmReady,
    VmStop,
    VmShutdown,
    DebugBreakpoint,
    Breakpoint,
    SingleStep,
    SlpViolation,
    TaskSwitch,
}

/// An event observed in the guest.
///
/// `DebugBreakpoint` is the raw debug trap as delivered by the hypervisor.
/// `Breakpoint` is the cooked kind synthesized by the breakpoint engine
/// after the trapped instruction has been stepped over; subscribers almost
/// always want the cooked kind.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum Event {
    /// The VM is ready to run. Last chance to set up callbacks before the
    /// guest starts executing.
    VmReady,
    /// The VM was paused.
    VmStop,
    /// The VM finished execution and is about to be destroyed.
    VmShutdown,
    /// A hardware debug breakpoint fired in the guest.
    DebugBreakpoint { cpu: u32, gva: u64, gpa: u64 },
    /// A stealth breakpoint was hit and stepped over.
    Breakpoint { cpu: u32, gva: u64, gpa: u64 },
    /// A single step completed.
    SingleStep { cpu: u32, method: SingleStepMethod },
    /// A second-level paging permission violation.
    ///
    /// `rwx` marks a fault that cannot be satisfied by any W^X-clean
    /// permission set; the SLP coordinator resolves it with a single step.
    SlpViolation {
        cpu: u32,
        gva: Option<u64>,
        gpa: u64,
        r: bool,
        w: bool,
        x: bool,
        rwx: bool,
    },
    /// The guest switched address spaces.
    TaskSwitch(TaskSwitch),
}

/// Architecture-specific task switch payload.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "arch")]
pub enum TaskSwitch {
    X86_64 {
        cpu: u32,
        incoming_dtb: u64,
        outgoing_dtb: u64,
    },
    Aarch64 {
        cpu: u32,
        reg: TsReg,
        old_value: u64,
        new_value: u64,
    },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::VmReady => EventKind::VmReady,
            Event::VmStop => EventKind::VmStop,
            Event::VmShutdown => EventKind::VmShutdown,
            Event::DebugBreakpoint { .. } => EventKind::DebugBreakpoint,
            Event::Breakpoint { .. } => EventKind::Breakpoint,
            Event::SingleStep { .. } => EventKind::SingleStep,
            Event::SlpViolation { .. } => EventKind::SlpViolation,
            Event::TaskSwitch(_) => EventKind::TaskSwitch,
        }
    }

    /// The CPU the event originated on, for kinds that have one.
    pub fn cpu(&self) -> Option<u32> {
        match self {
            Event::DebugBreakpoint { cpu, .. }
            | Event::Breakpoint { cpu, .. }
            | Event::SingleStep { cpu, .. }
            | Event::SlpViolation { cpu, .. } => Some(*cpu),
            Event::TaskSwitch(TaskSwitch::X86_64 { cpu, .. })
            | Event::TaskSwitch(TaskSwitch::Aarch64 { cpu, .. }) => Some(*cpu),
            _ => None,
        }
    }
}

/// Filter parameters for an SLP violation subscription.
///
/// A subscription either traps globally (`global`) or on a page range
/// (`gfn` + `num_pages`). In both cases only the access kinds listed in
/// `trap` match. A filter that is neither global nor carries a range
/// matches nothing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlpFilter {
    pub cpu: Option<u32>,
    pub global: bool,
    pub gfn: Option<u64>,
    pub num_pages: Option<u64>,
    pub trap: PagePerms,
}

impl SlpFilter {
    /// Global subscription over every access kind.
    pub fn global_all() -> Self {
        Self {
            cpu: None,
            global: true,
            gfn: None,
            num_pages: None,
            trap: PagePerms::all(),
        }
    }

    /// Subscription over a single page.
    pub fn page(gfn: u64, trap: PagePerms) -> Self {
        Self {
            cpu: None,
            global: false,
            gfn: Some(gfn),
            num_pages: Some(1),
            trap,
        }
    }

    fn matches(&self, gpa: u64, r: bool, w: bool, x: bool) -> bool {
        let trapped = (r && self.trap.contains(PagePerms::R))
            || (w && self.trap.contains(PagePerms::W))
            || (x && self.trap.contains(PagePerms::X));
        if self.global {
            return trapped;
        }
        match (self.gfn, self.num_pages) {
            (Some(gfn), Some(num_pages)) if num_pages > 0 => {
                let min = gfn << PAGE_SHIFT;
                let max = ((gfn + (num_pages - 1)) << PAGE_SHIFT) | (PAGE_SIZE - 1);
                gpa >= min && gpa <= max && trapped
            }
            _ => false,
        }
    }
}

/// Filter parameters for a task switch subscription.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TaskSwitchFilter {
    /// Match switches into (`incoming`) and/or out of (`outgoing`) the
    /// address space identified by `dtb`. No `dtb` matches every switch.
    X86_64 {
        dtb: Option<u64>,
        incoming: bool,
        outgoing: bool,
    },
    /// Match writes to one of the translation control registers.
    Aarch64 { cpu: Option<u32>, reg: TsReg },
}

impl TaskSwitchFilter {
    fn matches(&self, event: &TaskSwitch) -> bool {
        match (self, event) {
            (
                TaskSwitchFilter::X86_64 {
                    dtb,
                    incoming,
                    outgoing,
                },
                TaskSwitch::X86_64 {
                    incoming_dtb,
                    outgoing_dtb,
                    ..
                },
            ) => match dtb {
                None => true,
                Some(dtb) => {
                    (*incoming && dtb == incoming_dtb) || (*outgoing && dtb == outgoing_dtb)
                }
            },
            (
                TaskSwitchFilter::Aarch64 { cpu, reg },
                TaskSwitch::Aarch64 {
                    cpu: ev_cpu,
                    reg: ev_reg,
                    ..
                },
            ) => reg == ev_reg && cpu.map_or(true, |cpu| cpu == *ev_cpu),
            _ => false,
        }
    }
}

/// Per-subscription event filter. `Any` is the wildcard and matches every
/// dispatched event; the remaining variants match their kind plus the
/// kind-specific parameters, where an unset parameter is a wildcard.
#[derive(Debug, Clone, PartialEq)]
pub enum EventFilter {
    Any,
    VmReady,
    VmStop,
    VmShutdown,
    DebugBreakpoint { gpa: Option<u64> },
    Breakpoint { gpa: Option<u64> },
    SingleStep {
        cpu: Option<u32>,
        method: Option<SingleStepMethod>,
    },
    SlpViolation(SlpFilter),
    TaskSwitch(TaskSwitchFilter),
}

impl EventFilter {
    /// The kind this filter subscribes to. `None` for the wildcard.
    pub fn kind(&self) -> Option<EventKind> {
        match self {
            EventFilter::Any => None,
            EventFilter::VmReady => Some(EventKind::VmReady),
            EventFilter::VmStop => Some(EventKind::VmStop),
            EventFilter::VmShutdown => Some(EventKind::VmShutdown),
            EventFilter::DebugBreakpoint { .. } => Some(EventKind::DebugBreakpoint),
            EventFilter::Breakpoint { .. } => Some(EventKind::Breakpoint),
            EventFilter::SingleStep { .. } => Some(EventKind::SingleStep),
            EventFilter::SlpViolation(_) => Some(EventKind::SlpViolation),
            EventFilter::TaskSwitch(_) => Some(EventKind::TaskSwitch),
        }
    }

    pub fn matches(&self, event: &Event) -> bool {
        match (self, event) {
            (EventFilter::Any, _) => true,
            (EventFilter::VmReady, Event::VmReady) => true,
            (EventFilter::VmStop, Event::VmStop) => true,
            (EventFilter::VmShutdown, Event::VmShutdown) => true,
            (EventFilter::DebugBreakpoint { gpa }, Event::DebugBreakpoint { gpa: ev_gpa, .. })
            | (EventFilter::Breakpoint { gpa }, Event::Breakpoint { gpa: ev_gpa, .. }) => {
                gpa.map_or(true, |gpa| gpa == *ev_gpa)
            }
            (
                EventFilter::SingleStep { cpu, method },
                Event::SingleStep {
                    cpu: ev_cpu,
                    method: ev_method,
                },
            ) => {
                cpu.map_or(true, |cpu| cpu == *ev_cpu)
                    && method.map_or(true, |method| method == *ev_method)
            }
            (
                EventFilter::SlpViolation(filter),
                Event::SlpViolation { gpa, r, w, x, .. },
            ) => filter.matches(*gpa, *r, *w, *x),
            (EventFilter::TaskSwitch(filter), Event::TaskSwitch(switch)) => {
                filter.matches(switch)
            }
            _ => false,
        }
    }
}

/// Per-CPU register snapshot, taken while the VM is paused.
#[derive(Debug, Clone)]
pub enum CpuState {
    X86_64(X86CpuState),
    Aarch64(Aarch64CpuState),
}

impl CpuState {
    pub fn instruction_pointer(&self) -> u64 {
        match self {
            CpuState::X86_64(state) => state.rip,
            CpuState::Aarch64(state) => state.pc,
        }
    }

    /// Page table base used to translate `va` on this CPU.
    pub fn page_table_base(&self, va: u64) -> u64 {
        match self {
            CpuState::X86_64(state) => state.page_table_base(),
            CpuState::Aarch64(state) => state.page_table_base(va),
        }
    }

    /// Pointer width in bytes for the current execution mode.
    pub fn pointer_width(&self) -> usize {
        match self {
            CpuState::X86_64(state) => state.pointer_width(),
            CpuState::Aarch64(_) => 8,
        }
    }

    pub fn paging_enabled(&self) -> bool {
        match self {
            CpuState::X86_64(state) => state.paging_enabled(),
            CpuState::Aarch64(state) => state.paging_enabled(),
        }
    }
}

/// Parameters for a debug trap feature update. `gpa` installs or removes a
/// breakpoint at that address; `single_step` arms the architectural
/// single-step trap instead.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DebugFeature {
    pub cpu: Option<u32>,
    pub enable: bool,
    pub gpa: Option<u64>,
    pub single_step: bool,
}

impl DebugFeature {
    pub fn breakpoint(gpa: u64, enable: bool) -> Self {
        Self {
            cpu: None,
            enable,
            gpa: Some(gpa),
            single_step: false,
        }
    }

    pub fn single_step(cpu: u32, enable: bool) -> Self {
        Self {
            cpu: Some(cpu),
            enable,
            gpa: None,
            single_step: true,
        }
    }
}

/// Parameters for an SLP violation trap request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlpTrapRequest {
    pub cpu: Option<u32>,
    pub global: bool,
    pub gfn: Option<u64>,
    pub num_pages: Option<u64>,
    pub trap: PagePerms,
}

impl From<SlpFilter> for SlpTrapRequest {
    fn from(filter: SlpFilter) -> Self {
        Self {
            cpu: filter.cpu,
            global: filter.global,
            gfn: filter.gfn,
            num_pages: filter.num_pages,
            trap: filter.trap,
        }
    }
}

/// Key identifying a task switch trap facet.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TaskSwitchKey {
    X86_64 {
        dtb: Option<u64>,
        incoming: bool,
        outgoing: bool,
    },
    Aarch64 { reg: TsReg },
}

/// The trap surface the runtime consumes from the embedding hypervisor.
///
/// All methods take `&self`; implementations are expected to use interior
/// mutability. The runtime is single threaded and never calls the trait
/// from more than one thread.
pub trait Hypervisor {
    fn arch(&self) -> Arch;

    fn init(&self) -> Result<()>;
    fn uninit(&self);

    /// Block until a trap is pending or the timeout elapses.
    fn wait_event(&self, timeout: Duration) -> Result<()>;
    /// Pop one pending trap, if any.
    fn pop_event(&self) -> Option<Event>;

    fn request_stop(&self) -> Result<()>;
    fn request_shutdown(&self) -> Result<()>;
    fn mouse_out(&self) -> Result<()>;

    fn ram_size(&self) -> u64;
    fn read_phys_mem(&self, gpa: u64, buf: &mut [u8]) -> Result<()>;
    fn write_phys_mem(&self, gpa: u64, data: &[u8]) -> Result<()>;
    /// Translate a guest virtual address in the address space rooted at
    /// `dtb`.
    fn vtop(&self, gva: u64, dtb: u64) -> Result<u64>;

    fn num_cpus(&self) -> u32;
    fn cpu_state(&self, cpu: u32) -> Result<CpuState>;

    fn update_feature_debug(&self, req: DebugFeature) -> Result<()>;
    fn update_feature_mtf(&self, cpu: u32, enable: bool) -> Result<()>;
    fn update_feature_lbr(&self, cpu: Option<u32>, enable: bool, flags: u64) -> Result<()>;
    fn lbr_state(&self, cpu: u32) -> Result<LbrState>;
    fn update_feature_slp(&self, enable: bool, req: SlpTrapRequest) -> Result<()>;
    /// Set the permissions of the page containing `gpa`.
    fn slp_update(&self, gpa: u64, perms: PagePerms) -> Result<()>;
    fn update_feature_taskswitch(&self, enable: bool, key: TaskSwitchKey) -> Result<()>;
}
