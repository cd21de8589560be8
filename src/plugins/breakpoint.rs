//! Stealth breakpoint engine
//!
//! A breakpoint lives at a guest physical address and must stay invisible
//! to the guest. While armed, the hypervisor debug trap is installed and
//! the page is executable only, so any guest read or write faults first.
//! On such a fault the trap is pulled and the page flips to read/write
//! only; the next execution faults and re-arms it. Stepping over a hit is
//! delegated to the single-step coordinator, after which the cooked
//! breakpoint event is synthesized for subscribers.
//!
//! Protocol states per page, driven by the two SLP subscriptions:
//!
//! ```text
//! Armed  (trap set,   X-only, rw subscription)  --read/write-->  Hidden
//! Hidden (trap unset, RW-only, x subscription)  --execute----->  Armed
//! ```

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use crate::api::{
    gfn, DebugFeature, Event, EventFilter, EventKind, Hypervisor, PagePerms, SlpFilter,
};
use crate::error::{Error, Result};
use crate::event::{EventManager, EventProducer, RequestId, Subscription};
use crate::plugins::{
    machine::VirtualMachine, singlestep::SingleStepPlugin, slp::SlpPlugin, Plugin, RuntimeContext,
};
use crate::service::ServiceManager;

pub const NAME: &str = "BreakpointPlugin";

/// One stealth breakpoint. Requests for the same gpa share a record.
struct BreakpointRecord {
    gpa: u64,
    refs: Cell<usize>,
    /// Whether the hypervisor debug trap is currently installed.
    is_set: Cell<bool>,
    rw_sub: Rc<Subscription>,
    x_sub: Rc<Subscription>,
}

pub struct BreakpointPlugin {
    hv: Rc<dyn Hypervisor>,
    services: Rc<ServiceManager>,
    em: Rc<EventManager>,
    vm: Rc<VirtualMachine>,
    ss: Rc<SingleStepPlugin>,
    slp: Rc<SlpPlugin>,
    next_request: Cell<RequestId>,
    requests: RefCell<HashMap<RequestId, u64>>,
    records: RefCell<HashMap<u64, Rc<BreakpointRecord>>>,
    trap_sub: RefCell<Option<Rc<Subscription>>>,
    step_subs: RefCell<Vec<Rc<Subscription>>>,
    // Needed to build the per-record fault callbacks after construction.
    weak_self: RefCell<Weak<BreakpointPlugin>>,
}

impl BreakpointPlugin {
    pub fn load(ctx: &RuntimeContext) -> Result<Option<Rc<dyn Plugin>>> {
        let em = ctx.event_manager()?;
        let vm: Rc<VirtualMachine> = ctx.vm()?;
        let ss: Rc<SingleStepPlugin> = ctx.services.get_as(crate::plugins::singlestep::NAME)?;
        let slp: Rc<SlpPlugin> = ctx.services.get_as(crate::plugins::slp::NAME)?;
        let cpu_count = vm.cpu_count() as usize;

        let plugin = Rc::new(Self {
            hv: Rc::clone(&ctx.hypervisor),
            services: Rc::clone(&ctx.services),
            em: Rc::clone(&em),
            vm,
            ss,
            slp,
            next_request: Cell::new(0),
            requests: RefCell::new(HashMap::new()),
            records: RefCell::new(HashMap::new()),
            trap_sub: RefCell::new(None),
            step_subs: RefCell::new(Vec::new()),
            weak_self: RefCell::new(Weak::new()),
        });
        *plugin.weak_self.borrow_mut() = Rc::downgrade(&plugin);

        let trap_plugin = Rc::clone(&plugin);
        let trap_sub = Subscription::new(
            EventFilter::DebugBreakpoint { gpa: None },
            move |event| trap_plugin.on_debug_trap(event),
        );
        em.request_event(&trap_sub, false)?;
        *plugin.trap_sub.borrow_mut() = Some(trap_sub);

        let mut step_subs = Vec::with_capacity(cpu_count);
        for cpu in 0..cpu_count as u32 {
            let step_plugin = Rc::clone(&plugin);
            step_subs.push(Subscription::new(
                EventFilter::SingleStep {
                    cpu: Some(cpu),
                    method: None,
                },
                move |_| step_plugin.on_step(cpu),
            ));
        }
        *plugin.step_subs.borrow_mut() = step_subs;

        em.register_producer(NAME, plugin.clone(), &[EventKind::Breakpoint])?;
        let service: Rc<dyn std::any::Any> = Rc::clone(&plugin) as Rc<dyn std::any::Any>;
        ctx.services.register(NAME, service)?;
        Ok(Some(plugin))
    }

    fn record(&self, gpa: u64) -> Option<Rc<BreakpointRecord>> {
        self.records.borrow().get(&gpa).cloned()
    }

    fn install_trap(&self, record: &BreakpointRecord) -> Result<()> {
        self.hv
            .update_feature_debug(DebugFeature::breakpoint(record.gpa, true))?;
        record.is_set.set(true);
        tracing::debug!("breakpoint set on {:#x}", record.gpa);
        Ok(())
    }

    fn remove_trap(&self, record: &BreakpointRecord) -> Result<()> {
        self.hv
            .update_feature_debug(DebugFeature::breakpoint(record.gpa, false))?;
        record.is_set.set(false);
        tracing::debug!("breakpoint removed on {:#x}", record.gpa);
        Ok(())
    }

    fn create_record(&self, gpa: u64) -> Rc<BreakpointRecord> {
        let frame = gfn(gpa);
        let rw_plugin = self.weak_self.borrow().clone();
        let rw_sub = Subscription::new(
            EventFilter::SlpViolation(SlpFilter::page(frame, PagePerms::R | PagePerms::W)),
            move |_| match rw_plugin.upgrade() {
                Some(plugin) => plugin.on_rw_fault(gpa),
                None => Ok(()),
            },
        );
        let x_plugin = self.weak_self.borrow().clone();
        let x_sub = Subscription::new(
            EventFilter::SlpViolation(SlpFilter::page(frame, PagePerms::X)),
            move |_| match x_plugin.upgrade() {
                Some(plugin) => plugin.on_x_fault(gpa),
                None => Ok(()),
            },
        );
        Rc::new(BreakpointRecord {
            gpa,
            refs: Cell::new(1),
            is_set: Cell::new(false),
            rw_sub,
            x_sub,
        })
    }

    fn arm(&self, record: &BreakpointRecord) -> Result<()> {
        // A failed permission update is survivable: pages that are new to
        // the hypervisor default to X-only once the read/write trap below
        // is installed.
        if let Err(error) = self.slp.update_permissions(record.gpa, PagePerms::X) {
            tracing::warn!("slp permission update failed: {}", error);
        }
        self.em.request_event(&record.rw_sub, true)?;
        self.install_trap(record)
    }

    fn teardown(&self, record: &BreakpointRecord) -> Result<()> {
        if record.is_set.get() {
            self.remove_trap(record)?;
            self.em.cancel_event(&record.rw_sub)
        } else {
            self.em.cancel_event(&record.x_sub)
        }
    }

    /// Armed to Hidden: the guest is about to look at the page.
    fn on_rw_fault(&self, gpa: u64) -> Result<()> {
        let Some(record) = self.record(gpa) else {
            tracing::warn!("rw fault for unknown breakpoint at {:#x}", gpa);
            return Ok(());
        };
        tracing::debug!("hiding breakpoint at {:#x}", gpa);
        self.remove_trap(&record)?;
        self.slp
            .update_permissions(gpa, PagePerms::R | PagePerms::W)?;
        self.em.cancel_event(&record.rw_sub)?;
        self.em.request_event(&record.x_sub, true)?;
        Ok(())
    }

    /// Hidden to Armed: the guest is about to execute the page.
    fn on_x_fault(&self, gpa: u64) -> Result<()> {
        let Some(record) = self.record(gpa) else {
            tracing::warn!("x fault for unknown breakpoint at {:#x}", gpa);
            return Ok(());
        };
        tracing::debug!("re-arming breakpoint at {:#x}", gpa);
        self.em.cancel_event(&record.x_sub)?;
        self.em.request_event(&record.rw_sub, true)?;
        self.slp.update_permissions(gpa, PagePerms::X)?;
        self.install_trap(&record)
    }

    /// A debug trap fired: step over the breakpoint instruction. The trap
    /// is suppressed by the hypervisor while the step is armed.
    fn on_debug_trap(&self, event: &Event) -> Result<()> {
        let Event::DebugBreakpoint { cpu, .. } = *event else {
            return Ok(());
        };
        let sub = Rc::clone(&self.step_subs.borrow()[cpu as usize]);
        if sub.is_active() {
            return Ok(());
        }
        self.em.request_event(&sub, true)
    }

    /// The step-over landed: emit the cooked event for subscribers.
    fn on_step(&self, cpu: u32) -> Result<()> {
        let sub = Rc::clone(&self.step_subs.borrow()[cpu as usize]);
        self.em.cancel_event(&sub)?;

        let Some(gva) = self.ss.last_ss_gva(cpu) else {
            tracing::warn!("step-over on cpu {} without a recorded gva", cpu);
            return Ok(());
        };
        let gpa = self.vm.vtop(gva, None, Some(cpu))?;
        if self.records.borrow().contains_key(&gpa) {
            self.em.put_event(Event::Breakpoint { cpu, gva, gpa });
        } else {
            // Another CPU may have queued a step between the trap and its
            // handler; nothing of ours lives at this address.
            tracing::debug!(
                "step-over on cpu {} at {:#x} does not match a breakpoint",
                cpu,
                gpa
            );
        }
        Ok(())
    }
}

impl EventProducer for BreakpointPlugin {
    fn request_event(&self, filter: &EventFilter) -> Result<RequestId> {
        let EventFilter::Breakpoint { gpa } = *filter else {
            return Err(Error::InvalidRequest(
                "expected breakpoint parameters".to_string(),
            ));
        };
        let gpa = gpa.ok_or_else(|| {
            Error::InvalidRequest("breakpoint request requires a gpa".to_string())
        })?;

        match self.record(gpa) {
            Some(record) => record.refs.set(record.refs.get() + 1),
            None => {
                let record = self.create_record(gpa);
                self.arm(&record)?;
                self.records.borrow_mut().insert(gpa, record);
            }
        }

        let id = self.next_request.get();
        self.next_request.set(id + 1);
        self.requests.borrow_mut().insert(id, gpa);
        Ok(id)
    }

    fn cancel_event(&self, id: RequestId) -> Result<()> {
        let gpa = self
            .requests
            .borrow_mut()
            .remove(&id)
            .ok_or_else(|| Error::NotFound(format!("breakpoint request {id}")))?;
        let Some(record) = self.record(gpa) else {
            return Err(Error::NotFound(format!("breakpoint at {gpa:#x}")));
        };
        record.refs.set(record.refs.get() - 1);
        if record.refs.get() == 0 {
            self.records.borrow_mut().remove(&gpa);
            self.teardown(&record)?;
        }
        Ok(())
    }
}

impl Plugin for BreakpointPlugin {
    fn name(&self) -> &str {
        NAME
    }

    fn uninit(&self) -> Result<()> {
        let records: Vec<Rc<BreakpointRecord>> =
            self.records.borrow_mut().drain().map(|(_, r)| r).collect();
        for record in records {
            if let Err(error) = self.teardown(&record) {
                tracing::warn!(
                    "failed to tear down breakpoint at {:#x}: {}",
                    record.gpa,
                    error
                );
            }
        }
        self.requests.borrow_mut().clear();
        if let Some(sub) = self.trap_sub.borrow_mut().take() {
            self.em.cancel_event(&sub)?;
        }
        for sub in self.step_subs.borrow().iter() {
            if sub.is_active() {
                self.em.cancel_event(sub)?;
            }
        }
        self.em.unregister_producer(&[EventKind::Breakpoint]);
        self.services.unregister_by_name(NAME)?;
        Ok(())
    }
}
