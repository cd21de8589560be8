//! Single-step coordinator
//!
//! Arms the per-CPU single-step trap on behalf of subscribers and keeps
//! track of the method in use. Only one method may be armed on a CPU at a
//! time. Steps are single shot: the coordinator disarms the hypervisor
//! feature and clears the armed method as soon as the step event fires,
//! which is why `cancel_event` has nothing to do.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::api::{Arch, DebugFeature, Event, EventFilter, EventKind, Hypervisor, SingleStepMethod};
use crate::error::{Error, Result};
use crate::event::{EventManager, EventProducer, RequestId, Subscription};
use crate::plugins::{machine::VirtualMachine, Plugin, RuntimeContext};
use crate::service::ServiceManager;

pub const NAME: &str = "SingleStepPlugin";

pub struct SingleStepPlugin {
    hv: Rc<dyn Hypervisor>,
    services: Rc<ServiceManager>,
    em: Rc<EventManager>,
    vm: Rc<VirtualMachine>,
    arch: Arch,
    default_method: SingleStepMethod,
    armed: RefCell<Vec<Option<SingleStepMethod>>>,
    last_ip: RefCell<Vec<Option<u64>>>,
    next_request: Cell<RequestId>,
    step_sub: RefCell<Option<Rc<Subscription>>>,
}

impl SingleStepPlugin {
    pub fn load(ctx: &RuntimeContext) -> Result<Option<Rc<dyn Plugin>>> {
        let em = ctx.event_manager()?;
        let vm = ctx.vm()?;
        let cpu_count = vm.cpu_count() as usize;
        let default_method = match ctx.arch {
            Arch::X86_64 => SingleStepMethod::Mtf,
            Arch::Aarch64 => SingleStepMethod::Debug,
        };

        let plugin = Rc::new(Self {
            hv: Rc::clone(&ctx.hypervisor),
            services: Rc::clone(&ctx.services),
            em: Rc::clone(&em),
            vm,
            arch: ctx.arch,
            default_method,
            armed: RefCell::new(vec![None; cpu_count]),
            last_ip: RefCell::new(vec![None; cpu_count]),
            next_request: Cell::new(0),
            step_sub: RefCell::new(None),
        });

        let step_plugin = Rc::clone(&plugin);
        let step_sub = Subscription::new(
            EventFilter::SingleStep {
                cpu: None,
                method: None,
            },
            move |event| step_plugin.on_step(event),
        );
        em.request_event(&step_sub, false)?;
        *plugin.step_sub.borrow_mut() = Some(step_sub);

        em.register_producer(NAME, plugin.clone(), &[EventKind::SingleStep])?;
        let service: Rc<dyn std::any::Any> = Rc::clone(&plugin) as Rc<dyn std::any::Any>;
        ctx.services.register(NAME, service)?;
        Ok(Some(plugin))
    }

    /// The instruction pointer captured when the step on `cpu` was armed.
    pub fn last_ss_gva(&self, cpu: u32) -> Option<u64> {
        self.last_ip
            .borrow()
            .get(cpu as usize)
            .copied()
            .flatten()
    }

    fn update_feature(&self, enable: bool, method: SingleStepMethod, cpu: u32) -> Result<()> {
        match method {
            SingleStepMethod::Debug => self
                .hv
                .update_feature_debug(DebugFeature::single_step(cpu, enable)),
            SingleStepMethod::Mtf => {
                if self.arch != Arch::X86_64 {
                    return Err(Error::InvalidRequest(
                        "MTF single stepping is only available on x86-64".to_string(),
                    ));
                }
                self.hv.update_feature_mtf(cpu, enable)
            }
        }
    }

    fn on_step(&self, event: &Event) -> Result<()> {
        let Event::SingleStep { cpu, .. } = *event else {
            return Ok(());
        };
        let armed = self.armed.borrow().get(cpu as usize).copied().flatten();
        let Some(method) = armed else {
            tracing::warn!("unrequested single step received on cpu {}", cpu);
            return Ok(());
        };
        self.update_feature(false, method, cpu)?;
        self.armed.borrow_mut()[cpu as usize] = None;
        tracing::debug!(
            "single step on cpu {} at {:#x}",
            cpu,
            self.vm.cpu(cpu)?.instruction_pointer()
        );
        Ok(())
    }
}

impl EventProducer for SingleStepPlugin {
    fn request_event(&self, filter: &EventFilter) -> Result<RequestId> {
        let EventFilter::SingleStep { cpu, method } = *filter else {
            return Err(Error::InvalidRequest(
                "expected single step parameters".to_string(),
            ));
        };
        let cpu = cpu.ok_or_else(|| {
            Error::InvalidRequest("single step request requires a cpu".to_string())
        })?;
        if cpu >= self.vm.cpu_count() {
            return Err(Error::InvalidRequest(format!("no cpu {cpu}")));
        }
        let method = method.unwrap_or(self.default_method);

        if let Some(armed) = self.armed.borrow()[cpu as usize] {
            if armed != method {
                return Err(Error::MethodConflict { cpu, armed });
            }
        }

        self.update_feature(true, method, cpu)?;
        self.armed.borrow_mut()[cpu as usize] = Some(method);
        self.last_ip.borrow_mut()[cpu as usize] =
            Some(self.vm.cpu(cpu)?.instruction_pointer());

        let id = self.next_request.get();
        self.next_request.set(id + 1);
        Ok(id)
    }

    // Steps are single shot and disarm themselves when they fire.
    fn cancel_event(&self, _id: RequestId) -> Result<()> {
        Ok(())
    }
}

impl Plugin for SingleStepPlugin {
    fn name(&self) -> &str {
        NAME
    }

    fn uninit(&self) -> Result<()> {
        if let Some(sub) = self.step_sub.borrow_mut().take() {
            self.em.cancel_event(&sub)?;
        }
        self.em.unregister_producer(&[EventKind::SingleStep]);
        self.services.unregister_by_name(NAME)?;
        Ok(())
    }
}
