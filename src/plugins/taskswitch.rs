//! Task switch feature coordinator
//!
//! Trapping task switches is a single global hypervisor feature, so the
//! coordinator merges subscriber interest before toggling it. On x86-64
//! interest is keyed by dtb with separate incoming/outgoing facets; on
//! aarch64 it is keyed by the written translation register. A request only
//! reaches the hypervisor when it adds a facet no other request covers,
//! and a cancellation narrows the trap to what is still requested.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use crate::api::{Arch, EventFilter, EventKind, Hypervisor, TaskSwitchFilter, TaskSwitchKey};
use crate::error::{Error, Result};
use crate::event::{EventManager, EventProducer, RequestId};
use crate::plugins::{Plugin, RuntimeContext};
use crate::service::ServiceManager;

pub const NAME: &str = "TaskSwitchPlugin";

pub struct TaskSwitchPlugin {
    hv: Rc<dyn Hypervisor>,
    services: Rc<ServiceManager>,
    em: Rc<EventManager>,
    arch: Arch,
    next_request: Cell<RequestId>,
    requests: RefCell<HashMap<RequestId, TaskSwitchFilter>>,
}

impl TaskSwitchPlugin {
    pub fn load(ctx: &RuntimeContext) -> Result<Option<Rc<dyn Plugin>>> {
        let em = ctx.event_manager()?;
        let plugin = Rc::new(Self {
            hv: Rc::clone(&ctx.hypervisor),
            services: Rc::clone(&ctx.services),
            em: Rc::clone(&em),
            arch: ctx.arch,
            next_request: Cell::new(0),
            requests: RefCell::new(HashMap::new()),
        });
        em.register_producer(NAME, plugin.clone(), &[EventKind::TaskSwitch])?;
        let service: Rc<dyn std::any::Any> = Rc::clone(&plugin) as Rc<dyn std::any::Any>;
        ctx.services.register(NAME, service)?;
        Ok(Some(plugin))
    }

    fn update_feature(&self, request: &TaskSwitchFilter, enable: bool) -> Result<()> {
        match *request {
            TaskSwitchFilter::X86_64 {
                dtb,
                incoming,
                outgoing,
            } => self.update_feature_x86(dtb, incoming, outgoing, enable),
            TaskSwitchFilter::Aarch64 { reg, .. } => {
                let covered = self.requests.borrow().values().any(|other| {
                    matches!(other, TaskSwitchFilter::Aarch64 { reg: other_reg, .. }
                        if *other_reg == reg)
                });
                if !covered {
                    self.hv
                        .update_feature_taskswitch(enable, TaskSwitchKey::Aarch64 { reg })?;
                }
                Ok(())
            }
        }
    }

    fn update_feature_x86(
        &self,
        dtb: Option<u64>,
        incoming: bool,
        outgoing: bool,
        enable: bool,
    ) -> Result<()> {
        // Facet coverage by the other live requests for this dtb. The
        // request being added or removed is never in the map here.
        let mut covered = false;
        let mut covered_incoming = false;
        let mut covered_outgoing = false;
        for other in self.requests.borrow().values() {
            let TaskSwitchFilter::X86_64 {
                dtb: other_dtb,
                incoming: other_incoming,
                outgoing: other_outgoing,
            } = other
            else {
                continue;
            };
            if *other_dtb != dtb {
                continue;
            }
            covered = true;
            covered_incoming |= *other_incoming;
            covered_outgoing |= *other_outgoing;
            if covered_incoming && covered_outgoing {
                break;
            }
        }

        if !covered && !enable {
            self.hv.update_feature_taskswitch(
                false,
                TaskSwitchKey::X86_64 {
                    dtb,
                    incoming: false,
                    outgoing: false,
                },
            )
        } else if !covered
            || (incoming && !covered_incoming)
            || (outgoing && !covered_outgoing)
        {
            let mut trap_incoming = covered_incoming;
            let mut trap_outgoing = covered_outgoing;
            if enable {
                trap_incoming |= incoming;
                trap_outgoing |= outgoing;
            }
            self.hv.update_feature_taskswitch(
                true,
                TaskSwitchKey::X86_64 {
                    dtb,
                    incoming: trap_incoming,
                    outgoing: trap_outgoing,
                },
            )
        } else {
            Ok(())
        }
    }

    fn check_arch(&self, request: &TaskSwitchFilter) -> Result<()> {
        let matches = matches!(
            (self.arch, request),
            (Arch::X86_64, TaskSwitchFilter::X86_64 { .. })
                | (Arch::Aarch64, TaskSwitchFilter::Aarch64 { .. })
        );
        if !matches {
            return Err(Error::InvalidRequest(format!(
                "task switch parameters do not fit {:?}",
                self.arch
            )));
        }
        Ok(())
    }
}

impl EventProducer for TaskSwitchPlugin {
    fn request_event(&self, filter: &EventFilter) -> Result<RequestId> {
        let EventFilter::TaskSwitch(request) = filter else {
            return Err(Error::InvalidRequest(
                "expected task switch parameters".to_string(),
            ));
        };
        self.check_arch(request)?;
        self.update_feature(request, true)?;

        let id = self.next_request.get();
        self.next_request.set(id + 1);
        self.requests.borrow_mut().insert(id, *request);
        Ok(id)
    }

    fn cancel_event(&self, id: RequestId) -> Result<()> {
        let request = self
            .requests
            .borrow_mut()
            .remove(&id)
            .ok_or_else(|| Error::NotFound(format!("task switch request {id}")))?;
        self.update_feature(&request, false)
    }
}

impl Plugin for TaskSwitchPlugin {
    fn name(&self) -> &str {
        NAME
    }

    fn uninit(&self) -> Result<()> {
        loop {
            let entry = {
                let mut requests = self.requests.borrow_mut();
                let id = requests.keys().next().copied();
                id.and_then(|id| requests.remove(&id).map(|request| (id, request)))
            };
            let Some((_, request)) = entry else {
                break;
            };
            if let Err(error) = self.update_feature(&request, false) {
                tracing::warn!("failed to disable task switch trap: {}", error);
            }
        }
        self.em.unregister_producer(&[EventKind::TaskSwitch]);
        self.services.unregister_by_name(NAME)?;
        Ok(())
    }
}
