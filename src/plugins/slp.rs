//! SLP permission coordinator
//!
//! Owns the second-level-paging permission state for every guest page the
//! runtime touches. Permission requests made during a stop are OR-merged
//! per page and flushed to the hypervisor by a continue-hook, so each page
//! sees at most one update per stop. The hypervisor-enforced invariant is
//! W^X: no committed permission set may be both writable and executable.
//! The single exception is the RWX resolution path, which parks a page at
//! RWX uncommitted for exactly one single step and restores it before the
//! guest runs further.

use std::cell::{Cell, RefCell};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::rc::Rc;

use crate::api::{
    gfn, Event, EventFilter, EventKind, Hypervisor, PagePerms, SlpFilter, SlpTrapRequest,
    PAGE_SHIFT,
};
use crate::error::{Error, Result};
use crate::event::{ContinueHookId, EventManager, EventProducer, RequestId, Subscription};
use crate::plugins::{machine::VirtualMachine, Plugin, RuntimeContext};
use crate::service::ServiceManager;

pub const NAME: &str = "SlpPlugin";

/// A buffered SLP violation, held until the next continue-hook.
#[derive(Debug, Clone, Copy)]
struct SlpFault {
    cpu: u32,
    gpa: u64,
    r: bool,
    w: bool,
    x: bool,
    rwx: bool,
}

/// Permission request for one page within the current stop.
#[derive(Debug, Clone, Copy)]
struct PageRequest {
    perms: PagePerms,
    committed: bool,
}

pub struct SlpPlugin {
    hv: Rc<dyn Hypervisor>,
    services: Rc<ServiceManager>,
    em: Rc<EventManager>,
    next_request: Cell<RequestId>,
    requests: RefCell<HashMap<RequestId, SlpTrapRequest>>,
    perm_requests: RefCell<HashMap<u64, PageRequest>>,
    pending_faults: RefCell<Vec<SlpFault>>,
    rwx_pending: RefCell<Vec<Option<(u64, PagePerms)>>>,
    carryover: RefCell<HashMap<u64, PagePerms>>,
    ss_subs: RefCell<Vec<Rc<Subscription>>>,
    slp_sub: RefCell<Option<Rc<Subscription>>>,
    hook: Cell<Option<ContinueHookId>>,
}

impl SlpPlugin {
    pub fn load(ctx: &RuntimeContext) -> Result<Option<Rc<dyn Plugin>>> {
        let em = ctx.event_manager()?;
        let vm: Rc<VirtualMachine> = ctx.vm()?;
        let cpu_count = vm.cpu_count() as usize;

        let plugin = Rc::new(Self {
            hv: Rc::clone(&ctx.hypervisor),
            services: Rc::clone(&ctx.services),
            em: Rc::clone(&em),
            next_request: Cell::new(0),
            requests: RefCell::new(HashMap::new()),
            perm_requests: RefCell::new(HashMap::new()),
            pending_faults: RefCell::new(Vec::new()),
            rwx_pending: RefCell::new(vec![None; cpu_count]),
            carryover: RefCell::new(HashMap::new()),
            ss_subs: RefCell::new(Vec::new()),
            slp_sub: RefCell::new(None),
            hook: Cell::new(None),
        });

        // Every violation is buffered here; the trap requests themselves
        // are merged in the hypervisor, so no forward is needed.
        let fault_plugin = Rc::clone(&plugin);
        let slp_sub = Subscription::new(
            EventFilter::SlpViolation(SlpFilter::global_all()),
            move |event| {
                fault_plugin.on_violation(event);
                Ok(())
            },
        );
        em.request_event(&slp_sub, false)?;
        *plugin.slp_sub.borrow_mut() = Some(slp_sub);

        let mut ss_subs = Vec::with_capacity(cpu_count);
        for cpu in 0..cpu_count as u32 {
            let step_plugin = Rc::clone(&plugin);
            ss_subs.push(Subscription::new(
                EventFilter::SingleStep {
                    cpu: Some(cpu),
                    method: None,
                },
                move |_| step_plugin.on_single_step(cpu),
            ));
        }
        *plugin.ss_subs.borrow_mut() = ss_subs;

        let hook_plugin = Rc::clone(&plugin);
        plugin
            .hook
            .set(Some(em.add_continue_hook(move || hook_plugin.flush_permissions())));

        em.register_producer(NAME, plugin.clone(), &[EventKind::SlpViolation])?;
        let service: Rc<dyn std::any::Any> = Rc::clone(&plugin) as Rc<dyn std::any::Any>;
        ctx.services.register(NAME, service)?;
        Ok(Some(plugin))
    }

    /// Request page permissions for the page containing `gpa`.
    ///
    /// Requests within one stop are OR-merged per page. The first request
    /// for a page is pushed to the hypervisor immediately; later ones are
    /// held for the continue-hook. A merge that would leave the page both
    /// writable and executable fails.
    pub fn update_permissions(&self, gpa: u64, perms: PagePerms) -> Result<()> {
        let frame = gfn(gpa);
        let merged = self
            .perm_requests
            .borrow()
            .get(&frame)
            .map(|prev| prev.perms | perms);
        match merged {
            Some(merged) => {
                if merged.violates_wx() {
                    return Err(Error::PermUpdateViolation { gpa });
                }
                self.perm_requests.borrow_mut().insert(
                    frame,
                    PageRequest {
                        perms: merged,
                        committed: false,
                    },
                );
            }
            None => {
                if perms.violates_wx() {
                    return Err(Error::PermUpdateViolation { gpa });
                }
                self.hv.slp_update(gpa, perms)?;
                self.perm_requests.borrow_mut().insert(
                    frame,
                    PageRequest {
                        perms,
                        committed: true,
                    },
                );
            }
        }
        Ok(())
    }

    fn on_violation(&self, event: &Event) {
        let Event::SlpViolation {
            cpu,
            gpa,
            r,
            w,
            x,
            rwx,
            ..
        } = *event
        else {
            return;
        };
        self.pending_faults.borrow_mut().push(SlpFault {
            cpu,
            gpa,
            r,
            w,
            x,
            rwx,
        });
    }

    /// Restore the pre-fault permissions after an RWX resolution step.
    fn on_single_step(&self, cpu: u32) -> Result<()> {
        let pending = self.rwx_pending.borrow_mut()[cpu as usize].take();
        let Some((frame, perms)) = pending else {
            tracing::warn!("single step on cpu {} without a pending RWX restore", cpu);
            return Ok(());
        };
        self.update_permissions(frame << PAGE_SHIFT, perms)?;
        let sub = Rc::clone(&self.ss_subs.borrow()[cpu as usize]);
        self.em.cancel_event(&sub)?;
        Ok(())
    }

    /// Fold the buffered violations into the per-page request map.
    ///
    /// An RWX fault parks the page at RWX for one single step and records
    /// the permissions to restore. Any other fault on a page without a
    /// request this stop gets a recovery permission set matching the
    /// access that trapped.
    fn merge_fault_perms(&self) {
        let faults: Vec<SlpFault> = self.pending_faults.borrow_mut().drain(..).collect();
        for fault in faults {
            let frame = gfn(fault.gpa);
            if fault.rwx {
                if self.rwx_pending.borrow()[fault.cpu as usize].is_some() {
                    // The hypervisor must not re-fault before the resume
                    // that runs the resolution step.
                    panic!("second RWX violation on cpu {} before resume", fault.cpu);
                }
                let pre_fault = self
                    .perm_requests
                    .borrow()
                    .get(&frame)
                    .map(|req| req.perms)
                    .unwrap_or(PagePerms::R | PagePerms::W);
                self.rwx_pending.borrow_mut()[fault.cpu as usize] = Some((frame, pre_fault));
                self.perm_requests.borrow_mut().insert(
                    frame,
                    PageRequest {
                        perms: PagePerms::all(),
                        committed: false,
                    },
                );
                let sub = Rc::clone(&self.ss_subs.borrow()[fault.cpu as usize]);
                if let Err(error) = self.em.request_event(&sub, true) {
                    tracing::error!(
                        "failed to arm single step for RWX resolution on cpu {}: {}",
                        fault.cpu,
                        error
                    );
                }
            } else if !self.perm_requests.borrow().contains_key(&frame) {
                let recovery = if fault.r || fault.w {
                    PagePerms::R | PagePerms::W
                } else {
                    PagePerms::R | PagePerms::X
                };
                self.perm_requests.borrow_mut().insert(
                    frame,
                    PageRequest {
                        perms: recovery,
                        committed: false,
                    },
                );
            }
        }
    }

    /// Continue-hook: resolve buffered faults, flush every uncommitted
    /// request and reset the per-stop state. A failed flush is re-queued
    /// for the next stop.
    fn flush_permissions(&self) {
        let retries: Vec<(u64, PagePerms)> = self.carryover.borrow_mut().drain().collect();
        for (frame, perms) in retries {
            let mut map = self.perm_requests.borrow_mut();
            match map.entry(frame) {
                Entry::Occupied(mut entry) => {
                    let merged = entry.get().perms | perms;
                    if merged.violates_wx() {
                        tracing::warn!(
                            "dropping retried permissions for gfn {:#x}: conflict with newer request",
                            frame
                        );
                    } else {
                        entry.insert(PageRequest {
                            perms: merged,
                            committed: false,
                        });
                    }
                }
                Entry::Vacant(entry) => {
                    entry.insert(PageRequest {
                        perms,
                        committed: false,
                    });
                }
            }
        }

        self.merge_fault_perms();

        let updates: Vec<(u64, PagePerms)> = self
            .perm_requests
            .borrow()
            .iter()
            .filter(|(_, req)| !req.committed)
            .map(|(frame, req)| (*frame, req.perms))
            .collect();
        for (frame, perms) in updates {
            if let Err(error) = self.hv.slp_update(frame << PAGE_SHIFT, perms) {
                tracing::warn!(
                    "lost SLP permission update for gfn {:#x}, retrying next stop: {}",
                    frame,
                    error
                );
                self.carryover.borrow_mut().insert(frame, perms);
            }
        }
        self.perm_requests.borrow_mut().clear();
    }
}

impl EventProducer for SlpPlugin {
    fn request_event(&self, filter: &EventFilter) -> Result<RequestId> {
        let EventFilter::SlpViolation(filter) = filter else {
            return Err(Error::InvalidRequest(
                "expected SLP violation parameters".to_string(),
            ));
        };
        let request = SlpTrapRequest::from(*filter);
        self.hv.update_feature_slp(true, request)?;
        let id = self.next_request.get();
        self.next_request.set(id + 1);
        self.requests.borrow_mut().insert(id, request);
        Ok(id)
    }

    fn cancel_event(&self, id: RequestId) -> Result<()> {
        let request = self
            .requests
            .borrow_mut()
            .remove(&id)
            .ok_or_else(|| Error::NotFound(format!("SLP request {id}")))?;
        self.hv.update_feature_slp(false, request)
    }
}

impl Plugin for SlpPlugin {
    fn name(&self) -> &str {
        NAME
    }

    fn uninit(&self) -> Result<()> {
        for (_, request) in self.requests.borrow_mut().drain() {
            if let Err(error) = self.hv.update_feature_slp(false, request) {
                tracing::warn!("failed to disable SLP trap: {}", error);
            }
        }
        if let Some(sub) = self.slp_sub.borrow_mut().take() {
            self.em.cancel_event(&sub)?;
        }
        for sub in self.ss_subs.borrow().iter() {
            if sub.is_active() {
                self.em.cancel_event(sub)?;
            }
        }
        if let Some(hook) = self.hook.take() {
            self.em.remove_continue_hook(hook)?;
        }
        self.em.unregister_producer(&[EventKind::SlpViolation]);
        self.services.unregister_by_name(NAME)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::SingleStepMethod;
    use crate::testutil::{FeatureCall, TestRig};

    fn fault(cpu: u32, gpa: u64, r: bool, w: bool, x: bool, rwx: bool) -> Event {
        Event::SlpViolation {
            cpu,
            gva: Some(0xffff_0000_0000_0000 | gpa),
            gpa,
            r,
            w,
            x,
            rwx,
        }
    }

    #[test]
    fn first_request_pushes_merges_flush_once() {
        let rig = TestRig::x86(1);
        let slp = rig.slp();

        slp.update_permissions(0x5000, PagePerms::R).unwrap();
        assert_eq!(rig.hv.slp_updates(), vec![(0x5000, PagePerms::R)]);

        // Later callers for the same page are OR-merged and deferred.
        slp.update_permissions(0x5010, PagePerms::X).unwrap();
        assert_eq!(rig.hv.slp_updates().len(), 1);

        rig.em().call_continue_hooks();
        assert_eq!(
            rig.hv.slp_updates().last(),
            Some(&(0x5000, PagePerms::R | PagePerms::X))
        );
        assert_eq!(rig.hv.slp_updates().len(), 2);

        // The request map is per stop; the next stop starts clean.
        rig.em().call_continue_hooks();
        assert_eq!(rig.hv.slp_updates().len(), 2);
    }

    #[test]
    fn wx_merge_fails() {
        let rig = TestRig::x86(1);
        let slp = rig.slp();

        slp.update_permissions(0x5000, PagePerms::R | PagePerms::W)
            .unwrap();
        let err = slp.update_permissions(0x5000, PagePerms::X).unwrap_err();
        assert!(matches!(err, Error::PermUpdateViolation { gpa: 0x5000 }));

        // A fresh W+X request is rejected before reaching the hypervisor.
        let err = slp
            .update_permissions(0x9000, PagePerms::W | PagePerms::X)
            .unwrap_err();
        assert!(matches!(err, Error::PermUpdateViolation { gpa: 0x9000 }));
        assert_eq!(rig.hv.slp_updates().len(), 1);
    }

    #[test]
    fn forwarded_subscription_toggles_the_trap_feature() {
        let rig = TestRig::x86(1);
        let sub = Subscription::new(
            EventFilter::SlpViolation(SlpFilter::page(0x100, PagePerms::R | PagePerms::W)),
            |_| Ok(()),
        );
        rig.em().request_event(&sub, true).unwrap();
        let expected = SlpTrapRequest::from(SlpFilter::page(0x100, PagePerms::R | PagePerms::W));
        assert_eq!(
            rig.hv.feature_calls().last(),
            Some(&FeatureCall::Slp {
                enable: true,
                req: expected,
            })
        );

        rig.em().cancel_event(&sub).unwrap();
        assert_eq!(
            rig.hv.feature_calls().last(),
            Some(&FeatureCall::Slp {
                enable: false,
                req: expected,
            })
        );
    }

    #[test]
    fn recovery_permissions_for_unrequested_faults() {
        let rig = TestRig::x86(1);

        rig.dispatch(fault(0, 0x7000, true, false, false, false));
        rig.em().call_continue_hooks();
        assert_eq!(
            rig.hv.slp_updates().last(),
            Some(&(0x7000, PagePerms::R | PagePerms::W))
        );

        rig.dispatch(fault(0, 0x8000, false, false, true, false));
        rig.em().call_continue_hooks();
        assert_eq!(
            rig.hv.slp_updates().last(),
            Some(&(0x8000, PagePerms::R | PagePerms::X))
        );
    }

    #[test]
    fn rwx_violation_resolves_with_a_single_step() {
        let rig = TestRig::x86(2);
        rig.hv.set_rip(1, 0x9000);
        let frame = 0x123u64;

        rig.dispatch(fault(1, frame << PAGE_SHIFT, true, true, true, true));
        rig.em().call_continue_hooks();

        // The page is parked at RWX and the resolution step is armed.
        assert_eq!(
            rig.hv.slp_updates().last(),
            Some(&(frame << PAGE_SHIFT, PagePerms::all()))
        );
        assert_eq!(
            rig.hv.feature_calls().last(),
            Some(&FeatureCall::Mtf {
                cpu: 1,
                enable: true
            })
        );

        // The step lands: pre-fault permissions come back, the step
        // disarms, and no W^X set survives.
        rig.dispatch(Event::SingleStep {
            cpu: 1,
            method: SingleStepMethod::Mtf,
        });
        assert_eq!(
            rig.hv.slp_updates().last(),
            Some(&(frame << PAGE_SHIFT, PagePerms::R | PagePerms::W))
        );
        assert!(rig
            .hv
            .feature_calls()
            .contains(&FeatureCall::Mtf {
                cpu: 1,
                enable: false
            }));

        rig.em().call_continue_hooks();
        let last = rig.hv.slp_updates();
        assert_eq!(last.last(), Some(&(frame << PAGE_SHIFT, PagePerms::R | PagePerms::W)));
    }

    #[test]
    fn rwx_restore_uses_the_requested_pre_fault_permissions() {
        let rig = TestRig::x86(1);
        rig.hv.set_rip(0, 0x9000);

        // A caller had already asked for X-only this stop.
        rig.slp().update_permissions(0x4000, PagePerms::X).unwrap();
        rig.dispatch(fault(0, 0x4000, true, true, true, true));
        rig.em().call_continue_hooks();

        rig.dispatch(Event::SingleStep {
            cpu: 0,
            method: SingleStepMethod::Mtf,
        });
        assert_eq!(
            rig.hv.slp_updates().last(),
            Some(&(0x4000, PagePerms::X))
        );
    }

    #[test]
    #[should_panic(expected = "second RWX violation")]
    fn second_rwx_on_one_cpu_is_a_contract_violation() {
        let rig = TestRig::x86(1);
        rig.hv.set_rip(0, 0x9000);
        rig.dispatch(fault(0, 0x4000, true, true, true, true));
        rig.dispatch(fault(0, 0x5000, true, true, true, true));
        rig.em().call_continue_hooks();
    }

    #[test]
    fn failed_flush_is_retried_on_the_next_stop() {
        let rig = TestRig::x86(1);

        rig.dispatch(fault(0, 0x7000, false, true, false, false));
        rig.hv.fail_slp_updates(true);
        rig.em().call_continue_hooks();
        assert!(rig.hv.slp_updates().is_empty());

        rig.hv.fail_slp_updates(false);
        rig.em().call_continue_hooks();
        assert_eq!(
            rig.hv.slp_updates().last(),
            Some(&(0x7000, PagePerms::R | PagePerms::W))
        );
    }
}
