//! Event queue, subscriptions and the dispatch loop
//!
//! The event manager owns the FIFO queue of pending events, the
//! subscription buckets, the producer table and the ordered list of
//! continue-hooks. Dispatch is synchronous and single threaded: a callback
//! runs to completion before the next subscriber sees the event, and
//! `put_event` only appends to the queue so causal order between events
//! produced during dispatch is preserved.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::Duration;

use crate::api::{Event, EventFilter, EventKind, Hypervisor};
use crate::error::{Error, Result};

/// Opaque handle returned by an event producer for a forwarded request.
pub type RequestId = u64;

/// Handle for a registered continue-hook.
pub type ContinueHookId = u64;

/// Event kinds delivered by the hypervisor itself. No plugin may register
/// as their producer.
const SYSTEM_KINDS: [EventKind; 4] = [
    EventKind::VmReady,
    EventKind::VmStop,
    EventKind::VmShutdown,
    EventKind::DebugBreakpoint,
];

/// A producer plugin for one or more event kinds.
///
/// The event manager calls `request_event` when a subscription for a kind
/// owned by the producer is created, and `cancel_event` with the returned
/// id when it is cancelled.
pub trait EventProducer {
    fn request_event(&self, filter: &EventFilter) -> Result<RequestId>;
    fn cancel_event(&self, id: RequestId) -> Result<()>;
}

type Callback = Box<dyn FnMut(&Event) -> Result<()>>;

/// A single event subscription: a filter, a callback and the bookkeeping
/// the event manager needs to forward and cancel it.
pub struct Subscription {
    filter: EventFilter,
    callback: RefCell<Callback>,
    active: Cell<bool>,
    request_id: Cell<Option<RequestId>>,
}

impl Subscription {
    pub fn new(
        filter: EventFilter,
        callback: impl FnMut(&Event) -> Result<()> + 'static,
    ) -> Rc<Self> {
        Rc::new(Self {
            filter,
            callback: RefCell::new(Box::new(callback)),
            active: Cell::new(false),
            request_id: Cell::new(None),
        })
    }

    pub fn filter(&self) -> &EventFilter {
        &self.filter
    }

    /// True between `request_event` and `cancel_event`.
    pub fn is_active(&self) -> bool {
        self.active.get()
    }

    fn key(&self) -> EventKey {
        match self.filter.kind() {
            Some(kind) => EventKey::Kind(kind),
            None => EventKey::Any,
        }
    }

    fn deliver(&self, event: &Event) -> Result<()> {
        if self.filter.matches(event) {
            (self.callback.borrow_mut())(event)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum EventKey {
    Any,
    Kind(EventKind),
}

struct ProducerEntry {
    name: String,
    producer: Rc<dyn EventProducer>,
}

type ContinueHook = Rc<RefCell<dyn FnMut()>>;

pub struct EventManager {
    hv: Rc<dyn Hypervisor>,
    queue: RefCell<VecDeque<Event>>,
    callbacks: RefCell<HashMap<EventKey, Vec<Rc<Subscription>>>>,
    producers: RefCell<HashMap<EventKind, ProducerEntry>>,
    hooks: RefCell<Vec<(ContinueHookId, ContinueHook)>>,
    next_hook_id: Cell<ContinueHookId>,
}

impl EventManager {
    pub fn new(hv: Rc<dyn Hypervisor>) -> Rc<Self> {
        let mut callbacks = HashMap::new();
        callbacks.insert(EventKey::Any, Vec::new());
        Rc::new(Self {
            hv,
            queue: RefCell::new(VecDeque::new()),
            callbacks: RefCell::new(callbacks),
            producers: RefCell::new(HashMap::new()),
            hooks: RefCell::new(Vec::new()),
            next_hook_id: Cell::new(0),
        })
    }

    /// Register `producer` for every kind in `produces`. Fails with
    /// `ProducerExists` if any kind already has a producer; in that case no
    /// binding is added.
    pub fn register_producer(
        &self,
        name: &str,
        producer: Rc<dyn EventProducer>,
        produces: &[EventKind],
    ) -> Result<()> {
        let mut producers = self.producers.borrow_mut();
        for kind in produces {
            if SYSTEM_KINDS.contains(kind) {
                return Err(Error::ProducerExists {
                    kind: *kind,
                    producer: "the hypervisor".to_string(),
                });
            }
            if let Some(existing) = producers.get(kind) {
                return Err(Error::ProducerExists {
                    kind: *kind,
                    producer: existing.name.clone(),
                });
            }
        }
        for kind in produces {
            tracing::debug!("registering {} as {:?} producer", name, kind);
            producers.insert(
                *kind,
                ProducerEntry {
                    name: name.to_string(),
                    producer: Rc::clone(&producer),
                },
            );
        }
        Ok(())
    }

    pub fn unregister_producer(&self, produces: &[EventKind]) {
        let mut producers = self.producers.borrow_mut();
        for kind in produces {
            if producers.remove(kind).is_some() {
                tracing::debug!("unregistered {:?} producer", kind);
            }
        }
    }

    fn producer_for(&self, kind: EventKind) -> Option<Rc<dyn EventProducer>> {
        self.producers
            .borrow()
            .get(&kind)
            .map(|entry| Rc::clone(&entry.producer))
    }

    /// Activate a subscription. When `forward` is set and the kind has a
    /// producer, the request is forwarded first and the returned id stored
    /// on the subscription; a producer failure leaves the subscription
    /// inactive.
    pub fn request_event(&self, sub: &Rc<Subscription>, forward: bool) -> Result<()> {
        if sub.is_active() {
            return Err(Error::InvalidRequest(
                "subscription is already active".to_string(),
            ));
        }
        if forward {
            if let Some(kind) = sub.filter.kind() {
                if let Some(producer) = self.producer_for(kind) {
                    let id = producer.request_event(&sub.filter)?;
                    sub.request_id.set(Some(id));
                }
            }
        }
        self.callbacks
            .borrow_mut()
            .entry(sub.key())
            .or_default()
            .push(Rc::clone(sub));
        sub.active.set(true);
        Ok(())
    }

    /// Deactivate a subscription and cancel its forwarded request, if any.
    pub fn cancel_event(&self, sub: &Rc<Subscription>) -> Result<()> {
        {
            let mut callbacks = self.callbacks.borrow_mut();
            let bucket = callbacks
                .get_mut(&sub.key())
                .ok_or_else(|| Error::NotFound("subscription".to_string()))?;
            let pos = bucket
                .iter()
                .position(|other| Rc::ptr_eq(other, sub))
                .ok_or_else(|| Error::NotFound("subscription".to_string()))?;
            bucket.remove(pos);
        }
        if let Some(id) = sub.request_id.take() {
            match sub.filter.kind().and_then(|kind| self.producer_for(kind)) {
                Some(producer) => producer.cancel_event(id)?,
                // The producer was unregistered while the subscription was
                // live; its own teardown already released the request.
                None => tracing::warn!(
                    "cancelling subscription for {:?} without a producer",
                    sub.filter.kind()
                ),
            }
        }
        sub.active.set(false);
        Ok(())
    }

    /// Append an event to the queue. Never dispatches synchronously.
    pub fn put_event(&self, event: Event) {
        self.queue.borrow_mut().push_back(event);
    }

    /// Register a hook that runs just before every hypervisor resume.
    pub fn add_continue_hook(&self, hook: impl FnMut() + 'static) -> ContinueHookId {
        let id = self.next_hook_id.get();
        self.next_hook_id.set(id + 1);
        tracing::debug!("adding continue hook {}", id);
        let hook: ContinueHook = Rc::new(RefCell::new(hook));
        self.hooks.borrow_mut().push((id, hook));
        id
    }

    pub fn remove_continue_hook(&self, id: ContinueHookId) -> Result<()> {
        let mut hooks = self.hooks.borrow_mut();
        let pos = hooks
            .iter()
            .position(|(hook_id, _)| *hook_id == id)
            .ok_or_else(|| Error::NotFound(format!("continue hook {id}")))?;
        tracing::debug!("removing continue hook {}", id);
        hooks.remove(pos);
        Ok(())
    }

    pub(crate) fn call_continue_hooks(&self) {
        let hooks: Vec<ContinueHook> = self
            .hooks
            .borrow()
            .iter()
            .map(|(_, hook)| Rc::clone(hook))
            .collect();
        for hook in hooks {
            (hook.borrow_mut())();
        }
    }

    /// Deliver an event to every matching subscription: wildcard
    /// subscriptions first, then the exact kind bucket, both in insertion
    /// order. Each bucket is snapshotted before delivery so a cancellation
    /// performed by a callback takes effect immediately (the `active` flag
    /// is re-checked) while an addition becomes visible with the next
    /// event. Callback errors are logged and do not stop delivery.
    pub(crate) fn dispatch(&self, event: &Event) {
        tracing::trace!("dispatching event: {:?}", event);
        self.dispatch_bucket(EventKey::Any, event);
        self.dispatch_bucket(EventKey::Kind(event.kind()), event);
    }

    fn dispatch_bucket(&self, key: EventKey, event: &Event) {
        let subs: Vec<Rc<Subscription>> = match self.callbacks.borrow().get(&key) {
            Some(bucket) => bucket.clone(),
            None => return,
        };
        for sub in subs {
            if !sub.is_active() {
                continue;
            }
            if let Err(error) = sub.deliver(event) {
                tracing::error!("event callback failed: {}", error);
            }
        }
    }

    fn poll_hypervisor(&self) -> Result<()> {
        self.hv.wait_event(Duration::from_secs(1))?;
        while let Some(event) = self.hv.pop_event() {
            self.put_event(event);
        }
        Ok(())
    }

    /// Drive the VM until shutdown.
    ///
    /// Each iteration runs the continue-hooks, waits up to one second for
    /// hypervisor traps, drains them into the queue and dispatches until
    /// the queue is empty. Events appended during dispatch are processed
    /// in the same stop. Returns after `VmShutdown` has been dispatched;
    /// events still queued behind it are dropped.
    pub fn run_loop(&self) -> Result<()> {
        loop {
            self.call_continue_hooks();
            self.poll_hypervisor()?;
            loop {
                let event = match self.queue.borrow_mut().pop_front() {
                    Some(event) => event,
                    None => break,
                };
                self.dispatch(&event);
                if event.kind() == EventKind::VmShutdown {
                    return Ok(());
                }
            }
        }
    }
}
