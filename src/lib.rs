//! vmlens - virtual machine introspection runtime
//!
//! vmlens turns the low-level traps of an embedding hypervisor into a
//! filterable event stream for cooperating introspection plugins, and
//! coordinates the hardware features (debug traps, second-level paging
//! permissions, monitor trap flag, LBR, task switch trapping) those events
//! depend on, without the guest noticing.
//!
//! Architecture:
//! - Hypervisor ABI ([`api::Hypervisor`]): trap delivery, guest memory,
//!   feature toggles; implemented by the embedder
//! - Service registry ([`service`]): named singletons shared by plugins
//! - Event manager ([`event`]): queue, subscriptions with per-kind
//!   filters, producer registry, continue-hooks, run loop
//! - Core plugins ([`plugins`]): VM facade, OS facade, task switch, SLP
//!   permission coordinator, single step, stealth breakpoints
//! - Output sink ([`output`]): optional JSON Lines event recording
//!
//! Everything runs on one thread inside the stopped-VM window; the only
//! blocking point is the hypervisor wait in the run loop.
//!
//! ```no_run
//! use std::rc::Rc;
//! use vmlens::{Config, Runtime};
//! # fn hypervisor() -> Rc<dyn vmlens::api::Hypervisor> { unimplemented!() }
//!
//! # fn main() -> anyhow::Result<()> {
//! let runtime = Runtime::builder(hypervisor())
//!     .with_config(Config::load_default()?)
//!     .build()?;
//! runtime.run()?;
//! runtime.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod event;
pub mod logging;
pub mod output;
pub mod plugins;
pub mod runtime;
pub mod service;

#[cfg(test)]
pub(crate) mod testutil;

pub use api::{Arch, Event, EventFilter, EventKind, Hypervisor, PagePerms, SingleStepMethod};
pub use config::Config;
pub use error::{Error, Result};
pub use event::{EventManager, EventProducer, Subscription};
pub use plugins::{GuestOs, Plugin, PluginManager, RuntimeContext};
pub use runtime::{Runtime, RuntimeBuilder};
pub use service::ServiceManager;
