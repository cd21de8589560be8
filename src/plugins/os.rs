//! Guest operating system facade
//!
//! The runtime does not understand guest kernels itself; the embedder
//! supplies a [`GuestOs`] resolver (symbol addresses, address space
//! translation, current task lookup) and this plugin exposes it through
//! the service registry under the canonical `OperatingSystem` name.

use std::rc::Rc;

use crate::api::OsType;
use crate::error::Result;
use crate::plugins::{Plugin, RuntimeContext};
use crate::service::ServiceManager;

pub const NAME: &str = "OperatingSystem";

/// The task running on a CPU at the current stop.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskInfo {
    pub pid: u64,
    pub name: String,
    pub dtb: u64,
}

/// Resolver for guest OS semantics, implemented by the embedder.
pub trait GuestOs {
    fn os_type(&self) -> OsType;

    /// Resolve a kernel symbol to a guest virtual address.
    fn symbol_address(&self, symbol: &str) -> Result<u64>;

    /// The closest symbol at or below `address`, with its base.
    fn nearest_symbol(&self, address: u64) -> Result<Option<(String, u64)>>;

    /// Translate in a chosen address space; `kernel` forces the kernel
    /// address space regardless of `dtb`.
    fn vtop(&self, gva: u64, dtb: Option<u64>, kernel: bool) -> Result<u64>;

    /// The task currently running on `cpu`.
    fn current_task(&self, cpu: u32) -> Result<TaskInfo>;
}

pub struct OperatingSystem {
    services: Rc<ServiceManager>,
    os: Rc<dyn GuestOs>,
}

impl OperatingSystem {
    /// Wrap a resolver, if the embedder provided one.
    pub fn load(
        ctx: &RuntimeContext,
        guest_os: Option<Rc<dyn GuestOs>>,
    ) -> Result<Option<Rc<dyn Plugin>>> {
        let Some(os) = guest_os else {
            tracing::debug!("no guest OS resolver provided, skipping OS facade");
            return Ok(None);
        };
        let plugin = Rc::new(Self {
            services: Rc::clone(&ctx.services),
            os,
        });
        let service: Rc<dyn std::any::Any> = Rc::clone(&plugin) as Rc<dyn std::any::Any>;
        ctx.services.register(NAME, service)?;
        Ok(Some(plugin))
    }

    pub fn os_type(&self) -> OsType {
        self.os.os_type()
    }

    pub fn symbol_address(&self, symbol: &str) -> Result<u64> {
        self.os.symbol_address(symbol)
    }

    pub fn nearest_symbol(&self, address: u64) -> Result<Option<(String, u64)>> {
        self.os.nearest_symbol(address)
    }

    pub fn vtop(&self, gva: u64, dtb: Option<u64>, kernel: bool) -> Result<u64> {
        self.os.vtop(gva, dtb, kernel)
    }

    pub fn current_task(&self, cpu: u32) -> Result<TaskInfo> {
        self.os.current_task(cpu)
    }
}

impl Plugin for OperatingSystem {
    fn name(&self) -> &str {
        NAME
    }

    fn uninit(&self) -> Result<()> {
        self.services.unregister_by_name(NAME)?;
        Ok(())
    }
}
