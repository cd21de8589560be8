//! Plugin lifecycle
//!
//! Plugins are constructed by factories against a [`RuntimeContext`], own
//! their subscriptions and service registrations, and release both in
//! `uninit`. The plugin manager keeps them in load order and tears them
//! down in reverse, so consumers built on top of earlier plugins are gone
//! before their dependencies.

use std::cell::RefCell;
use std::rc::Rc;

use crate::api::{Arch, Hypervisor};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::event::EventManager;
use crate::service::ServiceManager;

pub mod breakpoint;
pub mod machine;
pub mod os;
pub mod singlestep;
pub mod slp;
pub mod taskswitch;

pub use breakpoint::BreakpointPlugin;
pub use machine::VirtualMachine;
pub use os::{GuestOs, OperatingSystem, TaskInfo};
pub use singlestep::SingleStepPlugin;
pub use slp::SlpPlugin;
pub use taskswitch::TaskSwitchPlugin;

/// Construction context handed to plugin factories. Service handles are
/// resolved once here and stored in the plugin, not looked up per call.
pub struct RuntimeContext {
    pub arch: Arch,
    pub hypervisor: Rc<dyn Hypervisor>,
    pub services: Rc<ServiceManager>,
    pub config: Rc<Config>,
}

impl RuntimeContext {
    pub fn event_manager(&self) -> Result<Rc<EventManager>> {
        self.services.get_as("EventManager")
    }

    pub fn vm(&self) -> Result<Rc<VirtualMachine>> {
        self.services.get_as("VirtualMachine")
    }
}

/// A loaded plugin. `uninit` must cancel the plugin's subscriptions,
/// unregister its producer bindings and remove its service registration.
pub trait Plugin {
    fn name(&self) -> &str;
    fn uninit(&self) -> Result<()>;
}

/// Builds a plugin, or `None` when its prerequisites (architecture, guest
/// OS, configuration) are not satisfied.
pub type PluginFactory = Box<dyn Fn(&RuntimeContext) -> Result<Option<Rc<dyn Plugin>>>>;

#[derive(Default)]
pub struct PluginManager {
    plugins: RefCell<Vec<Rc<dyn Plugin>>>,
}

impl PluginManager {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// Run `factory` and track the plugin it builds. A factory returning
    /// `None` is not an error; the plugin just is not loadable here.
    pub fn load_plugin(
        &self,
        ctx: &RuntimeContext,
        factory: &dyn Fn(&RuntimeContext) -> Result<Option<Rc<dyn Plugin>>>,
    ) -> Result<bool> {
        match factory(ctx)? {
            Some(plugin) => {
                if self.is_loaded(plugin.name()) {
                    let name = plugin.name().to_string();
                    // Roll the half-constructed plugin back before failing.
                    plugin.uninit()?;
                    return Err(Error::AlreadyRegistered(name));
                }
                tracing::debug!("loaded plugin {}", plugin.name());
                self.plugins.borrow_mut().push(plugin);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Load a plugin that may already be present: the old instance is
    /// uninitialized first.
    pub fn reload_plugin(
        &self,
        ctx: &RuntimeContext,
        name: &str,
        factory: &dyn Fn(&RuntimeContext) -> Result<Option<Rc<dyn Plugin>>>,
    ) -> Result<bool> {
        if self.is_loaded(name) {
            self.unload_plugin(name)?;
        }
        self.load_plugin(ctx, factory)
    }

    pub fn unload_plugin(&self, name: &str) -> Result<()> {
        let plugin = {
            let mut plugins = self.plugins.borrow_mut();
            let pos = plugins
                .iter()
                .position(|plugin| plugin.name() == name)
                .ok_or_else(|| Error::NotFound(format!("plugin {name}")))?;
            plugins.remove(pos)
        };
        tracing::debug!("unloading plugin {}", plugin.name());
        plugin.uninit()
    }

    /// Tear down every plugin in reverse load order.
    pub fn unload_all(&self) {
        loop {
            let plugin = match self.plugins.borrow_mut().pop() {
                Some(plugin) => plugin,
                None => break,
            };
            tracing::debug!("unloading plugin {}", plugin.name());
            if let Err(error) = plugin.uninit() {
                tracing::warn!("plugin {} failed to uninit: {}", plugin.name(), error);
            }
        }
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.plugins
            .borrow()
            .iter()
            .any(|plugin| plugin.name() == name)
    }

    pub fn loaded_plugins(&self) -> Vec<String> {
        self.plugins
            .borrow()
            .iter()
            .map(|plugin| plugin.name().to_string())
            .collect()
    }
}
