//! Runtime assembly and lifecycle
//!
//! The embedder implements [`Hypervisor`], builds a [`Runtime`] and calls
//! [`Runtime::run`]. Construction wires the fixed init order: logging,
//! services, event manager, output sink, plugin manager, hypervisor, then
//! the core plugins (VM facade, OS facade, task switch, SLP, single step,
//! breakpoint) followed by any plugins registered on the builder.
//! Teardown runs in reverse and also happens on drop.

use std::rc::Rc;

use tracing_appender::non_blocking::WorkerGuard;

use crate::api::Hypervisor;
use crate::config::{Config, VERSION};
use crate::error::Result;
use crate::event::EventManager;
use crate::logging;
use crate::output::OutputManager;
use crate::plugins::{
    breakpoint::BreakpointPlugin, machine::VirtualMachine, os::GuestOs, os::OperatingSystem,
    singlestep::SingleStepPlugin, slp::SlpPlugin, taskswitch::TaskSwitchPlugin, Plugin,
    PluginFactory, PluginManager, RuntimeContext,
};
use crate::service::ServiceManager;

pub struct RuntimeBuilder {
    hypervisor: Rc<dyn Hypervisor>,
    config: Option<Config>,
    guest_os: Option<Rc<dyn GuestOs>>,
    user_plugins: Vec<PluginFactory>,
    init_logging: bool,
}

impl RuntimeBuilder {
    pub fn new(hypervisor: Rc<dyn Hypervisor>) -> Self {
        Self {
            hypervisor,
            config: None,
            guest_os: None,
            user_plugins: Vec::new(),
            init_logging: true,
        }
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Provide the guest OS resolver backing the `OperatingSystem` facade.
    pub fn with_guest_os(mut self, guest_os: Rc<dyn GuestOs>) -> Self {
        self.guest_os = Some(guest_os);
        self
    }

    /// Register a plugin factory, run after the core plugins in
    /// registration order.
    pub fn with_plugin(
        mut self,
        factory: impl Fn(&RuntimeContext) -> Result<Option<Rc<dyn Plugin>>> + 'static,
    ) -> Self {
        self.user_plugins.push(Box::new(factory));
        self
    }

    /// Whether to install the global tracing subscriber. Embedders with
    /// their own logging setup can turn this off.
    pub fn with_logging(mut self, enabled: bool) -> Self {
        self.init_logging = enabled;
        self
    }

    pub fn build(self) -> anyhow::Result<Runtime> {
        let config = Rc::new(match self.config {
            Some(config) => config,
            None => Config::load_default()?,
        });
        let log_guard = if self.init_logging {
            logging::init(&config.logging)
        } else {
            None
        };
        tracing::debug!("initializing vmlens {}", VERSION);

        let services = ServiceManager::new();
        let em = EventManager::new(Rc::clone(&self.hypervisor));
        let em_service: Rc<dyn std::any::Any> = Rc::clone(&em) as Rc<dyn std::any::Any>;
        services.register("EventManager", em_service)?;

        let plugin_manager = PluginManager::new();
        let pm_service: Rc<dyn std::any::Any> = Rc::clone(&plugin_manager) as Rc<dyn std::any::Any>;
        services.register("PluginManager", pm_service)?;

        let output = match &config.output.store {
            Some(path) => Some(OutputManager::new(Rc::clone(&em), path.clone())?),
            None => None,
        };

        self.hypervisor.init()?;
        let ctx = RuntimeContext {
            arch: self.hypervisor.arch(),
            hypervisor: Rc::clone(&self.hypervisor),
            services: Rc::clone(&services),
            config: Rc::clone(&config),
        };

        tracing::debug!("loading core plugins");
        plugin_manager.load_plugin(&ctx, &VirtualMachine::load)?;
        let guest_os = self.guest_os;
        let os_factory =
            move |ctx: &RuntimeContext| OperatingSystem::load(ctx, guest_os.clone());
        plugin_manager.load_plugin(&ctx, &os_factory)?;
        plugin_manager.load_plugin(&ctx, &TaskSwitchPlugin::load)?;
        plugin_manager.load_plugin(&ctx, &SlpPlugin::load)?;
        plugin_manager.load_plugin(&ctx, &SingleStepPlugin::load)?;
        plugin_manager.load_plugin(&ctx, &BreakpointPlugin::load)?;

        tracing::debug!("loading user plugins");
        for factory in &self.user_plugins {
            plugin_manager.load_plugin(&ctx, factory.as_ref())?;
        }
        if let Some(dir) = &config.plugins.plugin_dir {
            // Native plugins are compiled in; the directory from the
            // config cannot be scanned for loadable code.
            tracing::warn!(
                "plugin_dir {} is set, but plugins must be registered on the runtime builder",
                dir.display()
            );
        }

        tracing::debug!("vmlens initialized");
        Ok(Runtime {
            ctx,
            em,
            plugin_manager,
            output,
            _log_guard: log_guard,
            finished: false,
        })
    }
}

pub struct Runtime {
    ctx: RuntimeContext,
    em: Rc<EventManager>,
    plugin_manager: Rc<PluginManager>,
    output: Option<Rc<OutputManager>>,
    _log_guard: Option<WorkerGuard>,
    finished: bool,
}

impl Runtime {
    pub fn builder(hypervisor: Rc<dyn Hypervisor>) -> RuntimeBuilder {
        RuntimeBuilder::new(hypervisor)
    }

    /// Drive the VM until shutdown.
    pub fn run(&self) -> Result<()> {
        self.em.run_loop()
    }

    pub fn context(&self) -> &RuntimeContext {
        &self.ctx
    }

    pub fn services(&self) -> Rc<ServiceManager> {
        Rc::clone(&self.ctx.services)
    }

    pub fn event_manager(&self) -> Rc<EventManager> {
        Rc::clone(&self.em)
    }

    pub fn plugin_manager(&self) -> Rc<PluginManager> {
        Rc::clone(&self.plugin_manager)
    }

    pub fn config(&self) -> &Config {
        &self.ctx.config
    }

    /// Explicit teardown; also performed on drop.
    pub fn shutdown(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        tracing::debug!("unloading plugins");
        self.plugin_manager.unload_all();
        if let Some(output) = self.output.take() {
            if let Err(error) = output.uninit() {
                tracing::warn!("failed to tear down the output sink: {}", error);
            }
        }
        self.ctx.hypervisor.uninit();
        tracing::debug!("vmlens uninitialized");
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.teardown();
    }
}
