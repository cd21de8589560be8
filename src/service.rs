//! Service registry
//!
//! A name to object map with a single process-wide lifecycle: the runtime
//! creates it during init and drops it during uninit. Objects are stored as
//! `Rc<dyn Any>` and retrieved by name, optionally downcast to their
//! concrete type. Canonical names are `EventManager`, `PluginManager`,
//! `VirtualMachine` and `OperatingSystem`; plugins register under their
//! declared name.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::error::{Error, Result};

pub type Service = Rc<dyn Any>;

#[derive(Default)]
pub struct ServiceManager {
    registry: RefCell<HashMap<String, Service>>,
}

impl ServiceManager {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// Register an object under `name`.
    pub fn register(&self, name: &str, obj: Service) -> Result<()> {
        let mut registry = self.registry.borrow_mut();
        if registry.contains_key(name) {
            return Err(Error::AlreadyRegistered(name.to_string()));
        }
        tracing::debug!("registering {} with service manager", name);
        registry.insert(name.to_string(), obj);
        Ok(())
    }

    /// Remove and return the binding for `name`.
    pub fn unregister_by_name(&self, name: &str) -> Result<Service> {
        tracing::debug!("unregistering {} with service manager", name);
        self.registry
            .borrow_mut()
            .remove(name)
            .ok_or_else(|| Error::NotFound(format!("service {name}")))
    }

    /// Remove and return the binding holding `obj`.
    pub fn unregister_by_object(&self, obj: &Service) -> Result<Service> {
        let name = {
            let registry = self.registry.borrow();
            registry
                .iter()
                .find(|(_, bound)| {
                    Rc::as_ptr(bound) as *const () == Rc::as_ptr(obj) as *const ()
                })
                .map(|(name, _)| name.clone())
        };
        match name {
            Some(name) => self.unregister_by_name(&name),
            None => Err(Error::NotFound("service object".to_string())),
        }
    }

    pub fn get(&self, name: &str) -> Result<Service> {
        self.registry
            .borrow()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("service {name}")))
    }

    /// Retrieve a service and downcast it to its concrete type.
    pub fn get_as<T: Any>(&self, name: &str) -> Result<Rc<T>> {
        self.get(name)?
            .downcast::<T>()
            .map_err(|_| Error::NotFound(format!("service {name} with the expected type")))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.registry.borrow().contains_key(name)
    }
}
