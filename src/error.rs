//! Runtime error kinds
//!
//! Errors raised by subscriber callbacks are logged by the dispatcher and do
//! not abort delivery to later subscribers. Errors raised by the feature
//! coordinators propagate to the caller.

use crate::api::{EventKind, SingleStepMethod};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A global facility was used before `init` or after `uninit`.
    #[error("{0} is not initialized")]
    NotInitialized(&'static str),

    /// A service, subscription or plugin could not be found.
    #[error("{0} not found")]
    NotFound(String),

    /// A name collision in the service registry.
    #[error("service {0} already registered")]
    AlreadyRegistered(String),

    /// A second producer was registered for an event kind.
    #[error("{kind:?} events already provided by {producer}")]
    ProducerExists { kind: EventKind, producer: String },

    /// Virtual-to-physical address translation failed.
    #[error("unable to translate gva {gva:#x} in address space {dtb:#x}")]
    Translation { gva: u64, dtb: u64 },

    /// The requested page permission change would leave a page both
    /// writable and executable.
    #[error("permission update for gpa {gpa:#x} violates the W^X rule")]
    PermUpdateViolation { gpa: u64 },

    /// A CPU is already single-stepping with a different method.
    #[error("cpu {cpu} is already single-stepping via {armed:?}")]
    MethodConflict { cpu: u32, armed: SingleStepMethod },

    /// The hypervisor refused a feature toggle.
    #[error("hypervisor refused feature update: {0}")]
    Feature(String),

    /// The guest OS facade could not resolve a symbol.
    #[error("unable to resolve symbol {0}")]
    SymbolResolution(String),

    /// An event request carried missing or malformed parameters.
    #[error("invalid event request: {0}")]
    InvalidRequest(String),
}
