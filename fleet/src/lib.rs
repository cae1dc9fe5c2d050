//! Fleet of pre-warmed sandbox instances.
//!
//! [`FleetPool`] keeps a configured number of idle instances ready, hands
//! each incoming [`CompileTask`] to exactly one of them (provisioning a new
//! one when none is idle), and tears every instance down on shutdown.
//! Instances talk to the container daemon only through the
//! [`sandbox::ControlPlane`] trait.

pub mod config;
mod error;
mod instance;
mod language;
mod pool;
mod task;

pub use config::FleetConfig;
pub use error::{FleetError, FleetResult};
pub use instance::{ClaimedInstance, Instance, LifecycleState};
pub use language::{Language, LanguageCatalog};
pub use pool::FleetPool;
pub use task::{CompileTask, ExecutionResult, SourceCode};
