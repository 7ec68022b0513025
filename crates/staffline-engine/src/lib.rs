pub mod audit_log;
pub mod dispatcher;
pub mod engine;
pub mod exceptions;
pub mod manager;
pub mod progress;
pub mod resolver;
pub mod retry;
pub mod sweeper;
pub mod templates;
pub mod transition;

pub use audit_log::AuditLogger;
pub use dispatcher::{DispatchOutcome, Dispatched, Dispatcher, ProviderMap};
pub use engine::Engine;
pub use exceptions::ExceptionTracker;
pub use manager::{InstanceDetail, InstanceManager, StepTransition};
pub use progress::{aggregate, Progress};
pub use resolver::Eligibility;
pub use sweeper::{SweepReport, Sweeper};
pub use templates::TemplateStore;
