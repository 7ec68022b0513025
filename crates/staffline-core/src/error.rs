use thiserror::Error;

use crate::types::{
    ExceptionId, InstanceId, InstanceStatus, ResolutionStatus, StepId, StepStatus, TemplateId,
    TemplateState,
};

#[derive(Debug, Error)]
pub enum StafflineError {
    // Template errors
    #[error("Template not found: {0}")]
    TemplateNotFound(TemplateId),

    #[error("Template {id} cannot be instantiated while {state}")]
    TemplateNotInstantiable { id: TemplateId, state: TemplateState },

    #[error("Template {id} is {state} and can no longer be edited")]
    TemplateImmutable { id: TemplateId, state: TemplateState },

    #[error("Invalid workflow definition: {0}")]
    InvalidDefinition(String),

    // Instance errors
    #[error("Workflow instance not found: {0}")]
    InstanceNotFound(InstanceId),

    #[error("Step {step} not found in instance {instance}")]
    StepNotFound { instance: InstanceId, step: StepId },

    #[error("Workflow instance {instance} is {status}")]
    InstanceTerminal {
        instance: InstanceId,
        status: InstanceStatus,
    },

    #[error("Dependency not met for step {step}: {}", describe_unmet(.unmet, .missing))]
    DependencyNotMet {
        step: StepId,
        unmet: Vec<StepId>,
        missing: Vec<StepId>,
    },

    #[error("Illegal transition for step {step}: {from} -> {to}")]
    IllegalTransition {
        step: StepId,
        from: StepStatus,
        to: StepStatus,
    },

    // Integration errors
    #[error("Integration attempt not found: {0}")]
    AttemptNotFound(String),

    #[error("Integration provider error: {provider}: {message}")]
    Provider { provider: String, message: String },

    #[error("Integration provider timeout after {timeout_secs}s: {provider}")]
    ProviderTimeout { provider: String, timeout_secs: u64 },

    #[error("No integration provider configured for {0}")]
    ProviderNotConfigured(String),

    // Exception errors
    #[error("Exception not found: {0}")]
    ExceptionNotFound(ExceptionId),

    #[error("Exception {id} is already {status}")]
    AlreadyResolved {
        id: ExceptionId,
        status: ResolutionStatus,
    },

    // Persistence errors
    #[error("Concurrent modification: {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StafflineError {
    /// Caller errors: the operation performed no mutation and must not be retried
    /// automatically.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::TemplateNotFound(_)
                | Self::TemplateNotInstantiable { .. }
                | Self::TemplateImmutable { .. }
                | Self::InstanceNotFound(_)
                | Self::StepNotFound { .. }
                | Self::InstanceTerminal { .. }
                | Self::DependencyNotMet { .. }
                | Self::IllegalTransition { .. }
                | Self::AttemptNotFound(_)
                | Self::ExceptionNotFound(_)
                | Self::AlreadyResolved { .. }
        )
    }

    /// Technical failures that may succeed when tried again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Conflict(_) | Self::Provider { .. } | Self::ProviderTimeout { .. }
        )
    }
}

fn describe_unmet(unmet: &[StepId], missing: &[StepId]) -> String {
    let mut parts = Vec::new();
    if !unmet.is_empty() {
        parts.push(format!("incomplete prerequisites [{}]", join_ids(unmet)));
    }
    if !missing.is_empty() {
        parts.push(format!("unknown prerequisites [{}]", join_ids(missing)));
    }
    parts.join("; ")
}

fn join_ids(ids: &[StepId]) -> String {
    ids.iter().map(|id| id.0.as_str()).collect::<Vec<_>>().join(", ")
}

pub type Result<T> = std::result::Result<T, StafflineError>;
