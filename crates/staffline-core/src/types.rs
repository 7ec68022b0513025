use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StafflineError;

/// Declares a string-backed identifier newtype.
macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn from_string(s: &str) -> Self {
                Self(s.to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

/// Declares a closed enum stored as a snake_case string (database column, JSON, TOML).
macro_rules! str_enum {
    ($(#[$meta:meta])* $name:ident { $($(#[$vmeta:meta])* $variant:ident => $s:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum $name {
            $($(#[$vmeta])* #[serde(rename = $s)] $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $s),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.pad(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = StafflineError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok($name::$variant),)+
                    other => Err(StafflineError::InvalidDefinition(format!(
                        "unknown {} '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

string_id!(
    /// Identifier of a reusable workflow template.
    TemplateId
);
string_id!(
    /// Identifier of one concrete workflow run.
    InstanceId
);
string_id!(
    /// Identifier of a step inside a workflow instance.
    StepId
);
string_id!(
    /// Identifier of an integration attempt.
    AttemptId
);
string_id!(
    /// Identifier of a recorded workflow exception.
    ExceptionId
);

/// Employee the workflow is about. Supplied by the employee record system.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EmployeeId(pub String);

impl EmployeeId {
    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for EmployeeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque identity recorded on every mutation. The engine does not authenticate it.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Actor(pub String);

impl Actor {
    pub const SYSTEM: &'static str = "system";

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }

    /// The engine itself (dispatcher outcomes, sweeper).
    pub fn system() -> Self {
        Self(Self::SYSTEM.to_string())
    }

    pub fn is_system(&self) -> bool {
        self.0 == Self::SYSTEM
    }
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

str_enum!(
    /// Kind of staff lifecycle event a workflow covers.
    LifecycleType {
        Onboarding => "onboarding",
        Offboarding => "offboarding",
        Performance => "performance",
        Leave => "leave",
        Vendor => "vendor",
        Other => "other",
    }
);

str_enum!(
    /// Publication state of a template.
    TemplateState {
        Draft => "draft",
        Published => "published",
        Retired => "retired",
    }
);

str_enum!(
    /// Status of a workflow instance. `Overdue` is a date-derived flag, not a
    /// state-machine node.
    InstanceStatus {
        NotStarted => "not_started",
        InProgress => "in_progress",
        Completed => "completed",
        Overdue => "overdue",
        Cancelled => "cancelled",
    }
);

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

str_enum!(
    /// Status of a single workflow step.
    StepStatus {
        Pending => "pending",
        InProgress => "in_progress",
        Completed => "completed",
        Blocked => "blocked",
        Failed => "failed",
        Skipped => "skipped",
    }
);

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// Statuses that count as "work has started" when deriving instance status.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::InProgress | Self::Blocked | Self::Failed)
    }

    /// Entering these statuses requires all prerequisites to be completed.
    pub fn requires_eligibility(&self) -> bool {
        matches!(self, Self::InProgress | Self::Completed)
    }

    /// `pending → in_progress → {completed, blocked, failed}`, `blocked → in_progress`,
    /// any non-terminal → `skipped`.
    pub fn can_transition_to(&self, to: StepStatus) -> bool {
        use StepStatus::*;
        match (self, to) {
            (from, Skipped) => !from.is_terminal(),
            (Pending, InProgress) => true,
            (InProgress, Completed | Blocked | Failed) => true,
            (Blocked, InProgress) => true,
            _ => false,
        }
    }
}

str_enum!(
    /// How a step gets actioned.
    StepKind {
        Manual => "manual",
        Integration => "integration",
        Approval => "approval",
        Document => "document",
    }
);

str_enum!(
    /// External provider family an integration step talks to.
    IntegrationKind {
        ESignature => "e_signature",
        BackgroundCheck => "background_check",
        DocumentSearch => "document_search",
    }
);

str_enum!(
    /// Status of an integration attempt.
    AttemptStatus {
        Pending => "pending",
        InProgress => "in_progress",
        Completed => "completed",
        Failed => "failed",
    }
);

str_enum!(
    ExceptionKind {
        IntegrationFailure => "integration_failure",
        Timeout => "timeout",
        ValidationError => "validation_error",
        ManualIntervention => "manual_intervention",
    }
);

str_enum!(
    Severity {
        Low => "low",
        Medium => "medium",
        High => "high",
        Critical => "critical",
    }
);

str_enum!(
    /// Resolution state of a workflow exception.
    ResolutionStatus {
        Open => "open",
        InProgress => "in_progress",
        Resolved => "resolved",
        Dismissed => "dismissed",
    }
);

impl ResolutionStatus {
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Resolved | Self::Dismissed)
    }
}

/// Blueprint for one step, cloned into a concrete [`WorkflowStep`] at instantiation.
///
/// `id` is unique within its template; `prerequisites` name sibling blueprint ids.
/// The same shape describes the explicit steps of a freeform instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepBlueprint {
    pub id: String,
    pub title: String,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default = "default_step_kind")]
    pub kind: StepKind,
    /// Required when `kind` is `integration`.
    #[serde(default)]
    pub integration: Option<IntegrationKind>,
    #[serde(default)]
    pub default_assignee_role: Option<String>,
    /// Days after the instance start date the step is due.
    #[serde(default)]
    pub due_day_offset: i64,
    #[serde(default = "default_mandatory")]
    pub mandatory: bool,
    #[serde(default)]
    pub prerequisites: Vec<String>,
    /// Overrides the engine-wide attempt bound for integration steps.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_category() -> String {
    "general".to_string()
}
fn default_step_kind() -> StepKind {
    StepKind::Manual
}
fn default_mandatory() -> bool {
    true
}

impl StepBlueprint {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            category: default_category(),
            kind: StepKind::Manual,
            integration: None,
            default_assignee_role: None,
            due_day_offset: 0,
            mandatory: true,
            prerequisites: vec![],
            max_attempts: None,
            description: None,
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_prerequisites(mut self, ids: &[&str]) -> Self {
        self.prerequisites = ids.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_integration(mut self, kind: IntegrationKind) -> Self {
        self.kind = StepKind::Integration;
        self.integration = Some(kind);
        self
    }

    pub fn with_kind(mut self, kind: StepKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_due_offset(mut self, days: i64) -> Self {
        self.due_day_offset = days;
        self
    }

    pub fn with_assignee_role(mut self, role: impl Into<String>) -> Self {
        self.default_assignee_role = Some(role.into());
        self
    }

    pub fn optional(mut self) -> Self {
        self.mandatory = false;
        self
    }

    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = Some(max);
        self
    }
}

/// Input for creating (or replacing) a draft template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateDraft {
    pub name: String,
    pub lifecycle: LifecycleType,
    #[serde(default)]
    pub department: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub steps: Vec<StepBlueprint>,
}

/// Reusable, versioned workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub id: TemplateId,
    pub name: String,
    pub lifecycle: LifecycleType,
    pub department: Option<String>,
    pub role: Option<String>,
    pub description: Option<String>,
    pub version: u32,
    pub state: TemplateState,
    pub steps: Vec<StepBlueprint>,
    pub created_by: Actor,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub retired_at: Option<DateTime<Utc>>,
}

/// Where the steps of a new instance come from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum StepSource {
    /// Clone the blueprints of a published template.
    Template { template_id: TemplateId },
    /// Freeform instance with explicitly supplied steps.
    Steps {
        lifecycle: LifecycleType,
        steps: Vec<StepBlueprint>,
    },
}

/// Request to start a workflow for one employee.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstantiateRequest {
    pub employee_id: EmployeeId,
    #[serde(flatten)]
    pub source: StepSource,
    pub start_date: NaiveDate,
    #[serde(default)]
    pub expected_completion: Option<NaiveDate>,
    /// Human roles on this run, e.g. `buddy` or `manager`, mapped to a person.
    #[serde(default)]
    pub assignments: BTreeMap<String, String>,
}

/// One concrete workflow run for one employee.
///
/// `percentage`, `status` and `stage` are derived from the steps on every
/// mutation; nothing outside the engine's recompute writes them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: InstanceId,
    pub employee_id: EmployeeId,
    pub template_id: Option<TemplateId>,
    pub lifecycle: LifecycleType,
    pub stage: String,
    pub status: InstanceStatus,
    pub percentage: u8,
    pub start_date: NaiveDate,
    pub expected_completion: Option<NaiveDate>,
    pub actual_completion: Option<NaiveDate>,
    pub assignments: BTreeMap<String, String>,
    pub created_by: Actor,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub cancelled_by: Option<Actor>,
    pub cancel_reason: Option<String>,
}

/// A step belonging to exactly one workflow instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: StepId,
    pub instance_id: InstanceId,
    pub blueprint_id: Option<String>,
    pub order_index: u32,
    pub title: String,
    pub category: String,
    pub kind: StepKind,
    pub integration: Option<IntegrationKind>,
    pub status: StepStatus,
    pub prerequisites: Vec<StepId>,
    pub assignee: Option<String>,
    pub due_date: Option<NaiveDate>,
    pub mandatory: bool,
    pub max_attempts: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub completed_by: Option<Actor>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowStep {
    pub fn is_integration(&self) -> bool {
        self.kind == StepKind::Integration
    }
}

/// One externally actioned request for an integration step, with its retry budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationAttempt {
    pub id: AttemptId,
    pub instance_id: InstanceId,
    pub step_id: StepId,
    pub kind: IntegrationKind,
    pub correlation_id: Option<String>,
    pub status: AttemptStatus,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Set while a failed attempt still has budget left.
    pub next_retry_at: Option<DateTime<Utc>>,
    pub request_payload: Option<serde_json::Value>,
    pub response_payload: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl IntegrationAttempt {
    pub fn is_exhausted(&self) -> bool {
        self.attempt_count >= self.max_attempts
    }

    /// Waiting for a network attempt, either the first one or a scheduled retry.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == AttemptStatus::Pending
            && !self.is_exhausted()
            && self.next_retry_at.map_or(true, |at| at <= now)
    }
}

/// A recorded anomaly that requires human attention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowException {
    pub id: ExceptionId,
    pub instance_id: InstanceId,
    pub step_id: Option<StepId>,
    pub kind: ExceptionKind,
    pub severity: Severity,
    pub status: ResolutionStatus,
    pub title: String,
    pub description: String,
    pub assignee: Option<String>,
    pub opened_by: Actor,
    pub opened_at: DateTime<Utc>,
    pub resolved_by: Option<Actor>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_notes: Option<String>,
}

/// Fields needed to open an exception.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewException {
    pub instance_id: InstanceId,
    #[serde(default)]
    pub step_id: Option<StepId>,
    pub kind: ExceptionKind,
    pub severity: Severity,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub assignee: Option<String>,
}

/// Request sent to an external integration provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRequest {
    pub kind: IntegrationKind,
    pub attempt_id: AttemptId,
    /// Attempt number (1-based) this request represents.
    pub attempt: u32,
    pub payload: serde_json::Value,
}

/// Successful provider response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderResponse {
    pub correlation_id: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}
