use serde::Serialize;

use crate::types::{
    Actor, AttemptId, EmployeeId, ExceptionId, ExceptionKind, InstanceId, InstanceStatus,
    IntegrationKind, ResolutionStatus, Severity, StepId, StepStatus,
};

/// Engine events, published after the mutation that caused them has committed.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// A workflow instance was created.
    InstanceCreated {
        instance_id: InstanceId,
        employee_id: EmployeeId,
        step_count: usize,
        actor: Actor,
    },
    /// A step changed status.
    StepTransitioned {
        instance_id: InstanceId,
        step_id: StepId,
        from: StepStatus,
        to: StepStatus,
        actor: Actor,
    },
    /// The derived instance status or percentage changed.
    InstanceStatusChanged {
        instance_id: InstanceId,
        status: InstanceStatus,
        percentage: u8,
    },
    /// The instance was cancelled by a human.
    InstanceCancelled {
        instance_id: InstanceId,
        actor: Actor,
        reason: String,
    },
    /// A network attempt was made against a provider.
    IntegrationAttempted {
        instance_id: InstanceId,
        step_id: StepId,
        attempt_id: AttemptId,
        kind: IntegrationKind,
        attempt: u32,
    },
    IntegrationSucceeded {
        instance_id: InstanceId,
        step_id: StepId,
        attempt_id: AttemptId,
        correlation_id: String,
    },
    /// A provider call failed; `exhausted` is true when no budget is left.
    IntegrationFailed {
        instance_id: InstanceId,
        step_id: StepId,
        attempt_id: AttemptId,
        error: String,
        exhausted: bool,
    },
    ExceptionOpened {
        exception_id: ExceptionId,
        instance_id: InstanceId,
        step_id: Option<StepId>,
        kind: ExceptionKind,
        severity: Severity,
    },
    /// An exception was resolved or dismissed by a human.
    ExceptionClosed {
        exception_id: ExceptionId,
        instance_id: InstanceId,
        status: ResolutionStatus,
        actor: Actor,
    },
}

impl WorkflowEvent {
    pub fn instance_id(&self) -> &InstanceId {
        match self {
            Self::InstanceCreated { instance_id, .. }
            | Self::StepTransitioned { instance_id, .. }
            | Self::InstanceStatusChanged { instance_id, .. }
            | Self::InstanceCancelled { instance_id, .. }
            | Self::IntegrationAttempted { instance_id, .. }
            | Self::IntegrationSucceeded { instance_id, .. }
            | Self::IntegrationFailed { instance_id, .. }
            | Self::ExceptionOpened { instance_id, .. }
            | Self::ExceptionClosed { instance_id, .. } => instance_id,
        }
    }
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Delivery is best-effort: a missing or lagging
    /// subscriber never affects the caller.
    pub fn publish(&self, event: WorkflowEvent) {
        let _ = self.tx.send(event);
    }

    pub fn publish_all(&self, events: impl IntoIterator<Item = WorkflowEvent>) {
        for event in events {
            self.publish(event);
        }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<WorkflowEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
