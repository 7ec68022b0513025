use chrono::{DateTime, NaiveDate, Utc};

use staffline_core::types::{
    Actor, InstanceStatus, StepStatus, WorkflowInstance, WorkflowStep,
};

use crate::progress::{aggregate, Progress};

/// Stage label once no step is left open.
pub const STAGE_COMPLETE: &str = "complete";

/// Apply a status change that has already been validated.
///
/// Entering `in_progress` stamps `started_at` the first time; entering any
/// terminal status stamps `completed_at` and the actor that closed the step.
pub fn apply_transition(step: &mut WorkflowStep, to: StepStatus, actor: &Actor, now: DateTime<Utc>) {
    step.status = to;
    step.updated_at = now;
    if to == StepStatus::InProgress && step.started_at.is_none() {
        step.started_at = Some(now);
    }
    if to.is_terminal() {
        step.completed_at = Some(now);
        step.completed_by = Some(actor.clone());
    }
}

/// Re-open a failed step for another round of work.
pub fn reopen(step: &mut WorkflowStep, now: DateTime<Utc>) {
    step.status = StepStatus::InProgress;
    step.updated_at = now;
    step.started_at = Some(now);
    step.completed_at = None;
    step.completed_by = None;
}

/// Category of the lowest-ordered step that is still open.
pub fn current_stage(steps: &[WorkflowStep]) -> String {
    steps
        .iter()
        .filter(|s| !s.status.is_terminal())
        .min_by_key(|s| s.order_index)
        .map(|s| s.category.clone())
        .unwrap_or_else(|| STAGE_COMPLETE.to_string())
}

/// Whether the instance has passed its expected completion date unfinished.
pub fn is_overdue(instance: &WorkflowInstance, status: InstanceStatus, today: NaiveDate) -> bool {
    status != InstanceStatus::Completed
        && instance
            .expected_completion
            .map_or(false, |expected| expected < today)
}

/// Rewrite every derived field of `instance` from its steps.
///
/// This is the only place percentage, status, stage and actual completion
/// are assigned. Cancelled instances are left untouched. Returns whether the
/// status or percentage changed.
pub fn recompute(
    instance: &mut WorkflowInstance,
    steps: &[WorkflowStep],
    today: NaiveDate,
    now: DateTime<Utc>,
) -> bool {
    if instance.status == InstanceStatus::Cancelled {
        return false;
    }

    let Progress {
        percentage, status, ..
    } = aggregate(steps);
    let status = if is_overdue(instance, status, today) {
        InstanceStatus::Overdue
    } else {
        status
    };

    let changed = instance.status != status || instance.percentage != percentage;
    instance.percentage = percentage;
    instance.status = status;
    instance.stage = current_stage(steps);
    instance.actual_completion = if status == InstanceStatus::Completed {
        Some(instance.actual_completion.unwrap_or(today))
    } else {
        None
    };
    instance.updated_at = now;
    changed
}
