use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use staffline_core::config::{AppConfig, DispatchMode};
use staffline_core::error::{Result, StafflineError};
use staffline_core::event::{EventBus, WorkflowEvent};
use staffline_core::traits::Clock;
use staffline_core::types::*;
use staffline_store::{InstanceFilter, SqliteStore, StoreTx};

use crate::dispatcher::Dispatcher;
use crate::exceptions::{open_once_in_tx, opened_event};
use crate::resolver::{self, validate_blueprints};
use crate::retry::write_with_retry;
use crate::transition::{apply_transition, recompute, reopen};

/// An instance with its steps in order.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceDetail {
    pub instance: WorkflowInstance,
    pub steps: Vec<WorkflowStep>,
}

impl InstanceDetail {
    pub fn step(&self, id: &StepId) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| &s.id == id)
    }

    /// Look a step up by the blueprint id it was cloned from.
    pub fn step_by_blueprint(&self, blueprint_id: &str) -> Option<&WorkflowStep> {
        self.steps
            .iter()
            .find(|s| s.blueprint_id.as_deref() == Some(blueprint_id))
    }
}

/// Result of a successful step transition.
#[derive(Debug, Clone, Serialize)]
pub struct StepTransition {
    pub instance: WorkflowInstance,
    pub step: WorkflowStep,
    /// The integration attempt opened or reused when an integration step
    /// entered `in_progress`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<IntegrationAttempt>,
}

/// A transition applied inside a transaction, with the events to publish
/// once it commits.
pub(crate) struct Transitioned {
    pub instance: WorkflowInstance,
    pub step: WorkflowStep,
    pub events: Vec<WorkflowEvent>,
}

enum TransitionAttempt {
    Applied(Transitioned, Option<IntegrationAttempt>),
    /// Rejected, but an exception describing the broken definition was recorded.
    Rejected(StafflineError, Option<WorkflowException>),
}

/// Creates workflow instances and drives their steps.
///
/// Every mutation re-derives the instance's percentage, status and stage in
/// the same transaction as the step change.
pub struct InstanceManager {
    store: Arc<SqliteStore>,
    event_bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    config: Arc<AppConfig>,
    dispatcher: Arc<Dispatcher>,
}

impl InstanceManager {
    pub fn new(
        store: Arc<SqliteStore>,
        event_bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
        config: Arc<AppConfig>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            store,
            event_bus,
            clock,
            config,
            dispatcher,
        }
    }

    fn retries(&self) -> u32 {
        self.config.engine.conflict_retries
    }

    /// Start a workflow for one employee from a published template or an
    /// explicit list of steps.
    pub fn instantiate(&self, req: InstantiateRequest, actor: &Actor) -> Result<InstanceDetail> {
        let now = self.clock.now();
        let today = self.clock.today();

        let (detail, changed) = write_with_retry(&self.store, self.retries(), |tx| {
            let (template_id, lifecycle, blueprints) = match &req.source {
                StepSource::Template { template_id } => {
                    let t = tx
                        .get_template(template_id)?
                        .ok_or_else(|| StafflineError::TemplateNotFound(template_id.clone()))?;
                    if t.state != TemplateState::Published {
                        return Err(StafflineError::TemplateNotInstantiable {
                            id: t.id,
                            state: t.state,
                        });
                    }
                    (Some(t.id), t.lifecycle, t.steps)
                }
                StepSource::Steps { lifecycle, steps } => (None, *lifecycle, steps.clone()),
            };
            validate_blueprints(&blueprints)?;

            let instance_id = InstanceId::new();
            let steps = self.build_steps(&instance_id, &req, &blueprints, now);
            let expected_completion = req
                .expected_completion
                .or_else(|| steps.iter().filter_map(|s| s.due_date).max());

            let mut instance = WorkflowInstance {
                id: instance_id,
                employee_id: req.employee_id.clone(),
                template_id,
                lifecycle,
                stage: String::new(),
                status: InstanceStatus::NotStarted,
                percentage: 0,
                start_date: req.start_date,
                expected_completion,
                actual_completion: None,
                assignments: req.assignments.clone(),
                created_by: actor.clone(),
                created_at: now,
                updated_at: now,
                cancelled_by: None,
                cancel_reason: None,
            };
            let changed = recompute(&mut instance, &steps, today, now);

            tx.insert_instance(&instance)?;
            tx.insert_steps(&steps)?;
            Ok((InstanceDetail { instance, steps }, changed))
        })?;

        info!(
            instance_id = %detail.instance.id,
            employee_id = %detail.instance.employee_id,
            steps = detail.steps.len(),
            "Workflow instance created"
        );
        self.event_bus.publish(WorkflowEvent::InstanceCreated {
            instance_id: detail.instance.id.clone(),
            employee_id: detail.instance.employee_id.clone(),
            step_count: detail.steps.len(),
            actor: actor.clone(),
        });
        if changed {
            self.event_bus.publish(status_event(&detail.instance));
        }
        Ok(detail)
    }

    /// Clone blueprints into concrete steps, translating blueprint
    /// prerequisites into step ids.
    fn build_steps(
        &self,
        instance_id: &InstanceId,
        req: &InstantiateRequest,
        blueprints: &[StepBlueprint],
        now: DateTime<Utc>,
    ) -> Vec<WorkflowStep> {
        let ids: HashMap<&str, StepId> = blueprints
            .iter()
            .map(|bp| (bp.id.as_str(), StepId::new()))
            .collect();

        blueprints
            .iter()
            .enumerate()
            .map(|(index, bp)| WorkflowStep {
                id: ids[bp.id.as_str()].clone(),
                instance_id: instance_id.clone(),
                blueprint_id: Some(bp.id.clone()),
                order_index: index as u32,
                title: bp.title.clone(),
                category: bp.category.clone(),
                kind: bp.kind,
                integration: bp.integration,
                status: StepStatus::Pending,
                prerequisites: bp
                    .prerequisites
                    .iter()
                    .filter_map(|p| ids.get(p.as_str()).cloned())
                    .collect(),
                assignee: bp
                    .default_assignee_role
                    .as_ref()
                    .map(|role| req.assignments.get(role).cloned().unwrap_or_else(|| role.clone())),
                due_date: req
                    .start_date
                    .checked_add_signed(Duration::days(bp.due_day_offset)),
                mandatory: bp.mandatory,
                max_attempts: (bp.kind == StepKind::Integration)
                    .then(|| self.config.max_attempts_for(bp.max_attempts)),
                started_at: None,
                completed_at: None,
                completed_by: None,
                updated_at: now,
            })
            .collect()
    }

    /// Move one step to a new status.
    ///
    /// Fails without mutating anything when the transition is illegal, the
    /// instance is finished, or a prerequisite is not completed. A
    /// prerequisite naming an unknown step additionally records a
    /// `validation_error` exception.
    pub async fn transition_step(
        &self,
        instance_id: &InstanceId,
        step_id: &StepId,
        to: StepStatus,
        actor: &Actor,
    ) -> Result<StepTransition> {
        let now = self.clock.now();
        let today = self.clock.today();
        let default_max = self.config.engine.default_max_attempts;

        let outcome = write_with_retry(&self.store, self.retries(), |tx| {
            match transition_in_tx(tx, instance_id, step_id, to, actor, now, today) {
                Ok(t) => {
                    let attempt = if t.step.is_integration() && to == StepStatus::InProgress {
                        Some(ensure_attempt(tx, &t.step, default_max, now)?)
                    } else {
                        None
                    };
                    Ok(TransitionAttempt::Applied(t, attempt))
                }
                Err(StafflineError::DependencyNotMet {
                    step,
                    unmet,
                    missing,
                }) if !missing.is_empty() => {
                    let opened = open_once_in_tx(
                        tx,
                        misconfigured_exception(instance_id, &step, &missing),
                        &Actor::system(),
                        now,
                    )?;
                    Ok(TransitionAttempt::Rejected(
                        StafflineError::DependencyNotMet {
                            step,
                            unmet,
                            missing,
                        },
                        opened,
                    ))
                }
                Err(e) => Err(e),
            }
        });

        let (transitioned, attempt) = match outcome {
            Ok(TransitionAttempt::Applied(t, attempt)) => (t, attempt),
            Ok(TransitionAttempt::Rejected(err, opened)) => {
                if let Some(e) = &opened {
                    self.event_bus.publish(opened_event(e));
                }
                warn!(instance_id = %instance_id, step_id = %step_id, error = %err, "Step has unknown prerequisites");
                return Err(err);
            }
            Err(e) => {
                debug!(instance_id = %instance_id, step_id = %step_id, to = %to, error = %e, "Transition rejected");
                return Err(e);
            }
        };

        info!(
            instance_id = %instance_id,
            step_id = %step_id,
            to = %to,
            actor = %actor,
            percentage = transitioned.instance.percentage,
            "Step transitioned"
        );
        self.event_bus.publish_all(transitioned.events);

        let result = StepTransition {
            instance: transitioned.instance,
            step: transitioned.step,
            attempt,
        };
        self.after_attempt_opened(result).await
    }

    /// Re-open a failed integration step with a fresh attempt budget.
    ///
    /// Exceptions opened for earlier failures stay open.
    pub async fn retry_step(
        &self,
        instance_id: &InstanceId,
        step_id: &StepId,
        actor: &Actor,
    ) -> Result<StepTransition> {
        let now = self.clock.now();
        let today = self.clock.today();
        let default_max = self.config.engine.default_max_attempts;

        let (transitioned, attempt) = write_with_retry(&self.store, self.retries(), |tx| {
            let (mut instance, mut steps, idx) = load_for_update(tx, instance_id, step_id)?;
            let from = steps[idx].status;
            if from != StepStatus::Failed || !steps[idx].is_integration() {
                return Err(StafflineError::IllegalTransition {
                    step: step_id.clone(),
                    from,
                    to: StepStatus::InProgress,
                });
            }
            if let Some(err) = resolver::check(&steps[idx], &steps).into_error(step_id) {
                return Err(err);
            }

            reopen(&mut steps[idx], now);
            tx.update_step(&steps[idx])?;
            let attempt = new_attempt(&steps[idx], default_max, now)?;
            tx.insert_attempt(&attempt)?;

            let before = (instance.status, instance.percentage);
            recompute(&mut instance, &steps, today, now);
            tx.update_instance(&instance)?;

            let mut events = vec![WorkflowEvent::StepTransitioned {
                instance_id: instance_id.clone(),
                step_id: step_id.clone(),
                from,
                to: StepStatus::InProgress,
                actor: actor.clone(),
            }];
            if before != (instance.status, instance.percentage) {
                events.push(status_event(&instance));
            }
            let step = steps.swap_remove(idx);
            Ok((Transitioned { instance, step, events }, attempt))
        })?;

        info!(instance_id = %instance_id, step_id = %step_id, actor = %actor, "Integration step re-opened");
        self.event_bus.publish_all(transitioned.events);

        let result = StepTransition {
            instance: transitioned.instance,
            step: transitioned.step,
            attempt: Some(attempt),
        };
        self.after_attempt_opened(result).await
    }

    /// Kick off the first network attempt for a freshly opened attempt.
    async fn after_attempt_opened(&self, result: StepTransition) -> Result<StepTransition> {
        let Some(attempt) = result.attempt.as_ref().filter(|a| a.status == AttemptStatus::Pending) else {
            return Ok(result);
        };
        let attempt_id = attempt.id.clone();

        match self.config.engine.dispatch_mode {
            DispatchMode::Background => {
                let dispatcher = self.dispatcher.clone();
                tokio::spawn(async move {
                    if let Err(e) = dispatcher.dispatch(&attempt_id).await {
                        warn!(attempt_id = %attempt_id, error = %e, "Background dispatch failed");
                    }
                });
                Ok(result)
            }
            DispatchMode::Inline => {
                let dispatched = self.dispatcher.dispatch(&attempt_id).await?;
                let detail = self.get(&result.instance.id)?;
                let step = detail
                    .step(&result.step.id)
                    .cloned()
                    .unwrap_or(result.step);
                Ok(StepTransition {
                    instance: detail.instance,
                    step,
                    attempt: Some(dispatched.attempt),
                })
            }
        }
    }

    /// Cancel an instance. Cancelling twice is a no-op.
    pub fn cancel(&self, instance_id: &InstanceId, actor: &Actor, reason: &str) -> Result<WorkflowInstance> {
        let now = self.clock.now();
        let (instance, changed) = write_with_retry(&self.store, self.retries(), |tx| {
            let mut instance = tx
                .get_instance(instance_id)?
                .ok_or_else(|| StafflineError::InstanceNotFound(instance_id.clone()))?;
            match instance.status {
                InstanceStatus::Cancelled => return Ok((instance, false)),
                InstanceStatus::Completed => {
                    return Err(StafflineError::InstanceTerminal {
                        instance: instance_id.clone(),
                        status: instance.status,
                    })
                }
                _ => {}
            }
            instance.status = InstanceStatus::Cancelled;
            instance.cancelled_by = Some(actor.clone());
            instance.cancel_reason = Some(reason.to_string());
            instance.updated_at = now;
            tx.update_instance(&instance)?;
            Ok((instance, true))
        })?;

        if changed {
            info!(instance_id = %instance_id, actor = %actor, reason, "Workflow instance cancelled");
            self.event_bus.publish(WorkflowEvent::InstanceCancelled {
                instance_id: instance_id.clone(),
                actor: actor.clone(),
                reason: reason.to_string(),
            });
            self.event_bus.publish(status_event(&instance));
        }
        Ok(instance)
    }

    pub fn get(&self, instance_id: &InstanceId) -> Result<InstanceDetail> {
        self.store.read(|tx| {
            let instance = tx
                .get_instance(instance_id)?
                .ok_or_else(|| StafflineError::InstanceNotFound(instance_id.clone()))?;
            let steps = tx.steps_for(instance_id)?;
            Ok(InstanceDetail { instance, steps })
        })
    }

    pub fn list(&self, filter: &InstanceFilter) -> Result<Vec<WorkflowInstance>> {
        self.store.read(|tx| tx.list_instances(filter))
    }

    pub fn for_employee(&self, employee_id: &EmployeeId) -> Result<Vec<WorkflowInstance>> {
        self.list(&InstanceFilter {
            employee_id: Some(employee_id.clone()),
            ..Default::default()
        })
    }

    /// Integration attempts recorded for one step, oldest first.
    pub fn attempts(&self, instance_id: &InstanceId, step_id: &StepId) -> Result<Vec<IntegrationAttempt>> {
        self.store.read(|tx| {
            let steps = tx.steps_for(instance_id)?;
            if !steps.iter().any(|s| &s.id == step_id) {
                return Err(StafflineError::StepNotFound {
                    instance: instance_id.clone(),
                    step: step_id.clone(),
                });
            }
            tx.attempts_for_step(step_id)
        })
    }
}

/// Load an instance that may still change, its steps, and the index of one step.
pub(crate) fn load_for_update(
    tx: &StoreTx<'_>,
    instance_id: &InstanceId,
    step_id: &StepId,
) -> Result<(WorkflowInstance, Vec<WorkflowStep>, usize)> {
    let instance = tx
        .get_instance(instance_id)?
        .ok_or_else(|| StafflineError::InstanceNotFound(instance_id.clone()))?;
    if instance.status.is_terminal() {
        return Err(StafflineError::InstanceTerminal {
            instance: instance_id.clone(),
            status: instance.status,
        });
    }
    let steps = tx.steps_for(instance_id)?;
    let idx = steps
        .iter()
        .position(|s| &s.id == step_id)
        .ok_or_else(|| StafflineError::StepNotFound {
            instance: instance_id.clone(),
            step: step_id.clone(),
        })?;
    Ok((instance, steps, idx))
}

/// Validate and apply one step transition, then recompute the instance.
///
/// All checks run before the first write, so an error leaves the
/// transaction untouched.
pub(crate) fn transition_in_tx(
    tx: &StoreTx<'_>,
    instance_id: &InstanceId,
    step_id: &StepId,
    to: StepStatus,
    actor: &Actor,
    now: DateTime<Utc>,
    today: NaiveDate,
) -> Result<Transitioned> {
    let (mut instance, mut steps, idx) = load_for_update(tx, instance_id, step_id)?;

    let from = steps[idx].status;
    if !from.can_transition_to(to) {
        return Err(StafflineError::IllegalTransition {
            step: step_id.clone(),
            from,
            to,
        });
    }
    if to.requires_eligibility() {
        if let Some(err) = resolver::check(&steps[idx], &steps).into_error(step_id) {
            return Err(err);
        }
    }

    apply_transition(&mut steps[idx], to, actor, now);
    tx.update_step(&steps[idx])?;
    if steps[idx].is_integration() {
        close_open_attempt(tx, &steps[idx], actor, now)?;
    }

    let before = (instance.status, instance.percentage);
    recompute(&mut instance, &steps, today, now);
    tx.update_instance(&instance)?;

    let mut events = vec![WorkflowEvent::StepTransitioned {
        instance_id: instance_id.clone(),
        step_id: step_id.clone(),
        from,
        to,
        actor: actor.clone(),
    }];
    if before != (instance.status, instance.percentage) {
        events.push(status_event(&instance));
    }

    let step = steps.swap_remove(idx);
    Ok(Transitioned {
        instance,
        step,
        events,
    })
}

/// Finish the step's pending or in-flight attempt once the step leaves the
/// path to a network call. A `blocked` step keeps its attempt for when it
/// resumes.
///
/// A provider response arriving later for a closed attempt is discarded.
fn close_open_attempt(
    tx: &StoreTx<'_>,
    step: &WorkflowStep,
    actor: &Actor,
    now: DateTime<Utc>,
) -> Result<()> {
    let closed_as = match step.status {
        StepStatus::Completed => AttemptStatus::Completed,
        StepStatus::Skipped | StepStatus::Failed => AttemptStatus::Failed,
        _ => return Ok(()),
    };
    let Some(mut attempt) = tx.active_attempt_for_step(&step.id)? else {
        return Ok(());
    };
    debug!(
        attempt_id = %attempt.id,
        step_id = %step.id,
        status = %closed_as,
        "Closing attempt of a step moved by hand"
    );
    attempt.status = closed_as;
    attempt.next_retry_at = None;
    attempt.error_message = Some(format!("step {} by {} at {}", step.status, actor, now.to_rfc3339()));
    tx.update_attempt(&attempt)
}

/// The step's unfinished attempt, or a fresh one.
fn ensure_attempt(
    tx: &StoreTx<'_>,
    step: &WorkflowStep,
    default_max: u32,
    now: DateTime<Utc>,
) -> Result<IntegrationAttempt> {
    if let Some(active) = tx.active_attempt_for_step(&step.id)? {
        return Ok(active);
    }
    let attempt = new_attempt(step, default_max, now)?;
    tx.insert_attempt(&attempt)?;
    Ok(attempt)
}

fn new_attempt(step: &WorkflowStep, default_max: u32, now: DateTime<Utc>) -> Result<IntegrationAttempt> {
    let kind = step.integration.ok_or_else(|| {
        StafflineError::InvalidDefinition(format!(
            "integration step {} has no integration kind",
            step.id
        ))
    })?;
    Ok(IntegrationAttempt {
        id: AttemptId::new(),
        instance_id: step.instance_id.clone(),
        step_id: step.id.clone(),
        kind,
        correlation_id: None,
        status: AttemptStatus::Pending,
        attempt_count: 0,
        max_attempts: step.max_attempts.unwrap_or(default_max).max(1),
        last_attempt_at: None,
        next_retry_at: None,
        request_payload: None,
        response_payload: None,
        error_message: None,
        created_at: now,
    })
}

fn misconfigured_exception(instance_id: &InstanceId, step: &StepId, missing: &[StepId]) -> NewException {
    let names = missing
        .iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    NewException {
        instance_id: instance_id.clone(),
        step_id: Some(step.clone()),
        kind: ExceptionKind::ValidationError,
        severity: Severity::High,
        title: format!("Step {} references unknown prerequisites", step),
        description: format!("Prerequisites not found in this workflow: {}", names),
        assignee: None,
    }
}

pub(crate) fn status_event(instance: &WorkflowInstance) -> WorkflowEvent {
    WorkflowEvent::InstanceStatusChanged {
        instance_id: instance.id.clone(),
        status: instance.status,
        percentage: instance.percentage,
    }
}
