use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use staffline_core::config::RetryConfig;
use staffline_core::error::{Result, StafflineError};
use staffline_core::event::{EventBus, WorkflowEvent};
use staffline_core::traits::{Clock, IntegrationProvider};
use staffline_core::types::*;
use staffline_store::{SqliteStore, StoreTx};

use crate::exceptions::{open_once_in_tx, opened_event};
use crate::manager::transition_in_tx;
use crate::retry::{calculate_backoff, write_with_retry};

/// Integration providers keyed by the kind of step they serve.
pub type ProviderMap = HashMap<IntegrationKind, Arc<dyn IntegrationProvider>>;

/// What a dispatch did.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// Nothing was sent: the instance is finished, the step moved on, or
    /// the attempt is not due.
    Skipped { reason: String },
    Succeeded { correlation_id: String },
    /// The provider failed and the attempt has budget left.
    RetryScheduled { next_retry_at: DateTime<Utc> },
    /// The provider failed on the last allowed attempt.
    Exhausted { exception_id: Option<ExceptionId> },
    /// A response arrived after the instance finished or the attempt was
    /// reclaimed; it was recorded but changed no step.
    Discarded { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct Dispatched {
    pub attempt: IntegrationAttempt,
    #[serde(flatten)]
    pub outcome: DispatchOutcome,
}

enum Claim {
    Skipped(IntegrationAttempt, String),
    Claimed(IntegrationAttempt, ProviderRequest),
}

/// Sends integration requests to external providers and records outcomes.
///
/// Fire-and-record: the attempt is claimed in one transaction, the provider
/// is called with no transaction open, and the outcome is applied in a
/// second transaction.
pub struct Dispatcher {
    store: Arc<SqliteStore>,
    event_bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    providers: ProviderMap,
    retry: RetryConfig,
    conflict_retries: u32,
}

impl Dispatcher {
    pub fn new(
        store: Arc<SqliteStore>,
        event_bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
        providers: ProviderMap,
        retry: RetryConfig,
        conflict_retries: u32,
    ) -> Self {
        Self {
            store,
            event_bus,
            clock,
            providers,
            retry,
            conflict_retries,
        }
    }

    /// Make one network attempt for `attempt_id` if it is due.
    ///
    /// Safe to call repeatedly: only a due attempt on a live instance whose
    /// step is `in_progress` is claimed, and claiming increments the attempt
    /// count exactly once.
    pub async fn dispatch(&self, attempt_id: &AttemptId) -> Result<Dispatched> {
        let now = self.clock.now();
        let claim = write_with_retry(&self.store, self.conflict_retries, |tx| {
            claim_in_tx(tx, attempt_id, now)
        })?;

        let (attempt, request) = match claim {
            Claim::Skipped(attempt, reason) => {
                debug!(attempt_id = %attempt_id, reason = %reason, "Dispatch skipped");
                return Ok(Dispatched {
                    attempt,
                    outcome: DispatchOutcome::Skipped { reason },
                });
            }
            Claim::Claimed(attempt, request) => (attempt, request),
        };

        info!(
            attempt_id = %attempt.id,
            step_id = %attempt.step_id,
            kind = %attempt.kind,
            attempt = attempt.attempt_count,
            max_attempts = attempt.max_attempts,
            "Dispatching integration request"
        );
        self.event_bus.publish(WorkflowEvent::IntegrationAttempted {
            instance_id: attempt.instance_id.clone(),
            step_id: attempt.step_id.clone(),
            attempt_id: attempt.id.clone(),
            kind: attempt.kind,
            attempt: attempt.attempt_count,
        });

        let result = self.call_provider(attempt.kind, request).await;
        self.record_outcome(&attempt.id, attempt.attempt_count, result)
    }

    /// Dispatch the unfinished attempt of an integration step.
    pub async fn dispatch_step(&self, step_id: &StepId) -> Result<Dispatched> {
        let attempt = self
            .store
            .read(|tx| tx.active_attempt_for_step(step_id))?
            .ok_or_else(|| StafflineError::AttemptNotFound(format!("no open attempt for step {}", step_id)))?;
        self.dispatch(&attempt.id).await
    }

    /// Count an attempt that was left `in_progress` without an outcome
    /// (the process died mid-call) as a failed network attempt.
    pub fn reclaim_stale(&self, attempt: &IntegrationAttempt) -> Result<Dispatched> {
        warn!(attempt_id = %attempt.id, last_attempt_at = ?attempt.last_attempt_at, "Reclaiming stale integration attempt");
        self.record_outcome(
            &attempt.id,
            attempt.attempt_count,
            Err(StafflineError::Provider {
                provider: attempt.kind.to_string(),
                message: "no response recorded before the attempt went stale".into(),
            }),
        )
    }

    async fn call_provider(
        &self,
        kind: IntegrationKind,
        request: ProviderRequest,
    ) -> Result<ProviderResponse> {
        let provider = self
            .providers
            .get(&kind)
            .cloned()
            .ok_or_else(|| StafflineError::ProviderNotConfigured(kind.to_string()))?;

        let timeout_secs = provider.timeout_secs();
        match tokio::time::timeout(Duration::from_secs(timeout_secs), provider.send(request)).await {
            Ok(result) => result,
            Err(_) => Err(StafflineError::ProviderTimeout {
                provider: provider.name().to_string(),
                timeout_secs,
            }),
        }
    }

    fn record_outcome(
        &self,
        attempt_id: &AttemptId,
        claimed_count: u32,
        result: Result<ProviderResponse>,
    ) -> Result<Dispatched> {
        let now = self.clock.now();
        let today = self.clock.today();

        let (dispatched, events) = write_with_retry(&self.store, self.conflict_retries, |tx| {
            let mut attempt = tx
                .get_attempt(attempt_id)?
                .ok_or_else(|| StafflineError::AttemptNotFound(attempt_id.to_string()))?;
            if attempt.status != AttemptStatus::InProgress || attempt.attempt_count != claimed_count {
                let reason = format!("attempt is {} at count {}", attempt.status, attempt.attempt_count);
                return Ok((
                    Dispatched {
                        attempt,
                        outcome: DispatchOutcome::Discarded { reason },
                    },
                    vec![],
                ));
            }

            let instance = tx
                .get_instance(&attempt.instance_id)?
                .ok_or_else(|| StafflineError::InstanceNotFound(attempt.instance_id.clone()))?;
            let mut events = Vec::new();

            if instance.status.is_terminal() {
                match &result {
                    Ok(resp) => {
                        attempt.status = AttemptStatus::Completed;
                        attempt.correlation_id = Some(resp.correlation_id.clone());
                        attempt.response_payload = Some(resp.payload.clone());
                    }
                    Err(e) => {
                        attempt.status = AttemptStatus::Failed;
                        attempt.error_message = Some(e.to_string());
                    }
                }
                attempt.next_retry_at = None;
                tx.update_attempt(&attempt)?;
                let reason = format!("instance is {}", instance.status);
                return Ok((
                    Dispatched {
                        attempt,
                        outcome: DispatchOutcome::Discarded { reason },
                    },
                    events,
                ));
            }

            let outcome = match &result {
                Ok(resp) => {
                    attempt.status = AttemptStatus::Completed;
                    attempt.correlation_id = Some(resp.correlation_id.clone());
                    attempt.response_payload = Some(resp.payload.clone());
                    attempt.error_message = None;
                    attempt.next_retry_at = None;
                    tx.update_attempt(&attempt)?;
                    events.push(WorkflowEvent::IntegrationSucceeded {
                        instance_id: attempt.instance_id.clone(),
                        step_id: attempt.step_id.clone(),
                        attempt_id: attempt.id.clone(),
                        correlation_id: resp.correlation_id.clone(),
                    });

                    self.move_step(tx, &attempt, StepStatus::Completed, now, today, &mut events)?;
                    DispatchOutcome::Succeeded {
                        correlation_id: resp.correlation_id.clone(),
                    }
                }
                Err(e) if !attempt.is_exhausted() => {
                    let next = now + calculate_backoff(attempt.attempt_count, &self.retry);
                    attempt.status = AttemptStatus::Pending;
                    attempt.error_message = Some(e.to_string());
                    attempt.next_retry_at = Some(next);
                    tx.update_attempt(&attempt)?;
                    events.push(failed_event(&attempt, e, false));
                    DispatchOutcome::RetryScheduled { next_retry_at: next }
                }
                Err(e) => {
                    attempt.status = AttemptStatus::Failed;
                    attempt.error_message = Some(e.to_string());
                    attempt.next_retry_at = None;
                    tx.update_attempt(&attempt)?;
                    events.push(failed_event(&attempt, e, true));

                    let mandatory =
                        self.move_step(tx, &attempt, StepStatus::Failed, now, today, &mut events)?;
                    let opened = open_once_in_tx(
                        tx,
                        NewException {
                            instance_id: attempt.instance_id.clone(),
                            step_id: Some(attempt.step_id.clone()),
                            kind: ExceptionKind::IntegrationFailure,
                            severity: if mandatory {
                                Severity::Critical
                            } else {
                                Severity::Medium
                            },
                            title: format!(
                                "{} failed after {} attempts",
                                attempt.kind, attempt.attempt_count
                            ),
                            description: e.to_string(),
                            assignee: None,
                        },
                        &Actor::system(),
                        now,
                    )?;
                    if let Some(exception) = &opened {
                        events.push(opened_event(exception));
                    }
                    DispatchOutcome::Exhausted {
                        exception_id: opened.map(|e| e.id),
                    }
                }
            };

            Ok((Dispatched { attempt, outcome }, events))
        })?;

        match &dispatched.outcome {
            DispatchOutcome::Succeeded { correlation_id } => {
                info!(attempt_id = %attempt_id, correlation_id = %correlation_id, "Integration succeeded")
            }
            DispatchOutcome::RetryScheduled { next_retry_at } => {
                warn!(attempt_id = %attempt_id, next_retry_at = %next_retry_at, "Integration failed, retry scheduled")
            }
            DispatchOutcome::Exhausted { .. } => {
                warn!(attempt_id = %attempt_id, attempts = dispatched.attempt.attempt_count, "Integration attempts exhausted")
            }
            DispatchOutcome::Discarded { reason } => {
                debug!(attempt_id = %attempt_id, reason = %reason, "Integration outcome discarded")
            }
            DispatchOutcome::Skipped { .. } => {}
        }
        self.event_bus.publish_all(events);
        Ok(dispatched)
    }

    /// Move the attempt's step as the system. Returns whether the step is
    /// mandatory. A step that has moved on in the meantime is left alone.
    fn move_step(
        &self,
        tx: &StoreTx<'_>,
        attempt: &IntegrationAttempt,
        to: StepStatus,
        now: DateTime<Utc>,
        today: chrono::NaiveDate,
        events: &mut Vec<WorkflowEvent>,
    ) -> Result<bool> {
        let system = Actor::system();
        match transition_in_tx(tx, &attempt.instance_id, &attempt.step_id, to, &system, now, today) {
            Ok(t) => {
                events.extend(t.events);
                Ok(t.step.mandatory)
            }
            Err(e) if e.is_precondition() => {
                warn!(step_id = %attempt.step_id, to = %to, error = %e, "Step not moved after integration outcome");
                let mandatory = tx
                    .steps_for(&attempt.instance_id)?
                    .into_iter()
                    .find(|s| s.id == attempt.step_id)
                    .map_or(true, |s| s.mandatory);
                Ok(mandatory)
            }
            Err(e) => Err(e),
        }
    }
}

fn claim_in_tx(tx: &StoreTx<'_>, attempt_id: &AttemptId, now: DateTime<Utc>) -> Result<Claim> {
    let mut attempt = tx
        .get_attempt(attempt_id)?
        .ok_or_else(|| StafflineError::AttemptNotFound(attempt_id.to_string()))?;
    let instance = tx
        .get_instance(&attempt.instance_id)?
        .ok_or_else(|| StafflineError::InstanceNotFound(attempt.instance_id.clone()))?;
    if instance.status.is_terminal() {
        let reason = format!("instance is {}", instance.status);
        return Ok(Claim::Skipped(attempt, reason));
    }

    let steps = tx.steps_for(&instance.id)?;
    let step = steps
        .iter()
        .find(|s| s.id == attempt.step_id)
        .ok_or_else(|| StafflineError::StepNotFound {
            instance: instance.id.clone(),
            step: attempt.step_id.clone(),
        })?;
    if step.status != StepStatus::InProgress {
        let reason = format!("step is {}", step.status);
        return Ok(Claim::Skipped(attempt, reason));
    }
    if !attempt.is_due(now) {
        let reason = if attempt.status != AttemptStatus::Pending {
            format!("attempt is {}", attempt.status)
        } else if attempt.is_exhausted() {
            "attempt budget exhausted".to_string()
        } else {
            match attempt.next_retry_at {
                Some(at) => format!("retry not due until {}", at.to_rfc3339()),
                None => "attempt not due".to_string(),
            }
        };
        return Ok(Claim::Skipped(attempt, reason));
    }

    attempt.attempt_count += 1;
    attempt.status = AttemptStatus::InProgress;
    attempt.last_attempt_at = Some(now);
    attempt.next_retry_at = None;
    let payload = request_payload(&instance, step, &attempt);
    attempt.request_payload = Some(payload.clone());
    tx.update_attempt(&attempt)?;

    let request = ProviderRequest {
        kind: attempt.kind,
        attempt_id: attempt.id.clone(),
        attempt: attempt.attempt_count,
        payload,
    };
    Ok(Claim::Claimed(attempt, request))
}

fn request_payload(
    instance: &WorkflowInstance,
    step: &WorkflowStep,
    attempt: &IntegrationAttempt,
) -> serde_json::Value {
    serde_json::json!({
        "instance_id": instance.id,
        "employee_id": instance.employee_id,
        "lifecycle": instance.lifecycle,
        "step_id": step.id,
        "step_key": step.blueprint_id,
        "title": step.title,
        "assignee": step.assignee,
        "due_date": step.due_date,
        "attempt": attempt.attempt_count,
    })
}

fn failed_event(attempt: &IntegrationAttempt, error: &StafflineError, exhausted: bool) -> WorkflowEvent {
    WorkflowEvent::IntegrationFailed {
        instance_id: attempt.instance_id.clone(),
        step_id: attempt.step_id.clone(),
        attempt_id: attempt.id.clone(),
        error: error.to_string(),
        exhausted,
    }
}
