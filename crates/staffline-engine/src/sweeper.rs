use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cron::Schedule;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use staffline_core::config::SweeperConfig;
use staffline_core::error::{Result, StafflineError};
use staffline_core::event::{EventBus, WorkflowEvent};
use staffline_core::traits::Clock;
use staffline_core::types::*;
use staffline_store::{InstanceFilter, SqliteStore};

use crate::dispatcher::{DispatchOutcome, Dispatcher};
use crate::exceptions::{open_once_in_tx, opened_event};
use crate::manager::status_event;
use crate::retry::write_with_retry;
use crate::transition::recompute;

/// Upper bound on retries fired by a single sweep.
const MAX_DUE_PER_SWEEP: usize = 200;

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Due attempts that produced a network call.
    pub retried: usize,
    /// Stale in-flight attempts counted as failures.
    pub reclaimed: usize,
    /// Live instances currently flagged overdue.
    pub overdue_instances: usize,
    pub exceptions_opened: usize,
}

/// Background maintenance: due retries, stale attempts, and overdue flags.
pub struct Sweeper {
    store: Arc<SqliteStore>,
    event_bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    dispatcher: Arc<Dispatcher>,
    config: SweeperConfig,
    conflict_retries: u32,
}

impl Sweeper {
    pub fn new(
        store: Arc<SqliteStore>,
        event_bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
        dispatcher: Arc<Dispatcher>,
        config: SweeperConfig,
        conflict_retries: u32,
    ) -> Self {
        Self {
            store,
            event_bus,
            clock,
            dispatcher,
            config,
            conflict_retries,
        }
    }

    /// Run one sweep. A failure on one attempt or instance is logged and
    /// does not stop the rest of the sweep.
    pub async fn sweep_once(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let now = self.clock.now();

        let due = self
            .store
            .read(|tx| tx.due_attempts(now, MAX_DUE_PER_SWEEP))?;
        for attempt in due {
            match self.dispatcher.dispatch(&attempt.id).await {
                Ok(d) => {
                    if matches!(
                        d.outcome,
                        DispatchOutcome::Succeeded { .. }
                            | DispatchOutcome::RetryScheduled { .. }
                            | DispatchOutcome::Exhausted { .. }
                    ) {
                        report.retried += 1;
                    }
                    if matches!(d.outcome, DispatchOutcome::Exhausted { exception_id: Some(_) }) {
                        report.exceptions_opened += 1;
                    }
                }
                Err(e) => warn!(attempt_id = %attempt.id, error = %e, "Retry dispatch failed"),
            }
        }

        let stale_before = now - chrono::Duration::seconds(self.config.stale_attempt_secs as i64);
        let stale = self.store.read(|tx| tx.stale_attempts(stale_before))?;
        for attempt in stale {
            match self.dispatcher.reclaim_stale(&attempt) {
                Ok(d) => {
                    if !matches!(d.outcome, DispatchOutcome::Discarded { .. }) {
                        report.reclaimed += 1;
                    }
                    if matches!(d.outcome, DispatchOutcome::Exhausted { exception_id: Some(_) }) {
                        report.exceptions_opened += 1;
                    }
                }
                Err(e) => warn!(attempt_id = %attempt.id, error = %e, "Reclaiming stale attempt failed"),
            }
        }

        let live = self.store.read(|tx| {
            tx.list_instances(&InstanceFilter {
                active_only: true,
                ..Default::default()
            })
        })?;
        for instance in live {
            match self.refresh_deadlines(&instance.id) {
                Ok((overdue, opened)) => {
                    if overdue {
                        report.overdue_instances += 1;
                    }
                    report.exceptions_opened += opened;
                }
                Err(e) => warn!(instance_id = %instance.id, error = %e, "Deadline refresh failed"),
            }
        }

        info!(
            retried = report.retried,
            reclaimed = report.reclaimed,
            overdue = report.overdue_instances,
            exceptions = report.exceptions_opened,
            "Sweep finished"
        );
        Ok(report)
    }

    /// Re-derive the overdue flag of one instance and open `timeout`
    /// exceptions for the instance and each late step, once each.
    fn refresh_deadlines(&self, instance_id: &InstanceId) -> Result<(bool, usize)> {
        let now = self.clock.now();
        let today = self.clock.today();

        let (overdue, events) = write_with_retry(&self.store, self.conflict_retries, |tx| {
            let mut instance = tx
                .get_instance(instance_id)?
                .ok_or_else(|| StafflineError::InstanceNotFound(instance_id.clone()))?;
            if instance.status.is_terminal() {
                return Ok((false, vec![]));
            }
            let steps = tx.steps_for(instance_id)?;
            let mut events = Vec::new();

            if recompute(&mut instance, &steps, today, now) {
                tx.update_instance(&instance)?;
                events.push(status_event(&instance));
            }
            let overdue = instance.status == InstanceStatus::Overdue;

            if overdue {
                let expected = instance
                    .expected_completion
                    .map(|d| d.to_string())
                    .unwrap_or_default();
                let new = NewException {
                    instance_id: instance_id.clone(),
                    step_id: None,
                    kind: ExceptionKind::Timeout,
                    severity: Severity::High,
                    title: format!("{} workflow is overdue", instance.lifecycle),
                    description: format!(
                        "Expected completion {} passed at {}% complete",
                        expected, instance.percentage
                    ),
                    assignee: None,
                };
                if let Some(e) = open_once_in_tx(tx, new, &Actor::system(), now)? {
                    events.push(opened_event(&e));
                }
            }

            for step in steps
                .iter()
                .filter(|s| !s.status.is_terminal() && s.due_date.map_or(false, |d| d < today))
            {
                let new = NewException {
                    instance_id: instance_id.clone(),
                    step_id: Some(step.id.clone()),
                    kind: ExceptionKind::Timeout,
                    severity: if step.mandatory {
                        Severity::Medium
                    } else {
                        Severity::Low
                    },
                    title: format!("Step '{}' is past due", step.title),
                    description: format!(
                        "Due {} and still {}",
                        step.due_date.map(|d| d.to_string()).unwrap_or_default(),
                        step.status
                    ),
                    assignee: step.assignee.clone(),
                };
                if let Some(e) = open_once_in_tx(tx, new, &Actor::system(), now)? {
                    events.push(opened_event(&e));
                }
            }
            Ok((overdue, events))
        })?;

        let opened = events
            .iter()
            .filter(|e| matches!(e, WorkflowEvent::ExceptionOpened { .. }))
            .count();
        self.event_bus.publish_all(events);
        Ok((overdue, opened))
    }

    /// Run sweeps on the configured cron schedule until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        if !self.config.enabled {
            info!("Sweeper disabled");
            cancel.cancelled().await;
            return;
        }
        let schedule = match Schedule::from_str(&self.config.schedule) {
            Ok(s) => s,
            Err(e) => {
                warn!(schedule = %self.config.schedule, error = %e, "Invalid sweep schedule, sweeper idle");
                cancel.cancelled().await;
                return;
            }
        };
        info!(schedule = %self.config.schedule, "Sweeper started");

        loop {
            let Some(fire_at) = schedule.upcoming(Utc).next() else {
                cancel.cancelled().await;
                break;
            };
            let delay = (fire_at - Utc::now())
                .to_std()
                .unwrap_or(Duration::from_secs(1));

            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    if let Err(e) = self.sweep_once().await {
                        error!(error = %e, "Sweep failed");
                    }
                }
                _ = cancel.cancelled() => {
                    info!("Sweeper shutting down");
                    break;
                }
            }
        }
    }
}
