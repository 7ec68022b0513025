use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use staffline_core::error::{Result, StafflineError};
use staffline_core::event::{EventBus, WorkflowEvent};
use staffline_core::traits::Clock;
use staffline_core::types::*;
use staffline_store::{ExceptionFilter, SqliteStore, StoreTx};

use crate::retry::write_with_retry;

/// Records anomalies that need a human, and their resolution.
///
/// Exceptions never close on their own: only `resolve` or `dismiss`,
/// called with an actor, ends one.
pub struct ExceptionTracker {
    store: Arc<SqliteStore>,
    event_bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    conflict_retries: u32,
}

impl ExceptionTracker {
    pub fn new(
        store: Arc<SqliteStore>,
        event_bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
        conflict_retries: u32,
    ) -> Self {
        Self {
            store,
            event_bus,
            clock,
            conflict_retries,
        }
    }

    /// Open a new exception in `open` state.
    pub fn open(&self, new: NewException, actor: &Actor) -> Result<WorkflowException> {
        let now = self.clock.now();
        let exception = write_with_retry(&self.store, self.conflict_retries, |tx| {
            open_in_tx(tx, new.clone(), actor, now)
        })?;
        self.event_bus.publish(opened_event(&exception));
        Ok(exception)
    }

    /// Acknowledge an open exception: someone is working on it.
    pub fn start(&self, id: &ExceptionId, actor: &Actor, assignee: Option<String>) -> Result<WorkflowException> {
        let exception = write_with_retry(&self.store, self.conflict_retries, |tx| {
            let mut e = tx
                .get_exception(id)?
                .ok_or_else(|| StafflineError::ExceptionNotFound(id.clone()))?;
            if e.status.is_closed() {
                return Err(StafflineError::AlreadyResolved {
                    id: id.clone(),
                    status: e.status,
                });
            }
            e.status = ResolutionStatus::InProgress;
            e.assignee = assignee.clone().or(e.assignee).or_else(|| Some(actor.0.clone()));
            tx.update_exception(&e)?;
            Ok(e)
        })?;
        info!(exception_id = %id, actor = %actor, "Exception in progress");
        Ok(exception)
    }

    pub fn resolve(&self, id: &ExceptionId, actor: &Actor, notes: Option<String>) -> Result<WorkflowException> {
        self.close(id, actor, notes, ResolutionStatus::Resolved)
    }

    pub fn dismiss(&self, id: &ExceptionId, actor: &Actor, notes: Option<String>) -> Result<WorkflowException> {
        self.close(id, actor, notes, ResolutionStatus::Dismissed)
    }

    fn close(
        &self,
        id: &ExceptionId,
        actor: &Actor,
        notes: Option<String>,
        outcome: ResolutionStatus,
    ) -> Result<WorkflowException> {
        let now = self.clock.now();
        let exception = write_with_retry(&self.store, self.conflict_retries, |tx| {
            let mut e = tx
                .get_exception(id)?
                .ok_or_else(|| StafflineError::ExceptionNotFound(id.clone()))?;
            if e.status.is_closed() {
                return Err(StafflineError::AlreadyResolved {
                    id: id.clone(),
                    status: e.status,
                });
            }
            e.status = outcome;
            e.resolved_by = Some(actor.clone());
            e.resolved_at = Some(now);
            e.resolution_notes = notes.clone();
            tx.update_exception(&e)?;
            Ok(e)
        })?;

        info!(exception_id = %id, status = %outcome, actor = %actor, "Exception closed");
        self.event_bus.publish(WorkflowEvent::ExceptionClosed {
            exception_id: exception.id.clone(),
            instance_id: exception.instance_id.clone(),
            status: exception.status,
            actor: actor.clone(),
        });
        Ok(exception)
    }

    pub fn get(&self, id: &ExceptionId) -> Result<WorkflowException> {
        self.store
            .read(|tx| tx.get_exception(id))?
            .ok_or_else(|| StafflineError::ExceptionNotFound(id.clone()))
    }

    pub fn list(&self, filter: &ExceptionFilter) -> Result<Vec<WorkflowException>> {
        self.store.read(|tx| tx.list_exceptions(filter))
    }
}

/// Insert a new exception. The instance (and step, when given) must exist.
pub(crate) fn open_in_tx(
    tx: &StoreTx<'_>,
    new: NewException,
    actor: &Actor,
    now: DateTime<Utc>,
) -> Result<WorkflowException> {
    if tx.get_instance(&new.instance_id)?.is_none() {
        return Err(StafflineError::InstanceNotFound(new.instance_id));
    }
    if let Some(step_id) = &new.step_id {
        let steps = tx.steps_for(&new.instance_id)?;
        if !steps.iter().any(|s| &s.id == step_id) {
            return Err(StafflineError::StepNotFound {
                instance: new.instance_id,
                step: step_id.clone(),
            });
        }
    }

    let exception = WorkflowException {
        id: ExceptionId::new(),
        instance_id: new.instance_id,
        step_id: new.step_id,
        kind: new.kind,
        severity: new.severity,
        status: ResolutionStatus::Open,
        title: new.title,
        description: new.description,
        assignee: new.assignee,
        opened_by: actor.clone(),
        opened_at: now,
        resolved_by: None,
        resolved_at: None,
        resolution_notes: None,
    };
    tx.insert_exception(&exception)?;
    warn!(
        exception_id = %exception.id,
        instance_id = %exception.instance_id,
        kind = %exception.kind,
        severity = %exception.severity,
        "Exception opened"
    );
    Ok(exception)
}

/// Open an exception unless one of the same kind is already unresolved for
/// this instance and step. Returns the newly opened exception, if any.
pub(crate) fn open_once_in_tx(
    tx: &StoreTx<'_>,
    new: NewException,
    actor: &Actor,
    now: DateTime<Utc>,
) -> Result<Option<WorkflowException>> {
    if tx
        .find_open_exception(&new.instance_id, new.step_id.as_ref(), new.kind)?
        .is_some()
    {
        return Ok(None);
    }
    open_in_tx(tx, new, actor, now).map(Some)
}

pub(crate) fn opened_event(e: &WorkflowException) -> WorkflowEvent {
    WorkflowEvent::ExceptionOpened {
        exception_id: e.id.clone(),
        instance_id: e.instance_id.clone(),
        step_id: e.step_id.clone(),
        kind: e.kind,
        severity: e.severity,
    }
}
