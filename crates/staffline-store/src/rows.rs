use std::str::FromStr;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::Row;

use staffline_core::error::StafflineError;
use staffline_core::types::*;

pub(crate) const TEMPLATE_COLUMNS: &str = "id, name, lifecycle, department, role, description, \
     version, state, steps_json, created_by, created_at, published_at, retired_at";

pub(crate) const INSTANCE_COLUMNS: &str = "id, employee_id, template_id, lifecycle, stage, status, \
     percentage, start_date, expected_completion, actual_completion, assignments_json, \
     created_by, created_at, updated_at, cancelled_by, cancel_reason";

pub(crate) const STEP_COLUMNS: &str = "id, instance_id, blueprint_id, order_index, title, category, \
     kind, integration, status, assignee, due_date, mandatory, max_attempts, started_at, \
     completed_at, completed_by, updated_at";

pub(crate) const ATTEMPT_COLUMNS: &str = "id, instance_id, step_id, kind, correlation_id, status, \
     attempt_count, max_attempts, last_attempt_at, next_retry_at, request_json, response_json, \
     error_message, created_at";

pub(crate) const EXCEPTION_COLUMNS: &str = "id, instance_id, step_id, kind, severity, status, title, \
     description, assignee, opened_by, opened_at, resolved_by, resolved_at, resolution_notes";

/// Fixed-width UTC timestamps so that text comparison in SQL is chronological.
pub(crate) fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn fmt_opt_ts(ts: &Option<DateTime<Utc>>) -> Option<String> {
    ts.as_ref().map(fmt_ts)
}

pub(crate) fn fmt_date(date: &NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

pub(crate) fn fmt_opt_date(date: &Option<NaiveDate>) -> Option<String> {
    date.as_ref().map(fmt_date)
}

pub(crate) fn fmt_opt_json(value: &Option<serde_json::Value>) -> Option<String> {
    value.as_ref().map(|v| v.to_string())
}

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn ts_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn opt_ts_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(s) => DateTime::parse_from_rfc3339(&s)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|e| conversion_error(idx, e)),
        None => Ok(None),
    }
}

fn date_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<NaiveDate> {
    let s: String = row.get(idx)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d").map_err(|e| conversion_error(idx, e))
}

fn opt_date_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<NaiveDate>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(s) => NaiveDate::parse_from_str(&s, "%Y-%m-%d")
            .map(Some)
            .map_err(|e| conversion_error(idx, e)),
        None => Ok(None),
    }
}

fn enum_at<T: FromStr<Err = StafflineError>>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let s: String = row.get(idx)?;
    T::from_str(&s).map_err(|e| conversion_error(idx, e))
}

fn opt_enum_at<T: FromStr<Err = StafflineError>>(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<T>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(s) => T::from_str(&s).map(Some).map_err(|e| conversion_error(idx, e)),
        None => Ok(None),
    }
}

fn opt_json_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<serde_json::Value>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(s) => serde_json::from_str(&s)
            .map(Some)
            .map_err(|e| conversion_error(idx, e)),
        None => Ok(None),
    }
}

pub(crate) fn template_from_row(row: &Row<'_>) -> rusqlite::Result<WorkflowTemplate> {
    let steps_json: String = row.get(8)?;
    let steps: Vec<StepBlueprint> =
        serde_json::from_str(&steps_json).map_err(|e| conversion_error(8, e))?;
    Ok(WorkflowTemplate {
        id: TemplateId(row.get(0)?),
        name: row.get(1)?,
        lifecycle: enum_at(row, 2)?,
        department: row.get(3)?,
        role: row.get(4)?,
        description: row.get(5)?,
        version: row.get::<_, i64>(6)? as u32,
        state: enum_at(row, 7)?,
        steps,
        created_by: Actor(row.get(9)?),
        created_at: ts_at(row, 10)?,
        published_at: opt_ts_at(row, 11)?,
        retired_at: opt_ts_at(row, 12)?,
    })
}

pub(crate) fn instance_from_row(row: &Row<'_>) -> rusqlite::Result<WorkflowInstance> {
    let assignments_json: String = row.get(10)?;
    Ok(WorkflowInstance {
        id: InstanceId(row.get(0)?),
        employee_id: EmployeeId(row.get(1)?),
        template_id: row.get::<_, Option<String>>(2)?.map(TemplateId),
        lifecycle: enum_at(row, 3)?,
        stage: row.get(4)?,
        status: enum_at(row, 5)?,
        percentage: row.get::<_, i64>(6)? as u8,
        start_date: date_at(row, 7)?,
        expected_completion: opt_date_at(row, 8)?,
        actual_completion: opt_date_at(row, 9)?,
        assignments: serde_json::from_str(&assignments_json)
            .map_err(|e| conversion_error(10, e))?,
        created_by: Actor(row.get(11)?),
        created_at: ts_at(row, 12)?,
        updated_at: ts_at(row, 13)?,
        cancelled_by: row.get::<_, Option<String>>(14)?.map(Actor),
        cancel_reason: row.get(15)?,
    })
}

/// Step row without prerequisites; the caller attaches them from `step_dependencies`.
pub(crate) fn step_from_row(row: &Row<'_>) -> rusqlite::Result<WorkflowStep> {
    Ok(WorkflowStep {
        id: StepId(row.get(0)?),
        instance_id: InstanceId(row.get(1)?),
        blueprint_id: row.get(2)?,
        order_index: row.get::<_, i64>(3)? as u32,
        title: row.get(4)?,
        category: row.get(5)?,
        kind: enum_at(row, 6)?,
        integration: opt_enum_at(row, 7)?,
        status: enum_at(row, 8)?,
        prerequisites: vec![],
        assignee: row.get(9)?,
        due_date: opt_date_at(row, 10)?,
        mandatory: row.get(11)?,
        max_attempts: row.get::<_, Option<i64>>(12)?.map(|n| n as u32),
        started_at: opt_ts_at(row, 13)?,
        completed_at: opt_ts_at(row, 14)?,
        completed_by: row.get::<_, Option<String>>(15)?.map(Actor),
        updated_at: ts_at(row, 16)?,
    })
}

pub(crate) fn attempt_from_row(row: &Row<'_>) -> rusqlite::Result<IntegrationAttempt> {
    Ok(IntegrationAttempt {
        id: AttemptId(row.get(0)?),
        instance_id: InstanceId(row.get(1)?),
        step_id: StepId(row.get(2)?),
        kind: enum_at(row, 3)?,
        correlation_id: row.get(4)?,
        status: enum_at(row, 5)?,
        attempt_count: row.get::<_, i64>(6)? as u32,
        max_attempts: row.get::<_, i64>(7)? as u32,
        last_attempt_at: opt_ts_at(row, 8)?,
        next_retry_at: opt_ts_at(row, 9)?,
        request_payload: opt_json_at(row, 10)?,
        response_payload: opt_json_at(row, 11)?,
        error_message: row.get(12)?,
        created_at: ts_at(row, 13)?,
    })
}

pub(crate) fn exception_from_row(row: &Row<'_>) -> rusqlite::Result<WorkflowException> {
    Ok(WorkflowException {
        id: ExceptionId(row.get(0)?),
        instance_id: InstanceId(row.get(1)?),
        step_id: row.get::<_, Option<String>>(2)?.map(StepId),
        kind: enum_at(row, 3)?,
        severity: enum_at(row, 4)?,
        status: enum_at(row, 5)?,
        title: row.get(6)?,
        description: row.get(7)?,
        assignee: row.get(8)?,
        opened_by: Actor(row.get(9)?),
        opened_at: ts_at(row, 10)?,
        resolved_by: row.get::<_, Option<String>>(11)?.map(Actor),
        resolved_at: opt_ts_at(row, 12)?,
        resolution_notes: row.get(13)?,
    })
}
