use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

use staffline_core::error::Result;
use staffline_core::types::*;

use crate::rows::*;
use crate::store::db_err;

/// Filter for listing workflow instances.
#[derive(Debug, Clone, Default)]
pub struct InstanceFilter {
    pub employee_id: Option<EmployeeId>,
    pub status: Option<InstanceStatus>,
    pub lifecycle: Option<LifecycleType>,
    /// Only instances that are neither completed nor cancelled.
    pub active_only: bool,
    pub limit: Option<usize>,
}

/// Filter for listing exceptions.
#[derive(Debug, Clone, Default)]
pub struct ExceptionFilter {
    pub instance_id: Option<InstanceId>,
    pub step_id: Option<StepId>,
    pub status: Option<ResolutionStatus>,
    pub kind: Option<ExceptionKind>,
    /// Only `open` or `in_progress` exceptions.
    pub open_only: bool,
}

/// Typed access to the database inside one transaction.
pub struct StoreTx<'a> {
    conn: &'a Connection,
}

impl<'a> StoreTx<'a> {
    pub(crate) fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    // ── Templates ───────────────────────────────────────────────

    pub fn insert_template(&self, t: &WorkflowTemplate) -> Result<()> {
        self.conn
            .execute(
                &format!(
                    "INSERT INTO templates ({TEMPLATE_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
                ),
                params![
                    t.id.0,
                    t.name,
                    t.lifecycle.as_str(),
                    t.department,
                    t.role,
                    t.description,
                    t.version as i64,
                    t.state.as_str(),
                    serde_json::to_string(&t.steps)?,
                    t.created_by.0,
                    fmt_ts(&t.created_at),
                    fmt_opt_ts(&t.published_at),
                    fmt_opt_ts(&t.retired_at),
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    pub fn update_template(&self, t: &WorkflowTemplate) -> Result<()> {
        self.conn
            .execute(
                "UPDATE templates SET name = ?2, lifecycle = ?3, department = ?4, role = ?5,
                     description = ?6, state = ?7, steps_json = ?8, published_at = ?9,
                     retired_at = ?10
                 WHERE id = ?1",
                params![
                    t.id.0,
                    t.name,
                    t.lifecycle.as_str(),
                    t.department,
                    t.role,
                    t.description,
                    t.state.as_str(),
                    serde_json::to_string(&t.steps)?,
                    fmt_opt_ts(&t.published_at),
                    fmt_opt_ts(&t.retired_at),
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    pub fn get_template(&self, id: &TemplateId) -> Result<Option<WorkflowTemplate>> {
        self.conn
            .query_row(
                &format!("SELECT {TEMPLATE_COLUMNS} FROM templates WHERE id = ?1"),
                params![id.0],
                template_from_row,
            )
            .optional()
            .map_err(db_err)
    }

    pub fn list_templates(
        &self,
        lifecycle: Option<LifecycleType>,
        state: Option<TemplateState>,
    ) -> Result<Vec<WorkflowTemplate>> {
        let mut sql = format!("SELECT {TEMPLATE_COLUMNS} FROM templates WHERE 1 = 1");
        let mut values: Vec<String> = Vec::new();
        if let Some(l) = lifecycle {
            values.push(l.as_str().to_string());
            sql.push_str(&format!(" AND lifecycle = ?{}", values.len()));
        }
        if let Some(s) = state {
            values.push(s.as_str().to_string());
            sql.push_str(&format!(" AND state = ?{}", values.len()));
        }
        sql.push_str(" ORDER BY lifecycle, name, version");

        let mut stmt = self.conn.prepare(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), template_from_row)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    // ── Instances ───────────────────────────────────────────────

    pub fn insert_instance(&self, i: &WorkflowInstance) -> Result<()> {
        self.conn
            .execute(
                &format!(
                    "INSERT INTO instances ({INSTANCE_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
                ),
                params![
                    i.id.0,
                    i.employee_id.0,
                    i.template_id.as_ref().map(|t| t.0.clone()),
                    i.lifecycle.as_str(),
                    i.stage,
                    i.status.as_str(),
                    i.percentage as i64,
                    fmt_date(&i.start_date),
                    fmt_opt_date(&i.expected_completion),
                    fmt_opt_date(&i.actual_completion),
                    serde_json::to_string(&i.assignments)?,
                    i.created_by.0,
                    fmt_ts(&i.created_at),
                    fmt_ts(&i.updated_at),
                    i.cancelled_by.as_ref().map(|a| a.0.clone()),
                    i.cancel_reason,
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    /// Persist the mutable, derived and cancellation fields of an instance.
    pub fn update_instance(&self, i: &WorkflowInstance) -> Result<()> {
        self.conn
            .execute(
                "UPDATE instances SET stage = ?2, status = ?3, percentage = ?4,
                     expected_completion = ?5, actual_completion = ?6, assignments_json = ?7,
                     updated_at = ?8, cancelled_by = ?9, cancel_reason = ?10
                 WHERE id = ?1",
                params![
                    i.id.0,
                    i.stage,
                    i.status.as_str(),
                    i.percentage as i64,
                    fmt_opt_date(&i.expected_completion),
                    fmt_opt_date(&i.actual_completion),
                    serde_json::to_string(&i.assignments)?,
                    fmt_ts(&i.updated_at),
                    i.cancelled_by.as_ref().map(|a| a.0.clone()),
                    i.cancel_reason,
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    pub fn get_instance(&self, id: &InstanceId) -> Result<Option<WorkflowInstance>> {
        self.conn
            .query_row(
                &format!("SELECT {INSTANCE_COLUMNS} FROM instances WHERE id = ?1"),
                params![id.0],
                instance_from_row,
            )
            .optional()
            .map_err(db_err)
    }

    pub fn list_instances(&self, filter: &InstanceFilter) -> Result<Vec<WorkflowInstance>> {
        let mut sql = format!("SELECT {INSTANCE_COLUMNS} FROM instances WHERE 1 = 1");
        let mut values: Vec<String> = Vec::new();
        if let Some(e) = &filter.employee_id {
            values.push(e.0.clone());
            sql.push_str(&format!(" AND employee_id = ?{}", values.len()));
        }
        if let Some(s) = filter.status {
            values.push(s.as_str().to_string());
            sql.push_str(&format!(" AND status = ?{}", values.len()));
        }
        if let Some(l) = filter.lifecycle {
            values.push(l.as_str().to_string());
            sql.push_str(&format!(" AND lifecycle = ?{}", values.len()));
        }
        if filter.active_only {
            sql.push_str(" AND status NOT IN ('completed', 'cancelled')");
        }
        sql.push_str(" ORDER BY created_at DESC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let mut stmt = self.conn.prepare(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), instance_from_row)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// Delete an instance; steps, dependencies, attempts and exceptions cascade.
    pub fn delete_instance(&self, id: &InstanceId) -> Result<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM instances WHERE id = ?1", params![id.0])
            .map_err(db_err)?;
        Ok(deleted > 0)
    }

    // ── Steps ───────────────────────────────────────────────────

    /// Insert steps and their prerequisite edges. Every prerequisite must be a
    /// step inserted here or already present; unknown ids fail the foreign key.
    pub fn insert_steps(&self, steps: &[WorkflowStep]) -> Result<()> {
        for s in steps {
            self.conn
                .execute(
                    &format!(
                        "INSERT INTO steps ({STEP_COLUMNS})
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"
                    ),
                    params![
                        s.id.0,
                        s.instance_id.0,
                        s.blueprint_id,
                        s.order_index as i64,
                        s.title,
                        s.category,
                        s.kind.as_str(),
                        s.integration.map(|k| k.as_str()),
                        s.status.as_str(),
                        s.assignee,
                        fmt_opt_date(&s.due_date),
                        s.mandatory,
                        s.max_attempts.map(|n| n as i64),
                        fmt_opt_ts(&s.started_at),
                        fmt_opt_ts(&s.completed_at),
                        s.completed_by.as_ref().map(|a| a.0.clone()),
                        fmt_ts(&s.updated_at),
                    ],
                )
                .map_err(db_err)?;
        }

        for s in steps {
            for (position, prereq) in s.prerequisites.iter().enumerate() {
                self.conn
                    .execute(
                        "INSERT INTO step_dependencies (step_id, prerequisite_id, position)
                         VALUES (?1, ?2, ?3)",
                        params![s.id.0, prereq.0, position as i64],
                    )
                    .map_err(db_err)?;
            }
        }
        Ok(())
    }

    /// Persist the mutable fields of a step. Prerequisites are fixed at insert.
    pub fn update_step(&self, s: &WorkflowStep) -> Result<()> {
        self.conn
            .execute(
                "UPDATE steps SET status = ?2, assignee = ?3, due_date = ?4, started_at = ?5,
                     completed_at = ?6, completed_by = ?7, updated_at = ?8
                 WHERE id = ?1",
                params![
                    s.id.0,
                    s.status.as_str(),
                    s.assignee,
                    fmt_opt_date(&s.due_date),
                    fmt_opt_ts(&s.started_at),
                    fmt_opt_ts(&s.completed_at),
                    s.completed_by.as_ref().map(|a| a.0.clone()),
                    fmt_ts(&s.updated_at),
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    /// All steps of an instance in order, with prerequisites attached.
    pub fn steps_for(&self, instance: &InstanceId) -> Result<Vec<WorkflowStep>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {STEP_COLUMNS} FROM steps WHERE instance_id = ?1 ORDER BY order_index, id"
            ))
            .map_err(db_err)?;
        let mut steps = stmt
            .query_map(params![instance.0], step_from_row)
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;

        let mut deps = self
            .conn
            .prepare(
                "SELECT d.step_id, d.prerequisite_id
                 FROM step_dependencies d
                 JOIN steps s ON s.id = d.step_id
                 WHERE s.instance_id = ?1
                 ORDER BY d.step_id, d.position",
            )
            .map_err(db_err)?;
        let mut by_step: HashMap<String, Vec<StepId>> = HashMap::new();
        let rows = deps
            .query_map(params![instance.0], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(db_err)?;
        for row in rows {
            let (step_id, prereq) = row.map_err(db_err)?;
            by_step.entry(step_id).or_default().push(StepId(prereq));
        }

        for step in &mut steps {
            if let Some(prereqs) = by_step.remove(&step.id.0) {
                step.prerequisites = prereqs;
            }
        }
        Ok(steps)
    }

    // ── Integration attempts ────────────────────────────────────

    pub fn insert_attempt(&self, a: &IntegrationAttempt) -> Result<()> {
        self.conn
            .execute(
                &format!(
                    "INSERT INTO integration_attempts ({ATTEMPT_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
                ),
                params![
                    a.id.0,
                    a.instance_id.0,
                    a.step_id.0,
                    a.kind.as_str(),
                    a.correlation_id,
                    a.status.as_str(),
                    a.attempt_count as i64,
                    a.max_attempts as i64,
                    fmt_opt_ts(&a.last_attempt_at),
                    fmt_opt_ts(&a.next_retry_at),
                    fmt_opt_json(&a.request_payload),
                    fmt_opt_json(&a.response_payload),
                    a.error_message,
                    fmt_ts(&a.created_at),
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    pub fn update_attempt(&self, a: &IntegrationAttempt) -> Result<()> {
        self.conn
            .execute(
                "UPDATE integration_attempts SET correlation_id = ?2, status = ?3,
                     attempt_count = ?4, last_attempt_at = ?5, next_retry_at = ?6,
                     request_json = ?7, response_json = ?8, error_message = ?9
                 WHERE id = ?1",
                params![
                    a.id.0,
                    a.correlation_id,
                    a.status.as_str(),
                    a.attempt_count as i64,
                    fmt_opt_ts(&a.last_attempt_at),
                    fmt_opt_ts(&a.next_retry_at),
                    fmt_opt_json(&a.request_payload),
                    fmt_opt_json(&a.response_payload),
                    a.error_message,
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    pub fn get_attempt(&self, id: &AttemptId) -> Result<Option<IntegrationAttempt>> {
        self.conn
            .query_row(
                &format!("SELECT {ATTEMPT_COLUMNS} FROM integration_attempts WHERE id = ?1"),
                params![id.0],
                attempt_from_row,
            )
            .optional()
            .map_err(db_err)
    }

    pub fn attempts_for_step(&self, step: &StepId) -> Result<Vec<IntegrationAttempt>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {ATTEMPT_COLUMNS} FROM integration_attempts
                 WHERE step_id = ?1 ORDER BY created_at, rowid"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![step.0], attempt_from_row)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// The attempt for a step that is still pending or in flight, if any.
    pub fn active_attempt_for_step(&self, step: &StepId) -> Result<Option<IntegrationAttempt>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {ATTEMPT_COLUMNS} FROM integration_attempts
                     WHERE step_id = ?1 AND status IN ('pending', 'in_progress')
                     ORDER BY created_at DESC, rowid DESC LIMIT 1"
                ),
                params![step.0],
                attempt_from_row,
            )
            .optional()
            .map_err(db_err)
    }

    /// Pending attempts with budget left whose retry time has come, for
    /// `in_progress` steps on live instances.
    pub fn due_attempts(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<IntegrationAttempt>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM integration_attempts a
                 JOIN instances i ON i.id = a.instance_id
                 JOIN steps s ON s.id = a.step_id
                 WHERE a.status = 'pending'
                   AND a.attempt_count < a.max_attempts
                   AND (a.next_retry_at IS NULL OR a.next_retry_at <= ?1)
                   AND s.status = 'in_progress'
                   AND i.status NOT IN ('completed', 'cancelled')
                 ORDER BY a.next_retry_at, a.created_at
                 LIMIT {}",
                qualified(ATTEMPT_COLUMNS, "a"),
                limit
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![fmt_ts(&now)], attempt_from_row)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// Attempts left `in_progress` since before `before` (the process likely died mid-call).
    pub fn stale_attempts(&self, before: DateTime<Utc>) -> Result<Vec<IntegrationAttempt>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {ATTEMPT_COLUMNS} FROM integration_attempts
                 WHERE status = 'in_progress' AND last_attempt_at < ?1
                 ORDER BY last_attempt_at"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![fmt_ts(&before)], attempt_from_row)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    // ── Exceptions ──────────────────────────────────────────────

    pub fn insert_exception(&self, e: &WorkflowException) -> Result<()> {
        self.conn
            .execute(
                &format!(
                    "INSERT INTO exceptions ({EXCEPTION_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
                ),
                params![
                    e.id.0,
                    e.instance_id.0,
                    e.step_id.as_ref().map(|s| s.0.clone()),
                    e.kind.as_str(),
                    e.severity.as_str(),
                    e.status.as_str(),
                    e.title,
                    e.description,
                    e.assignee,
                    e.opened_by.0,
                    fmt_ts(&e.opened_at),
                    e.resolved_by.as_ref().map(|a| a.0.clone()),
                    fmt_opt_ts(&e.resolved_at),
                    e.resolution_notes,
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    pub fn update_exception(&self, e: &WorkflowException) -> Result<()> {
        self.conn
            .execute(
                "UPDATE exceptions SET status = ?2, assignee = ?3, resolved_by = ?4,
                     resolved_at = ?5, resolution_notes = ?6
                 WHERE id = ?1",
                params![
                    e.id.0,
                    e.status.as_str(),
                    e.assignee,
                    e.resolved_by.as_ref().map(|a| a.0.clone()),
                    fmt_opt_ts(&e.resolved_at),
                    e.resolution_notes,
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    pub fn get_exception(&self, id: &ExceptionId) -> Result<Option<WorkflowException>> {
        self.conn
            .query_row(
                &format!("SELECT {EXCEPTION_COLUMNS} FROM exceptions WHERE id = ?1"),
                params![id.0],
                exception_from_row,
            )
            .optional()
            .map_err(db_err)
    }

    pub fn list_exceptions(&self, filter: &ExceptionFilter) -> Result<Vec<WorkflowException>> {
        let mut sql = format!("SELECT {EXCEPTION_COLUMNS} FROM exceptions WHERE 1 = 1");
        let mut values: Vec<String> = Vec::new();
        if let Some(i) = &filter.instance_id {
            values.push(i.0.clone());
            sql.push_str(&format!(" AND instance_id = ?{}", values.len()));
        }
        if let Some(s) = &filter.step_id {
            values.push(s.0.clone());
            sql.push_str(&format!(" AND step_id = ?{}", values.len()));
        }
        if let Some(st) = filter.status {
            values.push(st.as_str().to_string());
            sql.push_str(&format!(" AND status = ?{}", values.len()));
        }
        if let Some(k) = filter.kind {
            values.push(k.as_str().to_string());
            sql.push_str(&format!(" AND kind = ?{}", values.len()));
        }
        if filter.open_only {
            sql.push_str(" AND status IN ('open', 'in_progress')");
        }
        sql.push_str(" ORDER BY opened_at, rowid");

        let mut stmt = self.conn.prepare(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), exception_from_row)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// An unresolved exception of `kind` for this instance and step (`None` = instance-level).
    pub fn find_open_exception(
        &self,
        instance: &InstanceId,
        step: Option<&StepId>,
        kind: ExceptionKind,
    ) -> Result<Option<WorkflowException>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {EXCEPTION_COLUMNS} FROM exceptions
                     WHERE instance_id = ?1 AND step_id IS ?2 AND kind = ?3
                       AND status IN ('open', 'in_progress')
                     ORDER BY opened_at LIMIT 1"
                ),
                params![instance.0, step.map(|s| s.0.clone()), kind.as_str()],
                exception_from_row,
            )
            .optional()
            .map_err(db_err)
    }
}

/// Prefix every column in a comma-separated list with a table alias.
fn qualified(columns: &str, alias: &str) -> String {
    columns
        .split(',')
        .map(|c| format!("{}.{}", alias, c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::NaiveDate;

    use super::*;
    use crate::SqliteStore;

    fn instance(id: &str) -> WorkflowInstance {
        let now = Utc::now();
        WorkflowInstance {
            id: InstanceId::from_string(id),
            employee_id: EmployeeId::from_string("emp-1"),
            template_id: None,
            lifecycle: LifecycleType::Onboarding,
            stage: "paperwork".into(),
            status: InstanceStatus::NotStarted,
            percentage: 0,
            start_date: NaiveDate::from_ymd_opt(2026, 11, 2).unwrap(),
            expected_completion: NaiveDate::from_ymd_opt(2026, 11, 30),
            actual_completion: None,
            assignments: BTreeMap::from([("buddy".to_string(), "dana".to_string())]),
            created_by: Actor::from_string("hr-admin"),
            created_at: now,
            updated_at: now,
            cancelled_by: None,
            cancel_reason: None,
        }
    }

    fn step(instance: &str, id: &str, order: u32, prereqs: &[&str]) -> WorkflowStep {
        WorkflowStep {
            id: StepId::from_string(id),
            instance_id: InstanceId::from_string(instance),
            blueprint_id: Some(id.to_string()),
            order_index: order,
            title: format!("Step {}", id),
            category: "paperwork".into(),
            kind: StepKind::Manual,
            integration: None,
            status: StepStatus::Pending,
            prerequisites: prereqs.iter().map(|p| StepId::from_string(p)).collect(),
            assignee: None,
            due_date: None,
            mandatory: true,
            max_attempts: None,
            started_at: None,
            completed_at: None,
            completed_by: None,
            updated_at: Utc::now(),
        }
    }

    fn seeded() -> SqliteStore {
        let store = SqliteStore::in_memory().unwrap();
        store
            .write(|tx| {
                tx.insert_instance(&instance("i-1"))?;
                tx.insert_steps(&[
                    step("i-1", "s1", 0, &[]),
                    step("i-1", "s2", 1, &["s1"]),
                    step("i-1", "s3", 2, &["s1", "s2"]),
                ])
            })
            .unwrap();
        store
    }

    #[test]
    fn instance_roundtrip_with_steps_and_prerequisites() {
        let store = seeded();
        let (inst, steps) = store
            .read(|tx| {
                let inst = tx.get_instance(&InstanceId::from_string("i-1"))?;
                let steps = tx.steps_for(&InstanceId::from_string("i-1"))?;
                Ok((inst, steps))
            })
            .unwrap();

        let inst = inst.unwrap();
        assert_eq!(inst.assignments.get("buddy").map(String::as_str), Some("dana"));
        assert_eq!(inst.status, InstanceStatus::NotStarted);
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[0].id.as_str(), "s1");
        assert!(steps[0].prerequisites.is_empty());
        assert_eq!(
            steps[2].prerequisites,
            vec![StepId::from_string("s1"), StepId::from_string("s2")]
        );
    }

    #[test]
    fn unknown_prerequisite_rejected_at_write_time() {
        let store = SqliteStore::in_memory().unwrap();
        let result = store.write(|tx| {
            tx.insert_instance(&instance("i-2"))?;
            tx.insert_steps(&[step("i-2", "a", 0, &["ghost"])])
        });
        assert!(result.is_err());
        // The failed write rolled back the instance insert too
        let inst = store
            .read(|tx| tx.get_instance(&InstanceId::from_string("i-2")))
            .unwrap();
        assert!(inst.is_none());
    }

    #[test]
    fn failed_write_closure_rolls_back() {
        let store = seeded();
        let result: Result<()> = store.write(|tx| {
            let mut s = tx.steps_for(&InstanceId::from_string("i-1"))?.remove(0);
            s.status = StepStatus::InProgress;
            tx.update_step(&s)?;
            Err(staffline_core::StafflineError::Conflict("forced".into()))
        });
        assert!(result.is_err());
        let steps = store
            .read(|tx| tx.steps_for(&InstanceId::from_string("i-1")))
            .unwrap();
        assert_eq!(steps[0].status, StepStatus::Pending);
    }

    #[test]
    fn delete_instance_cascades() {
        let store = seeded();
        store
            .write(|tx| {
                tx.insert_exception(&WorkflowException {
                    id: ExceptionId::from_string("x-1"),
                    instance_id: InstanceId::from_string("i-1"),
                    step_id: Some(StepId::from_string("s2")),
                    kind: ExceptionKind::ManualIntervention,
                    severity: Severity::Low,
                    status: ResolutionStatus::Open,
                    title: "check".into(),
                    description: String::new(),
                    assignee: None,
                    opened_by: Actor::from_string("hr-admin"),
                    opened_at: Utc::now(),
                    resolved_by: None,
                    resolved_at: None,
                    resolution_notes: None,
                })
            })
            .unwrap();

        let deleted = store
            .write(|tx| tx.delete_instance(&InstanceId::from_string("i-1")))
            .unwrap();
        assert!(deleted);

        let (steps, exceptions) = store
            .read(|tx| {
                Ok((
                    tx.steps_for(&InstanceId::from_string("i-1"))?,
                    tx.get_exception(&ExceptionId::from_string("x-1"))?,
                ))
            })
            .unwrap();
        assert!(steps.is_empty());
        assert!(exceptions.is_none());
    }

    #[test]
    fn due_attempts_skip_cancelled_instances_and_future_retries() {
        let store = seeded();
        let now = Utc::now();
        store
            .write(|tx| {
                let mut s1 = tx
                    .steps_for(&InstanceId::from_string("i-1"))?
                    .into_iter()
                    .find(|s| s.id.as_str() == "s1")
                    .unwrap();
                s1.status = StepStatus::InProgress;
                tx.update_step(&s1)
            })
            .unwrap();
        let attempt = |id: &str, next: Option<DateTime<Utc>>| IntegrationAttempt {
            id: AttemptId::from_string(id),
            instance_id: InstanceId::from_string("i-1"),
            step_id: StepId::from_string("s1"),
            kind: IntegrationKind::ESignature,
            correlation_id: None,
            status: AttemptStatus::Pending,
            attempt_count: 1,
            max_attempts: 3,
            last_attempt_at: Some(now),
            next_retry_at: next,
            request_payload: Some(serde_json::json!({"doc": "offer"})),
            response_payload: None,
            error_message: Some("503".into()),
            created_at: now,
        };
        store
            .write(|tx| {
                tx.insert_attempt(&attempt("a-due", Some(now - chrono::Duration::seconds(5))))?;
                tx.insert_attempt(&attempt("a-later", Some(now + chrono::Duration::hours(1))))
            })
            .unwrap();

        let due = store.read(|tx| tx.due_attempts(now, 10)).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id.as_str(), "a-due");
        assert_eq!(due[0].request_payload, Some(serde_json::json!({"doc": "offer"})));

        // A step that is no longer in progress has nothing due
        let set_s1 = |status: StepStatus| {
            store
                .write(|tx| {
                    let mut s1 = tx
                        .steps_for(&InstanceId::from_string("i-1"))?
                        .into_iter()
                        .find(|s| s.id.as_str() == "s1")
                        .unwrap();
                    s1.status = status;
                    tx.update_step(&s1)
                })
                .unwrap()
        };
        set_s1(StepStatus::Blocked);
        assert!(store.read(|tx| tx.due_attempts(now, 10)).unwrap().is_empty());
        set_s1(StepStatus::InProgress);

        store
            .write(|tx| {
                let mut inst = tx.get_instance(&InstanceId::from_string("i-1"))?.unwrap();
                inst.status = InstanceStatus::Cancelled;
                tx.update_instance(&inst)
            })
            .unwrap();
        let due = store.read(|tx| tx.due_attempts(now, 10)).unwrap();
        assert!(due.is_empty());
    }

    #[test]
    fn find_open_exception_distinguishes_instance_level() {
        let store = seeded();
        let open = |id: &str, step: Option<&str>| WorkflowException {
            id: ExceptionId::from_string(id),
            instance_id: InstanceId::from_string("i-1"),
            step_id: step.map(StepId::from_string),
            kind: ExceptionKind::Timeout,
            severity: Severity::Medium,
            status: ResolutionStatus::Open,
            title: "late".into(),
            description: String::new(),
            assignee: None,
            opened_by: Actor::system(),
            opened_at: Utc::now(),
            resolved_by: None,
            resolved_at: None,
            resolution_notes: None,
        };
        store
            .write(|tx| tx.insert_exception(&open("x-step", Some("s1"))))
            .unwrap();

        let found = store
            .read(|tx| {
                Ok((
                    tx.find_open_exception(
                        &InstanceId::from_string("i-1"),
                        None,
                        ExceptionKind::Timeout,
                    )?,
                    tx.find_open_exception(
                        &InstanceId::from_string("i-1"),
                        Some(&StepId::from_string("s1")),
                        ExceptionKind::Timeout,
                    )?,
                ))
            })
            .unwrap();
        assert!(found.0.is_none());
        assert_eq!(found.1.unwrap().id.as_str(), "x-step");
    }

    #[test]
    fn qualified_columns() {
        assert_eq!(qualified("id, step_id", "a"), "a.id, a.step_id");
    }
}
