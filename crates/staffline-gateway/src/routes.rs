use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use tracing::info;

use staffline_core::config::ApiKeyRole;
use staffline_core::types::*;
use staffline_store::{ExceptionFilter, InstanceFilter};

use crate::auth;
use crate::error::ApiError;
use crate::middleware::Authenticated;
use crate::state::AppState;

type ApiResult = Result<Json<serde_json::Value>, ApiError>;

fn require(check: fn(&ApiKeyRole) -> bool, role: &ApiKeyRole) -> Result<(), ApiError> {
    if check(role) {
        Ok(())
    } else {
        Err(ApiError::Forbidden)
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> ApiResult {
    serde_json::to_value(value)
        .map(Json)
        .map_err(|e| ApiError::Engine(e.into()))
}

// GET /api/health (no auth required)
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// ── Templates ───────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct TemplateQuery {
    #[serde(default)]
    pub lifecycle: Option<LifecycleType>,
    #[serde(default)]
    pub state: Option<TemplateState>,
}

// GET /api/templates?lifecycle=&state= (Viewer+)
pub async fn list_templates(
    Authenticated(auth): Authenticated,
    State(state): State<Arc<AppState>>,
    Query(q): Query<TemplateQuery>,
) -> ApiResult {
    require(auth::has_viewer_access, &auth.role)?;
    let templates = state.engine.templates().list(q.lifecycle, q.state)?;
    Ok(Json(serde_json::json!({ "templates": templates })))
}

// POST /api/templates (Admin)
pub async fn create_template(
    Authenticated(auth): Authenticated,
    State(state): State<Arc<AppState>>,
    Json(draft): Json<TemplateDraft>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    require(auth::has_admin_access, &auth.role)?;
    let template = state.engine.templates().create(draft, &auth.actor())?;
    info!(template_id = %template.id, actor = %auth.name, "Template created");
    Ok((StatusCode::CREATED, to_json(&template)?))
}

// GET /api/templates/{id} (Viewer+)
pub async fn get_template(
    Authenticated(auth): Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult {
    require(auth::has_viewer_access, &auth.role)?;
    to_json(&state.engine.templates().get(&TemplateId::from_string(&id))?)
}

// PUT /api/templates/{id} (Admin, drafts only)
pub async fn update_template(
    Authenticated(auth): Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(draft): Json<TemplateDraft>,
) -> ApiResult {
    require(auth::has_admin_access, &auth.role)?;
    to_json(&state.engine.templates().update(&TemplateId::from_string(&id), draft)?)
}

// POST /api/templates/{id}/publish (Admin)
pub async fn publish_template(
    Authenticated(auth): Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult {
    require(auth::has_admin_access, &auth.role)?;
    to_json(&state.engine.templates().publish(&TemplateId::from_string(&id))?)
}

// POST /api/templates/{id}/retire (Admin)
pub async fn retire_template(
    Authenticated(auth): Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult {
    require(auth::has_admin_access, &auth.role)?;
    to_json(&state.engine.templates().retire(&TemplateId::from_string(&id))?)
}

// POST /api/templates/{id}/revise (Admin)
pub async fn revise_template(
    Authenticated(auth): Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    require(auth::has_admin_access, &auth.role)?;
    let draft = state
        .engine
        .templates()
        .revise(&TemplateId::from_string(&id), &auth.actor())?;
    Ok((StatusCode::CREATED, to_json(&draft)?))
}

// ── Instances ───────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct InstanceQuery {
    #[serde(default)]
    pub status: Option<InstanceStatus>,
    #[serde(default)]
    pub lifecycle: Option<LifecycleType>,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub limit: Option<usize>,
}

// GET /api/instances (Viewer+)
pub async fn list_instances(
    Authenticated(auth): Authenticated,
    State(state): State<Arc<AppState>>,
    Query(q): Query<InstanceQuery>,
) -> ApiResult {
    require(auth::has_viewer_access, &auth.role)?;
    let instances = state.engine.instances().list(&InstanceFilter {
        employee_id: None,
        status: q.status,
        lifecycle: q.lifecycle,
        active_only: q.active,
        limit: q.limit,
    })?;
    Ok(Json(serde_json::json!({ "instances": instances })))
}

// POST /api/instances (Operator+)
pub async fn create_instance(
    Authenticated(auth): Authenticated,
    State(state): State<Arc<AppState>>,
    Json(req): Json<InstantiateRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    require(auth::has_operator_access, &auth.role)?;
    let detail = state.engine.instances().instantiate(req, &auth.actor())?;
    Ok((StatusCode::CREATED, to_json(&detail)?))
}

// GET /api/instances/{id} (Viewer+)
pub async fn get_instance(
    Authenticated(auth): Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult {
    require(auth::has_viewer_access, &auth.role)?;
    to_json(&state.engine.instances().get(&InstanceId::from_string(&id))?)
}

// GET /api/employees/{id}/instances (Viewer+)
pub async fn employee_instances(
    Authenticated(auth): Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult {
    require(auth::has_viewer_access, &auth.role)?;
    let instances = state
        .engine
        .instances()
        .for_employee(&EmployeeId::from_string(&id))?;
    Ok(Json(serde_json::json!({ "instances": instances })))
}

#[derive(Deserialize)]
pub struct TransitionBody {
    pub status: StepStatus,
}

// POST /api/instances/{id}/steps/{step_id}/transition (Operator+)
pub async fn transition_step(
    Authenticated(auth): Authenticated,
    State(state): State<Arc<AppState>>,
    Path((id, step_id)): Path<(String, String)>,
    Json(body): Json<TransitionBody>,
) -> ApiResult {
    require(auth::has_operator_access, &auth.role)?;
    let result = state
        .engine
        .instances()
        .transition_step(
            &InstanceId::from_string(&id),
            &StepId::from_string(&step_id),
            body.status,
            &auth.actor(),
        )
        .await?;
    to_json(&result)
}

// POST /api/instances/{id}/steps/{step_id}/retry (Operator+)
pub async fn retry_step(
    Authenticated(auth): Authenticated,
    State(state): State<Arc<AppState>>,
    Path((id, step_id)): Path<(String, String)>,
) -> ApiResult {
    require(auth::has_operator_access, &auth.role)?;
    let result = state
        .engine
        .instances()
        .retry_step(
            &InstanceId::from_string(&id),
            &StepId::from_string(&step_id),
            &auth.actor(),
        )
        .await?;
    to_json(&result)
}

// GET /api/instances/{id}/steps/{step_id}/attempts (Viewer+)
pub async fn step_attempts(
    Authenticated(auth): Authenticated,
    State(state): State<Arc<AppState>>,
    Path((id, step_id)): Path<(String, String)>,
) -> ApiResult {
    require(auth::has_viewer_access, &auth.role)?;
    let attempts = state
        .engine
        .instances()
        .attempts(&InstanceId::from_string(&id), &StepId::from_string(&step_id))?;
    Ok(Json(serde_json::json!({ "attempts": attempts })))
}

#[derive(Deserialize)]
pub struct CancelBody {
    pub reason: String,
}

// POST /api/instances/{id}/cancel (Operator+)
pub async fn cancel_instance(
    Authenticated(auth): Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<CancelBody>,
) -> ApiResult {
    require(auth::has_operator_access, &auth.role)?;
    if body.reason.trim().is_empty() {
        return Err(ApiError::BadRequest("reason is required".into()));
    }
    let instance = state
        .engine
        .instances()
        .cancel(&InstanceId::from_string(&id), &auth.actor(), &body.reason)?;
    to_json(&instance)
}

// ── Exceptions ──────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ExceptionQuery {
    #[serde(default)]
    pub status: Option<ResolutionStatus>,
    #[serde(default)]
    pub kind: Option<ExceptionKind>,
    #[serde(default)]
    pub open: bool,
}

impl ExceptionQuery {
    fn filter(self, instance_id: Option<InstanceId>) -> ExceptionFilter {
        ExceptionFilter {
            instance_id,
            step_id: None,
            status: self.status,
            kind: self.kind,
            open_only: self.open,
        }
    }
}

// GET /api/exceptions?status=&kind=&open= (Viewer+)
pub async fn list_exceptions(
    Authenticated(auth): Authenticated,
    State(state): State<Arc<AppState>>,
    Query(q): Query<ExceptionQuery>,
) -> ApiResult {
    require(auth::has_viewer_access, &auth.role)?;
    let exceptions = state.engine.exceptions().list(&q.filter(None))?;
    Ok(Json(serde_json::json!({ "exceptions": exceptions })))
}

// GET /api/instances/{id}/exceptions (Viewer+)
pub async fn instance_exceptions(
    Authenticated(auth): Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(q): Query<ExceptionQuery>,
) -> ApiResult {
    require(auth::has_viewer_access, &auth.role)?;
    let instance_id = InstanceId::from_string(&id);
    // Unknown instance is a 404, not an empty list
    state.engine.instances().get(&instance_id)?;
    let exceptions = state.engine.exceptions().list(&q.filter(Some(instance_id)))?;
    Ok(Json(serde_json::json!({ "exceptions": exceptions })))
}

#[derive(Deserialize)]
pub struct OpenExceptionBody {
    #[serde(default)]
    pub step_id: Option<StepId>,
    #[serde(default = "default_kind")]
    pub kind: ExceptionKind,
    #[serde(default = "default_severity")]
    pub severity: Severity,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub assignee: Option<String>,
}

fn default_kind() -> ExceptionKind {
    ExceptionKind::ManualIntervention
}

fn default_severity() -> Severity {
    Severity::Medium
}

// POST /api/instances/{id}/exceptions (Operator+)
pub async fn open_exception(
    Authenticated(auth): Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<OpenExceptionBody>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    require(auth::has_operator_access, &auth.role)?;
    if body.title.trim().is_empty() {
        return Err(ApiError::BadRequest("title is required".into()));
    }
    let exception = state.engine.exceptions().open(
        NewException {
            instance_id: InstanceId::from_string(&id),
            step_id: body.step_id,
            kind: body.kind,
            severity: body.severity,
            title: body.title,
            description: body.description,
            assignee: body.assignee,
        },
        &auth.actor(),
    )?;
    Ok((StatusCode::CREATED, to_json(&exception)?))
}

#[derive(Deserialize, Default)]
pub struct ExceptionActionBody {
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub assignee: Option<String>,
}

impl ExceptionActionBody {
    /// The body is optional; an empty one means no notes.
    fn parse(bytes: &[u8]) -> Result<Self, ApiError> {
        if bytes.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(Self::default());
        }
        serde_json::from_slice(bytes).map_err(|e| ApiError::BadRequest(e.to_string()))
    }
}

// POST /api/exceptions/{id}/start (Operator+)
pub async fn start_exception(
    Authenticated(auth): Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult {
    require(auth::has_operator_access, &auth.role)?;
    let body = ExceptionActionBody::parse(&body)?;
    to_json(&state.engine.exceptions().start(
        &ExceptionId::from_string(&id),
        &auth.actor(),
        body.assignee,
    )?)
}

// POST /api/exceptions/{id}/resolve (Operator+)
pub async fn resolve_exception(
    Authenticated(auth): Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult {
    require(auth::has_operator_access, &auth.role)?;
    let body = ExceptionActionBody::parse(&body)?;
    to_json(&state.engine.exceptions().resolve(
        &ExceptionId::from_string(&id),
        &auth.actor(),
        body.notes,
    )?)
}

// POST /api/exceptions/{id}/dismiss (Operator+)
pub async fn dismiss_exception(
    Authenticated(auth): Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult {
    require(auth::has_operator_access, &auth.role)?;
    let body = ExceptionActionBody::parse(&body)?;
    to_json(&state.engine.exceptions().dismiss(
        &ExceptionId::from_string(&id),
        &auth.actor(),
        body.notes,
    )?)
}
