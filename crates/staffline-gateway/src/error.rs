use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::error;

use staffline_core::error::StafflineError;

/// Error returned by REST handlers.
#[derive(Debug)]
pub enum ApiError {
    Forbidden,
    BadRequest(String),
    Engine(StafflineError),
}

impl From<StafflineError> for ApiError {
    fn from(e: StafflineError) -> Self {
        Self::Engine(e)
    }
}

fn status_for(e: &StafflineError) -> StatusCode {
    match e {
        StafflineError::TemplateNotFound(_)
        | StafflineError::InstanceNotFound(_)
        | StafflineError::StepNotFound { .. }
        | StafflineError::AttemptNotFound(_)
        | StafflineError::ExceptionNotFound(_) => StatusCode::NOT_FOUND,
        StafflineError::InvalidDefinition(_) => StatusCode::UNPROCESSABLE_ENTITY,
        e if e.is_precondition() => StatusCode::CONFLICT,
        e if e.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Machine-readable details for precondition failures.
fn details(e: &StafflineError) -> serde_json::Value {
    match e {
        StafflineError::DependencyNotMet {
            step,
            unmet,
            missing,
        } => serde_json::json!({
            "code": "dependency_not_met",
            "step_id": step,
            "unmet": unmet,
            "missing": missing,
        }),
        StafflineError::IllegalTransition { step, from, to } => serde_json::json!({
            "code": "illegal_transition",
            "step_id": step,
            "from": from,
            "to": to,
        }),
        StafflineError::InstanceTerminal { instance, status } => serde_json::json!({
            "code": "instance_terminal",
            "instance_id": instance,
            "status": status,
        }),
        StafflineError::TemplateNotInstantiable { id, state } => serde_json::json!({
            "code": "template_not_instantiable",
            "template_id": id,
            "state": state,
        }),
        StafflineError::TemplateImmutable { id, state } => serde_json::json!({
            "code": "template_immutable",
            "template_id": id,
            "state": state,
        }),
        StafflineError::AlreadyResolved { id, status } => serde_json::json!({
            "code": "already_resolved",
            "exception_id": id,
            "status": status,
        }),
        _ => serde_json::json!({}),
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Forbidden => (
                StatusCode::FORBIDDEN,
                Json(serde_json::json!({ "error": "insufficient role" })),
            )
                .into_response(),
            ApiError::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": message })),
            )
                .into_response(),
            ApiError::Engine(e) => {
                let status = status_for(&e);
                if status == StatusCode::INTERNAL_SERVER_ERROR {
                    error!(error = %e, "Request failed");
                }
                let mut body = details(&e);
                if let Some(obj) = body.as_object_mut() {
                    obj.insert("error".into(), serde_json::Value::String(e.to_string()));
                }
                (status, Json(body)).into_response()
            }
        }
    }
}
