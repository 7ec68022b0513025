use staffline_core::config::{ApiKeyRole, GatewayConfig};
use staffline_core::types::Actor;

/// Result of a successful authentication.
#[derive(Debug, Clone)]
pub struct AuthResult {
    pub name: String,
    pub role: ApiKeyRole,
}

impl AuthResult {
    /// The audit actor recorded on mutations made with this key.
    pub fn actor(&self) -> Actor {
        Actor::from_string(&self.name)
    }
}

/// Bearer header -> api_keys -> anonymous.
///
/// Anonymous admin access is only granted when no keys are configured.
pub fn validate_auth(config: &GatewayConfig, bearer: Option<&str>) -> Option<AuthResult> {
    if let Some(bearer_val) = bearer {
        return config
            .api_keys
            .iter()
            .find(|ak| ak.key == bearer_val)
            .map(|ak| AuthResult {
                name: ak.name.clone(),
                role: ak.role.clone(),
            });
    }

    if config.api_keys.is_empty() {
        Some(AuthResult {
            name: "anonymous".into(),
            role: ApiKeyRole::Admin,
        })
    } else {
        None
    }
}

pub fn has_viewer_access(role: &ApiKeyRole) -> bool {
    matches!(role, ApiKeyRole::Viewer | ApiKeyRole::Operator | ApiKeyRole::Admin)
}

/// Operators drive instances and exceptions.
pub fn has_operator_access(role: &ApiKeyRole) -> bool {
    matches!(role, ApiKeyRole::Operator | ApiKeyRole::Admin)
}

/// Admins also manage templates.
pub fn has_admin_access(role: &ApiKeyRole) -> bool {
    matches!(role, ApiKeyRole::Admin)
}
