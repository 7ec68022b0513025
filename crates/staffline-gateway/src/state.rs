use std::sync::Arc;

use staffline_core::config::GatewayConfig;
use staffline_engine::Engine;

/// Shared application state for axum handlers.
pub struct AppState {
    pub config: GatewayConfig,
    pub engine: Arc<Engine>,
}
