use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use staffline_core::config::GatewayConfig;
use staffline_engine::Engine;

use crate::routes;
use crate::state::AppState;

/// Build the REST router over shared state.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(routes::health))
        // Templates
        .route(
            "/api/templates",
            get(routes::list_templates).post(routes::create_template),
        )
        .route(
            "/api/templates/{id}",
            get(routes::get_template).put(routes::update_template),
        )
        .route("/api/templates/{id}/publish", post(routes::publish_template))
        .route("/api/templates/{id}/retire", post(routes::retire_template))
        .route("/api/templates/{id}/revise", post(routes::revise_template))
        // Instances
        .route(
            "/api/instances",
            get(routes::list_instances).post(routes::create_instance),
        )
        .route("/api/instances/{id}", get(routes::get_instance))
        .route("/api/instances/{id}/cancel", post(routes::cancel_instance))
        .route(
            "/api/instances/{id}/steps/{step_id}/transition",
            post(routes::transition_step),
        )
        .route(
            "/api/instances/{id}/steps/{step_id}/retry",
            post(routes::retry_step),
        )
        .route(
            "/api/instances/{id}/steps/{step_id}/attempts",
            get(routes::step_attempts),
        )
        .route("/api/employees/{id}/instances", get(routes::employee_instances))
        // Exceptions
        .route("/api/exceptions", get(routes::list_exceptions))
        .route(
            "/api/instances/{id}/exceptions",
            get(routes::instance_exceptions).post(routes::open_exception),
        )
        .route("/api/exceptions/{id}/start", post(routes::start_exception))
        .route("/api/exceptions/{id}/resolve", post(routes::resolve_exception))
        .route("/api/exceptions/{id}/dismiss", post(routes::dismiss_exception))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// HTTP gateway server built on axum.
pub struct GatewayServer {
    config: GatewayConfig,
    engine: Arc<Engine>,
}

impl GatewayServer {
    pub fn new(config: GatewayConfig, engine: Arc<Engine>) -> Self {
        Self { config, engine }
    }

    /// Run the gateway server until the cancellation token is triggered.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let state = Arc::new(AppState {
            config: self.config.clone(),
            engine: self.engine.clone(),
        });
        let app = router(state);

        let listener = TcpListener::bind(&self.config.bind).await?;
        info!(bind = %self.config.bind, api_keys = self.config.api_keys.len(), "Gateway listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("Gateway shut down");
        Ok(())
    }
}
