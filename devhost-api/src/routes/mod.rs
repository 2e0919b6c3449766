pub mod health;
pub mod instances;

use crate::{auth::auth_middleware, config::ApiConfig, state::AppState};
use axum::{middleware, Router};
use devhost_orchestrator::InstanceManager;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub fn create_app(manager: InstanceManager, config: &ApiConfig) -> anyhow::Result<Router> {
    let state = AppState::new(manager);

    let app = Router::new()
        .merge(health::routes()) // Health routes don't need auth
        .merge(
            instances::routes(config.max_upload_bytes).layer(middleware::from_fn(auth_middleware)),
        )
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    Ok(app)
}
