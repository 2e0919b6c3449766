pub mod auth;
pub mod config;
pub mod error;
pub mod reconciler;
pub mod routes;
pub mod state;

pub use config::{ApiConfig, ClusterBackend};
pub use error::{ApiError, ApiResult};
pub use reconciler::start_reconciler_task;
pub use routes::create_app;
pub use state::AppState;
