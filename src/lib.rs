pub mod artifact;
pub mod config;
pub mod error;
pub mod handlers;
pub mod network;
pub mod preprocess;
pub mod registry;
pub mod upload;

use axum::Router;

pub use config::Config;
pub use handlers::AppState;

/// Builds the service with its own model registry rooted at `config`.
pub fn app(config: Config) -> Router {
    handlers::router(AppState::new(config))
}
