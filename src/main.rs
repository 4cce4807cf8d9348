use std::net::SocketAddr;

use classifier_service_rs::{app, Config};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;
    config.ensure_dirs()?;
    info!("Model directory: {}", config.model_dir.display());
    info!("Uploads directory: {}", config.uploads_dir.display());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let service = app(config);

    info!("Server running on port {}", addr.port());
    axum::Server::try_bind(&addr)?
        .serve(service.into_make_service())
        .await?;

    Ok(())
}
