use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{multipart::MultipartRejection, DefaultBodyLimit, Multipart, State},
    response::Html,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::{config::Config, error::ApiError, preprocess, registry::ModelRegistry, upload};

const INDEX_TEMPLATE: &str = include_str!("index.html");

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<ModelRegistry>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let registry = ModelRegistry::new(config.model_dir.clone(), config.model_manifest.clone());
        AppState {
            config: Arc::new(config),
            registry: Arc::new(registry),
        }
    }
}

/// Sample metrics shown on the landing page.
#[derive(Debug, Serialize)]
pub struct History {
    pub accuracy: Vec<f64>,
    pub val_accuracy: Vec<f64>,
    pub test_accuracy: Vec<f64>,
    pub test_loss: Vec<f64>,
}

impl History {
    pub fn sample() -> Self {
        History {
            accuracy: vec![0.8, 0.85, 0.9],
            val_accuracy: vec![0.75, 0.8, 0.85],
            test_accuracy: vec![0.7, 0.78, 0.82],
            test_loss: vec![0.5, 0.4, 0.35],
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PredictionResponse {
    pub prediction: Vec<Vec<f32>>,
    pub class_labels: Vec<String>,
}

pub fn router(state: AppState) -> Router {
    let body_limit_bytes = state.config.body_limit_bytes;
    Router::new()
        .route("/", get(index))
        .route("/health", get(health_check))
        .route("/train", post(train_handler))
        .route("/predict", post(predict_handler))
        .layer(DefaultBodyLimit::max(body_limit_bytes))
        .with_state(state)
}

async fn index() -> Html<String> {
    let history = serde_json::to_string(&History::sample()).unwrap_or_else(|_| "{}".into());
    Html(INDEX_TEMPLATE.replace("{{history}}", &history))
}

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({ "status": "OK" }))
}

async fn train_handler(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.registry.train().await?;
    Ok(Json(json!({ "message": "Model trained and saved successfully" })))
}

async fn predict_handler(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<PredictionResponse>, ApiError> {
    let mut multipart = multipart.map_err(|rejection| {
        warn!("Rejected predict body: {}", rejection);
        ApiError::MissingFile
    })?;

    let (file_name, bytes) = read_file_field(&mut multipart)
        .await?
        .ok_or(ApiError::MissingFile)?;
    if !upload::has_allowed_extension(&file_name) {
        return Err(ApiError::InvalidFileType);
    }

    let stored = upload::store(&state.config.uploads_dir, &file_name, &bytes)
        .await
        .map_err(ApiError::Upload)?;
    info!("Stored upload {} ({} bytes)", stored.display(), bytes.len());

    let model = state.registry.current().await?;
    let batch = tokio::task::spawn_blocking(move || preprocess::load_batch(&stored)).await??;

    let class_labels = model.class_labels().to_vec();
    let prediction = tokio::task::spawn_blocking(move || model.predict(batch.view())).await??;
    let prediction: Vec<Vec<f32>> = prediction.outer_iter().map(|row| row.to_vec()).collect();
    info!("Prediction for {}: {:?}", file_name, prediction);

    Ok(Json(PredictionResponse {
        prediction,
        class_labels,
    }))
}

/// First field named `file` that actually carries a file name.
async fn read_file_field(multipart: &mut Multipart) -> Result<Option<(String, Bytes)>, ApiError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = match field.file_name() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => continue,
        };
        let bytes = field.bytes().await?;
        return Ok(Some((file_name, bytes)));
    }
    Ok(None)
}
