use std::io;

use axum::{
    extract::multipart::MultipartError,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::{error, warn};

use crate::{network::NetworkError, preprocess::PreprocessError, registry::RegistryError};

/// Everything a route can fail with. The message is sent back verbatim as
/// `{"error": ...}`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("No file uploaded")]
    MissingFile,
    #[error("Invalid file type")]
    InvalidFileType,
    #[error("Error reading upload: {0}")]
    Multipart(#[from] MultipartError),
    #[error("Error saving upload: {0}")]
    Upload(io::Error),
    #[error("Error processing image: {0}")]
    Preprocess(#[from] PreprocessError),
    #[error("Prediction error: {0}")]
    Prediction(#[from] NetworkError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("Internal error: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::MissingFile | ApiError::InvalidFileType | ApiError::Multipart(_) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Registry(RegistryError::NoModel) => StatusCode::NOT_FOUND,
            ApiError::Upload(_)
            | ApiError::Preprocess(_)
            | ApiError::Prediction(_)
            | ApiError::Registry(_)
            | ApiError::Task(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.to_string();
        if status.is_server_error() {
            error!("{} {}", status.as_u16(), message);
        } else {
            warn!("{} {}", status.as_u16(), message);
        }
        (status, Json(json!({ "error": message }))).into_response()
    }
}
