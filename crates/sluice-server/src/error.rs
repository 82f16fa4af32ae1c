//! Trigger error responses

use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use sluice_ingest::{PipelineError, RunReport};
use thiserror::Error;

use crate::requests::ValidationError;

/// Body of every trigger response, success or not
#[derive(Debug, Serialize)]
pub struct TriggerResponse<T> {
    pub status: &'static str,
    pub message: String,
    pub report: Option<T>,
}

impl<T: Serialize> TriggerResponse<T> {
    pub fn success(message: impl Into<String>, report: Option<T>) -> Self {
        Self {
            status: "success",
            message: message.into(),
            report,
        }
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, report) = match &self {
            AppError::BadRequest(_) | AppError::Validation(_) => (StatusCode::BAD_REQUEST, None),
            AppError::Pipeline(err) => {
                tracing::error!(error = %err, "Pipeline trigger failed");
                (StatusCode::INTERNAL_SERVER_ERROR, err.report())
            },
        };

        let body = TriggerResponse::<&RunReport> {
            status: "error",
            message: self.to_string(),
            report,
        };

        (status, Json(body)).into_response()
    }
}
