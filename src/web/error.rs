use axum::{
    http::StatusCode,
    response::{Html, IntoResponse, Response},
};
use thiserror::Error;
use tracing::error;

use crate::db::DataSafeError;
use crate::plugins::PluginError;
use crate::web::templates::Templates;

/// Request failures, rendered as a translated HTML page with the matching status.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::PreconditionFailed(_) => StatusCode::PRECONDITION_FAILED,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn forbidden() -> Self {
        AppError::Forbidden(t!("error.forbidden").into_owned())
    }
}

/// Renders the message page; falls back to bare HTML if templates are unavailable.
pub fn message_page(title: &str, text: &str) -> String {
    match Templates::shared().and_then(|t| t.render_message(title, text).map_err(|e| e.to_string())) {
        Ok(page) => page,
        Err(e) => {
            error!(error = %e, "Failed to render message page.");
            format!(
                "<!DOCTYPE html><html><body><h1>{}</h1><p>{}</p></body></html>",
                tera::escape_html(title),
                tera::escape_html(text)
            )
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let text = match self {
            AppError::Internal(detail) => {
                error!(error = %detail, "Request failed with internal error.");
                t!("error.internal").into_owned()
            }
            AppError::BadRequest(msg)
            | AppError::Forbidden(msg)
            | AppError::NotFound(msg)
            | AppError::PreconditionFailed(msg) => msg,
        };
        let title = format!(
            "{} {}",
            status.as_u16(),
            status.canonical_reason().unwrap_or_default()
        );
        (status, Html(message_page(&title, &text))).into_response()
    }
}

impl From<PluginError> for AppError {
    fn from(err: PluginError) -> Self {
        match err {
            PluginError::InvalidInput(msg) => AppError::BadRequest(msg),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<DataSafeError> for AppError {
    fn from(err: DataSafeError) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<tera::Error> for AppError {
    fn from(err: tera::Error) -> Self {
        AppError::Internal(format!("Template error: {err}"))
    }
}
