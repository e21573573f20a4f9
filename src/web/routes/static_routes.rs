//! Pages shared by all tenants.

use axum::{
    Router,
    extract::State,
    http::{StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::get,
};
use rust_embed::RustEmbed;
use std::path::PathBuf;
use std::sync::Arc;

use crate::server::config::ServerConfig;
use crate::web::error::AppError;

#[derive(RustEmbed)]
#[folder = "assets/"]
struct StaticAssets;

const ROBOTS: &str = "User-agent: *\nDisallow: /\n";

pub fn router(config: Arc<ServerConfig>) -> Router {
    Router::new()
        .route("/dsgvo.html", get(dsgvo))
        .route("/impressum.html", get(impressum))
        .route("/robots.txt", get(robots))
        .route("/css/style.css", get(stylesheet))
        .with_state(config)
}

/// Serves an operator supplied HTML file.
async fn operator_page(path: Option<&PathBuf>) -> Result<Html<String>, AppError> {
    let Some(path) = path else {
        return Err(AppError::NotFound(t!("error.not_found").into_owned()));
    };
    tokio::fs::read_to_string(path)
        .await
        .map(Html)
        .map_err(|e| AppError::Internal(format!("could not read {}: {e}", path.display())))
}

async fn dsgvo(State(config): State<Arc<ServerConfig>>) -> Result<Html<String>, AppError> {
    operator_page(config.path_dsgvo.as_ref()).await
}

async fn impressum(State(config): State<Arc<ServerConfig>>) -> Result<Html<String>, AppError> {
    operator_page(config.path_impressum.as_ref()).await
}

async fn robots() -> &'static str {
    ROBOTS
}

fn embedded(path: &str) -> Response {
    match StaticAssets::get(path) {
        Some(content) => {
            let mime = mime_guess::from_path(path).first_or_octet_stream();
            ([(header::CONTENT_TYPE, mime.as_ref().to_string())], content.data).into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn stylesheet() -> Response {
    embedded("style.css")
}
