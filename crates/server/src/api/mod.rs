pub mod stream;
pub mod upload;

use axum::extract::DefaultBodyLimit;
use axum::http::HeaderMap;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};

use crate::state::{AppState, HealthResponse};

pub fn api_router(state: AppState) -> Router {
    let max_upload = state.config.max_upload_bytes as usize;
    Router::new()
        .route(
            "/upload",
            post(upload::upload_asset).layer(DefaultBodyLimit::max(max_upload)),
        )
        .route("/upload/mine", get(upload::my_uploads))
        .route("/upload/:asset_id/status", get(upload::upload_status))
        .route("/upload/:asset_id/waveform", get(upload::upload_waveform))
        .route("/upload/:asset_id", put(upload::update_asset))
        .route("/upload/:asset_id", delete(upload::delete_asset))
        .route("/stream/:asset_id", get(stream::stream_asset))
        .route("/stream/:asset_id/metadata", get(stream::playback_metadata))
        .route("/stream/:asset_id/play", post(stream::track_play))
        .route("/health", get(health))
        .with_state(state)
}

/// Auth is out of scope; callers name themselves with `X-User` and
/// everyone else shares the anonymous identity.
pub fn caller(headers: &HeaderMap) -> String {
    headers
        .get("x-user")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or("anonymous")
        .to_string()
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn caller_defaults_to_anonymous() {
        assert_eq!(caller(&HeaderMap::new()), "anonymous");
        let mut headers = HeaderMap::new();
        headers.insert("x-user", HeaderValue::from_static("  "));
        assert_eq!(caller(&headers), "anonymous");
        headers.insert("x-user", HeaderValue::from_static("minh"));
        assert_eq!(caller(&headers), "minh");
    }
}
