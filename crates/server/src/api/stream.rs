use std::io::SeekFrom;
use std::path::Path as FsPath;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;
use axum::Json;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::{error, warn};

use catalog::PlayEvent;
use common::{now_unix, StorageRef};

use crate::api::caller;
use crate::range::{parse_range, unsatisfiable_content_range, ByteSpan, RangeError};
use crate::state::{AppState, JsonResult, PlayResponse, PlaybackMetadata};
use crate::utils::{json_error, json_error_response, redirect_found};

/// Streams an asset's audio. Remote assets redirect to their storage URL;
/// local assets are served from disk with single-range support.
pub async fn stream_asset(
    State(state): State<AppState>,
    Path(asset_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let asset = match state.catalog.get(&asset_id) {
        Ok(Some(asset)) => asset,
        Ok(None) => return json_error_response(StatusCode::NOT_FOUND, "asset not found"),
        Err(err) => {
            return json_error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("catalog error: {}", err),
            )
        }
    };

    if let (Some(url), Some(audio_ref)) = (&asset.audio_url, &asset.audio_ref) {
        if audio_ref.is_remote() {
            return redirect_found(url);
        }
    }

    let file_name = match &asset.audio_ref {
        Some(StorageRef::Local { file_name }) => file_name.as_str(),
        _ => asset.file_name.as_str(),
    };
    let path = state.audio_dir.join(file_name);
    if !path.exists() {
        // Record says local but the bytes are gone; surface loudly.
        error!("Audio for asset {} missing from disk: {}", asset_id, path.display());
        return json_error_response(StatusCode::NOT_FOUND, "audio file missing from storage");
    }
    serve_local_file(&path, &headers, "audio/mpeg").await
}

pub async fn track_play(
    State(state): State<AppState>,
    Path(asset_id): Path<String>,
    headers: HeaderMap,
) -> JsonResult<PlayResponse> {
    let play_count = state
        .catalog
        .increment_play_count(&asset_id)
        .map_err(|err| {
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("catalog error: {}", err),
            )
        })?
        .ok_or_else(|| json_error(StatusCode::NOT_FOUND, "asset not found"))?;

    let user = caller(&headers);
    if user != "anonymous" {
        let event = PlayEvent {
            user,
            asset_id: asset_id.clone(),
            played_at: now_unix(),
        };
        if let Err(err) = state.catalog.record_play(event) {
            warn!("Could not record play for {}: {}", asset_id, err);
        }
    }

    Ok(Json(PlayResponse {
        asset_id,
        play_count,
    }))
}

pub async fn playback_metadata(
    State(state): State<AppState>,
    Path(asset_id): Path<String>,
) -> JsonResult<PlaybackMetadata> {
    let asset = state
        .catalog
        .get(&asset_id)
        .map_err(|err| {
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("catalog error: {}", err),
            )
        })?
        .ok_or_else(|| json_error(StatusCode::NOT_FOUND, "asset not found"))?;
    Ok(Json(PlaybackMetadata {
        asset_id: asset.id,
        title: asset.title,
        artist: asset.artist,
        album: asset.album,
        duration_secs: asset.duration_secs,
        container: asset.container,
        bitrate: asset.bitrate,
        sample_rate: asset.sample_rate,
        features: asset.features,
        auto_genre: asset.auto_genre,
        cover_url: asset.cover_url,
    }))
}

/// Serves locally-stored audio for assets that fell back from remote
/// storage (`/media/{file}` URLs).
pub async fn serve_media(
    State(state): State<AppState>,
    Path(file_name): Path<String>,
    headers: HeaderMap,
) -> Response {
    serve_from_dir(&state.audio_dir, &file_name, &headers, "audio/mpeg").await
}

pub async fn serve_cover(
    State(state): State<AppState>,
    Path(file_name): Path<String>,
    headers: HeaderMap,
) -> Response {
    let mime = mime_guess::from_path(&file_name)
        .first_or_octet_stream()
        .to_string();
    serve_from_dir(&state.image_dir, &file_name, &headers, &mime).await
}

async fn serve_from_dir(
    dir: &FsPath,
    file_name: &str,
    headers: &HeaderMap,
    content_type: &str,
) -> Response {
    // Stored names are flat; anything with path structure is bogus.
    if file_name.contains('/') || file_name.contains("..") || file_name.contains('\\') {
        return json_error_response(StatusCode::NOT_FOUND, "file not found");
    }
    let path = dir.join(file_name);
    if !path.exists() {
        return json_error_response(StatusCode::NOT_FOUND, "file not found");
    }
    serve_local_file(&path, headers, content_type).await
}

/// Byte-range responder over one file. A valid `Range` header yields 206
/// with `Content-Range`; a malformed one is ignored per RFC 9110; an
/// unsatisfiable one yields 416.
async fn serve_local_file(path: &FsPath, headers: &HeaderMap, content_type: &str) -> Response {
    let size = match tokio::fs::metadata(path).await {
        Ok(meta) => meta.len(),
        Err(err) => {
            return json_error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to stat file: {}", err),
            )
        }
    };

    let requested = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok());
    let span = match requested {
        None => None,
        Some(raw) => match parse_range(raw, size) {
            Ok(span) => Some(span),
            Err(RangeError::Malformed) => None,
            Err(RangeError::Unsatisfiable) => {
                return Response::builder()
                    .status(StatusCode::RANGE_NOT_SATISFIABLE)
                    .header(header::CONTENT_RANGE, unsatisfiable_content_range(size))
                    .header(header::ACCEPT_RANGES, "bytes")
                    .body(Body::empty())
                    .unwrap_or_else(|_| {
                        json_error_response(StatusCode::INTERNAL_SERVER_ERROR, "response build failed")
                    });
            }
        },
    };

    let window = span.unwrap_or_else(|| ByteSpan::full(size));
    let body = if size == 0 {
        Body::empty()
    } else {
        let mut file = match tokio::fs::File::open(path).await {
            Ok(file) => file,
            Err(err) => {
                return json_error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("failed to open file: {}", err),
                )
            }
        };
        if window.start > 0 {
            if let Err(err) = file.seek(SeekFrom::Start(window.start)).await {
                return json_error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("failed to seek: {}", err),
                );
            }
        }
        Body::from_stream(ReaderStream::new(file.take(window.len())))
    };

    let content_length = if size == 0 { 0 } else { window.len() };
    let mut builder = Response::builder()
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, content_length);
    builder = match span {
        Some(window) => builder
            .status(StatusCode::PARTIAL_CONTENT)
            .header(header::CONTENT_RANGE, window.content_range(size)),
        None => builder.status(StatusCode::OK),
    };
    builder.body(body).unwrap_or_else(|_| {
        json_error_response(StatusCode::INTERNAL_SERVER_ERROR, "response build failed")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    async fn temp_file(tag: &str, contents: &[u8]) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("tonefall-stream-{}-{}", tag, std::process::id()));
        tokio::fs::write(&path, contents).await.unwrap();
        path
    }

    fn range_headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::RANGE, HeaderValue::from_str(value).unwrap());
        headers
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    #[tokio::test]
    async fn full_request_returns_200_with_accept_ranges() {
        let path = temp_file("full", b"0123456789").await;
        let response = serve_local_file(&path, &HeaderMap::new(), "audio/mpeg").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::ACCEPT_RANGES], "bytes");
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "10");
        assert_eq!(response.headers()[header::CONTENT_TYPE], "audio/mpeg");
        assert!(response.headers().get(header::CONTENT_RANGE).is_none());
        assert_eq!(body_bytes(response).await, b"0123456789");
        tokio::fs::remove_file(&path).await.ok();
    }

    #[tokio::test]
    async fn range_request_returns_206_with_content_range() {
        let path = temp_file("partial", b"0123456789").await;
        let response = serve_local_file(&path, &range_headers("bytes=2-5"), "audio/mpeg").await;
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 2-5/10");
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "4");
        assert_eq!(body_bytes(response).await, b"2345");
        tokio::fs::remove_file(&path).await.ok();
    }

    #[tokio::test]
    async fn open_ended_range_runs_to_eof() {
        let path = temp_file("open", b"0123456789").await;
        let response = serve_local_file(&path, &range_headers("bytes=7-"), "audio/mpeg").await;
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 7-9/10");
        assert_eq!(body_bytes(response).await, b"789");
        tokio::fs::remove_file(&path).await.ok();
    }

    #[tokio::test]
    async fn unsatisfiable_range_returns_416() {
        let path = temp_file("unsat", b"0123456789").await;
        let response = serve_local_file(&path, &range_headers("bytes=10-"), "audio/mpeg").await;
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes */10");
        tokio::fs::remove_file(&path).await.ok();
    }

    #[tokio::test]
    async fn malformed_range_is_ignored() {
        let path = temp_file("malformed", b"0123456789").await;
        let response = serve_local_file(&path, &range_headers("bytes=x-y"), "audio/mpeg").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, b"0123456789");
        tokio::fs::remove_file(&path).await.ok();
    }

    #[tokio::test]
    async fn traversal_names_are_rejected() {
        let dir = std::env::temp_dir();
        let response =
            serve_from_dir(&dir, "../etc/passwd", &HeaderMap::new(), "audio/mpeg").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
