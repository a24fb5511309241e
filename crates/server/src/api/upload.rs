use axum::extract::{Multipart, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use tracing::{info, warn};
use uuid::Uuid;

use catalog::{AssetEdit, CatalogError};
use common::{unique_media_filename, MediaAsset, ProcessingState};
use serde::Serialize;

use crate::api::caller;
use crate::pipeline::start_pipeline;
use crate::state::{
    AppState, AssetView, EditRequest, ErrorResponse, JsonResult, PageQuery, StatusResponse,
    UploadAccepted, UploadsPage, WaveformResponse,
};
use crate::utils::json_error;

const DEFAULT_PAGE_SIZE: usize = 20;
const MAX_PAGE_SIZE: usize = 100;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteResponse {
    pub asset_id: String,
    pub deleted: bool,
}

/// Multipart intake. The audio file is written to disk, the asset record
/// is persisted as pending and the processing run detaches; the 202
/// response returns while the stages are still ahead.
pub async fn upload_asset(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<UploadAccepted>), (StatusCode, Json<ErrorResponse>)> {
    let mut audio: Option<(String, String)> = None;
    let mut cover: Option<String> = None;
    let mut title = String::new();
    let mut artist = String::new();
    let mut album = String::new();
    let mut genre = String::new();
    let mut year: Option<i32> = None;
    let mut lyrics = String::new();
    let mut tags: Vec<String> = Vec::new();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => {
                cleanup_files(&state, &audio, &cover).await;
                return Err(json_error(
                    StatusCode::BAD_REQUEST,
                    format!("invalid multipart payload: {}", err),
                ));
            }
        };
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "audioFile" => {
                let original = field.file_name().unwrap_or("upload.bin").to_string();
                let data = match field.bytes().await {
                    Ok(data) => data,
                    Err(err) => {
                        cleanup_files(&state, &audio, &cover).await;
                        return Err(json_error(
                            StatusCode::BAD_REQUEST,
                            format!("failed to read audio file: {}", err),
                        ));
                    }
                };
                if data.is_empty() {
                    cleanup_files(&state, &audio, &cover).await;
                    return Err(json_error(StatusCode::BAD_REQUEST, "audio file is empty"));
                }
                let file_name = unique_media_filename("song", &original);
                if let Err(err) = tokio::fs::write(state.audio_dir.join(&file_name), &data).await {
                    cleanup_files(&state, &audio, &cover).await;
                    return Err(json_error(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        format!("failed to store audio file: {}", err),
                    ));
                }
                audio = Some((file_name, original));
            }
            "coverImage" => {
                let original = field.file_name().unwrap_or("cover.jpg").to_string();
                let data = match field.bytes().await {
                    Ok(data) => data,
                    Err(err) => {
                        cleanup_files(&state, &audio, &cover).await;
                        return Err(json_error(
                            StatusCode::BAD_REQUEST,
                            format!("failed to read cover image: {}", err),
                        ));
                    }
                };
                if data.is_empty() {
                    continue;
                }
                let file_name = unique_media_filename("cover", &original);
                if let Err(err) = tokio::fs::write(state.image_dir.join(&file_name), &data).await {
                    cleanup_files(&state, &audio, &cover).await;
                    return Err(json_error(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        format!("failed to store cover image: {}", err),
                    ));
                }
                cover = Some(file_name);
            }
            "title" => title = text_field(&state, field, &audio, &cover).await?,
            "artist" => artist = text_field(&state, field, &audio, &cover).await?,
            "album" => album = text_field(&state, field, &audio, &cover).await?,
            "genre" => genre = text_field(&state, field, &audio, &cover).await?,
            "year" => {
                let value = text_field(&state, field, &audio, &cover).await?;
                year = value.trim().parse::<i32>().ok();
            }
            "lyrics" => lyrics = text_field(&state, field, &audio, &cover).await?,
            "tags" => {
                let value = text_field(&state, field, &audio, &cover).await?;
                tags = split_tags(&value);
            }
            _ => {}
        }
    }

    let Some((file_name, original_name)) = audio else {
        cleanup_files(&state, &None, &cover).await;
        return Err(json_error(StatusCode::BAD_REQUEST, "audio file is required"));
    };
    if title.trim().is_empty() {
        cleanup_files(&state, &Some((file_name, original_name)), &cover).await;
        return Err(json_error(StatusCode::BAD_REQUEST, "title is required"));
    }
    if artist.trim().is_empty() {
        cleanup_files(&state, &Some((file_name, original_name)), &cover).await;
        return Err(json_error(StatusCode::BAD_REQUEST, "artist is required"));
    }

    let asset_id = Uuid::new_v4().to_string();
    let owner = caller(&headers);
    let mut asset = MediaAsset::pending(
        &asset_id,
        &owner,
        title.trim(),
        artist.trim(),
        &file_name,
        &original_name,
    );
    if !album.trim().is_empty() {
        asset.album = album.trim().to_string();
    }
    if !genre.trim().is_empty() {
        asset.genre = genre.trim().to_string();
    }
    asset.year = year;
    asset.lyrics = lyrics;
    asset.tags = tags;

    if let Err(err) = state.catalog.insert(asset) {
        cleanup_files(&state, &Some((file_name, original_name)), &cover).await;
        return Err(db_error(err));
    }

    info!("Accepted upload {} from {} ({})", asset_id, owner, original_name);
    start_pipeline(state.clone(), asset_id.clone(), file_name, cover);

    Ok((
        StatusCode::ACCEPTED,
        Json(UploadAccepted {
            asset_id,
            status: "processing",
            title: title.trim().to_string(),
            artist: artist.trim().to_string(),
        }),
    ))
}

pub async fn upload_status(
    State(state): State<AppState>,
    Path(asset_id): Path<String>,
    headers: HeaderMap,
) -> JsonResult<StatusResponse> {
    let asset = owned_asset(&state, &asset_id, &caller(&headers))?;
    Ok(Json(StatusResponse {
        asset_id: asset.id,
        title: asset.title,
        artist: asset.artist,
        status: asset.state.as_str().to_string(),
        error: asset.error,
        created_at: asset.created_at,
    }))
}

pub async fn upload_waveform(
    State(state): State<AppState>,
    Path(asset_id): Path<String>,
) -> JsonResult<WaveformResponse> {
    let asset = state
        .catalog
        .get(&asset_id)
        .map_err(db_error)?
        .ok_or_else(|| json_error(StatusCode::NOT_FOUND, "asset not found"))?;
    if asset.state != ProcessingState::Completed {
        return Err(json_error(
            StatusCode::BAD_REQUEST,
            "processing has not completed yet",
        ));
    }
    let waveform = asset
        .waveform
        .ok_or_else(|| json_error(StatusCode::NOT_FOUND, "waveform unavailable"))?;
    Ok(Json(WaveformResponse {
        asset_id: asset.id,
        title: asset.title,
        artist: asset.artist,
        waveform,
    }))
}

pub async fn my_uploads(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
    headers: HeaderMap,
) -> JsonResult<UploadsPage> {
    let owner = caller(&headers);
    let page = query.page.unwrap_or(1).max(1);
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    let offset = (page - 1) * limit;
    let (assets, total) = state
        .catalog
        .list_by_owner(&owner, limit, offset)
        .map_err(db_error)?;
    Ok(Json(UploadsPage {
        items: assets.iter().map(AssetView::from_asset).collect(),
        total,
        page,
        limit,
    }))
}

pub async fn update_asset(
    State(state): State<AppState>,
    Path(asset_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<EditRequest>,
) -> JsonResult<AssetView> {
    owned_asset(&state, &asset_id, &caller(&headers))?;
    let edit = AssetEdit {
        title: non_empty(request.title),
        artist: non_empty(request.artist),
        album: non_empty(request.album),
        genre: non_empty(request.genre),
        year: request.year,
        lyrics: request.lyrics,
        tags: request.tags,
    };
    let updated = state
        .catalog
        .update_details(&asset_id, edit)
        .map_err(db_error)?
        .ok_or_else(|| json_error(StatusCode::NOT_FOUND, "asset not found"))?;
    Ok(Json(AssetView::from_asset(&updated)))
}

/// Removes the record, cancels any in-flight processing run and schedules
/// removal of the stored bytes. Storage errors are logged, not surfaced;
/// the record is already gone.
pub async fn delete_asset(
    State(state): State<AppState>,
    Path(asset_id): Path<String>,
    headers: HeaderMap,
) -> JsonResult<DeleteResponse> {
    owned_asset(&state, &asset_id, &caller(&headers))?;

    if state.runs.cancel(&asset_id) {
        info!("Cancelled in-flight processing for {}", asset_id);
    }
    let removed = state
        .catalog
        .delete(&asset_id)
        .map_err(db_error)?
        .ok_or_else(|| json_error(StatusCode::NOT_FOUND, "asset not found"))?;

    if let Some(audio_ref) = &removed.audio_ref {
        if let Err(err) = state.storage.delete(audio_ref, &state.audio_dir).await {
            warn!("Could not remove audio for {}: {}", asset_id, err);
        }
    } else {
        // Never made it through the pipeline; drop the raw upload.
        tokio::fs::remove_file(state.audio_dir.join(&removed.file_name))
            .await
            .ok();
    }
    if let Some(cover_ref) = &removed.cover_ref {
        if let Err(err) = state.storage.delete(cover_ref, &state.image_dir).await {
            warn!("Could not remove cover for {}: {}", asset_id, err);
        }
    }

    Ok(Json(DeleteResponse {
        asset_id,
        deleted: true,
    }))
}

fn owned_asset(
    state: &AppState,
    asset_id: &str,
    owner: &str,
) -> Result<MediaAsset, (StatusCode, Json<ErrorResponse>)> {
    let asset = state
        .catalog
        .get(asset_id)
        .map_err(db_error)?
        .ok_or_else(|| json_error(StatusCode::NOT_FOUND, "asset not found"))?;
    if asset.owner != owner {
        // Same shape as a missing asset; ids are not probeable.
        return Err(json_error(StatusCode::NOT_FOUND, "asset not found"));
    }
    Ok(asset)
}

fn db_error(err: CatalogError) -> (StatusCode, Json<ErrorResponse>) {
    json_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("catalog error: {}", err),
    )
}

async fn text_field(
    state: &AppState,
    field: axum::extract::multipart::Field<'_>,
    audio: &Option<(String, String)>,
    cover: &Option<String>,
) -> Result<String, (StatusCode, Json<ErrorResponse>)> {
    match field.text().await {
        Ok(value) => Ok(value),
        Err(err) => {
            cleanup_files(state, audio, cover).await;
            Err(json_error(
                StatusCode::BAD_REQUEST,
                format!("invalid form field: {}", err),
            ))
        }
    }
}

async fn cleanup_files(
    state: &AppState,
    audio: &Option<(String, String)>,
    cover: &Option<String>,
) {
    if let Some((file_name, _)) = audio {
        tokio::fs::remove_file(state.audio_dir.join(file_name)).await.ok();
    }
    if let Some(file_name) = cover {
        tokio::fs::remove_file(state.image_dir.join(file_name)).await.ok();
    }
}

fn split_tags(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(str::to_string)
        .collect()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use axum::response::Response;
    use tokio::sync::Semaphore;
    use tower::ServiceExt;

    use catalog::MemoryCatalog;

    use crate::api::api_router;
    use crate::config::ServerConfig;
    use crate::pipeline::ActiveRuns;
    use crate::storage::RemoteStorage;

    const BOUNDARY: &str = "tonefall-test-boundary";

    #[test]
    fn tags_split_on_commas_and_trim() {
        assert_eq!(split_tags("lofi, chill , ,study"), vec!["lofi", "chill", "study"]);
        assert!(split_tags("").is_empty());
    }

    #[test]
    fn blank_edits_are_dropped() {
        assert_eq!(non_empty(Some("  ".to_string())), None);
        assert_eq!(non_empty(Some(" x ".to_string())), Some("x".to_string()));
        assert_eq!(non_empty(None), None);
    }

    fn test_state(tag: &str) -> AppState {
        let root =
            std::env::temp_dir().join(format!("tonefall-api-{}-{}", tag, std::process::id()));
        let audio_dir = root.join("audio");
        let image_dir = root.join("images");
        std::fs::create_dir_all(&audio_dir).unwrap();
        std::fs::create_dir_all(&image_dir).unwrap();
        let config = ServerConfig {
            analysis_seed: Some(7),
            ..ServerConfig::default()
        };
        let storage = RemoteStorage::new(&config).unwrap();
        AppState {
            catalog: Arc::new(MemoryCatalog::new()),
            config: Arc::new(config),
            config_path: root.join("config.yaml"),
            audio_dir,
            image_dir,
            storage,
            runs: ActiveRuns::new(),
            jobs: Arc::new(Semaphore::new(2)),
        }
    }

    fn multipart_body(parts: &[(&str, Option<&str>, &[u8])]) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, filename, data) in parts {
            body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
            match filename {
                Some(filename) => body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: application/octet-stream\r\n\r\n",
                        name, filename
                    )
                    .as_bytes(),
                ),
                None => body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name)
                        .as_bytes(),
                ),
            }
            body.extend_from_slice(data);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
        body
    }

    async fn post_upload(state: &AppState, user: &str, body: Vec<u8>) -> Response {
        let request = Request::builder()
            .method("POST")
            .uri("/upload")
            .header("x-user", user)
            .header(
                "content-type",
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(body))
            .unwrap();
        api_router(state.clone()).oneshot(request).await.unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn upload_without_audio_is_rejected() {
        let state = test_state("no-audio");
        let body = multipart_body(&[("title", None, b"Song"), ("artist", None, b"Me")]);
        let response = post_upload(&state, "alice", body).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], "audio file is required");
        std::fs::remove_dir_all(state.audio_dir.parent().unwrap()).ok();
    }

    #[tokio::test]
    async fn upload_without_title_is_rejected_and_cleaned_up() {
        let state = test_state("no-title");
        let body = multipart_body(&[
            ("audioFile", Some("take.mp3"), b"not really audio"),
            ("artist", None, b"Me"),
        ]);
        let response = post_upload(&state, "alice", body).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], "title is required");
        // The rejected audio file must not linger on disk.
        assert_eq!(std::fs::read_dir(&state.audio_dir).unwrap().count(), 0);
        std::fs::remove_dir_all(state.audio_dir.parent().unwrap()).ok();
    }

    #[tokio::test]
    async fn accepted_upload_processes_to_completion() {
        let state = test_state("accept");
        let body = multipart_body(&[
            ("audioFile", Some("take.mp3"), b"not really audio"),
            ("title", None, b"My Song"),
            ("artist", None, b"Me"),
            ("tags", None, b"demo, lofi"),
        ]);
        let response = post_upload(&state, "alice", body).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let value = json_body(response).await;
        assert_eq!(value["status"], "processing");
        let asset_id = value["assetId"].as_str().unwrap().to_string();

        let mut done = None;
        for _ in 0..200 {
            if let Some(asset) = state.catalog.get(&asset_id).unwrap() {
                if asset.state.is_terminal() {
                    done = Some(asset);
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let asset = done.expect("pipeline did not finish");
        assert_eq!(asset.state, ProcessingState::Completed);
        assert_eq!(asset.owner, "alice");
        assert_eq!(asset.tags, vec!["demo", "lofi"]);
        assert!(asset.audio_url.is_some());
        std::fs::remove_dir_all(state.audio_dir.parent().unwrap()).ok();
    }

    #[tokio::test]
    async fn status_is_hidden_from_other_callers() {
        let state = test_state("owner");
        let body = multipart_body(&[
            ("audioFile", Some("take.mp3"), b"bytes"),
            ("title", None, b"Private"),
            ("artist", None, b"Me"),
        ]);
        let response = post_upload(&state, "alice", body).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let asset_id = json_body(response).await["assetId"]
            .as_str()
            .unwrap()
            .to_string();

        let request = Request::builder()
            .uri(format!("/upload/{}/status", asset_id))
            .header("x-user", "mallory")
            .body(Body::empty())
            .unwrap();
        let response = api_router(state.clone()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let request = Request::builder()
            .uri(format!("/upload/{}/status", asset_id))
            .header("x-user", "alice")
            .body(Body::empty())
            .unwrap();
        let response = api_router(state.clone()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        std::fs::remove_dir_all(state.audio_dir.parent().unwrap()).ok();
    }
}
