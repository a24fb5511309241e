use std::path::PathBuf;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use catalog::AssetCatalog;
use common::{AudioFeatures, GenreDetection, MediaAsset, Waveform};

use crate::config::ServerConfig;
use crate::pipeline::ActiveRuns;
use crate::storage::RemoteStorage;

#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<dyn AssetCatalog>,
    pub config: Arc<ServerConfig>,
    pub config_path: PathBuf,
    pub audio_dir: PathBuf,
    pub image_dir: PathBuf,
    pub storage: RemoteStorage,
    pub runs: ActiveRuns,
    pub jobs: Arc<Semaphore>,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadAccepted {
    pub asset_id: String,
    pub status: &'static str,
    pub title: String,
    pub artist: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub asset_id: String,
    pub title: String,
    pub artist: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WaveformResponse {
    pub asset_id: String,
    pub title: String,
    pub artist: String,
    pub waveform: Waveform,
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub page: Option<usize>,
    pub limit: Option<usize>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetView {
    pub asset_id: String,
    pub title: String,
    pub artist: String,
    pub album: String,
    pub genre: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    pub duration_secs: f64,
    pub play_count: u64,
    pub status: String,
    pub is_processing: bool,
    pub processing_failed: bool,
    pub has_waveform: bool,
    pub has_auto_genre: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cover_url: Option<String>,
    pub created_at: u64,
}

impl AssetView {
    pub fn from_asset(asset: &MediaAsset) -> AssetView {
        AssetView {
            asset_id: asset.id.clone(),
            title: asset.title.clone(),
            artist: asset.artist.clone(),
            album: asset.album.clone(),
            genre: asset.genre.clone(),
            year: asset.year,
            duration_secs: asset.duration_secs,
            play_count: asset.play_count,
            status: asset.state.as_str().to_string(),
            is_processing: !asset.state.is_terminal(),
            processing_failed: asset.state == common::ProcessingState::Failed,
            has_waveform: asset.has_waveform(),
            has_auto_genre: asset.auto_genre.is_some(),
            audio_url: asset.audio_url.clone(),
            cover_url: asset.cover_url.clone(),
            created_at: asset.created_at,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadsPage {
    pub items: Vec<AssetView>,
    pub total: usize,
    pub page: usize,
    pub limit: usize,
}

#[derive(Debug, Deserialize)]
pub struct EditRequest {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub genre: Option<String>,
    pub year: Option<i32>,
    pub lyrics: Option<String>,
    pub tags: Option<Vec<String>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayResponse {
    pub asset_id: String,
    pub play_count: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackMetadata {
    pub asset_id: String,
    pub title: String,
    pub artist: String,
    pub album: String,
    pub duration_secs: f64,
    pub container: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub features: Option<AudioFeatures>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_genre: Option<GenreDetection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cover_url: Option<String>,
}

pub type JsonResult<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;
