use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use tracing::{error, info, warn};

use catalog::CompletedUpdate;
use metadata::MediaInfo;

use crate::analysis;
use crate::state::AppState;
use crate::storage::{local_cover_url, local_media_url};
use crate::waveform;

/// Registry of in-flight processing runs. Each run owns a cancellation
/// flag; deleting an asset flips it and the run stops before its next
/// stage. At most one run may exist per asset id.
#[derive(Clone, Default)]
pub struct ActiveRuns {
    inner: Arc<Mutex<HashMap<String, Arc<AtomicBool>>>>,
}

impl ActiveRuns {
    pub fn new() -> ActiveRuns {
        ActiveRuns::default()
    }

    /// Registers a run and returns its cancellation flag, or `None` when
    /// the asset is already being processed.
    pub fn register(&self, asset_id: &str) -> Option<Arc<AtomicBool>> {
        let mut runs = self.inner.lock();
        if runs.contains_key(asset_id) {
            return None;
        }
        let flag = Arc::new(AtomicBool::new(false));
        runs.insert(asset_id.to_string(), Arc::clone(&flag));
        Some(flag)
    }

    /// Flags a run as cancelled. Returns false when no run is active.
    pub fn cancel(&self, asset_id: &str) -> bool {
        match self.inner.lock().get(asset_id) {
            Some(flag) => {
                flag.store(true, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    fn remove(&self, asset_id: &str) {
        self.inner.lock().remove(asset_id);
    }
}

/// Detaches the processing run for a freshly-accepted upload. Returns
/// immediately; the caller responds 202 while the stages execute on the
/// bounded worker pool.
pub fn start_pipeline(
    state: AppState,
    asset_id: String,
    audio_file: String,
    provided_cover: Option<String>,
) {
    let Some(cancel) = state.runs.register(&asset_id) else {
        warn!("Asset {} is already being processed; duplicate run refused", asset_id);
        return;
    };

    tokio::spawn(async move {
        let permit = match Arc::clone(&state.jobs).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                state.runs.remove(&asset_id);
                return;
            }
        };

        match run(&state, &asset_id, &audio_file, provided_cover, &cancel).await {
            Ok(true) => info!("Processing completed for {}", asset_id),
            Ok(false) => info!("Processing cancelled for {}", asset_id),
            Err(message) => {
                error!("Processing failed for {}: {}", asset_id, message);
                if let Err(err) = state.catalog.fail(&asset_id, &message) {
                    error!("Could not record failure for {}: {}", asset_id, err);
                }
            }
        }

        drop(permit);
        state.runs.remove(&asset_id);
    });
}

/// Runs the stages in order. `Ok(false)` means the run observed its
/// cancellation flag and stopped without a terminal write (the record is
/// gone by then). Stage failures are non-fatal and replaced by documented
/// defaults; only unexpected task errors or catalog write failures
/// propagate as `Err` and end in a `Failed` record.
async fn run(
    state: &AppState,
    asset_id: &str,
    audio_file: &str,
    provided_cover: Option<String>,
    cancel: &AtomicBool,
) -> Result<bool, String> {
    state
        .catalog
        .begin_processing(asset_id)
        .map_err(|err| format!("begin processing: {}", err))?;

    let audio_path = state.audio_dir.join(audio_file);

    if cancel.load(Ordering::Relaxed) {
        return Ok(false);
    }

    let info = {
        let path = audio_path.clone();
        match tokio::task::spawn_blocking(move || metadata::read_media_info(&path)).await {
            Ok(Ok(info)) => info,
            Ok(Err(err)) => {
                warn!("Metadata extraction failed for {}: {}", asset_id, err);
                default_media_info(&audio_path).await
            }
            Err(err) => return Err(format!("metadata task: {}", err)),
        }
    };

    if cancel.load(Ordering::Relaxed) {
        return Ok(false);
    }

    let cover_file = match provided_cover {
        Some(name) => Some(name),
        None => extract_embedded_cover(state, asset_id, &audio_path).await,
    };

    if cancel.load(Ordering::Relaxed) {
        return Ok(false);
    }

    let wave = {
        let path = audio_path.clone();
        let samples = state.config.waveform_samples;
        match tokio::task::spawn_blocking(move || waveform::generate_waveform(&path, samples)).await
        {
            Ok(Ok(wave)) => wave,
            Ok(Err(err)) => {
                warn!("Waveform generation failed for {}: {}", asset_id, err);
                waveform::fallback_waveform()
            }
            Err(err) => return Err(format!("waveform task: {}", err)),
        }
    };

    if cancel.load(Ordering::Relaxed) {
        return Ok(false);
    }

    let mut rng = match state.config.analysis_seed {
        Some(seed) => SmallRng::seed_from_u64(seed ^ id_hash(asset_id)),
        None => SmallRng::from_os_rng(),
    };
    let features = analysis::analyze_features(&info, &mut rng);
    let auto_genre = analysis::detect_genre(&info, &features);

    if cancel.load(Ordering::Relaxed) {
        return Ok(false);
    }

    let base_url = state.config.public_base_url.as_str();
    let stored_audio = state
        .storage
        .store_media(
            "songs",
            &audio_path,
            audio_file,
            local_media_url(base_url, audio_file),
        )
        .await;
    let stored_cover = match cover_file {
        Some(name) => {
            let path = state.image_dir.join(&name);
            Some(
                state
                    .storage
                    .store_media("covers", &path, &name, local_cover_url(base_url, &name))
                    .await,
            )
        }
        None => None,
    };

    if cancel.load(Ordering::Relaxed) {
        return Ok(false);
    }

    let (cover_url, cover_ref) = match stored_cover {
        Some(stored) => (Some(stored.url), Some(stored.storage_ref)),
        None => (None, None),
    };
    let update = CompletedUpdate {
        duration_secs: info.duration_secs,
        file_size: info.file_size,
        container: info.container.clone(),
        bitrate: info.bitrate,
        sample_rate: info.sample_rate,
        channels: info.channels,
        embedded: Some(info.tags.clone()),
        waveform: wave,
        features,
        auto_genre,
        audio_url: stored_audio.url,
        audio_ref: stored_audio.storage_ref,
        cover_url,
        cover_ref,
    };
    state
        .catalog
        .complete(asset_id, update)
        .map_err(|err| format!("terminal write: {}", err))?;
    Ok(true)
}

/// Zeroed metadata for undecodable uploads; the asset still completes.
async fn default_media_info(audio_path: &Path) -> MediaInfo {
    let mut info = MediaInfo::default();
    if let Ok(meta) = tokio::fs::metadata(audio_path).await {
        info.file_size = meta.len();
    }
    info.container = audio_path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    info
}

async fn extract_embedded_cover(
    state: &AppState,
    asset_id: &str,
    audio_path: &Path,
) -> Option<String> {
    let path = audio_path.to_path_buf();
    let art = match tokio::task::spawn_blocking(move || metadata::read_cover_art(&path)).await {
        Ok(Ok(Some(art))) => art,
        Ok(Ok(None)) => return None,
        Ok(Err(err)) => {
            warn!("Cover extraction failed for {}: {}", asset_id, err);
            return None;
        }
        Err(err) => {
            warn!("Cover task failed for {}: {}", asset_id, err);
            return None;
        }
    };

    let ext = match art.mime.as_deref() {
        Some("image/png") => "png",
        _ => "jpg",
    };
    let file_name = common::unique_media_filename("cover", &format!("embedded.{}", ext));
    match tokio::fs::write(state.image_dir.join(&file_name), &art.data).await {
        Ok(()) => Some(file_name),
        Err(err) => {
            warn!("Could not persist embedded cover for {}: {}", asset_id, err);
            None
        }
    }
}

fn id_hash(asset_id: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    asset_id.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use catalog::{AssetCatalog, MemoryCatalog};
    use common::{MediaAsset, ProcessingState};
    use tokio::sync::Semaphore;

    use crate::config::ServerConfig;
    use crate::storage::RemoteStorage;

    fn test_state(tag: &str) -> AppState {
        let root = std::env::temp_dir().join(format!("tonefall-pipe-{}-{}", tag, std::process::id()));
        let audio_dir = root.join("audio");
        let image_dir = root.join("images");
        std::fs::create_dir_all(&audio_dir).unwrap();
        std::fs::create_dir_all(&image_dir).unwrap();
        let config = ServerConfig {
            analysis_seed: Some(42),
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

    async fn wait_terminal(state: &AppState, id: &str) -> MediaAsset {
        for _ in 0..200 {
            if let Some(asset) = state.catalog.get(id).unwrap() {
                if asset.state.is_terminal() {
                    return asset;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("pipeline did not reach a terminal state");
    }

    #[test]
    fn duplicate_registration_is_refused() {
        let runs = ActiveRuns::new();
        assert!(runs.register("a").is_some());
        assert!(runs.register("a").is_none());
        runs.remove("a");
        assert!(runs.register("a").is_some());
    }

    #[test]
    fn cancel_flips_the_flag() {
        let runs = ActiveRuns::new();
        let flag = runs.register("a").unwrap();
        assert!(!flag.load(Ordering::Relaxed));
        assert!(runs.cancel("a"));
        assert!(flag.load(Ordering::Relaxed));
        assert!(!runs.cancel("missing"));
    }

    #[tokio::test]
    async fn corrupted_upload_still_completes_with_defaults() {
        let state = test_state("corrupt");
        let file_name = "song-1-1.mp3".to_string();
        std::fs::write(state.audio_dir.join(&file_name), b"definitely not audio").unwrap();
        let asset = MediaAsset::pending("a1", "tester", "Broken", "Nobody", &file_name, "b.mp3");
        state.catalog.insert(asset).unwrap();

        start_pipeline(state.clone(), "a1".to_string(), file_name, None);
        let done = wait_terminal(&state, "a1").await;

        assert_eq!(done.state, ProcessingState::Completed);
        assert_eq!(done.duration_secs, 0.0);
        assert!(done.file_size > 0);
        let wave = done.waveform.unwrap();
        assert_eq!(wave.length, 100);
        assert_eq!(done.auto_genre.unwrap().detected, "Unknown");
        // Remote storage is unconfigured, so the asset serves locally.
        assert!(done.audio_url.unwrap().contains("/media/"));
        assert!(matches!(done.audio_ref, Some(common::StorageRef::Local { .. })));
        std::fs::remove_dir_all(state.audio_dir.parent().unwrap()).ok();
    }

    #[tokio::test]
    async fn cancelled_run_writes_no_terminal_state() {
        let state = test_state("cancel");
        let file_name = "song-2-2.mp3".to_string();
        std::fs::write(state.audio_dir.join(&file_name), b"noise").unwrap();
        let asset = MediaAsset::pending("a2", "tester", "Gone", "Nobody", &file_name, "g.mp3");
        state.catalog.insert(asset).unwrap();

        // Cancelled before the spawned run gets to its first stage check.
        let flag = state.runs.register("a2").unwrap();
        flag.store(true, Ordering::Relaxed);
        let cancelled = run(&state, "a2", &file_name, None, &flag).await.unwrap();
        assert!(!cancelled);

        let asset = state.catalog.get("a2").unwrap().unwrap();
        assert_eq!(asset.state, ProcessingState::Processing);
        assert!(asset.audio_url.is_none());
        std::fs::remove_dir_all(state.audio_dir.parent().unwrap()).ok();
    }
}
