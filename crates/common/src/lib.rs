use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Lifecycle of an uploaded asset. `Failed` is terminal; `Processing` is
/// entered exactly once, from `Pending`, by the pipeline run that owns the
/// upload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingState {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ProcessingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingState::Pending => "pending",
            ProcessingState::Processing => "processing",
            ProcessingState::Completed => "completed",
            ProcessingState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessingState::Completed | ProcessingState::Failed)
    }
}

/// Snapshot of the tags embedded in the uploaded file.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EmbeddedTags {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub album_artist: Option<String>,
    pub genre: Option<String>,
    pub year: Option<i32>,
    pub track_no: Option<u16>,
    pub track_of: Option<u16>,
    pub composer: Option<String>,
    pub comment: Option<String>,
}

/// Downsampled peak-amplitude series. `peaks` has exactly `length` entries,
/// each normalized to [0, 1]; `sample_rate` is the rate the source was
/// decoded at before downsampling.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Waveform {
    pub peaks: Vec<f32>,
    pub length: usize,
    #[serde(rename = "sampleRate")]
    pub sample_rate: u32,
}

/// Estimated acoustic features. Everything except tempo/key/loudness is a
/// bounded placeholder heuristic, not measured signal data.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AudioFeatures {
    pub tempo: Option<f32>,
    pub key: String,
    pub loudness: Option<f32>,
    pub energy: f32,
    pub valence: f32,
    pub acousticness: f32,
    pub instrumentalness: f32,
    pub liveness: f32,
    pub speechiness: f32,
    pub danceability: f32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenreGuess {
    pub label: String,
    pub confidence: f32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenreDetection {
    pub detected: String,
    pub confidence: f32,
    pub alternatives: Vec<GenreGuess>,
}

impl GenreDetection {
    pub fn unknown() -> Self {
        Self {
            detected: "Unknown".to_string(),
            confidence: 0.0,
            alternatives: Vec::new(),
        }
    }
}

/// Stable identifier of a stored artifact. Remote objects need an explicit
/// deletion call against durable storage; local files are deleted from the
/// filesystem.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageRef {
    Remote { id: String },
    Local { file_name: String },
}

impl StorageRef {
    pub fn encode(&self) -> String {
        match self {
            StorageRef::Remote { id } => format!("remote:{}", id),
            StorageRef::Local { file_name } => format!("local:{}", file_name),
        }
    }

    pub fn decode(value: &str) -> Option<Self> {
        if let Some(id) = value.strip_prefix("remote:") {
            if id.is_empty() {
                return None;
            }
            return Some(StorageRef::Remote { id: id.to_string() });
        }
        if let Some(file_name) = value.strip_prefix("local:") {
            if file_name.is_empty() {
                return None;
            }
            return Some(StorageRef::Local {
                file_name: file_name.to_string(),
            });
        }
        None
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, StorageRef::Remote { .. })
    }
}

impl std::fmt::Display for StorageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.encode())
    }
}

/// The central entity: one uploaded media item plus everything derived
/// from it. Technical and derived fields stay empty until the pipeline
/// completes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MediaAsset {
    pub id: String,
    pub owner: String,

    pub title: String,
    pub artist: String,
    #[serde(default)]
    pub album: String,
    #[serde(default)]
    pub genre: String,
    pub year: Option<i32>,
    #[serde(default)]
    pub lyrics: String,
    #[serde(default)]
    pub tags: Vec<String>,

    pub file_name: String,
    pub original_name: String,

    #[serde(default)]
    pub duration_secs: f64,
    #[serde(default)]
    pub file_size: u64,
    #[serde(default)]
    pub container: String,
    pub bitrate: Option<u32>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u8>,
    pub embedded: Option<EmbeddedTags>,

    pub waveform: Option<Waveform>,
    pub features: Option<AudioFeatures>,
    pub auto_genre: Option<GenreDetection>,

    pub audio_url: Option<String>,
    pub audio_ref: Option<StorageRef>,
    pub cover_url: Option<String>,
    pub cover_ref: Option<StorageRef>,

    #[serde(default)]
    pub play_count: u64,

    pub state: ProcessingState,
    pub error: Option<String>,
    pub created_at: u64,
}

impl MediaAsset {
    /// A freshly-uploaded asset: descriptive fields only, everything
    /// derived left empty, state `Pending`.
    pub fn pending(
        id: impl Into<String>,
        owner: impl Into<String>,
        title: impl Into<String>,
        artist: impl Into<String>,
        file_name: impl Into<String>,
        original_name: impl Into<String>,
    ) -> MediaAsset {
        MediaAsset {
            id: id.into(),
            owner: owner.into(),
            title: title.into(),
            artist: artist.into(),
            album: "Single".to_string(),
            genre: "Other".to_string(),
            year: None,
            lyrics: String::new(),
            tags: Vec::new(),
            file_name: file_name.into(),
            original_name: original_name.into(),
            duration_secs: 0.0,
            file_size: 0,
            container: String::new(),
            bitrate: None,
            sample_rate: None,
            channels: None,
            embedded: None,
            waveform: None,
            features: None,
            auto_genre: None,
            audio_url: None,
            audio_ref: None,
            cover_url: None,
            cover_ref: None,
            play_count: 0,
            state: ProcessingState::Pending,
            error: None,
            created_at: now_unix(),
        }
    }

    pub fn has_waveform(&self) -> bool {
        self.waveform
            .as_ref()
            .map(|w| !w.peaks.is_empty())
            .unwrap_or(false)
    }
}

pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Collision-resistant filename for a shared upload directory: monotonic
/// timestamp plus a random suffix, keeping the original extension.
pub fn unique_media_filename(prefix: &str, original_name: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let suffix: u32 = rand::rng().random_range(0..1_000_000_000);
    let ext = std::path::Path::new(original_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .filter(|e| !e.is_empty() && e.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or_else(|| "bin".to_string());
    format!("{}-{}-{}.{}", prefix, nanos, suffix, ext)
}

#[cfg(test)]
mod tests {
    use super::{unique_media_filename, StorageRef};

    #[test]
    fn storage_ref_round_trip() {
        let remote = StorageRef::Remote {
            id: "songs/abc123".to_string(),
        };
        assert_eq!(StorageRef::decode(&remote.encode()), Some(remote));

        let local = StorageRef::Local {
            file_name: "audio-1-2.mp3".to_string(),
        };
        assert_eq!(StorageRef::decode(&local.encode()), Some(local));
    }

    #[test]
    fn storage_ref_rejects_garbage() {
        assert_eq!(StorageRef::decode("remote:"), None);
        assert_eq!(StorageRef::decode("s3://bucket/key"), None);
        assert_eq!(StorageRef::decode(""), None);
    }

    #[test]
    fn filenames_keep_extension_and_differ() {
        let first = unique_media_filename("audio", "My Song.MP3");
        let second = unique_media_filename("audio", "My Song.MP3");
        assert!(first.starts_with("audio-"));
        assert!(first.ends_with(".mp3"));
        assert_ne!(first, second);
    }

    #[test]
    fn filenames_fall_back_without_extension() {
        let name = unique_media_filename("audio", "noext");
        assert!(name.ends_with(".bin"));
    }
}
