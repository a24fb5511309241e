use rand::Rng;

use common::{AudioFeatures, GenreDetection, GenreGuess};
use metadata::MediaInfo;

const EMBEDDED_TAG_CONFIDENCE: f32 = 0.9;
const MAX_ALTERNATIVES: usize = 3;

/// Builds the feature vector for an asset. Tempo, key and loudness come
/// from embedded tags when present; the perceptual axes are placeholder
/// values drawn from bounded ranges until a real analyzer lands, so the
/// rng is injected and can be seeded for reproducible output.
pub fn analyze_features<R: Rng>(info: &MediaInfo, rng: &mut R) -> AudioFeatures {
    let tempo = info
        .bpm
        .filter(|bpm| *bpm > 0.0)
        .unwrap_or_else(|| rng.random_range(80..140) as f32);
    AudioFeatures {
        tempo: Some(tempo),
        key: info
            .initial_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .unwrap_or_else(|| "Unknown".to_string()),
        loudness: info.replay_gain_db,
        energy: rng.random_range(0.4..0.7),
        valence: rng.random_range(0.3..0.7),
        acousticness: rng.random_range(0.2..0.5),
        instrumentalness: rng.random_range(0.0..0.5),
        liveness: rng.random_range(0.1..0.4),
        speechiness: rng.random_range(0.05..0.25),
        danceability: rng.random_range(0.3..0.7),
    }
}

/// Rule-based genre guess. An embedded genre tag dominates; otherwise a
/// few tempo/feature heuristics vote with low confidence.
pub fn detect_genre(info: &MediaInfo, features: &AudioFeatures) -> GenreDetection {
    let mut candidates: Vec<GenreGuess> = Vec::new();

    if let Some(tag) = info.tags.genre.as_deref() {
        if !tag.trim().is_empty() {
            candidates.push(GenreGuess {
                label: normalize_genre(tag),
                confidence: EMBEDDED_TAG_CONFIDENCE,
            });
        }
    }

    let tempo = features.tempo.unwrap_or(0.0);
    if tempo > 120.0 && features.energy > 0.7 {
        candidates.push(GenreGuess {
            label: "Electronic".to_string(),
            confidence: 0.6,
        });
    }
    if tempo > 0.0 && tempo < 80.0 && features.acousticness > 0.6 {
        candidates.push(GenreGuess {
            label: "Ballad".to_string(),
            confidence: 0.5,
        });
    }
    if tempo > 100.0 && features.danceability > 0.6 {
        candidates.push(GenreGuess {
            label: "Pop".to_string(),
            confidence: 0.5,
        });
    }

    candidates.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    candidates.dedup_by(|a, b| a.label == b.label);

    let mut iter = candidates.into_iter();
    match iter.next() {
        None => GenreDetection::unknown(),
        Some(top) => GenreDetection {
            detected: top.label,
            confidence: top.confidence,
            alternatives: iter.take(MAX_ALTERNATIVES).collect(),
        },
    }
}

/// Maps the zoo of embedded genre spellings onto canonical labels.
pub fn normalize_genre(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase();
    match lowered.as_str() {
        "rock" => "Rock".to_string(),
        "pop" => "Pop".to_string(),
        "hip hop" | "hip-hop" | "rap" => "Hip Hop".to_string(),
        "r&b" | "rnb" => "R&B".to_string(),
        "electronic" | "edm" | "dance" => "Electronic".to_string(),
        "jazz" => "Jazz".to_string(),
        "classical" => "Classical".to_string(),
        "country" => "Country".to_string(),
        "ballad" => "Ballad".to_string(),
        "v-pop" | "vpop" => "V-Pop".to_string(),
        "k-pop" | "kpop" => "K-Pop".to_string(),
        _ => capitalize(raw.trim()),
    }
}

fn capitalize(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        None => "Unknown".to_string(),
        Some(first) => first.to_uppercase().chain(chars).collect(),
    }
}
