use std::path::Path;

use common::EmbeddedTags;
use lofty::error::LoftyError;
use lofty::file::FileType;
use lofty::picture::{Picture, PictureType};
use lofty::prelude::{AudioFile, ItemKey, TaggedFileExt};

/// Container-level technical properties plus the embedded tag snapshot and
/// the analysis hints (bpm / key / replay gain) later stages consume.
#[derive(Debug, Default, Clone)]
pub struct MediaInfo {
    pub duration_secs: f64,
    pub bitrate: Option<u32>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u8>,
    pub container: String,
    pub file_size: u64,
    pub tags: EmbeddedTags,
    pub bpm: Option<f32>,
    pub initial_key: Option<String>,
    pub replay_gain_db: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct CoverArt {
    pub data: Vec<u8>,
    pub mime: Option<String>,
}

#[derive(Debug)]
pub enum MetadataError {
    Io(std::io::Error),
    Lofty(LoftyError),
}

impl std::fmt::Display for MetadataError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetadataError::Io(err) => write!(f, "io error: {}", err),
            MetadataError::Lofty(err) => write!(f, "tag error: {}", err),
        }
    }
}

impl std::error::Error for MetadataError {}

impl From<std::io::Error> for MetadataError {
    fn from(err: std::io::Error) -> Self {
        MetadataError::Io(err)
    }
}

impl From<LoftyError> for MetadataError {
    fn from(err: LoftyError) -> Self {
        MetadataError::Lofty(err)
    }
}

/// Reads everything the pipeline needs from the raw upload in one probe.
pub fn read_media_info(path: &Path) -> Result<MediaInfo, MetadataError> {
    let file_size = std::fs::metadata(path)?.len();
    let tagged_file = lofty::read_from_path(path)?;
    let properties = tagged_file.properties();

    let mut info = MediaInfo {
        duration_secs: properties.duration().as_secs_f64(),
        bitrate: properties.audio_bitrate().or(properties.overall_bitrate()),
        sample_rate: properties.sample_rate(),
        channels: properties.channels(),
        container: container_label(tagged_file.file_type(), path),
        file_size,
        ..MediaInfo::default()
    };

    let Some(tag) = tagged_file.primary_tag().or_else(|| tagged_file.first_tag()) else {
        return Ok(info);
    };

    let get = |key: &ItemKey| tag.get_string(key).map(|v| v.trim().to_string());
    let (track_no, track_of) = match (
        tag.get_string(&ItemKey::TrackNumber),
        tag.get_string(&ItemKey::TrackTotal),
    ) {
        (Some(number), total) => {
            let (no, of_inline) = parse_track_position(number);
            (no, total.and_then(|v| v.trim().parse().ok()).or(of_inline))
        }
        (None, total) => (None, total.and_then(|v| v.trim().parse().ok())),
    };

    info.tags = EmbeddedTags {
        title: get(&ItemKey::TrackTitle),
        artist: get(&ItemKey::TrackArtist),
        album: get(&ItemKey::AlbumTitle),
        album_artist: get(&ItemKey::AlbumArtist),
        genre: get(&ItemKey::Genre).filter(|g| !g.is_empty()),
        year: tag.get_string(&ItemKey::Year).and_then(parse_year),
        track_no,
        track_of,
        composer: get(&ItemKey::Composer),
        comment: get(&ItemKey::Comment),
    };
    info.bpm = tag.get_string(&ItemKey::Bpm).and_then(|v| v.trim().parse().ok());
    info.initial_key = get(&ItemKey::InitialKey).filter(|k| !k.is_empty());
    info.replay_gain_db = tag
        .get_string(&ItemKey::ReplayGainTrackGain)
        .and_then(parse_gain_db);

    Ok(info)
}

/// Returns the embedded front cover (or the first picture) if one exists.
pub fn read_cover_art(path: &Path) -> Result<Option<CoverArt>, MetadataError> {
    let tagged_file = lofty::read_from_path(path)?;
    let Some(tag) = tagged_file.primary_tag().or_else(|| tagged_file.first_tag()) else {
        return Ok(None);
    };
    let Some(picture) = front_cover(tag.pictures()) else {
        return Ok(None);
    };
    let data = picture.data().to_vec();
    if data.is_empty() {
        return Ok(None);
    }
    let mime = picture
        .mime_type()
        .map(|m| m.as_str().to_string())
        .or_else(|| sniff_image_mime(&data));
    Ok(Some(CoverArt { data, mime }))
}

fn front_cover(pictures: &[Picture]) -> Option<&Picture> {
    pictures
        .iter()
        .find(|p| p.pic_type() == PictureType::CoverFront)
        .or_else(|| pictures.first())
}

fn container_label(file_type: FileType, path: &Path) -> String {
    let label = match file_type {
        FileType::Mpeg => "mp3",
        FileType::Flac => "flac",
        FileType::Wav => "wav",
        FileType::Mp4 => "m4a",
        FileType::Aac => "aac",
        FileType::Opus => "opus",
        FileType::Vorbis => "ogg",
        FileType::Aiff => "aiff",
        FileType::Ape => "ape",
        FileType::WavPack => "wv",
        FileType::Speex => "spx",
        FileType::Mpc => "mpc",
        _ => "",
    };
    if !label.is_empty() {
        return label.to_string();
    }
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default()
}

fn parse_track_position(value: &str) -> (Option<u16>, Option<u16>) {
    let mut parts = value.splitn(2, '/');
    let no = parts.next().and_then(|v| v.trim().parse().ok());
    let of = parts.next().and_then(|v| v.trim().parse().ok());
    (no, of)
}

fn parse_year(value: &str) -> Option<i32> {
    let digits: String = value
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .take(4)
        .collect();
    if digits.len() == 4 {
        digits.parse().ok()
    } else {
        None
    }
}

fn parse_gain_db(value: &str) -> Option<f32> {
    value
        .trim()
        .trim_end_matches(|c: char| c.is_ascii_alphabetic())
        .trim()
        .parse()
        .ok()
}

pub fn sniff_image_mime(bytes: &[u8]) -> Option<String> {
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("image/jpeg".to_string())
    } else if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
        Some("image/png".to_string())
    } else {
        None
    }
}
