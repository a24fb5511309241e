//! Asset repository. Two implementations of the same interface: a
//! redb-backed store for normal operation and an in-memory store for tests
//! and ephemeral deployments, selected by server configuration.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use redb::{
    CommitError, Database, DatabaseError, ReadableTable, StorageError, TableDefinition,
    TableError, TransactionError,
};
use serde::{Deserialize, Serialize};

use common::{
    AudioFeatures, EmbeddedTags, GenreDetection, MediaAsset, ProcessingState, StorageRef,
    Waveform,
};

const ASSETS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("assets");
const HISTORY_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("play_history");

/// Everything the pipeline writes in its single terminal update.
#[derive(Clone, Debug)]
pub struct CompletedUpdate {
    pub duration_secs: f64,
    pub file_size: u64,
    pub container: String,
    pub bitrate: Option<u32>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u8>,
    pub embedded: Option<EmbeddedTags>,
    pub waveform: Waveform,
    pub features: AudioFeatures,
    pub auto_genre: GenreDetection,
    pub audio_url: String,
    pub audio_ref: StorageRef,
    pub cover_url: Option<String>,
    pub cover_ref: Option<StorageRef>,
}

/// Descriptive fields a caller may edit after upload.
#[derive(Clone, Debug, Default)]
pub struct AssetEdit {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub genre: Option<String>,
    pub year: Option<i32>,
    pub lyrics: Option<String>,
    pub tags: Option<Vec<String>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlayEvent {
    pub user: String,
    pub asset_id: String,
    pub played_at: u64,
}

pub trait AssetCatalog: Send + Sync {
    fn insert(&self, asset: MediaAsset) -> Result<(), CatalogError>;
    fn get(&self, id: &str) -> Result<Option<MediaAsset>, CatalogError>;
    /// Enters `Processing`. Legal only from `Pending`, and therefore at
    /// most once per asset.
    fn begin_processing(&self, id: &str) -> Result<(), CatalogError>;
    /// Terminal success write: all enriched fields plus `Completed`.
    fn complete(&self, id: &str, update: CompletedUpdate) -> Result<(), CatalogError>;
    /// Terminal failure write. `Failed` is never left again.
    fn fail(&self, id: &str, message: &str) -> Result<(), CatalogError>;
    fn update_details(&self, id: &str, edit: AssetEdit)
        -> Result<Option<MediaAsset>, CatalogError>;
    /// Newest-first page of one owner's assets plus the owner's total.
    fn list_by_owner(
        &self,
        owner: &str,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<MediaAsset>, usize), CatalogError>;
    /// Removes the record, returning it so the caller can schedule storage
    /// cleanup from its refs.
    fn delete(&self, id: &str) -> Result<Option<MediaAsset>, CatalogError>;
    fn increment_play_count(&self, id: &str) -> Result<Option<u64>, CatalogError>;
    fn record_play(&self, event: PlayEvent) -> Result<(), CatalogError>;
    fn plays_for_user(&self, user: &str, limit: usize) -> Result<Vec<PlayEvent>, CatalogError>;
}

#[derive(Debug)]
pub enum CatalogError {
    Io(std::io::Error),
    Database(DatabaseError),
    Table(TableError),
    Transaction(TransactionError),
    Storage(StorageError),
    Commit(CommitError),
    Bincode(Box<bincode::ErrorKind>),
    AssetMissing,
    InvalidTransition {
        from: ProcessingState,
        to: ProcessingState,
    },
}

impl std::fmt::Display for CatalogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CatalogError::Io(err) => write!(f, "io error: {}", err),
            CatalogError::Database(err) => write!(f, "redb database error: {}", err),
            CatalogError::Table(err) => write!(f, "redb table error: {}", err),
            CatalogError::Transaction(err) => write!(f, "redb transaction error: {}", err),
            CatalogError::Storage(err) => write!(f, "redb storage error: {}", err),
            CatalogError::Commit(err) => write!(f, "redb commit error: {}", err),
            CatalogError::Bincode(err) => write!(f, "bincode error: {}", err),
            CatalogError::AssetMissing => write!(f, "asset not found"),
            CatalogError::InvalidTransition { from, to } => {
                write!(f, "invalid state transition {} -> {}", from.as_str(), to.as_str())
            }
        }
    }
}

impl std::error::Error for CatalogError {}

impl From<std::io::Error> for CatalogError {
    fn from(err: std::io::Error) -> Self {
        CatalogError::Io(err)
    }
}

impl From<DatabaseError> for CatalogError {
    fn from(err: DatabaseError) -> Self {
        CatalogError::Database(err)
    }
}

impl From<TableError> for CatalogError {
    fn from(err: TableError) -> Self {
        CatalogError::Table(err)
    }
}

impl From<TransactionError> for CatalogError {
    fn from(err: TransactionError) -> Self {
        CatalogError::Transaction(err)
    }
}

impl From<StorageError> for CatalogError {
    fn from(err: StorageError) -> Self {
        CatalogError::Storage(err)
    }
}

impl From<CommitError> for CatalogError {
    fn from(err: CommitError) -> Self {
        CatalogError::Commit(err)
    }
}

impl From<Box<bincode::ErrorKind>> for CatalogError {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        CatalogError::Bincode(err)
    }
}

fn apply_completed(asset: &mut MediaAsset, update: CompletedUpdate) {
    asset.duration_secs = update.duration_secs;
    asset.file_size = update.file_size;
    asset.container = update.container;
    asset.bitrate = update.bitrate;
    asset.sample_rate = update.sample_rate;
    asset.channels = update.channels;
    asset.embedded = update.embedded;
    asset.waveform = Some(update.waveform);
    asset.features = Some(update.features);
    asset.auto_genre = Some(update.auto_genre);
    asset.audio_url = Some(update.audio_url);
    asset.audio_ref = Some(update.audio_ref);
    asset.cover_url = update.cover_url;
    asset.cover_ref = update.cover_ref;
    asset.state = ProcessingState::Completed;
    asset.error = None;
}

fn apply_edit(asset: &mut MediaAsset, edit: AssetEdit) {
    if let Some(title) = edit.title {
        asset.title = title;
    }
    if let Some(artist) = edit.artist {
        asset.artist = artist;
    }
    if let Some(album) = edit.album {
        asset.album = album;
    }
    if let Some(genre) = edit.genre {
        asset.genre = genre;
    }
    if let Some(year) = edit.year {
        asset.year = Some(year);
    }
    if let Some(lyrics) = edit.lyrics {
        asset.lyrics = lyrics;
    }
    if let Some(tags) = edit.tags {
        asset.tags = tags;
    }
}

fn check_transition(
    current: ProcessingState,
    next: ProcessingState,
) -> Result<(), CatalogError> {
    let legal = match next {
        ProcessingState::Processing => current == ProcessingState::Pending,
        ProcessingState::Completed => current == ProcessingState::Processing,
        ProcessingState::Failed => !current.is_terminal(),
        ProcessingState::Pending => false,
    };
    if legal {
        Ok(())
    } else {
        Err(CatalogError::InvalidTransition {
            from: current,
            to: next,
        })
    }
}

fn history_key(event: &PlayEvent, seq: u64) -> String {
    format!("{}\u{1}{:020}\u{1}{}", event.user, seq, event.asset_id)
}

// ---------------------------------------------------------------------------
// redb-backed catalog
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct RedbCatalog {
    db: Arc<Database>,
}

impl RedbCatalog {
    pub fn open(path: &Path) -> Result<Self, CatalogError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let db = if path.exists() {
            Database::open(path)?
        } else {
            Database::create(path)?
        };
        let catalog = Self { db: Arc::new(db) };
        catalog.init_tables()?;
        Ok(catalog)
    }

    fn init_tables(&self) -> Result<(), CatalogError> {
        let write_txn = self.db.begin_write()?;
        {
            let _ = write_txn.open_table(ASSETS_TABLE)?;
            let _ = write_txn.open_table(HISTORY_TABLE)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Read-modify-write of one asset inside a single write transaction.
    fn mutate<F>(&self, id: &str, mutation: F) -> Result<Option<MediaAsset>, CatalogError>
    where
        F: FnOnce(&mut MediaAsset) -> Result<(), CatalogError>,
    {
        let write_txn = self.db.begin_write()?;
        let updated = {
            let mut table = write_txn.open_table(ASSETS_TABLE)?;
            let mut asset: MediaAsset = match table.get(id)? {
                Some(value) => bincode::deserialize(value.value())?,
                None => return Ok(None),
            };
            mutation(&mut asset)?;
            let bytes = bincode::serialize(&asset)?;
            table.insert(id, bytes.as_slice())?;
            asset
        };
        write_txn.commit()?;
        Ok(Some(updated))
    }
}

impl AssetCatalog for RedbCatalog {
    fn insert(&self, asset: MediaAsset) -> Result<(), CatalogError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(ASSETS_TABLE)?;
            let bytes = bincode::serialize(&asset)?;
            table.insert(asset.id.as_str(), bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<MediaAsset>, CatalogError> {
        let read_txn = self.db.begin_read()?;
        let table = match read_txn.open_table(ASSETS_TABLE) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let asset = match table.get(id)? {
            Some(value) => Some(bincode::deserialize(value.value())?),
            None => None,
        };
        Ok(asset)
    }

    fn begin_processing(&self, id: &str) -> Result<(), CatalogError> {
        self.mutate(id, |asset| {
            check_transition(asset.state, ProcessingState::Processing)?;
            asset.state = ProcessingState::Processing;
            Ok(())
        })?
        .map(|_| ())
        .ok_or(CatalogError::AssetMissing)
    }

    fn complete(&self, id: &str, update: CompletedUpdate) -> Result<(), CatalogError> {
        self.mutate(id, move |asset| {
            check_transition(asset.state, ProcessingState::Completed)?;
            apply_completed(asset, update);
            Ok(())
        })?
        .map(|_| ())
        .ok_or(CatalogError::AssetMissing)
    }

    fn fail(&self, id: &str, message: &str) -> Result<(), CatalogError> {
        self.mutate(id, |asset| {
            check_transition(asset.state, ProcessingState::Failed)?;
            asset.state = ProcessingState::Failed;
            asset.error = Some(message.to_string());
            Ok(())
        })?
        .map(|_| ())
        .ok_or(CatalogError::AssetMissing)
    }

    fn update_details(
        &self,
        id: &str,
        edit: AssetEdit,
    ) -> Result<Option<MediaAsset>, CatalogError> {
        self.mutate(id, move |asset| {
            apply_edit(asset, edit);
            Ok(())
        })
    }

    fn list_by_owner(
        &self,
        owner: &str,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<MediaAsset>, usize), CatalogError> {
        let read_txn = self.db.begin_read()?;
        let table = match read_txn.open_table(ASSETS_TABLE) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok((Vec::new(), 0)),
            Err(err) => return Err(err.into()),
        };
        let mut items: Vec<MediaAsset> = Vec::new();
        for entry in table.iter()? {
            let entry = entry?;
            let asset: MediaAsset = bincode::deserialize(entry.1.value())?;
            if asset.owner == owner {
                items.push(asset);
            }
        }
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        let total = items.len();
        let page = items.into_iter().skip(offset).take(limit).collect();
        Ok((page, total))
    }

    fn delete(&self, id: &str) -> Result<Option<MediaAsset>, CatalogError> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = match write_txn.open_table(ASSETS_TABLE) {
                Ok(table) => table,
                Err(TableError::TableDoesNotExist(_)) => return Ok(None),
                Err(err) => return Err(err.into()),
            };
            let removed = match table.remove(id)? {
                Some(value) => Some(bincode::deserialize(value.value())?),
                None => None,
            };
            removed
        };
        write_txn.commit()?;
        Ok(removed)
    }

    fn increment_play_count(&self, id: &str) -> Result<Option<u64>, CatalogError> {
        let updated = self.mutate(id, |asset| {
            asset.play_count = asset.play_count.saturating_add(1);
            Ok(())
        })?;
        Ok(updated.map(|asset| asset.play_count))
    }

    fn record_play(&self, event: PlayEvent) -> Result<(), CatalogError> {
        let seq = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(HISTORY_TABLE)?;
            let key = history_key(&event, seq);
            let bytes = bincode::serialize(&event)?;
            table.insert(key.as_str(), bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn plays_for_user(&self, user: &str, limit: usize) -> Result<Vec<PlayEvent>, CatalogError> {
        let read_txn = self.db.begin_read()?;
        let table = match read_txn.open_table(HISTORY_TABLE) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut events = Vec::new();
        for entry in table.iter()? {
            let entry = entry?;
            let event: PlayEvent = bincode::deserialize(entry.1.value())?;
            if event.user == user {
                events.push(event);
            }
        }
        events.sort_by(|a, b| b.played_at.cmp(&a.played_at));
        events.truncate(limit);
        Ok(events)
    }
}

// ---------------------------------------------------------------------------
// In-memory catalog
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryCatalog {
    assets: RwLock<HashMap<String, MediaAsset>>,
    history: RwLock<Vec<PlayEvent>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AssetCatalog for MemoryCatalog {
    fn insert(&self, asset: MediaAsset) -> Result<(), CatalogError> {
        self.assets.write().insert(asset.id.clone(), asset);
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<MediaAsset>, CatalogError> {
        Ok(self.assets.read().get(id).cloned())
    }

    fn begin_processing(&self, id: &str) -> Result<(), CatalogError> {
        let mut assets = self.assets.write();
        let asset = assets.get_mut(id).ok_or(CatalogError::AssetMissing)?;
        check_transition(asset.state, ProcessingState::Processing)?;
        asset.state = ProcessingState::Processing;
        Ok(())
    }

    fn complete(&self, id: &str, update: CompletedUpdate) -> Result<(), CatalogError> {
        let mut assets = self.assets.write();
        let asset = assets.get_mut(id).ok_or(CatalogError::AssetMissing)?;
        check_transition(asset.state, ProcessingState::Completed)?;
        apply_completed(asset, update);
        Ok(())
    }

    fn fail(&self, id: &str, message: &str) -> Result<(), CatalogError> {
        let mut assets = self.assets.write();
        let asset = assets.get_mut(id).ok_or(CatalogError::AssetMissing)?;
        check_transition(asset.state, ProcessingState::Failed)?;
        asset.state = ProcessingState::Failed;
        asset.error = Some(message.to_string());
        Ok(())
    }

    fn update_details(
        &self,
        id: &str,
        edit: AssetEdit,
    ) -> Result<Option<MediaAsset>, CatalogError> {
        let mut assets = self.assets.write();
        match assets.get_mut(id) {
            Some(asset) => {
                apply_edit(asset, edit);
                Ok(Some(asset.clone()))
            }
            None => Ok(None),
        }
    }

    fn list_by_owner(
        &self,
        owner: &str,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<MediaAsset>, usize), CatalogError> {
        let assets = self.assets.read();
        let mut items: Vec<MediaAsset> = assets
            .values()
            .filter(|asset| asset.owner == owner)
            .cloned()
            .collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        let total = items.len();
        let page = items.into_iter().skip(offset).take(limit).collect();
        Ok((page, total))
    }

    fn delete(&self, id: &str) -> Result<Option<MediaAsset>, CatalogError> {
        Ok(self.assets.write().remove(id))
    }

    fn increment_play_count(&self, id: &str) -> Result<Option<u64>, CatalogError> {
        let mut assets = self.assets.write();
        match assets.get_mut(id) {
            Some(asset) => {
                asset.play_count = asset.play_count.saturating_add(1);
                Ok(Some(asset.play_count))
            }
            None => Ok(None),
        }
    }

    fn record_play(&self, event: PlayEvent) -> Result<(), CatalogError> {
        self.history.write().push(event);
        Ok(())
    }

    fn plays_for_user(&self, user: &str, limit: usize) -> Result<Vec<PlayEvent>, CatalogError> {
        let history = self.history.read();
        let mut events: Vec<PlayEvent> = history
            .iter()
            .filter(|event| event.user == user)
            .cloned()
            .collect();
        events.sort_by(|a, b| b.played_at.cmp(&a.played_at));
        events.truncate(limit);
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{now_unix, ProcessingState};

    fn pending_asset(id: &str, owner: &str) -> MediaAsset {
        MediaAsset {
            id: id.to_string(),
            owner: owner.to_string(),
            title: "Test Track".to_string(),
            artist: "Test Artist".to_string(),
            album: "Single".to_string(),
            genre: "Other".to_string(),
            year: None,
            lyrics: String::new(),
            tags: Vec::new(),
            file_name: format!("audio-{}.mp3", id),
            original_name: "track.mp3".to_string(),
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

    fn completed_update() -> CompletedUpdate {
        CompletedUpdate {
            duration_secs: 180.5,
            file_size: 2_880_000,
            container: "mp3".to_string(),
            bitrate: Some(128),
            sample_rate: Some(44_100),
            channels: Some(2),
            embedded: None,
            waveform: Waveform {
                peaks: vec![0.5; 1000],
                length: 1000,
                sample_rate: 22_050,
            },
            features: AudioFeatures {
                tempo: Some(120.0),
                key: "C".to_string(),
                loudness: None,
                energy: 0.5,
                valence: 0.5,
                acousticness: 0.3,
                instrumentalness: 0.2,
                liveness: 0.2,
                speechiness: 0.1,
                danceability: 0.5,
            },
            auto_genre: GenreDetection::unknown(),
            audio_url: "http://localhost:3002/media/audio-a.mp3".to_string(),
            audio_ref: StorageRef::Local {
                file_name: "audio-a.mp3".to_string(),
            },
            cover_url: None,
            cover_ref: None,
        }
    }

    #[test]
    fn processing_entered_once_from_pending() {
        let catalog = MemoryCatalog::new();
        catalog.insert(pending_asset("a", "u1")).unwrap();

        catalog.begin_processing("a").unwrap();
        let second = catalog.begin_processing("a");
        assert!(matches!(
            second,
            Err(CatalogError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn completed_requires_processing_and_sets_playable_fields() {
        let catalog = MemoryCatalog::new();
        catalog.insert(pending_asset("a", "u1")).unwrap();

        // Straight to completed from pending is illegal.
        assert!(catalog.complete("a", completed_update()).is_err());

        catalog.begin_processing("a").unwrap();
        catalog.complete("a", completed_update()).unwrap();

        let asset = catalog.get("a").unwrap().unwrap();
        assert_eq!(asset.state, ProcessingState::Completed);
        assert!(asset.audio_url.is_some());
        assert!(asset.duration_secs > 0.0);
        assert!(asset.has_waveform());
        assert!(asset.error.is_none());
    }

    #[test]
    fn failed_is_terminal() {
        let catalog = MemoryCatalog::new();
        catalog.insert(pending_asset("a", "u1")).unwrap();
        catalog.begin_processing("a").unwrap();
        catalog.fail("a", "decode exploded").unwrap();

        let asset = catalog.get("a").unwrap().unwrap();
        assert_eq!(asset.state, ProcessingState::Failed);
        assert_eq!(asset.error.as_deref(), Some("decode exploded"));

        assert!(catalog.complete("a", completed_update()).is_err());
        assert!(catalog.fail("a", "again").is_err());
    }

    #[test]
    fn play_count_increments() {
        let catalog = MemoryCatalog::new();
        catalog.insert(pending_asset("a", "u1")).unwrap();
        assert_eq!(catalog.increment_play_count("a").unwrap(), Some(1));
        assert_eq!(catalog.increment_play_count("a").unwrap(), Some(2));
        assert_eq!(catalog.increment_play_count("nope").unwrap(), None);
    }

    #[test]
    fn list_by_owner_pages_newest_first() {
        let catalog = MemoryCatalog::new();
        let mut first = pending_asset("a", "u1");
        first.created_at = 100;
        let mut second = pending_asset("b", "u1");
        second.created_at = 200;
        let other = pending_asset("c", "u2");
        catalog.insert(first).unwrap();
        catalog.insert(second).unwrap();
        catalog.insert(other).unwrap();

        let (page, total) = catalog.list_by_owner("u1", 1, 0).unwrap();
        assert_eq!(total, 2);
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, "b");

        let (page, _) = catalog.list_by_owner("u1", 10, 1).unwrap();
        assert_eq!(page[0].id, "a");
    }

    #[test]
    fn redb_catalog_round_trips() {
        let path = std::env::temp_dir().join(format!(
            "tonefall-catalog-test-{}.redb",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);

        {
            let catalog = RedbCatalog::open(&path).unwrap();
            catalog.insert(pending_asset("a", "u1")).unwrap();
            catalog.begin_processing("a").unwrap();
            catalog.complete("a", completed_update()).unwrap();

            let asset = catalog.get("a").unwrap().unwrap();
            assert_eq!(asset.state, ProcessingState::Completed);

            let removed = catalog.delete("a").unwrap().unwrap();
            assert_eq!(removed.id, "a");
            assert!(catalog.get("a").unwrap().is_none());
        }

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn history_is_per_user_and_newest_first() {
        let catalog = MemoryCatalog::new();
        for (user, asset, at) in [("u1", "a", 10), ("u2", "a", 20), ("u1", "b", 30)] {
            catalog
                .record_play(PlayEvent {
                    user: user.to_string(),
                    asset_id: asset.to_string(),
                    played_at: at,
                })
                .unwrap();
        }
        let events = catalog.plays_for_user("u1", 10).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].asset_id, "b");
    }
}
