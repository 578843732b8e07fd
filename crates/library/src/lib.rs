pub mod objects;
pub mod payload;

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use common::{
    CachedTrack, DeactivateReason, DeletedSong, LibrarySnapshot, PersistenceWindow,
    SpotifyAccess, TrackedPlaylist, UserSettings, DEFAULT_MIRROR_NAME, LIKED_SONGS_ID,
    LIKED_SONGS_NAME,
};
use redb::{
    CommitError, Database, DatabaseError, ReadableTable, StorageError, Table, TableDefinition,
    TableError, TransactionError,
};
use serde::{Deserialize, Serialize};
use tracing::info;

pub use objects::{FsObjectStore, ObjectError, ObjectStore};
pub use payload::{collapse_duplicates, decode_payload, encode_payload, PayloadError};

const KEY_SEP: char = '\x1f';

const META_TABLE: TableDefinition<&str, u64> = TableDefinition::new("meta");
const TRACKED_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("tracked_playlists");
const USER_TRACKED_TABLE: TableDefinition<&str, u64> = TableDefinition::new("user_tracked");
const USER_PLAYLIST_IDS_TABLE: TableDefinition<&str, u64> =
    TableDefinition::new("user_playlist_ids");
const SNAPSHOTS_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("library_snapshots");
const PLAYLIST_SNAPSHOTS_TABLE: TableDefinition<&str, u64> =
    TableDefinition::new("playlist_snapshots");
const USER_SNAPSHOTS_TABLE: TableDefinition<&str, u64> = TableDefinition::new("user_snapshots");
const DELETED_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("deleted_songs");
const DELETED_KEYS_TABLE: TableDefinition<&str, u64> = TableDefinition::new("deleted_song_keys");
const USER_DELETED_TABLE: TableDefinition<&str, u64> = TableDefinition::new("user_deleted");
const PLAYLIST_DELETED_TABLE: TableDefinition<&str, u64> =
    TableDefinition::new("playlist_deleted");
const ACTIVE_DELETED_TABLE: TableDefinition<u64, u64> = TableDefinition::new("active_deleted");
const CACHED_TRACKS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("cached_tracks");
const SETTINGS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("user_settings");
const SPOTIFY_ACCESS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("spotify_access");

const TRACKED_COUNTER: &str = "next_tracked_id";
const SNAPSHOT_COUNTER: &str = "next_snapshot_id";
const DELETED_COUNTER: &str = "next_deleted_id";

#[derive(Clone, Debug)]
pub struct NewTrackedPlaylist {
    pub playlist_id: String,
    pub playlist_name: String,
    pub removed_playlist_name: Option<String>,
    pub public: bool,
    pub persistence: Option<PersistenceWindow>,
}

#[derive(Clone, Debug, Default)]
pub struct TrackedPlaylistUpdate {
    pub playlist_name: Option<String>,
    pub active: Option<bool>,
    pub removed_playlist_id: Option<Option<String>>,
    pub removed_playlist_name: Option<Option<String>>,
    pub public: Option<bool>,
    pub persistence: Option<Option<PersistenceWindow>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackedRemoval {
    Deleted,
    Disabled,
}

#[derive(Clone, Debug)]
pub struct NewSnapshot {
    pub user_id: String,
    pub tracked_playlist_id: u64,
    pub created_at: u64,
    pub storage_key: String,
    pub song_count: u64,
    pub payload_digest: String,
}

#[derive(Clone, Debug, Default)]
pub struct RecordedRemovals {
    pub rows: Vec<DeletedSong>,
    pub inserted: usize,
}

#[derive(Clone, Debug, Default)]
pub struct DeletedSongFilter {
    pub active: Option<bool>,
    pub tracked_playlist_id: Option<u64>,
    pub removed_since: Option<u64>,
}

#[derive(Clone, Debug, Default)]
pub struct SettingsUpdate {
    pub snapshots_enabled: Option<bool>,
    pub create_playlist: Option<bool>,
    pub playlist_name: Option<String>,
    pub playlist_persistence: Option<PersistenceWindow>,
    pub suggestion_emails: Option<bool>,
}

/// Relational store for tracked playlists, snapshots, removal records, settings,
/// upstream grants and the shared track cache.
#[derive(Clone)]
pub struct LibraryStore {
    db: Arc<Database>,
}

impl LibraryStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn open_db(path: &Path) -> Result<Arc<Database>, StoreError> {
        let db = open_or_create_db(path)?;
        Ok(Arc::new(db))
    }

    pub fn database(&self) -> Arc<Database> {
        Arc::clone(&self.db)
    }

    pub fn init_tables(&self) -> Result<(), StoreError> {
        let write_txn = self.db.begin_write()?;
        {
            let _ = write_txn.open_table(META_TABLE)?;
            let _ = write_txn.open_table(TRACKED_TABLE)?;
            let _ = write_txn.open_table(USER_TRACKED_TABLE)?;
            let _ = write_txn.open_table(USER_PLAYLIST_IDS_TABLE)?;
            let _ = write_txn.open_table(SNAPSHOTS_TABLE)?;
            let _ = write_txn.open_table(PLAYLIST_SNAPSHOTS_TABLE)?;
            let _ = write_txn.open_table(USER_SNAPSHOTS_TABLE)?;
            let _ = write_txn.open_table(DELETED_TABLE)?;
            let _ = write_txn.open_table(DELETED_KEYS_TABLE)?;
            let _ = write_txn.open_table(USER_DELETED_TABLE)?;
            let _ = write_txn.open_table(PLAYLIST_DELETED_TABLE)?;
            let _ = write_txn.open_table(ACTIVE_DELETED_TABLE)?;
            let _ = write_txn.open_table(CACHED_TRACKS_TABLE)?;
            let _ = write_txn.open_table(SETTINGS_TABLE)?;
            let _ = write_txn.open_table(SPOTIFY_ACCESS_TABLE)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    // ---- user settings ----

    pub fn get_settings(&self, user_id: &str) -> Result<Option<UserSettings>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SETTINGS_TABLE)?;
        let settings = match table.get(user_id)? {
            Some(value) => Some(decode_value(value.value())?),
            None => None,
        };
        Ok(settings)
    }

    /// Returns the user's settings, creating the default row on first access.
    pub fn get_or_create_settings(
        &self,
        user_id: &str,
        now: u64,
    ) -> Result<UserSettings, StoreError> {
        if let Some(settings) = self.get_settings(user_id)? {
            return Ok(settings);
        }
        let write_txn = self.db.begin_write()?;
        let settings = {
            let mut table = write_txn.open_table(SETTINGS_TABLE)?;
            let existing: Option<UserSettings> = match table.get(user_id)? {
                Some(value) => Some(decode_value(value.value())?),
                None => None,
            };
            match existing {
                Some(settings) => settings,
                None => {
                    let settings = UserSettings::new(user_id, now);
                    let bytes = encode_value(&settings)?;
                    table.insert(user_id, bytes.as_slice())?;
                    info!("Created default settings for user {}", user_id);
                    settings
                }
            }
        };
        write_txn.commit()?;
        Ok(settings)
    }

    pub fn update_settings(
        &self,
        user_id: &str,
        update: SettingsUpdate,
        now: u64,
    ) -> Result<UserSettings, StoreError> {
        let write_txn = self.db.begin_write()?;
        let settings = {
            let mut table = write_txn.open_table(SETTINGS_TABLE)?;
            let mut settings: UserSettings = match table.get(user_id)? {
                Some(value) => decode_value(value.value())?,
                None => UserSettings::new(user_id, now),
            };
            if let Some(value) = update.snapshots_enabled {
                settings.snapshots_enabled = value;
            }
            if let Some(value) = update.create_playlist {
                settings.create_playlist = value;
            }
            if let Some(value) = update.playlist_name {
                let trimmed = value.trim();
                settings.playlist_name = if trimmed.is_empty() {
                    DEFAULT_MIRROR_NAME.to_string()
                } else {
                    trimmed.to_string()
                };
            }
            if let Some(value) = update.playlist_persistence {
                settings.playlist_persistence = value;
            }
            if let Some(value) = update.suggestion_emails {
                settings.suggestion_emails = value;
            }
            let bytes = encode_value(&settings)?;
            table.insert(user_id, bytes.as_slice())?;
            settings
        };
        write_txn.commit()?;
        Ok(settings)
    }

    pub fn list_settings(&self) -> Result<Vec<UserSettings>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SETTINGS_TABLE)?;
        let mut items = Vec::new();
        for entry in table.iter()? {
            let entry = entry?;
            items.push(decode_value(entry.1.value())?);
        }
        Ok(items)
    }

    // ---- upstream grants ----

    pub fn get_spotify_access(&self, user_id: &str) -> Result<Option<SpotifyAccess>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SPOTIFY_ACCESS_TABLE)?;
        let access = match table.get(user_id)? {
            Some(value) => Some(decode_value(value.value())?),
            None => None,
        };
        Ok(access)
    }

    pub fn put_spotify_access(&self, access: &SpotifyAccess) -> Result<(), StoreError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(SPOTIFY_ACCESS_TABLE)?;
            let bytes = encode_value(access)?;
            table.insert(access.user_id.as_str(), bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    // ---- tracked playlists ----

    /// Creates the user's Liked Songs entry if it does not exist yet.
    /// Returns the entry and whether it was created by this call.
    pub fn ensure_liked_songs(
        &self,
        user_id: &str,
        now: u64,
    ) -> Result<(TrackedPlaylist, bool), StoreError> {
        let write_txn = self.db.begin_write()?;
        let result = {
            let mut meta = write_txn.open_table(META_TABLE)?;
            let mut tracked = write_txn.open_table(TRACKED_TABLE)?;
            let mut user_tracked = write_txn.open_table(USER_TRACKED_TABLE)?;
            let mut playlist_ids = write_txn.open_table(USER_PLAYLIST_IDS_TABLE)?;

            let lookup = pair_key(user_id, LIKED_SONGS_ID);
            let existing_id = playlist_ids.get(lookup.as_str())?.map(|value| value.value());
            let existing: Option<TrackedPlaylist> = match existing_id {
                Some(id) => match tracked.get(id)? {
                    Some(value) => Some(decode_value(value.value())?),
                    None => None,
                },
                None => None,
            };
            match existing {
                Some(playlist) => (playlist, false),
                None => {
                    let playlist = TrackedPlaylist {
                        id: next_id(&mut meta, TRACKED_COUNTER)?,
                        user_id: user_id.to_string(),
                        playlist_id: LIKED_SONGS_ID.to_string(),
                        playlist_name: LIKED_SONGS_NAME.to_string(),
                        liked_songs: true,
                        active: true,
                        removed_playlist_id: None,
                        removed_playlist_name: Some(DEFAULT_MIRROR_NAME.to_string()),
                        public: false,
                        persistence: None,
                        created_at: now,
                    };
                    insert_tracked(&mut tracked, &mut user_tracked, &mut playlist_ids, &playlist)?;
                    (playlist, true)
                }
            }
        };
        write_txn.commit()?;
        Ok(result)
    }

    pub fn create_tracked_playlist(
        &self,
        user_id: &str,
        new: NewTrackedPlaylist,
        now: u64,
    ) -> Result<TrackedPlaylist, StoreError> {
        let playlist_id = new.playlist_id.trim().to_string();
        if playlist_id.is_empty() {
            return Err(StoreError::Invalid("playlist_id is required".to_string()));
        }
        let write_txn = self.db.begin_write()?;
        let playlist = {
            let mut meta = write_txn.open_table(META_TABLE)?;
            let mut tracked = write_txn.open_table(TRACKED_TABLE)?;
            let mut user_tracked = write_txn.open_table(USER_TRACKED_TABLE)?;
            let mut playlist_ids = write_txn.open_table(USER_PLAYLIST_IDS_TABLE)?;

            let lookup = pair_key(user_id, &playlist_id);
            if playlist_ids.get(lookup.as_str())?.is_some() {
                return Err(StoreError::Conflict(format!(
                    "playlist {} is already tracked",
                    playlist_id
                )));
            }
            let liked_songs = playlist_id == LIKED_SONGS_ID;
            let playlist = TrackedPlaylist {
                id: next_id(&mut meta, TRACKED_COUNTER)?,
                user_id: user_id.to_string(),
                playlist_name: if liked_songs {
                    LIKED_SONGS_NAME.to_string()
                } else {
                    new.playlist_name.trim().to_string()
                },
                playlist_id,
                liked_songs,
                active: true,
                removed_playlist_id: None,
                removed_playlist_name: new
                    .removed_playlist_name
                    .map(|name| name.trim().to_string())
                    .filter(|name| !name.is_empty()),
                public: new.public,
                persistence: new.persistence,
                created_at: now,
            };
            insert_tracked(&mut tracked, &mut user_tracked, &mut playlist_ids, &playlist)?;
            playlist
        };
        write_txn.commit()?;
        Ok(playlist)
    }

    /// Looks up a tracked playlist owned by `user_id`. Other users' rows read as missing.
    pub fn get_tracked_playlist(
        &self,
        user_id: &str,
        id: u64,
    ) -> Result<Option<TrackedPlaylist>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TRACKED_TABLE)?;
        let playlist: Option<TrackedPlaylist> = match table.get(id)? {
            Some(value) => Some(decode_value(value.value())?),
            None => None,
        };
        Ok(playlist.filter(|playlist| playlist.user_id == user_id))
    }

    pub fn list_tracked_playlists(&self, user_id: &str) -> Result<Vec<TrackedPlaylist>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let index = read_txn.open_table(USER_TRACKED_TABLE)?;
        let table = read_txn.open_table(TRACKED_TABLE)?;
        let prefix = prefix_key(user_id);
        let end = prefix_end(&prefix);
        let mut items = Vec::new();
        for entry in index.range(prefix.as_str()..end.as_str())? {
            let entry = entry?;
            if let Some(value) = table.get(entry.1.value())? {
                items.push(decode_value(value.value())?);
            }
        }
        Ok(items)
    }

    pub fn update_tracked_playlist(
        &self,
        user_id: &str,
        id: u64,
        update: TrackedPlaylistUpdate,
    ) -> Result<Option<TrackedPlaylist>, StoreError> {
        let write_txn = self.db.begin_write()?;
        let updated = {
            let mut table = write_txn.open_table(TRACKED_TABLE)?;
            let mut playlist: TrackedPlaylist = match table.get(id)? {
                Some(value) => decode_value(value.value())?,
                None => return Ok(None),
            };
            if playlist.user_id != user_id {
                return Ok(None);
            }
            if let Some(name) = update.playlist_name {
                if !playlist.liked_songs && !name.trim().is_empty() {
                    playlist.playlist_name = name.trim().to_string();
                }
            }
            if let Some(active) = update.active {
                playlist.active = active;
            }
            if let Some(mirror_id) = update.removed_playlist_id {
                playlist.removed_playlist_id = mirror_id;
            }
            if let Some(mirror_name) = update.removed_playlist_name {
                playlist.removed_playlist_name = mirror_name
                    .map(|name| name.trim().to_string())
                    .filter(|name| !name.is_empty());
            }
            if let Some(public) = update.public {
                playlist.public = public;
            }
            if let Some(persistence) = update.persistence {
                playlist.persistence = persistence;
            }
            let bytes = encode_value(&playlist)?;
            table.insert(id, bytes.as_slice())?;
            playlist
        };
        write_txn.commit()?;
        Ok(Some(updated))
    }

    /// Hard-deletes a tracked playlist without history, soft-disables one with history.
    /// Liked Songs is always soft-disabled so each user keeps exactly one entry for it.
    pub fn remove_tracked_playlist(
        &self,
        user_id: &str,
        id: u64,
    ) -> Result<Option<TrackedRemoval>, StoreError> {
        let write_txn = self.db.begin_write()?;
        let outcome = {
            let mut tracked = write_txn.open_table(TRACKED_TABLE)?;
            let mut user_tracked = write_txn.open_table(USER_TRACKED_TABLE)?;
            let mut playlist_ids = write_txn.open_table(USER_PLAYLIST_IDS_TABLE)?;
            let playlist_snapshots = write_txn.open_table(PLAYLIST_SNAPSHOTS_TABLE)?;
            let playlist_deleted = write_txn.open_table(PLAYLIST_DELETED_TABLE)?;

            let playlist: TrackedPlaylist = match tracked.get(id)? {
                Some(value) => decode_value(value.value())?,
                None => return Ok(None),
            };
            if playlist.user_id != user_id {
                return Ok(None);
            }
            if playlist.liked_songs
                || has_prefix(&playlist_snapshots, &seq(id))?
                || has_prefix(&playlist_deleted, &seq(id))?
            {
                let mut disabled = playlist;
                disabled.active = false;
                let bytes = encode_value(&disabled)?;
                tracked.insert(id, bytes.as_slice())?;
                TrackedRemoval::Disabled
            } else {
                tracked.remove(id)?;
                user_tracked.remove(pair_key(user_id, &seq(id)).as_str())?;
                playlist_ids.remove(pair_key(user_id, &playlist.playlist_id).as_str())?;
                TrackedRemoval::Deleted
            }
        };
        write_txn.commit()?;
        Ok(Some(outcome))
    }

    /// Removes every tracked playlist of a user, disabling the ones that still have history.
    /// Returns `(deleted, disabled)`.
    pub fn delete_user_tracked_playlists(&self, user_id: &str) -> Result<(usize, usize), StoreError> {
        let ids: Vec<u64> = self
            .list_tracked_playlists(user_id)?
            .into_iter()
            .map(|playlist| playlist.id)
            .collect();
        let mut deleted = 0usize;
        let mut disabled = 0usize;
        for id in ids {
            match self.remove_tracked_playlist(user_id, id)? {
                Some(TrackedRemoval::Deleted) => deleted += 1,
                Some(TrackedRemoval::Disabled) => disabled += 1,
                None => {}
            }
        }
        Ok((deleted, disabled))
    }

    // ---- library snapshots ----

    /// Writes a snapshot row. Fails with `NotFound` unless the tracked playlist exists,
    /// belongs to the user and is active.
    pub fn insert_snapshot(&self, new: NewSnapshot) -> Result<LibrarySnapshot, StoreError> {
        let write_txn = self.db.begin_write()?;
        let snapshot = {
            let mut meta = write_txn.open_table(META_TABLE)?;
            let tracked = write_txn.open_table(TRACKED_TABLE)?;
            let mut snapshots = write_txn.open_table(SNAPSHOTS_TABLE)?;
            let mut playlist_index = write_txn.open_table(PLAYLIST_SNAPSHOTS_TABLE)?;
            let mut user_index = write_txn.open_table(USER_SNAPSHOTS_TABLE)?;

            let playlist: Option<TrackedPlaylist> = match tracked.get(new.tracked_playlist_id)? {
                Some(value) => Some(decode_value(value.value())?),
                None => None,
            };
            match playlist {
                Some(playlist) if playlist.user_id == new.user_id && playlist.active => {}
                _ => {
                    return Err(StoreError::NotFound(format!(
                        "active tracked playlist {}",
                        new.tracked_playlist_id
                    )))
                }
            }

            let snapshot = LibrarySnapshot {
                id: next_id(&mut meta, SNAPSHOT_COUNTER)?,
                user_id: new.user_id,
                tracked_playlist_id: new.tracked_playlist_id,
                created_at: new.created_at,
                storage_key: new.storage_key,
                song_count: new.song_count,
                payload_digest: new.payload_digest,
            };
            let bytes = encode_value(&snapshot)?;
            snapshots.insert(snapshot.id, bytes.as_slice())?;
            let order = order_key(snapshot.created_at, snapshot.id);
            playlist_index.insert(
                pair_key(&seq(snapshot.tracked_playlist_id), &order).as_str(),
                snapshot.id,
            )?;
            user_index.insert(pair_key(&snapshot.user_id, &order).as_str(), snapshot.id)?;
            snapshot
        };
        write_txn.commit()?;
        Ok(snapshot)
    }

    pub fn get_snapshot(
        &self,
        user_id: &str,
        id: u64,
    ) -> Result<Option<LibrarySnapshot>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SNAPSHOTS_TABLE)?;
        let snapshot: Option<LibrarySnapshot> = match table.get(id)? {
            Some(value) => Some(decode_value(value.value())?),
            None => None,
        };
        Ok(snapshot.filter(|snapshot| snapshot.user_id == user_id))
    }

    /// Most recent snapshots of a tracked playlist, newest first, ordered by
    /// `(created_at, id)` descending.
    pub fn latest_snapshots(
        &self,
        user_id: &str,
        tracked_playlist_id: u64,
        limit: usize,
    ) -> Result<Vec<LibrarySnapshot>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let index = read_txn.open_table(PLAYLIST_SNAPSHOTS_TABLE)?;
        let table = read_txn.open_table(SNAPSHOTS_TABLE)?;
        let prefix = prefix_key(&seq(tracked_playlist_id));
        let end = prefix_end(&prefix);
        let mut items = Vec::new();
        for entry in index.range(prefix.as_str()..end.as_str())?.rev() {
            if items.len() >= limit {
                break;
            }
            let entry = entry?;
            if let Some(value) = table.get(entry.1.value())? {
                let snapshot: LibrarySnapshot = decode_value(value.value())?;
                if snapshot.user_id == user_id {
                    items.push(snapshot);
                }
            }
        }
        Ok(items)
    }

    pub fn list_snapshots(
        &self,
        user_id: &str,
        tracked_playlist_id: Option<u64>,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<LibrarySnapshot>, usize), StoreError> {
        let read_txn = self.db.begin_read()?;
        let index = read_txn.open_table(USER_SNAPSHOTS_TABLE)?;
        let table = read_txn.open_table(SNAPSHOTS_TABLE)?;
        let prefix = prefix_key(user_id);
        let end = prefix_end(&prefix);
        let mut total = 0usize;
        let mut items = Vec::new();
        for entry in index.range(prefix.as_str()..end.as_str())?.rev() {
            let entry = entry?;
            let Some(value) = table.get(entry.1.value())? else {
                continue;
            };
            let snapshot: LibrarySnapshot = decode_value(value.value())?;
            if let Some(tracked) = tracked_playlist_id {
                if snapshot.tracked_playlist_id != tracked {
                    continue;
                }
            }
            total += 1;
            if total <= offset || items.len() >= limit {
                continue;
            }
            items.push(snapshot);
        }
        Ok((items, total))
    }

    /// Deletes all snapshot rows of a user and returns them so their payloads can be removed.
    pub fn delete_user_snapshots(&self, user_id: &str) -> Result<Vec<LibrarySnapshot>, StoreError> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut snapshots = write_txn.open_table(SNAPSHOTS_TABLE)?;
            let mut playlist_index = write_txn.open_table(PLAYLIST_SNAPSHOTS_TABLE)?;
            let mut user_index = write_txn.open_table(USER_SNAPSHOTS_TABLE)?;
            let keys = collect_prefix(&user_index, user_id)?;
            let mut removed = Vec::with_capacity(keys.len());
            for (key, id) in keys {
                user_index.remove(key.as_str())?;
                let snapshot: Option<LibrarySnapshot> = match snapshots.remove(id)? {
                    Some(value) => Some(decode_value(value.value())?),
                    None => None,
                };
                if let Some(snapshot) = snapshot {
                    let order = order_key(snapshot.created_at, snapshot.id);
                    playlist_index
                        .remove(pair_key(&seq(snapshot.tracked_playlist_id), &order).as_str())?;
                    removed.push(snapshot);
                }
            }
            removed
        };
        write_txn.commit()?;
        Ok(removed)
    }

    // ---- deleted songs ----

    /// Records the removal of `track_ids` detected by `snapshot`. Keyed by
    /// (tracked playlist, track, snapshot) so repeated runs return the existing rows.
    pub fn record_removals(
        &self,
        snapshot: &LibrarySnapshot,
        track_ids: &[String],
    ) -> Result<RecordedRemovals, StoreError> {
        let write_txn = self.db.begin_write()?;
        let recorded = {
            let mut meta = write_txn.open_table(META_TABLE)?;
            let mut deleted = write_txn.open_table(DELETED_TABLE)?;
            let mut keys = write_txn.open_table(DELETED_KEYS_TABLE)?;
            let mut user_index = write_txn.open_table(USER_DELETED_TABLE)?;
            let mut playlist_index = write_txn.open_table(PLAYLIST_DELETED_TABLE)?;
            let mut active = write_txn.open_table(ACTIVE_DELETED_TABLE)?;

            let mut recorded = RecordedRemovals::default();
            for track_id in track_ids {
                let key = removal_key(snapshot.tracked_playlist_id, track_id, snapshot.id);
                let existing_id = keys.get(key.as_str())?.map(|value| value.value());
                if let Some(id) = existing_id {
                    let row: Option<DeletedSong> = match deleted.get(id)? {
                        Some(value) => Some(decode_value(value.value())?),
                        None => None,
                    };
                    if let Some(row) = row {
                        recorded.rows.push(row);
                        continue;
                    }
                }
                let row = DeletedSong {
                    id: next_id(&mut meta, DELETED_COUNTER)?,
                    user_id: snapshot.user_id.clone(),
                    tracked_playlist_id: snapshot.tracked_playlist_id,
                    track_id: track_id.clone(),
                    snapshot_id: snapshot.id,
                    removed_at: snapshot.created_at,
                    active: true,
                    mirrored: false,
                    deactivated: None,
                    deactivated_at: None,
                };
                let bytes = encode_value(&row)?;
                deleted.insert(row.id, bytes.as_slice())?;
                keys.insert(key.as_str(), row.id)?;
                user_index.insert(
                    pair_key(&row.user_id, &order_key(row.removed_at, row.id)).as_str(),
                    row.id,
                )?;
                playlist_index
                    .insert(pair_key(&seq(row.tracked_playlist_id), &seq(row.id)).as_str(), row.id)?;
                active.insert(row.id, row.removed_at)?;
                recorded.inserted += 1;
                recorded.rows.push(row);
            }
            recorded
        };
        write_txn.commit()?;
        Ok(recorded)
    }

    pub fn get_deleted_song(&self, user_id: &str, id: u64) -> Result<Option<DeletedSong>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(DELETED_TABLE)?;
        let row: Option<DeletedSong> = match table.get(id)? {
            Some(value) => Some(decode_value(value.value())?),
            None => None,
        };
        Ok(row.filter(|row| row.user_id == user_id))
    }

    /// Removal records of a user, newest `removed_at` first.
    pub fn list_deleted_songs(
        &self,
        user_id: &str,
        filter: &DeletedSongFilter,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<DeletedSong>, usize), StoreError> {
        let read_txn = self.db.begin_read()?;
        let index = read_txn.open_table(USER_DELETED_TABLE)?;
        let table = read_txn.open_table(DELETED_TABLE)?;
        let prefix = prefix_key(user_id);
        let end = prefix_end(&prefix);
        let mut total = 0usize;
        let mut items = Vec::new();
        for entry in index.range(prefix.as_str()..end.as_str())?.rev() {
            let entry = entry?;
            let Some(value) = table.get(entry.1.value())? else {
                continue;
            };
            let row: DeletedSong = decode_value(value.value())?;
            if let Some(since) = filter.removed_since {
                if row.removed_at < since {
                    break;
                }
            }
            if filter.active.is_some_and(|active| row.active != active) {
                continue;
            }
            if filter
                .tracked_playlist_id
                .is_some_and(|tracked| row.tracked_playlist_id != tracked)
            {
                continue;
            }
            total += 1;
            if total <= offset || items.len() >= limit {
                continue;
            }
            items.push(row);
        }
        Ok((items, total))
    }

    pub fn list_playlist_deleted_songs(
        &self,
        tracked_playlist_id: u64,
    ) -> Result<Vec<DeletedSong>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let index = read_txn.open_table(PLAYLIST_DELETED_TABLE)?;
        let table = read_txn.open_table(DELETED_TABLE)?;
        let prefix = prefix_key(&seq(tracked_playlist_id));
        let end = prefix_end(&prefix);
        let mut items = Vec::new();
        for entry in index.range(prefix.as_str()..end.as_str())? {
            let entry = entry?;
            if let Some(value) = table.get(entry.1.value())? {
                items.push(decode_value(value.value())?);
            }
        }
        Ok(items)
    }

    /// Every active removal record across all users, oldest id first.
    pub fn list_active_deleted_songs(&self) -> Result<Vec<DeletedSong>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let active = read_txn.open_table(ACTIVE_DELETED_TABLE)?;
        let table = read_txn.open_table(DELETED_TABLE)?;
        let mut items = Vec::new();
        for entry in active.iter()? {
            let entry = entry?;
            if let Some(value) = table.get(entry.0.value())? {
                items.push(decode_value(value.value())?);
            }
        }
        Ok(items)
    }

    /// Marks still-active rows inactive. Returns how many rows changed.
    pub fn deactivate_deleted_songs(
        &self,
        ids: &[u64],
        reason: DeactivateReason,
        at: u64,
    ) -> Result<usize, StoreError> {
        let write_txn = self.db.begin_write()?;
        let changed = {
            let mut table = write_txn.open_table(DELETED_TABLE)?;
            let mut active = write_txn.open_table(ACTIVE_DELETED_TABLE)?;
            let mut changed = 0usize;
            for id in ids {
                let row: Option<DeletedSong> = match table.get(*id)? {
                    Some(value) => Some(decode_value(value.value())?),
                    None => None,
                };
                let Some(mut row) = row else {
                    continue;
                };
                if !row.active {
                    continue;
                }
                row.active = false;
                row.deactivated = Some(reason);
                row.deactivated_at = Some(at);
                let bytes = encode_value(&row)?;
                table.insert(*id, bytes.as_slice())?;
                active.remove(*id)?;
                changed += 1;
            }
            changed
        };
        write_txn.commit()?;
        Ok(changed)
    }

    pub fn set_mirrored(&self, ids: &[u64], mirrored: bool) -> Result<usize, StoreError> {
        let write_txn = self.db.begin_write()?;
        let changed = {
            let mut table = write_txn.open_table(DELETED_TABLE)?;
            let mut changed = 0usize;
            for id in ids {
                let row: Option<DeletedSong> = match table.get(*id)? {
                    Some(value) => Some(decode_value(value.value())?),
                    None => None,
                };
                let Some(mut row) = row else {
                    continue;
                };
                if row.mirrored == mirrored {
                    continue;
                }
                row.mirrored = mirrored;
                let bytes = encode_value(&row)?;
                table.insert(*id, bytes.as_slice())?;
                changed += 1;
            }
            changed
        };
        write_txn.commit()?;
        Ok(changed)
    }

    pub fn delete_user_deleted_songs(&self, user_id: &str) -> Result<usize, StoreError> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(DELETED_TABLE)?;
            let mut keys = write_txn.open_table(DELETED_KEYS_TABLE)?;
            let mut user_index = write_txn.open_table(USER_DELETED_TABLE)?;
            let mut playlist_index = write_txn.open_table(PLAYLIST_DELETED_TABLE)?;
            let mut active = write_txn.open_table(ACTIVE_DELETED_TABLE)?;
            let entries = collect_prefix(&user_index, user_id)?;
            let mut removed = 0usize;
            for (key, id) in entries {
                user_index.remove(key.as_str())?;
                let row: Option<DeletedSong> = match table.remove(id)? {
                    Some(value) => Some(decode_value(value.value())?),
                    None => None,
                };
                let Some(row) = row else {
                    continue;
                };
                keys.remove(
                    removal_key(row.tracked_playlist_id, &row.track_id, row.snapshot_id).as_str(),
                )?;
                playlist_index
                    .remove(pair_key(&seq(row.tracked_playlist_id), &seq(row.id)).as_str())?;
                active.remove(row.id)?;
                removed += 1;
            }
            removed
        };
        write_txn.commit()?;
        Ok(removed)
    }

    // ---- track cache ----

    pub fn get_cached_tracks(
        &self,
        track_ids: &[String],
    ) -> Result<HashMap<String, CachedTrack>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(CACHED_TRACKS_TABLE)?;
        let mut found = HashMap::new();
        for track_id in track_ids {
            if let Some(value) = table.get(track_id.as_str())? {
                let track: CachedTrack = decode_value(value.value())?;
                found.insert(track_id.clone(), track);
            }
        }
        Ok(found)
    }

    /// Upserts by track id. An older `updated_at` never overwrites a newer row.
    pub fn upsert_cached_tracks(&self, tracks: &[CachedTrack]) -> Result<usize, StoreError> {
        if tracks.is_empty() {
            return Ok(0);
        }
        let write_txn = self.db.begin_write()?;
        let written = {
            let mut table = write_txn.open_table(CACHED_TRACKS_TABLE)?;
            let mut written = 0usize;
            for track in tracks {
                let current: Option<CachedTrack> = match table.get(track.track_id.as_str())? {
                    Some(value) => Some(decode_value(value.value())?),
                    None => None,
                };
                if current.is_some_and(|current| current.updated_at > track.updated_at) {
                    continue;
                }
                let bytes = encode_value(track)?;
                table.insert(track.track_id.as_str(), bytes.as_slice())?;
                written += 1;
            }
            written
        };
        write_txn.commit()?;
        Ok(written)
    }
}

fn insert_tracked(
    tracked: &mut Table<'_, '_, u64, &'static [u8]>,
    user_tracked: &mut Table<'_, '_, &'static str, u64>,
    playlist_ids: &mut Table<'_, '_, &'static str, u64>,
    playlist: &TrackedPlaylist,
) -> Result<(), StoreError> {
    let bytes = encode_value(playlist)?;
    tracked.insert(playlist.id, bytes.as_slice())?;
    user_tracked.insert(pair_key(&playlist.user_id, &seq(playlist.id)).as_str(), playlist.id)?;
    playlist_ids.insert(
        pair_key(&playlist.user_id, &playlist.playlist_id).as_str(),
        playlist.id,
    )?;
    Ok(())
}

fn next_id(meta: &mut Table<'_, '_, &'static str, u64>, counter: &str) -> Result<u64, StoreError> {
    let current = meta.get(counter)?.map(|value| value.value()).unwrap_or(0);
    let next = current + 1;
    meta.insert(counter, next)?;
    Ok(next)
}

fn has_prefix<T: ReadableTable<&'static str, u64>>(
    table: &T,
    prefix: &str,
) -> Result<bool, StoreError> {
    let start = prefix_key(prefix);
    let end = prefix_end(&start);
    let mut range = table.range(start.as_str()..end.as_str())?;
    Ok(range.next().transpose()?.is_some())
}

fn collect_prefix<T: ReadableTable<&'static str, u64>>(
    table: &T,
    prefix: &str,
) -> Result<Vec<(String, u64)>, StoreError> {
    let start = prefix_key(prefix);
    let end = prefix_end(&start);
    let mut out = Vec::new();
    for entry in table.range(start.as_str()..end.as_str())? {
        let entry = entry?;
        out.push((entry.0.value().to_string(), entry.1.value()));
    }
    Ok(out)
}

pub fn open_or_create_db(path: &Path) -> Result<Database, StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    if path.exists() {
        Ok(Database::open(path)?)
    } else {
        Ok(Database::create(path)?)
    }
}

#[derive(Debug)]
pub enum StoreError {
    Io(std::io::Error),
    Redb(redb::Error),
    Bincode(Box<bincode::ErrorKind>),
    NotFound(String),
    Conflict(String),
    Invalid(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Io(err) => write!(f, "io error: {}", err),
            StoreError::Redb(err) => write!(f, "db error: {}", err),
            StoreError::Bincode(err) => write!(f, "bincode error: {}", err),
            StoreError::NotFound(what) => write!(f, "not found: {}", what),
            StoreError::Conflict(message) => write!(f, "conflict: {}", message),
            StoreError::Invalid(message) => write!(f, "invalid: {}", message),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err)
    }
}

impl From<redb::Error> for StoreError {
    fn from(err: redb::Error) -> Self {
        StoreError::Redb(err)
    }
}

impl From<DatabaseError> for StoreError {
    fn from(err: DatabaseError) -> Self {
        StoreError::Redb(err.into())
    }
}

impl From<TableError> for StoreError {
    fn from(err: TableError) -> Self {
        StoreError::Redb(err.into())
    }
}

impl From<TransactionError> for StoreError {
    fn from(err: TransactionError) -> Self {
        StoreError::Redb(err.into())
    }
}

impl From<StorageError> for StoreError {
    fn from(err: StorageError) -> Self {
        StoreError::Redb(err.into())
    }
}

impl From<CommitError> for StoreError {
    fn from(err: CommitError) -> Self {
        StoreError::Redb(err.into())
    }
}

impl From<Box<bincode::ErrorKind>> for StoreError {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        StoreError::Bincode(err)
    }
}

fn encode_value<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    Ok(bincode::serialize(value)?)
}

fn decode_value<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, StoreError> {
    Ok(bincode::deserialize(bytes)?)
}

fn seq(value: u64) -> String {
    format!("{:020}", value)
}

fn order_key(created_at: u64, id: u64) -> String {
    pair_key(&seq(created_at), &seq(id))
}

fn removal_key(tracked_playlist_id: u64, track_id: &str, snapshot_id: u64) -> String {
    let mut out = pair_key(&seq(tracked_playlist_id), track_id);
    out.push(KEY_SEP);
    out.push_str(&seq(snapshot_id));
    out
}

fn pair_key(left: &str, right: &str) -> String {
    let mut out = prefix_key(left);
    out.push_str(right);
    out
}

fn prefix_key(prefix: &str) -> String {
    let mut out = String::new();
    out.push_str(prefix);
    out.push(KEY_SEP);
    out
}

fn prefix_end(prefix: &str) -> String {
    let mut end = prefix.to_string();
    end.push('\u{10ffff}');
    end
}
