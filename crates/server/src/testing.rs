use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use common::{
    DeletedSong, LibrarySnapshot, PlaylistSource, SnapshotTrack, SpotifyAccess, TrackedPlaylist,
    LIKED_SONGS_ID,
};
use library::{
    FsObjectStore, LibraryStore, NewSnapshot, NewTrackedPlaylist, SettingsUpdate,
    TrackedPlaylistUpdate,
};
use parking_lot::Mutex;
use tempfile::TempDir;

use crate::auth::{AuthStore, AuthUser};
use crate::config::ServerConfig;
use crate::engine::{Engine, EngineSettings};
use crate::state::{AppState, AuthContext};
use crate::upstream::{
    AccessContext, AccessGrant, TrackPage, Upstream, UpstreamError, UpstreamProfile,
    LIKED_WRITE_LIMIT, PLAYLIST_WRITE_LIMIT, TRACK_LOOKUP_LIMIT,
};
use crate::utils::now_millis;

const FAKE_PAGE_SIZE: usize = 2;
pub const JOB_SECRET: &str = "job-secret";

#[derive(Default)]
struct FakeState {
    listings: HashMap<String, Vec<SnapshotTrack>>,
    catalog: HashMap<String, SnapshotTrack>,
    fail_listing_at: Option<u32>,
    fail_lookups: bool,
    fail_adds: bool,
    fail_removals: HashSet<String>,
    lookup_calls: Vec<Vec<String>>,
    add_calls: Vec<(String, Vec<String>)>,
    remove_calls: Vec<(String, Vec<String>)>,
    saved_liked: Vec<String>,
    created_playlists: Vec<(String, bool)>,
    refreshes: usize,
}

/// In-memory streaming service that records every call.
#[derive(Default)]
pub struct FakeUpstream {
    state: Mutex<FakeState>,
}

impl FakeUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_listing(&self, source: &str, ids: &[&str]) {
        let tracks = ids
            .iter()
            .map(|id| {
                let mut track = SnapshotTrack::from_id(*id);
                track.name = Some(format!("Track {}", id));
                track
            })
            .collect();
        self.state.lock().listings.insert(source.to_string(), tracks);
    }

    pub fn fail_listing_at(&self, offset: Option<u32>) {
        self.state.lock().fail_listing_at = offset;
    }

    pub fn add_catalog(&self, id: &str, name: &str) {
        let mut track = SnapshotTrack::from_id(id);
        track.name = Some(name.to_string());
        track.artist = Some("Catalog Artist".to_string());
        self.state.lock().catalog.insert(id.to_string(), track);
    }

    pub fn fail_lookups(&self, fail: bool) {
        self.state.lock().fail_lookups = fail;
    }

    pub fn fail_adds(&self, fail: bool) {
        self.state.lock().fail_adds = fail;
    }

    pub fn fail_removal_of(&self, track_id: &str) {
        self.state.lock().fail_removals.insert(track_id.to_string());
    }

    pub fn clear_removal_failures(&self) {
        self.state.lock().fail_removals.clear();
    }

    pub fn lookup_calls(&self) -> Vec<Vec<String>> {
        self.state.lock().lookup_calls.clone()
    }

    pub fn add_calls(&self) -> Vec<(String, Vec<String>)> {
        self.state.lock().add_calls.clone()
    }

    pub fn remove_calls(&self) -> Vec<(String, Vec<String>)> {
        self.state.lock().remove_calls.clone()
    }

    pub fn saved_liked(&self) -> Vec<String> {
        self.state.lock().saved_liked.clone()
    }

    pub fn created_playlists(&self) -> Vec<(String, bool)> {
        self.state.lock().created_playlists.clone()
    }

    pub fn refresh_count(&self) -> usize {
        self.state.lock().refreshes
    }
}

fn unavailable() -> UpstreamError {
    UpstreamError::Status {
        status: 503,
        message: "service unavailable".to_string(),
    }
}

#[async_trait]
impl Upstream for FakeUpstream {
    fn authorize_url(&self, state: &str) -> Result<String, UpstreamError> {
        Ok(format!("https://accounts.example/authorize?state={}", state))
    }

    async fn exchange_code(&self, code: &str) -> Result<AccessGrant, UpstreamError> {
        if code == "bad" {
            return Err(UpstreamError::Unauthorized);
        }
        Ok(AccessGrant {
            access_token: format!("token-{}", code),
            refresh_token: Some(format!("refresh-{}", code)),
            expires_in_secs: 3600,
        })
    }

    async fn refresh_access(&self, refresh_token: &str) -> Result<AccessGrant, UpstreamError> {
        self.state.lock().refreshes += 1;
        Ok(AccessGrant {
            access_token: format!("refreshed-{}", refresh_token),
            refresh_token: None,
            expires_in_secs: 3600,
        })
    }

    async fn current_user(&self, access_token: &str) -> Result<UpstreamProfile, UpstreamError> {
        let id = access_token.trim_start_matches("token-");
        Ok(UpstreamProfile {
            id: format!("spotify-{}", id),
            display_name: Some(format!("Listener {}", id)),
        })
    }

    async fn list_tracks_page(
        &self,
        _ctx: &AccessContext,
        source: &PlaylistSource,
        offset: u32,
    ) -> Result<TrackPage, UpstreamError> {
        let state = self.state.lock();
        if state.fail_listing_at == Some(offset) {
            return Err(unavailable());
        }
        let key = match source {
            PlaylistSource::LikedSongs => LIKED_SONGS_ID,
            PlaylistSource::Playlist(id) => id.as_str(),
        };
        let all = state.listings.get(key).cloned().unwrap_or_default();
        let start = (offset as usize).min(all.len());
        let end = (start + FAKE_PAGE_SIZE).min(all.len());
        Ok(TrackPage {
            items: all[start..end].to_vec(),
            next_offset: (end < all.len()).then_some(end as u32),
        })
    }

    async fn get_tracks(
        &self,
        _ctx: &AccessContext,
        track_ids: &[String],
    ) -> Result<Vec<SnapshotTrack>, UpstreamError> {
        assert!(track_ids.len() <= TRACK_LOOKUP_LIMIT);
        let mut state = self.state.lock();
        state.lookup_calls.push(track_ids.to_vec());
        if state.fail_lookups {
            return Err(unavailable());
        }
        Ok(track_ids
            .iter()
            .filter_map(|id| state.catalog.get(id).cloned())
            .collect())
    }

    async fn create_playlist(
        &self,
        _ctx: &AccessContext,
        name: &str,
        public: bool,
    ) -> Result<String, UpstreamError> {
        let mut state = self.state.lock();
        state.created_playlists.push((name.to_string(), public));
        Ok(format!("mirror-{}", state.created_playlists.len()))
    }

    async fn add_tracks(
        &self,
        _ctx: &AccessContext,
        playlist_id: &str,
        track_ids: &[String],
    ) -> Result<(), UpstreamError> {
        assert!(track_ids.len() <= PLAYLIST_WRITE_LIMIT);
        let mut state = self.state.lock();
        if state.fail_adds {
            return Err(unavailable());
        }
        state
            .add_calls
            .push((playlist_id.to_string(), track_ids.to_vec()));
        Ok(())
    }

    async fn remove_tracks(
        &self,
        _ctx: &AccessContext,
        playlist_id: &str,
        track_ids: &[String],
    ) -> Result<(), UpstreamError> {
        assert!(track_ids.len() <= PLAYLIST_WRITE_LIMIT);
        let mut state = self.state.lock();
        if track_ids.iter().any(|id| state.fail_removals.contains(id)) {
            return Err(unavailable());
        }
        state
            .remove_calls
            .push((playlist_id.to_string(), track_ids.to_vec()));
        Ok(())
    }

    async fn save_liked_tracks(
        &self,
        _ctx: &AccessContext,
        track_ids: &[String],
    ) -> Result<(), UpstreamError> {
        assert!(track_ids.len() <= LIKED_WRITE_LIMIT);
        self.state.lock().saved_liked.extend(track_ids.iter().cloned());
        Ok(())
    }
}

/// A temp-dir backed store, object store and engine with one authorized user.
pub struct TestEnv {
    _dir: TempDir,
    pub store: LibraryStore,
    pub objects: Arc<FsObjectStore>,
    pub upstream: Arc<FakeUpstream>,
    pub engine: Engine,
    pub user_id: String,
}

impl TestEnv {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db = LibraryStore::open_db(&dir.path().join("test.redb")).unwrap();
        let store = LibraryStore::new(db);
        store.init_tables().unwrap();
        let objects = Arc::new(FsObjectStore::new(dir.path().join("snapshots")).unwrap());
        let upstream = Arc::new(FakeUpstream::new());
        let engine = Engine::new(
            store.clone(),
            objects.clone(),
            upstream.clone(),
            EngineSettings::default(),
        );
        let env = Self {
            _dir: dir,
            store,
            objects,
            upstream,
            engine,
            user_id: "user-1".to_string(),
        };
        env.grant("user-1");
        env.store.get_or_create_settings("user-1", 0).unwrap();
        env
    }

    pub fn grant(&self, user_id: &str) {
        self.store
            .put_spotify_access(&SpotifyAccess {
                user_id: user_id.to_string(),
                spotify_user_id: format!("spotify-{}", user_id),
                access_token: format!("token-{}", user_id),
                refresh_token: format!("refresh-{}", user_id),
                expires_at: now_millis() + 3_600_000,
                updated_at: 0,
            })
            .unwrap();
    }

    pub fn liked(&self) -> TrackedPlaylist {
        self.store.ensure_liked_songs(&self.user_id, 0).unwrap().0
    }

    pub fn track_playlist(&self, playlist_id: &str) -> TrackedPlaylist {
        self.store
            .create_tracked_playlist(
                &self.user_id,
                NewTrackedPlaylist {
                    playlist_id: playlist_id.to_string(),
                    playlist_name: format!("Playlist {}", playlist_id),
                    removed_playlist_name: None,
                    public: false,
                    persistence: None,
                },
                0,
            )
            .unwrap()
    }

    pub fn track_playlist_with_mirror(&self, playlist_id: &str, mirror_id: &str) -> TrackedPlaylist {
        let playlist = self.track_playlist(playlist_id);
        self.store
            .update_tracked_playlist(
                &self.user_id,
                playlist.id,
                TrackedPlaylistUpdate {
                    removed_playlist_id: Some(Some(mirror_id.to_string())),
                    ..TrackedPlaylistUpdate::default()
                },
            )
            .unwrap()
            .unwrap()
    }

    pub fn deactivate(&self, tracked_playlist_id: u64) {
        self.store
            .update_tracked_playlist(
                &self.user_id,
                tracked_playlist_id,
                TrackedPlaylistUpdate {
                    active: Some(false),
                    ..TrackedPlaylistUpdate::default()
                },
            )
            .unwrap();
    }

    pub fn disable_mirroring(&self) {
        self.store
            .update_settings(
                &self.user_id,
                SettingsUpdate {
                    create_playlist: Some(false),
                    ..SettingsUpdate::default()
                },
                0,
            )
            .unwrap();
    }

    pub fn deleted(&self, id: u64) -> DeletedSong {
        self.store
            .get_deleted_song(&self.user_id, id)
            .unwrap()
            .unwrap()
    }

    /// Number of payload files currently in object storage.
    pub fn object_count(&self) -> usize {
        count_files(self.objects.root())
    }

    /// Request context for the environment's default user.
    pub fn auth_context(&self) -> AuthContext {
        AuthContext {
            user: AuthUser {
                id: self.user_id.clone(),
                spotify_user_id: format!("spotify-{}", self.user_id),
                display_name: None,
                created_at: 0,
            },
        }
    }

    /// HTTP state over this environment's store and engine, with job token `job-secret`.
    pub fn app_state(&self) -> AppState {
        let config = ServerConfig {
            job_token: Some(JOB_SECRET.to_string()),
            ..ServerConfig::default()
        };
        let auth = AuthStore::new(self.store.database(), config.session_ttl());
        auth.init_tables().unwrap();
        AppState {
            config: Arc::new(config),
            auth,
            store: self.store.clone(),
            engine: self.engine.clone(),
            oauth_states: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

fn count_files(dir: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| {
            let path = entry.path();
            if path.is_dir() {
                count_files(&path)
            } else {
                1
            }
        })
        .sum()
}

pub fn ids(tracks: &[SnapshotTrack]) -> Vec<&str> {
    tracks.iter().map(|track| track.id.as_str()).collect()
}

pub fn snapshot_ids(env: &TestEnv, tracked_playlist_id: u64, track_ids: &[&str]) -> LibrarySnapshot {
    let tracks = track_ids
        .iter()
        .map(|id| SnapshotTrack::from_id(*id))
        .collect();
    env.engine
        .create_snapshot(&env.user_id, tracked_playlist_id, tracks)
        .unwrap()
}

/// Records a removal of `track_id` detected by a snapshot taken at `removed_at`.
pub fn record_removal_at(
    env: &TestEnv,
    tracked_playlist_id: u64,
    track_id: &str,
    removed_at: u64,
) -> DeletedSong {
    let snapshot = env
        .store
        .insert_snapshot(NewSnapshot {
            user_id: env.user_id.clone(),
            tracked_playlist_id,
            created_at: removed_at,
            storage_key: format!("{}/snapshot_{}_{}.json.gz", env.user_id, tracked_playlist_id, removed_at),
            song_count: 0,
            payload_digest: String::new(),
        })
        .unwrap();
    env.store
        .record_removals(&snapshot, &[track_id.to_string()])
        .unwrap()
        .rows
        .remove(0)
}
