use serde::{Deserialize, Serialize};

/// External playlist id used for the synthetic Liked Songs playlist.
pub const LIKED_SONGS_ID: &str = "liked_songs";
pub const LIKED_SONGS_NAME: &str = "Liked Songs";
pub const DEFAULT_MIRROR_NAME: &str = "Recently Removed";

pub const MS_PER_DAY: u64 = 24 * 60 * 60 * 1000;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedPlaylist {
    pub id: u64,
    pub user_id: String,
    pub playlist_id: String,
    pub playlist_name: String,
    pub liked_songs: bool,
    pub active: bool,
    pub removed_playlist_id: Option<String>,
    pub removed_playlist_name: Option<String>,
    pub public: bool,
    #[serde(default)]
    pub persistence: Option<PersistenceWindow>,
    pub created_at: u64,
}

impl TrackedPlaylist {
    pub fn source(&self) -> PlaylistSource {
        if self.liked_songs {
            PlaylistSource::LikedSongs
        } else {
            PlaylistSource::Playlist(self.playlist_id.clone())
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlaylistSource {
    LikedSongs,
    Playlist(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibrarySnapshot {
    pub id: u64,
    pub user_id: String,
    pub tracked_playlist_id: u64,
    pub created_at: u64,
    pub storage_key: String,
    pub song_count: u64,
    pub payload_digest: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeactivateReason {
    Expired,
    Restored,
}

/// A track present in one snapshot and absent from the next.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedSong {
    pub id: u64,
    pub user_id: String,
    pub tracked_playlist_id: u64,
    pub track_id: String,
    pub snapshot_id: u64,
    pub removed_at: u64,
    pub active: bool,
    pub mirrored: bool,
    pub deactivated: Option<DeactivateReason>,
    pub deactivated_at: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedTrack {
    pub track_id: String,
    pub name: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub image: Option<String>,
    pub updated_at: u64,
}

impl CachedTrack {
    pub fn is_fresh(&self, now: u64, ttl_ms: u64) -> bool {
        now.saturating_sub(self.updated_at) < ttl_ms
    }
}

/// One entry of a snapshot payload. Only `id` is required.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotTrack {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artist: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub album: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub added_at: Option<String>,
}

impl SnapshotTrack {
    pub fn from_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn to_cached(&self, updated_at: u64) -> CachedTrack {
        CachedTrack {
            track_id: self.id.clone(),
            name: self.name.clone(),
            artist: self.artist.clone(),
            album: self.album.clone(),
            image: self.image.clone(),
            updated_at,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PersistenceWindow {
    #[default]
    #[serde(rename = "forever")]
    Forever,
    #[serde(rename = "30 days")]
    Days30,
    #[serde(rename = "90 days")]
    Days90,
    #[serde(rename = "180 days")]
    Days180,
    #[serde(rename = "1 year")]
    Year1,
}

impl PersistenceWindow {
    /// Retention length in milliseconds, `None` for forever.
    pub fn duration_ms(self) -> Option<u64> {
        let days = match self {
            PersistenceWindow::Forever => return None,
            PersistenceWindow::Days30 => 30,
            PersistenceWindow::Days90 => 90,
            PersistenceWindow::Days180 => 180,
            PersistenceWindow::Year1 => 365,
        };
        Some(days * MS_PER_DAY)
    }

    /// True once `removed_at + window <= now`. Forever never expires.
    pub fn is_expired(self, removed_at: u64, now: u64) -> bool {
        match self.duration_ms() {
            Some(window) => removed_at.saturating_add(window) <= now,
            None => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PersistenceWindow::Forever => "forever",
            PersistenceWindow::Days30 => "30 days",
            PersistenceWindow::Days90 => "90 days",
            PersistenceWindow::Days180 => "180 days",
            PersistenceWindow::Year1 => "1 year",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSettings {
    pub user_id: String,
    pub snapshots_enabled: bool,
    pub create_playlist: bool,
    pub playlist_name: String,
    pub playlist_persistence: PersistenceWindow,
    pub suggestion_emails: bool,
    pub created_at: u64,
}

impl UserSettings {
    pub fn new(user_id: &str, created_at: u64) -> Self {
        Self {
            user_id: user_id.to_string(),
            snapshots_enabled: true,
            create_playlist: true,
            playlist_name: DEFAULT_MIRROR_NAME.to_string(),
            playlist_persistence: PersistenceWindow::Forever,
            suggestion_emails: true,
            created_at,
        }
    }
}

/// Stored upstream grant for one user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpotifyAccess {
    pub user_id: String,
    pub spotify_user_id: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: u64,
    pub updated_at: u64,
}

pub fn payload_digest(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::{payload_digest, PersistenceWindow, MS_PER_DAY};

    #[test]
    fn payload_digest_is_deterministic() {
        let first = payload_digest(b"[{\"id\":\"a\"}]");
        assert_eq!(first, payload_digest(b"[{\"id\":\"a\"}]"));
        assert_ne!(first, payload_digest(b"[{\"id\":\"b\"}]"));
    }

    #[test]
    fn persistence_boundary_is_inclusive() {
        let now = 400 * MS_PER_DAY;
        let window = PersistenceWindow::Days30;
        assert!(window.is_expired(now - 30 * MS_PER_DAY, now));
        assert!(!window.is_expired(now - 30 * MS_PER_DAY + 1, now));
        assert!(!PersistenceWindow::Forever.is_expired(0, now));
    }

    #[test]
    fn persistence_windows_map_to_days() {
        assert_eq!(PersistenceWindow::Year1.duration_ms(), Some(365 * MS_PER_DAY));
        assert_eq!(PersistenceWindow::Days180.as_str(), "180 days");
        assert_eq!(PersistenceWindow::Forever.duration_ms(), None);
    }
}
