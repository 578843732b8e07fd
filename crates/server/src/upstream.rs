use async_trait::async_trait;
use common::{PlaylistSource, SnapshotTrack};
use serde::Serialize;

/// Most track ids the upstream accepts in one metadata lookup.
pub const TRACK_LOOKUP_LIMIT: usize = 50;
/// Most tracks one playlist add/remove call accepts.
pub const PLAYLIST_WRITE_LIMIT: usize = 100;
/// Most tracks one save-to-Liked-Songs call accepts.
pub const LIKED_WRITE_LIMIT: usize = 50;

pub const LIKED_PAGE_SIZE: u32 = 50;
pub const PLAYLIST_PAGE_SIZE: u32 = 100;

/// Bearer context for one user. Passed into every upstream call; never shared across users.
#[derive(Clone, Debug)]
pub struct AccessContext {
    pub user_id: String,
    pub spotify_user_id: String,
    pub access_token: String,
}

#[derive(Clone, Debug)]
pub struct AccessGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in_secs: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct UpstreamProfile {
    pub id: String,
    pub display_name: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct TrackPage {
    pub items: Vec<SnapshotTrack>,
    /// Offset of the next page, `None` once the listing is exhausted.
    pub next_offset: Option<u32>,
}

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream rejected the access token")]
    Unauthorized,
    #[error("upstream rate limited (retry after {retry_after_secs:?}s)")]
    RateLimited { retry_after_secs: Option<u64> },
    #[error("upstream returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("upstream transport error: {0}")]
    Transport(String),
    #[error("upstream response could not be decoded: {0}")]
    Decode(String),
}

/// The streaming service as seen by the engine. Batch methods take at most the
/// corresponding `*_LIMIT` ids; callers chunk.
#[async_trait]
pub trait Upstream: Send + Sync {
    fn authorize_url(&self, state: &str) -> Result<String, UpstreamError>;

    async fn exchange_code(&self, code: &str) -> Result<AccessGrant, UpstreamError>;

    async fn refresh_access(&self, refresh_token: &str) -> Result<AccessGrant, UpstreamError>;

    async fn current_user(&self, access_token: &str) -> Result<UpstreamProfile, UpstreamError>;

    async fn list_tracks_page(
        &self,
        ctx: &AccessContext,
        source: &PlaylistSource,
        offset: u32,
    ) -> Result<TrackPage, UpstreamError>;

    async fn get_tracks(
        &self,
        ctx: &AccessContext,
        track_ids: &[String],
    ) -> Result<Vec<SnapshotTrack>, UpstreamError>;

    /// Creates a playlist owned by the context's user and returns its id.
    async fn create_playlist(
        &self,
        ctx: &AccessContext,
        name: &str,
        public: bool,
    ) -> Result<String, UpstreamError>;

    async fn add_tracks(
        &self,
        ctx: &AccessContext,
        playlist_id: &str,
        track_ids: &[String],
    ) -> Result<(), UpstreamError>;

    async fn remove_tracks(
        &self,
        ctx: &AccessContext,
        playlist_id: &str,
        track_ids: &[String],
    ) -> Result<(), UpstreamError>;

    async fn save_liked_tracks(
        &self,
        ctx: &AccessContext,
        track_ids: &[String],
    ) -> Result<(), UpstreamError>;
}
