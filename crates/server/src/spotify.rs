use async_trait::async_trait;
use common::{PlaylistSource, SnapshotTrack};
use reqwest::{header, Client, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::SpotifyConfig;
use crate::upstream::{
    AccessContext, AccessGrant, TrackPage, Upstream, UpstreamError, UpstreamProfile,
    LIKED_PAGE_SIZE, PLAYLIST_PAGE_SIZE,
};

const SCOPES: &str = "user-library-read user-library-modify playlist-read-private \
playlist-modify-private playlist-modify-public";

/// Spotify Web API client. Holds no user tokens; every call takes an explicit context.
#[derive(Clone)]
pub struct SpotifyClient {
    http: Client,
    config: SpotifyConfig,
}

impl SpotifyClient {
    pub fn new(config: SpotifyConfig) -> Result<Self, reqwest::Error> {
        let http = Client::builder()
            .user_agent("trackkeeper/0.1")
            .timeout(config.timeout())
            .build()?;
        Ok(Self { http, config })
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base.trim_end_matches('/'), path)
    }

    fn token_url(&self) -> String {
        format!(
            "{}/api/token",
            self.config.accounts_base.trim_end_matches('/')
        )
    }

    async fn token_request(&self, form: &[(&str, &str)]) -> Result<AccessGrant, UpstreamError> {
        let response = self
            .http
            .post(self.token_url())
            .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
            .form(form)
            .send()
            .await
            .map_err(transport)?;
        let token: TokenResponse = decode(check(response).await?).await?;
        Ok(AccessGrant {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_in_secs: token.expires_in,
        })
    }
}

#[async_trait]
impl Upstream for SpotifyClient {
    fn authorize_url(&self, state: &str) -> Result<String, UpstreamError> {
        let base = format!(
            "{}/authorize",
            self.config.accounts_base.trim_end_matches('/')
        );
        let url = Url::parse_with_params(
            &base,
            &[
                ("client_id", self.config.client_id.as_str()),
                ("response_type", "code"),
                ("redirect_uri", self.config.redirect_uri.as_str()),
                ("scope", SCOPES),
                ("state", state),
            ],
        )
        .map_err(|err| UpstreamError::Transport(format!("invalid accounts url: {}", err)))?;
        Ok(url.to_string())
    }

    async fn exchange_code(&self, code: &str) -> Result<AccessGrant, UpstreamError> {
        self.token_request(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.config.redirect_uri.as_str()),
        ])
        .await
    }

    async fn refresh_access(&self, refresh_token: &str) -> Result<AccessGrant, UpstreamError> {
        self.token_request(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ])
        .await
    }

    async fn current_user(&self, access_token: &str) -> Result<UpstreamProfile, UpstreamError> {
        let response = self
            .http
            .get(self.api_url("/me"))
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(transport)?;
        let profile: ProfileResponse = decode(check(response).await?).await?;
        Ok(UpstreamProfile {
            id: profile.id,
            display_name: profile.display_name,
        })
    }

    async fn list_tracks_page(
        &self,
        ctx: &AccessContext,
        source: &PlaylistSource,
        offset: u32,
    ) -> Result<TrackPage, UpstreamError> {
        let (path, limit) = match source {
            PlaylistSource::LikedSongs => ("/me/tracks".to_string(), LIKED_PAGE_SIZE),
            PlaylistSource::Playlist(id) => (format!("/playlists/{}/tracks", id), PLAYLIST_PAGE_SIZE),
        };
        let response = self
            .http
            .get(self.api_url(&path))
            .bearer_auth(&ctx.access_token)
            .query(&[("limit", limit), ("offset", offset)])
            .send()
            .await
            .map_err(transport)?;
        let page: PageResponse = decode(check(response).await?).await?;
        let fetched = page.items.len() as u32;
        let items = page
            .items
            .into_iter()
            .filter_map(|item| {
                let added_at = item.added_at;
                item.track.and_then(|track| track.into_snapshot_track(added_at))
            })
            .collect();
        let next_offset = match page.next {
            Some(_) if fetched > 0 => Some(offset + fetched),
            _ => None,
        };
        Ok(TrackPage { items, next_offset })
    }

    async fn get_tracks(
        &self,
        ctx: &AccessContext,
        track_ids: &[String],
    ) -> Result<Vec<SnapshotTrack>, UpstreamError> {
        if track_ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids = track_ids.join(",");
        let response = self
            .http
            .get(self.api_url("/tracks"))
            .bearer_auth(&ctx.access_token)
            .query(&[("ids", ids.as_str())])
            .send()
            .await
            .map_err(transport)?;
        let body: TracksResponse = decode(check(response).await?).await?;
        Ok(body
            .tracks
            .into_iter()
            .flatten()
            .filter_map(|track| track.into_snapshot_track(None))
            .collect())
    }

    async fn create_playlist(
        &self,
        ctx: &AccessContext,
        name: &str,
        public: bool,
    ) -> Result<String, UpstreamError> {
        let path = format!("/users/{}/playlists", ctx.spotify_user_id);
        let response = self
            .http
            .post(self.api_url(&path))
            .bearer_auth(&ctx.access_token)
            .json(&CreatePlaylistBody {
                name,
                public,
                description: "Tracks removed from your library, kept by trackkeeper.",
            })
            .send()
            .await
            .map_err(transport)?;
        let created: CreatedPlaylist = decode(check(response).await?).await?;
        Ok(created.id)
    }

    async fn add_tracks(
        &self,
        ctx: &AccessContext,
        playlist_id: &str,
        track_ids: &[String],
    ) -> Result<(), UpstreamError> {
        let uris: Vec<String> = track_ids.iter().map(|id| track_uri(id)).collect();
        let path = format!("/playlists/{}/tracks", playlist_id);
        let response = self
            .http
            .post(self.api_url(&path))
            .bearer_auth(&ctx.access_token)
            .json(&serde_json::json!({ "uris": uris }))
            .send()
            .await
            .map_err(transport)?;
        check(response).await?;
        Ok(())
    }

    async fn remove_tracks(
        &self,
        ctx: &AccessContext,
        playlist_id: &str,
        track_ids: &[String],
    ) -> Result<(), UpstreamError> {
        let tracks: Vec<serde_json::Value> = track_ids
            .iter()
            .map(|id| serde_json::json!({ "uri": track_uri(id) }))
            .collect();
        let path = format!("/playlists/{}/tracks", playlist_id);
        let response = self
            .http
            .delete(self.api_url(&path))
            .bearer_auth(&ctx.access_token)
            .json(&serde_json::json!({ "tracks": tracks }))
            .send()
            .await
            .map_err(transport)?;
        check(response).await?;
        Ok(())
    }

    async fn save_liked_tracks(
        &self,
        ctx: &AccessContext,
        track_ids: &[String],
    ) -> Result<(), UpstreamError> {
        let response = self
            .http
            .put(self.api_url("/me/tracks"))
            .bearer_auth(&ctx.access_token)
            .json(&serde_json::json!({ "ids": track_ids }))
            .send()
            .await
            .map_err(transport)?;
        check(response).await?;
        Ok(())
    }
}

fn track_uri(id: &str) -> String {
    format!("spotify:track:{}", id)
}

fn transport(err: reqwest::Error) -> UpstreamError {
    UpstreamError::Transport(err.to_string())
}

async fn check(response: Response) -> Result<Response, UpstreamError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::UNAUTHORIZED {
        return Err(UpstreamError::Unauthorized);
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after_secs = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok());
        return Err(UpstreamError::RateLimited { retry_after_secs });
    }
    let mut message = response.text().await.unwrap_or_default();
    message.truncate(200);
    Err(UpstreamError::Status {
        status: status.as_u16(),
        message,
    })
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, UpstreamError> {
    response
        .json::<T>()
        .await
        .map_err(|err| UpstreamError::Decode(err.to_string()))
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

#[derive(Deserialize)]
struct ProfileResponse {
    id: String,
    #[serde(default)]
    display_name: Option<String>,
}

#[derive(Deserialize)]
struct PageResponse {
    #[serde(default)]
    items: Vec<PageItem>,
    #[serde(default)]
    next: Option<String>,
}

#[derive(Deserialize)]
struct PageItem {
    #[serde(default)]
    added_at: Option<String>,
    #[serde(default)]
    track: Option<TrackObject>,
}

#[derive(Deserialize)]
struct TracksResponse {
    #[serde(default)]
    tracks: Vec<Option<TrackObject>>,
}

#[derive(Deserialize)]
struct TrackObject {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    artists: Vec<ArtistObject>,
    #[serde(default)]
    album: Option<AlbumObject>,
}

#[derive(Deserialize)]
struct ArtistObject {
    name: String,
}

#[derive(Deserialize)]
struct AlbumObject {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    images: Vec<ImageObject>,
}

#[derive(Deserialize)]
struct ImageObject {
    url: String,
    #[serde(default)]
    width: Option<u32>,
}

#[derive(Serialize)]
struct CreatePlaylistBody<'a> {
    name: &'a str,
    public: bool,
    description: &'a str,
}

#[derive(Deserialize)]
struct CreatedPlaylist {
    id: String,
}

impl TrackObject {
    /// Local files and unavailable tracks carry no id and are skipped.
    fn into_snapshot_track(self, added_at: Option<String>) -> Option<SnapshotTrack> {
        let id = self.id.filter(|id| !id.is_empty())?;
        let artist = if self.artists.is_empty() {
            None
        } else {
            Some(
                self.artists
                    .into_iter()
                    .map(|artist| artist.name)
                    .collect::<Vec<_>>()
                    .join(", "),
            )
        };
        let (album, image) = match self.album {
            Some(album) => (album.name, smallest_image(album.images)),
            None => (None, None),
        };
        Some(SnapshotTrack {
            id,
            name: self.name,
            artist,
            album,
            image,
            added_at,
        })
    }
}

fn smallest_image(images: Vec<ImageObject>) -> Option<String> {
    images
        .into_iter()
        .min_by_key(|image| image.width.unwrap_or(u32::MAX))
        .map(|image| image.url)
}
