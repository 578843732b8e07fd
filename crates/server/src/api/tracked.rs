use axum::{
    extract::{Extension, Path as AxumPath, State},
    http::StatusCode,
    Json,
};
use common::TrackedPlaylist;
use library::{NewTrackedPlaylist, TrackedPlaylistUpdate, TrackedRemoval};
use serde::Serialize;
use tracing::info;

use crate::state::{
    AppState, AuthContext, CreateTrackedRequest, JsonResult, ListResponse, UpdateTrackedRequest,
};
use crate::utils::{engine_error, json_error, now_millis};

#[derive(Debug, Serialize)]
pub struct RemoveTrackedResponse {
    pub id: u64,
    pub outcome: TrackedRemoval,
}

pub async fn list_tracked(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> JsonResult<ListResponse<TrackedPlaylist>> {
    let items = state
        .store
        .list_tracked_playlists(&auth.user.id)
        .map_err(|err| engine_error(err.into()))?;
    let total = items.len();
    Ok(Json(ListResponse { items, total }))
}

pub async fn create_tracked(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(payload): Json<CreateTrackedRequest>,
) -> JsonResult<TrackedPlaylist> {
    if payload.playlist_name.trim().is_empty() {
        return Err(json_error(StatusCode::BAD_REQUEST, "playlist_name is required"));
    }
    let new = NewTrackedPlaylist {
        playlist_id: payload.playlist_id,
        playlist_name: payload.playlist_name.trim().to_string(),
        removed_playlist_name: payload.removed_playlist_name,
        public: payload.public,
        persistence: payload.persistence,
    };
    let playlist = state
        .store
        .create_tracked_playlist(&auth.user.id, new, now_millis())
        .map_err(|err| engine_error(err.into()))?;
    info!(
        "User {} started tracking playlist {} ({})",
        auth.user.id, playlist.playlist_id, playlist.id
    );
    Ok(Json(playlist))
}

pub async fn update_tracked(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    AxumPath(tracked_id): AxumPath<u64>,
    Json(payload): Json<UpdateTrackedRequest>,
) -> JsonResult<TrackedPlaylist> {
    let removed_playlist_name = if payload.clear_removed_playlist {
        Some(None)
    } else {
        payload.removed_playlist_name.map(Some)
    };
    let update = TrackedPlaylistUpdate {
        playlist_name: payload.playlist_name,
        active: payload.active,
        // A cleared mirror is recreated under the new name on the next diff.
        removed_playlist_id: payload.clear_removed_playlist.then_some(None),
        removed_playlist_name,
        public: payload.public,
        persistence: if payload.clear_persistence {
            Some(None)
        } else {
            payload.persistence.map(Some)
        },
    };
    let updated = state
        .store
        .update_tracked_playlist(&auth.user.id, tracked_id, update)
        .map_err(|err| engine_error(err.into()))?;
    match updated {
        Some(playlist) => Ok(Json(playlist)),
        None => Err(json_error(StatusCode::NOT_FOUND, "tracked playlist not found")),
    }
}

pub async fn remove_tracked(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    AxumPath(tracked_id): AxumPath<u64>,
) -> JsonResult<RemoveTrackedResponse> {
    let outcome = state
        .store
        .remove_tracked_playlist(&auth.user.id, tracked_id)
        .map_err(|err| engine_error(err.into()))?;
    match outcome {
        Some(outcome) => {
            info!(
                "User {} stopped tracking playlist {}: {:?}",
                auth.user.id, tracked_id, outcome
            );
            Ok(Json(RemoveTrackedResponse {
                id: tracked_id,
                outcome,
            }))
        }
        None => Err(json_error(StatusCode::NOT_FOUND, "tracked playlist not found")),
    }
}
