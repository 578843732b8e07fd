use axum::{
    extract::{Extension, State},
    http::StatusCode,
    Json,
};
use common::UserSettings;
use library::SettingsUpdate;

use crate::engine::{DeleteDataReport, DeleteDataRequest, WeeklyDigest};
use crate::state::{AppState, AuthContext, JsonResult, UpdateSettingsRequest};
use crate::utils::{engine_error, json_error, now_millis};

pub async fn get_settings(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> JsonResult<UserSettings> {
    let settings = state
        .store
        .get_or_create_settings(&auth.user.id, now_millis())
        .map_err(|err| engine_error(err.into()))?;
    Ok(Json(settings))
}

pub async fn update_settings(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(payload): Json<UpdateSettingsRequest>,
) -> JsonResult<UserSettings> {
    let update = SettingsUpdate {
        snapshots_enabled: payload.snapshots_enabled,
        create_playlist: payload.create_playlist,
        playlist_name: payload.playlist_name,
        playlist_persistence: payload.playlist_persistence,
        suggestion_emails: payload.suggestion_emails,
    };
    let settings = state
        .store
        .update_settings(&auth.user.id, update, now_millis())
        .map_err(|err| engine_error(err.into()))?;
    Ok(Json(settings))
}

pub async fn delete_data(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(payload): Json<DeleteDataRequest>,
) -> JsonResult<DeleteDataReport> {
    if !payload.delete_snapshots && !payload.delete_removed_songs && !payload.delete_tracked_playlists
    {
        return Err(json_error(StatusCode::BAD_REQUEST, "nothing selected for deletion"));
    }
    Ok(Json(state.engine.delete_user_data(&auth.user.id, &payload)))
}

pub async fn weekly_digest(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> JsonResult<WeeklyDigest> {
    let digest = state
        .engine
        .weekly_digest(&auth.user.id, now_millis())
        .await
        .map_err(engine_error)?;
    Ok(Json(digest))
}
