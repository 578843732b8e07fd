use axum::{
    extract::{Extension, State},
    http::StatusCode,
    Json,
};

use crate::engine::ResolvedTracks;
use crate::state::{AppState, AuthContext, JsonResult, ResolveTracksRequest};
use crate::utils::{engine_error, json_error, MAX_PAGE_LIMIT};

/// Resolves track ids to display metadata through the shared track cache.
pub async fn resolve_tracks(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(payload): Json<ResolveTracksRequest>,
) -> JsonResult<ResolvedTracks> {
    if payload.track_ids.len() > MAX_PAGE_LIMIT {
        return Err(json_error(
            StatusCode::BAD_REQUEST,
            format!("at most {} track ids per request", MAX_PAGE_LIMIT),
        ));
    }
    let resolved = state
        .engine
        .resolve_tracks(&auth.user.id, &payload.track_ids)
        .await
        .map_err(engine_error)?;
    Ok(Json(resolved))
}
