use axum::{
    extract::{Extension, Path as AxumPath, Query, State},
    Json,
};
use common::DeletedSong;
use library::DeletedSongFilter;

use crate::engine::RestoreOutcome;
use crate::state::{AppState, AuthContext, DeletedQuery, JsonResult, ListResponse};
use crate::utils::{engine_error, now_millis, page_bounds};

pub async fn list_deleted(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Query(query): Query<DeletedQuery>,
) -> JsonResult<ListResponse<DeletedSong>> {
    let (limit, offset) = page_bounds(query.limit, query.offset);
    let filter = DeletedSongFilter {
        active: query.active,
        tracked_playlist_id: query.tracked_playlist_id,
        removed_since: None,
    };
    let (items, total) = state
        .store
        .list_deleted_songs(&auth.user.id, &filter, limit, offset)
        .map_err(|err| engine_error(err.into()))?;
    Ok(Json(ListResponse { items, total }))
}

pub async fn restore_deleted(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    AxumPath(deleted_id): AxumPath<u64>,
) -> JsonResult<RestoreOutcome> {
    let outcome = state
        .engine
        .restore_deleted_song(&auth.user.id, deleted_id, now_millis())
        .await
        .map_err(engine_error)?;
    Ok(Json(outcome))
}
