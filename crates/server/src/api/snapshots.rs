use axum::{
    extract::{Extension, Path as AxumPath, Query, State},
    http::{header, HeaderValue},
    response::{IntoResponse, Response},
    Json,
};
use common::LibrarySnapshot;

use crate::engine::PlaylistRun;
use crate::state::{AppState, AuthContext, JsonResult, ListResponse, SnapshotQuery};
use crate::utils::{engine_error, page_bounds};

/// Snapshots never change once written.
const SNAPSHOT_CACHE_CONTROL: &str = "public, max-age=86400";

pub async fn list_snapshots(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Query(query): Query<SnapshotQuery>,
) -> JsonResult<ListResponse<LibrarySnapshot>> {
    let (limit, offset) = page_bounds(query.limit, query.offset);
    let (items, total) = state
        .store
        .list_snapshots(&auth.user.id, query.tracked_playlist_id, limit, offset)
        .map_err(|err| engine_error(err.into()))?;
    Ok(Json(ListResponse { items, total }))
}

pub async fn get_snapshot(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    AxumPath(snapshot_id): AxumPath<u64>,
) -> Response {
    match state.engine.get_snapshot(&auth.user.id, snapshot_id) {
        Ok(detail) => {
            let mut response = Json(detail).into_response();
            response.headers_mut().insert(
                header::CACHE_CONTROL,
                HeaderValue::from_static(SNAPSHOT_CACHE_CONTROL),
            );
            response
        }
        Err(err) => engine_error(err).into_response(),
    }
}

/// Pulls the tracked playlist now, snapshots it and runs removal detection.
pub async fn snapshot_now(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    AxumPath(tracked_id): AxumPath<u64>,
) -> JsonResult<PlaylistRun> {
    let run = state
        .engine
        .run_playlist(&auth.user.id, tracked_id)
        .await
        .map_err(engine_error)?;
    Ok(Json(run))
}
