use axum::{extract::State, Json};

use crate::engine::SweepReport;
use crate::jobs::{self, SnapshotCycleReport};
use crate::state::{AppState, JsonResult};
use crate::utils::engine_error;

pub async fn run_snapshots(State(state): State<AppState>) -> JsonResult<SnapshotCycleReport> {
    let report = jobs::run_snapshot_cycle(&state.engine)
        .await
        .map_err(engine_error)?;
    Ok(Json(report))
}

pub async fn run_sweep(State(state): State<AppState>) -> JsonResult<SweepReport> {
    let report = jobs::run_sweep(&state.engine).await.map_err(engine_error)?;
    Ok(Json(report))
}
