pub mod auth;
pub mod deleted;
pub mod jobs;
pub mod settings;
pub mod snapshots;
pub mod tracked;
pub mod tracks;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};

use crate::state::{AppState, AuthContext, HealthResponse};
use crate::utils::{extract_token, json_error_response};

pub const JOB_TOKEN_HEADER: &str = "x-job-token";

pub fn api_router(state: AppState) -> Router {
    let auth = Router::new()
        .route("/auth/login", get(auth::auth_login))
        .route("/auth/callback", get(auth::auth_callback))
        .route("/auth/logout", post(auth::auth_logout));

    let jobs = Router::new()
        .route("/jobs/snapshots", post(jobs::run_snapshots))
        .route("/jobs/sweep", post(jobs::run_sweep))
        .layer(middleware::from_fn_with_state(state.clone(), require_job_token));

    let protected = Router::new()
        .route("/snapshots", get(snapshots::list_snapshots))
        .route("/snapshots/:snapshot_id", get(snapshots::get_snapshot))
        .route("/tracked", get(tracked::list_tracked))
        .route("/tracked", post(tracked::create_tracked))
        .route("/tracked/:tracked_id", post(tracked::update_tracked))
        .route(
            "/tracked/:tracked_id",
            axum::routing::delete(tracked::remove_tracked),
        )
        .route("/tracked/:tracked_id/snapshot", post(snapshots::snapshot_now))
        .route("/deleted", get(deleted::list_deleted))
        .route("/deleted/:deleted_id/restore", post(deleted::restore_deleted))
        .route("/tracks", post(tracks::resolve_tracks))
        .route("/settings", get(settings::get_settings))
        .route("/settings", post(settings::update_settings))
        .route("/settings/delete-data", post(settings::delete_data))
        .route("/digest", get(settings::weekly_digest))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/health", get(health))
        .merge(auth)
        .merge(jobs)
        .merge(protected)
        .with_state(state)
}

async fn require_auth(
    State(state): State<AppState>,
    mut req: axum::http::Request<Body>,
    next: Next,
) -> Response {
    let token = match extract_token(req.headers()) {
        Some(token) => token,
        None => return json_error_response(StatusCode::UNAUTHORIZED, "unauthorized"),
    };

    match state.auth.user_from_token(&token) {
        Ok(Some(user)) => {
            req.extensions_mut().insert(AuthContext { user });
            next.run(req).await
        }
        Ok(None) => json_error_response(StatusCode::UNAUTHORIZED, "unauthorized"),
        Err(err) => json_error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("auth error: {}", err),
        ),
    }
}

async fn require_job_token(
    State(state): State<AppState>,
    req: axum::http::Request<Body>,
    next: Next,
) -> Response {
    match check_job_token(state.config.job_token.as_deref(), req.headers()) {
        Ok(()) => next.run(req).await,
        Err((status, message)) => json_error_response(status, message),
    }
}

fn check_job_token(
    expected: Option<&str>,
    headers: &HeaderMap,
) -> Result<(), (StatusCode, &'static str)> {
    let Some(expected) = expected else {
        return Err((StatusCode::SERVICE_UNAVAILABLE, "job token not configured"));
    };
    let provided = headers
        .get(JOB_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok());
    if provided == Some(expected) {
        Ok(())
    } else {
        Err((StatusCode::UNAUTHORIZED, "invalid job token"))
    }
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse { status: "ok" })
}
