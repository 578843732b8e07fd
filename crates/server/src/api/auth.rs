use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::Response,
    Json,
};
use tracing::{info, warn};

use crate::state::{AppState, CallbackQuery, JsonResult, LoginUrlResponse, SessionResponse};
use crate::utils::{
    engine_error, extract_token, json_error, json_error_response, json_ok_response, now_millis,
};

/// Pending authorization requests expire after this long.
const OAUTH_STATE_TTL_MS: u64 = 10 * 60 * 1000;

pub async fn auth_login(State(state): State<AppState>) -> JsonResult<LoginUrlResponse> {
    let oauth_state = uuid::Uuid::new_v4().simple().to_string();
    let url = state
        .engine
        .upstream()
        .authorize_url(&oauth_state)
        .map_err(|err| json_error(StatusCode::SERVICE_UNAVAILABLE, err.to_string()))?;

    let now = now_millis();
    let mut pending = state.oauth_states.lock();
    pending.retain(|_, issued| issued.saturating_add(OAUTH_STATE_TTL_MS) > now);
    pending.insert(oauth_state.clone(), now);

    Ok(Json(LoginUrlResponse {
        url,
        state: oauth_state,
    }))
}

pub async fn auth_callback(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
) -> JsonResult<SessionResponse> {
    if let Some(error) = query.error {
        return Err(json_error(
            StatusCode::UNAUTHORIZED,
            format!("authorization denied: {}", error),
        ));
    }
    let oauth_state = query.state.unwrap_or_default();
    let issued = state.oauth_states.lock().remove(&oauth_state);
    match issued {
        Some(issued) if issued.saturating_add(OAUTH_STATE_TTL_MS) > now_millis() => {}
        _ => return Err(json_error(StatusCode::BAD_REQUEST, "invalid or expired state")),
    }
    let code = match query.code.as_deref().map(str::trim) {
        Some(code) if !code.is_empty() => code.to_string(),
        _ => return Err(json_error(StatusCode::BAD_REQUEST, "missing code")),
    };

    let upstream = state.engine.upstream();
    let grant = upstream
        .exchange_code(&code)
        .await
        .map_err(|err| engine_error(err.into()))?;
    let profile = upstream
        .current_user(&grant.access_token)
        .await
        .map_err(|err| engine_error(err.into()))?;

    let (user, created) = state
        .auth
        .find_or_create_user(&profile.id, profile.display_name.clone())
        .map_err(|err| json_error(StatusCode::INTERNAL_SERVER_ERROR, format!("auth error: {}", err)))?;
    state
        .engine
        .access()
        .store_grant(&user.id, &profile.id, grant)
        .map_err(engine_error)?;

    let now = now_millis();
    state
        .store
        .get_or_create_settings(&user.id, now)
        .map_err(|err| engine_error(err.into()))?;
    let (_, liked_created) = state
        .store
        .ensure_liked_songs(&user.id, now)
        .map_err(|err| engine_error(err.into()))?;
    if liked_created {
        info!("Started tracking Liked Songs for user {}", user.id);
    }

    let session = state
        .auth
        .create_session(&user.id)
        .map_err(|err| json_error(StatusCode::INTERNAL_SERVER_ERROR, format!("auth error: {}", err)))?;
    if created {
        info!("Registered user {} for upstream account {}", user.id, profile.id);
    } else {
        info!("User {} signed in", user.id);
    }

    Ok(Json(SessionResponse {
        token: session.token,
        expires_at: session.expires_at,
        token_type: "Bearer",
        user,
    }))
}

pub async fn auth_logout(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let token = match extract_token(&headers) {
        Some(token) => token,
        None => return json_error_response(StatusCode::BAD_REQUEST, "missing token"),
    };

    if let Err(err) = state.auth.revoke_session(&token) {
        warn!("Failed to revoke session: {}", err);
        return json_error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("auth error: {}", err),
        );
    }

    json_ok_response()
}
