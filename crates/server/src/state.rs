use std::collections::HashMap;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::Json;
use common::PersistenceWindow;
use library::LibraryStore;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::auth::{AuthStore, AuthUser};
use crate::config::ServerConfig;
use crate::engine::Engine;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub auth: AuthStore,
    pub store: LibraryStore,
    pub engine: Engine,
    /// Pending OAuth `state` values and when they were issued (ms).
    pub oauth_states: Arc<Mutex<HashMap<String, u64>>>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ListResponse<T> {
    pub items: Vec<T>,
    pub total: usize,
}

#[derive(Clone)]
pub struct AuthContext {
    pub user: AuthUser,
}

#[derive(Debug, Serialize)]
pub struct LoginUrlResponse {
    pub url: String,
    pub state: String,
}

#[derive(Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub token: String,
    pub expires_at: u64,
    pub token_type: &'static str,
    pub user: AuthUser,
}

#[derive(Debug, Deserialize)]
pub struct SnapshotQuery {
    pub tracked_playlist_id: Option<u64>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct DeletedQuery {
    pub active: Option<bool>,
    pub tracked_playlist_id: Option<u64>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct CreateTrackedRequest {
    pub playlist_id: String,
    pub playlist_name: String,
    pub removed_playlist_name: Option<String>,
    #[serde(default)]
    pub public: bool,
    pub persistence: Option<PersistenceWindow>,
}

/// Absent fields are left unchanged. `clear_*` flags reset optional fields.
#[derive(Debug, Default, Deserialize)]
pub struct UpdateTrackedRequest {
    pub playlist_name: Option<String>,
    pub active: Option<bool>,
    pub removed_playlist_name: Option<String>,
    pub public: Option<bool>,
    pub persistence: Option<PersistenceWindow>,
    #[serde(default)]
    pub clear_removed_playlist: bool,
    #[serde(default)]
    pub clear_persistence: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateSettingsRequest {
    pub snapshots_enabled: Option<bool>,
    pub create_playlist: Option<bool>,
    pub playlist_name: Option<String>,
    pub playlist_persistence: Option<PersistenceWindow>,
    pub suggestion_emails: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct ResolveTracksRequest {
    pub track_ids: Vec<String>,
}

pub type JsonResult<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;
