use std::collections::{HashMap, HashSet};

use common::CachedTrack;
use serde::Serialize;
use tracing::warn;

use super::{Engine, PartialFailure};
use crate::error::EngineError;
use crate::upstream::TRACK_LOOKUP_LIMIT;
use crate::utils::now_millis;

#[derive(Clone, Debug, Default, Serialize)]
pub struct ResolvedTracks {
    pub tracks: HashMap<String, CachedTrack>,
    /// Ids answered from an expired cache row because the upstream lookup failed.
    pub stale: Vec<String>,
    /// Ids with no metadata at all.
    pub missing: Vec<String>,
    pub failure: Option<PartialFailure>,
}

impl Engine {
    /// Resolves track ids to display metadata, reading through the shared cache.
    /// Misses are looked up upstream in batches and upserted.
    pub async fn resolve_tracks(
        &self,
        user_id: &str,
        track_ids: &[String],
    ) -> Result<ResolvedTracks, EngineError> {
        let mut seen = HashSet::new();
        let requested: Vec<String> = track_ids
            .iter()
            .filter(|id| !id.is_empty() && seen.insert(id.as_str()))
            .cloned()
            .collect();
        let now = now_millis();
        let ttl_ms = self.settings.track_cache_ttl.as_millis() as u64;

        let mut cached = self.store.get_cached_tracks(&requested)?;
        let mut resolved = ResolvedTracks::default();
        let mut misses = Vec::new();
        for id in requested {
            match cached.remove(&id) {
                Some(track) if track.is_fresh(now, ttl_ms) => {
                    resolved.tracks.insert(id, track);
                }
                Some(track) => {
                    cached.insert(id.clone(), track);
                    misses.push(id);
                }
                None => misses.push(id),
            }
        }
        if misses.is_empty() {
            return Ok(resolved);
        }

        let ctx = match self.access.context_for(user_id).await {
            Ok(ctx) => Some(ctx),
            Err(err) => {
                warn!("Track lookup skipped for user {}: {}", user_id, err);
                fall_back(&mut resolved, &mut cached, &misses, &err.to_string());
                None
            }
        };
        let Some(ctx) = ctx else {
            return Ok(resolved);
        };

        for chunk in misses.chunks(TRACK_LOOKUP_LIMIT) {
            match self.upstream.get_tracks(&ctx, chunk).await {
                Ok(found) => {
                    let fresh: Vec<CachedTrack> =
                        found.iter().map(|track| track.to_cached(now)).collect();
                    if let Err(err) = self.store.upsert_cached_tracks(&fresh) {
                        warn!("Failed to update track cache: {}", err);
                    }
                    for track in fresh {
                        cached.remove(&track.track_id);
                        resolved.tracks.insert(track.track_id.clone(), track);
                    }
                    let unresolved: Vec<String> = chunk
                        .iter()
                        .filter(|id| !resolved.tracks.contains_key(*id))
                        .cloned()
                        .collect();
                    fall_back(&mut resolved, &mut cached, &unresolved, "");
                }
                Err(err) => {
                    warn!("Track lookup of {} ids failed: {}", chunk.len(), err);
                    fall_back(&mut resolved, &mut cached, chunk, &err.to_string());
                }
            }
        }
        Ok(resolved)
    }
}

/// Serves stale rows where available. An empty `message` means the upstream answered
/// but did not know the id, which is not a failure.
fn fall_back(
    resolved: &mut ResolvedTracks,
    cached: &mut HashMap<String, CachedTrack>,
    ids: &[String],
    message: &str,
) {
    let mut failed = Vec::new();
    for id in ids {
        match cached.remove(id) {
            Some(track) => {
                resolved.stale.push(id.clone());
                resolved.tracks.insert(id.clone(), track);
            }
            None => {
                resolved.missing.push(id.clone());
                failed.push(id.clone());
            }
        }
    }
    if message.is_empty() || failed.is_empty() {
        return;
    }
    match resolved.failure.as_mut() {
        Some(existing) => existing.track_ids.extend(failed),
        None => {
            resolved.failure = Some(PartialFailure {
                track_ids: failed,
                message: message.to_string(),
            })
        }
    }
}
