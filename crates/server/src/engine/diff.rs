use std::collections::HashSet;

use common::{DeletedSong, TrackedPlaylist, DEFAULT_MIRROR_NAME};
use library::TrackedPlaylistUpdate;
use serde::Serialize;
use tracing::{info, warn};

use super::{Engine, PartialFailure};
use crate::error::EngineError;
use crate::upstream::PLAYLIST_WRITE_LIMIT;
use crate::utils::now_millis;

#[derive(Clone, Debug, Default, Serialize)]
pub struct DetectOutcome {
    /// Removal records for the newest snapshot pair, new or already present.
    pub removed: Vec<DeletedSong>,
    pub inserted: usize,
    pub mirrored: usize,
    pub mirror_failure: Option<PartialFailure>,
}

impl Engine {
    /// Records tracks present in the previous snapshot and absent from the newest one.
    pub async fn detect_removals(
        &self,
        user_id: &str,
        tracked_playlist_id: u64,
    ) -> Result<DetectOutcome, EngineError> {
        let playlist = self
            .store
            .get_tracked_playlist(user_id, tracked_playlist_id)?
            .ok_or_else(|| {
                EngineError::NotFound(format!("tracked playlist {}", tracked_playlist_id))
            })?;
        let latest = self.store.latest_snapshots(user_id, playlist.id, 2)?;
        let (current, previous) = match latest.as_slice() {
            [current, previous] => (current, previous),
            _ => return Ok(DetectOutcome::default()),
        };

        let current_ids: HashSet<String> = self
            .load_payload(current)?
            .into_iter()
            .map(|track| track.id)
            .collect();
        let mut seen = HashSet::new();
        let removed_tracks: Vec<_> = self
            .load_payload(previous)?
            .into_iter()
            .filter(|track| !current_ids.contains(&track.id) && seen.insert(track.id.clone()))
            .collect();

        // removed tracks may no longer resolve upstream
        let warm: Vec<_> = removed_tracks
            .iter()
            .filter(|track| track.name.is_some())
            .map(|track| track.to_cached(previous.created_at))
            .collect();
        if let Err(err) = self.store.upsert_cached_tracks(&warm) {
            warn!("Failed to warm track cache for playlist {}: {}", playlist.id, err);
        }

        let removed_ids: Vec<String> = removed_tracks.into_iter().map(|track| track.id).collect();
        let recorded = self.store.record_removals(current, &removed_ids)?;
        if recorded.inserted > 0 {
            info!(
                "Recorded {} removals for user {} playlist {} (snapshot {})",
                recorded.inserted, user_id, playlist.id, current.id
            );
        }

        let mut outcome = DetectOutcome {
            removed: recorded.rows,
            inserted: recorded.inserted,
            ..DetectOutcome::default()
        };
        self.mirror_pending(&playlist, &mut outcome).await?;
        Ok(outcome)
    }

    /// Appends active, not yet mirrored records of a playlist to its mirror playlist.
    /// Upstream failures leave the records unmirrored for the next run.
    async fn mirror_pending(
        &self,
        playlist: &TrackedPlaylist,
        outcome: &mut DetectOutcome,
    ) -> Result<(), EngineError> {
        let settings = self
            .store
            .get_or_create_settings(&playlist.user_id, now_millis())?;
        if !settings.create_playlist {
            return Ok(());
        }
        let pending: Vec<DeletedSong> = self
            .store
            .list_playlist_deleted_songs(playlist.id)?
            .into_iter()
            .filter(|row| row.active && !row.mirrored)
            .collect();
        if pending.is_empty() {
            return Ok(());
        }
        let pending_ids: Vec<String> = pending.iter().map(|row| row.track_id.clone()).collect();

        let mirror_id = match self.ensure_mirror(playlist, &settings.playlist_name).await {
            Ok(mirror_id) => mirror_id,
            Err(err) => {
                warn!(
                    "Mirror playlist unavailable for playlist {}, logged for retry: {}",
                    playlist.id, err
                );
                outcome.mirror_failure = Some(PartialFailure {
                    track_ids: pending_ids,
                    message: err.to_string(),
                });
                return Ok(());
            }
        };

        let ctx = match self.access.context_for(&playlist.user_id).await {
            Ok(ctx) => ctx,
            Err(err) => {
                outcome.mirror_failure = Some(PartialFailure {
                    track_ids: pending_ids,
                    message: err.to_string(),
                });
                return Ok(());
            }
        };
        let mut mirrored_rows = HashSet::new();
        let mut failed = Vec::new();
        let mut last_error = String::new();
        for chunk in pending.chunks(PLAYLIST_WRITE_LIMIT) {
            let track_ids: Vec<String> = chunk.iter().map(|row| row.track_id.clone()).collect();
            match self.upstream.add_tracks(&ctx, &mirror_id, &track_ids).await {
                Ok(()) => {
                    let row_ids: Vec<u64> = chunk.iter().map(|row| row.id).collect();
                    outcome.mirrored += self.store.set_mirrored(&row_ids, true)?;
                    mirrored_rows.extend(row_ids);
                }
                Err(err) => {
                    warn!(
                        "Failed to mirror {} tracks into {}, logged for retry: {}",
                        track_ids.len(),
                        mirror_id,
                        err
                    );
                    last_error = err.to_string();
                    failed.extend(track_ids);
                }
            }
        }
        if !failed.is_empty() {
            outcome.mirror_failure = Some(PartialFailure {
                track_ids: failed,
                message: last_error,
            });
        }
        for row in outcome.removed.iter_mut() {
            if mirrored_rows.contains(&row.id) {
                row.mirrored = true;
            }
        }
        Ok(())
    }

    /// Returns the mirror playlist id, creating the playlist upstream on first use.
    async fn ensure_mirror(
        &self,
        playlist: &TrackedPlaylist,
        default_name: &str,
    ) -> Result<String, EngineError> {
        if let Some(mirror_id) = playlist.removed_playlist_id.as_deref() {
            return Ok(mirror_id.to_string());
        }
        let _guard = self.mirror_guard.lock().await;
        // Another run may have created the mirror while this one held a stale row.
        let playlist = self
            .store
            .get_tracked_playlist(&playlist.user_id, playlist.id)?
            .ok_or_else(|| EngineError::NotFound(format!("tracked playlist {}", playlist.id)))?;
        if let Some(mirror_id) = playlist.removed_playlist_id {
            return Ok(mirror_id);
        }
        let name = playlist
            .removed_playlist_name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
            .or(Some(default_name).filter(|name| !name.trim().is_empty()))
            .unwrap_or(DEFAULT_MIRROR_NAME);
        let ctx = self.access.context_for(&playlist.user_id).await?;
        let mirror_id = self
            .upstream
            .create_playlist(&ctx, name, playlist.public)
            .await?;
        self.store.update_tracked_playlist(
            &playlist.user_id,
            playlist.id,
            TrackedPlaylistUpdate {
                removed_playlist_id: Some(Some(mirror_id.clone())),
                ..TrackedPlaylistUpdate::default()
            },
        )?;
        info!(
            "Created mirror playlist {} ({}) for playlist {}",
            mirror_id, name, playlist.id
        );
        Ok(mirror_id)
    }
}
