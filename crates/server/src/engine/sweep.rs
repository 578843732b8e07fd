use std::collections::BTreeMap;

use common::{DeactivateReason, DeletedSong, UserSettings};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::Engine;
use crate::error::EngineError;
use crate::upstream::{AccessContext, PLAYLIST_WRITE_LIMIT};

#[derive(Clone, Debug, Default, Serialize)]
pub struct SweepReport {
    /// Records marked inactive by this sweep.
    pub expired: usize,
    /// Expired records left active because their mirror entry could not be removed.
    pub failures: Vec<SweepFailure>,
}

#[derive(Clone, Debug, Serialize)]
pub struct SweepFailure {
    pub deleted_song_id: u64,
    pub user_id: String,
    pub track_id: String,
    pub message: String,
}

impl Engine {
    /// Expires active removal records whose persistence window has elapsed at `now`.
    /// Safe to re-run: only records still active and eligible are touched.
    pub async fn sweep_expired(&self, now: u64) -> Result<SweepReport, EngineError> {
        let mut groups: BTreeMap<(String, u64), Vec<DeletedSong>> = BTreeMap::new();
        for row in self.store.list_active_deleted_songs()? {
            groups
                .entry((row.user_id.clone(), row.tracked_playlist_id))
                .or_default()
                .push(row);
        }

        let mut report = SweepReport::default();
        for ((user_id, tracked_playlist_id), rows) in groups {
            let playlist = self.store.get_tracked_playlist(&user_id, tracked_playlist_id)?;
            let settings = self
                .store
                .get_settings(&user_id)?
                .unwrap_or_else(|| UserSettings::new(&user_id, now));
            let window = playlist
                .as_ref()
                .and_then(|playlist| playlist.persistence)
                .unwrap_or(settings.playlist_persistence);
            let expired: Vec<DeletedSong> = rows
                .into_iter()
                .filter(|row| window.is_expired(row.removed_at, now))
                .collect();
            if expired.is_empty() {
                continue;
            }
            debug!(
                "Expiring {} records of playlist {} for user {} (kept {})",
                expired.len(),
                tracked_playlist_id,
                user_id,
                window.as_str()
            );

            let mirror_id = playlist.and_then(|playlist| playlist.removed_playlist_id);
            let (to_unmirror, plain): (Vec<DeletedSong>, Vec<DeletedSong>) = match mirror_id {
                Some(_) => expired.into_iter().partition(|row| row.mirrored),
                None => (Vec::new(), expired),
            };
            let mut done: Vec<u64> = plain.iter().map(|row| row.id).collect();

            if let Some(mirror_id) = mirror_id.as_deref().filter(|_| !to_unmirror.is_empty()) {
                match self.access.context_for(&user_id).await {
                    Ok(ctx) => {
                        let (removed, failures) =
                            self.unmirror(&ctx, mirror_id, &to_unmirror).await;
                        done.extend(removed);
                        report.failures.extend(failures);
                    }
                    Err(err) => {
                        warn!("Sweep cannot reach upstream for user {}: {}", user_id, err);
                        report
                            .failures
                            .extend(to_unmirror.iter().map(|row| failure(row, &err.to_string())));
                    }
                }
            }

            report.expired += self
                .store
                .deactivate_deleted_songs(&done, DeactivateReason::Expired, now)?;
        }

        info!(
            "Sweep expired {} removal records ({} failures)",
            report.expired,
            report.failures.len()
        );
        Ok(report)
    }

    /// Removes expired tracks from a mirror playlist in batches, retrying a failed batch
    /// track by track. Returns the row ids that were removed and the per-record failures.
    async fn unmirror(
        &self,
        ctx: &AccessContext,
        mirror_id: &str,
        rows: &[DeletedSong],
    ) -> (Vec<u64>, Vec<SweepFailure>) {
        let mut removed = Vec::new();
        let mut failures = Vec::new();
        for chunk in rows.chunks(PLAYLIST_WRITE_LIMIT) {
            let track_ids: Vec<String> = chunk.iter().map(|row| row.track_id.clone()).collect();
            if self
                .upstream
                .remove_tracks(ctx, mirror_id, &track_ids)
                .await
                .is_ok()
            {
                removed.extend(chunk.iter().map(|row| row.id));
                continue;
            }
            for row in chunk {
                match self
                    .upstream
                    .remove_tracks(ctx, mirror_id, std::slice::from_ref(&row.track_id))
                    .await
                {
                    Ok(()) => removed.push(row.id),
                    Err(err) => {
                        warn!(
                            "Failed to remove track {} from mirror {} for record {}: {}",
                            row.track_id, mirror_id, row.id, err
                        );
                        failures.push(failure(row, &err.to_string()));
                    }
                }
            }
        }
        (removed, failures)
    }
}

fn failure(row: &DeletedSong, message: &str) -> SweepFailure {
    SweepFailure {
        deleted_song_id: row.id,
        user_id: row.user_id.clone(),
        track_id: row.track_id.clone(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use common::{PersistenceWindow, MS_PER_DAY};
    use library::{SettingsUpdate, TrackedPlaylistUpdate};

    use crate::testing::{record_removal_at, TestEnv};

    const NOW: u64 = 1_000 * MS_PER_DAY;

    fn set_window(env: &TestEnv, window: PersistenceWindow) {
        env.store
            .update_settings(
                &env.user_id,
                SettingsUpdate {
                    playlist_persistence: Some(window),
                    ..SettingsUpdate::default()
                },
                0,
            )
            .unwrap();
    }

    #[tokio::test]
    async fn thirty_day_window_expires_only_old_records() {
        let env = TestEnv::new();
        set_window(&env, PersistenceWindow::Days30);
        let playlist = env.track_playlist("pl-1");
        let old = record_removal_at(&env, playlist.id, "old", NOW - 31 * MS_PER_DAY);
        let recent = record_removal_at(&env, playlist.id, "recent", NOW - 29 * MS_PER_DAY);
        let report = env.engine.sweep_expired(NOW).await.unwrap();
        assert_eq!(report.expired, 1);
        assert!(report.failures.is_empty());
        assert!(!env.deleted(old.id).active);
        assert!(env.deleted(recent.id).active);
    }

    #[tokio::test]
    async fn boundary_is_inclusive() {
        let env = TestEnv::new();
        set_window(&env, PersistenceWindow::Days30);
        let playlist = env.track_playlist("pl-1");
        let at_edge = record_removal_at(&env, playlist.id, "edge", NOW - 30 * MS_PER_DAY);
        let inside = record_removal_at(&env, playlist.id, "inside", NOW - 30 * MS_PER_DAY + 1);
        env.engine.sweep_expired(NOW).await.unwrap();
        assert!(!env.deleted(at_edge.id).active);
        assert!(env.deleted(inside.id).active);
    }

    #[tokio::test]
    async fn forever_is_never_swept() {
        let env = TestEnv::new();
        let playlist = env.track_playlist("pl-1");
        let row = record_removal_at(&env, playlist.id, "a", 0);
        let report = env.engine.sweep_expired(NOW).await.unwrap();
        assert_eq!(report.expired, 0);
        assert!(env.deleted(row.id).active);
    }

    #[tokio::test]
    async fn playlist_override_beats_user_setting() {
        let env = TestEnv::new();
        set_window(&env, PersistenceWindow::Days30);
        let playlist = env.track_playlist("pl-1");
        env.store
            .update_tracked_playlist(
                &env.user_id,
                playlist.id,
                TrackedPlaylistUpdate {
                    persistence: Some(Some(PersistenceWindow::Days90)),
                    ..TrackedPlaylistUpdate::default()
                },
            )
            .unwrap();
        let row = record_removal_at(&env, playlist.id, "a", NOW - 60 * MS_PER_DAY);
        env.engine.sweep_expired(NOW).await.unwrap();
        assert!(env.deleted(row.id).active);
    }

    #[tokio::test]
    async fn mirrored_tracks_are_removed_from_mirror() {
        let env = TestEnv::new();
        set_window(&env, PersistenceWindow::Days30);
        let playlist = env.track_playlist_with_mirror("pl-1", "mirror-1");
        let row = record_removal_at(&env, playlist.id, "a", NOW - 40 * MS_PER_DAY);
        env.store.set_mirrored(&[row.id], true).unwrap();
        let unmirrored = record_removal_at(&env, playlist.id, "b", NOW - 40 * MS_PER_DAY);
        let report = env.engine.sweep_expired(NOW).await.unwrap();
        assert_eq!(report.expired, 2);
        assert_eq!(
            env.upstream.remove_calls(),
            vec![("mirror-1".to_string(), vec!["a".to_string()])]
        );
        assert!(!env.deleted(unmirrored.id).active);
    }

    #[tokio::test]
    async fn failed_removal_is_reported_and_retried_later() {
        let env = TestEnv::new();
        set_window(&env, PersistenceWindow::Days30);
        let playlist = env.track_playlist_with_mirror("pl-1", "mirror-1");
        let good = record_removal_at(&env, playlist.id, "good", NOW - 40 * MS_PER_DAY);
        let bad = record_removal_at(&env, playlist.id, "bad", NOW - 40 * MS_PER_DAY);
        env.store.set_mirrored(&[good.id, bad.id], true).unwrap();
        env.upstream.fail_removal_of("bad");

        let report = env.engine.sweep_expired(NOW).await.unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].track_id, "bad");
        assert!(!env.deleted(good.id).active);
        assert!(env.deleted(bad.id).active);

        env.upstream.clear_removal_failures();
        let retry = env.engine.sweep_expired(NOW).await.unwrap();
        assert_eq!(retry.expired, 1);
        assert!(retry.failures.is_empty());
        assert!(!env.deleted(bad.id).active);
    }
}
