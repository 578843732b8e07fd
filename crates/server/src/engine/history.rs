use common::{CachedTrack, DeactivateReason, DeletedSong, MS_PER_DAY};
use library::DeletedSongFilter;
use serde::Serialize;
use tracing::{info, warn};

use super::{Engine, PartialFailure};
use crate::error::EngineError;

const DIGEST_WINDOW_MS: u64 = 7 * MS_PER_DAY;
const DIGEST_LIMIT: usize = 500;

#[derive(Clone, Debug, Serialize)]
pub struct RestoreOutcome {
    pub deleted_song: DeletedSong,
    pub mirror_failure: Option<PartialFailure>,
}

#[derive(Clone, Debug, Serialize)]
pub struct DigestEntry {
    pub deleted_song: DeletedSong,
    pub track: Option<CachedTrack>,
}

/// Tracks removed from Liked Songs during the last week.
#[derive(Clone, Debug, Serialize)]
pub struct WeeklyDigest {
    pub since: u64,
    pub suggestion_emails: bool,
    pub entries: Vec<DigestEntry>,
}

impl Engine {
    /// Puts a removed track back into its source and retires the removal record.
    pub async fn restore_deleted_song(
        &self,
        user_id: &str,
        deleted_song_id: u64,
        now: u64,
    ) -> Result<RestoreOutcome, EngineError> {
        let row = self
            .store
            .get_deleted_song(user_id, deleted_song_id)?
            .ok_or_else(|| EngineError::NotFound(format!("deleted song {}", deleted_song_id)))?;
        if !row.active {
            return Err(EngineError::Conflict(format!(
                "deleted song {} is no longer active",
                deleted_song_id
            )));
        }
        let playlist = self
            .store
            .get_tracked_playlist(user_id, row.tracked_playlist_id)?
            .ok_or_else(|| {
                EngineError::NotFound(format!("tracked playlist {}", row.tracked_playlist_id))
            })?;

        let ctx = self.access.context_for(user_id).await?;
        let track_ids = std::slice::from_ref(&row.track_id);
        if playlist.liked_songs {
            self.upstream.save_liked_tracks(&ctx, track_ids).await?;
        } else {
            self.upstream
                .add_tracks(&ctx, &playlist.playlist_id, track_ids)
                .await?;
        }

        let mut mirror_failure = None;
        if let Some(mirror_id) = playlist.removed_playlist_id.as_deref().filter(|_| row.mirrored) {
            if let Err(err) = self.upstream.remove_tracks(&ctx, mirror_id, track_ids).await {
                warn!(
                    "Restored track {} but could not remove it from mirror {}: {}",
                    row.track_id, mirror_id, err
                );
                mirror_failure = Some(PartialFailure {
                    track_ids: vec![row.track_id.clone()],
                    message: err.to_string(),
                });
            }
        }

        self.store
            .deactivate_deleted_songs(&[row.id], DeactivateReason::Restored, now)?;
        info!(
            "Restored track {} to playlist {} for user {}",
            row.track_id, playlist.id, user_id
        );
        let deleted_song = self
            .store
            .get_deleted_song(user_id, row.id)?
            .ok_or_else(|| EngineError::NotFound(format!("deleted song {}", row.id)))?;
        Ok(RestoreOutcome {
            deleted_song,
            mirror_failure,
        })
    }

    pub async fn weekly_digest(&self, user_id: &str, now: u64) -> Result<WeeklyDigest, EngineError> {
        let since = now.saturating_sub(DIGEST_WINDOW_MS);
        let settings = self.store.get_or_create_settings(user_id, now)?;
        let liked = self
            .store
            .list_tracked_playlists(user_id)?
            .into_iter()
            .find(|playlist| playlist.liked_songs);
        let Some(liked) = liked else {
            return Ok(WeeklyDigest {
                since,
                suggestion_emails: settings.suggestion_emails,
                entries: Vec::new(),
            });
        };

        let filter = DeletedSongFilter {
            active: None,
            tracked_playlist_id: Some(liked.id),
            removed_since: Some(since),
        };
        let (rows, _) = self
            .store
            .list_deleted_songs(user_id, &filter, DIGEST_LIMIT, 0)?;
        let track_ids: Vec<String> = rows.iter().map(|row| row.track_id.clone()).collect();
        let mut resolved = self.resolve_tracks(user_id, &track_ids).await?;
        let entries = rows
            .into_iter()
            .map(|row| DigestEntry {
                track: resolved.tracks.remove(&row.track_id),
                deleted_song: row,
            })
            .collect();
        Ok(WeeklyDigest {
            since,
            suggestion_emails: settings.suggestion_emails,
            entries,
        })
    }
}

#[cfg(test)]
mod tests {
    use common::{DeactivateReason, MS_PER_DAY};

    use crate::error::EngineError;
    use crate::testing::{record_removal_at, TestEnv};
    use crate::utils::now_millis;

    #[tokio::test]
    async fn restore_liked_track_saves_and_deactivates() {
        let env = TestEnv::new();
        let liked = env.liked();
        let row = record_removal_at(&env, liked.id, "a", 10);
        let outcome = env
            .engine
            .restore_deleted_song(&env.user_id, row.id, 20)
            .await
            .unwrap();
        assert_eq!(env.upstream.saved_liked(), vec!["a".to_string()]);
        assert!(!outcome.deleted_song.active);
        assert_eq!(outcome.deleted_song.deactivated, Some(DeactivateReason::Restored));
        assert_eq!(outcome.deleted_song.deactivated_at, Some(20));

        let err = env
            .engine
            .restore_deleted_song(&env.user_id, row.id, 30)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[tokio::test]
    async fn restore_playlist_track_cleans_mirror() {
        let env = TestEnv::new();
        let playlist = env.track_playlist_with_mirror("pl-1", "mirror-1");
        let row = record_removal_at(&env, playlist.id, "a", 10);
        env.store.set_mirrored(&[row.id], true).unwrap();
        env.engine
            .restore_deleted_song(&env.user_id, row.id, 20)
            .await
            .unwrap();
        assert_eq!(
            env.upstream.add_calls(),
            vec![("pl-1".to_string(), vec!["a".to_string()])]
        );
        assert_eq!(
            env.upstream.remove_calls(),
            vec![("mirror-1".to_string(), vec!["a".to_string()])]
        );
    }

    #[tokio::test]
    async fn restore_is_owner_scoped() {
        let env = TestEnv::new();
        let liked = env.liked();
        let row = record_removal_at(&env, liked.id, "a", 10);
        let err = env
            .engine
            .restore_deleted_song("user-2", row.id, 20)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn digest_covers_last_week_of_liked_songs() {
        let env = TestEnv::new();
        let now = now_millis();
        let liked = env.liked();
        let other = env.track_playlist("pl-1");
        record_removal_at(&env, liked.id, "recent", now - 2 * MS_PER_DAY);
        record_removal_at(&env, liked.id, "old", now - 9 * MS_PER_DAY);
        record_removal_at(&env, other.id, "elsewhere", now - MS_PER_DAY);
        env.upstream.add_catalog("recent", "Recent Song");
        let digest = env.engine.weekly_digest(&env.user_id, now).await.unwrap();
        assert_eq!(digest.entries.len(), 1);
        assert_eq!(digest.entries[0].deleted_song.track_id, "recent");
        assert_eq!(
            digest.entries[0].track.as_ref().and_then(|t| t.name.as_deref()),
            Some("Recent Song")
        );
    }
}
