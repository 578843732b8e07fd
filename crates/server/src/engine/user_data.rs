use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::Engine;
use crate::error::EngineError;

#[derive(Clone, Debug, Default, Deserialize)]
pub struct DeleteDataRequest {
    #[serde(default)]
    pub delete_snapshots: bool,
    #[serde(default)]
    pub delete_removed_songs: bool,
    #[serde(default)]
    pub delete_tracked_playlists: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SectionResult {
    Success { count: usize },
    Error { message: String },
    Skipped,
}

#[derive(Clone, Debug, Serialize)]
pub struct DeleteDataReport {
    pub snapshots: SectionResult,
    pub removed_songs: SectionResult,
    pub tracked_playlists: SectionResult,
}

impl Engine {
    /// Deletes the requested sections of a user's data. Each section reports on its own;
    /// one failing section does not stop the others.
    pub fn delete_user_data(&self, user_id: &str, request: &DeleteDataRequest) -> DeleteDataReport {
        let removed_songs = if request.delete_removed_songs {
            section(self.store.delete_user_deleted_songs(user_id).map_err(EngineError::from))
        } else {
            SectionResult::Skipped
        };
        let snapshots = if request.delete_snapshots {
            section(self.delete_snapshots(user_id))
        } else {
            SectionResult::Skipped
        };
        let tracked_playlists = if request.delete_tracked_playlists {
            section(
                self.store
                    .delete_user_tracked_playlists(user_id)
                    .map(|(deleted, disabled)| deleted + disabled)
                    .map_err(EngineError::from),
            )
        } else {
            SectionResult::Skipped
        };
        info!(
            "User data deletion for {}: snapshots={:?} removed_songs={:?} tracked_playlists={:?}",
            user_id, snapshots, removed_songs, tracked_playlists
        );
        DeleteDataReport {
            snapshots,
            removed_songs,
            tracked_playlists,
        }
    }

    /// Storage objects are removed before rows. A failure part way can leave rows whose
    /// payload is gone; reading one then reports `DataCorruption`.
    fn delete_snapshots(&self, user_id: &str) -> Result<usize, EngineError> {
        let (snapshots, _) = self.store.list_snapshots(user_id, None, usize::MAX, 0)?;
        for snapshot in &snapshots {
            self.objects.delete(&snapshot.storage_key)?;
        }
        let removed = self.store.delete_user_snapshots(user_id)?;
        if let Err(err) = self.objects.delete_prefix(user_id) {
            warn!("Failed to clean payload directory for user {}: {}", user_id, err);
        }
        Ok(removed.len())
    }
}

fn section(result: Result<usize, EngineError>) -> SectionResult {
    match result {
        Ok(count) => SectionResult::Success { count },
        Err(err) => SectionResult::Error {
            message: err.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use common::SnapshotTrack;

    use super::{DeleteDataRequest, SectionResult};
    use crate::testing::{record_removal_at, TestEnv};

    #[test]
    fn deletes_requested_sections_only() {
        let env = TestEnv::new();
        let playlist = env.track_playlist("pl-1");
        env.engine
            .create_snapshot(&env.user_id, playlist.id, vec![SnapshotTrack::from_id("a")])
            .unwrap();
        record_removal_at(&env, playlist.id, "a", 10);

        let report = env.engine.delete_user_data(
            &env.user_id,
            &DeleteDataRequest {
                delete_snapshots: true,
                delete_removed_songs: false,
                delete_tracked_playlists: false,
            },
        );
        assert_eq!(report.snapshots, SectionResult::Success { count: 2 });
        assert_eq!(report.removed_songs, SectionResult::Skipped);
        assert_eq!(report.tracked_playlists, SectionResult::Skipped);
        assert_eq!(env.object_count(), 0);
        assert_eq!(
            env.store.list_playlist_deleted_songs(playlist.id).unwrap().len(),
            1
        );
    }

    #[test]
    fn full_deletion_removes_tracked_playlists() {
        let env = TestEnv::new();
        let playlist = env.track_playlist("pl-1");
        env.liked();
        record_removal_at(&env, playlist.id, "a", 10);
        let report = env.engine.delete_user_data(
            &env.user_id,
            &DeleteDataRequest {
                delete_snapshots: true,
                delete_removed_songs: true,
                delete_tracked_playlists: true,
            },
        );
        assert_eq!(report.removed_songs, SectionResult::Success { count: 1 });
        assert_eq!(report.tracked_playlists, SectionResult::Success { count: 2 });
        let remaining = env.store.list_tracked_playlists(&env.user_id).unwrap();
        assert_eq!(remaining.len(), 1);
        assert!(remaining[0].liked_songs && !remaining[0].active);
    }
}
