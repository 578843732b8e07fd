use common::{payload_digest, LibrarySnapshot, SnapshotTrack, TrackedPlaylist};
use library::{collapse_duplicates, decode_payload, encode_payload, NewSnapshot, ObjectError};
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{DetectOutcome, Engine};
use crate::error::EngineError;
use crate::upstream::AccessContext;
use crate::utils::now_millis;

#[derive(Clone, Debug, Serialize)]
pub struct SnapshotDetail {
    pub snapshot: LibrarySnapshot,
    pub tracks: Vec<SnapshotTrack>,
}

/// Result of one pull, snapshot and diff pass over a tracked playlist.
#[derive(Clone, Debug, Serialize)]
pub struct PlaylistRun {
    pub snapshot: LibrarySnapshot,
    pub removals: DetectOutcome,
}

impl Engine {
    /// Pulls every page of a tracked playlist. Any failure or the pull timeout discards
    /// the whole listing.
    pub async fn pull_tracks(
        &self,
        ctx: &AccessContext,
        playlist: &TrackedPlaylist,
    ) -> Result<Vec<SnapshotTrack>, EngineError> {
        let source = playlist.source();
        let pull = async {
            let mut tracks = Vec::new();
            let mut offset = Some(0u32);
            while let Some(current) = offset {
                let page = self.upstream.list_tracks_page(ctx, &source, current).await?;
                tracks.extend(page.items);
                offset = page.next_offset;
            }
            Ok::<_, EngineError>(tracks)
        };
        match tokio::time::timeout(self.settings.pull_timeout, pull).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::UpstreamUnavailable(format!(
                "listing playlist {} timed out after {}s",
                playlist.id,
                self.settings.pull_timeout.as_secs()
            ))),
        }
    }

    /// Persists a complete listing as a new snapshot of an active tracked playlist.
    pub fn create_snapshot(
        &self,
        user_id: &str,
        tracked_playlist_id: u64,
        tracks: Vec<SnapshotTrack>,
    ) -> Result<LibrarySnapshot, EngineError> {
        let playlist = self.active_playlist(user_id, tracked_playlist_id)?;
        let tracks = collapse_duplicates(tracks);
        let bytes = encode_payload(&tracks)?;
        let storage_key = format!(
            "{}/snapshot_{}_{}.json.gz",
            user_id,
            playlist.id,
            Uuid::new_v4().simple()
        );
        let digest = payload_digest(&bytes);
        self.objects.put(&storage_key, &bytes)?;

        let new = NewSnapshot {
            user_id: user_id.to_string(),
            tracked_playlist_id: playlist.id,
            created_at: now_millis(),
            storage_key: storage_key.clone(),
            song_count: tracks.len() as u64,
            payload_digest: digest,
        };
        let snapshot = match self.store.insert_snapshot(new) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                if let Err(cleanup) = self.objects.delete(&storage_key) {
                    warn!("Failed to remove orphaned payload {}: {}", storage_key, cleanup);
                }
                return Err(err.into());
            }
        };
        info!(
            "Snapshot {} committed for user {} playlist {} ({} tracks)",
            snapshot.id, user_id, playlist.id, snapshot.song_count
        );
        Ok(snapshot)
    }

    pub fn get_snapshot(&self, user_id: &str, snapshot_id: u64) -> Result<SnapshotDetail, EngineError> {
        let snapshot = self
            .store
            .get_snapshot(user_id, snapshot_id)?
            .ok_or_else(|| EngineError::NotFound(format!("snapshot {}", snapshot_id)))?;
        let tracks = self.load_payload(&snapshot)?;
        Ok(SnapshotDetail { snapshot, tracks })
    }

    /// Reads and verifies a snapshot payload. A missing blob, a digest mismatch or an
    /// undecodable payload is data corruption.
    pub(crate) fn load_payload(
        &self,
        snapshot: &LibrarySnapshot,
    ) -> Result<Vec<SnapshotTrack>, EngineError> {
        let bytes = match self.objects.get(&snapshot.storage_key) {
            Ok(bytes) => bytes,
            Err(ObjectError::NotFound(_)) => {
                return Err(corruption(snapshot, "payload object is missing"));
            }
            Err(err) => return Err(err.into()),
        };
        if !snapshot.payload_digest.is_empty() && payload_digest(&bytes) != snapshot.payload_digest {
            return Err(corruption(snapshot, "payload digest mismatch"));
        }
        decode_payload(&bytes).map_err(|err| corruption(snapshot, &err.to_string()))
    }

    /// Pull, snapshot and diff one tracked playlist.
    pub async fn run_playlist(
        &self,
        user_id: &str,
        tracked_playlist_id: u64,
    ) -> Result<PlaylistRun, EngineError> {
        let playlist = self.active_playlist(user_id, tracked_playlist_id)?;
        let ctx = self.access.context_for(user_id).await?;
        let tracks = self.pull_tracks(&ctx, &playlist).await?;
        let snapshot = self.create_snapshot(user_id, playlist.id, tracks)?;
        let removals = self.detect_removals(user_id, playlist.id).await?;
        Ok(PlaylistRun { snapshot, removals })
    }

    fn active_playlist(
        &self,
        user_id: &str,
        tracked_playlist_id: u64,
    ) -> Result<TrackedPlaylist, EngineError> {
        self.store
            .get_tracked_playlist(user_id, tracked_playlist_id)?
            .filter(|playlist| playlist.active)
            .ok_or_else(|| {
                EngineError::NotFound(format!("active tracked playlist {}", tracked_playlist_id))
            })
    }
}

fn corruption(snapshot: &LibrarySnapshot, detail: &str) -> EngineError {
    error!(
        "Snapshot {} ({}) of user {} is corrupt: {}",
        snapshot.id, snapshot.storage_key, snapshot.user_id, detail
    );
    EngineError::DataCorruption(format!("snapshot {}: {}", snapshot.id, detail))
}

#[cfg(test)]
mod tests {
    use common::SnapshotTrack;
    use library::ObjectStore;

    use crate::error::EngineError;
    use crate::testing::{ids, TestEnv};

    #[test]
    fn round_trip_preserves_order() {
        let env = TestEnv::new();
        let playlist = env.track_playlist("pl-1");
        for list in [vec![], vec!["only"], vec!["c", "a", "b", "a"]] {
            let tracks = list.iter().map(|id| SnapshotTrack::from_id(*id)).collect();
            let snapshot = env
                .engine
                .create_snapshot(&env.user_id, playlist.id, tracks)
                .unwrap();
            let detail = env.engine.get_snapshot(&env.user_id, snapshot.id).unwrap();
            let mut expected: Vec<&str> = Vec::new();
            for id in &list {
                if !expected.contains(id) {
                    expected.push(id);
                }
            }
            assert_eq!(ids(&detail.tracks), expected);
            assert_eq!(snapshot.song_count as usize, expected.len());
        }
    }

    #[test]
    fn identical_content_gets_distinct_keys() {
        let env = TestEnv::new();
        let playlist = env.track_playlist("pl-1");
        let tracks = vec![SnapshotTrack::from_id("a")];
        let first = env
            .engine
            .create_snapshot(&env.user_id, playlist.id, tracks.clone())
            .unwrap();
        let second = env
            .engine
            .create_snapshot(&env.user_id, playlist.id, tracks)
            .unwrap();
        assert_ne!(first.storage_key, second.storage_key);
        assert!(first
            .storage_key
            .starts_with(&format!("{}/snapshot_{}_", env.user_id, playlist.id)));
    }

    #[test]
    fn inactive_playlist_gets_no_snapshot_or_blob() {
        let env = TestEnv::new();
        let playlist = env.track_playlist("pl-1");
        env.deactivate(playlist.id);
        let err = env
            .engine
            .create_snapshot(&env.user_id, playlist.id, vec![SnapshotTrack::from_id("a")])
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
        assert_eq!(env.object_count(), 0);
    }

    #[test]
    fn other_users_cannot_snapshot_or_read() {
        let env = TestEnv::new();
        let playlist = env.track_playlist("pl-1");
        let err = env
            .engine
            .create_snapshot("user-2", playlist.id, vec![])
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
        let snapshot = env
            .engine
            .create_snapshot(&env.user_id, playlist.id, vec![])
            .unwrap();
        let err = env.engine.get_snapshot("user-2", snapshot.id).unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[test]
    fn corrupt_payload_is_reported() {
        let env = TestEnv::new();
        let playlist = env.track_playlist("pl-1");
        let snapshot = env
            .engine
            .create_snapshot(&env.user_id, playlist.id, vec![SnapshotTrack::from_id("a")])
            .unwrap();
        env.objects.put(&snapshot.storage_key, b"not gzip").unwrap();
        let err = env.engine.get_snapshot(&env.user_id, snapshot.id).unwrap_err();
        assert!(matches!(err, EngineError::DataCorruption(_)));

        env.objects.delete(&snapshot.storage_key).unwrap();
        let err = env.engine.get_snapshot(&env.user_id, snapshot.id).unwrap_err();
        assert!(matches!(err, EngineError::DataCorruption(_)));
    }

    #[tokio::test]
    async fn pull_exhausts_all_pages() {
        let env = TestEnv::new();
        let playlist = env.track_playlist("pl-1");
        env.upstream.set_listing("pl-1", &["a", "b", "c", "d", "e"]);
        let run = env.engine.run_playlist(&env.user_id, playlist.id).await.unwrap();
        assert_eq!(run.snapshot.song_count, 5);
        let detail = env.engine.get_snapshot(&env.user_id, run.snapshot.id).unwrap();
        assert_eq!(ids(&detail.tracks), vec!["a", "b", "c", "d", "e"]);
    }

    #[tokio::test]
    async fn partial_pull_creates_no_snapshot() {
        let env = TestEnv::new();
        let playlist = env.track_playlist("pl-1");
        env.upstream.set_listing("pl-1", &["a", "b", "c", "d", "e"]);
        env.upstream.fail_listing_at(Some(2));
        let err = env
            .engine
            .run_playlist(&env.user_id, playlist.id)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UpstreamUnavailable(_)));
        assert!(env
            .store
            .latest_snapshots(&env.user_id, playlist.id, 1)
            .unwrap()
            .is_empty());
        assert_eq!(env.object_count(), 0);
    }

    #[tokio::test]
    async fn liked_songs_pull_uses_liked_listing() {
        let env = TestEnv::new();
        let liked = env.liked();
        env.upstream.set_listing(common::LIKED_SONGS_ID, &["x", "y"]);
        let run = env.engine.run_playlist(&env.user_id, liked.id).await.unwrap();
        assert_eq!(run.snapshot.song_count, 2);
        assert!(run.removals.removed.is_empty());
    }
}
