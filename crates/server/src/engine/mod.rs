mod diff;
mod history;
mod snapshot;
mod sweep;
mod track_cache;
mod user_data;

use std::sync::Arc;
use std::time::Duration;

use library::{LibraryStore, ObjectStore};
use serde::Serialize;

use crate::access::AccessManager;
use crate::upstream::Upstream;

pub use diff::DetectOutcome;
pub use history::{DigestEntry, RestoreOutcome, WeeklyDigest};
pub use snapshot::{PlaylistRun, SnapshotDetail};
pub use sweep::{SweepFailure, SweepReport};
pub use track_cache::ResolvedTracks;
pub use user_data::{DeleteDataReport, DeleteDataRequest, SectionResult};

#[derive(Clone, Copy, Debug)]
pub struct EngineSettings {
    pub track_cache_ttl: Duration,
    pub pull_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            track_cache_ttl: Duration::from_secs(60 * 60 * 24 * 7),
            pull_timeout: Duration::from_secs(120),
        }
    }
}

/// A secondary side effect that failed after the primary write succeeded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PartialFailure {
    pub track_ids: Vec<String>,
    pub message: String,
}

/// Snapshot, diff, retention and track-resolution operations over one store.
#[derive(Clone)]
pub struct Engine {
    store: LibraryStore,
    objects: Arc<dyn ObjectStore>,
    upstream: Arc<dyn Upstream>,
    access: AccessManager,
    settings: EngineSettings,
    /// Held while a mirror playlist is created so concurrent diffs cannot create two.
    mirror_guard: Arc<tokio::sync::Mutex<()>>,
}

impl Engine {
    pub fn new(
        store: LibraryStore,
        objects: Arc<dyn ObjectStore>,
        upstream: Arc<dyn Upstream>,
        settings: EngineSettings,
    ) -> Self {
        let access = AccessManager::new(store.clone(), Arc::clone(&upstream));
        Self {
            store,
            objects,
            upstream,
            access,
            settings,
            mirror_guard: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn store(&self) -> &LibraryStore {
        &self.store
    }

    pub fn access(&self) -> &AccessManager {
        &self.access
    }

    pub fn upstream(&self) -> &Arc<dyn Upstream> {
        &self.upstream
    }
}
