use std::sync::Arc;

use common::SpotifyAccess;
use library::LibraryStore;
use tracing::info;

use crate::error::EngineError;
use crate::upstream::{AccessContext, AccessGrant, Upstream};
use crate::utils::now_millis;

/// Grants are refreshed when they expire within this margin.
const REFRESH_MARGIN_MS: u64 = 60 * 1000;

/// Hands out per-user upstream contexts from stored grants, refreshing them as needed.
#[derive(Clone)]
pub struct AccessManager {
    store: LibraryStore,
    upstream: Arc<dyn Upstream>,
}

impl AccessManager {
    pub fn new(store: LibraryStore, upstream: Arc<dyn Upstream>) -> Self {
        Self { store, upstream }
    }

    pub async fn context_for(&self, user_id: &str) -> Result<AccessContext, EngineError> {
        let access = self.store.get_spotify_access(user_id)?.ok_or_else(|| {
            EngineError::Unauthenticated(format!("no upstream grant for user {}", user_id))
        })?;
        let now = now_millis();
        if access.expires_at > now.saturating_add(REFRESH_MARGIN_MS) {
            return Ok(context(&access));
        }

        let grant = self.upstream.refresh_access(&access.refresh_token).await?;
        let refreshed = apply_grant(access, grant, now);
        self.store.put_spotify_access(&refreshed)?;
        info!("Refreshed upstream access for user {}", user_id);
        Ok(context(&refreshed))
    }

    /// Stores a freshly exchanged grant for a user.
    pub fn store_grant(
        &self,
        user_id: &str,
        spotify_user_id: &str,
        grant: AccessGrant,
    ) -> Result<SpotifyAccess, EngineError> {
        let now = now_millis();
        let previous_refresh = self
            .store
            .get_spotify_access(user_id)?
            .map(|access| access.refresh_token)
            .unwrap_or_default();
        let refresh_token = grant.refresh_token.unwrap_or(previous_refresh);
        if refresh_token.is_empty() {
            return Err(EngineError::Unauthenticated(
                "upstream did not return a refresh token".to_string(),
            ));
        }
        let access = SpotifyAccess {
            user_id: user_id.to_string(),
            spotify_user_id: spotify_user_id.to_string(),
            access_token: grant.access_token,
            refresh_token,
            expires_at: now.saturating_add(grant.expires_in_secs.saturating_mul(1000)),
            updated_at: now,
        };
        self.store.put_spotify_access(&access)?;
        Ok(access)
    }
}

fn apply_grant(access: SpotifyAccess, grant: AccessGrant, now: u64) -> SpotifyAccess {
    SpotifyAccess {
        access_token: grant.access_token,
        refresh_token: grant.refresh_token.unwrap_or(access.refresh_token),
        expires_at: now.saturating_add(grant.expires_in_secs.saturating_mul(1000)),
        updated_at: now,
        ..access
    }
}

fn context(access: &SpotifyAccess) -> AccessContext {
    AccessContext {
        user_id: access.user_id.clone(),
        spotify_user_id: access.spotify_user_id.clone(),
        access_token: access.access_token.clone(),
    }
}

#[cfg(test)]
mod tests {
    use common::SpotifyAccess;

    use crate::error::EngineError;
    use crate::testing::TestEnv;
    use crate::utils::now_millis;

    #[tokio::test]
    async fn valid_grant_is_used_as_is() {
        let env = TestEnv::new();
        let ctx = env.engine.access().context_for(&env.user_id).await.unwrap();
        assert_eq!(ctx.access_token, "token-user-1");
        assert_eq!(env.upstream.refresh_count(), 0);
    }

    #[tokio::test]
    async fn expiring_grant_is_refreshed_and_persisted() {
        let env = TestEnv::new();
        env.store
            .put_spotify_access(&SpotifyAccess {
                user_id: env.user_id.clone(),
                spotify_user_id: "spotify-1".to_string(),
                access_token: "old".to_string(),
                refresh_token: "refresh".to_string(),
                expires_at: now_millis() + 30_000,
                updated_at: 0,
            })
            .unwrap();
        let ctx = env.engine.access().context_for(&env.user_id).await.unwrap();
        assert_eq!(ctx.access_token, "refreshed-refresh");
        assert_eq!(env.upstream.refresh_count(), 1);
        let stored = env.store.get_spotify_access(&env.user_id).unwrap().unwrap();
        assert_eq!(stored.access_token, "refreshed-refresh");
        assert_eq!(stored.refresh_token, "refresh");
        assert!(stored.expires_at > now_millis() + 60_000);
    }

    #[tokio::test]
    async fn missing_grant_is_unauthenticated() {
        let env = TestEnv::new();
        let err = env.engine.access().context_for("nobody").await.unwrap_err();
        assert!(matches!(err, EngineError::Unauthenticated(_)));
    }
}
