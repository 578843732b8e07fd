use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

use crate::utils::now_millis;

const USERS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("users");
const SPOTIFY_USERS_TABLE: TableDefinition<&str, &str> = TableDefinition::new("spotify_users");
const SESSIONS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("sessions");

/// A local account, keyed by a generated id and linked to one upstream account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthUser {
    pub id: String,
    pub spotify_user_id: String,
    pub display_name: Option<String>,
    pub created_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionToken {
    pub token: String,
    pub user_id: String,
    pub expires_at: u64,
}

#[derive(Debug)]
pub enum AuthError {
    InvalidSpotifyUser,
    DbError(String),
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::InvalidSpotifyUser => write!(f, "upstream user id is empty"),
            AuthError::DbError(message) => write!(f, "auth db error: {}", message),
        }
    }
}

impl std::error::Error for AuthError {}

fn db_err(err: impl std::fmt::Display) -> AuthError {
    AuthError::DbError(err.to_string())
}

#[derive(Clone)]
pub struct AuthStore {
    db: Arc<Database>,
    session_ttl: Duration,
}

impl AuthStore {
    pub fn new(db: Arc<Database>, session_ttl: Duration) -> Self {
        Self { db, session_ttl }
    }

    pub fn init_tables(&self) -> Result<(), AuthError> {
        let write_txn = self.db.begin_write().map_err(db_err)?;
        {
            let _users = write_txn.open_table(USERS_TABLE).map_err(db_err)?;
            let _spotify = write_txn.open_table(SPOTIFY_USERS_TABLE).map_err(db_err)?;
            let _sessions = write_txn.open_table(SESSIONS_TABLE).map_err(db_err)?;
        }
        write_txn.commit().map_err(db_err)?;
        Ok(())
    }

    /// Finds the local user linked to an upstream account, creating one on first login.
    /// Returns the user and whether it was created.
    pub fn find_or_create_user(
        &self,
        spotify_user_id: &str,
        display_name: Option<String>,
    ) -> Result<(AuthUser, bool), AuthError> {
        if spotify_user_id.trim().is_empty() {
            return Err(AuthError::InvalidSpotifyUser);
        }
        let txn = self.db.begin_write().map_err(db_err)?;
        let result = {
            let mut users = txn.open_table(USERS_TABLE).map_err(db_err)?;
            let mut links = txn.open_table(SPOTIFY_USERS_TABLE).map_err(db_err)?;
            let existing_id = links
                .get(spotify_user_id)
                .map_err(db_err)?
                .map(|value| value.value().to_string());
            let existing: Option<AuthUser> = match existing_id {
                Some(id) => match users.get(id.as_str()).map_err(db_err)? {
                    Some(value) => Some(bincode::deserialize(value.value()).map_err(db_err)?),
                    None => None,
                },
                None => None,
            };
            match existing {
                Some(mut user) => {
                    if display_name.is_some() && user.display_name != display_name {
                        user.display_name = display_name;
                        let bytes = bincode::serialize(&user).map_err(db_err)?;
                        users
                            .insert(user.id.as_str(), bytes.as_slice())
                            .map_err(db_err)?;
                    }
                    (user, false)
                }
                None => {
                    let user = AuthUser {
                        id: uuid::Uuid::new_v4().to_string(),
                        spotify_user_id: spotify_user_id.to_string(),
                        display_name,
                        created_at: now_millis(),
                    };
                    let bytes = bincode::serialize(&user).map_err(db_err)?;
                    users
                        .insert(user.id.as_str(), bytes.as_slice())
                        .map_err(db_err)?;
                    links
                        .insert(spotify_user_id, user.id.as_str())
                        .map_err(db_err)?;
                    (user, true)
                }
            }
        };
        txn.commit().map_err(db_err)?;
        Ok(result)
    }

    pub fn create_session(&self, user_id: &str) -> Result<SessionToken, AuthError> {
        let token_str = generate_token();
        let expires_at = now_secs() + self.session_ttl.as_secs();

        let session = SessionToken {
            token: token_str.clone(),
            user_id: user_id.to_string(),
            expires_at,
        };

        let txn = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = txn.open_table(SESSIONS_TABLE).map_err(db_err)?;
            let bytes = bincode::serialize(&session).map_err(db_err)?;
            table
                .insert(token_str.as_str(), bytes.as_slice())
                .map_err(db_err)?;
        }
        txn.commit().map_err(db_err)?;

        Ok(session)
    }

    pub fn revoke_session(&self, token: &str) -> Result<(), AuthError> {
        let txn = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = txn.open_table(SESSIONS_TABLE).map_err(db_err)?;
            table.remove(token).map_err(db_err)?;
        }
        txn.commit().map_err(db_err)?;
        Ok(())
    }

    pub fn user_from_token(&self, token: &str) -> Result<Option<AuthUser>, AuthError> {
        let read_txn = self.db.begin_read().map_err(db_err)?;
        let sessions = read_txn.open_table(SESSIONS_TABLE).map_err(db_err)?;

        let session: SessionToken = match sessions.get(token).map_err(db_err)? {
            Some(v) => bincode::deserialize(v.value()).map_err(db_err)?,
            None => return Ok(None),
        };

        if session.expires_at < now_secs() {
            return Ok(None);
        }

        let users = read_txn.open_table(USERS_TABLE).map_err(db_err)?;
        let user = match users.get(session.user_id.as_str()).map_err(db_err)? {
            Some(v) => Some(bincode::deserialize(v.value()).map_err(db_err)?),
            None => None,
        };
        Ok(user)
    }
}

fn now_secs() -> u64 {
    now_millis() / 1000
}

fn generate_token() -> String {
    let mut rng = rand::rng();
    let token: String = (0..32)
        .map(|_| {
            let idx = rng.random_range(0..62);
            let chars = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
            chars[idx] as char
        })
        .collect();
    token
}

#[cfg(test)]
mod tests {
    use super::AuthStore;
    use library::LibraryStore;
    use std::time::Duration;

    fn open_auth(ttl: Duration) -> (tempfile::TempDir, AuthStore) {
        let dir = tempfile::tempdir().unwrap();
        let db = LibraryStore::open_db(&dir.path().join("auth.redb")).unwrap();
        let auth = AuthStore::new(db, ttl);
        auth.init_tables().unwrap();
        (dir, auth)
    }

    #[test]
    fn same_upstream_account_maps_to_same_user() {
        let (_dir, auth) = open_auth(Duration::from_secs(60));
        let (first, created) = auth
            .find_or_create_user("spotify-a", Some("A".to_string()))
            .unwrap();
        assert!(created);
        let (second, created) = auth.find_or_create_user("spotify-a", None).unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);
        let (other, _) = auth.find_or_create_user("spotify-b", None).unwrap();
        assert_ne!(other.id, first.id);
    }

    #[test]
    fn session_round_trip_and_revoke() {
        let (_dir, auth) = open_auth(Duration::from_secs(60));
        let (user, _) = auth.find_or_create_user("spotify-a", None).unwrap();
        let session = auth.create_session(&user.id).unwrap();
        assert_eq!(session.token.len(), 32);
        assert_eq!(auth.user_from_token(&session.token).unwrap(), Some(user));
        auth.revoke_session(&session.token).unwrap();
        assert!(auth.user_from_token(&session.token).unwrap().is_none());
        assert!(auth.user_from_token("unknown").unwrap().is_none());
    }
}
