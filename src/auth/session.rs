//! Server-side refresh sessions.
//!
//! A refresh token is only honoured while a row keyed by its SHA-256 hash
//! exists and has not expired. Signature checks live in the token manager;
//! this registry answers "is this particular session still alive".

use chrono::{Duration, Utc};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use thiserror::Error;

use crate::db::models::Session;
use crate::db::store::SessionStore;
use crate::error::AppError;

#[derive(Error, Debug)]
pub enum SessionError {
    /// No live session: never created, revoked, or expired.
    #[error("session not found or expired")]
    NotFound,

    #[error(transparent)]
    Store(#[from] AppError),
}

/// Hex SHA-256 of a raw refresh token.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Clone)]
pub struct SessionRegistry {
    store: Arc<dyn SessionStore>,
    ttl: Duration,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn SessionStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub async fn open(
        &self,
        user_id: &str,
        refresh_token: &str,
        user_agent: &str,
        ip_address: &str,
    ) -> Result<Session, SessionError> {
        let session = Session::new(
            user_id.to_string(),
            hash_token(refresh_token),
            user_agent.to_string(),
            ip_address.to_string(),
            self.ttl,
        );
        Ok(self.store.create_session(&session).await?)
    }

    pub async fn validate(&self, user_id: &str, refresh_token: &str) -> Result<(), SessionError> {
        let hash = hash_token(refresh_token);
        match self.store.find_active_session(user_id, &hash, Utc::now()).await? {
            Some(_) => Ok(()),
            None => Err(SessionError::NotFound),
        }
    }

    /// Deletes the session for `refresh_token`. Revoking an unknown or
    /// already revoked token is not an error.
    pub async fn revoke(&self, refresh_token: &str) -> Result<(), SessionError> {
        self.store.delete_session_by_hash(&hash_token(refresh_token)).await?;
        Ok(())
    }

    pub async fn revoke_all(&self, user_id: &str) -> Result<u64, SessionError> {
        Ok(self.store.delete_sessions_for_user(user_id).await?)
    }

    pub async fn purge_expired(&self) -> Result<u64, SessionError> {
        Ok(self.store.delete_expired_sessions(Utc::now()).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryStore;

    fn registry(ttl: Duration) -> (SessionRegistry, MemoryStore) {
        let store = MemoryStore::new();
        (SessionRegistry::new(Arc::new(store.clone()), ttl), store)
    }

    #[test]
    fn test_hash_token_is_hex_sha256() {
        assert_eq!(
            hash_token("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_open_stores_hash_not_token() {
        let (registry, store) = registry(Duration::days(7));
        let session = registry.open("u1", "raw-token", "agent", "10.0.0.1").await.unwrap();

        assert_eq!(session.token_hash, hash_token("raw-token"));
        assert_ne!(session.token_hash, "raw-token");
        assert_eq!(session.user_agent, "agent");
        assert_eq!(session.ip_address, "10.0.0.1");
        assert_eq!(store.sessions_for_user("u1").await.len(), 1);
        let ttl = session.expires_at - session.created_at;
        assert_eq!(ttl, Duration::days(7));
    }

    #[tokio::test]
    async fn test_validate_requires_matching_user_and_token() {
        let (registry, _) = registry(Duration::days(7));
        registry.open("u1", "token-a", "", "").await.unwrap();

        assert!(registry.validate("u1", "token-a").await.is_ok());
        assert!(matches!(registry.validate("u2", "token-a").await, Err(SessionError::NotFound)));
        assert!(matches!(registry.validate("u1", "token-b").await, Err(SessionError::NotFound)));
    }

    #[tokio::test]
    async fn test_expired_session_is_invalid() {
        let (registry, _) = registry(Duration::seconds(-1));
        registry.open("u1", "token-a", "", "").await.unwrap();
        assert!(matches!(registry.validate("u1", "token-a").await, Err(SessionError::NotFound)));
        assert_eq!(registry.purge_expired().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_revoke_is_idempotent() {
        let (registry, _) = registry(Duration::days(7));
        registry.open("u1", "token-a", "", "").await.unwrap();

        registry.revoke("token-a").await.unwrap();
        registry.revoke("token-a").await.unwrap();
        registry.revoke("never-issued").await.unwrap();
        assert!(matches!(registry.validate("u1", "token-a").await, Err(SessionError::NotFound)));
    }

    #[tokio::test]
    async fn test_revoking_one_session_keeps_the_other() {
        let (registry, _) = registry(Duration::days(7));
        registry.open("u1", "laptop", "", "").await.unwrap();
        registry.open("u1", "phone", "", "").await.unwrap();

        registry.revoke("laptop").await.unwrap();
        assert!(registry.validate("u1", "laptop").await.is_err());
        assert!(registry.validate("u1", "phone").await.is_ok());

        assert_eq!(registry.revoke_all("u1").await.unwrap(), 1);
        assert!(registry.validate("u1", "phone").await.is_err());
    }
}
