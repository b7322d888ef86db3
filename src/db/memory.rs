//! In-process store for tests and local runs without Postgres.
//!
//! Mirrors the unique constraints of the SQL schema so duplicate handling in
//! the auth core behaves the same against either backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::db::models::{Role, Session, User};
use crate::db::store::{SessionStore, UserStore, EMAIL_CONSTRAINT, USERNAME_CONSTRAINT};
use crate::error::DatabaseError;
use crate::Result;

const TOKEN_HASH_CONSTRAINT: &str = "user_sessions_token_hash_key";

#[derive(Clone, Default)]
pub struct MemoryStore {
    users: Arc<RwLock<HashMap<String, User>>>,
    sessions: Arc<RwLock<HashMap<String, Session>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn sessions_for_user(&self, user_id: &str) -> Vec<Session> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect()
    }

    /// Removes a user and their sessions, as an administrator would.
    pub async fn delete_user(&self, user_id: &str) -> bool {
        let removed = self.users.write().await.remove(user_id).is_some();
        self.sessions.write().await.retain(|_, s| s.user_id != user_id);
        removed
    }

    /// Replaces a user's role, as an administrator would.
    pub async fn set_role(&self, user_id: &str, role: Role) -> bool {
        match self.users.write().await.get_mut(user_id) {
            Some(user) => {
                user.role = role;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn create_user(&self, user: &User) -> Result<User> {
        let mut users = self.users.write().await;

        if users.values().any(|u| u.email == user.email) {
            return Err(DatabaseError::Duplicate(EMAIL_CONSTRAINT.into()).into());
        }
        if users.values().any(|u| u.username == user.username) {
            return Err(DatabaseError::Duplicate(USERNAME_CONSTRAINT.into()).into());
        }
        if users.contains_key(&user.id) {
            return Err(DatabaseError::Duplicate("users_pkey".into()).into());
        }

        users.insert(user.id.clone(), user.clone());
        Ok(user.clone())
    }

    async fn get_user_by_id(&self, id: &str) -> Result<Option<User>> {
        Ok(self.users.read().await.get(id).cloned())
    }

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        Ok(self.users.read().await.values().find(|u| u.email == email).cloned())
    }

    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        Ok(self
            .users
            .read()
            .await
            .values()
            .find(|u| u.username == username)
            .cloned())
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create_session(&self, session: &Session) -> Result<Session> {
        let mut sessions = self.sessions.write().await;

        if sessions.values().any(|s| s.token_hash == session.token_hash) {
            return Err(DatabaseError::Duplicate(TOKEN_HASH_CONSTRAINT.into()).into());
        }

        sessions.insert(session.id.clone(), session.clone());
        Ok(session.clone())
    }

    async fn find_active_session(
        &self,
        user_id: &str,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>> {
        Ok(self
            .sessions
            .read()
            .await
            .values()
            .find(|s| s.user_id == user_id && s.token_hash == token_hash && !s.is_expired_at(now))
            .cloned())
    }

    async fn delete_session_by_hash(&self, token_hash: &str) -> Result<u64> {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| s.token_hash != token_hash);
        Ok((before - sessions.len()) as u64)
    }

    async fn delete_sessions_for_user(&self, user_id: &str) -> Result<u64> {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| s.user_id != user_id);
        Ok((before - sessions.len()) as u64)
    }

    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| !s.is_expired_at(now));
        Ok((before - sessions.len()) as u64)
    }
}
