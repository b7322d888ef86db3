//! Storage seams used by the auth core.
//!
//! Every method is a single round-trip to the backing store. Uniqueness of
//! email, username and session token hash is enforced here, not by callers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::db::models::{Session, User};
use crate::Result;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Inserts a user. Fails with `DatabaseError::Duplicate` carrying
    /// `users_email_key` or `users_username_key` on a uniqueness clash.
    async fn create_user(&self, user: &User) -> Result<User>;

    async fn get_user_by_id(&self, id: &str) -> Result<Option<User>>;

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>>;

    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create_session(&self, session: &Session) -> Result<Session>;

    /// Returns the session matching both keys if it has not expired at `now`.
    async fn find_active_session(
        &self,
        user_id: &str,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>>;

    /// Returns the number of rows removed; zero is not an error.
    async fn delete_session_by_hash(&self, token_hash: &str) -> Result<u64>;

    async fn delete_sessions_for_user(&self, user_id: &str) -> Result<u64>;

    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64>;
}

pub const EMAIL_CONSTRAINT: &str = "users_email_key";
pub const USERNAME_CONSTRAINT: &str = "users_username_key";
