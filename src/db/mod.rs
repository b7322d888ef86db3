//! Credential store for the auth core
//!
//! Users and sessions live behind the [`UserStore`] and [`SessionStore`]
//! traits, with a Postgres implementation for production and an in-process
//! one for tests and local development.

pub mod memory;
pub mod models;
pub mod operations;
pub mod store;

pub use memory::MemoryStore;
pub use models::{Role, Session, User, UserProfile};
pub use operations::DbOperations;
pub use store::{SessionStore, UserStore};
