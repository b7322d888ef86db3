//! Authentication module for the storefront backend
//!
//! Password hashing, token issuance, refresh sessions, the login flows
//! built on them, and the request authorization gate.

pub mod handlers;
pub mod middleware;
pub mod password;
pub mod routes;
pub mod service;
pub mod session;
pub mod tokens;

pub use middleware::{AuthContext, RequireAdmin};
pub use password::{HashCost, PasswordHasher};
pub use service::{AuthService, ClientInfo, LoginOutcome, RegisterInput};
pub use session::SessionRegistry;
pub use tokens::{AccessIdentity, TokenConfig, TokenManager};
