//! Core domain logic for managed user identities.
//! This crate is the single source of truth for user invariants.

pub mod context;
pub mod db;
pub mod logging;
pub mod model;
pub mod repo;
pub mod service;

pub use context::{ContextError, RequestContext};
pub use db::{DbConfig, DbError};
pub use logging::{default_log_level, init_logging, logging_status, LoggingError};
pub use model::user::{NewUser, User, UserError, UserId};
pub use repo::user_repo::{
    Cursor, HealthCheck, RepoError, RepoResult, SqliteUserRepository, UserFilter, UserLookup,
    UserPage, UserRepository, MAX_LIST_LIMIT,
};
pub use service::user_service::{ErrorKind, ServiceError, ServiceResult, UserService};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
