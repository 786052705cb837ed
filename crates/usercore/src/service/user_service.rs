//! User use-case service.
//!
//! # Responsibility
//! - Provide create/update/delete/read/list entry points for transports.
//! - Orchestrate the user aggregate and repository persistence.
//! - Translate domain validation failures into `InvalidInput`.
//!
//! # Invariants
//! - Every operation checks the request context before any storage call.
//! - Soft-deleted users are invisible to get/update/delete.
//! - Nothing is retried here; conflicts surface to the caller unchanged.
//! - Log lines carry ids and error codes only, never names or emails.

use crate::context::{ContextError, RequestContext};
use crate::model::user::{NewUser, User, UserError, UserId};
use crate::repo::user_repo::{
    Cursor, HealthCheck, RepoError, UserFilter, UserLookup, UserPage, UserRepository,
};
use log::{debug, error, info};
use mockable::{Clock, DefaultClock};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Coarse error classes for transports mapping errors to external signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidInput,
    NotFound,
    DuplicateEmail,
    VersionConflict,
    Storage,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidInput => "invalid_input",
            Self::NotFound => "not_found",
            Self::DuplicateEmail => "duplicate_email",
            Self::VersionConflict => "version_conflict",
            Self::Storage => "storage_error",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Service error for user use-cases.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Caller data failed aggregate validation.
    #[error("invalid input for {operation}: {source}")]
    InvalidInput {
        operation: &'static str,
        source: UserError,
    },
    /// Page size of zero.
    #[error("list limit must be greater than zero")]
    InvalidLimit,
    /// Target user does not exist or is soft-deleted.
    #[error("user not found by {0}")]
    NotFound(UserLookup),
    #[error("email `{0}` is already used by an active user")]
    DuplicateEmail(String),
    /// Stored version moved on; re-read and retry or give up.
    #[error("version conflict for user {id} at version {version}")]
    VersionConflict { id: UserId, version: u32 },
    #[error("storage failure: {0}")]
    Storage(#[source] RepoError),
    #[error(transparent)]
    Cancelled(ContextError),
}

impl ServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput { .. } | Self::InvalidLimit => ErrorKind::InvalidInput,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::DuplicateEmail(_) => ErrorKind::DuplicateEmail,
            Self::VersionConflict { .. } => ErrorKind::VersionConflict,
            Self::Storage(_) => ErrorKind::Storage,
            Self::Cancelled(_) => ErrorKind::Cancelled,
        }
    }
}

impl From<RepoError> for ServiceError {
    fn from(value: RepoError) -> Self {
        match value {
            RepoError::NotFound(lookup) => Self::NotFound(lookup),
            RepoError::DuplicateEmail(email) => Self::DuplicateEmail(email),
            RepoError::VersionConflict { id, version } => Self::VersionConflict { id, version },
            RepoError::InvalidLimit => Self::InvalidLimit,
            RepoError::Cancelled(reason) => Self::Cancelled(reason),
            other => Self::Storage(other),
        }
    }
}

impl From<ContextError> for ServiceError {
    fn from(value: ContextError) -> Self {
        Self::Cancelled(value)
    }
}

/// Use-case service wrapper for user lifecycle operations.
pub struct UserService<R> {
    repo: R,
    clock: Arc<dyn Clock>,
}

impl<R> UserService<R>
where
    R: UserRepository + HealthCheck,
{
    /// Creates a service reading time from the system clock.
    pub fn new(repo: R) -> Self {
        Self::with_clock(repo, Arc::new(DefaultClock))
    }

    pub fn with_clock(repo: R, clock: Arc<dyn Clock>) -> Self {
        Self { repo, clock }
    }

    pub fn repository(&self) -> &R {
        &self.repo
    }

    /// Validates input and persists a new user.
    pub fn create_user(&self, ctx: &RequestContext, name: &str, email: &str) -> ServiceResult<User> {
        observe("user_create", || {
            ctx.check()?;
            let user = NewUser::new(name, email, self.clock.utc())
                .map_err(|source| invalid_input("create", source))?;
            Ok(self.repo.create(ctx, &user)?)
        })
    }

    /// Replaces name and email of an active user under optimistic locking.
    ///
    /// # Contract
    /// - Soft-deleted users report `NotFound`.
    /// - Both changes share one timestamp.
    /// - When neither value changes, nothing is written and the loaded user is
    ///   returned as-is (same `version` and `updated_at`).
    pub fn update_user(
        &self,
        ctx: &RequestContext,
        id: UserId,
        name: &str,
        email: &str,
    ) -> ServiceResult<User> {
        observe("user_update", || {
            ctx.check()?;
            let mut user = self.load_visible(ctx, id)?;
            let loaded = user.clone();

            let now = self.clock.utc();
            user.change_name(name, now)
                .map_err(|source| invalid_input("update", source))?;
            user.change_email(email, now)
                .map_err(|source| invalid_input("update", source))?;

            if user == loaded {
                return Ok(user);
            }

            self.repo.update(ctx, &mut user)?;
            Ok(user)
        })
    }

    /// Soft-deletes an active user.
    pub fn delete_user(&self, ctx: &RequestContext, id: UserId) -> ServiceResult<()> {
        observe("user_delete", || {
            ctx.check()?;
            let mut user = self.load_visible(ctx, id)?;
            user.delete(self.clock.utc())
                .map_err(|_| ServiceError::NotFound(UserLookup::Id(id)))?;
            Ok(self.repo.update(ctx, &mut user)?)
        })
    }

    /// Gets one active user by id.
    pub fn get_user(&self, ctx: &RequestContext, id: UserId) -> ServiceResult<User> {
        observe("user_get", || {
            ctx.check()?;
            self.load_visible(ctx, id)
        })
    }

    /// Gets one active user by email; the repository already hides deleted rows.
    pub fn get_by_email(&self, ctx: &RequestContext, email: &str) -> ServiceResult<User> {
        observe("user_get_by_email", || {
            ctx.check()?;
            Ok(self.repo.get_by_email(ctx, email)?)
        })
    }

    pub fn list_users(
        &self,
        ctx: &RequestContext,
        filter: &UserFilter,
        cursor: Option<&Cursor>,
        limit: u32,
    ) -> ServiceResult<UserPage> {
        observe("user_list", || {
            ctx.check()?;
            Ok(self.repo.list(ctx, filter, cursor, limit)?)
        })
    }

    pub fn count_users(&self, ctx: &RequestContext, filter: &UserFilter) -> ServiceResult<u64> {
        observe("user_count", || {
            ctx.check()?;
            Ok(self.repo.count(ctx, filter)?)
        })
    }

    /// Storage liveness probe.
    pub fn ping(&self, ctx: &RequestContext) -> ServiceResult<()> {
        observe("store_ping", || {
            ctx.check()?;
            Ok(self.repo.ping(ctx)?)
        })
    }

    fn load_visible(&self, ctx: &RequestContext, id: UserId) -> ServiceResult<User> {
        let user = self.repo.get_by_id(ctx, id)?;
        if user.is_deleted() {
            return Err(ServiceError::NotFound(UserLookup::Id(id)));
        }
        Ok(user)
    }
}

fn invalid_input(operation: &'static str, source: UserError) -> ServiceError {
    ServiceError::InvalidInput { operation, source }
}

fn observe<T>(event: &'static str, op: impl FnOnce() -> ServiceResult<T>) -> ServiceResult<T> {
    let started_at = Instant::now();
    let result = op();
    let duration_ms = started_at.elapsed().as_millis();

    match &result {
        Ok(_) => debug!("event={event} module=service status=ok duration_ms={duration_ms}"),
        Err(err) => {
            let kind = err.kind();
            if kind == ErrorKind::Storage {
                error!(
                    "event={event} module=service status=error duration_ms={duration_ms} error_code={} error={err}",
                    kind.as_str()
                );
            } else {
                info!(
                    "event={event} module=service status=rejected duration_ms={duration_ms} error_code={}",
                    kind.as_str()
                );
            }
        }
    }

    result
}
