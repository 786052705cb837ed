//! User repository contracts and SQLite implementation.
//!
//! # Responsibility
//! - Provide create/update/read/list/count APIs over the `users` table.
//! - Enforce optimistic locking on `(id, version)` for every update.
//! - Keep SQL details inside the core persistence boundary.
//!
//! # Invariants
//! - Ids are generated here, never by callers.
//! - `update` changes exactly one row or reports `VersionConflict`.
//! - Listing is ordered by `id ASC`; cursors carry only the last seen id.
//! - Read paths reject invalid persisted state instead of masking it.

use crate::context::{ContextError, RequestContext};
use crate::db::migrations::{current_user_version, latest_version};
use crate::db::{DbError, DEFAULT_BUSY_TIMEOUT};
use crate::model::user::{normalize_email, NewUser, User, UserId};
use chrono::{DateTime, Datelike, SecondsFormat, Utc};
use log::{debug, warn};
use rusqlite::types::Value;
use rusqlite::{ffi, params, params_from_iter, Connection, ErrorCode, Row};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::time::Duration;
use thiserror::Error;

/// Upper bound applied to list page sizes. Larger requests are clamped.
pub const MAX_LIST_LIMIT: u32 = 1000;

// Years whose RFC 3339 text is four digits wide and therefore sorts lexically.
const MIN_TEXT_YEAR: i32 = 0;
const MAX_TEXT_YEAR: i32 = 9999;

const USER_SELECT_SQL: &str = "SELECT
    id,
    name,
    email,
    version,
    created_at,
    updated_at,
    deleted_at
FROM users";

pub type RepoResult<T> = Result<T, RepoError>;

/// Key used for a failed lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserLookup {
    Id(UserId),
    Email(String),
}

impl Display for UserLookup {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Id(id) => write!(f, "id {id}"),
            Self::Email(email) => write!(f, "email {email}"),
        }
    }
}

/// Repository error for user persistence and query operations.
#[derive(Debug, Error)]
pub enum RepoError {
    #[error("user not found by {0}")]
    NotFound(UserLookup),
    #[error("email `{0}` is already used by an active user")]
    DuplicateEmail(String),
    #[error("version conflict for user {id} at version {version}")]
    VersionConflict { id: UserId, version: u32 },
    #[error("list limit must be greater than zero")]
    InvalidLimit,
    #[error(transparent)]
    Cancelled(#[from] ContextError),
    #[error(transparent)]
    Db(#[from] DbError),
    #[error("invalid persisted user data: {0}")]
    InvalidData(String),
    #[error(
        "connection schema version {actual_version} does not match {expected_version}; open it through db::open_db"
    )]
    UninitializedConnection {
        expected_version: u32,
        actual_version: u32,
    },
    #[error("required table `{0}` is missing")]
    MissingRequiredTable(&'static str),
}

impl RepoError {
    /// Stable short code for log lines.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::DuplicateEmail(_) => "duplicate_email",
            Self::VersionConflict { .. } => "version_conflict",
            Self::InvalidLimit => "invalid_limit",
            Self::Cancelled(err) => err.code(),
            Self::Db(_) => "db_error",
            Self::InvalidData(_) => "invalid_data",
            Self::UninitializedConnection { .. } => "uninitialized_connection",
            Self::MissingRequiredTable(_) => "missing_table",
        }
    }
}

impl From<rusqlite::Error> for RepoError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

/// Query constraints shared by `list` and `count`. All fields are AND-ed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserFilter {
    /// When `false`, soft-deleted users are excluded.
    pub include_deleted: bool,
    /// Exact match after email normalization.
    pub email: Option<String>,
    /// Exclusive lower bound on `created_at`.
    pub created_after: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `created_at`.
    pub created_before: Option<DateTime<Utc>>,
}

/// Keyset position: the id of the last user already returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub after_id: UserId,
}

/// One page of users in ascending id order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserPage {
    pub users: Vec<User>,
    /// Present iff the page was full; an absent cursor is end-of-stream.
    pub next_cursor: Option<Cursor>,
}

/// Repository interface for user persistence.
pub trait UserRepository {
    /// Inserts a new user and returns it with its assigned id.
    fn create(&self, ctx: &RequestContext, user: &NewUser) -> RepoResult<User>;
    /// Writes `user` if the stored version still matches, then bumps it.
    fn update(&self, ctx: &RequestContext, user: &mut User) -> RepoResult<()>;
    /// Loads a user by id, including soft-deleted ones.
    fn get_by_id(&self, ctx: &RequestContext, id: UserId) -> RepoResult<User>;
    /// Loads an active user by normalized email.
    fn get_by_email(&self, ctx: &RequestContext, email: &str) -> RepoResult<User>;
    /// Lists one keyset page.
    fn list(
        &self,
        ctx: &RequestContext,
        filter: &UserFilter,
        cursor: Option<&Cursor>,
        limit: u32,
    ) -> RepoResult<UserPage>;
    /// Counts users matching `filter`.
    fn count(&self, ctx: &RequestContext, filter: &UserFilter) -> RepoResult<u64>;
}

/// Liveness probe for the backing store.
pub trait HealthCheck {
    fn ping(&self, ctx: &RequestContext) -> RepoResult<()>;
}

/// Validates and clamps a requested page size.
pub fn normalize_list_limit(limit: u32) -> RepoResult<u32> {
    if limit == 0 {
        return Err(RepoError::InvalidLimit);
    }
    Ok(limit.min(MAX_LIST_LIMIT))
}

/// SQLite-backed user repository.
pub struct SqliteUserRepository<'conn> {
    conn: &'conn Connection,
    busy_timeout: Duration,
}

impl<'conn> SqliteUserRepository<'conn> {
    /// Constructs a repository from a migrated connection.
    pub fn try_new(conn: &'conn Connection) -> RepoResult<Self> {
        ensure_connection_ready(conn)?;
        Ok(Self {
            conn,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        })
    }

    /// Caps how long a statement may wait on a locked database.
    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }

    fn begin(&self, ctx: &RequestContext) -> RepoResult<()> {
        ctx.check()?;
        let timeout = ctx
            .remaining()
            .map_or(self.busy_timeout, |remaining| remaining.min(self.busy_timeout));
        self.conn.busy_timeout(timeout)?;
        Ok(())
    }
}

impl UserRepository for SqliteUserRepository<'_> {
    fn create(&self, ctx: &RequestContext, user: &NewUser) -> RepoResult<User> {
        self.begin(ctx)?;

        let id = UserId::generate();
        let inserted = self.conn.execute(
            "INSERT INTO users (
                id,
                name,
                email,
                version,
                created_at,
                updated_at,
                deleted_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7);",
            params![
                id.to_string(),
                user.name(),
                user.email(),
                user.version(),
                format_timestamp(user.created_at()),
                format_timestamp(user.updated_at()),
                user.deleted_at().map(format_timestamp),
            ],
        );

        match inserted {
            Ok(_) => {
                debug!("event=user_insert module=repo status=ok user_id={id}");
                Ok(user.clone().assign_id(id))
            }
            Err(err) if is_unique_violation(&err) => {
                Err(RepoError::DuplicateEmail(user.email().to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn update(&self, ctx: &RequestContext, user: &mut User) -> RepoResult<()> {
        self.begin(ctx)?;

        let id = user.id();
        let expected_version = user.version();
        let next_version = expected_version.checked_add(1).ok_or_else(|| {
            RepoError::InvalidData(format!("version overflow for user {id}"))
        })?;

        let updated = self.conn.execute(
            "UPDATE users
             SET
                name = ?1,
                email = ?2,
                version = ?3,
                updated_at = ?4,
                deleted_at = ?5
             WHERE id = ?6
               AND version = ?7;",
            params![
                user.name(),
                user.email(),
                next_version,
                format_timestamp(user.updated_at()),
                user.deleted_at().map(format_timestamp),
                id.to_string(),
                expected_version,
            ],
        );

        let changed = match updated {
            Ok(changed) => changed,
            Err(err) if is_unique_violation(&err) => {
                return Err(RepoError::DuplicateEmail(user.email().to_string()));
            }
            Err(err) => return Err(err.into()),
        };

        if changed != 1 {
            warn!(
                "event=user_update module=repo status=conflict user_id={id} version={expected_version}"
            );
            return Err(RepoError::VersionConflict {
                id,
                version: expected_version,
            });
        }

        user.bump_version();
        Ok(())
    }

    fn get_by_id(&self, ctx: &RequestContext, id: UserId) -> RepoResult<User> {
        self.begin(ctx)?;

        let mut stmt = self
            .conn
            .prepare(&format!("{USER_SELECT_SQL} WHERE id = ?1;"))?;
        let mut rows = stmt.query([id.to_string()])?;
        match rows.next()? {
            Some(row) => parse_user_row(row),
            None => Err(RepoError::NotFound(UserLookup::Id(id))),
        }
    }

    fn get_by_email(&self, ctx: &RequestContext, email: &str) -> RepoResult<User> {
        self.begin(ctx)?;

        let email = normalize_email(email);
        let mut stmt = self.conn.prepare(&format!(
            "{USER_SELECT_SQL}
             WHERE email = ?1
               AND deleted_at IS NULL;"
        ))?;
        let mut rows = stmt.query([email.as_str()])?;
        match rows.next()? {
            Some(row) => parse_user_row(row),
            None => Err(RepoError::NotFound(UserLookup::Email(email))),
        }
    }

    fn list(
        &self,
        ctx: &RequestContext,
        filter: &UserFilter,
        cursor: Option<&Cursor>,
        limit: u32,
    ) -> RepoResult<UserPage> {
        self.begin(ctx)?;
        let limit = normalize_list_limit(limit)?;

        let mut sql = format!("{USER_SELECT_SQL} WHERE 1 = 1");
        let mut bind_values = Vec::new();
        push_filter_predicates(&mut sql, &mut bind_values, filter);

        if let Some(cursor) = cursor {
            sql.push_str(" AND id > ?");
            bind_values.push(Value::Text(cursor.after_id.to_string()));
        }

        sql.push_str(" ORDER BY id ASC LIMIT ?");
        bind_values.push(Value::Integer(i64::from(limit)));

        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(bind_values))?;
        let mut users = Vec::new();
        while let Some(row) = rows.next()? {
            users.push(parse_user_row(row)?);
        }

        // A full page may be followed by more rows; no lookahead is done.
        let next_cursor = if users.len() == limit as usize {
            users.last().map(|user| Cursor {
                after_id: user.id(),
            })
        } else {
            None
        };

        Ok(UserPage { users, next_cursor })
    }

    fn count(&self, ctx: &RequestContext, filter: &UserFilter) -> RepoResult<u64> {
        self.begin(ctx)?;

        let mut sql = String::from("SELECT COUNT(*) FROM users WHERE 1 = 1");
        let mut bind_values = Vec::new();
        push_filter_predicates(&mut sql, &mut bind_values, filter);

        let count: i64 = self
            .conn
            .query_row(&sql, params_from_iter(bind_values), |row| row.get(0))?;
        u64::try_from(count)
            .map_err(|_| RepoError::InvalidData(format!("negative user count `{count}`")))
    }
}

impl HealthCheck for SqliteUserRepository<'_> {
    fn ping(&self, ctx: &RequestContext) -> RepoResult<()> {
        self.begin(ctx)?;
        self.conn
            .query_row("SELECT 1;", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }
}

fn push_filter_predicates(sql: &mut String, bind_values: &mut Vec<Value>, filter: &UserFilter) {
    if !filter.include_deleted {
        sql.push_str(" AND deleted_at IS NULL");
    }

    if let Some(email) = filter.email.as_deref() {
        sql.push_str(" AND email = ?");
        bind_values.push(Value::Text(normalize_email(email)));
    }

    // Bounds outside the fixed-width year range resolve without a text comparison.
    if let Some(created_after) = filter.created_after {
        match created_after.year() {
            year if year > MAX_TEXT_YEAR => sql.push_str(" AND 0 = 1"),
            year if year < MIN_TEXT_YEAR => {}
            _ => {
                sql.push_str(" AND created_at > ?");
                bind_values.push(Value::Text(format_timestamp(created_after)));
            }
        }
    }

    if let Some(created_before) = filter.created_before {
        match created_before.year() {
            year if year > MAX_TEXT_YEAR => {}
            year if year < MIN_TEXT_YEAR => sql.push_str(" AND 0 = 1"),
            _ => {
                sql.push_str(" AND created_at < ?");
                bind_values.push(Value::Text(format_timestamp(created_before)));
            }
        }
    }
}

fn ensure_connection_ready(conn: &Connection) -> RepoResult<()> {
    let expected_version = latest_version();
    let actual_version = current_user_version(conn)?;
    if actual_version != expected_version {
        return Err(RepoError::UninitializedConnection {
            expected_version,
            actual_version,
        });
    }

    let has_users: i64 = conn.query_row(
        "SELECT EXISTS(
            SELECT 1
            FROM sqlite_master
            WHERE type = 'table' AND name = 'users'
        );",
        [],
        |row| row.get(0),
    )?;
    if has_users != 1 {
        return Err(RepoError::MissingRequiredTable("users"));
    }

    Ok(())
}

fn parse_user_row(row: &Row<'_>) -> RepoResult<User> {
    let id_text: String = row.get("id")?;
    let id = id_text.parse::<UserId>().map_err(|_| {
        RepoError::InvalidData(format!("invalid uuid value `{id_text}` in users.id"))
    })?;

    let raw_version: i64 = row.get("version")?;
    let version = u32::try_from(raw_version)
        .ok()
        .filter(|version| *version >= 1)
        .ok_or_else(|| {
            RepoError::InvalidData(format!(
                "invalid version `{raw_version}` in users.version"
            ))
        })?;

    let created_at = parse_timestamp(&row.get::<_, String>("created_at")?, "created_at")?;
    let updated_at = parse_timestamp(&row.get::<_, String>("updated_at")?, "updated_at")?;
    let deleted_at = match row.get::<_, Option<String>>("deleted_at")? {
        Some(value) => Some(parse_timestamp(&value, "deleted_at")?),
        None => None,
    };

    Ok(User::rehydrate(
        id,
        row.get("name")?,
        row.get("email")?,
        version,
        created_at,
        updated_at,
        deleted_at,
    ))
}

// Fixed-width UTC text, so SQL string comparison orders chronologically.
fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(value: &str, column: &str) -> RepoResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|_| {
            RepoError::InvalidData(format!("invalid timestamp `{value}` in users.{column}"))
        })
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(inner, _)
            if inner.code == ErrorCode::ConstraintViolation
                && inner.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}
