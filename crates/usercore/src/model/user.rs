//! User aggregate.
//!
//! # Responsibility
//! - Normalize and validate user-supplied name/email values.
//! - Own lifecycle transitions (mutation, soft delete, restore).
//!
//! # Invariants
//! - Identity is carried by the `Persisted` state only; a `NewUser` has none
//!   and becomes a `User` exactly once through `assign_id`.
//! - `version` is 1 for new users and only moves forward via `bump_version`.
//! - A soft-deleted user rejects every mutation except `restore`.
//! - No I/O happens here; `now` is always supplied by the caller.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Minimum name length in characters, after trimming.
pub const NAME_MIN_CHARS: usize = 2;
/// Maximum name length in characters, after trimming.
pub const NAME_MAX_CHARS: usize = 100;

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9._%+\-]+@[a-z0-9.\-]+\.[a-z]{2,}$").expect("valid email regex")
});

/// Stable, time-sortable user identifier (UUID v7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(Uuid);

impl UserId {
    /// Generates a fresh identifier whose ordering follows generation time.
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl From<Uuid> for UserId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for UserId {
    type Err = uuid::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(value).map(Self)
    }
}

/// Domain rule violations raised by the user aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UserError {
    #[error(
        "name must be between {min} and {max} characters, got {length}",
        min = NAME_MIN_CHARS,
        max = NAME_MAX_CHARS
    )]
    InvalidName { length: usize },
    #[error("email address is not valid")]
    InvalidEmail,
    #[error("user already deleted")]
    AlreadyDeleted,
    #[error("user is not deleted")]
    NotDeleted,
}

/// State marker for a user that has never been stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Unpersisted;

/// State marker for a stored user; holds the adapter-assigned identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Persisted {
    id: UserId,
}

/// User aggregate, tagged by persistence state.
///
/// `User` (the default) is a stored user with an id; `NewUser` is a draft
/// that only storage adapters turn into a `User`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User<S = Persisted> {
    #[serde(flatten)]
    state: S,
    name: String,
    email: String,
    version: u32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
}

/// A user that has been constructed but not persisted yet.
pub type NewUser = User<Unpersisted>;

impl User<Unpersisted> {
    /// Builds a new user from raw caller input.
    ///
    /// # Errors
    /// - `InvalidName` when the trimmed name is outside 2..=100 characters.
    /// - `InvalidEmail` when the normalized email does not match the address
    ///   pattern.
    pub fn new(name: &str, email: &str, now: DateTime<Utc>) -> Result<Self, UserError> {
        let name = normalize_name(name);
        let email = normalize_email(email);
        validate_name(&name)?;
        validate_email(&email)?;

        Ok(Self {
            state: Unpersisted,
            name,
            email,
            version: 1,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        })
    }

    /// Attaches the storage-assigned identity.
    ///
    /// Consumes the draft, so an id can be assigned at most once.
    pub fn assign_id(self, id: UserId) -> User {
        User {
            state: Persisted { id },
            name: self.name,
            email: self.email,
            version: self.version,
            created_at: self.created_at,
            updated_at: self.updated_at,
            deleted_at: self.deleted_at,
        }
    }
}

impl User<Persisted> {
    /// Rebuilds a user from trusted storage state. Performs no validation.
    pub fn rehydrate(
        id: UserId,
        name: String,
        email: String,
        version: u32,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
        deleted_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            state: Persisted { id },
            name,
            email,
            version,
            created_at,
            updated_at,
            deleted_at,
        }
    }

    pub fn id(&self) -> UserId {
        self.state.id
    }
}

impl<S> User<S> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    /// Optimistic-lock token matching the last stored state.
    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn deleted_at(&self) -> Option<DateTime<Utc>> {
        self.deleted_at
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Renames the user. Unchanged (normalized) input is a no-op.
    pub fn change_name(&mut self, new_name: &str, now: DateTime<Utc>) -> Result<(), UserError> {
        self.ensure_active()?;

        let new_name = normalize_name(new_name);
        if new_name == self.name {
            return Ok(());
        }
        validate_name(&new_name)?;

        self.name = new_name;
        self.updated_at = now;
        Ok(())
    }

    /// Changes the email address. Unchanged (normalized) input is a no-op.
    pub fn change_email(&mut self, new_email: &str, now: DateTime<Utc>) -> Result<(), UserError> {
        self.ensure_active()?;

        let new_email = normalize_email(new_email);
        if new_email == self.email {
            return Ok(());
        }
        validate_email(&new_email)?;

        self.email = new_email;
        self.updated_at = now;
        Ok(())
    }

    /// Marks the user as soft-deleted.
    pub fn delete(&mut self, now: DateTime<Utc>) -> Result<(), UserError> {
        self.ensure_active()?;

        self.deleted_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Clears the soft-delete tombstone.
    pub fn restore(&mut self, now: DateTime<Utc>) -> Result<(), UserError> {
        if self.deleted_at.is_none() {
            return Err(UserError::NotDeleted);
        }

        self.deleted_at = None;
        self.updated_at = now;
        Ok(())
    }

    /// Advances the version after a successful conditional write.
    ///
    /// Only storage adapters should call this.
    pub fn bump_version(&mut self) {
        self.version += 1;
    }

    fn ensure_active(&self) -> Result<(), UserError> {
        if self.deleted_at.is_some() {
            return Err(UserError::AlreadyDeleted);
        }
        Ok(())
    }
}

/// Canonical form of a user name: surrounding whitespace removed.
pub fn normalize_name(name: &str) -> String {
    name.trim().to_string()
}

/// Canonical form of an email address: trimmed and lower-cased.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn validate_name(name: &str) -> Result<(), UserError> {
    let length = name.chars().count();
    if !(NAME_MIN_CHARS..=NAME_MAX_CHARS).contains(&length) {
        return Err(UserError::InvalidName { length });
    }
    Ok(())
}

fn validate_email(email: &str) -> Result<(), UserError> {
    if !EMAIL_RE.is_match(email) {
        return Err(UserError::InvalidEmail);
    }
    Ok(())
}
