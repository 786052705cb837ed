//! Domain model for managed user identities.
//!
//! # Responsibility
//! - Define the user aggregate and the rules it enforces on itself.
//!
//! # Invariants
//! - Deletion is represented by a `deleted_at` tombstone, never a hard delete.
//! - Persisted and unpersisted users are distinct types.

pub mod user;
