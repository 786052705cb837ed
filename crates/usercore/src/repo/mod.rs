//! Repository layer abstractions and persistence implementations.
//!
//! # Responsibility
//! - Define the storage adapter contract for the user aggregate.
//! - Isolate SQLite query details from service orchestration.
//!
//! # Invariants
//! - Repository APIs return semantic errors (`NotFound`, `DuplicateEmail`,
//!   `VersionConflict`) in addition to DB transport errors.
//! - Every call observes the request context before touching the store.

pub mod user_repo;
