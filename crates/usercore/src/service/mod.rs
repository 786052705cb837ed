//! Core use-case services.
//!
//! # Responsibility
//! - Orchestrate aggregate rules and repository calls into use-case APIs.
//! - Keep transport layers decoupled from storage details.

pub mod user_service;
