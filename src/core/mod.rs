//! core
//!
//! Core domain types and schemas for stacklock.
//!
//! # Modules
//!
//! - [`level`] - Lock levels and the compatibility matrix
//! - [`errors`] - Lock error taxonomy
//! - [`owner`] - Execution-unit identities
//! - [`clock`] - Wall-clock timestamps shared by all units
//! - [`config`] - Configuration schema and loading
//! - [`scope`] - Scope-bound release tokens
//!
//! # Design Principles
//!
//! - Strong typing prevents invalid levels from reaching a backend
//! - Schemas are strict and self-describing
//! - Nothing here touches shared state

pub mod clock;
pub mod config;
pub mod errors;
pub mod level;
pub mod owner;
pub mod scope;
