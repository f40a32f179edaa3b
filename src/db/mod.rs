//! Database module: entity models and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: typed row and view models returned by repositories.
//! - `repo`: SQL-only functions that map rows into entities.
//!
//! External modules should import from `jgrants_sync::db` — we re-export the
//! repository API and commonly used models for convenience.

pub mod model;
pub mod repo;

// Re-export the repository API at `crate::db::*` for convenience.
pub use repo::*;

// Surface view models used by callers (sync engine, enricher, bins).
pub use model::{ContentFields, ContentRecord, StoreStatistics};
