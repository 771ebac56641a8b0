//! Database module: row models and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: typed row and view models returned by repositories.
//! - `repo`: SQL-only functions that map rows into those models.
//!
//! External modules should import from `portal_sync::db` — we re-export the
//! repository API and commonly used models for convenience.

pub mod model;
pub mod repo;

pub use model::{ClientFieldState, ClientRow, ColumnValue, VisitKey};
pub use repo::*;
