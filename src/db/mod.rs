//! Database module: entity models and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: view models returned by repository queries.
//! - `repo`: SQL-only functions that map rows into entities.
//!
//! External modules should import from `pagecast::db` — we re-export the
//! repository API and the view models used by the dispatch worker.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{DeliveryLog, DueItem};
