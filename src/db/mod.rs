//! Database module: entity models and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: typed rows and query descriptions returned by or passed to
//!   repositories.
//! - `repo`: SQL-only functions over the SQLite pool.
//!
//! The pool doubles as the pipeline's document store: dedup records, the
//! durable reply budget, the local outbox queue, and JSON archives live here.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{DocQuery, Document, OutboxMessage, SortOrder};

/// Document collections written by the pipeline.
pub mod collections {
    pub const VIRAL_CANDIDATES: &str = "viral_candidates";
    pub const BOT_RESPONSES: &str = "bot_responses";
    pub const DEAD_LETTERS: &str = "dead_letters";
}
