//! Local document store
//!
//! Named JSON document databases with optimistic revision tracking, a
//! per-database change feed, and the revision winner rule used when applying
//! documents received from replicas.

pub mod database;
pub mod document;
pub mod server;

pub use database::{ChangeEvent, ChangeType, Database};
pub use document::{next_revision, revision_generation, revision_wins, Document};
pub use server::{validate_database_name, LocalServer};
