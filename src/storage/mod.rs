//! Durable storage: schema plus the `SQLite` façade.

pub mod schema;
mod sqlite;

pub use sqlite::{
    CollisionOutcome, CollisionScore, IssueUpdate, MutationContext, SearchFilters, SqliteStorage,
};
