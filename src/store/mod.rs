//! Persistence layer — libSQL-backed storage for users, accounts, and groups.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlStore;
pub use traits::{Store, StoreCounts};
