//! Tabula storage crate - SQLite persistence and the SQLite-backed
//! execution capability.
//!
//! Provides a WAL-mode SQLite database with migrations, a [`QueryExecutor`]
//! implementation over it, the approval audit log, and demo fixtures.
//!
//! [`QueryExecutor`]: tabula_core::QueryExecutor

pub mod audit;
pub mod db;
pub mod executor;
pub mod fixtures;
pub mod migrations;

pub use audit::SqliteAuditLog;
pub use db::Database;
pub use executor::SqliteExecutor;
pub use fixtures::seed_demo;
