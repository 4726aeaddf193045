//! Database module for SQLite persistence.

pub mod catalog;
pub mod connection;
pub mod repository;
pub mod schema;

pub use catalog::CatalogError;
pub use connection::{DbConfig, DbConn, DbPool, run_migrations};
pub use repository::{CatalogCounts, CatalogRepository, LibraryRepository};
