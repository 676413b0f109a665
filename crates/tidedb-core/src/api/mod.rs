//! Public API: the database handle.

pub mod database;

pub use database::Database;
