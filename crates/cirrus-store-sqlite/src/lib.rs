//! SQLite backend for the Cirrus evaluation store.
//!
//! Wraps [`tokio_rusqlite`] so all database access runs on a dedicated
//! thread without blocking the async runtime. The schema is versioned with
//! `PRAGMA user_version`; file-backed databases are backed up before a
//! migration touches them.

mod catalog;
mod encode;
mod execution;
mod schema;
mod store;

pub mod error;

pub use error::{Error, Result};
pub use store::SqliteStore;
