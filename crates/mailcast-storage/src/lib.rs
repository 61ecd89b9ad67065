//! Mailcast Storage - persistence for the broadcast engine
//!
//! Repository traits with PostgreSQL implementations and an
//! in-memory store used by tests and single-process runs.

pub mod db;
pub mod memory;
pub mod models;
pub mod repository;

pub use db::DatabasePool;
pub use memory::MemoryStore;
pub use models::*;
pub use repository::*;
