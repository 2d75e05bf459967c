//! Storage Layer Module
//!
//! Provides persistence for signing sessions and guardian contributions.
//!
//! This module contains:
//! - Storage trait definitions for abstraction
//! - SQLite implementation for production
//! - In-memory implementation for testing

pub mod memory;
pub mod sqlite;
pub mod traits;

// Re-exports for convenience
pub use memory::MemorySessionStore;
pub use sqlite::SqliteSessionStore;
pub use traits::{
    ContributionInsert, SessionStore, StateTransition, StorageError, StorageResult,
};
