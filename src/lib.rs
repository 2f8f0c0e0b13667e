//! Crash-safe session persistence for map-listing extraction runs.
//!
//! An external producer (the scraping engine, out of scope here) appends
//! business records and search-history entries to an in-memory session;
//! this crate keeps that session durable across a local file tier and an
//! optional SQLite tier, flushing on a timer, on record-count thresholds
//! and on shutdown, and recovering prior sessions by identifier.

pub mod configuration;
pub mod error_handling;
pub mod session_management;
pub mod storage;

pub use configuration::config::Config;
pub use session_management::autosave::AutoSaveScheduler;
pub use session_management::session_manager::{FlushOutcome, SessionManager};
pub use storage::types::{
    BusinessRecord, SearchHistoryEntry, SessionSnapshot, SnapshotKind, UNAVAILABLE,
};
