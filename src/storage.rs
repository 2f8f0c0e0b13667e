//! Storage subsystem
//!
//! This module provides the two durable tiers backing a scraping session.
//!
//! Components:
//! - `types`: record and snapshot types shared by both backends.
//! - `database_storage`: SQLite implementation using sqlx, the queryable tier.
//! - `file_storage`: filesystem-backed tier for snapshots and CSV backups,
//!   always attempted regardless of database availability.

pub mod database_storage;
pub mod file_storage;
pub mod types;
