use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Database tier settings. The tier is embedded SQLite, so the connection
/// surface is a file path; leaving the whole `[database]` table out of the
/// configuration disables the tier and the system runs local-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database file. Parent directories are created on connect.
    pub path: PathBuf,

    /// Upper bound for any single database operation, in seconds. Keeps a
    /// wedged database from stalling a flush, the final shutdown flush
    /// included.
    #[serde(default = "default_op_timeout_secs")]
    pub op_timeout_secs: u64,
}

pub(crate) fn default_op_timeout_secs() -> u64 {
    10
}
