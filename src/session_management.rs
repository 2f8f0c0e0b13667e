//! Session management core module.
//!
//! Holds the in-memory working set for one scraping session and the
//! machinery that keeps it durable: the orchestrating session manager and
//! the background auto-save scheduler.

/// Submodule for the cancellable auto-save timer.
pub mod autosave;
/// Submodule for session lifecycle orchestration.
pub mod session_manager;
/// Submodule for the in-memory working set.
pub mod session_state;

pub use autosave::AutoSaveScheduler;
pub use session_manager::{FlushOutcome, SessionManager};
pub use session_state::SessionState;
