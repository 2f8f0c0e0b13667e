use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use uuid::Uuid;

use crate::configuration::config::Config;
use crate::error_handling::types::{SessionError, StorageError};
use crate::session_management::session_state::SessionState;
use crate::storage::database_storage::DatabaseStorage;
use crate::storage::file_storage::{self, FileStorage};
use crate::storage::types::{
    BusinessRecord, SearchHistoryEntry, SessionSummary, SnapshotKind,
};

/// What one flush accomplished. The local half is the fallback of last
/// resort: `snapshot_path` being set means the session is recoverable even
/// if every database field reports failure.
#[derive(Debug, Default)]
pub struct FlushOutcome {
    /// Business rows confirmed by the database tier during this flush.
    pub db_inserted: usize,
    /// True when the database tier is configured and every write succeeded.
    pub db_ok: bool,
    pub snapshot_path: Option<PathBuf>,
    pub backup_path: Option<PathBuf>,
}

/// Composes the working set and the two storage tiers into session
/// lifecycle operations.
///
/// No method here ever fails the caller because storage is flaky: database
/// errors are logged and the flush degrades to local-only, file errors are
/// logged and reads degrade to "no prior session". The state lock keeps
/// appends and flush bookkeeping atomic; the flush gate keeps flushes
/// mutually exclusive, with timer/count-triggered flushes coalescing instead
/// of queueing.
pub struct SessionManager {
    state: Mutex<SessionState>,
    database: Option<DatabaseStorage>,
    files: FileStorage,
    flush_gate: Mutex<()>,
    appended_since_flush: AtomicUsize,
    auto_save: bool,
    flush_threshold: usize,
    flush_interval: Duration,
}

impl SessionManager {
    /// Opens both tiers for a brand-new session id.
    pub fn new(config: &Config) -> Result<Self, SessionError> {
        Self::with_session_id(config, &generate_session_id())
    }

    /// Opens both tiers for the given session id. A database that cannot be
    /// reached disables the relational tier for the process lifetime rather
    /// than failing construction.
    pub fn with_session_id(config: &Config, session_id: &str) -> Result<Self, SessionError> {
        let files = FileStorage::new(&config.data_dir)?;
        let database = match &config.database {
            Some(db_config) => {
                match DatabaseStorage::new_file(
                    &db_config.path,
                    Duration::from_secs(db_config.op_timeout_secs),
                ) {
                    Ok(db) => {
                        info!("Database tier active at {}", db_config.path.display());
                        Some(db)
                    }
                    Err(e) => {
                        warn!("Database unavailable ({}), using local persistence only", e);
                        None
                    }
                }
            }
            None => None,
        };
        info!("Session {} opened", session_id);
        Ok(Self {
            state: Mutex::new(SessionState::new(session_id)),
            database,
            files,
            flush_gate: Mutex::new(()),
            appended_since_flush: AtomicUsize::new(0),
            auto_save: config.auto_save,
            flush_threshold: config.flush_record_threshold,
            flush_interval: Duration::from_secs(config.flush_interval_secs),
        })
    }

    pub fn session_id(&self) -> String {
        self.lock_state().session_id().to_string()
    }

    pub fn flush_interval(&self) -> Duration {
        self.flush_interval
    }

    pub fn auto_save_enabled(&self) -> bool {
        self.auto_save
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Serializes flushes and the lifecycle operations that replace the
    /// working set. A flush releases the state lock between collecting
    /// pending records and marking them persisted; holding this gate across
    /// `resume` and `clear` keeps record indices stable over that window.
    fn lock_gate(&self) -> MutexGuard<'_, ()> {
        match self.flush_gate.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Appends one extracted listing. Every `flush_threshold` new records a
    /// coalescing flush is triggered on the producer's thread, matching the
    /// save-every-N-records behavior of the extraction loop.
    pub fn append_business(&self, record: BusinessRecord) {
        self.lock_state().append_business(record);
        let appended = self.appended_since_flush.fetch_add(1, Ordering::SeqCst) + 1;
        if self.auto_save && self.flush_threshold > 0 && appended >= self.flush_threshold {
            debug!("Count threshold reached ({} new records)", appended);
            self.flush_auto();
        }
    }

    pub fn append_search(&self, entry: SearchHistoryEntry) {
        self.lock_state().append_search(entry);
    }

    /// Recovers a prior session's state, preferring the database tier and
    /// falling back to local snapshot files. Returns false when nothing was
    /// found; that is "no prior session", not an error, and storage failures
    /// along the way only degrade to the next tier. Waits for any in-flight
    /// flush so a hydration never swaps the records a flush is marking.
    pub fn resume(&self, session_id: &str) -> bool {
        let _gate = self.lock_gate();
        if let Some(db) = &self.database {
            match db.latest_snapshot(session_id) {
                Ok(Some(snapshot)) => {
                    info!(
                        "Session {} recovered from database ({} businesses)",
                        session_id, snapshot.total_businesses
                    );
                    self.lock_state().hydrate(snapshot);
                    return true;
                }
                Ok(None) => {}
                Err(e) => error!("Database snapshot lookup failed: {}", e),
            }
        }
        match self.files.read_latest_snapshot(session_id) {
            Ok(Some(snapshot)) => {
                info!(
                    "Session {} recovered from local files ({} businesses)",
                    session_id, snapshot.total_businesses
                );
                self.lock_state().hydrate(snapshot);
                true
            }
            Ok(None) => {
                info!("No prior data for session {}", session_id);
                false
            }
            Err(e) => {
                error!("Local snapshot read failed: {}", e);
                false
            }
        }
    }

    /// Manual flush; blocks until any in-flight flush completes.
    pub fn flush_now(&self) -> FlushOutcome {
        let _gate = self.lock_gate();
        self.flush_locked(SnapshotKind::Manual)
    }

    /// Timer/count-triggered flush. A flush request arriving while one is in
    /// flight is coalesced (skipped), never queued.
    pub fn flush_auto(&self) -> Option<FlushOutcome> {
        match self.flush_gate.try_lock() {
            Ok(_gate) => Some(self.flush_locked(SnapshotKind::Auto)),
            Err(_) => {
                debug!("Flush already in flight, coalescing");
                None
            }
        }
    }

    /// Last flush before shutdown. The scheduler must be cancelled first;
    /// the database half is bounded by the per-operation timeout so the
    /// local write is never starved.
    pub fn final_flush(&self) -> FlushOutcome {
        info!("Final flush for session {}", self.session_id());
        self.flush_now()
    }

    fn flush_locked(&self, kind: SnapshotKind) -> FlushOutcome {
        let mut outcome = FlushOutcome::default();
        let (pending_businesses, pending_history, empty) = {
            let state = self.lock_state();
            (state.unpersisted_businesses(), state.unpersisted_history(), state.is_empty())
        };
        self.appended_since_flush.store(0, Ordering::SeqCst);
        if empty {
            debug!("Nothing to flush");
            return outcome;
        }

        if let Some(db) = &self.database {
            let mut db_ok = true;
            if !pending_businesses.is_empty() {
                let indices: Vec<usize> = pending_businesses.iter().map(|(i, _)| *i).collect();
                let records: Vec<BusinessRecord> =
                    pending_businesses.into_iter().map(|(_, r)| r).collect();
                match db.insert_batch(&records) {
                    Ok(n) => {
                        outcome.db_inserted = n;
                        if n < records.len() {
                            warn!(
                                "Database confirmed {} of {} record(s); the rest stay queued",
                                n,
                                records.len()
                            );
                            db_ok = false;
                        }
                        self.lock_state().mark_businesses_persisted(confirmed_prefix(&indices, n));
                    }
                    Err(e) => {
                        error!("Database batch insert failed: {}", e);
                        db_ok = false;
                    }
                }
            }
            let mut confirmed_history = Vec::new();
            for (index, entry) in &pending_history {
                match db.insert_search_history(entry) {
                    Ok(()) => confirmed_history.push(*index),
                    Err(e) => {
                        error!("Search history insert failed: {}", e);
                        db_ok = false;
                        break;
                    }
                }
            }
            self.lock_state().mark_history_persisted(&confirmed_history);

            let snapshot = self.lock_state().snapshot();
            if let Err(e) = db.insert_snapshot(&snapshot.session_id, &snapshot, kind) {
                error!("Database snapshot write failed: {}", e);
                db_ok = false;
            }
            outcome.db_ok = db_ok;
        }

        // Local half, always attempted: the leaf fallback must be
        // self-sufficient, so it gets the full state, not the delta.
        let snapshot = self.lock_state().snapshot();
        match self.files.write_snapshot(&snapshot) {
            Ok(path) => outcome.snapshot_path = Some(path),
            Err(e) => error!("Local snapshot write failed: {}", e),
        }
        if !snapshot.extracted_businesses.is_empty() {
            let name = format!(
                "autosave_{}_{}.csv",
                snapshot.session_id,
                Utc::now().format("%Y%m%d_%H%M%S")
            );
            match self.files.write_tabular_backup(&snapshot.extracted_businesses, Some(&name)) {
                Ok(path) => outcome.backup_path = Some(path),
                Err(e) => error!("CSV backup write failed: {}", e),
            }
        }
        outcome
    }

    /// Empties the in-memory working set. Persisted snapshots are retained;
    /// the durable history is append-only. Waits for any in-flight flush so
    /// records collected for insertion are never cleared out from under it.
    pub fn clear(&self) {
        let _gate = self.lock_gate();
        self.lock_state().clear();
        self.appended_since_flush.store(0, Ordering::SeqCst);
        info!("Session {} working set cleared", self.session_id());
    }

    /// Writes the full current record list as CSV, either to the given path
    /// or to a timestamped file in the data directory.
    pub fn export_csv(&self, path: Option<&Path>) -> Result<PathBuf, StorageError> {
        let records = self.lock_state().businesses().to_vec();
        match path {
            Some(p) => {
                file_storage::write_csv(p, &records)?;
                info!("Exported {} record(s) to {}", records.len(), p.display());
                Ok(p.to_path_buf())
            }
            None => {
                let name = format!(
                    "session_{}_{}.csv",
                    self.session_id(),
                    Utc::now().format("%Y%m%d_%H%M%S")
                );
                self.files.write_tabular_backup(&records, Some(&name))
            }
        }
    }

    pub fn summary(&self) -> SessionSummary {
        self.lock_state().summary()
    }

    /// Drops automatic database snapshots older than the retention window.
    /// Returns `None` when the database tier is not configured.
    pub fn purge_old_snapshots(&self, days: i64) -> Option<u64> {
        let db = self.database.as_ref()?;
        Some(db.purge_snapshots_older_than(days).unwrap_or_else(|e| {
            error!("Snapshot purge failed: {}", e);
            0
        }))
    }

    pub fn database(&self) -> Option<&DatabaseStorage> {
        self.database.as_ref()
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if let Some(db) = self.database.take() {
            db.close();
        }
    }
}

/// The slice of pending indices confirmed by a batch insert: exactly the
/// first `n`. Under-marking (a crash after insert, before marking) only
/// means a re-insert next flush; over-marking would silently drop records,
/// so `n` beyond the pending count is clamped.
fn confirmed_prefix(indices: &[usize], n: usize) -> &[usize] {
    &indices[..n.min(indices.len())]
}

/// Short opaque identifier for a new session, matching the 8-character ids
/// the original tooling generated.
pub fn generate_session_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}
