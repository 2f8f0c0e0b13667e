use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};

use crate::session_management::session_manager::{FlushOutcome, SessionManager};

/// Background flush timer.
///
/// A dedicated thread waits on a channel with `recv_timeout`: each timeout
/// tick runs one coalescing flush and the wait re-arms, whether or not the
/// flush succeeded. Cancellation is a message (or a dropped sender), so there
/// is no self-rescheduling closure to race against shutdown: once `cancel`
/// returns, the thread has been joined and no further timer flush can start.
pub struct AutoSaveScheduler {
    cancel_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
    manager: Arc<SessionManager>,
}

impl AutoSaveScheduler {
    pub fn start(manager: Arc<SessionManager>, interval: Duration) -> Self {
        let (cancel_tx, cancel_rx) = mpsc::channel();
        let worker = Arc::clone(&manager);
        let handle = thread::spawn(move || loop {
            match cancel_rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {
                    debug!("Auto-save tick");
                    worker.flush_auto();
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        });
        info!("Auto-save scheduler armed (every {:?})", interval);
        Self {
            cancel_tx,
            handle: Some(handle),
            manager,
        }
    }

    /// Stops the timer and joins the worker thread. Idempotent.
    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.cancel_tx.send(());
            if handle.join().is_err() {
                warn!("Auto-save worker panicked");
            }
            info!("Auto-save scheduler cancelled");
        }
    }

    /// Orderly shutdown: cancel the timer first, then perform exactly one
    /// final synchronous flush. The database half of that flush is bounded
    /// by the storage per-operation timeout, so a dead connection cannot
    /// starve the local write.
    pub fn shutdown(mut self) -> FlushOutcome {
        self.cancel();
        self.manager.final_flush()
    }
}

impl Drop for AutoSaveScheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::config::Config;
    use crate::storage::file_storage::FileStorage;
    use crate::storage::types::BusinessRecord;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> Arc<SessionManager> {
        let config = Config {
            data_dir: dir.path().join("session_data"),
            // Keep the count trigger out of the way of timer tests
            flush_record_threshold: 1000,
            database: None,
            ..Default::default()
        };
        Arc::new(SessionManager::with_session_id(&config, "timer01").unwrap())
    }

    #[test]
    fn timer_tick_flushes_pending_records() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let scheduler =
            AutoSaveScheduler::start(Arc::clone(&manager), Duration::from_millis(50));
        manager.append_business(BusinessRecord::unavailable("Cafe", "cafes", 0));
        std::thread::sleep(Duration::from_millis(400));
        drop(scheduler);

        let files = FileStorage::new(dir.path().join("session_data")).unwrap();
        let snapshot = files.read_latest_snapshot("timer01").unwrap().unwrap();
        assert_eq!(snapshot.total_businesses, 1);
    }

    #[test]
    fn no_flush_after_cancellation() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let mut scheduler =
            AutoSaveScheduler::start(Arc::clone(&manager), Duration::from_millis(50));
        scheduler.cancel();
        scheduler.cancel(); // idempotent

        manager.append_business(BusinessRecord::unavailable("Cafe", "cafes", 0));
        std::thread::sleep(Duration::from_millis(200));
        let files = FileStorage::new(dir.path().join("session_data")).unwrap();
        assert!(files.read_latest_snapshot("timer01").unwrap().is_none());
    }

    #[test]
    fn shutdown_runs_one_final_flush() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let scheduler =
            AutoSaveScheduler::start(Arc::clone(&manager), Duration::from_secs(3600));
        manager.append_business(BusinessRecord::unavailable("Cafe", "cafes", 0));
        let outcome = scheduler.shutdown();
        assert!(outcome.snapshot_path.is_some());

        let files = FileStorage::new(dir.path().join("session_data")).unwrap();
        let snapshot = files.read_latest_snapshot("timer01").unwrap().unwrap();
        assert_eq!(snapshot.total_businesses, 1);
    }
}
