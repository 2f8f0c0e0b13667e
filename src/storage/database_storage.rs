use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{error, info};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Sqlite,
};

use crate::error_handling::types::StorageError;
use crate::storage::types::{
    BusinessRecord, DatabaseStats, SearchHistoryEntry, SessionSnapshot, SnapshotKind, UNAVAILABLE,
};

// Internal row mappings to avoid manual try_get
#[derive(Debug, sqlx::FromRow)]
struct BusinessRow {
    name: String,
    rating: Option<f64>,
    review_count: Option<String>,
    category: Option<String>,
    address: Option<String>,
    phone: Option<String>,
    website: Option<String>,
    email: Option<String>,
    search_name: String,
    extracted_at: String,
    original_index: i64,
    source_url: Option<String>,
    session_id: Option<String>,
}

impl BusinessRow {
    fn into_record(self) -> Result<BusinessRecord, StorageError> {
        let extracted_at = DateTime::parse_from_rfc3339(&self.extracted_at)
            .map_err(|_| StorageError::ReadFailed)?
            .with_timezone(&Utc);
        let or_marker = |v: Option<String>| v.unwrap_or_else(|| UNAVAILABLE.to_string());
        Ok(BusinessRecord {
            name: self.name,
            // The numeric column is a lossy normalization; free-text ratings
            // were stored as NULL and surface as the marker again here.
            rating: self
                .rating
                .map(|r| r.to_string())
                .unwrap_or_else(|| UNAVAILABLE.to_string()),
            review_count: or_marker(self.review_count),
            category: or_marker(self.category),
            address: or_marker(self.address),
            phone: or_marker(self.phone),
            website: or_marker(self.website),
            email: or_marker(self.email),
            search_name: self.search_name,
            extracted_at,
            original_index: self.original_index as u32,
            source_url: self.source_url.unwrap_or_default(),
            session_id: self.session_id.unwrap_or_default(),
            persisted: true,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SearchRow {
    search_name: String,
    source_url: String,
    result_count: i64,
    timestamp: String,
    params: Option<String>,
    duration_secs: i64,
}

impl SearchRow {
    fn into_entry(self) -> Result<SearchHistoryEntry, StorageError> {
        let timestamp = DateTime::parse_from_rfc3339(&self.timestamp)
            .map_err(|_| StorageError::ReadFailed)?
            .with_timezone(&Utc);
        let params = match self.params {
            Some(raw) => serde_json::from_str(&raw).map_err(|_| StorageError::ReadFailed)?,
            None => serde_json::Value::Null,
        };
        Ok(SearchHistoryEntry {
            search_name: self.search_name,
            source_url: self.source_url,
            result_count: self.result_count as u32,
            timestamp,
            duration_secs: self.duration_secs as u64,
            params,
            persisted: true,
        })
    }
}

/// SQLite tier. Blocking facade over sqlx on a dedicated current-thread
/// runtime; every operation is bounded by `op_timeout` so a wedged database
/// can never stall a flush, shutdown included.
pub struct DatabaseStorage {
    rt: tokio::runtime::Runtime,
    pool: Pool<Sqlite>,
    op_timeout: Duration,
}

impl DatabaseStorage {
    pub fn new_file<P: AsRef<Path>>(path: P, op_timeout: Duration) -> Result<Self, StorageError> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|_| StorageError::ConnectionFailed)?;
        let path_ref = path.as_ref();
        if let Some(parent) = path_ref.parent() {
            std::fs::create_dir_all(parent).map_err(|_| StorageError::WriteFailed)?;
        }
        let pool = rt.block_on(async {
            let opts = SqliteConnectOptions::from_str("sqlite://")
                .map_err(|_| StorageError::ConnectionFailed)?
                .filename(path_ref)
                .create_if_missing(true);
            SqlitePoolOptions::new()
                .max_connections(1)
                .connect_with(opts)
                .await
                .map_err(|e| {
                    error!("Failed to open database {}: {}", path_ref.display(), e);
                    StorageError::ConnectionFailed
                })
        })?;
        let storage = Self { rt, pool, op_timeout };
        storage.ensure_schema()?;
        info!("DatabaseStorage ready at {}", path_ref.display());
        Ok(storage)
    }

    fn run<T>(
        &self,
        fut: impl Future<Output = Result<T, StorageError>>,
    ) -> Result<T, StorageError> {
        let op_timeout = self.op_timeout;
        self.rt.block_on(async {
            match tokio::time::timeout(op_timeout, fut).await {
                Ok(res) => res,
                Err(_) => {
                    error!("Database operation timed out after {:?}", op_timeout);
                    Err(StorageError::Timeout)
                }
            }
        })
    }

    /// Creates the three tables and their indexes if absent. Safe to call
    /// repeatedly; the database file itself is created on connect.
    pub fn ensure_schema(&self) -> Result<(), StorageError> {
        self.run(async {
            let statements = [
                "CREATE TABLE IF NOT EXISTS businesses (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    rating REAL,
                    review_count TEXT,
                    category TEXT,
                    address TEXT,
                    phone TEXT,
                    website TEXT,
                    email TEXT,
                    search_name TEXT NOT NULL,
                    extracted_at TEXT NOT NULL,
                    original_index INTEGER,
                    source_url TEXT,
                    session_id TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );",
                "CREATE INDEX IF NOT EXISTS idx_businesses_search_name ON businesses(search_name);",
                "CREATE INDEX IF NOT EXISTS idx_businesses_extracted_at ON businesses(extracted_at);",
                "CREATE INDEX IF NOT EXISTS idx_businesses_name ON businesses(name);",
                "CREATE INDEX IF NOT EXISTS idx_businesses_rating ON businesses(rating);",
                "CREATE TABLE IF NOT EXISTS search_history (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    search_name TEXT NOT NULL,
                    source_url TEXT NOT NULL,
                    result_count INTEGER NOT NULL,
                    timestamp TEXT NOT NULL,
                    params TEXT,
                    duration_secs INTEGER NOT NULL DEFAULT 0
                );",
                "CREATE INDEX IF NOT EXISTS idx_search_history_search_name ON search_history(search_name);",
                "CREATE INDEX IF NOT EXISTS idx_search_history_timestamp ON search_history(timestamp);",
                "CREATE TABLE IF NOT EXISTS session_snapshots (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    session_id TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    timestamp TEXT NOT NULL,
                    kind TEXT NOT NULL DEFAULT 'auto'
                );",
                "CREATE INDEX IF NOT EXISTS idx_snapshots_session_time ON session_snapshots(session_id, timestamp);",
            ];
            for stmt in statements {
                sqlx::query(stmt)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| {
                        error!("Schema statement failed: {}", e);
                        StorageError::WriteFailed
                    })?;
            }
            Ok(())
        })
    }

    /// Inserts records one at a time in submission order, stopping at the
    /// first failure, and returns how many landed. The count therefore names
    /// an exact prefix of the input: callers may mark exactly that prefix as
    /// persisted without risk of over-marking.
    pub fn insert_batch(&self, records: &[BusinessRecord]) -> Result<usize, StorageError> {
        self.run(async {
            let mut inserted = 0usize;
            for rec in records {
                let res = sqlx::query(
                    "INSERT INTO businesses
                     (name, rating, review_count, category, address, phone, website, email,
                      search_name, extracted_at, original_index, source_url, session_id)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                )
                .bind(&rec.name)
                .bind(rec.rating_value())
                .bind(&rec.review_count)
                .bind(&rec.category)
                .bind(&rec.address)
                .bind(&rec.phone)
                .bind(&rec.website)
                .bind(&rec.email)
                .bind(&rec.search_name)
                .bind(rec.extracted_at.to_rfc3339())
                .bind(rec.original_index as i64)
                .bind(&rec.source_url)
                .bind(&rec.session_id)
                .execute(&self.pool)
                .await;
                match res {
                    Ok(_) => inserted += 1,
                    Err(e) => {
                        error!("Business insert failed after {} row(s): {}", inserted, e);
                        break;
                    }
                }
            }
            Ok(inserted)
        })
    }

    pub fn insert_search_history(&self, entry: &SearchHistoryEntry) -> Result<(), StorageError> {
        self.run(async {
            let params = serde_json::to_string(&entry.params)
                .map_err(|_| StorageError::Serialization)?;
            sqlx::query(
                "INSERT INTO search_history
                 (search_name, source_url, result_count, timestamp, params, duration_secs)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )
            .bind(&entry.search_name)
            .bind(&entry.source_url)
            .bind(entry.result_count as i64)
            .bind(entry.timestamp.to_rfc3339())
            .bind(params)
            .bind(entry.duration_secs as i64)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Search history insert failed: {}", e);
                StorageError::WriteFailed
            })?;
            Ok(())
        })
    }

    /// Appends a snapshot row. Rows are never replaced; the full history of
    /// snapshots is retained for audit and recovery.
    pub fn insert_snapshot(
        &self,
        session_id: &str,
        snapshot: &SessionSnapshot,
        kind: SnapshotKind,
    ) -> Result<(), StorageError> {
        self.run(async {
            let payload =
                serde_json::to_string(snapshot).map_err(|_| StorageError::Serialization)?;
            sqlx::query(
                "INSERT INTO session_snapshots (session_id, payload, timestamp, kind)
                 VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(session_id)
            .bind(payload)
            .bind(snapshot.timestamp.to_rfc3339())
            .bind(kind.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Snapshot insert failed for session {}: {}", session_id, e);
                StorageError::WriteFailed
            })?;
            Ok(())
        })
    }

    pub fn latest_snapshot(
        &self,
        session_id: &str,
    ) -> Result<Option<SessionSnapshot>, StorageError> {
        self.run(async {
            let payload: Option<String> = sqlx::query_scalar(
                "SELECT payload FROM session_snapshots
                 WHERE session_id = ?1
                 ORDER BY timestamp DESC, id DESC
                 LIMIT 1",
            )
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Snapshot lookup failed for session {}: {}", session_id, e);
                StorageError::ReadFailed
            })?;
            match payload {
                Some(raw) => {
                    let snapshot = serde_json::from_str(&raw).map_err(|e| {
                        error!("Snapshot payload unreadable for session {}: {}", session_id, e);
                        StorageError::ReadFailed
                    })?;
                    Ok(Some(snapshot))
                }
                None => Ok(None),
            }
        })
    }

    pub fn snapshot_count(&self, session_id: &str) -> Result<u64, StorageError> {
        self.run(async {
            let count: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM session_snapshots WHERE session_id = ?1",
            )
            .bind(session_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|_| StorageError::ReadFailed)?;
            Ok(count as u64)
        })
    }

    /// Rows ordered by extraction time, newest first, optionally filtered by
    /// the originating search and capped.
    pub fn list_businesses(
        &self,
        search_name: Option<&str>,
        limit: Option<u32>,
    ) -> Result<Vec<BusinessRecord>, StorageError> {
        self.run(async {
            // LIMIT -1 means "no cap" to SQLite
            let rows = sqlx::query_as::<_, BusinessRow>(
                "SELECT name, rating, review_count, category, address, phone, website, email,
                        search_name, extracted_at, original_index, source_url, session_id
                 FROM businesses
                 WHERE ?1 IS NULL OR search_name = ?1
                 ORDER BY extracted_at DESC, id DESC
                 LIMIT ?2",
            )
            .bind(search_name)
            .bind(limit.map(|l| l as i64).unwrap_or(-1))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                error!("Business listing failed: {}", e);
                StorageError::ReadFailed
            })?;
            let mut out = Vec::with_capacity(rows.len());
            for row in rows {
                out.push(row.into_record()?);
            }
            Ok(out)
        })
    }

    pub fn search_history(&self) -> Result<Vec<SearchHistoryEntry>, StorageError> {
        self.run(async {
            let rows = sqlx::query_as::<_, SearchRow>(
                "SELECT search_name, source_url, result_count, timestamp, params, duration_secs
                 FROM search_history
                 ORDER BY timestamp DESC, id DESC",
            )
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                error!("Search history listing failed: {}", e);
                StorageError::ReadFailed
            })?;
            let mut out = Vec::with_capacity(rows.len());
            for row in rows {
                out.push(row.into_entry()?);
            }
            Ok(out)
        })
    }

    /// Deletes automatic snapshots older than the retention window. Manual
    /// and emergency snapshots are kept regardless of age. Zero matches is
    /// a normal outcome.
    pub fn purge_snapshots_older_than(&self, days: i64) -> Result<u64, StorageError> {
        let cutoff = (Utc::now() - chrono::Duration::days(days)).to_rfc3339();
        self.run(async {
            let result = sqlx::query(
                "DELETE FROM session_snapshots WHERE kind = 'auto' AND timestamp < ?1",
            )
            .bind(&cutoff)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Snapshot purge failed: {}", e);
                StorageError::WriteFailed
            })?;
            let deleted = result.rows_affected();
            if deleted > 0 {
                info!("Purged {} automatic snapshot(s) older than {} day(s)", deleted, days);
            }
            Ok(deleted)
        })
    }

    pub fn statistics(&self) -> Result<DatabaseStats, StorageError> {
        self.run(async {
            let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM businesses")
                .fetch_one(&self.pool)
                .await
                .map_err(|_| StorageError::ReadFailed)?;
            let by_search: Vec<(String, i64)> = sqlx::query_as(
                "SELECT search_name, COUNT(*) FROM businesses
                 GROUP BY search_name ORDER BY COUNT(*) DESC",
            )
            .fetch_all(&self.pool)
            .await
            .map_err(|_| StorageError::ReadFailed)?;
            let with_phone: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM businesses WHERE phone IS NOT NULL AND phone != ?1",
            )
            .bind(UNAVAILABLE)
            .fetch_one(&self.pool)
            .await
            .map_err(|_| StorageError::ReadFailed)?;
            let with_website: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM businesses WHERE website IS NOT NULL AND website != ?1",
            )
            .bind(UNAVAILABLE)
            .fetch_one(&self.pool)
            .await
            .map_err(|_| StorageError::ReadFailed)?;
            let average_rating: Option<f64> = sqlx::query_scalar(
                "SELECT AVG(rating) FROM businesses WHERE rating IS NOT NULL",
            )
            .fetch_one(&self.pool)
            .await
            .map_err(|_| StorageError::ReadFailed)?;
            Ok(DatabaseStats {
                total_businesses: total as u64,
                by_search: by_search.into_iter().map(|(s, c)| (s, c as u64)).collect(),
                with_phone: with_phone as u64,
                with_website: with_website as u64,
                average_rating,
            })
        })
    }

    pub fn close(self) {
        self.rt.block_on(self.pool.close());
        info!("Database connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn temp_db() -> DatabaseStorage {
        let dir = TempDir::new().unwrap();
        let path: PathBuf = dir.path().join("test.sqlite3");
        // Keep TempDir alive by leaking it for the test duration
        Box::leak(Box::new(dir));
        DatabaseStorage::new_file(path, Duration::from_secs(5)).unwrap()
    }

    fn record(name: &str, search: &str, index: u32) -> BusinessRecord {
        let mut rec = BusinessRecord::unavailable(name, search, index);
        rec.session_id = "abc123".into();
        rec
    }

    fn snapshot(session_id: &str, when: DateTime<Utc>) -> SessionSnapshot {
        SessionSnapshot {
            session_id: session_id.into(),
            extracted_businesses: vec![],
            search_history: vec![],
            timestamp: when,
            total_businesses: 0,
        }
    }

    #[test]
    fn schema_creation_is_idempotent() {
        let db = temp_db();
        db.ensure_schema().unwrap();
        db.ensure_schema().unwrap();
    }

    #[test]
    fn batch_insert_and_listing() {
        let db = temp_db();
        let mut first = record("Cafe Uno", "cafes", 0);
        first.rating = "4.5".into();
        first.extracted_at = Utc::now() - chrono::Duration::seconds(10);
        let second = record("Bar Dos", "bars", 1);
        assert_eq!(db.insert_batch(&[first, second]).unwrap(), 2);

        let all = db.list_businesses(None, None).unwrap();
        assert_eq!(all.len(), 2);
        // Newest first
        assert_eq!(all[0].name, "Bar Dos");
        assert_eq!(all[1].rating, "4.5");

        let filtered = db.list_businesses(Some("cafes"), None).unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].name, "Cafe Uno");

        let capped = db.list_businesses(None, Some(1)).unwrap();
        assert_eq!(capped.len(), 1);
    }

    #[test]
    fn unparsable_rating_is_stored_as_null() {
        let db = temp_db();
        let mut rec = record("Cafe", "cafes", 0);
        rec.rating = "4,5 stars".into();
        assert_eq!(db.insert_batch(&[rec]).unwrap(), 1);
        let back = db.list_businesses(None, None).unwrap();
        assert_eq!(back[0].rating, UNAVAILABLE);
        let stats = db.statistics().unwrap();
        assert_eq!(stats.average_rating, None);
    }

    #[test]
    fn snapshots_are_append_only_and_latest_wins() {
        let db = temp_db();
        let old = snapshot("abc123", Utc::now() - chrono::Duration::minutes(5));
        let mut new = snapshot("abc123", Utc::now());
        new.total_businesses = 3;
        db.insert_snapshot("abc123", &old, SnapshotKind::Auto).unwrap();
        db.insert_snapshot("abc123", &new, SnapshotKind::Auto).unwrap();

        assert_eq!(db.snapshot_count("abc123").unwrap(), 2);
        let latest = db.latest_snapshot("abc123").unwrap().unwrap();
        assert_eq!(latest.total_businesses, 3);
        assert!(db.latest_snapshot("missing").unwrap().is_none());
    }

    #[test]
    fn purge_spares_manual_and_recent_snapshots() {
        let db = temp_db();
        let stale = Utc::now() - chrono::Duration::days(10);
        db.insert_snapshot("abc123", &snapshot("abc123", stale), SnapshotKind::Auto)
            .unwrap();
        db.insert_snapshot("abc123", &snapshot("abc123", stale), SnapshotKind::Manual)
            .unwrap();
        db.insert_snapshot("abc123", &snapshot("abc123", Utc::now()), SnapshotKind::Auto)
            .unwrap();

        assert_eq!(db.purge_snapshots_older_than(7).unwrap(), 1);
        assert_eq!(db.snapshot_count("abc123").unwrap(), 2);
        // Nothing left to purge
        assert_eq!(db.purge_snapshots_older_than(7).unwrap(), 0);
    }

    #[test]
    fn search_history_roundtrips_params() {
        let db = temp_db();
        let entry = SearchHistoryEntry {
            search_name: "cafes".into(),
            source_url: "https://example.test/search?q=cafes".into(),
            result_count: 12,
            timestamp: Utc::now(),
            duration_secs: 34,
            params: serde_json::json!({"max_results": 20, "session_id": "abc123"}),
            persisted: false,
        };
        db.insert_search_history(&entry).unwrap();
        let history = db.search_history().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].result_count, 12);
        assert_eq!(history[0].params["max_results"], 20);
        assert!(history[0].persisted);
    }

    #[test]
    fn statistics_count_contact_fields() {
        let db = temp_db();
        let mut a = record("A", "cafes", 0);
        a.phone = "+1 555 0100".into();
        a.rating = "4.0".into();
        let mut b = record("B", "cafes", 1);
        b.website = "https://b.example".into();
        b.rating = "2.0".into();
        db.insert_batch(&[a, b]).unwrap();

        let stats = db.statistics().unwrap();
        assert_eq!(stats.total_businesses, 2);
        assert_eq!(stats.with_phone, 1);
        assert_eq!(stats.with_website, 1);
        assert_eq!(stats.by_search, vec![("cafes".to_string(), 2)]);
        assert_eq!(stats.average_rating, Some(3.0));
    }
}
