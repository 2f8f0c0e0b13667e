use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::Utc;
use log::{debug, error, info};

use crate::error_handling::types::StorageError;
use crate::storage::types::{BusinessRecord, SessionSnapshot, UNAVAILABLE};

/// Filename timestamp format shared by snapshots and CSV backups.
const FILE_TS_FORMAT: &str = "%Y%m%d_%H%M%S";

const CSV_HEADER: &str = "name,rating,review_count,category,address,phone,website,email,\
search_name,extracted_at,original_index,source_url,session_id";

/// Filesystem tier: one JSON snapshot file per flush plus CSV backups,
/// all under a single data directory. Files for the same session share a
/// `session_<id>_` prefix; uniqueness comes from the timestamp suffix, so
/// no cross-process locking is needed.
pub struct FileStorage {
    data_dir: PathBuf,
}

impl FileStorage {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Result<Self, StorageError> {
        let data_dir = data_dir.as_ref().to_path_buf();
        fs::create_dir_all(&data_dir).map_err(|e| {
            error!("Failed to create data dir {}: {}", data_dir.display(), e);
            StorageError::WriteFailed
        })?;
        info!("FileStorage initialized at {}", data_dir.display());
        Ok(Self { data_dir })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn snapshot_prefix(session_id: &str) -> String {
        format!("session_{}_", session_id)
    }

    /// Writes the snapshot to a new `session_<id>_<ts>.json` file.
    ///
    /// The snapshot is serialized fully in memory and lands via a temp file
    /// and rename, so a failure partway never leaves a file that claims
    /// success. Prior files for the same session are kept.
    pub fn write_snapshot(&self, snapshot: &SessionSnapshot) -> Result<PathBuf, StorageError> {
        let name = format!(
            "session_{}_{}.json",
            snapshot.session_id,
            Utc::now().format(FILE_TS_FORMAT)
        );
        let path = self.data_dir.join(&name);
        let body = serde_json::to_vec_pretty(snapshot).map_err(|e| {
            error!("Failed to serialize snapshot for {}: {}", snapshot.session_id, e);
            StorageError::Serialization
        })?;
        write_atomic(&path, &body)?;
        info!(
            "Saved snapshot for session {} ({} businesses) to {}",
            snapshot.session_id,
            snapshot.total_businesses,
            path.display()
        );
        Ok(path)
    }

    /// Loads the most recent snapshot for the session, or `None` if the
    /// session has never been saved here.
    ///
    /// "Most recent" is decided by file creation time (modified time where
    /// the filesystem does not report creation), not by the timestamp in the
    /// filename; the two are expected to agree but the filesystem wins.
    pub fn read_latest_snapshot(
        &self,
        session_id: &str,
    ) -> Result<Option<SessionSnapshot>, StorageError> {
        let prefix = Self::snapshot_prefix(session_id);
        let mut latest: Option<(SystemTime, PathBuf)> = None;
        let entries = fs::read_dir(&self.data_dir).map_err(|e| {
            error!("Failed to read data dir {}: {}", self.data_dir.display(), e);
            StorageError::ReadFailed
        })?;
        for entry in entries {
            let entry = entry.map_err(|e| {
                error!("Dir entry error: {}", e);
                StorageError::ReadFailed
            })?;
            let path = entry.path();
            let is_snapshot = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(&prefix) && n.ends_with(".json"))
                .unwrap_or(false);
            if !is_snapshot {
                continue;
            }
            let meta = entry.metadata().map_err(|e| {
                error!("Metadata error for {}: {}", path.display(), e);
                StorageError::ReadFailed
            })?;
            let stamp = meta.created().or_else(|_| meta.modified()).map_err(|e| {
                error!("No usable file time for {}: {}", path.display(), e);
                StorageError::ReadFailed
            })?;
            if latest.as_ref().map(|(t, _)| stamp >= *t).unwrap_or(true) {
                latest = Some((stamp, path));
            }
        }
        let Some((_, path)) = latest else {
            debug!("No snapshot files for session {}", session_id);
            return Ok(None);
        };
        let body = fs::read(&path).map_err(|e| {
            error!("Failed to read snapshot {}: {}", path.display(), e);
            StorageError::ReadFailed
        })?;
        let snapshot = serde_json::from_slice(&body).map_err(|e| {
            error!("Failed to parse snapshot {}: {}", path.display(), e);
            StorageError::ReadFailed
        })?;
        info!("Loaded snapshot for session {} from {}", session_id, path.display());
        Ok(Some(snapshot))
    }

    /// Writes the flat record list as CSV for external inspection.
    ///
    /// The default filename embeds a timestamp; auto-save passes an
    /// `autosave_<id>_<ts>.csv` name instead.
    pub fn write_tabular_backup(
        &self,
        records: &[BusinessRecord],
        filename: Option<&str>,
    ) -> Result<PathBuf, StorageError> {
        let name = match filename {
            Some(n) => n.to_string(),
            None => format!("backup_businesses_{}.csv", Utc::now().format(FILE_TS_FORMAT)),
        };
        let path = self.data_dir.join(name);
        write_csv(&path, records)?;
        info!("Saved CSV backup of {} record(s) to {}", records.len(), path.display());
        Ok(path)
    }
}

/// Writes `body` to `path` through a `.tmp` sibling and a rename, so readers
/// never observe a partially written file.
fn write_atomic(path: &Path, body: &[u8]) -> Result<(), StorageError> {
    let tmp = path.with_extension("tmp");
    let mut f = File::create(&tmp).map_err(|e| {
        error!("Failed to create {}: {}", tmp.display(), e);
        StorageError::WriteFailed
    })?;
    if let Err(e) = f.write_all(body).and_then(|_| f.sync_all()) {
        error!("Failed to write {}: {}", tmp.display(), e);
        let _ = fs::remove_file(&tmp);
        return Err(StorageError::WriteFailed);
    }
    drop(f);
    fs::rename(&tmp, path).map_err(|e| {
        error!("Failed to rename {} to {}: {}", tmp.display(), path.display(), e);
        let _ = fs::remove_file(&tmp);
        StorageError::WriteFailed
    })
}

/// Writes records as a delimited table to an arbitrary path. Used by both
/// the data-dir backups and session export.
pub fn write_csv(path: &Path, records: &[BusinessRecord]) -> Result<(), StorageError> {
    let mut body = String::new();
    body.push_str(CSV_HEADER);
    body.push('\n');
    for rec in records {
        let fields = [
            rec.name.as_str(),
            rec.rating.as_str(),
            rec.review_count.as_str(),
            rec.category.as_str(),
            rec.address.as_str(),
            rec.phone.as_str(),
            rec.website.as_str(),
            rec.email.as_str(),
            rec.search_name.as_str(),
        ];
        let mut line: Vec<String> = fields.iter().map(|f| csv_field(f)).collect();
        line.push(rec.extracted_at.to_rfc3339());
        line.push(rec.original_index.to_string());
        line.push(csv_field(&rec.source_url));
        line.push(csv_field(&rec.session_id));
        body.push_str(&line.join(","));
        body.push('\n');
    }
    write_atomic(path, body.as_bytes())
}

fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Share of records carrying a real value (not the marker) per contact field.
/// Mirrors the extraction summary the CLI prints after an export.
pub fn availability_counts(records: &[BusinessRecord]) -> Vec<(&'static str, usize)> {
    let count = |f: fn(&BusinessRecord) -> &str| {
        records.iter().filter(|r| f(r) != UNAVAILABLE).count()
    };
    vec![
        ("rating", count(|r| &r.rating)),
        ("category", count(|r| &r.category)),
        ("address", count(|r| &r.address)),
        ("phone", count(|r| &r.phone)),
        ("website", count(|r| &r.website)),
        ("email", count(|r| &r.email)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn record(name: &str, index: u32) -> BusinessRecord {
        let mut rec = BusinessRecord::unavailable(name, "cafes", index);
        rec.session_id = "abc123".into();
        rec
    }

    fn snapshot(session_id: &str, records: Vec<BusinessRecord>) -> SessionSnapshot {
        let total = records.len();
        SessionSnapshot {
            session_id: session_id.into(),
            extracted_businesses: records,
            search_history: vec![],
            timestamp: Utc::now(),
            total_businesses: total,
        }
    }

    #[test]
    fn snapshot_write_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();
        let mut rec = record("Cafe Uno", 0);
        rec.rating = "4.5".into();
        let path = storage.write_snapshot(&snapshot("abc123", vec![rec])).unwrap();
        assert!(path.exists());
        assert!(path.file_name().unwrap().to_str().unwrap().starts_with("session_abc123_"));

        let loaded = storage.read_latest_snapshot("abc123").unwrap().unwrap();
        assert_eq!(loaded.session_id, "abc123");
        assert_eq!(loaded.total_businesses, 1);
        assert_eq!(loaded.extracted_businesses[0].name, "Cafe Uno");
        assert_eq!(loaded.extracted_businesses[0].rating, "4.5");
    }

    #[test]
    fn latest_snapshot_wins_and_other_sessions_are_ignored() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();
        storage.write_snapshot(&snapshot("abc123", vec![record("Old", 0)])).unwrap();
        storage.write_snapshot(&snapshot("other", vec![record("Elsewhere", 0)])).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(30));
        storage
            .write_snapshot(&snapshot("abc123", vec![record("Old", 0), record("New", 1)]))
            .unwrap();

        let loaded = storage.read_latest_snapshot("abc123").unwrap().unwrap();
        assert_eq!(loaded.total_businesses, 2);
        assert_eq!(loaded.extracted_businesses[1].name, "New");
    }

    #[test]
    fn missing_session_reads_as_none() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();
        assert!(storage.read_latest_snapshot("abc123").unwrap().is_none());
    }

    #[test]
    fn snapshot_preserves_insertion_order() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();
        let records: Vec<_> = (0..8).map(|i| record(&format!("biz-{}", i), i)).collect();
        storage.write_snapshot(&snapshot("ord", records)).unwrap();
        let loaded = storage.read_latest_snapshot("ord").unwrap().unwrap();
        let names: Vec<_> = loaded.extracted_businesses.iter().map(|r| r.name.clone()).collect();
        assert_eq!(names, (0..8).map(|i| format!("biz-{}", i)).collect::<Vec<_>>());
    }

    #[test]
    fn csv_backup_quotes_awkward_fields() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();
        let mut rec = record("Joe's \"Best\" Diner", 0);
        rec.address = "1 Main St, Springfield".into();
        let path = storage.write_tabular_backup(&[rec], Some("out.csv")).unwrap();
        let body = fs::read_to_string(path).unwrap();
        let mut lines = body.lines();
        assert_eq!(lines.next().unwrap(), CSV_HEADER);
        let row = lines.next().unwrap();
        assert!(row.starts_with("\"Joe's \"\"Best\"\" Diner\","));
        assert!(row.contains("\"1 Main St, Springfield\""));
    }

    #[test]
    fn default_backup_name_embeds_timestamp() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();
        let path = storage.write_tabular_backup(&[record("A", 0)], None).unwrap();
        let name = path.file_name().unwrap().to_str().unwrap().to_string();
        assert!(name.starts_with("backup_businesses_"));
        assert!(name.ends_with(".csv"));
    }

    #[test]
    fn availability_counts_skip_marker_values() {
        let mut a = record("A", 0);
        a.phone = "+1 555 0100".into();
        let b = record("B", 1);
        let counts = availability_counts(&[a, b]);
        let phone = counts.iter().find(|(f, _)| *f == "phone").unwrap();
        assert_eq!(phone.1, 1);
    }
}
