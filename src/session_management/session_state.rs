use chrono::Utc;

use crate::storage::types::{
    BusinessRecord, SearchHistoryEntry, SessionSnapshot, SessionSummary,
};

/// In-memory working set for one session identifier.
///
/// Owns the authoritative record and history lists; the storage tiers hold
/// independent serialized copies with no back-reference. All operations are
/// pure in-memory mutations and cannot fail; callers serialize access with a
/// lock so that append, unpersisted reads and mark-persisted stay atomic
/// with respect to each other.
pub struct SessionState {
    session_id: String,
    businesses: Vec<BusinessRecord>,
    history: Vec<SearchHistoryEntry>,
}

impl SessionState {
    pub fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            businesses: Vec::new(),
            history: Vec::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn businesses(&self) -> &[BusinessRecord] {
        &self.businesses
    }

    pub fn history(&self) -> &[SearchHistoryEntry] {
        &self.history
    }

    pub fn is_empty(&self) -> bool {
        self.businesses.is_empty() && self.history.is_empty()
    }

    pub fn append_business(&mut self, mut record: BusinessRecord) {
        if record.session_id.is_empty() {
            record.session_id = self.session_id.clone();
        }
        self.businesses.push(record);
    }

    pub fn append_search(&mut self, entry: SearchHistoryEntry) {
        self.history.push(entry);
    }

    /// Records not yet confirmed in the database tier, as `(index, clone)`
    /// pairs in insertion order. The indices feed `mark_businesses_persisted`
    /// after the insert reports how many of them landed.
    pub fn unpersisted_businesses(&self) -> Vec<(usize, BusinessRecord)> {
        self.businesses
            .iter()
            .enumerate()
            .filter(|(_, r)| !r.persisted)
            .map(|(i, r)| (i, r.clone()))
            .collect()
    }

    pub fn unpersisted_history(&self) -> Vec<(usize, SearchHistoryEntry)> {
        self.history
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.persisted)
            .map(|(i, e)| (i, e.clone()))
            .collect()
    }

    /// Flags the given records as present in the database tier. Idempotent;
    /// indices that are already flagged or out of range are ignored.
    pub fn mark_businesses_persisted(&mut self, indices: &[usize]) {
        for &i in indices {
            if let Some(rec) = self.businesses.get_mut(i) {
                rec.persisted = true;
            }
        }
    }

    pub fn mark_history_persisted(&mut self, indices: &[usize]) {
        for &i in indices {
            if let Some(entry) = self.history.get_mut(i) {
                entry.persisted = true;
            }
        }
    }

    /// Self-consistent copy of the full state, stamped now.
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id.clone(),
            extracted_businesses: self.businesses.clone(),
            search_history: self.history.clone(),
            timestamp: Utc::now(),
            total_businesses: self.businesses.len(),
        }
    }

    /// Replaces the working set with a recovered snapshot.
    pub fn hydrate(&mut self, snapshot: SessionSnapshot) {
        self.session_id = snapshot.session_id;
        self.businesses = snapshot.extracted_businesses;
        self.history = snapshot.search_history;
    }

    /// Empties the working set. Durable snapshots are untouched; history is
    /// append-only on the storage side.
    pub fn clear(&mut self) {
        self.businesses.clear();
        self.history.clear();
    }

    pub fn summary(&self) -> SessionSummary {
        let last_activity = self
            .businesses
            .iter()
            .map(|r| r.extracted_at)
            .chain(self.history.iter().map(|e| e.timestamp))
            .max();
        SessionSummary {
            session_id: self.session_id.clone(),
            total_businesses: self.businesses.len(),
            total_searches: self.history.len(),
            last_activity,
            searches: self.history.iter().map(|e| e.search_name.clone()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, index: u32) -> BusinessRecord {
        BusinessRecord::unavailable(name, "cafes", index)
    }

    #[test]
    fn append_stamps_session_id() {
        let mut state = SessionState::new("abc123");
        state.append_business(record("Cafe", 0));
        assert_eq!(state.businesses()[0].session_id, "abc123");
    }

    #[test]
    fn unpersisted_keeps_insertion_order() {
        let mut state = SessionState::new("abc123");
        for i in 0..4 {
            state.append_business(record(&format!("biz-{}", i), i));
        }
        state.mark_businesses_persisted(&[1]);
        let pending = state.unpersisted_businesses();
        let names: Vec<_> = pending.iter().map(|(_, r)| r.name.clone()).collect();
        assert_eq!(names, vec!["biz-0", "biz-2", "biz-3"]);
        assert_eq!(pending[0].0, 0);
        assert_eq!(pending[1].0, 2);
    }

    #[test]
    fn mark_persisted_is_idempotent() {
        let mut state = SessionState::new("abc123");
        state.append_business(record("A", 0));
        state.append_business(record("B", 1));
        state.mark_businesses_persisted(&[0]);
        let once = state.unpersisted_businesses();
        state.mark_businesses_persisted(&[0]);
        let twice = state.unpersisted_businesses();
        assert_eq!(once.len(), twice.len());
        assert_eq!(once[0].0, twice[0].0);
        // Out-of-range indices are ignored
        state.mark_businesses_persisted(&[99]);
        assert_eq!(state.unpersisted_businesses().len(), 1);
    }

    #[test]
    fn hydrate_replaces_contents() {
        let mut state = SessionState::new("abc123");
        state.append_business(record("stale", 0));
        let snapshot = SessionSnapshot {
            session_id: "other".into(),
            extracted_businesses: vec![record("fresh", 0)],
            search_history: vec![],
            timestamp: Utc::now(),
            total_businesses: 1,
        };
        state.hydrate(snapshot);
        assert_eq!(state.session_id(), "other");
        assert_eq!(state.businesses().len(), 1);
        assert_eq!(state.businesses()[0].name, "fresh");
    }

    #[test]
    fn clear_empties_working_set() {
        let mut state = SessionState::new("abc123");
        state.append_business(record("A", 0));
        state.clear();
        assert!(state.is_empty());
        assert_eq!(state.session_id(), "abc123");
    }

    #[test]
    fn summary_lists_search_names() {
        let mut state = SessionState::new("abc123");
        state.append_search(SearchHistoryEntry {
            search_name: "cafes".into(),
            source_url: "https://example.test".into(),
            result_count: 3,
            timestamp: Utc::now(),
            duration_secs: 10,
            params: serde_json::Value::Null,
            persisted: false,
        });
        let summary = state.summary();
        assert_eq!(summary.total_searches, 1);
        assert_eq!(summary.searches, vec!["cafes"]);
        assert!(summary.last_activity.is_some());
    }
}
