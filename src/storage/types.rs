use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Marker for fields the extractor could not populate.
///
/// Absent values are always this exact string, never an empty field or a
/// missing key; export and statistics test for it literally.
pub const UNAVAILABLE: &str = "unavailable";

fn unavailable() -> String {
    UNAVAILABLE.to_string()
}

/// One extracted business listing.
///
/// `persisted` tracks whether the database tier already holds this record.
/// It is never written to the `businesses` table itself, but it is retained
/// inside snapshot blobs so a resumed session does not re-insert rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusinessRecord {
    pub name: String,
    #[serde(default = "unavailable")]
    pub rating: String,
    #[serde(default = "unavailable")]
    pub review_count: String,
    #[serde(default = "unavailable")]
    pub category: String,
    #[serde(default = "unavailable")]
    pub address: String,
    #[serde(default = "unavailable")]
    pub phone: String,
    #[serde(default = "unavailable")]
    pub website: String,
    #[serde(default = "unavailable")]
    pub email: String,
    pub search_name: String,
    pub extracted_at: DateTime<Utc>,
    pub original_index: u32,
    pub source_url: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub persisted: bool,
}

impl BusinessRecord {
    /// Skeleton record with every extractable field set to the marker, the
    /// shape the producer starts from before filling in what it found.
    pub fn unavailable(name: &str, search_name: &str, original_index: u32) -> Self {
        Self {
            name: name.to_string(),
            rating: unavailable(),
            review_count: unavailable(),
            category: unavailable(),
            address: unavailable(),
            phone: unavailable(),
            website: unavailable(),
            email: unavailable(),
            search_name: search_name.to_string(),
            extracted_at: Utc::now(),
            original_index,
            source_url: String::new(),
            session_id: String::new(),
            persisted: false,
        }
    }

    /// Numeric rating, if one is present and well-formed.
    ///
    /// The marker, unparsable text and negative values all map to `None`;
    /// the database tier stores those as NULL.
    pub fn rating_value(&self) -> Option<f64> {
        if self.rating == UNAVAILABLE {
            return None;
        }
        match self.rating.trim().parse::<f64>() {
            Ok(v) if v >= 0.0 && v.is_finite() => Some(v),
            _ => None,
        }
    }
}

/// One completed search invocation, recorded once per search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHistoryEntry {
    pub search_name: String,
    pub source_url: String,
    pub result_count: u32,
    pub timestamp: DateTime<Utc>,
    pub duration_secs: u64,
    /// Open parameter bag; carries at least the requested max-results and
    /// the owning session id.
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub persisted: bool,
}

/// Full recoverable state for one session identifier.
///
/// Serialized all-or-nothing to each sink; the field names are the wire
/// schema of local snapshot files and database snapshot blobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub extracted_businesses: Vec<BusinessRecord>,
    pub search_history: Vec<SearchHistoryEntry>,
    pub timestamp: DateTime<Utc>,
    pub total_businesses: usize,
}

/// Distinguishes timer/count-triggered snapshots from manual or shutdown
/// ones. Retention purges only `Auto` rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotKind {
    Auto,
    Manual,
}

impl SnapshotKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotKind::Auto => "auto",
            SnapshotKind::Manual => "manual",
        }
    }
}

/// Point-in-time overview of a session, for CLI display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub total_businesses: usize,
    pub total_searches: usize,
    pub last_activity: Option<DateTime<Utc>>,
    pub searches: Vec<String>,
}

/// Aggregates over the database tier, for CLI display.
#[derive(Debug, Clone, Default)]
pub struct DatabaseStats {
    pub total_businesses: u64,
    pub by_search: Vec<(String, u64)>,
    pub with_phone: u64,
    pub with_website: u64,
    pub average_rating: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rating_value_parses_plain_numbers() {
        let mut rec = BusinessRecord::unavailable("Cafe", "cafes", 0);
        rec.rating = "4.5".into();
        assert_eq!(rec.rating_value(), Some(4.5));
    }

    #[test]
    fn rating_value_rejects_marker_garbage_and_negatives() {
        let mut rec = BusinessRecord::unavailable("Cafe", "cafes", 0);
        assert_eq!(rec.rating_value(), None);
        rec.rating = "4,5 stars".into();
        assert_eq!(rec.rating_value(), None);
        rec.rating = "-1.0".into();
        assert_eq!(rec.rating_value(), None);
    }

    #[test]
    fn snapshot_roundtrips_through_json() {
        let rec = BusinessRecord::unavailable("Cafe", "cafes", 0);
        let snap = SessionSnapshot {
            session_id: "abc123".into(),
            extracted_businesses: vec![rec],
            search_history: vec![],
            timestamp: Utc::now(),
            total_businesses: 1,
        };
        let json = serde_json::to_string(&snap).unwrap();
        let back: SessionSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back.session_id, "abc123");
        assert_eq!(back.total_businesses, 1);
        assert_eq!(back.extracted_businesses[0].rating, UNAVAILABLE);
    }
}
