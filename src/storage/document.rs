use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Represents a JSON document in a local database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Document ID, unique within its database
    #[serde(rename = "_id")]
    pub id: String,

    /// Revision for optimistic concurrency control (`None` until first saved)
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,

    /// Tombstone marker
    #[serde(rename = "_deleted", default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,

    /// Last update timestamp
    #[serde(rename = "_updated_at", default = "Utc::now")]
    pub updated_at: DateTime<Utc>,

    /// The actual document fields
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

const SYSTEM_FIELDS: [&str; 4] = ["_id", "_rev", "_deleted", "_updated_at"];

impl Document {
    /// Create a new, unsaved document with a time-ordered id
    pub fn new(data: Value) -> Self {
        let id = Uuid::new_v7(uuid::Timestamp::now(uuid::NoContext)).to_string();
        Self::with_id(id, data)
    }

    /// Create a new, unsaved document with a specific id
    pub fn with_id(id: impl Into<String>, data: Value) -> Self {
        let mut fields = match data {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        // Remove system fields to prevent duplication
        for field in SYSTEM_FIELDS {
            fields.remove(field);
        }

        Self {
            id: id.into(),
            rev: None,
            deleted: false,
            updated_at: Utc::now(),
            data: fields,
        }
    }

    /// Get the current revision
    pub fn revision(&self) -> Option<&str> {
        self.rev.as_deref()
    }

    /// Get a field from the document
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.data.get(field)
    }

    /// Get a string field, treating non-strings as absent
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.data.get(field).and_then(Value::as_str)
    }

    /// Get a string field, treating empty strings as absent
    pub fn get_non_empty(&self, field: &str) -> Option<&str> {
        self.get_str(field).filter(|s| !s.is_empty())
    }

    pub fn set(&mut self, field: &str, value: impl Into<Value>) {
        if !SYSTEM_FIELDS.contains(&field) {
            self.data.insert(field.to_string(), value.into());
        }
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.data.remove(field)
    }

    /// The `type` field used to tell entity kinds apart
    pub fn doc_type(&self) -> Option<&str> {
        self.get_str("type")
    }

    /// Convert to JSON value including metadata
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Generation number of a `<generation>-<suffix>` revision
pub fn revision_generation(rev: &str) -> u64 {
    rev.split_once('-')
        .and_then(|(generation, _)| generation.parse().ok())
        .unwrap_or(0)
}

/// Revision following `current`
pub fn next_revision(current: Option<&str>) -> String {
    let generation = current.map(revision_generation).unwrap_or(0) + 1;
    format!("{}-{}", generation, Uuid::new_v4().simple())
}

/// Deterministic winner rule shared by every replica: higher generation wins,
/// equal generations fall back to comparing the revision strings.
pub fn revision_wins(candidate: &str, current: &str) -> bool {
    (revision_generation(candidate), candidate) > (revision_generation(current), current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_document_strips_system_fields() {
        let doc = Document::new(json!({"_id": "x", "_rev": "1-a", "name": "inbox"}));
        assert_ne!(doc.id, "x");
        assert!(doc.rev.is_none());
        assert_eq!(doc.get_str("name"), Some("inbox"));
        assert!(doc.get("_rev").is_none());
    }

    #[test]
    fn test_new_ids_are_time_ordered() {
        let first = Document::new(json!({}));
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = Document::new(json!({}));
        assert!(first.id < second.id);
    }

    #[test]
    fn test_set_ignores_system_fields() {
        let mut doc = Document::with_id("a", json!({}));
        doc.set("_rev", "9-zzz");
        doc.set("state", "ready");
        assert!(doc.rev.is_none());
        assert_eq!(doc.get_str("state"), Some("ready"));
    }

    #[test]
    fn test_serde_layout() {
        let mut doc = Document::with_id("abc", json!({"type": "channel"}));
        doc.rev = Some("2-ff".to_string());
        let value = doc.to_value();
        assert_eq!(value["_id"], "abc");
        assert_eq!(value["_rev"], "2-ff");
        assert_eq!(value["type"], "channel");
        assert!(value.get("_deleted").is_none());

        let back: Document = serde_json::from_value(value).unwrap();
        assert_eq!(back, doc);
    }

    #[test]
    fn test_revision_ordering() {
        assert_eq!(revision_generation("12-abc"), 12);
        assert_eq!(revision_generation("garbage"), 0);
        assert!(next_revision(None).starts_with("1-"));
        assert!(next_revision(Some("4-abc")).starts_with("5-"));

        assert!(revision_wins("3-aaa", "2-zzz"));
        assert!(!revision_wins("2-zzz", "3-aaa"));
        assert!(revision_wins("2-bbb", "2-aaa"));
        assert!(!revision_wins("2-aaa", "2-aaa"));
    }
}
