//! Durable reminder storage: one JSON file, single-writer, atomic rename.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use murmur_schema::ScheduleError;
use serde::{Deserialize, Serialize};

pub const FILE_VERSION: u32 = 1;

const REQUIRED_FIELDS: &[&str] = &[
    "id",
    "content",
    "fire_at",
    "channel_ref",
    "user_ref",
    "created_at",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub id: String,
    pub content: String,
    pub fire_at: DateTime<Utc>,
    pub channel_ref: String,
    pub user_ref: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FileEnvelope {
    version: u32,
    events: Vec<serde_json::Value>,
}

pub struct ReminderStore {
    path: PathBuf,
}

impl ReminderStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load all persisted events. Entries carrying unknown fields are kept
    /// (and logged); entries missing required fields are rejected.
    pub fn load(&self) -> Result<Vec<StoredEvent>, ScheduleError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let content = std::fs::read_to_string(&self.path)
            .map_err(|e| ScheduleError::Persistence(format!("read {}: {e}", self.path.display())))?;
        let envelope: FileEnvelope = serde_json::from_str(&content)
            .map_err(|e| ScheduleError::Persistence(format!("parse {}: {e}", self.path.display())))?;

        if envelope.version != FILE_VERSION {
            return Err(ScheduleError::Persistence(format!(
                "unsupported reminder file version {}",
                envelope.version
            )));
        }

        let mut events = Vec::with_capacity(envelope.events.len());
        for raw in envelope.events {
            match decode_event(&raw) {
                Ok(event) => events.push(event),
                Err(e) => tracing::error!("rejecting persisted reminder entry: {e}"),
            }
        }
        Ok(events)
    }

    /// Write all events via a temp file and an atomic rename.
    pub fn persist(&self, events: &[StoredEvent]) -> Result<(), ScheduleError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    ScheduleError::Persistence(format!("mkdir {}: {e}", parent.display()))
                })?;
            }
        }

        let envelope = FileEnvelope {
            version: FILE_VERSION,
            events: events
                .iter()
                .map(|e| serde_json::to_value(e).unwrap_or(serde_json::Value::Null))
                .collect(),
        };
        let json = serde_json::to_string_pretty(&envelope)
            .map_err(|e| ScheduleError::Persistence(format!("encode events: {e}")))?;

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .map_err(|e| ScheduleError::Persistence(format!("write {}: {e}", tmp.display())))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| {
            ScheduleError::Persistence(format!("rename {} -> {}: {e}", tmp.display(), self.path.display()))
        })?;
        Ok(())
    }
}

fn decode_event(raw: &serde_json::Value) -> Result<StoredEvent, ScheduleError> {
    let object = raw
        .as_object()
        .ok_or_else(|| ScheduleError::InvalidEvent("entry is not an object".into()))?;

    for field in REQUIRED_FIELDS {
        if !object.contains_key(*field) {
            return Err(ScheduleError::InvalidEvent(format!(
                "missing required field '{field}'"
            )));
        }
    }

    let unknown: Vec<&str> = object
        .keys()
        .map(|k| k.as_str())
        .filter(|k| !REQUIRED_FIELDS.contains(k))
        .collect();
    if !unknown.is_empty() {
        tracing::warn!(fields = ?unknown, "reminder entry carries unknown fields");
    }

    serde_json::from_value(raw.clone())
        .map_err(|e| ScheduleError::InvalidEvent(format!("malformed entry: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: &str) -> StoredEvent {
        StoredEvent {
            id: id.to_string(),
            content: "stretch".into(),
            fire_at: Utc::now(),
            channel_ref: "chan".into(),
            user_ref: "user".into(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn persist_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReminderStore::new(dir.path().join("events.json"));
        store.persist(&[event("000001"), event("000002")]).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id, "000001");
        // Temp file is gone after the rename.
        assert!(!dir.path().join("events.json.tmp").exists());
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReminderStore::new(dir.path().join("events.json"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn unknown_fields_are_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.json");
        std::fs::write(
            &path,
            serde_json::json!({
                "version": 1,
                "events": [{
                    "id": "000001",
                    "content": "hi",
                    "fire_at": "2031-01-01T00:00:00Z",
                    "channel_ref": "c",
                    "user_ref": "u",
                    "created_at": "2030-12-31T00:00:00Z",
                    "future_field": {"nested": true}
                }]
            })
            .to_string(),
        )
        .unwrap();

        let loaded = ReminderStore::new(path).load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].content, "hi");
    }

    #[test]
    fn missing_required_field_rejects_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.json");
        std::fs::write(
            &path,
            serde_json::json!({
                "version": 1,
                "events": [
                    {"id": "000001", "content": "no fire_at", "channel_ref": "c",
                     "user_ref": "u", "created_at": "2030-12-31T00:00:00Z"},
                    {"id": "000002", "content": "ok", "fire_at": "2031-01-01T00:00:00Z",
                     "channel_ref": "c", "user_ref": "u", "created_at": "2030-12-31T00:00:00Z"}
                ]
            })
            .to_string(),
        )
        .unwrap();

        let loaded = ReminderStore::new(path).load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "000002");
    }

    #[test]
    fn wrong_version_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.json");
        std::fs::write(&path, r#"{"version": 99, "events": []}"#).unwrap();
        assert!(ReminderStore::new(path).load().is_err());
    }
}
