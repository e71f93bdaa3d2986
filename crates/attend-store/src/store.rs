use crate::{queries, schema};
use attend_core::{
    AttendanceEvent, AttendanceSink, GalleryEntry, GalleryStore, LogId, SinkError, StoreError,
};
use rusqlite::{Connection, ErrorCode};
use std::path::Path;

fn backend(e: rusqlite::Error) -> StoreError {
    StoreError::Backend(Box::new(e))
}

/// SQLite-backed gallery store and attendance log.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (creating if needed) a database file and apply the schema.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Unavailable(format!("{}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path)
            .map_err(|e| StoreError::Unavailable(format!("{}: {e}", path.display())))?;
        let mode = schema::enable_wal(&conn).map_err(backend)?;
        schema::init(&conn).map_err(backend)?;
        tracing::info!(path = %path.display(), journal = %mode, "store opened");
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(backend)?;
        schema::init(&conn).map_err(backend)?;
        Ok(Self { conn })
    }

    pub fn ensure_camera(
        &self,
        camera_id: &str,
        label: Option<&str>,
        location: Option<&str>,
    ) -> Result<(), StoreError> {
        queries::ensure_camera(&self.conn, camera_id, label, location).map_err(backend)
    }

    /// Enable or disable an identity without touching its references.
    /// Inactive identities are not loaded into the gallery.
    pub fn set_active(&self, identity_id: &str, active: bool) -> Result<bool, StoreError> {
        queries::set_active(&self.conn, identity_id, active).map_err(backend)
    }
}

impl GalleryStore for SqliteStore {
    fn load_all(&self) -> Result<Vec<GalleryEntry>, StoreError> {
        queries::load_active_entries(&self.conn).map_err(backend)
    }

    fn upsert(&self, entry: &GalleryEntry) -> Result<(), StoreError> {
        if entry.identity_id.trim().is_empty() {
            return Err(StoreError::InvalidRecord("empty identity id".into()));
        }
        if entry.embedding.values.is_empty() {
            return Err(StoreError::InvalidRecord("empty embedding".into()));
        }
        let tx = self.conn.unchecked_transaction().map_err(backend)?;
        queries::upsert_identity(&tx, &entry.identity_id, &entry.display_name, entry.code.as_deref())
            .map_err(backend)?;
        queries::upsert_reference(&tx, entry).map_err(backend)?;
        tx.commit().map_err(backend)?;
        tracing::info!(
            identity = %entry.identity_id,
            label = %entry.label,
            dim = entry.embedding.dim(),
            "reference stored"
        );
        Ok(())
    }

    fn delete(&self, identity_id: &str) -> Result<usize, StoreError> {
        let tx = self.conn.unchecked_transaction().map_err(backend)?;
        let removed = queries::delete_identity(&tx, identity_id).map_err(backend)?;
        tx.commit().map_err(backend)?;
        tracing::info!(identity = %identity_id, removed, "identity deleted");
        Ok(removed)
    }
}

impl AttendanceSink for SqliteStore {
    fn append(&self, event: &AttendanceEvent) -> Result<LogId, SinkError> {
        queries::insert_log(&self.conn, event).map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, msg) if err.code == ErrorCode::ConstraintViolation => {
                SinkError::Rejected(msg.unwrap_or_else(|| err.to_string()))
            }
            other => SinkError::Unavailable(other.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queries::LogFilter;
    use attend_core::{Embedding, EventKind};

    fn entry(id: &str, label: &str, values: Vec<f32>) -> GalleryEntry {
        GalleryEntry {
            identity_id: id.into(),
            label: label.into(),
            display_name: format!("{id} name"),
            code: Some(format!("E-{id}")),
            embedding: Embedding {
                values,
                model_version: Some("w600k_r50".into()),
            },
        }
    }

    fn event(id: &str, at: &str) -> AttendanceEvent {
        AttendanceEvent::new(
            id,
            Some(id.to_uppercase()),
            EventKind::CheckIn,
            "CAM_01",
            at.parse().unwrap(),
            0.9,
        )
        .unwrap()
    }

    #[test]
    fn test_upsert_and_load_roundtrip() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.upsert(&entry("bob", "default", vec![0.0, 1.0])).unwrap();
        store.upsert(&entry("alice", "glasses", vec![0.5, 0.5])).unwrap();
        store.upsert(&entry("alice", "default", vec![1.0, 0.0])).unwrap();

        let loaded = store.load_all().unwrap();
        let keys: Vec<(&str, &str)> = loaded
            .iter()
            .map(|e| (e.identity_id.as_str(), e.label.as_str()))
            .collect();
        assert_eq!(keys, vec![("alice", "default"), ("alice", "glasses"), ("bob", "default")]);
        assert_eq!(loaded[0].embedding.values, vec![1.0, 0.0]);
        assert_eq!(loaded[0].code.as_deref(), Some("E-alice"));
        assert_eq!(loaded[0].embedding.model_version.as_deref(), Some("w600k_r50"));
    }

    #[test]
    fn test_upsert_replaces_same_label() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.upsert(&entry("alice", "default", vec![1.0, 0.0])).unwrap();
        store.upsert(&entry("alice", "default", vec![0.0, 1.0, 0.0])).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].embedding.values, vec![0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_upsert_rejects_invalid() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(matches!(
            store.upsert(&entry(" ", "default", vec![1.0])),
            Err(StoreError::InvalidRecord(_))
        ));
        assert!(matches!(
            store.upsert(&entry("alice", "default", vec![])),
            Err(StoreError::InvalidRecord(_))
        ));
    }

    #[test]
    fn test_delete_removes_all_references() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.upsert(&entry("alice", "default", vec![1.0])).unwrap();
        store.upsert(&entry("alice", "glasses", vec![1.0])).unwrap();
        store.upsert(&entry("bob", "default", vec![1.0])).unwrap();

        assert_eq!(store.delete("alice").unwrap(), 2);
        assert_eq!(store.delete("alice").unwrap(), 0);
        let ids: Vec<String> = queries::list_identities(&store.conn)
            .unwrap()
            .into_iter()
            .map(|r| r.identity_id)
            .collect();
        assert_eq!(ids, vec!["bob".to_string()]);
    }

    #[test]
    fn test_inactive_identities_not_loaded() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.upsert(&entry("alice", "default", vec![1.0])).unwrap();
        store.upsert(&entry("bob", "default", vec![1.0])).unwrap();

        assert!(store.set_active("alice", false).unwrap());
        assert!(!store.set_active("nobody", false).unwrap());

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].identity_id, "bob");

        let listed = queries::list_identities(&store.conn).unwrap();
        assert_eq!(listed.len(), 2);
        assert!(!listed[0].is_active);
        assert_eq!(listed[0].references, 1);
    }

    #[test]
    fn test_corrupt_row_skipped() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.upsert(&entry("alice", "default", vec![1.0, 2.0])).unwrap();
        store.upsert(&entry("bob", "default", vec![1.0, 2.0])).unwrap();
        store
            .conn
            .execute("UPDATE face_embeddings SET dim = 3 WHERE identity_id = 'alice'", [])
            .unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].identity_id, "bob");
    }

    #[test]
    fn test_cameras_are_registered_once() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.ensure_camera("CAM_02", None, None).unwrap();
        store.ensure_camera("CAM_01", Some("Lobby"), None).unwrap();
        store.ensure_camera("CAM_01", None, Some("Floor 1")).unwrap();

        let cameras = queries::list_cameras(&store.conn).unwrap();
        assert_eq!(cameras.len(), 2);
        assert_eq!(cameras[0].camera_id, "CAM_01");
        assert_eq!(cameras[0].label.as_deref(), Some("Lobby"));
        assert_eq!(cameras[0].location.as_deref(), Some("Floor 1"));
        assert!(cameras[0].is_active);
    }

    #[test]
    fn test_append_is_ordered_and_queryable() {
        let store = SqliteStore::open_in_memory().unwrap();

        let a = store.append(&event("alice", "2026-03-01T08:00:00Z")).unwrap();
        let b = store.append(&event("bob", "2026-03-01T09:00:00Z")).unwrap();
        let c = store.append(&event("carol", "2026-03-02T08:00:00Z")).unwrap();
        assert!(a < b && b < c);

        let recent = queries::recent_logs(&store.conn, 2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].identity_id, "carol");
        assert_eq!(recent[1].identity_id, "bob");
        assert_eq!(recent[0].event_type, "CHECK_IN");
        assert_eq!(recent[0].display_name.as_deref(), Some("CAROL"));
    }

    #[test]
    fn test_log_filters_combine() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.append(&event("alice", "2026-03-01T08:00:00Z")).unwrap();
        store.append(&event("bob", "2026-03-01T09:00:00Z")).unwrap();
        store.append(&event("alice", "2026-03-02T08:00:00Z")).unwrap();
        let checkout = AttendanceEvent::new(
            "alice",
            None,
            EventKind::CheckOut,
            "CAM_02",
            "2026-03-01T17:00:00Z".parse().unwrap(),
            0.7,
        )
        .unwrap();
        store.append(&checkout).unwrap();

        let query = |filter: LogFilter| -> Vec<(String, String)> {
            queries::query_logs(&store.conn, &filter)
                .unwrap()
                .into_iter()
                .map(|r| (r.identity_id, r.event_time))
                .collect()
        };

        let day = query(LogFilter {
            since: Some("2026-03-01T00:00:00Z".parse().unwrap()),
            until: Some("2026-03-02T00:00:00Z".parse().unwrap()),
            limit: 100,
            ..LogFilter::default()
        });
        let names: Vec<&str> = day.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(names, vec!["alice", "bob", "alice"]);
        assert_eq!(day[0].1, "2026-03-01T17:00:00.000Z");

        let alice_in = query(LogFilter {
            identity_id: Some("alice".into()),
            event_type: Some("CHECK_IN".into()),
            limit: 100,
            ..LogFilter::default()
        });
        assert_eq!(alice_in.len(), 2);

        let cam2 = query(LogFilter {
            camera_id: Some("CAM_02".into()),
            limit: 100,
            ..LogFilter::default()
        });
        assert_eq!(cam2.len(), 1);

        let newest = query(LogFilter {
            limit: 1,
            ..LogFilter::default()
        });
        assert_eq!(newest[0].1, "2026-03-02T08:00:00.000Z");
    }
}
