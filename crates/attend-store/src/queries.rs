//! Plain SQL helpers shared by the sync store and the async reader.

use attend_core::{AttendanceEvent, Embedding, GalleryEntry};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection};
use serde::Serialize;

/// Enrolled identity as listed to operators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdentityRecord {
    pub identity_id: String,
    pub display_name: String,
    pub code: Option<String>,
    pub is_active: bool,
    pub references: usize,
}

/// One attendance log row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRecord {
    pub log_id: i64,
    pub event_time: String,
    pub event_type: String,
    pub camera_id: String,
    pub identity_id: String,
    pub display_name: Option<String>,
    pub confidence: f64,
}

/// Registered camera.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CameraRecord {
    pub camera_id: String,
    pub label: Option<String>,
    pub location: Option<String>,
    pub is_active: bool,
    pub created_at: String,
}

/// Conditions for [`query_logs`]. Unset fields do not filter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogFilter {
    pub identity_id: Option<String>,
    pub camera_id: Option<String>,
    /// `CHECK_IN` or `CHECK_OUT`.
    pub event_type: Option<String>,
    /// Inclusive lower bound on the event time.
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound on the event time.
    pub until: Option<DateTime<Utc>>,
    pub limit: usize,
}

pub(crate) fn timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn encode_embedding(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub(crate) fn decode_embedding(blob: &[u8], dim: usize) -> Option<Vec<f32>> {
    if blob.len() != dim * 4 {
        return None;
    }
    Some(
        blob.chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

pub fn upsert_identity(
    conn: &Connection,
    identity_id: &str,
    display_name: &str,
    code: Option<&str>,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO identities (identity_id, display_name, code, is_active, created_at)
         VALUES (?1, ?2, ?3, 1, ?4)
         ON CONFLICT(identity_id) DO UPDATE SET
             display_name = excluded.display_name,
             code = COALESCE(excluded.code, identities.code)",
        params![identity_id, display_name, code, timestamp(Utc::now())],
    )?;
    Ok(())
}

pub fn upsert_reference(conn: &Connection, entry: &GalleryEntry) -> rusqlite::Result<()> {
    let values = &entry.embedding.values;
    conn.execute(
        "INSERT INTO face_embeddings
             (reference_id, identity_id, label, dim, embedding, model_version, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(identity_id, label) DO UPDATE SET
             dim = excluded.dim,
             embedding = excluded.embedding,
             model_version = excluded.model_version,
             created_at = excluded.created_at",
        params![
            uuid::Uuid::new_v4().to_string(),
            entry.identity_id,
            entry.label,
            values.len() as i64,
            encode_embedding(values),
            entry.embedding.model_version,
            timestamp(Utc::now()),
        ],
    )?;
    Ok(())
}

/// References of active identities, ordered by identity then label.
///
/// Rows whose blob does not match their declared dimension are skipped.
pub fn load_active_entries(conn: &Connection) -> rusqlite::Result<Vec<GalleryEntry>> {
    let mut stmt = conn.prepare(
        "SELECT f.identity_id, f.label, i.display_name, i.code, f.dim, f.embedding, f.model_version
         FROM face_embeddings f
         JOIN identities i ON i.identity_id = f.identity_id
         WHERE i.is_active = 1
         ORDER BY f.identity_id, f.label",
    )?;

    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, Option<String>>(3)?,
            row.get::<_, i64>(4)?,
            row.get::<_, Vec<u8>>(5)?,
            row.get::<_, Option<String>>(6)?,
        ))
    })?;

    let mut entries = Vec::new();
    for row in rows {
        let (identity_id, label, display_name, code, dim, blob, model_version) = row?;
        let Some(values) = usize::try_from(dim).ok().and_then(|d| decode_embedding(&blob, d)) else {
            tracing::warn!(identity = %identity_id, label = %label, dim, bytes = blob.len(), "skipping corrupt embedding row");
            continue;
        };
        entries.push(GalleryEntry {
            identity_id,
            label,
            display_name,
            code,
            embedding: Embedding {
                values,
                model_version,
            },
        });
    }
    Ok(entries)
}

/// Delete an identity and its references. Returns the number of references removed.
pub fn delete_identity(conn: &Connection, identity_id: &str) -> rusqlite::Result<usize> {
    let removed = conn.execute(
        "DELETE FROM face_embeddings WHERE identity_id = ?1",
        params![identity_id],
    )?;
    conn.execute("DELETE FROM identities WHERE identity_id = ?1", params![identity_id])?;
    Ok(removed)
}

/// Returns false when the identity does not exist.
pub fn set_active(conn: &Connection, identity_id: &str, active: bool) -> rusqlite::Result<bool> {
    let n = conn.execute(
        "UPDATE identities SET is_active = ?2 WHERE identity_id = ?1",
        params![identity_id, active],
    )?;
    Ok(n > 0)
}

pub fn ensure_camera(
    conn: &Connection,
    camera_id: &str,
    label: Option<&str>,
    location: Option<&str>,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO cameras (camera_id, label, location, is_active, created_at)
         VALUES (?1, ?2, ?3, 1, ?4)
         ON CONFLICT(camera_id) DO UPDATE SET
             label = COALESCE(excluded.label, cameras.label),
             location = COALESCE(excluded.location, cameras.location),
             is_active = 1",
        params![camera_id, label, location, timestamp(Utc::now())],
    )?;
    Ok(())
}

pub fn list_cameras(conn: &Connection) -> rusqlite::Result<Vec<CameraRecord>> {
    let mut stmt = conn.prepare(
        "SELECT camera_id, label, location, is_active, created_at
         FROM cameras ORDER BY camera_id",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(CameraRecord {
            camera_id: row.get(0)?,
            label: row.get(1)?,
            location: row.get(2)?,
            is_active: row.get(3)?,
            created_at: row.get(4)?,
        })
    })?;
    rows.collect()
}

pub fn insert_log(conn: &Connection, event: &AttendanceEvent) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO attendance_logs
             (event_time, event_type, camera_id, identity_id, display_name, confidence, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            timestamp(event.timestamp()),
            event.kind().as_str(),
            event.camera_id(),
            event.identity_id(),
            event.display_name(),
            event.confidence() as f64,
            timestamp(Utc::now()),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn list_identities(conn: &Connection) -> rusqlite::Result<Vec<IdentityRecord>> {
    let mut stmt = conn.prepare(
        "SELECT i.identity_id, i.display_name, i.code, i.is_active, COUNT(f.reference_id)
         FROM identities i
         LEFT JOIN face_embeddings f ON f.identity_id = i.identity_id
         GROUP BY i.identity_id
         ORDER BY i.identity_id",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(IdentityRecord {
            identity_id: row.get(0)?,
            display_name: row.get(1)?,
            code: row.get(2)?,
            is_active: row.get(3)?,
            references: row.get::<_, i64>(4)? as usize,
        })
    })?;
    rows.collect()
}

const LOG_COLUMNS: &str =
    "log_id, event_time, event_type, camera_id, identity_id, display_name, confidence";

fn log_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<LogRecord> {
    Ok(LogRecord {
        log_id: row.get(0)?,
        event_time: row.get(1)?,
        event_type: row.get(2)?,
        camera_id: row.get(3)?,
        identity_id: row.get(4)?,
        display_name: row.get(5)?,
        confidence: row.get(6)?,
    })
}

/// Newest first.
pub fn recent_logs(conn: &Connection, limit: usize) -> rusqlite::Result<Vec<LogRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {LOG_COLUMNS} FROM attendance_logs ORDER BY event_time DESC, log_id DESC LIMIT ?1"
    ))?;
    let rows = stmt.query_map(params![limit as i64], log_record)?;
    rows.collect()
}

/// Filtered log rows, newest first.
pub fn query_logs(conn: &Connection, filter: &LogFilter) -> rusqlite::Result<Vec<LogRecord>> {
    let mut clauses = Vec::new();
    let mut values: Vec<Value> = Vec::new();
    let mut push = |clause: &'static str, value: String| {
        clauses.push(clause);
        values.push(Value::Text(value));
    };
    if let Some(id) = &filter.identity_id {
        push("identity_id = ?", id.clone());
    }
    if let Some(camera) = &filter.camera_id {
        push("camera_id = ?", camera.clone());
    }
    if let Some(kind) = &filter.event_type {
        push("event_type = ?", kind.clone());
    }
    if let Some(since) = filter.since {
        push("event_time >= ?", timestamp(since));
    }
    if let Some(until) = filter.until {
        push("event_time < ?", timestamp(until));
    }
    values.push(Value::Integer(filter.limit as i64));

    let filter_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    let mut stmt = conn.prepare(&format!(
        "SELECT {LOG_COLUMNS} FROM attendance_logs {filter_sql}
         ORDER BY event_time DESC, log_id DESC LIMIT ?"
    ))?;
    let rows = stmt.query_map(params_from_iter(values.iter()), log_record)?;
    rows.collect()
}
