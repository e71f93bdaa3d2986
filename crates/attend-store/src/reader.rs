//! Async read-only access for request handlers.
//!
//! Runs on its own connection (background thread owned by
//! `tokio-rusqlite`), so admin queries never wait on the recognition
//! thread that owns the writer.

use crate::queries::{self, CameraRecord, IdentityRecord, LogFilter, LogRecord};
use std::path::Path;

pub type ReadError = tokio_rusqlite::Error;

#[derive(Clone)]
pub struct StoreReader {
    conn: tokio_rusqlite::Connection,
}

impl StoreReader {
    pub async fn open(path: &Path) -> Result<Self, ReadError> {
        let conn = tokio_rusqlite::Connection::open(path).await?;
        conn.call(|conn| {
            conn.pragma_update(None, "query_only", true)?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }

    pub async fn list_identities(&self) -> Result<Vec<IdentityRecord>, ReadError> {
        self.conn
            .call(|conn| Ok(queries::list_identities(conn)?))
            .await
    }

    pub async fn recent_logs(&self, limit: usize) -> Result<Vec<LogRecord>, ReadError> {
        self.conn
            .call(move |conn| Ok(queries::recent_logs(conn, limit)?))
            .await
    }

    pub async fn query_logs(&self, filter: LogFilter) -> Result<Vec<LogRecord>, ReadError> {
        self.conn
            .call(move |conn| Ok(queries::query_logs(conn, &filter)?))
            .await
    }

    pub async fn list_cameras(&self) -> Result<Vec<CameraRecord>, ReadError> {
        self.conn
            .call(|conn| Ok(queries::list_cameras(conn)?))
            .await
    }
}
