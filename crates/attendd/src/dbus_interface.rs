use crate::engine::{EngineError, EngineHandle, EngineStatus, EnrollRequest};
use attend_capture::{CaptureLiveness, LatestFrame};
use attend_core::{CommitPolicy, EmbedError, EventKind, Metric};
use attend_store::{LogFilter, StoreReader};
use chrono::{DateTime, NaiveDate, Utc};
use std::sync::Arc;
use zbus::fdo;
use zbus::interface;
use zbus::object_server::SignalEmitter;

pub const BUS_NAME: &str = "org.attend.Daemon1";
pub const OBJECT_PATH: &str = "/org/attend/Daemon1";

/// Upper bound on rows returned by `RecentLogs` and `QueryLogs`.
const MAX_LOG_ROWS: u32 = 1000;

/// D-Bus interface for the attendance daemon.
///
/// Bus name: org.attend.Daemon1
/// Object path: /org/attend/Daemon1
pub struct AttendService {
    pub engine: EngineHandle,
    pub reader: StoreReader,
    pub frames: Arc<LatestFrame>,
    pub capture: CaptureLiveness,
    pub metric: Metric,
    pub threshold: f32,
}

fn engine_error(e: EngineError) -> fdo::Error {
    match e {
        EngineError::InvalidRequest(msg) => fdo::Error::InvalidArgs(msg),
        EngineError::DimensionMismatch { .. }
        | EngineError::Embed(EmbedError::NoFace | EmbedError::Decode(_) | EmbedError::ZeroNorm) => {
            fdo::Error::InvalidArgs(e.to_string())
        }
        other => fdo::Error::Failed(other.to_string()),
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| fdo::Error::Failed(format!("serialize: {e}")))
}

fn status_json(
    status: &EngineStatus,
    metric: Metric,
    threshold: f32,
    frames: &LatestFrame,
    capture: &CaptureLiveness,
) -> fdo::Result<String> {
    let last_frame_age_ms = frames
        .latest()
        .map(|frame| frame.captured_at.elapsed().as_millis() as u64);
    to_json(&serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "metric": metric.to_string(),
        "threshold": threshold,
        "capture_running": capture.is_running(),
        "frames_published": frames.published(),
        "frames_dropped": frames.dropped(),
        "last_frame_age_ms": last_frame_age_ms,
        "engine": status,
    }))
}

/// Empty strings mean "no filter".
fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

/// Accept an RFC 3339 timestamp or a bare `YYYY-MM-DD` (midnight UTC).
fn parse_bound(value: &str) -> fdo::Result<Option<DateTime<Utc>>> {
    let Some(value) = non_empty(value) else {
        return Ok(None);
    };
    if let Ok(t) = DateTime::parse_from_rfc3339(&value) {
        return Ok(Some(t.with_timezone(&Utc)));
    }
    NaiveDate::parse_from_str(&value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|t| Some(t.and_utc()))
        .ok_or_else(|| fdo::Error::InvalidArgs(format!("bad timestamp: {value}")))
}

fn log_filter(
    identity_id: &str,
    camera_id: &str,
    event_type: &str,
    since: &str,
    until: &str,
    limit: u32,
) -> fdo::Result<LogFilter> {
    let event_type = non_empty(event_type)
        .map(|t| t.parse::<EventKind>().map_err(fdo::Error::InvalidArgs))
        .transpose()?;
    let filter = LogFilter {
        identity_id: non_empty(identity_id),
        camera_id: non_empty(camera_id),
        event_type: event_type.map(|kind| kind.as_str().to_string()),
        since: parse_bound(since)?,
        until: parse_bound(until)?,
        limit: limit.min(MAX_LOG_ROWS) as usize,
    };
    if let (Some(since), Some(until)) = (filter.since, filter.until) {
        if since >= until {
            return Err(fdo::Error::InvalidArgs(format!(
                "empty range: {since} is not before {until}"
            )));
        }
    }
    Ok(filter)
}

#[interface(name = "org.attend.Daemon1")]
impl AttendService {
    /// Enroll a reference image for an identity. Returns the outcome as JSON.
    async fn enroll(
        &self,
        identity_id: &str,
        display_name: &str,
        code: &str,
        label: &str,
        image: Vec<u8>,
    ) -> fdo::Result<String> {
        tracing::info!(identity = identity_id, label, bytes = image.len(), "enroll requested");
        let label = if label.trim().is_empty() { "default" } else { label };
        let outcome = self
            .engine
            .enroll(EnrollRequest {
                identity_id: identity_id.to_string(),
                display_name: display_name.to_string(),
                code: Some(code.to_string()),
                label: label.to_string(),
                image,
            })
            .await
            .map_err(|e| {
                tracing::warn!(identity = identity_id, error = %e, "enroll failed");
                engine_error(e)
            })?;
        to_json(&outcome)
    }

    /// Remove an identity and all its references. Returns the number of references removed.
    async fn remove_identity(&self, identity_id: &str) -> fdo::Result<u32> {
        tracing::info!(identity = identity_id, "remove requested");
        let removed = self.engine.remove(identity_id).await.map_err(engine_error)?;
        Ok(removed as u32)
    }

    /// Enrolled identities as a JSON array.
    async fn list_identities(&self) -> fdo::Result<String> {
        let identities = self
            .reader
            .list_identities()
            .await
            .map_err(|e| fdo::Error::Failed(e.to_string()))?;
        to_json(&identities)
    }

    /// Activate or deactivate an identity. Inactive identities are not
    /// recognized. Returns false when the identity does not exist.
    async fn set_active(&self, identity_id: &str, active: bool) -> fdo::Result<bool> {
        tracing::info!(identity = identity_id, active, "set active requested");
        self.engine
            .set_active(identity_id, active)
            .await
            .map_err(engine_error)
    }

    /// Newest attendance log rows as a JSON array.
    async fn recent_logs(&self, limit: u32) -> fdo::Result<String> {
        let logs = self
            .reader
            .recent_logs(limit.min(MAX_LOG_ROWS) as usize)
            .await
            .map_err(|e| fdo::Error::Failed(e.to_string()))?;
        to_json(&logs)
    }

    /// Attendance log rows matching every non-empty argument, newest first.
    /// `since` is inclusive and `until` exclusive; both take RFC 3339 or
    /// `YYYY-MM-DD`.
    async fn query_logs(
        &self,
        identity_id: &str,
        camera_id: &str,
        event_type: &str,
        since: &str,
        until: &str,
        limit: u32,
    ) -> fdo::Result<String> {
        let filter = log_filter(identity_id, camera_id, event_type, since, until, limit)?;
        tracing::debug!(?filter, "log query");
        let logs = self
            .reader
            .query_logs(filter)
            .await
            .map_err(|e| fdo::Error::Failed(e.to_string()))?;
        to_json(&logs)
    }

    /// Registered cameras as a JSON array.
    async fn list_cameras(&self) -> fdo::Result<String> {
        let cameras = self
            .reader
            .list_cameras()
            .await
            .map_err(|e| fdo::Error::Failed(e.to_string()))?;
        to_json(&cameras)
    }

    /// Select `check-in`, `check-out` or `alternate`. Returns the active policy.
    async fn set_policy(&self, policy: &str) -> fdo::Result<String> {
        let policy: CommitPolicy = policy.parse().map_err(fdo::Error::InvalidArgs)?;
        self.engine.set_policy(policy).await.map_err(engine_error)?;
        Ok(policy.to_string())
    }

    /// Reset the commit counter used by the alternating policy.
    async fn reset_counter(&self) -> fdo::Result<()> {
        self.engine.reset_counter().await.map_err(engine_error)
    }

    /// Return daemon status information.
    async fn status(&self) -> fdo::Result<String> {
        status_json(
            &self.engine.status(),
            self.metric,
            self.threshold,
            &self.frames,
            &self.capture,
        )
    }

    /// Emitted with the engine status as JSON whenever it changes.
    #[zbus(signal)]
    pub async fn state_changed(emitter: &SignalEmitter<'_>, snapshot_json: &str) -> zbus::Result<()>;
}
