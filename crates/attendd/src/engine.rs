use attend_capture::LatestFrame;
use attend_core::event::EventError;
use attend_core::{
    CommitPolicy, EmbedError, EmbeddingProvider, Gallery, GalleryEntry, GalleryStore,
    Matcher, NearestNeighborMatcher, Observation, RecognitionSession, SessionSnapshot, StoreError,
};
use attend_store::SqliteStore;
use serde::Serialize;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{oneshot, watch};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("embedding error: {0}")]
    Embed(#[from] EmbedError),
    #[error("session error: {0}")]
    Session(#[from] EventError),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("embedding has dimension {got}, gallery uses {expected}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// A reference image to enroll for an identity.
#[derive(Debug, Clone)]
pub struct EnrollRequest {
    pub identity_id: String,
    pub display_name: String,
    pub code: Option<String>,
    pub label: String,
    pub image: Vec<u8>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrollOutcome {
    pub identity_id: String,
    pub label: String,
    pub dimension: usize,
    pub model_version: Option<String>,
}

/// What the engine publishes to observers after every change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStatus {
    #[serde(flatten)]
    pub session: SessionSnapshot,
    pub gallery_entries: usize,
    pub gallery_identities: usize,
    /// Gallery entries skipped by the last search for a dimension mismatch.
    pub skipped_entries: usize,
    /// A write or a failed reload left the gallery waiting for a reload;
    /// matching runs on the previous snapshot until then.
    pub gallery_stale: bool,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Enroll {
        request: EnrollRequest,
        reply: oneshot::Sender<Result<EnrollOutcome, EngineError>>,
    },
    Remove {
        identity_id: String,
        reply: oneshot::Sender<Result<usize, EngineError>>,
    },
    SetActive {
        identity_id: String,
        active: bool,
        reply: oneshot::Sender<Result<bool, EngineError>>,
    },
    SetPolicy {
        policy: CommitPolicy,
        reply: oneshot::Sender<()>,
    },
    ResetCounter {
        reply: oneshot::Sender<()>,
    },
    Refresh {
        reply: oneshot::Sender<Result<usize, EngineError>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    status: watch::Receiver<EngineStatus>,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Embed the image and store it as a reference for the identity.
    pub async fn enroll(&self, request: EnrollRequest) -> Result<EnrollOutcome, EngineError> {
        self.request(|reply| EngineRequest::Enroll { request, reply })
            .await?
    }

    /// Delete an identity with all its references. Returns the number removed.
    pub async fn remove(&self, identity_id: &str) -> Result<usize, EngineError> {
        let identity_id = identity_id.to_string();
        self.request(|reply| EngineRequest::Remove { identity_id, reply })
            .await?
    }

    /// Enable or disable an identity. Returns false for an unknown identity.
    pub async fn set_active(&self, identity_id: &str, active: bool) -> Result<bool, EngineError> {
        let identity_id = identity_id.to_string();
        self.request(|reply| EngineRequest::SetActive {
            identity_id,
            active,
            reply,
        })
        .await?
    }

    pub async fn set_policy(&self, policy: CommitPolicy) -> Result<(), EngineError> {
        self.request(|reply| EngineRequest::SetPolicy { policy, reply })
            .await
    }

    pub async fn reset_counter(&self) -> Result<(), EngineError> {
        self.request(|reply| EngineRequest::ResetCounter { reply })
            .await
    }

    /// Reload the gallery now. Returns the entry count.
    pub async fn refresh(&self) -> Result<usize, EngineError> {
        self.request(|reply| EngineRequest::Refresh { reply }).await?
    }

    /// Stop the engine loop. The thread exits after acknowledging.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        self.request(|reply| EngineRequest::Shutdown { reply })
            .await
    }

    /// Latest published status.
    pub fn status(&self) -> EngineStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<EngineStatus> {
        self.status.clone()
    }
}

/// Everything the engine thread takes ownership of.
pub struct EngineParts {
    pub store: SqliteStore,
    pub embedder: Box<dyn EmbeddingProvider>,
    pub matcher: NearestNeighborMatcher,
    pub session: RecognitionSession,
    pub frames: Arc<LatestFrame>,
    pub tick_interval: Duration,
}

/// Spawn the engine on a dedicated OS thread.
///
/// Loads the gallery before the thread starts, so an unreachable store
/// fails startup instead of the first tick.
pub fn spawn_engine(parts: EngineParts) -> Result<(EngineHandle, JoinHandle<()>), EngineError> {
    let gallery = Gallery::load(&parts.store)?;
    if let Some(dim) = gallery.dimension() {
        if dim != parts.embedder.dimension() {
            tracing::warn!(
                gallery = dim,
                embedder = parts.embedder.dimension(),
                "gallery dimension differs from embedder; mismatched entries will be skipped"
            );
        }
    }

    let (status_tx, status_rx) = watch::channel(EngineStatus {
        session: parts.session.snapshot(),
        gallery_entries: gallery.len(),
        gallery_identities: gallery.identity_count(),
        skipped_entries: 0,
        gallery_stale: false,
    });
    let engine = Engine {
        gallery,
        matcher: parts.matcher,
        session: parts.session,
        embedder: parts.embedder,
        store: parts.store,
        frames: parts.frames,
        last_sequence: 0,
        last_skipped: 0,
        tick_interval: parts.tick_interval,
        status_tx,
    };

    let (tx, rx) = mpsc::channel::<EngineRequest>();
    let thread = std::thread::Builder::new()
        .name("attend-engine".into())
        .spawn(move || engine.run(rx))
        .map_err(EngineError::Spawn)?;

    Ok((
        EngineHandle {
            tx,
            status: status_rx,
        },
        thread,
    ))
}

struct Engine {
    gallery: Gallery,
    matcher: NearestNeighborMatcher,
    session: RecognitionSession,
    embedder: Box<dyn EmbeddingProvider>,
    store: SqliteStore,
    frames: Arc<LatestFrame>,
    last_sequence: u64,
    last_skipped: usize,
    tick_interval: Duration,
    status_tx: watch::Sender<EngineStatus>,
}

impl Engine {
    fn run(mut self, rx: mpsc::Receiver<EngineRequest>) {
        tracing::info!(
            camera = %self.session.camera_id(),
            tick_ms = self.tick_interval.as_millis() as u64,
            entries = self.gallery.len(),
            "engine thread started"
        );
        let mut next_tick = Instant::now();
        loop {
            let now = Instant::now();
            if now >= next_tick {
                self.tick(now);
                self.publish();
                next_tick = now.checked_add(self.tick_interval).unwrap_or(now);
            }

            match rx.recv_timeout(next_tick.saturating_duration_since(Instant::now())) {
                Ok(EngineRequest::Shutdown { reply }) => {
                    let _ = reply.send(());
                    break;
                }
                Ok(request) => self.handle(request),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    tracing::info!("all engine handles dropped");
                    break;
                }
            }
        }
        tracing::info!("engine thread exiting");
    }

    /// Replies are sent after the new status is published, so a caller
    /// that awaits the reply observes the change.
    fn handle(&mut self, request: EngineRequest) {
        match request {
            EngineRequest::Enroll { request, reply } => {
                let result = self.enroll(request);
                self.publish();
                let _ = reply.send(result);
            }
            EngineRequest::Remove { identity_id, reply } => {
                let result = self.remove(&identity_id);
                self.publish();
                let _ = reply.send(result);
            }
            EngineRequest::SetActive {
                identity_id,
                active,
                reply,
            } => {
                let result = self.set_active(&identity_id, active);
                self.publish();
                let _ = reply.send(result);
            }
            EngineRequest::SetPolicy { policy, reply } => {
                tracing::info!(%policy, "commit policy changed");
                self.session.set_policy(policy);
                self.publish();
                let _ = reply.send(());
            }
            EngineRequest::ResetCounter { reply } => {
                tracing::info!(previous = self.session.commit_count(), "commit counter reset");
                self.session.reset_counter();
                self.publish();
                let _ = reply.send(());
            }
            EngineRequest::Refresh { reply } => {
                let result = self.gallery.refresh(&self.store).map_err(EngineError::from);
                self.publish();
                let _ = reply.send(result);
            }
            EngineRequest::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn enroll(&mut self, request: EnrollRequest) -> Result<EnrollOutcome, EngineError> {
        if request.identity_id.trim().is_empty() {
            return Err(EngineError::InvalidRequest("identity id is empty".into()));
        }
        if request.label.trim().is_empty() {
            return Err(EngineError::InvalidRequest("label is empty".into()));
        }

        let embedding = self.embedder.embed(&request.image)?;
        self.gallery.ensure_fresh(&self.store)?;
        if let Some(expected) = self.gallery.dimension() {
            if expected != embedding.dim() {
                return Err(EngineError::DimensionMismatch {
                    expected,
                    got: embedding.dim(),
                });
            }
        }

        let outcome = EnrollOutcome {
            identity_id: request.identity_id.clone(),
            label: request.label.clone(),
            dimension: embedding.dim(),
            model_version: embedding.model_version.clone(),
        };
        let display_name = if request.display_name.trim().is_empty() {
            request.identity_id.clone()
        } else {
            request.display_name
        };
        self.store.upsert(&GalleryEntry {
            identity_id: request.identity_id,
            label: request.label,
            display_name,
            code: request.code.filter(|c| !c.trim().is_empty()),
            embedding,
        })?;
        self.gallery.invalidate();
        Ok(outcome)
    }

    fn remove(&mut self, identity_id: &str) -> Result<usize, EngineError> {
        let removed = self.store.delete(identity_id)?;
        self.gallery.invalidate();
        self.session.release_identity(identity_id);
        Ok(removed)
    }

    fn set_active(&mut self, identity_id: &str, active: bool) -> Result<bool, EngineError> {
        let found = self.store.set_active(identity_id, active)?;
        if !found {
            return Ok(false);
        }
        tracing::info!(identity = %identity_id, active, "identity activation changed");
        self.gallery.invalidate();
        if !active {
            self.session.release_identity(identity_id);
        }
        Ok(true)
    }

    fn tick(&mut self, now: Instant) {
        if let Err(e) = self.gallery.ensure_fresh(&self.store) {
            tracing::warn!(error = %e, "gallery reload failed; matching against previous snapshot");
        }

        let observation = self.observe();
        let report = self.session.tick(observation.as_ref(), now, &self.store);
        if let Some(identity) = &report.released {
            tracing::debug!(%identity, "presence ended");
        }
    }

    /// Embed and match the newest unseen frame. Per-frame failures yield `None`.
    fn observe(&mut self) -> Option<Observation> {
        let frame = self.frames.newer_than(self.last_sequence)?;
        self.last_sequence = frame.sequence;

        let embedding = match self.embedder.embed(&frame.data) {
            Ok(embedding) => embedding,
            Err(EmbedError::NoFace) => {
                tracing::trace!(sequence = frame.sequence, "no face in frame");
                return None;
            }
            Err(e) => {
                tracing::debug!(sequence = frame.sequence, error = %e, "embedding failed");
                return None;
            }
        };

        match self.matcher.search(&embedding, self.gallery.entries()) {
            Ok(result) => {
                if result.skipped != self.last_skipped {
                    tracing::warn!(skipped = result.skipped, "gallery entries skipped for dimension mismatch");
                }
                self.last_skipped = result.skipped;
                tracing::debug!(
                    sequence = frame.sequence,
                    matched = result.matched,
                    identity = ?result.identity_id,
                    score = result.score,
                    "frame matched"
                );
                Some(Observation {
                    result,
                    observed_at: frame.captured_at,
                })
            }
            Err(e) => {
                tracing::debug!(sequence = frame.sequence, error = %e, "query rejected");
                None
            }
        }
    }

    fn status(&self) -> EngineStatus {
        EngineStatus {
            session: self.session.snapshot(),
            gallery_entries: self.gallery.len(),
            gallery_identities: self.gallery.identity_count(),
            skipped_entries: self.last_skipped,
            gallery_stale: self.gallery.is_stale(),
        }
    }

    fn publish(&self) {
        let next = self.status();
        self.status_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use attend_core::{Embedding, EventKind, SessionConfig};

    /// Reads the image bytes as the embedding; an empty image has no face.
    struct BytesEmbedder;

    impl EmbeddingProvider for BytesEmbedder {
        fn embed(&mut self, image: &[u8]) -> Result<Embedding, EmbedError> {
            if image.is_empty() {
                return Err(EmbedError::NoFace);
            }
            Ok(Embedding::new(image.iter().map(|b| *b as f32).collect()))
        }

        fn dimension(&self) -> usize {
            2
        }
    }

    fn start(policy: CommitPolicy) -> (EngineHandle, JoinHandle<()>, Arc<LatestFrame>) {
        let frames = Arc::new(LatestFrame::new());
        let store = SqliteStore::open_in_memory().unwrap();
        store.ensure_camera("CAM_T", None, None).unwrap();
        let (handle, thread) = spawn_engine(EngineParts {
            store,
            embedder: Box::new(BytesEmbedder),
            matcher: NearestNeighborMatcher::cosine(0.9),
            session: RecognitionSession::new("CAM_T", SessionConfig::default(), policy).unwrap(),
            frames: frames.clone(),
            tick_interval: Duration::from_millis(10),
        })
        .unwrap();
        (handle, thread, frames)
    }

    fn enroll_request(id: &str, image: Vec<u8>) -> EnrollRequest {
        EnrollRequest {
            identity_id: id.into(),
            display_name: format!("{id} display"),
            code: None,
            label: "default".into(),
            image,
        }
    }

    async fn wait_for(
        handle: &EngineHandle,
        mut pred: impl FnMut(&EngineStatus) -> bool,
    ) -> EngineStatus {
        let mut rx = handle.subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| pred(s)))
            .await
            .expect("status did not change in time")
            .expect("engine dropped the status channel")
            .clone()
    }

    #[tokio::test]
    async fn test_enroll_then_recognize_commits_once() {
        let (handle, thread, frames) = start(CommitPolicy::default());

        let outcome = handle.enroll(enroll_request("alice", vec![1, 0])).await.unwrap();
        assert_eq!(outcome.dimension, 2);

        frames.publish(vec![9, 0]);
        let status = wait_for(&handle, |s| s.session.last_event.is_some()).await;
        let event = status.session.last_event.unwrap();
        assert_eq!(event.identity_id(), "alice");
        assert_eq!(event.display_name(), Some("alice display"));
        assert_eq!(event.kind(), EventKind::CheckIn);
        assert_eq!(status.session.locked_identity.as_deref(), Some("alice"));
        assert_eq!(status.session.last_log_error, None);
        assert_eq!(status.gallery_entries, 1);

        // the same presence keeps refreshing the lock
        for _ in 0..5 {
            frames.publish(vec![5, 0]);
            tokio::time::sleep(Duration::from_millis(15)).await;
        }
        assert_eq!(handle.status().session.commit_count, 1);

        handle.shutdown().await.unwrap();
        thread.join().unwrap();
    }

    #[tokio::test]
    async fn test_enroll_rejects_dimension_mismatch() {
        let (handle, thread, _frames) = start(CommitPolicy::default());

        handle.enroll(enroll_request("alice", vec![1, 0])).await.unwrap();
        let err = handle
            .enroll(enroll_request("bob", vec![1, 0, 0]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::DimensionMismatch { expected: 2, got: 3 }
        ));

        let err = handle.enroll(enroll_request("carol", vec![])).await.unwrap_err();
        assert!(matches!(err, EngineError::Embed(EmbedError::NoFace)));

        let err = handle.enroll(enroll_request(" ", vec![1, 0])).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidRequest(_)));

        handle.shutdown().await.unwrap();
        thread.join().unwrap();
    }

    #[tokio::test]
    async fn test_remove_invalidates_gallery() {
        let (handle, thread, _frames) = start(CommitPolicy::default());

        handle.enroll(enroll_request("alice", vec![1, 0])).await.unwrap();
        handle.enroll(enroll_request("bob", vec![0, 1])).await.unwrap();
        assert_eq!(handle.refresh().await.unwrap(), 2);

        assert_eq!(handle.remove("alice").await.unwrap(), 1);
        assert_eq!(handle.remove("alice").await.unwrap(), 0);
        let status = wait_for(&handle, |s| s.gallery_entries == 1).await;
        assert_eq!(status.gallery_identities, 1);

        handle.shutdown().await.unwrap();
        thread.join().unwrap();
    }

    #[tokio::test]
    async fn test_removing_locked_identity_releases_lock() {
        let (handle, thread, frames) = start(CommitPolicy::default());

        handle.enroll(enroll_request("alice", vec![1, 0])).await.unwrap();
        frames.publish(vec![1, 0]);
        wait_for(&handle, |s| s.session.locked_identity.as_deref() == Some("alice")).await;

        assert_eq!(handle.remove("alice").await.unwrap(), 1);
        let status = handle.status();
        assert_eq!(status.session.locked_identity, None);
        assert_eq!(status.session.commit_count, 1);

        handle.shutdown().await.unwrap();
        thread.join().unwrap();
    }

    #[tokio::test]
    async fn test_deactivate_excludes_identity_and_releases_lock() {
        let (handle, thread, frames) = start(CommitPolicy::default());

        handle.enroll(enroll_request("alice", vec![1, 0])).await.unwrap();
        handle.enroll(enroll_request("bob", vec![0, 1])).await.unwrap();
        frames.publish(vec![1, 0]);
        wait_for(&handle, |s| s.session.locked_identity.as_deref() == Some("alice")).await;

        assert!(handle.set_active("alice", false).await.unwrap());
        assert_eq!(handle.status().session.locked_identity, None);
        let status = wait_for(&handle, |s| !s.gallery_stale && s.gallery_entries == 1).await;
        assert_eq!(status.gallery_identities, 1);

        assert!(!handle.set_active("nobody", true).await.unwrap());
        assert!(handle.set_active("alice", true).await.unwrap());
        wait_for(&handle, |s| !s.gallery_stale && s.gallery_entries == 2).await;

        handle.shutdown().await.unwrap();
        thread.join().unwrap();
    }

    #[tokio::test]
    async fn test_policy_and_counter_requests() {
        let (handle, thread, frames) = start(CommitPolicy::Alternating);

        handle.enroll(enroll_request("alice", vec![1, 0])).await.unwrap();
        frames.publish(vec![1, 0]);
        wait_for(&handle, |s| s.session.commit_count == 1).await;

        handle.reset_counter().await.unwrap();
        assert_eq!(handle.status().session.commit_count, 0);

        let fixed = CommitPolicy::Fixed(EventKind::CheckOut);
        handle.set_policy(fixed).await.unwrap();
        assert_eq!(handle.status().session.policy, fixed);

        handle.shutdown().await.unwrap();
        thread.join().unwrap();
    }

    #[tokio::test]
    async fn test_unknown_face_does_not_commit() {
        let (handle, thread, frames) = start(CommitPolicy::default());

        handle.enroll(enroll_request("alice", vec![1, 0])).await.unwrap();
        let feeder = {
            let frames = frames.clone();
            tokio::spawn(async move {
                loop {
                    frames.publish(vec![0, 1]);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
            })
        };
        let status = wait_for(&handle, |s| s.session.last_match.is_some()).await;
        feeder.abort();
        let last = status.session.last_match.unwrap();
        assert!(!last.matched);
        assert_eq!(last.identity_id, None);
        assert_eq!(status.session.commit_count, 0);

        handle.shutdown().await.unwrap();
        thread.join().unwrap();
    }

    #[tokio::test]
    async fn test_dropped_handles_stop_engine() {
        let (handle, thread, _frames) = start(CommitPolicy::default());
        drop(handle);
        thread.join().unwrap();
    }
}
