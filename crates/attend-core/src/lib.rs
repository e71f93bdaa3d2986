//! attend-core: Face matching and attendance decisions.
//!
//! Matches query embeddings against an enrolled gallery, runs the
//! per-camera presence lock that turns matches into attendance events,
//! and provides the SCRFD + ArcFace embedding pipeline running via ONNX
//! Runtime.

pub mod alignment;
pub mod detector;
pub mod event;
pub mod gallery;
pub mod matcher;
pub mod recognizer;
pub mod session;
pub mod types;

pub use event::{AttendanceEvent, AttendanceSink, CommitPolicy, EventKind, LogId, SinkError};
pub use gallery::{Gallery, GalleryStore, StoreError};
pub use matcher::{MatchError, Matcher, NearestNeighborMatcher};
pub use recognizer::{EmbedError, EmbeddingProvider, FaceEmbedder};
pub use session::{
    Decision, Observation, RecognitionSession, SessionConfig, SessionSnapshot, SuppressReason,
    TickReport,
};
pub use types::{Embedding, FaceBox, GalleryEntry, MatchResult, Metric};
