use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Face embedding vector (typically 512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Euclidean norm of the vector.
    pub fn norm(&self) -> f32 {
        self.values.iter().map(|v| v * v).sum::<f32>().sqrt()
    }

    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }

    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar. Returns `None`
    /// when either vector has zero norm.
    pub fn similarity(&self, other: &Embedding) -> Option<f32> {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            Some(dot / denom)
        } else {
            None
        }
    }

    /// Compute Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// Comparison metric used by the matcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// Euclidean distance: smaller is better, accept when `distance <= threshold`.
    L2,
    /// Cosine similarity: larger is better, accept when `similarity >= threshold`.
    Cosine,
}

impl Metric {
    /// Score reported when nothing was compared.
    pub fn sentinel(self) -> f32 {
        match self {
            Metric::L2 => f32::INFINITY,
            Metric::Cosine => -1.0,
        }
    }

    /// Typical acceptance threshold (FaceNet L2 / ArcFace cosine).
    pub fn default_threshold(self) -> f32 {
        match self {
            Metric::L2 => 0.8,
            Metric::Cosine => 0.35,
        }
    }

    /// Strict "better than" comparison. Ties are not better.
    pub fn is_better(self, candidate: f32, best: f32) -> bool {
        match self {
            Metric::L2 => candidate < best,
            Metric::Cosine => candidate > best,
        }
    }

    pub fn accepts(self, score: f32, threshold: f32) -> bool {
        match self {
            Metric::L2 => score <= threshold,
            Metric::Cosine => score >= threshold,
        }
    }

    /// Score `reference` against `query`; `None` when the pair cannot be compared.
    pub fn score(self, query: &Embedding, reference: &Embedding) -> Option<f32> {
        if query.dim() != reference.dim() {
            return None;
        }
        match self {
            Metric::L2 => Some(query.euclidean_distance(reference)),
            Metric::Cosine => query.similarity(reference),
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Metric::L2 => f.write_str("l2"),
            Metric::Cosine => f.write_str("cosine"),
        }
    }
}

impl FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "l2" | "euclidean" => Ok(Metric::L2),
            "cosine" | "cos" => Ok(Metric::Cosine),
            other => Err(format!("unknown metric: {other} (expected l2 or cosine)")),
        }
    }
}

/// A detected face in source-image pixel coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl FaceBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }
}

/// One enrolled reference embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GalleryEntry {
    pub identity_id: String,
    /// Distinguishes several references of one identity (e.g. "default", "glasses").
    pub label: String,
    pub display_name: String,
    pub code: Option<String>,
    pub embedding: Embedding,
}

/// Result of matching a query embedding against a gallery.
///
/// Build through [`MatchResult::no_match`] or [`MatchResult::best`] so that
/// `matched` always agrees with the threshold test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub matched: bool,
    /// Identity of the accepted best entry, `None` when not matched.
    pub identity_id: Option<String>,
    pub display_name: Option<String>,
    /// Best distance (L2) or similarity (cosine), or the metric sentinel.
    pub score: f32,
    pub metric: Metric,
    /// Entries skipped because of a dimension mismatch or zero norm.
    pub skipped: usize,
}

impl MatchResult {
    pub fn no_match(metric: Metric, score: f32, skipped: usize) -> Self {
        Self {
            matched: false,
            identity_id: None,
            display_name: None,
            score,
            metric,
            skipped,
        }
    }

    /// Result for the best entry found; `matched` is decided here.
    pub fn best(
        metric: Metric,
        entry: &GalleryEntry,
        score: f32,
        threshold: f32,
        skipped: usize,
    ) -> Self {
        if metric.accepts(score, threshold) {
            Self {
                matched: true,
                identity_id: Some(entry.identity_id.clone()),
                display_name: Some(entry.display_name.clone()),
                score,
                metric,
                skipped,
            }
        } else {
            Self::no_match(metric, score, skipped)
        }
    }

    /// Value written to the attendance log.
    ///
    /// Cosine similarity is stored as-is; an L2 distance becomes
    /// `1 - min(1, distance)`, floored at zero.
    pub fn confidence(&self) -> f32 {
        match self.metric {
            Metric::Cosine => self.score,
            Metric::L2 => (1.0 - self.score.min(1.0)).max(0.0),
        }
    }
}
