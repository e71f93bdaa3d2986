//! Nearest-neighbor search over an enrolled gallery.

use crate::types::{Embedding, GalleryEntry, MatchResult, Metric};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("query embedding is empty")]
    EmptyQuery,
    #[error("query embedding has zero norm")]
    ZeroNorm,
    #[error("query embedding contains non-finite values")]
    NonFinite,
}

/// Strategy for comparing a query embedding against a gallery of enrolled faces.
pub trait Matcher: Send {
    fn metric(&self) -> Metric;
    fn search(&self, query: &Embedding, gallery: &[GalleryEntry]) -> Result<MatchResult, MatchError>;
}

/// Linear-scan matcher keeping the single best entry.
///
/// Ties keep the first entry in gallery order.
#[derive(Debug, Clone, Copy)]
pub struct NearestNeighborMatcher {
    metric: Metric,
    threshold: f32,
}

impl NearestNeighborMatcher {
    pub fn new(metric: Metric, threshold: f32) -> Self {
        Self { metric, threshold }
    }

    pub fn l2(threshold: f32) -> Self {
        Self::new(Metric::L2, threshold)
    }

    pub fn cosine(threshold: f32) -> Self {
        Self::new(Metric::Cosine, threshold)
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    fn validate(query: &Embedding) -> Result<(), MatchError> {
        if query.values.is_empty() {
            return Err(MatchError::EmptyQuery);
        }
        if !query.is_finite() {
            return Err(MatchError::NonFinite);
        }
        if query.norm() == 0.0 {
            return Err(MatchError::ZeroNorm);
        }
        Ok(())
    }
}

impl Matcher for NearestNeighborMatcher {
    fn metric(&self) -> Metric {
        self.metric
    }

    fn search(&self, query: &Embedding, gallery: &[GalleryEntry]) -> Result<MatchResult, MatchError> {
        if gallery.is_empty() {
            return Ok(MatchResult::no_match(self.metric, self.metric.sentinel(), 0));
        }
        Self::validate(query)?;

        let mut best: Option<(usize, f32)> = None;
        let mut skipped = 0usize;

        for (i, entry) in gallery.iter().enumerate() {
            let Some(score) = self.metric.score(query, &entry.embedding) else {
                skipped += 1;
                continue;
            };
            let better = match best {
                None => true,
                Some((_, best_score)) => self.metric.is_better(score, best_score),
            };
            if better {
                best = Some((i, score));
            }
        }

        if skipped > 0 {
            tracing::debug!(skipped, dim = query.dim(), "skipped incomparable gallery entries");
        }

        Ok(match best {
            Some((idx, score)) => {
                MatchResult::best(self.metric, &gallery[idx], score, self.threshold, skipped)
            }
            None => MatchResult::no_match(self.metric, self.metric.sentinel(), skipped),
        })
    }
}
