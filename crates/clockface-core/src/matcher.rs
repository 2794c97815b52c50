//! Template matching against the enrolled registry.

use crate::types::{Embedding, FaceTemplate};
use serde::Serialize;
use thiserror::Error;

/// Default minimum similarity for a positive match.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.4;

const MIN_RECOMMENDED_THRESHOLD: f32 = 0.1;
const MAX_RECOMMENDED_THRESHOLD: f32 = 0.8;
const SINGLE_SAMPLE_STDEV: f32 = 0.1;

#[derive(Error, Debug, PartialEq)]
pub enum MatchError {
    #[error("match threshold must be within [0, 1], got {0}")]
    InvalidThreshold(f32),
}

/// Best registry match for a probe embedding.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub employee_id: String,
    /// Cosine similarity clipped to [0, 1].
    pub score: f32,
}

/// Outcome of verifying a probe against one specific identity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Verification {
    pub matched: bool,
    pub score: f32,
}

/// Strategy for comparing a probe embedding against a gallery of enrolled faces.
pub trait Matcher {
    /// Return the best gallery entry at or above the threshold.
    fn find_best(&self, probe: &Embedding, gallery: &[FaceTemplate]) -> Option<MatchResult>;

    /// Check a single candidate template. `None` (unknown or inactive id)
    /// never matches.
    fn verify(&self, probe: &Embedding, candidate: Option<&FaceTemplate>) -> Verification;
}

/// Cosine similarity matcher.
///
/// Always scans the whole gallery. On equal scores the first entry in
/// gallery order wins, so callers must pass a stably ordered gallery.
#[derive(Debug, Clone)]
pub struct CosineMatcher {
    threshold: f32,
}

impl Default for CosineMatcher {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_MATCH_THRESHOLD,
        }
    }
}

impl CosineMatcher {
    pub fn new(threshold: f32) -> Result<Self, MatchError> {
        let mut matcher = Self::default();
        matcher.set_threshold(threshold)?;
        Ok(matcher)
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Update the threshold. Values outside [0, 1] are rejected and the
    /// previous threshold is kept.
    pub fn set_threshold(&mut self, threshold: f32) -> Result<(), MatchError> {
        if !(0.0..=1.0).contains(&threshold) {
            tracing::warn!(threshold, "rejected match threshold");
            return Err(MatchError::InvalidThreshold(threshold));
        }
        self.threshold = threshold;
        Ok(())
    }
}

impl Matcher for CosineMatcher {
    fn find_best(&self, probe: &Embedding, gallery: &[FaceTemplate]) -> Option<MatchResult> {
        let mut best: Option<(usize, f32)> = None;
        let mut best_seen = 0.0f32;

        for (i, template) in gallery.iter().enumerate() {
            let score = probe.similarity(&template.embedding);
            tracing::trace!(employee_id = %template.employee_id, score, "compared template");
            best_seen = best_seen.max(score);

            if score < self.threshold {
                continue;
            }
            let is_better = match best {
                None => true,
                Some((_, prev)) => score > prev,
            };
            if is_better {
                best = Some((i, score));
            }
        }

        match best {
            Some((idx, score)) => {
                tracing::debug!(
                    employee_id = %gallery[idx].employee_id,
                    score,
                    "face recognized"
                );
                Some(MatchResult {
                    employee_id: gallery[idx].employee_id.clone(),
                    score,
                })
            }
            None => {
                tracing::debug!(
                    best_score = best_seen,
                    threshold = self.threshold,
                    gallery = gallery.len(),
                    "face not recognized"
                );
                None
            }
        }
    }

    fn verify(&self, probe: &Embedding, candidate: Option<&FaceTemplate>) -> Verification {
        let Some(template) = candidate else {
            return Verification {
                matched: false,
                score: 0.0,
            };
        };
        let score = probe.similarity(&template.embedding);
        Verification {
            matched: score >= self.threshold,
            score,
        }
    }
}

/// Suggest a match threshold from the scores of past successful matches.
///
/// One standard deviation below the mean, bounded to [0.1, 0.8]. With no
/// history the default threshold is returned.
pub fn recommend_threshold(scores: &[f32]) -> f32 {
    if scores.is_empty() {
        return DEFAULT_MATCH_THRESHOLD;
    }

    let n = scores.len() as f32;
    let mean = scores.iter().sum::<f32>() / n;
    let stdev = if scores.len() > 1 {
        let var = scores.iter().map(|s| (s - mean).powi(2)).sum::<f32>() / (n - 1.0);
        var.sqrt()
    } else {
        SINGLE_SAMPLE_STDEV
    };

    (mean - stdev)
        .max(MIN_RECOMMENDED_THRESHOLD)
        .min(MAX_RECOMMENDED_THRESHOLD)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(id: &str, values: Vec<f32>) -> FaceTemplate {
        FaceTemplate {
            employee_id: id.to_string(),
            embedding: Embedding::new(values),
        }
    }

    fn unit(dim: usize, axis: usize, sign: f32) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[axis] = sign;
        v
    }

    #[test]
    fn test_empty_gallery_no_match() {
        let probe = Embedding::new(vec![1.0, 0.0]);
        assert!(CosineMatcher::default().find_best(&probe, &[]).is_none());
    }

    #[test]
    fn test_exact_embedding_matches_with_full_score() {
        let probe = Embedding::new(unit(8, 0, 1.0));
        let gallery = vec![template("E1", unit(8, 0, 1.0))];

        let result = CosineMatcher::default().find_best(&probe, &gallery).unwrap();
        assert_eq!(result.employee_id, "E1");
        assert!((result.score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_opposite_embedding_does_not_match() {
        let probe = Embedding::new(unit(8, 0, -1.0));
        let gallery = vec![template("E1", unit(8, 0, 1.0))];
        assert!(CosineMatcher::default().find_best(&probe, &gallery).is_none());
    }

    #[test]
    fn test_scans_whole_gallery() {
        // Best match is the last entry.
        let probe = Embedding::new(vec![1.0, 0.0, 0.0]);
        let gallery = vec![
            template("decoy1", vec![0.0, 1.0, 0.0]),
            template("partial", vec![0.7, 0.7, 0.0]),
            template("match", vec![1.0, 0.0, 0.0]),
        ];

        let result = CosineMatcher::default().find_best(&probe, &gallery).unwrap();
        assert_eq!(result.employee_id, "match");
    }

    #[test]
    fn test_all_below_threshold_no_match() {
        let probe = Embedding::new(vec![1.0, 0.0, 0.0]);
        let gallery: Vec<_> = (0..50)
            .map(|i| template(&format!("E{i}"), vec![0.3, 1.0, 0.0]))
            .collect();
        // cos ≈ 0.287 for every entry
        assert!(CosineMatcher::default().find_best(&probe, &gallery).is_none());
    }

    #[test]
    fn test_tie_first_entry_wins() {
        let probe = Embedding::new(vec![1.0, 0.0]);
        let gallery = vec![
            template("first", vec![2.0, 0.0]),
            template("second", vec![1.0, 0.0]),
        ];
        let result = CosineMatcher::default().find_best(&probe, &gallery).unwrap();
        assert_eq!(result.employee_id, "first");
    }

    #[test]
    fn test_score_exactly_at_threshold_matches() {
        let probe = Embedding::new(vec![1.0, 0.0]);
        let gallery = vec![template("E1", vec![1.0, 0.0])];
        let matcher = CosineMatcher::new(1.0).unwrap();
        assert!(matcher.find_best(&probe, &gallery).is_some());
    }

    #[test]
    fn test_match_is_symmetric() {
        let a = template("a", vec![0.2, 0.9, 0.1]);
        let b = template("b", vec![0.4, 0.8, -0.2]);
        let matcher = CosineMatcher::default();

        let ab = matcher.find_best(&a.embedding, std::slice::from_ref(&b)).unwrap();
        let ba = matcher.find_best(&b.embedding, std::slice::from_ref(&a)).unwrap();
        assert_eq!(ab.score, ba.score);
    }

    #[test]
    fn test_verify_specific_identity() {
        let matcher = CosineMatcher::default();
        let probe = Embedding::new(vec![1.0, 0.0]);
        let enrolled = template("E1", vec![1.0, 0.1]);
        let other = template("E2", vec![0.0, 1.0]);

        let v = matcher.verify(&probe, Some(&enrolled));
        assert!(v.matched);
        assert!(v.score > 0.99);

        let v = matcher.verify(&probe, Some(&other));
        assert!(!v.matched);

        let v = matcher.verify(&probe, None);
        assert_eq!(v, Verification { matched: false, score: 0.0 });
    }

    #[test]
    fn test_threshold_setter_rejects_out_of_range() {
        let mut matcher = CosineMatcher::default();
        assert_eq!(matcher.set_threshold(1.5), Err(MatchError::InvalidThreshold(1.5)));
        assert_eq!(matcher.set_threshold(-0.1), Err(MatchError::InvalidThreshold(-0.1)));
        assert_eq!(matcher.threshold(), DEFAULT_MATCH_THRESHOLD);

        matcher.set_threshold(0.6).unwrap();
        assert_eq!(matcher.threshold(), 0.6);
    }

    #[test]
    fn test_recommend_threshold() {
        assert_eq!(recommend_threshold(&[]), DEFAULT_MATCH_THRESHOLD);
        assert!((recommend_threshold(&[0.7]) - 0.6).abs() < 1e-6);
        // Very high, tight scores are capped.
        assert_eq!(recommend_threshold(&[0.99, 0.99, 0.99]), MAX_RECOMMENDED_THRESHOLD);
        // Very low scores are floored.
        assert_eq!(recommend_threshold(&[0.05, 0.1]), MIN_RECOMMENDED_THRESHOLD);

        // mean 0.6, sample stdev 0.1
        let t = recommend_threshold(&[0.5, 0.6, 0.7]);
        assert!((t - 0.5).abs() < 1e-5, "got {t}");
    }
}
