//! Liveness (anti-spoofing) scoring.
//!
//! A [`LivenessScorer`] owns one [`LivenessEstimator`] strategy: either the
//! multi-signal heuristic, or a trained classifier that falls back to the
//! heuristic for images it cannot classify. Callers see the same
//! [`LivenessVerdict`] either way.
//!
//! # Fail-open tradeoff
//!
//! When an estimator errors or panics, the scorer returns
//! [`LivenessVerdict::PASS`]: an engine bug never blocks an employee from
//! clocking in, at the cost of disabling spoof protection for that capture.
//! Every such event is logged at `error` level.

use crate::signals::Signal;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;
use thiserror::Error;

/// Default score above which a capture is considered live.
pub const DEFAULT_LIVENESS_THRESHOLD: f32 = 0.5;

#[derive(Error, Debug, PartialEq)]
pub enum LivenessError {
    #[error("liveness threshold must be within [0, 1], got {0}")]
    InvalidThreshold(f32),
    #[error("liveness estimator failed: {0}")]
    Estimator(String),
}

/// Decision for one capture.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LivenessVerdict {
    pub is_real: bool,
    /// Realism score in [0, 1].
    pub score: f32,
}

impl LivenessVerdict {
    /// Permissive verdict used when liveness is disabled or fails.
    pub const PASS: LivenessVerdict = LivenessVerdict {
        is_real: true,
        score: 1.0,
    };
}

/// Liveness settings owned by one scorer instance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LivenessConfig {
    pub enabled: bool,
    pub threshold: f32,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: DEFAULT_LIVENESS_THRESHOLD,
        }
    }
}

/// Strategy producing a liveness verdict for one image.
pub trait LivenessEstimator: Send {
    /// Short name for logs and status output.
    fn name(&self) -> &'static str;

    fn estimate(
        &mut self,
        image: &DynamicImage,
        threshold: f32,
    ) -> Result<LivenessVerdict, LivenessError>;
}

/// A trained real/spoof classifier.
///
/// Returns `None` when it cannot classify the image (e.g. inference failed);
/// the caller then falls back to the heuristic.
pub trait LivenessClassifier: Send {
    fn classify(&mut self, image: &DynamicImage) -> Option<LivenessVerdict>;
}

/// Per-signal breakdown of a heuristic estimate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SignalScores {
    pub color: f32,
    pub texture: f32,
    pub frequency: f32,
    pub reflection: f32,
}

impl SignalScores {
    pub fn compute(image: &DynamicImage) -> Self {
        Self {
            color: Signal::Color.score(image),
            texture: Signal::Texture.score(image),
            frequency: Signal::Frequency.score(image),
            reflection: Signal::Reflection.score(image),
        }
    }

    /// Arithmetic mean of the four signals.
    pub fn mean(&self) -> f32 {
        (self.color + self.texture + self.frequency + self.reflection) / 4.0
    }
}

/// Heuristic estimator averaging the four image signals.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeuristicEstimator;

impl LivenessEstimator for HeuristicEstimator {
    fn name(&self) -> &'static str {
        "heuristic"
    }

    fn estimate(
        &mut self,
        image: &DynamicImage,
        threshold: f32,
    ) -> Result<LivenessVerdict, LivenessError> {
        let scores = SignalScores::compute(image);
        let score = scores.mean();

        tracing::debug!(
            color = scores.color,
            texture = scores.texture,
            frequency = scores.frequency,
            reflection = scores.reflection,
            score,
            "heuristic liveness scores"
        );

        Ok(LivenessVerdict {
            is_real: score > threshold,
            score,
        })
    }
}

/// Trained-classifier estimator with per-image heuristic fallback.
pub struct ClassifierEstimator {
    classifier: Box<dyn LivenessClassifier>,
    fallback: HeuristicEstimator,
}

impl ClassifierEstimator {
    pub fn new(classifier: Box<dyn LivenessClassifier>) -> Self {
        Self {
            classifier,
            fallback: HeuristicEstimator,
        }
    }
}

impl LivenessEstimator for ClassifierEstimator {
    fn name(&self) -> &'static str {
        "classifier"
    }

    fn estimate(
        &mut self,
        image: &DynamicImage,
        threshold: f32,
    ) -> Result<LivenessVerdict, LivenessError> {
        match self.classifier.classify(image) {
            Some(verdict) => Ok(verdict),
            None => {
                tracing::warn!("liveness classifier unavailable for this image; using heuristic");
                self.fallback.estimate(image, threshold)
            }
        }
    }
}

/// Public liveness entry point.
pub struct LivenessScorer {
    estimator: Box<dyn LivenessEstimator>,
    config: LivenessConfig,
}

impl LivenessScorer {
    pub fn new(
        estimator: Box<dyn LivenessEstimator>,
        config: LivenessConfig,
    ) -> Result<Self, LivenessError> {
        validate_threshold(config.threshold)?;
        tracing::info!(
            estimator = estimator.name(),
            enabled = config.enabled,
            threshold = config.threshold,
            "liveness scorer initialized"
        );
        Ok(Self { estimator, config })
    }

    /// Scorer using only the heuristic signals.
    pub fn heuristic(config: LivenessConfig) -> Result<Self, LivenessError> {
        Self::new(Box::new(HeuristicEstimator), config)
    }

    /// Scorer preferring a trained classifier.
    pub fn with_classifier(
        classifier: Box<dyn LivenessClassifier>,
        config: LivenessConfig,
    ) -> Result<Self, LivenessError> {
        Self::new(Box::new(ClassifierEstimator::new(classifier)), config)
    }

    pub fn config(&self) -> LivenessConfig {
        self.config
    }

    pub fn estimator_name(&self) -> &'static str {
        self.estimator.name()
    }

    /// Update the threshold. Out-of-range values are rejected and the
    /// previous threshold is kept.
    pub fn set_threshold(&mut self, threshold: f32) -> Result<(), LivenessError> {
        if let Err(e) = validate_threshold(threshold) {
            tracing::warn!(threshold, "rejected liveness threshold");
            return Err(e);
        }
        self.config.threshold = threshold;
        tracing::info!(threshold, "liveness threshold updated");
        Ok(())
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.config.enabled = enabled;
        tracing::info!(enabled, "liveness detection toggled");
    }

    /// Score one capture. Never fails; see the module docs for the
    /// fail-open policy.
    pub fn score(&mut self, image: &DynamicImage) -> LivenessVerdict {
        if !self.config.enabled {
            return LivenessVerdict::PASS;
        }

        let start = Instant::now();
        let threshold = self.config.threshold;
        let estimator = &mut self.estimator;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| estimator.estimate(image, threshold)));

        let verdict = match outcome {
            Ok(Ok(v)) if v.score.is_finite() => v,
            Ok(Ok(v)) => {
                tracing::error!(score = v.score, "non-finite liveness score; failing open");
                LivenessVerdict::PASS
            }
            Ok(Err(e)) => {
                tracing::error!(error = %e, "liveness estimation failed; failing open");
                LivenessVerdict::PASS
            }
            Err(_) => {
                tracing::error!("liveness estimator panicked; failing open");
                LivenessVerdict::PASS
            }
        };

        tracing::debug!(
            estimator = self.estimator.name(),
            is_real = verdict.is_real,
            score = verdict.score,
            elapsed_ms = start.elapsed().as_secs_f64() * 1000.0,
            "liveness verdict"
        );
        verdict
    }
}

fn validate_threshold(threshold: f32) -> Result<(), LivenessError> {
    if (0.0..=1.0).contains(&threshold) {
        Ok(())
    } else {
        Err(LivenessError::InvalidThreshold(threshold))
    }
}

/// Convenience: heuristic score for a single image with default settings.
pub fn heuristic_verdict(image: &DynamicImage) -> LivenessVerdict {
    let score = SignalScores::compute(image).mean();
    LivenessVerdict {
        is_real: score > DEFAULT_LIVENESS_THRESHOLD,
        score,
    }
}
