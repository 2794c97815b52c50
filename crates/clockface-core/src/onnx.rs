//! ONNX Runtime adapters for the external models.
//!
//! - [`OnnxEmbedder`]: ArcFace-style face embedder (112x112 input).
//! - [`OnnxLivenessClassifier`]: MiniFASNet-style real/spoof classifier
//!   (80x80 input, class 1 = real).
//!
//! Both take an already cropped face image. Sessions are not shareable;
//! the daemon keeps them on its engine thread.

use crate::liveness::{LivenessClassifier, LivenessVerdict};
use crate::types::Embedding;
use image::imageops::FilterType;
use image::DynamicImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const EMBEDDER_INPUT_SIZE: u32 = 112;
const EMBEDDER_MEAN: f32 = 127.5;
const EMBEDDER_STD: f32 = 127.5;
const EMBEDDER_MODEL_VERSION: &str = "arcface";

const LIVENESS_INPUT_SIZE: u32 = 80;
const LIVENESS_REAL_CLASS: usize = 1;

/// Smallest face side accepted by the embedder by default.
pub const DEFAULT_MIN_FACE_SIZE: u32 = 80;

#[derive(Error, Debug)]
pub enum OnnxError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Produces a face embedding from a face image.
///
/// `Ok(None)` means no usable face was found; it is a normal outcome, not
/// an error.
pub trait EmbeddingExtractor: Send {
    fn extract(&mut self, image: &DynamicImage) -> Result<Option<Embedding>, OnnxError>;
}

fn load_session(model_path: &Path, kind: &str) -> Result<Session, OnnxError> {
    if !model_path.exists() {
        return Err(OnnxError::ModelNotFound(model_path.display().to_string()));
    }

    let session = Session::builder()?
        .with_intra_threads(2)?
        .commit_from_file(model_path)?;

    tracing::info!(
        path = %model_path.display(),
        model = kind,
        inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
        outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
        "loaded ONNX model"
    );

    Ok(session)
}

/// ArcFace-style embedder.
pub struct OnnxEmbedder {
    session: Session,
    min_face_size: u32,
}

impl OnnxEmbedder {
    pub fn load(model_path: &Path, min_face_size: u32) -> Result<Self, OnnxError> {
        Ok(Self {
            session: load_session(model_path, "embedder")?,
            min_face_size,
        })
    }

    /// Resize to 112x112 RGB and normalize each channel to roughly [-1, 1].
    fn preprocess(image: &DynamicImage) -> Array4<f32> {
        let size = EMBEDDER_INPUT_SIZE as usize;
        let rgb = image
            .resize_exact(EMBEDDER_INPUT_SIZE, EMBEDDER_INPUT_SIZE, FilterType::Triangle)
            .to_rgb8();

        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        for (x, y, pixel) in rgb.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] =
                    (pixel[c] as f32 - EMBEDDER_MEAN) / EMBEDDER_STD;
            }
        }
        tensor
    }
}

impl EmbeddingExtractor for OnnxEmbedder {
    fn extract(&mut self, image: &DynamicImage) -> Result<Option<Embedding>, OnnxError> {
        if image.width() < self.min_face_size || image.height() < self.min_face_size {
            tracing::debug!(
                width = image.width(),
                height = image.height(),
                min = self.min_face_size,
                "face too small for embedding"
            );
            return Ok(None);
        }

        let input = Self::preprocess(image);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| OnnxError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.is_empty() {
            return Err(OnnxError::InferenceFailed("empty embedding output".into()));
        }
        Ok(l2_normalize(raw).map(|values| Embedding {
            values,
            model_version: Some(EMBEDDER_MODEL_VERSION.to_string()),
        }))
    }
}

/// Unit-length copy of `raw`, or `None` for a zero or non-finite norm.
fn l2_normalize(raw: &[f32]) -> Option<Vec<f32>> {
    let norm = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 && norm.is_finite() {
        Some(raw.iter().map(|x| x / norm).collect())
    } else {
        tracing::debug!("embedding has zero norm; treating as no face");
        None
    }
}

/// MiniFASNet-style liveness classifier.
pub struct OnnxLivenessClassifier {
    session: Session,
}

impl OnnxLivenessClassifier {
    pub fn load(model_path: &Path) -> Result<Self, OnnxError> {
        Ok(Self {
            session: load_session(model_path, "liveness")?,
        })
    }

    /// Resize to 80x80 RGB scaled to [0, 1].
    fn preprocess(image: &DynamicImage) -> Array4<f32> {
        let size = LIVENESS_INPUT_SIZE as usize;
        let rgb = image
            .resize_exact(LIVENESS_INPUT_SIZE, LIVENESS_INPUT_SIZE, FilterType::Triangle)
            .to_rgb8();

        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        for (x, y, pixel) in rgb.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] = pixel[c] as f32 / 255.0;
            }
        }
        tensor
    }

    fn run(&mut self, image: &DynamicImage) -> Result<LivenessVerdict, OnnxError> {
        if image.width() == 0 || image.height() == 0 {
            return Err(OnnxError::InferenceFailed("empty image".into()));
        }

        let input = Self::preprocess(image);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, logits) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| OnnxError::InferenceFailed(format!("liveness logits: {e}")))?;

        verdict_from_logits(logits)
    }
}

impl LivenessClassifier for OnnxLivenessClassifier {
    fn classify(&mut self, image: &DynamicImage) -> Option<LivenessVerdict> {
        match self.run(image) {
            Ok(verdict) => Some(verdict),
            Err(e) => {
                tracing::warn!(error = %e, "liveness classifier failed");
                None
            }
        }
    }
}

fn verdict_from_logits(logits: &[f32]) -> Result<LivenessVerdict, OnnxError> {
    if logits.len() <= LIVENESS_REAL_CLASS {
        return Err(OnnxError::InferenceFailed(format!(
            "expected at least {} classes, got {}",
            LIVENESS_REAL_CLASS + 1,
            logits.len()
        )));
    }

    let probs = softmax(logits);
    let argmax = probs
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (i, &p)| {
            if p > best.1 {
                (i, p)
            } else {
                best
            }
        })
        .0;

    let score = probs[LIVENESS_REAL_CLASS];
    if !score.is_finite() {
        return Err(OnnxError::InferenceFailed("non-finite liveness output".into()));
    }

    Ok(LivenessVerdict {
        is_real: argmax == LIVENESS_REAL_CLASS,
        score,
    })
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}
