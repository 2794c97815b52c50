use clockface_core::liveness::LivenessScorer;
use clockface_core::types::fit_within;
use clockface_core::{
    quality, CosineMatcher, Embedding, EmbeddingExtractor, FaceTemplate, LivenessConfig,
    LivenessError, LivenessVerdict, MatchError, MatchResult, Matcher, OnnxEmbedder,
    OnnxLivenessClassifier, Verification,
};
use image::DynamicImage;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::config::Config;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("model error: {0}")]
    Model(#[from] clockface_core::OnnxError),
    #[error("image could not be decoded: {0}")]
    Decode(#[from] image::ImageError),
    #[error(transparent)]
    Liveness(#[from] LivenessError),
    #[error(transparent)]
    Match(#[from] MatchError),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Outcome of running a capture through liveness and embedding.
#[derive(Debug, Clone)]
pub enum Capture {
    /// Liveness rejected the capture.
    Spoof(LivenessVerdict),
    /// No usable face in the image.
    NoFace,
    Face {
        embedding: Embedding,
        liveness: LivenessVerdict,
        quality: f32,
    },
}

/// Outcome of a recognition request.
#[derive(Debug, Clone)]
pub enum Recognition {
    Spoof(LivenessVerdict),
    NoFace,
    Unrecognized,
    Matched(MatchResult),
}

/// Snapshot of engine settings for status reporting.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EngineStatus {
    pub liveness_estimator: &'static str,
    pub liveness_enabled: bool,
    pub liveness_threshold: f32,
    pub match_threshold: f32,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Capture {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<Capture, EngineError>>,
    },
    Recognize {
        image: Vec<u8>,
        gallery: Vec<FaceTemplate>,
        reply: oneshot::Sender<Result<Recognition, EngineError>>,
    },
    Verify {
        image: Vec<u8>,
        candidate: Option<FaceTemplate>,
        reply: oneshot::Sender<Result<Verification, EngineError>>,
    },
    ScoreLiveness {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<LivenessVerdict, EngineError>>,
    },
    SetLivenessThreshold {
        threshold: f32,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    SetMatchThreshold {
        threshold: f32,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    SetLivenessEnabled {
        enabled: bool,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Status {
        reply: oneshot::Sender<Result<EngineStatus, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, EngineError>>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Liveness gate, embedding, and quality score for an enrollment image.
    pub async fn capture(&self, image: Vec<u8>) -> Result<Capture, EngineError> {
        self.request(|reply| EngineRequest::Capture { image, reply }).await
    }

    /// Liveness gate, embedding, then a full scan of `gallery`.
    pub async fn recognize(
        &self,
        image: Vec<u8>,
        gallery: Vec<FaceTemplate>,
    ) -> Result<Recognition, EngineError> {
        self.request(|reply| EngineRequest::Recognize {
            image,
            gallery,
            reply,
        })
        .await
    }

    /// Compare a capture against one identity. Spoofed or faceless
    /// captures never match.
    pub async fn verify(
        &self,
        image: Vec<u8>,
        candidate: Option<FaceTemplate>,
    ) -> Result<Verification, EngineError> {
        self.request(|reply| EngineRequest::Verify {
            image,
            candidate,
            reply,
        })
        .await
    }

    pub async fn score_liveness(&self, image: Vec<u8>) -> Result<LivenessVerdict, EngineError> {
        self.request(|reply| EngineRequest::ScoreLiveness { image, reply })
            .await
    }

    pub async fn set_liveness_threshold(&self, threshold: f32) -> Result<(), EngineError> {
        self.request(|reply| EngineRequest::SetLivenessThreshold { threshold, reply })
            .await
    }

    pub async fn set_match_threshold(&self, threshold: f32) -> Result<(), EngineError> {
        self.request(|reply| EngineRequest::SetMatchThreshold { threshold, reply })
            .await
    }

    /// Switch the liveness gate on or off. While off every capture passes.
    pub async fn set_liveness_enabled(&self, enabled: bool) -> Result<(), EngineError> {
        self.request(|reply| EngineRequest::SetLivenessEnabled { enabled, reply })
            .await
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        self.request(|reply| EngineRequest::Status { reply }).await
    }
}

/// Inference state owned by the engine thread.
pub struct Engine {
    liveness: LivenessScorer,
    embedder: Box<dyn EmbeddingExtractor>,
    matcher: CosineMatcher,
    max_image_side: u32,
}

impl Engine {
    pub fn new(
        liveness: LivenessScorer,
        embedder: Box<dyn EmbeddingExtractor>,
        matcher: CosineMatcher,
        max_image_side: u32,
    ) -> Self {
        Self {
            liveness,
            embedder,
            matcher,
            max_image_side,
        }
    }

    /// Build the engine from configuration.
    ///
    /// The embedding model is required. A missing liveness model falls back
    /// to the heuristic estimator.
    pub fn from_config(config: &Config) -> Result<Self, EngineError> {
        let embedder = OnnxEmbedder::load(&config.embedder_model_path(), config.min_face_size)?;

        let liveness_config = LivenessConfig {
            enabled: config.liveness_enabled,
            threshold: config.liveness_threshold,
        };
        let liveness = match OnnxLivenessClassifier::load(&config.liveness_model_path()) {
            Ok(classifier) => LivenessScorer::with_classifier(Box::new(classifier), liveness_config)?,
            Err(e) => {
                tracing::warn!(error = %e, "liveness model unavailable; using heuristic estimator");
                LivenessScorer::heuristic(liveness_config)?
            }
        };

        let matcher = CosineMatcher::new(config.match_threshold)?;
        Ok(Self::new(liveness, Box::new(embedder), matcher, config.max_image_side))
    }

    fn decode(&self, bytes: &[u8]) -> Result<DynamicImage, EngineError> {
        let image = image::load_from_memory(bytes)?;
        Ok(fit_within(image, self.max_image_side))
    }

    fn capture(&mut self, bytes: &[u8]) -> Result<Capture, EngineError> {
        let image = self.decode(bytes)?;

        let liveness = self.liveness.score(&image);
        if !liveness.is_real {
            tracing::info!(score = liveness.score, "capture rejected by liveness check");
            return Ok(Capture::Spoof(liveness));
        }

        let Some(embedding) = self.embedder.extract(&image)? else {
            return Ok(Capture::NoFace);
        };

        Ok(Capture::Face {
            embedding,
            liveness,
            quality: quality::face_quality(&image),
        })
    }

    fn recognize(&mut self, bytes: &[u8], gallery: &[FaceTemplate]) -> Result<Recognition, EngineError> {
        Ok(match self.capture(bytes)? {
            Capture::Spoof(v) => Recognition::Spoof(v),
            Capture::NoFace => Recognition::NoFace,
            Capture::Face { embedding, .. } => match self.matcher.find_best(&embedding, gallery) {
                Some(result) => Recognition::Matched(result),
                None => Recognition::Unrecognized,
            },
        })
    }

    fn verify(&mut self, bytes: &[u8], candidate: Option<&FaceTemplate>) -> Result<Verification, EngineError> {
        match self.capture(bytes)? {
            Capture::Face { embedding, .. } => Ok(self.matcher.verify(&embedding, candidate)),
            Capture::Spoof(_) | Capture::NoFace => Ok(Verification {
                matched: false,
                score: 0.0,
            }),
        }
    }

    fn status(&self) -> EngineStatus {
        let liveness = self.liveness.config();
        EngineStatus {
            liveness_estimator: self.liveness.estimator_name(),
            liveness_enabled: liveness.enabled,
            liveness_threshold: liveness.threshold,
            match_threshold: self.matcher.threshold(),
        }
    }

    fn handle(&mut self, req: EngineRequest) {
        match req {
            EngineRequest::Capture { image, reply } => {
                let _ = reply.send(self.capture(&image));
            }
            EngineRequest::Recognize {
                image,
                gallery,
                reply,
            } => {
                let _ = reply.send(self.recognize(&image, &gallery));
            }
            EngineRequest::Verify {
                image,
                candidate,
                reply,
            } => {
                let _ = reply.send(self.verify(&image, candidate.as_ref()));
            }
            EngineRequest::ScoreLiveness { image, reply } => {
                let result = self.decode(&image).map(|img| self.liveness.score(&img));
                let _ = reply.send(result);
            }
            EngineRequest::SetLivenessThreshold { threshold, reply } => {
                let _ = reply.send(self.liveness.set_threshold(threshold).map_err(Into::into));
            }
            EngineRequest::SetMatchThreshold { threshold, reply } => {
                let result = self.matcher.set_threshold(threshold).map_err(Into::into);
                if result.is_ok() {
                    tracing::info!(threshold, "match threshold updated");
                }
                let _ = reply.send(result);
            }
            EngineRequest::SetLivenessEnabled { enabled, reply } => {
                self.liveness.set_enabled(enabled);
                let _ = reply.send(Ok(()));
            }
            EngineRequest::Status { reply } => {
                let _ = reply.send(Ok(self.status()));
            }
        }
    }
}

/// Spawn the engine on a dedicated OS thread and return its handle.
pub fn spawn_engine(mut engine: Engine) -> EngineHandle {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("clockface-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                engine.handle(req);
            }
            tracing::info!("engine thread exiting");
        })
        .expect("failed to spawn engine thread");

    EngineHandle { tx }
}
