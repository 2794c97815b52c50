//! clockface-core: face-recognition attendance engine.
//!
//! Heuristic and ONNX-backed liveness scoring, cosine template matching,
//! and the cooldown-gated in/out attendance state machine. Everything here
//! is synchronous; the daemon decides where it runs.

pub mod attendance;
pub mod liveness;
pub mod matcher;
pub mod onnx;
pub mod quality;
pub mod signals;
pub mod types;

pub use attendance::{
    AttendanceEvent, AttendanceLog, AttendanceState, AttendanceTracker, EventKind,
    MemoryAttendanceLog, RecordOutcome, Rejection, DEFAULT_COOLDOWN,
};
pub use liveness::{LivenessConfig, LivenessError, LivenessScorer, LivenessVerdict};
pub use matcher::{CosineMatcher, MatchError, MatchResult, Matcher, Verification};
pub use onnx::{EmbeddingExtractor, OnnxEmbedder, OnnxError, OnnxLivenessClassifier};
pub use types::{Embedding, FaceTemplate, Registry, RegistryEntry, TemplateSource};
