use image::imageops::FilterType;
use image::DynamicImage;
use serde::{Deserialize, Serialize};

/// Face embedding vector produced by an external recognition model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "arcface").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    /// Raw cosine similarity in [-1, 1].
    ///
    /// Zero-norm vectors and vectors of different lengths are incomparable
    /// and yield 0.0. Always processes every dimension.
    pub fn cosine(&self, other: &Embedding) -> f32 {
        if self.values.len() != other.values.len() {
            return 0.0;
        }

        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 && denom.is_finite() {
            dot / denom
        } else {
            0.0
        }
    }

    /// Match score: cosine similarity clipped to [0, 1].
    ///
    /// Opposite directions score 0.0, never negative.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let cos = self.cosine(other);
        if cos.is_nan() {
            0.0
        } else {
            cos.clamp(0.0, 1.0)
        }
    }
}

/// An enrolled face template. Immutable once stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceTemplate {
    pub employee_id: String,
    pub embedding: Embedding,
}

/// Registry slot: a template plus its activation flag.
///
/// Deactivated entries are kept so attendance history keeps a valid owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub template: FaceTemplate,
    pub active: bool,
}

/// Source of enrolled templates for matching.
///
/// Implementations must return active templates in a stable order
/// (enrollment order) so tie-breaks are reproducible across runs.
pub trait TemplateSource {
    fn active_templates(&self) -> Vec<FaceTemplate>;
    fn active_template(&self, employee_id: &str) -> Option<FaceTemplate>;
}

/// In-memory identity registry keeping insertion order.
#[derive(Debug, Default, Clone)]
pub struct Registry {
    entries: Vec<RegistryEntry>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a registry from stored entries, oldest enrollment first.
    pub fn from_entries(entries: Vec<RegistryEntry>) -> Self {
        Self { entries }
    }

    /// Add an active template. Returns `false` if the id is already active.
    pub fn enroll(&mut self, employee_id: &str, embedding: Embedding) -> bool {
        if self.active_template(employee_id).is_some() {
            return false;
        }
        self.entries.push(RegistryEntry {
            template: FaceTemplate {
                employee_id: employee_id.to_string(),
                embedding,
            },
            active: true,
        });
        true
    }

    /// Clear the active flag of an entry. Returns whether anything changed.
    pub fn deactivate(&mut self, employee_id: &str) -> bool {
        let mut changed = false;
        for entry in self
            .entries
            .iter_mut()
            .filter(|e| e.active && e.template.employee_id == employee_id)
        {
            entry.active = false;
            changed = true;
        }
        changed
    }

    pub fn entries(&self) -> &[RegistryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl TemplateSource for Registry {
    fn active_templates(&self) -> Vec<FaceTemplate> {
        self.entries
            .iter()
            .filter(|e| e.active)
            .map(|e| e.template.clone())
            .collect()
    }

    fn active_template(&self, employee_id: &str) -> Option<FaceTemplate> {
        self.entries
            .iter()
            .find(|e| e.active && e.template.employee_id == employee_id)
            .map(|e| e.template.clone())
    }
}

/// Validate an employee id: 3–20 characters of `[A-Za-z0-9_-]`.
pub fn is_valid_employee_id(id: &str) -> bool {
    (3..=20).contains(&id.len())
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Downscale so the longer side is at most `max_side`, keeping the aspect
/// ratio. Smaller images are returned unchanged.
pub fn fit_within(image: DynamicImage, max_side: u32) -> DynamicImage {
    let (w, h) = (image.width(), image.height());
    if max_side == 0 || w.max(h) <= max_side {
        return image;
    }
    let (nw, nh) = if h > w {
        (((w as u64 * max_side as u64) / h as u64).max(1) as u32, max_side)
    } else {
        (max_side, ((h as u64 * max_side as u64) / w as u64).max(1) as u32)
    };
    tracing::debug!(from = ?(w, h), to = ?(nw, nh), "downscaling input image");
    image.resize_exact(nw, nh, FilterType::Triangle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_similarity_identical() {
        let a = Embedding::new(vec![1.0, 0.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0, 0.0]);
        assert!((a.similarity(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_orthogonal() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![0.0, 1.0]);
        assert!(a.similarity(&b).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_opposite_is_clipped() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![-1.0, 0.0]);
        assert!((a.cosine(&b) + 1.0).abs() < 1e-6);
        assert_eq!(a.similarity(&b), 0.0);
    }

    #[test]
    fn test_similarity_zero_vector() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0]);
        assert_eq!(a.similarity(&b), 0.0);
    }

    #[test]
    fn test_similarity_length_mismatch() {
        let a = Embedding::new(vec![1.0, 0.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0]);
        assert_eq!(a.similarity(&b), 0.0);
    }

    #[test]
    fn test_similarity_symmetric() {
        let a = Embedding::new(vec![0.3, -0.7, 0.2, 0.9]);
        let b = Embedding::new(vec![0.5, 0.1, -0.4, 0.6]);
        assert_eq!(a.similarity(&b), b.similarity(&a));
    }

    #[test]
    fn test_registry_keeps_insertion_order() {
        let mut reg = Registry::new();
        assert!(reg.enroll("E3", Embedding::new(vec![1.0])));
        assert!(reg.enroll("E1", Embedding::new(vec![1.0])));
        assert!(reg.enroll("E2", Embedding::new(vec![1.0])));

        let ids: Vec<_> = reg
            .active_templates()
            .into_iter()
            .map(|t| t.employee_id)
            .collect();
        assert_eq!(ids, vec!["E3", "E1", "E2"]);
    }

    #[test]
    fn test_registry_rejects_duplicate_active() {
        let mut reg = Registry::new();
        assert!(reg.enroll("E1", Embedding::new(vec![1.0])));
        assert!(!reg.enroll("E1", Embedding::new(vec![0.5])));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_deactivate_keeps_entry() {
        let mut reg = Registry::new();
        reg.enroll("E1", Embedding::new(vec![1.0]));
        assert!(reg.deactivate("E1"));
        assert!(!reg.deactivate("E1"));

        assert_eq!(reg.len(), 1);
        assert!(!reg.entries()[0].active);
        assert!(reg.active_templates().is_empty());
        assert!(reg.active_template("E1").is_none());

        // A deactivated id may be enrolled again.
        assert!(reg.enroll("E1", Embedding::new(vec![1.0])));
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_fit_within_keeps_aspect() {
        let wide = fit_within(DynamicImage::new_rgb8(1280, 720), 640);
        assert_eq!((wide.width(), wide.height()), (640, 360));

        let tall = fit_within(DynamicImage::new_rgb8(300, 900), 600);
        assert_eq!((tall.width(), tall.height()), (200, 600));

        let small = fit_within(DynamicImage::new_rgb8(320, 240), 640);
        assert_eq!((small.width(), small.height()), (320, 240));
    }

    #[test]
    fn test_employee_id_validation() {
        assert!(is_valid_employee_id("E-100"));
        assert!(is_valid_employee_id("emp_0001"));
        assert!(!is_valid_employee_id("E1"));
        assert!(!is_valid_employee_id("has space"));
        assert!(!is_valid_employee_id("a".repeat(21).as_str()));
        assert!(!is_valid_employee_id("ünï"));
    }
}
