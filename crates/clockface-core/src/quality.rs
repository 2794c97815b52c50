//! Enrollment image quality heuristic.

use crate::signals::{mean_std, Plane};
use image::DynamicImage;

const MIN_GOOD_SIDE: usize = 100;
const DARK_MEAN: f64 = 50.0;
const BRIGHT_MEAN: f64 = 200.0;
const BLUR_LAPLACIAN_VAR: f64 = 100.0;

/// Quality score in [0, 1] for a face crop; higher is better.
///
/// Starts at 1.0 and is multiplied down for small size (0.5), darkness
/// (0.7) or over-exposure (0.8), and blur (0.6, Laplacian variance below
/// 100). An empty image scores 0.0.
pub fn face_quality(image: &DynamicImage) -> f32 {
    let plane = match Plane::from_image(image, 1) {
        Ok(p) => p,
        Err(e) => {
            tracing::debug!(error = %e, "quality check on unusable image");
            return 0.0;
        }
    };

    let mut score = 1.0f64;

    if plane.width < MIN_GOOD_SIDE || plane.height < MIN_GOOD_SIDE {
        score *= 0.5;
    }

    let (brightness, _) = mean_std(plane.data.iter().copied());
    if brightness < DARK_MEAN {
        score *= 0.7;
    } else if brightness > BRIGHT_MEAN {
        score *= 0.8;
    }

    let lap = laplacian(&plane);
    let (_, lap_std) = mean_std(lap.iter().copied());
    let sharpness = lap_std * lap_std;
    if sharpness < BLUR_LAPLACIAN_VAR {
        score *= 0.6;
    }

    tracing::debug!(brightness, sharpness, score, "face quality");
    score.clamp(0.0, 1.0) as f32
}

/// 4-neighbour Laplacian with reflected borders.
fn laplacian(plane: &Plane) -> Vec<f64> {
    let mut out = Vec::with_capacity(plane.data.len());
    for r in 0..plane.height as isize {
        for c in 0..plane.width as isize {
            let v = plane.reflect(r - 1, c)
                + plane.reflect(r + 1, c)
                + plane.reflect(r, c - 1)
                + plane.reflect(r, c + 1)
                - 4.0 * plane.reflect(r, c);
            out.push(v);
        }
    }
    out
}
