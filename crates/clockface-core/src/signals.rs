//! Image signal extractors for heuristic anti-spoofing.
//!
//! Each extractor maps one image cue to a realism score in [0, 1], higher
//! meaning more likely a live face:
//!
//! - **color**: saturation spread and per-channel histogram entropy. Printed
//!   photos and screens flatten both.
//! - **texture**: local binary pattern variance and Sobel gradient energy.
//! - **frequency**: share of log-spectrum energy outside the low-frequency disk.
//! - **reflection**: size of specular highlight blobs. Skin produces small
//!   scattered highlights; glossy paper and displays produce large glare.
//!
//! Extractors are pure and never fail: malformed input yields
//! [`NEUTRAL_SCORE`] (fail open) and a log line.

use image::DynamicImage;
use ndarray::Array2;
use rustfft::num_complex::Complex;
use rustfft::FftPlanner;
use serde::Serialize;
use std::f64::consts::PI;
use thiserror::Error;

/// Score returned when a signal cannot be computed.
pub const NEUTRAL_SCORE: f32 = 0.5;

const HIGH: f32 = 0.8;
const MEDIUM: f32 = 0.6;
const LOW: f32 = 0.3;

// Color buckets
const SAT_STD_HIGH: f64 = 20.0;
const SAT_MEAN_HIGH: f64 = 50.0;
const SAT_STD_MEDIUM: f64 = 10.0;
const SAT_MEAN_MEDIUM: f64 = 30.0;
const ENTROPY_HIGH: f64 = 6.0;
const ENTROPY_MEDIUM: f64 = 4.0;

// Texture buckets
const LBP_RADIUS: f64 = 1.0;
const LBP_POINTS: usize = 8;
// Interpolated samples within this of the centre count as equal.
const LBP_EPSILON: f64 = 1e-9;
const LBP_VAR_HIGH: f64 = 1000.0;
const LBP_VAR_MEDIUM: f64 = 500.0;
const GRAD_HIGH: f64 = 10.0;
const GRAD_MEDIUM: f64 = 5.0;

// Frequency buckets
const HF_RATIO_HIGH: f64 = 0.3;
const HF_RATIO_MEDIUM: f64 = 0.2;
const ENERGY_EPSILON: f64 = 1e-10;

// Reflection buckets
const HIGHLIGHT_PERCENTILE: f64 = 95.0;
const SPOT_AVG_MIN: f64 = 10.0;
const SPOT_AVG_MAX: f64 = 100.0;
const SPOT_MAX_AREA: usize = 500;
const SPOT_AVG_MEDIUM: f64 = 200.0;
const NO_HIGHLIGHT_SCORE: f32 = 0.4;

#[derive(Error, Debug)]
pub enum SignalError {
    #[error("image has no pixels")]
    EmptyImage,
    #[error("color analysis needs a 3-channel image")]
    NoColor,
    #[error("image too small for analysis: {width}x{height}")]
    TooSmall { width: u32, height: u32 },
    #[error("non-finite value while computing {0}")]
    NonFinite(&'static str),
}

/// Identifies one extractor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    Color,
    Texture,
    Frequency,
    Reflection,
}

impl Signal {
    pub const ALL: [Signal; 4] = [
        Signal::Color,
        Signal::Texture,
        Signal::Frequency,
        Signal::Reflection,
    ];

    /// Run this extractor on an image.
    pub fn score(self, image: &DynamicImage) -> f32 {
        match self {
            Signal::Color => color_score(image),
            Signal::Texture => texture_score(image),
            Signal::Frequency => frequency_score(image),
            Signal::Reflection => reflection_score(image),
        }
    }
}

pub fn color_score(image: &DynamicImage) -> f32 {
    fail_open(Signal::Color, analyze_color(image))
}

pub fn texture_score(image: &DynamicImage) -> f32 {
    fail_open(Signal::Texture, analyze_texture(image))
}

pub fn frequency_score(image: &DynamicImage) -> f32 {
    fail_open(Signal::Frequency, analyze_frequency(image))
}

pub fn reflection_score(image: &DynamicImage) -> f32 {
    fail_open(Signal::Reflection, analyze_reflections(image))
}

fn fail_open(signal: Signal, result: Result<f32, SignalError>) -> f32 {
    match result {
        Ok(score) => score,
        Err(e) => {
            tracing::warn!(?signal, error = %e, "signal extraction failed; using neutral score");
            NEUTRAL_SCORE
        }
    }
}

// ── Grayscale plane ──────────────────────────────────────────────────────────

/// Row-major grayscale pixels as f64.
pub(crate) struct Plane {
    pub(crate) data: Vec<f64>,
    pub(crate) width: usize,
    pub(crate) height: usize,
}

impl Plane {
    pub(crate) fn from_image(image: &DynamicImage, min_side: u32) -> Result<Self, SignalError> {
        let (width, height) = (image.width(), image.height());
        if width == 0 || height == 0 {
            return Err(SignalError::EmptyImage);
        }
        if width < min_side || height < min_side {
            return Err(SignalError::TooSmall { width, height });
        }
        let gray = image.to_luma8();
        Ok(Self {
            data: gray.as_raw().iter().map(|&p| p as f64).collect(),
            width: width as usize,
            height: height as usize,
        })
    }

    #[inline]
    fn at(&self, row: usize, col: usize) -> f64 {
        self.data[row * self.width + col]
    }

    /// Pixel access with BORDER_REFLECT_101 semantics (`-1 → 1`, `n → n-2`).
    #[inline]
    pub(crate) fn reflect(&self, row: isize, col: isize) -> f64 {
        self.at(reflect_101(row, self.height), reflect_101(col, self.width))
    }
}

fn reflect_101(i: isize, n: usize) -> usize {
    let n = n as isize;
    let r = if i < 0 {
        -i
    } else if i >= n {
        2 * n - 2 - i
    } else {
        i
    };
    r.clamp(0, n - 1) as usize
}

pub(crate) fn mean_std(values: impl Iterator<Item = f64> + Clone) -> (f64, f64) {
    let (sum, count) = values.clone().fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    if count == 0 {
        return (0.0, 0.0);
    }
    let mean = sum / count as f64;
    let var = values.map(|v| (v - mean).powi(2)).sum::<f64>() / count as f64;
    (mean, var.sqrt())
}

// ── Color ────────────────────────────────────────────────────────────────────

fn analyze_color(image: &DynamicImage) -> Result<f32, SignalError> {
    if image.width() == 0 || image.height() == 0 {
        return Err(SignalError::EmptyImage);
    }
    if !image.color().has_color() {
        return Err(SignalError::NoColor);
    }

    let rgb = image.to_rgb8();
    let pixel_count = rgb.pixels().len() as f64;

    // HSV saturation on the 8-bit scale: 255 * (max - min) / max.
    let saturation: Vec<f64> = rgb
        .pixels()
        .map(|p| {
            let max = p.0.iter().copied().max().unwrap_or(0) as f64;
            let min = p.0.iter().copied().min().unwrap_or(0) as f64;
            if max > 0.0 {
                (255.0 * (max - min) / max).round()
            } else {
                0.0
            }
        })
        .collect();
    let (sat_mean, sat_std) = mean_std(saturation.iter().copied());

    let saturation_score = if sat_std > SAT_STD_HIGH && sat_mean > SAT_MEAN_HIGH {
        HIGH
    } else if sat_std > SAT_STD_MEDIUM && sat_mean > SAT_MEAN_MEDIUM {
        MEDIUM
    } else {
        LOW
    };

    let mut histograms = [[0u32; 256]; 3];
    for p in rgb.pixels() {
        for (channel, &value) in p.0.iter().enumerate() {
            histograms[channel][value as usize] += 1;
        }
    }
    let avg_entropy = histograms
        .iter()
        .map(|h| shannon_entropy(h, pixel_count))
        .sum::<f64>()
        / 3.0;
    if !avg_entropy.is_finite() {
        return Err(SignalError::NonFinite("histogram entropy"));
    }

    let entropy_score = if avg_entropy > ENTROPY_HIGH {
        HIGH
    } else if avg_entropy > ENTROPY_MEDIUM {
        MEDIUM
    } else {
        LOW
    };

    tracing::trace!(sat_mean, sat_std, avg_entropy, "color analysis");
    Ok((saturation_score + entropy_score) / 2.0)
}

/// Shannon entropy in bits of a 256-bin histogram.
fn shannon_entropy(hist: &[u32; 256], total: f64) -> f64 {
    hist.iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / total;
            -p * p.log2()
        })
        .sum()
}

// ── Texture ──────────────────────────────────────────────────────────────────

fn analyze_texture(image: &DynamicImage) -> Result<f32, SignalError> {
    let plane = Plane::from_image(image, 3)?;

    let lbp = lbp_map(&plane);
    let (_, lbp_std) = mean_std(lbp.iter().map(|&v| v as f64));
    let lbp_var = lbp_std * lbp_std;

    let grad_mean = sobel_magnitude_mean(&plane);
    if !grad_mean.is_finite() || !lbp_var.is_finite() {
        return Err(SignalError::NonFinite("texture statistics"));
    }

    tracing::trace!(lbp_var, grad_mean, "texture analysis");
    Ok(if lbp_var > LBP_VAR_HIGH && grad_mean > GRAD_HIGH {
        HIGH
    } else if lbp_var > LBP_VAR_MEDIUM && grad_mean > GRAD_MEDIUM {
        MEDIUM
    } else {
        LOW
    })
}

/// Circular local binary pattern, 8 neighbours at radius 1.
///
/// Neighbours are sampled with bilinear interpolation; each contributes one
/// bit (1 if brighter than the centre by more than [`LBP_EPSILON`], so
/// interpolation rounding on flat regions sets nothing). Samples whose interpolation square
/// leaves the image are skipped. Border pixels stay 0.
fn lbp_map(plane: &Plane) -> Vec<u8> {
    let (w, h) = (plane.width, plane.height);
    let r = LBP_RADIUS as usize;
    let mut lbp = vec![0u8; w * h];

    let offsets: Vec<(f64, f64)> = (0..LBP_POINTS)
        .map(|k| {
            let angle = 2.0 * PI * k as f64 / LBP_POINTS as f64;
            (LBP_RADIUS * angle.cos(), LBP_RADIUS * angle.sin())
        })
        .collect();

    for i in r..h.saturating_sub(r) {
        for j in r..w.saturating_sub(r) {
            let center = plane.at(i, j);
            let mut code = 0u32;

            for &(dx, dy) in &offsets {
                let x = i as f64 + dx;
                let y = j as f64 + dy;
                let x1 = x.floor() as usize;
                let y1 = y.floor() as usize;
                let (x2, y2) = (x1 + 1, y1 + 1);
                if x2 >= h || y2 >= w {
                    continue;
                }

                let (fx1, fy1, fx2, fy2) = (x1 as f64, y1 as f64, x2 as f64, y2 as f64);
                let value = (fx2 - x) * (fy2 - y) * plane.at(x1, y1)
                    + (x - fx1) * (fy2 - y) * plane.at(x2, y1)
                    + (fx2 - x) * (y - fy1) * plane.at(x1, y2)
                    + (x - fx1) * (y - fy1) * plane.at(x2, y2);

                code = (code << 1) | u32::from(value > center + LBP_EPSILON);
            }

            lbp[i * w + j] = code as u8;
        }
    }

    lbp
}

/// Mean Euclidean norm of the 3×3 Sobel gradients.
fn sobel_magnitude_mean(plane: &Plane) -> f64 {
    let (w, h) = (plane.width as isize, plane.height as isize);
    let mut total = 0.0;

    for y in 0..h {
        for x in 0..w {
            let p = |dy: isize, dx: isize| plane.reflect(y + dy, x + dx);
            let gx = (p(-1, 1) + 2.0 * p(0, 1) + p(1, 1)) - (p(-1, -1) + 2.0 * p(0, -1) + p(1, -1));
            let gy = (p(1, -1) + 2.0 * p(1, 0) + p(1, 1)) - (p(-1, -1) + 2.0 * p(-1, 0) + p(-1, 1));
            total += (gx * gx + gy * gy).sqrt();
        }
    }

    total / (w * h) as f64
}

// ── Frequency ────────────────────────────────────────────────────────────────

fn analyze_frequency(image: &DynamicImage) -> Result<f32, SignalError> {
    let plane = Plane::from_image(image, 1)?;
    let (w, h) = (plane.width, plane.height);

    let spectrum = log_magnitude_spectrum(&plane);

    // Zero frequency sits at (h/2, w/2) after the quadrant shift.
    let (center_row, center_col) = ((h / 2) as i64, (w / 2) as i64);
    let radius = (h.min(w) / 4) as i64;

    let mut high = 0.0;
    let mut total = 0.0;
    for ((v, u), &mag) in spectrum.indexed_iter() {
        let row = ((v + h / 2) % h) as i64;
        let col = ((u + w / 2) % w) as i64;
        let dist_sq = (row - center_row).pow(2) + (col - center_col).pow(2);
        if dist_sq > radius * radius {
            high += mag;
        }
        total += mag;
    }

    let ratio = high / (total + ENERGY_EPSILON);
    if !ratio.is_finite() {
        return Err(SignalError::NonFinite("high-frequency ratio"));
    }

    tracing::trace!(ratio, "frequency analysis");
    Ok(if ratio > HF_RATIO_HIGH {
        HIGH
    } else if ratio > HF_RATIO_MEDIUM {
        MEDIUM
    } else {
        LOW
    })
}

/// `ln(|DFT| + 1)` of the plane, unshifted, indexed `[row_freq, col_freq]`.
///
/// Separable 2-D FFT: one batched pass over the rows, then one over the
/// columns of the transposed buffer.
fn log_magnitude_spectrum(plane: &Plane) -> Array2<f64> {
    let (w, h) = (plane.width, plane.height);
    let mut planner = FftPlanner::<f64>::new();

    // Rows are contiguous in the plane; a buffer of h*w runs h transforms.
    let mut rows: Vec<Complex<f64>> = plane.data.iter().map(|&p| Complex::new(p, 0.0)).collect();
    planner.plan_fft_forward(w).process(&mut rows);

    let rows = &rows;
    let mut cols: Vec<Complex<f64>> = (0..w)
        .flat_map(|u| (0..h).map(move |y| rows[y * w + u]))
        .collect();
    planner.plan_fft_forward(h).process(&mut cols);

    Array2::from_shape_fn((h, w), |(v, u)| (cols[u * h + v].norm() + 1.0).ln())
}

// ── Reflection ───────────────────────────────────────────────────────────────

fn analyze_reflections(image: &DynamicImage) -> Result<f32, SignalError> {
    let (width, height) = (image.width(), image.height());
    if width == 0 || height == 0 {
        return Err(SignalError::EmptyImage);
    }
    let gray = image.to_luma8();
    let (w, h) = (width as usize, height as usize);
    let pixels = gray.as_raw();

    let threshold = percentile(pixels, HIGHLIGHT_PERCENTILE);
    let bright: Vec<bool> = pixels.iter().map(|&p| p as f64 > threshold).collect();

    let spots = component_areas(&bright, w, h);
    let Some(&max_area) = spots.iter().max() else {
        tracing::trace!(threshold, "reflection analysis: no highlights");
        return Ok(NO_HIGHLIGHT_SCORE);
    };
    let avg_area = spots.iter().sum::<usize>() as f64 / spots.len() as f64;

    tracing::trace!(threshold, spots = spots.len(), avg_area, max_area, "reflection analysis");
    Ok(
        if (SPOT_AVG_MIN..=SPOT_AVG_MAX).contains(&avg_area) && max_area <= SPOT_MAX_AREA {
            HIGH
        } else if avg_area <= SPOT_AVG_MEDIUM {
            MEDIUM
        } else {
            LOW
        },
    )
}

/// Linear-interpolated percentile (0–100) of the pixel values.
fn percentile(pixels: &[u8], pct: f64) -> f64 {
    let mut counts = [0usize; 256];
    for &p in pixels {
        counts[p as usize] += 1;
    }
    let nth = |n: usize| -> f64 {
        let mut seen = 0;
        for (value, &c) in counts.iter().enumerate() {
            seen += c;
            if seen > n {
                return value as f64;
            }
        }
        255.0
    };

    let rank = pct / 100.0 * (pixels.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let frac = rank - lo as f64;
    let lo_val = nth(lo);
    if frac == 0.0 {
        return lo_val;
    }
    lo_val + frac * (nth(lo + 1) - lo_val)
}

/// Pixel areas of 8-connected components of `true` pixels.
fn component_areas(mask: &[bool], w: usize, h: usize) -> Vec<usize> {
    let mut visited = vec![false; mask.len()];
    let mut areas = Vec::new();
    let mut stack = Vec::new();

    for start in 0..mask.len() {
        if !mask[start] || visited[start] {
            continue;
        }
        visited[start] = true;
        stack.push(start);
        let mut area = 0;

        while let Some(idx) = stack.pop() {
            area += 1;
            let (row, col) = ((idx / w) as isize, (idx % w) as isize);
            for dr in -1..=1isize {
                for dc in -1..=1isize {
                    let (r, c) = (row + dr, col + dc);
                    if r < 0 || c < 0 || r >= h as isize || c >= w as isize {
                        continue;
                    }
                    let n = r as usize * w + c as usize;
                    if mask[n] && !visited[n] {
                        visited[n] = true;
                        stack.push(n);
                    }
                }
            }
        }
        areas.push(area);
    }

    areas
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, ImageBuffer, Luma, Rgb, RgbImage};

    /// Deterministic pseudo-random byte stream.
    fn noise(seed: u64) -> impl FnMut() -> u8 {
        let mut state = seed;
        move || {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (state >> 33) as u8
        }
    }

    fn gray_rgb(side: u32, value: u8) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(side, side, Rgb([value; 3])))
    }

    fn noisy_rgb(side: u32) -> DynamicImage {
        let mut next = noise(7);
        let img: RgbImage = ImageBuffer::from_fn(side, side, |_, _| Rgb([next(), next(), next()]));
        DynamicImage::ImageRgb8(img)
    }

    #[test]
    fn test_empty_image_is_neutral() {
        let empty = DynamicImage::new_rgb8(0, 0);
        for signal in Signal::ALL {
            assert_eq!(signal.score(&empty), NEUTRAL_SCORE, "{signal:?}");
        }
    }

    #[test]
    fn test_scores_within_unit_interval() {
        for img in [gray_rgb(40, 128), noisy_rgb(40), gray_rgb(40, 0)] {
            for signal in Signal::ALL {
                let s = signal.score(&img);
                assert!((0.0..=1.0).contains(&s), "{signal:?} = {s}");
            }
        }
    }

    #[test]
    fn test_flat_gray_scores_low() {
        let img = gray_rgb(80, 128);
        assert_eq!(texture_score(&img), LOW);
        assert!(frequency_score(&img) <= MEDIUM);
        assert_eq!(frequency_score(&img), LOW);
        assert_eq!(color_score(&img), LOW);
        assert_eq!(reflection_score(&img), NO_HIGHLIGHT_SCORE);
    }

    #[test]
    fn test_color_on_grayscale_is_neutral() {
        let img = DynamicImage::ImageLuma8(GrayImage::from_pixel(32, 32, Luma([90])));
        assert_eq!(color_score(&img), NEUTRAL_SCORE);
    }

    #[test]
    fn test_noise_is_rich_in_every_cue() {
        let img = noisy_rgb(64);
        assert_eq!(color_score(&img), HIGH);
        assert_eq!(texture_score(&img), HIGH);
        assert_eq!(frequency_score(&img), HIGH);
    }

    #[test]
    fn test_texture_too_small_is_neutral() {
        let img = gray_rgb(2, 128);
        assert_eq!(texture_score(&img), NEUTRAL_SCORE);
    }

    #[test]
    fn test_small_scattered_highlights_score_high() {
        let mut img = GrayImage::from_pixel(80, 80, Luma([50]));
        for (oy, ox) in [(5u32, 5u32), (5, 60), (60, 5), (60, 60)] {
            for y in oy..oy + 5 {
                for x in ox..ox + 5 {
                    img.put_pixel(x, y, Luma([250]));
                }
            }
        }
        assert_eq!(reflection_score(&DynamicImage::ImageLuma8(img)), HIGH);
    }

    #[test]
    fn test_large_glare_scores_low() {
        // Horizontal ramp: the brightest 5% is one 4-column band of 320 px.
        let img = GrayImage::from_fn(80, 80, |x, _| Luma([(x * 3) as u8]));
        assert_eq!(reflection_score(&DynamicImage::ImageLuma8(img)), LOW);
    }

    #[test]
    fn test_lbp_flat_plane_is_zero() {
        let plane = Plane {
            data: vec![100.0; 25],
            width: 5,
            height: 5,
        };
        assert!(lbp_map(&plane).iter().all(|&c| c == 0));
    }

    #[test]
    fn test_lbp_flat_plane_is_zero_at_every_level() {
        // Diagonal bilinear weights sum to 1 only up to rounding.
        for level in 0..=255u8 {
            let plane = Plane {
                data: vec![level as f64; 80 * 80],
                width: 80,
                height: 80,
            };
            let lbp = lbp_map(&plane);
            assert!(lbp.iter().all(|&c| c == 0), "level {level}");
        }
        assert_eq!(texture_score(&gray_rgb(80, 77)), LOW);
    }

    #[test]
    fn test_lbp_bright_neighbours_set_all_bits() {
        // Dark centre pixel surrounded by bright pixels.
        let mut data = vec![200.0; 25];
        data[2 * 5 + 2] = 10.0;
        let plane = Plane { data, width: 5, height: 5 };
        assert_eq!(lbp_map(&plane)[2 * 5 + 2], 0xFF);
    }

    #[test]
    fn test_sobel_vertical_edge() {
        // Left half 0, right half 100: horizontal gradient at the edge only.
        let data: Vec<f64> = (0..36).map(|i| if i % 6 < 3 { 0.0 } else { 100.0 }).collect();
        let plane = Plane { data, width: 6, height: 6 };
        let mean = sobel_magnitude_mean(&plane);
        // Columns 2 and 3 see |gx| = 400, others 0.
        assert!((mean - 400.0 * 2.0 / 6.0).abs() < 1e-9, "got {mean}");
    }

    #[test]
    fn test_dft_of_constant_is_dc_only() {
        let plane = Plane {
            data: vec![2.0; 12],
            width: 4,
            height: 3,
        };
        let spectrum = log_magnitude_spectrum(&plane);
        assert!((spectrum[[0, 0]] - (24.0f64 + 1.0).ln()).abs() < 1e-9);
        for ((v, u), &m) in spectrum.indexed_iter() {
            if (v, u) != (0, 0) {
                assert!(m < 1e-9, "leak at ({v},{u}): {m}");
            }
        }
    }

    #[test]
    fn test_spectrum_of_single_row_cosine() {
        // cos(2πx/4) over 4 columns: energy 2 at u = 1 and u = 3.
        let plane = Plane {
            data: vec![1.0, 0.0, -1.0, 0.0],
            width: 4,
            height: 1,
        };
        let spectrum = log_magnitude_spectrum(&plane);
        let expected = [0.0, 3.0f64.ln(), 0.0, 3.0f64.ln()];
        for (u, want) in expected.iter().enumerate() {
            assert!((spectrum[[0, u]] - want).abs() < 1e-9, "u={u}");
        }
    }

    #[test]
    fn test_frequency_on_large_capture_is_fast() {
        let img = noisy_rgb(512);
        let started = std::time::Instant::now();
        assert_eq!(frequency_score(&img), HIGH);
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
    }

    #[test]
    fn test_percentile_interpolates() {
        let pixels: Vec<u8> = (0..=100).collect();
        assert!((percentile(&pixels, 95.0) - 95.0).abs() < 1e-9);
        let pixels = [0u8, 10];
        assert!((percentile(&pixels, 50.0) - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_component_areas_eight_connected() {
        // Two diagonal pixels join; an isolated pixel stays separate.
        #[rustfmt::skip]
        let mask = [
            true,  false, false, false,
            false, true,  false, false,
            false, false, false, true,
        ];
        let mut areas = component_areas(&mask, 4, 3);
        areas.sort_unstable();
        assert_eq!(areas, vec![1, 2]);
    }
}
