//! Frequency-domain screen replay detection.
//!
//! A face shown on a phone or monitor carries the display's pixel grid into
//! the camera image. That regular structure concentrates energy into a few
//! strong spectral peaks and a dense band of high-frequency components, which
//! live skin under ambient light does not produce.
//!
//! Three scores are combined into a 0–100 confidence that the frame is a
//! screen capture:
//!
//! - **peak ratio**: `max / mean` of the 2-D FFT magnitude, scaled `/3`.
//! - **grid**: how many magnitude bins exceed the 99th percentile, scaled `/100`.
//! - **periodic**: standard deviation of the per-pixel gradient norm, scaled `/2`.
//!
//! Two different thresholds apply to the combined value:
//! [`SCREEN_CLASSIFY_THRESHOLD`] (90) sets the diagnostic
//! `is_screen` flag, while the access decision uses the stricter
//! [`SPOOF_DENY_THRESHOLD`] (61) through [`exceeds_spoof_gate`].

use faceward_hw::Frame;
use rustfft::num_complex::Complex;
use rustfft::FftPlanner;
use serde::Serialize;

/// `combined_confidence` above which a frame is classified as a screen.
pub const SCREEN_CLASSIFY_THRESHOLD: f64 = 90.0;
/// `combined_confidence` at or above which access is denied as a screen spoof.
pub const SPOOF_DENY_THRESHOLD: f64 = 61.0;
/// Values this close below [`SPOOF_DENY_THRESHOLD`] also deny.
pub const SPOOF_DENY_EPSILON: f64 = 1e-4;

const SMOOTHING_SIGMA: f32 = 1.0;
const GRID_PERCENTILE: f64 = 99.0;
const SATURATING_PEAK_RATIO: f64 = 300.0;
const SATURATING_GRID_SCORE: f64 = 80.0;
const SCORE_CAP: f64 = 100.0;

const BASE_WEIGHT: f64 = 0.5;
const GRID_WEIGHT: f64 = 0.3;
const PERIODIC_WEIGHT: f64 = 0.2;

/// Per-frame liveness scores. Derived, never persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LivenessAssessment {
    /// Raw `max / mean` of the magnitude spectrum.
    pub peak_ratio: f64,
    pub peak_ratio_score: f64,
    pub grid_score: f64,
    pub periodic_score: f64,
    /// Weighted combination in 0–100.
    pub combined_confidence: f64,
    pub is_screen: bool,
}

impl LivenessAssessment {
    /// Combine raw measurements into scores.
    ///
    /// Saturates to exactly 100 when `peak_ratio > 300` and `grid_score > 80`.
    pub fn from_measurements(peak_ratio: f64, grid_score: f64, periodic_score: f64) -> Self {
        let peak_ratio_score = (peak_ratio / 3.0).min(SCORE_CAP);
        let combined_confidence =
            if peak_ratio > SATURATING_PEAK_RATIO && grid_score > SATURATING_GRID_SCORE {
                SCORE_CAP
            } else {
                BASE_WEIGHT * peak_ratio_score
                    + GRID_WEIGHT * grid_score
                    + PERIODIC_WEIGHT * periodic_score
            };

        Self {
            peak_ratio,
            peak_ratio_score,
            grid_score,
            periodic_score,
            combined_confidence,
            is_screen: combined_confidence > SCREEN_CLASSIFY_THRESHOLD,
        }
    }
}

/// Access-control gate: does this confidence deny as a screen spoof?
pub fn exceeds_spoof_gate(combined_confidence: f64) -> bool {
    combined_confidence >= SPOOF_DENY_THRESHOLD - SPOOF_DENY_EPSILON
}

/// Anything that can score a frame for screen replay.
pub trait LivenessAnalyzer: Send + Sync {
    fn assess(&self, frame: &Frame) -> LivenessAssessment;
}

/// FFT-based analyzer operating on the luma plane.
#[derive(Debug, Clone, Copy)]
pub struct SpectralAnalyzer {
    sigma: f32,
}

impl Default for SpectralAnalyzer {
    fn default() -> Self {
        Self { sigma: SMOOTHING_SIGMA }
    }
}

impl SpectralAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    fn smooth(&self, frame: &Frame) -> Option<Vec<f64>> {
        let luma = frame.to_luma_image().ok()?;
        let blurred = image::imageops::blur(&luma, self.sigma);
        Some(blurred.into_raw().into_iter().map(f64::from).collect())
    }
}

impl LivenessAnalyzer for SpectralAnalyzer {
    fn assess(&self, frame: &Frame) -> LivenessAssessment {
        if frame.is_empty() {
            return LivenessAssessment::default();
        }
        let Some(pixels) = self.smooth(frame) else {
            tracing::debug!(?frame, "liveness: frame buffer does not match dimensions");
            return LivenessAssessment::default();
        };
        let width = frame.width as usize;
        let height = frame.height as usize;

        let magnitude = fft_magnitude(&pixels, width, height);
        let mean = magnitude.iter().sum::<f64>() / magnitude.len() as f64;
        if mean <= 0.0 {
            return LivenessAssessment::default();
        }
        let max = magnitude.iter().copied().fold(f64::MIN, f64::max);
        let peak_ratio = max / mean;

        let cutoff = percentile(&magnitude, GRID_PERCENTILE);
        let strong = magnitude.iter().filter(|&&m| m > cutoff).count();
        let grid_score = (strong as f64 / 100.0).min(SCORE_CAP);

        let periodic_score = (std_dev(&gradient_norm(&pixels, width, height)) / 2.0).min(SCORE_CAP);

        let assessment = LivenessAssessment::from_measurements(peak_ratio, grid_score, periodic_score);
        tracing::debug!(
            peak_ratio = assessment.peak_ratio,
            grid = assessment.grid_score,
            periodic = assessment.periodic_score,
            combined = assessment.combined_confidence,
            "liveness assessed"
        );
        assessment
    }
}

/// Magnitude of the 2-D DFT (rows, then columns), row-major.
fn fft_magnitude(pixels: &[f64], width: usize, height: usize) -> Vec<f64> {
    let mut planner = FftPlanner::<f64>::new();
    let row_fft = planner.plan_fft_forward(width);
    let col_fft = planner.plan_fft_forward(height);

    let mut buf: Vec<Complex<f64>> = pixels.iter().map(|&p| Complex::new(p, 0.0)).collect();
    // `process` transforms the buffer in consecutive chunks of `width`, i.e. row by row.
    row_fft.process(&mut buf);

    let mut column = vec![Complex::new(0.0, 0.0); height];
    for x in 0..width {
        for (y, c) in column.iter_mut().enumerate() {
            *c = buf[y * width + x];
        }
        col_fft.process(&mut column);
        for (y, c) in column.iter().enumerate() {
            buf[y * width + x] = *c;
        }
    }

    buf.iter().map(|c| c.norm()).collect()
}

/// Percentile with linear interpolation between closest ranks.
fn percentile(values: &[f64], q: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let rank = (q / 100.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64)
}

/// Gradient along one axis: central differences inside, one-sided at the ends.
fn axis_gradient(len: usize, at: impl Fn(usize) -> f64) -> Vec<f64> {
    match len {
        0 => Vec::new(),
        1 => vec![0.0],
        _ => (0..len)
            .map(|i| {
                if i == 0 {
                    at(1) - at(0)
                } else if i == len - 1 {
                    at(len - 1) - at(len - 2)
                } else {
                    (at(i + 1) - at(i - 1)) / 2.0
                }
            })
            .collect(),
    }
}

/// Per-pixel Euclidean norm of the (x, y) finite-difference gradient.
fn gradient_norm(pixels: &[f64], width: usize, height: usize) -> Vec<f64> {
    let mut gx = vec![0.0; width * height];
    for y in 0..height {
        let row = axis_gradient(width, |x| pixels[y * width + x]);
        gx[y * width..(y + 1) * width].copy_from_slice(&row);
    }

    let mut norm = vec![0.0; width * height];
    for x in 0..width {
        let col = axis_gradient(height, |y| pixels[y * width + x]);
        for (y, dy) in col.into_iter().enumerate() {
            let idx = y * width + x;
            norm[idx] = (gx[idx] * gx[idx] + dy * dy).sqrt();
        }
    }
    norm
}

/// Population standard deviation.
fn std_dev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt()
}
