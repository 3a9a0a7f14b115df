//! Motion gating between sampled frames.
//!
//! Detector calls dominate the cost of an analysis. When two consecutive
//! sampled frames are visually near-identical the previous counts are
//! reused instead of calling the detector again.
//!
//! The gate compares single-channel luma images: the mean absolute
//! per-pixel difference must exceed a threshold on the 0–255 scale.
//!
//! # Example
//!
//! ```
//! use crowdscan::motion::{MotionGate, DEFAULT_MOTION_THRESHOLD};
//! use image::{Rgb, RgbImage};
//!
//! let mut gate = MotionGate::new(DEFAULT_MOTION_THRESHOLD);
//! let dark = RgbImage::from_pixel(8, 8, Rgb([0, 0, 0]));
//! let bright = RgbImage::from_pixel(8, 8, Rgb([255, 255, 255]));
//!
//! assert!(gate.check(&dark)); // first frame always runs inference
//! assert!(!gate.check(&dark)); // unchanged scene
//! assert!(gate.check(&bright)); // large change
//! ```

use image::{GrayImage, RgbImage, imageops};

/// Default motion threshold (mean absolute luma difference, 0–255).
pub const DEFAULT_MOTION_THRESHOLD: f64 = 15.0;

/// Convert an RGB frame to 8-bit luma.
pub fn to_luma(frame: &RgbImage) -> GrayImage {
    imageops::grayscale(frame)
}

/// Mean absolute per-pixel difference between two luma images.
///
/// Returns `None` when the images differ in size or are empty.
pub fn mean_absolute_difference(current: &GrayImage, previous: &GrayImage) -> Option<f64> {
    if current.dimensions() != previous.dimensions() {
        return None;
    }
    let pixel_count = current.as_raw().len();
    if pixel_count == 0 {
        return None;
    }

    let sum: u64 = current
        .as_raw()
        .iter()
        .zip(previous.as_raw())
        .map(|(&a, &b)| u64::from(a.abs_diff(b)))
        .sum();

    Some(sum as f64 / pixel_count as f64)
}

/// Decide whether `current` differs enough from `previous` to warrant a
/// fresh detector call.
///
/// With no previous frame this is always `true`. Frames of a different
/// size than the previous one also count as motion.
pub fn has_motion(current: &RgbImage, previous: Option<&GrayImage>, threshold: f64) -> bool {
    let Some(previous) = previous else {
        return true;
    };
    let luma = to_luma(current);
    luma_has_motion(&luma, previous, threshold)
}

fn luma_has_motion(current: &GrayImage, previous: &GrayImage, threshold: f64) -> bool {
    match mean_absolute_difference(current, previous) {
        Some(score) => score > threshold,
        None => true,
    }
}

/// Stateful motion gate owning the single previous-frame buffer.
///
/// Every call to [`check`](MotionGate::check) replaces the stored frame with
/// the current one, so the gate always compares consecutive *sampled*
/// frames, whether or not inference ran on the previous one.
#[derive(Debug, Clone)]
pub struct MotionGate {
    threshold: f64,
    previous: Option<GrayImage>,
}

impl MotionGate {
    /// Create a gate with the given threshold.
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            previous: None,
        }
    }

    /// The configured threshold.
    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Returns `true` if `frame` should be sent to the detector.
    pub fn check(&mut self, frame: &RgbImage) -> bool {
        let luma = to_luma(frame);
        let motion = match &self.previous {
            Some(previous) => luma_has_motion(&luma, previous, self.threshold),
            None => true,
        };
        self.previous = Some(luma);
        motion
    }

    /// Forget the previous frame.
    pub fn reset(&mut self) {
        self.previous = None;
    }
}

impl Default for MotionGate {
    fn default() -> Self {
        Self::new(DEFAULT_MOTION_THRESHOLD)
    }
}
