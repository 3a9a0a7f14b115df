//! Analysis configuration.
//!
//! [`AnalysisOptions`] is a builder that threads sampling, gating, detector,
//! caching, and progress settings through an analysis without polluting
//! every function signature.
//!
//! # Example
//!
//! ```
//! use crowdscan::{AnalysisOptions, CancellationToken};
//!
//! let token = CancellationToken::new();
//! let options = AnalysisOptions::new()
//!     .with_interval_seconds(2.0)
//!     .with_motion_threshold(12.5)
//!     .with_progress_every(10)
//!     .with_cancellation(token.clone());
//!
//! assert_eq!(options.interval_seconds(), 2.0);
//! ```

use std::env;

use crate::detector::CategorySet;
use crate::motion::DEFAULT_MOTION_THRESHOLD;
use crate::progress::CancellationToken;

/// Default sampling interval in seconds.
pub const DEFAULT_INTERVAL_SECONDS: f64 = 1.0;

/// Default minimum detector confidence.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;

/// Default cache-format version tag.
///
/// Bump whenever the persisted record layout changes.
pub const DEFAULT_CACHE_VERSION: &str = "v2";

/// Default number of sampled records between analyzing progress events.
pub const DEFAULT_PROGRESS_EVERY: u64 = 5;

/// Frame output settings for sampled frames.
///
/// Sampled frames are always RGB8. When `max_width` is set, frames wider
/// than it are scaled down (preserving aspect ratio) before motion gating
/// and inference.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameOutput {
    /// Upper bound for the output width. `None` keeps the source width.
    pub max_width: Option<u32>,
}

impl FrameOutput {
    /// Resolve the output dimensions for a source of the given size.
    ///
    /// Returns `(width, height)`.
    pub(crate) fn resolve_dimensions(&self, source_width: u32, source_height: u32) -> (u32, u32) {
        match self.max_width {
            Some(max) if max > 0 && source_width > max => {
                let ratio = max as f64 / source_width as f64;
                let height = (source_height as f64 * ratio).round() as u32;
                (max, height.max(1))
            }
            _ => (source_width, source_height),
        }
    }
}

/// Configuration for one analysis run.
///
/// Defaults: 1 s sampling interval, motion threshold 15, men/women
/// categories, confidence 0.5, cache version `v2`, progress every 5 records.
#[derive(Debug, Clone)]
pub struct AnalysisOptions {
    pub(crate) interval_seconds: f64,
    pub(crate) motion_threshold: f64,
    pub(crate) categories: CategorySet,
    pub(crate) confidence_threshold: f32,
    pub(crate) cache_version: String,
    pub(crate) progress_every: u64,
    pub(crate) cancellation: Option<CancellationToken>,
    pub(crate) frame_output: FrameOutput,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl AnalysisOptions {
    /// Create options with default settings.
    pub fn new() -> Self {
        Self {
            interval_seconds: DEFAULT_INTERVAL_SECONDS,
            motion_threshold: DEFAULT_MOTION_THRESHOLD,
            categories: CategorySet::default(),
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            cache_version: DEFAULT_CACHE_VERSION.to_string(),
            progress_every: DEFAULT_PROGRESS_EVERY,
            cancellation: None,
            frame_output: FrameOutput::default(),
        }
    }

    /// Defaults overridden by environment variables.
    ///
    /// Reads `FRAME_INTERVAL_SECONDS`, `MOTION_THRESHOLD`,
    /// `DETECTOR_CONFIDENCE`, and `CACHE_VERSION`. Unparseable values are
    /// ignored with a warning.
    pub fn from_env() -> Self {
        Self::from_variables(|name| env::var(name).ok())
    }

    fn from_variables(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut options = Self::new();
        if let Some(value) = parse_variable::<f64>(&lookup, "FRAME_INTERVAL_SECONDS") {
            options = options.with_interval_seconds(value);
        }
        if let Some(value) = parse_variable::<f64>(&lookup, "MOTION_THRESHOLD") {
            options = options.with_motion_threshold(value);
        }
        if let Some(value) = parse_variable::<f32>(&lookup, "DETECTOR_CONFIDENCE") {
            options = options.with_confidence_threshold(value);
        }
        if let Some(version) = lookup("CACHE_VERSION") {
            if !version.trim().is_empty() {
                options = options.with_cache_version(version.trim());
            }
        }
        options
    }

    /// Set the sampling interval in seconds.
    ///
    /// Non-positive or non-finite values are ignored.
    #[must_use]
    pub fn with_interval_seconds(mut self, seconds: f64) -> Self {
        if seconds.is_finite() && seconds > 0.0 {
            self.interval_seconds = seconds;
        } else {
            log::warn!("Ignoring invalid sampling interval {seconds}");
        }
        self
    }

    /// Set the motion threshold (mean absolute luma difference, 0–255).
    #[must_use]
    pub fn with_motion_threshold(mut self, threshold: f64) -> Self {
        self.motion_threshold = threshold.max(0.0);
        self
    }

    /// Set the tracked categories.
    #[must_use]
    pub fn with_categories(mut self, categories: CategorySet) -> Self {
        self.categories = categories;
        self
    }

    /// Set the minimum detector confidence, clamped to `0.0..=1.0`.
    #[must_use]
    pub fn with_confidence_threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    /// Set the cache-format version tag.
    #[must_use]
    pub fn with_cache_version(mut self, version: impl Into<String>) -> Self {
        self.cache_version = version.into();
        self
    }

    /// Emit an analyzing progress event every `records` sampled records.
    /// Clamped to a minimum of 1.
    #[must_use]
    pub fn with_progress_every(mut self, records: u64) -> Self {
        self.progress_every = records.max(1);
        self
    }

    /// Attach a cancellation token checked between sampled frames.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Cap the width of sampled frames.
    #[must_use]
    pub fn with_max_frame_width(mut self, width: u32) -> Self {
        self.frame_output.max_width = Some(width);
        self
    }

    /// Sampling interval in seconds.
    pub fn interval_seconds(&self) -> f64 {
        self.interval_seconds
    }

    /// Motion threshold.
    pub fn motion_threshold(&self) -> f64 {
        self.motion_threshold
    }

    /// Tracked categories.
    pub fn categories(&self) -> &CategorySet {
        &self.categories
    }

    /// Minimum detector confidence.
    pub fn confidence_threshold(&self) -> f32 {
        self.confidence_threshold
    }

    /// Cache-format version tag.
    pub fn cache_version(&self) -> &str {
        &self.cache_version
    }

    /// Sampled frame output settings.
    pub fn frame_output(&self) -> &FrameOutput {
        &self.frame_output
    }

    /// Returns `true` if cancellation has been requested.
    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(|token| token.is_cancelled())
    }
}

fn parse_variable<T: std::str::FromStr>(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
) -> Option<T> {
    let raw = lookup(name)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("Ignoring unparseable {name}={raw:?}");
            None
        }
    }
}
