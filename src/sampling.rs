//! Stride planning and frame-time arithmetic.
//!
//! The pipeline never samples by wall-clock time directly. A sampling
//! interval in seconds is converted once into an integer frame stride, and
//! every sampled frame index is a multiple of that stride.

/// Convert a sampling interval into a frame stride.
///
/// Returns `floor(frames_per_second * interval_seconds)`, clamped to a
/// minimum of 1 so that sampling always makes progress. Non-finite or
/// negative products also clamp to 1. A non-positive frame rate must be
/// rejected by the caller before planning.
///
/// # Example
///
/// ```
/// use crowdscan::sampling::plan_stride;
///
/// assert_eq!(plan_stride(30.0, 1.0), 30);
/// assert_eq!(plan_stride(29.97, 1.0), 29);
/// assert_eq!(plan_stride(30.0, 0.01), 1);
/// ```
pub fn plan_stride(frames_per_second: f64, interval_seconds: f64) -> u64 {
    let frames = (frames_per_second * interval_seconds).floor();
    if frames.is_finite() && frames >= 1.0 {
        frames as u64
    } else {
        1
    }
}

/// Number of sampled indices in `{0, stride, 2*stride, ...} ∩ [0, total_frames)`.
pub fn sampled_frame_count(total_frames: u64, stride: u64) -> u64 {
    let stride = stride.max(1);
    total_frames.div_ceil(stride)
}

/// Timestamp of a frame in seconds, rounded to two decimal places.
pub fn frame_timestamp(frame_index: u64, frames_per_second: f64) -> f64 {
    if frames_per_second <= 0.0 {
        return 0.0;
    }
    round_to_hundredths(frame_index as f64 / frames_per_second)
}

/// Round to two decimal places.
pub(crate) fn round_to_hundredths(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Integer completion percentage, `floor(current / total * 100)` clamped to
/// `0..=100`. A zero total reports 0.
pub(crate) fn percent_of(current: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let percent = (current as f64 / total as f64 * 100.0).floor();
    percent.clamp(0.0, 100.0) as u8
}
