//! Video stream metadata.
//!
//! Extracted once when a [`VideoFile`](crate::VideoFile) is opened and kept
//! for the lifetime of the analysis.

use std::time::Duration;

use serde::Serialize;

use crate::error::CrowdscanError;
use crate::sampling::plan_stride;

/// Metadata for the video stream being sampled.
///
/// # Example
///
/// ```no_run
/// use crowdscan::VideoFile;
///
/// let video = VideoFile::open("input.mp4")?;
/// let metadata = video.metadata();
/// println!("{}x{} @ {:.2} fps", metadata.width, metadata.height, metadata.frames_per_second);
/// # Ok::<(), crowdscan::CrowdscanError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Serialize)]
#[must_use]
pub struct VideoMetadata {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Average frames per second. Zero when the container does not report
    /// a usable rate.
    pub frames_per_second: f64,
    /// Total number of frames. Taken from the stream header when present,
    /// otherwise estimated from duration and frame rate. Zero if unknown.
    pub frame_count: u64,
    /// Codec name (e.g. `"h264"`, `"vp9"`).
    pub codec: String,
    /// Container duration.
    #[serde(serialize_with = "serialize_seconds")]
    pub duration: Duration,
    /// Container format name (e.g. `"mov,mp4,m4a,3gp,3g2,mj2"`).
    pub format: String,
}

impl VideoMetadata {
    /// Frame stride for a sampling interval.
    ///
    /// # Errors
    ///
    /// [`CrowdscanError::InvalidFrameRate`] if the frame rate is not a
    /// positive finite number, [`CrowdscanError::InvalidInterval`] if the
    /// interval is not positive.
    pub fn stride_for(&self, interval_seconds: f64) -> Result<u64, CrowdscanError> {
        if !(self.frames_per_second.is_finite() && self.frames_per_second > 0.0) {
            return Err(CrowdscanError::InvalidFrameRate(self.frames_per_second));
        }
        if !(interval_seconds.is_finite() && interval_seconds > 0.0) {
            return Err(CrowdscanError::InvalidInterval);
        }
        Ok(plan_stride(self.frames_per_second, interval_seconds))
    }
}

fn serialize_seconds<S: serde::Serializer>(
    duration: &Duration,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(fps: f64) -> VideoMetadata {
        VideoMetadata {
            width: 640,
            height: 360,
            frames_per_second: fps,
            frame_count: 300,
            codec: "h264".to_string(),
            duration: Duration::from_secs(10),
            format: "mp4".to_string(),
        }
    }

    #[test]
    fn stride_uses_frame_rate() {
        assert_eq!(metadata(30.0).stride_for(1.0).unwrap(), 30);
        assert_eq!(metadata(30.0).stride_for(0.5).unwrap(), 15);
    }

    #[test]
    fn zero_frame_rate_is_rejected() {
        assert!(matches!(
            metadata(0.0).stride_for(1.0),
            Err(CrowdscanError::InvalidFrameRate(_))
        ));
        assert!(matches!(
            metadata(f64::NAN).stride_for(1.0),
            Err(CrowdscanError::InvalidFrameRate(_))
        ));
    }

    #[test]
    fn zero_interval_is_rejected() {
        assert!(matches!(
            metadata(30.0).stride_for(0.0),
            Err(CrowdscanError::InvalidInterval)
        ));
    }

    #[test]
    fn serializes_duration_as_seconds() {
        let json = serde_json::to_value(metadata(25.0)).unwrap();
        assert_eq!(json["duration"], 10.0);
        assert_eq!(json["frame_count"], 300);
    }
}
