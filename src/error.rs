//! Error types for the `crowdscan` crate.
//!
//! This module defines [`CrowdscanError`], the unified error type returned by
//! all fallible operations in the crate. Variants are grouped by where the
//! failure happened: the video source, the detector, decoding, or the result
//! cache. Every variant renders to a message suitable for an `error` status
//! event.

use std::{io::Error as IoError, path::PathBuf};

use ffmpeg_next::Error as FfmpegError;
use image::ImageError;
use thiserror::Error;

/// The unified error type for all `crowdscan` operations.
///
/// Every public method that can fail returns `Result<T, CrowdscanError>`.
/// When an analysis is streamed, the error is converted into a terminal
/// [`AnalysisEvent::Error`](crate::AnalysisEvent::Error) carrying its
/// [`Display`](std::fmt::Display) text.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CrowdscanError {
    /// The remote source failed validation (unavailable, private, live, ...).
    ///
    /// The message is user facing and is forwarded verbatim.
    #[error("{0}")]
    SourceRejected(String),

    /// Downloading a remote source failed.
    #[error("Download failed: {0}")]
    Download(String),

    /// The `yt-dlp` executable could not be found on `PATH`.
    #[error("yt-dlp not found in PATH")]
    YtDlpNotFound,

    /// The detector could not be initialised.
    ///
    /// Recorded once at startup and reported on every request until the
    /// detector is initialised again.
    #[error("Detector initialization failed: {0}")]
    DetectorInit(String),

    /// A single detector call failed. Aborts the whole analysis.
    #[error("Inference failed: {0}")]
    Inference(String),

    /// The video file could not be opened.
    #[error("Failed to open video file at {path}: {reason}")]
    FileOpen {
        /// Path that was passed to [`crate::VideoFile::open`].
        path: PathBuf,
        /// Underlying reason the open failed.
        reason: String,
    },

    /// The file does not contain a video stream.
    #[error("No video stream found in file")]
    NoVideoStream,

    /// A video frame could not be decoded.
    #[error("Failed to decode video frame: {0}")]
    VideoDecodeError(String),

    /// The video reports a frame rate that cannot be sampled.
    #[error("Invalid frame rate: {0}")]
    InvalidFrameRate(f64),

    /// A stride or sampling interval of zero was provided.
    #[error("Sampling interval must be greater than zero")]
    InvalidInterval,

    /// An error originating from the FFmpeg libraries.
    #[error("FFmpeg error: {0}")]
    FfmpegError(String),

    /// The result cache could not be read or written.
    #[error("Cache error: {0}")]
    Cache(String),

    /// An I/O error occurred while reading or writing files.
    #[error("I/O error: {0}")]
    IoError(#[from] IoError),

    /// An error from the `image` crate during frame conversion or encoding.
    #[error("Image processing error: {0}")]
    ImageError(#[from] ImageError),

    /// A cache entry could not be parsed or serialised as CSV.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// JSON (de)serialisation failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The operation was cancelled via a
    /// [`CancellationToken`](crate::CancellationToken) or because the event
    /// consumer went away.
    #[error("Operation cancelled")]
    Cancelled,
}

impl From<FfmpegError> for CrowdscanError {
    fn from(error: FfmpegError) -> Self {
        CrowdscanError::FfmpegError(error.to_string())
    }
}
