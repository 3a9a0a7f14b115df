//! # crowdscan
//!
//! Count people in a video over time.
//!
//! `crowdscan` samples frames from a local file or a downloaded video at a
//! fixed interval, asks an object-detection model how many people of each
//! category are visible, and produces a timeline of counts. Detector calls
//! are skipped when consecutive samples are visually unchanged, completed
//! timelines are cached by content identity, and progress is streamed as
//! newline-delimited JSON status records. Decoding is powered by FFmpeg via
//! the [`ffmpeg-next`](https://crates.io/crates/ffmpeg-next) crate.
//!
//! ## Quick Start
//!
//! ### Analyse a Local File
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use crowdscan::{
//!     Analyzer, Detector, DetectorCredentials, DetectorSlot, FileCache, HttpDetector,
//!     VideoSource,
//! };
//!
//! let detectors = Arc::new(DetectorSlot::new());
//! detectors.initialize(|| {
//!     let detector = HttpDetector::new(DetectorCredentials::from_env()?, 0.5);
//!     Ok(Arc::new(detector) as Arc<dyn Detector>)
//! })?;
//!
//! let analyzer = Analyzer::new(detectors, Arc::new(FileCache::new("cache")));
//! let timeline = analyzer.analyze(&VideoSource::parse("crowd.mp4"))?;
//!
//! for record in &timeline {
//!     println!("{:>8.2}s  {} people", record.timestamp, record.counts.total());
//! }
//! # Ok::<(), crowdscan::CrowdscanError>(())
//! ```
//!
//! ### Stream Progress
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use crowdscan::{Analyzer, DetectorSlot, MemoryCache};
//! use crowdscan::{AnalysisEvent, CrowdscanError, VideoSource};
//!
//! # let analyzer = Analyzer::new(Arc::new(DetectorSlot::new()), Arc::new(MemoryCache::new()));
//! let mut sink = |event: AnalysisEvent| -> Result<(), CrowdscanError> {
//!     println!("{}", event.to_ndjson()?);
//!     Ok(())
//! };
//! let source = VideoSource::parse("https://www.youtube.com/watch?v=dQw4w9WgXcQ");
//! let _ = analyzer.stream(&source, &mut sink);
//! ```
//!
//! ## Pipeline
//!
//! - **Stride planning**: the sampling interval becomes an integer frame
//!   stride, `max(1, floor(fps * interval))`
//! - **Frame sampling**: a lazy decoder yields every stride-th frame as RGB
//! - **Motion gating**: mean absolute luma difference against the previous
//!   sample decides whether the detector runs
//! - **Timeline building**: one record per sample, forward-filling counts
//!   on skipped frames
//! - **Caching**: CSV entries keyed by `{version}_{prefix}_{id}`, written
//!   atomically
//! - **Progress**: ordered `checking_url` / `downloading` / `analyzing` /
//!   `cached` / `complete` / `error` events
//!
//! ### Optional Features
//!
//! | Feature | Description |
//! |---------|-------------|
//! | `async` | `AnalysisStream` runs an analysis on a Tokio blocking thread |
//! | `full` | Enables all of the above |
//!
//! ## Requirements
//!
//! FFmpeg development libraries must be installed. Remote sources need
//! `yt-dlp` on `PATH`.

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod analyzer;
pub mod cache;
pub mod configuration;
mod conversion;
pub mod detector;
pub mod error;
pub mod ffmpeg;
pub mod identity;
pub mod metadata;
pub mod motion;
pub mod progress;
pub mod sampler;
pub mod sampling;
pub mod source;
#[cfg(feature = "async")]
#[cfg_attr(docsrs, doc(cfg(feature = "async")))]
pub mod stream;
pub mod timeline;
pub mod video;

pub use analyzer::{Analyzer, analyze_frames};
pub use cache::{CacheKey, FileCache, MemoryCache, ResultCache};
pub use configuration::{AnalysisOptions, FrameOutput};
pub use detector::{
    Category, CategorySet, Detection, Detector, DetectorCredentials, DetectorOutput, DetectorSlot,
    HttpDetector,
};
pub use error::CrowdscanError;
pub use ffmpeg::{FfmpegLogLevel, set_ffmpeg_log_level};
pub use identity::{ContentId, content_hash};
pub use metadata::VideoMetadata;
pub use motion::MotionGate;
pub use progress::{AnalysisEvent, CancellationToken, EventSink, ProgressReporter, Stage};
pub use sampler::{FfmpegFrameSource, FrameSampler, FrameSource, SampledVideo};
pub use source::{RemoteFetcher, RemoteVideo, VideoSource, YtDlpFetcher};
#[cfg(feature = "async")]
pub use stream::AnalysisStream;
pub use timeline::{CategoryCounts, FrameRecord, Timeline, TimelineBuilder, TimelineSummary};
pub use video::VideoFile;
