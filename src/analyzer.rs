//! End-to-end analysis of one video source.
//!
//! [`Analyzer`] ties the pieces together: it identifies the content, serves
//! cached timelines, downloads remote sources, samples frames, gates them on
//! motion, runs the detector, and builds the timeline, reporting progress
//! to an [`EventSink`] throughout.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use crowdscan::{
//!     AnalysisEvent, Analyzer, CrowdscanError, Detector, DetectorCredentials, DetectorSlot,
//!     FileCache, HttpDetector, VideoSource,
//! };
//!
//! let detectors = Arc::new(DetectorSlot::new());
//! let _ = detectors.initialize(|| {
//!     let credentials = DetectorCredentials::from_env()?;
//!     Ok(Arc::new(HttpDetector::new(credentials, 0.5)) as Arc<dyn Detector>)
//! });
//!
//! let analyzer = Analyzer::new(detectors, Arc::new(FileCache::new("cache")));
//! let source = VideoSource::parse("crowd.mp4");
//!
//! let mut sink = |event: AnalysisEvent| -> Result<(), CrowdscanError> {
//!     println!("{}", event.to_ndjson()?);
//!     Ok(())
//! };
//! let _ = analyzer.stream(&source, &mut sink);
//! ```

use std::{path::Path, sync::Arc, time::Instant};

use image::RgbImage;

use crate::{
    cache::{CacheKey, ResultCache},
    configuration::AnalysisOptions,
    detector::{Detector, DetectorSlot},
    error::CrowdscanError,
    identity::ContentId,
    motion::MotionGate,
    progress::{AnalysisEvent, EventSink, ProgressReporter},
    sampler::{FfmpegFrameSource, FrameSource},
    sampling::sampled_frame_count,
    source::{LIVE_NOT_SUPPORTED, RemoteFetcher, VideoSource, YtDlpFetcher},
    timeline::{Timeline, TimelineBuilder},
};

/// Runs analyses against a shared detector and cache.
///
/// An `Analyzer` is cheap to share behind an [`Arc`]; each call to
/// [`stream`](Analyzer::stream) is an independent, sequential run.
pub struct Analyzer {
    detectors: Arc<DetectorSlot>,
    cache: Arc<dyn ResultCache>,
    fetcher: Arc<dyn RemoteFetcher>,
    frames: Arc<dyn FrameSource>,
    options: AnalysisOptions,
}

impl std::fmt::Debug for Analyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Analyzer")
            .field("detector_ready", &self.detectors.is_ready())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Analyzer {
    /// Create an analyzer with default options, the `yt-dlp` fetcher, and
    /// FFmpeg decoding.
    pub fn new(detectors: Arc<DetectorSlot>, cache: Arc<dyn ResultCache>) -> Self {
        Self {
            detectors,
            cache,
            fetcher: Arc::new(YtDlpFetcher::new()),
            frames: Arc::new(FfmpegFrameSource),
            options: AnalysisOptions::default(),
        }
    }

    /// Replace the analysis options.
    #[must_use]
    pub fn with_options(mut self, options: AnalysisOptions) -> Self {
        self.options = options;
        self
    }

    /// Replace the remote fetcher.
    #[must_use]
    pub fn with_fetcher(mut self, fetcher: Arc<dyn RemoteFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    /// Replace the frame source.
    #[must_use]
    pub fn with_frame_source(mut self, frames: Arc<dyn FrameSource>) -> Self {
        self.frames = frames;
        self
    }

    /// The options used for every run.
    pub fn options(&self) -> &AnalysisOptions {
        &self.options
    }

    /// Analyse `source`, sending status events to `sink`.
    ///
    /// The event sequence is `checking_url`, then either `cached` →
    /// `complete` or (`downloading` →) `analyzing`... → `complete`. Any
    /// failure ends the stream with a single `error` event; the error is
    /// also returned. Nothing is cached unless the run completes.
    pub fn stream(
        &self,
        source: &VideoSource,
        sink: &mut dyn EventSink,
    ) -> Result<Timeline, CrowdscanError> {
        let mut reporter = ProgressReporter::new(sink, self.options.progress_every);
        let result = self.run(source, &mut reporter);

        if let Err(error) = &result {
            log::warn!("Analysis of {source} failed: {error}");
            if let Err(send_error) = reporter.error(error.to_string()) {
                log::debug!("Could not deliver error event: {send_error}");
            }
        }
        result
    }

    /// Analyse `source` without observing progress.
    pub fn analyze(&self, source: &VideoSource) -> Result<Timeline, CrowdscanError> {
        let mut discard = |_event: AnalysisEvent| -> Result<(), CrowdscanError> { Ok(()) };
        self.stream(source, &mut discard)
    }

    fn run(
        &self,
        source: &VideoSource,
        reporter: &mut ProgressReporter<'_>,
    ) -> Result<Timeline, CrowdscanError> {
        let detector = self.detectors.get()?;
        reporter.checking_source()?;

        match source {
            VideoSource::Local(path) => {
                let key = ContentId::for_file(path)?.cache_key(self.options.cache_version());
                if let Some(timeline) = self.lookup(&key) {
                    return Self::serve_cached(timeline, reporter);
                }
                self.analyze_and_store(path, &key, detector.as_ref(), reporter)
            }
            VideoSource::Remote(url) => {
                let video = self.fetcher.probe(url)?;
                if video.is_live {
                    return Err(CrowdscanError::SourceRejected(LIVE_NOT_SUPPORTED.to_string()));
                }

                let key = ContentId::Remote(video.id).cache_key(self.options.cache_version());
                if let Some(timeline) = self.lookup(&key) {
                    return Self::serve_cached(timeline, reporter);
                }

                reporter.downloading()?;
                let scratch = tempfile::Builder::new().prefix("crowdscan-").tempdir()?;
                let path = self.fetcher.download(url, scratch.path())?;
                self.analyze_and_store(&path, &key, detector.as_ref(), reporter)
            }
        }
    }

    fn serve_cached(
        timeline: Timeline,
        reporter: &mut ProgressReporter<'_>,
    ) -> Result<Timeline, CrowdscanError> {
        reporter.cached()?;
        reporter.complete(timeline.clone())?;
        Ok(timeline)
    }

    fn lookup(&self, key: &CacheKey) -> Option<Timeline> {
        match self.cache.load(key) {
            Ok(timeline) => timeline,
            Err(error) => {
                log::warn!("Ignoring unreadable cache entry {key}: {error}");
                None
            }
        }
    }

    fn analyze_and_store(
        &self,
        path: &Path,
        key: &CacheKey,
        detector: &dyn Detector,
        reporter: &mut ProgressReporter<'_>,
    ) -> Result<Timeline, CrowdscanError> {
        let timeline = self.analyze_file(path, detector, reporter)?;

        if let Err(error) = self.cache.save(key, &timeline) {
            log::error!("Failed to cache {key}: {error}");
        }

        reporter.complete(timeline.clone())?;
        Ok(timeline)
    }

    fn analyze_file(
        &self,
        path: &Path,
        detector: &dyn Detector,
        reporter: &mut ProgressReporter<'_>,
    ) -> Result<Timeline, CrowdscanError> {
        let video = self.frames.open(path, &self.options)?;
        let metadata = &video.metadata;

        log::info!(
            "Sampling {} every {} frames ({} of {} frames)",
            path.display(),
            video.stride,
            sampled_frame_count(metadata.frame_count, video.stride),
            metadata.frame_count,
        );

        reporter.analyzing_started()?;
        analyze_frames(
            video.frames,
            metadata.frames_per_second,
            metadata.frame_count,
            detector,
            &self.options,
            reporter,
        )
    }
}

/// Core sampling loop over already-decoded frames.
///
/// For each `(frame_index, frame)`: check cancellation, run the motion
/// gate, call the detector only when it fires, append one timeline record,
/// and account for it in `reporter`. The first error ends the run.
pub fn analyze_frames<I>(
    frames: I,
    frames_per_second: f64,
    total_frames: u64,
    detector: &dyn Detector,
    options: &AnalysisOptions,
    reporter: &mut ProgressReporter<'_>,
) -> Result<Timeline, CrowdscanError>
where
    I: IntoIterator<Item = Result<(u64, RgbImage), CrowdscanError>>,
{
    let started = Instant::now();
    let mut gate = MotionGate::new(options.motion_threshold());
    let mut builder =
        TimelineBuilder::new(options.categories().names(), frames_per_second, total_frames);
    let mut frames = frames.into_iter();

    loop {
        if options.is_cancelled() {
            log::info!("Analysis cancelled after {} records", builder.len());
            return Err(CrowdscanError::Cancelled);
        }
        let Some(frame) = frames.next() else {
            break;
        };
        let (frame_index, image) = frame?;

        let fresh = if gate.check(&image) {
            let output = detector.infer(&image)?;
            Some(
                options
                    .categories()
                    .derive(&output, options.confidence_threshold()),
            )
        } else {
            None
        };

        builder.record(frame_index, fresh);
        reporter.record_processed(frame_index, total_frames)?;
    }

    log::info!(
        "Built {} records with {} detector calls in {:.2?}",
        builder.len(),
        builder.fresh_records(),
        started.elapsed(),
    );
    Ok(builder.finish())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use image::Rgb;
    use indexmap::IndexMap;

    use super::*;
    use crate::detector::DetectorOutput;
    use crate::progress::Stage;

    struct Scripted {
        calls: Mutex<u64>,
        men: u64,
    }

    impl Detector for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        fn infer(&self, _frame: &RgbImage) -> Result<DetectorOutput, CrowdscanError> {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            let mut counts = IndexMap::new();
            counts.insert("men".to_string(), self.men + *calls);
            Ok(DetectorOutput::Counts(counts))
        }
    }

    fn frames(values: &[u8], stride: u64) -> Vec<Result<(u64, RgbImage), CrowdscanError>> {
        values
            .iter()
            .enumerate()
            .map(|(i, &v)| Ok((i as u64 * stride, RgbImage::from_pixel(4, 4, Rgb([v, v, v])))))
            .collect()
    }

    #[test]
    fn gate_skips_static_frames() {
        let detector = Scripted {
            calls: Mutex::new(0),
            men: 0,
        };
        let options = AnalysisOptions::new();
        let mut events = Vec::new();
        let mut sink = |event: AnalysisEvent| -> Result<(), CrowdscanError> {
            events.push(event);
            Ok(())
        };
        let mut reporter = ProgressReporter::new(&mut sink, 5);

        let timeline = analyze_frames(
            frames(&[10, 10, 200, 200], 30),
            30.0,
            120,
            &detector,
            &options,
            &mut reporter,
        )
        .unwrap();
        drop(reporter);

        let men: Vec<u64> = timeline
            .iter()
            .map(|r| r.counts.get("men").unwrap())
            .collect();
        assert_eq!(men, vec![1, 1, 2, 2]);
        assert_eq!(*detector.calls.lock().unwrap(), 2);
        assert!(events.iter().all(|e| e.stage() == Stage::Analyzing));
    }

    #[test]
    fn decode_error_ends_the_run() {
        let detector = Scripted {
            calls: Mutex::new(0),
            men: 0,
        };
        let mut input = frames(&[10], 1);
        input.push(Err(CrowdscanError::VideoDecodeError("corrupt".into())));
        let mut sink = |_event: AnalysisEvent| -> Result<(), CrowdscanError> { Ok(()) };
        let mut reporter = ProgressReporter::new(&mut sink, 5);

        let result = analyze_frames(
            input,
            30.0,
            10,
            &detector,
            &AnalysisOptions::new(),
            &mut reporter,
        );
        assert!(matches!(result, Err(CrowdscanError::VideoDecodeError(_))));
    }
}
