//! Fakes shared by the pipeline integration tests.

#![allow(dead_code)]

use std::{
    io::Write,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use crowdscan::{
    AnalysisEvent, AnalysisOptions, Analyzer, CancellationToken, CrowdscanError, Detector,
    DetectorOutput, DetectorSlot, FrameSource, RemoteFetcher, RemoteVideo, ResultCache,
    SampledVideo, VideoMetadata, VideoSource, sampling::plan_stride,
};
use image::{Rgb, RgbImage};
use indexmap::IndexMap;
use tempfile::NamedTempFile;

/// Frame source that ignores the file and yields flat grey frames.
///
/// `pattern[n % pattern.len()]` is the grey level of the n-th sampled frame.
pub struct SyntheticSource {
    pub frames_per_second: f64,
    pub total_frames: u64,
    pub pattern: Vec<u8>,
    pub opens: AtomicUsize,
    pub corrupt_sample: Option<usize>,
}

impl SyntheticSource {
    pub fn new(frames_per_second: f64, total_frames: u64, pattern: &[u8]) -> Self {
        Self {
            frames_per_second,
            total_frames,
            pattern: pattern.to_vec(),
            opens: AtomicUsize::new(0),
            corrupt_sample: None,
        }
    }

    /// Fail to decode the `sample`-th sampled frame, ending the frames there.
    pub fn corrupt_at(mut self, sample: usize) -> Self {
        self.corrupt_sample = Some(sample);
        self
    }

    /// A source whose every sample differs from the previous one.
    pub fn moving(frames_per_second: f64, total_frames: u64) -> Self {
        Self::new(frames_per_second, total_frames, &[0, 200])
    }

    /// A source whose samples are all identical.
    pub fn still(frames_per_second: f64, total_frames: u64) -> Self {
        Self::new(frames_per_second, total_frames, &[90])
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl FrameSource for SyntheticSource {
    fn open(&self, _path: &Path, options: &AnalysisOptions) -> Result<SampledVideo, CrowdscanError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let stride = plan_stride(self.frames_per_second, options.interval_seconds());
        let pattern = self.pattern.clone();

        let mut frames: Vec<_> = (0..self.total_frames)
            .step_by(stride as usize)
            .enumerate()
            .map(|(n, index)| {
                let level = pattern[n % pattern.len()];
                Ok((index, RgbImage::from_pixel(8, 8, Rgb([level, level, level]))))
            })
            .collect();
        if let Some(sample) = self.corrupt_sample {
            frames.truncate(sample);
            frames.push(Err(CrowdscanError::VideoDecodeError(format!(
                "decode failed: sample {sample} is corrupt"
            ))));
        }

        Ok(SampledVideo {
            metadata: VideoMetadata {
                width: 8,
                height: 8,
                frames_per_second: self.frames_per_second,
                frame_count: self.total_frames,
                codec: "synthetic".to_string(),
                duration: Duration::from_secs_f64(
                    self.total_frames as f64 / self.frames_per_second,
                ),
                format: "synthetic".to_string(),
            },
            stride,
            frames: Box::new(frames.into_iter()),
        })
    }
}

/// Detector that returns fixed counts and remembers how often it ran.
pub struct CountingDetector {
    pub counts: IndexMap<String, u64>,
    pub calls: AtomicUsize,
    pub cancel_after: Option<(usize, CancellationToken)>,
}

impl CountingDetector {
    pub fn new(counts: &[(&str, u64)]) -> Self {
        Self {
            counts: counts
                .iter()
                .map(|(name, value)| (name.to_string(), *value))
                .collect(),
            calls: AtomicUsize::new(0),
            cancel_after: None,
        }
    }

    /// Cancel `token` once `calls` inferences have run.
    pub fn cancelling(mut self, calls: usize, token: CancellationToken) -> Self {
        self.cancel_after = Some((calls, token));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Detector for CountingDetector {
    fn name(&self) -> &str {
        "counting"
    }

    fn infer(&self, _frame: &RgbImage) -> Result<DetectorOutput, CrowdscanError> {
        let calls = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((after, token)) = &self.cancel_after {
            if calls >= *after {
                token.cancel();
            }
        }
        Ok(DetectorOutput::Counts(self.counts.clone()))
    }
}

/// Detector whose every call fails.
pub struct FailingDetector;

impl Detector for FailingDetector {
    fn name(&self) -> &str {
        "failing"
    }

    fn infer(&self, _frame: &RgbImage) -> Result<DetectorOutput, CrowdscanError> {
        Err(CrowdscanError::Inference("model returned 500".to_string()))
    }
}

/// Remote fetcher with a scripted probe result.
pub struct FakeFetcher {
    pub probe: Result<RemoteVideo, String>,
    pub downloads: AtomicUsize,
}

impl FakeFetcher {
    pub fn video(id: &str, is_live: bool) -> Self {
        Self {
            probe: Ok(RemoteVideo {
                id: id.to_string(),
                is_live,
                title: None,
            }),
            downloads: AtomicUsize::new(0),
        }
    }

    pub fn rejecting(message: &str) -> Self {
        Self {
            probe: Err(message.to_string()),
            downloads: AtomicUsize::new(0),
        }
    }

    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }
}

impl RemoteFetcher for FakeFetcher {
    fn probe(&self, _url: &str) -> Result<RemoteVideo, CrowdscanError> {
        self.probe
            .clone()
            .map_err(CrowdscanError::SourceRejected)
    }

    fn download(&self, _url: &str, directory: &Path) -> Result<PathBuf, CrowdscanError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        let path = directory.join("downloaded.mp4");
        std::fs::write(&path, b"remote video bytes")?;
        Ok(path)
    }
}

pub fn ready_slot(detector: Arc<dyn Detector>) -> Arc<DetectorSlot> {
    let slot = Arc::new(DetectorSlot::new());
    slot.initialize(|| Ok(detector)).expect("detector init");
    slot
}

pub fn analyzer(
    detector: Arc<dyn Detector>,
    cache: Arc<dyn ResultCache>,
    frames: Arc<dyn FrameSource>,
) -> Analyzer {
    Analyzer::new(ready_slot(detector), cache).with_frame_source(frames)
}

/// A throwaway local file with the given contents.
pub fn video_file(contents: &[u8]) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp file");
    file.write_all(contents).expect("write temp file");
    file.flush().expect("flush temp file");
    file
}

pub fn local(file: &NamedTempFile) -> VideoSource {
    VideoSource::Local(file.path().to_path_buf())
}

/// Run `analyzer` on `source` and collect every event.
pub fn collect(
    analyzer: &Analyzer,
    source: &VideoSource,
) -> (Result<crowdscan::Timeline, CrowdscanError>, Vec<AnalysisEvent>) {
    let mut events = Vec::new();
    let mut sink = |event: AnalysisEvent| -> Result<(), CrowdscanError> {
        events.push(event);
        Ok(())
    };
    let result = analyzer.stream(source, &mut sink);
    (result, events)
}
