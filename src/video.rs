//! Opening a video for sampling.
//!
//! [`VideoFile`] holds the demuxer context and the metadata of the best
//! video stream. It is opened once per analysis and dropped when the
//! analysis ends.

use std::{
    fmt::{Debug, Formatter, Result as FmtResult},
    path::{Path, PathBuf},
    time::Duration,
};

use ffmpeg_next::{codec::context::Context as CodecContext, format::context::Input, media::Type};

use crate::{
    configuration::FrameOutput, conversion::positive_rate, error::CrowdscanError,
    metadata::VideoMetadata, sampler::FrameSampler,
};

/// A decodable local video.
///
/// # Example
///
/// ```no_run
/// use crowdscan::{FrameOutput, VideoFile};
///
/// let video = VideoFile::open("input.mp4")?;
/// let stride = video.metadata().stride_for(1.0)?;
///
/// for frame in video.sample(stride, &FrameOutput::default())? {
///     let (frame_index, image) = frame?;
///     println!("frame {frame_index}: {}x{}", image.width(), image.height());
/// }
/// # Ok::<(), crowdscan::CrowdscanError>(())
/// ```
pub struct VideoFile {
    pub(crate) input_context: Input,
    pub(crate) metadata: VideoMetadata,
    pub(crate) video_stream_index: usize,
    path: PathBuf,
}

impl Debug for VideoFile {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("VideoFile")
            .field("metadata", &self.metadata)
            .field("video_stream_index", &self.video_stream_index)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl VideoFile {
    /// Open a video file.
    ///
    /// Initialises FFmpeg (idempotent), opens the container, and reads the
    /// metadata of its best video stream.
    ///
    /// # Errors
    ///
    /// - [`CrowdscanError::FileOpen`] if the file cannot be opened or its
    ///   codec parameters cannot be read.
    /// - [`CrowdscanError::NoVideoStream`] if there is no video stream.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, CrowdscanError> {
        let path = path.as_ref().to_path_buf();
        let open_error = |reason: String| CrowdscanError::FileOpen {
            path: path.clone(),
            reason,
        };

        ffmpeg_next::init()
            .map_err(|error| open_error(format!("FFmpeg initialisation failed: {error}")))?;

        let input_context =
            ffmpeg_next::format::input(&path).map_err(|error| open_error(error.to_string()))?;

        let stream = input_context
            .streams()
            .best(Type::Video)
            .ok_or(CrowdscanError::NoVideoStream)?;
        let video_stream_index = stream.index();

        let decoder = CodecContext::from_parameters(stream.parameters())
            .and_then(|context| context.decoder().video())
            .map_err(|error| open_error(format!("Failed to create video decoder: {error}")))?;

        let duration = match input_context.duration() {
            micros if micros > 0 => Duration::from_micros(micros as u64),
            _ => Duration::ZERO,
        };

        let frames_per_second = positive_rate(stream.avg_frame_rate())
            .or_else(|| positive_rate(stream.rate()))
            .unwrap_or(0.0);

        let frame_count = match stream.frames() {
            frames if frames > 0 => frames as u64,
            _ if frames_per_second > 0.0 => (duration.as_secs_f64() * frames_per_second) as u64,
            _ => 0,
        };

        let codec = decoder
            .codec()
            .map(|codec| codec.name().to_string())
            .unwrap_or_else(|| "unknown".to_string());

        let metadata = VideoMetadata {
            width: decoder.width(),
            height: decoder.height(),
            frames_per_second,
            frame_count,
            codec,
            duration,
            format: input_context.format().name().to_string(),
        };

        log::debug!(
            "Opened {}: {}x{} {} @ {:.3} fps, {} frames",
            path.display(),
            metadata.width,
            metadata.height,
            metadata.codec,
            metadata.frames_per_second,
            metadata.frame_count,
        );

        Ok(Self {
            input_context,
            metadata,
            video_stream_index,
            path,
        })
    }

    /// Metadata of the video stream.
    pub fn metadata(&self) -> &VideoMetadata {
        &self.metadata
    }

    /// Path the file was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Iterate over every `stride`-th frame, starting at frame 0. The
    /// sampler takes ownership of the file.
    ///
    /// # Errors
    ///
    /// [`CrowdscanError::InvalidInterval`] if `stride` is zero; decoder
    /// setup errors otherwise.
    pub fn sample(self, stride: u64, output: &FrameOutput) -> Result<FrameSampler, CrowdscanError> {
        FrameSampler::new(self, stride, output)
    }
}
