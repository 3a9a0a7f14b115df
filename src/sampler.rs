//! Lazy, stride-sampled frame iterator.
//!
//! [`FrameSampler`] decodes the video front to back and yields every
//! `stride`-th frame as an RGB image. Frames between sampled ones are
//! decoded (the codec needs them) but never scaled or copied.
//!
//! [`FrameSource`] is the seam the analyzer samples through;
//! [`FfmpegFrameSource`] is the production implementation.

use std::path::Path;

use ffmpeg_next::{
    Error as FfmpegError, Packet,
    codec::context::Context as CodecContext,
    decoder::Video as VideoDecoder,
    error::EAGAIN,
    format::Pixel,
    frame::Video as VideoFrame,
    software::scaling::{Context as ScalingContext, Flags as ScalingFlags},
};
use image::RgbImage;

use crate::{
    configuration::{AnalysisOptions, FrameOutput},
    conversion::frame_to_buffer,
    error::CrowdscanError,
    metadata::VideoMetadata,
    video::VideoFile,
};

/// Boxed iterator of sampled `(frame_index, frame)` pairs.
pub type SampledFrames = Box<dyn Iterator<Item = Result<(u64, RgbImage), CrowdscanError>>>;

/// An opened video ready to be walked at a fixed stride.
pub struct SampledVideo {
    /// Metadata of the video stream.
    pub metadata: VideoMetadata,
    /// Frame stride in use.
    pub stride: u64,
    /// The sampled frames, in increasing index order.
    pub frames: SampledFrames,
}

impl std::fmt::Debug for SampledVideo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampledVideo")
            .field("metadata", &self.metadata)
            .field("stride", &self.stride)
            .finish_non_exhaustive()
    }
}

/// Opens a local video and plans its sampling.
pub trait FrameSource: Send + Sync {
    /// Open `path` and return its stride-sampled frames.
    fn open(&self, path: &Path, options: &AnalysisOptions) -> Result<SampledVideo, CrowdscanError>;
}

/// [`FrameSource`] that decodes with FFmpeg.
#[derive(Debug, Clone, Copy, Default)]
pub struct FfmpegFrameSource;

impl FrameSource for FfmpegFrameSource {
    fn open(&self, path: &Path, options: &AnalysisOptions) -> Result<SampledVideo, CrowdscanError> {
        let video = VideoFile::open(path)?;
        let metadata = video.metadata().clone();
        let stride = metadata.stride_for(options.interval_seconds())?;
        let frames = video.sample(stride, options.frame_output())?;
        Ok(SampledVideo {
            metadata,
            stride,
            frames: Box::new(frames),
        })
    }
}

/// Iterator over `(frame_index, frame)` pairs at a fixed stride.
///
/// `frame_index` counts decoded frames from 0 in decode-output order, so
/// indices are `0, stride, 2 * stride, ...`. When the container reports a
/// frame count, no index at or past it is yielded.
///
/// A packet read or decode failure is yielded once as
/// [`CrowdscanError::VideoDecodeError`], after which the iterator ends.
pub struct FrameSampler {
    walk: StrideWalk<FfmpegDecodeSteps>,
}

impl FrameSampler {
    pub(crate) fn new(
        video: VideoFile,
        stride: u64,
        output: &FrameOutput,
    ) -> Result<Self, CrowdscanError> {
        let cursor = StrideCursor::new(stride, video.metadata.frame_count)?;

        let stream = video
            .input_context
            .stream(video.video_stream_index)
            .ok_or(CrowdscanError::NoVideoStream)?;
        let decoder = CodecContext::from_parameters(stream.parameters())?
            .decoder()
            .video()?;

        let (target_width, target_height) =
            output.resolve_dimensions(decoder.width(), decoder.height());

        let scaler = ScalingContext::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            Pixel::RGB24,
            target_width,
            target_height,
            ScalingFlags::BILINEAR,
        )?;

        let steps = FfmpegDecodeSteps {
            video,
            decoder,
            scaler,
            target_width,
            target_height,
            decoded_frame: VideoFrame::empty(),
            scaled_frame: VideoFrame::empty(),
        };

        Ok(Self {
            walk: StrideWalk::new(steps, cursor),
        })
    }
}

impl Iterator for FrameSampler {
    type Item = Result<(u64, RgbImage), CrowdscanError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.walk.next_sample()
    }
}

/// Decoder state owned by a [`FrameSampler`].
struct FfmpegDecodeSteps {
    video: VideoFile,
    decoder: VideoDecoder,
    scaler: ScalingContext,
    target_width: u32,
    target_height: u32,
    decoded_frame: VideoFrame,
    scaled_frame: VideoFrame,
}

impl DecodeSteps for FfmpegDecodeSteps {
    fn receive(&mut self) -> Result<(), FfmpegError> {
        self.decoder.receive_frame(&mut self.decoded_frame)
    }

    fn feed(&mut self) -> Result<Feed, CrowdscanError> {
        let mut packet = Packet::empty();
        match packet.read(&mut self.video.input_context) {
            Ok(()) => {
                if packet.stream() == self.video.video_stream_index {
                    self.decoder.send_packet(&packet).map_err(|error| {
                        CrowdscanError::VideoDecodeError(format!("send packet: {error}"))
                    })?;
                }
                Ok(Feed::Packet)
            }
            Err(FfmpegError::Eof) => {
                self.decoder.send_eof()?;
                Ok(Feed::EndOfInput)
            }
            Err(error) => Err(CrowdscanError::VideoDecodeError(format!(
                "packet read failed: {error}"
            ))),
        }
    }

    fn convert(&mut self) -> Result<RgbImage, CrowdscanError> {
        self.scaler.run(&self.decoded_frame, &mut self.scaled_frame)?;
        let buffer = frame_to_buffer(
            &self.scaled_frame,
            self.target_width,
            self.target_height,
            3,
        );
        RgbImage::from_raw(self.target_width, self.target_height, buffer).ok_or_else(|| {
            CrowdscanError::VideoDecodeError(
                "Failed to construct RGB image from decoded frame data".to_string(),
            )
        })
    }
}

/// What feeding the decoder accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Feed {
    /// A packet was read (and sent, if it belongs to the video stream).
    Packet,
    /// The container is exhausted and the decoder has been flushed.
    EndOfInput,
}

/// The decoder operations a [`StrideWalk`] drives.
trait DecodeSteps {
    /// Ask the decoder for its next frame.
    fn receive(&mut self) -> Result<(), FfmpegError>;
    /// Read one packet and hand it to the decoder, or flush at end of input.
    fn feed(&mut self) -> Result<Feed, CrowdscanError>;
    /// Scale the most recently received frame to RGB.
    fn convert(&mut self) -> Result<RgbImage, CrowdscanError>;
}

/// Outcome of a single `receive` call.
#[derive(Debug)]
enum Received {
    Frame,
    NeedsInput,
    Drained,
    Failed(CrowdscanError),
}

fn classify_receive(result: Result<(), FfmpegError>) -> Received {
    match result {
        Ok(()) => Received::Frame,
        Err(FfmpegError::Other { errno }) if errno == EAGAIN => Received::NeedsInput,
        Err(FfmpegError::Eof) => Received::Drained,
        Err(error) => Received::Failed(CrowdscanError::VideoDecodeError(format!(
            "decode failed: {error}"
        ))),
    }
}

/// Decision for one decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pick {
    Sample(u64),
    Skip,
    PastEnd,
}

/// Assigns decode-order indices and selects every `stride`-th one.
#[derive(Debug, Clone, Copy)]
struct StrideCursor {
    stride: u64,
    limit: Option<u64>,
    next_index: u64,
}

impl StrideCursor {
    /// `frame_count` of 0 means unknown, and leaves the walk unbounded.
    fn new(stride: u64, frame_count: u64) -> Result<Self, CrowdscanError> {
        if stride == 0 {
            return Err(CrowdscanError::InvalidInterval);
        }
        Ok(Self {
            stride,
            limit: Some(frame_count).filter(|&count| count > 0),
            next_index: 0,
        })
    }

    fn advance(&mut self) -> Pick {
        let index = self.next_index;
        self.next_index += 1;

        if self.limit.is_some_and(|limit| index >= limit) {
            Pick::PastEnd
        } else if index % self.stride == 0 {
            Pick::Sample(index)
        } else {
            Pick::Skip
        }
    }
}

/// The receive / feed loop behind [`FrameSampler`].
struct StrideWalk<D> {
    steps: D,
    cursor: StrideCursor,
    eof_sent: bool,
    done: bool,
}

impl<D: DecodeSteps> StrideWalk<D> {
    fn new(steps: D, cursor: StrideCursor) -> Self {
        Self {
            steps,
            cursor,
            eof_sent: false,
            done: false,
        }
    }

    fn next_sample(&mut self) -> Option<Result<(u64, RgbImage), CrowdscanError>> {
        if self.done {
            return None;
        }

        loop {
            match classify_receive(self.steps.receive()) {
                Received::Frame => match self.cursor.advance() {
                    Pick::Sample(index) => {
                        return match self.steps.convert() {
                            Ok(image) => Some(Ok((index, image))),
                            Err(error) => self.fail(error),
                        };
                    }
                    Pick::Skip => {}
                    Pick::PastEnd => {
                        self.done = true;
                        return None;
                    }
                },
                Received::Drained => {
                    self.done = true;
                    return None;
                }
                Received::Failed(error) => return self.fail(error),
                Received::NeedsInput => {
                    if self.eof_sent {
                        return self.fail(CrowdscanError::VideoDecodeError(
                            "decoder asked for input after end of stream".to_string(),
                        ));
                    }
                    match self.steps.feed() {
                        Ok(Feed::Packet) => {}
                        Ok(Feed::EndOfInput) => self.eof_sent = true,
                        Err(error) => return self.fail(error),
                    }
                }
            }
        }
    }

    fn fail(&mut self, error: CrowdscanError) -> Option<Result<(u64, RgbImage), CrowdscanError>> {
        self.done = true;
        Some(Err(error))
    }
}
