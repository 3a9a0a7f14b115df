//! Helpers for moving data out of FFmpeg types.

use ffmpeg_next::{Rational, frame::Video as VideoFrame};

/// Copy pixel data from an FFmpeg video frame into a tightly-packed buffer.
///
/// FFmpeg pads each row to an alignment boundary; the padding is dropped.
/// `bytes_per_pixel` is 3 for RGB24.
pub(crate) fn frame_to_buffer(
    video_frame: &VideoFrame,
    width: u32,
    height: u32,
    bytes_per_pixel: usize,
) -> Vec<u8> {
    let stride = video_frame.stride(0);
    let row_bytes = width as usize * bytes_per_pixel;
    let rows = height as usize;
    let data = video_frame.data(0);

    if stride == row_bytes {
        return data[..row_bytes * rows].to_vec();
    }

    let mut buffer = Vec::with_capacity(row_bytes * rows);
    for row in data.chunks(stride).take(rows) {
        buffer.extend_from_slice(&row[..row_bytes]);
    }
    buffer
}

/// A rational as `f64`, or `None` when the denominator is zero or the
/// value is not positive.
pub(crate) fn positive_rate(rate: Rational) -> Option<f64> {
    if rate.denominator() == 0 {
        return None;
    }
    let value = f64::from(rate.numerator()) / f64::from(rate.denominator());
    (value.is_finite() && value > 0.0).then_some(value)
}
