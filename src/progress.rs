//! Progress reporting and cancellation support.
//!
//! An analysis reports its state as a sequence of [`AnalysisEvent`]s, one per
//! line when rendered as NDJSON. [`ProgressReporter`] sits between the
//! pipeline and an [`EventSink`]: it keeps stage events in order, keeps
//! analyzing percentages non-decreasing, and throttles per-record progress
//! to a fixed cadence so the consumer is not flooded.
//!
//! [`CancellationToken`] provides cooperative cancellation, checked between
//! sampled frames.
//!
//! # Example
//!
//! ```
//! use crowdscan::{AnalysisEvent, CrowdscanError, ProgressReporter};
//!
//! let mut lines = Vec::new();
//! let mut sink = |event: AnalysisEvent| -> Result<(), CrowdscanError> {
//!     lines.push(event.to_ndjson()?);
//!     Ok(())
//! };
//!
//! let mut reporter = ProgressReporter::new(&mut sink, 5);
//! reporter.checking_source()?;
//! reporter.analyzing_started()?;
//! reporter.record_processed(0, 300)?;
//! drop(reporter);
//!
//! assert_eq!(lines[0], r#"{"status":"checking_url","progress":0}"#);
//! # Ok::<(), CrowdscanError>(())
//! ```

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use serde::Serialize;

use crate::error::CrowdscanError;
use crate::sampling::percent_of;
use crate::timeline::Timeline;

/// The stage an analysis is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Validating the source (remote availability, live check).
    CheckingUrl,
    /// Downloading a remote source.
    Downloading,
    /// Sampling frames and running detection.
    Analyzing,
    /// A cached timeline was found.
    Cached,
    /// Finished; carries the full timeline.
    Complete,
    /// Failed; carries a message.
    Error,
}

impl Stage {
    /// Position in the stage order. `Cached` replaces downloading and
    /// analyzing on a cache hit, so it shares their slot.
    fn rank(self) -> u8 {
        match self {
            Stage::CheckingUrl => 0,
            Stage::Downloading | Stage::Cached => 1,
            Stage::Analyzing => 2,
            Stage::Complete | Stage::Error => 3,
        }
    }

    fn is_terminal(self) -> bool {
        matches!(self, Stage::Complete | Stage::Error)
    }
}

/// A single status record in the output stream.
///
/// Serialises as a flat JSON object tagged by `status`:
///
/// ```text
/// {"status":"analyzing","progress":40}
/// {"status":"complete","data":[{"timestamp":0.0,"men":3,...}]}
/// {"status":"error","error":"Live streams are not supported."}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AnalysisEvent {
    /// Source validation started.
    CheckingUrl {
        /// Always 0.
        progress: u8,
    },
    /// Download started.
    Downloading {
        /// Always 0; download progress is not tracked.
        progress: u8,
    },
    /// Analysis progress, 0–100.
    Analyzing {
        /// Percentage of frames processed.
        progress: u8,
    },
    /// A cached timeline was found.
    Cached {
        /// Always 100.
        progress: u8,
    },
    /// The analysis finished.
    Complete {
        /// The full timeline.
        data: Timeline,
    },
    /// The analysis failed.
    Error {
        /// Human-readable message.
        error: String,
    },
}

impl AnalysisEvent {
    /// The stage this event belongs to.
    pub fn stage(&self) -> Stage {
        match self {
            AnalysisEvent::CheckingUrl { .. } => Stage::CheckingUrl,
            AnalysisEvent::Downloading { .. } => Stage::Downloading,
            AnalysisEvent::Analyzing { .. } => Stage::Analyzing,
            AnalysisEvent::Cached { .. } => Stage::Cached,
            AnalysisEvent::Complete { .. } => Stage::Complete,
            AnalysisEvent::Error { .. } => Stage::Error,
        }
    }

    /// Progress percentage carried by the event, if any.
    pub fn progress(&self) -> Option<u8> {
        match self {
            AnalysisEvent::CheckingUrl { progress }
            | AnalysisEvent::Downloading { progress }
            | AnalysisEvent::Analyzing { progress }
            | AnalysisEvent::Cached { progress } => Some(*progress),
            AnalysisEvent::Complete { .. } => Some(100),
            AnalysisEvent::Error { .. } => None,
        }
    }

    /// Render as one line of newline-delimited JSON (without the newline).
    pub fn to_ndjson(&self) -> Result<String, CrowdscanError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Receiver of analysis events.
///
/// Returning an error tells the pipeline that the consumer is gone; the
/// run stops at the next frame boundary with
/// [`CrowdscanError::Cancelled`]. Any `FnMut(AnalysisEvent) -> Result<(),
/// CrowdscanError>` closure is an `EventSink`.
pub trait EventSink {
    /// Deliver one event. Any error is reported to the pipeline as
    /// [`CrowdscanError::Cancelled`].
    fn send(&mut self, event: AnalysisEvent) -> Result<(), CrowdscanError>;
}

impl<F> EventSink for F
where
    F: FnMut(AnalysisEvent) -> Result<(), CrowdscanError>,
{
    fn send(&mut self, event: AnalysisEvent) -> Result<(), CrowdscanError> {
        self(event)
    }
}

/// Cooperative cancellation token backed by an [`AtomicBool`].
///
/// Clone this token and share it between threads; call
/// [`cancel`](CancellationToken::cancel) from any thread to request
/// cancellation of the associated analysis. The pipeline checks
/// [`is_cancelled`](CancellationToken::is_cancelled) before each sampled
/// frame.
///
/// # Example
///
/// ```
/// use crowdscan::CancellationToken;
///
/// let token = CancellationToken::new();
/// assert!(!token.is_cancelled());
///
/// token.cancel();
/// assert!(token.is_cancelled());
/// ```
#[derive(Debug, Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Create a new, non-cancelled token.
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Request cancellation. All clones observe it.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Check whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Orders and throttles events on their way to an [`EventSink`].
///
/// - Stage events move strictly forward: checking → downloading →
///   analyzing → complete, or checking → cached → complete. An event for
///   an earlier stage is dropped with a warning.
/// - Analyzing percentages never decrease.
/// - Once `complete` or `error` has been sent, further events are dropped.
pub struct ProgressReporter<'a> {
    sink: &'a mut dyn EventSink,
    stage: Option<Stage>,
    percent: u8,
    every: u64,
    records: u64,
}

impl<'a> ProgressReporter<'a> {
    /// Create a reporter emitting an analyzing event every `every` records.
    pub fn new(sink: &'a mut dyn EventSink, every: u64) -> Self {
        Self {
            sink,
            stage: None,
            percent: 0,
            every: every.max(1),
            records: 0,
        }
    }

    /// Send `checking_url` with progress 0.
    pub fn checking_source(&mut self) -> Result<(), CrowdscanError> {
        self.emit(AnalysisEvent::CheckingUrl { progress: 0 })
    }

    /// Send `downloading` with progress 0.
    pub fn downloading(&mut self) -> Result<(), CrowdscanError> {
        self.emit(AnalysisEvent::Downloading { progress: 0 })
    }

    /// Send the initial `analyzing` event with progress 0.
    pub fn analyzing_started(&mut self) -> Result<(), CrowdscanError> {
        self.records = 0;
        self.emit(AnalysisEvent::Analyzing { progress: 0 })
    }

    /// Account for one timeline record.
    ///
    /// An analyzing event is sent for the first record and then every
    /// `every` records, with `progress = floor(frame_index / total * 100)`.
    pub fn record_processed(
        &mut self,
        frame_index: u64,
        total_frames: u64,
    ) -> Result<(), CrowdscanError> {
        let due = self.records % self.every == 0;
        self.records += 1;
        if !due {
            return Ok(());
        }
        let progress = percent_of(frame_index, total_frames);
        self.emit(AnalysisEvent::Analyzing { progress })
    }

    /// Send `cached` with progress 100.
    pub fn cached(&mut self) -> Result<(), CrowdscanError> {
        self.emit(AnalysisEvent::Cached { progress: 100 })
    }

    /// Send `complete` with the full timeline.
    pub fn complete(&mut self, timeline: Timeline) -> Result<(), CrowdscanError> {
        self.emit(AnalysisEvent::Complete { data: timeline })
    }

    /// Send a terminal `error` event.
    pub fn error(&mut self, message: impl Into<String>) -> Result<(), CrowdscanError> {
        self.emit(AnalysisEvent::Error {
            error: message.into(),
        })
    }

    fn emit(&mut self, mut event: AnalysisEvent) -> Result<(), CrowdscanError> {
        let next = event.stage();

        if let Some(current) = self.stage {
            if current.is_terminal() {
                log::warn!("Dropping {next:?} event after terminal {current:?}");
                return Ok(());
            }
            let repeated_analyzing = current == Stage::Analyzing && next == Stage::Analyzing;
            let forward = next.rank() > current.rank() || next == Stage::Error;
            if !forward && !repeated_analyzing {
                log::warn!("Dropping out-of-order {next:?} event (current stage {current:?})");
                return Ok(());
            }
        }

        if let AnalysisEvent::Analyzing { progress } = &mut event {
            *progress = (*progress).min(100).max(self.percent);
            self.percent = *progress;
        }

        self.stage = Some(next);
        self.sink.send(event).map_err(|error| {
            log::debug!("Event consumer went away: {error}");
            CrowdscanError::Cancelled
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect<F>(every: u64, drive: F) -> Vec<AnalysisEvent>
    where
        F: FnOnce(&mut ProgressReporter<'_>) -> Result<(), CrowdscanError>,
    {
        let mut events = Vec::new();
        let mut sink = |event: AnalysisEvent| -> Result<(), CrowdscanError> {
            events.push(event);
            Ok(())
        };
        let mut reporter = ProgressReporter::new(&mut sink, every);
        drive(&mut reporter).expect("reporter failed");
        drop(reporter);
        events
    }

    #[test]
    fn cadence_emits_first_then_every_n() {
        let events = collect(5, |reporter| {
            reporter.analyzing_started()?;
            for index in 0..12u64 {
                reporter.record_processed(index * 30, 360)?;
            }
            Ok(())
        });

        let progress: Vec<u8> = events.iter().filter_map(AnalysisEvent::progress).collect();
        // start, record 0, record 5, record 10
        assert_eq!(progress, vec![0, 0, 41, 83]);
    }

    #[test]
    fn percentages_never_decrease() {
        let events = collect(1, |reporter| {
            reporter.analyzing_started()?;
            reporter.record_processed(50, 100)?;
            reporter.record_processed(10, 100)?;
            reporter.record_processed(70, 100)?;
            Ok(())
        });
        let progress: Vec<u8> = events.iter().filter_map(AnalysisEvent::progress).collect();
        assert_eq!(progress, vec![0, 50, 50, 70]);
    }

    #[test]
    fn stages_cannot_go_backwards() {
        let events = collect(1, |reporter| {
            reporter.checking_source()?;
            reporter.analyzing_started()?;
            reporter.downloading()?;
            reporter.complete(Timeline::default())?;
            reporter.analyzing_started()?;
            Ok(())
        });
        let stages: Vec<Stage> = events.iter().map(AnalysisEvent::stage).collect();
        assert_eq!(
            stages,
            vec![Stage::CheckingUrl, Stage::Analyzing, Stage::Complete]
        );
    }

    #[test]
    fn cache_hit_sequence() {
        let events = collect(5, |reporter| {
            reporter.checking_source()?;
            reporter.cached()?;
            reporter.complete(Timeline::default())
        });
        let stages: Vec<Stage> = events.iter().map(AnalysisEvent::stage).collect();
        assert_eq!(stages, vec![Stage::CheckingUrl, Stage::Cached, Stage::Complete]);
        assert_eq!(events[1].progress(), Some(100));
    }

    #[test]
    fn error_is_terminal_from_any_stage() {
        let events = collect(5, |reporter| {
            reporter.checking_source()?;
            reporter.downloading()?;
            reporter.error("boom")?;
            reporter.complete(Timeline::default())
        });
        assert_eq!(events.len(), 3);
        assert_eq!(
            events[2],
            AnalysisEvent::Error {
                error: "boom".into()
            }
        );
    }

    #[test]
    fn sink_failure_propagates() {
        let mut sink = |_event: AnalysisEvent| -> Result<(), CrowdscanError> {
            Err(CrowdscanError::Cache("closed".into()))
        };
        let mut reporter = ProgressReporter::new(&mut sink, 1);
        assert!(matches!(
            reporter.checking_source(),
            Err(CrowdscanError::Cancelled)
        ));
    }

    #[test]
    fn ndjson_uses_status_tag() {
        let line = AnalysisEvent::Analyzing { progress: 42 }.to_ndjson().unwrap();
        assert_eq!(line, r#"{"status":"analyzing","progress":42}"#);

        let line = AnalysisEvent::Error {
            error: "Video unavailable.".into(),
        }
        .to_ndjson()
        .unwrap();
        assert_eq!(line, r#"{"status":"error","error":"Video unavailable."}"#);
    }

    #[test]
    fn cancellation_token_clone_shares_state() {
        let token = CancellationToken::new();
        let clone = token.clone();
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
