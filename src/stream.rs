//! Async event streaming (feature `async`).
//!
//! [`AnalysisStream`] runs an analysis on a blocking thread via
//! `tokio::task::spawn_blocking` and hands its events back through a
//! bounded channel. Events arrive exactly once and in order. Dropping the
//! stream closes the channel; the next send fails and the analysis stops at
//! the following frame boundary without caching anything.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use tokio_stream::StreamExt;
//!
//! use crowdscan::{AnalysisStream, Analyzer, DetectorSlot, MemoryCache, VideoSource};
//!
//! # async fn example() {
//! let analyzer = Arc::new(Analyzer::new(
//!     Arc::new(DetectorSlot::new()),
//!     Arc::new(MemoryCache::new()),
//! ));
//! let mut events = AnalysisStream::spawn(analyzer, VideoSource::parse("crowd.mp4"));
//!
//! while let Some(event) = events.next().await {
//!     println!("{}", event.to_ndjson().unwrap_or_default());
//! }
//! # }
//! ```

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::mpsc::Receiver;
use tokio::task::JoinHandle;
use tokio_stream::Stream;

use crate::analyzer::Analyzer;
use crate::error::CrowdscanError;
use crate::progress::AnalysisEvent;
use crate::source::VideoSource;
use crate::timeline::Timeline;

/// Default bounded-channel capacity.
const DEFAULT_CHANNEL_CAPACITY: usize = 8;

/// Stream of [`AnalysisEvent`]s produced by a background analysis.
pub struct AnalysisStream {
    receiver: Receiver<AnalysisEvent>,
    handle: JoinHandle<Result<Timeline, CrowdscanError>>,
}

impl AnalysisStream {
    /// Start analysing `source` on a blocking thread.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(analyzer: Arc<Analyzer>, source: VideoSource) -> Self {
        Self::with_capacity(analyzer, source, DEFAULT_CHANNEL_CAPACITY)
    }

    /// Like [`spawn`](AnalysisStream::spawn) with an explicit channel
    /// capacity (minimum 1).
    pub fn with_capacity(analyzer: Arc<Analyzer>, source: VideoSource, capacity: usize) -> Self {
        let (sender, receiver) = tokio::sync::mpsc::channel(capacity.max(1));

        let handle = tokio::task::spawn_blocking(move || {
            let mut sink = |event: AnalysisEvent| -> Result<(), CrowdscanError> {
                sender
                    .blocking_send(event)
                    .map_err(|_| CrowdscanError::Cancelled)
            };
            analyzer.stream(&source, &mut sink)
        });

        Self { receiver, handle }
    }

    /// Drain the remaining events and return the outcome of the run.
    pub async fn finish(mut self) -> Result<Timeline, CrowdscanError> {
        while self.receiver.recv().await.is_some() {}
        self.handle.await.unwrap_or(Err(CrowdscanError::Cancelled))
    }
}

impl Stream for AnalysisStream {
    type Item = AnalysisEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}
