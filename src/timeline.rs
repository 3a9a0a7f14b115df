//! Timeline records and the forward-filling timeline builder.
//!
//! A [`Timeline`] holds one [`FrameRecord`] per sampled frame. Inference
//! only runs on frames where the motion gate fired; every other sampled
//! frame carries the last known counts forward, so the timeline is evenly
//! spaced in time regardless of how many detector calls were made.

use indexmap::IndexMap;
use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::sampling::frame_timestamp;

/// Name of the aggregate column.
pub const TOTAL_KEY: &str = "total";
/// Name of the timestamp column.
pub const TIMESTAMP_KEY: &str = "timestamp";
/// Name of the frame index column.
pub const FRAME_INDEX_KEY: &str = "frame_index";
/// Name of the video length column.
pub const TOTAL_FRAMES_KEY: &str = "total_frames";

/// Record fields that share a namespace with category names and therefore
/// cannot be used as one.
pub const RESERVED_KEYS: [&str; 4] =
    [TIMESTAMP_KEY, TOTAL_KEY, FRAME_INDEX_KEY, TOTAL_FRAMES_KEY];

/// Returns `true` if `name` collides with a record field.
pub fn is_reserved_key(name: &str) -> bool {
    RESERVED_KEYS.contains(&name)
}

/// Per-category counts for one frame plus their total.
///
/// Categories keep their configured order, which is also the column order
/// of cached entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CategoryCounts {
    counts: IndexMap<String, u64>,
    total: u64,
}

impl CategoryCounts {
    /// Counts with an explicit total.
    pub fn new(counts: IndexMap<String, u64>, total: u64) -> Self {
        Self { counts, total }
    }

    /// Counts whose total is the sum of the categories.
    pub fn summed(counts: IndexMap<String, u64>) -> Self {
        let total = counts.values().sum();
        Self { counts, total }
    }

    /// Zero for every named category.
    pub fn zeroed<I, S>(categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let counts = categories.into_iter().map(|name| (name.into(), 0)).collect();
        Self { counts, total: 0 }
    }

    /// Count for a category, `None` if the category is not tracked.
    pub fn get(&self, category: &str) -> Option<u64> {
        self.counts.get(category).copied()
    }

    /// Aggregate count.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Iterate `(category, count)` pairs in configured order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.counts.iter().map(|(name, &count)| (name.as_str(), count))
    }

    /// Category names in configured order.
    pub fn categories(&self) -> impl Iterator<Item = &str> {
        self.counts.keys().map(String::as_str)
    }
}

/// One entry of a timeline.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameRecord {
    /// Seconds from the start of the video, rounded to two decimals.
    pub timestamp: f64,
    /// Counts for this frame (fresh or forward-filled).
    pub counts: CategoryCounts,
    /// Decode-order index of the sampled frame.
    pub frame_index: u64,
    /// Total frames in the video, as reported by its metadata.
    pub total_frames: u64,
}

impl Serialize for FrameRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.counts.counts.len() + 4))?;
        map.serialize_entry(TIMESTAMP_KEY, &self.timestamp)?;
        for (name, count) in self.counts.iter() {
            map.serialize_entry(name, &count)?;
        }
        map.serialize_entry(TOTAL_KEY, &self.counts.total)?;
        map.serialize_entry(FRAME_INDEX_KEY, &self.frame_index)?;
        map.serialize_entry(TOTAL_FRAMES_KEY, &self.total_frames)?;
        map.end()
    }
}

/// Ordered records for one video, one per sampled frame.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
#[serde(transparent)]
pub struct Timeline {
    records: Vec<FrameRecord>,
}

impl Timeline {
    /// Wrap already-ordered records.
    pub fn from_records(records: Vec<FrameRecord>) -> Self {
        Self { records }
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns `true` if there are no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The records in frame order.
    pub fn records(&self) -> &[FrameRecord] {
        &self.records
    }

    /// Iterate over the records.
    pub fn iter(&self) -> std::slice::Iter<'_, FrameRecord> {
        self.records.iter()
    }

    /// Category names of the first record (all records share them).
    pub fn categories(&self) -> Vec<String> {
        self.records
            .first()
            .map(|record| record.counts.categories().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// Highest total seen across all records.
    pub fn peak_total(&self) -> u64 {
        self.records
            .iter()
            .map(|record| record.counts.total())
            .max()
            .unwrap_or(0)
    }

    /// Peak, average and duration of the totals, `None` when empty.
    ///
    /// The peak is the first record reaching the highest total. Duration is
    /// the timestamp of the last record.
    pub fn summary(&self) -> Option<TimelineSummary> {
        let last = self.records.last()?;
        let mut peak = &self.records[0];
        for record in &self.records {
            if record.counts.total() > peak.counts.total() {
                peak = record;
            }
        }
        let sum: u64 = self.records.iter().map(|record| record.counts.total()).sum();

        Some(TimelineSummary {
            peak_total: peak.counts.total(),
            peak_timestamp: peak.timestamp,
            average_total: sum as f64 / self.records.len() as f64,
            duration: last.timestamp,
        })
    }
}

/// Aggregate statistics of a [`Timeline`].
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct TimelineSummary {
    /// Highest total.
    pub peak_total: u64,
    /// Seconds at which the peak was first reached.
    pub peak_timestamp: f64,
    /// Mean total over all records.
    pub average_total: f64,
    /// Seconds covered, up to the last sampled frame.
    pub duration: f64,
}

impl std::fmt::Display for TimelineSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "peak {} at {}, average {:.1}, duration {}",
            self.peak_total,
            format_clock(self.peak_timestamp),
            self.average_total,
            format_clock(self.duration),
        )
    }
}

/// Format seconds as `M:SS`, truncating fractions.
pub fn format_clock(seconds: f64) -> String {
    let whole = seconds.max(0.0) as u64;
    format!("{}:{:02}", whole / 60, whole % 60)
}

impl<'a> IntoIterator for &'a Timeline {
    type Item = &'a FrameRecord;
    type IntoIter = std::slice::Iter<'a, FrameRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

/// Builds a timeline one sampled frame at a time.
///
/// Last-known counts start at zero for every category. Each call to
/// [`record`](TimelineBuilder::record) emits exactly one record: fresh
/// counts replace the last-known ones, `None` carries them forward.
#[derive(Debug)]
pub struct TimelineBuilder {
    frames_per_second: f64,
    total_frames: u64,
    last_counts: CategoryCounts,
    records: Vec<FrameRecord>,
    fresh_records: u64,
}

impl TimelineBuilder {
    /// Create a builder for a video with the given frame rate and length.
    pub fn new<I, S>(categories: I, frames_per_second: f64, total_frames: u64) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            frames_per_second,
            total_frames,
            last_counts: CategoryCounts::zeroed(categories),
            records: Vec::new(),
            fresh_records: 0,
        }
    }

    /// Append the record for `frame_index`.
    ///
    /// `fresh` holds counts from a detector call made on this frame, or
    /// `None` when inference was skipped.
    pub fn record(&mut self, frame_index: u64, fresh: Option<CategoryCounts>) -> &FrameRecord {
        debug_assert!(
            self.records
                .last()
                .is_none_or(|last| last.frame_index < frame_index),
            "frame indices must be strictly increasing"
        );

        if let Some(counts) = fresh {
            self.last_counts = counts;
            self.fresh_records += 1;
        }

        self.records.push(FrameRecord {
            timestamp: frame_timestamp(frame_index, self.frames_per_second),
            counts: self.last_counts.clone(),
            frame_index,
            total_frames: self.total_frames,
        });

        &self.records[self.records.len() - 1]
    }

    /// Number of records appended so far.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns `true` if no record has been appended.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of records that carried fresh detector counts.
    pub fn fresh_records(&self) -> u64 {
        self.fresh_records
    }

    /// Finish and return the timeline.
    pub fn finish(self) -> Timeline {
        Timeline {
            records: self.records,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(men: u64, women: u64) -> CategoryCounts {
        let mut map = IndexMap::new();
        map.insert("men".to_string(), men);
        map.insert("women".to_string(), women);
        CategoryCounts::summed(map)
    }

    #[test]
    fn starts_from_zero_counts() {
        let mut builder = TimelineBuilder::new(["men", "women"], 30.0, 90);
        let record = builder.record(0, None);
        assert_eq!(record.counts.get("men"), Some(0));
        assert_eq!(record.counts.get("women"), Some(0));
        assert_eq!(record.counts.total(), 0);
    }

    #[test]
    fn skipped_frames_forward_fill() {
        let mut builder = TimelineBuilder::new(["men", "women"], 30.0, 120);
        builder.record(0, Some(counts(3, 2)));
        builder.record(30, None);
        builder.record(60, Some(counts(1, 1)));
        builder.record(90, None);
        let timeline = builder.finish();

        let totals: Vec<u64> = timeline.iter().map(|r| r.counts.total()).collect();
        assert_eq!(totals, vec![5, 5, 2, 2]);
        assert_eq!(timeline.records()[1].counts, timeline.records()[0].counts);
    }

    #[test]
    fn timestamps_follow_frame_index() {
        let mut builder = TimelineBuilder::new(["men"], 29.97, 100);
        builder.record(0, None);
        builder.record(29, None);
        builder.record(58, None);
        let timestamps: Vec<f64> = builder.finish().iter().map(|r| r.timestamp).collect();
        assert_eq!(timestamps, vec![0.0, 0.97, 1.94]);
    }

    #[test]
    fn fresh_records_are_counted() {
        let mut builder = TimelineBuilder::new(["men", "women"], 30.0, 90);
        builder.record(0, Some(counts(1, 0)));
        builder.record(30, None);
        builder.record(60, Some(counts(1, 0)));
        assert_eq!(builder.fresh_records(), 2);
        assert_eq!(builder.len(), 3);
    }

    #[test]
    fn records_serialize_flat_in_column_order() {
        let mut builder = TimelineBuilder::new(["men", "women"], 30.0, 300);
        builder.record(30, Some(counts(3, 2)));
        let json = serde_json::to_string(&builder.finish()).unwrap();
        assert_eq!(
            json,
            r#"[{"timestamp":1.0,"men":3,"women":2,"total":5,"frame_index":30,"total_frames":300}]"#
        );
    }

    #[test]
    fn peak_total_and_categories() {
        let mut builder = TimelineBuilder::new(["men", "women"], 10.0, 30);
        builder.record(0, Some(counts(1, 1)));
        builder.record(10, Some(counts(4, 3)));
        builder.record(20, Some(counts(0, 2)));
        let timeline = builder.finish();
        assert_eq!(timeline.peak_total(), 7);
        assert_eq!(timeline.categories(), vec!["men", "women"]);
    }

    #[test]
    fn summary_reports_first_peak_average_and_duration() {
        let mut builder = TimelineBuilder::new(["men", "women"], 10.0, 1000);
        builder.record(0, Some(counts(1, 1)));
        builder.record(10, Some(counts(4, 3)));
        builder.record(20, Some(counts(5, 2)));
        builder.record(750, Some(counts(0, 0)));
        let summary = builder.finish().summary().unwrap();

        assert_eq!(summary.peak_total, 7);
        assert_eq!(summary.peak_timestamp, 1.0);
        assert_eq!(summary.average_total, 4.0);
        assert_eq!(summary.duration, 75.0);
        assert_eq!(
            summary.to_string(),
            "peak 7 at 0:01, average 4.0, duration 1:15"
        );
    }

    #[test]
    fn empty_timeline_has_no_summary() {
        assert_eq!(Timeline::default().summary(), None);
    }

    #[test]
    fn clock_format() {
        assert_eq!(format_clock(0.0), "0:00");
        assert_eq!(format_clock(59.99), "0:59");
        assert_eq!(format_clock(605.5), "10:05");
    }

    #[test]
    fn reserved_keys_cover_every_fixed_field() {
        let mut builder = TimelineBuilder::new(["men"], 30.0, 30);
        builder.record(0, None);
        let json = serde_json::to_value(builder.finish().records()[0].clone()).unwrap();
        for key in json.as_object().unwrap().keys() {
            assert_eq!(is_reserved_key(key), key != "men", "{key}");
        }
    }
}
