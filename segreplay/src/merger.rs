//! Segment merger
//!
//! Tracks which segments already reached the merged stream and merges newly
//! loaded ones exactly once, whatever order they finish loading in.

use crate::filter::EventFilter;
use crate::provider::SegmentMap;
use crate::stream::MergedStream;
use std::collections::BTreeSet;
use tracing::debug;

/// Segments merged by one pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Segment index and the append mode it was merged with, in merge order
    pub merged: Vec<(u32, bool)>,
    pub forwarded: usize,
    pub dropped: usize,
}

impl MergeReport {
    pub fn is_empty(&self) -> bool {
        self.merged.is_empty()
    }

    pub fn segments(&self) -> Vec<u32> {
        self.merged.iter().map(|(index, _)| *index).collect()
    }

    /// True if every segment of this pass was merged in append mode
    pub fn all_appended(&self) -> bool {
        self.merged.iter().all(|(_, append)| *append)
    }
}

#[derive(Debug, Default)]
pub struct SegmentMerger {
    processed: BTreeSet<u32>,
}

impl SegmentMerger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge every loaded, not yet processed segment in ascending index order
    ///
    /// Segments the provider knows about but has no data for are skipped and
    /// picked up by a later call once loaded.
    pub fn on_segments_changed(
        &mut self,
        segments: &SegmentMap,
        stream: &mut MergedStream,
        filter: &mut dyn EventFilter,
    ) -> MergeReport {
        let mut report = MergeReport::default();

        for (&index, segment) in segments {
            if self.processed.contains(&index) {
                continue;
            }
            let Some(segment) = segment else {
                continue;
            };
            if !segment.is_loaded() {
                continue;
            }

            let append = self.append_mode_for(index);
            self.processed.insert(index);

            let outcome = stream.merge_events(index, segment.events(), append, filter);
            debug!(
                "Merged segment {} (append={}): {} forwarded, {} dropped",
                index, append, outcome.forwarded, outcome.dropped
            );

            report.merged.push((index, append));
            report.forwarded += outcome.forwarded;
            report.dropped += outcome.dropped;
        }

        report
    }

    /// Append mode for a segment about to be merged
    ///
    /// A segment extends the tail only if nothing with a higher index has
    /// been merged yet.
    pub fn append_mode_for(&self, index: u32) -> bool {
        self.processed.last().map_or(true, |&max| max < index)
    }

    pub fn processed(&self) -> &BTreeSet<u32> {
        &self.processed
    }

    pub fn is_processed(&self, index: u32) -> bool {
        self.processed.contains(&index)
    }
}
