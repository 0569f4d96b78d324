//! Merged event stream
//!
//! The single time-ordered sequence consumers read. Events are kept sorted by
//! `(mono_time, segment, position in segment)`; the segment and position
//! break timestamp ties so merges are stable and never reorder equal keys.

use crate::filter::EventFilter;
use crate::values::LastValues;
use segreplay_common::Event;
use std::cmp::Ordering;
use tracing::warn;

/// One event on the merged stream with its origin
#[derive(Debug, Clone, PartialEq)]
pub struct MergedEvent {
    pub segment: u32,
    /// Index of the event inside its segment
    pub position: usize,
    pub event: Event,
}

impl MergedEvent {
    fn key(&self) -> (u64, u32, usize) {
        (self.event.mono_time(), self.segment, self.position)
    }

    pub fn mono_time(&self) -> u64 {
        self.event.mono_time()
    }
}

/// Result of merging one segment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub forwarded: usize,
    pub dropped: usize,
    /// True if the events extended the tail
    pub appended: bool,
}

/// Ordered, filtered events of every merged segment
#[derive(Debug, Default)]
pub struct MergedStream {
    events: Vec<MergedEvent>,
    last_values: LastValues,
}

impl MergedStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `events` of `segment` through `filter` and merge the survivors
    ///
    /// With `append` the batch goes onto the tail. If it would start before
    /// the current tail the batch is spliced in instead, so the stream stays
    /// ordered whatever the caller claims.
    pub fn merge_events(
        &mut self,
        segment: u32,
        events: &[Event],
        append: bool,
        filter: &mut dyn EventFilter,
    ) -> MergeOutcome {
        let mut batch = Vec::with_capacity(events.len());
        for (position, event) in events.iter().enumerate() {
            if filter.filter(event, &mut self.last_values) {
                batch.push(MergedEvent {
                    segment,
                    position,
                    event: event.clone(),
                });
            }
        }

        let mut outcome = MergeOutcome {
            forwarded: batch.len(),
            dropped: events.len() - batch.len(),
            appended: false,
        };
        if batch.is_empty() {
            return outcome;
        }

        if !batch.windows(2).all(|w| w[0].key() <= w[1].key()) {
            warn!("Segment {} events are not in time order, sorting", segment);
            batch.sort_by_key(MergedEvent::key);
        }

        let first_key = batch[0].key();
        let extends_tail = self
            .events
            .last()
            .map_or(true, |tail| tail.key() <= first_key);

        if append && extends_tail {
            self.events.extend(batch);
            outcome.appended = true;
        } else {
            if append {
                warn!(
                    "Segment {} starts before the stream tail, inserting instead of appending",
                    segment
                );
            }
            self.insert_sorted(batch);
        }
        outcome
    }

    /// Stable two-way merge of a sorted batch into the stream
    fn insert_sorted(&mut self, batch: Vec<MergedEvent>) {
        let Some(first) = batch.first() else {
            return;
        };
        let first_key = first.key();
        let start = self.events.partition_point(|e| e.key() <= first_key);
        let tail = self.events.split_off(start);
        self.events.reserve(tail.len() + batch.len());

        let mut tail = tail.into_iter().peekable();
        let mut batch = batch.into_iter().peekable();
        loop {
            let next = match (tail.peek(), batch.peek()) {
                (Some(a), Some(b)) => match a.key().cmp(&b.key()) {
                    Ordering::Greater => batch.next(),
                    _ => tail.next(),
                },
                (Some(_), None) => tail.next(),
                (None, Some(_)) => batch.next(),
                (None, None) => break,
            };
            self.events.extend(next);
        }
    }

    pub fn events(&self) -> &[MergedEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn last_values(&self) -> &LastValues {
        &self.last_values
    }

    /// Events with `start <= mono_time < end`
    pub fn range(&self, start: u64, end: u64) -> &[MergedEvent] {
        let lo = self.events.partition_point(|e| e.mono_time() < start);
        let hi = self.events.partition_point(|e| e.mono_time() < end).max(lo);
        &self.events[lo..hi]
    }

    pub fn first_mono_time(&self) -> Option<u64> {
        self.events.first().map(MergedEvent::mono_time)
    }

    /// True if timestamps never decrease along the stream
    pub fn is_ordered(&self) -> bool {
        self.events
            .windows(2)
            .all(|w| w[0].mono_time() <= w[1].mono_time())
    }
}
