//! Event filters run on the merge path
//!
//! A filter sees every event of a newly loaded segment exactly once, before
//! the event is visible on the merged stream. Returning false keeps the
//! event off the stream; the segment still counts as processed.

use crate::values::LastValues;
use segreplay_common::{Event, EventKind};
use std::collections::HashSet;

/// Per-event predicate with access to the last-value cache
pub trait EventFilter: Send {
    fn filter(&mut self, event: &Event, values: &mut LastValues) -> bool;
}

impl<F> EventFilter for F
where
    F: FnMut(&Event, &mut LastValues) -> bool + Send,
{
    fn filter(&mut self, event: &Event, values: &mut LastValues) -> bool {
        self(event, values)
    }
}

/// Default filter: records bus frames in the cache and forwards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct CanUpdateFilter;

impl EventFilter for CanUpdateFilter {
    fn filter(&mut self, event: &Event, values: &mut LastValues) -> bool {
        if *event.kind() == EventKind::Can {
            values.update_event(event);
        }
        true
    }
}

/// Forwards only the listed kinds, updating the cache for all of them
#[derive(Debug, Clone, Default)]
pub struct KindFilter {
    kinds: HashSet<EventKind>,
}

impl KindFilter {
    pub fn new(kinds: impl IntoIterator<Item = EventKind>) -> Self {
        Self {
            kinds: kinds.into_iter().collect(),
        }
    }
}

impl EventFilter for KindFilter {
    fn filter(&mut self, event: &Event, values: &mut LastValues) -> bool {
        if !self.kinds.contains(event.kind()) {
            return false;
        }
        values.update_event(event);
        true
    }
}
