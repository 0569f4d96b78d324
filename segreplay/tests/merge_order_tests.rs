//! Merge behavior under out-of-order and repeated segment completion
//!
//! Drives the merger directly with provider-style segment snapshots, one
//! snapshot per completion notification.

use segreplay::filter::{CanUpdateFilter, EventFilter};
use segreplay::merger::SegmentMerger;
use segreplay::provider::{Segment, SegmentMap};
use segreplay::stream::{MergedEvent, MergedStream};
use segreplay::LastValues;
use segreplay_common::{CanFrame, Event, EventKind};
use std::sync::Arc;

const SEGMENT_NANOS: u64 = 60_000_000_000;

fn segment_events(index: u32, count: u64) -> Vec<Event> {
    let start = u64::from(index) * SEGMENT_NANOS;
    (0..count)
        .map(|i| {
            let frame = CanFrame::new(0, 0x100 + i as u32 % 3, vec![index as u8, i as u8]);
            Event::can(start + i * 1_000_000, vec![frame])
        })
        .collect()
}

/// Known-but-unloaded map for `segments` segments
fn discovered(segments: u32) -> SegmentMap {
    (0..segments)
        .map(|i| (i, Some(Arc::new(Segment::new(i)))))
        .collect()
}

/// Complete segments in `order`, notifying the merger after each one
fn replay_in_order(order: &[u32], filter: &mut dyn EventFilter) -> (SegmentMerger, MergedStream) {
    let mut merger = SegmentMerger::new();
    let mut stream = MergedStream::new();
    let mut segments = discovered(order.len() as u32);

    for &index in order {
        segments.insert(index, Some(Arc::new(Segment::with_events(index, segment_events(index, 10)))));
        merger.on_segments_changed(&segments, &mut stream, filter);
    }
    (merger, stream)
}

#[test]
fn test_completion_order_does_not_change_result() {
    let (_, reference) = replay_in_order(&[0, 1, 2], &mut CanUpdateFilter);
    assert_eq!(reference.len(), 30);
    assert!(reference.is_ordered());

    for order in [[2, 0, 1], [1, 2, 0]] {
        let (merger, stream) = replay_in_order(&order, &mut CanUpdateFilter);
        assert_eq!(stream.events(), reference.events(), "order {:?}", order);
        assert_eq!(merger.processed().len(), 3);
    }
}

#[test]
fn test_append_flags_follow_processed_maximum() {
    let mut merger = SegmentMerger::new();
    let mut stream = MergedStream::new();
    let mut segments = discovered(6);
    let mut flags = Vec::new();

    for index in [5, 3, 4, 0] {
        segments.insert(index, Some(Arc::new(Segment::with_events(index, segment_events(index, 2)))));
        let report = merger.on_segments_changed(&segments, &mut stream, &mut CanUpdateFilter);
        flags.extend(report.merged);
    }

    assert_eq!(flags, vec![(5, true), (3, false), (4, false), (0, false)]);
    assert!(stream.is_ordered());

    let origin: Vec<u32> = stream.events().iter().map(|e| e.segment).collect();
    assert_eq!(origin, vec![0, 0, 3, 3, 4, 4, 5, 5]);
}

#[test]
fn test_repeated_notifications_merge_once() {
    let mut merger = SegmentMerger::new();
    let mut stream = MergedStream::new();
    let mut segments = discovered(3);
    segments.insert(1, Some(Arc::new(Segment::with_events(1, segment_events(1, 10)))));

    let mut reports = Vec::new();
    for _ in 0..4 {
        reports.push(merger.on_segments_changed(&segments, &mut stream, &mut CanUpdateFilter));
    }

    assert_eq!(reports[0].segments(), vec![1]);
    assert!(reports[1..].iter().all(|r| r.is_empty()));
    assert_eq!(stream.len(), 10);
    assert_eq!(merger.processed().iter().copied().collect::<Vec<_>>(), vec![1]);
}

#[test]
fn test_processed_set_equals_loaded_segments() {
    let mut merger = SegmentMerger::new();
    let mut stream = MergedStream::new();
    let mut segments = discovered(8);

    // Completions arrive shuffled with duplicates; segment 6 never loads
    for index in [7, 2, 2, 0, 5, 7, 1, 3, 4, 0] {
        segments.insert(index, Some(Arc::new(Segment::with_events(index, segment_events(index, 3)))));
        merger.on_segments_changed(&segments, &mut stream, &mut CanUpdateFilter);
    }

    let loaded: Vec<u32> = segments
        .iter()
        .filter(|(_, s)| s.as_ref().is_some_and(|s| s.is_loaded()))
        .map(|(i, _)| *i)
        .collect();
    assert_eq!(merger.processed().iter().copied().collect::<Vec<_>>(), loaded);
    assert!(!merger.is_processed(6));
    assert_eq!(stream.len(), 7 * 3);
    assert!(stream.is_ordered());
}

#[test]
fn test_evicted_segment_is_not_merged_again() {
    let mut merger = SegmentMerger::new();
    let mut stream = MergedStream::new();
    let mut segments = discovered(2);
    segments.insert(0, Some(Arc::new(Segment::with_events(0, segment_events(0, 5)))));
    merger.on_segments_changed(&segments, &mut stream, &mut CanUpdateFilter);

    // Evicted, then loaded again by the provider
    segments.insert(0, None);
    merger.on_segments_changed(&segments, &mut stream, &mut CanUpdateFilter);
    segments.insert(0, Some(Arc::new(Segment::with_events(0, segment_events(0, 5)))));
    let report = merger.on_segments_changed(&segments, &mut stream, &mut CanUpdateFilter);

    assert!(report.is_empty());
    assert_eq!(stream.len(), 5);
}

#[test]
fn test_rejected_events_never_visible() {
    let mut only_first_address = |event: &Event, values: &mut LastValues| {
        values.update_event(event);
        event.can_frames().iter().all(|f| f.address == 0x100)
    };
    let (merger, stream) = replay_in_order(&[2, 1, 0], &mut only_first_address);

    assert_eq!(merger.processed().len(), 3);
    assert!(stream
        .events()
        .iter()
        .all(|e: &MergedEvent| e.event.can_frames()[0].address == 0x100));
    // Indices 0, 3, 6, 9 of each segment use address 0x100
    assert_eq!(stream.len(), 12);
    // Rejected events still reached the cache
    assert_eq!(stream.last_values().messages().count(), 3);
    assert!(stream.events().iter().all(|e| *e.event.kind() == EventKind::Can));
}
