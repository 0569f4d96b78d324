//! In-process segment provider
//!
//! Serves a scripted route from memory. Segments complete either on demand
//! ([`MemoryProvider::complete_segment`]) or from a background loader task
//! that walks a configured completion order. Every control call is recorded
//! so callers can check what reached the provider.

use super::{
    LoadError, ProviderConfig, ProviderEvent, ProviderFactory, Segment, SegmentMap,
    SegmentProvider,
};
use segreplay_common::settings::DEFAULT_MAX_CACHED_MINUTES;
use segreplay_common::{CanFrame, Event, EventKind};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Length of one route segment
pub const SEGMENT_SECONDS: u64 = 60;

const SEGMENT_NANOS: u64 = SEGMENT_SECONDS * 1_000_000_000;

/// Monotonic clock reading at the start of synthetic routes
const SYNTHETIC_ROUTE_START: u64 = 1_000_000_000_000;

const NOTIFICATION_CAPACITY: usize = 256;

/// Scripted contents of a route, events per segment index
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryRoute {
    segments: BTreeMap<u32, Vec<Event>>,
}

impl MemoryRoute {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_segment(mut self, index: u32, events: Vec<Event>) -> Self {
        self.segments.insert(index, events);
        self
    }

    /// Route of `segments` one-minute segments with evenly spaced events
    ///
    /// Every tenth event is a road camera index record, the rest are bus
    /// frames cycling over four addresses.
    pub fn synthetic(segments: u32, events_per_segment: usize) -> Self {
        let spacing = SEGMENT_NANOS / events_per_segment.max(1) as u64;
        let mut route = Self::new();

        for segment in 0..segments {
            let segment_start = SYNTHETIC_ROUTE_START + u64::from(segment) * SEGMENT_NANOS;
            let events = (0..events_per_segment)
                .map(|i| {
                    let mono_time = segment_start + i as u64 * spacing;
                    if i % 10 == 0 {
                        let frame = segment * 1200 + i as u32;
                        Event::encode_index(mono_time, EventKind::RoadEncodeIdx, frame, segment, i as u32)
                    } else {
                        let address = 0x100 + (i % 4) as u32;
                        let data = vec![segment as u8, i as u8, 0, 0, 0, 0, 0, 0];
                        Event::can(mono_time, vec![CanFrame::new(0, address, data)])
                    }
                })
                .collect();
            route.segments.insert(segment, events);
        }

        route
    }

    pub fn segment_indices(&self) -> impl Iterator<Item = u32> + '_ {
        self.segments.keys().copied()
    }

    pub fn total_events(&self) -> usize {
        self.segments.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    fn duration_seconds(&self) -> f64 {
        self.segments
            .keys()
            .next_back()
            .map_or(0.0, |last| f64::from(last + 1) * SEGMENT_SECONDS as f64)
    }
}

/// A control call that reached the provider
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderCall {
    Load,
    Start,
    Stop,
    Pause(bool),
    SeekTo { seconds: f64, relative: bool },
    SetCacheLimit(u32),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared with the background loader task
struct Shared {
    config: ProviderConfig,
    route: MemoryRoute,
    segments: Mutex<SegmentMap>,
    notifications: broadcast::Sender<ProviderEvent>,
    cache_limit: AtomicU32,
    position: Mutex<f64>,
    paused: AtomicBool,
    stopped: AtomicBool,
    calls: Mutex<Vec<ProviderCall>>,
}

impl Shared {
    fn record(&self, call: ProviderCall) {
        lock(&self.calls).push(call);
    }

    fn notify(&self, event: ProviderEvent) {
        // No receivers only means nobody is listening yet
        let _ = self.notifications.send(event);
    }

    fn complete_segment(&self, index: u32) -> bool {
        if self.stopped.load(Ordering::Acquire) {
            return false;
        }
        if !self.config.route.contains_segment(index) {
            return false;
        }
        let Some(scripted) = self.route.segments.get(&index) else {
            warn!("Segment {} is not part of route {}", index, self.config.route);
            return false;
        };

        let events: Vec<Event> = scripted
            .iter()
            .filter(|event| self.config.allows(event.kind()))
            .cloned()
            .collect();
        let kept = events.len();

        {
            let mut segments = lock(&self.segments);
            // An evicted segment comes back as a fresh one
            let segment = segments
                .entry(index)
                .or_insert(None)
                .get_or_insert_with(|| Arc::new(Segment::new(index)));
            if !segment.complete(events) {
                return false;
            }
            let evicted = self.evict(&mut segments, Some(index));
            if !evicted.is_empty() {
                debug!("Evicted segments {:?} after loading {}", evicted, index);
            }
        }

        debug!(
            "Segment {} loaded: {} of {} events kept",
            index,
            kept,
            scripted.len()
        );
        self.notify(ProviderEvent::SegmentsMerged);
        true
    }

    /// Drop the lowest loaded segments beyond the cache limit
    ///
    /// One segment covers one minute, so the limit in minutes is also the
    /// number of segments kept resident.
    fn evict(&self, segments: &mut SegmentMap, keep: Option<u32>) -> Vec<u32> {
        let limit = self.cache_limit.load(Ordering::Acquire) as usize;
        let loaded: Vec<u32> = segments
            .iter()
            .filter(|(_, segment)| segment.as_ref().is_some_and(|s| s.is_loaded()))
            .map(|(index, _)| *index)
            .collect();

        let excess = loaded.len().saturating_sub(limit);
        let evicted: Vec<u32> = loaded
            .into_iter()
            .filter(|index| Some(*index) != keep)
            .take(excess)
            .collect();

        for index in &evicted {
            segments.insert(*index, None);
        }
        evicted
    }
}

/// In-process [`SegmentProvider`]
pub struct MemoryProvider {
    shared: Arc<Shared>,
    load_order: Option<Vec<u32>>,
    load_interval: Duration,
    loader: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryProvider {
    pub fn new(config: ProviderConfig, route: MemoryRoute) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                config,
                route,
                segments: Mutex::new(SegmentMap::new()),
                notifications,
                cache_limit: AtomicU32::new(DEFAULT_MAX_CACHED_MINUTES),
                position: Mutex::new(0.0),
                paused: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                calls: Mutex::new(Vec::new()),
            }),
            load_order: None,
            load_interval: Duration::ZERO,
            loader: Mutex::new(None),
        }
    }

    /// Complete segments in `order` from a background task after `start`,
    /// waiting `interval` before each one
    pub fn with_load_order(mut self, order: Vec<u32>, interval: Duration) -> Self {
        self.load_order = Some(order);
        self.load_interval = interval;
        self
    }

    /// Mark segment `index` as fully loaded and notify subscribers
    ///
    /// Returns false if the segment is unknown, outside the requested range,
    /// already loaded, or the provider is stopped.
    pub fn complete_segment(&self, index: u32) -> bool {
        self.shared.complete_segment(index)
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.shared.config
    }

    /// Control calls received so far, oldest first
    pub fn calls(&self) -> Vec<ProviderCall> {
        lock(&self.shared.calls).clone()
    }

    /// Cache limit pushes received so far
    pub fn cache_limit_pushes(&self) -> Vec<u32> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ProviderCall::SetCacheLimit(minutes) => Some(minutes),
                _ => None,
            })
            .collect()
    }

    pub fn cache_limit(&self) -> u32 {
        self.shared.cache_limit.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::Acquire)
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    /// Indices of segments currently resident and loaded
    pub fn loaded_segments(&self) -> Vec<u32> {
        lock(&self.shared.segments)
            .iter()
            .filter(|(_, segment)| segment.as_ref().is_some_and(|s| s.is_loaded()))
            .map(|(index, _)| *index)
            .collect()
    }

    fn abort_loader(&self) {
        if let Some(handle) = lock(&self.loader).take() {
            handle.abort();
        }
    }
}

impl SegmentProvider for MemoryProvider {
    fn segments(&self) -> SegmentMap {
        lock(&self.shared.segments).clone()
    }

    fn load(&self) -> Result<(), LoadError> {
        let shared = &self.shared;
        shared.record(ProviderCall::Load);

        let route = &shared.config.route;
        if shared.route.is_empty() {
            return Err(LoadError::new(format!("no segments found for route {}", route)));
        }

        let selected: Vec<u32> = shared
            .route
            .segment_indices()
            .filter(|index| route.contains_segment(*index))
            .collect();
        if selected.is_empty() {
            return Err(LoadError::new(format!(
                "segment range of {} selects no recorded segments",
                route
            )));
        }

        {
            let mut segments = lock(&shared.segments);
            for index in &selected {
                segments
                    .entry(*index)
                    .or_insert_with(|| Some(Arc::new(Segment::new(*index))));
            }
        }

        info!(
            "Route {} loaded: {} segments, camera {}",
            route,
            selected.len(),
            shared.config.flags
        );
        shared.notify(ProviderEvent::SegmentsMerged);
        Ok(())
    }

    fn start(&self) {
        self.shared.record(ProviderCall::Start);
        if self.is_stopped() {
            return;
        }
        self.shared.notify(ProviderEvent::StreamStarted);

        let Some(order) = self.load_order.clone() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No async runtime, background loading disabled");
            return;
        };

        let shared = Arc::clone(&self.shared);
        let interval = self.load_interval;
        let handle = runtime.spawn(async move {
            for index in order {
                tokio::time::sleep(interval).await;
                if shared.stopped.load(Ordering::Acquire) {
                    break;
                }
                shared.complete_segment(index);
            }
            debug!("Background loader finished");
        });
        *lock(&self.loader) = Some(handle);
    }

    fn stop(&self) {
        self.shared.record(ProviderCall::Stop);
        self.shared.stopped.store(true, Ordering::Release);
        self.abort_loader();
    }

    fn pause(&self, pause: bool) {
        self.shared.record(ProviderCall::Pause(pause));
        self.shared.paused.store(pause, Ordering::Release);
    }

    fn seek_to(&self, seconds: f64, relative: bool) {
        let shared = &self.shared;
        shared.record(ProviderCall::SeekTo { seconds, relative });

        let target = {
            let mut position = lock(&shared.position);
            let target = if relative { *position + seconds } else { seconds };
            *position = target.clamp(0.0, shared.route.duration_seconds());
            *position
        };
        shared.notify(ProviderEvent::SeekedTo(target));
    }

    fn current_seconds(&self) -> f64 {
        *lock(&self.shared.position)
    }

    fn set_segment_cache_limit(&self, minutes: u32) {
        let shared = &self.shared;
        shared.record(ProviderCall::SetCacheLimit(minutes));
        shared.cache_limit.store(minutes, Ordering::Release);

        let evicted = shared.evict(&mut lock(&shared.segments), None);
        if !evicted.is_empty() {
            info!("Cache limit {} min evicted segments {:?}", minutes, evicted);
            shared.notify(ProviderEvent::SegmentsMerged);
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<ProviderEvent> {
        self.shared.notifications.subscribe()
    }
}

impl Drop for MemoryProvider {
    fn drop(&mut self) {
        self.abort_loader();
    }
}

/// Builds [`MemoryProvider`]s over one scripted route
pub struct MemoryProviderFactory {
    route: MemoryRoute,
    load_order: Option<(Vec<u32>, Duration)>,
    created: AtomicUsize,
}

impl MemoryProviderFactory {
    pub fn new(route: MemoryRoute) -> Self {
        Self {
            route,
            load_order: None,
            created: AtomicUsize::new(0),
        }
    }

    /// Providers built by this factory load segments in the background
    pub fn with_load_order(mut self, order: Vec<u32>, interval: Duration) -> Self {
        self.load_order = Some((order, interval));
        self
    }

    /// Number of providers built so far
    pub fn created(&self) -> usize {
        self.created.load(Ordering::Acquire)
    }
}

impl ProviderFactory for MemoryProviderFactory {
    type Provider = MemoryProvider;

    fn create(&self, config: ProviderConfig) -> MemoryProvider {
        self.created.fetch_add(1, Ordering::AcqRel);
        let provider = MemoryProvider::new(config, self.route.clone());
        match &self.load_order {
            Some((order, interval)) => provider.with_load_order(order.clone(), *interval),
            None => provider,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use segreplay_common::{ReplayFlags, RouteName};

    fn config(route: &str, allowed: &[EventKind]) -> ProviderConfig {
        ProviderConfig {
            route: RouteName::parse(route).unwrap(),
            data_dir: None,
            flags: ReplayFlags::None,
            allowed_kinds: allowed.to_vec(),
        }
    }

    const ROUTE: &str = "a2a0ccea32023010|2023-08-14--12-30-05";

    #[test]
    fn test_synthetic_route_shape() {
        let route = MemoryRoute::synthetic(3, 10);
        assert_eq!(route.segment_indices().collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(route.total_events(), 30);
        assert_eq!(route.duration_seconds(), 180.0);

        let first = &route.segments[&1];
        assert_eq!(*first[0].kind(), EventKind::RoadEncodeIdx);
        assert_eq!(*first[1].kind(), EventKind::Can);
        assert!(first.windows(2).all(|w| w[0].mono_time() < w[1].mono_time()));
        assert!(route.segments[&0].last().unwrap().mono_time() < first[0].mono_time());
    }

    #[test]
    fn test_load_registers_unloaded_segments() {
        let provider = MemoryProvider::new(config(ROUTE, &[]), MemoryRoute::synthetic(3, 5));
        provider.load().unwrap();

        let segments = provider.segments();
        assert_eq!(segments.len(), 3);
        assert!(segments.values().all(|s| !s.as_ref().unwrap().is_loaded()));
        assert!(provider.loaded_segments().is_empty());
    }

    #[test]
    fn test_load_empty_route_fails() {
        let provider = MemoryProvider::new(config(ROUTE, &[]), MemoryRoute::new());
        let err = provider.load().unwrap_err();
        assert!(err.reason.contains("no segments found"));
    }

    #[test]
    fn test_segment_range_limits_segments() {
        let route = format!("{}--1--2", ROUTE);
        let provider = MemoryProvider::new(config(&route, &[]), MemoryRoute::synthetic(4, 5));
        provider.load().unwrap();
        assert_eq!(provider.segments().keys().copied().collect::<Vec<_>>(), vec![1, 2]);
        assert!(!provider.complete_segment(3));

        let out_of_range = format!("{}--7", ROUTE);
        let provider = MemoryProvider::new(config(&out_of_range, &[]), MemoryRoute::synthetic(4, 5));
        assert!(provider.load().is_err());
    }

    #[test]
    fn test_whitelist_applied_on_completion() {
        let route = MemoryRoute::new().with_segment(
            0,
            vec![
                Event::can(1, vec![CanFrame::new(0, 0x10, vec![1])]),
                Event::raw(2, "gpsLocation", vec![]),
                Event::car_params(3, serde_json::json!({"carFingerprint": "MOCK"})),
            ],
        );
        let provider = MemoryProvider::new(
            config(ROUTE, &[EventKind::Can, EventKind::CarParams]),
            route,
        );
        provider.load().unwrap();

        assert!(provider.complete_segment(0));
        assert!(!provider.complete_segment(0));

        let segment = provider.segments()[&0].clone().unwrap();
        let kinds: Vec<_> = segment.events().iter().map(|e| e.kind().clone()).collect();
        assert_eq!(kinds, vec![EventKind::Can, EventKind::CarParams]);
    }

    #[test]
    fn test_cache_limit_evicts_lowest_segments() {
        let provider = MemoryProvider::new(config(ROUTE, &[]), MemoryRoute::synthetic(8, 2));
        provider.load().unwrap();
        provider.set_segment_cache_limit(5);

        for index in 0..7 {
            provider.complete_segment(index);
        }
        assert_eq!(provider.loaded_segments(), vec![2, 3, 4, 5, 6]);
        assert!(provider.segments()[&0].is_none());

        provider.set_segment_cache_limit(3);
        assert_eq!(provider.loaded_segments(), vec![4, 5, 6]);
        assert_eq!(provider.cache_limit_pushes(), vec![5, 3]);
    }

    #[test]
    fn test_seek_is_clamped_and_notified() {
        let provider = MemoryProvider::new(config(ROUTE, &[]), MemoryRoute::synthetic(2, 2));
        let mut notifications = provider.subscribe();

        provider.seek_to(90.0, false);
        provider.seek_to(-200.0, true);
        provider.seek_to(500.0, false);

        assert_eq!(notifications.try_recv().unwrap(), ProviderEvent::SeekedTo(90.0));
        assert_eq!(notifications.try_recv().unwrap(), ProviderEvent::SeekedTo(0.0));
        assert_eq!(notifications.try_recv().unwrap(), ProviderEvent::SeekedTo(120.0));
        assert_eq!(provider.current_seconds(), 120.0);
    }

    #[test]
    fn test_stopped_provider_ignores_completion() {
        let provider = MemoryProvider::new(config(ROUTE, &[]), MemoryRoute::synthetic(2, 2));
        provider.load().unwrap();
        provider.stop();

        assert!(provider.is_stopped());
        assert!(!provider.complete_segment(0));
        assert_eq!(provider.calls(), vec![ProviderCall::Load, ProviderCall::Stop]);
    }

    #[tokio::test]
    async fn test_background_loader_follows_order() {
        let provider = MemoryProvider::new(config(ROUTE, &[]), MemoryRoute::synthetic(3, 4))
            .with_load_order(vec![2, 0, 1], Duration::from_millis(1));
        let mut notifications = provider.subscribe();
        provider.load().unwrap();
        provider.start();

        let mut merged = 0;
        while merged < 4 {
            let event = tokio::time::timeout(Duration::from_secs(5), notifications.recv())
                .await
                .expect("loader stalled")
                .unwrap();
            if event == ProviderEvent::SegmentsMerged {
                merged += 1;
            }
        }

        // load() announces the segment set once, then one per completion
        assert_eq!(provider.loaded_segments(), vec![0, 1, 2]);
    }

    #[test]
    fn test_factory_counts_providers() {
        let factory = MemoryProviderFactory::new(MemoryRoute::synthetic(1, 1));
        assert_eq!(factory.created(), 0);
        let _a = factory.create(config(ROUTE, &[]));
        let _b = factory.create(config(ROUTE, &[]));
        assert_eq!(factory.created(), 2);
    }
}
