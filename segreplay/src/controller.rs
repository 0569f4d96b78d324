//! Replay stream controller
//!
//! Owns the provider for one loaded route, drives merging from provider
//! notifications, and relays lifecycle and position changes to consumers.
//!
//! The controller holds the only strong reference to the provider. Merging
//! runs on one notification pump task that holds a weak reference, so
//! dropping the controller stops the provider and ends every background
//! task it started.

use crate::coordinator::CacheLimitCoordinator;
use crate::error::{Error, Result};
use crate::filter::{CanUpdateFilter, EventFilter};
use crate::merger::SegmentMerger;
use crate::provider::{ProviderConfig, ProviderEvent, ProviderFactory, SegmentProvider};
use crate::stream::{MergedEvent, MergedStream};
use segreplay_common::events::{EventBus, ReplayEvent, StreamState};
use segreplay_common::{EventKind, ReplayFlags, RouteSpec, Settings};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Event kinds a provider keeps while loading
pub const ALLOWED_EVENT_KINDS: [EventKind; 4] = [
    EventKind::Can,
    EventKind::RoadEncodeIdx,
    EventKind::WideRoadEncodeIdx,
    EventKind::CarParams,
];

/// Replay of one route as a single ordered stream
pub struct ReplayStream<F: ProviderFactory> {
    id: Uuid,
    factory: F,
    state: StreamState,
    bus: Arc<EventBus>,
    coordinator: Option<CacheLimitCoordinator>,
    filter: Option<Box<dyn EventFilter>>,
    merger: Arc<RwLock<SegmentMerger>>,
    stream: Arc<RwLock<MergedStream>>,
    provider: Option<Arc<F::Provider>>,
    pump: Option<JoinHandle<()>>,
}

impl<F: ProviderFactory> ReplayStream<F> {
    /// Create an unloaded stream using the process-wide settings
    pub fn new(factory: F) -> Self {
        Self::with_settings(factory, Settings::global())
    }

    pub fn with_settings(factory: F, settings: Arc<Settings>) -> Self {
        let bus = Arc::new(EventBus::new(settings.event_bus_capacity()));
        Self {
            id: Uuid::new_v4(),
            factory,
            state: StreamState::Unloaded,
            bus,
            coordinator: Some(CacheLimitCoordinator::new(settings)),
            filter: None,
            merger: Arc::new(RwLock::new(SegmentMerger::new())),
            stream: Arc::new(RwLock::new(MergedStream::new())),
            provider: None,
            pump: None,
        }
    }

    /// Replace the default [`CanUpdateFilter`]
    pub fn with_filter(mut self, filter: impl EventFilter + 'static) -> Self {
        self.filter = Some(Box::new(filter));
        self
    }

    /// Load a route and start replaying it
    ///
    /// The route identifier is validated before any provider is built. On a
    /// load failure the provider is dropped and the stream ends up
    /// [`StreamState::Failed`].
    ///
    /// Must be called from within a tokio runtime.
    pub fn load_route(
        &mut self,
        route: &str,
        data_dir: Option<PathBuf>,
        flags: ReplayFlags,
    ) -> Result<()> {
        if self.state != StreamState::Unloaded {
            return Err(Error::InvalidState(format!(
                "cannot load a route while {}",
                self.state
            )));
        }

        let parsed = RouteSpec::from_input(route, data_dir).map_err(|e| Error::MalformedRoute {
            input: route.to_string(),
            reason: match e {
                segreplay_common::Error::InvalidInput(reason) => reason,
                other => other.to_string(),
            },
        })?;

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| Error::InvalidState("load_route needs a tokio runtime".to_string()))?;

        let route_name = parsed.route.to_string();
        self.set_state(StreamState::Loading);
        if flags.has_video() {
            info!("Loading route {} with {}", route_name, flags);
        } else {
            info!("Loading route {} (bus data only)", route_name);
        }

        let provider = Arc::new(self.factory.create(ProviderConfig {
            route: parsed.route,
            data_dir: parsed.data_dir,
            flags,
            allowed_kinds: ALLOWED_EVENT_KINDS.to_vec(),
        }));

        if let Some(coordinator) = &mut self.coordinator {
            // Changes made while unloaded are covered by the current value
            coordinator.resubscribe();
            coordinator.push_current(provider.as_ref());
        }
        let filter = self
            .filter
            .take()
            .unwrap_or_else(|| Box::new(CanUpdateFilter));
        let notifications = provider.subscribe();

        if let Err(e) = provider.load() {
            error!("Failed to load route {}: {}", route_name, e);
            provider.stop();
            drop(provider);
            self.set_state(StreamState::Failed);
            return Err(Error::LoadFailure {
                route: route_name,
                reason: e.reason,
            });
        }

        let pump = NotificationPump {
            provider: Arc::downgrade(&provider),
            notifications,
            coordinator: self.coordinator.take(),
            filter,
            merger: Arc::clone(&self.merger),
            stream: Arc::clone(&self.stream),
            bus: Arc::clone(&self.bus),
        };
        self.pump = Some(runtime.spawn(pump.run()));

        provider.start();
        self.provider = Some(provider);
        self.set_state(StreamState::Running);
        info!("Route {} loaded, stream {} running", route_name, self.id);
        Ok(())
    }

    /// Pause or resume playback
    ///
    /// `Paused`/`Resumed` is emitted after the provider took the call.
    pub fn pause(&mut self, pause: bool) -> Result<()> {
        let provider = self.active_provider("pause")?;
        provider.pause(pause);

        if pause {
            self.bus.emit_lossy(ReplayEvent::paused());
            self.set_state(StreamState::Paused);
        } else {
            self.bus.emit_lossy(ReplayEvent::resumed());
            self.set_state(StreamState::Running);
        }
        Ok(())
    }

    /// Seek to `seconds` from route start
    ///
    /// Completion is reported asynchronously as [`ReplayEvent::SeekedTo`].
    pub fn seek_to(&self, seconds: f64) -> Result<()> {
        self.active_provider("seek")?.seek_to(seconds, false);
        Ok(())
    }

    /// Seek by `delta` seconds from the current position
    pub fn seek_by(&self, delta: f64) -> Result<()> {
        self.active_provider("seek")?.seek_to(delta, true);
        Ok(())
    }

    pub fn current_seconds(&self) -> Option<f64> {
        self.provider.as_ref().map(|p| p.current_seconds())
    }

    /// Stop the provider and the notification pump
    ///
    /// Safe in any state. The stream cannot be loaded again afterwards.
    pub fn stop(&mut self) {
        if let Some(provider) = self.provider.take() {
            provider.stop();
        }
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        if self.state != StreamState::Stopped {
            self.set_state(StreamState::Stopped);
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// The active provider, if a route is loaded
    pub fn provider(&self) -> Option<&F::Provider> {
        self.provider.as_deref()
    }

    /// Subscribe to consumer notifications
    ///
    /// If the stream falls behind its provider, position is republished as
    /// a `SeekedTo` with the current position instead of every lost seek.
    pub fn subscribe(&self) -> broadcast::Receiver<ReplayEvent> {
        self.bus.subscribe()
    }

    /// Shared handle to the merged stream
    pub fn stream(&self) -> Arc<RwLock<MergedStream>> {
        Arc::clone(&self.stream)
    }

    /// Copy of the merged events so far
    pub async fn merged_events(&self) -> Vec<MergedEvent> {
        self.stream.read().await.events().to_vec()
    }

    pub async fn processed_segments(&self) -> BTreeSet<u32> {
        self.merger.read().await.processed().clone()
    }

    fn active_provider(&self, operation: &str) -> Result<&F::Provider> {
        match &self.provider {
            Some(provider) if self.state.has_provider() => Ok(provider.as_ref()),
            _ => Err(Error::InvalidState(format!(
                "cannot {} while {}",
                operation, self.state
            ))),
        }
    }

    fn set_state(&mut self, new_state: StreamState) {
        let old_state = self.state;
        if old_state == new_state {
            return;
        }
        self.state = new_state;
        info!("Stream {}: {} -> {}", self.id, old_state, new_state);
        self.bus
            .emit_lossy(ReplayEvent::state_changed(old_state, new_state));
    }
}

impl<F: ProviderFactory> Drop for ReplayStream<F> {
    fn drop(&mut self) {
        if self.provider.is_some() || self.pump.is_some() {
            debug!("Dropping stream {} with an active provider", self.id);
            self.stop();
        }
    }
}

/// Merges segments and relays provider notifications on one task
struct NotificationPump<P: SegmentProvider> {
    provider: Weak<P>,
    notifications: broadcast::Receiver<ProviderEvent>,
    coordinator: Option<CacheLimitCoordinator>,
    filter: Box<dyn EventFilter>,
    merger: Arc<RwLock<SegmentMerger>>,
    stream: Arc<RwLock<MergedStream>>,
    bus: Arc<EventBus>,
}

impl<P: SegmentProvider> NotificationPump<P> {
    async fn run(mut self) {
        let mut coordinator = self.coordinator.take();

        loop {
            tokio::select! {
                notification = self.notifications.recv() => match notification {
                    Ok(ProviderEvent::SegmentsMerged) => self.merge_segments().await,
                    Ok(ProviderEvent::SeekedTo(seconds)) => {
                        self.bus.emit_lossy(ReplayEvent::seeked_to(seconds));
                    }
                    Ok(ProviderEvent::StreamStarted) => {
                        self.bus.emit_lossy(ReplayEvent::stream_started());
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Notification pump lagged by {} provider events", skipped);
                        self.resync().await;
                    }
                    Err(RecvError::Closed) => break,
                },
                change = next_setting(&mut coordinator) => match change {
                    Some(change) => {
                        let Some(provider) = self.provider.upgrade() else {
                            break;
                        };
                        if let Some(coordinator) = &coordinator {
                            coordinator.on_change(&change, Some(provider.as_ref()));
                        }
                    }
                    None => coordinator = None,
                },
            }
        }

        debug!("Notification pump finished");
    }

    /// Recover from lost provider notifications
    ///
    /// Lost segment notifications are covered by a rescan, lost seeks by
    /// publishing the current position. A lost `StreamStarted` is not
    /// replayed.
    async fn resync(&mut self) {
        self.merge_segments().await;
        if let Some(provider) = self.provider.upgrade() {
            self.bus
                .emit_lossy(ReplayEvent::seeked_to(provider.current_seconds()));
        }
    }

    async fn merge_segments(&mut self) {
        let segments = match self.provider.upgrade() {
            Some(provider) => provider.segments(),
            None => return,
        };

        let report = {
            let mut merger = self.merger.write().await;
            let mut stream = self.stream.write().await;
            merger.on_segments_changed(&segments, &mut stream, &mut *self.filter)
        };

        if report.is_empty() {
            return;
        }
        debug!(
            "Merged segments {:?}: {} events forwarded, {} dropped",
            report.segments(),
            report.forwarded,
            report.dropped
        );
        self.bus.emit_lossy(ReplayEvent::EventsMerged {
            segments: report.segments(),
            appended: report.all_appended(),
            forwarded: report.forwarded,
            timestamp: chrono::Utc::now(),
        });
    }
}

/// Next settings change, pending forever once settings are gone
async fn next_setting(
    coordinator: &mut Option<CacheLimitCoordinator>,
) -> Option<segreplay_common::SettingChange> {
    match coordinator {
        Some(coordinator) => coordinator.next_change().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{MemoryProviderFactory, MemoryRoute, ProviderCall};

    fn replay(route: MemoryRoute) -> ReplayStream<MemoryProviderFactory> {
        ReplayStream::with_settings(MemoryProviderFactory::new(route), Arc::new(Settings::new()))
    }

    const ROUTE: &str = "a2a0ccea32023010|2023-08-14--12-30-05";

    #[tokio::test]
    async fn test_load_route_starts_provider() {
        let mut stream = replay(MemoryRoute::synthetic(2, 5));
        stream.load_route(ROUTE, None, ReplayFlags::None).unwrap();

        assert_eq!(stream.state(), StreamState::Running);
        let provider = stream.provider().unwrap();
        assert_eq!(
            provider.calls(),
            vec![
                ProviderCall::SetCacheLimit(30),
                ProviderCall::Load,
                ProviderCall::Start
            ]
        );
        assert_eq!(provider.config().allowed_kinds, ALLOWED_EVENT_KINDS.to_vec());
        assert_eq!(provider.config().flags, ReplayFlags::None);
    }

    #[tokio::test]
    async fn test_second_load_rejected() {
        let mut stream = replay(MemoryRoute::synthetic(1, 1));
        stream.load_route(ROUTE, None, ReplayFlags::None).unwrap();

        let err = stream.load_route(ROUTE, None, ReplayFlags::None).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        assert_eq!(stream.factory().created(), 1);
    }

    #[tokio::test]
    async fn test_load_failure_sets_failed() {
        let mut stream = replay(MemoryRoute::new());
        let err = stream.load_route(ROUTE, None, ReplayFlags::None).unwrap_err();

        assert!(matches!(err, Error::LoadFailure { .. }));
        assert!(err.to_string().contains("no segments found"));
        assert_eq!(stream.state(), StreamState::Failed);
        assert!(stream.provider().is_none());
        assert!(stream.pause(true).is_err());
    }

    #[tokio::test]
    async fn test_malformed_route_keeps_unloaded() {
        let mut stream = replay(MemoryRoute::synthetic(1, 1));
        let err = stream.load_route("not-a-route", None, ReplayFlags::None).unwrap_err();

        assert!(matches!(err, Error::MalformedRoute { .. }));
        assert_eq!(stream.state(), StreamState::Unloaded);
        assert_eq!(stream.factory().created(), 0);
    }

    #[tokio::test]
    async fn test_pause_before_load_rejected() {
        let mut stream = replay(MemoryRoute::synthetic(1, 1));
        assert!(matches!(stream.pause(true), Err(Error::InvalidState(_))));
        assert!(stream.seek_to(1.0).is_err());
        assert_eq!(stream.current_seconds(), None);
    }

    #[tokio::test]
    async fn test_stop_is_terminal() {
        let mut stream = replay(MemoryRoute::synthetic(1, 1));
        stream.load_route(ROUTE, None, ReplayFlags::None).unwrap();
        stream.stop();

        assert_eq!(stream.state(), StreamState::Stopped);
        assert!(stream.provider().is_none());
        assert!(stream.load_route(ROUTE, None, ReplayFlags::None).is_err());
        stream.stop();
    }

    #[tokio::test]
    async fn test_state_changes_published() {
        let mut stream = replay(MemoryRoute::synthetic(1, 1));
        let mut events = stream.subscribe();
        stream.load_route(ROUTE, None, ReplayFlags::None).unwrap();

        let mut transitions = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ReplayEvent::StateChanged {
                old_state,
                new_state,
                ..
            } = event
            {
                transitions.push((old_state, new_state));
            }
        }
        assert_eq!(
            transitions,
            vec![
                (StreamState::Unloaded, StreamState::Loading),
                (StreamState::Loading, StreamState::Running),
            ]
        );
    }
}
