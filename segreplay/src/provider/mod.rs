//! Segment provider interface
//!
//! A provider discovers the segments of a route, loads them on background
//! tasks, and owns them for as long as its cache policy keeps them resident.
//! The replay core only reads loaded segments and reacts to
//! [`ProviderEvent`] notifications.

pub mod memory;

use segreplay_common::{Event, EventKind, ReplayFlags, RouteName};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tokio::sync::broadcast;

pub use memory::{MemoryProvider, MemoryProviderFactory, MemoryRoute, ProviderCall};

/// Known segments of a route, by sequence index
///
/// `None` marks a segment the provider knows about but has no data for
/// (not fetched yet, or evicted).
pub type SegmentMap = BTreeMap<u32, Option<Arc<Segment>>>;

/// One numbered chunk of a route log
///
/// Events are published exactly once through a write-once cell, so readers
/// either see an unloaded segment or the complete event list, never a
/// partially filled one.
#[derive(Debug)]
pub struct Segment {
    index: u32,
    events: OnceLock<Vec<Event>>,
}

impl Segment {
    /// A discovered segment whose events are not loaded yet
    pub fn new(index: u32) -> Self {
        Self {
            index,
            events: OnceLock::new(),
        }
    }

    /// A segment that is already fully loaded
    pub fn with_events(index: u32, events: Vec<Event>) -> Self {
        let segment = Self::new(index);
        segment.complete(events);
        segment
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn is_loaded(&self) -> bool {
        self.events.get().is_some()
    }

    /// Publish the loaded events
    ///
    /// Returns false if the segment was already loaded; the first event list
    /// wins.
    pub fn complete(&self, events: Vec<Event>) -> bool {
        self.events.set(events).is_ok()
    }

    /// Events of a loaded segment, empty while loading
    pub fn events(&self) -> &[Event] {
        self.events.get().map(Vec::as_slice).unwrap_or(&[])
    }

    /// Time span covered by the loaded events, in nanoseconds
    pub fn time_range(&self) -> Option<(u64, u64)> {
        let events = self.events();
        Some((events.first()?.mono_time(), events.last()?.mono_time()))
    }
}

/// Notifications published by a provider
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    /// A seek completed, position in seconds from route start
    SeekedTo(f64),
    /// Playback started streaming
    StreamStarted,
    /// A segment finished loading or the set of known segments changed
    SegmentsMerged,
}

/// Reason a provider could not load its route
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{reason}")]
pub struct LoadError {
    pub reason: String,
}

impl LoadError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Everything a provider needs to replay one route
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderConfig {
    pub route: RouteName,
    pub data_dir: Option<PathBuf>,
    pub flags: ReplayFlags,
    /// Event kinds to keep while loading, everything else is discarded
    pub allowed_kinds: Vec<EventKind>,
}

impl ProviderConfig {
    pub fn allows(&self, kind: &EventKind) -> bool {
        self.allowed_kinds.is_empty() || self.allowed_kinds.contains(kind)
    }
}

/// Loads and caches the segments of one route
///
/// All control calls are fire-and-forget: they must return promptly and
/// leave any synchronization with background loading to the provider.
pub trait SegmentProvider: Send + Sync + 'static {
    /// Snapshot of known segments
    fn segments(&self) -> SegmentMap;

    /// Initial load of the route description
    fn load(&self) -> Result<(), LoadError>;

    /// Start background loading and playback
    fn start(&self);

    /// Stop background loading and playback; must be safe to call at any
    /// point, including before `load` succeeded
    fn stop(&self);

    fn pause(&self, pause: bool);

    /// Seek to `seconds` from route start, or by `seconds` if `relative`
    fn seek_to(&self, seconds: f64, relative: bool);

    /// Current playback position in seconds from route start
    fn current_seconds(&self) -> f64;

    /// Maximum minutes of route data to keep resident
    fn set_segment_cache_limit(&self, minutes: u32);

    /// Subscribe to provider notifications
    fn subscribe(&self) -> broadcast::Receiver<ProviderEvent>;
}

/// Builds a provider for a route
pub trait ProviderFactory: Send + Sync {
    type Provider: SegmentProvider;

    fn create(&self, config: ProviderConfig) -> Self::Provider;
}
