//! Process-wide replay settings
//!
//! Read-frequently, write-rarely values shared by every replay stream in the
//! process. Each write is validated against [`SettingMetadata`] and then
//! broadcast as a [`SettingChange`], so running streams can react while a
//! replay is in progress (e.g. resizing the segment cache).
//!
//! # Usage
//!
//! ```rust
//! use segreplay_common::settings::Settings;
//!
//! let settings = Settings::global();
//! let mut changes = settings.subscribe();
//!
//! settings.set_max_cached_minutes(10).unwrap();
//! assert_eq!(settings.max_cached_minutes(), 10);
//! # let _ = changes.try_recv();
//! ```

use crate::{Error, Result};
use once_cell::sync::Lazy;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Default segment cache size in minutes of route data
pub const DEFAULT_MAX_CACHED_MINUTES: u32 = 30;
/// Default consumer notification buffer
pub const DEFAULT_EVENT_BUS_CAPACITY: usize = 1000;

const CHANGE_CHANNEL_CAPACITY: usize = 64;

static GLOBAL: Lazy<Arc<Settings>> = Lazy::new(|| Arc::new(Settings::new()));

/// A setting value that changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingChange {
    MaxCachedMinutes(u32),
    EventBusCapacity(usize),
}

impl SettingChange {
    pub fn key(&self) -> &'static str {
        match self {
            SettingChange::MaxCachedMinutes(_) => "max_cached_minutes",
            SettingChange::EventBusCapacity(_) => "event_bus_capacity",
        }
    }
}

/// Metadata for a single setting
///
/// Single source of truth for key names, defaults, and validation. Setters,
/// config loading, and string-keyed updates all go through `validator`.
///
/// Error format: `"{key}: {specific_reason}"`
pub struct SettingMetadata {
    pub key: &'static str,
    pub data_type: &'static str,
    pub default_value: &'static str,
    pub description: &'static str,
    pub validation_range: &'static str,
    pub validator: fn(&str) -> std::result::Result<(), String>,
}

impl fmt::Display for SettingMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}, default {}, range {}): {}",
            self.key, self.data_type, self.default_value, self.validation_range, self.description
        )
    }
}

/// Observable settings shared across replay streams
pub struct Settings {
    /// Maximum minutes of route data a provider keeps resident
    ///
    /// Valid range: [5, 60] minutes
    /// Default: 30
    max_cached_minutes: AtomicU32,

    /// Capacity of each stream's consumer notification channel
    ///
    /// Valid range: [16, 65536]
    /// Default: 1000
    /// Only read when a stream is created.
    event_bus_capacity: AtomicUsize,

    changes: broadcast::Sender<SettingChange>,
}

impl Settings {
    /// Fresh settings with default values, independent of the global instance
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            max_cached_minutes: AtomicU32::new(DEFAULT_MAX_CACHED_MINUTES),
            event_bus_capacity: AtomicUsize::new(DEFAULT_EVENT_BUS_CAPACITY),
            changes,
        }
    }

    /// The process-wide settings instance
    pub fn global() -> Arc<Settings> {
        Arc::clone(&GLOBAL)
    }

    /// Metadata for every setting
    pub fn metadata() -> &'static [SettingMetadata] {
        &[
            SettingMetadata {
                key: "max_cached_minutes",
                data_type: "u32",
                default_value: "30",
                description: "Maximum minutes of route data kept in the segment cache",
                validation_range: "5-60",
                validator: |s| {
                    let v: u32 = s
                        .parse()
                        .map_err(|_| "max_cached_minutes: invalid number format".to_string())?;
                    if !(5..=60).contains(&v) {
                        return Err(format!("max_cached_minutes: value {} out of range [5, 60]", v));
                    }
                    Ok(())
                },
            },
            SettingMetadata {
                key: "event_bus_capacity",
                data_type: "usize",
                default_value: "1000",
                description: "Consumer notification buffer per replay stream",
                validation_range: "16-65536",
                validator: |s| {
                    let v: usize = s
                        .parse()
                        .map_err(|_| "event_bus_capacity: invalid number format".to_string())?;
                    if !(16..=65536).contains(&v) {
                        return Err(format!("event_bus_capacity: value {} out of range [16, 65536]", v));
                    }
                    Ok(())
                },
            },
        ]
    }

    fn validate(key: &str, value: &str) -> Result<()> {
        let meta = Self::metadata()
            .iter()
            .find(|m| m.key == key)
            .ok_or_else(|| Error::InvalidInput(format!("unknown setting '{}'", key)))?;
        (meta.validator)(value).map_err(Error::InvalidInput)
    }

    /// Subscribe to setting changes
    ///
    /// Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<SettingChange> {
        self.changes.subscribe()
    }

    pub fn max_cached_minutes(&self) -> u32 {
        self.max_cached_minutes.load(Ordering::Acquire)
    }

    pub fn event_bus_capacity(&self) -> usize {
        self.event_bus_capacity.load(Ordering::Acquire)
    }

    /// Validate and update max_cached_minutes
    ///
    /// Broadcasts a change only when the stored value actually changes.
    pub fn set_max_cached_minutes(&self, value: u32) -> Result<()> {
        Self::validate("max_cached_minutes", &value.to_string())?;
        let old = self.max_cached_minutes.swap(value, Ordering::AcqRel);
        if old != value {
            debug!("max_cached_minutes changed {} -> {}", old, value);
            self.notify(SettingChange::MaxCachedMinutes(value));
        }
        Ok(())
    }

    /// Validate and update event_bus_capacity
    pub fn set_event_bus_capacity(&self, value: usize) -> Result<()> {
        Self::validate("event_bus_capacity", &value.to_string())?;
        let old = self.event_bus_capacity.swap(value, Ordering::AcqRel);
        if old != value {
            self.notify(SettingChange::EventBusCapacity(value));
        }
        Ok(())
    }

    /// Update a setting from its string form (config files, command lines)
    pub fn set_by_key(&self, key: &str, value: &str) -> Result<()> {
        Self::validate(key, value)?;
        match key {
            "max_cached_minutes" => self.set_max_cached_minutes(parse_validated(key, value)?),
            "event_bus_capacity" => self.set_event_bus_capacity(parse_validated(key, value)?),
            _ => Err(Error::InvalidInput(format!("unknown setting '{}'", key))),
        }
    }

    /// Restore every setting to its default, notifying subscribers of changes
    pub fn reset_to_defaults(&self) {
        for meta in Self::metadata() {
            if let Err(e) = self.set_by_key(meta.key, meta.default_value) {
                warn!("Failed to reset {}: {}", meta.key, e);
            }
        }
    }

    fn notify(&self, change: SettingChange) {
        // No subscribers is fine, nobody is replaying
        let _ = self.changes.send(change);
    }
}

fn parse_validated<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::InvalidInput(format!("{}: invalid number format", key)))
}

impl Default for Settings {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_metadata() {
        let settings = Settings::new();
        for meta in Settings::metadata() {
            assert!((meta.validator)(meta.default_value).is_ok(), "{}", meta.key);
        }
        assert_eq!(settings.max_cached_minutes(), DEFAULT_MAX_CACHED_MINUTES);
        assert_eq!(settings.event_bus_capacity(), DEFAULT_EVENT_BUS_CAPACITY);
    }

    #[test]
    fn test_metadata_display() {
        let meta = &Settings::metadata()[0];
        assert_eq!(
            meta.to_string(),
            "max_cached_minutes (u32, default 30, range 5-60): \
             Maximum minutes of route data kept in the segment cache"
        );
    }

    #[test]
    fn test_out_of_range_rejected_and_unchanged() {
        let settings = Settings::new();
        settings.set_max_cached_minutes(10).unwrap();

        assert!(settings.set_max_cached_minutes(4).is_err());
        assert!(settings.set_max_cached_minutes(61).is_err());
        assert_eq!(settings.max_cached_minutes(), 10);

        let err = settings.set_by_key("max_cached_minutes", "ten").unwrap_err();
        assert!(err.to_string().contains("invalid number format"));
        assert!(settings.set_by_key("volume", "1").is_err());
    }

    #[tokio::test]
    async fn test_change_is_broadcast_once() {
        let settings = Settings::new();
        let mut rx = settings.subscribe();

        settings.set_max_cached_minutes(12).unwrap();
        settings.set_max_cached_minutes(12).unwrap(); // same value, no broadcast
        settings.set_event_bus_capacity(256).unwrap();

        assert_eq!(rx.recv().await.unwrap(), SettingChange::MaxCachedMinutes(12));
        assert_eq!(rx.recv().await.unwrap(), SettingChange::EventBusCapacity(256));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reset_notifies_changed_keys() {
        let settings = Settings::new();
        settings.set_max_cached_minutes(7).unwrap();
        let mut rx = settings.subscribe();

        settings.reset_to_defaults();

        assert_eq!(
            rx.recv().await.unwrap(),
            SettingChange::MaxCachedMinutes(DEFAULT_MAX_CACHED_MINUTES)
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    #[serial_test::serial]
    fn test_global_is_shared() {
        let a = Settings::global();
        let b = Settings::global();
        assert!(Arc::ptr_eq(&a, &b));

        a.set_max_cached_minutes(15).unwrap();
        assert_eq!(b.max_cached_minutes(), 15);
        a.reset_to_defaults();
    }
}
