//! Cache limit coordinator
//!
//! Carries the process-wide cache limit into the active provider while a
//! replay runs. Subscribes on construction; dropping it unsubscribes.

use crate::provider::SegmentProvider;
use segreplay_common::{SettingChange, Settings};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

pub struct CacheLimitCoordinator {
    settings: Arc<Settings>,
    changes: broadcast::Receiver<SettingChange>,
}

impl CacheLimitCoordinator {
    pub fn new(settings: Arc<Settings>) -> Self {
        let changes = settings.subscribe();
        Self { settings, changes }
    }

    /// Discard changes queued so far
    ///
    /// Called right before [`push_current`](Self::push_current) so a new
    /// provider only sees changes made after it got the current value.
    pub fn resubscribe(&mut self) {
        self.changes = self.changes.resubscribe();
    }

    pub fn current_limit(&self) -> u32 {
        self.settings.max_cached_minutes()
    }

    /// Push the current limit, used once when a provider is created
    pub fn push_current<P>(&self, provider: &P) -> u32
    where
        P: SegmentProvider + ?Sized,
    {
        let minutes = self.current_limit();
        provider.set_segment_cache_limit(minutes);
        debug!("Initial segment cache limit {} min", minutes);
        minutes
    }

    /// React to one settings change
    ///
    /// Returns the limit pushed to the provider, if any. Other keys and
    /// changes without an active provider push nothing.
    pub fn on_change<P>(&self, change: &SettingChange, provider: Option<&P>) -> Option<u32>
    where
        P: SegmentProvider + ?Sized,
    {
        let SettingChange::MaxCachedMinutes(minutes) = *change else {
            return None;
        };
        let provider = provider?;
        provider.set_segment_cache_limit(minutes);
        info!("Segment cache limit changed to {} min", minutes);
        Some(minutes)
    }

    /// Wait for the next settings change
    ///
    /// After falling behind the broadcast, the lost changes are replaced by
    /// the current cache limit. Returns `None` once settings are gone.
    pub async fn next_change(&mut self) -> Option<SettingChange> {
        match self.changes.recv().await {
            Ok(change) => Some(change),
            Err(RecvError::Lagged(skipped)) => {
                warn!("Missed {} settings changes, re-reading cache limit", skipped);
                Some(SettingChange::MaxCachedMinutes(self.current_limit()))
            }
            Err(RecvError::Closed) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{MemoryProvider, MemoryRoute, ProviderConfig};
    use segreplay_common::{ReplayFlags, RouteName};

    fn provider() -> MemoryProvider {
        let config = ProviderConfig {
            route: RouteName::parse("2023-08-14--12-30-05").unwrap(),
            data_dir: None,
            flags: ReplayFlags::None,
            allowed_kinds: vec![],
        };
        MemoryProvider::new(config, MemoryRoute::synthetic(1, 1))
    }

    #[test]
    fn test_push_current() {
        let settings = Arc::new(Settings::new());
        settings.set_max_cached_minutes(12).unwrap();
        let coordinator = CacheLimitCoordinator::new(settings);
        let provider = provider();

        assert_eq!(coordinator.push_current(&provider), 12);
        assert_eq!(provider.cache_limit_pushes(), vec![12]);
    }

    #[tokio::test]
    async fn test_resubscribe_drops_queued_changes() {
        let settings = Arc::new(Settings::new());
        let mut coordinator = CacheLimitCoordinator::new(Arc::clone(&settings));

        settings.set_max_cached_minutes(5).unwrap();
        settings.set_max_cached_minutes(40).unwrap();
        coordinator.resubscribe();
        assert_eq!(coordinator.current_limit(), 40);

        settings.set_max_cached_minutes(20).unwrap();
        assert_eq!(
            coordinator.next_change().await,
            Some(SettingChange::MaxCachedMinutes(20))
        );
    }

    #[tokio::test]
    async fn test_cache_limit_change_is_pushed() {
        let settings = Arc::new(Settings::new());
        let mut coordinator = CacheLimitCoordinator::new(Arc::clone(&settings));
        let provider = provider();

        settings.set_max_cached_minutes(10).unwrap();
        let change = coordinator.next_change().await.unwrap();
        assert_eq!(coordinator.on_change(&change, Some(&provider)), Some(10));
        assert_eq!(provider.cache_limit(), 10);
    }

    #[tokio::test]
    async fn test_other_keys_and_no_provider_push_nothing() {
        let settings = Arc::new(Settings::new());
        let mut coordinator = CacheLimitCoordinator::new(Arc::clone(&settings));
        let provider = provider();

        settings.set_event_bus_capacity(64).unwrap();
        let change = coordinator.next_change().await.unwrap();
        assert_eq!(coordinator.on_change(&change, Some(&provider)), None);

        settings.set_max_cached_minutes(20).unwrap();
        let change = coordinator.next_change().await.unwrap();
        assert_eq!(coordinator.on_change::<MemoryProvider>(&change, None), None);

        assert!(provider.cache_limit_pushes().is_empty());
    }
}
