//! Consumer notification types and EventBus
//!
//! Replay streams publish lifecycle and playback-position notifications as
//! [`ReplayEvent`]s on an [`EventBus`]. Events are serializable so they can be
//! forwarded to UIs or logs unchanged.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Lifecycle state of a replay stream
///
/// `Unloaded → Loading → (Failed | Running) → {Paused ⇄ Running} → Stopped`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    /// No route loaded yet
    Unloaded,
    /// Provider constructed, initial load in progress
    Loading,
    /// Initial load failed, the stream is unusable
    Failed,
    /// Replaying
    Running,
    /// Replay paused, loading may continue
    Paused,
    /// Provider stopped, terminal
    Stopped,
}

impl StreamState {
    /// Whether a provider is alive in this state
    pub fn has_provider(self) -> bool {
        matches!(self, StreamState::Running | StreamState::Paused)
    }
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamState::Unloaded => write!(f, "unloaded"),
            StreamState::Loading => write!(f, "loading"),
            StreamState::Failed => write!(f, "failed"),
            StreamState::Running => write!(f, "running"),
            StreamState::Paused => write!(f, "paused"),
            StreamState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Notifications published to replay consumers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ReplayEvent {
    /// Provider finished a seek
    SeekedTo {
        /// New playback position, seconds from route start
        seconds: f64,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Provider began streaming events
    StreamStarted {
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Playback paused (emitted after the provider accepted the pause)
    Paused {
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Playback resumed (emitted after the provider accepted the resume)
    Resumed {
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// New segments were merged into the stream
    EventsMerged {
        /// Segment indices merged by this pass, in merge order
        segments: Vec<u32>,
        /// True if every merged segment extended the tail of the stream
        appended: bool,
        /// Number of events that became visible
        forwarded: usize,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Stream lifecycle state changed
    StateChanged {
        old_state: StreamState,
        new_state: StreamState,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

impl ReplayEvent {
    pub fn seeked_to(seconds: f64) -> Self {
        ReplayEvent::SeekedTo {
            seconds,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn stream_started() -> Self {
        ReplayEvent::StreamStarted {
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn paused() -> Self {
        ReplayEvent::Paused {
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn resumed() -> Self {
        ReplayEvent::Resumed {
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn state_changed(old_state: StreamState, new_state: StreamState) -> Self {
        ReplayEvent::StateChanged {
            old_state,
            new_state,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Short event name for logs
    pub fn name(&self) -> &'static str {
        match self {
            ReplayEvent::SeekedTo { .. } => "SeekedTo",
            ReplayEvent::StreamStarted { .. } => "StreamStarted",
            ReplayEvent::Paused { .. } => "Paused",
            ReplayEvent::Resumed { .. } => "Resumed",
            ReplayEvent::EventsMerged { .. } => "EventsMerged",
            ReplayEvent::StateChanged { .. } => "StateChanged",
        }
    }
}

/// Broadcast bus for [`ReplayEvent`]s
///
/// Thin wrapper over a tokio broadcast channel. Events emitted before a
/// subscription are not seen by that subscriber; slow subscribers lag and
/// lose the oldest events.
pub struct EventBus {
    tx: broadcast::Sender<ReplayEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// # Examples
    ///
    /// ```
    /// use segreplay_common::events::EventBus;
    ///
    /// let event_bus = EventBus::new(1000);
    /// assert_eq!(event_bus.capacity(), 1000);
    /// ```
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<ReplayEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Ok(subscriber_count)` if at least one subscriber exists.
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: ReplayEvent,
    ) -> Result<usize, broadcast::error::SendError<ReplayEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: ReplayEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
