//! Recorded log event types
//!
//! An [`Event`] is one immutable, timestamped record from a route log. Events
//! are produced by a segment provider and never modified afterwards; the
//! replay core only reorders and filters them.

use serde::{Deserialize, Serialize};

/// Kind of a recorded event
///
/// Names match the service names used in recorded logs (`"can"`,
/// `"roadEncodeIdx"`, ...). Anything unrecognized is kept as [`EventKind::Other`]
/// so it can still pass through the replay pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum EventKind {
    /// Bus frames captured from the vehicle CAN buses
    Can,
    /// Road camera video index
    RoadEncodeIdx,
    /// Wide road camera video index
    WideRoadEncodeIdx,
    /// Driver camera video index
    DriverEncodeIdx,
    /// Vehicle parameter snapshot
    CarParams,
    /// Any other service name
    Other(String),
}

impl EventKind {
    /// Service name of this kind as it appears in a log
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::Can => "can",
            EventKind::RoadEncodeIdx => "roadEncodeIdx",
            EventKind::WideRoadEncodeIdx => "wideRoadEncodeIdx",
            EventKind::DriverEncodeIdx => "driverEncodeIdx",
            EventKind::CarParams => "carParams",
            EventKind::Other(name) => name,
        }
    }

    /// Resolve a service name to a kind
    pub fn from_name(name: &str) -> Self {
        match name {
            "can" => EventKind::Can,
            "roadEncodeIdx" => EventKind::RoadEncodeIdx,
            "wideRoadEncodeIdx" => EventKind::WideRoadEncodeIdx,
            "driverEncodeIdx" => EventKind::DriverEncodeIdx,
            "carParams" => EventKind::CarParams,
            other => EventKind::Other(other.to_string()),
        }
    }

    /// True for kinds the replay pipeline knows how to interpret
    pub fn is_known(&self) -> bool {
        !matches!(self, EventKind::Other(_))
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for EventKind {
    fn from(name: String) -> Self {
        EventKind::from_name(&name)
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        kind.as_str().to_string()
    }
}

/// One frame captured on a CAN bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanFrame {
    /// Bus number the frame was captured on
    pub source: u8,
    /// Arbitration ID
    pub address: u32,
    /// Frame payload (up to 64 bytes for CAN FD)
    pub data: Vec<u8>,
}

impl CanFrame {
    pub fn new(source: u8, address: u32, data: impl Into<Vec<u8>>) -> Self {
        Self {
            source,
            address,
            data: data.into(),
        }
    }
}

/// Decoded event payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    /// Batch of bus frames captured in the same cycle
    Can { frames: Vec<CanFrame> },
    /// Position of a video frame inside its encoded segment file
    EncodeIndex {
        frame_id: u32,
        segment_num: u32,
        segment_id: u32,
    },
    /// Vehicle parameters as structured data
    CarParams { params: serde_json::Value },
    /// Undecoded message body for kinds the pipeline does not interpret
    Raw { bytes: Vec<u8> },
}

/// A single immutable timestamped log record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    mono_time: u64,
    kind: EventKind,
    payload: Payload,
}

impl Event {
    /// Create an event from its parts
    ///
    /// `mono_time` is the monotonic clock reading in nanoseconds at which the
    /// record was logged.
    pub fn new(mono_time: u64, kind: EventKind, payload: Payload) -> Self {
        Self {
            mono_time,
            kind,
            payload,
        }
    }

    /// Bus frame batch
    pub fn can(mono_time: u64, frames: Vec<CanFrame>) -> Self {
        Self::new(mono_time, EventKind::Can, Payload::Can { frames })
    }

    /// Video index record for one of the camera streams
    ///
    /// `segment_id` is the frame position inside encoded segment `segment_num`.
    pub fn encode_index(
        mono_time: u64,
        kind: EventKind,
        frame_id: u32,
        segment_num: u32,
        segment_id: u32,
    ) -> Self {
        Self::new(
            mono_time,
            kind,
            Payload::EncodeIndex {
                frame_id,
                segment_num,
                segment_id,
            },
        )
    }

    /// Vehicle parameter snapshot
    pub fn car_params(mono_time: u64, params: serde_json::Value) -> Self {
        Self::new(mono_time, EventKind::CarParams, Payload::CarParams { params })
    }

    /// Record of an arbitrary service carried as raw bytes
    pub fn raw(mono_time: u64, name: &str, bytes: Vec<u8>) -> Self {
        Self::new(mono_time, EventKind::from_name(name), Payload::Raw { bytes })
    }

    /// Monotonic timestamp in nanoseconds
    pub fn mono_time(&self) -> u64 {
        self.mono_time
    }

    pub fn kind(&self) -> &EventKind {
        &self.kind
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Bus frames carried by this event, empty for non-CAN events
    pub fn can_frames(&self) -> &[CanFrame] {
        match &self.payload {
            Payload::Can { frames } => frames,
            _ => &[],
        }
    }

    /// Seconds elapsed since `start_mono_time`, clamped at zero
    pub fn seconds_since(&self, start_mono_time: u64) -> f64 {
        self.mono_time.saturating_sub(start_mono_time) as f64 / 1e9
    }
}
