//! Most-recent value cache
//!
//! Consumers keep the latest payload per bus message and per event kind so a
//! UI can show current signal values without scanning the merged stream.

use segreplay_common::{Event, EventKind, Payload};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

/// Bus message key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct MessageId {
    pub source: u8,
    pub address: u32,
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{:X}", self.source, self.address)
    }
}

/// Latest sighting of one bus message
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageValue {
    pub mono_time: u64,
    pub data: Vec<u8>,
    pub count: u64,
    /// Observed rate in Hz since the first sighting
    pub freq: f64,
    first_mono_time: u64,
}

/// Latest sighting of a non-bus event kind
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KindValue {
    pub mono_time: u64,
    pub payload: Payload,
    pub count: u64,
}

/// Most-recent value per message and per event kind
#[derive(Debug, Clone, Default)]
pub struct LastValues {
    messages: BTreeMap<MessageId, MessageValue>,
    kinds: HashMap<EventKind, KindValue>,
}

impl LastValues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `event` as the latest value for its key
    ///
    /// Counts every sighting. The stored data only moves forward in time, so
    /// a gap segment merged late never overwrites newer values. Returns false
    /// for kinds that cannot be keyed.
    pub fn update_event(&mut self, event: &Event) -> bool {
        match event.kind() {
            EventKind::Can => {
                let mono_time = event.mono_time();
                for frame in event.can_frames() {
                    let id = MessageId {
                        source: frame.source,
                        address: frame.address,
                    };
                    let value = self.messages.entry(id).or_insert_with(|| MessageValue {
                        mono_time,
                        data: frame.data.clone(),
                        count: 0,
                        freq: 0.0,
                        first_mono_time: mono_time,
                    });

                    value.count += 1;
                    value.first_mono_time = value.first_mono_time.min(mono_time);
                    if mono_time >= value.mono_time {
                        value.mono_time = mono_time;
                        value.data.clone_from(&frame.data);
                    }
                    let elapsed = (value.mono_time - value.first_mono_time) as f64 / 1e9;
                    if elapsed > 0.0 {
                        value.freq = (value.count - 1) as f64 / elapsed;
                    }
                }
                true
            }
            EventKind::Other(_) => false,
            kind => {
                let value = self.kinds.entry(kind.clone()).or_insert_with(|| KindValue {
                    mono_time: event.mono_time(),
                    payload: event.payload().clone(),
                    count: 0,
                });
                value.count += 1;
                if event.mono_time() >= value.mono_time {
                    value.mono_time = event.mono_time();
                    value.payload = event.payload().clone();
                }
                true
            }
        }
    }

    pub fn message(&self, id: MessageId) -> Option<&MessageValue> {
        self.messages.get(&id)
    }

    pub fn messages(&self) -> impl Iterator<Item = (&MessageId, &MessageValue)> {
        self.messages.iter()
    }

    pub fn kind(&self, kind: &EventKind) -> Option<&KindValue> {
        self.kinds.get(kind)
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.kinds.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.kinds.clear();
    }
}
