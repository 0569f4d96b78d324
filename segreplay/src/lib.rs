//! # segreplay
//!
//! Replays a segmented vehicle event log as one time-ordered stream.
//!
//! **Purpose:** Merge segments that finish loading in any order into a
//! single ordered stream, run a consumer filter over every event, and expose
//! pause/seek control with a cache limit that can change during replay.
//!
//! **Architecture:** A [`provider::SegmentProvider`] loads segments in the
//! background. The [`ReplayStream`] controller owns it and runs one
//! notification pump task that feeds loaded segments through the
//! [`merger::SegmentMerger`] into the [`stream::MergedStream`].

pub mod controller;
pub mod coordinator;
pub mod error;
pub mod filter;
pub mod merger;
pub mod provider;
pub mod stream;
pub mod values;

pub use controller::{ReplayStream, ALLOWED_EVENT_KINDS};
pub use error::{Error, Result};
pub use filter::{CanUpdateFilter, EventFilter, KindFilter};
pub use values::{LastValues, MessageId};
