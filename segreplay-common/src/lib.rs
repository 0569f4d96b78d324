//! # segreplay common library
//!
//! Shared code for the segment replay crates including:
//! - Event and message types recorded in a route log
//! - Route identifier parsing and replay flags
//! - Process-wide replay settings with change notification
//! - Consumer notification types (ReplayEvent) and the EventBus
//! - TOML configuration loading

pub mod config;
pub mod error;
pub mod event;
pub mod events;
pub mod route;
pub mod settings;

pub use error::{Error, Result};
pub use event::{CanFrame, Event, EventKind, Payload};
pub use route::{ReplayFlags, RouteName, RouteSpec};
pub use settings::{Settings, SettingChange};
