//! Route identifiers and replay flags
//!
//! A route is one drive, recorded as numbered one-minute segments. Routes are
//! named `[<dongle_id>|]<YYYY-MM-DD--HH-MM-SS>` with an optional segment
//! range suffix (`--3`, `/3`, `/3:7`, `--3--7`).

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

const DONGLE_ID_LEN: usize = 16;
const TIMESTAMP_LEN: usize = 20;

/// Parsed route identifier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteName {
    /// Device identifier, absent for bare-timestamp local routes
    pub dongle_id: Option<String>,
    /// Route start time as written in the identifier
    pub timestamp: String,
    /// First segment to replay
    pub begin_segment: Option<u32>,
    /// Last segment to replay (inclusive)
    pub end_segment: Option<u32>,
}

impl RouteName {
    /// Parse a route identifier
    ///
    /// # Errors
    /// Returns `Error::InvalidInput` when the identifier is empty or does not
    /// follow the route naming scheme.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(Error::InvalidInput("route identifier is empty".to_string()));
        }

        let (dongle_id, rest) = split_dongle_id(input);

        if rest.len() < TIMESTAMP_LEN || !rest.is_char_boundary(TIMESTAMP_LEN) {
            return Err(invalid(input, "missing route timestamp"));
        }
        let (timestamp, suffix) = rest.split_at(TIMESTAMP_LEN);
        if !is_route_timestamp(timestamp) {
            return Err(invalid(input, "timestamp must look like YYYY-MM-DD--HH-MM-SS"));
        }

        let (begin_segment, end_segment) = parse_segment_range(suffix)
            .ok_or_else(|| invalid(input, "malformed segment range"))?;

        Ok(Self {
            dongle_id: dongle_id.map(str::to_string),
            timestamp: timestamp.to_string(),
            begin_segment,
            end_segment,
        })
    }

    /// Canonical `dongle|timestamp` form without the segment range
    pub fn canonical(&self) -> String {
        match &self.dongle_id {
            Some(dongle) => format!("{}|{}", dongle, self.timestamp),
            None => self.timestamp.clone(),
        }
    }

    /// True if `segment` falls inside the requested segment range
    pub fn contains_segment(&self, segment: u32) -> bool {
        let after_begin = self.begin_segment.map_or(true, |b| segment >= b);
        let before_end = match (self.begin_segment, self.end_segment) {
            (_, Some(end)) => segment <= end,
            // A single `--N` suffix selects exactly that segment
            (Some(begin), None) => segment == begin,
            (None, None) => true,
        };
        after_begin && before_end
    }
}

impl std::fmt::Display for RouteName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.canonical())?;
        if let Some(begin) = self.begin_segment {
            write!(f, "--{}", begin)?;
            if let Some(end) = self.end_segment {
                write!(f, "--{}", end)?;
            }
        }
        Ok(())
    }
}

fn invalid(input: &str, reason: &str) -> Error {
    Error::InvalidInput(format!("invalid route format '{}': {}", input, reason))
}

fn split_dongle_id(input: &str) -> (Option<&str>, &str) {
    if input.len() > DONGLE_ID_LEN && input.is_char_boundary(DONGLE_ID_LEN) {
        let (head, tail) = input.split_at(DONGLE_ID_LEN);
        let is_dongle = head
            .bytes()
            .all(|b| b.is_ascii_digit() || b.is_ascii_lowercase());
        if is_dongle {
            if let Some(rest) = tail
                .strip_prefix('|')
                .or_else(|| tail.strip_prefix('_'))
                .or_else(|| tail.strip_prefix('/'))
            {
                return (Some(head), rest);
            }
        }
    }
    (None, input)
}

/// `YYYY-MM-DD--HH-MM-SS`
fn is_route_timestamp(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.len() == TIMESTAMP_LEN
        && bytes.iter().enumerate().all(|(i, b)| match i {
            4 | 7 | 10 | 11 | 14 | 17 => *b == b'-',
            _ => b.is_ascii_digit(),
        })
}

fn parse_segment_range(suffix: &str) -> Option<(Option<u32>, Option<u32>)> {
    if suffix.is_empty() {
        return Some((None, None));
    }
    let rest = suffix
        .strip_prefix("--")
        .or_else(|| suffix.strip_prefix('/'))?;

    let range_sep = rest
        .find(':')
        .map(|i| (i, 1))
        .or_else(|| rest.find("--").map(|i| (i, 2)));
    let (begin, end) = match range_sep {
        Some((i, sep_len)) => (&rest[..i], Some(&rest[i + sep_len..])),
        None => (rest, None),
    };

    let begin: u32 = begin.parse().ok()?;
    let end = match end {
        Some(end) => {
            let end: u32 = end.parse().ok()?;
            if end < begin {
                return None;
            }
            Some(end)
        }
        None => None,
    };
    Some((Some(begin), end))
}

/// Route input as typed by a user, split into data directory and route name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteSpec {
    pub route: RouteName,
    pub data_dir: Option<PathBuf>,
}

impl RouteSpec {
    /// Split a "browse local route" path into data directory and route name
    ///
    /// Everything up to and including the last `/` is the data directory. An
    /// explicit `data_dir` takes precedence over one found in `input`.
    pub fn from_input(input: &str, data_dir: Option<PathBuf>) -> Result<Self> {
        let input = input.trim();
        // `dongle/timestamp` is a route name, not a path
        if let Ok(route) = RouteName::parse(input) {
            return Ok(Self { route, data_dir });
        }
        let (dir, name) = match input.rfind('/') {
            Some(idx) => (Some(PathBuf::from(&input[..=idx])), &input[idx + 1..]),
            None => (None, input),
        };
        Ok(Self {
            route: RouteName::parse(name)?,
            data_dir: data_dir.or(dir),
        })
    }
}

/// Auxiliary camera stream replayed alongside the bus data
///
/// Exactly one selection is active per load. The bit values are the replay
/// flag bits understood by segment providers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReplayFlags {
    /// Bus data only, no video
    None,
    /// Road-facing camera
    #[default]
    RoadCamera,
    /// Wide-angle road camera
    WideRoadCamera,
    /// Driver-facing camera
    DriverCamera,
    /// Low resolution preview camera
    LowResCamera,
}

impl ReplayFlags {
    pub const FLAG_NONE: u32 = 0x0000;
    pub const FLAG_DCAM: u32 = 0x0002;
    pub const FLAG_ECAM: u32 = 0x0004;
    pub const FLAG_QCAMERA: u32 = 0x0040;
    pub const FLAG_NO_VIPC: u32 = 0x0400;

    pub fn bits(self) -> u32 {
        match self {
            ReplayFlags::None => Self::FLAG_NO_VIPC,
            ReplayFlags::RoadCamera => Self::FLAG_NONE,
            ReplayFlags::WideRoadCamera => Self::FLAG_ECAM,
            ReplayFlags::DriverCamera => Self::FLAG_DCAM,
            ReplayFlags::LowResCamera => Self::FLAG_QCAMERA,
        }
    }

    /// Whether a video stream accompanies the bus data
    pub fn has_video(self) -> bool {
        self != ReplayFlags::None
    }

    /// Parse the names used on the command line and in config files
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "none" => Ok(ReplayFlags::None),
            "road-camera" | "road" => Ok(ReplayFlags::RoadCamera),
            "wide-road-camera" | "wide" => Ok(ReplayFlags::WideRoadCamera),
            "driver-camera" | "driver" => Ok(ReplayFlags::DriverCamera),
            "low-res-camera" | "qcamera" => Ok(ReplayFlags::LowResCamera),
            other => Err(Error::InvalidInput(format!("unknown camera selection '{}'", other))),
        }
    }
}

impl std::fmt::Display for ReplayFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ReplayFlags::None => "none",
            ReplayFlags::RoadCamera => "road-camera",
            ReplayFlags::WideRoadCamera => "wide-road-camera",
            ReplayFlags::DriverCamera => "driver-camera",
            ReplayFlags::LowResCamera => "low-res-camera",
        };
        f.write_str(name)
    }
}
