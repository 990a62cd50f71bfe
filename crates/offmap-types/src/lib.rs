//! Shared types for Offmap
//!
//! This crate contains the data structures shared between the core
//! lifecycle layer, the storage engine and the CLI.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use uuid::Uuid;

/// Highest zoom level a region may request
pub const MAX_ZOOM: f64 = 22.0;

/// Latitude limit of the web mercator projection
const MAX_MERCATOR_LATITUDE: f64 = 85.051_128_779_806_59;

// ============================================================================
// Region Types
// ============================================================================

/// Geographic bounding box in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLngBounds {
    pub south: f64,
    pub west: f64,
    pub north: f64,
    pub east: f64,
}

impl LatLngBounds {
    pub fn new(south: f64, west: f64, north: f64, east: f64) -> Self {
        Self {
            south,
            west,
            north,
            east,
        }
    }

    /// The whole mercator world
    pub fn world() -> Self {
        Self::new(-MAX_MERCATOR_LATITUDE, -180.0, MAX_MERCATOR_LATITUDE, 180.0)
    }
}

/// Describes which part of a style should be made available offline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionDefinition {
    pub style_url: String,
    pub bounds: LatLngBounds,
    pub min_zoom: f64,
    pub max_zoom: f64,
    pub pixel_ratio: f32,
}

impl RegionDefinition {
    pub fn new(style_url: impl Into<String>, bounds: LatLngBounds, min_zoom: f64, max_zoom: f64) -> Self {
        Self {
            style_url: style_url.into(),
            bounds,
            min_zoom,
            max_zoom,
            pixel_ratio: 1.0,
        }
    }

    /// Check the definition describes a downloadable tile pyramid
    pub fn validate(&self) -> Result<(), String> {
        let b = &self.bounds;
        if ![b.south, b.west, b.north, b.east].iter().all(|v| v.is_finite()) {
            return Err("bounds must be finite".to_string());
        }
        if b.south < -90.0 || b.north > 90.0 || b.west < -180.0 || b.east > 180.0 {
            return Err("bounds are outside of the valid coordinate range".to_string());
        }
        if b.south > b.north {
            return Err(format!("south ({}) is above north ({})", b.south, b.north));
        }
        if b.west > b.east {
            return Err(format!("west ({}) is east of east ({})", b.west, b.east));
        }
        if !self.min_zoom.is_finite() || !self.max_zoom.is_finite() {
            return Err("zoom levels must be finite".to_string());
        }
        if self.min_zoom < 0.0 || self.max_zoom > MAX_ZOOM {
            return Err(format!("zoom levels must lie within 0..={}", MAX_ZOOM));
        }
        if self.min_zoom > self.max_zoom {
            return Err(format!(
                "min zoom ({}) is greater than max zoom ({})",
                self.min_zoom, self.max_zoom
            ));
        }
        if !(self.pixel_ratio.is_finite() && self.pixel_ratio > 0.0) {
            return Err("pixel ratio must be positive".to_string());
        }
        url::Url::parse(&self.style_url)
            .map_err(|e| format!("invalid style URL {}: {}", self.style_url, e))?;
        Ok(())
    }

    /// Integer zoom levels covered by this definition
    pub fn zoom_levels(&self) -> std::ops::RangeInclusive<u8> {
        let min = self.min_zoom.floor().clamp(0.0, MAX_ZOOM) as u8;
        let max = self.max_zoom.ceil().clamp(0.0, MAX_ZOOM) as u8;
        min..=max
    }

    /// Number of tiles needed to cover the bounds at every zoom level
    pub fn tile_count(&self) -> u64 {
        self.zoom_levels()
            .map(|z| {
                let (min_x, min_y) = tile_coordinate(self.bounds.north, self.bounds.west, z);
                let (max_x, max_y) = tile_coordinate(self.bounds.south, self.bounds.east, z);
                (max_x - min_x + 1) * (max_y - min_y + 1)
            })
            .sum()
    }
}

/// Web mercator tile containing a coordinate at a zoom level
fn tile_coordinate(lat: f64, lng: f64, zoom: u8) -> (u64, u64) {
    let n = (1u64 << zoom) as f64;
    let lat = lat.clamp(-MAX_MERCATOR_LATITUDE, MAX_MERCATOR_LATITUDE).to_radians();
    let x = (lng + 180.0) / 360.0 * n;
    let y = (1.0 - (lat.tan() + 1.0 / lat.cos()).ln() / PI) / 2.0 * n;
    let clamp = |v: f64| v.floor().clamp(0.0, n - 1.0) as u64;
    (clamp(x), clamp(y))
}

/// A region registered with the storage engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineRegion {
    pub id: Uuid,
    pub name: String,
    pub definition: RegionDefinition,
    /// Opaque application data stored alongside the region
    #[serde(default)]
    pub metadata: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

impl OfflineRegion {
    pub fn new(name: String, definition: RegionDefinition, metadata: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            definition,
            metadata,
            created_at: Utc::now(),
        }
    }
}

// ============================================================================
// Status Types
// ============================================================================

/// Lifecycle state of a downloadable region, as driven by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadState {
    Suspended,
    Active,
    Cancelling,
    Cancelled,
}

impl DownloadState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DownloadState::Cancelled)
    }
}

impl std::fmt::Display for DownloadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DownloadState::Suspended => "suspended",
            DownloadState::Active => "active",
            DownloadState::Cancelling => "cancelling",
            DownloadState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Whether the engine is currently fetching resources for a region
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegionDownloadState {
    #[default]
    Inactive,
    Active,
}

/// Progress snapshot reported by the storage engine
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionStatus {
    pub download_state: RegionDownloadState,
    pub completed_resource_count: u64,
    pub completed_resource_size: u64,
    pub completed_tile_count: u64,
    pub completed_tile_size: u64,
    pub required_resource_count: u64,
    /// False while the engine is still discovering resources
    pub required_resource_count_is_precise: bool,
}

impl RegionStatus {
    pub fn is_complete(&self) -> bool {
        self.required_resource_count_is_precise
            && self.completed_resource_count >= self.required_resource_count
    }

    pub fn progress(&self) -> f64 {
        if self.required_resource_count == 0 {
            0.0
        } else {
            (self.completed_resource_count as f64 / self.required_resource_count as f64) * 100.0
        }
    }
}

/// Why a resource request failed inside the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorReason {
    NotFound,
    Server,
    Connection,
    RateLimit,
    Other,
}

/// A non-fatal response error reported by the engine while downloading
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseError {
    pub reason: ErrorReason,
    pub message: String,
}

impl ResponseError {
    pub fn new(reason: ErrorReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }

    /// Connection drops and rate limiting clear up on their own
    pub fn is_temporary(&self) -> bool {
        matches!(self.reason, ErrorReason::Connection | ErrorReason::RateLimit)
    }
}

impl std::fmt::Display for ResponseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.reason, self.message)
    }
}

/// Last known progress of a region, as observed through engine events
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegionProgress {
    pub status: Option<RegionStatus>,
    pub last_error: Option<ResponseError>,
    /// Set once the engine reports the region needs more tiles than allowed
    pub tile_count_limit_exceeded: Option<u64>,
}

// ============================================================================
// Settings Types
// ============================================================================

/// Application settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Maximum number of tiles a single region may require
    pub tile_count_limit: u64,
    /// Throttle for the storage engine (None = unlimited)
    pub tiles_per_second: Option<u64>,
    /// Assumed size of one tile, in bytes
    pub average_tile_size: u64,
    /// Capacity of the region event channel
    pub event_buffer: usize,
    /// Persist region status every N tiles
    pub status_persist_interval: u64,
    /// Report a connection error every N tiles (testing aid)
    #[serde(default)]
    pub simulate_error_every: Option<u64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            tile_count_limit: 6000,
            tiles_per_second: Some(200),
            average_tile_size: 16 * 1024,
            event_buffer: 1000,
            status_persist_interval: 50,
            simulate_error_every: None,
        }
    }
}

/// Default data directory for Offmap
pub fn default_data_dir() -> std::path::PathBuf {
    dirs::data_dir()
        .map(|d| d.join("offmap"))
        .unwrap_or_else(|| std::path::PathBuf::from(".offmap"))
}

// ============================================================================
// Event Types
// ============================================================================

/// Events emitted by the core to the application
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum RegionEvent {
    RegionAdded {
        region: OfflineRegion,
    },
    StateChanged {
        id: Uuid,
        state: DownloadState,
    },
    StatusChanged {
        id: Uuid,
        status: RegionStatus,
    },
    ResponseError {
        id: Uuid,
        error: ResponseError,
    },
    TileCountLimitExceeded {
        id: Uuid,
        limit: u64,
    },
    RegionRemoved {
        id: Uuid,
    },
}

impl RegionEvent {
    /// The region this event concerns
    pub fn region_id(&self) -> Uuid {
        match self {
            RegionEvent::RegionAdded { region } => region.id,
            RegionEvent::StateChanged { id, .. }
            | RegionEvent::StatusChanged { id, .. }
            | RegionEvent::ResponseError { id, .. }
            | RegionEvent::TileCountLimitExceeded { id, .. }
            | RegionEvent::RegionRemoved { id } => *id,
        }
    }
}
