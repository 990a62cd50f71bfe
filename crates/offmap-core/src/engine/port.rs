//! Region storage engine port
//!
//! The engine owns the actual fetching and persistence of tiles. This layer
//! only drives it through lifecycle commands and listens to its events.

use crate::error::OffmapError;
use offmap_types::{RegionStatus, ResponseError};
use std::sync::Arc;
use uuid::Uuid;

/// Completion invoked by the engine once a cancelled region is fully released
pub type CancelCallback = Box<dyn FnOnce(Result<(), OffmapError>) + Send + 'static>;

/// Opaque reference to one region's download job inside an engine
///
/// Engines mint handles; everything else only hands them back.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegionHandle {
    region_id: Uuid,
    slot: u64,
}

impl RegionHandle {
    pub fn new(region_id: Uuid, slot: u64) -> Self {
        Self { region_id, slot }
    }

    pub fn region_id(&self) -> Uuid {
        self.region_id
    }

    pub fn slot(&self) -> u64 {
        self.slot
    }
}

/// Engine-side sink for the events of one region
///
/// Called on whatever task the engine runs the download on, in emission order.
pub trait RegionObserver: Send + Sync {
    fn status_changed(&self, status: RegionStatus);
    fn response_error(&self, error: ResponseError);
    fn tile_count_limit_exceeded(&self, limit: u64);
}

/// Lifecycle commands accepted by a region storage engine
///
/// All commands return immediately. `cancel` reports completion through
/// `on_complete`, after which the handle is dead.
pub trait RegionStorageEngine: Send + Sync {
    /// Install the event sink for a handle, replacing any previous one
    fn set_observer(&self, handle: &RegionHandle, observer: Arc<dyn RegionObserver>);

    fn resume(&self, handle: &RegionHandle);

    fn suspend(&self, handle: &RegionHandle);

    fn cancel(&self, handle: &RegionHandle, on_complete: CancelCallback);

    /// Drop engine-side resources for a handle without deleting the region
    fn release(&self, handle: &RegionHandle);
}
