//! Observer bridge between the storage engine and a Downloadable
//!
//! The engine keeps the bridge alive for as long as the handle lives, but the
//! bridge only holds a weak reference back to its Downloadable. Events that
//! arrive after the Downloadable is gone are dropped.

use crate::downloadable::Downloadable;
use crate::engine::RegionObserver;
use offmap_types::{RegionStatus, ResponseError};
use std::sync::Weak;
use tracing::trace;
use uuid::Uuid;

/// Forwards engine events for one region to its Downloadable
pub struct ObserverBridge {
    region_id: Uuid,
    downloadable: Weak<Downloadable>,
}

impl ObserverBridge {
    pub(crate) fn new(region_id: Uuid, downloadable: Weak<Downloadable>) -> Self {
        Self {
            region_id,
            downloadable,
        }
    }

    fn forward(&self, event: &'static str, deliver: impl FnOnce(&Downloadable)) {
        match self.downloadable.upgrade() {
            Some(downloadable) => deliver(&downloadable),
            None => trace!(region = %self.region_id, event, "Dropping event for discarded region"),
        }
    }
}

impl RegionObserver for ObserverBridge {
    fn status_changed(&self, status: RegionStatus) {
        self.forward("status_changed", |d| d.apply_status(status));
    }

    fn response_error(&self, error: ResponseError) {
        self.forward("response_error", |d| d.apply_response_error(error));
    }

    fn tile_count_limit_exceeded(&self, limit: u64) {
        self.forward("tile_count_limit_exceeded", |d| d.apply_tile_count_limit(limit));
    }
}
