//! Download Controller - tracks the Downloadables the application knows about
//!
//! The controller holds no per-region state of its own: every command is
//! delegated to the Downloadable after checking that it is still registered.
//! A region whose cancellation completed is dropped from the set before the
//! caller's completion runs.

use crate::downloadable::Downloadable;
use crate::engine::{RegionHandle, RegionStorageEngine};
use crate::error::OffmapError;
use offmap_types::{DownloadState, OfflineRegion, RegionEvent};
use parking_lot::RwLock;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Coordinates lifecycle commands for all registered regions
pub struct DownloadController {
    engine: Arc<dyn RegionStorageEngine>,
    /// Registered downloadables, keyed by region id
    downloadables: Arc<RwLock<HashMap<Uuid, Arc<Downloadable>>>>,
    /// Event broadcaster shared with every Downloadable
    event_tx: broadcast::Sender<RegionEvent>,
}

impl DownloadController {
    pub fn new(engine: Arc<dyn RegionStorageEngine>, event_tx: broadcast::Sender<RegionEvent>) -> Self {
        Self {
            engine,
            downloadables: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
        }
    }

    /// Subscribe to region events
    pub fn subscribe(&self) -> broadcast::Receiver<RegionEvent> {
        self.event_tx.subscribe()
    }

    /// Wrap an engine handle in a Downloadable and start tracking it
    pub fn register(
        &self,
        region: OfflineRegion,
        handle: RegionHandle,
    ) -> Result<Arc<Downloadable>, OffmapError> {
        let id = region.id;
        let downloadable = match self.downloadables.write().entry(id) {
            Entry::Occupied(_) => {
                return Err(OffmapError::InvalidRegion(format!(
                    "region {} is already registered",
                    id
                )))
            }
            Entry::Vacant(slot) => slot
                .insert(Downloadable::new(
                    region.clone(),
                    handle,
                    self.engine.clone(),
                    self.event_tx.clone(),
                ))
                .clone(),
        };

        info!(region = %id, name = %region.name, "Registered region");
        let _ = self.event_tx.send(RegionEvent::RegionAdded { region });

        Ok(downloadable)
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<Downloadable>> {
        self.downloadables.read().get(&id).cloned()
    }

    /// All registered downloadables, oldest region first
    pub fn list(&self) -> Vec<Arc<Downloadable>> {
        let mut all: Vec<_> = self.downloadables.read().values().cloned().collect();
        all.sort_by_key(|d| d.region().created_at);
        all
    }

    /// Stop tracking a region without cancelling it
    ///
    /// The Downloadable is freed once the application drops its last
    /// reference, unless a cancel is still in flight.
    pub fn remove(&self, id: Uuid) -> Option<Arc<Downloadable>> {
        let removed = self.downloadables.write().remove(&id);
        if removed.is_some() {
            info!(region = %id, "Removed region from controller");
            let _ = self.event_tx.send(RegionEvent::RegionRemoved { id });
        }
        removed
    }

    fn ensure_registered(&self, downloadable: &Arc<Downloadable>) -> Result<(), OffmapError> {
        let id = downloadable.id();
        match self.downloadables.read().get(&id) {
            Some(registered) if Arc::ptr_eq(registered, downloadable) => Ok(()),
            _ => {
                warn!(region = %id, "Command for a region the controller does not track");
                Err(OffmapError::NotRegistered(id))
            }
        }
    }

    // ========================================================================
    // Lifecycle commands
    // ========================================================================

    pub fn resume_downloadable(&self, downloadable: &Arc<Downloadable>) -> Result<(), OffmapError> {
        self.ensure_registered(downloadable)?;
        downloadable.resume()
    }

    pub fn suspend_downloadable(&self, downloadable: &Arc<Downloadable>) -> Result<(), OffmapError> {
        self.ensure_registered(downloadable)?;
        downloadable.suspend()
    }

    /// Cancel a region; `completion` runs once the engine has released it
    pub fn cancel_downloadable<F>(
        &self,
        downloadable: &Arc<Downloadable>,
        completion: F,
    ) -> Result<(), OffmapError>
    where
        F: FnOnce(Result<(), OffmapError>) + Send + 'static,
    {
        self.ensure_registered(downloadable)?;

        let downloadables = Arc::clone(&self.downloadables);
        let event_tx = self.event_tx.clone();
        let id = downloadable.id();

        downloadable.cancel(move |result| {
            let removed = downloadables.write().remove(&id);
            if removed.is_some() {
                let _ = event_tx.send(RegionEvent::RegionRemoved { id });
            }
            drop(removed);
            completion(result);
        })
    }

    /// Cancel a region and wait for the engine to finish
    pub async fn cancel_and_wait(&self, downloadable: &Arc<Downloadable>) -> Result<(), OffmapError> {
        let (tx, rx) = oneshot::channel();
        self.cancel_downloadable(downloadable, move |result| {
            let _ = tx.send(result);
        })?;
        rx.await
            .map_err(|_| OffmapError::Cancellation("completion was never delivered".to_string()))?
    }

    // ========================================================================
    // Bulk operations
    // ========================================================================

    /// Resume every suspended region, returning how many were resumed
    pub fn resume_all(&self) -> usize {
        self.apply_to_state(DownloadState::Suspended, |d| d.resume())
    }

    /// Suspend every active region, returning how many were suspended
    pub fn suspend_all(&self) -> usize {
        self.apply_to_state(DownloadState::Active, |d| d.suspend())
    }

    fn apply_to_state(
        &self,
        state: DownloadState,
        command: impl Fn(&Downloadable) -> Result<(), OffmapError>,
    ) -> usize {
        let mut applied = 0;
        for downloadable in self.list() {
            if downloadable.state() != state {
                continue;
            }
            match command(downloadable.as_ref()) {
                Ok(()) => applied += 1,
                // Lost a race with another command
                Err(e) if e.is_lifecycle_violation() => {
                    warn!(region = %downloadable.id(), "Bulk command skipped: {}", e)
                }
                Err(e) => error!(region = %downloadable.id(), "Bulk command failed: {}", e),
            }
        }
        applied
    }

    /// Number of regions currently downloading
    pub fn active_count(&self) -> usize {
        self.downloadables
            .read()
            .values()
            .filter(|d| d.state() == DownloadState::Active)
            .count()
    }

    pub fn len(&self) -> usize {
        self.downloadables.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.downloadables.read().is_empty()
    }
}
