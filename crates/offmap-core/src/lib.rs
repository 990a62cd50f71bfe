//! Offmap Core - Offline Region Downloads
//!
//! This crate manages the lifecycle of offline map regions: each region is a
//! [`Downloadable`] that can be resumed, suspended and cancelled, tracked by a
//! [`DownloadController`] and backed by a region storage engine.

mod completion;
mod controller;
mod downloadable;
pub mod engine;
mod error;
mod observer;
mod storage;
#[cfg(test)]
mod testing;

pub use completion::*;
pub use controller::*;
pub use downloadable::*;
pub use error::*;
pub use observer::*;
pub use storage::*;

use engine::{RegionCatalog, SimulatedEngine};
use offmap_types::{RegionDefinition, RegionEvent, Settings};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

/// The main Offmap core instance
#[derive(Clone)]
pub struct OffmapCore {
    /// Application settings
    settings: Arc<RwLock<Settings>>,
    /// Data directory storage
    storage: Storage,
    /// Storage engine shared by every region
    engine: Arc<SimulatedEngine>,
    /// Tracks every known region
    controller: Arc<DownloadController>,
}

impl OffmapCore {
    /// Open the data directory and restore every catalogued region as suspended
    pub async fn new(data_dir: PathBuf) -> Result<Self, OffmapError> {
        let storage = Storage::new(data_dir).await?;
        let settings = storage.load_settings().await?;

        let catalog = RegionCatalog::new(storage.catalog_path()).await?;
        let engine = Arc::new(SimulatedEngine::new(catalog, settings.clone())?);

        let (event_tx, _) = broadcast::channel(settings.event_buffer.max(1));
        let controller = Arc::new(DownloadController::new(engine.clone(), event_tx));

        let restored = engine.open_regions().await?;
        let count = restored.len();
        for (region, status, handle) in restored {
            let downloadable = controller.register(region, handle)?;
            downloadable.set_initial_status(status);
        }
        info!(regions = count, "Offmap core ready at {}", storage.data_dir().display());

        Ok(Self {
            settings: Arc::new(RwLock::new(settings)),
            storage,
            engine,
            controller,
        })
    }

    /// Subscribe to region events
    pub fn subscribe(&self) -> broadcast::Receiver<RegionEvent> {
        self.controller.subscribe()
    }

    pub fn controller(&self) -> &Arc<DownloadController> {
        &self.controller
    }

    pub fn engine(&self) -> &Arc<SimulatedEngine> {
        &self.engine
    }

    // ========================================================================
    // Region Operations
    // ========================================================================

    /// Create a region in the engine and start tracking it (suspended)
    pub async fn add_region(
        &self,
        name: &str,
        definition: RegionDefinition,
        metadata: Vec<u8>,
    ) -> Result<Arc<Downloadable>, OffmapError> {
        let (region, handle) = self
            .engine
            .create_region(name.to_string(), definition, metadata)
            .await?;
        self.controller.register(region, handle)
    }

    /// Look up a tracked region
    pub fn region(&self, id: Uuid) -> Result<Arc<Downloadable>, OffmapError> {
        self.controller.get(id).ok_or(OffmapError::NotFound(id))
    }

    /// All tracked regions, oldest first
    pub fn regions(&self) -> Vec<Arc<Downloadable>> {
        self.controller.list()
    }

    pub fn resume_region(&self, id: Uuid) -> Result<(), OffmapError> {
        let downloadable = self.region(id)?;
        self.controller.resume_downloadable(&downloadable)
    }

    pub fn suspend_region(&self, id: Uuid) -> Result<(), OffmapError> {
        let downloadable = self.region(id)?;
        self.controller.suspend_downloadable(&downloadable)
    }

    /// Cancel a region and wait until the engine has deleted it
    pub async fn cancel_region(&self, id: Uuid) -> Result<(), OffmapError> {
        let downloadable = self.region(id)?;
        self.controller.cancel_and_wait(&downloadable).await
    }

    pub fn resume_all(&self) -> usize {
        self.controller.resume_all()
    }

    pub fn suspend_all(&self) -> usize {
        self.controller.suspend_all()
    }

    // ========================================================================
    // Settings
    // ========================================================================

    /// Get current settings
    pub async fn get_settings(&self) -> Settings {
        self.settings.read().await.clone()
    }

    /// Persist new settings and hand them to the engine
    pub async fn update_settings(&self, settings: Settings) -> Result<(), OffmapError> {
        self.storage.save_settings(&settings).await?;
        self.engine.apply_settings(settings.clone()).await;
        *self.settings.write().await = settings;
        Ok(())
    }
}
