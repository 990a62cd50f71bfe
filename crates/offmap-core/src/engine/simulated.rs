//! Simulated region storage engine
//!
//! Stands in for a real tile engine: every resumed region runs a tokio job
//! that "fetches" one resource at a time under a shared rate limiter and
//! reports through the region's observer. Region definitions and progress
//! live in the [`RegionCatalog`].
//!
//! Jobs run on the runtime the engine was created with, so commands may come
//! from any thread.

use super::{
    CancelCallback, RateLimiter, RegionCatalog, RegionHandle, RegionObserver, RegionStorageEngine,
};
use crate::error::OffmapError;
use offmap_types::{
    ErrorReason, OfflineRegion, RegionDefinition, RegionDownloadState, RegionStatus, ResponseError,
    Settings,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Resources every region needs besides its tiles (the style document)
const STYLE_RESOURCES: u64 = 1;

/// Engine that simulates tile downloads against a SQLite region catalog
pub struct SimulatedEngine {
    catalog: RegionCatalog,
    settings: RwLock<Settings>,
    rate_limiter: RateLimiter,
    runtime: Handle,
    next_slot: AtomicU64,
    slots: Mutex<HashMap<RegionHandle, RegionSlot>>,
}

/// Engine-side state for one open handle
struct RegionSlot {
    region_id: Uuid,
    required_tiles: u64,
    status: Arc<Mutex<RegionStatus>>,
    observer: Option<Arc<dyn RegionObserver>>,
    job: Option<JobHandle>,
}

struct JobHandle {
    stop: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl JobHandle {
    fn is_running(&self) -> bool {
        !self.stop.load(Ordering::Acquire) && !self.task.is_finished()
    }
}

impl SimulatedEngine {
    /// Create an engine that spawns its jobs on the current Tokio runtime
    pub fn new(catalog: RegionCatalog, settings: Settings) -> Result<Self, OffmapError> {
        let runtime = Handle::try_current().map_err(|e| OffmapError::Runtime(e.to_string()))?;
        Ok(Self::with_runtime(catalog, settings, runtime))
    }

    pub fn with_runtime(catalog: RegionCatalog, settings: Settings, runtime: Handle) -> Self {
        let rate_limiter = match settings.tiles_per_second {
            Some(rate) => RateLimiter::new(rate),
            None => RateLimiter::unlimited(),
        };

        Self {
            catalog,
            settings: RwLock::new(settings),
            rate_limiter,
            runtime,
            next_slot: AtomicU64::new(0),
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn catalog(&self) -> &RegionCatalog {
        &self.catalog
    }

    /// Swap in new settings; running jobs keep the limits they started with
    /// except for the shared throttle, which applies immediately
    pub async fn apply_settings(&self, settings: Settings) {
        self.rate_limiter.set_rate(settings.tiles_per_second).await;
        *self.settings.write() = settings;
    }

    /// Validate and store a new region, returning its handle
    pub async fn create_region(
        &self,
        name: String,
        definition: RegionDefinition,
        metadata: Vec<u8>,
    ) -> Result<(OfflineRegion, RegionHandle), OffmapError> {
        definition.validate().map_err(OffmapError::InvalidRegion)?;

        let region = OfflineRegion::new(name, definition, metadata);
        self.catalog.insert_region(&region).await?;

        let status = RegionStatus {
            required_resource_count: region.definition.tile_count() + STYLE_RESOURCES,
            required_resource_count_is_precise: true,
            ..Default::default()
        };
        let handle = self.open_slot(&region, status);

        info!(region = %region.id, name = %region.name, "Created offline region");
        Ok((region, handle))
    }

    /// Open a handle for every catalogued region
    pub async fn open_regions(
        &self,
    ) -> Result<Vec<(OfflineRegion, RegionStatus, RegionHandle)>, OffmapError> {
        let regions = self.catalog.load_all_regions().await?;
        debug!("Opening {} catalogued regions", regions.len());

        Ok(regions
            .into_iter()
            .map(|(region, status)| {
                let handle = self.open_slot(&region, status.clone());
                (region, status, handle)
            })
            .collect())
    }

    fn open_slot(&self, region: &OfflineRegion, status: RegionStatus) -> RegionHandle {
        let slot = self.next_slot.fetch_add(1, Ordering::Relaxed) + 1;
        let handle = RegionHandle::new(region.id, slot);

        self.slots.lock().insert(
            handle.clone(),
            RegionSlot {
                region_id: region.id,
                required_tiles: region.definition.tile_count(),
                status: Arc::new(Mutex::new(status)),
                observer: None,
                job: None,
            },
        );
        handle
    }

    /// Whether a download job is running for the handle
    pub fn is_downloading(&self, handle: &RegionHandle) -> bool {
        self.slots
            .lock()
            .get(handle)
            .and_then(|slot| slot.job.as_ref())
            .map(JobHandle::is_running)
            .unwrap_or(false)
    }

    /// Whether no job task is left for the handle, including one winding down
    /// after a suspend
    pub fn is_idle(&self, handle: &RegionHandle) -> bool {
        self.slots
            .lock()
            .get(handle)
            .and_then(|slot| slot.job.as_ref())
            .map_or(true, |job| job.task.is_finished())
    }

    /// Latest engine-side status for the handle
    pub fn status(&self, handle: &RegionHandle) -> Option<RegionStatus> {
        self.slots
            .lock()
            .get(handle)
            .map(|slot| slot.status.lock().clone())
    }
}

impl RegionStorageEngine for SimulatedEngine {
    fn set_observer(&self, handle: &RegionHandle, observer: Arc<dyn RegionObserver>) {
        match self.slots.lock().get_mut(handle) {
            Some(slot) => slot.observer = Some(observer),
            None => warn!(region = %handle.region_id(), "Observer for unknown handle"),
        }
    }

    fn resume(&self, handle: &RegionHandle) {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(handle) else {
            warn!(region = %handle.region_id(), "Resume for unknown handle");
            return;
        };

        if slot.job.as_ref().is_some_and(JobHandle::is_running) {
            debug!(region = %slot.region_id, "Region is already downloading");
            return;
        }

        let previous = slot.job.take();
        let stop = Arc::new(AtomicBool::new(false));
        let job = TileJob {
            region_id: slot.region_id,
            required_tiles: slot.required_tiles,
            status: slot.status.clone(),
            observer: slot.observer.clone(),
            stop: stop.clone(),
            rate_limiter: self.rate_limiter.clone(),
            catalog: self.catalog.clone(),
            settings: self.settings.read().clone(),
        };

        debug!(region = %slot.region_id, slot = handle.slot(), "Starting download job");
        let task = self.runtime.spawn(async move {
            // A suspended job may still be finishing its last tile
            if let Some(previous) = previous {
                let _ = previous.task.await;
            }
            job.run().await;
        });

        slot.job = Some(JobHandle { stop, task });
    }

    fn suspend(&self, handle: &RegionHandle) {
        match self.slots.lock().get(handle) {
            Some(slot) => {
                if let Some(job) = &slot.job {
                    job.stop.store(true, Ordering::Release);
                }
            }
            None => warn!(region = %handle.region_id(), "Suspend for unknown handle"),
        }
    }

    fn cancel(&self, handle: &RegionHandle, on_complete: CancelCallback) {
        let region_id = handle.region_id();
        let slot = self.slots.lock().remove(handle);

        if let Some(job) = slot.as_ref().and_then(|s| s.job.as_ref()) {
            job.stop.store(true, Ordering::Release);
        }

        let catalog = self.catalog.clone();
        self.runtime.spawn(async move {
            let Some(RegionSlot { job, observer, .. }) = slot else {
                on_complete(Err(OffmapError::Cancellation(format!(
                    "no open handle for region {}",
                    region_id
                ))));
                return;
            };

            if let Some(job) = job {
                let _ = job.task.await;
            }
            drop(observer);

            let result = match catalog.delete_region(region_id).await {
                Ok(_) => {
                    info!(region = %region_id, "Deleted offline region");
                    Ok(())
                }
                Err(e) => Err(OffmapError::Cancellation(e.to_string())),
            };
            on_complete(result);
        });
    }

    fn release(&self, handle: &RegionHandle) {
        let slot = self.slots.lock().remove(handle);
        if let Some(job) = slot.as_ref().and_then(|s| s.job.as_ref()) {
            job.stop.store(true, Ordering::Release);
        }
        debug!(region = %handle.region_id(), slot = handle.slot(), "Released region handle");
    }
}

/// Download job for one region
struct TileJob {
    region_id: Uuid,
    required_tiles: u64,
    status: Arc<Mutex<RegionStatus>>,
    observer: Option<Arc<dyn RegionObserver>>,
    stop: Arc<AtomicBool>,
    rate_limiter: RateLimiter,
    catalog: RegionCatalog,
    settings: Settings,
}

impl TileJob {
    async fn run(self) {
        let required = self.required_tiles + STYLE_RESOURCES;
        let status = self.update(|s| {
            s.download_state = RegionDownloadState::Active;
            s.required_resource_count = required;
            s.required_resource_count_is_precise = true;
        });

        let limit = self.settings.tile_count_limit;
        if self.required_tiles > limit {
            warn!(
                region = %self.region_id,
                required = self.required_tiles,
                limit,
                "Region exceeds the tile count limit"
            );
            self.notify(|o| o.tile_count_limit_exceeded(limit));
            let status = self.update(|s| s.download_state = RegionDownloadState::Inactive);
            self.notify(move |o| o.status_changed(status));
            return;
        }

        info!(region = %self.region_id, required, "Downloading region");
        self.notify(move |o| o.status_changed(status));

        let tile_size = self.settings.average_tile_size;
        let persist_interval = self.settings.status_persist_interval.max(1);

        loop {
            let complete = self.status.lock().is_complete();
            if complete || self.stop.load(Ordering::Acquire) {
                break;
            }

            self.rate_limiter.acquire(1).await;
            if self.stop.load(Ordering::Acquire) {
                break;
            }

            let status = self.update(|s| {
                s.completed_resource_count += 1;
                s.completed_resource_size += tile_size;
                if s.completed_resource_count > STYLE_RESOURCES {
                    s.completed_tile_count += 1;
                    s.completed_tile_size += tile_size;
                }
            });

            if let Some(every) = self.settings.simulate_error_every.filter(|n| *n > 0) {
                let tile = status.completed_tile_count;
                if tile > 0 && tile % every == 0 {
                    let error = ResponseError::new(
                        ErrorReason::Connection,
                        format!("simulated connection reset at tile {}", tile),
                    );
                    self.notify(move |o| o.response_error(error));
                }
            }

            if status.completed_resource_count % persist_interval == 0 {
                self.persist(&status).await;
            }
            self.notify(move |o| o.status_changed(status));

            tokio::task::yield_now().await;
        }

        let status = self.update(|s| s.download_state = RegionDownloadState::Inactive);
        if status.is_complete() {
            info!(region = %self.region_id, tiles = status.completed_tile_count, "Region download complete");
        } else {
            debug!(region = %self.region_id, tiles = status.completed_tile_count, "Region download stopped");
        }
        self.persist(&status).await;
        self.notify(move |o| o.status_changed(status));
    }

    fn update(&self, apply: impl FnOnce(&mut RegionStatus)) -> RegionStatus {
        let mut status = self.status.lock();
        apply(&mut status);
        status.clone()
    }

    fn notify(&self, deliver: impl FnOnce(&dyn RegionObserver)) {
        if let Some(observer) = &self.observer {
            deliver(observer.as_ref());
        }
    }

    async fn persist(&self, status: &RegionStatus) {
        if let Err(e) = self.catalog.update_status(self.region_id, status).await {
            warn!(region = %self.region_id, "Failed to persist region status: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use offmap_types::LatLngBounds;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    enum Observed {
        Status(RegionStatus),
        Error(ResponseError),
        Limit(u64),
    }

    #[derive(Default)]
    struct RecordingObserver {
        events: Mutex<Vec<Observed>>,
    }

    impl RecordingObserver {
        fn events(&self) -> Vec<Observed> {
            self.events.lock().clone()
        }

        fn last_status(&self) -> Option<RegionStatus> {
            self.events().into_iter().rev().find_map(|e| match e {
                Observed::Status(s) => Some(s),
                _ => None,
            })
        }
    }

    impl RegionObserver for RecordingObserver {
        fn status_changed(&self, status: RegionStatus) {
            self.events.lock().push(Observed::Status(status));
        }

        fn response_error(&self, error: ResponseError) {
            self.events.lock().push(Observed::Error(error));
        }

        fn tile_count_limit_exceeded(&self, limit: u64) {
            self.events.lock().push(Observed::Limit(limit));
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        engine: Arc<SimulatedEngine>,
    }

    async fn fixture(settings: Settings) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let catalog = RegionCatalog::new(dir.path().join("regions.db")).await.unwrap();
        Fixture {
            _dir: dir,
            engine: Arc::new(SimulatedEngine::new(catalog, settings).unwrap()),
        }
    }

    fn unthrottled() -> Settings {
        Settings {
            tiles_per_second: None,
            status_persist_interval: 1,
            ..Default::default()
        }
    }

    fn small_definition() -> RegionDefinition {
        // One tile per zoom level
        RegionDefinition::new(
            "https://tiles.example.com/style.json",
            LatLngBounds::new(52.51, 13.37, 52.52, 13.38),
            0.0,
            5.0,
        )
    }

    fn large_definition() -> RegionDefinition {
        RegionDefinition::new(
            "https://tiles.example.com/style.json",
            LatLngBounds::world(),
            0.0,
            4.0,
        )
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_download_runs_to_completion() {
        let f = fixture(unthrottled()).await;
        let (region, handle) = f
            .engine
            .create_region("berlin".into(), small_definition(), Vec::new())
            .await
            .unwrap();
        let observer = Arc::new(RecordingObserver::default());
        f.engine.set_observer(&handle, observer.clone());

        f.engine.resume(&handle);
        wait_until(|| {
            observer
                .last_status()
                .is_some_and(|s| s.is_complete() && s.download_state == RegionDownloadState::Inactive)
        })
        .await;

        let status = observer.last_status().unwrap();
        assert_eq!(status.completed_tile_count, 6);
        assert_eq!(status.completed_resource_count, 7);
        assert!(!f.engine.is_downloading(&handle));

        // Completed counts only ever grow
        let counts: Vec<u64> = observer
            .events()
            .into_iter()
            .filter_map(|e| match e {
                Observed::Status(s) => Some(s.completed_resource_count),
                _ => None,
            })
            .collect();
        assert!(counts.windows(2).all(|w| w[0] <= w[1]));

        let (_, persisted) = f.engine.catalog().load_region(region.id).await.unwrap().unwrap();
        assert_eq!(persisted.completed_tile_count, 6);
    }

    #[tokio::test]
    async fn test_tile_count_limit_stops_download() {
        let settings = Settings {
            tile_count_limit: 3,
            ..unthrottled()
        };
        let f = fixture(settings).await;
        let (_, handle) = f
            .engine
            .create_region("berlin".into(), small_definition(), Vec::new())
            .await
            .unwrap();
        let observer = Arc::new(RecordingObserver::default());
        f.engine.set_observer(&handle, observer.clone());

        f.engine.resume(&handle);
        wait_until(|| observer.events().len() >= 2).await;

        let events = observer.events();
        assert_eq!(events[0], Observed::Limit(3));
        assert!(matches!(&events[1], Observed::Status(s)
            if s.download_state == RegionDownloadState::Inactive && s.completed_tile_count == 0));
    }

    #[tokio::test]
    async fn test_suspend_stops_and_resume_continues() {
        let settings = Settings {
            tiles_per_second: Some(20),
            ..unthrottled()
        };
        let f = fixture(settings).await;
        let (_, handle) = f
            .engine
            .create_region("world".into(), large_definition(), Vec::new())
            .await
            .unwrap();
        let observer = Arc::new(RecordingObserver::default());
        f.engine.set_observer(&handle, observer.clone());

        f.engine.resume(&handle);
        wait_until(|| observer.last_status().is_some_and(|s| s.completed_tile_count >= 3)).await;
        f.engine.suspend(&handle);
        wait_until(|| {
            observer
                .last_status()
                .is_some_and(|s| s.download_state == RegionDownloadState::Inactive)
        })
        .await;

        let paused_at = f.engine.status(&handle).unwrap().completed_tile_count;
        assert!(paused_at < 341);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.engine.status(&handle).unwrap().completed_tile_count, paused_at);

        f.engine.resume(&handle);
        wait_until(|| f.engine.status(&handle).unwrap().completed_tile_count > paused_at).await;
        f.engine.suspend(&handle);
        wait_until(|| f.engine.is_idle(&handle)).await;
        assert!(!f.engine.is_downloading(&handle));
    }

    #[tokio::test]
    async fn test_cancel_deletes_region_and_completes() {
        let f = fixture(unthrottled()).await;
        let (region, handle) = f
            .engine
            .create_region("berlin".into(), small_definition(), Vec::new())
            .await
            .unwrap();
        let observer = Arc::new(RecordingObserver::default());
        f.engine.set_observer(&handle, observer.clone());
        f.engine.resume(&handle);

        let (tx, rx) = tokio::sync::oneshot::channel();
        f.engine.cancel(
            &handle,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );

        rx.await.unwrap().unwrap();
        assert!(f.engine.catalog().load_region(region.id).await.unwrap().is_none());
        assert!(f.engine.status(&handle).is_none());
        // The engine let go of the observer
        assert_eq!(Arc::strong_count(&observer), 1);
    }

    #[tokio::test]
    async fn test_cancel_unknown_handle_reports_error() {
        let f = fixture(unthrottled()).await;
        let handle = RegionHandle::new(Uuid::new_v4(), 99);

        let (tx, rx) = tokio::sync::oneshot::channel();
        f.engine.cancel(
            &handle,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );

        assert!(matches!(rx.await.unwrap(), Err(OffmapError::Cancellation(_))));
    }

    #[tokio::test]
    async fn test_simulated_response_errors() {
        let settings = Settings {
            simulate_error_every: Some(2),
            ..unthrottled()
        };
        let f = fixture(settings).await;
        let (_, handle) = f
            .engine
            .create_region("berlin".into(), small_definition(), Vec::new())
            .await
            .unwrap();
        let observer = Arc::new(RecordingObserver::default());
        f.engine.set_observer(&handle, observer.clone());

        f.engine.resume(&handle);
        wait_until(|| observer.last_status().is_some_and(|s| s.is_complete())).await;

        let errors: Vec<_> = observer
            .events()
            .into_iter()
            .filter_map(|e| match e {
                Observed::Error(e) => Some(e),
                _ => None,
            })
            .collect();
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().all(|e| e.reason == ErrorReason::Connection && e.is_temporary()));
    }

    #[tokio::test]
    async fn test_invalid_definition_is_rejected() {
        let f = fixture(unthrottled()).await;
        let mut definition = small_definition();
        definition.min_zoom = 9.0;
        definition.max_zoom = 3.0;

        let result = f.engine.create_region("bad".into(), definition, Vec::new()).await;
        assert!(matches!(result, Err(OffmapError::InvalidRegion(_))));
        assert!(f.engine.catalog().load_all_regions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_open_regions_restores_catalog() {
        let f = fixture(unthrottled()).await;
        let (region, _) = f
            .engine
            .create_region("berlin".into(), small_definition(), b"meta".to_vec())
            .await
            .unwrap();

        let catalog = f.engine.catalog().clone();
        let reopened = SimulatedEngine::new(catalog, unthrottled()).unwrap();
        let regions = reopened.open_regions().await.unwrap();

        assert_eq!(regions.len(), 1);
        let (restored, status, handle) = &regions[0];
        assert_eq!(restored.id, region.id);
        assert_eq!(restored.metadata, b"meta".to_vec());
        assert_eq!(status.download_state, RegionDownloadState::Inactive);
        assert_eq!(handle.region_id(), region.id);
        assert_eq!(handle.slot(), 1);
    }

    #[test]
    fn test_new_requires_a_runtime() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let catalog = runtime
            .block_on(RegionCatalog::new(dir.path().join("regions.db")))
            .unwrap();

        let result = SimulatedEngine::new(catalog.clone(), unthrottled());
        assert!(matches!(result, Err(OffmapError::Runtime(_))));

        let engine = SimulatedEngine::with_runtime(catalog, unthrottled(), runtime.handle().clone());
        let regions = runtime.block_on(engine.open_regions()).unwrap();
        assert!(regions.is_empty());
    }

    #[test]
    fn test_commands_from_threads_outside_the_runtime() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let observer = Arc::new(RecordingObserver::default());

        let (engine, handle) = runtime.block_on(async {
            let catalog = RegionCatalog::new(dir.path().join("regions.db")).await.unwrap();
            let engine = Arc::new(SimulatedEngine::new(catalog, unthrottled()).unwrap());
            let (_, handle) = engine
                .create_region("berlin".into(), small_definition(), Vec::new())
                .await
                .unwrap();
            (engine, handle)
        });
        engine.set_observer(&handle, observer.clone());

        let worker = {
            let (engine, handle) = (engine.clone(), handle.clone());
            std::thread::spawn(move || engine.resume(&handle))
        };
        worker.join().unwrap();

        runtime.block_on(wait_until(|| {
            observer
                .last_status()
                .is_some_and(|s| s.is_complete() && s.download_state == RegionDownloadState::Inactive)
        }));

        let (tx, rx) = std::sync::mpsc::channel();
        let worker = {
            let (engine, handle) = (engine.clone(), handle.clone());
            std::thread::spawn(move || {
                engine.cancel(&handle, Box::new(move |result| {
                    let _ = tx.send(result.is_ok());
                }))
            })
        };
        worker.join().unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(true));
        assert!(engine.status(&handle).is_none());
    }
}
