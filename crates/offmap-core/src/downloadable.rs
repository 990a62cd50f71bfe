//! Downloadable - the application-facing side of one offline region
//!
//! A Downloadable owns the engine handle of its region and the observer
//! bridge the engine reports through. Lifecycle commands move it through
//! `Suspended -> Active -> Suspended ... -> Cancelling -> Cancelled`; engine
//! events only update the observable progress. Applications issue those
//! commands through the `DownloadController` so its membership stays in step.

use crate::completion::CancelCompletion;
use crate::engine::{RegionHandle, RegionStorageEngine};
use crate::error::OffmapError;
use crate::observer::ObserverBridge;
use offmap_types::{
    DownloadState, OfflineRegion, RegionEvent, RegionProgress, RegionStatus, ResponseError,
};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Lifecycle state and the handle it guards
struct Lifecycle {
    state: DownloadState,
    /// None once the handle has been released
    handle: Option<RegionHandle>,
}

/// One offline region as seen by the application
pub struct Downloadable {
    region: OfflineRegion,
    engine: Arc<dyn RegionStorageEngine>,
    observer: Arc<ObserverBridge>,
    lifecycle: Mutex<Lifecycle>,
    progress: RwLock<RegionProgress>,
    event_tx: broadcast::Sender<RegionEvent>,
}

impl Downloadable {
    /// Wrap a freshly obtained engine handle; starts out `Suspended`
    pub fn new(
        region: OfflineRegion,
        handle: RegionHandle,
        engine: Arc<dyn RegionStorageEngine>,
        event_tx: broadcast::Sender<RegionEvent>,
    ) -> Arc<Self> {
        let observer_handle = handle.clone();
        let downloadable = Arc::new_cyclic(|weak| Self {
            observer: Arc::new(ObserverBridge::new(region.id, weak.clone())),
            region,
            engine,
            lifecycle: Mutex::new(Lifecycle {
                state: DownloadState::Suspended,
                handle: Some(handle),
            }),
            progress: RwLock::new(RegionProgress::default()),
            event_tx,
        });

        downloadable
            .engine
            .set_observer(&observer_handle, downloadable.observer.clone());
        debug!(region = %downloadable.id(), "Created downloadable");
        downloadable
    }

    pub fn id(&self) -> Uuid {
        self.region.id
    }

    pub fn region(&self) -> &OfflineRegion {
        &self.region
    }

    pub fn state(&self) -> DownloadState {
        self.lifecycle.lock().state
    }

    /// The engine handle, until it has been released
    pub fn handle(&self) -> Option<RegionHandle> {
        self.lifecycle.lock().handle.clone()
    }

    pub fn progress(&self) -> RegionProgress {
        self.progress.read().clone()
    }

    pub fn status(&self) -> Option<RegionStatus> {
        self.progress.read().status.clone()
    }

    pub fn last_error(&self) -> Option<ResponseError> {
        self.progress.read().last_error.clone()
    }

    pub fn tile_count_limit_exceeded(&self) -> Option<u64> {
        self.progress.read().tile_count_limit_exceeded
    }

    /// Seed the observable status, e.g. with what the engine persisted earlier
    pub fn set_initial_status(&self, status: RegionStatus) {
        self.progress.write().status = Some(status);
    }

    // ========================================================================
    // Lifecycle commands
    // ========================================================================

    /// Start or continue downloading; only valid while `Suspended`
    pub(crate) fn resume(&self) -> Result<(), OffmapError> {
        let mut lifecycle = self.lifecycle.lock();
        match (lifecycle.state, lifecycle.handle.as_ref()) {
            (DownloadState::Suspended, Some(handle)) => self.engine.resume(handle),
            (state, _) => return Err(self.reject(state, "resume")),
        }
        self.transition(&mut lifecycle, DownloadState::Active);
        Ok(())
    }

    /// Pause downloading; only valid while `Active`
    pub(crate) fn suspend(&self) -> Result<(), OffmapError> {
        let mut lifecycle = self.lifecycle.lock();
        match (lifecycle.state, lifecycle.handle.as_ref()) {
            (DownloadState::Active, Some(handle)) => self.engine.suspend(handle),
            (state, _) => return Err(self.reject(state, "suspend")),
        }
        self.transition(&mut lifecycle, DownloadState::Suspended);
        Ok(())
    }

    /// Cancel the download and delete the region from the engine
    ///
    /// `completion` runs exactly once, after the engine has released the
    /// region, with the engine's result. The pending cancel keeps this
    /// Downloadable alive until then. A cancel issued while another one is
    /// in flight is rejected and its `completion` is dropped without running.
    pub(crate) fn cancel<F>(self: &Arc<Self>, completion: F) -> Result<(), OffmapError>
    where
        F: FnOnce(Result<(), OffmapError>) + Send + 'static,
    {
        let handle = {
            let mut lifecycle = self.lifecycle.lock();
            let handle = match (lifecycle.state, lifecycle.handle.as_ref()) {
                (DownloadState::Suspended | DownloadState::Active, Some(handle)) => handle.clone(),
                (state, _) => return Err(self.reject(state, "cancel")),
            };
            self.transition(&mut lifecycle, DownloadState::Cancelling);
            handle
        };

        info!(region = %self.id(), "Cancelling region download");

        // Issued outside the lock: an engine may complete synchronously
        let pending = PendingCancel {
            downloadable: Arc::clone(self),
            completion: CancelCompletion::new(completion),
        };
        self.engine
            .cancel(&handle, Box::new(move |result| pending.complete(result)));
        Ok(())
    }

    fn transition(&self, lifecycle: &mut Lifecycle, state: DownloadState) {
        debug!(region = %self.id(), from = %lifecycle.state, to = %state, "Region state changed");
        lifecycle.state = state;
        self.emit(RegionEvent::StateChanged {
            id: self.id(),
            state,
        });
    }

    fn reject(&self, state: DownloadState, command: &'static str) -> OffmapError {
        let id = self.id();
        match state {
            state if state.is_terminal() => {
                error!(region = %id, command, "Command issued against a cancelled region");
                OffmapError::AlreadyCancelled(id)
            }
            DownloadState::Cancelling => {
                warn!(region = %id, command, "Ignoring command while cancel is in flight");
                OffmapError::CancelInProgress(id)
            }
            state => {
                debug!(region = %id, command, %state, "Rejecting command");
                OffmapError::InvalidTransition { id, state, command }
            }
        }
    }

    /// Engine finished cancelling: release the handle and become terminal
    fn finish_cancel(&self) {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state != DownloadState::Cancelling {
            warn!(region = %self.id(), state = %lifecycle.state, "Cancel completed outside of cancelling state");
        }
        lifecycle.handle = None;
        self.transition(&mut lifecycle, DownloadState::Cancelled);
    }

    // ========================================================================
    // Engine events (delivered through the observer bridge)
    // ========================================================================

    pub(crate) fn apply_status(&self, status: RegionStatus) {
        self.progress.write().status = Some(status.clone());
        self.emit(RegionEvent::StatusChanged {
            id: self.id(),
            status,
        });
    }

    pub(crate) fn apply_response_error(&self, error: ResponseError) {
        warn!(region = %self.id(), reason = ?error.reason, "Engine response error: {}", error.message);
        self.progress.write().last_error = Some(error.clone());
        self.emit(RegionEvent::ResponseError {
            id: self.id(),
            error,
        });
    }

    pub(crate) fn apply_tile_count_limit(&self, limit: u64) {
        warn!(region = %self.id(), limit, "Region exceeds the tile count limit");
        self.progress.write().tile_count_limit_exceeded = Some(limit);
        self.emit(RegionEvent::TileCountLimitExceeded {
            id: self.id(),
            limit,
        });
    }

    fn emit(&self, event: RegionEvent) {
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }
}

impl Drop for Downloadable {
    fn drop(&mut self) {
        if let Some(handle) = self.lifecycle.get_mut().handle.take() {
            debug!(region = %self.region.id, "Releasing region handle");
            self.engine.release(&handle);
        }
    }
}

impl std::fmt::Debug for Downloadable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Downloadable")
            .field("id", &self.region.id)
            .field("name", &self.region.name)
            .field("state", &self.state())
            .finish()
    }
}

/// An outstanding engine cancel
///
/// Owns a strong reference so the Downloadable outlives application-side
/// drops. If the engine drops the callback without calling it, the
/// completion still fires once with an error.
struct PendingCancel {
    downloadable: Arc<Downloadable>,
    completion: CancelCompletion,
}

impl PendingCancel {
    fn complete(&self, result: Result<(), OffmapError>) {
        if self.completion.has_fired() {
            return;
        }
        self.downloadable.finish_cancel();
        match &result {
            Ok(()) => info!(region = %self.downloadable.id(), "Region cancelled"),
            Err(e) => warn!(region = %self.downloadable.id(), "Region cancelled with error: {}", e),
        }
        self.completion.fire(result);
    }
}

impl Drop for PendingCancel {
    fn drop(&mut self) {
        if !self.completion.has_fired() {
            self.complete(Err(OffmapError::Cancellation(
                "storage engine dropped the cancel completion".to_string(),
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sample_region, Command, RecordingEngine};
    use offmap_types::{ErrorReason, RegionDownloadState};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn setup() -> (Arc<RecordingEngine>, Arc<Downloadable>, broadcast::Receiver<RegionEvent>) {
        let engine = RecordingEngine::new();
        let (event_tx, event_rx) = broadcast::channel(64);
        let region = sample_region("berlin");
        let handle = engine.open(region.id);
        let downloadable = Downloadable::new(region, handle, engine.clone(), event_tx);
        (engine, downloadable, event_rx)
    }

    fn counting_completion() -> (Arc<AtomicUsize>, impl FnOnce(Result<(), OffmapError>) + Send + 'static) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        (calls, move |_result| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn status(completed: u64) -> RegionStatus {
        RegionStatus {
            download_state: RegionDownloadState::Active,
            completed_resource_count: completed,
            required_resource_count: 100,
            required_resource_count_is_precise: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_starts_suspended_with_observer_installed() {
        let (engine, downloadable, _rx) = setup();
        let handle = downloadable.handle().unwrap();

        assert_eq!(downloadable.state(), DownloadState::Suspended);
        assert!(engine.observer(&handle).is_some());
        assert!(engine.commands().is_empty());
    }

    #[test]
    fn test_resume_suspend_transitions() {
        let (engine, downloadable, _rx) = setup();
        let handle = downloadable.handle().unwrap();

        downloadable.resume().unwrap();
        assert_eq!(downloadable.state(), DownloadState::Active);

        let err = downloadable.resume().unwrap_err();
        assert!(matches!(err, OffmapError::InvalidTransition { command: "resume", .. }));

        downloadable.suspend().unwrap();
        assert_eq!(downloadable.state(), DownloadState::Suspended);

        let err = downloadable.suspend().unwrap_err();
        assert!(matches!(
            err,
            OffmapError::InvalidTransition {
                state: DownloadState::Suspended,
                ..
            }
        ));

        assert_eq!(
            engine.commands(),
            vec![Command::Resume(handle.clone()), Command::Suspend(handle)]
        );
    }

    #[test]
    fn test_full_cancel_scenario() {
        let (engine, downloadable, _rx) = setup();
        let handle = downloadable.handle().unwrap();

        downloadable.resume().unwrap();
        assert_eq!(engine.count(|c| matches!(c, Command::Resume(_))), 1);

        let result = Arc::new(parking_lot::Mutex::new(None));
        let slot = result.clone();
        downloadable
            .cancel(move |r| *slot.lock() = Some(r.is_ok()))
            .unwrap();
        assert_eq!(downloadable.state(), DownloadState::Cancelling);
        assert_eq!(engine.count(|c| matches!(c, Command::Cancel(_))), 1);
        assert!(result.lock().is_none());

        assert!(engine.complete_cancel(&handle, Ok(())));
        assert_eq!(downloadable.state(), DownloadState::Cancelled);
        assert_eq!(*result.lock(), Some(true));
        assert!(downloadable.handle().is_none());
    }

    #[test]
    fn test_second_cancel_is_rejected() {
        let (engine, downloadable, _rx) = setup();
        let handle = downloadable.handle().unwrap();

        let (first_calls, first) = counting_completion();
        let (second_calls, second) = counting_completion();

        downloadable.cancel(first).unwrap();
        let err = downloadable.cancel(second).unwrap_err();
        assert!(matches!(err, OffmapError::CancelInProgress(_)));
        assert_eq!(engine.count(|c| matches!(c, Command::Cancel(_))), 1);

        engine.complete_cancel(&handle, Ok(()));
        assert!(!engine.complete_cancel(&handle, Ok(())));

        assert_eq!(first_calls.load(Ordering::SeqCst), 1);
        assert_eq!(second_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_commands_rejected_while_cancelling() {
        let (engine, downloadable, _rx) = setup();
        downloadable.resume().unwrap();
        downloadable.cancel(|_| {}).unwrap();

        assert!(matches!(downloadable.suspend(), Err(OffmapError::CancelInProgress(_))));
        assert!(matches!(downloadable.resume(), Err(OffmapError::CancelInProgress(_))));
        assert_eq!(engine.count(|c| matches!(c, Command::Suspend(_))), 0);
    }

    #[test]
    fn test_commands_after_cancelled_never_reach_engine() {
        let (engine, downloadable, _rx) = setup();
        let handle = downloadable.handle().unwrap();
        downloadable.cancel(|_| {}).unwrap();
        engine.complete_cancel(&handle, Ok(()));
        let before = engine.commands().len();

        let (calls, completion) = counting_completion();
        assert!(matches!(downloadable.resume(), Err(OffmapError::AlreadyCancelled(_))));
        assert!(matches!(downloadable.suspend(), Err(OffmapError::AlreadyCancelled(_))));
        assert!(matches!(
            downloadable.cancel(completion),
            Err(OffmapError::AlreadyCancelled(_))
        ));

        assert_eq!(engine.commands().len(), before);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cancel_error_is_forwarded() {
        let (engine, downloadable, _rx) = setup();
        let handle = downloadable.handle().unwrap();

        let message = Arc::new(parking_lot::Mutex::new(String::new()));
        let slot = message.clone();
        downloadable
            .cancel(move |r| *slot.lock() = r.unwrap_err().to_string())
            .unwrap();
        engine.complete_cancel(&handle, Err(OffmapError::Cancellation("database locked".into())));

        assert_eq!(*message.lock(), "Cancellation failed: database locked");
        assert_eq!(downloadable.state(), DownloadState::Cancelled);
    }

    #[test]
    fn test_discarded_while_cancelling_stays_alive() {
        let (engine, downloadable, _rx) = setup();
        let handle = downloadable.handle().unwrap();
        let weak = Arc::downgrade(&downloadable);

        let (calls, completion) = counting_completion();
        downloadable.cancel(completion).unwrap();
        drop(downloadable);

        // Held by the pending cancel
        let alive = weak.upgrade().expect("downloadable freed during cancel");
        assert_eq!(alive.state(), DownloadState::Cancelling);
        drop(alive);

        engine.complete_cancel(&handle, Ok(()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(weak.upgrade().is_none());
        // Cancelled regions are not released a second time
        assert_eq!(engine.count(|c| matches!(c, Command::Release(_))), 0);
    }

    #[test]
    fn test_dropped_engine_callback_still_completes_once() {
        let (engine, downloadable, _rx) = setup();
        let handle = downloadable.handle().unwrap();

        let result = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let slot = result.clone();
        downloadable
            .cancel(move |r| slot.lock().push(r.is_ok()))
            .unwrap();

        engine.drop_cancel(&handle);
        assert_eq!(*result.lock(), vec![false]);
        assert_eq!(downloadable.state(), DownloadState::Cancelled);
    }

    #[test]
    fn test_drop_releases_handle() {
        let (engine, downloadable, _rx) = setup();
        let handle = downloadable.handle().unwrap();
        downloadable.resume().unwrap();
        drop(downloadable);

        assert_eq!(engine.count(|c| *c == Command::Release(handle.clone())), 1);
        assert!(engine.observer(&handle).is_none());
    }

    #[test]
    fn test_events_update_progress_in_order() {
        let (engine, downloadable, mut rx) = setup();
        let observer = engine.observer(&downloadable.handle().unwrap()).unwrap();

        let error = ResponseError::new(ErrorReason::Connection, "connection reset");
        observer.status_changed(status(1));
        observer.response_error(error.clone());
        observer.status_changed(status(2));
        observer.tile_count_limit_exceeded(6000);

        assert_eq!(downloadable.status(), Some(status(2)));
        assert_eq!(downloadable.last_error(), Some(error.clone()));
        assert_eq!(downloadable.tile_count_limit_exceeded(), Some(6000));
        // Events never move the lifecycle
        assert_eq!(downloadable.state(), DownloadState::Suspended);

        let received: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(received.len(), 4);
        assert!(matches!(&received[0], RegionEvent::StatusChanged { status: s, .. } if *s == status(1)));
        assert!(matches!(&received[1], RegionEvent::ResponseError { error: e, .. } if *e == error));
        assert!(matches!(&received[2], RegionEvent::StatusChanged { status: s, .. } if *s == status(2)));
        assert!(matches!(&received[3], RegionEvent::TileCountLimitExceeded { limit: 6000, .. }));
    }

    #[test]
    fn test_events_after_destruction_are_dropped() {
        let (engine, downloadable, mut rx) = setup();
        let handle = downloadable.handle().unwrap();
        let observer = engine.observer(&handle).unwrap();
        drop(downloadable);
        while rx.try_recv().is_ok() {}

        observer.status_changed(status(5));
        observer.response_error(ResponseError::new(ErrorReason::Server, "late"));
        observer.tile_count_limit_exceeded(10);

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_late_events_during_cancel_are_applied() {
        let (engine, downloadable, _rx) = setup();
        let handle = downloadable.handle().unwrap();
        let observer = engine.observer(&handle).unwrap();

        downloadable.resume().unwrap();
        downloadable.cancel(|_| {}).unwrap();
        observer.status_changed(status(7));

        assert_eq!(downloadable.status(), Some(status(7)));
        assert_eq!(downloadable.state(), DownloadState::Cancelling);
    }

    #[test]
    fn test_state_changes_are_broadcast() {
        let (_engine, downloadable, mut rx) = setup();
        downloadable.resume().unwrap();
        downloadable.suspend().unwrap();

        let states: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|e| match e {
                RegionEvent::StateChanged { state, .. } => Some(state),
                _ => None,
            })
            .collect();
        assert_eq!(states, vec![DownloadState::Active, DownloadState::Suspended]);
    }
}
