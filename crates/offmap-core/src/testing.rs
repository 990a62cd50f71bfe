//! In-memory engine double that records commands

use crate::engine::{CancelCallback, RegionHandle, RegionObserver, RegionStorageEngine};
use crate::error::OffmapError;
use offmap_types::{LatLngBounds, OfflineRegion, RegionDefinition};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Resume(RegionHandle),
    Suspend(RegionHandle),
    Cancel(RegionHandle),
    Release(RegionHandle),
}

impl Command {
    pub fn handle(&self) -> &RegionHandle {
        match self {
            Command::Resume(h) | Command::Suspend(h) | Command::Cancel(h) | Command::Release(h) => h,
        }
    }
}

#[derive(Default)]
struct RecordingState {
    next_slot: u64,
    commands: Vec<Command>,
    observers: HashMap<RegionHandle, Arc<dyn RegionObserver>>,
    pending_cancels: HashMap<RegionHandle, CancelCallback>,
}

/// Engine that never runs anything; tests fire events and completions by hand
#[derive(Default)]
pub struct RecordingEngine {
    state: Mutex<RecordingState>,
}

impl RecordingEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn open(&self, region_id: Uuid) -> RegionHandle {
        let mut state = self.state.lock();
        state.next_slot += 1;
        RegionHandle::new(region_id, state.next_slot)
    }

    pub fn commands(&self) -> Vec<Command> {
        self.state.lock().commands.clone()
    }

    pub fn count(&self, matches: impl Fn(&Command) -> bool) -> usize {
        self.state.lock().commands.iter().filter(|c| matches(c)).count()
    }

    pub fn observer(&self, handle: &RegionHandle) -> Option<Arc<dyn RegionObserver>> {
        self.state.lock().observers.get(handle).cloned()
    }

    pub fn has_pending_cancel(&self, handle: &RegionHandle) -> bool {
        self.state.lock().pending_cancels.contains_key(handle)
    }

    /// Finish an outstanding cancel the way a real engine would
    pub fn complete_cancel(&self, handle: &RegionHandle, result: Result<(), OffmapError>) -> bool {
        let callback = {
            let mut state = self.state.lock();
            state.observers.remove(handle);
            state.pending_cancels.remove(handle)
        };
        match callback {
            Some(callback) => {
                callback(result);
                true
            }
            None => false,
        }
    }

    /// Lose an outstanding cancel without ever invoking it
    pub fn drop_cancel(&self, handle: &RegionHandle) {
        let callback = self.state.lock().pending_cancels.remove(handle);
        drop(callback);
    }
}

impl RegionStorageEngine for RecordingEngine {
    fn set_observer(&self, handle: &RegionHandle, observer: Arc<dyn RegionObserver>) {
        self.state.lock().observers.insert(handle.clone(), observer);
    }

    fn resume(&self, handle: &RegionHandle) {
        self.state.lock().commands.push(Command::Resume(handle.clone()));
    }

    fn suspend(&self, handle: &RegionHandle) {
        self.state.lock().commands.push(Command::Suspend(handle.clone()));
    }

    fn cancel(&self, handle: &RegionHandle, on_complete: CancelCallback) {
        let mut state = self.state.lock();
        state.commands.push(Command::Cancel(handle.clone()));
        state.pending_cancels.insert(handle.clone(), on_complete);
    }

    fn release(&self, handle: &RegionHandle) {
        let mut state = self.state.lock();
        state.commands.push(Command::Release(handle.clone()));
        state.observers.remove(handle);
    }
}

pub fn sample_region(name: &str) -> OfflineRegion {
    let definition = RegionDefinition::new(
        "https://tiles.example.com/style.json",
        LatLngBounds::new(52.3, 13.0, 52.7, 13.8),
        0.0,
        6.0,
    );
    OfflineRegion::new(name.to_string(), definition, Vec::new())
}
