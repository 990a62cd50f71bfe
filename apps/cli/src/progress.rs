//! Progress bar utilities for CLI region downloads

use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use offmap_core::Downloadable;
use offmap_types::{RegionDownloadState, RegionEvent, RegionStatus};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::output::format_bytes;

/// Manages progress bars for multiple region downloads
pub struct DownloadProgress {
    multi: MultiProgress,
    style: ProgressStyle,
    bars: HashMap<Uuid, ProgressBar>,
    finished: HashSet<Uuid>,
}

impl DownloadProgress {
    pub fn new() -> anyhow::Result<Self> {
        let style = ProgressStyle::with_template(
            "{spinner:.green} {prefix:16} [{bar:40.cyan/blue}] {pos}/{len} ({per_sec}, {eta}) {msg}",
        )?
        .progress_chars("█▓▒░  ");

        Ok(Self {
            multi: MultiProgress::new(),
            style,
            bars: HashMap::new(),
            finished: HashSet::new(),
        })
    }

    /// Create a progress bar for a region
    pub fn add_region(&mut self, downloadable: &Downloadable) {
        let pb = self.multi.add(ProgressBar::new(0));
        pb.set_style(self.style.clone());
        pb.set_prefix(downloadable.region().name.clone());

        if let Some(status) = downloadable.status() {
            update_bar(&pb, &status);
        }

        self.bars.insert(downloadable.id(), pb);
    }

    /// Whether every tracked region has reached an end state
    pub fn is_done(&self) -> bool {
        self.finished.len() == self.bars.len()
    }

    /// Update a progress bar from an event
    pub fn handle_event(&mut self, event: &RegionEvent) {
        let id = event.region_id();
        if self.finished.contains(&id) {
            return;
        }
        let Some(pb) = self.bars.get(&id) else {
            return;
        };

        match event {
            RegionEvent::StatusChanged { status, .. } => {
                update_bar(pb, status);
                if status.download_state == RegionDownloadState::Inactive && status.is_complete() {
                    pb.finish_with_message(format!(
                        "{} {}",
                        style("✓").green().bold(),
                        format_bytes(status.completed_resource_size)
                    ));
                    self.finished.insert(id);
                }
            }

            RegionEvent::ResponseError { error, .. } => {
                pb.set_message(format!("{} {}", style("!").yellow(), error));
            }

            RegionEvent::TileCountLimitExceeded { limit, .. } => {
                pb.abandon_with_message(format!(
                    "{} Exceeds the tile limit of {}",
                    style("✗").red().bold(),
                    limit
                ));
                self.finished.insert(id);
            }

            RegionEvent::RegionRemoved { .. } => {
                pb.abandon_with_message(format!("{} Cancelled", style("○").dim()));
                self.finished.insert(id);
            }

            _ => {}
        }
    }

    /// Catch a bar up with the region's latest observed state
    pub fn refresh(&mut self, downloadable: &Downloadable) {
        let id = downloadable.id();
        if let Some(limit) = downloadable.tile_count_limit_exceeded() {
            self.handle_event(&RegionEvent::TileCountLimitExceeded { id, limit });
        } else if let Some(status) = downloadable.status() {
            self.handle_event(&RegionEvent::StatusChanged { id, status });
        }
    }

    /// Mark every unfinished bar as paused
    pub fn suspend_all(&mut self) {
        for (id, pb) in &self.bars {
            if !self.finished.contains(id) {
                pb.abandon_with_message(format!("{} Suspended", style("⏸").yellow()));
            }
        }
        self.finished.extend(self.bars.keys().copied());
    }
}

fn update_bar(pb: &ProgressBar, status: &RegionStatus) {
    pb.set_length(status.required_resource_count);
    pb.set_position(status.completed_resource_count);
}
