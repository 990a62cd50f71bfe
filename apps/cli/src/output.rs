//! Output formatting utilities

use crate::OutputFormat;
use console::style;
use offmap_core::Downloadable;
use offmap_types::{DownloadState, OfflineRegion, RegionProgress};
use serde::Serialize;
use std::fmt;

/// Print output in the specified format
pub fn print_output<T: Serialize + fmt::Display>(value: &T, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(value)?);
        }
        OutputFormat::Human | OutputFormat::Table => {
            println!("{}", value);
        }
    }
    Ok(())
}

/// Format bytes as human-readable
pub fn format_bytes(bytes: u64) -> String {
    human_bytes::human_bytes(bytes as f64)
}

/// First eight characters of an id, as shown in listings
pub fn short_id(id: &uuid::Uuid) -> String {
    id.to_string()[..8].to_string()
}

/// Point-in-time view of a region for display
#[derive(Debug, Serialize)]
pub struct RegionSummary {
    #[serde(flatten)]
    pub region: OfflineRegion,
    pub state: DownloadState,
    pub tile_count: u64,
    pub progress: RegionProgress,
}

impl RegionSummary {
    pub fn of(downloadable: &Downloadable) -> Self {
        let region = downloadable.region().clone();
        Self {
            tile_count: region.definition.tile_count(),
            region,
            state: downloadable.state(),
            progress: downloadable.progress(),
        }
    }

    pub fn percent(&self) -> f64 {
        self.progress
            .status
            .as_ref()
            .map(|s| s.progress())
            .unwrap_or(0.0)
    }

    pub fn state_icon(&self) -> console::StyledObject<&'static str> {
        match self.state {
            DownloadState::Active => style("↓").cyan(),
            DownloadState::Suspended if self.is_complete() => style("✓").green(),
            DownloadState::Suspended => style("⏸").yellow(),
            DownloadState::Cancelling => style("…").dim(),
            DownloadState::Cancelled => style("○").dim(),
        }
    }

    fn is_complete(&self) -> bool {
        self.progress
            .status
            .as_ref()
            .is_some_and(|s| s.is_complete())
    }
}

impl fmt::Display for RegionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let definition = &self.region.definition;
        let bounds = &definition.bounds;

        writeln!(
            f,
            "{} {} {} [{}]",
            self.state_icon(),
            style(&self.region.name).bold(),
            style(format!("{:.1}%", self.percent())).dim(),
            style(self.state).dim()
        )?;
        writeln!(f, "    ID: {}", self.region.id)?;
        writeln!(f, "    Style: {}", definition.style_url)?;
        writeln!(
            f,
            "    Bounds: {}, {} to {}, {}",
            bounds.south, bounds.west, bounds.north, bounds.east
        )?;
        writeln!(
            f,
            "    Zoom: {} to {} (pixel ratio {})",
            definition.min_zoom, definition.max_zoom, definition.pixel_ratio
        )?;
        writeln!(f, "    Tiles: {}", self.tile_count)?;

        if let Some(status) = &self.progress.status {
            writeln!(
                f,
                "    Resources: {} / {} ({})",
                status.completed_resource_count,
                status.required_resource_count,
                format_bytes(status.completed_resource_size)
            )?;
        }
        if let Some(limit) = self.progress.tile_count_limit_exceeded {
            writeln!(f, "    {}", style(format!("Exceeds the tile limit of {}", limit)).red())?;
        }
        if let Some(error) = &self.progress.last_error {
            writeln!(f, "    Last error: {}", style(error).red())?;
        }
        if !self.region.metadata.is_empty() {
            writeln!(f, "    Metadata: {}", String::from_utf8_lossy(&self.region.metadata))?;
        }
        write!(f, "    Created: {}", self.region.created_at.format("%Y-%m-%d %H:%M:%S"))
    }
}
