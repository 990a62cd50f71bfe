//! CLI command implementations

use crate::output::{format_bytes, print_output, short_id, RegionSummary};
use crate::progress::DownloadProgress;
use crate::{ConfigAction, OutputFormat};
use anyhow::{anyhow, Result};
use console::style;
use offmap_core::{Downloadable, OffmapCore};
use offmap_types::{DownloadState, RegionDefinition, Settings};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

/// How long to wait for suspended jobs to persist their progress
const SUSPEND_GRACE: Duration = Duration::from_secs(2);

/// Find a region by full id or unique id prefix
fn resolve_region(core: &OffmapCore, id: &str) -> Result<Arc<Downloadable>> {
    if let Ok(uuid) = Uuid::parse_str(id) {
        return Ok(core.region(uuid)?);
    }

    let mut matches: Vec<_> = core
        .regions()
        .into_iter()
        .filter(|d| d.id().to_string().starts_with(id))
        .collect();

    match matches.len() {
        0 => Err(anyhow!("No region matches {}", id)),
        1 => Ok(matches.remove(0)),
        n => Err(anyhow!("{} regions match {}; use a longer prefix", n, id)),
    }
}

// ============================================================================
// Region Commands
// ============================================================================

pub async fn add_region(
    core: &OffmapCore,
    name: &str,
    definition: RegionDefinition,
    metadata: Vec<u8>,
    now: bool,
    format: OutputFormat,
) -> Result<()> {
    let downloadable = core.add_region(name, definition, metadata).await?;
    let summary = RegionSummary::of(&downloadable);

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        OutputFormat::Human | OutputFormat::Table => {
            println!(
                "{} Added region: {}",
                style("✓").green().bold(),
                style(&summary.region.name).cyan()
            );
            println!("  ID: {}", summary.region.id);
            println!("  Tiles: {}", summary.tile_count);

            let limit = core.get_settings().await.tile_count_limit;
            if summary.tile_count > limit {
                println!(
                    "  {}",
                    style(format!("Warning: exceeds the tile limit of {}", limit)).yellow()
                );
            }
        }
    }

    if now {
        download(core, vec![downloadable.id().to_string()], false, format).await?;
    }

    Ok(())
}

pub fn list_regions(
    core: &OffmapCore,
    state_filter: Option<String>,
    show_all: bool,
    format: OutputFormat,
) -> Result<()> {
    let filtered: Vec<RegionSummary> = core
        .regions()
        .iter()
        .filter(|d| match &state_filter {
            Some(state) => d.state().to_string() == state.to_lowercase(),
            None => true,
        })
        .map(|d| RegionSummary::of(d))
        .collect();

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&filtered)?);
        }
        OutputFormat::Table => {
            use tabled::{Table, Tabled};

            #[derive(Tabled)]
            struct RegionRow {
                id: String,
                name: String,
                state: String,
                tiles: u64,
                progress: String,
                size: String,
            }

            let rows: Vec<RegionRow> = filtered
                .iter()
                .map(|s| RegionRow {
                    id: short_id(&s.region.id),
                    name: if s.region.name.chars().count() > 30 {
                        format!("{}...", s.region.name.chars().take(27).collect::<String>())
                    } else {
                        s.region.name.clone()
                    },
                    state: s.state.to_string(),
                    tiles: s.tile_count,
                    progress: format!("{:.1}%", s.percent()),
                    size: s
                        .progress
                        .status
                        .as_ref()
                        .map(|st| format_bytes(st.completed_resource_size))
                        .unwrap_or_else(|| "?".to_string()),
                })
                .collect();

            println!("{}", Table::new(rows));
        }
        OutputFormat::Human => {
            if filtered.is_empty() {
                println!("{}", style("No regions found").dim());
                return Ok(());
            }

            for summary in &filtered {
                if show_all {
                    println!("{}", summary);
                    println!();
                } else {
                    println!(
                        "{} {} {} [{}] {}",
                        summary.state_icon(),
                        style(&summary.region.name).bold(),
                        style(format!("{:.1}%", summary.percent())).dim(),
                        style(summary.state).dim(),
                        style(short_id(&summary.region.id)).dim()
                    );
                }
            }
            println!();
            println!("{} region(s) total", style(filtered.len()).bold());
        }
    }

    Ok(())
}

pub fn show_info(core: &OffmapCore, id: &str, format: OutputFormat) -> Result<()> {
    let downloadable = resolve_region(core, id)?;
    print_output(&RegionSummary::of(&downloadable), format)
}

/// Resume regions and render progress until they finish or Ctrl-C suspends them
pub async fn download(
    core: &OffmapCore,
    ids: Vec<String>,
    all: bool,
    format: OutputFormat,
) -> Result<()> {
    let targets: Vec<Arc<Downloadable>> = if all {
        core.regions()
            .into_iter()
            .filter(|d| d.state() == DownloadState::Suspended)
            .collect()
    } else {
        ids.iter()
            .map(|id| resolve_region(core, id))
            .collect::<Result<_>>()?
    };

    if targets.is_empty() {
        println!("{}", style("Nothing to download").dim());
        return Ok(());
    }

    // Subscribe before resuming so no status is missed
    let mut events = core.subscribe();
    let mut progress = DownloadProgress::new()?;
    for downloadable in &targets {
        progress.add_region(downloadable);
        if downloadable.state() == DownloadState::Suspended {
            core.controller().resume_downloadable(downloadable)?;
        }
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let interrupted = loop {
        if progress.is_done() {
            break false;
        }

        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => progress.handle_event(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("Progress display skipped {} events", skipped);
                    for downloadable in &targets {
                        progress.refresh(downloadable);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break false,
            },
            _ = &mut ctrl_c => break true,
        }
    };

    if interrupted {
        progress.suspend_all();
        for downloadable in &targets {
            if downloadable.state() == DownloadState::Active {
                core.controller().suspend_downloadable(downloadable)?;
            }
        }
        wait_for_idle(core, &targets).await;
        println!(
            "{} Suspended; run the download again to continue",
            style("⏸").yellow()
        );
    }

    if let OutputFormat::Json = format {
        let summaries: Vec<_> = targets.iter().map(|d| RegionSummary::of(d)).collect();
        println!("{}", serde_json::to_string_pretty(&summaries)?);
    }

    Ok(())
}

/// Give stopped jobs a moment to write their final status
async fn wait_for_idle(core: &OffmapCore, targets: &[Arc<Downloadable>]) {
    let handles: Vec<_> = targets.iter().filter_map(|d| d.handle()).collect();
    let idle = async {
        while !handles.iter().all(|h| core.engine().is_idle(h)) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };

    if tokio::time::timeout(SUSPEND_GRACE, idle).await.is_err() {
        debug!("Timed out waiting for jobs to stop");
    }
}

pub async fn cancel_region(
    core: &OffmapCore,
    id: &str,
    yes: bool,
    _format: OutputFormat,
) -> Result<()> {
    let downloadable = resolve_region(core, id)?;

    if !yes {
        use dialoguer::Confirm;

        let confirmed = Confirm::new()
            .with_prompt(format!(
                "Cancel {} and delete its data?",
                downloadable.region().name
            ))
            .default(false)
            .interact()?;

        if !confirmed {
            return Ok(());
        }
    }

    core.controller().cancel_and_wait(&downloadable).await?;
    println!("{} Region cancelled", style("✓").green().bold());
    Ok(())
}

// ============================================================================
// Config Commands
// ============================================================================

const CONFIG_KEYS: &[&str] = &[
    "tile_count_limit",
    "tiles_per_second",
    "average_tile_size",
    "event_buffer",
    "status_persist_interval",
    "simulate_error_every",
];

fn format_optional(value: Option<u64>, none: &str) -> String {
    value
        .map(|v| v.to_string())
        .unwrap_or_else(|| none.to_string())
}

/// Parse a number, treating "none", "off" and "unlimited" as unset
fn parse_optional(value: &str) -> Result<Option<u64>> {
    match value.to_lowercase().as_str() {
        "none" | "off" | "unlimited" => Ok(None),
        other => Ok(Some(other.parse()?)),
    }
}

fn config_value(settings: &Settings, key: &str) -> Result<String> {
    let value = match key {
        "tile_count_limit" => settings.tile_count_limit.to_string(),
        "tiles_per_second" => format_optional(settings.tiles_per_second, "unlimited"),
        "average_tile_size" => settings.average_tile_size.to_string(),
        "event_buffer" => settings.event_buffer.to_string(),
        "status_persist_interval" => settings.status_persist_interval.to_string(),
        "simulate_error_every" => format_optional(settings.simulate_error_every, "off"),
        _ => return Err(anyhow!("Unknown config key: {}", key)),
    };
    Ok(value)
}

fn set_config_value(settings: &mut Settings, key: &str, value: &str) -> Result<()> {
    match key {
        "tile_count_limit" => settings.tile_count_limit = value.parse()?,
        "tiles_per_second" => settings.tiles_per_second = parse_optional(value)?,
        "average_tile_size" => settings.average_tile_size = value.parse()?,
        "event_buffer" => settings.event_buffer = value.parse()?,
        "status_persist_interval" => settings.status_persist_interval = value.parse()?,
        "simulate_error_every" => settings.simulate_error_every = parse_optional(value)?,
        _ => return Err(anyhow!("Unknown config key: {}", key)),
    }
    Ok(())
}

pub async fn config_action(
    core: &OffmapCore,
    action: Option<ConfigAction>,
    format: OutputFormat,
) -> Result<()> {
    match action {
        None | Some(ConfigAction::Show) => {
            let settings = core.get_settings().await;

            match format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&settings)?);
                }
                _ => {
                    println!("Offmap Configuration:");
                    println!();
                    for key in CONFIG_KEYS {
                        println!("  {}: {}", key, config_value(&settings, key)?);
                    }
                }
            }
        }

        Some(ConfigAction::Get { key }) => {
            let settings = core.get_settings().await;
            println!("{}", config_value(&settings, &key)?);
        }

        Some(ConfigAction::Set { key, value }) => {
            let mut settings = core.get_settings().await;
            set_config_value(&mut settings, &key, &value)?;
            core.update_settings(settings).await?;
            println!("{} Config updated", style("✓").green().bold());
        }

        Some(ConfigAction::Reset { yes }) => {
            use dialoguer::Confirm;

            let confirmed = yes
                || Confirm::new()
                    .with_prompt("Reset all settings to defaults?")
                    .default(false)
                    .interact()?;

            if confirmed {
                core.update_settings(Settings::default()).await?;
                println!("{} Settings reset to defaults", style("✓").green().bold());
            }
        }
    }

    Ok(())
}
