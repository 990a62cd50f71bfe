//! Offmap CLI - Command-line offline region downloader
//!
//! Define map regions, download them with a live progress bar, and
//! suspend, resume or cancel them later.

mod commands;
mod output;
mod progress;

use anyhow::Result;
use clap::{Parser, Subcommand};
use offmap_types::LatLngBounds;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Offmap - Offline Map Regions
#[derive(Parser)]
#[command(name = "offmap")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Data directory for Offmap
    #[arg(long, env = "OFFMAP_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "human")]
    output: OutputFormat,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum OutputFormat {
    Human,
    Json,
    Table,
}

#[derive(Subcommand)]
enum Commands {
    /// Define a new offline region
    Add {
        /// Region name
        name: String,

        /// Bounds as south,west,north,east
        #[arg(long, value_parser = parse_bounds, allow_hyphen_values = true)]
        bounds: LatLngBounds,

        /// Style URL the tiles belong to
        #[arg(long)]
        style: String,

        /// Lowest zoom level to download
        #[arg(long, default_value_t = 0.0)]
        min_zoom: f64,

        /// Highest zoom level to download
        #[arg(long, default_value_t = 14.0)]
        max_zoom: f64,

        /// Device pixel ratio
        #[arg(long, default_value_t = 1.0)]
        pixel_ratio: f32,

        /// Free-form metadata stored with the region
        #[arg(long)]
        metadata: Option<String>,

        /// Start downloading immediately
        #[arg(short = 'n', long)]
        now: bool,
    },

    /// List regions
    List {
        /// Filter by state (suspended, active, cancelling, cancelled)
        #[arg(short, long)]
        state: Option<String>,

        /// Show all details
        #[arg(short, long)]
        all: bool,
    },

    /// Show region info
    Info {
        /// Region ID (or unique prefix)
        id: String,
    },

    /// Download regions, showing progress until done or interrupted
    Download {
        /// Region IDs (or unique prefixes)
        ids: Vec<String>,

        /// Download every suspended region
        #[arg(long, conflicts_with = "ids")]
        all: bool,
    },

    /// Cancel a region and delete its data
    Cancel {
        /// Region ID (or unique prefix)
        id: String,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Show/update settings
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a config value
    Get {
        /// Config key
        key: String,
    },

    /// Set a config value
    Set {
        /// Config key
        key: String,

        /// Config value
        value: String,
    },

    /// Show all config
    Show,

    /// Reset to defaults
    Reset {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

fn parse_bounds(value: &str) -> Result<LatLngBounds, String> {
    let parts = value
        .split(',')
        .map(|p| p.trim().parse::<f64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("invalid coordinate: {}", e))?;

    match parts.as_slice() {
        [south, west, north, east] => Ok(LatLngBounds::new(*south, *west, *north, *east)),
        _ => Err("expected four values: south,west,north,east".to_string()),
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Completions { shell } = cli.command {
        use clap::CommandFactory;
        clap_complete::generate(shell, &mut Cli::command(), "offmap", &mut std::io::stdout());
        return Ok(());
    }

    init_logging(cli.verbose);

    // Determine data directory
    let data_dir = cli.data_dir.unwrap_or_else(offmap_types::default_data_dir);

    // Initialize core
    let core = offmap_core::OffmapCore::new(data_dir).await?;

    // Execute command
    match cli.command {
        Commands::Add {
            name,
            bounds,
            style,
            min_zoom,
            max_zoom,
            pixel_ratio,
            metadata,
            now,
        } => {
            let mut definition =
                offmap_types::RegionDefinition::new(style, bounds, min_zoom, max_zoom);
            definition.pixel_ratio = pixel_ratio;
            let metadata = metadata.map(String::into_bytes).unwrap_or_default();
            commands::add_region(&core, &name, definition, metadata, now, cli.output).await?
        }

        Commands::List { state, all } => commands::list_regions(&core, state, all, cli.output)?,

        Commands::Info { id } => commands::show_info(&core, &id, cli.output)?,

        Commands::Download { ids, all } => commands::download(&core, ids, all, cli.output).await?,

        Commands::Cancel { id, yes } => commands::cancel_region(&core, &id, yes, cli.output).await?,

        Commands::Config { action } => commands::config_action(&core, action, cli.output).await?,

        Commands::Completions { .. } => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bounds() {
        let bounds = parse_bounds("52.3, 13.0,52.7,13.8").unwrap();
        assert_eq!(bounds, LatLngBounds::new(52.3, 13.0, 52.7, 13.8));

        let southern = parse_bounds("-34.1,18.3,-33.8,18.6").unwrap();
        assert_eq!(southern.south, -34.1);

        assert!(parse_bounds("1,2,3").is_err());
        assert!(parse_bounds("a,b,c,d").is_err());
    }

    #[test]
    fn test_cli_definition_is_valid() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_add_command() {
        let cli = Cli::try_parse_from([
            "offmap",
            "add",
            "cape town",
            "--bounds",
            "-34.1,18.3,-33.8,18.6",
            "--style",
            "https://tiles.example.com/style.json",
            "--max-zoom",
            "10",
        ])
        .unwrap();

        match cli.command {
            Commands::Add {
                name,
                bounds,
                max_zoom,
                now,
                ..
            } => {
                assert_eq!(name, "cape town");
                assert_eq!(bounds.west, 18.3);
                assert_eq!(max_zoom, 10.0);
                assert!(!now);
            }
            _ => panic!("expected add command"),
        }
    }
}
