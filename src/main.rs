pub mod types;
pub mod config;
pub mod data;
pub mod processing;
pub mod palette;
pub mod projection;
pub mod marker_map;
pub mod basemap;
pub mod render;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use crate::basemap::HttpTileSource;
use crate::config::AppConfig;
use crate::marker_map::{MarkerMap, MarkerMapOptions};
use crate::render::DotMapOptions;
use crate::types::{BlockId, PointCollection};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Count the target attribute per location and print CSV
    Count {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
        /// Only count housing units in this census block
        #[arg(short, long)]
        block: Option<BlockId>,
    },
    /// Marker map of building counts inside one census block
    BlockMap {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
        #[arg(short, long)]
        block: BlockId,
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },
    /// Marker map of points, one layer per attribute value
    MarkerMap {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },
    /// Static dot map over basemap tiles
    DotMap {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Count { config, block } => {
            let app_config = AppConfig::load_from_file(config)?;
            let table = data::load_housing_units(&app_config.input.housing_units)?.value;

            let agg = &app_config.aggregation;
            let counts = processing::count_by_location(&table, block.as_ref(), &agg.group_by, &agg.target)?;
            data::write_counts(&counts, &agg.group_by, &agg.target, std::io::stdout().lock())?;
        }
        Commands::BlockMap { config, block, output } => {
            info!("Mapping block {} with config: {:?}", block, config);
            let app_config = AppConfig::load_from_file(config)?;
            let table = data::load_housing_units(&app_config.input.housing_units)?.value;

            let map = processing::map_selected_block(
                &table,
                block,
                &app_config.aggregation.target,
                &app_config.marker_map.layer_name,
                &marker_options(&app_config),
            )?
            .value;
            map.save_html(output.as_deref().unwrap_or(&app_config.marker_map.output))?;
        }
        Commands::MarkerMap { config, output } => {
            let app_config = AppConfig::load_from_file(config)?;
            let points = load_points(&app_config)?;

            let attribute = &app_config.marker_map.attribute;
            let levels = processing::unique_levels(&points.features, attribute);
            info!("Mapping {} levels of '{}'", levels.len(), attribute);

            let map = MarkerMap::build(
                &points,
                attribute,
                &app_config.marker_map.layer_name,
                &levels,
                &marker_options(&app_config),
            )?
            .value;
            map.save_html(output.as_deref().unwrap_or(&app_config.marker_map.output))?;
        }
        Commands::DotMap { config, output } => {
            let app_config = AppConfig::load_from_file(config)?;
            let points = load_points(&app_config)?;
            let (base, labels) = HttpTileSource::pair_from_config(&app_config.basemap)?;

            let dot = &app_config.dot_map;
            let options = DotMapOptions {
                size_px: dot.size_px,
                marker_radius: dot.marker_radius,
                max_zoom: dot.max_zoom,
            };
            let map = render::render_dot_map(&points, &dot.column, dot.categorical, &options, &base, &labels)?;
            map.save_png(output.as_deref().unwrap_or(&dot.output))?;
        }
    }

    Ok(())
}

fn marker_options(config: &AppConfig) -> MarkerMapOptions {
    MarkerMapOptions {
        zoom_start: config.marker_map.zoom_start,
        minimap: config.marker_map.minimap,
    }
}

/// Points from `input.points` when set, otherwise the housing unit x/y.
fn load_points(config: &AppConfig) -> Result<PointCollection> {
    match &config.input.points {
        Some(path) => data::load_points(path, config.input.points_epsg),
        None => {
            let table = data::load_housing_units(&config.input.housing_units)?.value;
            PointCollection::from_housing_units(&table)
        }
    }
}
