use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::fs;
use anyhow::{Context, Result};

use crate::types::{X_COLUMN, Y_COLUMN};

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub input: InputConfig,
    #[serde(default)]
    pub aggregation: AggregationConfig,
    #[serde(default)]
    pub marker_map: MarkerMapConfig,
    #[serde(default)]
    pub dot_map: DotMapConfig,
    #[serde(default)]
    pub basemap: BasemapConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct InputConfig {
    pub housing_units: PathBuf,
    pub points: Option<PathBuf>, // .csv, .geojson or .shp
    #[serde(default = "default_points_epsg")]
    pub points_epsg: u32,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AggregationConfig {
    pub group_by: Vec<String>,
    pub target: String,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            group_by: vec![X_COLUMN.to_string(), Y_COLUMN.to_string()],
            target: "huid".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MarkerMapConfig {
    pub layer_name: String,
    /// Attribute to color by in `marker-map`.
    pub attribute: String,
    pub zoom_start: u8,
    pub minimap: bool,
    pub output: PathBuf,
}

impl Default for MarkerMapConfig {
    fn default() -> Self {
        Self {
            layer_name: "HUID count".to_string(),
            attribute: "huid".to_string(),
            zoom_start: 16,
            minimap: true,
            output: PathBuf::from("output/marker_map.html"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DotMapConfig {
    pub column: String,
    pub categorical: bool,
    pub size_px: u32,
    pub marker_radius: u32,
    pub max_zoom: u8,
    pub output: PathBuf,
}

impl Default for DotMapConfig {
    fn default() -> Self {
        Self {
            column: "race".to_string(),
            categorical: true,
            size_px: 1000,
            marker_radius: 1,
            max_zoom: 18,
            output: PathBuf::from("output/dot_map.png"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BasemapConfig {
    pub base_url: String,
    pub labels_url: String,
    pub user_agent: String,
    pub timeout_secs: u64,
}

impl Default for BasemapConfig {
    fn default() -> Self {
        Self {
            base_url: "https://tiles.stadiamaps.com/tiles/stamen_toner_lite/{z}/{x}/{y}.png".to_string(),
            labels_url: "https://tiles.stadiamaps.com/tiles/stamen_toner_labels/{z}/{x}/{y}.png".to_string(),
            user_agent: concat!("hua-maps/", env!("CARGO_PKG_VERSION")).to_string(),
            timeout_secs: 30,
        }
    }
}

fn default_points_epsg() -> u32 {
    4326
}

impl AppConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(content)
            .with_context(|| "Failed to parse TOML configuration")?;
        Ok(config)
    }
}
