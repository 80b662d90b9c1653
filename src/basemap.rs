//! XYZ basemap tiles: fetching and drawing them under a Web Mercator canvas.

use crate::config::BasemapConfig;
use crate::projection::mercator_to_tile;
use anyhow::{Context, Result, anyhow};
use geo::{Coord, Rect};
use image::{Rgba, RgbaImage};
use reqwest::blocking::Client;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

/// Anything that can hand out slippy-map tiles.
pub trait TileSource {
    fn name(&self) -> &str;
    fn fetch(&self, zoom: u8, x: u32, y: u32) -> Result<RgbaImage>;
}

/// Tiles downloaded over HTTP from a `{z}/{x}/{y}` URL template.
pub struct HttpTileSource {
    name: String,
    url_template: String,
    client: Client,
}

impl HttpTileSource {
    pub fn new(name: &str, url_template: &str, config: &BasemapConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            name: name.to_string(),
            url_template: url_template.to_string(),
            client,
        })
    }

    /// The light base layer and the label layer from the config.
    pub fn pair_from_config(config: &BasemapConfig) -> Result<(Self, Self)> {
        Ok((
            Self::new("base", &config.base_url, config)?,
            Self::new("labels", &config.labels_url, config)?,
        ))
    }

    pub fn tile_url(&self, zoom: u8, x: u32, y: u32) -> String {
        tile_url(&self.url_template, zoom, x, y)
    }
}

impl TileSource for HttpTileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn fetch(&self, zoom: u8, x: u32, y: u32) -> Result<RgbaImage> {
        let url = self.tile_url(zoom, x, y);
        debug!("Fetching tile {}", url);

        let response = self.client
            .get(&url)
            .send()
            .with_context(|| format!("Tile request failed: {}", url))?;
        if !response.status().is_success() {
            return Err(anyhow!("Tile server responded with {} for {}", response.status(), url));
        }
        let bytes = response
            .bytes()
            .with_context(|| format!("Failed to read tile response: {}", url))?;
        let image = image::load_from_memory(&bytes)
            .with_context(|| format!("Failed to decode tile: {}", url))?;
        Ok(image.into_rgba8())
    }
}

/// Fill a `{z}/{x}/{y}` template. `{s}` and `{r}` pick the first
/// subdomain and standard resolution.
pub fn tile_url(template: &str, zoom: u8, x: u32, y: u32) -> String {
    template
        .replace("{z}", &zoom.to_string())
        .replace("{x}", &x.to_string())
        .replace("{y}", &y.to_string())
        .replace("{s}", "a")
        .replace("{r}", "")
}

/// Inclusive tile index ranges covering a mercator extent.
pub fn tiles_for_extent(extent: &Rect<f64>, zoom: u8) -> (std::ops::RangeInclusive<u32>, std::ops::RangeInclusive<u32>) {
    let n = 1u32 << zoom;
    let last = (n - 1) as f64;
    let (x0, y0) = mercator_to_tile(Coord { x: extent.min().x, y: extent.max().y }, zoom);
    let (x1, y1) = mercator_to_tile(Coord { x: extent.max().x, y: extent.min().y }, zoom);
    let clamp = |v: f64| v.floor().clamp(0.0, last) as u32;
    (clamp(x0)..=clamp(x1), clamp(y0)..=clamp(y1))
}

/// Draw one tile layer over `canvas`, which covers `extent` (EPSG:3857).
/// Pixels outside the projected world are left untouched.
pub fn draw_tiles(
    canvas: &mut RgbaImage,
    source: &dyn TileSource,
    extent: &Rect<f64>,
    zoom: u8,
) -> Result<()> {
    let (xs, ys) = tiles_for_extent(extent, zoom);
    let mut tiles: HashMap<(u32, u32), RgbaImage> = HashMap::new();
    for ty in ys {
        for tx in xs.clone() {
            let tile = source
                .fetch(zoom, tx, ty)
                .with_context(|| format!("Failed to fetch {} tile {}/{}/{}", source.name(), zoom, tx, ty))?;
            tiles.insert((tx, ty), tile);
        }
    }
    info!("Fetched {} {} tiles at zoom {}", tiles.len(), source.name(), zoom);

    let (width, height) = canvas.dimensions();
    let (ext_w, ext_h) = (extent.width(), extent.height());
    let n = (1u32 << zoom) as f64;

    for py in 0..height {
        for px in 0..width {
            let c = Coord {
                x: extent.min().x + (px as f64 + 0.5) / width as f64 * ext_w,
                y: extent.max().y - (py as f64 + 0.5) / height as f64 * ext_h,
            };
            let (fx, fy) = mercator_to_tile(c, zoom);
            if fx < 0.0 || fy < 0.0 || fx >= n || fy >= n {
                continue;
            }
            let (tx, ty) = (fx.floor() as u32, fy.floor() as u32);
            let Some(tile) = tiles.get(&(tx, ty)) else { continue };

            let sx = (((fx - tx as f64) * tile.width() as f64) as u32).min(tile.width() - 1);
            let sy = (((fy - ty as f64) * tile.height() as f64) as u32).min(tile.height() - 1);
            let src = *tile.get_pixel(sx, sy);
            blend_over(canvas.get_pixel_mut(px, py), src);
        }
    }
    Ok(())
}

/// Source-over compositing onto an opaque canvas pixel.
pub fn blend_over(dst: &mut Rgba<u8>, src: Rgba<u8>) {
    match src[3] {
        0 => {}
        255 => *dst = src,
        a => {
            let a = a as f64 / 255.0;
            for i in 0..3 {
                dst[i] = (src[i] as f64 * a + dst[i] as f64 * (1.0 - a)).round() as u8;
            }
        }
    }
}
