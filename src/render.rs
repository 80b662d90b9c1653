use crate::basemap::{blend_over, draw_tiles, TileSource};
use crate::palette::{category_color, ramp_color, ramp_stops};
use crate::projection::zoom_for_extent;
use crate::types::{AttrValue, Crs, PointCollection};
use anyhow::{Context, Result, anyhow, bail};
use geo::{Coord, Rect};
use image::{Rgba, RgbaImage};
use imageproc::drawing::{draw_text_mut, text_size};
use rusttype::{Font, Scale};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use tracing::info;

// Padding around the data, as a share of its extent (and a floor in metres
// for a single point).
const MARGIN: f64 = 0.05;
const MIN_PAD: f64 = 250.0;
const HIGHEST_ZOOM: u8 = 22;

const LEGEND_FONT: &[u8] = include_bytes!("../assets/DejaVuSans.ttf");

const WHITE: Rgba<u8> = Rgba([255, 255, 255, 255]);
const BLACK: Rgba<u8> = Rgba([0, 0, 0, 255]);

#[derive(Debug, Clone)]
pub struct DotMapOptions {
    pub size_px: u32,
    pub marker_radius: u32,
    pub max_zoom: u8,
}

impl Default for DotMapOptions {
    fn default() -> Self {
        Self { size_px: 1000, marker_radius: 1, max_zoom: 18 }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LegendEntry {
    pub label: AttrValue,
    pub color: Rgba<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Legend {
    Categorical(Vec<LegendEntry>),
    Continuous { min: f64, max: f64, stops: Vec<Rgba<u8>> },
}

/// A rendered dot map: the raster plus what is needed to place more
/// things on it.
#[derive(Debug, Clone)]
pub struct DotMap {
    pub image: RgbaImage,
    /// Extent covered by the image, EPSG:3857
    pub extent: Rect<f64>,
    pub zoom: u8,
    pub column: String,
    pub legend: Legend,
}

impl DotMap {
    /// Pixel under a mercator coordinate, if it is on the canvas.
    pub fn pixel_of(&self, c: Coord<f64>) -> Option<(u32, u32)> {
        to_pixel(&self.extent, self.image.width(), self.image.height(), c)
    }

    pub fn save_png(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create output directory: {:?}", dir))?;
        }
        self.image
            .save(path)
            .with_context(|| format!("Failed to save dot map {:?}", path))?;
        info!(
            "Wrote {}x{} dot map of '{}' to {:?}",
            self.image.width(),
            self.image.height(),
            self.column,
            path
        );
        Ok(())
    }
}

/// Render `points` colored by `column` over a light basemap and its labels.
///
/// Points are reprojected to EPSG:3857. With `categorical` each distinct
/// value gets its own color; otherwise the column must be numeric and is
/// mapped onto a continuous ramp. Points without a value are not drawn.
pub fn render_dot_map(
    points: &PointCollection,
    column: &str,
    categorical: bool,
    options: &DotMapOptions,
    base: &dyn TileSource,
    labels: &dyn TileSource,
) -> Result<DotMap> {
    if options.size_px == 0 {
        bail!("Dot map size must be positive");
    }
    if !points.features.iter().any(|f| f.attribute(column).is_some()) {
        bail!("Column '{}' has no values in the point collection", column);
    }

    let projected = points.to_crs(Crs::WebMercator);
    let bounds = projected.bounds().context("Failed to compute dot map extent")?;
    let extent = padded_square(&bounds);

    let (colors, legend) = if categorical {
        categorical_colors(&projected, column)
    } else {
        continuous_colors(&projected, column)?
    };

    let size = options.size_px;
    let zoom = zoom_for_extent(extent.width(), size, options.max_zoom.min(HIGHEST_ZOOM));
    info!("Rendering {} points by '{}' at basemap zoom {}", projected.len(), column, zoom);

    let mut image = RgbaImage::from_pixel(size, size, WHITE);
    draw_tiles(&mut image, base, &extent, zoom)?;
    draw_tiles(&mut image, labels, &extent, zoom)?;

    for (feature, color) in projected.features.iter().zip(&colors) {
        let Some(color) = color else { continue };
        if let Some((px, py)) = to_pixel(&extent, size, size, feature.point.0) {
            draw_dot(&mut image, px, py, options.marker_radius, *color);
        }
    }

    draw_legend(&mut image, &legend, &legend_font()?);

    Ok(DotMap {
        image,
        extent,
        zoom,
        column: column.to_string(),
        legend,
    })
}

fn categorical_colors(points: &PointCollection, column: &str) -> (Vec<Option<Rgba<u8>>>, Legend) {
    let levels: BTreeSet<&AttrValue> = points
        .features
        .iter()
        .filter_map(|f| f.attribute(column))
        .collect();
    let levels: Vec<&AttrValue> = levels.into_iter().collect();

    let colors = points
        .features
        .iter()
        .map(|f| {
            let value = f.attribute(column)?;
            levels.binary_search(&value).ok().map(category_color)
        })
        .collect();

    let entries = levels
        .iter()
        .enumerate()
        .map(|(i, level)| LegendEntry { label: (*level).clone(), color: category_color(i) })
        .collect();

    (colors, Legend::Categorical(entries))
}

fn continuous_colors(points: &PointCollection, column: &str) -> Result<(Vec<Option<Rgba<u8>>>, Legend)> {
    let values = points
        .features
        .iter()
        .map(|f| match f.attribute(column) {
            None => Ok(None),
            Some(v) => v
                .as_f64()
                .map(Some)
                .ok_or_else(|| anyhow!("Column '{}' has non-numeric value '{}'", column, v)),
        })
        .collect::<Result<Vec<Option<f64>>>>()?;

    let (min, max) = values
        .iter()
        .flatten()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
    let span = max - min;

    let colors = values
        .iter()
        .map(|v| v.map(|v| ramp_color(if span > 0.0 { (v - min) / span } else { 0.0 })))
        .collect();

    Ok((colors, Legend::Continuous { min, max, stops: ramp_stops() }))
}

/// Square extent around the data with a margin, so the map keeps its
/// aspect ratio on a square canvas.
fn padded_square(bounds: &Rect<f64>) -> Rect<f64> {
    let pad = |len: f64| if len > 0.0 { len * MARGIN } else { MIN_PAD };
    let w = bounds.width() + 2.0 * pad(bounds.width());
    let h = bounds.height() + 2.0 * pad(bounds.height());
    let side = w.max(h);
    let c = bounds.center();
    Rect::new(
        Coord { x: c.x - side / 2.0, y: c.y - side / 2.0 },
        Coord { x: c.x + side / 2.0, y: c.y + side / 2.0 },
    )
}

fn to_pixel(extent: &Rect<f64>, width: u32, height: u32, c: Coord<f64>) -> Option<(u32, u32)> {
    let fx = (c.x - extent.min().x) / extent.width() * width as f64;
    let fy = (extent.max().y - c.y) / extent.height() * height as f64;
    if fx < 0.0 || fy < 0.0 || fx >= width as f64 || fy >= height as f64 {
        return None;
    }
    Some((fx as u32, fy as u32))
}

fn draw_dot(image: &mut RgbaImage, cx: u32, cy: u32, radius: u32, color: Rgba<u8>) {
    let r = radius as i64;
    for dy in -r..=r {
        for dx in -r..=r {
            if dx * dx + dy * dy > r * r {
                continue;
            }
            let (x, y) = (cx as i64 + dx, cy as i64 + dy);
            if x >= 0 && y >= 0 && x < image.width() as i64 && y < image.height() as i64 {
                blend_over(image.get_pixel_mut(x as u32, y as u32), color);
            }
        }
    }
}

fn fill_rect(image: &mut RgbaImage, x: u32, y: u32, w: u32, h: u32, color: Rgba<u8>) {
    for py in y..(y + h).min(image.height()) {
        for px in x..(x + w).min(image.width()) {
            image.put_pixel(px, py, color);
        }
    }
}

/// Legend in the top-right corner: a swatch and label per category, or a
/// vertical color bar (max on top) with its min and max written beside it.
fn draw_legend(image: &mut RgbaImage, legend: &Legend, font: &Font) {
    let size = image.width().min(image.height());
    let margin = (size / 100).max(2);
    let swatch = (size / 60).max(4);
    let scale = Scale::uniform((swatch as f32 * 1.2).max(10.0));
    let row_h = swatch.max(scale.y.ceil() as u32);

    match legend {
        Legend::Categorical(entries) => {
            if entries.is_empty() {
                return;
            }
            let labels: Vec<String> = entries.iter().map(|e| e.label.to_string()).collect();
            let text_w = labels
                .iter()
                .map(|l| text_size(scale, font, l).0.max(0) as u32)
                .max()
                .unwrap_or(0);

            let n = entries.len() as u32;
            let box_w = swatch + text_w + 3 * margin;
            let box_h = n * row_h + (n + 1) * margin;
            let x0 = image.width().saturating_sub(box_w + margin);
            let y0 = margin;
            fill_rect(image, x0, y0, box_w, box_h, BLACK);
            fill_rect(image, x0 + 1, y0 + 1, box_w.saturating_sub(2), box_h.saturating_sub(2), WHITE);
            for (i, (entry, label)) in entries.iter().zip(&labels).enumerate() {
                let y = y0 + margin + i as u32 * (row_h + margin);
                fill_rect(image, x0 + margin, y + (row_h - swatch) / 2, swatch, swatch, entry.color);
                let tx = x0 + swatch + 2 * margin;
                draw_text_mut(image, BLACK, tx as i32, y as i32, scale, font, label);
            }
        }
        Legend::Continuous { min, max, .. } => {
            let bar_h = (image.height() * 2 / 5).max(row_h);
            let x0 = image.width().saturating_sub(swatch + margin);
            let y0 = margin;
            fill_rect(image, x0.saturating_sub(1), y0.saturating_sub(1), swatch + 2, bar_h + 2, BLACK);
            for i in 0..bar_h {
                let t = if bar_h > 1 { 1.0 - i as f64 / (bar_h - 1) as f64 } else { 1.0 };
                fill_rect(image, x0, y0 + i, swatch, 1, ramp_color(t));
            }

            let top = AttrValue::Number(*max).to_string();
            let bottom = AttrValue::Number(*min).to_string();
            for (text, y) in [(top, y0), (bottom, y0 + bar_h - row_h)] {
                let w = text_size(scale, font, &text).0.max(0) as u32;
                let tx = x0.saturating_sub(w + 2 * margin);
                fill_rect(image, tx, y, w + margin, row_h, WHITE);
                draw_text_mut(image, BLACK, tx as i32, y as i32, scale, font, &text);
            }
        }
    }
}

/// Font the legend is written in, bundled with the binary.
fn legend_font() -> Result<Font<'static>> {
    Font::try_from_bytes(LEGEND_FONT).ok_or_else(|| anyhow!("Failed to load legend font"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basemap::tests::{Offline, SolidTiles};
    use crate::palette::hex_to_rgba;
    use crate::projection::lonlat_to_mercator;
    use crate::types::PointFeature;

    const GRAY: Rgba<u8> = Rgba([230, 230, 230, 255]);
    const CLEAR: Rgba<u8> = Rgba([0, 0, 0, 0]);

    fn options() -> DotMapOptions {
        DotMapOptions { size_px: 100, marker_radius: 1, max_zoom: 18 }
    }

    fn points() -> PointCollection {
        PointCollection::new(
            Crs::Wgs84,
            vec![
                PointFeature::new(-95.40, 29.75).with_attribute("race", "white").with_attribute("numprec", 1.0),
                PointFeature::new(-95.35, 29.75).with_attribute("race", "black").with_attribute("numprec", 4.0),
                PointFeature::new(-95.30, 29.75).with_attribute("race", "asian"),
            ],
        )
    }

    fn pixel_at(map: &DotMap, lon: f64, lat: f64) -> Rgba<u8> {
        let (x, y) = map.pixel_of(lonlat_to_mercator(Coord { x: lon, y: lat })).unwrap();
        *map.image.get_pixel(x, y)
    }

    #[test]
    fn categorical_dots_over_basemap() {
        let base = SolidTiles::new(GRAY);
        let labels = SolidTiles::new(CLEAR);
        let map = render_dot_map(&points(), "race", true, &options(), &base, &labels).unwrap();

        assert_eq!(map.image.dimensions(), (100, 100));
        // Levels sort: asian, black, white.
        assert_eq!(pixel_at(&map, -95.30, 29.75), hex_to_rgba("#1f77b4"));
        assert_eq!(pixel_at(&map, -95.35, 29.75), hex_to_rgba("#ff7f0e"));
        assert_eq!(pixel_at(&map, -95.40, 29.75), hex_to_rgba("#2ca02c"));
        assert_eq!(*map.image.get_pixel(0, 99), GRAY);

        match &map.legend {
            Legend::Categorical(entries) => {
                let labels: Vec<String> = entries.iter().map(|e| e.label.to_string()).collect();
                assert_eq!(labels, vec!["asian", "black", "white"]);
            }
            other => panic!("unexpected legend {:?}", other),
        }

        // Both layers fetched at the same zoom.
        let base_zooms: BTreeSet<u8> = base.requests.borrow().iter().map(|r| r.0).collect();
        let label_zooms: BTreeSet<u8> = labels.requests.borrow().iter().map(|r| r.0).collect();
        assert_eq!(base_zooms, label_zooms);
        assert_eq!(base_zooms.into_iter().collect::<Vec<_>>(), vec![map.zoom]);
    }

    #[test]
    fn label_layer_is_drawn_over_base() {
        let map = render_dot_map(
            &points(),
            "race",
            true,
            &options(),
            &SolidTiles::new(GRAY),
            &SolidTiles::new(Rgba([0, 0, 0, 255])),
        )
        .unwrap();
        assert_eq!(*map.image.get_pixel(0, 99), Rgba([0, 0, 0, 255]));
    }

    #[test]
    fn continuous_values_use_the_ramp() {
        let map = render_dot_map(
            &points(),
            "numprec",
            false,
            &options(),
            &SolidTiles::new(GRAY),
            &SolidTiles::new(CLEAR),
        )
        .unwrap();

        assert_eq!(pixel_at(&map, -95.40, 29.75), ramp_color(0.0));
        assert_eq!(pixel_at(&map, -95.35, 29.75), ramp_color(1.0));
        // No value: basemap shows through.
        assert_eq!(pixel_at(&map, -95.30, 29.75), GRAY);
        assert_eq!(map.legend, Legend::Continuous { min: 1.0, max: 4.0, stops: ramp_stops() });
    }

    #[test]
    fn continuous_rejects_text_values() {
        let err = render_dot_map(
            &points(),
            "race",
            false,
            &options(),
            &SolidTiles::new(GRAY),
            &SolidTiles::new(CLEAR),
        )
        .unwrap_err();
        assert!(err.to_string().contains("non-numeric"));
    }

    #[test]
    fn single_point_gets_a_fixed_margin() {
        let one = PointCollection::new(
            Crs::Wgs84,
            vec![PointFeature::new(-95.35, 29.75).with_attribute("race", "white")],
        );
        let map = render_dot_map(&one, "race", true, &options(), &SolidTiles::new(GRAY), &SolidTiles::new(CLEAR))
            .unwrap();
        approx::assert_relative_eq!(map.extent.width(), 2.0 * MIN_PAD, max_relative = 1e-9);
        assert_eq!(pixel_at(&map, -95.35, 29.75), hex_to_rgba("#1f77b4"));
    }

    #[test]
    fn extent_is_square_and_covers_all_points() {
        let map = render_dot_map(&points(), "race", true, &options(), &SolidTiles::new(GRAY), &SolidTiles::new(CLEAR))
            .unwrap();
        approx::assert_relative_eq!(map.extent.width(), map.extent.height(), max_relative = 1e-9);
        for f in points().to_crs(Crs::WebMercator).features {
            assert!(map.pixel_of(f.point.0).is_some());
        }
    }

    #[test]
    fn tile_failures_propagate() {
        let err = render_dot_map(&points(), "race", true, &options(), &Offline, &SolidTiles::new(CLEAR))
            .unwrap_err();
        assert!(format!("{:#}", err).contains("network unreachable"));
    }

    #[test]
    fn unknown_column_and_empty_input_fail() {
        let opts = options();
        let (base, labels) = (SolidTiles::new(GRAY), SolidTiles::new(CLEAR));
        assert!(render_dot_map(&points(), "tenure", true, &opts, &base, &labels).is_err());

        let empty = PointCollection::new(Crs::Wgs84, vec![]);
        assert!(render_dot_map(&empty, "race", true, &opts, &base, &labels).is_err());
        assert!(base.requests.borrow().is_empty());
    }

    fn legend_image(legend: &Legend) -> RgbaImage {
        let mut image = RgbaImage::from_pixel(200, 200, GRAY);
        draw_legend(&mut image, legend, &legend_font().unwrap());
        image
    }

    fn entries(labels: &[&str]) -> Legend {
        Legend::Categorical(
            labels
                .iter()
                .enumerate()
                .map(|(i, l)| LegendEntry { label: AttrValue::from(*l), color: category_color(i) })
                .collect(),
        )
    }

    #[test]
    fn legend_writes_category_labels() {
        let owner = legend_image(&entries(&["owner", "renter"]));
        let other = legend_image(&entries(&["vacant", "seasonal"]));
        assert_ne!(owner, other);

        // Border columns are dark top to bottom; glyph columns only in part.
        let dark = |p: &Rgba<u8>| p[0] < 100 && p[1] < 100 && p[2] < 100;
        let text_columns = (0..owner.width())
            .filter(|&x| {
                let n = (4..24).filter(|&y| dark(owner.get_pixel(x, y))).count();
                n > 0 && n < 20
            })
            .count();
        assert!(text_columns > 5);
    }

    #[test]
    fn legend_writes_continuous_range() {
        let stops = ramp_stops();
        let small = legend_image(&Legend::Continuous { min: 1.0, max: 4.0, stops: stops.clone() });
        let large = legend_image(&Legend::Continuous { min: 1.0, max: 900.0, stops });
        assert_ne!(small, large);
    }

    #[test]
    fn save_png_round_trips_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("dots.png");
        let map = render_dot_map(&points(), "race", true, &options(), &SolidTiles::new(GRAY), &SolidTiles::new(CLEAR))
            .unwrap();
        map.save_png(&path).unwrap();
        let reloaded = image::open(&path).unwrap();
        assert_eq!(reloaded.width(), 100);
        assert_eq!(reloaded.height(), 100);
    }
}
