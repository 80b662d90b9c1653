//! Interactive marker maps rendered with Leaflet.
//!
//! [`MarkerMap::build`] produces a plain data description of the map (view,
//! layers, markers, controls). Nothing touches the filesystem until the
//! caller asks for [`MarkerMap::to_html`] or [`MarkerMap::save_html`].

use crate::palette::{assign_marker_colors, MarkerColor};
use crate::types::{AttrValue, Crs, PointCollection, WithDiagnostics};
use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

const MARKER_ICON: &str = "home";

#[derive(Debug, Clone)]
pub struct MarkerMapOptions {
    pub zoom_start: u8,
    pub minimap: bool,
}

impl Default for MarkerMapOptions {
    fn default() -> Self {
        Self { zoom_start: 16, minimap: true }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Marker {
    /// [lat, lon]
    pub location: [f64; 2],
    pub popup: String,
    pub color: MarkerColor,
    pub icon: &'static str,
}

/// Togglable group of markers for one category level.
#[derive(Debug, Clone, Serialize)]
pub struct MarkerLayer {
    pub name: String,
    pub level: AttrValue,
    pub color: MarkerColor,
    pub markers: Vec<Marker>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LayerControl {
    pub collapsed: bool,
    pub auto_z_index: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TileLayer {
    pub name: String,
    pub url: String,
    pub attribution: String,
}

impl Default for TileLayer {
    fn default() -> Self {
        Self {
            name: "OpenStreetMap".to_string(),
            url: "https://tile.openstreetmap.org/{z}/{x}/{y}.png".to_string(),
            attribution: "&copy; OpenStreetMap contributors".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MarkerMap {
    /// [lat, lon] of the initial view
    pub center: [f64; 2],
    pub zoom_start: u8,
    pub tiles: TileLayer,
    pub layers: Vec<MarkerLayer>,
    pub layer_control: LayerControl,
    pub minimap: bool,
    /// South-west and north-east corners, each [lat, lon]
    pub bounds: [[f64; 2]; 2],
}

impl MarkerMap {
    /// Build a marker map with one layer per level of `attribute`.
    ///
    /// Layer `i` is named `"{layer_name} {i + 1}"` and takes the palette
    /// color at position `i`. Colors depend on the order of `levels`, not
    /// on their values. A level without matching points still gets an
    /// (empty) layer.
    pub fn build(
        points: &PointCollection,
        attribute: &str,
        layer_name: &str,
        levels: &[AttrValue],
        options: &MarkerMapOptions,
    ) -> Result<WithDiagnostics<MarkerMap>> {
        let points = points.to_crs(Crs::Wgs84);
        let extent = points.bounds().context("Failed to compute map extent")?;

        let colors = assign_marker_colors(levels.len());
        let mut layers = Vec::with_capacity(levels.len());

        for (i, (level, color)) in levels.iter().zip(&colors.value).enumerate() {
            let markers: Vec<Marker> = points
                .features
                .iter()
                .filter(|f| f.attribute(attribute) == Some(level))
                .map(|f| Marker {
                    location: [f.point.y(), f.point.x()],
                    popup: level.to_string(),
                    color: *color,
                    icon: MARKER_ICON,
                })
                .collect();

            let name = format!("{} {}", layer_name, i + 1);
            debug!("Layer '{}' ({}) holds {} markers for {}", name, color.name(), markers.len(), level);
            layers.push(MarkerLayer {
                name,
                level: level.clone(),
                color: *color,
                markers,
            });
        }

        let (min, max) = (extent.min(), extent.max());
        let map = MarkerMap {
            center: [(min.y + max.y) / 2.0, (min.x + max.x) / 2.0],
            zoom_start: options.zoom_start,
            tiles: TileLayer::default(),
            layers,
            layer_control: LayerControl { collapsed: false, auto_z_index: false },
            minimap: options.minimap,
            bounds: [[min.y, min.x], [max.y, max.x]],
        };

        Ok(WithDiagnostics { value: map, diagnostics: colors.diagnostics })
    }

    pub fn marker_count(&self) -> usize {
        self.layers.iter().map(|l| l.markers.len()).sum()
    }

    /// Standalone HTML document for the map.
    pub fn to_html(&self) -> Result<String> {
        let data = serde_json::to_string(self).context("Failed to serialize marker map")?;
        // Keep the JSON from closing the surrounding <script> element.
        let data = data.replace("</", "<\\/");
        Ok(HTML_TEMPLATE.replace("{{MAP_DATA}}", &data))
    }

    pub fn save_html(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create output directory: {:?}", dir))?;
        }
        fs::write(path, self.to_html()?)
            .with_context(|| format!("Failed to write map: {:?}", path))?;
        info!("Wrote marker map with {} markers in {} layers to {:?}", self.marker_count(), self.layers.len(), path);
        Ok(())
    }
}

const HTML_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head>
  <meta charset="utf-8" />
  <meta name="viewport" content="width=device-width, initial-scale=1.0" />
  <link rel="stylesheet" href="https://cdn.jsdelivr.net/npm/leaflet@1.9.3/dist/leaflet.css" />
  <link rel="stylesheet" href="https://cdnjs.cloudflare.com/ajax/libs/Leaflet.awesome-markers/2.0.2/leaflet.awesome-markers.css" />
  <link rel="stylesheet" href="https://netdna.bootstrapcdn.com/bootstrap/3.0.0/css/bootstrap-glyphicons.css" />
  <link rel="stylesheet" href="https://cdnjs.cloudflare.com/ajax/libs/leaflet-minimap/3.6.1/Control.MiniMap.min.css" />
  <script src="https://cdn.jsdelivr.net/npm/leaflet@1.9.3/dist/leaflet.js"></script>
  <script src="https://cdnjs.cloudflare.com/ajax/libs/Leaflet.awesome-markers/2.0.2/leaflet.awesome-markers.js"></script>
  <script src="https://cdnjs.cloudflare.com/ajax/libs/leaflet-minimap/3.6.1/Control.MiniMap.min.js"></script>
  <style>
    html, body { width: 100%; height: 100%; margin: 0; padding: 0; }
    #map { position: absolute; top: 0; bottom: 0; left: 0; right: 0; }
  </style>
</head>
<body>
  <div id="map"></div>
  <script>
    const data = {{MAP_DATA}};
    const map = L.map('map', { center: data.center, zoom: data.zoom_start });
    const base = L.tileLayer(data.tiles.url, { attribution: data.tiles.attribution, maxZoom: 19 }).addTo(map);

    const overlays = {};
    for (const layer of data.layers) {
      const group = L.featureGroup();
      for (const m of layer.markers) {
        const popup = document.createElement('div');
        popup.textContent = m.popup;
        L.marker(m.location, {
          icon: L.AwesomeMarkers.icon({ icon: m.icon, markerColor: m.color, prefix: 'glyphicon' })
        }).bindPopup(popup).addTo(group);
      }
      group.addTo(map);
      overlays[layer.name] = group;
    }

    L.control.layers({ [data.tiles.name]: base }, overlays, {
      collapsed: data.layer_control.collapsed,
      autoZIndex: data.layer_control.auto_z_index
    }).addTo(map);

    if (data.minimap) {
      new L.Control.MiniMap(L.tileLayer(data.tiles.url, { attribution: data.tiles.attribution })).addTo(map);
    }

    map.fitBounds(data.bounds);
  </script>
</body>
</html>
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::palette::MARKER_PALETTE;
    use crate::types::{Diagnostic, PointFeature};

    fn sample() -> PointCollection {
        PointCollection::new(
            Crs::Wgs84,
            vec![
                PointFeature::new(-95.30, 29.70).with_attribute("race", "white"),
                PointFeature::new(-95.10, 29.75).with_attribute("race", "black"),
                PointFeature::new(-95.20, 29.60).with_attribute("race", "white"),
                PointFeature::new(-95.25, 29.90),
            ],
        )
    }

    #[test]
    fn bounds_and_center_follow_the_points() {
        let levels = vec![AttrValue::from("white"), AttrValue::from("black")];
        let map = MarkerMap::build(&sample(), "race", "Race", &levels, &MarkerMapOptions::default())
            .unwrap()
            .value;

        assert_eq!(map.bounds, [[29.60, -95.30], [29.90, -95.10]]);
        approx::assert_relative_eq!(map.center[0], 29.75, epsilon = 1e-12);
        approx::assert_relative_eq!(map.center[1], -95.20, epsilon = 1e-12);
        assert_eq!(map.zoom_start, 16);
        assert!(!map.layer_control.collapsed);
        assert!(map.minimap);
    }

    #[test]
    fn one_named_layer_per_level_in_given_order() {
        let levels = vec![AttrValue::from("white"), AttrValue::from("black"), AttrValue::from("asian")];
        let out = MarkerMap::build(&sample(), "race", "Race", &levels, &MarkerMapOptions::default()).unwrap();
        let map = out.value;

        assert!(out.diagnostics.is_empty());
        assert_eq!(map.layers.len(), 3);
        assert_eq!(map.layers[0].name, "Race 1");
        assert_eq!(map.layers[0].markers.len(), 2);
        assert_eq!(map.layers[0].color, MarkerColor::Red);
        assert_eq!(map.layers[1].markers.len(), 1);
        assert_eq!(map.layers[1].markers[0].location, [29.75, -95.10]);
        assert_eq!(map.layers[1].markers[0].popup, "black");
        // No asian points: layer exists but is empty.
        assert_eq!(map.layers[2].name, "Race 3");
        assert!(map.layers[2].markers.is_empty());
        assert_eq!(map.marker_count(), 3);
    }

    #[test]
    fn reordering_levels_changes_colors() {
        let a = vec![AttrValue::from("white"), AttrValue::from("black")];
        let b = vec![AttrValue::from("black"), AttrValue::from("white")];
        let opts = MarkerMapOptions::default();
        let map_a = MarkerMap::build(&sample(), "race", "Race", &a, &opts).unwrap().value;
        let map_b = MarkerMap::build(&sample(), "race", "Race", &b, &opts).unwrap().value;
        assert_eq!(map_a.layers[0].color, map_b.layers[0].color);
        assert_ne!(map_a.layers[0].level, map_b.layers[0].level);
    }

    #[test]
    fn twenty_levels_cycle_the_palette() {
        let features: Vec<PointFeature> = (0..20)
            .map(|i| PointFeature::new(i as f64 * 0.01, 0.0).with_attribute("n", i as f64))
            .collect();
        let points = PointCollection::new(Crs::Wgs84, features);
        let levels: Vec<AttrValue> = (0..20).map(|i| AttrValue::Number(i as f64)).collect();

        let out = MarkerMap::build(&points, "n", "Count", &levels, &MarkerMapOptions::default()).unwrap();
        assert_eq!(out.value.layers.len(), 20);
        assert_eq!(out.value.layers[19].color, MARKER_PALETTE[0]);
        assert_eq!(out.value.layers[19].name, "Count 20");
        assert_eq!(out.diagnostics, vec![Diagnostic::PaletteCycled { levels: 20, palette: 19 }]);
    }

    #[test]
    fn web_mercator_points_are_reprojected() {
        let mercator = sample().to_crs(Crs::WebMercator);
        let levels = vec![AttrValue::from("white")];
        let map = MarkerMap::build(&mercator, "race", "Race", &levels, &MarkerMapOptions::default())
            .unwrap()
            .value;
        approx::assert_relative_eq!(map.bounds[0][0], 29.60, epsilon = 1e-9);
        approx::assert_relative_eq!(map.bounds[0][1], -95.30, epsilon = 1e-9);
    }

    #[test]
    fn empty_or_broken_points_fail() {
        let levels = vec![AttrValue::from("white")];
        let opts = MarkerMapOptions::default();
        let empty = PointCollection::new(Crs::Wgs84, vec![]);
        assert!(MarkerMap::build(&empty, "race", "Race", &levels, &opts).is_err());

        let broken = PointCollection::new(Crs::Wgs84, vec![PointFeature::new(f64::NAN, 1.0)]);
        assert!(MarkerMap::build(&broken, "race", "Race", &levels, &opts).is_err());
    }

    #[test]
    fn html_embeds_the_map_and_escapes_script_tags() {
        let points = PointCollection::new(
            Crs::Wgs84,
            vec![PointFeature::new(-95.0, 29.0).with_attribute("label", "</script><b>x")],
        );
        let levels = vec![AttrValue::from("</script><b>x")];
        let map = MarkerMap::build(&points, "label", "Label", &levels, &MarkerMapOptions::default())
            .unwrap()
            .value;
        let html = map.to_html().unwrap();

        assert!(html.contains("\"name\":\"Label 1\""));
        assert!(html.contains("\"color\":\"red\""));
        assert!(html.contains("\"collapsed\":false"));
        assert!(html.contains("L.Control.MiniMap"));
        assert!(!html.contains("</script><b>"));
        assert_eq!(html.matches("</script>").count(), 4);
    }

    #[test]
    fn save_html_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("maps").join("block.html");
        let levels = vec![AttrValue::from("white")];
        let map = MarkerMap::build(&sample(), "race", "Race", &levels, &MarkerMapOptions::default())
            .unwrap()
            .value;
        map.save_html(&path).unwrap();
        let html = fs::read_to_string(&path).unwrap();
        assert!(html.starts_with("<!DOCTYPE html>"));
        assert!(html.contains("fitBounds"));
    }
}
