use geo::Coord;
use std::f64::consts::PI;

// Spherical Web Mercator (EPSG:3857)
pub const EARTH_RADIUS: f64 = 6_378_137.0;
pub const MAX_LATITUDE: f64 = 85.051_128_779_806_59;
/// Half the width of the projected world, in metres.
pub const ORIGIN_SHIFT: f64 = PI * EARTH_RADIUS;
pub const TILE_SIZE: u32 = 256;

pub fn lonlat_to_mercator(c: Coord<f64>) -> Coord<f64> {
    let lat = c.y.clamp(-MAX_LATITUDE, MAX_LATITUDE).to_radians();
    Coord {
        x: c.x.to_radians() * EARTH_RADIUS,
        y: (PI / 4.0 + lat / 2.0).tan().ln() * EARTH_RADIUS,
    }
}

pub fn mercator_to_lonlat(c: Coord<f64>) -> Coord<f64> {
    Coord {
        x: (c.x / EARTH_RADIUS).to_degrees(),
        y: (2.0 * (c.y / EARTH_RADIUS).exp().atan() - PI / 2.0).to_degrees(),
    }
}

/// Width of one tile at `zoom`, in metres.
pub fn tile_span(zoom: u8) -> f64 {
    2.0 * ORIGIN_SHIFT / 2.0_f64.powi(zoom as i32)
}

/// Fractional tile coordinates of a mercator point. Tile y grows southwards.
pub fn mercator_to_tile(c: Coord<f64>, zoom: u8) -> (f64, f64) {
    let span = tile_span(zoom);
    ((c.x + ORIGIN_SHIFT) / span, (ORIGIN_SHIFT - c.y) / span)
}

/// Largest zoom at which `extent_width` metres take no more than
/// `pixels` tile pixels.
pub fn zoom_for_extent(extent_width: f64, pixels: u32, max_zoom: u8) -> u8 {
    if extent_width <= 0.0 || !extent_width.is_finite() {
        return max_zoom;
    }
    let world_pixels = pixels as f64 * (2.0 * ORIGIN_SHIFT) / extent_width;
    let zoom = (world_pixels / TILE_SIZE as f64).log2().floor();
    zoom.clamp(0.0, max_zoom as f64) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn mercator_round_trip() {
        let c = Coord { x: -95.3698, y: 29.7604 };
        let back = mercator_to_lonlat(lonlat_to_mercator(c));
        assert_relative_eq!(back.x, c.x, epsilon = 1e-9);
        assert_relative_eq!(back.y, c.y, epsilon = 1e-9);
    }

    #[test]
    fn mercator_known_values() {
        let origin = lonlat_to_mercator(Coord { x: 0.0, y: 0.0 });
        assert_relative_eq!(origin.x, 0.0, epsilon = 1e-9);
        assert_relative_eq!(origin.y, 0.0, epsilon = 1e-9);

        let east = lonlat_to_mercator(Coord { x: 180.0, y: 0.0 });
        assert_relative_eq!(east.x, ORIGIN_SHIFT, epsilon = 1e-6);

        let north = lonlat_to_mercator(Coord { x: 0.0, y: 89.0 });
        assert_relative_eq!(north.y, ORIGIN_SHIFT, epsilon = 1e-3);
    }

    #[test]
    fn tile_coordinates_match_slippy_map_numbering() {
        let c = lonlat_to_mercator(Coord { x: 0.0, y: 0.0 });
        let (tx, ty) = mercator_to_tile(c, 1);
        assert_relative_eq!(tx, 1.0, epsilon = 1e-9);
        assert_relative_eq!(ty, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn zoom_for_extent_matches_pixel_density() {
        // Whole world in 256 px is zoom 0; in 1024 px it is zoom 2.
        assert_eq!(zoom_for_extent(2.0 * ORIGIN_SHIFT, 256, 18), 0);
        assert_eq!(zoom_for_extent(2.0 * ORIGIN_SHIFT, 1024, 18), 2);
        assert_eq!(zoom_for_extent(1.0, 1000, 18), 18);
        assert_eq!(zoom_for_extent(0.0, 1000, 17), 17);
    }
}
