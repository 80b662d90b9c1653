use crate::types::{Diagnostic, WithDiagnostics};
use image::Rgba;
use serde::Serialize;

/// Marker colors understood by Leaflet.awesome-markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkerColor {
    Red,
    Blue,
    Green,
    Purple,
    Orange,
    DarkRed,
    LightRed,
    Beige,
    DarkBlue,
    DarkGreen,
    CadetBlue,
    DarkPurple,
    White,
    Pink,
    LightBlue,
    LightGreen,
    Gray,
    Black,
    LightGray,
}

pub const MARKER_PALETTE: [MarkerColor; 19] = [
    MarkerColor::Red,
    MarkerColor::Blue,
    MarkerColor::Green,
    MarkerColor::Purple,
    MarkerColor::Orange,
    MarkerColor::DarkRed,
    MarkerColor::LightRed,
    MarkerColor::Beige,
    MarkerColor::DarkBlue,
    MarkerColor::DarkGreen,
    MarkerColor::CadetBlue,
    MarkerColor::DarkPurple,
    MarkerColor::White,
    MarkerColor::Pink,
    MarkerColor::LightBlue,
    MarkerColor::LightGreen,
    MarkerColor::Gray,
    MarkerColor::Black,
    MarkerColor::LightGray,
];

impl MarkerColor {
    pub fn name(&self) -> &'static str {
        match self {
            MarkerColor::Red => "red",
            MarkerColor::Blue => "blue",
            MarkerColor::Green => "green",
            MarkerColor::Purple => "purple",
            MarkerColor::Orange => "orange",
            MarkerColor::DarkRed => "darkred",
            MarkerColor::LightRed => "lightred",
            MarkerColor::Beige => "beige",
            MarkerColor::DarkBlue => "darkblue",
            MarkerColor::DarkGreen => "darkgreen",
            MarkerColor::CadetBlue => "cadetblue",
            MarkerColor::DarkPurple => "darkpurple",
            MarkerColor::White => "white",
            MarkerColor::Pink => "pink",
            MarkerColor::LightBlue => "lightblue",
            MarkerColor::LightGreen => "lightgreen",
            MarkerColor::Gray => "gray",
            MarkerColor::Black => "black",
            MarkerColor::LightGray => "lightgray",
        }
    }
}

/// Color for each of `levels` category levels, by position. The palette is
/// reused cyclically when there are more levels than colors.
pub fn assign_marker_colors(levels: usize) -> WithDiagnostics<Vec<MarkerColor>> {
    let colors = (0..levels)
        .map(|i| MARKER_PALETTE[i % MARKER_PALETTE.len()])
        .collect();
    let mut out = WithDiagnostics::new(colors);
    if levels > MARKER_PALETTE.len() {
        out.warn(Diagnostic::PaletteCycled {
            levels,
            palette: MARKER_PALETTE.len(),
        });
    }
    out
}

// Qualitative palette for categorical dot maps (matplotlib tab10)
const CATEGORY_HEX: [&str; 10] = [
    "#1f77b4", "#ff7f0e", "#2ca02c", "#d62728", "#9467bd",
    "#8c564b", "#e377c2", "#7f7f7f", "#bcbd22", "#17becf",
];

// Viridis, sampled at five evenly spaced stops
const RAMP_HEX: [&str; 5] = ["#440154", "#3b528b", "#21918c", "#5ec962", "#fde725"];

pub fn category_color(index: usize) -> Rgba<u8> {
    hex_to_rgba(CATEGORY_HEX[index % CATEGORY_HEX.len()])
}

pub fn ramp_stops() -> Vec<Rgba<u8>> {
    RAMP_HEX.iter().map(|h| hex_to_rgba(h)).collect()
}

/// Linear interpolation along the continuous ramp, `t` in [0, 1].
pub fn ramp_color(t: f64) -> Rgba<u8> {
    let stops = ramp_stops();
    let t = if t.is_finite() { t.clamp(0.0, 1.0) } else { 0.0 };
    let scaled = t * (stops.len() - 1) as f64;
    let i = (scaled.floor() as usize).min(stops.len() - 2);
    let f = scaled - i as f64;
    let (a, b) = (stops[i], stops[i + 1]);
    let mix = |c0: u8, c1: u8| (c0 as f64 + (c1 as f64 - c0 as f64) * f).round() as u8;
    Rgba([mix(a[0], b[0]), mix(a[1], b[1]), mix(a[2], b[2]), 255])
}

pub fn hex_to_rgba(hex: &str) -> Rgba<u8> {
    let hex = hex.trim_start_matches('#');
    let channel = |range: std::ops::Range<usize>| {
        hex.get(range)
            .and_then(|h| u8::from_str_radix(h, 16).ok())
            .unwrap_or(0)
    };
    Rgba([channel(0..2), channel(2..4), channel(4..6), 255])
}
