use anyhow::{anyhow, bail, Result};
use geo::{Coord, Point, Rect};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::projection;

pub const X_COLUMN: &str = "x";
pub const Y_COLUMN: &str = "y";
/// Normalized census block id column.
pub const BLOCK_COLUMN: &str = "Block2010";
/// Numeric block id column used to derive `Block2010` when it is missing.
pub const RAW_BLOCK_COLUMN: &str = "blockid";

pub const BLOCK_ID_WIDTH: usize = 15;

/// A single cell of a table or a feature property.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum AttrValue {
    Number(f64),
    Text(String),
}

impl AttrValue {
    /// Parse a raw CSV field. Empty fields and NaN are null.
    pub fn parse(raw: &str) -> Option<AttrValue> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        match raw.parse::<f64>() {
            Ok(v) if v.is_nan() => None,
            Ok(v) => Some(AttrValue::Number(v)),
            Err(_) => Some(AttrValue::Text(raw.to_string())),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttrValue::Number(v) => Some(*v),
            AttrValue::Text(_) => None,
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Number(v) if v.fract() == 0.0 && v.abs() < 1e15 => write!(f, "{}", *v as i64),
            AttrValue::Number(v) => write!(f, "{}", v),
            AttrValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<f64> for AttrValue {
    fn from(v: f64) -> Self {
        AttrValue::Number(v)
    }
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        AttrValue::Text(s.to_string())
    }
}

// Numbers sort before text so mixed columns still have a total order.
// Numbers compare by value (-0 equals 0); NaN falls back to `total_cmp`.
impl Ord for AttrValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (AttrValue::Number(a), AttrValue::Number(b)) => {
                a.partial_cmp(b).unwrap_or_else(|| a.total_cmp(b))
            }
            (AttrValue::Number(_), AttrValue::Text(_)) => Ordering::Less,
            (AttrValue::Text(_), AttrValue::Number(_)) => Ordering::Greater,
            (AttrValue::Text(a), AttrValue::Text(b)) => a.cmp(b),
        }
    }
}

impl PartialOrd for AttrValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for AttrValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for AttrValue {}

/// 15 digit, zero padded census block identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct BlockId(String);

impl BlockId {
    /// True if `raw` is already in normalized form.
    pub fn is_normalized(raw: &str) -> bool {
        raw.len() == BLOCK_ID_WIDTH && raw.bytes().all(|b| b.is_ascii_digit())
    }

    /// Normalize a raw block id: truncate to an integer, then left pad with
    /// zeros to 15 characters.
    pub fn from_raw(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            bail!("block id is empty");
        }

        let digits = if raw.bytes().all(|b| b.is_ascii_digit()) {
            let trimmed = raw.trim_start_matches('0');
            if trimmed.is_empty() { "0".to_string() } else { trimmed.to_string() }
        } else {
            let value: f64 = raw
                .parse()
                .map_err(|_| anyhow!("block id '{}' is not numeric", raw))?;
            if !value.is_finite() || value < 0.0 {
                bail!("block id '{}' is not a non-negative number", raw);
            }
            let value = value.trunc();
            if value >= 1e15 {
                bail!("block id '{}' has more than {} digits", raw, BLOCK_ID_WIDTH);
            }
            format!("{:.0}", value)
        };

        if digits.len() > BLOCK_ID_WIDTH {
            bail!("block id '{}' has more than {} digits", raw, BLOCK_ID_WIDTH);
        }
        Ok(BlockId(format!("{:0>width$}", digits, width = BLOCK_ID_WIDTH)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for BlockId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        BlockId::from_raw(s)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct HousingUnit {
    pub x: Option<f64>,
    pub y: Option<f64>,
    /// `None` when the `Block2010` cell was blank.
    pub block_id: Option<BlockId>,
    // Remaining columns; null cells are absent.
    pub attributes: BTreeMap<String, AttrValue>,
}

impl HousingUnit {
    /// Look up any column by name, including the coordinate and block columns.
    pub fn value(&self, column: &str) -> Option<AttrValue> {
        match column {
            X_COLUMN => self.x.map(AttrValue::Number),
            Y_COLUMN => self.y.map(AttrValue::Number),
            BLOCK_COLUMN => self.block_id.as_ref().map(|id| AttrValue::Text(id.to_string())),
            _ => self.attributes.get(column).cloned(),
        }
    }
}

/// Housing unit rows with a guaranteed normalized `Block2010` column.
#[derive(Debug, Clone, Default)]
pub struct HousingUnitTable {
    pub columns: Vec<String>,
    pub units: Vec<HousingUnit>,
}

impl HousingUnitTable {
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

/// Coordinate reference systems the renderers understand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Crs {
    /// EPSG:4326, lon/lat degrees
    Wgs84,
    /// EPSG:3857, metres
    WebMercator,
}

impl Crs {
    pub fn from_epsg(code: u32) -> Result<Self> {
        match code {
            4326 => Ok(Crs::Wgs84),
            3857 => Ok(Crs::WebMercator),
            other => Err(anyhow!("Unsupported projection: EPSG:{}", other)),
        }
    }

    pub fn epsg(&self) -> u32 {
        match self {
            Crs::Wgs84 => 4326,
            Crs::WebMercator => 3857,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PointFeature {
    pub point: Point<f64>,
    pub attributes: BTreeMap<String, AttrValue>,
}

impl PointFeature {
    pub fn new(x: f64, y: f64) -> Self {
        Self {
            point: Point::new(x, y),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, name: &str, value: impl Into<AttrValue>) -> Self {
        self.attributes.insert(name.to_string(), value.into());
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&AttrValue> {
        self.attributes.get(name)
    }
}

#[derive(Debug, Clone)]
pub struct PointCollection {
    pub crs: Crs,
    pub features: Vec<PointFeature>,
}

impl PointCollection {
    pub fn new(crs: Crs, features: Vec<PointFeature>) -> Self {
        Self { crs, features }
    }

    /// Build WGS84 points from the x/y columns of a housing unit table.
    /// Every row must have both coordinates.
    pub fn from_housing_units(table: &HousingUnitTable) -> Result<Self> {
        let mut features = Vec::with_capacity(table.len());
        for (row, unit) in table.units.iter().enumerate() {
            let (x, y) = match (unit.x, unit.y) {
                (Some(x), Some(y)) => (x, y),
                _ => bail!("Row {} has no x/y coordinates", row + 1),
            };
            let mut feature = PointFeature::new(x, y);
            feature.attributes = unit.attributes.clone();
            if let Some(block_id) = &unit.block_id {
                feature
                    .attributes
                    .insert(BLOCK_COLUMN.to_string(), AttrValue::Text(block_id.to_string()));
            }
            features.push(feature);
        }
        Ok(Self::new(Crs::Wgs84, features))
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Min/max extent of all points. Fails on an empty collection or a
    /// non-finite coordinate.
    pub fn bounds(&self) -> Result<Rect<f64>> {
        let mut min = Coord { x: f64::INFINITY, y: f64::INFINITY };
        let mut max = Coord { x: f64::NEG_INFINITY, y: f64::NEG_INFINITY };

        for (i, feature) in self.features.iter().enumerate() {
            let (x, y) = (feature.point.x(), feature.point.y());
            if !x.is_finite() || !y.is_finite() {
                bail!("Point {} has a missing or non-finite coordinate ({}, {})", i + 1, x, y);
            }
            min.x = min.x.min(x);
            min.y = min.y.min(y);
            max.x = max.x.max(x);
            max.y = max.y.max(y);
        }

        if self.is_empty() {
            bail!("Cannot compute the extent of an empty point collection");
        }
        Ok(Rect::new(min, max))
    }

    pub fn to_crs(&self, target: Crs) -> PointCollection {
        if self.crs == target {
            return self.clone();
        }
        let convert: fn(Coord<f64>) -> Coord<f64> = match target {
            Crs::WebMercator => projection::lonlat_to_mercator,
            Crs::Wgs84 => projection::mercator_to_lonlat,
        };
        let features = self
            .features
            .iter()
            .map(|f| PointFeature {
                point: Point::from(convert(f.point.0)),
                attributes: f.attributes.clone(),
            })
            .collect();
        PointCollection::new(target, features)
    }
}

/// A recoverable problem that was fixed up and reported instead of failing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    BlockIdDerived { from_column: String },
    BlockIdCoerced { rows: usize },
    PaletteCycled { levels: usize, palette: usize },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::BlockIdDerived { from_column } => {
                write!(f, "Adding {} from {}", BLOCK_COLUMN, from_column)
            }
            Diagnostic::BlockIdCoerced { rows } => {
                write!(f, "Converting {} to string ({} rows changed)", BLOCK_COLUMN, rows)
            }
            Diagnostic::PaletteCycled { levels, palette } => write!(
                f,
                "Color levels = {} is larger than color list ({}), reusing colors",
                levels, palette
            ),
        }
    }
}

/// Primary output plus the diagnostics raised while producing it.
#[derive(Debug, Clone)]
pub struct WithDiagnostics<T> {
    pub value: T,
    pub diagnostics: Vec<Diagnostic>,
}

impl<T> WithDiagnostics<T> {
    pub fn new(value: T) -> Self {
        Self { value, diagnostics: Vec::new() }
    }

    pub fn warn(&mut self, diagnostic: Diagnostic) {
        tracing::warn!("{}", diagnostic);
        self.diagnostics.push(diagnostic);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_id_pads_short_numbers() {
        let id = BlockId::from_raw("482011000001").unwrap();
        assert_eq!(id.as_str(), "000482011000001");
    }

    #[test]
    fn block_id_truncates_float_renderings() {
        assert_eq!(BlockId::from_raw("4.82011000001e14").unwrap().as_str(), "482011000001000");
        assert_eq!(BlockId::from_raw("1234.9").unwrap().as_str(), "000000000001234");
    }

    #[test]
    fn block_id_normalization_is_idempotent() {
        let once = BlockId::from_raw("48201100000100").unwrap();
        let twice = BlockId::from_raw(once.as_str()).unwrap();
        assert_eq!(once, twice);
        assert!(BlockId::is_normalized(twice.as_str()));
    }

    #[test]
    fn block_id_rejects_bad_input() {
        assert!(BlockId::from_raw("").is_err());
        assert!(BlockId::from_raw("-5").is_err());
        assert!(BlockId::from_raw("abc").is_err());
        assert!(BlockId::from_raw("1234567890123456").is_err());
    }

    #[test]
    fn attr_values_order_numbers_before_text() {
        let mut values = vec![AttrValue::from("b"), AttrValue::from(2.0), AttrValue::from("a"), AttrValue::from(-1.0)];
        values.sort();
        let rendered: Vec<String> = values.iter().map(|v| v.to_string()).collect();
        assert_eq!(rendered, vec!["-1", "2", "a", "b"]);
    }

    #[test]
    fn attr_value_parse_treats_blank_and_nan_as_null() {
        assert!(AttrValue::parse("").is_none());
        assert!(AttrValue::parse("  ").is_none());
        assert!(AttrValue::parse("NaN").is_none());
        assert_eq!(AttrValue::parse("3"), Some(AttrValue::Number(3.0)));
        assert_eq!(AttrValue::parse("HU-1"), Some(AttrValue::Text("HU-1".into())));
    }

    #[test]
    fn signed_zero_is_one_value() {
        assert_eq!(AttrValue::parse("-0"), AttrValue::parse("0.0"));
        assert_eq!(AttrValue::Number(-0.0).cmp(&AttrValue::Number(0.0)), Ordering::Equal);
        assert!(AttrValue::Number(-0.5) < AttrValue::Number(0.0));
        assert_eq!(AttrValue::Number(-0.0).to_string(), "0");
    }

    #[test]
    fn bounds_fail_on_empty_and_non_finite() {
        assert!(PointCollection::new(Crs::Wgs84, vec![]).bounds().is_err());
        let points = PointCollection::new(Crs::Wgs84, vec![PointFeature::new(0.0, f64::NAN)]);
        assert!(points.bounds().is_err());
    }

    #[test]
    fn housing_units_become_wgs84_points() {
        let table = crate::data::read_housing_units("huid,blockid,x,y\nHU1,12,-95.1,29.7\n".as_bytes())
            .unwrap()
            .value;
        let points = PointCollection::from_housing_units(&table).unwrap();
        assert_eq!(points.crs, Crs::Wgs84);
        assert_eq!(points.features[0].point, Point::new(-95.1, 29.7));
        assert_eq!(points.features[0].attribute("huid"), Some(&AttrValue::from("HU1")));
        assert_eq!(
            points.features[0].attribute(BLOCK_COLUMN),
            Some(&AttrValue::from("000000000000012"))
        );

        let missing = crate::data::read_housing_units("huid,blockid,x,y\nHU1,12,,29.7\n".as_bytes())
            .unwrap()
            .value;
        assert!(PointCollection::from_housing_units(&missing).is_err());
    }

    #[test]
    fn reprojection_round_trips() {
        let points = PointCollection::new(Crs::Wgs84, vec![PointFeature::new(-95.1, 29.7).with_attribute("n", 1.0)]);
        let there = points.to_crs(Crs::WebMercator);
        assert_eq!(there.crs, Crs::WebMercator);
        assert!(there.features[0].point.x() < -1.0e7);
        let back = there.to_crs(Crs::Wgs84);
        approx::assert_relative_eq!(back.features[0].point.x(), -95.1, epsilon = 1e-9);
        approx::assert_relative_eq!(back.features[0].point.y(), 29.7, epsilon = 1e-9);
        assert_eq!(back.features[0].attribute("n"), Some(&AttrValue::Number(1.0)));
    }

    #[test]
    fn unsupported_epsg_is_an_error() {
        assert_eq!(Crs::from_epsg(4326).unwrap(), Crs::Wgs84);
        assert!(Crs::from_epsg(2277).is_err());
    }
}
