use crate::processing::GroupCount;
use crate::types::{
    AttrValue, BlockId, Crs, Diagnostic, HousingUnit, HousingUnitTable, PointCollection,
    PointFeature, WithDiagnostics, BLOCK_COLUMN, RAW_BLOCK_COLUMN, X_COLUMN, Y_COLUMN,
};
use anyhow::{Context, Result, anyhow, bail};
use csv::{ReaderBuilder, Writer};
use shapefile::Reader;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;
use tracing::info;

enum BlockSource {
    Normalized(usize),
    Derived(usize),
}

pub fn load_housing_units(path: &Path) -> Result<WithDiagnostics<HousingUnitTable>> {
    info!("Loading housing units from {:?}...", path);
    let file = File::open(path)
        .with_context(|| format!("Failed to open CSV file: {:?}", path))?;
    let table = read_housing_units(BufReader::new(file))
        .with_context(|| format!("Failed to read housing units from {:?}", path))?;
    info!("Loaded {} housing units", table.value.len());
    Ok(table)
}

/// Read a housing unit table and normalize its block id column.
pub fn read_housing_units<R: Read>(reader: R) -> Result<WithDiagnostics<HousingUnitTable>> {
    let mut rdr = ReaderBuilder::new().from_reader(reader);
    let headers = rdr.headers()?.clone();
    let position = |name: &str| headers.iter().position(|h| h == name);

    let x_idx = position(X_COLUMN);
    let y_idx = position(Y_COLUMN);
    let mut columns: Vec<String> = headers.iter().map(|h| h.to_string()).collect();

    let mut out = WithDiagnostics::new(HousingUnitTable::default());

    let block_source = match (position(BLOCK_COLUMN), position(RAW_BLOCK_COLUMN)) {
        (Some(idx), _) => BlockSource::Normalized(idx),
        (None, Some(idx)) => {
            out.warn(Diagnostic::BlockIdDerived { from_column: RAW_BLOCK_COLUMN.to_string() });
            columns.push(BLOCK_COLUMN.to_string());
            BlockSource::Derived(idx)
        }
        (None, None) => bail!(
            "Neither '{}' nor '{}' column found in housing unit table",
            BLOCK_COLUMN,
            RAW_BLOCK_COLUMN
        ),
    };

    let mut coerced = 0;
    let mut units = Vec::new();

    for (i, result) in rdr.records().enumerate() {
        let record = result?;
        let row = i + 1;

        let block_id = match block_source {
            BlockSource::Normalized(idx) => {
                let raw = record.get(idx).unwrap_or("").trim();
                if raw.is_empty() {
                    // Kept without a block; only a block filter excludes it.
                    None
                } else {
                    if !BlockId::is_normalized(raw) {
                        coerced += 1;
                    }
                    let id = BlockId::from_raw(raw)
                        .with_context(|| format!("Invalid {} in row {}", BLOCK_COLUMN, row))?;
                    Some(id)
                }
            }
            BlockSource::Derived(idx) => Some(
                BlockId::from_raw(record.get(idx).unwrap_or(""))
                    .with_context(|| format!("Invalid {} in row {}", RAW_BLOCK_COLUMN, row))?,
            ),
        };

        let x = parse_coordinate(&record, x_idx, X_COLUMN, row)?;
        let y = parse_coordinate(&record, y_idx, Y_COLUMN, row)?;

        let mut attributes = BTreeMap::new();
        for (name, field) in headers.iter().zip(record.iter()) {
            if name == X_COLUMN || name == Y_COLUMN || name == BLOCK_COLUMN {
                continue;
            }
            if let Some(value) = AttrValue::parse(field) {
                attributes.insert(name.to_string(), value);
            }
        }

        units.push(HousingUnit { x, y, block_id, attributes });
    }

    if coerced > 0 {
        out.warn(Diagnostic::BlockIdCoerced { rows: coerced });
    }

    out.value = HousingUnitTable { columns, units };
    Ok(out)
}

fn parse_coordinate(
    record: &csv::StringRecord,
    idx: Option<usize>,
    column: &str,
    row: usize,
) -> Result<Option<f64>> {
    let raw = match idx.and_then(|i| record.get(i)).map(str::trim) {
        Some(raw) if !raw.is_empty() => raw,
        _ => return Ok(None),
    };
    let value: f64 = raw
        .parse()
        .map_err(|_| anyhow!("Column '{}' in row {} is not numeric: '{}'", column, row, raw))?;
    Ok(if value.is_nan() { None } else { Some(value) })
}

/// Load a point collection from a CSV (x/y columns), GeoJSON or Shapefile.
pub fn load_points(path: &Path, epsg: u32) -> Result<PointCollection> {
    let crs = Crs::from_epsg(epsg)?;

    let extension = path.extension()
        .and_then(|e| e.to_str())
        .map(|s: &str| s.to_lowercase())
        .ok_or_else(|| anyhow!("Input point file has no extension"))?;

    let features = match extension.as_str() {
        "csv" => load_csv_points(path)?,
        "shp" => load_shapefile_points(path)?,
        "json" | "geojson" => load_geojson_points(path)?,
        _ => return Err(anyhow!("Unsupported geometry format: {}", extension)),
    };

    info!("Loaded {} points from {:?} (EPSG:{})", features.len(), path, crs.epsg());
    Ok(PointCollection::new(crs, features))
}

fn load_csv_points(path: &Path) -> Result<Vec<PointFeature>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open CSV file: {:?}", path))?;
    read_csv_points(BufReader::new(file))
        .with_context(|| format!("Failed to read points from {:?}", path))
}

pub fn read_csv_points<R: Read>(reader: R) -> Result<Vec<PointFeature>> {
    let mut rdr = ReaderBuilder::new().from_reader(reader);
    let headers = rdr.headers()?.clone();
    let x_idx = headers.iter().position(|h| h == X_COLUMN)
        .ok_or_else(|| anyhow!("Column '{}' not found in CSV", X_COLUMN))?;
    let y_idx = headers.iter().position(|h| h == Y_COLUMN)
        .ok_or_else(|| anyhow!("Column '{}' not found in CSV", Y_COLUMN))?;

    let mut features = Vec::new();
    for (i, result) in rdr.records().enumerate() {
        let record = result?;
        let row = i + 1;
        let x = parse_coordinate(&record, Some(x_idx), X_COLUMN, row)?;
        let y = parse_coordinate(&record, Some(y_idx), Y_COLUMN, row)?;
        let (x, y) = match (x, y) {
            (Some(x), Some(y)) => (x, y),
            _ => bail!("Row {} has no x/y coordinates", row),
        };

        let mut feature = PointFeature::new(x, y);
        for (idx, (name, field)) in headers.iter().zip(record.iter()).enumerate() {
            if idx == x_idx || idx == y_idx {
                continue;
            }
            if let Some(value) = AttrValue::parse(field) {
                feature.attributes.insert(name.to_string(), value);
            }
        }
        features.push(feature);
    }
    Ok(features)
}

fn load_shapefile_points(path: &Path) -> Result<Vec<PointFeature>> {
    use shapefile::dbase::FieldValue;

    let mut reader = Reader::from_path(path)
        .with_context(|| format!("Failed to open Shapefile: {:?}", path))?;

    let mut features = Vec::new();

    for result in reader.iter_shapes_and_records() {
        let (shape, record) = result?;

        let mut feature = match shape {
            shapefile::Shape::Point(p) => PointFeature::new(p.x, p.y),
            shapefile::Shape::PointM(p) => PointFeature::new(p.x, p.y),
            shapefile::Shape::PointZ(p) => PointFeature::new(p.x, p.y),
            _ => continue, // Skip non-point shapes
        };

        let fields: HashMap<String, FieldValue> = record.into();
        for (name, field) in fields {
            let value = match field {
                FieldValue::Character(Some(s)) => AttrValue::parse(&s),
                FieldValue::Numeric(Some(n)) => Some(AttrValue::Number(n)),
                FieldValue::Float(Some(f)) => Some(AttrValue::Number(f as f64)),
                FieldValue::Integer(i) => Some(AttrValue::Number(i as f64)),
                FieldValue::Double(d) => Some(AttrValue::Number(d)),
                FieldValue::Logical(Some(b)) => Some(AttrValue::Text(b.to_string())),
                _ => None,
            };
            if let Some(value) = value {
                feature.attributes.insert(name, value);
            }
        }
        features.push(feature);
    }

    Ok(features)
}

fn load_geojson_points(path: &Path) -> Result<Vec<PointFeature>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open GeoJSON file: {:?}", path))?;
    read_geojson_points(BufReader::new(file))
        .with_context(|| format!("Failed to read points from {:?}", path))
}

pub fn read_geojson_points<R: Read>(reader: R) -> Result<Vec<PointFeature>> {
    use geojson::{GeoJson, Value};

    let geojson = GeoJson::from_reader(reader).context("Failed to parse GeoJSON")?;

    let collection = match geojson {
        GeoJson::FeatureCollection(fc) => fc,
        _ => return Err(anyhow!("GeoJSON must be a FeatureCollection")),
    };

    let mut features = Vec::new();

    for feature in collection.features {
        let mut point = match feature.geometry.map(|g| g.value) {
            Some(Value::Point(coords)) if coords.len() >= 2 => PointFeature::new(coords[0], coords[1]),
            Some(Value::Point(_)) => bail!("GeoJSON point has fewer than two coordinates"),
            _ => continue, // Skip lines, polygons and null geometries
        };

        if let Some(props) = feature.properties {
            for (name, value) in props {
                let value = match value {
                    serde_json::Value::String(s) => AttrValue::parse(&s),
                    serde_json::Value::Number(n) => n.as_f64().map(AttrValue::Number),
                    serde_json::Value::Bool(b) => Some(AttrValue::Text(b.to_string())),
                    _ => None,
                };
                if let Some(value) = value {
                    point.attributes.insert(name, value);
                }
            }
        }
        features.push(point);
    }

    Ok(features)
}

/// Write group counts as CSV: the grouping columns, then `target`.
pub fn write_counts<W: Write>(
    counts: &[GroupCount],
    group_by: &[String],
    target: &str,
    writer: W,
) -> Result<()> {
    let mut wtr = Writer::from_writer(writer);
    let mut header: Vec<&str> = group_by.iter().map(String::as_str).collect();
    header.push(target);
    wtr.write_record(&header)?;

    for group in counts {
        let mut row: Vec<String> = group_by
            .iter()
            .map(|c| group.get(c).map(|v| v.to_string()).unwrap_or_default())
            .collect();
        row.push(group.count.to_string());
        wtr.write_record(&row)?;
    }
    wtr.flush()?;
    Ok(())
}
