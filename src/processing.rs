use crate::marker_map::{MarkerMap, MarkerMapOptions};
use crate::types::{
    AttrValue, BlockId, Crs, HousingUnitTable, PointCollection, PointFeature, WithDiagnostics,
    X_COLUMN, Y_COLUMN,
};
use anyhow::{Context, Result, anyhow, bail};
use std::collections::{BTreeMap, BTreeSet};
use tracing::info;

/// Count of non-null target values for one unique combination of the
/// grouping columns.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupCount {
    pub key: Vec<(String, AttrValue)>,
    pub count: usize,
}

impl GroupCount {
    pub fn get(&self, column: &str) -> Option<&AttrValue> {
        self.key.iter().find(|(name, _)| name == column).map(|(_, v)| v)
    }

    /// WGS84 point at the group's x/y, carrying the count as `target`.
    pub fn to_point_feature(&self, target: &str) -> Result<PointFeature> {
        let coord = |column: &str| {
            self.get(column)
                .and_then(AttrValue::as_f64)
                .ok_or_else(|| anyhow!("Group has no numeric '{}' column", column))
        };
        Ok(PointFeature::new(coord(X_COLUMN)?, coord(Y_COLUMN)?)
            .with_attribute(target, self.count as f64))
    }
}

/// Group housing units by `group_by` and count non-null `target` values.
///
/// When `block` is set only units in that census block are counted. Rows
/// with a null grouping value are dropped. Groups come back sorted by key.
pub fn count_by_location(
    table: &HousingUnitTable,
    block: Option<&BlockId>,
    group_by: &[String],
    target: &str,
) -> Result<Vec<GroupCount>> {
    if group_by.is_empty() {
        bail!("At least one grouping column is required");
    }
    for column in group_by.iter().map(String::as_str).chain(std::iter::once(target)) {
        if !table.has_column(column) {
            bail!("Column '{}' not found in housing unit table", column);
        }
    }

    let mut groups: BTreeMap<Vec<AttrValue>, usize> = BTreeMap::new();
    let mut selected = 0;

    for unit in &table.units {
        if block.is_some() && unit.block_id.as_ref() != block {
            continue;
        }
        selected += 1;

        let key: Option<Vec<AttrValue>> = group_by.iter().map(|c| unit.value(c)).collect();
        let Some(key) = key else { continue };

        let count = groups.entry(key).or_insert(0);
        if unit.value(target).is_some() {
            *count += 1;
        }
    }

    info!("Counted '{}' over {} housing units into {} groups", target, selected, groups.len());

    Ok(groups
        .into_iter()
        .map(|(values, count)| GroupCount {
            key: group_by.iter().cloned().zip(values).collect(),
            count,
        })
        .collect())
}

/// Distinct non-null values of `attribute`, in order of first appearance.
///
/// Values are the same level when they compare equal, which is also how
/// markers are matched to layers.
pub fn unique_levels(features: &[PointFeature], attribute: &str) -> Vec<AttrValue> {
    let mut seen = BTreeSet::new();
    let mut levels = Vec::new();
    for value in features.iter().filter_map(|f| f.attribute(attribute)) {
        if seen.insert(value) {
            levels.push(value.clone());
        }
    }
    levels
}

/// Map building-level counts of `target` inside one census block, one
/// layer per distinct count.
pub fn map_selected_block(
    table: &HousingUnitTable,
    block: &BlockId,
    target: &str,
    layer_name: &str,
    options: &MarkerMapOptions,
) -> Result<WithDiagnostics<MarkerMap>> {
    let group_by = [X_COLUMN.to_string(), Y_COLUMN.to_string()];
    let counts = count_by_location(table, Some(block), &group_by, target)?;

    let features = counts
        .iter()
        .map(|c| c.to_point_feature(target))
        .collect::<Result<Vec<_>>>()?;
    let levels = unique_levels(&features, target);
    let points = PointCollection::new(Crs::Wgs84, features);

    MarkerMap::build(&points, target, layer_name, &levels, options)
        .with_context(|| format!("Failed to map block {}", block))
}
