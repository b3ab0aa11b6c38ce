//! Bounding boxes of GeoJSON region files.
use crate::catalog::BoundingBox;
use anyhow::{anyhow, Context, Result};
use geojson::GeoJson;
use serde_json::Value;
use std::fs;
use std::path::Path;

/// One bounding box per feature of the region file; a bare geometry or single feature yields one.
pub fn read_region<P: AsRef<Path>>(path: P) -> Result<Vec<BoundingBox>> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .with_context(|| format!("Reading region file {}", path.display()))?;
    let geojson: GeoJson = content
        .parse()
        .with_context(|| format!("Parsing region file {}", path.display()))?;
    region_bboxes(&geojson)
}

pub fn region_bboxes(geojson: &GeoJson) -> Result<Vec<BoundingBox>> {
    let geometries = match geojson {
        GeoJson::FeatureCollection(collection) => collection
            .features
            .iter()
            .filter_map(|f| f.geometry.as_ref())
            .collect::<Vec<_>>(),
        GeoJson::Feature(feature) => feature.geometry.iter().collect(),
        GeoJson::Geometry(geometry) => vec![geometry],
    };
    if geometries.is_empty() {
        return Err(anyhow!("Region contains no geometry"));
    }

    geometries
        .into_iter()
        .map(|geometry| {
            let value = serde_json::to_value(geometry)?;
            let coordinates = value
                .get("coordinates")
                .or_else(|| value.get("geometries"))
                .ok_or(anyhow!("Geometry has no coordinates"))?;
            bbox_of(coordinates)
        })
        .collect()
}

/// Walks arbitrarily nested coordinate arrays with an explicit stack, so depth is bounded by
/// the heap rather than the call stack.
fn bbox_of(coordinates: &Value) -> Result<BoundingBox> {
    let mut bbox: Option<BoundingBox> = None;
    let mut stack = vec![coordinates];

    while let Some(value) = stack.pop() {
        match value {
            Value::Array(items) if is_position(items) => {
                let lon = items[0].as_f64().unwrap_or_default();
                let lat = items[1].as_f64().unwrap_or_default();
                bbox = Some(match bbox {
                    None => BoundingBox::point(lon, lat),
                    Some(b) => b.extend(lon, lat),
                });
            }
            Value::Array(items) => stack.extend(items.iter()),
            // GeometryCollection members
            Value::Object(map) => {
                if let Some(inner) = map.get("coordinates").or_else(|| map.get("geometries")) {
                    stack.push(inner);
                }
            }
            _ => {}
        }
    }
    bbox.ok_or(anyhow!("Geometry has no positions"))
}

fn is_position(items: &[Value]) -> bool {
    items.len() >= 2 && items.iter().all(Value::is_number)
}
