//! Catalog searches and the snapshots built from them.
use crate::error::RunError;
use crate::peps::PepsOps;
use crate::product::{Collection, FeatureOutcome, ProductRecord};
use anyhow::{Context, Result};
use chrono::NaiveDate;
use geojson::{Feature, FeatureCollection};
use regex::Regex;
use serde_json::Value;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Upper bound the catalog accepts for `maxRecords`.
pub const MAX_RECORDS: u32 = 500;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub lon_min: f64,
    pub lat_min: f64,
    pub lon_max: f64,
    pub lat_max: f64,
}

impl BoundingBox {
    pub fn new(lon_min: f64, lat_min: f64, lon_max: f64, lat_max: f64) -> Self {
        Self {
            lon_min,
            lat_min,
            lon_max,
            lat_max,
        }
    }

    pub fn point(lon: f64, lat: f64) -> Self {
        Self::new(lon, lat, lon, lat)
    }

    pub fn extend(self: Self, lon: f64, lat: f64) -> Self {
        Self::new(
            self.lon_min.min(lon),
            self.lat_min.min(lat),
            self.lon_max.max(lon),
            self.lat_max.max(lat),
        )
    }

    fn as_param(self: &Self) -> String {
        format!(
            "{},{},{},{}",
            self.lon_min, self.lat_min, self.lon_max, self.lat_max
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Geometry {
    Point { lat: f64, lon: f64 },
    BBox(BoundingBox),
    Location(String),
    /// Normalized tile token, e.g. `31TCJ`.
    Tile(String),
    /// One bounding box per feature of a region file, each searched separately.
    Regions(Vec<BoundingBox>),
}

impl Geometry {
    pub fn tile(raw: &str) -> Result<Self> {
        Ok(Self::Tile(normalize_tile(raw)?))
    }

    /// Query parameters for each geometry unit, one catalog request per unit.
    fn units(self: &Self) -> Vec<Vec<(&'static str, String)>> {
        match self {
            Self::Point { lat, lon } => vec![vec![("lat", lat.to_string()), ("lon", lon.to_string())]],
            Self::BBox(bbox) => vec![vec![("box", bbox.as_param())]],
            Self::Location(place) => vec![vec![("q", place.to_owned())]],
            Self::Tile(tile) => vec![vec![("tileid", tile.to_owned())]],
            Self::Regions(bboxes) => bboxes.iter().map(|b| vec![("box", b.as_param())]).collect(),
        }
    }
}

/// Accepts `T31TCJ` or `31TCJ` and returns `31TCJ`.
pub fn normalize_tile(raw: &str) -> Result<String> {
    let re = Regex::new(r"^[Tt]?(?<tile>\d{2}[A-Za-z]{3})$")
        .expect("Regex pattern should always compile");
    let captures = re
        .captures(raw.trim())
        .ok_or_else(|| RunError::TileFormat(raw.to_string()))?;
    Ok(captures["tile"].to_uppercase())
}

#[derive(Debug, Clone)]
pub struct CatalogQuery {
    pub collection: Collection,
    pub geometry: Geometry,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub product_type: Option<String>,
    pub sensor_mode: Option<String>,
}

impl CatalogQuery {
    /// Full parameter list of every request the query expands to.
    pub fn requests(self: &Self) -> Vec<Vec<(&'static str, String)>> {
        self.geometry
            .units()
            .into_iter()
            .map(|mut params| {
                params.push(("startDate", self.start_date.format("%Y-%m-%d").to_string()));
                params.push((
                    "completionDate",
                    self.end_date.format("%Y-%m-%d").to_string(),
                ));
                params.push(("maxRecords", MAX_RECORDS.to_string()));
                if let Some(product_type) = non_empty(&self.product_type) {
                    params.push(("productType", product_type.to_owned()));
                }
                if let Some(sensor_mode) = non_empty(&self.sensor_mode) {
                    params.push(("sensorMode", sensor_mode.to_owned()));
                }
                params
            })
            .collect()
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotEntry {
    /// Index of the geometry unit whose request returned this product.
    pub region: usize,
    pub record: ProductRecord,
}

/// Immutable result of one query cycle, in catalog response order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CatalogSnapshot {
    pub entries: Vec<SnapshotEntry>,
    /// Reasons for features that could not be turned into records.
    pub skipped: Vec<String>,
}

impl CatalogSnapshot {
    /// Builds a snapshot from per-region pages. Exact repeats are dropped first, then any
    /// remaining records sharing an identifier are collapsed onto the first one.
    pub fn merge(pages: Vec<(usize, Vec<Feature>)>) -> Self {
        let mut snapshot = Self::default();
        let mut seen_features = HashSet::new();
        let mut seen_ids = HashSet::new();

        for (region, features) in pages {
            for feature in features {
                let key = serde_json::to_string(&feature).unwrap_or_default();
                if !seen_features.insert(key) {
                    continue;
                }
                match FeatureOutcome::from_feature(&feature) {
                    FeatureOutcome::Valid(record) => {
                        if seen_ids.insert(record.identifier.clone()) {
                            snapshot.entries.push(SnapshotEntry { region, record });
                        }
                    }
                    FeatureOutcome::Skip { reason } => snapshot.skipped.push(reason),
                }
            }
        }
        snapshot
    }

    pub fn from_records(records: Vec<ProductRecord>) -> Self {
        let entries = records
            .into_iter()
            .map(|record| SnapshotEntry { region: 0, record })
            .collect();
        Self {
            entries,
            skipped: vec![],
        }
    }

    pub fn records(self: &Self) -> impl Iterator<Item = &ProductRecord> {
        self.entries.iter().map(|e| &e.record)
    }

    pub fn len(self: &Self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(self: &Self) -> bool {
        self.entries.is_empty()
    }
}

/// Issues the searches of a query and merges the responses.
pub struct Catalog {
    query: CatalogQuery,
    settle_delay: Duration,
    dump_path: Option<PathBuf>,
}

impl Catalog {
    pub fn new(query: CatalogQuery) -> Self {
        Self {
            query,
            settle_delay: Duration::ZERO,
            dump_path: None,
        }
    }

    /// Pause after every search before its results are used.
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Write the merged raw response of every search to `path`.
    pub fn with_dump(mut self, path: Option<PathBuf>) -> Self {
        self.dump_path = path;
        self
    }

    pub fn query(self: &Self) -> &CatalogQuery {
        &self.query
    }

    pub async fn snapshot(self: &Self, provider: &impl PepsOps) -> Result<CatalogSnapshot> {
        let mut pages = vec![];
        for (region, params) in self.query.requests().into_iter().enumerate() {
            info!(collection = %self.query.collection, region, ?params, "Searching catalog");
            let body = provider
                .search(self.query.collection, &params)
                .await
                .context("Searching catalog")?;
            let features = parse_search_response(&body)?;
            debug!(region, count = features.len(), "Catalog returned features");
            if features.len() as u32 >= MAX_RECORDS {
                warn!(region, "Catalog returned {MAX_RECORDS} features, results may be truncated");
            }
            pages.push((region, features));
            if !self.settle_delay.is_zero() {
                tokio::time::sleep(self.settle_delay).await;
            }
        }

        if let Some(path) = &self.dump_path {
            dump_pages(path, &pages)?;
        }

        let snapshot = CatalogSnapshot::merge(pages);
        for reason in snapshot.skipped.iter() {
            warn!(%reason, "Skipping malformed catalog entry");
        }
        info!(
            products = snapshot.len(),
            skipped = snapshot.skipped.len(),
            "Catalog snapshot ready"
        );
        Ok(snapshot)
    }
}

/// Fails on the catalog's error envelope, otherwise returns the features of the response.
pub fn parse_search_response(body: &str) -> Result<Vec<Feature>> {
    let value: Value = serde_json::from_str(body).context("Decoding catalog response")?;
    if let Some(code) = value.get("ErrorCode") {
        let message = value
            .get("ErrorMessage")
            .and_then(Value::as_str)
            .unwrap_or("no message")
            .to_string();
        let code = match code {
            Value::String(s) => s.to_owned(),
            other => other.to_string(),
        };
        return Err(RunError::Catalog { code, message }.into());
    }
    let collection: FeatureCollection =
        serde_json::from_value(value).context("Decoding catalog feature collection")?;
    Ok(collection.features)
}

fn dump_pages(path: &Path, pages: &[(usize, Vec<Feature>)]) -> Result<()> {
    let features = pages
        .iter()
        .flat_map(|(_, features)| features.iter().cloned())
        .collect::<Vec<_>>();
    let collection = FeatureCollection {
        bbox: None,
        features,
        foreign_members: None,
    };
    let content = serde_json::to_string_pretty(&collection)?;
    fs::write(path, content).with_context(|| format!("Writing {}", path.display()))?;
    Ok(())
}
