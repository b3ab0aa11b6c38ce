//! Run configuration and account credentials, both read from TOML.
use crate::catalog::{BoundingBox, CatalogQuery, Geometry};
use crate::error::RunError;
use crate::filter::ProductFilter;
use crate::peps::DEFAULT_BASE_URL;
use crate::product::{Collection, Family, Platform};
use crate::region;
use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct RunConfig {
    /// TOML file holding the `[peps]` account.
    pub auth: PathBuf,
    pub query: QueryConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    pub download: DownloadConfig,
}

/// Exactly one of `point`, `bbox`, `location`, `tile` or `region` selects the area.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct QueryConfig {
    pub collection: Collection,
    pub start_date: String,
    /// Defaults to today.
    pub end_date: Option<String>,
    pub product_type: Option<String>,
    pub sensor_mode: Option<String>,
    /// `[lon, lat]`
    pub point: Option<[f64; 2]>,
    /// `[lon_min, lat_min, lon_max, lat_max]`
    pub bbox: Option<[f64; 4]>,
    pub location: Option<String>,
    pub tile: Option<String>,
    /// GeoJSON file; each feature is searched separately.
    pub region: Option<PathBuf>,
    /// Where to keep the raw catalog response.
    pub catalog_json: Option<PathBuf>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct FilterConfig {
    pub orbit: Option<u32>,
    pub max_cloud_cover: Option<f64>,
    pub satellite: Option<Platform>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct DownloadConfig {
    pub write_dir: PathBuf,
    #[serde(default)]
    pub extract: bool,
    #[serde(default)]
    pub no_download: bool,
    #[serde(default)]
    pub retry_failed: bool,
    #[serde(default = "default_settle_delay")]
    pub settle_delay_secs: u64,
    #[serde(default = "default_cycle_backoff")]
    pub cycle_backoff_secs: u64,
    pub max_cycles: Option<u32>,
    /// Directory of the run log; the write directory when unset.
    pub log_dir: Option<PathBuf>,
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_settle_delay() -> u64 {
    5
}

fn default_cycle_backoff() -> u64 {
    60
}

pub fn template_toml() -> toml::Table {
    toml::toml! {
        auth = "peps.toml"

        [query]
        collection = "S2ST"
        start_date = "2024-05-01"
        end_date = "2024-06-01"
        // Pick one of point, bbox, location, tile or region
        tile = "T31TCJ"
        product_type = "S2MSI1C"
        catalog_json = "search.json"

        [filter]
        max_cloud_cover = 60.0

        [download]
        write_dir = "./outputs"
        extract = true
        no_download = false
        settle_delay_secs = 5
        cycle_backoff_secs = 60
    }
}

fn config_error(message: String) -> anyhow::Error {
    RunError::Config(message).into()
}

fn parse_date(field: &str, value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value, DATE_FORMAT)
        .map_err(|e| config_error(format!("{field} '{value}' is not a YYYY-MM-DD date: {e}")))
}

impl RunConfig {
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content =
            fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| config_error(format!("{}: {e}", path.display())))?;
        Ok(config)
    }

    pub fn write<P: AsRef<Path>>(self: &Self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn from_template(table: &toml::Table) -> Result<Self> {
        let config: Self = toml::from_str(&table.to_string())?;
        Ok(config)
    }

    pub fn geometry(self: &Self) -> Result<Geometry> {
        let q = &self.query;
        let sources = [
            q.point.is_some(),
            q.bbox.is_some(),
            q.location.is_some(),
            q.tile.is_some(),
            q.region.is_some(),
        ];
        if sources.iter().filter(|&&set| set).count() != 1 {
            return Err(config_error(
                "choose exactly one of point, bbox, location, tile or region".to_string(),
            ));
        }

        if let Some([lon, lat]) = q.point {
            return Ok(Geometry::Point { lat, lon });
        }
        if let Some([lon_min, lat_min, lon_max, lat_max]) = q.bbox {
            if lon_min > lon_max || lat_min > lat_max {
                return Err(config_error(format!(
                    "bbox [{lon_min}, {lat_min}, {lon_max}, {lat_max}] should be \
                     [lon_min, lat_min, lon_max, lat_max]"
                )));
            }
            return Ok(Geometry::BBox(BoundingBox::new(
                lon_min, lat_min, lon_max, lat_max,
            )));
        }
        if let Some(location) = &q.location {
            return Ok(Geometry::Location(location.to_owned()));
        }
        if let Some(tile) = &q.tile {
            return Geometry::tile(tile);
        }

        match &q.region {
            Some(path) => {
                let mut bboxes = region::read_region(path)?;
                if bboxes.len() == 1 {
                    return Ok(Geometry::BBox(bboxes.remove(0)));
                }
                Ok(Geometry::Regions(bboxes))
            }
            None => Err(config_error("no geometry".to_string())),
        }
    }

    pub fn catalog_query(self: &Self) -> Result<CatalogQuery> {
        let start_date = parse_date("start_date", &self.query.start_date)?;
        let end_date = match &self.query.end_date {
            Some(end) => parse_date("end_date", end)?,
            None => Local::now().date_naive(),
        };
        if start_date > end_date {
            return Err(config_error(format!(
                "start_date {start_date} is after end_date {end_date}"
            )));
        }
        Ok(CatalogQuery {
            collection: self.query.collection,
            geometry: self.geometry()?,
            start_date,
            end_date,
            product_type: self.query.product_type.clone(),
            sensor_mode: self.query.sensor_mode.clone(),
        })
    }

    pub fn product_filter(self: &Self) -> Result<ProductFilter> {
        ProductFilter::new(
            self.query.collection,
            self.filter.orbit,
            self.filter.max_cloud_cover,
            self.filter.satellite.clone(),
        )
    }

    pub fn settle_delay(self: &Self) -> Duration {
        Duration::from_secs(self.download.settle_delay_secs)
    }

    pub fn cycle_backoff(self: &Self) -> Duration {
        Duration::from_secs(self.download.cycle_backoff_secs)
    }

    pub fn log_dir(self: &Self) -> &Path {
        self.download
            .log_dir
            .as_deref()
            .unwrap_or(&self.download.write_dir)
    }
}

/// Products acquired since this date are only published in the tiled Sentinel-2 collection.
fn tiling_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2016, 12, 5).unwrap_or_default()
}

/// Warnings for date ranges that straddle the split between the S2 and S2ST collections.
pub fn collection_advisories(query: &CatalogQuery) -> Vec<String> {
    let split = tiling_date();
    let mut advice = vec![];
    match query.collection {
        Collection::S2 if query.start_date >= split => advice.push(format!(
            "products after {split} are stored in the tiled collection, use S2ST"
        )),
        Collection::S2 if query.end_date >= split => advice.push(format!(
            "products after {split} are stored in the tiled collection, use S2ST to get them; \
             earlier products will be downloaded"
        )),
        Collection::S2ST if query.end_date < split => advice.push(format!(
            "products before {split} are stored in the non-tiled collection, use S2"
        )),
        Collection::S2ST if query.start_date < split => advice.push(format!(
            "products before {split} are stored in the non-tiled collection, use S2 to get them; \
             later products will be downloaded"
        )),
        _ => {}
    }
    if query.collection.family() != Family::Sentinel2 {
        if let Geometry::Tile(_) = query.geometry {
            advice.push("tile identifiers only select Sentinel-2 products".to_string());
        }
    }
    advice
}

#[derive(Deserialize, Clone)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Deserialize)]
struct AuthFile {
    peps: Credentials,
}

impl Credentials {
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Reading credentials {}", path.display()))?;
        let auth: AuthFile = toml::from_str(&content)
            .map_err(|e| config_error(format!("{}: {e}", path.display())))?;
        Ok(auth.peps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::exit_code;

    fn template() -> RunConfig {
        RunConfig::from_template(&template_toml()).unwrap()
    }

    #[test]
    fn test_template() {
        let config = template();
        assert_eq!(config.query.collection, Collection::S2ST);
        assert_eq!(config.query.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.filter.max_cloud_cover, Some(60.0));
        assert!(config.download.extract);
        assert_eq!(config.download.max_cycles, None);
        assert_eq!(config.geometry().unwrap(), Geometry::Tile("31TCJ".to_string()));
    }

    #[test]
    fn test_write_and_read_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.toml");
        let config = template();
        config.write(&path).unwrap();
        assert_eq!(RunConfig::read(&path).unwrap(), config);
    }

    #[test]
    fn test_defaults() {
        let config: RunConfig = toml::from_str(
            r#"
            auth = "peps.toml"
            [query]
            collection = "S1"
            start_date = "2021-01-01"
            location = "Toulouse"
            [download]
            write_dir = "out"
            "#,
        )
        .unwrap();
        assert_eq!(config.filter, FilterConfig::default());
        assert_eq!(config.settle_delay(), Duration::from_secs(5));
        assert_eq!(config.cycle_backoff(), Duration::from_secs(60));
        assert_eq!(config.log_dir(), Path::new("out"));
        let query = config.catalog_query().unwrap();
        assert_eq!(query.end_date, Local::now().date_naive());
    }

    #[test]
    fn test_exactly_one_geometry() {
        let mut config = template();
        config.query.location = Some("Toulouse".to_string());
        assert_eq!(exit_code(&config.geometry().unwrap_err()), 2);

        config.query.tile = None;
        config.query.location = None;
        assert_eq!(exit_code(&config.geometry().unwrap_err()), 2);
    }

    #[test]
    fn test_point_and_bbox() {
        let mut config = template();
        config.query.tile = None;
        config.query.point = Some([1.44, 43.6]);
        assert_eq!(
            config.geometry().unwrap(),
            Geometry::Point { lat: 43.6, lon: 1.44 }
        );

        config.query.point = None;
        config.query.bbox = Some([1.0, 43.0, 2.0, 44.0]);
        assert_eq!(
            config.geometry().unwrap(),
            Geometry::BBox(BoundingBox::new(1.0, 43.0, 2.0, 44.0))
        );

        config.query.bbox = Some([2.0, 43.0, 1.0, 44.0]);
        assert!(config.geometry().is_err());
    }

    #[test]
    fn test_malformed_tile_is_fatal() {
        let mut config = template();
        config.query.tile = Some("T31TC".to_string());
        assert_eq!(exit_code(&config.geometry().unwrap_err()), 6);
    }

    #[test]
    fn test_region_with_several_features() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("area.geojson");
        fs::write(
            &path,
            r#"{"type": "FeatureCollection", "features": [
                {"type": "Feature", "properties": {}, "geometry": {"type": "Point", "coordinates": [1.0, 2.0]}},
                {"type": "Feature", "properties": {}, "geometry": {"type": "Point", "coordinates": [3.0, 4.0]}}
            ]}"#,
        )
        .unwrap();
        let mut config = template();
        config.query.tile = None;
        config.query.region = Some(path);
        let Geometry::Regions(bboxes) = config.geometry().unwrap() else {
            panic!("expected one bbox per feature");
        };
        assert_eq!(bboxes.len(), 2);
    }

    #[test]
    fn test_bad_dates() {
        let mut config = template();
        config.query.start_date = "01/05/2024".to_string();
        assert_eq!(exit_code(&config.catalog_query().unwrap_err()), 2);

        let mut config = template();
        config.query.start_date = "2024-07-01".to_string();
        assert_eq!(exit_code(&config.catalog_query().unwrap_err()), 2);
    }

    #[test]
    fn test_satellite_mismatch_is_a_config_error() {
        let mut config = template();
        config.filter.satellite = Some(Platform::S1A);
        assert_eq!(exit_code(&config.product_filter().unwrap_err()), 2);
    }

    #[test]
    fn test_collection_advisories() {
        let mut query = template().catalog_query().unwrap();
        assert!(collection_advisories(&query).is_empty());

        query.collection = Collection::S2;
        assert_eq!(collection_advisories(&query).len(), 1);

        query.collection = Collection::S2ST;
        query.start_date = NaiveDate::from_ymd_opt(2016, 1, 1).unwrap();
        query.end_date = NaiveDate::from_ymd_opt(2016, 6, 1).unwrap();
        assert!(collection_advisories(&query)[0].contains("use S2"));
    }

    #[test]
    fn test_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peps.toml");
        fs::write(&path, "[peps]\nuser = \"jane@example.org\"\npassword = \"secret\"\n").unwrap();
        let credentials = Credentials::read(&path).unwrap();
        assert_eq!(credentials.user, "jane@example.org");
        assert!(!format!("{credentials:?}").contains("secret"));

        fs::write(&path, "[other]\nuser = \"x\"\n").unwrap();
        assert_eq!(exit_code(&Credentials::read(&path).unwrap_err()), 2);
    }
}
