//! Catalog product records and the per-field validation that builds them from raw features.
use geojson::feature::Id;
use geojson::Feature;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Number of relative orbits in a Sentinel-1 repeat cycle.
const S1_ORBITS_PER_CYCLE: i64 = 175;

/// Collections published by the catalog.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Collection {
    S1,
    S2,
    S2ST,
    S3,
}

impl Collection {
    pub fn as_str(self: &Self) -> &'static str {
        match self {
            Self::S1 => "S1",
            Self::S2 => "S2",
            Self::S2ST => "S2ST",
            Self::S3 => "S3",
        }
    }

    pub fn family(self: &Self) -> Family {
        match self {
            Self::S1 => Family::Sentinel1,
            Self::S2 | Self::S2ST => Family::Sentinel2,
            Self::S3 => Family::Sentinel3,
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Family {
    Sentinel1,
    Sentinel2,
    Sentinel3,
    Other,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(from = "String", into = "String")]
pub enum Platform {
    S1A,
    S1B,
    S2A,
    S2B,
    S3A,
    S3B,
    Other(String),
}

impl Platform {
    pub fn family(self: &Self) -> Family {
        match self {
            Self::S1A | Self::S1B => Family::Sentinel1,
            Self::S2A | Self::S2B => Family::Sentinel2,
            Self::S3A | Self::S3B => Family::Sentinel3,
            Self::Other(_) => Family::Other,
        }
    }

    /// Offset subtracted from the absolute orbit before folding it into a relative orbit.
    fn orbit_offset(self: &Self) -> Option<i64> {
        match self {
            Self::S1A => Some(73),
            Self::S1B => Some(27),
            _ => None,
        }
    }

    pub fn as_str(self: &Self) -> &str {
        match self {
            Self::S1A => "S1A",
            Self::S1B => "S1B",
            Self::S2A => "S2A",
            Self::S2B => "S2B",
            Self::S3A => "S3A",
            Self::S3B => "S3B",
            Self::Other(code) => code,
        }
    }
}

impl From<&str> for Platform {
    fn from(code: &str) -> Self {
        match code {
            "S1A" => Self::S1A,
            "S1B" => Self::S1B,
            "S2A" => Self::S2A,
            "S2B" => Self::S2B,
            "S3A" => Self::S3A,
            "S3B" => Self::S3B,
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<String> for Platform {
    fn from(code: String) -> Self {
        Self::from(code.as_str())
    }
}

impl From<Platform> for String {
    fn from(platform: Platform) -> Self {
        platform.as_str().to_string()
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Storage tier reported by the catalog for a product.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    Disk,
    Tape,
    Staging,
    Unknown,
}

impl From<&str> for StorageMode {
    fn from(mode: &str) -> Self {
        match mode {
            "disk" => Self::Disk,
            "tape" => Self::Tape,
            "staging" => Self::Staging,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for StorageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match self {
            Self::Disk => "disk",
            Self::Tape => "tape",
            Self::Staging => "staging",
            Self::Unknown => "unknown",
        };
        f.write_str(mode)
    }
}

#[derive(Debug, PartialEq, Clone)]
pub struct ProductRecord {
    pub identifier: String,
    pub feature_id: String,
    pub platform: Platform,
    pub orbit_number: i64,
    pub cloud_cover: Option<f64>,
    pub storage_mode: StorageMode,
    pub resource_size: Option<u64>,
}

impl ProductRecord {
    /// Relative orbit, defined for Sentinel-1 platforms only.
    pub fn relative_orbit(self: &Self) -> Option<i64> {
        let offset = self.platform.orbit_offset()?;
        Some((self.orbit_number - offset).rem_euclid(S1_ORBITS_PER_CYCLE) + 1)
    }

    /// Name of the directory the product archive unpacks to.
    pub fn extracted_dir_name(self: &Self) -> String {
        match self.platform.family() {
            Family::Sentinel3 => format!("{}.SEN3", self.identifier),
            _ => format!("{}.SAFE", self.identifier),
        }
    }
}

/// Result of validating one raw catalog feature.
#[derive(Debug, PartialEq)]
pub enum FeatureOutcome {
    Valid(ProductRecord),
    Skip { reason: String },
}

impl FeatureOutcome {
    pub fn from_feature(feature: &Feature) -> Self {
        match Self::extract(feature) {
            Ok(record) => Self::Valid(record),
            Err(reason) => Self::Skip { reason },
        }
    }

    fn extract(feature: &Feature) -> Result<ProductRecord, String> {
        let identifier = extract_identifier(feature).ok_or("missing productIdentifier")?;
        let with_id = |reason: &str| format!("{identifier}: {reason}");

        let feature_id = extract_feature_id(feature).ok_or_else(|| with_id("missing feature id"))?;
        let platform = extract_platform(feature).ok_or_else(|| with_id("missing platform"))?;
        let orbit_number =
            extract_orbit_number(feature).ok_or_else(|| with_id("missing orbitNumber"))?;

        Ok(ProductRecord {
            identifier,
            feature_id,
            platform,
            orbit_number,
            cloud_cover: extract_cloud_cover(feature),
            storage_mode: extract_storage_mode(feature),
            resource_size: extract_resource_size(feature),
        })
    }
}

fn extract_identifier(feature: &Feature) -> Option<String> {
    Some(feature.property("productIdentifier")?.as_str()?.to_string())
}

fn extract_feature_id(feature: &Feature) -> Option<String> {
    match feature.id.as_ref()? {
        Id::String(id) => Some(id.to_owned()),
        Id::Number(n) => Some(n.to_string()),
    }
}

fn extract_platform(feature: &Feature) -> Option<Platform> {
    let code = feature.property("platform")?.as_str()?;
    Some(Platform::from(code))
}

fn extract_orbit_number(feature: &Feature) -> Option<i64> {
    feature.property("orbitNumber")?.as_i64()
}

fn extract_cloud_cover(feature: &Feature) -> Option<f64> {
    feature.property("cloudCover")?.as_f64()
}

fn extract_storage_mode(feature: &Feature) -> StorageMode {
    feature
        .property("storage")
        .and_then(|s| s.get("mode"))
        .and_then(Value::as_str)
        .map(StorageMode::from)
        .unwrap_or(StorageMode::Unknown)
}

fn extract_resource_size(feature: &Feature) -> Option<u64> {
    let from_services = feature
        .property("services")
        .and_then(|s| s.get("download"))
        .and_then(|d| d.get("size"))
        .and_then(Value::as_u64);
    from_services.or_else(|| feature.property("resourceSize")?.as_u64())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub fn feature_json(identifier: &str, platform: &str, orbit: i64, mode: &str) -> Value {
        json!({
            "type": "Feature",
            "id": format!("id-{identifier}"),
            "geometry": null,
            "properties": {
                "productIdentifier": identifier,
                "platform": platform,
                "orbitNumber": orbit,
                "storage": {"mode": mode},
                "services": {"download": {"size": 16}}
            }
        })
    }

    pub fn record(identifier: &str, platform: &str, orbit: i64, mode: StorageMode) -> ProductRecord {
        ProductRecord {
            identifier: identifier.to_string(),
            feature_id: format!("id-{identifier}"),
            platform: Platform::from(platform),
            orbit_number: orbit,
            cloud_cover: None,
            storage_mode: mode,
            resource_size: Some(16),
        }
    }

    fn parse(value: Value) -> FeatureOutcome {
        let feature: Feature = serde_json::from_value(value).unwrap();
        FeatureOutcome::from_feature(&feature)
    }

    #[test]
    fn test_relative_orbit_s1a() {
        for orbit in [73, 74, 247, 248, 10_000, 1] {
            let r = record("p", "S1A", orbit, StorageMode::Disk);
            assert_eq!(r.relative_orbit(), Some(((orbit - 73).rem_euclid(175)) + 1));
        }
        assert_eq!(record("p", "S1A", 73, StorageMode::Disk).relative_orbit(), Some(1));
        assert_eq!(record("p", "S1A", 72, StorageMode::Disk).relative_orbit(), Some(175));
    }

    #[test]
    fn test_relative_orbit_s1b() {
        let r = record("p", "S1B", 27 + 175 * 3 + 9, StorageMode::Disk);
        assert_eq!(r.relative_orbit(), Some(10));
    }

    #[test]
    fn test_relative_orbit_undefined_for_other_platforms() {
        for platform in ["S2A", "S2B", "S3A", "S3B", "L8"] {
            assert_eq!(record("p", platform, 500, StorageMode::Disk).relative_orbit(), None);
        }
    }

    #[test]
    fn test_parse_valid_feature() {
        let mut value = feature_json("S2A_MSIL1C_X_R051_T31TCJ", "S2A", 1234, "tape");
        value["properties"]["cloudCover"] = json!(12.5);
        let expected = ProductRecord {
            identifier: "S2A_MSIL1C_X_R051_T31TCJ".to_string(),
            feature_id: "id-S2A_MSIL1C_X_R051_T31TCJ".to_string(),
            platform: Platform::S2A,
            orbit_number: 1234,
            cloud_cover: Some(12.5),
            storage_mode: StorageMode::Tape,
            resource_size: Some(16),
        };
        assert_eq!(parse(value), FeatureOutcome::Valid(expected));
    }

    #[test]
    fn test_parse_skips_missing_fields() {
        let mut value = feature_json("P1", "S1A", 1, "disk");
        value["properties"]
            .as_object_mut()
            .unwrap()
            .remove("orbitNumber");
        assert_eq!(
            parse(value),
            FeatureOutcome::Skip {
                reason: "P1: missing orbitNumber".to_string()
            }
        );

        let mut value = feature_json("P1", "S1A", 1, "disk");
        value["properties"]
            .as_object_mut()
            .unwrap()
            .remove("productIdentifier");
        assert!(matches!(parse(value), FeatureOutcome::Skip { .. }));
    }

    #[test]
    fn test_unrecognised_storage_mode_is_unknown() {
        let outcome = parse(feature_json("P1", "S1A", 1, "glacier"));
        let FeatureOutcome::Valid(r) = outcome else {
            panic!("expected a valid record");
        };
        assert_eq!(r.storage_mode, StorageMode::Unknown);
    }

    #[test]
    fn test_resource_size_fallback() {
        let mut value = feature_json("P1", "S1A", 1, "disk");
        value["properties"].as_object_mut().unwrap().remove("services");
        value["properties"]["resourceSize"] = json!(42);
        let FeatureOutcome::Valid(r) = parse(value) else {
            panic!("expected a valid record");
        };
        assert_eq!(r.resource_size, Some(42));
    }

    #[test]
    fn test_extracted_dir_name() {
        assert_eq!(
            record("S3A_OL_1", "S3A", 1, StorageMode::Disk).extracted_dir_name(),
            "S3A_OL_1.SEN3"
        );
        assert_eq!(
            record("S1A_IW_1", "S1A", 1, StorageMode::Disk).extracted_dir_name(),
            "S1A_IW_1.SAFE"
        );
    }
}
