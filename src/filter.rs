use crate::catalog::{CatalogSnapshot, SnapshotEntry};
use crate::error::RunError;
use crate::product::{Collection, Family, Platform, ProductRecord, StorageMode};
use anyhow::Result;
use tracing::{debug, warn};

/// Narrows snapshots to the products the run asked for.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProductFilter {
    orbit: Option<u32>,
    max_cloud_cover: Option<f64>,
    satellite: Option<Platform>,
}

/// Filtered snapshot plus the products dropped because their storage tier is unknown.
#[derive(Debug, Default)]
pub struct FilterOutcome {
    pub snapshot: CatalogSnapshot,
    pub unknown_storage: Vec<String>,
}

impl ProductFilter {
    /// Rejects a satellite that cannot appear in `collection`. The cloud ceiling only applies
    /// to Sentinel-2 collections and is ignored elsewhere.
    pub fn new(
        collection: Collection,
        orbit: Option<u32>,
        max_cloud_cover: Option<f64>,
        satellite: Option<Platform>,
    ) -> Result<Self> {
        if let Some(satellite) = &satellite {
            if satellite.family() != collection.family() {
                return Err(RunError::Config(format!(
                    "satellite {satellite} is not part of collection {collection}"
                ))
                .into());
            }
        }
        let max_cloud_cover = match max_cloud_cover {
            Some(ceiling) if collection.family() != Family::Sentinel2 => {
                warn!(%collection, ceiling, "Cloud cover ceiling ignored outside Sentinel-2");
                None
            }
            other => other,
        };
        Ok(Self {
            orbit,
            max_cloud_cover,
            satellite,
        })
    }

    pub fn apply(self: &Self, snapshot: &CatalogSnapshot) -> FilterOutcome {
        let mut outcome = FilterOutcome::default();
        outcome.snapshot.skipped = snapshot.skipped.clone();

        for entry in snapshot.entries.iter() {
            let record = &entry.record;
            if !self.matches(record) {
                debug!(identifier = %record.identifier, "Filtered out");
                continue;
            }
            if record.storage_mode == StorageMode::Unknown {
                outcome.unknown_storage.push(record.identifier.clone());
                continue;
            }
            outcome.snapshot.entries.push(SnapshotEntry::clone(entry));
        }
        outcome
    }

    fn matches(self: &Self, record: &ProductRecord) -> bool {
        self.matches_orbit(record) && self.matches_cloud_cover(record) && self.matches_satellite(record)
    }

    fn matches_orbit(self: &Self, record: &ProductRecord) -> bool {
        let Some(orbit) = self.orbit else {
            return true;
        };
        match record.platform.family() {
            Family::Sentinel2 => record.identifier.contains(&format!("_R{orbit:03}")),
            Family::Sentinel1 => record.relative_orbit() == Some(i64::from(orbit)),
            _ => false,
        }
    }

    fn matches_cloud_cover(self: &Self, record: &ProductRecord) -> bool {
        match (self.max_cloud_cover, record.cloud_cover) {
            (Some(ceiling), Some(cover)) => cover <= ceiling,
            _ => true,
        }
    }

    fn matches_satellite(self: &Self, record: &ProductRecord) -> bool {
        self.satellite
            .as_ref()
            .map_or(true, |satellite| *satellite == record.platform)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::exit_code;
    use crate::product::tests::record;

    fn ids(outcome: &FilterOutcome) -> Vec<&str> {
        outcome
            .snapshot
            .records()
            .map(|r| r.identifier.as_str())
            .collect()
    }

    fn cloudy(cover: f64) -> CatalogSnapshot {
        let mut r = record("S2A_MSIL1C_X_R051_T31TCJ", "S2A", 1, StorageMode::Disk);
        r.cloud_cover = Some(cover);
        CatalogSnapshot::from_records(vec![r])
    }

    #[test]
    fn test_cloud_cover_ceiling() {
        let snapshot = cloudy(80.0);
        let strict = ProductFilter::new(Collection::S2ST, None, Some(70.0), None).unwrap();
        assert!(strict.apply(&snapshot).snapshot.is_empty());

        let loose = ProductFilter::new(Collection::S2ST, None, Some(90.0), None).unwrap();
        assert_eq!(loose.apply(&snapshot).snapshot.len(), 1);

        let unset = ProductFilter::new(Collection::S2ST, None, None, None).unwrap();
        assert_eq!(unset.apply(&snapshot).snapshot.len(), 1);
    }

    #[test]
    fn test_cloud_cover_ignored_outside_sentinel2() {
        let filter = ProductFilter::new(Collection::S1, None, Some(10.0), None).unwrap();
        assert_eq!(filter, ProductFilter::default());
    }

    #[test]
    fn test_s2_orbit_matches_identifier_suffix() {
        let snapshot = CatalogSnapshot::from_records(vec![
            record("S2A_MSIL1C_20200101_N0208_R051_T31TCJ", "S2A", 1, StorageMode::Disk),
            record("S2B_MSIL1C_20200103_N0208_R008_T31TCJ", "S2B", 1, StorageMode::Disk),
        ]);
        let filter = ProductFilter::new(Collection::S2ST, Some(51), None, None).unwrap();
        assert_eq!(
            ids(&filter.apply(&snapshot)),
            vec!["S2A_MSIL1C_20200101_N0208_R051_T31TCJ"]
        );
    }

    #[test]
    fn test_s1_orbit_uses_relative_orbit() {
        // S1A absolute 73 + 175 * 10 + 29 -> relative 30
        let snapshot = CatalogSnapshot::from_records(vec![
            record("S1A_IW_GRDH_1", "S1A", 73 + 1750 + 29, StorageMode::Disk),
            record("S1B_IW_GRDH_2", "S1B", 27 + 29, StorageMode::Disk),
            record("S1A_IW_GRDH_3", "S1A", 73, StorageMode::Disk),
        ]);
        let filter = ProductFilter::new(Collection::S1, Some(30), None, None).unwrap();
        assert_eq!(
            ids(&filter.apply(&snapshot)),
            vec!["S1A_IW_GRDH_1", "S1B_IW_GRDH_2"]
        );
    }

    #[test]
    fn test_orbit_drops_platforms_without_relative_orbit() {
        let snapshot =
            CatalogSnapshot::from_records(vec![record("S3A_OL_1_EFR", "S3A", 30, StorageMode::Disk)]);
        let filter = ProductFilter::new(Collection::S3, Some(30), None, None).unwrap();
        let outcome = filter.apply(&snapshot);
        assert!(outcome.snapshot.is_empty());
        assert!(outcome.unknown_storage.is_empty());
    }

    #[test]
    fn test_satellite_filter() {
        let snapshot = CatalogSnapshot::from_records(vec![
            record("A", "S1A", 1, StorageMode::Disk),
            record("B", "S1B", 1, StorageMode::Disk),
        ]);
        let filter = ProductFilter::new(Collection::S1, None, None, Some(Platform::S1B)).unwrap();
        assert_eq!(ids(&filter.apply(&snapshot)), vec!["B"]);
    }

    #[test]
    fn test_satellite_collection_mismatch_is_a_config_error() {
        let err = ProductFilter::new(Collection::S1, None, None, Some(Platform::S2A)).unwrap_err();
        assert_eq!(exit_code(&err), 2);
    }

    #[test]
    fn test_unknown_storage_is_reported() {
        let snapshot = CatalogSnapshot::from_records(vec![
            record("A", "S1A", 1, StorageMode::Unknown),
            record("B", "S1A", 1, StorageMode::Tape),
            record("C", "S1A", 1, StorageMode::Staging),
        ]);
        let outcome = ProductFilter::default().apply(&snapshot);
        assert_eq!(ids(&outcome), vec!["B", "C"]);
        assert_eq!(outcome.unknown_storage, vec!["A".to_string()]);
    }
}
