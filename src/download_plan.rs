use crate::catalog::CatalogSnapshot;
use crate::destination::Destination;
use crate::product::{Collection, StorageMode};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Deserialize, Serialize, Debug, PartialEq)]
pub struct DownloadTask {
    identifier: String,
    feature_id: String,
    storage: StorageMode,
    output: String,
}

impl DownloadTask {
    pub fn new(identifier: &str, feature_id: &str, storage: StorageMode, output: &str) -> Self {
        DownloadTask {
            identifier: identifier.to_string(),
            feature_id: feature_id.to_string(),
            storage,
            output: output.to_string(),
        }
    }
}

/// What a run would fetch, written instead of downloading when `no_download` is set.
#[derive(Deserialize, Serialize, Debug, PartialEq)]
pub struct DownloadPlan {
    collection: Collection,
    tasks: Vec<DownloadTask>,
    /// Products already present in the destination.
    existing: Vec<String>,
}

impl DownloadPlan {
    pub fn from_snapshot(
        collection: Collection,
        snapshot: &CatalogSnapshot,
        destination: &Destination,
    ) -> Self {
        let mut tasks = vec![];
        let mut existing = vec![];
        for record in snapshot.records() {
            if destination.is_present(record) {
                existing.push(record.identifier.clone());
                continue;
            }
            let output = destination.archive_path(&record.identifier);
            tasks.push(DownloadTask::new(
                &record.identifier,
                &record.feature_id,
                record.storage_mode,
                &output.to_string_lossy(),
            ));
        }
        Self {
            collection,
            tasks,
            existing,
        }
    }

    pub fn len(self: &Self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(self: &Self) -> bool {
        self.tasks.is_empty()
    }

    /// Tasks whose product must be staged from tape before it can be fetched.
    pub fn on_tape(self: &Self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.storage != StorageMode::Disk)
            .count()
    }

    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content =
            fs::read_to_string(path).with_context(|| format!("Reading plan {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Decoding plan {}", path.display()))
    }

    pub fn write<P: AsRef<Path>>(self: &Self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).with_context(|| format!("Writing plan {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::product::tests::record;

    fn mock_snapshot() -> CatalogSnapshot {
        CatalogSnapshot::from_records(vec![
            record("A", "S1A", 1, StorageMode::Disk),
            record("B", "S1A", 1, StorageMode::Tape),
            record("C", "S1A", 1, StorageMode::Staging),
        ])
    }

    #[test]
    fn test_plan_skips_existing_products() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("A.zip"), b"zip").unwrap();
        let destination = Destination::new(dir.path());
        let plan = DownloadPlan::from_snapshot(Collection::S1, &mock_snapshot(), &destination);

        assert_eq!(plan.len(), 2);
        assert_eq!(plan.on_tape(), 2);
        assert_eq!(plan.existing, vec!["A".to_string()]);
        assert_eq!(
            plan.tasks[0].output,
            dir.path().join("B.zip").to_string_lossy()
        );
    }

    #[test]
    fn test_write_and_read_json() {
        let dir = tempfile::tempdir().unwrap();
        let destination = Destination::new(dir.path());
        let plan = DownloadPlan::from_snapshot(Collection::S1, &mock_snapshot(), &destination);
        let path = dir.path().join("download_plan.json");
        plan.write(&path).unwrap();

        let read = DownloadPlan::read(&path).unwrap();
        assert_eq!(read, plan);
        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains(r#""storage": "tape""#));
    }

    #[test]
    fn test_read_names_the_plan_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("download_plan.json");
        fs::write(&path, "{").unwrap();
        let err = DownloadPlan::read(&path).unwrap_err();
        assert!(err.to_string().contains("download_plan.json"));
    }
}
