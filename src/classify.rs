use crate::catalog::CatalogSnapshot;
use crate::peps::PepsOps;
use crate::product::{Collection, ProductRecord, StorageMode};
use std::collections::HashSet;
use tracing::{info, warn};

/// Records of one snapshot grouped by storage tier, each group in catalog order.
#[derive(Debug, Default)]
pub struct Classification<'a> {
    pub disk: Vec<&'a ProductRecord>,
    pub tape: Vec<&'a ProductRecord>,
    pub staging: Vec<&'a ProductRecord>,
}

impl Classification<'_> {
    /// Products still waiting on the archive.
    pub fn archived(self: &Self) -> usize {
        self.tape.len() + self.staging.len()
    }
}

/// Reads storage tiers from each fresh snapshot and sends stage requests for tape products,
/// at most once per product for the lifetime of the classifier.
#[derive(Debug, Default)]
pub struct StorageStateClassifier {
    triggered: HashSet<String>,
}

impl StorageStateClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn classify<'a>(self: &Self, snapshot: &'a CatalogSnapshot) -> Classification<'a> {
        let mut classification = Classification::default();
        for record in snapshot.records() {
            info!(identifier = %record.identifier, storage = %record.storage_mode, "Classified");
            match record.storage_mode {
                StorageMode::Disk => classification.disk.push(record),
                StorageMode::Tape => classification.tape.push(record),
                StorageMode::Staging => classification.staging.push(record),
                // The filter keeps unknown products out of snapshots handed here.
                StorageMode::Unknown => {}
            }
        }
        classification
    }

    pub fn was_triggered(self: &Self, identifier: &str) -> bool {
        self.triggered.contains(identifier)
    }

    /// Sends the stage request unless one already went out. Returns whether a request was sent.
    /// A failing request is logged only: the next snapshots show whether staging started.
    pub async fn trigger_stage(
        self: &mut Self,
        provider: &impl PepsOps,
        collection: Collection,
        record: &ProductRecord,
    ) -> bool {
        if record.storage_mode != StorageMode::Tape || self.was_triggered(&record.identifier) {
            return false;
        }
        info!(identifier = %record.identifier, "Staging tape product");
        if let Err(e) = provider.stage(collection, &record.feature_id).await {
            warn!(identifier = %record.identifier, "Stage request failed: {e:#}");
        }
        self.triggered.insert(record.identifier.clone());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peps::tests::MockPeps;
    use crate::product::tests::record;

    #[test]
    fn test_classify_groups_by_storage() {
        let snapshot = CatalogSnapshot::from_records(vec![
            record("A", "S1A", 1, StorageMode::Disk),
            record("B", "S1A", 1, StorageMode::Tape),
            record("C", "S1A", 1, StorageMode::Staging),
            record("D", "S1A", 1, StorageMode::Disk),
        ]);
        let classification = StorageStateClassifier::new().classify(&snapshot);
        let disk = classification
            .disk
            .iter()
            .map(|r| r.identifier.as_str())
            .collect::<Vec<_>>();
        assert_eq!(disk, vec!["A", "D"]);
        assert_eq!(classification.archived(), 2);
    }

    #[tokio::test]
    async fn test_stage_is_sent_once_per_product() {
        let provider = MockPeps::new(vec![]);
        let mut classifier = StorageStateClassifier::new();
        let tape = record("B", "S1A", 1, StorageMode::Tape);

        assert!(classifier.trigger_stage(&provider, Collection::S1, &tape).await);
        assert!(!classifier.trigger_stage(&provider, Collection::S1, &tape).await);
        assert_eq!(provider.staged(), vec!["id-B".to_string()]);
    }

    #[tokio::test]
    async fn test_stage_skips_non_tape_products() {
        let provider = MockPeps::new(vec![]);
        let mut classifier = StorageStateClassifier::new();
        for mode in [StorageMode::Disk, StorageMode::Staging, StorageMode::Unknown] {
            let r = record("A", "S1A", 1, mode);
            assert!(!classifier.trigger_stage(&provider, Collection::S1, &r).await);
        }
        assert!(provider.staged().is_empty());
    }
}
