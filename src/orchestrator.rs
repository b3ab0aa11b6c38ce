//! The polling loop that converges the destination directory to the catalog selection.
//!
//! Each cycle fetches a fresh [`CatalogSnapshot`], filters it and reconciles it against the
//! per-product state kept for the whole run. Disk products are downloaded straight away, tape
//! products get one stage request, and the loop sleeps while anything is still pending.
use crate::catalog::{Catalog, CatalogSnapshot};
use crate::classify::StorageStateClassifier;
use crate::destination::Destination;
use crate::download_plan::DownloadPlan;
use crate::error::RunError;
use crate::filter::ProductFilter;
use crate::peps::PepsOps;
use crate::product::{ProductRecord, StorageMode};
use crate::verify::{DownloadOutcome, TransferVerifier};
use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::time::Duration;
use tracing::{error, info, warn};

/// Errors that end the run even after the initial snapshot. Anything else from a catalog query
/// is retried on the next cycle.
fn is_fatal(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<RunError>(),
        Some(RunError::Catalog { .. })
    )
}

pub const DEFAULT_CYCLE_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq)]
pub enum ProductState {
    Pending,
    /// Stage request sent, waiting for the product to reach disk.
    Staged,
    Transferring,
    Verifying,
    Complete,
    Failed(String),
}

impl ProductState {
    pub fn is_terminal(self: &Self) -> bool {
        matches!(self, Self::Complete | Self::Failed(_))
    }
}

#[derive(Debug, Default, PartialEq)]
pub struct RunSummary {
    /// Downloaded during this run.
    pub completed: Vec<String>,
    /// Found in the destination before any transfer.
    pub already_present: Vec<String>,
    pub failed: Vec<(String, String)>,
    /// Still pending when the run stopped early.
    pub unfinished: Vec<String>,
    pub transfers: usize,
    pub cycles: u32,
    pub outcomes: Vec<DownloadOutcome>,
}

pub struct DownloadOrchestrator {
    catalog: Catalog,
    filter: ProductFilter,
    classifier: StorageStateClassifier,
    verifier: TransferVerifier,
    destination: Destination,
    cycle_backoff: Duration,
    max_cycles: Option<u32>,
    retry_failed: bool,
    states: HashMap<String, ProductState>,
    /// Identifiers in the order they were first seen.
    order: Vec<String>,
    already_present: HashSet<String>,
    reported_unknown: HashSet<String>,
    reported_missing: HashSet<String>,
    outcomes: Vec<DownloadOutcome>,
}

impl DownloadOrchestrator {
    pub fn new(
        catalog: Catalog,
        filter: ProductFilter,
        destination: Destination,
        extract: bool,
    ) -> Self {
        Self {
            catalog,
            filter,
            classifier: StorageStateClassifier::new(),
            verifier: TransferVerifier::new(destination.clone(), extract),
            destination,
            cycle_backoff: DEFAULT_CYCLE_BACKOFF,
            max_cycles: None,
            retry_failed: false,
            states: HashMap::new(),
            order: vec![],
            already_present: HashSet::new(),
            reported_unknown: HashSet::new(),
            reported_missing: HashSet::new(),
            outcomes: vec![],
        }
    }

    pub fn with_cycle_backoff(mut self, backoff: Duration) -> Self {
        self.cycle_backoff = backoff;
        self
    }

    /// Stop after this many cycles even if products are still pending.
    pub fn with_max_cycles(mut self, max_cycles: Option<u32>) -> Self {
        self.max_cycles = max_cycles;
        self
    }

    /// Download again products whose extraction failed in an earlier run.
    pub fn with_retry_failed(mut self, retry_failed: bool) -> Self {
        self.retry_failed = retry_failed;
        self
    }

    pub fn state(self: &Self, identifier: &str) -> Option<&ProductState> {
        self.states.get(identifier)
    }

    /// Query, filter and drop products with an unknown storage tier. Fails when the catalog
    /// rejects the query.
    pub async fn refresh(self: &mut Self, provider: &impl PepsOps) -> Result<CatalogSnapshot> {
        let snapshot = self.catalog.snapshot(provider).await?;
        let outcome = self.filter.apply(&snapshot);
        for identifier in outcome.unknown_storage {
            if self.reported_unknown.insert(identifier.clone()) {
                error!(%identifier, "Catalog cannot tell where this product is stored, skipping it");
            }
        }
        info!(
            matching = outcome.snapshot.len(),
            total = snapshot.len(),
            "Filtered catalog snapshot"
        );
        Ok(outcome.snapshot)
    }

    /// Resolves the initial selection without staging or downloading anything.
    pub async fn plan(self: &mut Self, provider: &impl PepsOps) -> Result<DownloadPlan> {
        let snapshot = self.refresh(provider).await?;
        if snapshot.is_empty() {
            return Err(RunError::EmptyResult.into());
        }
        let collection = self.catalog.query().collection;
        Ok(DownloadPlan::from_snapshot(collection, &snapshot, &self.destination))
    }

    pub async fn run(self: &mut Self, provider: &impl PepsOps) -> Result<RunSummary> {
        let initial = self.refresh(provider).await?;
        if initial.is_empty() {
            return Err(RunError::EmptyResult.into());
        }
        self.reconcile(&initial)?;
        self.stage_tape_products(provider, &initial).await;
        info!(count = self.pending_count(), "Products to download");

        let mut cycles = 0;
        while self.pending_count() > 0 {
            cycles += 1;
            let archived = match self.refresh(provider).await {
                Ok(snapshot) => Some(self.converge(provider, &snapshot).await?),
                Err(e) if is_fatal(&e) => return Err(e),
                Err(e) => {
                    warn!(cycle = cycles, "Catalog query failed, trying again next cycle: {e:#}");
                    None
                }
            };

            let remaining = self.pending_count();
            info!(cycle = cycles, remaining, archived = ?archived, "Cycle finished");
            if remaining == 0 {
                break;
            }
            if self.max_cycles.is_some_and(|max| cycles >= max) {
                warn!(remaining, "Giving up after {cycles} cycles");
                break;
            }
            info!(
                remaining,
                "Products still on tape or pending, waiting {:?} before trying again",
                self.cycle_backoff
            );
            tokio::time::sleep(self.cycle_backoff).await;
        }
        Ok(self.summary(cycles))
    }

    /// Acts on one fresh snapshot: downloads what is on disk, stages what is on tape. Returns the
    /// number of products still in the archive.
    async fn converge(self: &mut Self, provider: &impl PepsOps, snapshot: &CatalogSnapshot) -> Result<usize> {
        self.reconcile(snapshot)?;
        let classification = self.classifier.classify(snapshot);
        self.download_disk_products(provider, &classification.disk).await?;
        self.stage_tape_products(provider, snapshot).await;
        Ok(classification.archived())
    }

    /// Registers products seen for the first time. Products already in the destination are
    /// complete, products whose extraction failed before stay failed unless retrying.
    fn reconcile(self: &mut Self, snapshot: &CatalogSnapshot) -> Result<()> {
        for identifier in self.note_missing(snapshot) {
            warn!(%identifier, "Pending product missing from the latest snapshot");
        }

        for record in snapshot.records() {
            if self.states.contains_key(&record.identifier) {
                continue;
            }
            let state = self.initial_state(record)?;
            self.order.push(record.identifier.clone());
            self.states.insert(record.identifier.clone(), state);
        }
        Ok(())
    }

    /// Pending products absent from `snapshot` that were present in the previous one. A product
    /// that comes back is reported again if it disappears later.
    fn note_missing(self: &mut Self, snapshot: &CatalogSnapshot) -> Vec<String> {
        let latest = snapshot
            .records()
            .map(|r| r.identifier.as_str())
            .collect::<HashSet<_>>();
        self.reported_missing
            .retain(|identifier| !latest.contains(identifier.as_str()));

        let mut missing = vec![];
        for identifier in self.order.iter() {
            if !self.is_pending(identifier) || latest.contains(identifier.as_str()) {
                continue;
            }
            if self.reported_missing.insert(identifier.clone()) {
                missing.push(identifier.clone());
            }
        }
        missing
    }

    fn initial_state(self: &mut Self, record: &ProductRecord) -> Result<ProductState> {
        if self.destination.is_present(record) {
            info!(identifier = %record.identifier, "Already exists");
            self.already_present.insert(record.identifier.clone());
            return Ok(ProductState::Complete);
        }
        if let Some(reason) = self.destination.failure_reason(&record.identifier) {
            if !self.retry_failed {
                warn!(identifier = %record.identifier, %reason, "Failed in an earlier run, skipping");
                return Ok(ProductState::Failed(reason));
            }
            self.destination.clear_failure(&record.identifier)?;
        }
        Ok(ProductState::Pending)
    }

    async fn stage_tape_products(self: &mut Self, provider: &impl PepsOps, snapshot: &CatalogSnapshot) {
        let collection = self.catalog.query().collection;
        for record in snapshot.records() {
            if record.storage_mode != StorageMode::Tape || !self.is_pending(&record.identifier) {
                continue;
            }
            if self.classifier.trigger_stage(provider, collection, record).await {
                self.states
                    .insert(record.identifier.clone(), ProductState::Staged);
            }
        }
    }

    async fn download_disk_products(
        self: &mut Self,
        provider: &impl PepsOps,
        disk: &[&ProductRecord],
    ) -> Result<()> {
        for &record in disk {
            if !self.is_pending(&record.identifier) {
                continue;
            }
            if self.destination.is_present(record) {
                info!(identifier = %record.identifier, "Already exists");
                self.already_present.insert(record.identifier.clone());
                self.set_state(record, ProductState::Complete);
                continue;
            }
            self.transfer(provider, record).await?;
        }
        Ok(())
    }

    /// Downloads and verifies one product. Only a refused authentication escapes as an error.
    async fn transfer(self: &mut Self, provider: &impl PepsOps, record: &ProductRecord) -> Result<()> {
        let collection = self.catalog.query().collection;
        let temp = self.destination.temp_path();
        info!(identifier = %record.identifier, "Downloading product");
        self.set_state(record, ProductState::Transferring);

        let bytes = match provider.download_to(collection, &record.feature_id, &temp).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(identifier = %record.identifier, "Transfer failed, will retry: {e:#}");
                let _ = fs::remove_file(&temp);
                self.set_state(record, ProductState::Pending);
                return Ok(());
            }
        };

        self.set_state(record, ProductState::Verifying);
        let outcome = self.verifier.verify(record, &temp, bytes)?;
        let state = if outcome.is_complete() {
            ProductState::Complete
        } else if outcome.retry {
            ProductState::Pending
        } else {
            ProductState::Failed(outcome.failure_reason.clone().unwrap_or_default())
        };
        info!(identifier = %record.identifier, bytes, state = ?state, "Transfer finished");
        self.set_state(record, state);
        self.outcomes.push(outcome);
        Ok(())
    }

    fn set_state(self: &mut Self, record: &ProductRecord, state: ProductState) {
        self.states.insert(record.identifier.clone(), state);
    }

    fn is_pending(self: &Self, identifier: &str) -> bool {
        self.states.get(identifier).is_some_and(|s| !s.is_terminal())
    }

    fn pending_count(self: &Self) -> usize {
        self.states.values().filter(|s| !s.is_terminal()).count()
    }

    fn summary(self: &mut Self, cycles: u32) -> RunSummary {
        let mut summary = RunSummary {
            cycles,
            transfers: self.outcomes.len(),
            outcomes: std::mem::take(&mut self.outcomes),
            ..Default::default()
        };
        for identifier in self.order.iter() {
            match self.states.get(identifier) {
                Some(ProductState::Complete) if self.already_present.contains(identifier) => {
                    summary.already_present.push(identifier.clone())
                }
                Some(ProductState::Complete) => summary.completed.push(identifier.clone()),
                Some(ProductState::Failed(reason)) => {
                    summary.failed.push((identifier.clone(), reason.clone()))
                }
                _ => summary.unfinished.push(identifier.clone()),
            }
        }
        summary
    }
}
