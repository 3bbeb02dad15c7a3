//! Per-target crawl state: turns epoch plans into persisted records.

use std::collections::HashSet;

use serde::Serialize;

use crate::extract::{ItemDiagnostics, RecordExtractor};
use crate::harvest::HarvestContext;
use crate::reconcile::{EpochPlan, ProcessedTargets};
use crate::snapshot::RenderedItem;
use crate::store::ListingStore;
use crate::surface::ResultsSurface;
use crate::types::{Epoch, Identity, Record};

/// Counters for one make/model crawl.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TargetStats {
    /// Identities that reached a decision.
    pub processed: usize,
    /// Rows added to the store.
    pub saved: usize,
    /// Candidates whose url or id was already known.
    pub duplicates: usize,
    pub no_usable_link: usize,
    /// Items the surface failed to inspect.
    pub failed_items: usize,
    /// Harvested ids that never matched a rendered item in their epoch.
    pub unmatched: usize,
    pub write_failures: usize,
}

/// Result of reconciling one epoch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EpochOutcome {
    pub epoch: Epoch,
    pub candidates: usize,
    pub new_records: usize,
    pub saved: usize,
}

enum Resolution {
    Url(String),
    NoLink(ItemDiagnostics),
}

/// Crawl state for one make/model, discarded when the target finishes.
pub struct TargetCrawl<'a> {
    make: String,
    model: String,
    extractor: &'a RecordExtractor,
    processed: ProcessedTargets,
    session_urls: HashSet<String>,
    pending: Vec<Record>,
    stats: TargetStats,
}

impl<'a> TargetCrawl<'a> {
    pub fn new(make: &str, model: &str, extractor: &'a RecordExtractor) -> Self {
        Self {
            make: make.to_string(),
            model: model.to_string(),
            extractor,
            processed: ProcessedTargets::new(),
            session_urls: HashSet::new(),
            pending: Vec::new(),
            stats: TargetStats::default(),
        }
    }

    pub fn processed(&self) -> &ProcessedTargets {
        &self.processed
    }

    pub fn stats(&self) -> &TargetStats {
        &self.stats
    }

    /// Records whose write failed and will be retried.
    pub fn pending(&self) -> &[Record] {
        &self.pending
    }

    fn is_known_url(&self, url: &str, store: &ListingStore) -> bool {
        self.session_urls.contains(url) || store.contains_url(url)
    }

    /// Extract and persist everything `plan` selected.
    pub async fn run_epoch<S>(
        &mut self,
        surface: &S,
        harvest: &HarvestContext,
        store: &mut ListingStore,
        plan: &EpochPlan,
    ) -> EpochOutcome
    where
        S: ResultsSurface + ?Sized,
    {
        let mut batch = Vec::new();
        self.stats.unmatched += plan.unmatched.len();
        if !plan.unmatched.is_empty() {
            tracing::debug!(
                epoch = plan.epoch.0,
                unmatched = plan.unmatched.len(),
                "Harvested ids not rendered yet"
            );
        }

        for item in &plan.targets {
            if let Some(record) = self.consider_item(surface, harvest, store, item).await {
                batch.push(record);
            }
        }

        // Urls already decided through an item are processed keys, so the
        // delta copy of the same listing is skipped without counting.
        let mut direct = Vec::new();
        for href in &plan.direct_urls {
            let Some(url) = self.extractor.canonicalize(href) else {
                continue;
            };
            if !self.processed.insert(&url) {
                continue;
            }
            self.stats.processed += 1;
            if self.is_known_url(&url, store) {
                self.stats.duplicates += 1;
                continue;
            }
            self.session_urls.insert(url.clone());
            direct.push(Record::new(&self.make, &self.model, None, url));
        }
        batch.extend(direct);

        let outcome = EpochOutcome {
            epoch: plan.epoch,
            candidates: plan.targets.len() + plan.direct_urls.len(),
            new_records: batch.len(),
            saved: self.persist(store, batch),
        };
        tracing::info!(
            make = %self.make,
            model = %self.model,
            epoch = outcome.epoch.0,
            candidates = outcome.candidates,
            saved = outcome.saved,
            "Epoch reconciled"
        );
        outcome
    }

    async fn consider_item<S>(
        &mut self,
        surface: &S,
        harvest: &HarvestContext,
        store: &ListingStore,
        item: &RenderedItem,
    ) -> Option<Record>
    where
        S: ResultsSurface + ?Sized,
    {
        if let Some(id) = item.ancestor_id.as_deref() {
            if !self.processed.insert(id) {
                return None;
            }
        }
        self.stats.processed += 1;

        if let Some(href) = item.early_href.as_deref() {
            if let Some(url) = self.extractor.canonicalize(href) {
                if self.is_known_url(&url, store) {
                    self.processed.insert(&url);
                    self.stats.duplicates += 1;
                    return None;
                }
            }
        }

        let html = match surface.inspect(item).await {
            Ok(Some(html)) => html,
            Ok(None) => {
                self.stats.failed_items += 1;
                tracing::debug!(position = item.position, "Item no longer rendered");
                return None;
            }
            Err(e) => {
                self.stats.failed_items += 1;
                tracing::warn!(position = item.position, "Failed to inspect item: {e:#}");
                return None;
            }
        };

        let url = match self.resolve(&html) {
            Resolution::Url(url) => url,
            Resolution::NoLink(diagnostics) => {
                self.stats.no_usable_link += 1;
                tracing::warn!(
                    position = item.position,
                    id = item.ancestor_id.as_deref().unwrap_or(""),
                    attributes = ?diagnostics.attributes,
                    text = %diagnostics.text_snippet,
                    tags = ?diagnostics.child_tags,
                    "No usable link in result item"
                );
                return None;
            }
        };

        self.processed.insert(&url);
        let identity = Identity {
            id: item.ancestor_id.clone(),
            url,
        };
        if store.contains(&identity) || self.session_urls.contains(&identity.url) {
            self.stats.duplicates += 1;
            return None;
        }

        self.session_urls.insert(identity.url.clone());
        let mut record = Record::new(&self.make, &self.model, identity.id, identity.url);
        if let Some(listing) = item.ancestor_id.as_deref().and_then(|id| harvest.listing(id)) {
            record = record.with_extra(listing.fields);
        }
        Some(record)
    }

    fn resolve(&self, html: &str) -> Resolution {
        let fragment = self.extractor.parse(html);
        match self.extractor.resolve_href(&fragment) {
            Some(url) => Resolution::Url(url),
            None => Resolution::NoLink(fragment.diagnostics()),
        }
    }

    /// Write `batch` together with any previously failed records.
    fn persist(&mut self, store: &mut ListingStore, batch: Vec<Record>) -> usize {
        let mut records = std::mem::take(&mut self.pending);
        records.extend(batch);
        if records.is_empty() {
            return 0;
        }

        match store.merge_and_write(&records) {
            Ok(summary) => {
                self.stats.saved += summary.added;
                summary.added
            }
            Err(e) => {
                self.stats.write_failures += 1;
                tracing::error!(
                    pending = records.len(),
                    path = %store.path().display(),
                    "Failed to persist batch, will retry: {e}"
                );
                self.pending = records;
                0
            }
        }
    }

    /// Retry pending writes and return the final counters.
    pub fn finish(mut self, store: &mut ListingStore) -> TargetStats {
        if !self.pending.is_empty() {
            self.persist(store, Vec::new());
        }
        if !self.pending.is_empty() {
            tracing::error!(
                make = %self.make,
                model = %self.model,
                lost = self.pending.len(),
                "Dropping records that could not be persisted"
            );
        }
        self.stats
    }
}
