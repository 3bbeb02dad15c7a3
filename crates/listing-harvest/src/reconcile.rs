//! Per-epoch reconciliation of network and DOM evidence.
//!
//! [`plan_epoch`] is pure: it decides which rendered items and which direct
//! urls an epoch should consider, given what the harvester and the DOM
//! differencer saw. Deduplication against persisted data happens later, in
//! [`crate::crawl`], because it needs the store.

use std::collections::HashSet;

use serde::Serialize;

use crate::snapshot::{DomSnapshot, RenderedItem};
use crate::types::Epoch;

/// Stable identities already resolved to a decision during this crawl.
///
/// Keys are ancestor ids for rendered items and canonical urls for direct
/// url candidates. The set only grows.
#[derive(Debug, Default)]
pub struct ProcessedTargets {
    keys: HashSet<String>,
}

impl ProcessedTargets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `key` processed. Returns false when it already was.
    pub fn insert(&mut self, key: &str) -> bool {
        if self.keys.contains(key) {
            return false;
        }
        self.keys.insert(key.to_string())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Everything observed for one epoch.
#[derive(Debug, Clone, Copy)]
pub struct EpochEvidence<'a> {
    pub epoch: Epoch,
    pub snapshot: &'a DomSnapshot,
    /// Ids harvested into this epoch's bucket, in arrival order.
    pub bucket: &'a [String],
    /// Recently harvested ids from any epoch, newest first.
    pub buffered: &'a [String],
    /// Urls that became visible across the growth action that opened this epoch.
    pub href_delta: &'a [String],
}

/// The candidates an epoch will evaluate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EpochPlan {
    pub epoch: Epoch,
    /// Rendered items to inspect, in candidate order.
    pub targets: Vec<RenderedItem>,
    /// Delta urls persisted without inspecting an item.
    pub direct_urls: Vec<String>,
    /// Bucket ids with no rendered item this epoch. Left unprocessed.
    pub unmatched: Vec<String>,
}

impl EpochPlan {
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty() && self.direct_urls.is_empty()
    }
}

/// Decide which candidates `evidence.epoch` should evaluate.
pub fn plan_epoch(evidence: EpochEvidence<'_>, processed: &ProcessedTargets) -> EpochPlan {
    let mut plan = EpochPlan {
        epoch: evidence.epoch,
        ..EpochPlan::default()
    };

    if evidence.epoch.is_initial() {
        let mut chosen = HashSet::new();
        for item in &evidence.snapshot.items {
            match item.ancestor_id.as_deref() {
                Some(id) if processed.contains(id) => continue,
                Some(id) if !chosen.insert(id) => continue,
                _ => plan.targets.push(item.clone()),
            }
        }
        return plan;
    }

    let rendered: HashSet<&str> = evidence.snapshot.ancestor_ids().into_iter().collect();
    let from_buffer = evidence
        .buffered
        .iter()
        .filter(|id| rendered.contains(id.as_str()));

    let mut considered = HashSet::new();
    for id in evidence.bucket.iter().chain(from_buffer) {
        if processed.contains(id) || !considered.insert(id.as_str()) {
            continue;
        }
        match evidence.snapshot.find(id) {
            Some(item) => plan.targets.push(item.clone()),
            None => plan.unmatched.push(id.clone()),
        }
    }

    let mut direct = HashSet::new();
    plan.direct_urls = evidence
        .href_delta
        .iter()
        .filter(|url| !processed.contains(url))
        .filter(|url| direct.insert(url.as_str()))
        .cloned()
        .collect();

    plan
}
