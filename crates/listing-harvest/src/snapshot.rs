//! DOM snapshots of the results grid and the deltas between epochs.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::types::Epoch;

/// One item as currently rendered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedItem {
    /// Index in document order. Not an identity: virtualization reuses slots.
    pub position: usize,
    /// Stable identifier from the nearest ancestor carrying the id attribute.
    pub ancestor_id: Option<String>,
    /// Absolute href readable without scrolling the item into view.
    pub early_href: Option<String>,
}

/// Ordered view of the rendered items at one instant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomSnapshot {
    pub items: Vec<RenderedItem>,
}

impl DomSnapshot {
    pub fn new(items: Vec<RenderedItem>) -> Self {
        Self { items }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// First rendered item whose ancestor id equals `id`.
    pub fn find(&self, id: &str) -> Option<&RenderedItem> {
        self.items
            .iter()
            .find(|item| item.ancestor_id.as_deref() == Some(id))
    }

    /// Distinct ancestor ids in document order.
    pub fn ancestor_ids(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.items
            .iter()
            .filter_map(|item| item.ancestor_id.as_deref())
            .filter(|id| seen.insert(*id))
            .collect()
    }
}

/// Ancestor ids that appeared and vanished between two snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SnapshotDelta {
    pub appeared: Vec<String>,
    pub vanished: Vec<String>,
}

impl SnapshotDelta {
    pub fn is_empty(&self) -> bool {
        self.appeared.is_empty() && self.vanished.is_empty()
    }
}

/// Compare two snapshots by ancestor id, ignoring positions.
pub fn diff(previous: &DomSnapshot, current: &DomSnapshot) -> SnapshotDelta {
    let before: HashSet<&str> = previous.ancestor_ids().into_iter().collect();
    let after: HashSet<&str> = current.ancestor_ids().into_iter().collect();

    SnapshotDelta {
        appeared: current
            .ancestor_ids()
            .into_iter()
            .filter(|id| !before.contains(id))
            .map(String::from)
            .collect(),
        vanished: previous
            .ancestor_ids()
            .into_iter()
            .filter(|id| !after.contains(id))
            .map(String::from)
            .collect(),
    }
}

/// Hrefs visible after a growth action that were not visible before, in `post` order.
pub fn href_delta(pre: &[String], post: &[String]) -> Vec<String> {
    let before: HashSet<&str> = pre.iter().map(String::as_str).collect();
    let mut emitted = HashSet::new();
    post.iter()
        .filter(|href| !href.is_empty())
        .filter(|href| !before.contains(href.as_str()))
        .filter(|href| emitted.insert(href.as_str()))
        .cloned()
        .collect()
}

/// Per-target record of what each epoch made visible.
#[derive(Debug, Default)]
pub struct DomDifferencer {
    last: Option<DomSnapshot>,
    href_deltas: BTreeMap<Epoch, Vec<String>>,
}

impl DomDifferencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the href delta observed across the growth action that opened `epoch`.
    pub fn record_hrefs(&mut self, epoch: Epoch, pre: &[String], post: &[String]) -> &[String] {
        let delta = href_delta(pre, post);
        tracing::debug!(epoch = epoch.0, delta = delta.len(), "Computed href delta");
        self.href_deltas.entry(epoch).or_default().extend(delta);
        self.href_deltas
            .get(&epoch)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn href_delta(&self, epoch: Epoch) -> &[String] {
        self.href_deltas
            .get(&epoch)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Remember `snapshot` and return its delta against the previous one.
    pub fn observe(&mut self, snapshot: &DomSnapshot) -> SnapshotDelta {
        let delta = match &self.last {
            Some(previous) => diff(previous, snapshot),
            None => diff(&DomSnapshot::default(), snapshot),
        };
        self.last = Some(snapshot.clone());
        delta
    }
}
