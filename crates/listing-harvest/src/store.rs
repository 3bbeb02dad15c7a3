//! Schema-flexible CSV listing store and the cross-run seen index.
//!
//! The store keeps the whole table in memory and rewrites the file on every
//! merge. Writes go to a temp file in the same directory and are renamed into
//! place, so a failed merge leaves both the file and the in-memory state as
//! they were.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tempfile::NamedTempFile;

use crate::types::{HarvestError, HarvestResult, Identity, Record, LEADING_COLUMNS};

/// Every `id` and `url` ever persisted.
#[derive(Debug, Clone, Default)]
pub struct SeenIndex {
    ids: HashSet<String>,
    urls: HashSet<String>,
}

impl SeenIndex {
    pub fn contains_url(&self, url: &str) -> bool {
        self.urls.contains(url)
    }

    pub fn contains_id(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn url_count(&self) -> usize {
        self.urls.len()
    }

    pub fn id_count(&self) -> usize {
        self.ids.len()
    }

    fn insert(&mut self, id: Option<&str>, url: &str) {
        if let Some(id) = id.filter(|s| !s.is_empty()) {
            self.ids.insert(id.to_string());
        }
        if !url.is_empty() {
            self.urls.insert(url.to_string());
        }
    }
}

/// Outcome of one [`ListingStore::merge_and_write`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeSummary {
    /// Rows added to the store by this batch.
    pub added: usize,
    /// Batch rows dropped because their key was already present.
    pub dropped: usize,
    pub total_rows: usize,
    pub total_columns: usize,
}

/// Aggregate view of the store contents.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub rows: usize,
    pub columns: Vec<String>,
    /// Row count per `model` value.
    pub per_model: BTreeMap<String, usize>,
}

/// Dedupe key: `id` when present, else `url`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum RowKey {
    Id(String),
    Url(String),
}

/// The persisted listing table.
pub struct ListingStore {
    path: PathBuf,
    columns: Vec<String>,
    rows: Vec<Vec<String>>,
    seen: SeenIndex,
}

impl ListingStore {
    /// Open the store at `path`, loading prior rows and rebuilding the seen index.
    ///
    /// A missing file yields an empty store; nothing is created until the first
    /// non-empty merge.
    pub fn open(path: impl AsRef<Path>) -> HarvestResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut store = Self {
            path,
            columns: Vec::new(),
            rows: Vec::new(),
            seen: SeenIndex::default(),
        };

        if !store.path.exists() {
            tracing::info!("No existing store at {}, starting empty", store.path.display());
            return Ok(store);
        }

        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(&store.path)?;
        store.columns = reader.headers()?.iter().map(String::from).collect();

        let width = store.columns.len();
        for result in reader.records() {
            let record = result?;
            let mut row: Vec<String> = record.iter().map(String::from).collect();
            row.resize(width, String::new());
            store.rows.push(row);
        }

        let id_col = store.column_index("id");
        let url_col = store.column_index("url");
        for row in &store.rows {
            let id = id_col.map(|i| row[i].as_str());
            let url = url_col.map(|i| row[i].as_str()).unwrap_or("");
            store.seen.insert(id, url);
        }

        tracing::info!(
            "Loaded existing store '{}': {} rows, {} IDs, {} URLs",
            store.path.display(),
            store.rows.len(),
            store.seen.id_count(),
            store.seen.url_count()
        );
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn seen(&self) -> &SeenIndex {
        &self.seen
    }

    /// Whether the identity's id or its url has been persisted.
    pub fn contains(&self, identity: &Identity) -> bool {
        identity
            .id
            .as_deref()
            .is_some_and(|id| self.seen.contains_id(id))
            || self.seen.contains_url(&identity.url)
    }

    pub fn contains_url(&self, url: &str) -> bool {
        self.seen.contains_url(url)
    }

    pub fn contains_id(&self, id: &str) -> bool {
        self.seen.contains_id(id)
    }

    /// Merge `batch` into the store and rewrite the file.
    ///
    /// Columns are unioned (missing cells become empty) and rows are deduplicated
    /// on `id`-else-`url` keeping the first occurrence. `added` counts only the
    /// batch rows that survive, and only those enter the seen index, after the
    /// file has been replaced. Values already in the index stay there even when
    /// an older row sharing a key is collapsed.
    pub fn merge_and_write(&mut self, batch: &[Record]) -> HarvestResult<MergeSummary> {
        if batch.is_empty() {
            return Ok(MergeSummary {
                total_rows: self.rows.len(),
                total_columns: self.columns.len(),
                ..MergeSummary::default()
            });
        }

        if let Some(bad) = batch.iter().find(|r| r.url.trim().is_empty()) {
            return Err(HarvestError::InvalidRecord(format!(
                "record for {} {} (id {:?}) has no url",
                bad.make, bad.model, bad.id
            )));
        }

        let columns = union_columns(&self.columns, batch);
        let mut merged: Vec<Vec<String>> = Vec::with_capacity(self.rows.len() + batch.len());

        let old_positions: Vec<Option<usize>> = columns
            .iter()
            .map(|c| self.columns.iter().position(|old| old == c))
            .collect();
        for row in &self.rows {
            merged.push(
                old_positions
                    .iter()
                    .map(|pos| pos.map(|i| row[i].clone()).unwrap_or_default())
                    .collect(),
            );
        }
        for record in batch {
            merged.push(columns.iter().map(|c| record.field(c).to_string()).collect());
        }

        let existing = self.rows.len();
        let keep = dedupe_by_key(&columns, &merged);
        let survivors: Vec<&Record> = batch
            .iter()
            .zip(&keep[existing..])
            .filter_map(|(record, kept)| kept.then_some(record))
            .collect();
        let added = survivors.len();
        let dropped = batch.len() - added;
        let collapsed = keep[..existing].iter().filter(|kept| !**kept).count();

        let merged: Vec<Vec<String>> = merged
            .into_iter()
            .zip(&keep)
            .filter_map(|(row, kept)| kept.then_some(row))
            .collect();

        write_atomically(&self.path, &columns, &merged)?;

        self.columns = columns;
        self.rows = merged;
        for record in survivors {
            self.seen.insert(record.id.as_deref(), &record.url);
        }
        if collapsed > 0 {
            tracing::warn!(
                "Collapsed {collapsed} stored rows sharing a key with an earlier row in '{}'",
                self.path.display()
            );
        }

        tracing::info!(
            "Wrote store '{}' with {} rows and {} columns (+{added})",
            self.path.display(),
            self.rows.len(),
            self.columns.len()
        );

        Ok(MergeSummary {
            added,
            dropped,
            total_rows: self.rows.len(),
            total_columns: self.columns.len(),
        })
    }

    /// Remove exact duplicate rows, rewriting the file only when something was removed.
    pub fn compact(&mut self) -> HarvestResult<usize> {
        let mut seen_rows: HashSet<&Vec<String>> = HashSet::new();
        let mut keep = Vec::with_capacity(self.rows.len());
        for (i, row) in self.rows.iter().enumerate() {
            if seen_rows.insert(row) {
                keep.push(i);
            }
        }
        let removed = self.rows.len() - keep.len();
        if removed == 0 {
            return Ok(0);
        }

        let compacted: Vec<Vec<String>> = keep.into_iter().map(|i| self.rows[i].clone()).collect();
        write_atomically(&self.path, &self.columns, &compacted)?;
        self.rows = compacted;
        Ok(removed)
    }

    pub fn stats(&self) -> StoreStats {
        let mut per_model = BTreeMap::new();
        if let Some(model_col) = self.column_index("model") {
            for row in &self.rows {
                *per_model.entry(row[model_col].clone()).or_insert(0) += 1;
            }
        }
        StoreStats {
            rows: self.rows.len(),
            columns: self.columns.clone(),
            per_model,
        }
    }

    /// Rows whose `column` equals `value`, as column → cell maps.
    pub fn rows_where(&self, column: &str, value: &str) -> Vec<BTreeMap<String, String>> {
        let Some(idx) = self.column_index(column) else {
            return Vec::new();
        };
        self.rows
            .iter()
            .filter(|row| row[idx] == value)
            .map(|row| {
                self.columns
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect()
            })
            .collect()
    }

    fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }
}

/// Leading columns first, then every other column name sorted.
fn union_columns(existing: &[String], batch: &[Record]) -> Vec<String> {
    let mut rest: BTreeSet<String> = BTreeSet::new();
    for column in existing {
        if !LEADING_COLUMNS.contains(&column.as_str()) {
            rest.insert(column.clone());
        }
    }
    for record in batch {
        rest.extend(record.extra.keys().cloned());
    }

    LEADING_COLUMNS
        .iter()
        .map(|c| c.to_string())
        .chain(rest)
        .collect()
}

/// Keep mask over `rows`: the first row per `id`-else-`url` key survives.
fn dedupe_by_key(columns: &[String], rows: &[Vec<String>]) -> Vec<bool> {
    let id_col = columns.iter().position(|c| c == "id");
    let url_col = columns.iter().position(|c| c == "url");
    let mut keys: HashSet<RowKey> = HashSet::new();

    rows.iter()
        .map(|row| {
            let id = id_col.map(|c| row[c].as_str()).unwrap_or("");
            let key = if !id.is_empty() {
                RowKey::Id(id.to_string())
            } else {
                RowKey::Url(url_col.map(|c| row[c].clone()).unwrap_or_default())
            };
            keys.insert(key)
        })
        .collect()
}

fn write_atomically(path: &Path, columns: &[String], rows: &[Vec<String>]) -> HarvestResult<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;

    let mut tmp = NamedTempFile::new_in(parent)?;
    {
        let mut writer = csv::Writer::from_writer(&mut tmp);
        writer.write_record(columns)?;
        for row in rows {
            writer.write_record(row)?;
        }
        writer.flush()?;
    }
    tmp.persist(path).map_err(|e| HarvestError::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(id: Option<&str>, url: &str) -> Record {
        Record::new("Porsche", "911", id.map(String::from), url.to_string())
    }

    fn record_with(id: Option<&str>, url: &str, key: &str, value: &str) -> Record {
        let mut extra = BTreeMap::new();
        extra.insert(key.to_string(), value.to_string());
        record(id, url).with_extra(extra)
    }

    #[test]
    fn test_open_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = ListingStore::open(dir.path().join("nested/listings.csv")).unwrap();
        assert!(store.is_empty());
        assert_eq!(store.seen().url_count(), 0);
    }

    #[test]
    fn test_empty_batch_is_noop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("listings.csv");
        let mut store = ListingStore::open(&path).unwrap();
        let summary = store.merge_and_write(&[]).unwrap();
        assert_eq!(summary.added, 0);
        assert!(!path.exists());
    }

    #[test]
    fn test_union_merge_backfills_old_rows() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("listings.csv");
        let mut store = ListingStore::open(&path).unwrap();
        store
            .merge_and_write(&[record_with(Some("a"), "https://x/a", "price", "100")])
            .unwrap();
        store
            .merge_and_write(&[record_with(Some("b"), "https://x/b", "vin", "WP0B")])
            .unwrap();

        assert_eq!(store.columns(), &["make", "model", "id", "url", "price", "vin"]);

        let reopened = ListingStore::open(&path).unwrap();
        let a = reopened.rows_where("id", "a");
        assert_eq!(a.len(), 1);
        assert_eq!(a[0]["price"], "100");
        assert_eq!(a[0]["vin"], "");
        let b = reopened.rows_where("id", "b");
        assert_eq!(b[0]["price"], "");
        assert_eq!(b[0]["vin"], "WP0B");
    }

    #[test]
    fn test_dedupe_prefers_id_then_url() {
        let dir = TempDir::new().unwrap();
        let mut store = ListingStore::open(dir.path().join("listings.csv")).unwrap();
        let summary = store
            .merge_and_write(&[
                record(Some("a"), "https://x/1"),
                record(Some("a"), "https://x/2"),
                record(None, "https://x/3"),
                record(None, "https://x/3"),
            ])
            .unwrap();
        assert_eq!(summary.added, 2);
        assert_eq!(summary.dropped, 2);
        assert_eq!(store.rows_where("id", "a")[0]["url"], "https://x/1");
        assert!(!store.contains_url("https://x/2"));
    }

    #[test]
    fn test_legacy_rows_sharing_an_id_do_not_skew_added() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("listings.csv");
        std::fs::write(
            &path,
            "make,model,id,url\nPorsche,911,a,https://x/a1\nPorsche,911,a,https://x/a2\n",
        )
        .unwrap();

        let mut store = ListingStore::open(&path).unwrap();
        let summary = store
            .merge_and_write(&[record(Some("b"), "https://x/b"), record(Some("a"), "https://x/a3")])
            .unwrap();

        assert_eq!(summary.added, 1);
        assert_eq!(summary.dropped, 1);
        assert_eq!(summary.total_rows, 2);
        let a = store.rows_where("id", "a");
        assert_eq!(a.len(), 1);
        assert_eq!(a[0]["url"], "https://x/a1");
        assert!(store.contains_url("https://x/b"));
        assert!(!store.contains_url("https://x/a3"));

        let reopened = ListingStore::open(&path).unwrap();
        assert_eq!(reopened.len(), 2);
    }

    #[test]
    fn test_reopen_rebuilds_seen_index() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("listings.csv");
        {
            let mut store = ListingStore::open(&path).unwrap();
            store
                .merge_and_write(&[record(Some("a"), "https://x/a"), record(None, "https://x/b")])
                .unwrap();
        }
        let store = ListingStore::open(&path).unwrap();
        assert!(store.contains_url("https://x/a"));
        assert!(store.contains_url("https://x/b"));
        assert!(store.contains_id("a"));
        assert!(!store.contains_id(""));
        assert!(store.contains(&Identity {
            id: Some("a".into()),
            url: "https://x/new".into()
        }));
        assert!(!store.contains(&Identity {
            id: None,
            url: "https://x/new".into()
        }));
        assert_eq!(store.seen().id_count(), 1);
    }

    #[test]
    fn test_rejects_record_without_url() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("listings.csv");
        let mut store = ListingStore::open(&path).unwrap();
        let err = store
            .merge_and_write(&[record(Some("a"), "https://x/a"), record(Some("b"), " ")])
            .unwrap_err();
        assert!(matches!(err, HarvestError::InvalidRecord(_)));
        assert!(store.is_empty());
        assert!(!store.contains_url("https://x/a"));
        assert!(!path.exists());
    }

    #[test]
    fn test_failed_write_leaves_state_untouched() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("listings.csv");
        let mut store = ListingStore::open(&path).unwrap();
        store.merge_and_write(&[record(Some("a"), "https://x/a")]).unwrap();

        // Replace the file with a non-empty directory so the rename fails.
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("blocker"), b"x").unwrap();

        let result = store.merge_and_write(&[record(Some("b"), "https://x/b")]);
        assert!(result.is_err());
        assert_eq!(store.len(), 1);
        assert!(!store.contains_url("https://x/b"));
        assert!(!store.contains_id("b"));
    }

    #[test]
    fn test_compact_removes_exact_duplicates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("listings.csv");
        std::fs::write(
            &path,
            "make,model,id,url\nPorsche,911,,https://x/1\nPorsche,911,,https://x/1\nPorsche,911,,https://x/2\n",
        )
        .unwrap();

        let mut store = ListingStore::open(&path).unwrap();
        assert_eq!(store.len(), 3);
        assert_eq!(store.compact().unwrap(), 1);
        assert_eq!(store.compact().unwrap(), 0);
        assert_eq!(ListingStore::open(&path).unwrap().len(), 2);
    }

    #[test]
    fn test_short_rows_are_padded() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("listings.csv");
        std::fs::write(&path, "make,model,id,url,vin\nPorsche,911,a,https://x/a\n").unwrap();
        let store = ListingStore::open(&path).unwrap();
        assert_eq!(store.rows_where("id", "a")[0]["vin"], "");
    }

    #[test]
    fn test_stats_counts_per_model() {
        let dir = TempDir::new().unwrap();
        let mut store = ListingStore::open(dir.path().join("listings.csv")).unwrap();
        let mut cayman = record(None, "https://x/c");
        cayman.model = "Cayman".into();
        store
            .merge_and_write(&[record(None, "https://x/a"), record(None, "https://x/b"), cayman])
            .unwrap();
        let stats = store.stats();
        assert_eq!(stats.rows, 3);
        assert_eq!(stats.per_model["911"], 2);
        assert_eq!(stats.per_model["Cayman"], 1);
    }
}
