//! Network harvester: turns intercepted results payloads into candidate ids.
//!
//! The browser adapter feeds every response it sees into
//! [`HarvestContext::observe`]. Qualifying payloads contribute ids to the
//! bucket of the epoch that is current at observation time and to a bounded
//! ring of recent ids. The context is shared between the listener task and
//! the pagination driver behind an `Arc`; the listener only appends, the
//! driver only reads.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use serde_json::Value;

use crate::types::{normalize_value, Epoch};

/// A response captured from the browsing surface.
#[derive(Debug, Clone)]
pub struct ResponseObservation {
    pub url: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
}

impl ResponseObservation {
    /// Whether the transport content type advertises JSON.
    pub fn is_structured(&self) -> bool {
        self.content_type
            .as_deref()
            .map(|ct| ct.to_ascii_lowercase().contains("json"))
            .unwrap_or(false)
    }
}

/// A listing row lifted from a `results` payload.
#[derive(Debug, Clone, PartialEq)]
pub struct PayloadListing {
    pub id: String,
    pub url: Option<String>,
    /// Every field of the listing, nested values serialized as JSON.
    pub fields: BTreeMap<String, String>,
}

/// Ring of the most recently harvested ids; oldest evicted first.
#[derive(Debug, Clone)]
pub struct HarvestBuffer {
    capacity: usize,
    ids: VecDeque<String>,
}

impl HarvestBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            ids: VecDeque::new(),
        }
    }

    pub fn push(&mut self, id: String) {
        while self.ids.len() >= self.capacity {
            self.ids.pop_front();
        }
        self.ids.push_back(id);
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Ids oldest to newest.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &String> {
        self.ids.iter()
    }

    pub fn clear(&mut self) {
        self.ids.clear();
    }
}

/// Ids listed by a payload.
///
/// A `results` array of objects yields each object's string `id` in order.
/// Any other shape falls back to a depth-first walk collecting every string
/// `id` field, which may include ids that are not listings.
pub fn extract_ids(payload: &Value) -> Vec<String> {
    if let Some(results) = payload.get("results").and_then(Value::as_array) {
        if results.iter().all(Value::is_object) {
            return results
                .iter()
                .filter_map(|item| item.get("id").and_then(Value::as_str))
                .map(String::from)
                .collect();
        }
    }

    let mut ids = Vec::new();
    walk_ids(payload, &mut ids);
    ids
}

fn walk_ids(value: &Value, ids: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            if let Some(Value::String(id)) = map.get("id") {
                ids.push(id.clone());
            }
            for (key, child) in map {
                if key != "id" {
                    walk_ids(child, ids);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                walk_ids(item, ids);
            }
        }
        _ => {}
    }
}

/// Full listing rows from a `{ results: [...] }` payload; other shapes yield none.
pub fn extract_listings(payload: &Value) -> Vec<PayloadListing> {
    let Some(results) = payload.get("results").and_then(Value::as_array) else {
        return Vec::new();
    };

    results
        .iter()
        .filter_map(Value::as_object)
        .filter_map(|item| {
            let id = item.get("id").and_then(Value::as_str)?.to_string();
            let mut fields: BTreeMap<String, String> = item
                .iter()
                .map(|(k, v)| (k.clone(), normalize_value(v)))
                .collect();
            let url = fields
                .get("url")
                .filter(|u| !u.is_empty())
                .map(|u| normalize_scheme(u));
            if let Some(ref u) = url {
                fields.insert("url".to_string(), u.clone());
            }
            Some(PayloadListing { id, url, fields })
        })
        .collect()
}

fn normalize_scheme(url: &str) -> String {
    match url.strip_prefix("//") {
        Some(rest) => format!("https://{rest}"),
        None => url.to_string(),
    }
}

#[derive(Debug)]
struct HarvestState {
    buckets: BTreeMap<Epoch, Vec<String>>,
    bucket_members: HashMap<Epoch, HashSet<String>>,
    buffer: HarvestBuffer,
    listings: HashMap<String, PayloadListing>,
    payloads_seen: u64,
    payloads_rejected: u64,
}

/// Shared harvest session state: arm flag, current epoch, buckets and buffer.
#[derive(Debug)]
pub struct HarvestContext {
    endpoint: String,
    armed: AtomicBool,
    epoch: AtomicU64,
    state: Mutex<HarvestState>,
}

impl HarvestContext {
    /// Create a disarmed context matching responses whose url contains `endpoint`.
    pub fn new(endpoint: &str, buffer_capacity: usize) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            armed: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            state: Mutex::new(HarvestState {
                buckets: BTreeMap::new(),
                bucket_members: HashMap::new(),
                buffer: HarvestBuffer::new(buffer_capacity),
                listings: HashMap::new(),
                payloads_seen: 0,
                payloads_rejected: 0,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, HarvestState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start trusting responses. Called once the search has been submitted.
    pub fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    pub fn disarm(&self) {
        self.armed.store(false, Ordering::SeqCst);
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }

    /// Attribute subsequent observations to `epoch`.
    pub fn set_epoch(&self, epoch: Epoch) {
        self.epoch.store(epoch.0, Ordering::SeqCst);
    }

    pub fn current_epoch(&self) -> Epoch {
        Epoch(self.epoch.load(Ordering::SeqCst))
    }

    /// Whether a response is one the harvester should parse.
    pub fn matches(&self, url: &str, content_type: Option<&str>) -> bool {
        url.contains(&self.endpoint)
            && content_type
                .map(|ct| ct.to_ascii_lowercase().contains("json"))
                .unwrap_or(false)
    }

    /// Feed one response. Returns how many ids it contributed; never fails.
    pub fn observe(&self, response: &ResponseObservation) -> usize {
        if !self.is_armed() {
            return 0;
        }
        if !response.url.contains(&self.endpoint) || !response.is_structured() {
            return 0;
        }
        if !(200..300).contains(&response.status) {
            tracing::debug!(
                "Ignoring results response with status {}: {}",
                response.status,
                response.url
            );
            return 0;
        }

        match serde_json::from_str::<Value>(&response.body) {
            Ok(payload) => self.ingest(&payload),
            Err(e) => {
                self.state().payloads_rejected += 1;
                tracing::debug!("Skipping unparseable results payload from {}: {e}", response.url);
                0
            }
        }
    }

    /// Record the ids and listings of a parsed payload under the current epoch.
    pub fn ingest(&self, payload: &Value) -> usize {
        let ids = extract_ids(payload);
        let listings = extract_listings(payload);
        let epoch = self.current_epoch();

        let mut state = self.state();
        state.payloads_seen += 1;
        for listing in listings {
            state.listings.insert(listing.id.clone(), listing);
        }

        let mut added = 0;
        for id in ids {
            if id.is_empty() {
                continue;
            }
            state.buffer.push(id.clone());
            let is_new = state
                .bucket_members
                .entry(epoch)
                .or_default()
                .insert(id.clone());
            if is_new {
                state.buckets.entry(epoch).or_default().push(id);
                added += 1;
            }
        }

        tracing::debug!(epoch = epoch.0, added, "Harvested results payload");
        added
    }

    /// Ids harvested for `epoch`, in arrival order.
    pub fn epoch_ids(&self, epoch: Epoch) -> Vec<String> {
        self.state().buckets.get(&epoch).cloned().unwrap_or_default()
    }

    pub fn has_ids(&self, epoch: Epoch) -> bool {
        self.state()
            .buckets
            .get(&epoch)
            .map(|b| !b.is_empty())
            .unwrap_or(false)
    }

    /// Distinct buffered ids, newest first.
    pub fn recent_ids(&self) -> Vec<String> {
        let state = self.state();
        let mut seen = HashSet::new();
        state
            .buffer
            .iter()
            .rev()
            .filter(|id| seen.insert(id.as_str()))
            .cloned()
            .collect()
    }

    pub fn buffer_len(&self) -> usize {
        self.state().buffer.len()
    }

    /// Payload listing captured for `id`, if any.
    pub fn listing(&self, id: &str) -> Option<PayloadListing> {
        self.state().listings.get(id).cloned()
    }

    /// (payloads parsed, payloads rejected) since the last reset.
    pub fn payload_counts(&self) -> (u64, u64) {
        let state = self.state();
        (state.payloads_seen, state.payloads_rejected)
    }

    /// Disarm and drop all per-target state before the next make/model crawl.
    pub fn reset(&self) {
        self.disarm();
        self.set_epoch(Epoch::INITIAL);
        let mut state = self.state();
        state.buckets.clear();
        state.bucket_members.clear();
        state.buffer.clear();
        state.listings.clear();
        state.payloads_seen = 0;
        state.payloads_rejected = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn response(url: &str, body: &str) -> ResponseObservation {
        ResponseObservation {
            url: url.to_string(),
            status: 200,
            content_type: Some("application/json; charset=utf-8".to_string()),
            body: body.to_string(),
        }
    }

    #[test]
    fn test_extract_ids_from_results() {
        let payload = json!({
            "status": 0,
            "results": [{"id": "a", "url": "/x/a"}, {"id": "b"}, {"title": "no id"}]
        });
        assert_eq!(extract_ids(&payload), vec!["a", "b"]);
    }

    #[test]
    fn test_extract_ids_generic_walk() {
        let payload = json!({
            "data": {"listings": [{"id": "a", "dealer": {"id": "d1"}}, {"id": 7}]},
            "id": "root"
        });
        assert_eq!(extract_ids(&payload), vec!["root", "a", "d1"]);
    }

    #[test]
    fn test_results_with_non_objects_falls_back_to_walk() {
        let payload = json!({"results": ["a", {"id": "b"}]});
        assert_eq!(extract_ids(&payload), vec!["b"]);
    }

    #[test]
    fn test_extract_listings_normalizes_fields() {
        let payload = json!({
            "results": [{"id": "a", "url": "//cars.example/a", "price": 100, "history": [1, 2]}]
        });
        let listings = extract_listings(&payload);
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].url.as_deref(), Some("https://cars.example/a"));
        assert_eq!(listings[0].fields["price"], "100");
        assert_eq!(listings[0].fields["history"], "[1,2]");
    }

    #[test]
    fn test_buffer_evicts_oldest() {
        let mut buffer = HarvestBuffer::new(3);
        for id in ["a", "b", "c", "d", "e"] {
            buffer.push(id.to_string());
        }
        assert_eq!(buffer.len(), 3);
        let kept: Vec<&str> = buffer.iter().map(String::as_str).collect();
        assert_eq!(kept, vec!["c", "d", "e"]);
    }

    #[test]
    fn test_buffer_bounded_under_heavy_harvest() {
        let ctx = HarvestContext::new("/api/trends/results", 50);
        ctx.arm();
        for page in 0..20 {
            let results: Vec<Value> = (0..10).map(|i| json!({"id": format!("{page}-{i}")})).collect();
            ctx.ingest(&json!({ "results": results }));
        }
        assert_eq!(ctx.buffer_len(), 50);
        let recent = ctx.recent_ids();
        assert_eq!(recent[0], "19-9");
        assert!(!recent.contains(&"14-9".to_string()));
    }

    #[test]
    fn test_recent_ids_are_distinct_newest_first() {
        let ctx = HarvestContext::new("/r", 10);
        ctx.arm();
        ctx.ingest(&json!({"results": [{"id": "a"}, {"id": "b"}]}));
        ctx.set_epoch(Epoch(1));
        ctx.ingest(&json!({"results": [{"id": "c"}, {"id": "a"}]}));

        assert_eq!(ctx.buffer_len(), 4);
        assert_eq!(ctx.recent_ids(), vec!["a", "c", "b"]);
    }

    #[test]
    fn test_disarmed_context_ignores_responses() {
        let ctx = HarvestContext::new("/api/trends/results", 10);
        let resp = response("https://site/api/trends/results?p=1", r#"{"results":[{"id":"a"}]}"#);
        assert_eq!(ctx.observe(&resp), 0);
        ctx.arm();
        assert_eq!(ctx.observe(&resp), 1);
        assert_eq!(ctx.epoch_ids(Epoch(0)), vec!["a"]);
    }

    #[test]
    fn test_observe_filters_url_type_and_status() {
        let ctx = HarvestContext::new("/api/trends/results", 10);
        ctx.arm();
        let body = r#"{"results":[{"id":"a"}]}"#;

        assert_eq!(ctx.observe(&response("https://site/api/other", body)), 0);

        let mut html = response("https://site/api/trends/results", body);
        html.content_type = Some("text/html".into());
        assert_eq!(ctx.observe(&html), 0);

        let mut failed = response("https://site/api/trends/results", body);
        failed.status = 500;
        assert_eq!(ctx.observe(&failed), 0);

        assert_eq!(ctx.observe(&response("https://site/api/trends/results", "{not json")), 0);
        assert_eq!(ctx.payload_counts(), (0, 1));
    }

    #[test]
    fn test_ids_bucketed_by_current_epoch() {
        let ctx = HarvestContext::new("/r", 10);
        ctx.arm();
        ctx.ingest(&json!({"results": [{"id": "a"}]}));
        ctx.set_epoch(Epoch(1));
        ctx.ingest(&json!({"results": [{"id": "b"}, {"id": "b"}, {"id": "c"}]}));

        assert_eq!(ctx.epoch_ids(Epoch(0)), vec!["a"]);
        assert_eq!(ctx.epoch_ids(Epoch(1)), vec!["b", "c"]);
        assert!(!ctx.has_ids(Epoch(2)));
    }

    #[test]
    fn test_reset_clears_target_state() {
        let ctx = HarvestContext::new("/r", 10);
        ctx.arm();
        ctx.set_epoch(Epoch(3));
        ctx.ingest(&json!({"results": [{"id": "a"}]}));
        ctx.reset();
        assert!(!ctx.is_armed());
        assert_eq!(ctx.current_epoch(), Epoch(0));
        assert_eq!(ctx.buffer_len(), 0);
        assert!(ctx.listing("a").is_none());
    }
}
