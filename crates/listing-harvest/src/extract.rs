//! Record extraction: resolve a rendered item's markup to a canonical url.
//!
//! Markup varies between result cards, so the href is resolved by an ordered
//! chain of [`HrefStrategy`] values. The first strategy that yields a usable
//! href wins. When none does, [`ItemDiagnostics`] describes the item for the
//! log so the selectors can be updated.

use std::collections::{BTreeMap, BTreeSet};

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::Serialize;
use url::Url;

use crate::config::{parse_selector, HarvestConfig};
use crate::types::{HarvestError, HarvestResult};

const SNIPPET_CHARS: usize = 160;

/// Resolve `href` against `origin` into an absolute http(s) url.
///
/// Empty, fragment-only and `javascript:` hrefs yield `None`.
pub fn canonicalize_url(href: &str, origin: &Url) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') {
        return None;
    }
    let lower = href.to_ascii_lowercase();
    if lower.starts_with("javascript:") || lower.starts_with("mailto:") || lower.starts_with("tel:") {
        return None;
    }
    if lower.starts_with("http://") || lower.starts_with("https://") {
        return Some(href.to_string());
    }
    if let Some(rest) = href.strip_prefix("//") {
        return Some(format!("https://{rest}"));
    }
    origin
        .join(href)
        .ok()
        .filter(|u| matches!(u.scheme(), "http" | "https"))
        .map(String::from)
}

/// Parsed markup of one result item.
pub struct ItemFragment {
    html: Html,
    origin: Url,
}

impl ItemFragment {
    pub fn parse(outer_html: &str, origin: &Url) -> Self {
        Self {
            html: Html::parse_fragment(outer_html),
            origin: origin.clone(),
        }
    }

    /// The outermost element of the fragment.
    fn root(&self) -> Option<ElementRef<'_>> {
        self.html.root_element().children().find_map(ElementRef::wrap)
    }

    /// Canonical urls of every anchor carrying an href, in document order.
    fn anchors(&self) -> Vec<String> {
        let Ok(anchor) = Selector::parse("a[href]") else {
            return Vec::new();
        };
        self.html
            .select(&anchor)
            .filter_map(|a| a.value().attr("href"))
            .filter_map(|href| canonicalize_url(href, &self.origin))
            .collect()
    }

    /// Canonical href of the first element matching `selector`.
    fn first_href(&self, selector: &Selector) -> Option<String> {
        self.html.select(selector).find_map(|element| {
            let value = element.value();
            value
                .attr("href")
                .or_else(|| value.attr("data-listing-url"))
                .and_then(|href| canonicalize_url(href, &self.origin))
        })
    }

    pub fn diagnostics(&self) -> ItemDiagnostics {
        let Some(root) = self.root() else {
            return ItemDiagnostics::default();
        };

        let attributes = root
            .value()
            .attrs()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        let text = root.text().collect::<Vec<_>>().join(" ");
        let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
        let text_snippet = text.chars().take(SNIPPET_CHARS).collect();

        let child_tags = root
            .descendants()
            .skip(1)
            .filter_map(ElementRef::wrap)
            .map(|e| e.value().name().to_string())
            .collect();

        ItemDiagnostics {
            attributes,
            text_snippet,
            child_tags,
        }
    }
}

/// What an unresolvable item looked like.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ItemDiagnostics {
    pub attributes: BTreeMap<String, String>,
    pub text_snippet: String,
    pub child_tags: BTreeSet<String>,
}

/// One way of finding the listing href inside an item.
pub trait HrefStrategy: Send + Sync {
    fn name(&self) -> &str;
    fn resolve(&self, fragment: &ItemFragment) -> Option<String>;

    /// Like `resolve`, but only yields hrefs that identify the listing itself.
    fn resolve_listing(&self, fragment: &ItemFragment) -> Option<String> {
        self.resolve(fragment)
    }
}

/// First element matching a CSS selector.
pub struct SelectorStrategy {
    label: String,
    selector: Selector,
}

impl SelectorStrategy {
    pub fn new(selector: &str) -> HarvestResult<Self> {
        Ok(Self {
            label: selector.to_string(),
            selector: parse_selector(selector)?,
        })
    }
}

impl HrefStrategy for SelectorStrategy {
    fn name(&self) -> &str {
        &self.label
    }

    fn resolve(&self, fragment: &ItemFragment) -> Option<String> {
        fragment.first_href(&self.selector)
    }
}

/// Any anchor, preferring one whose href looks like a detail page.
pub struct AnchorScan {
    detail_path: Regex,
}

impl AnchorScan {
    pub fn new(pattern: &str) -> HarvestResult<Self> {
        let detail_path = Regex::new(pattern)
            .map_err(|e| HarvestError::InvalidConfig(format!("detail_path_pattern: {e}")))?;
        Ok(Self { detail_path })
    }
}

impl HrefStrategy for AnchorScan {
    fn name(&self) -> &str {
        "anchor-scan"
    }

    fn resolve(&self, fragment: &ItemFragment) -> Option<String> {
        let anchors = fragment.anchors();
        anchors
            .iter()
            .find(|href| self.detail_path.is_match(href))
            .or_else(|| anchors.first())
            .cloned()
    }

    fn resolve_listing(&self, fragment: &ItemFragment) -> Option<String> {
        fragment
            .anchors()
            .into_iter()
            .find(|href| self.detail_path.is_match(href))
    }
}

/// Ordered href strategy chain plus the origin relative hrefs resolve against.
pub struct RecordExtractor {
    origin: Url,
    strategies: Vec<Box<dyn HrefStrategy>>,
}

impl RecordExtractor {
    pub fn new(origin: Url, strategies: Vec<Box<dyn HrefStrategy>>) -> Self {
        Self { origin, strategies }
    }

    /// Primary selector, then the alternates in order, then the anchor scan.
    pub fn from_config(config: &HarvestConfig) -> HarvestResult<Self> {
        let origin = Url::parse(&config.origin)
            .map_err(|e| HarvestError::InvalidConfig(format!("origin '{}': {e}", config.origin)))?;
        let selectors = &config.selectors;

        let mut strategies: Vec<Box<dyn HrefStrategy>> =
            vec![Box::new(SelectorStrategy::new(&selectors.primary_link)?)];
        for alt in &selectors.alternate_links {
            strategies.push(Box::new(SelectorStrategy::new(alt)?));
        }
        strategies.push(Box::new(AnchorScan::new(&selectors.detail_path_pattern)?));

        Ok(Self::new(origin, strategies))
    }

    pub fn strategy_names(&self) -> Vec<&str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    pub fn canonicalize(&self, href: &str) -> Option<String> {
        canonicalize_url(href, &self.origin)
    }

    pub fn parse(&self, outer_html: &str) -> ItemFragment {
        ItemFragment::parse(outer_html, &self.origin)
    }

    /// First non-empty result of the strategy chain.
    pub fn resolve_href(&self, fragment: &ItemFragment) -> Option<String> {
        self.strategies.iter().find_map(|strategy| {
            let href = strategy.resolve(fragment)?;
            tracing::trace!(strategy = strategy.name(), %href, "Resolved item href");
            Some(href)
        })
    }

    /// The one href in `outer_html` that names the listing.
    ///
    /// Dealer, image and other incidental anchors are never returned, so the
    /// href delta only carries listings.
    pub fn listing_href(&self, outer_html: &str) -> Option<String> {
        let fragment = self.parse(outer_html);
        self.strategies
            .iter()
            .find_map(|strategy| strategy.resolve_listing(&fragment))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin() -> Url {
        Url::parse("https://www.autotempest.com").unwrap()
    }

    fn extractor() -> RecordExtractor {
        RecordExtractor::from_config(&HarvestConfig::default()).unwrap()
    }

    #[test]
    fn test_canonicalize_variants() {
        let o = origin();
        assert_eq!(
            canonicalize_url("/listing/1", &o).as_deref(),
            Some("https://www.autotempest.com/listing/1")
        );
        assert_eq!(
            canonicalize_url("http://dealer.example/car?a=1", &o).as_deref(),
            Some("http://dealer.example/car?a=1")
        );
        assert_eq!(
            canonicalize_url("//cdn.example/x", &o).as_deref(),
            Some("https://cdn.example/x")
        );
        assert_eq!(canonicalize_url("", &o), None);
        assert_eq!(canonicalize_url("#top", &o), None);
        assert_eq!(canonicalize_url("javascript:void(0)", &o), None);
    }

    #[test]
    fn test_primary_selector_wins() {
        let ex = extractor();
        let frag = ex.parse(
            r#"<li class="result-list-item" id="r1">
                 <h2><a href="/other/9">Title</a></h2>
                 <a class="listing-link" href="/listing/1">View</a>
               </li>"#,
        );
        assert_eq!(
            ex.resolve_href(&frag).as_deref(),
            Some("https://www.autotempest.com/listing/1")
        );
    }

    #[test]
    fn test_alternate_selector_in_order() {
        let ex = extractor();
        let frag = ex.parse(
            r#"<li><div class="title"><a href="https://dealer.example/a">A</a></div>
                   <h2><a href="/b">B</a></h2></li>"#,
        );
        assert_eq!(ex.resolve_href(&frag).as_deref(), Some("https://dealer.example/a"));
    }

    #[test]
    fn test_data_attribute_alternate() {
        let ex = extractor();
        let frag = ex.parse(r#"<li><a data-listing-url="/vehicle/77">Open</a></li>"#);
        assert_eq!(
            ex.resolve_href(&frag).as_deref(),
            Some("https://www.autotempest.com/vehicle/77")
        );
    }

    #[test]
    fn test_anchor_scan_prefers_detail_path() {
        let ex = extractor();
        let frag = ex.parse(
            r##"<li><a href="#">x</a><a href="/dealer/info">d</a>
                   <a href="/details/42">car</a></li>"##,
        );
        assert_eq!(
            ex.resolve_href(&frag).as_deref(),
            Some("https://www.autotempest.com/details/42")
        );
    }

    #[test]
    fn test_anchor_scan_falls_back_to_first_usable() {
        let ex = extractor();
        let frag = ex.parse(
            r#"<li><a href="javascript:void(0)">x</a><a href="/dealer/info">d</a></li>"#,
        );
        assert_eq!(
            ex.resolve_href(&frag).as_deref(),
            Some("https://www.autotempest.com/dealer/info")
        );
    }

    #[test]
    fn test_listing_href_ignores_incidental_anchors() {
        let ex = extractor();
        let card = r#"<li class="result-list-item">
                 <a href="https://dealer.example/profile">Dealer</a>
                 <a href="https://img.example/9.jpg"><img src="9.jpg"></a>
                 <a href="/listing/9">2019 Porsche 911</a>
               </li>"#;
        assert_eq!(
            ex.listing_href(card).as_deref(),
            Some("https://www.autotempest.com/listing/9")
        );

        let dealer_only = r#"<li><a href="https://dealer.example/profile">Dealer</a></li>"#;
        assert_eq!(ex.listing_href(dealer_only), None);
        assert!(ex.resolve_href(&ex.parse(dealer_only)).is_some());
    }

    #[test]
    fn test_listing_href_prefers_primary_link() {
        let ex = extractor();
        let card = r#"<li><a href="/details/1">old</a><a class="listing-link" href="/listing/2">x</a></li>"#;
        assert_eq!(
            ex.listing_href(card).as_deref(),
            Some("https://www.autotempest.com/listing/2")
        );
    }

    #[test]
    fn test_no_usable_link_diagnostics() {
        let ex = extractor();
        let frag = ex.parse(
            r#"<li class="result-list-item" data-id="r9"><span>2019 Porsche 911</span><img src="x.jpg"></li>"#,
        );
        assert!(ex.resolve_href(&frag).is_none());

        let diag = frag.diagnostics();
        assert_eq!(diag.attributes.get("data-id").map(String::as_str), Some("r9"));
        assert_eq!(diag.text_snippet, "2019 Porsche 911");
        assert!(diag.child_tags.contains("span"));
        assert!(diag.child_tags.contains("img"));
    }

    #[test]
    fn test_chain_order() {
        let ex = extractor();
        let names = ex.strategy_names();
        assert_eq!(names.first(), Some(&"a.listing-link"));
        assert_eq!(names.last(), Some(&"anchor-scan"));
        assert_eq!(names.len(), 6);
    }
}
