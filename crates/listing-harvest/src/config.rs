//! Static tunables for a harvest run.

use std::time::Duration;

use regex::Regex;
use scraper::Selector;
use serde::{Deserialize, Serialize};

use crate::types::{HarvestError, HarvestResult};

/// Substring identifying the structured results endpoint.
pub const DEFAULT_RESULTS_ENDPOINT: &str = "/api/trends/results";

/// Site origin used to absolutize relative hrefs.
pub const DEFAULT_ORIGIN: &str = "https://www.autotempest.com";

/// Cap for the in-memory ring of harvested ids.
pub const DEFAULT_MAX_HARVEST_BUFFER: usize = 15_000;

/// Upper bound on load-more clicks per target.
pub const DEFAULT_MAX_PAGES: u64 = 1000;

/// Bounded polling schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollPolicy {
    pub interval_ms: u64,
    pub max_attempts: u32,
}

impl PollPolicy {
    pub const fn new(interval_ms: u64, max_attempts: u32) -> Self {
        Self {
            interval_ms,
            max_attempts,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Upper bound on the time this policy can wait.
    pub fn budget(&self) -> Duration {
        self.interval() * self.max_attempts
    }
}

/// Settle polling: the rendered count must hold for `stable_polls` consecutive polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlePolicy {
    pub interval_ms: u64,
    pub max_attempts: u32,
    pub stable_polls: u32,
}

impl SettlePolicy {
    pub fn poll(&self) -> PollPolicy {
        PollPolicy::new(self.interval_ms, self.max_attempts)
    }
}

/// CSS selectors and patterns describing the results grid markup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    /// Matches one rendered result item.
    pub item: String,
    /// Attribute carrying the stable identifier on an enclosing element.
    pub ancestor_id_attribute: String,
    /// Expected location of the listing link inside an item.
    pub primary_link: String,
    /// Known markup variants, tried in order after the primary link.
    pub alternate_links: Vec<String>,
    /// Regex matched against hrefs during the generic anchor scan.
    pub detail_path_pattern: String,
    /// Text of the load-more control.
    pub load_more_text: String,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            item: ".result-list-item".to_string(),
            ancestor_id_attribute: "id".to_string(),
            primary_link: "a.listing-link".to_string(),
            alternate_links: vec![
                ".title a".to_string(),
                "h2 a".to_string(),
                "a.result-link".to_string(),
                "a[data-listing-url]".to_string(),
            ],
            detail_path_pattern: r"/(listing|vehicle|detail|details|cars?)/".to_string(),
            load_more_text: "More Results".to_string(),
        }
    }
}

/// Every knob the engine reads. All fields fall back to defaults when absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    pub results_endpoint: String,
    pub origin: String,
    pub max_harvest_buffer: usize,
    pub max_pages: u64,
    /// Consecutive no-progress epochs tolerated while the control stays enabled.
    pub max_idle_epochs: u32,
    pub results_wait: PollPolicy,
    pub growth_wait: PollPolicy,
    pub network_wait: PollPolicy,
    pub settle: SettlePolicy,
    pub selectors: SelectorConfig,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            results_endpoint: DEFAULT_RESULTS_ENDPOINT.to_string(),
            origin: DEFAULT_ORIGIN.to_string(),
            max_harvest_buffer: DEFAULT_MAX_HARVEST_BUFFER,
            max_pages: DEFAULT_MAX_PAGES,
            max_idle_epochs: 1,
            results_wait: PollPolicy::new(250, 60),
            growth_wait: PollPolicy::new(250, 40),
            network_wait: PollPolicy::new(200, 15),
            settle: SettlePolicy {
                interval_ms: 300,
                max_attempts: 20,
                stable_polls: 3,
            },
            selectors: SelectorConfig::default(),
        }
    }
}

impl HarvestConfig {
    /// Parse a JSON config document; missing fields take their defaults.
    pub fn from_json(text: &str) -> HarvestResult<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> HarvestResult<()> {
        if self.results_endpoint.trim().is_empty() {
            return Err(HarvestError::InvalidConfig(
                "results_endpoint must not be empty".into(),
            ));
        }
        if self.max_harvest_buffer == 0 {
            return Err(HarvestError::InvalidConfig(
                "max_harvest_buffer must be at least 1".into(),
            ));
        }
        if self.settle.stable_polls == 0 {
            return Err(HarvestError::InvalidConfig(
                "settle.stable_polls must be at least 1".into(),
            ));
        }
        url::Url::parse(&self.origin)
            .map_err(|e| HarvestError::InvalidConfig(format!("origin '{}': {e}", self.origin)))?;

        parse_selector(&self.selectors.item)?;
        parse_selector(&self.selectors.primary_link)?;
        for alt in &self.selectors.alternate_links {
            parse_selector(alt)?;
        }
        Regex::new(&self.selectors.detail_path_pattern).map_err(|e| {
            HarvestError::InvalidConfig(format!("detail_path_pattern: {e}"))
        })?;
        Ok(())
    }
}

/// Parse a CSS selector, mapping failures to [`HarvestError::Selector`].
pub fn parse_selector(selector: &str) -> HarvestResult<Selector> {
    Selector::parse(selector).map_err(|e| HarvestError::Selector {
        selector: selector.to_string(),
        reason: format!("{e:?}"),
    })
}
