//! Chromium-backed results surface using chromiumoxide.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::Engine;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::{
    EnableParams, EventLoadingFinished, EventResponseReceived, GetResponseBodyParams, RequestId,
};
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::page::Page;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::task::JoinHandle;

use listing_harvest::{
    ControlState, DomSnapshot, HarvestContext, RecordExtractor, RenderedItem, ResponseObservation,
    ResultsSurface, SelectorConfig,
};

/// Environment variable pointing at a Chromium binary.
pub const CHROMIUM_ENV: &str = "LISTING_HARVEST_CHROMIUM";

/// Find the Chromium binary path.
pub fn find_chromium() -> Option<PathBuf> {
    // 1. Explicit override
    if let Ok(p) = std::env::var(CHROMIUM_ENV) {
        let path = PathBuf::from(&p);
        if path.exists() {
            return Some(path);
        }
    }

    // 2. Playwright's browser cache, which the older tooling installed
    if let Some(cache) = dirs::cache_dir() {
        let root = cache.join("ms-playwright");
        if let Ok(entries) = std::fs::read_dir(&root) {
            let mut installs: Vec<PathBuf> = entries
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| {
                    p.file_name()
                        .and_then(|n| n.to_str())
                        .map(|n| n.starts_with("chromium-"))
                        .unwrap_or(false)
                })
                .collect();
            installs.sort();
            for install in installs.into_iter().rev() {
                let candidate = install.join("chrome-linux/chrome");
                if candidate.exists() {
                    return Some(candidate);
                }
            }
        }
    }

    // 3. System PATH
    for name in ["google-chrome", "chromium", "chromium-browser"] {
        if let Ok(path) = which::which(name) {
            return Some(path);
        }
    }

    // 4. Common macOS location
    if cfg!(target_os = "macos") {
        let common = PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome");
        if common.exists() {
            return Some(common);
        }
    }

    None
}

/// A launched browser and the task pumping its CDP handler.
pub struct BrowserSession {
    browser: Browser,
    handler: JoinHandle<()>,
}

impl BrowserSession {
    /// Launch Chromium, headless unless `headed` is set.
    pub async fn launch(headed: bool) -> Result<Self> {
        let chrome_path = find_chromium()
            .with_context(|| format!("Chromium not found. Install it or set {CHROMIUM_ENV}."))?;

        let mut builder = BrowserConfig::builder()
            .chrome_executable(chrome_path)
            .arg("--disable-gpu")
            .arg("--no-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions");
        builder = if headed {
            builder.with_head()
        } else {
            builder.arg("--headless=new")
        };
        let config = builder
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build browser config: {e}"))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .context("failed to launch Chromium")?;

        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    tracing::trace!("CDP handler error: {e}");
                }
            }
        });

        Ok(Self { browser, handler })
    }

    pub async fn new_page(&self) -> Result<Page> {
        self.browser
            .new_page("about:blank")
            .await
            .context("failed to create new page")
    }

    pub async fn close(mut self) -> Result<()> {
        if let Err(e) = self.browser.close().await {
            tracing::debug!("Browser close failed: {e}");
        }
        let _ = self.browser.wait().await;
        self.handler.abort();
        Ok(())
    }
}

enum NetworkEvent {
    Response(Arc<EventResponseReceived>),
    Finished(Arc<EventLoadingFinished>),
}

struct PendingResponse {
    url: String,
    status: u16,
    content_type: String,
}

/// Feed every matching results response on `page` into `harvest`.
///
/// Bodies are only available once loading finishes, so response metadata is
/// held by request id until the matching `loadingFinished` event.
pub async fn spawn_network_listener(
    page: &Page,
    harvest: Arc<HarvestContext>,
) -> Result<JoinHandle<()>> {
    page.execute(EnableParams::default())
        .await
        .context("failed to enable Network domain")?;

    let responses = page
        .event_listener::<EventResponseReceived>()
        .await
        .context("failed to subscribe to responseReceived")?
        .map(NetworkEvent::Response);
    let finished = page
        .event_listener::<EventLoadingFinished>()
        .await
        .context("failed to subscribe to loadingFinished")?
        .map(NetworkEvent::Finished);

    let page = page.clone();
    Ok(tokio::spawn(async move {
        let mut events = Box::pin(futures::stream::select(responses, finished));
        let mut pending: HashMap<RequestId, PendingResponse> = HashMap::new();

        while let Some(event) = events.next().await {
            match event {
                NetworkEvent::Response(ev) => {
                    let response = &ev.response;
                    if !harvest.matches(&response.url, Some(&response.mime_type)) {
                        continue;
                    }
                    pending.insert(
                        ev.request_id.clone(),
                        PendingResponse {
                            url: response.url.clone(),
                            status: u16::try_from(response.status).unwrap_or(0),
                            content_type: response.mime_type.clone(),
                        },
                    );
                }
                NetworkEvent::Finished(ev) => {
                    let Some(meta) = pending.remove(&ev.request_id) else {
                        continue;
                    };
                    let body = match read_body(&page, ev.request_id.clone()).await {
                        Ok(body) => body,
                        Err(e) => {
                            tracing::debug!("Could not read body of {}: {e:#}", meta.url);
                            continue;
                        }
                    };
                    let ids = harvest.observe(&ResponseObservation {
                        url: meta.url,
                        status: meta.status,
                        content_type: Some(meta.content_type),
                        body,
                    });
                    tracing::trace!(ids, "Observed results response");
                }
            }
        }
        tracing::debug!("Network listener stopped");
    }))
}

async fn read_body(page: &Page, request_id: RequestId) -> Result<String> {
    let response = page
        .execute(GetResponseBodyParams::new(request_id))
        .await
        .context("getResponseBody failed")?;
    let returns = &response.result;
    if returns.base64_encoded {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(&returns.body)
            .context("invalid base64 response body")?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    } else {
        Ok(returns.body.clone())
    }
}

#[derive(Debug, Deserialize)]
struct JsItem {
    ancestor_id: Option<String>,
    early_href: Option<String>,
}

/// A results page in a Chromium tab.
pub struct ChromiumSurface<'a> {
    page: Page,
    selectors: SelectorConfig,
    extractor: &'a RecordExtractor,
}

impl<'a> ChromiumSurface<'a> {
    pub fn new(page: Page, selectors: SelectorConfig, extractor: &'a RecordExtractor) -> Self {
        Self {
            page,
            selectors,
            extractor,
        }
    }

    async fn eval<T: DeserializeOwned>(&self, script: &str) -> Result<T> {
        evaluate(&self.page, script).await
    }

    fn item_selector(&self) -> String {
        js_string(&self.selectors.item)
    }

    /// JS expression resolving the load-more button, or null.
    fn load_more_lookup(&self) -> String {
        format!(
            "Array.from(document.querySelectorAll('button, [role=\"button\"]'))\
               .find((b) => (b.innerText || b.textContent || '').trim() === {text})",
            text = js_string(&self.selectors.load_more_text)
        )
    }
}

/// Evaluate a JS expression on `page` and deserialize its value.
pub async fn evaluate<T: DeserializeOwned>(page: &Page, script: &str) -> Result<T> {
    let params = EvaluateParams::builder()
        .expression(script)
        .return_by_value(true)
        .await_promise(true)
        .build()
        .map_err(|e| anyhow::anyhow!("failed to build evaluate params: {e}"))?;
    let result = page
        .evaluate_expression(params)
        .await
        .context("JS execution failed")?;
    result
        .into_value()
        .map_err(|e| anyhow::anyhow!("failed to convert JS result: {e:?}"))
}

/// Quote `value` as a JS string literal.
pub fn js_string(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

#[async_trait]
impl ResultsSurface for ChromiumSurface<'_> {
    async fn rendered_count(&self) -> Result<usize> {
        let script = format!("document.querySelectorAll({}).length", self.item_selector());
        self.eval(&script).await
    }

    async fn snapshot(&self) -> Result<DomSnapshot> {
        let script = format!(
            r#"(() => {{
                const attr = {attr};
                const primary = {primary};
                return Array.from(document.querySelectorAll({item})).map((el) => {{
                    const holder = el.closest('[' + attr + ']');
                    const link = el.querySelector(primary);
                    return {{
                        ancestor_id: holder ? holder.getAttribute(attr) : null,
                        early_href: link && link.href ? link.href : null,
                    }};
                }});
            }})()"#,
            attr = js_string(&self.selectors.ancestor_id_attribute),
            primary = js_string(&self.selectors.primary_link),
            item = self.item_selector(),
        );
        let items: Vec<JsItem> = self.eval(&script).await?;
        Ok(DomSnapshot::new(
            items
                .into_iter()
                .enumerate()
                .map(|(position, it)| RenderedItem {
                    position,
                    ancestor_id: it.ancestor_id.filter(|s| !s.is_empty()),
                    early_href: it.early_href.filter(|s| !s.is_empty()),
                })
                .collect(),
        ))
    }

    async fn visible_hrefs(&self) -> Result<Vec<String>> {
        let script = format!(
            "Array.from(document.querySelectorAll({item})).map((el) => el.outerHTML)",
            item = self.item_selector(),
        );
        let items: Vec<String> = self.eval(&script).await?;
        Ok(items
            .iter()
            .filter_map(|html| self.extractor.listing_href(html))
            .collect())
    }

    async fn inspect(&self, item: &RenderedItem) -> Result<Option<String>> {
        let wanted = match &item.ancestor_id {
            Some(id) => js_string(id),
            None => "null".to_string(),
        };
        let script = format!(
            r#"(() => {{
                const attr = {attr};
                const wanted = {wanted};
                const items = Array.from(document.querySelectorAll({item}));
                let el = null;
                if (wanted !== null) {{
                    el = items.find((it) => {{
                        const holder = it.closest('[' + attr + ']');
                        return holder && holder.getAttribute(attr) === wanted;
                    }}) || null;
                }} else {{
                    el = items[{position}] || null;
                }}
                if (!el) return null;
                el.scrollIntoView({{ block: 'center' }});
                return el.outerHTML;
            }})()"#,
            attr = js_string(&self.selectors.ancestor_id_attribute),
            item = self.item_selector(),
            position = item.position,
        );
        self.eval(&script).await
    }

    async fn load_more_state(&self) -> Result<ControlState> {
        let script = format!(
            r#"(() => {{
                const btn = {lookup};
                if (!btn) return 'absent';
                const style = window.getComputedStyle(btn);
                if (style.display === 'none' || style.visibility === 'hidden') return 'absent';
                if (btn.disabled || btn.getAttribute('aria-disabled') === 'true') return 'disabled';
                return 'enabled';
            }})()"#,
            lookup = self.load_more_lookup(),
        );
        let state: String = self.eval(&script).await?;
        Ok(match state.as_str() {
            "enabled" => ControlState::Enabled,
            "disabled" => ControlState::Disabled,
            _ => ControlState::Absent,
        })
    }

    async fn click_load_more(&self) -> Result<()> {
        let script = format!(
            r#"(() => {{
                const btn = {lookup};
                if (!btn) return false;
                btn.scrollIntoView({{ block: 'center' }});
                btn.click();
                return true;
            }})()"#,
            lookup = self.load_more_lookup(),
        );
        let clicked: bool = self.eval(&script).await?;
        if !clicked {
            bail!("load-more control '{}' not found", self.selectors.load_more_text);
        }
        Ok(())
    }
}
