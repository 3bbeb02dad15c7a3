//! AutoTempest price-trends search flow.
//!
//! Brings a tab from a blank state to a rendered results grid for one
//! make/model. The harvester is reset first and armed right before the
//! search is submitted, so only responses to this search are trusted.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use chromiumoxide::page::Page;
use rand::Rng;

use listing_harvest::HarvestContext;

use crate::browser::{evaluate, js_string};

const PRICE_TRENDS_TAB: &str = r#"li[data-id="price-trends-main"]"#;
const MAKE_INPUT: &str = "#trends-make-input";
const MODEL_INPUT: &str = "#trends-model-input";
const SLIDER: &str = r#"span[role="slider"]"#;
const SEARCH_TEXT: &str = "Search";
const SAMPLED_DATA_TEXT: &str = "Sampled Data";

/// A random delay in `[min_ms, max_ms]`.
pub fn jitter(min_ms: u64, max_ms: u64) -> Duration {
    let (lo, hi) = if min_ms <= max_ms {
        (min_ms, max_ms)
    } else {
        (max_ms, min_ms)
    };
    Duration::from_millis(rand::thread_rng().gen_range(lo..=hi))
}

/// Sleep for a human-like random interval.
pub async fn pause(min_ms: u64, max_ms: u64) {
    tokio::time::sleep(jitter(min_ms, max_ms)).await;
}

/// Navigate to `origin` and submit a price-trends search for `make`/`model`.
pub async fn open_search(
    page: &Page,
    harvest: &HarvestContext,
    origin: &str,
    make: &str,
    model: &str,
) -> Result<()> {
    harvest.reset();

    page.goto(origin)
        .await
        .with_context(|| format!("failed to open {origin}"))?;
    optional_step("wait for navigation", page.wait_for_navigation().await);
    pause(700, 1400).await;

    page.find_element(PRICE_TRENDS_TAB)
        .await
        .context("price trends tab not found")?
        .click()
        .await
        .context("failed to open price trends tab")?;
    pause(500, 1000).await;

    fill_and_submit(page, MAKE_INPUT, make).await?;
    pause(300, 800).await;
    fill_and_submit(page, MODEL_INPUT, model).await?;
    pause(300, 800).await;

    harvest.arm();
    if !click_by_text(page, "button", SEARCH_TEXT).await? {
        bail!("search button not found");
    }
    tracing::debug!(make, model, "Search submitted");

    // Optional refinements; the page works without them.
    pause(1200, 2000).await;
    let toggled = click_by_text(page, "button, a, span, label, div", SAMPLED_DATA_TEXT).await;
    match optional_step("sampled data toggle", toggled) {
        Some(true) => {
            tracing::debug!("Switched from sampled data to all data");
            pause(600, 1200).await;
        }
        Some(false) => tracing::debug!("Sampled Data toggle not visible; continuing with defaults"),
        None => {}
    }
    optional_step("slider to end", max_slider(page).await);
    Ok(())
}

/// Log a failed optional step at debug level and carry on.
pub fn optional_step<T, E: std::fmt::Debug>(step: &str, result: Result<T, E>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::debug!(step, "Optional step failed: {e:?}");
            None
        }
    }
}

async fn fill_and_submit(page: &Page, selector: &str, value: &str) -> Result<()> {
    let input = page
        .find_element(selector)
        .await
        .with_context(|| format!("input {selector} not found"))?;
    input.click().await?;
    let cleared: bool = evaluate(
        page,
        &format!(
            "(() => {{ const el = document.querySelector({sel}); if (!el) return false; el.value = ''; return true; }})()",
            sel = js_string(selector)
        ),
    )
    .await?;
    if !cleared {
        bail!("input {selector} disappeared");
    }
    input.type_str(value).await?;
    input.press_key("Enter").await?;
    Ok(())
}

/// Click the innermost visible element matching `selector` whose text is exactly `text`.
async fn click_by_text(page: &Page, selector: &str, text: &str) -> Result<bool> {
    let script = format!(
        r#"(() => {{
            const want = {text};
            const matches = Array.from(document.querySelectorAll({selector}))
                .filter((el) => (el.innerText || el.textContent || '').trim() === want)
                .filter((el) => el.offsetParent !== null);
            const el = matches.pop();
            if (!el) return false;
            el.click();
            return true;
        }})()"#,
        text = js_string(text),
        selector = js_string(selector),
    );
    evaluate(page, &script).await
}

async fn max_slider(page: &Page) -> Result<()> {
    let slider = page.find_element(SLIDER).await?;
    slider.focus().await?;
    slider.press_key("End").await?;
    pause(600, 1200).await;
    Ok(())
}
