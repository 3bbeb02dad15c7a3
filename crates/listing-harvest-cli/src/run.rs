//! Session runner: crawls every target in order against one browser tab.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use listing_harvest::{
    HarvestConfig, HarvestContext, ListingStore, PaginationDriver, RecordExtractor,
    TargetReport,
};

use crate::browser::{spawn_network_listener, BrowserSession, ChromiumSurface};
use crate::site;
use crate::targets::load_targets;

/// Think time between targets, in milliseconds.
const TARGET_PAUSE_MS: (u64, u64) = (4000, 7000);

/// Everything a harvest session needs.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub targets_path: PathBuf,
    pub output_path: PathBuf,
    pub config: HarvestConfig,
    pub headed: bool,
}

/// A target that failed before its crawl could start.
#[derive(Debug, Clone, Serialize)]
pub struct TargetFailure {
    pub make: String,
    pub model: String,
    pub error: String,
}

/// What a session did, emitted at the end of `run`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub started_at: DateTime<Utc>,
    pub elapsed_secs: f64,
    pub targets: usize,
    pub completed: usize,
    pub total_saved: usize,
    /// Seconds of session time per saved listing.
    pub secs_per_listing: Option<f64>,
    pub cancelled: bool,
    pub reports: Vec<TargetReport>,
    pub failures: Vec<TargetFailure>,
}

impl SessionSummary {
    fn new(targets: usize) -> Self {
        Self {
            started_at: Utc::now(),
            elapsed_secs: 0.0,
            targets,
            completed: 0,
            total_saved: 0,
            secs_per_listing: None,
            cancelled: false,
            reports: Vec::new(),
            failures: Vec::new(),
        }
    }

    fn record(&mut self, report: TargetReport) {
        self.completed += 1;
        self.total_saved += report.stats.saved;
        self.reports.push(report);
    }

    fn finish(&mut self, elapsed_secs: f64) {
        self.elapsed_secs = elapsed_secs;
        self.secs_per_listing = (self.total_saved > 0).then(|| elapsed_secs / self.total_saved as f64);
    }
}

/// Progress across the make/model targets of a session.
pub fn target_progress(total: usize) -> Result<ProgressBar> {
    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:30.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("#>-"),
    );
    Ok(pb)
}

/// Crawl every target. A failing target is logged and skipped.
pub async fn run(options: RunOptions, cancel: CancellationToken) -> Result<SessionSummary> {
    let targets = load_targets(&options.targets_path)?;
    tracing::info!("Found {} make/model pairs", targets.len());

    let mut store = ListingStore::open(&options.output_path)
        .with_context(|| format!("failed to open store {}", options.output_path.display()))?;
    tracing::info!(
        rows = store.len(),
        urls = store.seen().url_count(),
        ids = store.seen().id_count(),
        "Loaded seen index"
    );

    let extractor = RecordExtractor::from_config(&options.config)?;
    let driver = PaginationDriver::new(&options.config, &extractor).with_cancel(cancel.clone());
    let harvest = Arc::new(HarvestContext::new(
        &options.config.results_endpoint,
        options.config.max_harvest_buffer,
    ));

    let session = BrowserSession::launch(options.headed).await?;
    let page = session.new_page().await?;
    let listener = spawn_network_listener(&page, harvest.clone()).await?;
    let surface = ChromiumSurface::new(page.clone(), options.config.selectors.clone(), &extractor);

    let started = Instant::now();
    let mut summary = SessionSummary::new(targets.len());
    let pb = target_progress(targets.len())?;

    for (idx, target) in targets.iter().enumerate() {
        if cancel.is_cancelled() {
            summary.cancelled = true;
            tracing::warn!("Cancelled; {} targets not started", targets.len() - idx);
            break;
        }

        pb.set_message(format!("{} {}", target.make, target.model));
        let target_started = Instant::now();
        let opened = site::open_search(
            &page,
            &harvest,
            &options.config.origin,
            &target.make,
            &target.model,
        )
        .await;

        match opened {
            Ok(()) => {
                let report = driver
                    .run(&surface, &harvest, &mut store, &target.make, &target.model)
                    .await;
                summary.record(report);
            }
            Err(e) => {
                tracing::error!(make = %target.make, model = %target.model, "Error running target: {e:#}");
                summary.failures.push(TargetFailure {
                    make: target.make.clone(),
                    model: target.model.clone(),
                    error: format!("{e:#}"),
                });
            }
        }

        pb.inc(1);
        pb.suspend(|| {
            tracing::info!(
                "{} {} in {:.1}s | session {:.1}s, {} saved",
                target.make,
                target.model,
                target_started.elapsed().as_secs_f64(),
                started.elapsed().as_secs_f64(),
                summary.total_saved
            )
        });

        if idx + 1 < targets.len() {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = site::pause(TARGET_PAUSE_MS.0, TARGET_PAUSE_MS.1) => {}
            }
        }
    }
    summary.cancelled |= cancel.is_cancelled();
    pb.finish_with_message(format!("{} listings saved", summary.total_saved));

    harvest.disarm();
    listener.abort();
    drop(surface);
    session.close().await?;

    summary.finish(started.elapsed().as_secs_f64());
    tracing::info!(
        "Session done in {:.1} minutes: {} of {} targets, {} listings saved",
        summary.elapsed_secs / 60.0,
        summary.completed,
        summary.targets,
        summary.total_saved
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_progress_spans_targets() {
        let pb = target_progress(4).unwrap();
        assert_eq!(pb.length(), Some(4));
        pb.inc(1);
        assert_eq!(pb.position(), 1);
    }

    #[test]
    fn test_summary_time_per_listing() {
        let mut summary = SessionSummary::new(2);
        summary.finish(10.0);
        assert!(summary.secs_per_listing.is_none());

        summary.total_saved = 4;
        summary.finish(10.0);
        assert_eq!(summary.secs_per_listing, Some(2.5));
    }
}
