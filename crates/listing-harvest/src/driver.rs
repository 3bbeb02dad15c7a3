//! Pagination driver: the per-target state machine.
//!
//! ```text
//! Idle -> AwaitingResults -> Extracting -> ClickMore -> AwaitingGrowth -> Settling
//!                                ^                                           |
//!                                +-------------------------------------------+
//! ```
//!
//! Any state may move to `Stopped` with a [`StopReason`]. Every wait is
//! bounded through [`crate::wait::wait_with`].

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::HarvestConfig;
use crate::crawl::{TargetCrawl, TargetStats};
use crate::extract::RecordExtractor;
use crate::harvest::HarvestContext;
use crate::reconcile::{plan_epoch, EpochEvidence};
use crate::snapshot::{DomDifferencer, DomSnapshot};
use crate::store::ListingStore;
use crate::surface::{ControlState, ResultsSurface};
use crate::types::Epoch;
use crate::wait::wait_with;

/// Why a target crawl ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// Nothing rendered after the search.
    NoResults,
    /// The load-more control is gone or disabled.
    Exhausted,
    /// `max_pages` load-more clicks were made.
    MaxPages,
    /// An epoch added nothing and the control is gone or disabled.
    NoProgress,
    /// Too many consecutive epochs added nothing while the control stayed enabled.
    Stalled,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Idle,
    AwaitingResults,
    Extracting,
    ClickMore,
    AwaitingGrowth,
    Settling,
    Stopped(StopReason),
}

/// Outcome of one make/model crawl.
#[derive(Debug, Clone, Serialize)]
pub struct TargetReport {
    pub make: String,
    pub model: String,
    pub stop_reason: StopReason,
    /// Epochs reconciled, including the initial page.
    pub epochs: u64,
    pub load_more_clicks: u64,
    /// No-progress epochs tolerated while the control stayed enabled.
    pub idle_epochs: u32,
    pub elapsed_ms: u64,
    /// Results payloads parsed for this target.
    pub payloads_parsed: u64,
    /// Results payloads that were not valid JSON.
    pub payloads_rejected: u64,
    pub stats: TargetStats,
}

/// Mutable state threaded through one run.
struct Run<'a> {
    epoch: Epoch,
    crawl: TargetCrawl<'a>,
    differ: DomDifferencer,
    pre_hrefs: Vec<String>,
    clicks: u64,
    epochs: u64,
    idle_streak: u32,
    idle_total: u32,
}

pub struct PaginationDriver<'a> {
    config: &'a HarvestConfig,
    extractor: &'a RecordExtractor,
    cancellation_token: Option<CancellationToken>,
}

impl<'a> PaginationDriver<'a> {
    pub fn new(config: &'a HarvestConfig, extractor: &'a RecordExtractor) -> Self {
        Self {
            config,
            extractor,
            cancellation_token: None,
        }
    }

    /// Stop between epochs once `token` is cancelled.
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = Some(token);
        self
    }

    fn cancelled(&self) -> bool {
        self.cancellation_token
            .as_ref()
            .map(CancellationToken::is_cancelled)
            .unwrap_or(false)
    }

    /// Crawl one make/model to completion.
    ///
    /// The caller resets and arms `harvest` around the search submission so
    /// the initial payloads land in epoch 0 before this runs.
    pub async fn run<S>(
        &self,
        surface: &S,
        harvest: &HarvestContext,
        store: &mut ListingStore,
        make: &str,
        model: &str,
    ) -> TargetReport
    where
        S: ResultsSurface + ?Sized,
    {
        let started = Instant::now();
        let mut run = Run {
            epoch: Epoch::INITIAL,
            crawl: TargetCrawl::new(make, model, self.extractor),
            differ: DomDifferencer::new(),
            pre_hrefs: Vec::new(),
            clicks: 0,
            epochs: 0,
            idle_streak: 0,
            idle_total: 0,
        };

        let mut state = DriverState::Idle;
        let reason = loop {
            tracing::debug!(?state, epoch = run.epoch.0, "Driver state");
            state = match state {
                DriverState::Idle => DriverState::AwaitingResults,
                DriverState::AwaitingResults => self.await_results(surface).await,
                DriverState::Extracting => self.extract(surface, harvest, store, &mut run).await,
                DriverState::ClickMore => self.click_more(surface, &run).await,
                DriverState::AwaitingGrowth => self.await_growth(surface, harvest, &mut run).await,
                DriverState::Settling => self.settle(surface, &mut run).await,
                DriverState::Stopped(reason) => break reason,
            };
        };

        let stats = run.crawl.finish(store);
        let (payloads_parsed, payloads_rejected) = harvest.payload_counts();
        let report = TargetReport {
            make: make.to_string(),
            model: model.to_string(),
            stop_reason: reason,
            epochs: run.epochs,
            load_more_clicks: run.clicks,
            idle_epochs: run.idle_total,
            elapsed_ms: started.elapsed().as_millis() as u64,
            payloads_parsed,
            payloads_rejected,
            stats,
        };
        tracing::info!(
            make,
            model,
            reason = ?report.stop_reason,
            epochs = report.epochs,
            clicks = report.load_more_clicks,
            saved = report.stats.saved,
            duplicates = report.stats.duplicates,
            no_usable_link = report.stats.no_usable_link,
            payloads = report.payloads_parsed,
            rejected_payloads = report.payloads_rejected,
            "Target finished"
        );
        report
    }

    async fn await_results<S>(&self, surface: &S) -> DriverState
    where
        S: ResultsSurface + ?Sized,
    {
        let rendered = wait_with(
            move || async move { surface.rendered_count().await.map(|n| n > 0).unwrap_or(false) },
            self.config.results_wait,
        )
        .await;
        if rendered {
            DriverState::Extracting
        } else {
            tracing::warn!("No results rendered within {:?}", self.config.results_wait.budget());
            DriverState::Stopped(StopReason::NoResults)
        }
    }

    async fn extract<S>(
        &self,
        surface: &S,
        harvest: &HarvestContext,
        store: &mut ListingStore,
        run: &mut Run<'a>,
    ) -> DriverState
    where
        S: ResultsSurface + ?Sized,
    {
        let snapshot = match surface.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(epoch = run.epoch.0, "Snapshot failed: {e:#}");
                DomSnapshot::default()
            }
        };
        let appeared = run.differ.observe(&snapshot).appeared.len();

        let bucket = harvest.epoch_ids(run.epoch);
        let buffered = if run.epoch.is_initial() {
            Vec::new()
        } else {
            harvest.recent_ids()
        };
        let delta = run.differ.href_delta(run.epoch).to_vec();

        let plan = plan_epoch(
            EpochEvidence {
                epoch: run.epoch,
                snapshot: &snapshot,
                bucket: &bucket,
                buffered: &buffered,
                href_delta: &delta,
            },
            run.crawl.processed(),
        );
        tracing::debug!(
            epoch = run.epoch.0,
            rendered = snapshot.len(),
            appeared,
            bucket = bucket.len(),
            delta = delta.len(),
            targets = plan.targets.len(),
            direct = plan.direct_urls.len(),
            "Planned epoch"
        );

        run.crawl.run_epoch(surface, harvest, store, &plan).await;
        run.epochs += 1;

        if run.epoch.is_initial() {
            return DriverState::ClickMore;
        }

        let progress = !bucket.is_empty() || !delta.is_empty();
        if progress {
            run.idle_streak = 0;
            return DriverState::ClickMore;
        }

        if !self.control_state(surface).await.is_enabled() {
            return DriverState::Stopped(StopReason::NoProgress);
        }

        run.idle_streak += 1;
        if run.idle_streak > self.config.max_idle_epochs {
            tracing::warn!(
                epoch = run.epoch.0,
                idle = run.idle_streak,
                "Load-more control still enabled but nothing new appeared, stopping"
            );
            return DriverState::Stopped(StopReason::Stalled);
        }
        run.idle_total += 1;
        tracing::warn!(
            epoch = run.epoch.0,
            idle = run.idle_streak,
            "Epoch produced no new items while load-more is enabled"
        );
        DriverState::ClickMore
    }

    async fn control_state<S>(&self, surface: &S) -> ControlState
    where
        S: ResultsSurface + ?Sized,
    {
        match surface.load_more_state().await {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!("Could not read load-more control: {e:#}");
                ControlState::Absent
            }
        }
    }

    async fn click_more<S>(&self, surface: &S, run: &Run<'a>) -> DriverState
    where
        S: ResultsSurface + ?Sized,
    {
        if self.cancelled() {
            return DriverState::Stopped(StopReason::Cancelled);
        }
        if run.clicks >= self.config.max_pages {
            tracing::info!(clicks = run.clicks, "Reached page limit");
            return DriverState::Stopped(StopReason::MaxPages);
        }
        match self.control_state(surface).await {
            ControlState::Enabled => DriverState::AwaitingGrowth,
            state => {
                tracing::debug!(?state, "Load-more control unavailable");
                DriverState::Stopped(StopReason::Exhausted)
            }
        }
    }

    async fn await_growth<S>(
        &self,
        surface: &S,
        harvest: &HarvestContext,
        run: &mut Run<'a>,
    ) -> DriverState
    where
        S: ResultsSurface + ?Sized,
    {
        let before = surface.rendered_count().await.unwrap_or(0);
        run.pre_hrefs = surface.visible_hrefs().await.unwrap_or_default();

        run.epoch = run.epoch.next();
        harvest.set_epoch(run.epoch);

        if let Err(e) = surface.click_load_more().await {
            tracing::warn!(epoch = run.epoch.0, "Load-more click failed: {e:#}");
            return DriverState::Stopped(StopReason::Exhausted);
        }
        run.clicks += 1;

        let grew = wait_with(
            move || async move {
                surface
                    .rendered_count()
                    .await
                    .map(|n| n > before)
                    .unwrap_or(false)
            },
            self.config.growth_wait,
        )
        .await;
        if !grew {
            tracing::info!(epoch = run.epoch.0, before, "Rendered count did not grow");
        }

        let epoch = run.epoch;
        let arrived =
            wait_with(move || async move { harvest.has_ids(epoch) }, self.config.network_wait).await;
        if !arrived {
            tracing::debug!(epoch = epoch.0, "No results payload for epoch");
        }
        DriverState::Settling
    }

    async fn settle<S>(&self, surface: &S, run: &mut Run<'a>) -> DriverState
    where
        S: ResultsSurface + ?Sized,
    {
        let policy = self.config.settle;
        let last = AtomicUsize::new(usize::MAX);
        let streak = AtomicU32::new(0);
        let (last, streak) = (&last, &streak);

        let settled = wait_with(
            move || async move {
                let count = match surface.rendered_count().await {
                    Ok(count) => count,
                    Err(_) => return false,
                };
                if last.swap(count, Ordering::SeqCst) == count {
                    streak.fetch_add(1, Ordering::SeqCst) + 1 >= policy.stable_polls
                } else {
                    streak.store(1, Ordering::SeqCst);
                    policy.stable_polls <= 1
                }
            },
            policy.poll(),
        )
        .await;
        if !settled {
            tracing::debug!(epoch = run.epoch.0, "Rendered count did not settle");
        }

        let post = surface.visible_hrefs().await.unwrap_or_default();
        run.differ.record_hrefs(run.epoch, &run.pre_hrefs, &post);
        DriverState::Extracting
    }
}
