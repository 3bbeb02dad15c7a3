//! listing-harvest: reconciles network payloads and DOM snapshots of a paginated results grid into a deduplicated listing store.

pub mod config;
pub mod crawl;
pub mod driver;
pub mod extract;
pub mod harvest;
pub mod reconcile;
pub mod snapshot;
pub mod store;
pub mod surface;
pub mod types;
pub mod wait;

pub use config::{HarvestConfig, PollPolicy, SelectorConfig, SettlePolicy};
pub use crawl::{EpochOutcome, TargetCrawl, TargetStats};
pub use driver::{DriverState, PaginationDriver, StopReason, TargetReport};
pub use extract::{canonicalize_url, HrefStrategy, RecordExtractor};
pub use harvest::{extract_ids, HarvestBuffer, HarvestContext, ResponseObservation};
pub use reconcile::{plan_epoch, EpochPlan, ProcessedTargets};
pub use snapshot::{DomDifferencer, DomSnapshot, RenderedItem};
pub use store::{ListingStore, MergeSummary, SeenIndex};
pub use surface::{ControlState, ResultsSurface};
pub use types::*;
pub use wait::{wait_until, wait_with};
