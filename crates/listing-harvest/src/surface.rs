//! The browsing surface the engine drives.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::snapshot::{DomSnapshot, RenderedItem};

/// State of the load-more control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlState {
    Absent,
    Disabled,
    Enabled,
}

impl ControlState {
    pub fn is_enabled(self) -> bool {
        self == ControlState::Enabled
    }
}

/// A live results page.
///
/// Implementations wrap a browser tab (see the CLI crate) or a scripted fake
/// in tests. Methods take `&self` so the driver can poll them from inside
/// bounded waits.
#[async_trait]
pub trait ResultsSurface: Send + Sync {
    /// Number of result items currently rendered.
    async fn rendered_count(&self) -> Result<usize>;

    /// Ordered snapshot of the rendered items.
    async fn snapshot(&self) -> Result<DomSnapshot>;

    /// The listing href of each rendered item that has one, in document order.
    ///
    /// At most one href per item; see [`crate::RecordExtractor::listing_href`].
    async fn visible_hrefs(&self) -> Result<Vec<String>>;

    /// Scroll the item into view and return its outer HTML.
    ///
    /// `Ok(None)` means the item is no longer rendered.
    async fn inspect(&self, item: &RenderedItem) -> Result<Option<String>>;

    async fn load_more_state(&self) -> Result<ControlState>;

    /// Trigger one growth action.
    async fn click_load_more(&self) -> Result<()>;
}
