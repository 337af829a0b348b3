//! "Was this item checked recently enough to skip?"

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use vaxwatch_backend::StatusCache;
use vaxwatch_core::{LastStatus, ScrapeStatus};

use crate::error::ScraperError;

pub const DEFAULT_FRESHNESS_WINDOW: Duration = Duration::from_secs(4 * 60);

#[async_trait]
pub trait LastStatusLookup: Send {
    async fn last_status(&mut self, item_id: &str) -> Result<Option<LastStatus>, ScraperError>;
}

#[async_trait]
impl LastStatusLookup for StatusCache {
    async fn last_status(&mut self, item_id: &str) -> Result<Option<LastStatus>, ScraperError> {
        Ok(self.get_last_status(item_id).await?)
    }
}

/// A known, non-`Unknown` status checked less than `window` before `now`.
#[must_use]
pub fn is_fresh(last: &LastStatus, now: DateTime<Utc>, window: Duration) -> bool {
    if last.status == ScrapeStatus::Unknown {
        return false;
    }
    let Ok(window) = chrono::Duration::from_std(window) else {
        return false;
    };
    now.signed_duration_since(last.last_checked_at) < window
}
