//! Short-lived memo of the backend status feed.
//!
//! The freshness check runs once per work item; fetching the whole feed for
//! each of them would multiply a few hundred items into a few hundred identical
//! downloads. The feed is re-fetched at most once per TTL.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use vaxwatch_core::{LastStatus, ScrapeStatus};

use crate::client::BackendClient;
use crate::error::BackendError;
use crate::types::ClinicStatus;

pub const DEFAULT_STATUS_TTL: Duration = Duration::from_secs(10);

struct Snapshot {
    fetched_at: Instant,
    statuses: HashMap<String, ClinicStatus>,
}

pub struct StatusCache {
    client: BackendClient,
    ttl: Duration,
    snapshot: Option<Snapshot>,
}

impl StatusCache {
    #[must_use]
    pub fn new(client: BackendClient) -> Self {
        Self::with_ttl(client, DEFAULT_STATUS_TTL)
    }

    #[must_use]
    pub fn with_ttl(client: BackendClient, ttl: Duration) -> Self {
        Self {
            client,
            ttl,
            snapshot: None,
        }
    }

    /// Returns the last status the backend holds for `item_id`, if any.
    ///
    /// # Errors
    ///
    /// Propagates [`BackendClient::fetch_statuses`] errors when the memo is
    /// stale and must be refreshed.
    pub async fn get_last_status(
        &mut self,
        item_id: &str,
    ) -> Result<Option<LastStatus>, BackendError> {
        let fresh = self
            .snapshot
            .as_ref()
            .is_some_and(|s| s.fetched_at.elapsed() < self.ttl);
        if !fresh {
            let statuses = self.client.fetch_statuses().await?;
            tracing::debug!(count = statuses.len(), "refreshed status snapshot");
            self.snapshot = Some(Snapshot {
                fetched_at: Instant::now(),
                statuses,
            });
        }

        Ok(self
            .snapshot
            .as_ref()
            .and_then(|s| s.statuses.get(item_id))
            .map(to_last_status))
    }
}

/// Unrecognized availability strings count as `Unknown` so they never
/// suppress a scrape.
fn to_last_status(status: &ClinicStatus) -> LastStatus {
    LastStatus {
        status: status
            .availability
            .parse()
            .unwrap_or(ScrapeStatus::Unknown),
        last_checked_at: DateTime::<Utc>::from_timestamp(status.last_checked, 0)
            .unwrap_or_default(),
    }
}
