//! Sequential work loop for one pipeline.
//!
//! Items are processed one after another by a single task: the throttle and
//! the credential brokers are owned here and never shared, which keeps
//! refreshes for a scope from overlapping.

use std::time::Duration;

use chrono::Utc;
use rand::seq::SliceRandom;
use tracing::{error, info, warn};
use vaxwatch_core::{ScrapeStatus, WorkItem, WorkResult};

use crate::credentials::BrokerPool;
use crate::error::ScraperError;
use crate::freshness::{is_fresh, LastStatusLookup, DEFAULT_FRESHNESS_WINDOW};
use crate::sites::{AvailabilityCheck, ProbeOutcome};
use crate::throttle::ThrottleController;

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub freshness_window: Duration,
    /// Extra confirmation attempts after a positive probe that could not be
    /// confirmed.
    pub confirm_retries: u32,
    pub shuffle: bool,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            freshness_window: DEFAULT_FRESHNESS_WINDOW,
            confirm_retries: 2,
            shuffle: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemOutcome {
    pub result: WorkResult,
    /// `false` when the result must not be sent to the backend.
    pub report: bool,
}

impl ItemOutcome {
    fn reported(result: WorkResult) -> Self {
        Self {
            result,
            report: true,
        }
    }

    fn suppressed(key: &str) -> Self {
        Self {
            result: WorkResult::unknown(key),
            report: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub outcomes: Vec<ItemOutcome>,
}

impl RunSummary {
    pub fn reportable(&self) -> impl Iterator<Item = &WorkResult> {
        self.outcomes.iter().filter(|o| o.report).map(|o| &o.result)
    }

    #[must_use]
    pub fn count_with_status(&self, status: ScrapeStatus) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.result.status == status)
            .count()
    }
}

/// How one item ended before it is turned into an [`ItemOutcome`].
enum Scraped {
    Done(WorkResult),
    /// Positive probe that could not be confirmed in the allowed attempts.
    Unconfirmed,
}

pub struct WorkUnitRunner {
    site: Box<dyn AvailabilityCheck>,
    throttle: ThrottleController,
    freshness: Option<Box<dyn LastStatusLookup>>,
    credentials: Option<BrokerPool>,
    options: RunnerOptions,
}

impl WorkUnitRunner {
    pub fn new(site: Box<dyn AvailabilityCheck>) -> Self {
        Self {
            site,
            throttle: ThrottleController::new(),
            freshness: None,
            credentials: None,
            options: RunnerOptions::default(),
        }
    }

    #[must_use]
    pub fn with_freshness(mut self, lookup: Box<dyn LastStatusLookup>) -> Self {
        self.freshness = Some(lookup);
        self
    }

    #[must_use]
    pub fn with_credentials(mut self, pool: BrokerPool) -> Self {
        self.credentials = Some(pool);
        self
    }

    #[must_use]
    pub fn with_options(mut self, options: RunnerOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn throttle(&self) -> &ThrottleController {
        &self.throttle
    }

    #[must_use]
    pub fn credentials(&self) -> Option<&BrokerPool> {
        self.credentials.as_ref()
    }

    /// Processes every item once and returns one outcome per item.
    ///
    /// Never fails as a whole: per-item errors become `Unknown` outcomes, and
    /// an upstream block turns the rest of the queue into suppressed
    /// `Unknown`s.
    pub async fn run(&mut self, mut items: Vec<WorkItem>) -> RunSummary {
        let site = self.site.kind();
        if self.options.shuffle {
            items.shuffle(&mut rand::rng());
        }

        if self.throttle.is_cooling_down() {
            error!(
                %site,
                remaining_secs = self.throttle.remaining().as_secs(),
                skipped = items.len(),
                "pipeline cooling down, skipping run"
            );
            return RunSummary {
                outcomes: items
                    .iter()
                    .map(|item| ItemOutcome::suppressed(&item.key))
                    .collect(),
            };
        }

        let mut outcomes = Vec::with_capacity(items.len());
        let mut queue = items.into_iter();
        while let Some(item) = queue.next() {
            if self.is_fresh(&item).await {
                outcomes.push(ItemOutcome::suppressed(&item.key));
                continue;
            }

            match self.scrape_item(&item).await {
                Ok(Scraped::Done(result)) => {
                    self.throttle.on_success();
                    info!(
                        item = %item.key,
                        status = %result.status,
                        tags = ?result.tags,
                        "scraped"
                    );
                    outcomes.push(ItemOutcome::reported(result));
                }
                Ok(Scraped::Unconfirmed) => {
                    warn!(item = %item.key, "positive probe could not be confirmed");
                    outcomes.push(ItemOutcome::suppressed(&item.key));
                }
                Err(ScraperError::UpstreamBlocked { reason }) => {
                    self.throttle.on_blocked();
                    error!(item = %item.key, %reason, "blocked by upstream, aborting run");
                    outcomes.push(ItemOutcome::suppressed(&item.key));
                    outcomes.extend(queue.by_ref().map(|rest| ItemOutcome::suppressed(&rest.key)));
                    break;
                }
                Err(err @ ScraperError::CredentialUnavailable { .. }) => {
                    error!(
                        item = %item.key,
                        error = %err,
                        "credentials unavailable, raising alarm"
                    );
                    outcomes.push(ItemOutcome::reported(
                        WorkResult::unknown(&item.key).with_alarm(),
                    ));
                }
                Err(err) => {
                    warn!(item = %item.key, error = %err, "scrape failed");
                    outcomes.push(ItemOutcome::reported(WorkResult::unknown(&item.key)));
                }
            }
        }

        RunSummary { outcomes }
    }

    async fn is_fresh(&mut self, item: &WorkItem) -> bool {
        let Some(lookup) = self.freshness.as_mut() else {
            return false;
        };
        match lookup.last_status(&item.id).await {
            Ok(Some(last)) if is_fresh(&last, Utc::now(), self.options.freshness_window) => {
                info!(
                    item = %item.key,
                    checked_secs_ago = (Utc::now() - last.last_checked_at).num_seconds(),
                    "checked recently, skipping"
                );
                true
            }
            Ok(_) => false,
            Err(e) => {
                warn!(item = %item.key, error = %e, "freshness lookup failed");
                false
            }
        }
    }

    async fn scrape_item(&mut self, item: &WorkItem) -> Result<Scraped, ScraperError> {
        let first = self.scrape_once(item).await?;
        match first {
            Scraped::Done(result) if result.status == ScrapeStatus::Possible => {
                info!(item = %item.key, "inconclusive result, scraping again");
                self.scrape_once(item).await
            }
            other => Ok(other),
        }
    }

    async fn scrape_once(&mut self, item: &WorkItem) -> Result<Scraped, ScraperError> {
        let tags = match self.site.probe(item).await? {
            ProbeOutcome::Settled(result) => return Ok(Scraped::Done(result)),
            ProbeOutcome::Positive { tags } => tags,
        };

        let mut attempt = 0;
        loop {
            match self.site.confirm(item, self.credentials.as_mut()).await {
                Ok(result) => return Ok(Scraped::Done(result.with_tags(tags))),
                Err(err) if err.is_unconfirmable() && attempt < self.options.confirm_retries => {
                    attempt += 1;
                    warn!(item = %item.key, attempt, error = %err, "confirmation failed, retrying");
                }
                Err(err) if err.is_unconfirmable() => return Ok(Scraped::Unconfirmed),
                Err(err) => return Err(err),
            }
        }
    }
}
