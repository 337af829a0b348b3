//! Per-site availability checks.
//!
//! Each site family implements [`AvailabilityCheck`]: a cheap `probe` that
//! may settle the answer on its own, and a `confirm` that runs only after a
//! positive probe. [`build_site`] is the registry from [`SiteKind`] to
//! implementation.

pub mod portal;
pub mod slot_api;

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use vaxwatch_core::{VaccineType, WorkItem, WorkResult};

use crate::credentials::BrokerPool;
use crate::error::ScraperError;

pub use portal::PortalCheck;
pub use slot_api::SlotApiCheck;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The probe alone decided the result.
    Settled(WorkResult),
    /// Availability looks likely and needs confirming.
    Positive { tags: BTreeSet<VaccineType> },
}

#[async_trait]
pub trait AvailabilityCheck: Send + Sync {
    fn kind(&self) -> SiteKind;

    async fn probe(&self, item: &WorkItem) -> Result<ProbeOutcome, ScraperError>;

    /// `credentials` is `None` for pipelines that run without a browser.
    async fn confirm(
        &self,
        item: &WorkItem,
        credentials: Option<&mut BrokerPool>,
    ) -> Result<WorkResult, ScraperError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SiteKind {
    /// Credential-gated pharmacy portal.
    Portal,
    /// Retail pharmacy slot API.
    SlotApi,
}

impl SiteKind {
    /// Inventory records whose scraping URL contains this belong to the site.
    #[must_use]
    pub fn url_keyword(self) -> &'static str {
        match self {
            Self::Portal => "mhealth",
            Self::SlotApi => "riteaid",
        }
    }

    #[must_use]
    pub fn needs_credentials(self) -> bool {
        matches!(self, Self::Portal)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Portal => "portal",
            Self::SlotApi => "slot-api",
        }
    }
}

impl fmt::Display for SiteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SiteKind {
    type Err = ScraperError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "portal" => Ok(Self::Portal),
            "slot-api" => Ok(Self::SlotApi),
            other => Err(ScraperError::Scrape(format!("unknown site kind: {other}"))),
        }
    }
}

/// Endpoints and HTTP client shared by the site implementations.
#[derive(Debug, Clone)]
pub struct SiteSettings {
    pub client: Client,
    pub availability_feed_url: String,
    pub portal_base_url: String,
    pub slot_api_base_url: String,
}

#[must_use]
pub fn build_site(kind: SiteKind, settings: &SiteSettings) -> Box<dyn AvailabilityCheck> {
    match kind {
        SiteKind::Portal => Box::new(PortalCheck::new(
            settings.client.clone(),
            &settings.availability_feed_url,
            &settings.portal_base_url,
        )),
        SiteKind::SlotApi => Box::new(SlotApiCheck::new(
            settings.client.clone(),
            &settings.slot_api_base_url,
        )),
    }
}

/// Asserts a 2xx answer and decodes the body as `T`.
pub(crate) async fn decode_json<T: DeserializeOwned>(
    response: reqwest::Response,
    context: &str,
) -> Result<T, ScraperError> {
    let status = response.status();
    let url = response.url().to_string();
    if !status.is_success() {
        return Err(ScraperError::UnexpectedStatus {
            status: status.as_u16(),
            url,
        });
    }
    let body = response.text().await?;
    serde_json::from_str(&body).map_err(|e| ScraperError::Deserialize {
        context: format!("{context} ({url})"),
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn site_kind_round_trips_through_str() {
        for kind in [SiteKind::Portal, SiteKind::SlotApi] {
            assert_eq!(kind.as_str().parse::<SiteKind>().unwrap(), kind);
        }
        assert!("walgreens".parse::<SiteKind>().is_err());
    }

    #[test]
    fn only_portal_needs_credentials() {
        assert!(SiteKind::Portal.needs_credentials());
        assert!(!SiteKind::SlotApi.needs_credentials());
    }
}
