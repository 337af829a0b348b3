//! Data model shared by the backend client, the scrapers, and the CLI.
//!
//! Field names on the serialized forms follow the fixed external backend:
//! the reporting endpoint expects `Yes`/`No`/`APIFailed` status strings and the
//! credential cache stores `{ "credentials": { "csrfKey", "cookies" }, "useCount" }`.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::CoreError;

/// Availability verdict for one work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScrapeStatus {
    Yes,
    No,
    Possible,
    Limited,
    Unknown,
    #[serde(rename = "APIFailed")]
    ApiFailed,
}

impl ScrapeStatus {
    /// Wire representation used by the reporting and status endpoints.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Yes => "Yes",
            Self::No => "No",
            Self::Possible => "Possible",
            Self::Limited => "Limited",
            Self::Unknown => "Unknown",
            Self::ApiFailed => "APIFailed",
        }
    }
}

impl fmt::Display for ScrapeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScrapeStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Yes" => Ok(Self::Yes),
            "No" => Ok(Self::No),
            "Possible" => Ok(Self::Possible),
            "Limited" => Ok(Self::Limited),
            "Unknown" => Ok(Self::Unknown),
            "APIFailed" => Ok(Self::ApiFailed),
            other => Err(CoreError::UnknownStatus(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VaccineType {
    Pfizer,
    Moderna,
    Johnson,
}

impl fmt::Display for VaccineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pfizer => write!(f, "pfizer"),
            Self::Moderna => write!(f, "moderna"),
            Self::Johnson => write!(f, "johnson"),
        }
    }
}

/// One scrape target as described by the site inventory. Read-only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    /// Inventory record id; the key the freshness lookup is indexed by.
    pub id: String,
    /// Location key reported back to the backend (e.g. `riteaid_5204`).
    pub key: String,
    pub human_name: String,
    /// Scraping URL (the inventory's `alternateUrl` when set).
    pub locator: String,
    pub address: Option<String>,
    /// Identifier of the upstream scheduling system the location belongs to,
    /// e.g. the portal search-client id.
    pub external_system_id: Option<String>,
}

/// Outcome for one [`WorkItem`] in one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkResult {
    pub key: String,
    pub status: ScrapeStatus,
    pub tags: BTreeSet<VaccineType>,
    pub alarm: bool,
    pub content_url: Option<String>,
}

impl WorkResult {
    #[must_use]
    pub fn new(key: impl Into<String>, status: ScrapeStatus) -> Self {
        Self {
            key: key.into(),
            status,
            tags: BTreeSet::new(),
            alarm: false,
            content_url: None,
        }
    }

    #[must_use]
    pub fn unknown(key: impl Into<String>) -> Self {
        Self::new(key, ScrapeStatus::Unknown)
    }

    #[must_use]
    pub fn with_tags(mut self, tags: impl IntoIterator<Item = VaccineType>) -> Self {
        self.tags.extend(tags);
        self
    }

    #[must_use]
    pub fn with_alarm(mut self) -> Self {
        self.alarm = true;
        self
    }
}

/// A named cookie carried alongside the session key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuxiliaryToken {
    pub name: String,
    pub value: String,
}

/// Session key plus the allow-listed cookies that authorize portal API calls.
///
/// Issued whole by a refresh and replaced whole by the next one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialArtifact {
    #[serde(rename = "csrfKey")]
    pub session_key: String,
    #[serde(rename = "cookies", default)]
    pub auxiliary_tokens: Vec<AuxiliaryToken>,
}

impl CredentialArtifact {
    /// Renders the auxiliary tokens as a `Cookie` header value.
    #[must_use]
    pub fn cookie_header(&self) -> String {
        self.auxiliary_tokens
            .iter()
            .map(|t| format!("{}={}", t.name, t.value))
            .collect::<Vec<_>>()
            .join(";")
    }
}

/// Credential plus how many degrading uses it has absorbed since issue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialUsageState {
    #[serde(rename = "credentials", default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<CredentialArtifact>,
    #[serde(rename = "useCount", default)]
    pub use_count: u32,
}

/// Most recent status the backend holds for an item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastStatus {
    pub status: ScrapeStatus,
    pub last_checked_at: DateTime<Utc>,
}
