//! Wire types for the backend's JSON endpoints.
//!
//! Both the inventory and the status feed wrap their payload in a
//! `{"data": [...]}` envelope; [`DataEnvelope`] captures that generically.

use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct DataEnvelope<T> {
    pub data: T,
}

/// One site record from the internal inventory.
#[derive(Debug, Clone, Deserialize)]
pub struct ClinicRecord {
    pub id: String,
    pub name: String,
    pub key: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    /// Overrides `url` as the scraping target when present.
    #[serde(default, rename = "alternateUrl")]
    pub alternate_url: Option<String>,
    #[serde(default)]
    pub scraper_config: Option<String>,
}

impl ClinicRecord {
    /// URL a scraper should visit for this record.
    #[must_use]
    pub fn scraping_url(&self) -> Option<&str> {
        self.alternate_url
            .as_deref()
            .filter(|u| !u.is_empty())
            .or(self.url.as_deref())
    }
}

/// Last known status of a site from the public status feed.
#[derive(Debug, Clone, Deserialize)]
pub struct ClinicStatus {
    pub id: String,
    #[serde(rename = "Availability")]
    pub availability: String,
    /// Unix seconds.
    #[serde(rename = "lastChecked")]
    pub last_checked: i64,
    #[serde(default, rename = "lastAvailable")]
    pub last_available: Option<i64>,
}

#[derive(Debug, Serialize)]
pub(crate) struct SecretRequest<'a> {
    pub secret: &'a str,
}
