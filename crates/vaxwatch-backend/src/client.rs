//! HTTP client for the reporting backend.
//!
//! Wraps `reqwest` with the shared-secret handling, status checking, and typed
//! response decoding every endpoint needs. Inventory and status reads are
//! retried on transient failures; reports are not.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::{Client, Url};
use serde::de::DeserializeOwned;
use vaxwatch_core::{WorkItem, WorkResult};

use crate::error::BackendError;
use crate::retry::retry_with_backoff;
use crate::types::{ClinicRecord, ClinicStatus, DataEnvelope, SecretRequest};

/// The status feed is a cheap read; a slow answer is treated as a failure.
const STATUS_TIMEOUT: Duration = Duration::from_secs(3);

/// Where each backend surface lives.
#[derive(Debug, Clone)]
pub struct BackendEndpoints {
    pub inventory_url: String,
    pub status_url: String,
    pub report_url: String,
    /// Base URL; `/get_stored` and `/store` are appended.
    pub credential_cache_url: String,
}

impl BackendEndpoints {
    #[must_use]
    pub fn from_app_config(config: &vaxwatch_core::AppConfig) -> Self {
        Self {
            inventory_url: config.inventory_url.clone(),
            status_url: config.status_url(),
            report_url: config.report_url.clone(),
            credential_cache_url: config.credential_cache_url.clone(),
        }
    }
}

/// Client for the reporting backend.
///
/// Cheap to clone; clones share the underlying connection pool.
#[derive(Clone)]
pub struct BackendClient {
    pub(crate) client: Client,
    pub(crate) secret: String,
    pub(crate) endpoints: BackendEndpoints,
    max_retries: u32,
    backoff_base_ms: u64,
}

impl BackendClient {
    /// Creates a client with the given per-request timeout and `User-Agent`.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Http`] if the underlying `reqwest::Client`
    /// cannot be constructed, or [`BackendError::InvalidUrl`] if an endpoint
    /// does not parse.
    pub fn new(
        secret: &str,
        endpoints: BackendEndpoints,
        timeout_secs: u64,
        user_agent: &str,
    ) -> Result<Self, BackendError> {
        for url in [
            &endpoints.inventory_url,
            &endpoints.status_url,
            &endpoints.report_url,
            &endpoints.credential_cache_url,
        ] {
            Url::parse(url).map_err(|e| BackendError::InvalidUrl {
                url: url.clone(),
                reason: e.to_string(),
            })?;
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .user_agent(user_agent)
            .build()?;

        Ok(Self {
            client,
            secret: secret.to_owned(),
            endpoints,
            max_retries: 2,
            backoff_base_ms: 1_000,
        })
    }

    /// Overrides the retry policy used for inventory and status reads.
    #[must_use]
    pub fn with_retry_policy(mut self, max_retries: u32, backoff_base_ms: u64) -> Self {
        self.max_retries = max_retries;
        self.backoff_base_ms = backoff_base_ms;
        self
    }

    /// Fetches every site record from the internal inventory.
    ///
    /// # Errors
    ///
    /// - [`BackendError::UnexpectedStatus`] on a non-200 answer.
    /// - [`BackendError::Http`] on network failure after retries.
    /// - [`BackendError::Deserialize`] if the body is not the expected envelope.
    pub async fn fetch_clinics(&self) -> Result<Vec<ClinicRecord>, BackendError> {
        let url = self.endpoints.inventory_url.clone();
        retry_with_backoff(self.max_retries, self.backoff_base_ms, || {
            let url = url.clone();
            async move {
                let response = self
                    .client
                    .post(&url)
                    .json(&SecretRequest {
                        secret: &self.secret,
                    })
                    .send()
                    .await?;
                let envelope: DataEnvelope<Vec<ClinicRecord>> =
                    decode_json(response, &url, "inventory").await?;
                Ok(envelope.data)
            }
        })
        .await
    }

    /// Fetches the inventory and keeps the sites whose scraping URL contains
    /// `keyword`.
    ///
    /// # Errors
    ///
    /// Propagates any error from [`Self::fetch_clinics`].
    pub async fn fetch_work_items(&self, keyword: &str) -> Result<Vec<WorkItem>, BackendError> {
        let clinics = self.fetch_clinics().await?;
        let items = clinics_by_url_keyword(keyword, &clinics);
        tracing::info!(
            keyword,
            total = clinics.len(),
            selected = items.len(),
            "loaded work items from inventory"
        );
        Ok(items)
    }

    /// Fetches the last known status of every site, keyed by record id.
    ///
    /// # Errors
    ///
    /// - [`BackendError::UnexpectedStatus`] on a non-200 answer.
    /// - [`BackendError::Http`] on network failure or timeout after retries.
    /// - [`BackendError::Deserialize`] if the body is not the expected envelope.
    pub async fn fetch_statuses(&self) -> Result<HashMap<String, ClinicStatus>, BackendError> {
        let url = self.endpoints.status_url.clone();
        retry_with_backoff(self.max_retries, self.backoff_base_ms, || {
            let url = url.clone();
            async move {
                let response = self
                    .client
                    .get(&url)
                    .timeout(STATUS_TIMEOUT)
                    .send()
                    .await?;
                let envelope: DataEnvelope<Vec<ClinicStatus>> =
                    decode_json(response, &url, "status feed").await?;
                Ok(envelope
                    .data
                    .into_iter()
                    .map(|s| (s.id.clone(), s))
                    .collect())
            }
        })
        .await
    }

    /// Sends one result to the reporting endpoint as a form-encoded POST.
    ///
    /// Returns the backend's response body.
    ///
    /// # Errors
    ///
    /// - [`BackendError::UnexpectedStatus`] on any non-200 answer, carrying the body.
    /// - [`BackendError::Http`] on network failure.
    pub async fn report(&self, result: &WorkResult) -> Result<String, BackendError> {
        let form = report_form(&self.secret, result);
        let response = self
            .client
            .post(&self.endpoints.report_url)
            .form(&form)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if status != reqwest::StatusCode::OK {
            return Err(BackendError::UnexpectedStatus {
                status: status.as_u16(),
                url: self.endpoints.report_url.clone(),
                body,
            });
        }
        Ok(body)
    }

    pub(crate) fn cache_url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.endpoints.credential_cache_url.trim_end_matches('/'),
            path
        )
    }
}

/// Builds the report form fields in the order the backend documents them.
///
/// `alarm` and `content_url` are only sent when the alarm is raised; tags are
/// only sent when non-empty, encoded as a JSON array string.
pub(crate) fn report_form(secret: &str, result: &WorkResult) -> Vec<(&'static str, String)> {
    let mut form = vec![
        ("key", result.key.clone()),
        ("status", result.status.as_str().to_owned()),
        ("secret", secret.to_owned()),
    ];
    if result.alarm {
        form.push(("alarm", "true".to_owned()));
        if let Some(content_url) = &result.content_url {
            form.push(("content_url", content_url.clone()));
        }
    }
    if !result.tags.is_empty() {
        let tags: Vec<String> = result.tags.iter().map(ToString::to_string).collect();
        // Serializing a Vec<String> cannot fail.
        let encoded = serde_json::to_string(&tags).unwrap_or_default();
        form.push(("scraperTags", encoded));
    }
    form
}

/// Selects the inventory records whose scraping URL contains `keyword`.
#[must_use]
pub fn clinics_by_url_keyword(keyword: &str, clinics: &[ClinicRecord]) -> Vec<WorkItem> {
    clinics
        .iter()
        .filter_map(|clinic| {
            let url = clinic.scraping_url()?;
            if !url.contains(keyword) {
                return None;
            }
            Some(WorkItem {
                id: clinic.id.clone(),
                key: clinic.key.clone(),
                human_name: clinic.name.clone(),
                locator: url.to_owned(),
                address: clinic.address.clone(),
                external_system_id: None,
            })
        })
        .collect()
}

/// Asserts a 200 answer and decodes the body as `T`.
pub(crate) async fn decode_json<T: DeserializeOwned>(
    response: reqwest::Response,
    url: &str,
    context: &str,
) -> Result<T, BackendError> {
    let status = response.status();
    let body = response.text().await?;
    if status != reqwest::StatusCode::OK {
        return Err(BackendError::UnexpectedStatus {
            status: status.as_u16(),
            url: url.to_owned(),
            body,
        });
    }
    serde_json::from_str(&body).map_err(|e| BackendError::Deserialize {
        context: format!("{context} ({url})"),
        source: e,
    })
}

#[cfg(test)]
#[path = "client_test.rs"]
mod tests;
