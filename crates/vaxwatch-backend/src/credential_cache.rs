//! Cross-run credential cache.
//!
//! Registered-company portal scopes persist their credential and use count
//! between runs so that a fresh process does not pay for a challenge solve on
//! every start.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use vaxwatch_core::CredentialUsageState;

use crate::client::{decode_json, BackendClient};
use crate::error::BackendError;
use crate::types::SecretRequest;

#[derive(Debug, Deserialize)]
struct StoredEnvelope {
    #[serde(default)]
    data: Option<HashMap<String, CredentialUsageState>>,
}

#[derive(Debug, Serialize)]
struct StoreRequest<'a> {
    secret: &'a str,
    data: &'a HashMap<String, CredentialUsageState>,
}

impl BackendClient {
    /// Loads the stored usage state of every credential scope.
    ///
    /// An empty store (`"data": null`) yields an empty map.
    ///
    /// # Errors
    ///
    /// - [`BackendError::UnexpectedStatus`] on a non-200 answer.
    /// - [`BackendError::Http`] on network failure.
    /// - [`BackendError::Deserialize`] if the stored payload does not decode.
    pub async fn load_credentials(
        &self,
    ) -> Result<HashMap<String, CredentialUsageState>, BackendError> {
        let url = self.cache_url("get_stored");
        let response = self
            .client
            .post(&url)
            .json(&SecretRequest {
                secret: &self.secret,
            })
            .send()
            .await?;
        let envelope: StoredEnvelope = decode_json(response, &url, "credential cache").await?;
        Ok(envelope.data.unwrap_or_default())
    }

    /// Replaces the stored usage state. Returns whether the store accepted it.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Http`] on network failure. A non-200 answer is
    /// reported as `Ok(false)`.
    pub async fn save_credentials(
        &self,
        states: &HashMap<String, CredentialUsageState>,
    ) -> Result<bool, BackendError> {
        let url = self.cache_url("store");
        let response = self
            .client
            .post(&url)
            .json(&StoreRequest {
                secret: &self.secret,
                data: states,
            })
            .send()
            .await?;
        let accepted = response.status() == reqwest::StatusCode::OK;
        if !accepted {
            tracing::warn!(status = response.status().as_u16(), "credential cache rejected store");
        }
        Ok(accepted)
    }
}
