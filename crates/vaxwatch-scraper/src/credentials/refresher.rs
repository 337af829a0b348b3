//! Drives the portal's consent and login flow to obtain a new credential.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};
use vaxwatch_core::{AuxiliaryToken, CredentialArtifact};

use crate::error::{PageError, RefreshError};
use crate::page::{Browser, PageDriver, WaitOptions};
use crate::solver::ChallengeSolver;

pub(crate) const CONSENT_SELECTOR: &str = "#covid_vaccine_search_questions_content input";
pub(crate) const SUBMIT_SELECTOR: &str = "#covid_vaccine_search_questions_submit .btn-primary";
pub(crate) const CHALLENGE_SELECTOR: &str = "#recaptchaRow";
pub(crate) const LOGIN_RESPONSE_FRAGMENT: &str = "loginPharmacistFromEmail.do";

const CONSENT_TIMEOUT: Duration = Duration::from_secs(5);
const CHALLENGE_PROMPT_TIMEOUT: Duration = Duration::from_secs(30);
const LOGIN_RESPONSE_TIMEOUT: Duration = Duration::from_secs(240);

/// Cookies that authorize portal API calls; everything else is dropped.
pub const ALLOWED_COOKIES: [&str; 5] = [
    "JSESSIONID",
    "AWSALBCORS",
    "AWSALB",
    "AWSALBTGCORS",
    "AWSALBTG",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsentPolicy {
    /// The consent step must be present.
    Required,
    /// Some pages skip the consent step; its absence is fine.
    Ignorable,
}

/// Source of fresh credentials for a broker.
#[async_trait]
pub trait Refresher: Send + Sync {
    async fn refresh(&self, browser: &dyn Browser) -> Result<CredentialArtifact, RefreshError>;
}

#[derive(Deserialize)]
struct LoginResponse {
    #[serde(rename = "csrfKey")]
    csrf_key: Option<String>,
}

pub struct ChallengeRefresher {
    target_url: String,
    consent: ConsentPolicy,
    solver: Arc<dyn ChallengeSolver>,
}

impl ChallengeRefresher {
    pub fn new(
        target_url: impl Into<String>,
        consent: ConsentPolicy,
        solver: Arc<dyn ChallengeSolver>,
    ) -> Self {
        Self {
            target_url: target_url.into(),
            consent,
            solver,
        }
    }

    #[must_use]
    pub fn target_url(&self) -> &str {
        &self.target_url
    }

    /// Runs the flow on an already-navigated page.
    ///
    /// # Errors
    ///
    /// - [`RefreshError::VerificationStepMissing`] when the consent step is
    ///   absent and the policy requires it.
    /// - [`RefreshError::ChallengeSolver`] when a challenge appears and the
    ///   solver fails.
    /// - [`RefreshError::CredentialExtraction`] when the login response has
    ///   no session key.
    /// - [`RefreshError::Page`] for driver failures and timeouts.
    pub async fn capture(&self, page: &dyn PageDriver) -> Result<CredentialArtifact, RefreshError> {
        self.complete_consent(page).await?;
        page.click(SUBMIT_SELECTOR).await?;

        // The login call either fires straight away or only after a challenge.
        let body = tokio::select! {
            direct = page.wait_for_response(LOGIN_RESPONSE_FRAGMENT, LOGIN_RESPONSE_TIMEOUT) => {
                direct?
            }
            challenged = self.clear_challenge(page) => challenged?,
        };

        let session_key = extract_session_key(&body)?;
        let auxiliary_tokens = page
            .cookies()
            .await?
            .into_iter()
            .filter(|c| ALLOWED_COOKIES.contains(&c.name.as_str()))
            .map(|c| AuxiliaryToken {
                name: c.name,
                value: c.value,
            })
            .collect();

        Ok(CredentialArtifact {
            session_key,
            auxiliary_tokens,
        })
    }

    async fn complete_consent(&self, page: &dyn PageDriver) -> Result<(), RefreshError> {
        match page
            .wait_for_selector(CONSENT_SELECTOR, WaitOptions::visible(CONSENT_TIMEOUT))
            .await
        {
            Ok(()) => {
                let clicked = page.click_all(CONSENT_SELECTOR).await?;
                debug!(clicked, "answered consent questions");
                Ok(())
            }
            Err(PageError::Timeout { .. } | PageError::ElementNotFound { .. })
                if self.consent == ConsentPolicy::Ignorable =>
            {
                info!(url = %self.target_url, "no consent step on this page, continuing");
                Ok(())
            }
            Err(PageError::Timeout { .. } | PageError::ElementNotFound { .. }) => {
                Err(RefreshError::VerificationStepMissing {
                    selector: CONSENT_SELECTOR.to_owned(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn clear_challenge(&self, page: &dyn PageDriver) -> Result<String, RefreshError> {
        let prompt = page
            .wait_for_selector(
                CHALLENGE_SELECTOR,
                WaitOptions::visible(CHALLENGE_PROMPT_TIMEOUT),
            )
            .await;
        match prompt {
            Ok(()) => {}
            Err(PageError::Timeout { .. } | PageError::ElementNotFound { .. }) => {
                return Ok(page
                    .wait_for_response(LOGIN_RESPONSE_FRAGMENT, LOGIN_RESPONSE_TIMEOUT)
                    .await?);
            }
            Err(e) => return Err(e.into()),
        }

        info!(url = %self.target_url, "challenge prompt shown, solving");
        self.solver.solve(page).await?;
        page.click(SUBMIT_SELECTOR).await?;
        Ok(page
            .wait_for_response(LOGIN_RESPONSE_FRAGMENT, LOGIN_RESPONSE_TIMEOUT)
            .await?)
    }
}

#[async_trait]
impl Refresher for ChallengeRefresher {
    async fn refresh(&self, browser: &dyn Browser) -> Result<CredentialArtifact, RefreshError> {
        info!(url = %self.target_url, "beginning credential refresh");
        let page = browser.new_page().await?;

        let result = match page.navigate(&self.target_url).await {
            Ok(()) => self.capture(page.as_ref()).await,
            Err(e) => Err(e.into()),
        };

        if let Err(e) = page.close().await {
            warn!(error = %e, "failed to close refresh page");
        }

        let artifact = result?;
        info!(url = %self.target_url, "credential refresh successful");
        debug!(session_key = %artifact.session_key, "using session key");
        for token in &artifact.auxiliary_tokens {
            debug!(name = %token.name, value = %token.value, "using cookie");
        }
        Ok(artifact)
    }
}

fn extract_session_key(body: &str) -> Result<String, RefreshError> {
    let parsed: LoginResponse =
        serde_json::from_str(body).map_err(|e| RefreshError::CredentialExtraction {
            reason: format!("login response is not JSON: {e}"),
        })?;
    parsed
        .csrf_key
        .filter(|k| !k.is_empty())
        .ok_or_else(|| RefreshError::CredentialExtraction {
            reason: "csrfKey missing".to_owned(),
        })
}
