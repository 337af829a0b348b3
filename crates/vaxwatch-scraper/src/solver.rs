//! Human-verification challenge solving.
//!
//! [`TokenServiceSolver`] speaks the submit/poll protocol of 2captcha-style
//! services: the page's site key is submitted, the service is polled until a
//! token comes back, and the token is written into the page's response field.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::SolverError;
use crate::page::PageDriver;

/// Pages carry their site key on the challenge widget.
const SITE_KEY_SCRIPT: &str =
    "document.querySelector('[data-sitekey]')?.getAttribute('data-sitekey') ?? null";

const NOT_READY: &str = "CAPCHA_NOT_READY";

#[async_trait]
pub trait ChallengeSolver: Send + Sync {
    /// Solves the challenge currently shown on `page`.
    async fn solve(&self, page: &dyn PageDriver) -> Result<(), SolverError>;
}

/// Used when no solving service is configured; every challenge fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledSolver;

#[async_trait]
impl ChallengeSolver for DisabledSolver {
    async fn solve(&self, _page: &dyn PageDriver) -> Result<(), SolverError> {
        Err(SolverError::Disabled)
    }
}

#[derive(Debug, Deserialize)]
struct ServiceReply {
    status: u8,
    request: String,
}

pub struct TokenServiceSolver {
    client: Client,
    api_key: String,
    base_url: String,
    poll_interval: Duration,
    budget: Duration,
}

impl TokenServiceSolver {
    /// # Errors
    ///
    /// Returns [`SolverError::Http`] if the HTTP client cannot be built.
    pub fn new(api_key: &str, base_url: &str) -> Result<Self, SolverError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            api_key: api_key.to_owned(),
            base_url: base_url.trim_end_matches('/').to_owned(),
            poll_interval: Duration::from_secs(5),
            budget: Duration::from_secs(240),
        })
    }

    /// Overrides the poll cadence and the total time allowed per challenge.
    #[must_use]
    pub fn with_timing(mut self, poll_interval: Duration, budget: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.budget = budget;
        self
    }

    async fn submit(&self, site_key: &str, page_url: &str) -> Result<String, SolverError> {
        let reply: ServiceReply = self
            .client
            .post(format!("{}/in.php", self.base_url))
            .form(&[
                ("key", self.api_key.as_str()),
                ("method", "userrecaptcha"),
                ("googlekey", site_key),
                ("pageurl", page_url),
                ("json", "1"),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if reply.status != 1 {
            return Err(SolverError::Service(reply.request));
        }
        Ok(reply.request)
    }

    async fn poll(&self, request_id: &str) -> Result<String, SolverError> {
        let started = tokio::time::Instant::now();
        loop {
            tokio::time::sleep(self.poll_interval).await;
            if started.elapsed() > self.budget {
                return Err(SolverError::Timeout {
                    budget_secs: self.budget.as_secs(),
                });
            }

            let reply: ServiceReply = self
                .client
                .get(format!("{}/res.php", self.base_url))
                .query(&[
                    ("key", self.api_key.as_str()),
                    ("action", "get"),
                    ("id", request_id),
                    ("json", "1"),
                ])
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;

            match (reply.status, reply.request.as_str()) {
                (1, _) => return Ok(reply.request),
                (_, NOT_READY) => debug!(request_id, "challenge not solved yet"),
                _ => return Err(SolverError::Service(reply.request)),
            }
        }
    }
}

#[async_trait]
impl ChallengeSolver for TokenServiceSolver {
    async fn solve(&self, page: &dyn PageDriver) -> Result<(), SolverError> {
        let page_url = page.url().await?;
        let site_key = page
            .evaluate(SITE_KEY_SCRIPT)
            .await?
            .as_str()
            .filter(|k| !k.is_empty())
            .map(ToOwned::to_owned)
            .ok_or_else(|| SolverError::MissingSiteKey {
                url: page_url.clone(),
            })?;

        let request_id = self.submit(&site_key, &page_url).await?;
        info!(request_id = %request_id, "challenge submitted to solving service");

        let token = match self.poll(&request_id).await {
            Ok(token) => token,
            Err(e) => {
                warn!(request_id = %request_id, error = %e, "challenge solving failed");
                return Err(e);
            }
        };

        let token_js = serde_json::to_string(&token).unwrap_or_default();
        page.evaluate(&format!(
            "(() => {{ const field = document.getElementById('g-recaptcha-response'); \
             if (field) {{ field.innerHTML = {token_js}; field.value = {token_js}; }} \
             return true; }})()"
        ))
        .await?;
        info!(request_id = %request_id, "challenge token injected");
        Ok(())
    }
}
