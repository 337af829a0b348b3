//! Blocked-aware HTTP fetch for upstreams that rate-limit by IP.
//!
//! A 403 or 429, a timeout, or a refused connection is how these upstreams
//! signal that they have stopped serving us. A few quick retries absorb a
//! blip; if every attempt is refused the caller gets
//! [`ScraperError::UpstreamBlocked`] and the run backs off as a whole.

use std::time::Duration;

use reqwest::{RequestBuilder, Response, StatusCode};

use crate::error::ScraperError;

/// Sleep before each attempt.
pub const ATTEMPT_DELAYS: [Duration; 3] = [
    Duration::ZERO,
    Duration::from_secs(1),
    Duration::from_secs(1),
];

fn is_block_status(status: StatusCode) -> bool {
    status == StatusCode::FORBIDDEN || status == StatusCode::TOO_MANY_REQUESTS
}

/// Sends the request built by `build` until it gets an answer that is not a
/// block signal.
///
/// Any response other than 403/429 is returned as-is, including error
/// statuses; the caller decides what they mean.
///
/// # Errors
///
/// - [`ScraperError::UpstreamBlocked`] once every attempt was blocked, timed
///   out or refused.
/// - [`ScraperError::Http`] for any other transport error, without retrying.
pub async fn fetch_with_retries<F>(mut build: F) -> Result<Response, ScraperError>
where
    F: FnMut() -> RequestBuilder,
{
    let mut last_reason = String::new();

    for (attempt, delay) in ATTEMPT_DELAYS.iter().enumerate() {
        if !delay.is_zero() {
            tokio::time::sleep(*delay).await;
        }

        match build().send().await {
            Ok(response) if is_block_status(response.status()) => {
                last_reason = format!("HTTP {} from {}", response.status(), response.url());
            }
            Ok(response) => return Ok(response),
            Err(err) if err.is_timeout() || err.is_connect() => {
                last_reason = err.to_string();
            }
            Err(err) => return Err(ScraperError::Http(err)),
        }

        tracing::warn!(
            attempt,
            max_attempts = ATTEMPT_DELAYS.len(),
            reason = %last_reason,
            "upstream refused request"
        );
    }

    Err(ScraperError::UpstreamBlocked {
        reason: format!("refused or timed out repeatedly ({last_reason})"),
    })
}
