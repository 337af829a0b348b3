use thiserror::Error;
use vaxwatch_backend::BackendError;

/// Failures reported by a page driver.
#[derive(Debug, Error)]
pub enum PageError {
    #[error("timed out after {timeout_ms}ms waiting for {what}")]
    Timeout { what: String, timeout_ms: u64 },

    #[error("no element matches {selector}")]
    ElementNotFound { selector: String },

    #[error("browser driver error: {0}")]
    Driver(String),
}

impl PageError {
    pub(crate) fn timeout(what: impl Into<String>, timeout: std::time::Duration) -> Self {
        Self::Timeout {
            what: what.into(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

#[derive(Debug, Error)]
pub enum SolverError {
    #[error("challenge solving is disabled (no service key configured)")]
    Disabled,

    #[error("no challenge site key found on {url}")]
    MissingSiteKey { url: String },

    #[error("challenge service rejected the request: {0}")]
    Service(String),

    #[error("challenge not solved within {budget_secs}s")]
    Timeout { budget_secs: u64 },

    #[error("challenge service HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("page error while solving challenge: {0}")]
    Page(#[from] PageError),
}

/// Why a credential refresh could not produce an artifact.
#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("consent step missing: {selector} never became visible")]
    VerificationStepMissing { selector: String },

    #[error("challenge solver failed: {0}")]
    ChallengeSolver(#[from] SolverError),

    #[error("session key not found in login response: {reason}")]
    CredentialExtraction { reason: String },

    #[error("page error during refresh: {0}")]
    Page(#[from] PageError),
}

#[derive(Debug, Error)]
pub enum ScraperError {
    #[error("credentials unavailable for scope {scope}: {source}")]
    CredentialUnavailable {
        scope: String,
        #[source]
        source: RefreshError,
    },

    #[error("blocked by upstream: {reason}")]
    UpstreamBlocked { reason: String },

    #[error("request to {url} timed out")]
    Timeout { url: String },

    #[error("HTTP error: {0}")]
    Http(reqwest::Error),

    #[error("JSON deserialization error for {context}: {source}")]
    Deserialize {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("unexpected HTTP status {status} from {url}")]
    UnexpectedStatus { status: u16, url: String },

    #[error(transparent)]
    Page(#[from] PageError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("scrape failed: {0}")]
    Scrape(String),
}

impl From<reqwest::Error> for ScraperError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout {
                url: err.url().map(ToString::to_string).unwrap_or_default(),
            }
        } else {
            Self::Http(err)
        }
    }
}

impl ScraperError {
    /// The confirmation step could not finish because something upstream was
    /// too slow or the challenge solver was saturated. These are worth another
    /// attempt; anything else is not.
    #[must_use]
    pub fn is_unconfirmable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Page(PageError::Timeout { .. }) => true,
            Self::CredentialUnavailable { source, .. } => matches!(
                source,
                RefreshError::ChallengeSolver(_) | RefreshError::Page(PageError::Timeout { .. })
            ),
            _ => false,
        }
    }
}
