//! Browser automation capability.
//!
//! Everything that touches a real browser goes through [`Browser`] and
//! [`PageDriver`], so the credential flow can be driven by an in-memory fake
//! in tests and by Chrome DevTools in production ([`chrome`]).

pub mod chrome;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::PageError;

pub use chrome::{ChromeBrowser, ChromeOptions};

/// A cookie as read back from the page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOptions {
    pub timeout: Duration,
    /// Require the element to be rendered, not merely present in the DOM.
    pub visible: bool,
}

impl WaitOptions {
    #[must_use]
    pub fn present(timeout: Duration) -> Self {
        Self {
            timeout,
            visible: false,
        }
    }

    #[must_use]
    pub fn visible(timeout: Duration) -> Self {
        Self {
            timeout,
            visible: true,
        }
    }
}

#[async_trait]
pub trait Browser: Send + Sync {
    /// Opens a fresh tab. The caller owns it and must [`PageDriver::close`] it.
    async fn new_page(&self) -> Result<Box<dyn PageDriver>, PageError>;
}

/// One open browser tab.
///
/// Every method takes `&self` so two waits on the same page can be raced
/// against each other.
#[async_trait]
pub trait PageDriver: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<(), PageError>;

    /// Waits for `selector` to match; [`PageError::Timeout`] when it never does.
    async fn wait_for_selector(&self, selector: &str, opts: WaitOptions) -> Result<(), PageError>;

    async fn click(&self, selector: &str) -> Result<(), PageError>;

    /// Clicks every element matching `selector` and returns how many there were.
    async fn click_all(&self, selector: &str) -> Result<usize, PageError>;

    /// Text content of the first match, `None` when nothing matches.
    async fn evaluate_text(&self, selector: &str) -> Result<Option<String>, PageError>;

    async fn evaluate(&self, script: &str) -> Result<serde_json::Value, PageError>;

    async fn content(&self) -> Result<String, PageError>;

    async fn cookies(&self) -> Result<Vec<Cookie>, PageError>;

    /// Resolves with the body of the first network response whose URL contains
    /// `url_fragment`, including one that already arrived on this page.
    async fn wait_for_response(
        &self,
        url_fragment: &str,
        timeout: Duration,
    ) -> Result<String, PageError>;

    async fn url(&self) -> Result<String, PageError>;

    async fn close(&self) -> Result<(), PageError>;
}
