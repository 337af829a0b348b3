//! Chrome DevTools Protocol adapter for [`Browser`] and [`PageDriver`].
//!
//! `headless_chrome` is a blocking library; every call into a tab runs on the
//! blocking pool. Network responses are captured from the moment a tab opens
//! so a wait that starts after the response arrived still sees it.

use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use headless_chrome::protocol::cdp::Network::events::ResponseReceivedEventParams;
use headless_chrome::protocol::cdp::Network::GetResponseBodyReturnObject;
use headless_chrome::{LaunchOptions, Tab};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

use super::{Browser, Cookie, PageDriver, WaitOptions};
use crate::error::PageError;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const RESPONSE_HANDLER: &str = "vaxwatch-response-log";

#[derive(Debug, Clone)]
pub struct ChromeOptions {
    pub headless: bool,
    /// Browser executable; auto-detected when `None`.
    pub chrome_path: Option<PathBuf>,
    pub user_agent: Option<String>,
    /// How long the browser may sit without DevTools traffic before it is
    /// torn down.
    pub idle_timeout: Duration,
}

impl Default for ChromeOptions {
    fn default() -> Self {
        Self {
            headless: true,
            chrome_path: None,
            user_agent: None,
            idle_timeout: Duration::from_secs(600),
        }
    }
}

/// Shared handle to one Chrome process. Cheap to clone.
#[derive(Clone)]
pub struct ChromeBrowser {
    browser: headless_chrome::Browser,
}

impl ChromeBrowser {
    /// Launches a Chrome process.
    ///
    /// # Errors
    ///
    /// Returns [`PageError::Driver`] if the options are invalid or Chrome
    /// cannot be started.
    pub async fn launch(options: ChromeOptions) -> Result<Self, PageError> {
        info!(
            headless = options.headless,
            path = ?options.chrome_path,
            "launching browser"
        );
        let browser = tokio::task::spawn_blocking(move || {
            let user_agent_arg = options
                .user_agent
                .as_ref()
                .map(|ua| format!("--user-agent={ua}"));
            let mut launch = LaunchOptions::default_builder()
                .headless(options.headless)
                .path(options.chrome_path.clone())
                .idle_browser_timeout(options.idle_timeout)
                .build()
                .map_err(|e| PageError::Driver(format!("invalid launch options: {e}")))?;
            if let Some(arg) = user_agent_arg.as_deref() {
                launch.args.push(OsStr::new(arg));
            }
            headless_chrome::Browser::new(launch)
                .map_err(|e| PageError::Driver(format!("failed to launch browser: {e}")))
        })
        .await
        .map_err(join_error)??;

        Ok(Self { browser })
    }
}

#[async_trait]
impl Browser for ChromeBrowser {
    async fn new_page(&self) -> Result<Box<dyn PageDriver>, PageError> {
        let browser = self.browser.clone();
        let responses = Arc::new(ResponseLog::default());
        let handler_log = Arc::clone(&responses);

        let tab = tokio::task::spawn_blocking(move || -> Result<Arc<Tab>, PageError> {
            let tab = browser.new_tab().map_err(driver_error)?;
            tab.register_response_handling(
                RESPONSE_HANDLER,
                Box::new(
                    move |params: ResponseReceivedEventParams,
                          fetch_body: &dyn Fn() -> anyhow::Result<GetResponseBodyReturnObject>| {
                        if !params.response.mime_type.contains("json") {
                            return;
                        }
                        match fetch_body() {
                            Ok(body) => handler_log.record(params.response.url, body.body),
                            Err(e) => debug!(
                                url = %params.response.url,
                                error = %e,
                                "could not read response body"
                            ),
                        }
                    },
                ),
            )
            .map_err(driver_error)?;
            Ok(tab)
        })
        .await
        .map_err(join_error)??;

        Ok(Box::new(ChromePage { tab, responses }))
    }
}

struct ChromePage {
    tab: Arc<Tab>,
    responses: Arc<ResponseLog>,
}

impl ChromePage {
    async fn with_tab<T, F>(&self, f: F) -> Result<T, PageError>
    where
        T: Send + 'static,
        F: FnOnce(&Tab) -> Result<T, PageError> + Send + 'static,
    {
        let tab = Arc::clone(&self.tab);
        tokio::task::spawn_blocking(move || f(&tab))
            .await
            .map_err(join_error)?
    }
}

#[async_trait]
impl PageDriver for ChromePage {
    async fn navigate(&self, url: &str) -> Result<(), PageError> {
        debug!(url, "navigating");
        let url = url.to_owned();
        self.with_tab(move |tab| {
            tab.navigate_to(&url).map_err(driver_error)?;
            tab.wait_until_navigated().map_err(driver_error)?;
            Ok(())
        })
        .await
    }

    async fn wait_for_selector(&self, selector: &str, opts: WaitOptions) -> Result<(), PageError> {
        let target = js_string(selector);
        let script = if opts.visible {
            format!(
                "(() => {{ const el = document.querySelector({target}); \
                 if (!el) return false; \
                 const style = window.getComputedStyle(el); \
                 return style.display !== 'none' && style.visibility !== 'hidden' \
                 && el.getClientRects().length > 0; }})()"
            )
        } else {
            format!("document.querySelector({target}) !== null")
        };

        let deadline = Instant::now() + opts.timeout;
        loop {
            if self.evaluate(&script).await?.as_bool() == Some(true) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(PageError::timeout(selector, opts.timeout));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn click(&self, selector: &str) -> Result<(), PageError> {
        let selector = selector.to_owned();
        self.with_tab(move |tab| {
            let element = tab
                .find_element(&selector)
                .map_err(|_| PageError::ElementNotFound {
                    selector: selector.clone(),
                })?;
            element.click().map_err(driver_error)?;
            Ok(())
        })
        .await
    }

    async fn click_all(&self, selector: &str) -> Result<usize, PageError> {
        let selector = selector.to_owned();
        self.with_tab(move |tab| {
            let elements = tab
                .find_elements(&selector)
                .map_err(|_| PageError::ElementNotFound {
                    selector: selector.clone(),
                })?;
            for element in &elements {
                element.click().map_err(driver_error)?;
            }
            Ok(elements.len())
        })
        .await
    }

    async fn evaluate_text(&self, selector: &str) -> Result<Option<String>, PageError> {
        let script = format!(
            "document.querySelector({})?.textContent ?? null",
            js_string(selector)
        );
        Ok(self
            .evaluate(&script)
            .await?
            .as_str()
            .map(ToOwned::to_owned))
    }

    async fn evaluate(&self, script: &str) -> Result<serde_json::Value, PageError> {
        let script = script.to_owned();
        self.with_tab(move |tab| {
            let remote = tab.evaluate(&script, true).map_err(driver_error)?;
            Ok(remote.value.unwrap_or(serde_json::Value::Null))
        })
        .await
    }

    async fn content(&self) -> Result<String, PageError> {
        self.with_tab(|tab| tab.get_content().map_err(driver_error))
            .await
    }

    async fn cookies(&self) -> Result<Vec<Cookie>, PageError> {
        self.with_tab(|tab| {
            let cookies = tab.get_cookies().map_err(driver_error)?;
            Ok(cookies
                .into_iter()
                .map(|c| Cookie::new(c.name, c.value))
                .collect())
        })
        .await
    }

    async fn wait_for_response(
        &self,
        url_fragment: &str,
        timeout: Duration,
    ) -> Result<String, PageError> {
        self.responses.wait_for(url_fragment, timeout).await
    }

    async fn url(&self) -> Result<String, PageError> {
        self.with_tab(|tab| Ok(tab.get_url())).await
    }

    async fn close(&self) -> Result<(), PageError> {
        self.with_tab(|tab| {
            tab.close(true).map_err(driver_error)?;
            Ok(())
        })
        .await
    }
}

/// Bodies of the JSON responses a tab has received, in arrival order.
#[derive(Default)]
struct ResponseLog {
    entries: Mutex<Vec<(String, String)>>,
    arrived: Notify,
}

impl ResponseLog {
    fn record(&self, url: String, body: String) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push((url, body));
        }
        self.arrived.notify_waiters();
    }

    fn find(&self, url_fragment: &str) -> Option<String> {
        self.entries
            .lock()
            .ok()?
            .iter()
            .find(|(url, _)| url.contains(url_fragment))
            .map(|(_, body)| body.clone())
    }

    async fn wait_for(&self, url_fragment: &str, timeout: Duration) -> Result<String, PageError> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.arrived.notified();
            tokio::pin!(notified);
            // Register before checking so a response recorded in between is not missed.
            notified.as_mut().enable();

            if let Some(body) = self.find(url_fragment) {
                return Ok(body);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(PageError::timeout(
                    format!("response matching {url_fragment}"),
                    timeout,
                ));
            }
        }
    }
}

fn js_string(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "\"\"".to_owned())
}

#[allow(clippy::needless_pass_by_value)]
fn driver_error(err: anyhow::Error) -> PageError {
    PageError::Driver(format!("{err:#}"))
}

fn join_error(err: tokio::task::JoinError) -> PageError {
    PageError::Driver(format!("browser task failed: {err}"))
}
