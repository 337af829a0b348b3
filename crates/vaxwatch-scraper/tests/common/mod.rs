//! In-memory stand-ins for the browser, the challenge solver and the
//! credential refresher, shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use vaxwatch_core::{AuxiliaryToken, CredentialArtifact, WorkItem};
use vaxwatch_scraper::error::{PageError, RefreshError, SolverError};
use vaxwatch_scraper::page::{Browser, Cookie, PageDriver, WaitOptions};
use vaxwatch_scraper::{ChallengeSolver, Refresher};

pub const CONSENT_SELECTOR: &str = "#covid_vaccine_search_questions_content input";
pub const SUBMIT_SELECTOR: &str = "#covid_vaccine_search_questions_submit .btn-primary";
pub const CHALLENGE_SELECTOR: &str = "#recaptchaRow";

/// How a fake page behaves during the login flow.
#[derive(Debug, Clone)]
pub struct PageScript {
    pub consent_present: bool,
    /// The login call only goes out after the challenge is solved and the form
    /// is submitted a second time.
    pub challenge_present: bool,
    /// Body of the login response; `None` means it never arrives.
    pub login_body: Option<String>,
    pub cookies: Vec<Cookie>,
    pub site_key: Option<String>,
    pub url: String,
}

impl Default for PageScript {
    fn default() -> Self {
        Self {
            consent_present: true,
            challenge_present: false,
            login_body: Some(r#"{"csrfKey":"csrf-1"}"#.to_owned()),
            cookies: vec![
                Cookie::new("JSESSIONID", "session"),
                Cookie::new("AWSALB", "lb"),
                Cookie::new("_ga", "tracking"),
            ],
            site_key: Some("site-key-1".to_owned()),
            url: "https://portal.test/vcl/1600115131031".to_owned(),
        }
    }
}

#[derive(Debug, Default)]
pub struct PageLog {
    pub navigated: Vec<String>,
    pub clicked: Vec<String>,
    pub evaluated: Vec<String>,
    pub closed: bool,
}

pub struct FakePage {
    script: PageScript,
    submits: watch::Sender<u32>,
    log: Arc<Mutex<PageLog>>,
}

impl FakePage {
    pub fn new(script: PageScript) -> Self {
        let (submits, _) = watch::channel(0);
        Self {
            script,
            submits,
            log: Arc::new(Mutex::new(PageLog::default())),
        }
    }

    pub fn log(&self) -> Arc<Mutex<PageLog>> {
        Arc::clone(&self.log)
    }
}

#[async_trait]
impl PageDriver for FakePage {
    async fn navigate(&self, url: &str) -> Result<(), PageError> {
        self.log.lock().unwrap().navigated.push(url.to_owned());
        Ok(())
    }

    async fn wait_for_selector(&self, selector: &str, opts: WaitOptions) -> Result<(), PageError> {
        let present = match selector {
            CONSENT_SELECTOR => self.script.consent_present,
            CHALLENGE_SELECTOR => self.script.challenge_present,
            _ => true,
        };
        if present {
            Ok(())
        } else {
            tokio::time::sleep(opts.timeout).await;
            Err(PageError::Timeout {
                what: selector.to_owned(),
                timeout_ms: u64::try_from(opts.timeout.as_millis()).unwrap(),
            })
        }
    }

    async fn click(&self, selector: &str) -> Result<(), PageError> {
        self.log.lock().unwrap().clicked.push(selector.to_owned());
        if selector == SUBMIT_SELECTOR {
            self.submits.send_modify(|n| *n += 1);
        }
        Ok(())
    }

    async fn click_all(&self, selector: &str) -> Result<usize, PageError> {
        self.log.lock().unwrap().clicked.push(selector.to_owned());
        Ok(3)
    }

    async fn evaluate_text(&self, _selector: &str) -> Result<Option<String>, PageError> {
        Ok(None)
    }

    async fn evaluate(&self, script: &str) -> Result<serde_json::Value, PageError> {
        self.log.lock().unwrap().evaluated.push(script.to_owned());
        if script.contains("data-sitekey") {
            return Ok(self
                .script
                .site_key
                .clone()
                .map_or(serde_json::Value::Null, serde_json::Value::String));
        }
        Ok(serde_json::Value::Bool(true))
    }

    async fn content(&self) -> Result<String, PageError> {
        Ok("<html></html>".to_owned())
    }

    async fn cookies(&self) -> Result<Vec<Cookie>, PageError> {
        Ok(self.script.cookies.clone())
    }

    async fn wait_for_response(
        &self,
        url_fragment: &str,
        timeout: Duration,
    ) -> Result<String, PageError> {
        let needed = match (&self.script.login_body, self.script.challenge_present) {
            (None, _) => u32::MAX,
            (Some(_), false) => 1,
            (Some(_), true) => 2,
        };
        let mut submits = self.submits.subscribe();
        let waited = tokio::time::timeout(timeout, submits.wait_for(|n| *n >= needed)).await;
        let result = match (waited, &self.script.login_body) {
            (Ok(Ok(_)), Some(body)) => Ok(body.clone()),
            _ => Err(PageError::Timeout {
                what: url_fragment.to_owned(),
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap(),
            }),
        };
        result
    }

    async fn url(&self) -> Result<String, PageError> {
        Ok(self.script.url.clone())
    }

    async fn close(&self) -> Result<(), PageError> {
        self.log.lock().unwrap().closed = true;
        Ok(())
    }
}

/// Opens [`FakePage`]s following the current script and remembers them.
#[derive(Default)]
pub struct FakeBrowser {
    script: Mutex<PageScript>,
    pages: Mutex<Vec<Arc<Mutex<PageLog>>>>,
}

impl FakeBrowser {
    pub fn new(script: PageScript) -> Self {
        Self {
            script: Mutex::new(script),
            pages: Mutex::new(Vec::new()),
        }
    }

    pub fn set_script(&self, script: PageScript) {
        *self.script.lock().unwrap() = script;
    }

    pub fn pages_opened(&self) -> usize {
        self.pages.lock().unwrap().len()
    }

    pub fn pages_closed(&self) -> usize {
        self.pages
            .lock()
            .unwrap()
            .iter()
            .filter(|log| log.lock().unwrap().closed)
            .count()
    }

    pub fn page_log(&self, index: usize) -> Arc<Mutex<PageLog>> {
        Arc::clone(&self.pages.lock().unwrap()[index])
    }
}

#[async_trait]
impl Browser for FakeBrowser {
    async fn new_page(&self) -> Result<Box<dyn PageDriver>, PageError> {
        let page = FakePage::new(self.script.lock().unwrap().clone());
        self.pages.lock().unwrap().push(page.log());
        Ok(Box::new(page))
    }
}

#[derive(Default)]
pub struct FakeSolver {
    pub fail: bool,
    pub calls: AtomicUsize,
}

impl FakeSolver {
    pub fn failing() -> Self {
        Self {
            fail: true,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChallengeSolver for FakeSolver {
    async fn solve(&self, _page: &dyn PageDriver) -> Result<(), SolverError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            Err(SolverError::Service("ERROR_ZERO_BALANCE".to_owned()))
        } else {
            Ok(())
        }
    }
}

/// Hands out numbered artifacts, or fails, and counts calls.
#[derive(Clone, Default)]
pub struct CountingRefresher {
    pub calls: Arc<AtomicUsize>,
    pub fail: bool,
}

impl CountingRefresher {
    pub fn failing() -> Self {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
            fail: true,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Refresher for CountingRefresher {
    async fn refresh(&self, _browser: &dyn Browser) -> Result<CredentialArtifact, RefreshError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail {
            return Err(RefreshError::ChallengeSolver(SolverError::Service(
                "ERROR_CAPTCHA_UNSOLVABLE".to_owned(),
            )));
        }
        Ok(artifact(&format!("key-{n}")))
    }
}

pub fn artifact(session_key: &str) -> CredentialArtifact {
    CredentialArtifact {
        session_key: session_key.to_owned(),
        auxiliary_tokens: vec![AuxiliaryToken {
            name: "JSESSIONID".to_owned(),
            value: format!("session-{session_key}"),
        }],
    }
}

pub fn work_item(key: &str, locator: &str) -> WorkItem {
    WorkItem {
        id: format!("rec_{key}"),
        key: key.to_owned(),
        human_name: key.to_owned(),
        locator: locator.to_owned(),
        address: None,
        external_system_id: None,
    }
}
