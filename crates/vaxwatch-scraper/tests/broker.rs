//! Integration tests for the credential broker, the challenge refresher and
//! the per-scope broker pool.
//!
//! The browser is replaced by scripted in-memory pages; no Chrome is started.

mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::{
    artifact, work_item, CountingRefresher, FakeBrowser, FakeSolver, PageScript,
    CHALLENGE_SELECTOR, CONSENT_SELECTOR, SUBMIT_SELECTOR,
};
use vaxwatch_core::{CredentialArtifact, CredentialUsageState};
use vaxwatch_scraper::{
    BrokerPool, ChallengeRefresher, ConsentPolicy, CredentialBroker, CredentialScope,
    CredentialUse, RefreshError, Refresher, ScraperError, SolverError, MAX_USES,
};

fn seeded_state(key: &str, use_count: u32) -> CredentialUsageState {
    CredentialUsageState {
        artifact: Some(artifact(key)),
        use_count,
    }
}

fn network_error() -> ScraperError {
    ScraperError::Scrape("connection reset".to_owned())
}

// ---------------------------------------------------------------------------
// CredentialBroker
// ---------------------------------------------------------------------------

#[tokio::test]
async fn first_use_refreshes_and_counts_one_use() {
    let refresher = CountingRefresher::default();
    let mut broker = CredentialBroker::new("search_client_1", refresher.clone());
    let browser = FakeBrowser::default();

    let seen = broker
        .use_credentials(&browser, CredentialUse::Degrading, |creds| async move {
            Ok::<_, ScraperError>(creds.session_key)
        })
        .await
        .expect("use should succeed");

    assert_eq!(seen, "key-1");
    assert_eq!(refresher.calls(), 1);
    assert_eq!(broker.store().current_use_count(), 1);
}

#[tokio::test]
async fn valid_credential_is_reused_without_refresh() {
    let refresher = CountingRefresher::default();
    let mut broker = CredentialBroker::new("search_client_1", refresher.clone())
        .with_state(seeded_state("cached", 4));
    let browser = FakeBrowser::default();

    let seen = broker
        .use_credentials(&browser, CredentialUse::Degrading, |creds| async move {
            Ok::<_, ScraperError>(creds.session_key)
        })
        .await
        .expect("use should succeed");

    assert_eq!(seen, "cached");
    assert_eq!(refresher.calls(), 0);
    assert_eq!(broker.store().current_use_count(), 5);
}

#[tokio::test]
async fn failed_work_refreshes_once_and_retries_once() {
    let refresher = CountingRefresher::default();
    let mut broker = CredentialBroker::new("search_client_1", refresher.clone())
        .with_state(seeded_state("stale", 2));
    let browser = FakeBrowser::default();
    let calls = AtomicUsize::new(0);

    let seen = broker
        .use_credentials(&browser, CredentialUse::Degrading, |creds: CredentialArtifact| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(network_error())
                } else {
                    Ok(creds.session_key)
                }
            }
        })
        .await
        .expect("retry should succeed");

    assert_eq!(seen, "key-1");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(refresher.calls(), 1);
    // The fresh credential absorbed exactly the retried use.
    assert_eq!(broker.store().current_use_count(), 1);
}

#[tokio::test]
async fn second_failure_is_returned_without_another_retry() {
    let refresher = CountingRefresher::default();
    let mut broker = CredentialBroker::new("search_client_1", refresher.clone())
        .with_state(seeded_state("stale", 0));
    let browser = FakeBrowser::default();
    let calls = AtomicUsize::new(0);

    let err = broker
        .use_credentials(&browser, CredentialUse::Degrading, |_creds| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(network_error()) }
        })
        .await
        .expect_err("both attempts fail");

    assert!(matches!(err, ScraperError::Scrape(_)), "got {err:?}");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(refresher.calls(), 1);
}

#[tokio::test]
async fn refresh_failure_is_credential_unavailable_and_work_never_runs() {
    let refresher = CountingRefresher::failing();
    let mut broker = CredentialBroker::new("registered_1", refresher.clone());
    let browser = FakeBrowser::default();
    let calls = AtomicUsize::new(0);

    let err = broker
        .use_credentials(&browser, CredentialUse::Degrading, |_creds| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, ScraperError>(()) }
        })
        .await
        .expect_err("refresh fails");

    match err {
        ScraperError::CredentialUnavailable { scope, source } => {
            assert_eq!(scope, "registered_1");
            assert!(matches!(source, RefreshError::ChallengeSolver(_)));
        }
        other => panic!("expected CredentialUnavailable, got {other:?}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(refresher.calls(), 1);
}

#[tokio::test]
async fn spent_budget_forces_refresh_before_work() {
    let refresher = CountingRefresher::default();
    let mut broker = CredentialBroker::new("search_client_1", refresher.clone())
        .with_state(seeded_state("worn", MAX_USES));
    let browser = FakeBrowser::default();

    let seen = broker
        .use_credentials(&browser, CredentialUse::Degrading, |creds| async move {
            Ok::<_, ScraperError>(creds.session_key)
        })
        .await
        .expect("use should succeed");

    assert_eq!(seen, "key-1");
    assert_eq!(refresher.calls(), 1);
    assert_eq!(broker.store().current_use_count(), 1);
}

#[tokio::test]
async fn non_degrading_use_leaves_count_unchanged() {
    let refresher = CountingRefresher::default();
    let mut broker = CredentialBroker::new("search_client_1", refresher.clone())
        .with_state(seeded_state("cached", 7));
    let browser = FakeBrowser::default();

    broker
        .use_credentials(&browser, CredentialUse::NonDegrading, |_creds| async {
            Ok::<_, ScraperError>(())
        })
        .await
        .expect("use should succeed");

    assert_eq!(broker.store().current_use_count(), 7);
    assert_eq!(broker.snapshot().use_count, 7);
}

#[tokio::test]
async fn budget_runs_out_after_max_uses() {
    let refresher = CountingRefresher::default();
    let mut broker = CredentialBroker::new("search_client_1", refresher.clone());
    let browser = FakeBrowser::default();

    for _ in 0..=MAX_USES {
        broker
            .use_credentials(&browser, CredentialUse::Degrading, |_creds| async {
                Ok::<_, ScraperError>(())
            })
            .await
            .expect("use should succeed");
    }

    // One refresh to start, one more once the first credential is spent.
    assert_eq!(refresher.calls(), 2);
    assert_eq!(broker.refresh_count(), 2);
    assert_eq!(broker.store().current_use_count(), 1);
}

// ---------------------------------------------------------------------------
// ChallengeRefresher
// ---------------------------------------------------------------------------

fn refresher(consent: ConsentPolicy, solver: Arc<FakeSolver>) -> ChallengeRefresher {
    ChallengeRefresher::new("https://portal.test/vcl/1600115131031", consent, solver)
}

#[tokio::test]
async fn refresh_without_challenge_keeps_allowed_cookies() {
    let browser = FakeBrowser::new(PageScript::default());
    let solver = Arc::new(FakeSolver::default());

    let creds = refresher(ConsentPolicy::Required, Arc::clone(&solver))
        .refresh(&browser)
        .await
        .expect("refresh should succeed");

    assert_eq!(creds.session_key, "csrf-1");
    let names: Vec<_> = creds.auxiliary_tokens.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["JSESSIONID", "AWSALB"]);
    assert_eq!(solver.calls(), 0);

    let log = browser.page_log(0);
    let log = log.lock().unwrap();
    assert_eq!(log.navigated, vec!["https://portal.test/vcl/1600115131031"]);
    assert!(log.clicked.iter().any(|s| s == CONSENT_SELECTOR));
    assert!(log.closed);
}

#[tokio::test(start_paused = true)]
async fn challenge_is_solved_and_form_resubmitted() {
    let browser = FakeBrowser::new(PageScript {
        challenge_present: true,
        ..PageScript::default()
    });
    let solver = Arc::new(FakeSolver::default());

    let creds = refresher(ConsentPolicy::Required, Arc::clone(&solver))
        .refresh(&browser)
        .await
        .expect("refresh should succeed");

    assert_eq!(creds.session_key, "csrf-1");
    assert_eq!(solver.calls(), 1);
    let log = browser.page_log(0);
    let submits = log
        .lock()
        .unwrap()
        .clicked
        .iter()
        .filter(|s| *s == SUBMIT_SELECTOR)
        .count();
    assert_eq!(submits, 2);
}

#[tokio::test]
async fn solver_failure_surfaces_and_page_is_closed() {
    let browser = FakeBrowser::new(PageScript {
        challenge_present: true,
        ..PageScript::default()
    });
    let solver = Arc::new(FakeSolver::failing());

    let err = refresher(ConsentPolicy::Required, Arc::clone(&solver))
        .refresh(&browser)
        .await
        .expect_err("solver fails");

    assert!(
        matches!(err, RefreshError::ChallengeSolver(SolverError::Service(_))),
        "got {err:?}"
    );
    assert_eq!(browser.pages_opened(), 1);
    assert_eq!(browser.pages_closed(), 1);
}

#[tokio::test(start_paused = true)]
async fn missing_consent_step_fails_when_required() {
    let browser = FakeBrowser::new(PageScript {
        consent_present: false,
        ..PageScript::default()
    });

    let err = refresher(ConsentPolicy::Required, Arc::new(FakeSolver::default()))
        .refresh(&browser)
        .await
        .expect_err("consent is required");

    match err {
        RefreshError::VerificationStepMissing { selector } => {
            assert_eq!(selector, CONSENT_SELECTOR);
        }
        other => panic!("expected VerificationStepMissing, got {other:?}"),
    }
    assert_eq!(browser.pages_closed(), 1);
}

#[tokio::test(start_paused = true)]
async fn missing_consent_step_is_skipped_when_ignorable() {
    let browser = FakeBrowser::new(PageScript {
        consent_present: false,
        ..PageScript::default()
    });

    let creds = refresher(ConsentPolicy::Ignorable, Arc::new(FakeSolver::default()))
        .refresh(&browser)
        .await
        .expect("refresh should succeed");

    assert_eq!(creds.session_key, "csrf-1");
    let log = browser.page_log(0);
    assert!(!log.lock().unwrap().clicked.iter().any(|s| s == CONSENT_SELECTOR));
}

#[tokio::test]
async fn login_response_without_session_key_is_extraction_error() {
    let browser = FakeBrowser::new(PageScript {
        login_body: Some(r#"{"status":"ok"}"#.to_owned()),
        ..PageScript::default()
    });

    let err = refresher(ConsentPolicy::Required, Arc::new(FakeSolver::default()))
        .refresh(&browser)
        .await
        .expect_err("no csrfKey");

    assert!(matches!(err, RefreshError::CredentialExtraction { .. }), "got {err:?}");
}

#[tokio::test(start_paused = true)]
async fn login_response_that_never_arrives_times_out() {
    let browser = FakeBrowser::new(PageScript {
        login_body: None,
        ..PageScript::default()
    });

    let err = refresher(ConsentPolicy::Required, Arc::new(FakeSolver::default()))
        .refresh(&browser)
        .await
        .expect_err("login never completes");

    assert!(
        matches!(err, RefreshError::Page(vaxwatch_scraper::PageError::Timeout { .. })),
        "got {err:?}"
    );
    assert_eq!(browser.pages_closed(), 1);
}

#[tokio::test]
async fn challenge_selector_is_only_waited_on_not_clicked() {
    let browser = FakeBrowser::new(PageScript::default());

    refresher(ConsentPolicy::Required, Arc::new(FakeSolver::default()))
        .refresh(&browser)
        .await
        .expect("refresh should succeed");

    let log = browser.page_log(0);
    assert!(!log.lock().unwrap().clicked.iter().any(|s| s == CHALLENGE_SELECTOR));
}

// ---------------------------------------------------------------------------
// BrokerPool
// ---------------------------------------------------------------------------

fn pool(scope: CredentialScope, browser: Arc<FakeBrowser>) -> BrokerPool {
    BrokerPool::new(
        scope,
        "https://portal.test",
        Arc::new(FakeSolver::default()),
        browser,
    )
}

#[tokio::test]
async fn search_client_pool_shares_one_refresh_across_items() {
    let browser = Arc::new(FakeBrowser::new(PageScript::default()));
    let mut pool = pool(CredentialScope::seattle(), Arc::clone(&browser));
    let a = work_item("safeway_1", "https://portal.test/vcl/1610137564207?clientId=1");
    let b = work_item("safeway_2", "https://portal.test/vcl/1610137564207?clientId=2");

    for item in [&a, &b] {
        pool.use_credentials(item, CredentialUse::Degrading, |_creds| async {
            Ok::<_, ScraperError>(())
        })
        .await
        .expect("use should succeed");
    }

    assert_eq!(pool.refresh_count(), 1);
    assert_eq!(browser.pages_opened(), 1);
    let log = browser.page_log(0);
    assert_eq!(
        log.lock().unwrap().navigated,
        vec!["https://portal.test/vcl/1600115131031"]
    );

    let snapshot = pool.snapshot();
    let state = &snapshot["search_client_1610137564207"];
    assert_eq!(state.use_count, 2);
}

#[tokio::test]
async fn registered_company_pool_refreshes_per_item_at_its_locator() {
    let browser = Arc::new(FakeBrowser::new(PageScript::default()));
    let mut pool = pool(CredentialScope::RegisteredCompany, Arc::clone(&browser));
    let a = work_item("acme_1", "https://portal.test/vcl/111?clientId=9");
    let b = work_item("acme_2", "https://portal.test/vcl/222?clientId=9");

    for item in [&a, &b] {
        pool.use_credentials(item, CredentialUse::Degrading, |_creds| async {
            Ok::<_, ScraperError>(())
        })
        .await
        .expect("use should succeed");
    }

    assert_eq!(pool.refresh_count(), 2);
    assert_eq!(
        browser.page_log(1).lock().unwrap().navigated,
        vec!["https://portal.test/vcl/222?clientId=9"]
    );
    assert_eq!(pool.snapshot().len(), 2);
}

#[tokio::test]
async fn cached_states_seed_brokers_and_survive_in_snapshot() {
    let browser = Arc::new(FakeBrowser::new(PageScript::default()));
    let cached = HashMap::from([
        ("acme_1".to_owned(), seeded_state("cached-1", 3)),
        ("acme_untouched".to_owned(), seeded_state("cached-2", 9)),
    ]);
    let mut pool =
        pool(CredentialScope::RegisteredCompany, Arc::clone(&browser)).with_cached_states(cached);
    let item = work_item("acme_1", "https://portal.test/vcl/111?clientId=9");

    let seen = pool
        .use_credentials(&item, CredentialUse::Degrading, |creds| async move {
            Ok::<_, ScraperError>(creds.session_key)
        })
        .await
        .expect("use should succeed");

    assert_eq!(seen, "cached-1");
    assert_eq!(browser.pages_opened(), 0);
    let snapshot = pool.snapshot();
    assert_eq!(snapshot["acme_1"].use_count, 4);
    assert_eq!(snapshot["acme_untouched"].use_count, 9);
}
