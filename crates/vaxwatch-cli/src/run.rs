//! `run` command handler.
//!
//! Work items are loaded once from the inventory and split into pipelines:
//! one for the slot API, or one per portal credential scope. Pipelines run
//! concurrently, each with its own runner, throttle and brokers, and report
//! their own results. Registered-company credentials are written back to the
//! cache after every round.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::ValueEnum;
use futures::future::join_all;
use vaxwatch_backend::{BackendClient, BackendEndpoints, StatusCache};
use vaxwatch_core::{AppConfig, CredentialUsageState, ScrapeStatus, WorkItem};
use vaxwatch_scraper::page::{ChromeBrowser, ChromeOptions};
use vaxwatch_scraper::sites::{build_site, portal, slot_api, SiteSettings};
use vaxwatch_scraper::{
    Browser, BrokerPool, ChallengeSolver, CredentialScope, DisabledSolver, RunSummary,
    RunnerOptions, SiteKind, TokenServiceSolver, WorkUnitRunner,
};

use crate::report::report_outcomes;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum SiteArg {
    Portal,
    SlotApi,
}

impl From<SiteArg> for SiteKind {
    fn from(arg: SiteArg) -> Self {
        match arg {
            SiteArg::Portal => SiteKind::Portal,
            SiteArg::SlotApi => SiteKind::SlotApi,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum ScopeArg {
    Seattle,
    Portland,
    Registered,
    /// Every scope, each as its own pipeline
    All,
}

impl ScopeArg {
    pub(crate) fn scopes(self) -> Vec<CredentialScope> {
        match self {
            Self::Seattle => vec![CredentialScope::seattle()],
            Self::Portland => vec![CredentialScope::portland()],
            Self::Registered => vec![CredentialScope::RegisteredCompany],
            Self::All => vec![
                CredentialScope::seattle(),
                CredentialScope::portland(),
                CredentialScope::RegisteredCompany,
            ],
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct RunArgs {
    pub site: SiteKind,
    pub scope: ScopeArg,
    pub segment: u32,
    pub segments: u32,
    pub dry_run: bool,
    /// Seconds between rounds; `None` runs a single round.
    pub interval: Option<Duration>,
}

/// One independent unit of a run.
#[derive(Debug)]
pub(crate) struct Pipeline {
    pub name: String,
    /// `None` for sites that need no credentials.
    pub scope: Option<CredentialScope>,
    pub items: Vec<WorkItem>,
}

/// Splits the inventory selection into the pipelines `args` asks for.
pub(crate) fn plan_pipelines(
    args: &RunArgs,
    items: Vec<WorkItem>,
) -> anyhow::Result<Vec<Pipeline>> {
    match args.site {
        SiteKind::SlotApi => {
            if args.segments > 0 && args.segment >= args.segments {
                anyhow::bail!(
                    "segment {} is out of range for {} segments",
                    args.segment,
                    args.segments
                );
            }
            Ok(vec![Pipeline {
                name: SiteKind::SlotApi.to_string(),
                scope: None,
                items: slot_api::select_segment(items, args.segment, args.segments),
            }])
        }
        SiteKind::Portal => Ok(args
            .scope
            .scopes()
            .into_iter()
            .map(|scope| Pipeline {
                name: scope.name(),
                items: portal::select_items(items.clone(), &scope),
                scope: Some(scope),
            })
            .collect()),
    }
}

/// Execute the `run` command end to end.
///
/// Without `--interval` this is a single round. With it the pipelines stay
/// alive between rounds, so a cooldown started in one round is honored by
/// the next, until the process is told to stop.
///
/// # Errors
///
/// Returns an error if the inventory cannot be loaded, the segment arguments
/// are invalid, or the browser or solver for a portal run cannot be set up.
/// Per-item and reporting failures are logged, not propagated.
pub(crate) async fn run_command(config: &AppConfig, args: &RunArgs) -> anyhow::Result<()> {
    let backend = BackendClient::new(
        &config.secret,
        BackendEndpoints::from_app_config(config),
        config.request_timeout_secs,
        &config.user_agent,
    )
    .context("failed to build backend client")?;

    let mut items = backend
        .fetch_work_items(args.site.url_keyword())
        .await
        .context("failed to load work items from inventory")?;
    let mut pipelines = plan_pipelines(args, items.clone())?;

    if args.dry_run {
        for pipeline in &pipelines {
            let keys: Vec<&str> = pipeline.items.iter().map(|i| i.key.as_str()).collect();
            println!(
                "dry-run: {} would check {} locations: [{}]",
                pipeline.name,
                keys.len(),
                keys.join(", ")
            );
        }
        return Ok(());
    }

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.request_timeout_secs))
        .connect_timeout(Duration::from_secs(10))
        .user_agent(&config.user_agent)
        .build()
        .context("failed to build HTTP client")?;
    let settings = SiteSettings {
        client,
        availability_feed_url: config.availability_feed_url.clone(),
        portal_base_url: config.portal_base_url.clone(),
        slot_api_base_url: config.slot_api_base_url.clone(),
    };

    let credentials = if args.site.needs_credentials() {
        Some(CredentialContext::start(config, &backend, &pipelines).await?)
    } else {
        None
    };

    let options = RunnerOptions {
        freshness_window: Duration::from_secs(config.freshness_window_secs),
        ..RunnerOptions::default()
    };
    let reporting = config.reporting_enabled();
    if !reporting {
        tracing::warn!(env = %config.env, "reporting disabled outside production");
    }

    let make_runner = |pipeline: &Pipeline| {
        let runner = WorkUnitRunner::new(build_site(args.site, &settings))
            .with_freshness(Box::new(StatusCache::new(backend.clone())))
            .with_options(options.clone());
        match (&credentials, &pipeline.scope) {
            (Some(ctx), Some(scope)) => runner.with_credentials(ctx.pool(scope.clone())),
            _ => runner,
        }
    };

    let mut worker = Worker::default();
    loop {
        worker.run_round(pipelines, &backend, reporting, &make_runner).await;
        worker.save_credentials(&backend).await;

        let Some(interval) = args.interval else {
            break;
        };
        tracing::info!(next_round_secs = interval.as_secs(), "waiting for next round");
        tokio::select! {
            () = tokio::time::sleep(interval) => {}
            () = shutdown_signal() => break,
        }

        match backend.fetch_work_items(args.site.url_keyword()).await {
            Ok(fresh) => items = fresh,
            Err(e) => {
                tracing::error!(error = %e, "failed to reload work items, reusing last inventory");
            }
        }
        pipelines = plan_pipelines(args, items.clone())?;
    }

    Ok(())
}

/// Pipeline runners kept alive across rounds, keyed by pipeline name.
///
/// Each runner owns its throttle and credential brokers, so keeping the
/// runner keeps the cooldown ladder and the credential budget.
#[derive(Default)]
pub(crate) struct Worker {
    runners: HashMap<String, WorkUnitRunner>,
}

impl Worker {
    /// Runs every pipeline once, concurrently, and reports its results.
    ///
    /// `make_runner` is only called for pipelines this worker has not seen.
    pub(crate) async fn run_round<F>(
        &mut self,
        pipelines: Vec<Pipeline>,
        backend: &BackendClient,
        reporting: bool,
        make_runner: F,
    ) -> Vec<(String, RunSummary)>
    where
        F: Fn(&Pipeline) -> WorkUnitRunner,
    {
        let jobs: Vec<(Pipeline, WorkUnitRunner)> = pipelines
            .into_iter()
            .map(|pipeline| {
                let runner = self
                    .runners
                    .remove(&pipeline.name)
                    .unwrap_or_else(|| make_runner(&pipeline));
                (pipeline, runner)
            })
            .collect();

        let finished = join_all(jobs.into_iter().map(|(pipeline, mut runner)| async move {
            let name = pipeline.name;
            tracing::info!(pipeline = %name, items = pipeline.items.len(), "starting pipeline");
            let summary = runner.run(pipeline.items).await;
            let totals = report_outcomes(backend, &summary, reporting, &name).await;
            tracing::info!(
                pipeline = %name,
                yes = summary.count_with_status(ScrapeStatus::Yes),
                limited = summary.count_with_status(ScrapeStatus::Limited),
                no = summary.count_with_status(ScrapeStatus::No),
                suppressed = totals.suppressed,
                sent = totals.sent,
                failed = totals.failed,
                "pipeline finished"
            );
            (name, runner, summary)
        }))
        .await;

        finished
            .into_iter()
            .map(|(name, runner, summary)| {
                self.runners.insert(name.clone(), runner);
                (name, summary)
            })
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn runner(&self, name: &str) -> Option<&WorkUnitRunner> {
        self.runners.get(name)
    }

    /// Writes registered-company credential states back to the cache.
    async fn save_credentials(&self, backend: &BackendClient) {
        for runner in self.runners.values() {
            let Some(pool) = runner.credentials() else {
                continue;
            };
            if *pool.scope() == CredentialScope::RegisteredCompany {
                save_credentials(backend, &pool.snapshot()).await;
            }
        }
    }
}

async fn save_credentials(backend: &BackendClient, states: &HashMap<String, CredentialUsageState>) {
    match backend.save_credentials(states).await {
        Ok(true) => tracing::info!(entries = states.len(), "saved registered-company credentials"),
        Ok(false) => tracing::warn!("credential cache did not accept the update"),
        Err(e) => tracing::error!(error = %e, "failed to save registered-company credentials"),
    }
}

/// Resolves on ctrl-c or, on unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("received shutdown signal, stopping after this round");
}

/// Browser, solver and cached credential states shared by the portal
/// pipelines of one run.
struct CredentialContext {
    browser: Arc<dyn Browser>,
    solver: Arc<dyn ChallengeSolver>,
    portal_base_url: String,
    cached: HashMap<String, CredentialUsageState>,
}

impl CredentialContext {
    async fn start(
        config: &AppConfig,
        backend: &BackendClient,
        pipelines: &[Pipeline],
    ) -> anyhow::Result<Self> {
        let solver: Arc<dyn ChallengeSolver> = match &config.captcha_api_key {
            Some(key) => Arc::new(
                TokenServiceSolver::new(key, &config.captcha_api_url)
                    .context("failed to build challenge solver")?,
            ),
            None => {
                tracing::warn!("no challenge-solving key configured, challenges will fail");
                Arc::new(DisabledSolver)
            }
        };

        let browser = ChromeBrowser::launch(ChromeOptions {
            headless: config.headless,
            chrome_path: config.chrome_path.clone(),
            ..ChromeOptions::default()
        })
        .await
        .context("failed to launch browser")?;

        let needs_cache = pipelines
            .iter()
            .any(|p| p.scope == Some(CredentialScope::RegisteredCompany));
        let cached = if needs_cache {
            match backend.load_credentials().await {
                Ok(states) => {
                    tracing::info!(entries = states.len(), "loaded cached credentials");
                    states
                }
                Err(e) => {
                    tracing::warn!(error = %e, "could not load cached credentials, starting empty");
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };

        Ok(Self {
            browser: Arc::new(browser),
            solver,
            portal_base_url: config.portal_base_url.clone(),
            cached,
        })
    }

    fn pool(&self, scope: CredentialScope) -> BrokerPool {
        let registered = scope == CredentialScope::RegisteredCompany;
        let pool = BrokerPool::new(
            scope,
            self.portal_base_url.clone(),
            Arc::clone(&self.solver),
            Arc::clone(&self.browser),
        );
        if registered {
            pool.with_cached_states(self.cached.clone())
        } else {
            pool
        }
    }
}
