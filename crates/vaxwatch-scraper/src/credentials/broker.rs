use std::future::Future;

use tracing::{debug, warn};
use vaxwatch_core::{CredentialArtifact, CredentialUsageState};

use super::refresher::Refresher;
use super::store::CredentialStore;
use crate::error::ScraperError;
use crate::page::Browser;

/// Whether a call counts against the credential's reuse budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CredentialUse {
    #[default]
    Degrading,
    NonDegrading,
}

/// Hands out one scope's credential to units of work.
///
/// Methods take `&mut self`; the owning task is the only caller, so two
/// refreshes for the same scope can never overlap.
pub struct CredentialBroker {
    scope: String,
    store: CredentialStore,
    refresher: Box<dyn Refresher>,
    refreshes: u64,
}

impl CredentialBroker {
    pub fn new(scope: impl Into<String>, refresher: impl Refresher + 'static) -> Self {
        Self {
            scope: scope.into(),
            store: CredentialStore::new(),
            refresher: Box::new(refresher),
            refreshes: 0,
        }
    }

    /// Starts from a state saved by an earlier run.
    #[must_use]
    pub fn with_state(mut self, state: CredentialUsageState) -> Self {
        self.store = CredentialStore::from_state(state);
        self
    }

    #[must_use]
    pub fn scope(&self) -> &str {
        &self.scope
    }

    #[must_use]
    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    /// Refreshes performed by this broker since it was created.
    #[must_use]
    pub fn refresh_count(&self) -> u64 {
        self.refreshes
    }

    #[must_use]
    pub fn snapshot(&self) -> CredentialUsageState {
        self.store.snapshot()
    }

    /// Runs `work` with the current credential.
    ///
    /// Refreshes first when there is no credential or its budget is spent. If
    /// `work` fails the credential is assumed stale: it is refreshed once and
    /// `work` runs one more time, whose result is final.
    ///
    /// # Errors
    ///
    /// - [`ScraperError::CredentialUnavailable`] if a refresh fails.
    /// - Whatever the second `work` invocation returns.
    pub async fn use_credentials<T, F, Fut>(
        &mut self,
        browser: &dyn Browser,
        usage: CredentialUse,
        mut work: F,
    ) -> Result<T, ScraperError>
    where
        F: FnMut(CredentialArtifact) -> Fut,
        Fut: Future<Output = Result<T, ScraperError>>,
    {
        let artifact = match self.store.get().cloned() {
            Some(artifact) if !self.store.needs_refresh() => artifact,
            _ => self.refresh(browser).await?,
        };

        let value = match work(artifact).await {
            Ok(value) => value,
            Err(err) => {
                warn!(
                    scope = %self.scope,
                    error = %err,
                    "request failed with current credentials, refreshing"
                );
                let fresh = self.refresh(browser).await?;
                work(fresh).await?
            }
        };

        self.store.record_use(usage == CredentialUse::Degrading);
        debug!(
            scope = %self.scope,
            use_count = self.store.current_use_count(),
            "credential used"
        );
        Ok(value)
    }

    async fn refresh(&mut self, browser: &dyn Browser) -> Result<CredentialArtifact, ScraperError> {
        self.refreshes += 1;
        match self.refresher.refresh(browser).await {
            Ok(artifact) => {
                self.store.set(artifact.clone());
                Ok(artifact)
            }
            Err(source) => Err(ScraperError::CredentialUnavailable {
                scope: self.scope.clone(),
                source,
            }),
        }
    }
}
