//! Credential scopes and the per-pipeline pool of brokers.
//!
//! Locations booked through a regional search client share one credential.
//! Locations of a registered company each need their own, and those are
//! expensive enough to be carried between runs through the credential cache.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use vaxwatch_core::{CredentialArtifact, CredentialUsageState, WorkItem};

use super::broker::{CredentialBroker, CredentialUse};
use super::refresher::{ChallengeRefresher, ConsentPolicy};
use crate::error::ScraperError;
use crate::page::Browser;
use crate::solver::ChallengeSolver;

pub const SEATTLE_SEARCH_CLIENT_ID: &str = "1610137564207";
pub const PORTLAND_SEARCH_CLIENT_ID: &str = "1610137270791";
/// Location whose page issues Seattle search-client credentials.
pub const SEATTLE_REFRESH_ID: &str = "1600115131031";
/// Location whose page issues Portland search-client credentials.
pub const PORTLAND_REFRESH_ID: &str = "1600113329481";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialScope {
    /// Every location of one regional search client; one shared credential.
    SearchClient {
        search_client_id: String,
        refresh_id: String,
    },
    /// Locations outside the regional search clients; one credential each.
    RegisteredCompany,
}

impl CredentialScope {
    #[must_use]
    pub fn seattle() -> Self {
        Self::SearchClient {
            search_client_id: SEATTLE_SEARCH_CLIENT_ID.to_owned(),
            refresh_id: SEATTLE_REFRESH_ID.to_owned(),
        }
    }

    #[must_use]
    pub fn portland() -> Self {
        Self::SearchClient {
            search_client_id: PORTLAND_SEARCH_CLIENT_ID.to_owned(),
            refresh_id: PORTLAND_REFRESH_ID.to_owned(),
        }
    }

    #[must_use]
    pub fn name(&self) -> String {
        match self {
            Self::SearchClient {
                search_client_id, ..
            } => format!("search_client_{search_client_id}"),
            Self::RegisteredCompany => "registered_company".to_owned(),
        }
    }

    /// Whether locations of `search_client_id` belong to this scope.
    #[must_use]
    pub fn covers(&self, search_client_id: &str) -> bool {
        match self {
            Self::SearchClient {
                search_client_id: own,
                ..
            } => own == search_client_id,
            Self::RegisteredCompany => {
                search_client_id != SEATTLE_SEARCH_CLIENT_ID
                    && search_client_id != PORTLAND_SEARCH_CLIENT_ID
            }
        }
    }

    #[must_use]
    pub fn consent_policy(&self) -> ConsentPolicy {
        match self {
            Self::SearchClient { .. } => ConsentPolicy::Required,
            Self::RegisteredCompany => ConsentPolicy::Ignorable,
        }
    }

    /// Key under which an item's credential is held and cached.
    #[must_use]
    pub fn key_for(&self, item: &WorkItem) -> String {
        match self {
            Self::SearchClient { .. } => self.name(),
            Self::RegisteredCompany => item.key.clone(),
        }
    }

    fn refresh_url(&self, portal_base_url: &str, item: &WorkItem) -> String {
        match self {
            Self::SearchClient { refresh_id, .. } => {
                format!("{}/vcl/{refresh_id}", portal_base_url.trim_end_matches('/'))
            }
            Self::RegisteredCompany => item.locator.clone(),
        }
    }
}

/// Brokers for one scope, created on first use.
pub struct BrokerPool {
    scope: CredentialScope,
    portal_base_url: String,
    solver: Arc<dyn ChallengeSolver>,
    browser: Arc<dyn Browser>,
    brokers: HashMap<String, CredentialBroker>,
    cached: HashMap<String, CredentialUsageState>,
}

impl BrokerPool {
    pub fn new(
        scope: CredentialScope,
        portal_base_url: impl Into<String>,
        solver: Arc<dyn ChallengeSolver>,
        browser: Arc<dyn Browser>,
    ) -> Self {
        Self {
            scope,
            portal_base_url: portal_base_url.into(),
            solver,
            browser,
            brokers: HashMap::new(),
            cached: HashMap::new(),
        }
    }

    /// Seeds brokers from states saved by an earlier run, keyed as
    /// [`CredentialScope::key_for`] produces.
    #[must_use]
    pub fn with_cached_states(mut self, states: HashMap<String, CredentialUsageState>) -> Self {
        self.cached = states;
        self
    }

    #[must_use]
    pub fn scope(&self) -> &CredentialScope {
        &self.scope
    }

    pub fn broker_for(&mut self, item: &WorkItem) -> &mut CredentialBroker {
        let key = self.scope.key_for(item);
        let Self {
            scope,
            portal_base_url,
            solver,
            brokers,
            cached,
            ..
        } = self;
        brokers.entry(key.clone()).or_insert_with(|| {
            let refresher = ChallengeRefresher::new(
                scope.refresh_url(portal_base_url, item),
                scope.consent_policy(),
                Arc::clone(solver),
            );
            let broker = CredentialBroker::new(key.clone(), refresher);
            match cached.remove(&key) {
                Some(state) => broker.with_state(state),
                None => broker,
            }
        })
    }

    /// [`CredentialBroker::use_credentials`] on the broker that owns `item`.
    ///
    /// # Errors
    ///
    /// Propagates the broker's errors.
    pub async fn use_credentials<T, F, Fut>(
        &mut self,
        item: &WorkItem,
        usage: CredentialUse,
        work: F,
    ) -> Result<T, ScraperError>
    where
        F: FnMut(CredentialArtifact) -> Fut,
        Fut: Future<Output = Result<T, ScraperError>>,
    {
        let browser = Arc::clone(&self.browser);
        self.broker_for(item)
            .use_credentials(browser.as_ref(), usage, work)
            .await
    }

    /// Current state of every credential this pool knows about, including
    /// cached ones that were never touched this run.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<String, CredentialUsageState> {
        let mut states = self.cached.clone();
        for (key, broker) in &self.brokers {
            states.insert(key.clone(), broker.snapshot());
        }
        states
    }

    /// Total refreshes performed across all brokers.
    #[must_use]
    pub fn refresh_count(&self) -> u64 {
        self.brokers.values().map(CredentialBroker::refresh_count).sum()
    }
}
