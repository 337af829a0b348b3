//! Availability scraping core: credential lifecycle, upstream throttling and
//! the per-run work loop, plus the site families built on top of them.

pub mod credentials;
pub mod error;
pub mod freshness;
pub mod page;
pub mod rate_limit;
pub mod runner;
pub mod sites;
pub mod solver;
pub mod throttle;

pub use credentials::{
    BrokerPool, ChallengeRefresher, ConsentPolicy, CredentialBroker, CredentialScope,
    CredentialStore, CredentialUse, Refresher, MAX_USES,
};
pub use error::{PageError, RefreshError, ScraperError, SolverError};
pub use freshness::LastStatusLookup;
pub use page::{Browser, Cookie, PageDriver, WaitOptions};
pub use runner::{ItemOutcome, RunSummary, RunnerOptions, WorkUnitRunner};
pub use sites::{AvailabilityCheck, ProbeOutcome, SiteKind};
pub use solver::{ChallengeSolver, DisabledSolver, TokenServiceSolver};
pub use throttle::ThrottleController;
