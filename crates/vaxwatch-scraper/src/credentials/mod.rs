//! Credential lifecycle for the pharmacy portal.
//!
//! A [`CredentialStore`] holds the artifact, a [`ChallengeRefresher`] mints a
//! new one through the browser, and a [`CredentialBroker`] decides when to
//! refresh. [`BrokerPool`] maps work items onto brokers per scope.

pub mod broker;
pub mod refresher;
pub mod scopes;
pub mod store;

pub use broker::{CredentialBroker, CredentialUse};
pub use refresher::{ChallengeRefresher, ConsentPolicy, Refresher, ALLOWED_COOKIES};
pub use scopes::{BrokerPool, CredentialScope};
pub use store::{CredentialStore, MAX_USES};
