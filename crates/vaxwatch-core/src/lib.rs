//! Shared data model and configuration for vaxwatch.
//!
//! Everything in here is plain data: the work items pulled from the site
//! inventory, the per-item results sent back to the reporting backend, and the
//! credential artifacts that the portal scrapers reuse between requests.

pub mod app_config;
pub mod config;
pub mod types;

use thiserror::Error;

pub use app_config::{AppConfig, Environment};
pub use config::{load_app_config, load_app_config_from_env};
pub use types::{
    AuxiliaryToken, CredentialArtifact, CredentialUsageState, LastStatus, ScrapeStatus,
    VaccineType, WorkItem, WorkResult,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid value for {var}: {reason}")]
    InvalidEnvVar { var: String, reason: String },
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("unknown scrape status: {0}")]
    UnknownStatus(String),
}
