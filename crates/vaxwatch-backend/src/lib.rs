//! Client for the vaxwatch reporting backend.
//!
//! The backend is a fixed external service with four surfaces: the internal
//! site inventory, the public per-site status feed, the result reporting
//! endpoint, and a small key/value store used to carry portal credentials from
//! one run to the next. Every request carries the shared secret.

pub mod client;
pub mod error;
pub mod status_cache;
pub mod types;

mod credential_cache;
mod retry;

pub use client::{clinics_by_url_keyword, BackendClient, BackendEndpoints};
pub use error::BackendError;
pub use status_cache::StatusCache;
pub use types::{ClinicRecord, ClinicStatus};
