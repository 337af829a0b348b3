use crate::app_config::{AppConfig, Environment};
use crate::ConfigError;

const DEFAULT_CREDENTIAL_CACHE_URL: &str = "https://api.covidwa.com/v1";
const DEFAULT_AVAILABILITY_FEED_URL: &str =
    "https://s3-us-west-2.amazonaws.com/mhc.cdn.content/vaccineAvailability.json";
const DEFAULT_PORTAL_BASE_URL: &str = "https://kordinator.mhealthcoach.net";
const DEFAULT_SLOT_API_BASE_URL: &str = "https://www.riteaid.com";
const DEFAULT_CAPTCHA_API_URL: &str = "https://2captcha.com";

/// Load application configuration from environment variables.
///
/// Calls `dotenvy::dotenv().ok()` to load `.env` files before reading env vars.
///
/// # Errors
///
/// Returns `ConfigError` if required env vars are missing or values are invalid.
pub fn load_app_config() -> Result<AppConfig, ConfigError> {
    dotenvy::dotenv().ok();
    load_app_config_from_env()
}

/// Load application configuration from environment variables already in the process.
///
/// Unlike [`load_app_config`], this does NOT load `.env` files.
///
/// # Errors
///
/// Returns `ConfigError` if required env vars are missing or values are invalid.
pub fn load_app_config_from_env() -> Result<AppConfig, ConfigError> {
    build_app_config(|key| std::env::var(key))
}

/// Build application configuration using the provided env-var lookup function.
///
/// Decoupled from the process environment so it can be tested with a plain
/// `HashMap` lookup.
fn build_app_config<F>(lookup: F) -> Result<AppConfig, ConfigError>
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
{
    use std::path::PathBuf;

    let require = |var: &str| -> Result<String, ConfigError> {
        lookup(var).map_err(|_| ConfigError::MissingEnvVar(var.to_string()))
    };

    let or_default = |var: &str, default: &str| -> String {
        lookup(var).unwrap_or_else(|_| default.to_string())
    };

    let parse_u64 = |var: &str, default: &str| -> Result<u64, ConfigError> {
        let raw = or_default(var, default);
        raw.parse::<u64>().map_err(|e| ConfigError::InvalidEnvVar {
            var: var.to_string(),
            reason: e.to_string(),
        })
    };

    let parse_bool = |var: &str, default: &str| -> Result<bool, ConfigError> {
        let raw = or_default(var, default);
        match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            other => Err(ConfigError::InvalidEnvVar {
                var: var.to_string(),
                reason: format!("expected a boolean, got '{other}'"),
            }),
        }
    };

    let secret = require("VAXWATCH_SECRET")?;
    let inventory_url = require("VAXWATCH_INVENTORY_URL")?;
    let report_url = require("VAXWATCH_REPORT_URL")?;

    let env = parse_environment(&or_default("VAXWATCH_ENV", "development"))?;
    let log_level = or_default("VAXWATCH_LOG_LEVEL", "info");

    let credential_cache_url =
        or_default("VAXWATCH_CREDENTIAL_CACHE_URL", DEFAULT_CREDENTIAL_CACHE_URL);
    let availability_feed_url =
        or_default("VAXWATCH_AVAILABILITY_FEED_URL", DEFAULT_AVAILABILITY_FEED_URL);
    let portal_base_url = or_default("VAXWATCH_PORTAL_BASE_URL", DEFAULT_PORTAL_BASE_URL);
    let slot_api_base_url = or_default("VAXWATCH_SLOT_API_BASE_URL", DEFAULT_SLOT_API_BASE_URL);

    let captcha_api_key = lookup("VAXWATCH_CAPTCHA_API_KEY")
        .ok()
        .filter(|k| !k.trim().is_empty());
    let captcha_api_url = or_default("VAXWATCH_CAPTCHA_API_URL", DEFAULT_CAPTCHA_API_URL);

    let request_timeout_secs = parse_u64("VAXWATCH_REQUEST_TIMEOUT_SECS", "15")?;
    if request_timeout_secs == 0 {
        return Err(ConfigError::InvalidEnvVar {
            var: "VAXWATCH_REQUEST_TIMEOUT_SECS".to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    let user_agent = or_default("VAXWATCH_USER_AGENT", "vaxwatch/0.1 (availability-checker)");
    let freshness_window_secs = parse_u64("VAXWATCH_FRESHNESS_WINDOW_SECS", "240")?;

    let chrome_path = lookup("VAXWATCH_CHROME_PATH").ok().map(PathBuf::from);
    let headless = parse_bool("VAXWATCH_HEADLESS", "true")?;

    Ok(AppConfig {
        env,
        log_level,
        secret,
        inventory_url,
        report_url,
        credential_cache_url,
        availability_feed_url,
        portal_base_url,
        slot_api_base_url,
        captcha_api_key,
        captcha_api_url,
        request_timeout_secs,
        user_agent,
        freshness_window_secs,
        chrome_path,
        headless,
    })
}

/// Parse a string into an `Environment` variant.
fn parse_environment(s: &str) -> Result<Environment, ConfigError> {
    match s {
        "development" => Ok(Environment::Development),
        "test" => Ok(Environment::Test),
        "production" => Ok(Environment::Production),
        other => Err(ConfigError::InvalidEnvVar {
            var: "VAXWATCH_ENV".to_string(),
            reason: format!("expected development, test, or production; got '{other}'"),
        }),
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
