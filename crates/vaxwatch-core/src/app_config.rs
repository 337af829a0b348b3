use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Environment {
    Development,
    Test,
    Production,
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Environment::Development => write!(f, "development"),
            Environment::Test => write!(f, "test"),
            Environment::Production => write!(f, "production"),
        }
    }
}

#[derive(Clone)]
pub struct AppConfig {
    pub env: Environment,
    pub log_level: String,
    pub secret: String,
    pub inventory_url: String,
    pub report_url: String,
    pub credential_cache_url: String,
    pub availability_feed_url: String,
    pub portal_base_url: String,
    pub slot_api_base_url: String,
    pub captcha_api_key: Option<String>,
    pub captcha_api_url: String,
    pub request_timeout_secs: u64,
    pub user_agent: String,
    pub freshness_window_secs: u64,
    pub chrome_path: Option<PathBuf>,
    pub headless: bool,
}

impl AppConfig {
    /// Results are only sent upstream from production deployments.
    #[must_use]
    pub fn reporting_enabled(&self) -> bool {
        self.env == Environment::Production
    }

    /// Public status endpoint: the inventory URL without its `_internal` suffix.
    #[must_use]
    pub fn status_url(&self) -> String {
        self.inventory_url
            .strip_suffix("_internal")
            .unwrap_or(&self.inventory_url)
            .to_owned()
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("env", &self.env)
            .field("log_level", &self.log_level)
            .field("secret", &"[redacted]")
            .field("inventory_url", &self.inventory_url)
            .field("report_url", &self.report_url)
            .field("credential_cache_url", &self.credential_cache_url)
            .field("availability_feed_url", &self.availability_feed_url)
            .field("portal_base_url", &self.portal_base_url)
            .field("slot_api_base_url", &self.slot_api_base_url)
            .field(
                "captcha_api_key",
                &self.captcha_api_key.as_ref().map(|_| "[redacted]"),
            )
            .field("captcha_api_url", &self.captcha_api_url)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("user_agent", &self.user_agent)
            .field("freshness_window_secs", &self.freshness_window_secs)
            .field("chrome_path", &self.chrome_path)
            .field("headless", &self.headless)
            .finish()
    }
}
