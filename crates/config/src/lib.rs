use std::path::PathBuf;
use serde::Deserialize;

/// All configuration for the matchday service.
///
/// Precedence (lowest to highest): defaults → config file → env var → CLI arg.
/// CLI arg merging is done by the caller after `Config::load()`.
#[derive(Debug, Clone)]
pub struct Config {
    // Database
    pub db_url: String,
    /// Seconds a writer waits for the SQLite lock before giving up.
    pub db_busy_timeout_secs: u64,

    // Server
    pub port: u16,
    pub cors_origin: String,

    // Logging
    pub log_level: String,
    pub utc: bool,
    /// IANA zone used when printing kick-off times on the CLI.
    pub timezone: String,

    // Auth
    pub jwt_secret: String,

    // Payments
    /// "stripe" or "mock".
    pub payments: String,
    pub stripe_api_base: String,
    pub stripe_secret_key: String,
    pub stripe_webhook_secret: String,
    pub webhook_tolerance_secs: i64,
    pub currency: String,
    pub success_url: String,
    pub cancel_url: String,

    // Holds
    pub hold_ttl_secs: i64,
    pub hold_grace_secs: i64,
    pub reap_interval_secs: u64,
}

/// Config file layout (~/.matchday/config.toml). All fields optional; they
/// layer on top of compiled-in defaults.
#[derive(Debug, Deserialize, Default)]
struct FileConfig {
    db_url: Option<String>,
    db_busy_timeout_secs: Option<u64>,
    port: Option<u16>,
    cors_origin: Option<String>,
    log_level: Option<String>,
    utc: Option<bool>,
    timezone: Option<String>,
    jwt_secret: Option<String>,
    payments: Option<String>,
    stripe_api_base: Option<String>,
    stripe_secret_key: Option<String>,
    stripe_webhook_secret: Option<String>,
    webhook_tolerance_secs: Option<i64>,
    currency: Option<String>,
    success_url: Option<String>,
    cancel_url: Option<String>,
    hold_ttl_secs: Option<i64>,
    hold_grace_secs: Option<i64>,
    reap_interval_secs: Option<u64>,
}

impl Config {
    /// Config directory: ~/.matchday/
    pub fn dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".matchday")
    }

    /// Config file path: ~/.matchday/config.toml
    pub fn file_path() -> PathBuf {
        Self::dir().join("config.toml")
    }

    /// Load config: defaults → config file → env vars.
    /// CLI args should be merged by the caller afterward.
    pub fn load() -> Self {
        let mut config = Self::defaults();

        // Layer 2: config file
        if let Ok(contents) = std::fs::read_to_string(Self::file_path()) {
            if let Ok(file) = toml::from_str::<FileConfig>(&contents) {
                config.apply_file(file);
            }
        }

        // Layer 3: environment variables
        config.apply_env(|key| std::env::var(key).ok());

        config
    }

    pub fn defaults() -> Self {
        Self {
            db_url: "sqlite:matchday.db".to_string(),
            db_busy_timeout_secs: 30,
            port: 4000,
            cors_origin: "*".to_string(),
            log_level: "info".to_string(),
            utc: false,
            timezone: "Europe/Madrid".to_string(),
            jwt_secret: "dev_secret".to_string(),
            payments: "stripe".to_string(),
            stripe_api_base: "https://api.stripe.com".to_string(),
            stripe_secret_key: String::new(),
            stripe_webhook_secret: String::new(),
            webhook_tolerance_secs: 300,
            currency: "eur".to_string(),
            success_url: "https://easyfutbol.es/pago-ok".to_string(),
            cancel_url: "https://easyfutbol.es/pago-cancelado".to_string(),
            hold_ttl_secs: 1800,
            hold_grace_secs: 600,
            reap_interval_secs: 60,
        }
    }

    // --- Private helpers ---

    fn apply_file(&mut self, file: FileConfig) {
        if let Some(v) = file.db_url { self.db_url = v; }
        if let Some(v) = file.db_busy_timeout_secs { self.db_busy_timeout_secs = v; }
        if let Some(v) = file.port { self.port = v; }
        if let Some(v) = file.cors_origin { self.cors_origin = v; }
        if let Some(v) = file.log_level { self.log_level = v; }
        if let Some(v) = file.utc { self.utc = v; }
        if let Some(v) = file.timezone { self.timezone = v; }
        if let Some(v) = file.jwt_secret { self.jwt_secret = v; }
        if let Some(v) = file.payments { self.payments = v; }
        if let Some(v) = file.stripe_api_base { self.stripe_api_base = v; }
        if let Some(v) = file.stripe_secret_key { self.stripe_secret_key = v; }
        if let Some(v) = file.stripe_webhook_secret { self.stripe_webhook_secret = v; }
        if let Some(v) = file.webhook_tolerance_secs { self.webhook_tolerance_secs = v; }
        if let Some(v) = file.currency { self.currency = v; }
        if let Some(v) = file.success_url { self.success_url = v; }
        if let Some(v) = file.cancel_url { self.cancel_url = v; }
        if let Some(v) = file.hold_ttl_secs { self.hold_ttl_secs = v; }
        if let Some(v) = file.hold_grace_secs { self.hold_grace_secs = v; }
        if let Some(v) = file.reap_interval_secs { self.reap_interval_secs = v; }
    }

    /// Applies environment overrides read through `var`. Values that do not
    /// parse are ignored.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("MATCHDAY_DB_URL") { self.db_url = v; }
        if let Some(v) = var("MATCHDAY_DB_BUSY_TIMEOUT_SECS") {
            if let Ok(n) = v.parse() { self.db_busy_timeout_secs = n; }
        }
        if let Some(v) = var("MATCHDAY_PORT") {
            if let Ok(p) = v.parse() { self.port = p; }
        }
        if let Some(v) = var("MATCHDAY_CORS_ORIGIN") { self.cors_origin = v; }
        if let Some(v) = var("MATCHDAY_LOG_LEVEL") { self.log_level = v; }
        if let Some(v) = var("MATCHDAY_UTC") {
            self.utc = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Some(v) = var("MATCHDAY_TIMEZONE") { self.timezone = v; }
        if let Some(v) = var("MATCHDAY_JWT_SECRET") { self.jwt_secret = v; }
        if let Some(v) = var("MATCHDAY_PAYMENTS") { self.payments = v; }
        if let Some(v) = var("STRIPE_API_BASE") { self.stripe_api_base = v; }
        if let Some(v) = var("STRIPE_SECRET_KEY") { self.stripe_secret_key = v; }
        if let Some(v) = var("STRIPE_WEBHOOK_SECRET") { self.stripe_webhook_secret = v; }
        if let Some(v) = var("MATCHDAY_WEBHOOK_TOLERANCE_SECS") {
            if let Ok(n) = v.parse() { self.webhook_tolerance_secs = n; }
        }
        if let Some(v) = var("MATCHDAY_CURRENCY") { self.currency = v; }
        if let Some(v) = var("STRIPE_SUCCESS_URL") { self.success_url = v; }
        if let Some(v) = var("STRIPE_CANCEL_URL") { self.cancel_url = v; }
        if let Some(v) = var("MATCHDAY_HOLD_TTL_SECS") {
            if let Ok(n) = v.parse() { self.hold_ttl_secs = n; }
        }
        if let Some(v) = var("MATCHDAY_HOLD_GRACE_SECS") {
            if let Ok(n) = v.parse() { self.hold_grace_secs = n; }
        }
        if let Some(v) = var("MATCHDAY_REAP_INTERVAL_SECS") {
            if let Ok(n) = v.parse() { self.reap_interval_secs = n; }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn file_overrides_defaults() {
        let mut config = Config::defaults();
        let file: FileConfig = toml::from_str(
            r#"
            port = 8080
            payments = "mock"
            hold_ttl_secs = 900
            db_busy_timeout_secs = 45
            "#,
        )
        .unwrap();
        config.apply_file(file);

        assert_eq!(config.port, 8080);
        assert_eq!(config.payments, "mock");
        assert_eq!(config.hold_ttl_secs, 900);
        assert_eq!(config.db_busy_timeout_secs, 45);
        assert_eq!(config.db_url, "sqlite:matchday.db");
        assert_eq!(config.hold_grace_secs, 600);
    }

    #[test]
    fn env_overrides_file() {
        let mut config = Config::defaults();
        config.apply_file(toml::from_str(r#"port = 8080"#).unwrap());
        config.apply_env(env(&[
            ("MATCHDAY_PORT", "9090"),
            ("MATCHDAY_UTC", "TRUE"),
            ("STRIPE_SECRET_KEY", "sk_test_1"),
        ]));

        assert_eq!(config.port, 9090);
        assert!(config.utc);
        assert_eq!(config.stripe_secret_key, "sk_test_1");
    }

    #[test]
    fn unparseable_env_values_are_ignored() {
        let mut config = Config::defaults();
        config.apply_env(env(&[
            ("MATCHDAY_PORT", "eighty"),
            ("MATCHDAY_HOLD_TTL_SECS", "-"),
            ("MATCHDAY_REAP_INTERVAL_SECS", "-5"),
            ("MATCHDAY_DB_BUSY_TIMEOUT_SECS", "soon"),
        ]));

        assert_eq!(config.port, 4000);
        assert_eq!(config.hold_ttl_secs, 1800);
        assert_eq!(config.reap_interval_secs, 60);
        assert_eq!(config.db_busy_timeout_secs, 30);
    }

    #[test]
    fn unknown_file_keys_do_not_break_loading() {
        let file: Result<FileConfig, _> = toml::from_str(r#"flavour = "vanilla""#);
        assert!(file.is_ok());
    }
}
