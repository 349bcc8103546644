use std::env;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub app_name: String,
    pub environment: String,
    pub api_prefix: String,
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
    pub database_url: Option<String>,
    pub fetch_window_past_days: i64,
    pub fetch_window_future_days: i64,
    pub sync_concurrency: usize,
    pub fetcher_timeout_seconds: u64,
    pub sync_wall_clock_budget_seconds: Option<u64>,
    pub notifier_enabled: bool,
    pub slack_webhook_url: Option<String>,
    pub default_listing_hours: f64,
    pub default_checkout_time: String,
    pub scheduler_enabled: bool,
    pub ical_sync_interval_minutes: u64,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            app_name: env_or("APP_NAME", "Stayflow Sync API"),
            environment: env_or("ENVIRONMENT", "development"),
            api_prefix: normalize_prefix(&env_or("API_PREFIX", "/v1")),
            host: env_or("HOST", "0.0.0.0"),
            port: env_parse_or("PORT", 8000),
            cors_origins: parse_csv(&env_or("CORS_ORIGINS", "http://localhost:3000")),
            database_url: env_opt("DATABASE_URL"),
            fetch_window_past_days: env_parse_or("FETCH_WINDOW_PAST_DAYS", 90),
            fetch_window_future_days: env_parse_or("FETCH_WINDOW_FUTURE_DAYS", 180),
            sync_concurrency: env_parse_or("SYNC_CONCURRENCY", 5usize).max(1),
            fetcher_timeout_seconds: env_parse_or("FETCHER_TIMEOUT_SECONDS", 30),
            sync_wall_clock_budget_seconds: env_opt("SYNC_WALL_CLOCK_BUDGET_SECONDS")
                .and_then(|raw| raw.parse().ok()),
            notifier_enabled: env_parse_bool_or("NOTIFIER_ENABLED", true),
            slack_webhook_url: env_opt("SLACK_WEBHOOK_URL"),
            default_listing_hours: env_parse_or("DEFAULT_LISTING_HOURS", 2.0),
            default_checkout_time: env_or("DEFAULT_CHECKOUT_TIME", "10:00:00"),
            scheduler_enabled: env_parse_bool_or("SCHEDULER_ENABLED", false),
            ical_sync_interval_minutes: env_parse_or("ICAL_SYNC_INTERVAL_MINUTES", 60),
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment.trim().eq_ignore_ascii_case("production")
    }
}

// Env plumbing. A set variable that is blank or whitespace counts as unset,
// and unparseable values fall back to the default rather than failing boot.

fn env_opt(key: &str) -> Option<String> {
    let value = env::var(key).ok()?;
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    Some(value.to_string())
}

fn env_or(key: &str, default: &str) -> String {
    env_opt(key).unwrap_or_else(|| default.to_string())
}

fn env_parse_or<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    env_opt(key)
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

fn env_parse_bool_or(key: &str, default: bool) -> bool {
    let Some(raw) = env_opt(key) else {
        return default;
    };
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => default,
    }
}

fn parse_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .filter_map(|part| {
            let part = part.trim();
            (!part.is_empty()).then(|| part.to_string())
        })
        .collect()
}

fn normalize_prefix(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return "/v1".to_string();
    }
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}
