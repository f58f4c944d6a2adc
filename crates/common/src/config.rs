use chrono::FixedOffset;

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Telegram bot token
    pub telegram_bot_token: String,

    /// Telegram Bot API base URL (overridable for tests and proxies)
    pub telegram_api_url: String,

    /// JSON roster file used when no database is configured
    pub roster_path: String,

    /// PostgreSQL connection string; selects the database roster when set
    pub database_url: Option<String>,

    /// Maximum number of PostgreSQL connections in the pool (default: 5)
    pub db_max_connections: u32,

    /// Canonical zone for all day/month/time comparisons (default: +03:00)
    pub reference_offset: FixedOffset,

    /// Scheduler tick period in seconds (default: 60)
    pub tick_interval_secs: u64,

    /// Long-poll timeout handed to the update feed in seconds (default: 60)
    pub poll_timeout_secs: u64,

    /// Timeout for send / acknowledge / webhook calls in seconds (default: 10)
    pub request_timeout_secs: u64,

    /// Delivery attempts per reminder before giving up (default: 3)
    pub max_attempts: u32,

    /// Minimum spacing between attempts for one reminder in seconds (default: 7200)
    pub min_attempt_interval_secs: u64,

    /// Days a tracking record is kept after the day it was created (default: 1)
    pub notification_retention_days: u32,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            telegram_bot_token: std::env::var("TELEGRAM_BOT_TOKEN")
                .ok()
                .filter(|t| !t.trim().is_empty())
                .ok_or_else(|| {
                    anyhow::anyhow!("TELEGRAM_BOT_TOKEN environment variable is required")
                })?,
            telegram_api_url: std::env::var("TELEGRAM_API_URL")
                .unwrap_or_else(|_| "https://api.telegram.org".to_string()),
            roster_path: std::env::var("ROSTER_PATH").unwrap_or_else(|_| "roster.json".to_string()),
            database_url: std::env::var("DATABASE_URL").ok().filter(|u| !u.is_empty()),
            db_max_connections: parse_var("DB_MAX_CONNECTIONS", "5")?,
            reference_offset: parse_utc_offset(
                &std::env::var("REFERENCE_UTC_OFFSET").unwrap_or_else(|_| "+03:00".to_string()),
            )
            .map_err(|e| anyhow::anyhow!("REFERENCE_UTC_OFFSET {e}"))?,
            tick_interval_secs: parse_var("TICK_INTERVAL_SECS", "60")?,
            poll_timeout_secs: parse_var("POLL_TIMEOUT_SECS", "60")?,
            request_timeout_secs: parse_var("REQUEST_TIMEOUT_SECS", "10")?,
            max_attempts: parse_var("MAX_ATTEMPTS", "3")?,
            min_attempt_interval_secs: parse_var("MIN_ATTEMPT_INTERVAL_SECS", "7200")?,
            notification_retention_days: parse_var("NOTIFICATION_RETENTION_DAYS", "1")?,
        })
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: &str) -> anyhow::Result<T> {
    std::env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .trim()
        .parse()
        .map_err(|_| {
            anyhow::anyhow!(
                "{name} must be a valid {}",
                std::any::type_name::<T>()
            )
        })
}

/// Parse a `±HH:MM` (or `±HH`) UTC offset.
pub fn parse_utc_offset(raw: &str) -> Result<FixedOffset, String> {
    let raw = raw.trim();
    let (sign, rest) = match raw.chars().next() {
        Some('+') => (1, &raw[1..]),
        Some('-') => (-1, &raw[1..]),
        _ => return Err(format!("must start with + or -, got {raw:?}")),
    };

    let (hours, minutes) = match rest.split_once(':') {
        Some((h, m)) => (h, m),
        None => (rest, "0"),
    };
    let hours: i32 = hours
        .parse()
        .map_err(|_| format!("has an invalid hour part in {raw:?}"))?;
    let minutes: i32 = minutes
        .parse()
        .map_err(|_| format!("has an invalid minute part in {raw:?}"))?;
    if !(0..=14).contains(&hours) || !(0..60).contains(&minutes) {
        return Err(format!("is out of range: {raw:?}"));
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
        .ok_or_else(|| format!("is out of range: {raw:?}"))
}
