use std::env;

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub pass: Option<String>,
    pub from_default: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub smtp: SmtpConfig,
    pub worker_concurrency: usize,
    pub max_retries: i32,
    pub retry_delay_ms: u64,
    pub poll_interval_ms: u64,
    pub max_webhook_retries: i32,
    /// Domain used in the synthetic `Message-ID` and EHLO greeting.
    pub system_domain: String,
    /// Verbose (debug-level) logging, per the `DEBUG` env var.
    pub debug: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let worker_concurrency = env_parse_or("WORKER_CONCURRENCY", 10usize)?.clamp(1, 100);
        let max_retries = env_parse_or("MAX_RETRIES", 3i32)?.clamp(0, 10);
        let retry_delay_ms = env_parse_or("RETRY_DELAY_MS", 5_000u64)?.max(1_000);
        let poll_interval_ms = env_parse_or("POLL_INTERVAL_MS", 5_000u64)?.max(1_000);
        let max_webhook_retries = env_parse_or("MAX_WEBHOOK_RETRIES", 5i32)?;

        Ok(Self {
            database_url: env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?,
            smtp: SmtpConfig {
                host: env::var("SMTP_HOST").unwrap_or_else(|_| "localhost".to_string()),
                port: env_parse_or("SMTP_PORT", 25u16)?,
                user: env::var("SMTP_USER").ok(),
                pass: env::var("SMTP_PASS").ok(),
                from_default: env::var("SMTP_FROM_DEFAULT")
                    .unwrap_or_else(|_| "no-reply@localhost".to_string()),
            },
            worker_concurrency,
            max_retries,
            retry_delay_ms,
            poll_interval_ms,
            max_webhook_retries,
            system_domain: env::var("SYSTEM_DOMAIN")
                .unwrap_or_else(|_| "sendlane.local".to_string()),
            debug: env::var("DEBUG").is_ok(),
        })
    }

    #[cfg(test)]
    pub fn for_test() -> Self {
        Self {
            database_url: "postgres://localhost/test".to_string(),
            smtp: SmtpConfig {
                host: "localhost".to_string(),
                port: 2525,
                user: None,
                pass: None,
                from_default: "no-reply@test.local".to_string(),
            },
            worker_concurrency: 4,
            max_retries: 3,
            retry_delay_ms: 5_000,
            poll_interval_ms: 5_000,
            max_webhook_retries: 5,
            system_domain: "test.local".to_string(),
            debug: true,
        }
    }
}

fn env_parse_or<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(v) => v.parse().map_err(|e| anyhow::anyhow!("invalid {key}: {e}")),
        Err(_) => Ok(default),
    }
}
