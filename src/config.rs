use std::time::Duration;

use crate::util::env::{env_flag, env_opt, env_parse};

pub const DEFAULT_BASE_URL: &str = "https://swapi.dev/api";

/// How the delay between rate-limited (HTTP 429) attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffCurve {
    /// `base * 2^n`
    Exponential,
    /// `base * (n + 1)`
    Linear,
}

impl BackoffCurve {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "exponential" | "exp" => Some(Self::Exponential),
            "linear" | "lin" => Some(Self::Linear),
            _ => None,
        }
    }

    pub fn delay(self, base: Duration, n: u32) -> Duration {
        match self {
            Self::Exponential => base.saturating_mul(2u32.saturating_pow(n.min(16))),
            Self::Linear => base.saturating_mul(n.saturating_add(1)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts spent on transport, status and body failures.
    pub max_attempts: u32,
    /// Linear base for transport/status retries: `backoff_base * (attempt + 1)`.
    pub backoff_base: Duration,
    /// Separate budget for 429 responses; they never consume `max_attempts`.
    pub max_rate_limit_retries: u32,
    pub rate_limit_base: Duration,
    pub rate_limit_curve: BackoffCurve,
    /// When false a non-2xx, non-429 status fails on the first attempt.
    pub retry_on_status: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_millis(500),
            max_rate_limit_retries: 5,
            rate_limit_base: Duration::from_millis(1000),
            rate_limit_curve: BackoffCurve::Exponential,
            retry_on_status: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub base_url: String,
    /// Size of the global fetch permit pool.
    pub max_concurrency: usize,
    /// Entities admitted per scheduler chunk.
    pub batch_size: usize,
    pub inter_batch_delay: Duration,
    pub retry: RetryPolicy,
    pub request_timeout: Duration,
    /// Wall-clock bound on page issuing for one pass.
    pub pass_budget: Duration,
    pub db_max_connections: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            max_concurrency: 5,
            batch_size: 5,
            inter_batch_delay: Duration::from_millis(500),
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(30),
            pass_budget: Duration::from_secs(300),
            db_max_connections: 5,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let rate_limit_curve = env_opt("INGEST_RATE_LIMIT_CURVE")
            .and_then(|raw| BackoffCurve::parse(&raw))
            .unwrap_or(d.retry.rate_limit_curve);
        let retry = RetryPolicy {
            max_attempts: env_parse("INGEST_MAX_ATTEMPTS", d.retry.max_attempts).max(1),
            backoff_base: Duration::from_millis(env_parse(
                "INGEST_BACKOFF_MS",
                d.retry.backoff_base.as_millis() as u64,
            )),
            max_rate_limit_retries: env_parse(
                "INGEST_RATE_LIMIT_RETRIES",
                d.retry.max_rate_limit_retries,
            ),
            rate_limit_base: Duration::from_millis(env_parse(
                "INGEST_RATE_LIMIT_BACKOFF_MS",
                d.retry.rate_limit_base.as_millis() as u64,
            )),
            rate_limit_curve,
            retry_on_status: env_flag("INGEST_RETRY_ON_STATUS", d.retry.retry_on_status),
        };
        Self {
            base_url: env_opt("SWAPI_BASE_URL")
                .map(|v| v.trim().trim_end_matches('/').to_string())
                .unwrap_or(d.base_url),
            max_concurrency: env_parse("INGEST_MAX_CONCURRENCY", d.max_concurrency).max(1),
            batch_size: env_parse("INGEST_BATCH_SIZE", d.batch_size).max(1),
            inter_batch_delay: Duration::from_millis(env_parse(
                "INGEST_BATCH_DELAY_MS",
                d.inter_batch_delay.as_millis() as u64,
            )),
            retry,
            request_timeout: Duration::from_secs(env_parse(
                "INGEST_REQUEST_TIMEOUT_SECS",
                d.request_timeout.as_secs(),
            )),
            pass_budget: Duration::from_secs(env_parse(
                "INGEST_PASS_BUDGET_SECS",
                d.pass_budget.as_secs(),
            )),
            db_max_connections: env_parse("DB_MAX_CONNS", d.db_max_connections).max(1),
        }
    }

    /// `<base>/<endpoint>/`
    pub fn collection_url(&self, endpoint: &str) -> String {
        format!("{}/{}/", self.base_url.trim_end_matches('/'), endpoint)
    }

    /// `<base>/<endpoint>/<id>/`
    pub fn entity_url(&self, endpoint: &str, id: i64) -> String {
        format!("{}/{}/{}/", self.base_url.trim_end_matches('/'), endpoint, id)
    }
}
