use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{debug, instrument, warn};

use crate::config::RetryPolicy;
use crate::swapi::transport::{HttpResponse, HttpTransport};

/// A validated entity or page body. Flat bodies are used as-is; enveloped
/// bodies (`{result: {properties: {...}}}`) are unwrapped to `properties`.
#[derive(Debug, Clone, PartialEq)]
pub enum RawPayload {
    Flat(Map<String, Value>),
    Enveloped(Map<String, Value>),
}

impl RawPayload {
    pub fn fields(&self) -> &Map<String, Value> {
        match self {
            Self::Flat(m) | Self::Enveloped(m) => m,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields().get(key)
    }

    /// `name`, falling back to `title` (films carry titles).
    pub fn display_name(&self) -> Option<&str> {
        ["name", "title"]
            .into_iter()
            .filter_map(|k| self.get(k).and_then(Value::as_str))
            .map(str::trim)
            .find(|s| !s.is_empty())
    }

    /// Decide the payload shape once, from the parsed body.
    pub fn from_body(body: &str) -> Result<Self, String> {
        let value: Value =
            serde_json::from_str(body).map_err(|e| format!("invalid json: {e}"))?;
        let Value::Object(mut top) = value else {
            return Err("top-level json is not an object".into());
        };
        match top.remove("result") {
            None => Ok(Self::Flat(top)),
            Some(Value::Object(mut result)) => match result.remove("properties") {
                Some(Value::Object(props)) => Ok(Self::Enveloped(props)),
                _ => Err("envelope without result.properties object".into()),
            },
            Some(_) => Err("envelope result is not an object".into()),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    #[error("rate limited after {retries} retries: {url}")]
    RateLimited { url: String, retries: u32 },
    #[error("transport failure for {url}: {message}")]
    Transport { url: String, message: String },
    #[error("http status {status} for {url}")]
    HttpStatus { url: String, status: u16 },
    #[error("malformed body for {url}: {reason}")]
    MalformedBody { url: String, reason: String },
}

enum Attempt {
    Done(RawPayload),
    RateLimited,
    Retryable(FetchError),
    Fatal(FetchError),
}

/// Retrying GET+validate with a permit pool shared by every caller.
#[derive(Clone)]
pub struct ResilientFetcher {
    transport: Arc<dyn HttpTransport>,
    permits: Arc<Semaphore>,
    retry: RetryPolicy,
}

impl ResilientFetcher {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        permits: Arc<Semaphore>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            permits,
            retry,
        }
    }

    #[instrument(level = "debug", skip(self, url), fields(url = %url.trim()))]
    pub async fn fetch(&self, url: &str) -> Result<RawPayload, FetchError> {
        let url = url.trim();
        let mut attempt: u32 = 0;
        let mut rate_limited: u32 = 0;
        loop {
            match self.attempt_once(url).await {
                Attempt::Done(payload) => return Ok(payload),
                Attempt::Fatal(err) => return Err(err),
                Attempt::RateLimited => {
                    if rate_limited >= self.retry.max_rate_limit_retries {
                        warn!(target: "fetch", url = %url, retries = rate_limited, "rate limit budget exhausted");
                        return Err(FetchError::RateLimited {
                            url: url.to_string(),
                            retries: rate_limited,
                        });
                    }
                    let wait = self
                        .retry
                        .rate_limit_curve
                        .delay(self.retry.rate_limit_base, rate_limited);
                    warn!(target: "fetch", url = %url, wait_ms = wait.as_millis() as u64, "429 throttled; sleeping before retry");
                    rate_limited += 1;
                    sleep(wait).await;
                }
                Attempt::Retryable(err) => {
                    attempt += 1;
                    if attempt >= self.retry.max_attempts {
                        warn!(target: "fetch", url = %url, attempts = attempt, error = %err, "giving up");
                        return Err(err);
                    }
                    let wait = self.retry.backoff_base.saturating_mul(attempt);
                    debug!(target: "fetch", url = %url, attempt, wait_ms = wait.as_millis() as u64, error = %err, "retrying");
                    sleep(wait).await;
                }
            }
        }
    }

    async fn attempt_once(&self, url: &str) -> Attempt {
        // Permit covers the request only, never the backoff sleep.
        let resp = {
            let _permit = match self.permits.acquire().await {
                Ok(p) => p,
                Err(_) => {
                    return Attempt::Fatal(FetchError::Transport {
                        url: url.to_string(),
                        message: "fetch permit pool closed".into(),
                    })
                }
            };
            self.transport.get(url).await
        };
        match resp {
            Err(e) => Attempt::Retryable(FetchError::Transport {
                url: url.to_string(),
                message: e.0,
            }),
            Ok(r) if r.status == 429 => Attempt::RateLimited,
            Ok(r) if !r.is_success() => {
                let err = FetchError::HttpStatus {
                    url: url.to_string(),
                    status: r.status,
                };
                if self.retry.retry_on_status {
                    Attempt::Retryable(err)
                } else {
                    Attempt::Fatal(err)
                }
            }
            Ok(r) => match validate(&r) {
                Ok(payload) => Attempt::Done(payload),
                Err(reason) => Attempt::Retryable(FetchError::MalformedBody {
                    url: url.to_string(),
                    reason,
                }),
            },
        }
    }
}

fn validate(resp: &HttpResponse) -> Result<RawPayload, String> {
    if !resp.is_json() {
        return Err(format!(
            "unexpected content type {:?}",
            resp.content_type.as_deref().unwrap_or("<none>")
        ));
    }
    RawPayload::from_body(&resp.body)
}
