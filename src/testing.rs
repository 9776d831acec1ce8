//! In-process fakes shared by the unit tests.
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Semaphore;

use crate::config::RetryPolicy;
use crate::swapi::fetcher::ResilientFetcher;
use crate::swapi::transport::{HttpResponse, HttpTransport, TransportError};

#[derive(Debug, Clone)]
pub enum Step {
    Status(u16),
    Json(String),
    Html(&'static str),
    Transport(&'static str),
}

impl Step {
    pub fn json(v: Value) -> Self {
        Self::Json(v.to_string())
    }
}

#[derive(Default)]
struct Inner {
    scripts: HashMap<String, VecDeque<Step>>,
    fallbacks: HashMap<String, Step>,
    calls: HashMap<String, usize>,
    in_flight: usize,
    max_in_flight: usize,
}

/// Per-URL queue of canned responses; once a queue drains the URL's fallback
/// step (or a 404) is served.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    inner: Arc<Mutex<Inner>>,
    latency: Option<Duration>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn script(&self, url: &str, steps: Vec<Step>) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .scripts
            .entry(url.to_string())
            .or_default()
            .extend(steps);
    }

    pub fn fallback(&self, url: &str, step: Step) {
        self.inner
            .lock()
            .unwrap()
            .fallbacks
            .insert(url.to_string(), step);
    }

    pub fn calls(&self, url: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .calls
            .get(url)
            .copied()
            .unwrap_or(0)
    }

    pub fn max_in_flight(&self) -> usize {
        self.inner.lock().unwrap().max_in_flight
    }

    fn next_step(&self, url: &str) -> Step {
        let mut inner = self.inner.lock().unwrap();
        *inner.calls.entry(url.to_string()).or_default() += 1;
        inner.in_flight += 1;
        inner.max_in_flight = inner.max_in_flight.max(inner.in_flight);
        if let Some(step) = inner.scripts.get_mut(url).and_then(VecDeque::pop_front) {
            return step;
        }
        inner
            .fallbacks
            .get(url)
            .cloned()
            .unwrap_or(Step::Status(404))
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn get(&self, url: &str) -> Result<HttpResponse, TransportError> {
        let step = self.next_step(url);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.inner.lock().unwrap().in_flight -= 1;
        match step {
            Step::Status(status) => Ok(HttpResponse {
                status,
                content_type: Some("application/json".into()),
                body: r#"{"detail":"error"}"#.into(),
            }),
            Step::Json(body) => Ok(HttpResponse {
                status: 200,
                content_type: Some("application/json".into()),
                body,
            }),
            Step::Html(body) => Ok(HttpResponse {
                status: 200,
                content_type: Some("text/html".into()),
                body: body.into(),
            }),
            Step::Transport(msg) => Err(TransportError(msg.into())),
        }
    }
}

pub fn fetcher_with(
    transport: &ScriptedTransport,
    retry: RetryPolicy,
    permits: usize,
) -> ResilientFetcher {
    ResilientFetcher::new(
        Arc::new(transport.clone()),
        Arc::new(Semaphore::new(permits)),
        retry,
    )
}

/// Zero-delay policy for tests that don't exercise backoff timing.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 2,
        backoff_base: Duration::ZERO,
        max_rate_limit_retries: 1,
        rate_limit_base: Duration::ZERO,
        ..RetryPolicy::default()
    }
}
