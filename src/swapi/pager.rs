use std::time::Duration;

use futures::stream::{self, Stream};
use futures::StreamExt;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::swapi::fetcher::ResilientFetcher;

/// IDs from one collection page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Page {
    pub ids: Vec<i64>,
    /// Summaries whose identifier could not be parsed.
    pub skipped: usize,
}

/// Trailing non-empty path segment of a reference URL, as an integer.
pub fn id_from_url(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    let last = match url::Url::parse(raw) {
        Ok(u) => u
            .path_segments()
            .and_then(|segs| segs.filter(|s| !s.is_empty()).last().map(str::to_string)),
        Err(_) => raw
            .split('/')
            .filter(|s| !s.is_empty())
            .last()
            .map(str::to_string),
    }?;
    last.parse::<i64>().ok()
}

fn id_from_summary(summary: &Value) -> Option<i64> {
    if let Some(id) = summary.get("url").and_then(Value::as_str).and_then(id_from_url) {
        return Some(id);
    }
    // swapi.tech list items carry `uid` next to the URL.
    match summary.get("uid") {
        Some(Value::String(s)) => s.trim().parse().ok(),
        Some(Value::Number(n)) => n.as_i64(),
        _ => None,
    }
}

/// Cursor-following walk over one collection endpoint.
pub struct PageWalker {
    fetcher: ResilientFetcher,
    first_url: String,
    cursor: Option<String>,
    budget: Duration,
    started: Option<Instant>,
    pages: usize,
}

impl PageWalker {
    pub fn new(fetcher: ResilientFetcher, first_url: impl Into<String>, budget: Duration) -> Self {
        let first_url = first_url.into();
        Self {
            fetcher,
            cursor: Some(first_url.clone()),
            first_url,
            budget,
            started: None,
            pages: 0,
        }
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages
    }

    /// Rewind to the first page. The wall-clock budget restarts too.
    pub fn restart(&mut self) {
        self.cursor = Some(self.first_url.clone());
        self.started = None;
        self.pages = 0;
    }

    /// Next page of IDs, or `None` once the walk is over.
    pub async fn next_page(&mut self) -> Option<Page> {
        let url = self.cursor.take()?;
        let started = *self.started.get_or_insert_with(Instant::now);
        if started.elapsed() >= self.budget {
            warn!(target: "walker", url = %url, budget_secs = self.budget.as_secs(), "pass budget elapsed; not issuing further pages");
            return None;
        }

        let payload = match self.fetcher.fetch(&url).await {
            Ok(p) => p,
            Err(err) => {
                warn!(target: "walker", url = %url, error = %err, "page fetch failed; stopping walk");
                return None;
            }
        };
        let Some(results) = payload.get("results").and_then(Value::as_array) else {
            warn!(target: "walker", url = %url, "page has no results array; stopping walk");
            return None;
        };

        let mut page = Page::default();
        for summary in results {
            match id_from_summary(summary) {
                Some(id) => page.ids.push(id),
                None => {
                    page.skipped += 1;
                    warn!(target: "walker", url = %url, summary = %summary, "unparseable entity id; skipped");
                }
            }
        }

        self.cursor = payload
            .get("next")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        self.pages += 1;
        debug!(target: "walker", url = %url, ids = page.ids.len(), has_next = self.cursor.is_some(), "page walked");
        if self.cursor.is_none() {
            info!(target: "walker", first = %self.first_url, pages = self.pages, "walk complete");
        }
        Some(page)
    }

    /// Lazy stream of IDs in page order.
    pub fn into_id_stream(self) -> impl Stream<Item = i64> {
        stream::unfold(self, |mut walker| async move {
            let page = walker.next_page().await?;
            Some((stream::iter(page.ids), walker))
        })
        .flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fast_retry, fetcher_with, ScriptedTransport, Step};
    use serde_json::json;

    const P1: &str = "https://swapi.test/api/people/";
    const P2: &str = "https://swapi.test/api/people/?page=2";
    const P3: &str = "https://swapi.test/api/people/?page=3";

    fn summary(id: i64) -> Value {
        json!({"name": format!("entity {id}"), "url": format!("https://swapi.test/api/people/{id}/")})
    }

    fn three_pages() -> ScriptedTransport {
        let t = ScriptedTransport::new();
        t.fallback(P1, Step::json(json!({"results": [summary(1), summary(2)], "next": P2})));
        t.fallback(P2, Step::json(json!({"results": [summary(3), summary(4)], "next": P3})));
        t.fallback(P3, Step::json(json!({"results": [summary(5)], "next": null})));
        t
    }

    #[test]
    fn extracts_trailing_segment_ids() {
        assert_eq!(id_from_url("https://swapi.dev/api/people/1/"), Some(1));
        assert_eq!(id_from_url("https://swapi.tech/api/planets/42"), Some(42));
        assert_eq!(id_from_url(" https://swapi.dev/api/people/7/ "), Some(7));
        assert_eq!(id_from_url("https://swapi.dev/api/people/luke/"), None);
        assert_eq!(id_from_url("people/9/"), Some(9));
    }

    #[test]
    fn falls_back_to_uid_field() {
        assert_eq!(id_from_summary(&json!({"uid": "12", "url": "bogus"})), Some(12));
        assert_eq!(id_from_summary(&json!({"name": "nobody"})), None);
    }

    #[tokio::test]
    async fn three_page_walk_concatenates_ids_in_page_order() {
        let transport = three_pages();
        let walker = PageWalker::new(
            fetcher_with(&transport, fast_retry(), 5),
            P1,
            Duration::from_secs(300),
        );
        let ids: Vec<i64> = walker.into_id_stream().collect().await;
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn restart_replays_from_the_first_page() {
        let transport = three_pages();
        let mut walker = PageWalker::new(
            fetcher_with(&transport, fast_retry(), 5),
            P1,
            Duration::from_secs(300),
        );
        assert_eq!(walker.next_page().await.unwrap().ids, vec![1, 2]);
        assert_eq!(walker.next_page().await.unwrap().ids, vec![3, 4]);
        walker.restart();
        assert_eq!(walker.next_page().await.unwrap().ids, vec![1, 2]);
        assert_eq!(transport.calls(P1), 2);
    }

    #[tokio::test]
    async fn bad_ids_are_skipped_not_fatal() {
        let transport = ScriptedTransport::new();
        transport.fallback(
            P1,
            Step::json(json!({
                "results": [summary(1), {"url": "https://swapi.test/api/people/x/"}, summary(3)],
                "next": null
            })),
        );
        let mut walker = PageWalker::new(
            fetcher_with(&transport, fast_retry(), 5),
            P1,
            Duration::from_secs(300),
        );
        let page = walker.next_page().await.unwrap();
        assert_eq!(page.ids, vec![1, 3]);
        assert_eq!(page.skipped, 1);
        assert!(walker.next_page().await.is_none());
    }

    #[tokio::test]
    async fn duplicate_ids_across_pages_are_kept() {
        let transport = ScriptedTransport::new();
        transport.fallback(P1, Step::json(json!({"results": [summary(1)], "next": P2})));
        transport.fallback(P2, Step::json(json!({"results": [summary(1)], "next": ""})));
        let walker = PageWalker::new(
            fetcher_with(&transport, fast_retry(), 5),
            P1,
            Duration::from_secs(300),
        );
        let ids: Vec<i64> = walker.into_id_stream().collect().await;
        assert_eq!(ids, vec![1, 1]);
    }

    #[tokio::test]
    async fn stops_on_failed_or_shapeless_pages() {
        let transport = ScriptedTransport::new();
        transport.fallback(P1, Step::json(json!({"results": [summary(1)], "next": P2})));
        transport.fallback(P2, Step::Html("<h1>502 Bad Gateway</h1>"));
        let mut walker = PageWalker::new(
            fetcher_with(&transport, fast_retry(), 5),
            P1,
            Duration::from_secs(300),
        );
        assert!(walker.next_page().await.is_some());
        assert!(walker.next_page().await.is_none());
        assert!(walker.next_page().await.is_none());

        let shapeless = ScriptedTransport::new();
        shapeless.fallback(P1, Step::json(json!({"count": 0})));
        let mut walker = PageWalker::new(
            fetcher_with(&shapeless, fast_retry(), 5),
            P1,
            Duration::from_secs(300),
        );
        assert!(walker.next_page().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stops_issuing_pages_once_budget_elapses() {
        let transport = three_pages().with_latency(Duration::from_secs(2));
        let mut walker = PageWalker::new(
            fetcher_with(&transport, fast_retry(), 5),
            P1,
            Duration::from_secs(3),
        );
        assert!(walker.next_page().await.is_some());
        assert!(walker.next_page().await.is_some());
        // 4s elapsed against a 3s budget.
        assert!(walker.next_page().await.is_none());
        assert_eq!(transport.calls(P3), 0);
        assert_eq!(walker.pages_fetched(), 2);
    }
}
