pub mod scheduler;

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::config::PipelineConfig;
use crate::database_ops::store::{CatalogStore, StorageError};
use crate::database_ops::upsert::{UpsertOutcome, UpsertSink};
use crate::normalization::entity::{normalize, EntityKind, RefShape, RefSpec};
use crate::swapi::fetcher::{FetchError, RawPayload, ResilientFetcher};
use crate::swapi::pager::PageWalker;
use crate::swapi::resolver::{safe_join, ReferenceResolver};
use crate::swapi::transport::HttpTransport;

use self::scheduler::run_batch;

/// Why a single entity did not reach storage.
#[derive(Debug, thiserror::Error)]
pub enum EntityFailure {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug)]
pub struct EntityOutcome {
    pub kind: EntityKind,
    pub id: i64,
    pub result: Result<UpsertOutcome, EntityFailure>,
    /// References that could not be turned into a display name.
    pub unresolved_refs: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PassSummary {
    pub kind: EntityKind,
    pub attempted: usize,
    pub persisted: usize,
    pub inserted: usize,
    pub updated: usize,
    pub failed: usize,
    pub skipped_ids: usize,
    pub pages: usize,
    pub cancelled: bool,
}

impl PassSummary {
    fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            attempted: 0,
            persisted: 0,
            inserted: 0,
            updated: 0,
            failed: 0,
            skipped_ids: 0,
            pages: 0,
            cancelled: false,
        }
    }

    fn record(&mut self, outcome: &EntityOutcome) {
        match &outcome.result {
            Ok(UpsertOutcome::Inserted) => {
                self.persisted += 1;
                self.inserted += 1;
            }
            Ok(UpsertOutcome::Updated) => {
                self.persisted += 1;
                self.updated += 1;
            }
            Err(_) => self.failed += 1,
        }
    }
}

/// Fixed-width table of pass summaries for stdout.
pub fn render_summary(summaries: &[PassSummary]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<12} {:>9} {:>9} {:>8} {:>7} {:>6} {:>7} {:>5}",
        "kind", "attempted", "persisted", "inserted", "updated", "failed", "skipped", "pages"
    );
    for s in summaries {
        let _ = writeln!(
            out,
            "{:<12} {:>9} {:>9} {:>8} {:>7} {:>6} {:>7} {:>5}{}",
            s.kind.table(),
            s.attempted,
            s.persisted,
            s.inserted,
            s.updated,
            s.failed,
            s.skipped_ids,
            s.pages,
            if s.cancelled { "  (cancelled)" } else { "" }
        );
    }
    out
}

/// One ingestion run: a shared permit pool feeding every fetch, one sink.
pub struct Pipeline<S: CatalogStore> {
    config: Arc<PipelineConfig>,
    fetcher: ResilientFetcher,
    resolver: ReferenceResolver,
    sink: UpsertSink<S>,
}

impl<S: CatalogStore> Clone for Pipeline<S> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            fetcher: self.fetcher.clone(),
            resolver: self.resolver.clone(),
            sink: self.sink.clone(),
        }
    }
}

impl<S: CatalogStore> Pipeline<S> {
    pub fn new(config: PipelineConfig, transport: Arc<dyn HttpTransport>, store: Arc<S>) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        let fetcher = ResilientFetcher::new(transport, permits, config.retry.clone());
        Self {
            resolver: ReferenceResolver::new(fetcher.clone()),
            fetcher,
            sink: UpsertSink::new(store),
            config: Arc::new(config),
        }
    }

    /// Fetch, resolve, normalize and persist one entity. Never panics on bad
    /// data; every failure comes back in the outcome.
    pub async fn ingest_entity(&self, kind: EntityKind, id: i64) -> EntityOutcome {
        let url = self.config.entity_url(kind.endpoint(), id);
        let raw = match self.fetcher.fetch(&url).await {
            Ok(raw) => raw,
            Err(err) => {
                warn!(target: "pipeline", %kind, id, error = %err, "entity fetch failed");
                return EntityOutcome {
                    kind,
                    id,
                    result: Err(err.into()),
                    unresolved_refs: 0,
                };
            }
        };

        let resolved = join_all(
            kind.reference_fields()
                .iter()
                .map(|spec| self.resolve_field(spec, &raw)),
        )
        .await;
        let unresolved_refs: usize = resolved.iter().map(|(_, _, missed)| missed).sum();
        if unresolved_refs > 0 {
            warn!(target: "pipeline", %kind, id, unresolved_refs, "references degraded to partial names");
        }
        let resolved: HashMap<&'static str, String> = resolved
            .into_iter()
            .filter_map(|(column, text, _)| text.map(|t| (column, t)))
            .collect();

        let entity = normalize(kind, id, &raw, &resolved);
        let result = self.sink.upsert(&entity).await.map_err(EntityFailure::from);
        if let Err(err) = &result {
            warn!(target: "pipeline", %kind, id, error = %err, "entity not persisted");
        }
        EntityOutcome {
            kind,
            id,
            result,
            unresolved_refs,
        }
    }

    /// `(column, joined text, references that failed)`. A missing or
    /// non-URL field yields `None` and falls back to the sentinel.
    async fn resolve_field(
        &self,
        spec: &RefSpec,
        raw: &RawPayload,
    ) -> (&'static str, Option<String>, usize) {
        let column = spec.field.column;
        let value = raw.get(spec.field.source);
        match (spec.shape, value) {
            (RefShape::Single, Some(Value::String(url))) if !url.trim().is_empty() => {
                match self.resolver.resolve_single(url).await {
                    Some(name) => (column, Some(name), 0),
                    None => (column, None, 1),
                }
            }
            (RefShape::List, Some(Value::Array(items))) => {
                let urls: Vec<&str> = items.iter().filter_map(Value::as_str).collect();
                let not_urls = items.len() - urls.len();
                let names = self.resolver.resolve_refs(&urls).await;
                let missed = names.iter().filter(|n| n.is_none()).count() + not_urls;
                (column, Some(safe_join(names)), missed)
            }
            _ => (column, None, 0),
        }
    }

    /// Walk every page of `kind`, ingesting each page's IDs through the
    /// bounded scheduler. Cancellation is honoured between pages and chunks.
    #[instrument(level = "info", skip_all, fields(kind = %kind))]
    pub async fn run_pass(&self, kind: EntityKind, cancel: &CancellationToken) -> PassSummary {
        let mut summary = PassSummary::new(kind);
        let first = self.config.collection_url(kind.endpoint());
        let mut walker = PageWalker::new(self.fetcher.clone(), first, self.config.pass_budget);
        let mut chunks_run = 0usize;

        loop {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            let Some(page) = walker.next_page().await else {
                break;
            };
            summary.skipped_ids += page.skipped;

            let tasks: Vec<_> = page
                .ids
                .into_iter()
                .map(|id| {
                    let this = self.clone();
                    async move { this.ingest_entity(kind, id).await }
                })
                .collect();
            // Pacing carries across page boundaries, not just within one batch.
            if chunks_run > 0 && !tasks.is_empty() && !self.config.inter_batch_delay.is_zero() {
                sleep(self.config.inter_batch_delay).await;
            }
            let report = run_batch(
                tasks,
                self.config.batch_size,
                self.config.inter_batch_delay,
                cancel,
            )
            .await;
            chunks_run += report.chunks;

            summary.attempted += report.completed.len() + report.panicked;
            summary.failed += report.panicked;
            for outcome in &report.completed {
                summary.record(outcome);
            }
            if report.cancelled {
                summary.cancelled = true;
                break;
            }
        }
        summary.pages = walker.pages_fetched();
        info!(
            target: "pipeline",
            %kind,
            attempted = summary.attempted,
            persisted = summary.persisted,
            failed = summary.failed,
            skipped_ids = summary.skipped_ids,
            pages = summary.pages,
            "pass finished"
        );
        summary
    }

    /// Run the requested kinds in the fixed pass order.
    pub async fn run_all(&self, kinds: &[EntityKind], cancel: &CancellationToken) -> Vec<PassSummary> {
        let mut out = Vec::new();
        for kind in EntityKind::PASS_ORDER {
            if !kinds.contains(&kind) {
                continue;
            }
            if cancel.is_cancelled() {
                info!(target: "pipeline", %kind, "cancelled before pass start");
                break;
            }
            out.push(self.run_pass(kind, cancel).await);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::memory::MemoryStore;
    use crate::testing::{fast_retry, ScriptedTransport, Step};
    use serde_json::json;
    use std::time::Duration;

    const BASE: &str = "https://swapi.test/api";

    fn config() -> PipelineConfig {
        PipelineConfig {
            base_url: BASE.into(),
            max_concurrency: 3,
            batch_size: 2,
            inter_batch_delay: Duration::ZERO,
            retry: fast_retry(),
            ..PipelineConfig::default()
        }
    }

    fn url(path: &str) -> String {
        format!("{BASE}/{path}")
    }

    async fn pipeline_with(transport: &ScriptedTransport) -> (Pipeline<MemoryStore>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        store.ensure_schema().await.unwrap();
        let pipeline = Pipeline::new(config(), Arc::new(transport.clone()), store.clone());
        (pipeline, store)
    }

    fn two_planet_page(transport: &ScriptedTransport) {
        transport.fallback(
            &url("planets/"),
            Step::json(json!({
                "next": null,
                "results": [
                    {"name": "Tatooine", "url": url("planets/1/")},
                    {"name": "Alderaan", "url": url("planets/2/")}
                ]
            })),
        );
        transport.fallback(
            &url("planets/1/"),
            Step::json(json!({
                "name": "Tatooine",
                "climate": "arid",
                "residents": [url("people/1/")],
                "films": [url("films/1/"), url("films/2/")]
            })),
        );
        transport.fallback(
            &url("planets/2/"),
            Step::json(json!({
                "name": "Alderaan",
                "climate": "temperate",
                "residents": [],
                "films": [url("films/2/")]
            })),
        );
        transport.fallback(&url("people/1/"), Step::json(json!({"name": "Luke Skywalker"})));
        transport.fallback(&url("films/1/"), Step::json(json!({"title": "A New Hope"})));
        transport.fallback(&url("films/2/"), Step::Status(500));
    }

    #[tokio::test]
    async fn failed_reference_degrades_without_losing_entities() {
        let transport = ScriptedTransport::new();
        two_planet_page(&transport);
        let (pipeline, store) = pipeline_with(&transport).await;

        let summary = pipeline
            .run_pass(EntityKind::Planet, &CancellationToken::new())
            .await;
        assert_eq!(summary.attempted, 2);
        assert_eq!(summary.persisted, 2);
        assert_eq!(summary.inserted, 2);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.pages, 1);

        let tatooine = store.get(EntityKind::Planet, 1).unwrap();
        assert_eq!(tatooine.fields["films"], "A New Hope");
        assert_eq!(tatooine.fields["residents"], "Luke Skywalker");
        assert_eq!(tatooine.fields["climate"], "arid");

        let alderaan = store.get(EntityKind::Planet, 2).unwrap();
        assert_eq!(alderaan.fields["films"], "unknown");
        assert_eq!(alderaan.fields["residents"], "unknown");
    }

    #[tokio::test]
    async fn second_run_updates_in_place() {
        let transport = ScriptedTransport::new();
        two_planet_page(&transport);
        let (pipeline, store) = pipeline_with(&transport).await;
        let cancel = CancellationToken::new();

        pipeline.run_pass(EntityKind::Planet, &cancel).await;
        let again = pipeline.run_pass(EntityKind::Planet, &cancel).await;
        assert_eq!(again.updated, 2);
        assert_eq!(again.inserted, 0);
        assert_eq!(store.len(EntityKind::Planet), 2);
    }

    #[tokio::test]
    async fn entity_fetch_failure_is_counted_not_fatal() {
        let transport = ScriptedTransport::new();
        transport.fallback(
            &url("vehicles/"),
            Step::json(json!({
                "next": null,
                "results": [{"url": url("vehicles/4/")}, {"url": url("vehicles/6/")}]
            })),
        );
        transport.fallback(
            &url("vehicles/4/"),
            Step::json(json!({"name": "Sand Crawler", "pilots": [], "films": []})),
        );
        // vehicles/6/ is unscripted and 404s on every attempt.
        let (pipeline, store) = pipeline_with(&transport).await;

        let summary = pipeline
            .run_pass(EntityKind::Vehicle, &CancellationToken::new())
            .await;
        assert_eq!(summary.attempted, 2);
        assert_eq!(summary.persisted, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(transport.calls(&url("vehicles/6/")), 2);
        assert!(store.get(EntityKind::Vehicle, 6).is_none());
    }

    #[tokio::test]
    async fn storage_rejection_fails_only_that_entity() {
        let transport = ScriptedTransport::new();
        two_planet_page(&transport);
        let (pipeline, store) = pipeline_with(&transport).await;
        store.reject_writes_for(EntityKind::Planet, 2);

        let summary = pipeline
            .run_pass(EntityKind::Planet, &CancellationToken::new())
            .await;
        assert_eq!(summary.persisted, 1);
        assert_eq!(summary.failed, 1);
        assert!(store.get(EntityKind::Planet, 1).is_some());
    }

    #[tokio::test]
    async fn character_homeworld_resolves_as_single_reference() {
        let transport = ScriptedTransport::new();
        transport.fallback(
            &url("people/1/"),
            Step::json(json!({
                "result": {"properties": {
                    "name": "Luke Skywalker",
                    "homeworld": url("planets/1/"),
                    "films": [url("films/1/")],
                    "species": [],
                    "starships": [],
                    "vehicles": []
                }}
            })),
        );
        transport.fallback(&url("planets/1/"), Step::json(json!({"name": "Tatooine"})));
        transport.fallback(&url("films/1/"), Step::json(json!({"title": "A New Hope"})));
        let (pipeline, store) = pipeline_with(&transport).await;

        let outcome = pipeline.ingest_entity(EntityKind::Character, 1).await;
        assert!(matches!(outcome.result, Ok(UpsertOutcome::Inserted)));
        assert_eq!(outcome.unresolved_refs, 0);
        let luke = store.get(EntityKind::Character, 1).unwrap();
        assert_eq!(luke.fields["homeworld"], "Tatooine");
        assert_eq!(luke.fields["films"], "A New Hope");
        assert_eq!(luke.fields["species"], "unknown");
    }

    #[tokio::test]
    async fn cancelled_run_starts_no_passes() {
        let transport = ScriptedTransport::new();
        two_planet_page(&transport);
        let (pipeline, store) = pipeline_with(&transport).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let summaries = pipeline.run_all(&EntityKind::PASS_ORDER, &cancel).await;
        assert!(summaries.is_empty());
        assert_eq!(transport.calls(&url("planets/")), 0);
        assert_eq!(store.len(EntityKind::Planet), 0);
    }

    #[tokio::test]
    async fn run_all_follows_pass_order_for_requested_kinds() {
        let transport = ScriptedTransport::new();
        for endpoint in ["vehicles/", "planets/"] {
            transport.fallback(&url(endpoint), Step::json(json!({"next": null, "results": []})));
        }
        let (pipeline, _) = pipeline_with(&transport).await;

        let summaries = pipeline
            .run_all(&[EntityKind::Vehicle, EntityKind::Planet], &CancellationToken::new())
            .await;
        let kinds: Vec<_> = summaries.iter().map(|s| s.kind).collect();
        assert_eq!(kinds, vec![EntityKind::Planet, EntityKind::Vehicle]);
    }

    #[tokio::test(start_paused = true)]
    async fn chunk_pacing_spans_page_boundaries() {
        let transport = ScriptedTransport::new();
        transport.fallback(
            &url("vehicles/"),
            Step::json(json!({
                "next": url("vehicles/?page=2"),
                "results": [{"url": url("vehicles/4/")}, {"url": url("vehicles/6/")}]
            })),
        );
        transport.fallback(
            &url("vehicles/?page=2"),
            Step::json(json!({
                "next": null,
                "results": [{"url": url("vehicles/7/")}, {"url": url("vehicles/8/")}]
            })),
        );
        for id in [4, 6, 7, 8] {
            transport.fallback(
                &url(&format!("vehicles/{id}/")),
                Step::json(json!({"name": format!("vehicle {id}"), "pilots": [], "films": []})),
            );
        }
        let store = Arc::new(MemoryStore::new());
        store.ensure_schema().await.unwrap();
        let pipeline = Pipeline::new(
            PipelineConfig {
                inter_batch_delay: Duration::from_millis(500),
                ..config()
            },
            Arc::new(transport.clone()),
            store.clone(),
        );

        let started = tokio::time::Instant::now();
        let summary = pipeline
            .run_pass(EntityKind::Vehicle, &CancellationToken::new())
            .await;
        assert_eq!(summary.persisted, 4);
        assert_eq!(summary.pages, 2);
        // One chunk per page; the second page's chunk still waits out the delay.
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert!(started.elapsed() < Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn non_string_list_entries_count_as_unresolved() {
        let transport = ScriptedTransport::new();
        transport.fallback(
            &url("starships/9/"),
            Step::json(json!({
                "name": "Death Star",
                "pilots": [],
                "films": [url("films/1/"), 42, null]
            })),
        );
        transport.fallback(&url("films/1/"), Step::json(json!({"title": "A New Hope"})));
        let (pipeline, store) = pipeline_with(&transport).await;

        let outcome = pipeline.ingest_entity(EntityKind::Starship, 9).await;
        assert!(outcome.result.is_ok());
        assert_eq!(outcome.unresolved_refs, 2);
        let row = store.get(EntityKind::Starship, 9).unwrap();
        assert_eq!(row.fields["films"], "A New Hope");
    }

    #[test]
    fn summary_table_lists_each_pass() {
        let mut s = PassSummary::new(EntityKind::Starship);
        s.attempted = 36;
        s.persisted = 35;
        s.failed = 1;
        let table = render_summary(&[s]);
        assert!(table.lines().next().unwrap().starts_with("kind"));
        assert!(table.contains("starships"));
        assert!(table.lines().nth(1).unwrap().contains("36"));
    }
}
