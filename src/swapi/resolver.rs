use futures::future::join_all;
use tracing::debug;

use crate::normalization::entity::SENTINEL;
use crate::swapi::fetcher::ResilientFetcher;

/// Join the surviving display names with `", "`; nothing left → `"unknown"`.
pub fn safe_join<I, S>(names: I) -> String
where
    I: IntoIterator<Item = Option<S>>,
    S: AsRef<str>,
{
    let kept: Vec<String> = names
        .into_iter()
        .flatten()
        .map(|s| s.as_ref().trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if kept.is_empty() {
        SENTINEL.to_string()
    } else {
        kept.join(", ")
    }
}

/// Best-effort expansion of reference URLs into display names.
#[derive(Clone)]
pub struct ReferenceResolver {
    fetcher: ResilientFetcher,
}

impl ReferenceResolver {
    pub fn new(fetcher: ResilientFetcher) -> Self {
        Self { fetcher }
    }

    pub async fn resolve_single(&self, reference: &str) -> Option<String> {
        let url = reference.trim();
        if url.is_empty() {
            return None;
        }
        match self.fetcher.fetch(url).await {
            Ok(payload) => payload.display_name().map(str::to_string),
            Err(err) => {
                debug!(target: "resolve", url = %url, error = %err, "reference dropped");
                None
            }
        }
    }

    /// Output index i always corresponds to input index i.
    pub async fn resolve_refs<S: AsRef<str>>(&self, references: &[S]) -> Vec<Option<String>> {
        join_all(
            references
                .iter()
                .map(|r| self.resolve_single(r.as_ref())),
        )
        .await
    }

    pub async fn resolve_joined<S: AsRef<str>>(&self, references: &[S]) -> String {
        safe_join(self.resolve_refs(references).await)
    }
}
