//! Universal search across every loaded skill.
//!
//! Each provider runs on its own scoped thread; a provider that errors
//! or panics is logged and its results are omitted, never failing the
//! aggregate.  Scores are boosted by the entry's importance metadata,
//! sorted, and truncated to the global limit.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::runtime::RuntimeContext;

/// One scored result from a skill's search provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub skill: String,
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub content: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Raw relevance in `[0, 1]` before importance boosting.
    pub score: f64,
}

/// Aggregation knobs.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    /// Global cap on returned hits.
    pub total_limit: usize,
    /// Optional cap per contributing skill, applied before merging.
    pub per_skill_limit: Option<usize>,
    /// Score added per importance level (`metadata.importance` in 0..=2).
    pub importance_boost: f64,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            total_limit: 20,
            per_skill_limit: None,
            importance_boost: 0.15,
        }
    }
}

/// Query every skill that exposes a search provider and merge the
/// results.
pub fn aggregate(
    runtime: &Arc<RuntimeContext>,
    query: &str,
    opts: &SearchOptions,
) -> Vec<SearchHit> {
    let per_skill = opts.per_skill_limit.unwrap_or(opts.total_limit);

    let mut hits: Vec<SearchHit> = std::thread::scope(|scope| {
        let mut handles = Vec::new();
        for package in runtime.registry.iter() {
            let Some(entry) = package.entry.clone() else {
                continue;
            };
            let name = package.manifest.name.clone();
            let ctx = runtime.restricted_for(&name);
            let query = query.to_string();
            handles.push((
                name.clone(),
                scope.spawn(move || {
                    std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        entry.search(&ctx, &query, per_skill)
                    }))
                }),
            ));
        }

        let mut merged = Vec::new();
        for (name, handle) in handles {
            match handle.join() {
                Ok(Ok(Some(Ok(mut skill_hits)))) => {
                    skill_hits.truncate(per_skill);
                    debug!(skill = %name, hits = skill_hits.len(), "search provider returned");
                    merged.extend(skill_hits);
                }
                Ok(Ok(Some(Err(e)))) => {
                    warn!(skill = %name, error = %e, "search provider failed; omitting");
                }
                Ok(Ok(None)) => {}
                Ok(Err(_)) | Err(_) => {
                    warn!(skill = %name, "search provider panicked; omitting");
                }
            }
        }
        merged
    });

    for hit in &mut hits {
        hit.score = boosted_score(hit, opts.importance_boost);
    }
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.skill.cmp(&b.skill))
            .then_with(|| a.id.cmp(&b.id))
    });
    hits.truncate(opts.total_limit);
    hits
}

/// `score' = min(1, score + boost * importance)` with importance clamped
/// to {0, 1, 2}.
fn boosted_score(hit: &SearchHit, boost: f64) -> f64 {
    let importance = hit
        .metadata
        .get("importance")
        .and_then(|v| v.as_i64())
        .unwrap_or(0)
        .clamp(0, 2) as f64;
    (hit.score + boost * importance).min(1.0)
}
