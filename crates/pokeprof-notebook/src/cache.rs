/// Redis caching of retrieval results.
///
/// All reads return `Option<T>` for graceful degradation. If Redis is unavailable the
/// pipeline simply retrieves again.
///
/// Key schema (inside the `RedisCache` namespace):
/// - `retrieval:{sha256(query, persona, budget, documents)}`: JSON `Vec<RetrievedSection>`
///   before errata (TTL: 3600s)
///
/// Each routed document contributes its name and `source_hash` to the key, so a rebuilt
/// index can never be answered from sections of its previous version.
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::model::{DocumentIndex, RetrievalBudget, RetrievedSection};
use notebook_common::redis::RedisCache;

const KEY_PREFIX: &str = "retrieval:";
const RETRIEVAL_TTL_SECS: u64 = 3600;

#[derive(Clone)]
pub struct RetrievalCache {
    redis: RedisCache,
}

impl RetrievalCache {
    pub fn new(redis: RedisCache) -> Self {
        Self { redis }
    }

    pub fn disabled() -> Self {
        Self::new(RedisCache::disabled())
    }

    pub async fn get_sections(
        &self,
        query: &str,
        persona: &str,
        budget: &RetrievalBudget,
        documents: &[&DocumentIndex],
    ) -> Option<Vec<RetrievedSection>> {
        let key = retrieval_key(query, persona, budget, documents);
        let json = self.redis.get(&key).await?;
        serde_json::from_str(&json)
            .inspect_err(|e| warn!(error = %e, key, "cache deserialization failed"))
            .inspect(|sections: &Vec<RetrievedSection>| {
                debug!(key, sections = sections.len(), "retrieval cache hit")
            })
            .ok()
    }

    pub async fn set_sections(
        &self,
        query: &str,
        persona: &str,
        budget: &RetrievalBudget,
        documents: &[&DocumentIndex],
        sections: &[RetrievedSection],
    ) {
        let key = retrieval_key(query, persona, budget, documents);
        if let Ok(json) = serde_json::to_string(sections) {
            self.redis.set(&key, &json, Some(RETRIEVAL_TTL_SECS)).await;
        }
    }

    /// Delete every cached retrieval. Used after a re-index.
    pub async fn invalidate_all(&self) {
        self.redis.delete_by_prefix(KEY_PREFIX).await;
    }
}

/// Deterministic key over everything that can change a retrieval result.
fn retrieval_key(
    query: &str,
    persona: &str,
    budget: &RetrievalBudget,
    documents: &[&DocumentIndex],
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(query.trim().as_bytes());
    hasher.update(b"|");
    hasher.update(persona.as_bytes());
    hasher.update(b"|");
    hasher.update(
        format!(
            "{}:{}:{}",
            budget.max_sections, budget.max_depth, budget.max_oracle_calls
        )
        .as_bytes(),
    );
    for index in documents {
        hasher.update(b"|");
        hasher.update(index.document_name().as_bytes());
        hasher.update(b"@");
        hasher.update(index.source_hash().as_bytes());
    }
    let hash = hasher.finalize();
    format!("{KEY_PREFIX}{:x}", hash)
}
