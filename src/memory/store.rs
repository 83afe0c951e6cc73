//! Memory Store contract
//!
//! The store owns embedding, storage and ranking. The filter only needs
//! `add` and `search`, and always sees search results in one canonical shape.

use crate::error::FilterError;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Trait for long-term memory backends
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Short backend label used in logs
    fn name(&self) -> &'static str;

    async fn add(
        &self,
        text: &str,
        user_id: &str,
        metadata: Option<&Map<String, Value>>,
    ) -> Result<()>;

    /// Ranked memories for `query`, best match first
    async fn search(&self, query: &str, user_id: &str) -> Result<Vec<MemoryRecord>>;
}

/// A single ranked search hit.
///
/// `memory` defaults to empty when the backend omits it; any other fields the
/// backend returns (id, score, timestamps) are kept in `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MemoryRecord {
    #[serde(default)]
    pub memory: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MemoryRecord {
    pub fn new(memory: impl Into<String>) -> Self {
        Self {
            memory: memory.into(),
            extra: Map::new(),
        }
    }
}

/// Result shapes seen from memory backends
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SearchResponse {
    Bare(Vec<MemoryRecord>),
    Memories { memories: Vec<MemoryRecord> },
    Results { results: Vec<MemoryRecord> },
}

/// Normalize a raw search response into the canonical record list.
pub fn normalize_search_response(raw: Value) -> Result<Vec<MemoryRecord>> {
    let response: SearchResponse = serde_json::from_value(raw).map_err(|e| {
        FilterError::StoreSearch(format!("unrecognized search response shape: {}", e))
    })?;

    Ok(match response {
        SearchResponse::Bare(records) => records,
        SearchResponse::Memories { memories } => memories,
        SearchResponse::Results { results } => results,
    })
}

/// Run a store call under `limit`; running out of time is `FilterError::Timeout`.
pub async fn bounded<T, F>(limit: Duration, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| FilterError::Timeout(limit))?
}

// =============================
// In-process store
// =============================

#[derive(Debug, Clone)]
struct StoredMemory {
    id: Uuid,
    text: String,
    metadata: Option<Map<String, Value>>,
    created_at: DateTime<Utc>,
}

/// In-memory store for development and tests.
///
/// Ranks by the number of lowercase words shared with the query, newest first
/// on ties. Memories sharing no word with the query are not returned.
pub struct InMemoryMemoryStore {
    memories: Arc<RwLock<HashMap<String, Vec<StoredMemory>>>>,
}

impl InMemoryMemoryStore {
    pub fn new() -> Self {
        Self {
            memories: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn memory_count(&self, user_id: &str) -> usize {
        self.memories
            .read()
            .await
            .get(user_id)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

impl Default for InMemoryMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn words(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

#[async_trait]
impl MemoryStore for InMemoryMemoryStore {
    fn name(&self) -> &'static str {
        "in-memory"
    }

    async fn add(
        &self,
        text: &str,
        user_id: &str,
        metadata: Option<&Map<String, Value>>,
    ) -> Result<()> {
        let mut memories = self.memories.write().await;
        memories
            .entry(user_id.to_string())
            .or_insert_with(Vec::new)
            .push(StoredMemory {
                id: Uuid::new_v4(),
                text: text.to_string(),
                metadata: metadata.cloned(),
                created_at: Utc::now(),
            });
        Ok(())
    }

    async fn search(&self, query: &str, user_id: &str) -> Result<Vec<MemoryRecord>> {
        let query_words = words(query);
        let memories = self.memories.read().await;

        let Some(stored) = memories.get(user_id) else {
            return Ok(Vec::new());
        };

        let mut scored: Vec<(usize, &StoredMemory)> = stored
            .iter()
            .map(|m| (words(&m.text).intersection(&query_words).count(), m))
            .filter(|(score, _)| *score > 0)
            .collect();

        scored.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.created_at.cmp(&a.1.created_at)));

        Ok(scored
            .into_iter()
            .map(|(score, m)| {
                let mut extra = Map::new();
                extra.insert("id".into(), Value::String(m.id.to_string()));
                extra.insert("score".into(), Value::from(score));
                extra.insert("created_at".into(), Value::String(m.created_at.to_rfc3339()));
                if let Some(metadata) = &m.metadata {
                    extra.insert("metadata".into(), Value::Object(metadata.clone()));
                }
                MemoryRecord {
                    memory: m.text.clone(),
                    extra,
                }
            })
            .collect())
    }
}
