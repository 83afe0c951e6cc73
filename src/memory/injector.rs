//! Context injection
//!
//! Looks up memories relevant to the latest user message and prepends them
//! to the request as a system message.

use crate::memory::store::{bounded, MemoryRecord, MemoryStore};
use crate::models::{ChatMessage, RequestEnvelope};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const INNER_VOICE_PREFIX: &str =
    "This is your inner voice talking. You remember this about the person you're chatting with: ";

/// Selects and injects top-k memories
#[derive(Debug, Clone)]
pub struct ContextInjector {
    memories_to_use: usize,
    timeout: Duration,
}

impl ContextInjector {
    pub fn new(memories_to_use: usize, timeout: Duration) -> Self {
        Self {
            memories_to_use,
            timeout,
        }
    }

    /// Join the memory text of the first `k` results, skipping empty ones.
    ///
    /// `k` counts result positions before empty entries are dropped, so an
    /// empty memory inside the window uses up a slot.
    pub fn select_memories(&self, results: &[MemoryRecord]) -> String {
        results
            .iter()
            .take(self.memories_to_use)
            .map(|r| r.memory.as_str())
            .filter(|m| !m.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Search the store and return the joined memory text.
    ///
    /// Store errors and timeouts are treated as "nothing remembered".
    pub async fn recall(&self, store: &dyn MemoryStore, query: &str, user_id: &str) -> String {
        let results = match bounded(self.timeout, store.search(query, user_id)).await {
            Ok(results) => results,
            Err(e) => {
                warn!(store = store.name(), "Memory search failed: {}", e);
                return String::new();
            }
        };

        debug!(hits = results.len(), "Memory search returned");
        self.select_memories(&results)
    }

    /// Prepend the inner-voice system message when `fetched` is non-empty.
    ///
    /// Returns whether the envelope was modified.
    pub fn inject(&self, envelope: &mut RequestEnvelope, fetched: &str) -> bool {
        if fetched.is_empty() {
            return false;
        }

        let message = ChatMessage::system(format!("{}{}", INNER_VOICE_PREFIX, fetched));
        match envelope.prepend(message) {
            Ok(()) => {
                info!("Fetched memories successfully, injected into context");
                true
            }
            Err(e) => {
                warn!("Could not inject memory context: {}", e);
                false
            }
        }
    }

    /// Recall and inject in one step
    pub async fn apply(
        &self,
        store: &dyn MemoryStore,
        envelope: &mut RequestEnvelope,
        query: &str,
        user_id: &str,
    ) -> bool {
        let fetched = self.recall(store, query, user_id).await;
        self.inject(envelope, &fetched)
    }
}
