//! The memory filter
//!
//! INLET: parse → accumulate → flush? → recall → inject → return
//!
//! `MemoryFilter` holds what is shared across requests (configuration, the
//! store handle, the write guard). Per-conversation state lives in a
//! `FilterSession` owned by the host and passed into every inlet call.

use crate::backend::{BackendConfig, StaticConnector, StoreConnector};
use crate::config::FilterConfig;
use crate::memory::guard::text_digest;
use crate::memory::{
    bounded, ContextInjector, FlushGuard, FlushJob, FlushMode, MemoryStore, MessageAccumulator,
};
use crate::models::RequestEnvelope;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Query used to check that a held store still answers
const STORE_PROBE_QUERY: &str = "my name";

/// Per-conversation filter state
#[derive(Debug, Clone)]
pub struct FilterSession {
    accumulator: MessageAccumulator,
    requests_seen: u64,
}

impl FilterSession {
    pub fn new(store_cycles: usize) -> Self {
        Self {
            accumulator: MessageAccumulator::new(store_cycles),
            requests_seen: 0,
        }
    }

    /// Messages waiting for the next flush
    pub fn pending(&self) -> Vec<&str> {
        self.accumulator.messages().collect()
    }

    pub fn requests_seen(&self) -> u64 {
        self.requests_seen
    }
}

pub struct MemoryFilter {
    name: String,
    config: FilterConfig,
    backend: BackendConfig,
    connector: Arc<dyn StoreConnector>,
    store: RwLock<Option<Arc<dyn MemoryStore>>>,
    guard: FlushGuard,
    injector: ContextInjector,
}

impl MemoryFilter {
    pub fn new(
        config: FilterConfig,
        backend: BackendConfig,
        connector: Arc<dyn StoreConnector>,
    ) -> Self {
        let guard = FlushGuard::new(
            FlushMode::from_async_flag(config.async_flush),
            config.store_timeout(),
        )
        .with_max_pending(config.max_pending_flushes);
        let injector = ContextInjector::new(config.memories_to_use, config.store_timeout());

        Self {
            name: "Memory Filter".to_string(),
            config,
            backend,
            connector,
            store: RwLock::new(None),
            guard,
            injector,
        }
    }

    /// Filter over an already-built store
    pub fn with_store(config: FilterConfig, store: Arc<dyn MemoryStore>) -> Self {
        Self::new(
            config,
            BackendConfig::Memory,
            Arc::new(StaticConnector::new(store)),
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    pub fn backend(&self) -> &BackendConfig {
        &self.backend
    }

    pub fn guard(&self) -> &FlushGuard {
        &self.guard
    }

    pub fn new_session(&self) -> FilterSession {
        FilterSession::new(self.config.store_cycles)
    }

    // =============================
    // Lifecycle
    // =============================

    /// Validate configuration, run backend diagnostics and build the store.
    ///
    /// Nothing here is fatal: failures are logged and the store is built
    /// lazily on the first request instead.
    pub async fn on_startup(&self) {
        info!(filter = %self.name, backend = self.backend.label(), "on_startup");

        if let Err(e) = self.config.validate() {
            error!("Invalid filter configuration: {}", e);
        }
        if let Err(e) = self.backend.validate() {
            error!("Invalid memory backend configuration: {}", e);
        }
        if let Err(e) = self.backend.run_diagnostics(self.config.store_timeout()).await {
            warn!(backend = self.backend.label(), "Backend diagnostic failed: {}", e);
        }

        self.rebuild_store().await;
    }

    /// Wait for pending writes, then drop the store handle
    pub async fn on_shutdown(&self) {
        info!(filter = %self.name, "on_shutdown");
        self.guard.wait_idle().await;
        *self.store.write().await = None;
    }

    /// Return a usable store, building or rebuilding it if needed.
    ///
    /// With `verify_store_on_request` the held store is probed with a cheap
    /// search first. Never fails; `None` means no store could be built.
    pub async fn ensure_store(&self) -> Option<Arc<dyn MemoryStore>> {
        let current = self.store.read().await.clone();

        let Some(store) = current else {
            return self.rebuild_store().await;
        };

        if !self.config.verify_store_on_request {
            return Some(store);
        }

        let probe = bounded(
            self.config.store_timeout(),
            store.search(STORE_PROBE_QUERY, &self.config.user_id),
        )
        .await;

        match probe {
            Ok(_) => Some(store),
            Err(e) => {
                warn!("Memory store probe failed, creating a new one: {}", e);
                self.rebuild_store().await.or(Some(store))
            }
        }
    }

    async fn rebuild_store(&self) -> Option<Arc<dyn MemoryStore>> {
        let connected = bounded(self.config.store_timeout(), self.connector.connect()).await;

        match connected {
            Ok(store) => {
                *self.store.write().await = Some(Arc::clone(&store));
                Some(store)
            }
            Err(e) => {
                error!(backend = self.backend.label(), "Error initializing memory store: {}", e);
                None
            }
        }
    }

    // =============================
    // Request handling
    // =============================

    /// Handle an inbound request body.
    ///
    /// Always returns a usable body: the original one when it cannot be
    /// parsed, otherwise the parsed envelope with at most one system message
    /// prepended.
    pub async fn inlet(&self, session: &mut FilterSession, body: Value) -> Value {
        match RequestEnvelope::parse(&body) {
            Ok(envelope) => self.inlet_envelope(session, envelope).await,
            Err(e) => {
                warn!("Error in inlet, passing body through: {}", e);
                body
            }
        }
    }

    /// Inlet for an envelope the caller has already parsed
    pub async fn inlet_envelope(
        &self,
        session: &mut FilterSession,
        mut envelope: RequestEnvelope,
    ) -> Value {
        session.requests_seen += 1;

        let user_id = self.config.user_id.as_str();
        let last_message = envelope.latest_user_message();
        debug!("Latest user message: {}", last_message);

        let drained = session.accumulator.push_and_take(last_message.clone());
        let store = self.ensure_store().await;

        if let Some(text) = drained {
            info!(
                cycles = self.config.store_cycles,
                digest = %text_digest(&text),
                "Processing accumulated messages into memory"
            );
            match &store {
                Some(store) => {
                    let job = FlushJob::new(
                        text,
                        user_id.to_string(),
                        self.backend.flush_metadata(),
                    );
                    self.guard.run_flush(Arc::clone(store), job).await;
                }
                None => {
                    error!("No memory store available, accumulated batch dropped");
                }
            }
        }

        if let Some(store) = &store {
            self.injector
                .apply(store.as_ref(), &mut envelope, &last_message, user_id)
                .await;
        }

        envelope.into_value()
    }

    /// Outbound responses pass through unchanged
    pub async fn outlet(&self, body: Value) -> Value {
        body
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::OpenAiPgvectorConfig;
    use crate::error::FilterError;
    use crate::memory::injector::INNER_VOICE_PREFIX;
    use crate::memory::testing::{FailingStore, RecordingStore};
    use crate::Result;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    fn inline_config(store_cycles: usize) -> FilterConfig {
        FilterConfig {
            store_cycles,
            async_flush: false,
            ..FilterConfig::default()
        }
    }

    fn body(message: &str) -> Value {
        json!({
            "model": "llama3.1",
            "messages": [
                {"role": "assistant", "content": "hello"},
                {"role": "user", "content": message}
            ]
        })
    }

    /// Hands out stores in order, failing once the list runs out
    struct SequenceConnector {
        stores: Mutex<Vec<Arc<dyn MemoryStore>>>,
        calls: AtomicUsize,
    }

    impl SequenceConnector {
        fn new(stores: Vec<Arc<dyn MemoryStore>>) -> Self {
            Self {
                stores: Mutex::new(stores),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl StoreConnector for SequenceConnector {
        async fn connect(&self) -> Result<Arc<dyn MemoryStore>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut stores = self.stores.lock().unwrap();
            if stores.is_empty() {
                Err(FilterError::StoreUnavailable("memory server down".into()))
            } else {
                Ok(stores.remove(0))
            }
        }
    }

    #[tokio::test]
    async fn test_flush_after_store_cycles() {
        let store = Arc::new(RecordingStore::new());
        let filter = MemoryFilter::with_store(inline_config(3), store.clone());
        let mut session = filter.new_session();

        filter.inlet(&mut session, body("a")).await;
        filter.inlet(&mut session, body("b")).await;
        assert!(store.writes().await.is_empty());
        assert_eq!(session.pending(), vec!["a", "b"]);

        filter.inlet(&mut session, body("c")).await;
        assert_eq!(store.writes().await, vec!["a b c"]);
        assert!(session.pending().is_empty());
        assert_eq!(session.requests_seen(), 3);
    }

    #[tokio::test]
    async fn test_background_flush_reaches_store() {
        let store = Arc::new(RecordingStore::new());
        let config = FilterConfig {
            store_cycles: 2,
            ..FilterConfig::default()
        };
        let filter = MemoryFilter::with_store(config, store.clone());
        let mut session = filter.new_session();

        for m in ["one", "two", "three", "four"] {
            filter.inlet(&mut session, body(m)).await;
        }
        filter.on_shutdown().await;

        assert_eq!(store.writes().await, vec!["one two", "three four"]);
        assert_eq!(filter.guard().flushes_completed(), 2);
    }

    #[tokio::test]
    async fn test_missing_user_message_still_counts() {
        let store = Arc::new(RecordingStore::new());
        let filter = MemoryFilter::with_store(inline_config(2), store.clone());
        let mut session = filter.new_session();

        filter
            .inlet(&mut session, json!({"messages": [{"role": "system", "content": "x"}]}))
            .await;
        filter.inlet(&mut session, body("hi")).await;

        assert_eq!(store.writes().await, vec![" hi"]);
    }

    #[tokio::test]
    async fn test_memories_injected() {
        let store = Arc::new(RecordingStore::with_results(&["likes tea", "", "works remotely"]));
        let config = FilterConfig {
            memories_to_use: 2,
            ..inline_config(5)
        };
        let filter = MemoryFilter::with_store(config, store.clone());
        let mut session = filter.new_session();

        let out = filter.inlet(&mut session, body("what should I drink?")).await;

        let messages = out["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(
            messages[0]["content"],
            format!("{}likes tea", INNER_VOICE_PREFIX)
        );
        assert_eq!(out["model"], "llama3.1");
        assert_eq!(store.searches().await, vec!["what should I drink?"]);
    }

    #[tokio::test]
    async fn test_slow_search_still_returns_request() {
        let store = Arc::new(
            RecordingStore::with_results(&["likes tea"])
                .with_search_delay(Duration::from_millis(1500)),
        );
        let config = FilterConfig {
            store_timeout_secs: 1,
            ..inline_config(1)
        };
        let filter = MemoryFilter::with_store(config, store.clone());
        let mut session = filter.new_session();

        let input = body("what should I drink?");
        let out = filter.inlet(&mut session, input.clone()).await;

        assert_eq!(out, input);
        assert_eq!(store.writes().await, vec!["what should I drink?"]);
        assert_eq!(store.searches().await, vec!["what should I drink?"]);
    }

    #[tokio::test]
    async fn test_failing_store_never_breaks_request() {
        let filter = MemoryFilter::with_store(inline_config(1), Arc::new(FailingStore));
        let mut session = filter.new_session();

        let input = body("remember that I like tea");
        let out = filter.inlet(&mut session, input.clone()).await;

        assert_eq!(out, input);
        assert_eq!(filter.guard().flushes_failed(), 1);
        assert!(session.pending().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_body_returned_unchanged() {
        let filter = MemoryFilter::with_store(inline_config(1), Arc::new(RecordingStore::new()));
        let mut session = filter.new_session();

        for input in [json!("not json at all"), json!({"model": "x"}), json!(42)] {
            let out = filter.inlet(&mut session, input.clone()).await;
            assert_eq!(out, input);
        }
        assert_eq!(session.requests_seen(), 0);
    }

    #[tokio::test]
    async fn test_store_built_lazily_after_failed_startup() {
        let store: Arc<dyn MemoryStore> = Arc::new(RecordingStore::with_results(&["has a dog"]));
        let connector = Arc::new(SequenceConnector::new(vec![]));
        let filter = MemoryFilter::new(inline_config(5), BackendConfig::Memory, connector.clone());

        filter.on_startup().await;
        assert!(filter.ensure_store().await.is_none());

        connector.stores.lock().unwrap().push(store);
        let mut session = filter.new_session();
        let out = filter.inlet(&mut session, body("tell me about my pet")).await;

        assert_eq!(out["messages"][0]["role"], "system");
        assert_eq!(connector.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_broken_store_is_replaced_when_verifying() {
        let healthy = Arc::new(RecordingStore::new());
        let stores: Vec<Arc<dyn MemoryStore>> = vec![Arc::new(FailingStore), healthy.clone()];
        let connector = Arc::new(SequenceConnector::new(stores));
        let config = FilterConfig {
            verify_store_on_request: true,
            ..inline_config(1)
        };
        let filter = MemoryFilter::new(config, BackendConfig::Memory, connector);
        filter.on_startup().await;

        let mut session = filter.new_session();
        filter.inlet(&mut session, body("I live in Porto")).await;

        assert_eq!(healthy.writes().await, vec!["I live in Porto"]);
        assert_eq!(healthy.searches().await, vec!["I live in Porto"]);
    }

    #[tokio::test]
    async fn test_vector_backend_tags_flushes() {
        let store = Arc::new(RecordingStore::new());
        let backend = BackendConfig::Vector(OpenAiPgvectorConfig::default());
        let filter = MemoryFilter::new(
            inline_config(1),
            backend,
            Arc::new(StaticConnector::new(store.clone())),
        );
        let mut session = filter.new_session();

        filter.inlet(&mut session, body("I work remotely")).await;

        let log = store.write_log().await;
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].1, "user");
        assert_eq!(log[0].2.as_ref().unwrap()["category"], "conversation");
    }

    #[tokio::test]
    async fn test_outlet_passes_through() {
        let filter = MemoryFilter::with_store(inline_config(1), Arc::new(RecordingStore::new()));
        let input = body("bye");
        assert_eq!(filter.outlet(input.clone()).await, input);
    }
}
