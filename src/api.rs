//! Pipeline host HTTP surface
//!
//! Exposes the filter the way a chat pipeline host expects: a listing of
//! pipelines plus `inlet`/`outlet` endpoints taking `{ body, user }`.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::env_parse;
use crate::filter::{FilterSession, MemoryFilter};
use crate::models::RequestEnvelope;

const DEFAULT_SESSION: &str = "default";

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Deserialize)]
pub struct FilterRequest {
    pub body: Value,
    #[serde(default)]
    pub user: Option<Value>,
}

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// =============================
/// API State
/// =============================

/// Bounds on the session table. Evicted sessions lose their unflushed messages.
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    /// Sessions unused for this long are dropped
    pub idle_ttl: Duration,
    /// Least recently used sessions are dropped beyond this many
    pub max_sessions: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            idle_ttl: Duration::from_secs(3600),
            max_sessions: 10_000,
        }
    }
}

impl SessionLimits {
    pub fn from_env() -> crate::Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            idle_ttl: Duration::from_secs(env_parse(
                "SESSION_IDLE_SECS",
                defaults.idle_ttl.as_secs(),
            )?),
            max_sessions: env_parse("MAX_SESSIONS", defaults.max_sessions)?,
        })
    }
}

struct SessionEntry {
    session: Arc<Mutex<FilterSession>>,
    last_seen: Instant,
}

type SessionMap = HashMap<String, SessionEntry>;

#[derive(Clone)]
pub struct ApiState {
    pub filter: Arc<MemoryFilter>,
    pub pipeline_id: Arc<str>,
    limits: SessionLimits,
    sessions: Arc<Mutex<SessionMap>>,
}

impl ApiState {
    pub fn new(filter: Arc<MemoryFilter>, pipeline_id: &str) -> Self {
        Self {
            filter,
            pipeline_id: Arc::from(pipeline_id),
            limits: SessionLimits::default(),
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_limits(mut self, limits: SessionLimits) -> Self {
        self.limits = SessionLimits {
            max_sessions: limits.max_sessions.max(1),
            ..limits
        };
        self
    }

    /// Session for `key`, created on first use.
    ///
    /// Creating a session first drops idle ones and, at capacity, the least
    /// recently used.
    async fn session(&self, key: &str) -> Arc<Mutex<FilterSession>> {
        let now = Instant::now();
        let mut sessions = self.sessions.lock().await;

        if let Some(entry) = sessions.get_mut(key) {
            entry.last_seen = now;
            return Arc::clone(&entry.session);
        }

        self.evict(&mut sessions, now);

        let session = Arc::new(Mutex::new(self.filter.new_session()));
        sessions.insert(
            key.to_string(),
            SessionEntry {
                session: Arc::clone(&session),
                last_seen: now,
            },
        );
        session
    }

    fn evict(&self, sessions: &mut SessionMap, now: Instant) {
        let before = sessions.len();
        let idle_ttl = self.limits.idle_ttl;
        sessions.retain(|_, entry| now.saturating_duration_since(entry.last_seen) < idle_ttl);

        while sessions.len() >= self.limits.max_sessions {
            let oldest = sessions
                .iter()
                .min_by_key(|(_, entry)| entry.last_seen)
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => {
                    sessions.remove(&key);
                }
                None => break,
            }
        }

        let evicted = before - sessions.len();
        if evicted > 0 {
            info!(evicted, remaining = sessions.len(), "Evicted filter sessions");
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    fn check_pipeline(&self, pipeline_id: &str) -> Result<(), Response> {
        if pipeline_id == &*self.pipeline_id {
            Ok(())
        } else {
            Err((
                StatusCode::NOT_FOUND,
                Json(ApiResponse::error(format!(
                    "Filter {} not found",
                    pipeline_id
                ))),
            )
                .into_response())
        }
    }
}

/// =============================
/// Helpers
/// =============================

/// Conversation key: `body.metadata.chat_id`, then `user.id`, then a shared default
fn session_key(body: &Value, user: Option<&Value>) -> String {
    let non_empty = |v: Option<&Value>| {
        v.and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    non_empty(body.get("metadata").and_then(|m| m.get("chat_id")))
        .or_else(|| non_empty(user.and_then(|u| u.get("id"))))
        .unwrap_or_else(|| DEFAULT_SESSION.to_string())
}

/// =============================
/// Health Endpoint
/// =============================

async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Pipeline Listing
/// =============================

async fn list_pipelines(State(state): State<ApiState>) -> Json<Value> {
    let config = state.filter.config();
    Json(json!({
        "data": [{
            "id": &*state.pipeline_id,
            "name": state.filter.name(),
            "type": "filter",
            "pipelines": config.pipelines,
            "priority": config.priority,
            "backend": state.filter.backend().label(),
        }]
    }))
}

async fn get_valves(
    State(state): State<ApiState>,
    Path(pipeline_id): Path<String>,
) -> Response {
    if let Err(resp) = state.check_pipeline(&pipeline_id) {
        return resp;
    }

    (
        StatusCode::OK,
        Json(ApiResponse::success(json!({
            "filter": state.filter.config(),
            "backend": state.filter.backend().redacted(),
        }))),
    )
        .into_response()
}

/// =============================
/// Filter Endpoints
/// =============================

async fn filter_inlet(
    State(state): State<ApiState>,
    Path(pipeline_id): Path<String>,
    Json(req): Json<FilterRequest>,
) -> Response {
    if let Err(resp) = state.check_pipeline(&pipeline_id) {
        return resp;
    }

    let envelope = match RequestEnvelope::parse(&req.body) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!("Error in inlet, passing body through: {}", e);
            return (StatusCode::OK, Json(req.body)).into_response();
        }
    };

    let key = session_key(&req.body, req.user.as_ref());
    debug!(session = %key, "inlet");

    let session = state.session(&key).await;
    let mut session = session.lock().await;
    let body = state.filter.inlet_envelope(&mut session, envelope).await;

    (StatusCode::OK, Json(body)).into_response()
}

async fn filter_outlet(
    State(state): State<ApiState>,
    Path(pipeline_id): Path<String>,
    Json(req): Json<FilterRequest>,
) -> Response {
    if let Err(resp) = state.check_pipeline(&pipeline_id) {
        return resp;
    }

    let body = state.filter.outlet(req.body).await;
    (StatusCode::OK, Json(body)).into_response()
}

/// =============================
/// Router
/// =============================

pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/pipelines", get(list_pipelines))
        .route("/:pipeline_id/valves", get(get_valves))
        .route("/:pipeline_id/filter/inlet", post(filter_inlet))
        .route("/:pipeline_id/filter/outlet", post(filter_outlet))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    filter: Arc<MemoryFilter>,
    pipeline_id: &str,
    port: u16,
    limits: SessionLimits,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    filter.on_startup().await;

    let state = ApiState::new(Arc::clone(&filter), pipeline_id).with_limits(limits);
    let router = create_router(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("Memory filter listening on http://0.0.0.0:{}", port);
    info!("Pipeline id: {}", pipeline_id);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    filter.on_shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FilterConfig;
    use crate::memory::InMemoryMemoryStore;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn state(store_cycles: usize) -> ApiState {
        state_with_limits(store_cycles, SessionLimits::default())
    }

    fn state_with_limits(store_cycles: usize, limits: SessionLimits) -> ApiState {
        let config = FilterConfig {
            store_cycles,
            async_flush: false,
            ..FilterConfig::default()
        };
        let filter = MemoryFilter::with_store(config, Arc::new(InMemoryMemoryStore::new()));
        ApiState::new(Arc::new(filter), "memory_filter").with_limits(limits)
    }

    async fn post_json(router: Router, uri: &str, payload: Value) -> (StatusCode, Value) {
        let response = router
            .oneshot(
                Request::post(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(payload.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn chat(chat_id: &str, message: &str) -> Value {
        json!({
            "body": {
                "metadata": {"chat_id": chat_id},
                "messages": [{"role": "user", "content": message}]
            },
            "user": {"id": "u-1", "name": "Ana"}
        })
    }

    #[test]
    fn test_session_key_precedence() {
        let user = json!({"id": "u-1"});
        assert_eq!(
            session_key(&json!({"metadata": {"chat_id": "c-9"}}), Some(&user)),
            "c-9"
        );
        assert_eq!(session_key(&json!({"messages": []}), Some(&user)), "u-1");
        assert_eq!(session_key(&json!({"metadata": {"chat_id": " "}}), None), "default");
    }

    #[tokio::test]
    async fn test_inlet_remembers_across_cycles() {
        let state = state(2);
        let router = create_router(state.clone());

        let (status, _) = post_json(
            router.clone(),
            "/memory_filter/filter/inlet",
            chat("c-1", "I adore green tea"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        post_json(
            router.clone(),
            "/memory_filter/filter/inlet",
            chat("c-1", "and I work remotely"),
        )
        .await;

        let (status, body) = post_json(
            router,
            "/memory_filter/filter/inlet",
            chat("c-1", "which tea should I buy?"),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["messages"][0]["role"], "system");
        assert!(body["messages"][0]["content"]
            .as_str()
            .unwrap()
            .ends_with("I adore green tea and I work remotely"));
        assert_eq!(body["metadata"]["chat_id"], "c-1");
        assert_eq!(state.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_sessions_are_separate() {
        let state = state(5);
        let router = create_router(state.clone());

        post_json(router.clone(), "/memory_filter/filter/inlet", chat("c-1", "hi")).await;
        post_json(router, "/memory_filter/filter/inlet", chat("c-2", "hello")).await;

        assert_eq!(state.session_count().await, 2);
    }

    #[tokio::test]
    async fn test_malformed_body_opens_no_session() {
        let state = state(5);
        let router = create_router(state.clone());

        let (status, body) = post_json(
            router,
            "/memory_filter/filter/inlet",
            json!({"body": {"model": "x", "metadata": {"chat_id": "c-1"}}}),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"model": "x", "metadata": {"chat_id": "c-1"}}));
        assert_eq!(state.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_idle_sessions_are_evicted() {
        let limits = SessionLimits {
            idle_ttl: Duration::from_millis(50),
            ..SessionLimits::default()
        };
        let state = state_with_limits(5, limits);
        let router = create_router(state.clone());

        post_json(router.clone(), "/memory_filter/filter/inlet", chat("c-1", "hi")).await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        post_json(router, "/memory_filter/filter/inlet", chat("c-2", "hello")).await;

        let sessions = state.sessions.lock().await;
        assert_eq!(sessions.len(), 1);
        assert!(sessions.contains_key("c-2"));
    }

    #[tokio::test]
    async fn test_session_table_is_capped() {
        let limits = SessionLimits {
            max_sessions: 3,
            ..SessionLimits::default()
        };
        let state = state_with_limits(5, limits);
        let router = create_router(state.clone());

        for i in 0..50 {
            let chat_id = format!("c-{}", i);
            post_json(router.clone(), "/memory_filter/filter/inlet", chat(&chat_id, "hi")).await;
        }

        let sessions = state.sessions.lock().await;
        assert_eq!(sessions.len(), 3);
        assert!(sessions.contains_key("c-49"));
        assert!(!sessions.contains_key("c-0"));
    }

    #[tokio::test]
    async fn test_unknown_pipeline_is_404() {
        let router = create_router(state(5));
        let (status, body) =
            post_json(router, "/other/filter/inlet", chat("c-1", "hi")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_outlet_is_identity() {
        let router = create_router(state(5));
        let payload = chat("c-1", "bye");
        let (status, body) =
            post_json(router, "/memory_filter/filter/outlet", payload.clone()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, payload["body"]);
    }

    #[tokio::test]
    async fn test_pipeline_listing() {
        let router = create_router(state(5));
        let response = router
            .oneshot(Request::get("/v1/pipelines").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(body["data"][0]["id"], "memory_filter");
        assert_eq!(body["data"][0]["type"], "filter");
        assert_eq!(body["data"][0]["pipelines"], json!(["*"]));
    }
}
