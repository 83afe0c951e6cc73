//! Memory backend selection
//!
//! Each supported backend combination is one variant of `BackendConfig`.
//! A variant knows how to validate itself, render the provider document the
//! memory server consumes, and run its startup diagnostics. `StoreConnector`
//! turns a configuration into a live `MemoryStore` handle.

use crate::config::{env_or, env_parse};
use crate::error::FilterError;
use crate::memory::mem0::{Mem0HttpStore, DEFAULT_MEM0_BASE_URL};
use crate::memory::store::MemoryStore;
use crate::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Map, Value};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const REDACTED: &str = "********";

/// Local inference with a Neo4j graph store
#[derive(Debug, Clone, Serialize)]
pub struct OllamaNeo4jConfig {
    pub llm_model: String,
    pub llm_temperature: f32,
    pub llm_max_tokens: u32,
    pub llm_url: String,
    pub embedder_model: String,
    pub neo4j_url: String,
    pub neo4j_user: String,
    pub neo4j_password: String,
}

impl Default for OllamaNeo4jConfig {
    fn default() -> Self {
        Self {
            llm_model: "llama3.1:latest".to_string(),
            llm_temperature: 0.0,
            llm_max_tokens: 8000,
            llm_url: "http://127.0.0.1:11434".to_string(),
            embedder_model: "mxbai-embed-large".to_string(),
            neo4j_url: "neo4j://host.docker.internal:7687".to_string(),
            neo4j_user: "neo4j".to_string(),
            neo4j_password: "my_password123".to_string(),
        }
    }
}

/// Hosted OpenAI models with a PostgreSQL/pgvector store
#[derive(Debug, Clone, Serialize)]
pub struct OpenAiPgvectorConfig {
    pub api_key: String,
    pub llm_model: String,
    pub llm_temperature: f32,
    pub llm_max_tokens: u32,
    pub embedding_model: String,
    pub pg_host: String,
    pub pg_port: u16,
    pub pg_user: String,
    pub pg_password: String,
    pub pg_database: String,
    /// Must match the embedder's output size
    pub embedding_dims: u32,
}

impl Default for OpenAiPgvectorConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            llm_model: "gpt-4o".to_string(),
            llm_temperature: 0.0,
            llm_max_tokens: 2000,
            embedding_model: "text-embedding-3-small".to_string(),
            pg_host: "host.docker.internal".to_string(),
            pg_port: 5433,
            pg_user: "postgres".to_string(),
            pg_password: "password".to_string(),
            pg_database: "postgres".to_string(),
            embedding_dims: 1536,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum BackendConfig {
    Graph(OllamaNeo4jConfig),
    Vector(OpenAiPgvectorConfig),
    /// In-process store, nothing persisted
    Memory,
}

impl BackendConfig {
    /// Read `MEMORY_BACKEND` (`graph` | `vector` | `memory`) and the matching variables
    pub fn from_env() -> Result<Self> {
        let kind = env_or("MEMORY_BACKEND", "graph");

        match kind.trim().to_lowercase().as_str() {
            "graph" | "ollama" | "neo4j" => {
                let d = OllamaNeo4jConfig::default();
                Ok(BackendConfig::Graph(OllamaNeo4jConfig {
                    llm_model: env_or("OLLAMA_LLM_MODEL", &d.llm_model),
                    llm_temperature: env_parse("OLLAMA_LLM_TEMPERATURE", d.llm_temperature)?,
                    llm_max_tokens: env_parse("OLLAMA_LLM_MAX_TOKENS", d.llm_max_tokens)?,
                    llm_url: env_or("OLLAMA_LLM_URL", &d.llm_url),
                    embedder_model: env_or("OLLAMA_EMBEDDER_MODEL", &d.embedder_model),
                    neo4j_url: env_or("NEO4J_URL", &d.neo4j_url),
                    neo4j_user: env_or("NEO4J_USER", &d.neo4j_user),
                    neo4j_password: env_or("NEO4J_PASSWORD", &d.neo4j_password),
                }))
            }
            "vector" | "openai" | "pgvector" => {
                let d = OpenAiPgvectorConfig::default();
                Ok(BackendConfig::Vector(OpenAiPgvectorConfig {
                    api_key: env_or("OPENAI_API_KEY", &d.api_key),
                    llm_model: env_or("OPENAI_LLM_MODEL", &d.llm_model),
                    llm_temperature: env_parse("OPENAI_LLM_TEMPERATURE", d.llm_temperature)?,
                    llm_max_tokens: env_parse("OPENAI_LLM_MAX_TOKENS", d.llm_max_tokens)?,
                    embedding_model: env_or("OPENAI_EMBEDDING_MODEL", &d.embedding_model),
                    pg_host: env_or("POSTGRESQL_HOST", &d.pg_host),
                    pg_port: env_parse("POSTGRESQL_PORT", d.pg_port)?,
                    pg_user: env_or("POSTGRESQL_USER", &d.pg_user),
                    pg_password: env_or("POSTGRESQL_PWD", &d.pg_password),
                    pg_database: env_or("POSTGRESQL_DB_NAME", &d.pg_database),
                    embedding_dims: env_parse("VECTOR_STORE_EMBEDDING_DIMS", d.embedding_dims)?,
                }))
            }
            "memory" | "in-memory" => Ok(BackendConfig::Memory),
            other => Err(FilterError::Configuration(format!(
                "unknown MEMORY_BACKEND {:?} (expected graph, vector or memory)",
                other
            ))),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            BackendConfig::Graph(_) => "ollama+neo4j",
            BackendConfig::Vector(_) => "openai+pgvector",
            BackendConfig::Memory => "in-memory",
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            BackendConfig::Graph(c) => {
                require("OLLAMA_LLM_MODEL", &c.llm_model)?;
                require("OLLAMA_EMBEDDER_MODEL", &c.embedder_model)?;
                require("NEO4J_URL", &c.neo4j_url)?;
                require("NEO4J_USER", &c.neo4j_user)?;
                Ok(())
            }
            BackendConfig::Vector(c) => {
                require("OPENAI_API_KEY", &c.api_key)?;
                require("OPENAI_LLM_MODEL", &c.llm_model)?;
                require("OPENAI_EMBEDDING_MODEL", &c.embedding_model)?;
                require("POSTGRESQL_HOST", &c.pg_host)?;
                if c.embedding_dims == 0 {
                    return Err(FilterError::Configuration(
                        "VECTOR_STORE_EMBEDDING_DIMS must be positive".to_string(),
                    ));
                }
                Ok(())
            }
            BackendConfig::Memory => Ok(()),
        }
    }

    /// Provider document understood by the memory framework
    pub fn provider_document(&self) -> Value {
        match self {
            BackendConfig::Graph(c) => json!({
                "embedder": {
                    "provider": "ollama",
                    "config": { "model": c.embedder_model }
                },
                "graph_store": {
                    "provider": "neo4j",
                    "config": {
                        "url": c.neo4j_url,
                        "username": c.neo4j_user,
                        "password": c.neo4j_password,
                    }
                },
                "llm": {
                    "provider": "ollama",
                    "config": {
                        "model": c.llm_model,
                        "temperature": c.llm_temperature,
                        "max_tokens": c.llm_max_tokens,
                        "ollama_base_url": c.llm_url,
                    }
                },
                "version": "v1.1"
            }),
            BackendConfig::Vector(c) => json!({
                "vector_store": {
                    "provider": "pgvector",
                    "config": {
                        "host": c.pg_host,
                        "port": c.pg_port,
                        "user": c.pg_user,
                        "password": c.pg_password,
                        "dbname": c.pg_database,
                        "embedding_model_dims": c.embedding_dims,
                    }
                },
                "llm": {
                    "provider": "openai",
                    "config": {
                        "model": c.llm_model,
                        "temperature": c.llm_temperature,
                        "max_tokens": c.llm_max_tokens,
                        "api_key": c.api_key,
                    }
                },
                "embedder": {
                    "provider": "openai",
                    "config": {
                        "model": c.embedding_model,
                        "api_key": c.api_key,
                        "embedding_dims": c.embedding_dims,
                    }
                }
            }),
            BackendConfig::Memory => Value::Null,
        }
    }

    /// Metadata attached to every flushed batch
    pub fn flush_metadata(&self) -> Option<Map<String, Value>> {
        match self {
            BackendConfig::Vector(_) => {
                let mut metadata = Map::new();
                metadata.insert("category".to_string(), json!("conversation"));
                Some(metadata)
            }
            BackendConfig::Graph(_) | BackendConfig::Memory => None,
        }
    }

    /// Copy safe to expose over the API
    pub fn redacted(&self) -> Self {
        match self {
            BackendConfig::Graph(c) => BackendConfig::Graph(OllamaNeo4jConfig {
                neo4j_password: REDACTED.to_string(),
                ..c.clone()
            }),
            BackendConfig::Vector(c) => BackendConfig::Vector(OpenAiPgvectorConfig {
                api_key: if c.api_key.is_empty() {
                    String::new()
                } else {
                    REDACTED.to_string()
                },
                pg_password: REDACTED.to_string(),
                ..c.clone()
            }),
            BackendConfig::Memory => BackendConfig::Memory,
        }
    }

    /// Non-fatal startup checks. Only the vector backend has one: a
    /// `SELECT 1` against its PostgreSQL database.
    pub async fn run_diagnostics(&self, timeout: Duration) -> Result<()> {
        match self {
            BackendConfig::Vector(c) => probe_postgres(c, timeout).await,
            BackendConfig::Graph(_) | BackendConfig::Memory => Ok(()),
        }
    }
}

fn require(key: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        Err(FilterError::Configuration(format!("{} is not set", key)))
    } else {
        Ok(())
    }
}

async fn probe_postgres(config: &OpenAiPgvectorConfig, timeout: Duration) -> Result<()> {
    let options = PgConnectOptions::new()
        .host(&config.pg_host)
        .port(config.pg_port)
        .username(&config.pg_user)
        .password(&config.pg_password)
        .database(&config.pg_database);

    let pool = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(timeout)
        .connect_with(options)
        .await?;

    let one: i32 = sqlx::query_scalar("SELECT 1").fetch_one(&pool).await?;
    pool.close().await;

    if one == 1 {
        info!(host = %config.pg_host, port = config.pg_port, "PostgreSQL connection test successful");
        Ok(())
    } else {
        Err(FilterError::StoreUnavailable(format!(
            "PostgreSQL connection test returned {}",
            one
        )))
    }
}

// =============================
// Store connectors
// =============================

/// Builds a usable memory store handle
#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn MemoryStore>>;
}

/// Connects to a mem0-compatible server and pushes the backend document
pub struct Mem0Connector {
    backend: BackendConfig,
    base_url: String,
    timeout: Duration,
}

impl Mem0Connector {
    pub fn new(backend: BackendConfig, base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            backend,
            base_url: base_url.into(),
            timeout,
        }
    }

    pub fn from_env(backend: BackendConfig, timeout: Duration) -> Self {
        Self::new(backend, env_or("MEM0_BASE_URL", DEFAULT_MEM0_BASE_URL), timeout)
    }
}

#[async_trait]
impl StoreConnector for Mem0Connector {
    async fn connect(&self) -> Result<Arc<dyn MemoryStore>> {
        self.backend.validate()?;

        let store = Mem0HttpStore::new(&self.base_url, self.timeout)?;
        store.configure(&self.backend.provider_document()).await?;

        info!(
            backend = self.backend.label(),
            base_url = %store.base_url(),
            "Memory store initialized"
        );
        Ok(Arc::new(store))
    }
}

/// Hands out one pre-built store
pub struct StaticConnector {
    store: Arc<dyn MemoryStore>,
}

impl StaticConnector {
    pub fn new(store: Arc<dyn MemoryStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl StoreConnector for StaticConnector {
    async fn connect(&self) -> Result<Arc<dyn MemoryStore>> {
        Ok(Arc::clone(&self.store))
    }
}

/// Pick the connector for a backend configuration
pub fn connector_for(backend: &BackendConfig, timeout: Duration) -> Arc<dyn StoreConnector> {
    match backend {
        BackendConfig::Memory => {
            warn!("Using in-process memory store; memories are lost on restart");
            Arc::new(StaticConnector::new(Arc::new(
                crate::memory::store::InMemoryMemoryStore::new(),
            )))
        }
        other => Arc::new(Mem0Connector::from_env(other.clone(), timeout)),
    }
}
