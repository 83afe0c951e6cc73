//! HTTP client for a mem0-compatible memory server
//!
//! The server owns the embedder, language model and graph/vector store. It is
//! configured once per connection with the backend document built from
//! `BackendConfig`, then used through `/memories` and `/search`.

use crate::error::FilterError;
use crate::memory::store::{normalize_search_response, MemoryRecord, MemoryStore};
use crate::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::{debug, info};

pub const DEFAULT_MEM0_BASE_URL: &str = "http://127.0.0.1:8000";

/// Which operation a failed response belongs to
#[derive(Debug, Clone, Copy)]
enum Operation {
    Configure,
    Add,
    Search,
}

impl Operation {
    fn failure(self, message: String) -> FilterError {
        match self {
            Operation::Configure => FilterError::Configuration(message),
            Operation::Add => FilterError::StoreWrite(message),
            Operation::Search => FilterError::StoreSearch(message),
        }
    }
}

#[derive(Debug, Serialize)]
struct AddRequest<'a> {
    messages: Vec<AddMessage<'a>>,
    user_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<&'a Map<String, Value>>,
}

#[derive(Debug, Serialize)]
struct AddMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct SearchRequest<'a> {
    query: &'a str,
    user_id: &'a str,
}

/// Connection-pooled client for the memory server
#[derive(Clone)]
pub struct Mem0HttpStore {
    client: Client,
    base_url: String,
}

impl Mem0HttpStore {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Push the provider configuration document to the server
    pub async fn configure(&self, document: &Value) -> Result<()> {
        self.post_json(Operation::Configure, "/configure", document).await?;
        info!(base_url = %self.base_url, "Memory server configured");
        Ok(())
    }

    async fn post_json<B: Serialize + ?Sized>(
        &self,
        op: Operation,
        path: &str,
        body: &B,
    ) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);

        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                FilterError::StoreUnavailable(format!(
                    "Memory server request failed for {}: {}",
                    path, e
                ))
            })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| {
            FilterError::StoreUnavailable(format!("Memory server read failed for {}: {}", path, e))
        })?;

        if !status.is_success() {
            return Err(op.failure(format!(
                "Memory server returned {} for {}: {}",
                status, path, text
            )));
        }

        if text.trim().is_empty() {
            return Ok(Value::Null);
        }

        serde_json::from_str(&text).map_err(|e| {
            op.failure(format!("Invalid JSON response from {}: {}", path, e))
        })
    }
}

#[async_trait]
impl MemoryStore for Mem0HttpStore {
    fn name(&self) -> &'static str {
        "mem0"
    }

    async fn add(
        &self,
        text: &str,
        user_id: &str,
        metadata: Option<&Map<String, Value>>,
    ) -> Result<()> {
        let request = AddRequest {
            messages: vec![AddMessage {
                role: "user",
                content: text,
            }],
            user_id,
            metadata,
        };

        let response = self.post_json(Operation::Add, "/memories", &request).await?;
        debug!("Memory server add response: {}", response);
        Ok(())
    }

    async fn search(&self, query: &str, user_id: &str) -> Result<Vec<MemoryRecord>> {
        let request = SearchRequest { query, user_id };
        let response = self.post_json(Operation::Search, "/search", &request).await?;

        if response.is_null() {
            return Ok(Vec::new());
        }
        normalize_search_response(response)
    }
}
