//! Memory Filter Pipeline
//!
//! A chat pipeline filter that gives the model long-term memory:
//! - Accumulates user messages per conversation
//! - Flushes every `STORE_CYCLES` messages into a memory store as one memory
//! - Serializes store writes, optionally on a background task
//! - Recalls the top-k memories for the latest message and prepends them
//!   as a system message
//!
//! Storage, embedding and ranking are delegated to a memory server configured
//! for either Ollama + Neo4j or OpenAI + pgvector.
//!
//! INLET: PARSE → ACCUMULATE → FLUSH? → RECALL → INJECT → RETURN

pub mod api;
pub mod backend;
pub mod config;
pub mod error;
pub mod filter;
pub mod memory;
pub mod models;

pub use error::Result;

// Re-export common types
pub use backend::{BackendConfig, StoreConnector};
pub use config::FilterConfig;
pub use filter::{FilterSession, MemoryFilter};
pub use models::*;
