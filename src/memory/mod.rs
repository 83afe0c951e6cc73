//! Long-term memory for the chat filter
//!
//! Accumulates user messages, flushes them to a memory store in batches,
//! and injects retrieved memories back into outgoing requests.

pub mod accumulator;
pub mod guard;
pub mod injector;
pub mod mem0;
pub mod store;

pub use accumulator::MessageAccumulator;
pub use guard::{FlushGuard, FlushJob, FlushMode};
pub use injector::ContextInjector;
pub use mem0::Mem0HttpStore;
pub use store::{bounded, InMemoryMemoryStore, MemoryRecord, MemoryStore};
