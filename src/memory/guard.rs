//! Flush dispatch and write serialization
//!
//! Every write of accumulated messages goes through a `FlushGuard`, which
//! holds one write lock per filter instance. Store failures end here: they are
//! logged and counted, never returned to the request path. The accumulator is
//! already drained by then, so a failed write loses that batch.
//!
//! Background mode holds at most `max_pending` queued or running flushes.
//! Once that many are outstanding, `run_flush` waits for one to finish.

use crate::memory::store::{bounded, MemoryStore};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const DEFAULT_MAX_PENDING_FLUSHES: usize = 16;

/// Snapshot of drained messages handed to the store
#[derive(Debug, Clone)]
pub struct FlushJob {
    pub job_id: Uuid,
    pub text: String,
    pub user_id: String,
    pub metadata: Option<Map<String, Value>>,
    pub created_at: DateTime<Utc>,
}

impl FlushJob {
    pub fn new(text: String, user_id: String, metadata: Option<Map<String, Value>>) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            text,
            user_id,
            metadata,
            created_at: Utc::now(),
        }
    }

    /// Short SHA-256 fingerprint of the text, for logs
    pub fn digest(&self) -> String {
        text_digest(&self.text)
    }
}

pub(crate) fn text_digest(text: &str) -> String {
    let hash = Sha256::digest(text.as_bytes());
    hex::encode(&hash[..6])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Write before the inlet returns
    Inline,
    /// Write on a spawned task; the inlet returns immediately
    Background,
}

impl FlushMode {
    pub fn from_async_flag(async_flush: bool) -> Self {
        if async_flush {
            FlushMode::Background
        } else {
            FlushMode::Inline
        }
    }
}

#[derive(Default)]
struct FlushCounters {
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Serializes memory store writes for one filter instance
pub struct FlushGuard {
    mode: FlushMode,
    timeout: Duration,
    write_lock: Arc<Mutex<()>>,
    last_dispatch: Mutex<Option<JoinHandle<()>>>,
    max_pending: usize,
    pending: Arc<Semaphore>,
    counters: Arc<FlushCounters>,
}

impl FlushGuard {
    pub fn new(mode: FlushMode, timeout: Duration) -> Self {
        Self {
            mode,
            timeout,
            write_lock: Arc::new(Mutex::new(())),
            last_dispatch: Mutex::new(None),
            max_pending: DEFAULT_MAX_PENDING_FLUSHES,
            pending: Arc::new(Semaphore::new(DEFAULT_MAX_PENDING_FLUSHES)),
            counters: Arc::new(FlushCounters::default()),
        }
    }

    /// Cap on outstanding background flushes (at least 1)
    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        let max_pending = max_pending.max(1);
        self.max_pending = max_pending;
        self.pending = Arc::new(Semaphore::new(max_pending));
        self
    }

    /// Background flushes queued or running
    pub fn pending_flushes(&self) -> usize {
        self.max_pending - self.pending.available_permits()
    }

    /// Write `job` once no other write is in flight.
    ///
    /// In background mode the write is spawned and chained behind the previous
    /// dispatch, so batches reach the store in the order they were drained.
    /// With `max_pending` flushes outstanding it first waits for a free slot.
    pub async fn run_flush(&self, store: Arc<dyn MemoryStore>, job: FlushJob) {
        info!(
            job_id = %job.job_id,
            user_id = %job.user_id,
            digest = %job.digest(),
            mode = ?self.mode,
            "Dispatching memory flush"
        );
        debug!(job_id = %job.job_id, "Flush text: {}", job.text);

        match self.mode {
            FlushMode::Inline => {
                write_job(&self.write_lock, store, job, self.timeout, &self.counters).await;
            }
            FlushMode::Background => {
                let permit = match Arc::clone(&self.pending).try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!(
                            job_id = %job.job_id,
                            max_pending = self.max_pending,
                            "Memory flush queue full, waiting for a slot"
                        );
                        match Arc::clone(&self.pending).acquire_owned().await {
                            Ok(permit) => permit,
                            Err(e) => {
                                self.counters.failed.fetch_add(1, Ordering::SeqCst);
                                error!(
                                    job_id = %job.job_id,
                                    "Memory flush queue closed, batch dropped: {}",
                                    e
                                );
                                return;
                            }
                        }
                    }
                };

                let mut last = self.last_dispatch.lock().await;
                let previous = last.take();
                let write_lock = Arc::clone(&self.write_lock);
                let counters = Arc::clone(&self.counters);
                let timeout = self.timeout;

                *last = Some(tokio::spawn(async move {
                    if let Some(previous) = previous {
                        if !previous.is_finished() {
                            debug!("Waiting for previous memory flush to finish");
                        }
                        if let Err(e) = previous.await {
                            warn!("Previous memory flush task ended abnormally: {}", e);
                        }
                    }
                    write_job(&write_lock, store, job, timeout, &counters).await;
                    drop(permit);
                }));
            }
        }
    }

    /// Wait for the most recently dispatched background flush (and so every
    /// flush chained before it).
    pub async fn wait_idle(&self) {
        let handle = self.last_dispatch.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Memory flush task ended abnormally: {}", e);
            }
        }
    }

    pub fn flushes_completed(&self) -> u64 {
        self.counters.completed.load(Ordering::SeqCst)
    }

    pub fn flushes_failed(&self) -> u64 {
        self.counters.failed.load(Ordering::SeqCst)
    }
}

async fn write_job(
    write_lock: &Mutex<()>,
    store: Arc<dyn MemoryStore>,
    job: FlushJob,
    timeout: Duration,
    counters: &FlushCounters,
) {
    let _held = write_lock.lock().await;

    let outcome = bounded(
        timeout,
        store.add(&job.text, &job.user_id, job.metadata.as_ref()),
    )
    .await;

    match outcome {
        Ok(()) => {
            counters.completed.fetch_add(1, Ordering::SeqCst);
            info!(
                job_id = %job.job_id,
                store = store.name(),
                "Stored accumulated messages in memory"
            );
        }
        Err(e) => {
            counters.failed.fetch_add(1, Ordering::SeqCst);
            error!(
                job_id = %job.job_id,
                store = store.name(),
                "Error adding memory, batch dropped: {}",
                e
            );
        }
    }
}
