//! Filter configuration ("valves")
//!
//! Every option has a default and can be overridden from the environment
//! (or a `.env` file loaded by the binaries).

use crate::error::FilterError;
use crate::memory::guard::DEFAULT_MAX_PENDING_FLUSHES;
use crate::Result;
use serde::Serialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Tunables for accumulation, recall and store access
#[derive(Debug, Clone, Serialize)]
pub struct FilterConfig {
    /// Pipelines this filter attaches to (`*` for all)
    pub pipelines: Vec<String>,
    pub priority: i32,
    /// Messages accumulated before a flush
    pub store_cycles: usize,
    /// User identity passed to the memory store
    pub user_id: String,
    /// How many search results are considered for injection
    pub memories_to_use: usize,
    /// Write flushes on a background task
    pub async_flush: bool,
    /// Background flushes allowed to queue before the inlet waits
    pub max_pending_flushes: usize,
    pub store_timeout_secs: u64,
    /// Probe the store on every request and rebuild it on failure
    pub verify_store_on_request: bool,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            pipelines: vec!["*".to_string()],
            priority: 0,
            store_cycles: 5,
            user_id: "user".to_string(),
            memories_to_use: 5,
            async_flush: true,
            max_pending_flushes: DEFAULT_MAX_PENDING_FLUSHES,
            store_timeout_secs: 30,
            verify_store_on_request: false,
        }
    }
}

impl FilterConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let config = Self {
            pipelines: env::var("PIPELINES")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|p| !p.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or(defaults.pipelines),
            priority: env_parse("PRIORITY", defaults.priority)?,
            store_cycles: env_parse("STORE_CYCLES", defaults.store_cycles)?,
            user_id: env_or("MEM_ZERO_USER", &defaults.user_id),
            memories_to_use: env_parse(
                "DEFINE_NUMBER_OF_MEMORIES_TO_USE",
                defaults.memories_to_use,
            )?,
            async_flush: env_flag("ASYNC_FLUSH", defaults.async_flush)?,
            max_pending_flushes: env_parse(
                "MAX_PENDING_FLUSHES",
                defaults.max_pending_flushes,
            )?,
            store_timeout_secs: env_parse("STORE_TIMEOUT_SECS", defaults.store_timeout_secs)?,
            verify_store_on_request: env_flag(
                "VERIFY_STORE_ON_REQUEST",
                defaults.verify_store_on_request,
            )?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.store_cycles == 0 {
            return Err(FilterError::Configuration(
                "STORE_CYCLES must be at least 1".to_string(),
            ));
        }
        if self.user_id.trim().is_empty() {
            return Err(FilterError::Configuration(
                "MEM_ZERO_USER must not be empty".to_string(),
            ));
        }
        if self.max_pending_flushes == 0 {
            return Err(FilterError::Configuration(
                "MAX_PENDING_FLUSHES must be at least 1".to_string(),
            ));
        }
        if self.store_timeout_secs == 0 {
            return Err(FilterError::Configuration(
                "STORE_TIMEOUT_SECS must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs)
    }
}

// =============================
// Environment helpers
// =============================

pub(crate) fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

pub(crate) fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw.trim().parse().map_err(|e| {
            FilterError::Configuration(format!("{} has invalid value {:?}: {}", key, raw, e))
        }),
        _ => Ok(default),
    }
}

pub(crate) fn env_flag(key: &str, default: bool) -> Result<bool> {
    match env::var(key) {
        Ok(raw) => parse_flag(&raw).ok_or_else(|| {
            FilterError::Configuration(format!("{} must be a boolean, got {:?}", key, raw))
        }),
        Err(_) => Ok(default),
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
