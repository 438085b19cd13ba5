/*!
 * Runtime Configuration
 *
 * Sizing of the virtual CPU pool, worker pool, and proxy frame limits.
 * Values come from defaults, environment overrides, or JSON.
 */

use super::limits::{
    DEFAULT_MAX_FRAME_LEN, DEFAULT_MAX_IDLE_WORKERS, DEFAULT_WORKER_SOFT_CAP, MAX_VCPUS, MIN_VCPUS,
};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::warn;

/// Runtime configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct RuntimeConfig {
    /// Number of virtual CPUs (admission slots)
    pub ncpu: usize,
    /// Idle workers kept parked for reuse
    pub max_idle_workers: usize,
    /// Live worker count that triggers a warning when exceeded
    pub worker_soft_cap: usize,
    /// Largest accepted RPC frame in bytes
    pub max_frame_len: usize,
    /// Prefix for host thread names
    pub thread_name: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let ncpu = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(MIN_VCPUS);

        Self {
            ncpu: ncpu.clamp(MIN_VCPUS, MAX_VCPUS),
            max_idle_workers: DEFAULT_MAX_IDLE_WORKERS,
            worker_soft_cap: DEFAULT_WORKER_SOFT_CAP,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            thread_name: "anykernel".to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by environment variables
    ///
    /// Environment variables:
    /// - ANYKERNEL_NCPU: virtual CPU count
    /// - ANYKERNEL_IDLE_WORKERS: idle worker limit
    /// - ANYKERNEL_WORKER_SOFT_CAP: worker warning threshold
    /// - ANYKERNEL_MAX_FRAME: max RPC frame size in bytes
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(ncpu) = env_override("ANYKERNEL_NCPU") {
            config.ncpu = ncpu;
        }
        if let Some(idle) = env_override("ANYKERNEL_IDLE_WORKERS") {
            config.max_idle_workers = idle;
        }
        if let Some(cap) = env_override("ANYKERNEL_WORKER_SOFT_CAP") {
            config.worker_soft_cap = cap;
        }
        if let Some(max) = env_override("ANYKERNEL_MAX_FRAME") {
            config.max_frame_len = max;
        }
        config.normalized()
    }

    /// Parse a JSON configuration; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str::<Self>(json).map(Self::normalized)
    }

    #[must_use]
    pub fn with_ncpu(mut self, ncpu: usize) -> Self {
        self.ncpu = ncpu;
        self.normalized()
    }

    #[must_use]
    pub fn with_max_idle_workers(mut self, max_idle: usize) -> Self {
        self.max_idle_workers = max_idle;
        self
    }

    #[must_use]
    pub fn with_worker_soft_cap(mut self, cap: usize) -> Self {
        self.worker_soft_cap = cap;
        self
    }

    #[must_use]
    pub fn with_max_frame_len(mut self, max: usize) -> Self {
        self.max_frame_len = max;
        self
    }

    #[must_use]
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    fn normalized(mut self) -> Self {
        self.ncpu = self.ncpu.clamp(MIN_VCPUS, MAX_VCPUS);
        self
    }
}

fn env_override<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring malformed configuration override");
            None
        }
    }
}
