//! Process-wide defaults, SPEC_FULL.md §A.3. `KernelConfig` is built
//! programmatically (`Default` plus builder methods) the way the teacher's
//! `IsolateConfig` is; loading it from a file or environment beyond the
//! single `LOG_LEVEL` variable is out of scope per spec.md §1.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelConfig {
    pub max_isolates: usize,
    pub min_idle_isolates: usize,
    pub max_concurrency: usize,
    pub default_memory_limit_bytes: u64,
    pub watchdog_tick_interval_ms: u64,
    pub resource_sampling_interval_ms: u64,
    pub min_detection_ms: u64,
    pub infinite_loop_threshold: f64,
    pub memory_critical_fraction: f64,
    pub vfs_default_quota_bytes: u64,
    pub session_sweep_interval_ms: u64,
    pub allow_builtins: bool,
    pub allow_timers: bool,
    pub filesystem_enabled: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            max_isolates: 16,
            min_idle_isolates: 1,
            max_concurrency: 16,
            default_memory_limit_bytes: 64 << 20,
            watchdog_tick_interval_ms: 10,
            resource_sampling_interval_ms: 20,
            min_detection_ms: 100,
            infinite_loop_threshold: 0.95,
            memory_critical_fraction: 0.99,
            vfs_default_quota_bytes: 10 << 20,
            session_sweep_interval_ms: 30_000,
            allow_builtins: false,
            allow_timers: false,
            filesystem_enabled: false,
        }
    }
}

impl KernelConfig {
    pub fn with_max_isolates(mut self, max_isolates: usize) -> Self {
        self.max_isolates = max_isolates;
        self
    }

    pub fn with_min_idle_isolates(mut self, min_idle_isolates: usize) -> Self {
        self.min_idle_isolates = min_idle_isolates;
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn with_default_memory_limit_bytes(mut self, bytes: u64) -> Self {
        self.default_memory_limit_bytes = bytes;
        self
    }

    pub fn with_vfs_default_quota_bytes(mut self, bytes: u64) -> Self {
        self.vfs_default_quota_bytes = bytes;
        self
    }

    pub fn with_filesystem_enabled(mut self, enabled: bool) -> Self {
        self.filesystem_enabled = enabled;
        self
    }

    pub fn with_allow_timers(mut self, enabled: bool) -> Self {
        self.allow_timers = enabled;
        self
    }

    pub fn with_allow_builtins(mut self, enabled: bool) -> Self {
        self.allow_builtins = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_methods_override_defaults() {
        let config = KernelConfig::default()
            .with_max_isolates(4)
            .with_filesystem_enabled(true);
        assert_eq!(config.max_isolates, 4);
        assert!(config.filesystem_enabled);
        assert_eq!(config.min_idle_isolates, 1);
    }
}
