//! Prometheus registrations, mirroring the teacher's `metrics.rs` wrapper
//! module but against the real crates.io `prometheus` crate (the teacher's
//! `register_convex_histogram!`/`register_convex_counter!` macros wrap an
//! internal git-forked client that isn't fetchable here; see DESIGN.md).

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};

pub static ISOLATES_ACTIVE: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "sandbox_kernel_isolates_active",
        "Number of isolates currently checked out of the pool"
    )
    .expect("metric registration should not collide")
});

pub static ISOLATES_IDLE: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "sandbox_kernel_isolates_idle",
        "Number of idle isolates sitting in the pool"
    )
    .expect("metric registration should not collide")
});

pub static ISOLATES_CREATED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "sandbox_kernel_isolates_created_total",
        "Total isolates created since process start"
    )
    .expect("metric registration should not collide")
});

pub static ISOLATES_POISONED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "sandbox_kernel_isolates_poisoned_total",
        "Total isolates disposed due to a poisoning event"
    )
    .expect("metric registration should not collide")
});

pub static WATCHDOG_FIRES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "sandbox_kernel_watchdog_fires_total",
        "Watchdog terminations by reason",
        &["reason"]
    )
    .expect("metric registration should not collide")
});

pub static VFS_QUOTA_BYTES_USED: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "sandbox_kernel_vfs_quota_bytes_used",
        "Bytes currently charged against the virtual filesystem quota"
    )
    .expect("metric registration should not collide")
});

pub static MODULE_CACHE_HITS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "sandbox_kernel_module_cache_hits_total",
        "Module resolutions served from cache"
    )
    .expect("metric registration should not collide")
});

pub static MODULE_CACHE_MISSES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "sandbox_kernel_module_cache_misses_total",
        "Module resolutions that required loading"
    )
    .expect("metric registration should not collide")
});

pub static EXECUTION_DURATION_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "sandbox_kernel_execution_duration_seconds",
        "Wall-clock duration of a completed execution"
    )
    .expect("metric registration should not collide")
});

pub static CONCURRENCY_PERMIT_ACQUIRE_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "sandbox_kernel_concurrency_permit_acquire_seconds",
        "Time spent waiting for a concurrency permit"
    )
    .expect("metric registration should not collide")
});

pub struct Timer {
    start: std::time::Instant,
    histogram: &'static Lazy<Histogram>,
}

impl Timer {
    pub fn observe(self) {
        self.histogram.observe(self.start.elapsed().as_secs_f64());
    }
}

pub fn concurrency_permit_acquire_timer() -> Timer {
    Timer {
        start: std::time::Instant::now(),
        histogram: &CONCURRENCY_PERMIT_ACQUIRE_SECONDS,
    }
}

pub fn execution_duration_timer() -> Timer {
    Timer {
        start: std::time::Instant::now(),
        histogram: &EXECUTION_DURATION_SECONDS,
    }
}

pub fn log_watchdog_fire(reason: &str) {
    WATCHDOG_FIRES_TOTAL.with_label_values(&[reason]).inc();
}
