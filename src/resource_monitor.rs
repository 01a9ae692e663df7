//! Periodic CPU/heap sampling, spec §4.4. Distinct from the Timeout
//! Manager: this component samples on its own cadence (20ms default) and
//! only disposes the isolate itself at the memory-critical threshold
//! (DESIGN.md Open Question 2); the 80/95% crossings are warning events a
//! caller can choose to act on.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use deno_core::v8;

use crate::events::{EventBus, ResourceWarning, ResourceWarningKind, SandboxEvent};
use crate::isolate::IsolateHeapStats;
use crate::termination::{ContextHandle, TerminationReason};

#[derive(Debug, Clone, Copy, Default, serde::Serialize, serde::Deserialize)]
pub struct ResourceSnapshot {
    pub cpu_time_ms: u64,
    pub wall_time_ms: u64,
    pub heap_used_bytes: u64,
    pub heap_limit_bytes: u64,
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ResourceStats {
    pub peak_cpu_ms: u64,
    pub final_cpu_ms: u64,
    pub peak_heap_bytes: u64,
    pub final_heap_bytes: u64,
    pub samples: u64,
}

struct Shared {
    cpu_time_ms: AtomicU64,
    wall_start: Instant,
    heap_used_bytes: AtomicU64,
    heap_limit_bytes: AtomicU64,
    peak_cpu_ms: AtomicU64,
    peak_heap_bytes: AtomicU64,
    samples: AtomicU64,
    warned_cpu_80: AtomicBool,
    warned_cpu_95: AtomicBool,
    warned_mem_80: AtomicBool,
    warned_mem_95: AtomicBool,
    stop: AtomicBool,
}

impl Shared {
    fn record_heap(&self, stats: IsolateHeapStats) {
        self.heap_used_bytes
            .store(stats.used_heap_size as u64, Ordering::Relaxed);
        self.heap_limit_bytes
            .store(stats.heap_size_limit as u64, Ordering::Relaxed);
        let used = stats.used_heap_size as u64;
        let mut peak = self.peak_heap_bytes.load(Ordering::Relaxed);
        while used > peak {
            match self.peak_heap_bytes.compare_exchange_weak(
                peak,
                used,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(p) => peak = p,
            }
        }
    }
}

pub struct ResourceMonitorConfig {
    pub sampling_interval_ms: u64,
    pub cpu_time_limit_ms: Option<u64>,
    pub memory_limit_bytes: u64,
    /// Fraction of `memory_limit_bytes` at which the monitor disposes the
    /// isolate itself, rather than merely warning. DESIGN.md Open Question 2.
    pub memory_critical_fraction: f64,
}

impl Default for ResourceMonitorConfig {
    fn default() -> Self {
        Self {
            sampling_interval_ms: 20,
            cpu_time_limit_ms: None,
            memory_limit_bytes: 64 << 20,
            memory_critical_fraction: 0.99,
        }
    }
}

/// A handle to one run's live resource sampling. Produced by
/// [`ResourceMonitor::start`]; call [`Self::snapshot`] as needed and
/// [`Self::finish`] once the run completes to get final [`ResourceStats`].
pub struct ResourceMonitorHandle {
    shared: Arc<Shared>,
    execution_id: u64,
}

impl ResourceMonitorHandle {
    pub fn cpu_time_ms(&self) -> u64 {
        self.shared.cpu_time_ms.load(Ordering::Relaxed)
    }

    /// Called by the execution engine after a V8 call with that call's
    /// incremental CPU time; the monitor's own background task otherwise
    /// has no way to attribute CPU usage precisely to this isolate.
    pub fn record_cpu_time(&self, cpu_ms: u64) {
        self.shared.cpu_time_ms.store(cpu_ms, Ordering::Relaxed);
        let mut peak = self.shared.peak_cpu_ms.load(Ordering::Relaxed);
        while cpu_ms > peak {
            match self.shared.peak_cpu_ms.compare_exchange_weak(
                peak,
                cpu_ms,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(p) => peak = p,
            }
        }
    }

    pub fn record_heap_stats(&self, stats: IsolateHeapStats) {
        self.shared.record_heap(stats);
    }

    /// spec §3: `cpuPercent = cpuTimeMs / max(wallTimeMs, ε)`; `memoryPercent`
    /// follows the same shape against the configured heap limit.
    pub fn snapshot(&self) -> ResourceSnapshot {
        const EPSILON_MS: f64 = 1.0;
        let cpu_time_ms = self.shared.cpu_time_ms.load(Ordering::Relaxed);
        let wall_time_ms = self.shared.wall_start.elapsed().as_millis() as u64;
        let heap_used_bytes = self.shared.heap_used_bytes.load(Ordering::Relaxed);
        let heap_limit_bytes = self.shared.heap_limit_bytes.load(Ordering::Relaxed);
        let cpu_percent = cpu_time_ms as f64 / (wall_time_ms as f64).max(EPSILON_MS);
        let memory_percent = if heap_limit_bytes == 0 {
            0.0
        } else {
            heap_used_bytes as f64 / heap_limit_bytes as f64
        };
        ResourceSnapshot {
            cpu_time_ms,
            wall_time_ms,
            heap_used_bytes,
            heap_limit_bytes,
            cpu_percent,
            memory_percent,
        }
    }

    pub fn within_limits(&self, config: &ResourceMonitorConfig) -> bool {
        let heap_used = self.shared.heap_used_bytes.load(Ordering::Relaxed);
        let under_memory = (heap_used as f64) < config.memory_limit_bytes as f64;
        let under_cpu = match config.cpu_time_limit_ms {
            None => true,
            Some(limit) => self.shared.cpu_time_ms.load(Ordering::Relaxed) < limit,
        };
        under_memory && under_cpu
    }

    pub fn finish(self) -> ResourceStats {
        self.shared.stop.store(true, Ordering::SeqCst);
        ResourceStats {
            peak_cpu_ms: self.shared.peak_cpu_ms.load(Ordering::Relaxed),
            final_cpu_ms: self.shared.cpu_time_ms.load(Ordering::Relaxed),
            peak_heap_bytes: self.shared.peak_heap_bytes.load(Ordering::Relaxed),
            final_heap_bytes: self.shared.heap_used_bytes.load(Ordering::Relaxed),
            samples: self.shared.samples.load(Ordering::Relaxed),
        }
    }

    pub fn execution_id(&self) -> u64 {
        self.execution_id
    }
}

#[derive(Default)]
pub struct ResourceMonitor {
    next_id: AtomicU64,
}

impl ResourceMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts background sampling against `context`, publishing
    /// `resource-warning` events and, at the memory-critical threshold,
    /// disposing the isolate with [`TerminationReason::ResourceMonitorMemoryCritical`].
    pub fn start(
        &self,
        execution_id: u64,
        context: ContextHandle,
        config: ResourceMonitorConfig,
        events: EventBus,
    ) -> ResourceMonitorHandle {
        let shared = Arc::new(Shared {
            cpu_time_ms: AtomicU64::new(0),
            wall_start: Instant::now(),
            heap_used_bytes: AtomicU64::new(0),
            heap_limit_bytes: AtomicU64::new(config.memory_limit_bytes),
            peak_cpu_ms: AtomicU64::new(0),
            peak_heap_bytes: AtomicU64::new(0),
            samples: AtomicU64::new(0),
            warned_cpu_80: AtomicBool::new(false),
            warned_cpu_95: AtomicBool::new(false),
            warned_mem_80: AtomicBool::new(false),
            warned_mem_95: AtomicBool::new(false),
            stop: AtomicBool::new(false),
        });

        tokio::spawn(Self::sample_loop(
            execution_id,
            context,
            config,
            events,
            shared.clone(),
        ));

        ResourceMonitorHandle {
            shared,
            execution_id,
        }
    }

    async fn sample_loop(
        execution_id: u64,
        context: ContextHandle,
        config: ResourceMonitorConfig,
        events: EventBus,
        shared: Arc<Shared>,
    ) {
        let mut ticker = tokio::time::interval(Duration::from_millis(config.sampling_interval_ms));
        loop {
            ticker.tick().await;
            if shared.stop.load(Ordering::SeqCst) {
                return;
            }
            shared.samples.fetch_add(1, Ordering::Relaxed);

            // `v8::Isolate` isn't reachable from this task while the guest
            // may be running synchronously on the isolate's own worker
            // thread, so heap stats can only be refreshed via an interrupt
            // dispatched to that thread. The interrupt callback both
            // records the sample and does the threshold checks itself,
            // since by the time it runs it has the only fresh reading.
            let memory_limit_bytes = config.memory_limit_bytes;
            let memory_critical_fraction = config.memory_critical_fraction;
            let interrupt_shared = shared.clone();
            let interrupt_events = events.clone();
            let interrupt_context = context.clone();
            context.request_interrupt(move |isolate| {
                let mut stats = v8::HeapStatistics::default();
                isolate.get_heap_statistics(&mut stats);
                interrupt_shared.record_heap(stats.into());

                let heap_used = interrupt_shared.heap_used_bytes.load(Ordering::Relaxed);
                let memory_fraction = heap_used as f64 / memory_limit_bytes as f64;

                warn_once(
                    &interrupt_shared.warned_mem_80,
                    memory_fraction >= 0.8,
                    execution_id,
                    ResourceWarningKind::MemoryWarning80,
                    &interrupt_events,
                );
                warn_once(
                    &interrupt_shared.warned_mem_95,
                    memory_fraction >= 0.95,
                    execution_id,
                    ResourceWarningKind::MemoryWarning95,
                    &interrupt_events,
                );

                if memory_fraction >= memory_critical_fraction {
                    interrupt_context.terminate(TerminationReason::ResourceMonitorMemoryCritical);
                }
            });

            if let Some(cpu_limit) = config.cpu_time_limit_ms {
                let cpu_ms = shared.cpu_time_ms.load(Ordering::Relaxed);
                let cpu_fraction = cpu_ms as f64 / cpu_limit as f64;
                warn_once(
                    &shared.warned_cpu_80,
                    cpu_fraction >= 0.8,
                    execution_id,
                    ResourceWarningKind::CpuWarning80,
                    &events,
                );
                warn_once(
                    &shared.warned_cpu_95,
                    cpu_fraction >= 0.95,
                    execution_id,
                    ResourceWarningKind::CpuWarning95,
                    &events,
                );
            }
        }
    }
}

fn warn_once(
    flag: &AtomicBool,
    condition: bool,
    execution_id: u64,
    kind: ResourceWarningKind,
    events: &EventBus,
) {
    if condition && !flag.swap(true, Ordering::SeqCst) {
        events.publish(SandboxEvent::ResourceWarning(ResourceWarning {
            execution_id,
            kind,
        }));
    }
}
