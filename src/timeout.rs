//! Wall-clock watchdog and infinite-loop heuristic, spec §3 `TimeoutHandle`
//! / §4.3 Timeout Manager. Ticks on a background `tokio` task, the way the
//! teacher's `Timeout::go` background job polls a deadline, but adds the
//! infinite-loop heuristic and warn-once-at-80% behavior the teacher's
//! simpler wall-clock-only timeout doesn't need.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::events::{EventBus, SandboxEvent, TimeoutEvent, TimeoutReason, TimeoutWarning, WarningSeverity};
use crate::termination::{ContextHandle, TerminationReason};

/// `Armed -> (Warned?) -> (Fired | Cleared)`, spec §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutState {
    Armed,
    Warned,
    Fired,
    Cleared,
}

pub struct TimeoutConfig {
    pub wall_timeout_ms: u64,
    /// Minimum elapsed time before the infinite-loop heuristic is allowed
    /// to fire; spec default 100ms.
    pub min_detection_ms: u64,
    /// cpu_ms / elapsed_ms ratio above which a run is considered a busy
    /// loop rather than legitimate CPU-bound work; spec default 0.95.
    pub infinite_loop_threshold: f64,
    /// How often the watchdog checks in; spec default 10ms.
    pub tick_interval_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            wall_timeout_ms: 5_000,
            min_detection_ms: 100,
            infinite_loop_threshold: 0.95,
            tick_interval_ms: 10,
        }
    }
}

struct Inner {
    state: TimeoutState,
    reason: Option<TerminationReason>,
}

/// A handle to one armed watchdog. `clear()` stops the background tick
/// without disposing the isolate (the run finished on its own); dropping
/// the handle without clearing leaves the background task running until
/// it fires or the isolate's context generation advances past it.
pub struct TimeoutHandle {
    id: u64,
    started_at: Instant,
    wall_timeout_ms: u64,
    inner: Arc<Mutex<Inner>>,
    stop: Arc<AtomicBool>,
    warned_rx: tokio::sync::watch::Receiver<bool>,
}

impl TimeoutHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn wall_timeout_ms(&self) -> u64 {
        self.wall_timeout_ms
    }

    pub fn state(&self) -> TimeoutState {
        self.inner.lock().state
    }

    pub fn triggered(&self) -> bool {
        matches!(self.inner.lock().state, TimeoutState::Fired)
    }

    pub fn warned(&self) -> bool {
        *self.warned_rx.borrow()
    }

    pub fn reason(&self) -> Option<TerminationReason> {
        self.inner.lock().reason.clone()
    }

    /// Stops the watchdog without disposing the isolate. Idempotent.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        if inner.state == TimeoutState::Fired {
            return;
        }
        inner.state = TimeoutState::Cleared;
        self.stop.store(true, Ordering::SeqCst);
    }
}

/// Supplies the watchdog with the run's current CPU time, sourced from
/// [`crate::resource_monitor::ResourceMonitor`]'s latest sample.
pub type CpuTimeSource = Arc<dyn Fn() -> u64 + Send + Sync>;

#[derive(Default)]
pub struct TimeoutManager {
    next_id: std::sync::atomic::AtomicU64,
}

impl TimeoutManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms a watchdog against `context` for `config.wall_timeout_ms`,
    /// querying `cpu_time_ms` each tick to evaluate the infinite-loop
    /// heuristic. Returns immediately; the watchdog runs on a spawned task.
    pub fn arm(
        &self,
        execution_id: u64,
        context: ContextHandle,
        config: TimeoutConfig,
        cpu_time_ms: CpuTimeSource,
        events: EventBus,
    ) -> TimeoutHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let started_at = Instant::now();
        let inner = Arc::new(Mutex::new(Inner {
            state: TimeoutState::Armed,
            reason: None,
        }));
        let stop = Arc::new(AtomicBool::new(false));
        let (warned_tx, warned_rx) = tokio::sync::watch::channel(false);

        let handle = TimeoutHandle {
            id,
            started_at,
            wall_timeout_ms: config.wall_timeout_ms,
            inner: inner.clone(),
            stop: stop.clone(),
            warned_rx,
        };

        tokio::spawn(Self::go(
            execution_id,
            context,
            config,
            cpu_time_ms,
            started_at,
            inner,
            stop,
            warned_tx,
            events,
        ));

        handle
    }

    #[allow(clippy::too_many_arguments)]
    async fn go(
        execution_id: u64,
        context: ContextHandle,
        config: TimeoutConfig,
        cpu_time_ms: CpuTimeSource,
        started_at: Instant,
        inner: Arc<Mutex<Inner>>,
        stop: Arc<AtomicBool>,
        warned_tx: tokio::sync::watch::Sender<bool>,
        events: EventBus,
    ) {
        let mut ticker = tokio::time::interval(Duration::from_millis(config.tick_interval_ms));
        loop {
            ticker.tick().await;
            if stop.load(Ordering::SeqCst) {
                return;
            }
            let elapsed_ms = started_at.elapsed().as_millis() as u64;

            if elapsed_ms >= config.wall_timeout_ms {
                let mut guard = inner.lock();
                if guard.state == TimeoutState::Fired || guard.state == TimeoutState::Cleared {
                    return;
                }
                guard.state = TimeoutState::Fired;
                guard.reason = Some(TerminationReason::UserTimeout {
                    wall_timeout_ms: config.wall_timeout_ms,
                });
                drop(guard);
                context.terminate(TerminationReason::UserTimeout {
                    wall_timeout_ms: config.wall_timeout_ms,
                });
                events.publish(SandboxEvent::Timeout(TimeoutEvent {
                    execution_id,
                    reason: TimeoutReason::WallClock,
                    elapsed_ms,
                }));
                return;
            }

            if elapsed_ms >= config.min_detection_ms {
                let cpu_ms = cpu_time_ms();
                let ratio = cpu_ms as f64 / elapsed_ms as f64;
                if ratio >= config.infinite_loop_threshold {
                    let mut guard = inner.lock();
                    if guard.state == TimeoutState::Fired || guard.state == TimeoutState::Cleared {
                        return;
                    }
                    guard.state = TimeoutState::Fired;
                    guard.reason = Some(TerminationReason::InfiniteLoop { cpu_ratio: ratio });
                    drop(guard);
                    context.terminate(TerminationReason::InfiniteLoop { cpu_ratio: ratio });
                    events.publish(SandboxEvent::Timeout(TimeoutEvent {
                        execution_id,
                        reason: TimeoutReason::InfiniteLoop,
                        elapsed_ms,
                    }));
                    return;
                }
            }

            if !*warned_tx.borrow()
                && elapsed_ms >= (config.wall_timeout_ms as f64 * 0.8) as u64
            {
                let mut guard = inner.lock();
                if guard.state == TimeoutState::Armed {
                    guard.state = TimeoutState::Warned;
                }
                drop(guard);
                let _ = warned_tx.send(true);
                events.publish(SandboxEvent::TimeoutWarning(TimeoutWarning {
                    execution_id,
                    elapsed_ms,
                    wall_timeout_ms: config.wall_timeout_ms,
                    severity: WarningSeverity::High,
                }));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::termination::IsolateHandle;
    use deno_core::v8;

    #[tokio::test]
    async fn fires_wall_timeout() {
        let manager = TimeoutManager::new();
        let mut v8_isolate = v8::Isolate::new(v8::CreateParams::default());
        let handle = IsolateHandle::new(v8_isolate.thread_safe_handle());
        let ctx = handle.new_context_created();
        let config = TimeoutConfig {
            wall_timeout_ms: 30,
            min_detection_ms: 1_000,
            infinite_loop_threshold: 1.1,
            tick_interval_ms: 5,
        };
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let th = manager.arm(1, ctx, config, Arc::new(|| 0), events);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(th.triggered());
        assert!(handle.is_poisoned());
        let event = rx.try_recv().expect("expected a published Timeout event");
        assert!(matches!(
            event,
            SandboxEvent::Timeout(TimeoutEvent { reason: TimeoutReason::WallClock, .. })
        ));
        let _ = &mut v8_isolate;
    }

    #[tokio::test]
    async fn warns_once_at_80_percent_of_the_wall_timeout() {
        let manager = TimeoutManager::new();
        let mut v8_isolate = v8::Isolate::new(v8::CreateParams::default());
        let handle = IsolateHandle::new(v8_isolate.thread_safe_handle());
        let ctx = handle.new_context_created();
        let config = TimeoutConfig {
            wall_timeout_ms: 1_000,
            min_detection_ms: 1_000,
            infinite_loop_threshold: 1.1,
            tick_interval_ms: 5,
        };
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let th = manager.arm(7, ctx, config, Arc::new(|| 0), events);
        tokio::time::sleep(Duration::from_millis(850)).await;
        assert!(th.warned());
        assert!(!th.triggered());
        let event = rx.try_recv().expect("expected a published TimeoutWarning event");
        assert!(matches!(
            event,
            SandboxEvent::TimeoutWarning(TimeoutWarning { execution_id: 7, .. })
        ));
        th.clear();
        let _ = &mut v8_isolate;
    }

    #[tokio::test]
    async fn clear_stops_watchdog_without_poisoning() {
        let manager = TimeoutManager::new();
        let mut v8_isolate = v8::Isolate::new(v8::CreateParams::default());
        let handle = IsolateHandle::new(v8_isolate.thread_safe_handle());
        let ctx = handle.new_context_created();
        let config = TimeoutConfig {
            wall_timeout_ms: 50,
            min_detection_ms: 1_000,
            infinite_loop_threshold: 1.1,
            tick_interval_ms: 5,
        };
        let th = manager.arm(1, ctx, config, Arc::new(|| 0), EventBus::default());
        th.clear();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!th.triggered());
        assert!(!handle.is_poisoned());
        let _ = &mut v8_isolate;
    }
}
