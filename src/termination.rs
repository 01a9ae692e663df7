//! Thread-safe isolate termination and poisoning, grounded on the teacher's
//! `termination.rs`. An isolate is terminated exactly once; any later
//! termination attempt against a stale context is a no-op logged at
//! `tracing::error!`, never a panic, matching spec §5's "cancellation is
//! only via isolate.dispose(), safe to call multiple times."

use std::ffi;
use std::sync::Arc;

use deno_core::v8;
use parking_lot::Mutex;

use crate::error::ErrorKind;

/// Why an isolate was terminated. Distinct from [`ErrorKind`]: this is the
/// watchdog's-eye view of the termination, which the Error Sanitizer later
/// maps onto a guest-facing [`ErrorKind`].
#[derive(Debug, Clone)]
pub enum TerminationReason {
    UserTimeout { wall_timeout_ms: u64 },
    InfiniteLoop { cpu_ratio: f64 },
    OutOfMemory,
    ResourceMonitorMemoryCritical,
    Disposed,
}

impl TerminationReason {
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            TerminationReason::UserTimeout { .. } => ErrorKind::Timeout,
            TerminationReason::InfiniteLoop { .. } => ErrorKind::CpuLimit,
            TerminationReason::OutOfMemory | TerminationReason::ResourceMonitorMemoryCritical => {
                ErrorKind::MemoryLimit
            }
            TerminationReason::Disposed => ErrorKind::Runtime,
        }
    }

    pub fn metric_label(&self) -> &'static str {
        match self {
            TerminationReason::UserTimeout { .. } => "timeout",
            TerminationReason::InfiniteLoop { .. } => "infinite_loop",
            TerminationReason::OutOfMemory => "out_of_memory",
            TerminationReason::ResourceMonitorMemoryCritical => "memory_critical",
            TerminationReason::Disposed => "disposed",
        }
    }
}

struct IsolateHandleInner {
    reason: Option<TerminationReason>,
    context_id: u64,
}

/// A cloneable, thread-safe handle that can terminate a V8 isolate from any
/// thread, including the watchdog and resource-monitor background tasks.
/// Once terminated, the isolate is poisoned: [`crate::isolate::Isolate`]
/// must not be reused and is dropped by its pool.
#[derive(Clone)]
pub struct IsolateHandle {
    v8_handle: v8::IsolateHandle,
    inner: Arc<Mutex<IsolateHandleInner>>,
}

impl IsolateHandle {
    pub fn new(v8_handle: v8::IsolateHandle) -> Self {
        Self {
            v8_handle,
            inner: Arc::new(Mutex::new(IsolateHandleInner {
                reason: None,
                context_id: 0,
            })),
        }
    }

    /// Idempotent: a second call while already terminated is a no-op (the
    /// reason is kept from the first call).
    pub fn terminate(&self, reason: TerminationReason) {
        self.v8_handle.terminate_execution();
        crate::metrics::log_watchdog_fire(reason.metric_label());
        let mut inner = self.inner.lock();
        if inner.reason.is_none() {
            tracing::debug!(?reason, "terminating isolate");
            inner.reason = Some(reason);
        } else {
            tracing::debug!(?reason, "isolate already terminated, ignoring");
        }
    }

    pub fn is_poisoned(&self) -> bool {
        self.inner.lock().reason.is_some()
    }

    pub fn termination_reason(&self) -> Option<TerminationReason> {
        self.inner.lock().reason.clone()
    }

    pub fn new_context_created(&self) -> ContextHandle {
        let mut inner = self.inner.lock();
        inner.context_id += 1;
        ContextHandle {
            isolate_handle: self.clone(),
            context_id: inner.context_id,
        }
    }

    /// Schedules `callback` to run on the isolate's own worker thread at its
    /// next interrupt check, the only way to touch `v8::Isolate` state (e.g.
    /// `get_heap_statistics`) from another thread while guest code may be
    /// running synchronously on it. Best-effort: if the isolate has already
    /// finished or v8 drops the request, `callback` simply never runs.
    pub fn request_interrupt(&self, callback: impl FnOnce(&mut v8::Isolate) + Send + 'static) {
        extern "C" fn trampoline(isolate: &mut v8::Isolate, data: *mut ffi::c_void) {
            let callback = unsafe { Box::from_raw(data as *mut Box<dyn FnOnce(&mut v8::Isolate) + Send>) };
            callback(isolate);
        }

        let boxed: Box<Box<dyn FnOnce(&mut v8::Isolate) + Send>> = Box::new(Box::new(callback));
        let data = Box::into_raw(boxed) as *mut ffi::c_void;
        if !self.v8_handle.request_interrupt(trampoline, data) {
            // Request rejected (isolate already torn down): reclaim the box
            // instead of leaking it.
            unsafe {
                drop(Box::from_raw(data as *mut Box<dyn FnOnce(&mut v8::Isolate) + Send>));
            }
        }
    }
}

/// Scopes a termination request to one run. If the run has already
/// finished and a new run started on the same isolate, a termination
/// targeting the stale context is dropped rather than poisoning the new
/// run, the way the teacher's `context_id` generation counter works.
#[derive(Clone)]
pub struct ContextHandle {
    isolate_handle: IsolateHandle,
    context_id: u64,
}

impl ContextHandle {
    pub fn terminate(&self, reason: TerminationReason) {
        if self.context_id != self.isolate_handle.inner.lock().context_id {
            tracing::debug!(
                context_id = self.context_id,
                "termination after context completed, ignoring"
            );
            return;
        }
        self.isolate_handle.terminate(reason)
    }

    /// Scoping is intentionally loose here: an interrupt that lands after
    /// this context finished just samples whatever the next context's
    /// isolate looks like for one tick, which the resource monitor already
    /// stops consuming once [`crate::resource_monitor::ResourceMonitorHandle::finish`]
    /// is called.
    pub fn request_interrupt(&self, callback: impl FnOnce(&mut v8::Isolate) + Send + 'static) {
        self.isolate_handle.request_interrupt(callback);
    }
}
