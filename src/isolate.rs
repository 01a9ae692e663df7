//! A single V8 isolate and the Convex-style heap-limit/cleanliness checks
//! around it. Grounded on the teacher's `isolate.rs`; the `RT: Runtime`
//! test-determinism generic is dropped since this crate depends on `tokio`
//! directly rather than threading a runtime abstraction through.

use std::ffi;
use std::time::Instant;

use deno_core::v8;
use humansize::{FormatSize, BINARY};

use crate::termination::{IsolateHandle, TerminationReason};

/// Initial V8 heap size; grown on demand by the near-heap-limit callback.
const INITIAL_HEAP_SIZE: usize = 1 << 16;

/// How much headroom V8 gets above the configured user ceiling before
/// `near_heap_limit_callback` doubles the limit to avoid a hard OOM crash.
const HEAP_EXTRA_SIZE: usize = 4 << 20;

#[derive(Debug, thiserror::Error)]
pub enum IsolateNotClean {
    #[error("isolate timed out")]
    Timeout,
    #[error("isolate exceeded its CPU time ceiling")]
    InfiniteLoop,
    #[error("isolate ran out of memory")]
    OutOfMemory,
    #[error("isolate was disposed")]
    Disposed,
    #[error(
        "possible memory leak: not enough room for guest heap (available {0} of {1})"
    )]
    TooMuchMemoryCarryOver(String, String),
    #[error("possible memory leak: {0} contexts have not been garbage collected")]
    DetachedContext(usize),
}

/// Heap statistics surfaced in [`crate::resource_monitor::ResourceSnapshot`].
#[derive(Debug, Default, Copy, Clone)]
pub struct IsolateHeapStats {
    pub total_heap_size: usize,
    pub total_heap_size_executable: usize,
    pub total_physical_size: usize,
    pub used_heap_size: usize,
    pub heap_size_limit: usize,
    pub total_available_size: usize,
    pub external_memory: usize,
    pub number_of_detached_contexts: usize,
}

impl From<v8::HeapStatistics> for IsolateHeapStats {
    fn from(stats: v8::HeapStatistics) -> Self {
        Self {
            total_heap_size: stats.total_heap_size(),
            total_heap_size_executable: stats.total_heap_size_executable(),
            total_physical_size: stats.total_physical_size(),
            used_heap_size: stats.used_heap_size(),
            heap_size_limit: stats.heap_size_limit(),
            total_available_size: stats.total_available_size(),
            external_memory: stats.external_memory(),
            number_of_detached_contexts: stats.number_of_detached_contexts(),
        }
    }
}

/// Thin wrapper over `v8::Isolate` carrying kernel-specific setup: capped
/// heap growth, disabled dynamic import/synchronous Atomics.wait, explicit
/// microtask draining, and a thread-safe [`IsolateHandle`] for watchdog
/// termination.
pub struct Isolate {
    v8_isolate: v8::OwnedIsolate,
    handle: IsolateHandle,
    memory_limit_bytes: usize,
    heap_ctx_ptr: *mut HeapContext,
    created: Instant,
}

struct HeapContext {
    handle: IsolateHandle,
}

// SAFETY: `Isolate` is only ever driven from the single isolate-manager
// worker thread that owns it; the raw pointer is not accessed concurrently.
unsafe impl Send for Isolate {}

impl Isolate {
    pub fn new(memory_limit_bytes: usize) -> Self {
        let create_params =
            v8::CreateParams::default().heap_limits(INITIAL_HEAP_SIZE, memory_limit_bytes + HEAP_EXTRA_SIZE);
        let mut v8_isolate = v8::Isolate::new(create_params);

        v8_isolate.set_capture_stack_trace_for_uncaught_exceptions(true, 10);
        v8_isolate.set_allow_atomics_wait(false);
        v8_isolate.set_microtasks_policy(v8::MicrotasksPolicy::Explicit);

        let handle = IsolateHandle::new(v8_isolate.thread_safe_handle());

        let heap_context = Box::new(HeapContext {
            handle: handle.clone(),
        });
        let heap_ctx_ptr = Box::into_raw(heap_context);
        v8_isolate.add_near_heap_limit_callback(
            near_heap_limit_callback,
            heap_ctx_ptr as *mut ffi::c_void,
        );

        crate::metrics::ISOLATES_CREATED_TOTAL.inc();

        Self {
            v8_isolate,
            handle,
            memory_limit_bytes,
            heap_ctx_ptr,
            created: Instant::now(),
        }
    }

    pub fn handle(&self) -> IsolateHandle {
        self.handle.clone()
    }

    pub fn memory_limit_bytes(&self) -> usize {
        self.memory_limit_bytes
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    pub fn heap_stats(&mut self) -> IsolateHeapStats {
        let mut stats = v8::HeapStatistics::default();
        self.v8_isolate.get_heap_statistics(&mut stats);
        stats.into()
    }

    pub fn handle_scope(&mut self) -> v8::HandleScope<()> {
        v8::HandleScope::new(&mut self.v8_isolate)
    }

    /// Run after a request completes, mirroring the teacher's
    /// `check_isolate_clean`: drains the microtask queue, then refuses to
    /// hand the isolate back to the pool if it was poisoned, is critically
    /// low on heap headroom, or is still holding detached contexts.
    pub fn check_clean(&mut self) -> Result<(), IsolateNotClean> {
        self.v8_isolate.perform_microtask_checkpoint();

        if let Some(reason) = self.handle.termination_reason() {
            return Err(match reason {
                TerminationReason::UserTimeout { .. } => IsolateNotClean::Timeout,
                TerminationReason::InfiniteLoop { .. } => IsolateNotClean::InfiniteLoop,
                TerminationReason::OutOfMemory
                | TerminationReason::ResourceMonitorMemoryCritical => IsolateNotClean::OutOfMemory,
                TerminationReason::Disposed => IsolateNotClean::Disposed,
            });
        }

        let mut stats = v8::HeapStatistics::default();
        self.v8_isolate.get_heap_statistics(&mut stats);
        if stats.total_available_size() < self.memory_limit_bytes / 4 {
            self.handle.terminate(TerminationReason::OutOfMemory);
            return Err(IsolateNotClean::TooMuchMemoryCarryOver(
                stats.total_available_size().format_size(BINARY),
                stats.heap_size_limit().format_size(BINARY),
            ));
        }
        if stats.number_of_detached_contexts() > 0 {
            return Err(IsolateNotClean::DetachedContext(
                stats.number_of_detached_contexts(),
            ));
        }
        Ok(())
    }
}

impl Drop for Isolate {
    fn drop(&mut self) {
        if self.heap_ctx_ptr.is_null() {
            return;
        }
        self.v8_isolate
            .remove_near_heap_limit_callback(near_heap_limit_callback, 0);
        let heap_ctx = unsafe { Box::from_raw(self.heap_ctx_ptr) };
        drop(heap_ctx);
        self.heap_ctx_ptr = std::ptr::null_mut();
    }
}

extern "C" fn near_heap_limit_callback(
    data: *mut ffi::c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    let heap_ctx = unsafe { &mut *(data as *mut HeapContext) };
    heap_ctx.handle.terminate(TerminationReason::OutOfMemory);
    current_heap_limit * 2
}
