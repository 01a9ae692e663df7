//! Typed event dispatcher, replacing the reference design's untyped pub/sub
//! per spec §9's REDESIGN FLAGS note. Events from spec §6: `execution`
//! (start/complete/error), `timeout`, `resource-warning`, and
//! `security:violation`.

use crate::error::SanitizedError;

#[derive(Debug, Clone)]
pub struct ExecutionStart {
    pub execution_id: u64,
}

#[derive(Debug, Clone)]
pub struct ExecutionComplete {
    pub execution_id: u64,
    pub duration_ms: u64,
    pub cpu_time_ms: u64,
}

#[derive(Debug, Clone)]
pub struct ExecutionError {
    pub execution_id: u64,
    pub error: SanitizedError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutReason {
    WallClock,
    InfiniteLoop,
}

#[derive(Debug, Clone)]
pub struct TimeoutEvent {
    pub execution_id: u64,
    pub reason: TimeoutReason,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningSeverity {
    High,
}

/// spec §4.3: the Timeout Manager's one-shot warning at 80% of the
/// wall-clock budget, distinct from [`ResourceWarning`]'s CPU/heap
/// threshold crossings.
#[derive(Debug, Clone)]
pub struct TimeoutWarning {
    pub execution_id: u64,
    pub elapsed_ms: u64,
    pub wall_timeout_ms: u64,
    pub severity: WarningSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceWarningKind {
    CpuWarning80,
    CpuWarning95,
    MemoryWarning80,
    MemoryWarning95,
}

#[derive(Debug, Clone)]
pub struct ResourceWarning {
    pub execution_id: u64,
    pub kind: ResourceWarningKind,
}

#[derive(Debug, Clone)]
pub struct SecurityViolation {
    pub execution_id: Option<u64>,
    pub detail: String,
}

/// The complete set of events a [`crate::sandbox::Sandbox`] emits.
#[derive(Debug, Clone)]
pub enum SandboxEvent {
    ExecutionStart(ExecutionStart),
    ExecutionComplete(ExecutionComplete),
    ExecutionError(ExecutionError),
    Timeout(TimeoutEvent),
    TimeoutWarning(TimeoutWarning),
    ResourceWarning(ResourceWarning),
    SecurityViolation(SecurityViolation),
}

/// A broadcast-backed event bus. Subscribers that fall behind lose the
/// oldest events rather than blocking publishers (`tokio::sync::broadcast`
/// semantics); a lagged subscriber should resubscribe.
#[derive(Clone)]
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<SandboxEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<SandboxEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: SandboxEvent) {
        // No active subscribers is a normal, not exceptional, situation.
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
