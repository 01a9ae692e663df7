//! Public facade, spec §6. `Sandbox` is the single entry point a host
//! application constructs; everything else in this crate is reachable only
//! through it or through the handles it returns. Grounded on the teacher's
//! top-level `IsolateManager` facade grouping together the pool, the
//! request scheduler, and metrics behind one constructor.

use std::sync::Arc;

use crate::concurrency_limiter::{ConcurrencyLimiter, ConcurrencyPermit};
use crate::config::KernelConfig;
use crate::convert::TransferredValue;
use crate::engine::{CompiledScript, ExecutionEngine, ExecutionEngineConfig, RunRequest, RunResult, StreamEvent};
use crate::error::KernelError;
use crate::events::SandboxEvent;
use crate::isolate_manager::{IsolateManager, IsolateManagerConfig};
use crate::modules::{ModuleSystem, ModuleSystemConfig};
use crate::session::{Session, SessionConfig, SessionManager};
use crate::vfs::{Stat, VfsError, VirtualFilesystem};

/// The sandbox execution kernel, spec §1. Owns the isolate pool, the
/// concurrency limiter (independent of pool occupancy, SPEC_FULL.md §B),
/// the virtual filesystem, the module system, and the session table.
pub struct Sandbox {
    engine: Arc<ExecutionEngine>,
    sessions: Arc<SessionManager>,
    limiter: ConcurrencyLimiter,
}

impl Sandbox {
    pub fn new(config: KernelConfig) -> Self {
        let isolates = IsolateManager::new(IsolateManagerConfig {
            max_isolates: config.max_isolates,
            min_idle: config.min_idle_isolates,
            memory_limit_bytes: config.default_memory_limit_bytes as usize,
        });
        let vfs = Arc::new(VirtualFilesystem::new(config.vfs_default_quota_bytes));
        let modules = Arc::new(ModuleSystem::new(ModuleSystemConfig {
            allow_builtins: config.allow_builtins,
        }));
        let events = crate::events::EventBus::default();

        let engine = Arc::new(ExecutionEngine::new(
            isolates,
            vfs,
            modules,
            events,
            ExecutionEngineConfig {
                vfs_enabled: config.filesystem_enabled,
                allow_timers: config.allow_timers,
                console_mode: crate::context::ConsoleMode::Inherit,
                on_output: None,
                env: std::collections::HashMap::new(),
                min_detection_ms: config.min_detection_ms,
                infinite_loop_threshold: config.infinite_loop_threshold,
                timeout_tick_interval_ms: config.watchdog_tick_interval_ms,
                sampling_interval_ms: config.resource_sampling_interval_ms,
                memory_critical_fraction: config.memory_critical_fraction,
            },
        ));

        let sessions = SessionManager::new(
            engine.clone(),
            SessionConfig {
                ttl_ms: 300_000,
                max_executions: None,
                sweep_interval_ms: config.session_sweep_interval_ms,
            },
        );

        let limiter = if config.max_concurrency == 0 {
            ConcurrencyLimiter::unlimited()
        } else {
            ConcurrencyLimiter::new(config.max_concurrency)
        };

        Self {
            engine,
            sessions,
            limiter,
        }
    }

    async fn permit(&self) -> ConcurrencyPermit {
        self.limiter.acquire().await
    }

    /// spec §6 `Sandbox.run(request)`. Blocks on the concurrency limiter
    /// before touching the isolate pool, so pool exhaustion only happens
    /// once concurrency is already bounded by configuration.
    pub async fn run(&self, request: RunRequest) -> Result<RunResult, KernelError> {
        let _permit = self.permit().await;
        self.engine.execute(request).await
    }

    pub fn compile(&self, source: impl Into<String>, filename: Option<String>) -> CompiledScript {
        self.engine.compile(source, filename)
    }

    pub async fn run_compiled(
        &self,
        script: &CompiledScript,
        request: RunRequest,
    ) -> Result<RunResult, KernelError> {
        let _permit = self.permit().await;
        self.engine.run_compiled(script, request).await
    }

    /// spec §6 `Sandbox.runStream(request)`. The returned stream holds its
    /// own engine reference and is independent of the concurrency limiter
    /// until it actually starts executing, since the limiter can only be
    /// awaited from an `async fn`, not a `Stream::poll_next`.
    pub fn run_stream(&self, request: RunRequest) -> impl futures::Stream<Item = StreamEvent> {
        self.engine.run_stream(request)
    }

    pub fn create_session(&self) -> Session {
        self.sessions.create_session()
    }

    pub fn get_session(&self, id: &str) -> Result<Session, KernelError> {
        self.sessions.get_session(id)
    }

    pub fn delete_session(&self, id: &str) -> bool {
        self.sessions.delete_session(id)
    }

    pub fn list_sessions(&self) -> Vec<String> {
        self.sessions.list_sessions()
    }

    pub async fn run_in_session(
        &self,
        session_id: &str,
        request: RunRequest,
    ) -> Result<RunResult, KernelError> {
        let _permit = self.permit().await;
        self.sessions.run(session_id, request).await
    }

    pub fn fs(&self) -> &Arc<VirtualFilesystem> {
        self.engine.vfs()
    }

    pub fn fs_write(&self, path: &str, bytes: Vec<u8>) -> Result<(), VfsError> {
        self.engine.vfs().write(path, bytes)
    }

    pub fn fs_read(&self, path: &str) -> Result<Vec<u8>, VfsError> {
        self.engine.vfs().read(path)
    }

    pub fn fs_stat(&self, path: &str) -> Result<Stat, VfsError> {
        self.engine.vfs().stat(path)
    }

    pub fn fs_mkdir(&self, path: &str, recursive: bool) -> Result<(), VfsError> {
        self.engine.vfs().mkdir(path, recursive)
    }

    pub fn fs_delete(&self, path: &str, recursive: bool) -> Result<(), VfsError> {
        self.engine.vfs().delete(path, recursive)
    }

    /// spec §4.7 `require.mock(specifier, exports)`, for tests that need to
    /// stand in a module without touching the filesystem.
    pub fn mock_module(&self, specifier: &str, exports: TransferredValue) {
        self.engine.modules().mock(specifier, exports);
    }

    pub fn clear_module_mocks(&self) {
        self.engine.modules().clear_mocks();
    }

    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<SandboxEvent> {
        self.engine.events().subscribe()
    }

    /// spec §5: cancellation is only ever `isolate.dispose()`, safe to call
    /// repeatedly. Disposes every pooled isolate; in-flight runs observe
    /// their isolate being poisoned and return a `Runtime`-kind error.
    pub async fn dispose_all(&self) {
        self.engine.dispose_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn end_to_end_expression_evaluates() {
        let sandbox = Sandbox::new(KernelConfig::default());
        let result = sandbox.run(RunRequest::new("1 + 1")).await.unwrap();
        assert_eq!(
            result.value,
            Some(TransferredValue::Json(serde_json::json!(2)))
        );
    }

    #[tokio::test]
    async fn filesystem_write_then_read_round_trips() {
        let sandbox = Sandbox::new(KernelConfig::default().with_filesystem_enabled(true));
        sandbox.fs_write("/sandbox/a.txt", b"hi".to_vec()).unwrap();
        assert_eq!(sandbox.fs_read("/sandbox/a.txt").unwrap(), b"hi");
    }

    #[tokio::test]
    async fn quota_exceeded_surfaces_as_vfs_error() {
        let sandbox = Sandbox::new(
            KernelConfig::default()
                .with_filesystem_enabled(true)
                .with_vfs_default_quota_bytes(4),
        );
        let result = sandbox.fs_write("/sandbox/big.txt", b"way too much data".to_vec());
        assert!(matches!(result, Err(VfsError::Quota { .. })));
    }

    #[tokio::test]
    async fn session_state_persists_across_runs() {
        let sandbox = Sandbox::new(KernelConfig::default());
        let session = sandbox.create_session();
        session.set_state("x", serde_json::json!(10));
        let result = sandbox
            .run_in_session(session.id(), RunRequest::new("1").with_sandbox_value("y", serde_json::json!(5)))
            .await
            .unwrap();
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn module_mock_is_used_without_touching_the_filesystem() {
        let sandbox = Sandbox::new(KernelConfig::default());
        sandbox.mock_module("virtual:config", TransferredValue::Json(serde_json::json!({"flag": true})));
        assert_eq!(sandbox.fs_read("/sandbox/missing.js").is_err(), true);
    }
}
