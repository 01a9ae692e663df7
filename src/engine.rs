//! Execution Engine, spec §4.2. Orchestrates exactly one run on one
//! isolate through the eight-step protocol: assign an id, emit
//! `execution:start`, arm the Timeout Manager and Resource Monitor, compile,
//! run, transfer the result out, and tear down watchdogs either way.
//! Grounded on the teacher's `request_scope.rs` compile/run split and
//! `environment/mod.rs` context-per-request shape, generalized from
//! Convex's UDF execution to running arbitrary guest source.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use deno_core::v8;
use parking_lot::Mutex;

use crate::context::{ConsoleMode, ContextBuilder, ContextConfig, OutputCallback};
use crate::convert::TransferredValue;
use crate::error::KernelError;
use crate::events::{
    EventBus, ExecutionComplete, ExecutionError, ExecutionStart, SandboxEvent,
};
use crate::isolate::{Isolate, IsolateHeapStats};
use crate::isolate_manager::{self, IsolateManager};
use crate::modules::{LoadingStack, ModuleSystem};
use crate::resource_monitor::{ResourceMonitor, ResourceMonitorConfig, ResourceStats};
use crate::sanitizer::{ErrorSanitizer, RawError};
use crate::timeout::{TimeoutConfig, TimeoutManager};
use crate::vfs::VirtualFilesystem;

/// spec §3 `RunRequest`. `source` carries the submitted code; everything
/// else has a sane default so `RunRequest::new(source)` is usually enough.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub source: String,
    pub filename: Option<String>,
    pub wall_timeout_ms: u64,
    pub cpu_time_limit_ms: u64,
    pub memory_limit_bytes: u64,
    pub strict_timeout: bool,
    pub language: Language,
    pub sandbox: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum Language {
    #[default]
    JavaScript,
}

impl RunRequest {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            filename: None,
            wall_timeout_ms: 5_000,
            cpu_time_limit_ms: 0,
            memory_limit_bytes: 64 << 20,
            strict_timeout: false,
            language: Language::JavaScript,
            sandbox: HashMap::new(),
        }
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn with_wall_timeout_ms(mut self, ms: u64) -> Self {
        self.wall_timeout_ms = ms;
        self
    }

    pub fn with_cpu_time_limit_ms(mut self, ms: u64) -> Self {
        self.cpu_time_limit_ms = ms;
        self
    }

    pub fn with_memory_limit_bytes(mut self, bytes: u64) -> Self {
        self.memory_limit_bytes = bytes;
        self
    }

    pub fn with_strict_timeout(mut self, strict: bool) -> Self {
        self.strict_timeout = strict;
        self
    }

    pub fn with_sandbox_value(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.sandbox.insert(key.into(), value);
        self
    }

    fn validate(&self) -> Result<(), KernelError> {
        if self.memory_limit_bytes < 1 << 20 {
            return Err(KernelError::InvalidRunRequest(
                "memoryLimitBytes must be at least 1 MiB".to_string(),
            ));
        }
        Ok(())
    }
}

/// spec §3 `RunResult`. Exactly one of `value`/`error` is meaningful.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub value: Option<TransferredValue>,
    pub duration_ms: u64,
    pub cpu_time_ms: u64,
    pub resource_stats: ResourceStats,
    pub error: Option<crate::error::SanitizedError>,
}

/// Everything [`ContextBuilder`] needs that isn't per-run, bundled so
/// [`ExecutionEngine::new`] takes one config value rather than six.
pub struct ExecutionEngineConfig {
    pub vfs_enabled: bool,
    pub allow_timers: bool,
    pub console_mode: ConsoleMode,
    pub on_output: Option<OutputCallback>,
    pub env: HashMap<String, String>,
    pub min_detection_ms: u64,
    pub infinite_loop_threshold: f64,
    pub timeout_tick_interval_ms: u64,
    pub sampling_interval_ms: u64,
    pub memory_critical_fraction: f64,
}

impl Default for ExecutionEngineConfig {
    fn default() -> Self {
        let timeout_defaults = TimeoutConfig::default();
        let monitor_defaults = ResourceMonitorConfig::default();
        Self {
            vfs_enabled: false,
            allow_timers: false,
            console_mode: ConsoleMode::Inherit,
            on_output: None,
            env: HashMap::new(),
            min_detection_ms: timeout_defaults.min_detection_ms,
            infinite_loop_threshold: timeout_defaults.infinite_loop_threshold,
            timeout_tick_interval_ms: timeout_defaults.tick_interval_ms,
            sampling_interval_ms: monitor_defaults.sampling_interval_ms,
            memory_critical_fraction: monitor_defaults.memory_critical_fraction,
        }
    }
}

/// An immutable, cheap-to-clone handle produced by [`ExecutionEngine::compile`].
/// Syntax errors aren't surfaced here: a `CompiledScript` is just source text
/// plus bookkeeping; [`ExecutionEngine::run_compiled`] compiles it the same
/// way `execute` compiles a fresh submission, so syntax failures surface
/// identically as a `RunResult.error` of kind `Syntax`.
#[derive(Debug, Clone)]
pub struct CompiledScript {
    source: Arc<str>,
    filename: String,
    content_hash: u64,
}

impl CompiledScript {
    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn content_hash(&self) -> u64 {
        self.content_hash
    }
}

fn content_hash(source: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    source.hash(&mut hasher);
    hasher.finish()
}

/// Drives the watchdog's view of CPU time. The isolate's dedicated worker
/// thread does nothing but this run's guest code while the job is in
/// flight, so wall time elapsed since the job was dispatched is the
/// faithful stand-in for the "monotonically increasing CPU-time counter"
/// spec.md §3 assumes as a primitive (real per-isolate CPU accounting isn't
/// exposed through `deno_core`'s safe API; see DESIGN.md).
struct CpuClock {
    started: Mutex<Option<Instant>>,
}

impl CpuClock {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            started: Mutex::new(None),
        })
    }

    fn start(&self) {
        *self.started.lock() = Some(Instant::now());
    }

    fn elapsed_ms(&self) -> u64 {
        self.started
            .lock()
            .map(|start| start.elapsed().as_millis() as u64)
            .unwrap_or(0)
    }
}

pub struct ExecutionEngine {
    isolates: IsolateManager,
    timeouts: Arc<TimeoutManager>,
    monitor: Arc<ResourceMonitor>,
    events: EventBus,
    vfs: Arc<VirtualFilesystem>,
    modules: Arc<ModuleSystem>,
    config: ExecutionEngineConfig,
}

impl ExecutionEngine {
    pub fn new(
        isolates: IsolateManager,
        vfs: Arc<VirtualFilesystem>,
        modules: Arc<ModuleSystem>,
        events: EventBus,
        config: ExecutionEngineConfig,
    ) -> Self {
        Self {
            isolates,
            timeouts: Arc::new(TimeoutManager::new()),
            monitor: Arc::new(ResourceMonitor::new()),
            events,
            vfs,
            modules,
            config,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn vfs(&self) -> &Arc<VirtualFilesystem> {
        &self.vfs
    }

    pub fn modules(&self) -> &Arc<ModuleSystem> {
        &self.modules
    }

    pub fn isolates(&self) -> &IsolateManager {
        &self.isolates
    }

    /// Constructs a [`CompiledScript`] handle. Cheap: no isolate is touched.
    pub fn compile(&self, source: impl Into<String>, filename: Option<String>) -> CompiledScript {
        let source: Arc<str> = Arc::from(source.into());
        let content_hash = content_hash(&source);
        CompiledScript {
            source,
            filename: filename.unwrap_or_else(|| "/sandbox/index.js".to_string()),
            content_hash,
        }
    }

    pub async fn run_compiled(
        &self,
        script: &CompiledScript,
        mut request: RunRequest,
    ) -> Result<RunResult, KernelError> {
        request.source = script.source.to_string();
        request.filename = Some(script.filename.clone());
        self.execute(request).await
    }

    /// Implements spec §4.2's eight-step protocol. Never panics the caller
    /// with a guest-triggered failure: those land in `RunResult.error`.
    /// `KernelError` is reserved for infrastructure-level failures (pool
    /// exhaustion, channel disconnects) per DESIGN.md's error-band split.
    pub async fn execute(&self, request: RunRequest) -> Result<RunResult, KernelError> {
        request.validate()?;

        let execution_id = isolate_manager::next_execution_id();
        self.events
            .publish(SandboxEvent::ExecutionStart(ExecutionStart { execution_id }));
        let duration_timer = crate::metrics::execution_duration_timer();
        let wall_start = Instant::now();

        let lease = self.isolates.acquire()?;
        let isolate_handle = lease.handle();
        let context_handle = isolate_handle.new_context_created();

        let cpu_clock = CpuClock::new();
        let cpu_source: crate::timeout::CpuTimeSource = {
            let cpu_clock = cpu_clock.clone();
            Arc::new(move || cpu_clock.elapsed_ms())
        };

        let timeout_handle = self.timeouts.arm(
            execution_id,
            context_handle.clone(),
            TimeoutConfig {
                wall_timeout_ms: request.wall_timeout_ms,
                min_detection_ms: self.config.min_detection_ms,
                infinite_loop_threshold: self.config.infinite_loop_threshold,
                tick_interval_ms: self.config.timeout_tick_interval_ms,
            },
            cpu_source,
            self.events.clone(),
        );

        let monitor_handle = self.monitor.start(
            execution_id,
            context_handle,
            ResourceMonitorConfig {
                sampling_interval_ms: self.config.sampling_interval_ms,
                cpu_time_limit_ms: if request.cpu_time_limit_ms == 0 {
                    None
                } else {
                    Some(request.cpu_time_limit_ms)
                },
                memory_limit_bytes: request.memory_limit_bytes,
                memory_critical_fraction: self.config.memory_critical_fraction,
            },
            self.events.clone(),
        );

        cpu_clock.start();

        let vfs = self.vfs.clone();
        let modules = self.modules.clone();
        let loading_stack = Arc::new(LoadingStack::new());
        let entry_path = request
            .filename
            .clone()
            .unwrap_or_else(|| "/sandbox/index.js".to_string());
        let source = request.source.clone();
        let context_config = ContextConfig {
            console_mode: self.config.console_mode,
            on_output: self.config.on_output.clone(),
            allow_timers: self.config.allow_timers,
            vfs_enabled: self.config.vfs_enabled,
            env: self.config.env.clone(),
            sandbox: request.sandbox.clone(),
        };

        let raw = lease
            .run(move |isolate| {
                run_source_in_isolate(
                    isolate,
                    execution_id,
                    vfs,
                    modules,
                    loading_stack,
                    entry_path,
                    source,
                    context_config,
                )
            })
            .await?;

        timeout_handle.clear();
        monitor_handle.record_cpu_time(cpu_clock.elapsed_ms());
        monitor_handle.record_heap_stats(raw.heap_stats);
        let resource_stats = monitor_handle.finish();

        let duration_ms = wall_start.elapsed().as_millis() as u64;
        let termination_reason = isolate_handle.termination_reason();

        let result = if let Some(reason) = termination_reason {
            // Watchdog termination always wins over whatever the guest
            // managed to report: the isolate is gone either way.
            let error = crate::error::SanitizedError::new(
                reason.error_kind(),
                watchdog_message(&reason),
            );
            self.events.publish(SandboxEvent::ExecutionError(ExecutionError {
                execution_id,
                error: error.clone(),
            }));
            RunResult {
                value: None,
                duration_ms,
                cpu_time_ms: resource_stats.final_cpu_ms,
                resource_stats,
                error: Some(error),
            }
        } else if let Some(raw_error) = raw.error {
            let error = ErrorSanitizer::sanitize(raw_error, Some(&request.source));
            self.events.publish(SandboxEvent::ExecutionError(ExecutionError {
                execution_id,
                error: error.clone(),
            }));
            RunResult {
                value: None,
                duration_ms,
                cpu_time_ms: resource_stats.final_cpu_ms,
                resource_stats,
                error: Some(error),
            }
        } else {
            self.events
                .publish(SandboxEvent::ExecutionComplete(ExecutionComplete {
                    execution_id,
                    duration_ms,
                    cpu_time_ms: resource_stats.final_cpu_ms,
                }));
            RunResult {
                value: raw.value,
                duration_ms,
                cpu_time_ms: resource_stats.final_cpu_ms,
                resource_stats,
                error: None,
            }
        };

        duration_timer.observe();
        Ok(result)
    }

    /// spec §6 `Sandbox.runStream`: a finite, non-restartable sequence of
    /// `start -> (result | error) -> end`, backed by the same run machinery
    /// as [`Self::execute`]. SPEC_FULL.md §B.
    pub fn run_stream(
        self: &Arc<Self>,
        request: RunRequest,
    ) -> impl futures::Stream<Item = StreamEvent> {
        enum Phase {
            Start,
            Run(Pin<Box<dyn Future<Output = Result<RunResult, KernelError>> + Send>>),
            End,
            Done,
        }

        let engine = self.clone();
        futures::stream::unfold(Phase::Start, move |phase| {
            let engine = engine.clone();
            let request = request.clone();
            async move {
                match phase {
                    Phase::Start => {
                        let fut = Box::pin(async move { engine.execute(request).await });
                        Some((StreamEvent::Start, Phase::Run(fut)))
                    }
                    Phase::Run(fut) => {
                        let event = match fut.await {
                            Ok(result) => StreamEvent::Result(Box::new(result)),
                            Err(err) => StreamEvent::Error(err.to_string()),
                        };
                        Some((event, Phase::End))
                    }
                    Phase::End => Some((StreamEvent::End, Phase::Done)),
                    Phase::Done => None,
                }
            }
        })
    }

    pub async fn dispose_all(&self) {
        self.isolates.dispose_all();
    }
}

#[derive(Debug, Clone)]
pub enum StreamEvent {
    Start,
    Result(Box<RunResult>),
    Error(String),
    End,
}

fn watchdog_message(reason: &crate::termination::TerminationReason) -> String {
    use crate::termination::TerminationReason;
    match reason {
        TerminationReason::UserTimeout { wall_timeout_ms } => {
            format!("execution exceeded the {wall_timeout_ms}ms wall-clock timeout")
        }
        TerminationReason::InfiniteLoop { cpu_ratio } => format!(
            "execution terminated: sustained {:.0}% CPU usage with no cooperative yield",
            cpu_ratio * 100.0
        ),
        TerminationReason::OutOfMemory => "execution exceeded its memory limit".to_string(),
        TerminationReason::ResourceMonitorMemoryCritical => {
            "execution terminated: memory usage reached the critical threshold".to_string()
        }
        TerminationReason::Disposed => "execution was cancelled".to_string(),
    }
}

/// What a single isolate-thread dispatch hands back to the async engine
/// code. Built entirely on the isolate's dedicated worker thread; nothing
/// here is a live `v8::Local`, so it's safe to move across the channel.
struct RawRunOutput {
    value: Option<TransferredValue>,
    error: Option<RawError>,
    heap_stats: IsolateHeapStats,
}

/// Runs on the isolate's dedicated worker thread (see
/// [`crate::isolate_manager::IsolateLease::run`]). Builds a fresh context,
/// compiles `source`, runs it, and transfers the result out. A compile
/// failure and a runtime failure both produce a [`RawError`]; termination
/// (timeout/infinite-loop/OOM) is detected by the caller afterward via the
/// isolate's own termination reason, since a terminated isolate's
/// `try_catch` carries no usable exception.
fn run_source_in_isolate(
    isolate: &mut Isolate,
    execution_id: u64,
    vfs: Arc<VirtualFilesystem>,
    modules: Arc<ModuleSystem>,
    loading_stack: Arc<LoadingStack>,
    entry_path: String,
    source: String,
    context_config: ContextConfig,
) -> RawRunOutput {
    let (value, error) = {
        let mut hs = isolate.handle_scope();
        let context = ContextBuilder::build(
            &mut hs,
            execution_id,
            vfs,
            modules,
            loading_stack,
            entry_path,
            context_config,
        );
        let mut scope = v8::ContextScope::new(&mut hs, context);
        let mut try_catch = v8::TryCatch::new(&mut scope);

        match v8::String::new(&mut try_catch, &source) {
            None => (None, Some(RawError {
                name: "Error".to_string(),
                message: "failed to intern source text".to_string(),
                stack: None,
            })),
            Some(src) => match v8::Script::compile(&mut try_catch, src, None) {
                None => {
                    if try_catch.has_terminated() {
                        (None, None)
                    } else {
                        (None, Some(extract_raw_error(&mut try_catch, "SyntaxError")))
                    }
                }
                Some(script) => match script.run(&mut try_catch) {
                    None => {
                        if try_catch.has_terminated() {
                            (None, None)
                        } else {
                            (None, Some(extract_raw_error(&mut try_catch, "Error")))
                        }
                    }
                    Some(result) => {
                        let transferred = crate::convert::transfer_out(&mut try_catch, result);
                        (Some(transferred), None)
                    }
                },
            },
        }
    };

    let heap_stats = isolate.heap_stats();
    RawRunOutput { value, error, heap_stats }
}

fn get_string_prop(scope: &mut v8::HandleScope, obj: v8::Local<v8::Object>, key: &str) -> Option<String> {
    let k = v8::String::new(scope, key)?;
    let v = obj.get(scope, k.into())?;
    if v.is_undefined() {
        return None;
    }
    v.to_string(scope).map(|s| s.to_rust_string_lossy(scope))
}

fn extract_raw_error(try_catch: &mut v8::TryCatch<v8::HandleScope>, default_name: &str) -> RawError {
    let Some(exception) = try_catch.exception() else {
        return RawError {
            name: default_name.to_string(),
            message: "unknown error".to_string(),
            stack: None,
        };
    };
    if let Ok(obj) = v8::Local::<v8::Object>::try_from(exception) {
        let name = get_string_prop(try_catch, obj, "name").unwrap_or_else(|| default_name.to_string());
        let message = get_string_prop(try_catch, obj, "message").unwrap_or_default();
        let stack = get_string_prop(try_catch, obj, "stack");
        RawError { name, message, stack }
    } else {
        let message = exception
            .to_string(try_catch)
            .map(|s| s.to_rust_string_lossy(try_catch))
            .unwrap_or_default();
        RawError {
            name: default_name.to_string(),
            message,
            stack: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::isolate_manager::{IsolateManager, IsolateManagerConfig};
    use crate::modules::{ModuleSystem, ModuleSystemConfig};

    fn test_engine() -> ExecutionEngine {
        let isolates = IsolateManager::new(IsolateManagerConfig {
            max_isolates: 2,
            min_idle: 1,
            memory_limit_bytes: 32 << 20,
        });
        let vfs = Arc::new(VirtualFilesystem::new(1 << 20));
        let modules = Arc::new(ModuleSystem::new(ModuleSystemConfig::default()));
        ExecutionEngine::new(
            isolates,
            vfs,
            modules,
            EventBus::default(),
            ExecutionEngineConfig::default(),
        )
    }

    #[tokio::test]
    async fn simple_expression_returns_json_value() {
        let engine = test_engine();
        let result = engine.execute(RunRequest::new("1 + 1")).await.unwrap();
        assert!(result.error.is_none());
        assert_eq!(
            result.value,
            Some(TransferredValue::Json(serde_json::json!(2)))
        );
    }

    #[tokio::test]
    async fn syntax_error_is_reported_as_syntax_kind() {
        let engine = test_engine();
        let result = engine.execute(RunRequest::new("this is not js (")).await.unwrap();
        let error = result.error.expect("expected a syntax error");
        assert_eq!(error.kind, crate::error::ErrorKind::Syntax);
    }

    #[tokio::test]
    async fn busy_loop_is_terminated_by_the_watchdog() {
        let engine = test_engine();
        let request = RunRequest::new("while (true) {}").with_wall_timeout_ms(50);
        let result = engine.execute(request).await.unwrap();
        let error = result.error.expect("expected a timeout or cpu-limit error");
        assert!(matches!(
            error.kind,
            crate::error::ErrorKind::Timeout | crate::error::ErrorKind::CpuLimit
        ));
    }

    #[tokio::test]
    async fn runaway_allocation_is_reported_as_memory_limit() {
        let engine = test_engine();
        let request = RunRequest::new(
            "let chunks = []; while (true) { chunks.push(new Array(1 << 20).fill(0)); }",
        )
        .with_memory_limit_bytes(4 << 20)
        .with_wall_timeout_ms(2_000);
        let result = engine.execute(request).await.unwrap();
        let error = result.error.expect("expected the isolate to be disposed for exceeding its heap");
        assert!(matches!(
            error.kind,
            crate::error::ErrorKind::MemoryLimit
                | crate::error::ErrorKind::Timeout
                | crate::error::ErrorKind::CpuLimit
        ));
    }

    #[tokio::test]
    async fn invalid_memory_limit_is_rejected_before_acquiring_an_isolate() {
        let engine = test_engine();
        let request = RunRequest::new("1").with_memory_limit_bytes(1024);
        let result = engine.execute(request).await;
        assert!(matches!(result, Err(KernelError::InvalidRunRequest(_))));
    }

    #[tokio::test]
    async fn sandbox_values_are_copied_into_guest_globals() {
        let engine = test_engine();
        let request = RunRequest::new("x + y.z").with_sandbox_value("x", serde_json::json!(10)).with_sandbox_value(
            "y",
            serde_json::json!({"z": 5}),
        );
        let result = engine.execute(request).await.unwrap();
        assert!(result.error.is_none(), "unexpected error: {:?}", result.error);
        assert_eq!(
            result.value,
            Some(TransferredValue::Json(serde_json::json!(15)))
        );
    }

    #[tokio::test]
    async fn compile_then_run_compiled_executes_the_same_source() {
        let engine = test_engine();
        let script = engine.compile("21 * 2", None);
        let result = engine
            .run_compiled(&script, RunRequest::new(""))
            .await
            .unwrap();
        assert_eq!(
            result.value,
            Some(TransferredValue::Json(serde_json::json!(42)))
        );
    }

    #[tokio::test]
    async fn run_stream_yields_start_result_end_then_closes() {
        use futures::StreamExt;

        let engine = Arc::new(test_engine());
        let events: Vec<StreamEvent> = engine.run_stream(RunRequest::new("1")).collect().await;
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], StreamEvent::Start));
        assert!(matches!(events[1], StreamEvent::Result(_)));
        assert!(matches!(events[2], StreamEvent::End));
    }
}
