//! Context Builder, spec §4.5. Installs the guest-visible global surface
//! (`console`, `$env`, `$fs`, `require`, timers) into a freshly created V8
//! context, and enforces the injection blacklist by construction: nothing
//! that exposes the host process, a host module loader, dynamic-code-from-
//! string primitives, or constructor-traversal escapes is ever installed.
//! Guest standard constructors (`Object`, `Array`, `Promise`, ...) come
//! from the isolate's own intrinsics and are never touched here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use deno_core::v8;
use parking_lot::Mutex;

use crate::modules::{LoadingStack, ModuleSystem};
use crate::vfs::VirtualFilesystem;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleMode {
    /// Guest `console.*` calls pass through to the host's own `tracing`
    /// output.
    Inherit,
    /// Guest `console.*` calls are captured and handed to `on_output`
    /// instead of reaching host diagnostics.
    Redirect,
    /// Guest `console.*` calls are no-ops.
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Log,
    Info,
    Warn,
    Error,
    Debug,
}

pub type OutputCallback = Arc<dyn Fn(LogLevel, String) + Send + Sync>;

pub struct TimerHandle {
    pub callback: v8::Global<v8::Function>,
    pub repeating: bool,
    pub interval_ms: u64,
}

/// Everything a context's op callbacks need, stashed as a context-local slot
/// (not an isolate slot — isolates are pooled and reused across runs, but a
/// fresh `v8::Context` is created per run) so raw `v8::Function` callbacks
/// (which only receive a `HandleScope`) can reach back into kernel state.
pub struct ContextState {
    pub execution_id: u64,
    pub vfs: Arc<VirtualFilesystem>,
    pub vfs_enabled: bool,
    pub modules: Arc<ModuleSystem>,
    pub loading_stack: Arc<LoadingStack>,
    pub env: HashMap<String, String>,
    pub console_mode: ConsoleMode,
    pub on_output: Option<OutputCallback>,
    pub allow_timers: bool,
    pub timers: Mutex<HashMap<u64, TimerHandle>>,
    pub next_timer_id: AtomicU64,
    /// The module-path call stack, topmost entry is `require`'s implicit
    /// `fromPath`. Pushed/popped around recursive module evaluation by
    /// [`crate::ops::require`].
    pub module_path_stack: Mutex<Vec<String>>,
}

impl ContextState {
    pub fn current_module_path(&self) -> String {
        self.module_path_stack
            .lock()
            .last()
            .cloned()
            .expect("module path stack must never be empty")
    }
}

impl ContextState {
    pub fn alloc_timer_id(&self) -> u64 {
        self.next_timer_id.fetch_add(1, Ordering::Relaxed)
    }
}

pub struct ContextConfig {
    pub console_mode: ConsoleMode,
    pub on_output: Option<OutputCallback>,
    pub allow_timers: bool,
    pub vfs_enabled: bool,
    pub env: HashMap<String, String>,
    /// spec §4.5 `sandbox`: arbitrary JSON-serializable values copied into
    /// the guest globals key by key, distinct from `$env`/`$fs`/`require`.
    pub sandbox: HashMap<String, serde_json::Value>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            console_mode: ConsoleMode::Inherit,
            on_output: None,
            allow_timers: false,
            vfs_enabled: false,
            env: HashMap::new(),
            sandbox: HashMap::new(),
        }
    }
}

pub struct ContextBuilder;

impl ContextBuilder {
    /// Builds a new context inside `scope`'s isolate, installs the guest
    /// globals, and stashes the `Arc<ContextState>` as a slot on that
    /// context (not the isolate, which outlives this run in the pool) so
    /// the op callbacks registered below can retrieve it.
    pub fn build<'s>(
        scope: &mut v8::HandleScope<'s, ()>,
        execution_id: u64,
        vfs: Arc<VirtualFilesystem>,
        modules: Arc<ModuleSystem>,
        loading_stack: Arc<LoadingStack>,
        entry_path: String,
        config: ContextConfig,
    ) -> v8::Local<'s, v8::Context> {
        let context = v8::Context::new(scope, Default::default());
        let mut scope = v8::ContextScope::new(scope, context);

        let state = Arc::new(ContextState {
            execution_id,
            vfs,
            vfs_enabled: config.vfs_enabled,
            modules,
            loading_stack,
            env: config.env,
            console_mode: config.console_mode,
            on_output: config.on_output,
            allow_timers: config.allow_timers,
            timers: Mutex::new(HashMap::new()),
            next_timer_id: AtomicU64::new(1),
            module_path_stack: Mutex::new(vec![entry_path]),
        });
        assert!(context.set_slot(&mut scope, state));

        crate::ops::console::install(&mut scope, context);
        crate::ops::env::install(&mut scope, context);
        if config.vfs_enabled {
            crate::ops::fs::install(&mut scope, context);
        }
        crate::ops::require::install(&mut scope, context);
        if config.allow_timers {
            crate::ops::timers::install(&mut scope, context);
        }
        install_sandbox_values(&mut scope, context, config.sandbox);

        context
    }

    pub fn state<'s>(scope: &mut v8::HandleScope<'s>) -> Arc<ContextState> {
        let context = scope.get_current_context();
        context
            .get_slot::<Arc<ContextState>>(scope)
            .expect("context state slot must be installed by ContextBuilder::build")
            .clone()
    }
}

/// spec §4.5 `sandbox`: copies each JSON value into the guest globals key by
/// key. A value that somehow fails to serialize into the guest (should not
/// happen for valid JSON, but the spec calls the case out explicitly) is
/// coerced to its string representation instead of being dropped.
fn install_sandbox_values(
    scope: &mut v8::ContextScope<v8::HandleScope>,
    context: v8::Local<v8::Context>,
    sandbox: HashMap<String, serde_json::Value>,
) {
    use crate::convert::ToV8;

    let global = context.global(scope);
    for (key, value) in sandbox {
        let v8_value = value
            .clone()
            .to_v8(scope)
            .unwrap_or_else(|_| {
                v8::String::new(scope, &value.to_string())
                    .expect("string coercion cannot fail")
                    .into()
            });
        let Some(v8_key) = v8::String::new(scope, &key) else {
            continue;
        };
        global.set(scope, v8_key.into(), v8_value);
    }
}

fn set_global_function(
    scope: &mut v8::ContextScope<v8::HandleScope>,
    context: v8::Local<v8::Context>,
    name: &str,
    callback: impl v8::MapFnTo<v8::FunctionCallback>,
) {
    let global = context.global(scope);
    let func = v8::Function::new(scope, callback).expect("function template construction cannot fail here");
    let key = v8::String::new(scope, name).expect("valid identifier");
    global.set(scope, key.into(), func.into());
}

pub(crate) use set_global_function as install_fn;
