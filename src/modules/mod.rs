//! Module System, spec §4.7. `require(specifier, fromPath)` is a six-step
//! algorithm: check the mock table (bypassing everything else, including
//! cycle detection, per spec's explicit answer to Open Question (c));
//! check the builtin whitelist; resolve relative/absolute/bare specifiers
//! against the VFS; consult the cache by resolved path; detect cycles via
//! a per-run loading stack; and, on a cache miss, hand the wrapped source
//! back to the caller (the execution engine) for evaluation inside the
//! running isolate — this module never executes guest code itself.

mod cache;
mod resolver;

pub use cache::{ModuleCache, ModuleRecord};
pub use resolver::{classify, BUILTIN_MODULES};

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::convert::TransferredValue;
use crate::error::ErrorKind;
use crate::vfs::VirtualFilesystem;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ModuleError {
    #[error("cannot find module '{0}'")]
    NotFound(String),
    #[error("circular dependency detected: {}", .0.join(" -> "))]
    CircularDependency(Vec<String>),
    #[error("module '{0}' is not permitted in this sandbox")]
    Denied(String),
}

impl ModuleError {
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            ModuleError::NotFound(_) => ErrorKind::ModuleNotFound,
            ModuleError::CircularDependency(_) => ErrorKind::CircularDependency,
            ModuleError::Denied(_) => ErrorKind::ModuleDenied,
        }
    }
}

/// What the execution engine should do to satisfy a `require` call.
pub enum ResolvedModule {
    /// Already evaluated; hand back its cached exports immediately.
    Cached(TransferredValue),
    /// A mock registered via [`ModuleSystem::mock`]; also returned without
    /// touching the cache or the loading stack.
    Mocked(TransferredValue),
    /// Not yet evaluated. The engine should wrap `source` per
    /// [`wrap_source`], evaluate it in the running isolate, and then call
    /// [`ModuleSystem::finish_load`] with the resulting exports.
    NeedsEvaluation { resolved_path: String, source: String },
}

pub struct ModuleSystemConfig {
    pub allow_builtins: bool,
}

impl Default for ModuleSystemConfig {
    fn default() -> Self {
        Self {
            allow_builtins: false,
        }
    }
}

/// Per-run loading stack for cycle detection. A fresh one is created for
/// each top-level `run`; modules cached from a prior run don't re-trigger
/// cycle checks since they short-circuit at the cache step.
#[derive(Default)]
pub struct LoadingStack {
    stack: Mutex<Vec<String>>,
}

impl LoadingStack {
    pub fn new() -> Self {
        Self::default()
    }
}

pub struct ModuleSystem {
    config: ModuleSystemConfig,
    cache: ModuleCache,
    mocks: DashMap<String, TransferredValue>,
}

impl ModuleSystem {
    pub fn new(config: ModuleSystemConfig) -> Self {
        Self {
            config,
            cache: ModuleCache::new(),
            mocks: DashMap::new(),
        }
    }

    pub fn mock(&self, specifier: &str, exports: TransferredValue) {
        self.mocks.insert(specifier.to_string(), exports);
    }

    pub fn clear_mocks(&self) {
        self.mocks.clear();
    }

    /// Implements the six-step algorithm. `vfs` backs specifier resolution;
    /// `loading_stack` scopes cycle detection to the current run.
    pub fn require(
        &self,
        specifier: &str,
        from_path: &str,
        vfs: &VirtualFilesystem,
        loading_stack: &Arc<LoadingStack>,
    ) -> Result<ResolvedModule, ModuleError> {
        // Step 1: mocks bypass everything, including cycle detection.
        if let Some(mock) = self.mocks.get(specifier) {
            return Ok(ResolvedModule::Mocked(mock.clone()));
        }

        // Step 2: builtin whitelist.
        if BUILTIN_MODULES.contains(&specifier) {
            if !self.config.allow_builtins {
                return Err(ModuleError::Denied(specifier.to_string()));
            }
            // Builtins are host-provided polyfills wired up by the context
            // builder; represent them here as an opaque cached marker so
            // `require` on them is idempotent without re-resolving.
            return Ok(ResolvedModule::Cached(TransferredValue::Unknown(format!(
                "[builtin:{specifier}]"
            ))));
        }

        // Step 3: resolve relative/absolute/bare specifiers against the VFS.
        // Bare specifiers that aren't builtins and aren't found under
        // /node_modules fail as ModuleDenied, not ModuleNotFound: there is
        // no host module ecosystem fallthrough (spec §4.7).
        let resolved_path = resolver::resolve(vfs, specifier, from_path).ok_or_else(|| {
            match resolver::classify(specifier) {
                resolver::Specifier::Bare(_) => ModuleError::Denied(specifier.to_string()),
                _ => ModuleError::NotFound(specifier.to_string()),
            }
        })?;

        // Step 4: cache hit short-circuits cycle detection entirely, same
        // as a mock hit — a module already fully evaluated can't be part
        // of an in-progress cycle.
        if let Some(record) = self.cache.get(&resolved_path) {
            return Ok(ResolvedModule::Cached(record.exports));
        }

        // Step 5: cycle detection via the per-run loading stack.
        {
            let mut stack = loading_stack.stack.lock();
            if let Some(pos) = stack.iter().position(|p| p == &resolved_path) {
                let mut cycle = stack[pos..].to_vec();
                cycle.push(resolved_path.clone());
                return Err(ModuleError::CircularDependency(cycle));
            }
            stack.push(resolved_path.clone());
        }

        // Step 6: hand the source back wrapped for evaluation.
        let source = vfs
            .read(&resolved_path)
            .map_err(|_| ModuleError::NotFound(resolved_path.clone()))?;
        let source = String::from_utf8_lossy(&source).into_owned();
        Ok(ResolvedModule::NeedsEvaluation {
            resolved_path,
            source: wrap_source(&source),
        })
    }

    /// Called by the execution engine once a `NeedsEvaluation` module has
    /// run to completion, caching its exports and popping the loading
    /// stack.
    pub fn finish_load(
        &self,
        resolved_path: &str,
        exports: TransferredValue,
        loading_stack: &Arc<LoadingStack>,
    ) {
        self.cache.insert(ModuleRecord {
            resolved_path: resolved_path.to_string(),
            exports: exports.clone(),
        });
        let mut stack = loading_stack.stack.lock();
        stack.retain(|p| p != resolved_path);
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }
}

/// Wraps a module's source text in a CommonJS-style function signature, the
/// way `Module._compile` does in Node: `(exports, require, module,
/// __filename, __dirname) => { ... }`. The execution engine evaluates this
/// inside the same guest context the `require` call originated from —
/// there is no separate host-side `eval`.
pub fn wrap_source(source: &str) -> String {
    format!(
        "(function(exports, require, module, __filename, __dirname) {{\n{source}\n}})"
    )
}

/// Duplicate detection helper exposed for tests exercising the cycle
/// invariant directly without an isolate.
pub fn detect_cycle(stack: &[String], candidate: &str) -> Option<HashSet<String>> {
    if stack.contains(&candidate.to_string()) {
        Some(stack.iter().cloned().collect())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_bypasses_resolution_and_cycle_detection() {
        let system = ModuleSystem::new(ModuleSystemConfig::default());
        let vfs = VirtualFilesystem::new(1024);
        let stack = Arc::new(LoadingStack::new());
        system.mock("virtual:thing", TransferredValue::Json(serde_json::json!({"ok": true})));
        let result = system
            .require("virtual:thing", "/sandbox/index.js", &vfs, &stack)
            .unwrap();
        assert!(matches!(result, ResolvedModule::Mocked(_)));
    }

    #[test]
    fn builtin_denied_without_allow_builtins() {
        let system = ModuleSystem::new(ModuleSystemConfig { allow_builtins: false });
        let vfs = VirtualFilesystem::new(1024);
        let stack = Arc::new(LoadingStack::new());
        let result = system.require("path", "/sandbox/index.js", &vfs, &stack);
        assert!(matches!(result, Err(ModuleError::Denied(_))));
    }

    #[test]
    fn bare_specifier_without_node_modules_is_denied() {
        let system = ModuleSystem::new(ModuleSystemConfig::default());
        let vfs = VirtualFilesystem::new(1024);
        let stack = Arc::new(LoadingStack::new());
        let result = system.require("lodash", "/sandbox/index.js", &vfs, &stack);
        assert!(matches!(result, Err(ModuleError::Denied(_))));
    }

    #[test]
    fn relative_specifier_missing_is_not_found() {
        let system = ModuleSystem::new(ModuleSystemConfig::default());
        let vfs = VirtualFilesystem::new(1024);
        let stack = Arc::new(LoadingStack::new());
        let result = system.require("./missing", "/sandbox/index.js", &vfs, &stack);
        assert!(matches!(result, Err(ModuleError::NotFound(_))));
    }

    #[test]
    fn cycle_a_to_b_to_a_reports_both_nodes() {
        let system = ModuleSystem::new(ModuleSystemConfig::default());
        let vfs = VirtualFilesystem::new(1024);
        vfs.write("/sandbox/a.js", b"require('./b.js')".to_vec()).unwrap();
        vfs.write("/sandbox/b.js", b"require('./a.js')".to_vec()).unwrap();
        let stack = Arc::new(LoadingStack::new());

        let a = system.require("./a.js", "/sandbox/index.js", &vfs, &stack).unwrap();
        let ResolvedModule::NeedsEvaluation { resolved_path: a_path, .. } = a else {
            panic!("expected a.js to need evaluation");
        };
        let b = system.require("./b.js", &a_path, &vfs, &stack).unwrap();
        let ResolvedModule::NeedsEvaluation { resolved_path: b_path, .. } = b else {
            panic!("expected b.js to need evaluation");
        };
        let cycle = system.require("./a.js", &b_path, &vfs, &stack);
        match cycle {
            Err(ModuleError::CircularDependency(path)) => {
                assert!(path.contains(&a_path));
                assert!(path.contains(&b_path));
            }
            other => panic!("expected CircularDependency, got {other:?}"),
        }
    }
}
