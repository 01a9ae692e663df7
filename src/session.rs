//! Session Manager, spec §4.9. A session pins a bag of serializable state
//! across repeated `run` calls against the same sandbox, with a TTL and an
//! optional execution-count ceiling, swept by a background task on the
//! same periodic-sweep shape as [`crate::isolate_manager`]'s pool
//! top-up — a table behind a lock, checked and pruned on a `tokio::time::interval`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::engine::{ExecutionEngine, RunRequest, RunResult};
use crate::error::KernelError;

pub struct SessionConfig {
    pub ttl_ms: u64,
    pub max_executions: Option<u64>,
    pub sweep_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 300_000,
            max_executions: None,
            sweep_interval_ms: 30_000,
        }
    }
}

/// Arbitrary JSON-serializable state a session carries between runs, spec
/// §4.9's `session.state`. Kept separate from the guest's own global scope:
/// each run still gets a fresh V8 context (spec §4.2 step 3), so session
/// state crosses the host/guest boundary the same way `sandbox` values do
/// on a [`RunRequest`], not by keeping a context alive.
pub type SessionState = HashMap<String, serde_json::Value>;

struct SessionInner {
    state: Mutex<SessionState>,
    created_at: Instant,
    last_used_at: Mutex<Instant>,
    execution_count: AtomicU64,
    ttl_ms: u64,
    max_executions: Option<u64>,
}

/// A handle to one session's state and usage bookkeeping. Cheap to clone;
/// the [`SessionManager`] is the single owner of the underlying table.
#[derive(Clone)]
pub struct Session {
    id: String,
    inner: Arc<SessionInner>,
}

impl Session {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> Instant {
        self.inner.created_at
    }

    pub fn last_used_at(&self) -> Instant {
        *self.inner.last_used_at.lock()
    }

    pub fn execution_count(&self) -> u64 {
        self.inner.execution_count.load(Ordering::Relaxed)
    }

    pub fn get_state(&self) -> SessionState {
        self.inner.state.lock().clone()
    }

    pub fn set_state(&self, key: impl Into<String>, value: serde_json::Value) {
        self.inner.state.lock().insert(key.into(), value);
    }

    pub fn clear_state(&self) {
        self.inner.state.lock().clear();
    }

    /// spec §3: `expired ⇔ now − createdAt > ttlMs`. The TTL is anchored to
    /// creation, not last access — a session does not renew itself by being
    /// used.
    fn is_expired(&self) -> bool {
        self.inner.created_at.elapsed() > Duration::from_millis(self.inner.ttl_ms)
    }

    fn at_max_executions(&self) -> bool {
        match self.inner.max_executions {
            Some(max) => self.execution_count() >= max,
            None => false,
        }
    }

    fn touch(&self) {
        *self.inner.last_used_at.lock() = Instant::now();
        self.inner.execution_count.fetch_add(1, Ordering::Relaxed);
    }
}

/// Keeps a table of named sessions alive for their TTL, sweeping expired
/// entries on a background task. `run` on a session merges its stashed
/// `sandbox` state into the request before delegating to the
/// [`ExecutionEngine`], the way `environment/mod.rs`'s request-scoped
/// globals get threaded into each UDF call in the teacher.
pub struct SessionManager {
    sessions: Arc<DashMap<String, Session>>,
    config: Arc<SessionConfig>,
    engine: Arc<ExecutionEngine>,
    next_id: AtomicU64,
}

impl SessionManager {
    pub fn new(engine: Arc<ExecutionEngine>, config: SessionConfig) -> Arc<Self> {
        let manager = Arc::new(Self {
            sessions: Arc::new(DashMap::new()),
            config: Arc::new(config),
            engine,
            next_id: AtomicU64::new(1),
        });
        manager.clone().spawn_sweeper();
        manager
    }

    fn spawn_sweeper(self: Arc<Self>) {
        let interval_ms = self.config.sweep_interval_ms;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            loop {
                ticker.tick().await;
                self.sweep_expired();
            }
        });
    }

    fn sweep_expired(&self) {
        self.sessions.retain(|_, session| !session.is_expired());
    }

    /// Creates a session with a generated id, e.g. `session-17`.
    pub fn create_session(&self) -> Session {
        let id = format!("session-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        self.create_session_with_id(id)
    }

    pub fn create_session_with_id(&self, id: impl Into<String>) -> Session {
        let id = id.into();
        let session = Session {
            id: id.clone(),
            inner: Arc::new(SessionInner {
                state: Mutex::new(SessionState::new()),
                created_at: Instant::now(),
                last_used_at: Mutex::new(Instant::now()),
                execution_count: AtomicU64::new(0),
                ttl_ms: self.config.ttl_ms,
                max_executions: self.config.max_executions,
            }),
        };
        self.sessions.insert(id, session.clone());
        session
    }

    pub fn get_session(&self, id: &str) -> Result<Session, KernelError> {
        let session = self
            .sessions
            .get(id)
            .map(|entry| entry.clone())
            .ok_or_else(|| KernelError::SessionNotFound(id.to_string()))?;
        if session.is_expired() {
            self.sessions.remove(id);
            return Err(KernelError::SessionExpired(id.to_string()));
        }
        Ok(session)
    }

    pub fn delete_session(&self, id: &str) -> bool {
        self.sessions.remove(id).is_some()
    }

    pub fn list_sessions(&self) -> Vec<String> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Runs `request` against `session_id`'s state, spec §4.9: its
    /// `sandbox` values (if not already set on the request) are merged in
    /// before delegating to [`ExecutionEngine::execute`], and the session's
    /// usage counters are updated afterward regardless of the run's outcome.
    pub async fn run(
        &self,
        session_id: &str,
        mut request: RunRequest,
    ) -> Result<RunResult, KernelError> {
        let session = self.get_session(session_id)?;
        if session.at_max_executions() {
            return Err(KernelError::SessionMaxExecutionsReached(session_id.to_string()));
        }

        for (key, value) in session.get_state() {
            request.sandbox.entry(key).or_insert(value);
        }

        let result = self.engine.execute(request).await;
        session.touch();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::isolate_manager::{IsolateManager, IsolateManagerConfig};
    use crate::modules::{ModuleSystem, ModuleSystemConfig};
    use crate::vfs::VirtualFilesystem;

    fn test_manager(config: SessionConfig) -> Arc<SessionManager> {
        let isolates = IsolateManager::new(IsolateManagerConfig {
            max_isolates: 2,
            min_idle: 1,
            memory_limit_bytes: 32 << 20,
        });
        let vfs = Arc::new(VirtualFilesystem::new(1 << 20));
        let modules = Arc::new(ModuleSystem::new(ModuleSystemConfig::default()));
        let engine = Arc::new(ExecutionEngine::new(
            isolates,
            vfs,
            modules,
            EventBus::default(),
            crate::engine::ExecutionEngineConfig::default(),
        ));
        SessionManager::new(engine, config)
    }

    #[tokio::test]
    async fn session_state_round_trips() {
        let manager = test_manager(SessionConfig::default());
        let session = manager.create_session();
        session.set_state("count", serde_json::json!(1));
        let fetched = manager.get_session(session.id()).unwrap();
        assert_eq!(fetched.get_state().get("count"), Some(&serde_json::json!(1)));
    }

    #[tokio::test]
    async fn expired_session_is_rejected() {
        let manager = test_manager(SessionConfig {
            ttl_ms: 10,
            max_executions: None,
            sweep_interval_ms: 5,
        });
        let session = manager.create_session();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let result = manager.get_session(session.id());
        assert!(matches!(result, Err(KernelError::SessionExpired(_))));
    }

    #[tokio::test]
    async fn max_executions_is_enforced() {
        let manager = test_manager(SessionConfig {
            ttl_ms: 60_000,
            max_executions: Some(1),
            sweep_interval_ms: 30_000,
        });
        let session = manager.create_session();
        let first = manager.run(session.id(), RunRequest::new("1")).await;
        assert!(first.is_ok());
        let second = manager.run(session.id(), RunRequest::new("1")).await;
        assert!(matches!(
            second,
            Err(KernelError::SessionMaxExecutionsReached(_))
        ));
    }

    #[tokio::test]
    async fn deleted_session_is_not_found() {
        let manager = test_manager(SessionConfig::default());
        let session = manager.create_session();
        assert!(manager.delete_session(session.id()));
        let result = manager.get_session(session.id());
        assert!(matches!(result, Err(KernelError::SessionNotFound(_))));
    }
}
