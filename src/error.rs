//! Two error families: [`KernelError`] for internal/fatal failures (spec
//! §7 band 3, the only band surfaced as a Rust `Err`), and [`SanitizedError`]
//! for run-level failures (spec §7 band 2), which always travel as data on
//! [`crate::engine::RunResult`].

use thiserror::Error;

/// Internal/fatal error band. Mirrors the split between the teacher's
/// `TerminationReason` (isolate-fatal) and its ordinary `anyhow::Error`
/// plumbing: these are bugs or environment failures, never something a
/// guest script can trigger through ordinary misbehavior.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KernelError {
    #[error("isolate pool exhausted: no idle isolate available within {waited_ms}ms")]
    PoolExhausted { waited_ms: u64 },

    #[error("isolate pool is shutting down")]
    PoolShuttingDown,

    #[error("session {0:?} not found")]
    SessionNotFound(String),

    #[error("session {0:?} has expired")]
    SessionExpired(String),

    #[error("session {0:?} has reached its maximum execution count")]
    SessionMaxExecutionsReached(String),

    #[error("virtual filesystem quota underflow while deleting {path:?}")]
    QuotaUnderflow { path: String },

    #[error("invalid run request: {0}")]
    InvalidRunRequest(String),

    #[error("internal channel disconnected: {0}")]
    ChannelClosed(&'static str),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Stable machine-readable error classification, spec §3/§6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    Reference,
    Type,
    Syntax,
    Range,
    Timeout,
    CpuLimit,
    MemoryLimit,
    Quota,
    Permission,
    NotFound,
    DirectoryNotEmpty,
    CircularDependency,
    ModuleDenied,
    ModuleNotFound,
    Runtime,
    Unknown,
}

impl ErrorKind {
    /// The stable `code` string from spec §6's error taxonomy table.
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::Reference => "REFERENCE_ERROR",
            ErrorKind::Type => "TYPE_ERROR",
            ErrorKind::Syntax => "SYNTAX_ERROR",
            ErrorKind::Range => "RANGE_ERROR",
            ErrorKind::Timeout => "TIMEOUT_ERROR",
            ErrorKind::CpuLimit => "CPU_LIMIT_ERROR",
            ErrorKind::MemoryLimit => "MEMORY_LIMIT_ERROR",
            ErrorKind::Quota => "QUOTA_EXCEEDED",
            ErrorKind::Permission => "PERMISSION_DENIED",
            ErrorKind::NotFound => "FILE_NOT_FOUND",
            ErrorKind::DirectoryNotEmpty => "DIRECTORY_NOT_EMPTY",
            ErrorKind::CircularDependency => "CIRCULAR_DEPENDENCY",
            ErrorKind::ModuleDenied => "MODULE_DENIED",
            ErrorKind::ModuleNotFound => "MODULE_NOT_FOUND",
            ErrorKind::Runtime => "RUNTIME_ERROR",
            ErrorKind::Unknown => "UNKNOWN_ERROR",
        }
    }
}

/// A host/guest-boundary-safe error, spec §3. Constructed only by
/// [`crate::sanitizer::ErrorSanitizer`].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SanitizedError {
    pub kind: ErrorKind,
    pub message: String,
    pub code: &'static str,
    pub line: Option<u32>,
    pub column: Option<u32>,
    pub sanitized_stack: Option<String>,
    pub code_context: Option<String>,
}

impl SanitizedError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            code: kind.code(),
            line: None,
            column: None,
            sanitized_stack: None,
            code_context: None,
        }
    }

    pub fn with_location(mut self, line: u32, column: u32) -> Self {
        self.line = Some(line);
        self.column = Some(column);
        self
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.sanitized_stack = Some(stack.into());
        self
    }

    pub fn with_code_context(mut self, context: impl Into<String>) -> Self {
        self.code_context = Some(context.into());
        self
    }
}

impl std::fmt::Display for SanitizedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}
