//! Error Sanitizer, spec §4.8. Classifies a raw guest/host error into a
//! [`SanitizedError`], scrubbing host paths out of stack traces and
//! refusing to surface messages that look like they contain secrets.
//! Grounded on the teacher's `error.rs` source-mapped traceback formatting
//! (`nicely_show_line_number_on_error`), generalized from Convex's
//! `convex:` URL scheme to this crate's plain guest filenames.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{ErrorKind, SanitizedError};

static HOST_PATH_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:/Users/[^/\s:]+|/home/[^/\s:]+|/tmp/[^/\s:]+|[A-Za-z]:\\Users\\[^\\:]+)")
        .expect("static regex is valid")
});

static NODE_MODULES_FRAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^\n]*node_modules[^\n]*\n?").expect("static regex is valid"));

static HOST_FRAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\s*at .*(?:internal/|node:internal|host_runtime)[^\n]*\n?")
        .expect("static regex is valid")
});

static GUEST_FRAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^(\s*at .*)\(?([\w./-]+\.(?:js|ts)):(\d+):(\d+)\)?").expect("static regex is valid"));

static SECRET_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\.env|secret|token|password|api[_-]?key").expect("static regex is valid"));

/// A raw error as read off a V8 exception, before sanitization.
pub struct RawError {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
}

pub struct ErrorSanitizer;

impl ErrorSanitizer {
    /// Classifies `name` into a [`ErrorKind`], spec §4.8.
    pub fn classify_name(name: &str) -> ErrorKind {
        match name {
            "ReferenceError" => ErrorKind::Reference,
            "TypeError" => ErrorKind::Type,
            "SyntaxError" => ErrorKind::Syntax,
            "RangeError" => ErrorKind::Range,
            _ => ErrorKind::Unknown,
        }
    }

    /// Scrubs absolute host paths, `node_modules` frames, and host-runtime
    /// internal frames out of a stack trace, rewriting surviving guest
    /// frames to `[sandbox:line:col]`. Windows-style paths are scrubbed the
    /// same as POSIX ones.
    pub fn scrub_stack(stack: &str) -> String {
        let without_node_modules = NODE_MODULES_FRAME.replace_all(stack, "");
        let without_host_frames = HOST_FRAME.replace_all(&without_node_modules, "");
        let rewritten = GUEST_FRAME.replace_all(&without_host_frames, "$1[sandbox:$3:$4]");
        HOST_PATH_PATTERN.replace_all(&rewritten, "[redacted]").into_owned()
    }

    /// Extracts the first `line:col` pair out of an already-scrubbed guest
    /// stack frame, if one survived scrubbing.
    pub fn extract_location(scrubbed_stack: &str) -> Option<(u32, u32)> {
        let caps = Regex::new(r"\[sandbox:(\d+):(\d+)\]")
            .expect("static regex is valid")
            .captures(scrubbed_stack)?;
        let line = caps.get(1)?.as_str().parse().ok()?;
        let column = caps.get(2)?.as_str().parse().ok()?;
        Some((line, column))
    }

    /// Builds a three-line context window around `line` (1-indexed) with
    /// `> ` marking the offending line, spec §4.8.
    pub fn code_context(source: &str, line: u32) -> Option<String> {
        if line == 0 {
            return None;
        }
        let lines: Vec<&str> = source.lines().collect();
        let idx = (line - 1) as usize;
        let start = idx.saturating_sub(1);
        let end = (idx + 2).min(lines.len());
        if idx >= lines.len() {
            return None;
        }
        let mut out = String::new();
        for (i, text) in lines[start..end].iter().enumerate() {
            let lineno = start + i + 1;
            let marker = if lineno == line as usize { "> " } else { "  " };
            out.push_str(&format!("{marker}{lineno} | {text}\n"));
        }
        Some(out)
    }

    /// Replaces a message that matches a secret-looking pattern (home
    /// directories, `.env`, or case-insensitive secret/key/token/password)
    /// with a generic message, preserving `kind` and location.
    pub fn redact_message(message: &str) -> Option<&'static str> {
        if SECRET_PATTERN.is_match(message) || HOST_PATH_PATTERN.is_match(message) {
            Some("An internal error occurred while executing the script.")
        } else {
            None
        }
    }

    pub fn sanitize(raw: RawError, source: Option<&str>) -> SanitizedError {
        let kind = Self::classify_name(&raw.name);
        let scrubbed_stack = raw.stack.as_deref().map(Self::scrub_stack);
        let location = scrubbed_stack.as_deref().and_then(Self::extract_location);

        let message = Self::redact_message(&raw.message)
            .map(str::to_string)
            .unwrap_or(raw.message);

        let mut sanitized = SanitizedError::new(kind, message);
        if let Some((line, column)) = location {
            sanitized = sanitized.with_location(line, column);
            if let Some(source) = source {
                if let Some(context) = Self::code_context(source, line) {
                    sanitized = sanitized.with_code_context(context);
                }
            }
        }
        if let Some(stack) = scrubbed_stack {
            sanitized = sanitized.with_stack(stack);
        }
        sanitized
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scrubbed_stack_excludes_host_paths_and_node_modules() {
        let stack = "TypeError: boom\n    at /Users/me/project/node_modules/foo/index.js:3:1\n    at /home/me/app.js:10:2\n    at C:\\Users\\me\\app.js:4:5\n";
        let scrubbed = ErrorSanitizer::scrub_stack(stack);
        assert!(!scrubbed.contains("/Users/"));
        assert!(!scrubbed.contains("/home/"));
        assert!(!scrubbed.contains("C:\\Users"));
        assert!(!scrubbed.contains("node_modules"));
    }

    #[test]
    fn scrubbed_stack_keeps_sandbox_location_when_present() {
        let stack = "ReferenceError: x is not defined\n    at guest.js:7:13\n";
        let scrubbed = ErrorSanitizer::scrub_stack(stack);
        assert!(scrubbed.contains("[sandbox:7:13]"));
        assert_eq!(ErrorSanitizer::extract_location(&scrubbed), Some((7, 13)));
    }

    #[test]
    fn secret_like_messages_are_redacted() {
        assert!(ErrorSanitizer::redact_message("missing API_KEY in /home/user/.env").is_some());
        assert!(ErrorSanitizer::redact_message("x is not defined").is_none());
    }

    #[test]
    fn code_context_marks_offending_line() {
        let source = "const a = 1;\nconst b = a.missing();\nconsole.log(b);\n";
        let context = ErrorSanitizer::code_context(source, 2).unwrap();
        assert!(context.contains("> 2 |"));
        assert!(context.contains("  1 |"));
        assert!(context.contains("  3 |"));
    }
}
