//! Host⇄guest value transfer, grounded on the teacher's `convert_v8.rs`
//! `FromV8`/`ToV8` trait pair over `serde_v8`. Spec §4.2 step 6 requires:
//! primitives transferred by copy, containers (objects/arrays) transferred
//! by deep copy, and opaque references (functions, symbols, anything that
//! doesn't survive a JSON round trip) surfaced as [`TransferredValue::Unknown`]
//! rather than as a live reference back into the guest isolate. Host
//! functions must never be handed to guest code as values; that
//! restriction lives in [`crate::context`], not here.

use deno_core::{serde_v8, v8};
use serde::{Deserialize, Serialize};

/// The result of pulling a V8 value back across the isolate boundary.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum TransferredValue {
    Json(serde_json::Value),
    /// A value that isn't representable as JSON (a function, symbol,
    /// `BigInt`, or similar). Spec §4.2: "never return host functions as
    /// guest values" — the inverse direction is handled here by coercing
    /// anything opaque to its string form instead of leaking a `v8::Local`.
    Unknown(String),
}

pub(crate) trait FromV8 {
    type Output: Sized;
    fn from_v8<'s>(
        scope: &mut v8::HandleScope<'s>,
        input: v8::Local<'s, v8::Value>,
    ) -> anyhow::Result<Self::Output>;
}

impl<T: for<'de> Deserialize<'de>> FromV8 for T {
    type Output = Self;

    fn from_v8<'s>(
        scope: &mut v8::HandleScope<'s>,
        input: v8::Local<'s, v8::Value>,
    ) -> anyhow::Result<Self> {
        serde_v8::from_v8(scope, input).map_err(|e| anyhow::anyhow!("value conversion failed: {e}"))
    }
}

pub(crate) trait ToV8: Sized {
    fn to_v8<'s>(self, scope: &mut v8::HandleScope<'s>) -> anyhow::Result<v8::Local<'s, v8::Value>>;
}

impl<T: Serialize> ToV8 for T {
    fn to_v8<'s>(self, scope: &mut v8::HandleScope<'s>) -> anyhow::Result<v8::Local<'s, v8::Value>> {
        Ok(serde_v8::to_v8(scope, self)?)
    }
}

/// Pulls a guest value out of the isolate per spec §4.2 step 6. Primitives
/// and JSON-shaped containers become [`TransferredValue::Json`]; anything
/// else (functions, symbols, values with circular references that
/// `serde_v8` refuses) becomes [`TransferredValue::Unknown`] holding the
/// guest's own `String(value)` coercion, never a live handle.
pub(crate) fn transfer_out<'s>(
    scope: &mut v8::HandleScope<'s>,
    value: v8::Local<'s, v8::Value>,
) -> TransferredValue {
    if value.is_function() || value.is_symbol() || value.is_proxy() {
        return TransferredValue::Unknown(describe(scope, value));
    }
    match serde_v8::from_v8::<serde_json::Value>(scope, value) {
        Ok(json) => TransferredValue::Json(json),
        Err(_) => TransferredValue::Unknown(describe(scope, value)),
    }
}

fn describe<'s>(scope: &mut v8::HandleScope<'s>, value: v8::Local<'s, v8::Value>) -> String {
    value
        .to_string(scope)
        .map(|s| s.to_rust_string_lossy(scope))
        .unwrap_or_else(|| "<unrepresentable value>".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_value_round_trips_through_serde() {
        let v = serde_json::json!({"a": 1, "b": [true, null, "x"]});
        let encoded: TransferredValue = TransferredValue::Json(v.clone());
        match encoded {
            TransferredValue::Json(inner) => assert_eq!(inner, v),
            TransferredValue::Unknown(_) => panic!("expected Json variant"),
        }
    }
}
