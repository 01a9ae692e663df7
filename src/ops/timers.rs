//! `setTimeout`/`setInterval`/`clearTimeout`/`clearInterval`, spec §4.5/§6.
//! Guest callbacks are held as opaque host-side `v8::Global<Function>`
//! handles keyed by a numeric id the guest never gets to dereference
//! directly. Registration is the only half of the contract this crate
//! implements: a run is one synchronous `Script::run` call with no event
//! loop turn boundary to drain callbacks at, so a registered timer never
//! fires within the run that registered it. `due_timers` exists for a host
//! that adds a turn loop around `run_source_in_isolate` later; nothing in
//! this crate calls it yet.

use std::time::{Duration, Instant};

use deno_core::v8;

use crate::context::{ContextBuilder, TimerHandle};

extern "C" fn set_timeout(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
    register(scope, args, &mut rv, false);
}

extern "C" fn set_interval(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
    register(scope, args, &mut rv, true);
}

fn register(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    rv: &mut v8::ReturnValue,
    repeating: bool,
) {
    let state = ContextBuilder::state(scope);
    if !state.allow_timers {
        let message = v8::String::new(scope, "timers are disabled for this sandbox").unwrap();
        let exception = v8::Exception::type_error(scope, message);
        scope.throw_exception(exception);
        return;
    }
    let Ok(callback): Result<v8::Local<v8::Function>, _> = args.get(0).try_into() else {
        let message = v8::String::new(scope, "first argument to setTimeout must be a function").unwrap();
        let exception = v8::Exception::type_error(scope, message);
        scope.throw_exception(exception);
        return;
    };
    let interval_ms = args.get(1).number_value(scope).unwrap_or(0.0).max(0.0) as u64;

    let id = state.alloc_timer_id();
    let global_callback = v8::Global::new(scope, callback);
    state.timers.lock().insert(
        id,
        TimerHandle {
            callback: global_callback,
            repeating,
            interval_ms,
        },
    );
    rv.set_double(id as f64);
}

extern "C" fn clear_timeout(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
    let state = ContextBuilder::state(scope);
    if let Some(id) = args.get(0).number_value(scope) {
        state.timers.lock().remove(&(id as u64));
    }
    rv.set_bool(true);
}

pub fn install(scope: &mut v8::ContextScope<v8::HandleScope>, context: v8::Local<v8::Context>) {
    let global = context.global(scope);
    for (name, cb) in [
        ("setTimeout", set_timeout as v8::FunctionCallback),
        ("setInterval", set_interval as v8::FunctionCallback),
        ("clearTimeout", clear_timeout as v8::FunctionCallback),
        ("clearInterval", clear_timeout as v8::FunctionCallback),
    ] {
        let func = v8::Function::new(scope, cb).expect("timer function construction cannot fail");
        let key = v8::String::new(scope, name).expect("valid identifier");
        global.set(scope, key.into(), func.into());
    }
}

/// Due timers are invoked by [`crate::engine::ExecutionEngine`] between
/// turns of a run, never concurrently with guest JS already on the stack.
/// This type is just a scheduling record; invocation happens through the
/// isolate's own `Function::call`, in `engine.rs`.
pub struct DueTimer {
    pub id: u64,
    pub callback: v8::Global<v8::Function>,
}

pub fn due_timers(scope: &mut v8::HandleScope, now: Instant, started_at: Instant) -> Vec<DueTimer> {
    let state = ContextBuilder::state(scope);
    let elapsed = now.duration_since(started_at);
    let mut due = Vec::new();
    let mut timers = state.timers.lock();
    let ready_ids: Vec<u64> = timers
        .iter()
        .filter(|(_, t)| elapsed >= Duration::from_millis(t.interval_ms))
        .map(|(id, _)| *id)
        .collect();
    for id in ready_ids {
        if let Some(timer) = timers.get(&id) {
            due.push(DueTimer {
                id,
                callback: v8::Global::new(scope, v8::Local::new(scope, &timer.callback)),
            });
        }
        if timers.get(&id).map(|t| !t.repeating).unwrap_or(false) {
            timers.remove(&id);
        }
    }
    due
}
