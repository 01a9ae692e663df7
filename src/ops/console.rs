//! `console.{log,info,warn,error,debug}`, spec §6. Grounded on the
//! teacher's `ops/console.rs` message-formatting convention, generalized
//! from the single `op_console_message(level, message)` entrypoint to one
//! callback per level so each can forward its own [`LogLevel`].

use deno_core::v8;

use crate::context::{ConsoleMode, ContextBuilder, LogLevel};

fn format_args(scope: &mut v8::HandleScope, args: &v8::FunctionCallbackArguments) -> String {
    let mut parts = Vec::with_capacity(args.length() as usize);
    for i in 0..args.length() {
        let arg = args.get(i);
        let s = arg
            .to_string(scope)
            .map(|s| s.to_rust_string_lossy(scope))
            .unwrap_or_else(|| "undefined".to_string());
        parts.push(s);
    }
    parts.join(" ")
}

fn handle(level: LogLevel, scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments) {
    let state = ContextBuilder::state(scope);
    let message = format_args(scope, &args);
    match state.console_mode {
        ConsoleMode::Off => {}
        ConsoleMode::Inherit => match level {
            LogLevel::Error => tracing::error!(execution_id = state.execution_id, %message, "guest console"),
            LogLevel::Warn => tracing::warn!(execution_id = state.execution_id, %message, "guest console"),
            LogLevel::Debug => tracing::debug!(execution_id = state.execution_id, %message, "guest console"),
            LogLevel::Log | LogLevel::Info => {
                tracing::info!(execution_id = state.execution_id, %message, "guest console")
            }
        },
        ConsoleMode::Redirect => {
            if let Some(on_output) = &state.on_output {
                on_output(level, message);
            }
        }
    }
}

extern "C" fn log(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, _rv: v8::ReturnValue) {
    handle(LogLevel::Log, scope, args)
}
extern "C" fn info(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, _rv: v8::ReturnValue) {
    handle(LogLevel::Info, scope, args)
}
extern "C" fn warn(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, _rv: v8::ReturnValue) {
    handle(LogLevel::Warn, scope, args)
}
extern "C" fn error(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, _rv: v8::ReturnValue) {
    handle(LogLevel::Error, scope, args)
}
extern "C" fn debug(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, _rv: v8::ReturnValue) {
    handle(LogLevel::Debug, scope, args)
}

pub fn install(scope: &mut v8::ContextScope<v8::HandleScope>, context: v8::Local<v8::Context>) {
    let console = v8::Object::new(scope);
    for (name, cb) in [
        ("log", log as v8::FunctionCallback),
        ("info", info as v8::FunctionCallback),
        ("warn", warn as v8::FunctionCallback),
        ("error", error as v8::FunctionCallback),
        ("debug", debug as v8::FunctionCallback),
    ] {
        let func = v8::Function::new(scope, cb).expect("console method construction cannot fail");
        let key = v8::String::new(scope, name).expect("valid identifier");
        console.set(scope, key.into(), func.into());
    }
    let global = context.global(scope);
    let console_key = v8::String::new(scope, "console").expect("valid identifier");
    global.set(scope, console_key.into(), console.into());
}
