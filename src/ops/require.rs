//! `require(specifier)`, spec §4.7/§6. Resolves through
//! [`crate::modules::ModuleSystem`], and for a module that isn't cached
//! yet, compiles and evaluates its CommonJS-wrapped source in the same
//! guest context the call originated from — there is no host-side `eval`,
//! matching spec §4.7's explicit prohibition.

use deno_core::v8;

use crate::context::ContextBuilder;
use crate::convert::TransferredValue;
use crate::modules::ResolvedModule;

fn transferred_to_v8<'s>(
    scope: &mut v8::HandleScope<'s>,
    value: TransferredValue,
) -> v8::Local<'s, v8::Value> {
    match value {
        TransferredValue::Json(json) => deno_core::serde_v8::to_v8(scope, json)
            .unwrap_or_else(|_| v8::undefined(scope).into()),
        TransferredValue::Unknown(text) => v8::String::new(scope, &text)
            .map(Into::into)
            .unwrap_or_else(|| v8::undefined(scope).into()),
    }
}

extern "C" fn require(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
    let state = ContextBuilder::state(scope);
    let Some(specifier) = args.get(0).to_string(scope).map(|s| s.to_rust_string_lossy(scope)) else {
        return;
    };
    let from_path = state.current_module_path();

    let resolved = state
        .modules
        .require(&specifier, &from_path, &state.vfs, &state.loading_stack);

    let resolved = match resolved {
        Ok(r) => r,
        Err(e) => {
            let message = v8::String::new(scope, &e.to_string()).expect("valid string");
            let exception = v8::Exception::error(scope, message);
            scope.throw_exception(exception);
            return;
        }
    };

    match resolved {
        ResolvedModule::Cached(exports) | ResolvedModule::Mocked(exports) => {
            let v8_value = transferred_to_v8(scope, exports);
            rv.set(v8_value);
        }
        ResolvedModule::NeedsEvaluation { resolved_path, source } => {
            match evaluate_module(scope, &resolved_path, &source) {
                Ok(exports) => {
                    let transferred = crate::convert::transfer_out(scope, exports);
                    state
                        .modules
                        .finish_load(&resolved_path, transferred.clone(), &state.loading_stack);
                    let v8_value = transferred_to_v8(scope, transferred);
                    rv.set(v8_value);
                }
                Err(message) => {
                    let msg = v8::String::new(scope, &message).expect("valid string");
                    let exception = v8::Exception::error(scope, msg);
                    scope.throw_exception(exception);
                }
            }
        }
    }
}

/// Compiles `wrapped_source` (already wrapped by
/// [`crate::modules::wrap_source`]) and calls it with a fresh
/// `(exports, require, module, __filename, __dirname)` tuple, pushing
/// `resolved_path` onto the context's module-path stack for the duration
/// so a nested `require` call sees the right `fromPath`.
fn evaluate_module<'s>(
    scope: &mut v8::HandleScope<'s>,
    resolved_path: &str,
    wrapped_source: &str,
) -> Result<v8::Local<'s, v8::Value>, String> {
    let state = ContextBuilder::state(scope);
    state.module_path_stack.lock().push(resolved_path.to_string());
    let result = (|| {
        let mut try_catch = v8::TryCatch::new(scope);
        let source = v8::String::new(&mut try_catch, wrapped_source)
            .ok_or_else(|| "failed to intern module source".to_string())?;
        let script = v8::Script::compile(&mut try_catch, source, None)
            .ok_or_else(|| describe_exception(&mut try_catch))?;
        let wrapper = script
            .run(&mut try_catch)
            .ok_or_else(|| describe_exception(&mut try_catch))?;
        let wrapper_fn: v8::Local<v8::Function> = wrapper
            .try_into()
            .map_err(|_| "module wrapper did not evaluate to a function".to_string())?;

        let exports = v8::Object::new(&mut try_catch);
        let module_obj = v8::Object::new(&mut try_catch);
        let exports_key = v8::String::new(&mut try_catch, "exports").unwrap();
        module_obj.set(&mut try_catch, exports_key.into(), exports.into());

        let require_key = v8::String::new(&mut try_catch, "require").unwrap();
        let require_fn = try_catch
            .get_current_context()
            .global(&mut try_catch)
            .get(&mut try_catch, require_key.into())
            .ok_or_else(|| "require is not bound on this context".to_string())?;

        let filename = v8::String::new(&mut try_catch, resolved_path).unwrap();
        let dirname_str = resolved_path.rsplit_once('/').map(|(d, _)| d).unwrap_or("/");
        let dirname = v8::String::new(&mut try_catch, dirname_str).unwrap();

        let undefined = v8::undefined(&mut try_catch).into();
        let call_result = wrapper_fn.call(
            &mut try_catch,
            undefined,
            &[
                exports.into(),
                require_fn,
                module_obj.into(),
                filename.into(),
                dirname.into(),
            ],
        );
        if call_result.is_none() {
            return Err(describe_exception(&mut try_catch));
        }

        let final_exports = module_obj
            .get(&mut try_catch, exports_key.into())
            .unwrap_or_else(|| exports.into());
        Ok(final_exports)
    })();
    state.module_path_stack.lock().pop();
    result
}

fn describe_exception(try_catch: &mut v8::TryCatch<v8::HandleScope>) -> String {
    try_catch
        .exception()
        .and_then(|e| e.to_string(try_catch))
        .map(|s| s.to_rust_string_lossy(try_catch))
        .unwrap_or_else(|| "unknown module evaluation error".to_string())
}

pub fn install(scope: &mut v8::ContextScope<v8::HandleScope>, context: v8::Local<v8::Context>) {
    let func = v8::Function::new(scope, require as v8::FunctionCallback)
        .expect("require construction cannot fail");
    let global = context.global(scope);
    let key = v8::String::new(scope, "require").expect("valid identifier");
    global.set(scope, key.into(), func.into());
}
