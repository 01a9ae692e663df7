//! `$env`, spec §6: a read-only copy of the run's environment variables.
//! Grounded on the teacher's `op_environment_variables_get`, installed here
//! as a frozen plain object instead of a getter op since the whole map is
//! copied up front rather than queried key by key.

use deno_core::v8;

use crate::context::ContextBuilder;

pub fn install(scope: &mut v8::ContextScope<v8::HandleScope>, context: v8::Local<v8::Context>) {
    let state = ContextBuilder::state(scope);
    let env_obj = v8::Object::new(scope);
    for (key, value) in &state.env {
        let k = v8::String::new(scope, key).expect("valid identifier");
        let v = v8::String::new(scope, value).expect("valid string");
        env_obj.set(scope, k.into(), v.into());
    }
    env_obj.set_integrity_level(scope, v8::IntegrityLevel::Frozen);
    let global = context.global(scope);
    let env_key = v8::String::new(scope, "$env").expect("valid identifier");
    global.set(scope, env_key.into(), env_obj.into());
}
