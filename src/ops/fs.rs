//! `$fs.{write,read,exists,readdir,mkdir,delete,stat}`, spec §6, bound
//! directly onto [`crate::vfs::VirtualFilesystem`] when
//! `filesystem.enabled` is set on the context. No teacher counterpart
//! exists (Convex's isolate has no guest-visible filesystem); grounded on
//! the teacher's op-installation shape, applied to a new surface.

use deno_core::v8;

use crate::context::ContextBuilder;
use crate::convert::ToV8;
use crate::vfs::VfsError;

fn arg_string(scope: &mut v8::HandleScope, args: &v8::FunctionCallbackArguments, i: i32) -> Option<String> {
    let value = args.get(i);
    value.to_string(scope).map(|s| s.to_rust_string_lossy(scope))
}

fn throw_vfs_error(scope: &mut v8::HandleScope, err: VfsError) {
    let message = v8::String::new(scope, &err.to_string()).expect("valid string");
    let exception = v8::Exception::error(scope, message);
    scope.throw_exception(exception);
}

extern "C" fn write(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
    let state = ContextBuilder::state(scope);
    let Some(path) = arg_string(scope, &args, 0) else {
        return;
    };
    let bytes = match args.get(1).to_string(scope) {
        Some(s) => s.to_rust_string_lossy(scope).into_bytes(),
        None => Vec::new(),
    };
    match state.vfs.write(&path, bytes) {
        Ok(()) => rv.set_bool(true),
        Err(e) => throw_vfs_error(scope, e),
    }
}

extern "C" fn read(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
    let state = ContextBuilder::state(scope);
    let Some(path) = arg_string(scope, &args, 0) else {
        return;
    };
    match state.vfs.read(&path) {
        Ok(bytes) => {
            let text = String::from_utf8_lossy(&bytes).into_owned();
            if let Some(v) = v8::String::new(scope, &text) {
                rv.set(v.into());
            }
        }
        Err(e) => throw_vfs_error(scope, e),
    }
}

extern "C" fn exists(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
    let state = ContextBuilder::state(scope);
    let Some(path) = arg_string(scope, &args, 0) else {
        return;
    };
    rv.set_bool(state.vfs.stat(&path).is_ok());
}

extern "C" fn readdir(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
    let state = ContextBuilder::state(scope);
    let Some(path) = arg_string(scope, &args, 0) else {
        return;
    };
    match state.vfs.readdir(&path) {
        Ok(entries) => {
            if let Ok(v) = entries.to_v8(scope) {
                rv.set(v);
            }
        }
        Err(e) => throw_vfs_error(scope, e),
    }
}

extern "C" fn mkdir(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
    let state = ContextBuilder::state(scope);
    let Some(path) = arg_string(scope, &args, 0) else {
        return;
    };
    let recursive_arg = args.get(1);
    let recursive = if recursive_arg.is_undefined() {
        true
    } else {
        recursive_arg.boolean_value(scope)
    };
    match state.vfs.mkdir(&path, recursive) {
        Ok(()) => rv.set_bool(true),
        Err(e) => throw_vfs_error(scope, e),
    }
}

extern "C" fn delete_(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
    let state = ContextBuilder::state(scope);
    let Some(path) = arg_string(scope, &args, 0) else {
        return;
    };
    let recursive_arg = args.get(1);
    let recursive = !recursive_arg.is_undefined() && recursive_arg.boolean_value(scope);
    match state.vfs.delete(&path, recursive) {
        Ok(()) => rv.set_bool(true),
        Err(e) => throw_vfs_error(scope, e),
    }
}

extern "C" fn stat(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
    let state = ContextBuilder::state(scope);
    let Some(path) = arg_string(scope, &args, 0) else {
        return;
    };
    match state.vfs.stat(&path) {
        Ok(stat) => {
            let obj = v8::Object::new(scope);
            let is_dir_key = v8::String::new(scope, "isDirectory").unwrap();
            let is_dir_val = v8::Boolean::new(scope, stat.is_directory);
            obj.set(scope, is_dir_key.into(), is_dir_val.into());
            let size_key = v8::String::new(scope, "sizeBytes").unwrap();
            let size_val = v8::Number::new(scope, stat.size_bytes as f64);
            obj.set(scope, size_key.into(), size_val.into());
            let perm_key = v8::String::new(scope, "permissions").unwrap();
            let perm_val = v8::Number::new(scope, stat.permissions as f64);
            obj.set(scope, perm_key.into(), perm_val.into());
            rv.set(obj.into());
        }
        Err(e) => throw_vfs_error(scope, e),
    }
}

pub fn install(scope: &mut v8::ContextScope<v8::HandleScope>, context: v8::Local<v8::Context>) {
    let fs_obj = v8::Object::new(scope);
    for (name, cb) in [
        ("write", write as v8::FunctionCallback),
        ("read", read as v8::FunctionCallback),
        ("exists", exists as v8::FunctionCallback),
        ("readdir", readdir as v8::FunctionCallback),
        ("mkdir", mkdir as v8::FunctionCallback),
        ("delete", delete_ as v8::FunctionCallback),
        ("stat", stat as v8::FunctionCallback),
    ] {
        let func = v8::Function::new(scope, cb).expect("fs method construction cannot fail");
        let key = v8::String::new(scope, name).expect("valid identifier");
        fs_obj.set(scope, key.into(), func.into());
    }
    let global = context.global(scope);
    let fs_key = v8::String::new(scope, "$fs").expect("valid identifier");
    global.set(scope, fs_key.into(), fs_obj.into());
}
