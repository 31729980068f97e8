//! `ember-ffi` - C embedding surface for ember.
//!
//! Hosts create one runtime, open models against it, and drive generation
//! by calling `ember_step_next` at their own cadence. Generated pieces
//! stream out through per-session callbacks; sessions end on their own or
//! via `ember_session_cancel`. Every function reports an `EmberStatus` and
//! leaves details for `ember_last_error`.

mod error;
mod streaming;
mod types;

pub use types::*;

use std::ffi::CStr;
use std::os::raw::c_char;
use std::path::PathBuf;
use std::sync::Arc;

use ember_engine::{Runtime, SessionId, SessionOptions, StepOutcome};
use ember_model::{AccessMode, Model, ModelKind, ModelOptions};

use error::set_last_error;

/// Opaque runtime handle owning the worker pool, models, and sessions.
pub struct EmberRuntime {
    inner: Runtime,
}

/// Opaque model handle; a shared reference into the runtime's registry.
pub struct EmberModel {
    inner: Arc<Model>,
}

/// Execute a closure that returns an `EmberStatus`, converting panics into
/// `EmberStatus::ErrorInternal`.
fn catch_panic<F: FnOnce() -> EmberStatus + std::panic::UnwindSafe>(f: F) -> EmberStatus {
    match std::panic::catch_unwind(f) {
        Ok(status) => status,
        Err(_) => {
            set_last_error("internal panic".to_string());
            EmberStatus::ErrorInternal
        }
    }
}

fn path_arg(ptr: *const c_char, what: &str) -> Result<PathBuf, EmberStatus> {
    if ptr.is_null() {
        set_last_error(format!("{} is null", what));
        return Err(EmberStatus::ErrorInvalidArgument);
    }
    match unsafe { CStr::from_ptr(ptr) }.to_str() {
        Ok(s) => Ok(PathBuf::from(s)),
        Err(e) => {
            set_last_error(format!("invalid {}: {}", what, e));
            Err(EmberStatus::ErrorInvalidArgument)
        }
    }
}

fn string_arg(ptr: *const c_char, what: &str) -> Result<String, EmberStatus> {
    path_arg(ptr, what).map(|p| p.to_string_lossy().into_owned())
}

/// Create a runtime with `threads` workers (0 selects the default).
///
/// `api_version` must equal `EMBER_API_VERSION`; a mismatched host is
/// rejected outright. On success the caller owns the handle and must pass
/// it to `ember_runtime_destroy`.
#[no_mangle]
pub extern "C" fn ember_runtime_create(
    api_version: u32,
    threads: u32,
    runtime_out: *mut *mut EmberRuntime,
) -> EmberStatus {
    catch_panic(std::panic::AssertUnwindSafe(|| {
        if runtime_out.is_null() {
            set_last_error("runtime_out is null".to_string());
            return EmberStatus::ErrorInvalidArgument;
        }
        if api_version != EMBER_API_VERSION {
            set_last_error(format!(
                "api version mismatch: host {} vs engine {}",
                api_version, EMBER_API_VERSION
            ));
            return EmberStatus::ErrorInvalidArgument;
        }
        match Runtime::new(threads as usize) {
            Ok(inner) => {
                let rt = Box::new(EmberRuntime { inner });
                unsafe { *runtime_out = Box::into_raw(rt) };
                EmberStatus::Ok
            }
            Err(e) => {
                set_last_error(format!("failed to start runtime: {}", e));
                EmberStatus::ErrorInternal
            }
        }
    }))
}

/// Destroy a runtime and everything it owns. Live sessions are dropped
/// without their terminal callbacks; cancel them first for a clean drain.
///
/// Passing null is a no-op.
#[no_mangle]
pub unsafe extern "C" fn ember_runtime_destroy(runtime: *mut EmberRuntime) -> EmberStatus {
    if runtime.is_null() {
        return EmberStatus::Ok;
    }
    drop(Box::from_raw(runtime));
    EmberStatus::Ok
}

/// Open a checkpoint + tokenizer pair and register it under `params.name`.
///
/// The returned handle must be released with `ember_model_close`.
#[no_mangle]
pub unsafe extern "C" fn ember_model_open(
    runtime: *mut EmberRuntime,
    params: *const EmberModelParams,
    model_out: *mut *mut EmberModel,
) -> EmberStatus {
    catch_panic(std::panic::AssertUnwindSafe(|| {
        if runtime.is_null() || params.is_null() || model_out.is_null() {
            set_last_error("null argument".to_string());
            return EmberStatus::ErrorInvalidArgument;
        }
        let runtime = unsafe { &*runtime };
        let params = unsafe { &*params };

        let access = match params.access_mode {
            EmberAccessMode::Mmap => AccessMode::Mmap,
            EmberAccessMode::ReadCache => AccessMode::ReadCache {
                limit: params.cache_limit as usize,
            },
            EmberAccessMode::Direct => {
                if params.direct_base.is_null() || params.direct_len == 0 {
                    set_last_error("direct access mode without a region".to_string());
                    return EmberStatus::ErrorInvalidArgument;
                }
                AccessMode::Direct {
                    base: params.direct_base,
                    len: params.direct_len,
                }
            }
        };

        let tokenizer = match path_arg(params.tokenizer_path, "tokenizer path") {
            Ok(p) => p,
            Err(status) => return status,
        };
        // The checkpoint path goes unused in direct mode; keep it optional
        // there but required otherwise.
        let checkpoint = if matches!(params.access_mode, EmberAccessMode::Direct) {
            PathBuf::new()
        } else {
            match path_arg(params.checkpoint_path, "checkpoint path") {
                Ok(p) => p,
                Err(status) => return status,
            }
        };
        let name = match string_arg(params.name, "model name") {
            Ok(n) => n,
            Err(status) => return status,
        };

        let opts = ModelOptions {
            checkpoint,
            tokenizer,
            access,
            name,
            kind: match params.kind {
                EmberModelKind::Generate => ModelKind::Generate,
                EmberModelKind::Chat => ModelKind::Chat,
            },
            max_sessions: match params.max_sessions {
                0 => None,
                n => Some(n as usize),
            },
        };

        match runtime.inner.open_model(opts) {
            Ok(model) => {
                let handle = Box::new(EmberModel { inner: model });
                unsafe { *model_out = Box::into_raw(handle) };
                EmberStatus::Ok
            }
            Err(e) => {
                set_last_error(format!("failed to open model: {}", e));
                EmberStatus::ErrorModelLoad
            }
        }
    }))
}

/// Unregister a model and release its handle. Live sessions keep the model
/// alive until they finish; no new sessions can be opened against it.
#[no_mangle]
pub unsafe extern "C" fn ember_model_close(
    runtime: *mut EmberRuntime,
    model: *mut EmberModel,
) -> EmberStatus {
    if model.is_null() {
        return EmberStatus::Ok;
    }
    let handle = Box::from_raw(model);
    if !runtime.is_null() {
        let runtime = &*runtime;
        runtime.inner.close_model(&handle.inner.name);
    }
    drop(handle);
    EmberStatus::Ok
}

/// Open a generation session and link it into the scheduler.
///
/// The session id is written to `id_out` and, while the session lives,
/// identifies it to `ember_session_cancel`. If `params.null_on_destroy` is
/// set, the engine zeroes that slot when the session is destroyed.
#[no_mangle]
pub unsafe extern "C" fn ember_session_open(
    runtime: *mut EmberRuntime,
    model: *const EmberModel,
    params: *const EmberSessionParams,
    id_out: *mut u64,
) -> EmberStatus {
    catch_panic(std::panic::AssertUnwindSafe(|| {
        if runtime.is_null() || model.is_null() || params.is_null() || id_out.is_null() {
            set_last_error("null argument".to_string());
            return EmberStatus::ErrorInvalidArgument;
        }
        let runtime = unsafe { &*runtime };
        let model = unsafe { &*model };
        let params = unsafe { &*params };

        let prompt = match string_arg(params.prompt, "prompt") {
            Ok(p) => p,
            Err(status) => return status,
        };
        let system_prompt = if params.system_prompt.is_null() {
            None
        } else {
            match string_arg(params.system_prompt, "system prompt") {
                Ok(s) => Some(s),
                Err(status) => return status,
            }
        };

        let opts = SessionOptions {
            prompt,
            system_prompt,
            temperature: params.temperature,
            topp: params.topp,
            rng_seed: params.rng_seed,
            limit: params.limit as usize,
            sink: streaming::sink_from(params.emit, params.user_data),
            on_release: streaming::null_on_destroy_hook(params.null_on_destroy),
        };

        match runtime.inner.open_session(&model.inner, opts) {
            Ok(id) => {
                unsafe { *id_out = id.0 };
                EmberStatus::Ok
            }
            Err(e) => {
                set_last_error(format!("failed to open session: {}", e));
                match e {
                    ember_engine::EngineError::SessionLimit { .. }
                    | ember_engine::EngineError::SessionAlloc(_) => EmberStatus::ErrorOutOfMemory,
                    _ => EmberStatus::ErrorSession,
                }
            }
        }
    }))
}

/// Mark a session for termination. It is destroyed (terminal callback,
/// slot zeroed, state freed) by the next step that targets it.
#[no_mangle]
pub unsafe extern "C" fn ember_session_cancel(
    runtime: *mut EmberRuntime,
    session_id: u64,
) -> EmberStatus {
    catch_panic(std::panic::AssertUnwindSafe(|| {
        if runtime.is_null() {
            set_last_error("runtime is null".to_string());
            return EmberStatus::ErrorInvalidArgument;
        }
        let runtime = unsafe { &*runtime };
        if runtime.inner.cancel(SessionId(session_id)) {
            EmberStatus::Ok
        } else {
            set_last_error(format!("no live session {}", session_id));
            EmberStatus::ErrorInvalidArgument
        }
    }))
}

/// Advance the head session by one token.
///
/// Writes what happened to `state_out` and, unless null, the affected
/// session's id to `session_out` (0 when idle). Call in a loop to drive all
/// live sessions round-robin.
#[no_mangle]
pub unsafe extern "C" fn ember_step_next(
    runtime: *mut EmberRuntime,
    session_out: *mut u64,
    state_out: *mut EmberStepState,
) -> EmberStatus {
    catch_panic(std::panic::AssertUnwindSafe(|| {
        if runtime.is_null() || state_out.is_null() {
            set_last_error("null argument".to_string());
            return EmberStatus::ErrorInvalidArgument;
        }
        let runtime = unsafe { &*runtime };
        let (state, id) = match runtime.inner.step_next() {
            StepOutcome::Idle => (EmberStepState::Idle, 0),
            StepOutcome::Stepped(id) => (EmberStepState::Stepped, id.0),
            StepOutcome::Finished(id) => (EmberStepState::Finished, id.0),
        };
        unsafe {
            *state_out = state;
            if !session_out.is_null() {
                *session_out = id;
            }
        }
        EmberStatus::Ok
    }))
}

/// Retrieve the last error message.
///
/// Returns a heap-allocated C string or null if no error has occurred. The
/// caller must free it with `ember_free_string`.
#[no_mangle]
pub extern "C" fn ember_last_error() -> *const c_char {
    match error::take_last_error() {
        Some(e) => e.into_raw(),
        None => std::ptr::null(),
    }
}

/// Free a string previously returned by `ember_last_error`.
#[no_mangle]
pub unsafe extern "C" fn ember_free_string(s: *mut c_char) {
    if !s.is_null() {
        drop(std::ffi::CString::from_raw(s));
    }
}
