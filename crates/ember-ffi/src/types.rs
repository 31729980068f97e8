use std::os::raw::{c_char, c_void};

/// Version of this embedding surface. `ember_runtime_create` rejects hosts
/// built against any other version.
pub const EMBER_API_VERSION: u32 = 1;

/// Status codes returned by all FFI functions.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EmberStatus {
    Ok = 0,
    ErrorInvalidArgument = 1,
    ErrorModelLoad = 2,
    ErrorSession = 3,
    ErrorOutOfMemory = 4,
    ErrorInternal = 5,
}

/// How the engine reaches checkpoint bytes after load.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub enum EmberAccessMode {
    /// Memory-map the checkpoint file.
    Mmap = 0,
    /// Read tensors on demand under a byte budget (`cache_limit`).
    ReadCache = 1,
    /// The host already holds the checkpoint at `direct_base`.
    Direct = 2,
}

/// Prompt-shaping mode of a model.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub enum EmberModelKind {
    Generate = 0,
    Chat = 1,
}

/// Result of one `ember_step_next` call.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EmberStepState {
    /// No live sessions.
    Idle = 0,
    /// A session advanced one token.
    Stepped = 1,
    /// A session reached a terminal state and was destroyed.
    Finished = 2,
}

/// Parameters for `ember_model_open`.
#[repr(C)]
pub struct EmberModelParams {
    /// Checkpoint path; ignored in `Direct` mode.
    pub checkpoint_path: *const c_char,
    /// Tokenizer vocabulary path.
    pub tokenizer_path: *const c_char,
    pub access_mode: EmberAccessMode,
    /// Base of the in-memory checkpoint for `Direct` mode; the host must
    /// keep the region valid until the model is closed.
    pub direct_base: *const u8,
    /// Length of the direct region in bytes.
    pub direct_len: usize,
    /// Cache byte budget for `ReadCache` mode.
    pub cache_limit: u64,
    /// Cap on concurrent sessions; 0 means unlimited.
    pub max_sessions: u32,
    pub kind: EmberModelKind,
    /// Registry name for the model.
    pub name: *const c_char,
}

/// Callback receiving each generated piece as a null-terminated string, and
/// a one-byte terminal marker when the session ends. The return value is
/// reserved; it is never treated as fatal.
pub type EmberEmitCallback =
    Option<extern "C" fn(piece: *const c_char, user_data: *mut c_void) -> i32>;

/// Parameters for `ember_session_open`.
#[repr(C)]
pub struct EmberSessionParams {
    pub prompt: *const c_char,
    /// Optional system prompt; may be null.
    pub system_prompt: *const c_char,
    pub temperature: f32,
    pub topp: f32,
    /// RNG seed; 0 draws one from the clock.
    pub rng_seed: u64,
    /// Maximum positions to run; 0 clamps to the model's sequence length.
    pub limit: u32,
    pub emit: EmberEmitCallback,
    pub user_data: *mut c_void,
    /// Optional slot zeroed when the session is destroyed, so the host can
    /// detect the release without a data race. May be null.
    pub null_on_destroy: *mut u64,
}
