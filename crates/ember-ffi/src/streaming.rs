use std::ffi::CString;
use std::os::raw::c_void;

use ember_engine::{ReleaseHook, TokenSink};

use crate::types::EmberEmitCallback;

/// Host pointer that crosses into the engine's sink closures. The host
/// guarantees whatever thread-safety its callback and slot need.
struct SendPtr<T>(*mut T);
unsafe impl<T> Send for SendPtr<T> {}

/// Wrap a C emit callback into the engine's sink type.
///
/// Pieces are delivered null-terminated; a piece containing an interior NUL
/// cannot be represented and is skipped rather than treated as fatal.
pub fn sink_from(callback: EmberEmitCallback, user_data: *mut c_void) -> TokenSink {
    let user_data = SendPtr(user_data);
    Box::new(move |piece: &[u8]| {
        let user_data = &user_data;
        let Some(cb) = callback else { return 0 };
        match CString::new(piece) {
            Ok(c) => cb(c.as_ptr(), user_data.0),
            Err(_) => 0,
        }
    })
}

/// Build the release hook that zeroes the host's session slot.
pub fn null_on_destroy_hook(slot: *mut u64) -> Option<ReleaseHook> {
    if slot.is_null() {
        return None;
    }
    let slot = SendPtr(slot);
    Some(Box::new(move || {
        let slot = &slot;
        // Safety: the host keeps the slot valid for the session's lifetime;
        // that is the point of the contract.
        unsafe { *slot.0 = 0 };
    }))
}
