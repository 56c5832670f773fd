//! C-callable callback registry for state changes, errors, and settings
//! application requests.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::ffi::CString;
use std::os::raw::{c_char, c_void};

// ── Callback type aliases ───────────────────────────────────────────────────

/// `fn(state_code: i32, user_context: *mut c_void)`
pub type StateCallback = Option<unsafe extern "C" fn(i32, *mut c_void)>;

/// `fn(error_code: i32, message: *const c_char, user_context: *mut c_void)`
pub type ErrorCallback = Option<unsafe extern "C" fn(i32, *const c_char, *mut c_void)>;

/// `fn(request_id: u64, settings_json: *const c_char, user_context: *mut c_void)`
///
/// The host applies the settings and answers with
/// `geospoof_tunnel_settings_applied(request_id, error)`.
pub type ApplySettingsCallback = Option<unsafe extern "C" fn(u64, *const c_char, *mut c_void)>;

/// `fn(result_code: i32, message: *const c_char, user_context: *mut c_void)`
///
/// One-shot completion of a start or stop request. `message` is null on success.
pub type CompletionCallback = Option<unsafe extern "C" fn(i32, *const c_char, *mut c_void)>;

// ── Send + Sync wrapper for raw pointers ────────────────────────────────────

/// Wrapper so that raw user-context pointers can be stored in a `Mutex` or
/// moved into a runtime task.
/// The caller is responsible for thread-safety of the pointed-to data.
#[derive(Clone, Copy)]
pub struct SendPtr(pub *mut c_void);
unsafe impl Send for SendPtr {}
unsafe impl Sync for SendPtr {}

impl Default for SendPtr {
    fn default() -> Self {
        SendPtr(std::ptr::null_mut())
    }
}

// ── Registry ────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct CallbackRegistry {
    state_cb: StateCallback,
    state_ctx: SendPtr,

    error_cb: ErrorCallback,
    error_ctx: SendPtr,

    apply_settings_cb: ApplySettingsCallback,
    apply_settings_ctx: SendPtr,
}

pub static CALLBACKS: Lazy<Mutex<CallbackRegistry>> =
    Lazy::new(|| Mutex::new(CallbackRegistry::default()));

#[cfg(test)]
pub(crate) static TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

// ── Registration ────────────────────────────────────────────────────────────

pub fn register_state_callback(cb: StateCallback, ctx: *mut c_void) {
    let mut reg = CALLBACKS.lock();
    reg.state_cb = cb;
    reg.state_ctx = SendPtr(ctx);
}

pub fn register_error_callback(cb: ErrorCallback, ctx: *mut c_void) {
    let mut reg = CALLBACKS.lock();
    reg.error_cb = cb;
    reg.error_ctx = SendPtr(ctx);
}

pub fn register_apply_settings_callback(cb: ApplySettingsCallback, ctx: *mut c_void) {
    let mut reg = CALLBACKS.lock();
    reg.apply_settings_cb = cb;
    reg.apply_settings_ctx = SendPtr(ctx);
}

// ── Invocation helpers ──────────────────────────────────────────────────────

/// Notify the host application that the tunnel state changed.
pub fn fire_state_change(state: i32) {
    let reg = CALLBACKS.lock();
    if let Some(cb) = reg.state_cb {
        let ctx = reg.state_ctx.0;
        // Drop lock before calling into foreign code to avoid deadlocks.
        drop(reg);
        unsafe { cb(state, ctx) };
    }
}

/// Notify the host application of an error.
pub fn fire_error(code: i32, msg: &str) {
    let reg = CALLBACKS.lock();
    if let Some(cb) = reg.error_cb {
        let ctx = reg.error_ctx.0;
        drop(reg);
        if let Ok(c_msg) = CString::new(msg) {
            unsafe { cb(code, c_msg.as_ptr(), ctx) };
        }
    }
}

/// Ask the host to apply network settings. Returns `false` when no handler
/// is registered.
pub fn fire_apply_settings(request_id: u64, settings_json: &str) -> bool {
    let reg = CALLBACKS.lock();
    let cb = match reg.apply_settings_cb {
        Some(cb) => cb,
        None => return false,
    };
    let ctx = reg.apply_settings_ctx.0;
    drop(reg);

    match CString::new(settings_json) {
        Ok(c_json) => {
            unsafe { cb(request_id, c_json.as_ptr(), ctx) };
            true
        }
        Err(_) => false,
    }
}

/// Invoke a one-shot completion callback, if one was supplied.
pub fn fire_completion(cb: CompletionCallback, ctx: SendPtr, code: i32, msg: Option<&str>) {
    let cb = match cb {
        Some(cb) => cb,
        None => return,
    };
    let c_msg = msg.and_then(|m| CString::new(m).ok());
    let msg_ptr = c_msg.as_ref().map_or(std::ptr::null(), |m| m.as_ptr());
    unsafe { cb(code, msg_ptr, ctx.0) };
}
