//! GeoSpoof tunnel SDK: C FFI entry point
//!
//! Two hosts link this library:
//! - the configuration surface, which writes the spoof coordinates and
//!   exports the CA certificate for trust installation
//! - the packet-tunnel process, which registers the interception engine and
//!   drives start/stop
//!
//! Start and stop return immediately and report through a completion
//! callback fired from the global Tokio runtime.

pub mod callbacks;
pub mod certificate;
pub mod config;
pub mod engine;
pub mod error;
pub mod location;
mod runtime;
pub mod store;
pub mod tunnel;

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_void};
use std::ptr;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use callbacks::{
    fire_completion, register_apply_settings_callback, register_error_callback,
    register_state_callback, ApplySettingsCallback, CompletionCallback, ErrorCallback, SendPtr,
    StateCallback,
};
use config::SdkConfig;
use engine::{EngineVTable, ForeignEngine};
use error::{
    clear_error, last_error_code, set_tunnel_error, take_last_error, TunnelError,
    ERROR_NOT_INITIALIZED, SUCCESS,
};
use location::{Coordinates, SharedConfigStore};
use runtime::runtime;
use store::FileKeyValueStore;
use tunnel::{HostSettingsApplier, StopReason, TunnelController};

// ── Global SDK state ────────────────────────────────────────────────────────

struct SdkState {
    shared_config: SharedConfigStore,
    applier: Arc<HostSettingsApplier>,
    /// `None` in a process that registered no engine.
    tunnel: Option<Arc<TunnelController>>,
}

static SDK: Lazy<Mutex<Option<SdkState>>> = Lazy::new(|| Mutex::new(None));

/// Serializes `geospoof_init` so the engine is initialized once, without
/// holding `SDK` while the engine runs.
static INIT_LOCK: Mutex<()> = parking_lot::const_mutex(());

/// Convenience: run `body` while holding the SDK lock.
/// Returns `ERROR_NOT_INITIALIZED` (and sets the last-error) when the SDK has
/// not been initialised yet.
fn with_sdk<F, R>(body: F) -> R
where
    F: FnOnce(&mut SdkState) -> R,
    R: From<i32>,
{
    let mut guard = SDK.lock();
    match guard.as_mut() {
        Some(state) => body(state),
        None => {
            set_tunnel_error(&TunnelError::NotInitialized);
            R::from(ERROR_NOT_INITIALIZED)
        }
    }
}

/// Clone the controller out of the SDK lock so no lock is held while the
/// tunnel calls back into the host.
fn tunnel_controller() -> Result<Arc<TunnelController>, TunnelError> {
    let guard = SDK.lock();
    let state = guard.as_ref().ok_or(TunnelError::NotInitialized)?;
    state.tunnel.clone().ok_or(TunnelError::EngineUnavailable)
}

/// Record `err` as the last error and return its code.
fn fail(err: TunnelError) -> i32 {
    set_tunnel_error(&err);
    err.code()
}

/// Allocate a C string on the heap.  Caller frees via `geospoof_free_string`.
fn to_c_string(s: &str) -> *mut c_char {
    match CString::new(s) {
        Ok(cs) => cs.into_raw(),
        Err(_) => ptr::null_mut(),
    }
}

/// Read a `*const c_char` into a `&str`, returning `None` on null or invalid UTF-8.
unsafe fn from_c_str<'a>(p: *const c_char) -> Option<&'a str> {
    if p.is_null() {
        return None;
    }
    CStr::from_ptr(p).to_str().ok()
}

async fn build_state(
    vtable: Option<&EngineVTable>,
    config: SdkConfig,
) -> Result<SdkState, TunnelError> {
    let shared_config = SharedConfigStore::new(Arc::new(FileKeyValueStore::new(
        config.shared_config_path()?,
    )));
    let applier = Arc::new(HostSettingsApplier::new());

    let tunnel = match vtable {
        Some(vtable) => {
            let engine = Arc::new(ForeignEngine::from_vtable(vtable)?);
            let certificate_store = Arc::new(FileKeyValueStore::new(config.certificate_path()?));
            let controller = TunnelController::initialize(
                config,
                engine,
                shared_config.clone(),
                certificate_store,
                applier.clone(),
            )
            .await?;
            Some(Arc::new(controller))
        }
        None => {
            log::info!("No interception engine registered, configuration-only instance");
            None
        }
    };

    Ok(SdkState {
        shared_config,
        applier,
        tunnel,
    })
}

// ═══════════════════════════════════════════════════════════════════════════
//  Core
// ═══════════════════════════════════════════════════════════════════════════

/// Initialise the SDK.
///
/// `engine` may be null in a process that only edits configuration; tunnel
/// and CA calls then fail with `ERROR_ENGINE_UNAVAILABLE`. `config_json` may be
/// null for defaults. Returns 0 on success, negative on error.
#[no_mangle]
pub unsafe extern "C" fn geospoof_init(
    engine: *const EngineVTable,
    config_json: *const c_char,
) -> i32 {
    clear_error();

    let _init = INIT_LOCK.lock();
    if SDK.lock().is_some() {
        return SUCCESS; // already initialised
    }

    // Initialise logger (ignore errors if already set)
    let _ = env_logger::try_init();

    log::info!("GeoSpoof tunnel SDK v{} initialising", env!("CARGO_PKG_VERSION"));

    if !config_json.is_null() && from_c_str(config_json).is_none() {
        return fail(TunnelError::InvalidParam("config_json is not valid UTF-8".into()));
    }
    let config = match SdkConfig::from_json(from_c_str(config_json)) {
        Ok(c) => c,
        Err(e) => return fail(e),
    };

    match runtime().block_on(build_state(engine.as_ref(), config)) {
        Ok(state) => {
            *SDK.lock() = Some(state);
            log::info!("GeoSpoof tunnel SDK initialised");
            SUCCESS
        }
        Err(e) => fail(e),
    }
}

/// Tear down the SDK: stop the tunnel if it is up, drop all state.
#[no_mangle]
pub extern "C" fn geospoof_cleanup() {
    clear_error();

    let state = SDK.lock().take();
    if let Some(state) = state {
        if let Some(tunnel) = state.tunnel {
            if tunnel.is_proxy_running() {
                runtime().block_on(tunnel.stop(StopReason::UserInitiated));
            }
        }
        log::info!("GeoSpoof tunnel SDK cleaned up");
    }
}

/// Return the SDK version string.  Caller must free with `geospoof_free_string`.
#[no_mangle]
pub extern "C" fn geospoof_version() -> *mut c_char {
    to_c_string(env!("CARGO_PKG_VERSION"))
}

/// Return the interception engine's version string, or null when no engine
/// is registered.  Caller must free the returned string.
#[no_mangle]
pub extern "C" fn geospoof_engine_version() -> *mut c_char {
    clear_error();

    match tunnel_controller() {
        Ok(tunnel) => to_c_string(tunnel.engine_version()),
        Err(e) => {
            set_tunnel_error(&e);
            ptr::null_mut()
        }
    }
}

/// Free a string previously returned by the SDK.
#[no_mangle]
pub unsafe extern "C" fn geospoof_free_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        drop(CString::from_raw(ptr));
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  Configuration surface
// ═══════════════════════════════════════════════════════════════════════════

/// Persist the spoof coordinates. Takes effect at the next tunnel start.
/// Returns 0 on success, `ERROR_RANGE` for out-of-range values.
#[no_mangle]
pub extern "C" fn geospoof_config_set_coordinates(latitude: f64, longitude: f64) -> i32 {
    clear_error();

    with_sdk(|state| match state.shared_config.set(latitude, longitude) {
        Ok(_) => SUCCESS,
        Err(e) => fail(e),
    })
}

/// Parse user-entered text and persist the result.
#[no_mangle]
pub unsafe extern "C" fn geospoof_config_set_coordinates_text(
    latitude: *const c_char,
    longitude: *const c_char,
) -> i32 {
    clear_error();

    let (latitude, longitude) = match (from_c_str(latitude), from_c_str(longitude)) {
        (Some(lat), Some(lon)) => (lat, lon),
        _ => return fail(TunnelError::InvalidParam("coordinate text is null or invalid".into())),
    };
    let coordinates = match Coordinates::parse(latitude, longitude) {
        Ok(c) => c,
        Err(e) => return fail(e),
    };

    with_sdk(|state| {
        match state
            .shared_config
            .set(coordinates.latitude, coordinates.longitude)
        {
            Ok(_) => SUCCESS,
            Err(e) => fail(e),
        }
    })
}

/// Persist one of the preset locations by name (case-insensitive).
#[no_mangle]
pub unsafe extern "C" fn geospoof_config_set_preset(name: *const c_char) -> i32 {
    clear_error();

    let name = match from_c_str(name) {
        Some(s) => s,
        None => return fail(TunnelError::InvalidParam("preset name is null or invalid".into())),
    };
    let coordinates = match location::preset(name) {
        Some(c) => c,
        None => return fail(TunnelError::InvalidParam(format!("unknown preset {:?}", name))),
    };

    with_sdk(|state| {
        match state
            .shared_config
            .set(coordinates.latitude, coordinates.longitude)
        {
            Ok(_) => SUCCESS,
            Err(e) => fail(e),
        }
    })
}

/// Read the stored coordinates into `out_latitude` / `out_longitude`.
///
/// Returns 1 when configured, 0 when unconfigured (outputs untouched),
/// negative on error.
#[no_mangle]
pub unsafe extern "C" fn geospoof_config_get_coordinates(
    out_latitude: *mut f64,
    out_longitude: *mut f64,
) -> i32 {
    clear_error();

    if out_latitude.is_null() || out_longitude.is_null() {
        return fail(TunnelError::InvalidParam("output pointer is null".into()));
    }

    with_sdk(|state| match state.shared_config.get() {
        Ok(Some(c)) => {
            *out_latitude = c.latitude;
            *out_longitude = c.longitude;
            1
        }
        Ok(None) => 0,
        Err(e) => fail(e),
    })
}

/// Remove the stored coordinates; the next start runs in transparent mode.
#[no_mangle]
pub extern "C" fn geospoof_config_clear_coordinates() -> i32 {
    clear_error();

    with_sdk(|state| match state.shared_config.clear() {
        Ok(()) => SUCCESS,
        Err(e) => fail(e),
    })
}

// ═══════════════════════════════════════════════════════════════════════════
//  CA certificate
// ═══════════════════════════════════════════════════════════════════════════

/// Return the CA certificate PEM, generating the pair on first need.
/// The private key never leaves the library.  Returns null on error.
/// Caller must free the returned string.
#[no_mangle]
pub extern "C" fn geospoof_ca_certificate_pem() -> *mut c_char {
    clear_error();

    let result =
        tunnel_controller().and_then(|tunnel| runtime().block_on(tunnel.ca_certificate()));
    match result {
        Ok(certificate) => to_c_string(&certificate.cert_pem),
        Err(e) => {
            set_tunnel_error(&e);
            ptr::null_mut()
        }
    }
}

/// Delete the stored CA material. The next start generates a new pair.
#[no_mangle]
pub extern "C" fn geospoof_ca_clear() -> i32 {
    clear_error();

    let result =
        tunnel_controller().and_then(|tunnel| runtime().block_on(tunnel.clear_ca_certificate()));
    match result {
        Ok(()) => SUCCESS,
        Err(e) => fail(e),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  Tunnel
// ═══════════════════════════════════════════════════════════════════════════

/// Start the tunnel.
///
/// Returns 0 once the request is accepted; the outcome arrives through
/// `completion(code, message, ctx)` (message null on success).
#[no_mangle]
pub extern "C" fn geospoof_tunnel_start(completion: CompletionCallback, ctx: *mut c_void) -> i32 {
    clear_error();

    let tunnel = match tunnel_controller() {
        Ok(t) => t,
        Err(e) => return fail(e),
    };
    let ctx = SendPtr(ctx);

    runtime().spawn(async move {
        match tunnel.start().await {
            Ok(()) => fire_completion(completion, ctx, SUCCESS, None),
            Err(e) => {
                set_tunnel_error(&e);
                fire_completion(completion, ctx, e.code(), Some(&e.to_string()));
            }
        }
    });

    SUCCESS
}

/// Stop the tunnel. `reason` is the host's numeric stop reason.
///
/// Teardown always completes; `completion` fires with 0 when it has.
#[no_mangle]
pub extern "C" fn geospoof_tunnel_stop(
    reason: i32,
    completion: CompletionCallback,
    ctx: *mut c_void,
) -> i32 {
    clear_error();

    let tunnel = match tunnel_controller() {
        Ok(t) => t,
        Err(e) => return fail(e),
    };
    let ctx = SendPtr(ctx);

    runtime().spawn(async move {
        tunnel.stop(StopReason::from_code(reason)).await;
        fire_completion(completion, ctx, SUCCESS, None);
    });

    SUCCESS
}

/// Report the outcome of a settings request received through the
/// `geospoof_on_apply_settings` callback. `error` null means applied.
#[no_mangle]
pub unsafe extern "C" fn geospoof_tunnel_settings_applied(
    request_id: u64,
    error: *const c_char,
) -> i32 {
    clear_error();

    let applier = {
        let guard = SDK.lock();
        match guard.as_ref() {
            Some(state) => state.applier.clone(),
            None => return fail(TunnelError::NotInitialized),
        }
    };

    let result = if error.is_null() {
        Ok(())
    } else {
        Err(CStr::from_ptr(error).to_string_lossy().into_owned())
    };

    if applier.complete(request_id, result) {
        SUCCESS
    } else {
        fail(TunnelError::InvalidParam(format!(
            "no pending settings request {}",
            request_id
        )))
    }
}

/// Get the current tunnel state as an integer code.
///
/// | Code | State                    |
/// |------|--------------------------|
/// |  0   | Stopped                  |
/// |  1   | Starting                 |
/// |  2   | Running                  |
/// |  3   | Stopping                 |
/// | -1   | Faulted                  |
/// | -2   | SDK not initialised      |
/// | -12  | No engine registered     |
#[no_mangle]
pub extern "C" fn geospoof_tunnel_get_state() -> i32 {
    match tunnel_controller() {
        Ok(tunnel) => tunnel.state().as_code(),
        Err(e) => e.code(),
    }
}

/// Get detailed tunnel state as JSON.  Returns null on error.
/// Caller must free the returned string.
///
/// JSON shape:
/// ```json
/// {
///   "state": "Running",
///   "code": 2,
///   "proxy_running": true,
///   "coordinates": { "latitude": 48.8566, "longitude": 2.3522 },
///   "running_since": "2024-01-01T00:00:00Z",
///   "error": null
/// }
/// ```
#[no_mangle]
pub extern "C" fn geospoof_tunnel_get_state_json() -> *mut c_char {
    clear_error();

    let tunnel = match tunnel_controller() {
        Ok(t) => t,
        Err(e) => {
            set_tunnel_error(&e);
            return ptr::null_mut();
        }
    };

    match serde_json::to_string(&tunnel.status()) {
        Ok(json) => to_c_string(&json),
        Err(e) => {
            set_tunnel_error(&TunnelError::Internal(format!(
                "JSON serialization failed: {}",
                e
            )));
            ptr::null_mut()
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  Callbacks
// ═══════════════════════════════════════════════════════════════════════════

/// Register a callback for tunnel state changes.
///
/// Signature: `fn(state_code: i32, user_context: *mut c_void)`
#[no_mangle]
pub extern "C" fn geospoof_on_state_change(cb: StateCallback, ctx: *mut c_void) {
    register_state_callback(cb, ctx);
}

/// Register a callback for errors.
///
/// Signature: `fn(error_code: i32, message: *const c_char, user_context: *mut c_void)`
#[no_mangle]
pub extern "C" fn geospoof_on_error(cb: ErrorCallback, ctx: *mut c_void) {
    register_error_callback(cb, ctx);
}

/// Register the host's network settings applier.
///
/// Signature: `fn(request_id: u64, settings_json: *const c_char, user_context: *mut c_void)`
#[no_mangle]
pub extern "C" fn geospoof_on_apply_settings(cb: ApplySettingsCallback, ctx: *mut c_void) {
    register_apply_settings_callback(cb, ctx);
}

// ═══════════════════════════════════════════════════════════════════════════
//  Error
// ═══════════════════════════════════════════════════════════════════════════

/// Get the last error message.  Returns null if no error.
/// Caller must free the returned string.
#[no_mangle]
pub extern "C" fn geospoof_get_last_error() -> *mut c_char {
    match take_last_error() {
        Some(msg) => to_c_string(&msg),
        None => ptr::null_mut(),
    }
}

/// Get the last error code.  Returns 0 (`SUCCESS`) if no error.
#[no_mangle]
pub extern "C" fn geospoof_get_last_error_code() -> i32 {
    last_error_code()
}

/// Clear the stored error state.
#[no_mangle]
pub extern "C" fn geospoof_clear_error() {
    clear_error();
}
