//! Interception engine boundary
//!
//! The engine performs the TLS interception and response rewriting. This
//! crate reaches it only through five calls with fixed semantics:
//!
//! - `init()`: one-time process-level initialization
//! - `version()`: diagnostic string
//! - `generate_ca()`: fresh CA certificate/key PEM pair, or failure
//! - `start_proxy(cert, key, lat, lon, has_coordinates)`: handle, `0` = failure
//! - `stop_proxy(handle)`: result code, `0` = success
//!
//! ## Layout
//!
//! - mod.rs: `InterceptionEngine` trait and the C vtable adapter
//! - lifecycle.rs: handle ownership and start/stop policy

pub mod lifecycle;

#[cfg(test)]
pub(crate) mod mock;

pub use lifecycle::{ProxyHandle, ProxyLifecycleManager};

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int};

/// Raw call interface of the interception engine.
///
/// Calls may block; callers keep them off interactive threads.
pub trait InterceptionEngine: Send + Sync {
    fn init(&self);

    fn version(&self) -> String;

    /// Returns `(cert_pem, key_pem)`, or `None` when generation failed.
    fn generate_ca(&self) -> Option<(String, String)>;

    /// Returns the engine handle, `0` on failure. `has_coordinates` separates
    /// "spoofing disabled" from a genuine `(0.0, 0.0)` pair.
    fn start_proxy(
        &self,
        cert_pem: &str,
        key_pem: &str,
        latitude: f64,
        longitude: f64,
        has_coordinates: bool,
    ) -> usize;

    /// Returns `0` on success, an engine-specific code otherwise.
    fn stop_proxy(&self, handle: usize) -> i32;
}

// ── C vtable ────────────────────────────────────────────────────────────────

/// Two C strings returned by the engine's CA generator. Both null on failure.
#[repr(C)]
pub struct GenerateCaResult {
    pub r0: *mut c_char,
    pub r1: *mut c_char,
}

/// Function table the host registers for the engine linked into its process.
///
/// Strings returned by `version` and `generate_ca` are released with
/// `free_string` (usually the C allocator's `free`).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct EngineVTable {
    pub init: Option<unsafe extern "C" fn()>,
    pub version: Option<unsafe extern "C" fn() -> *mut c_char>,
    pub generate_ca: Option<unsafe extern "C" fn() -> GenerateCaResult>,
    pub start_proxy:
        Option<unsafe extern "C" fn(*mut c_char, *mut c_char, f64, f64, c_int) -> usize>,
    pub stop_proxy: Option<unsafe extern "C" fn(usize) -> c_int>,
    pub free_string: Option<unsafe extern "C" fn(*mut c_char)>,
}

struct EngineFns {
    init: unsafe extern "C" fn(),
    version: unsafe extern "C" fn() -> *mut c_char,
    generate_ca: unsafe extern "C" fn() -> GenerateCaResult,
    start_proxy: unsafe extern "C" fn(*mut c_char, *mut c_char, f64, f64, c_int) -> usize,
    stop_proxy: unsafe extern "C" fn(usize) -> c_int,
    free_string: unsafe extern "C" fn(*mut c_char),
}

/// `InterceptionEngine` backed by host-registered C function pointers.
pub struct ForeignEngine {
    fns: EngineFns,
}

impl ForeignEngine {
    /// Validate that every entry of the table is present.
    pub fn from_vtable(vtable: &EngineVTable) -> Result<Self, crate::error::TunnelError> {
        fn required<T>(f: Option<T>, name: &str) -> Result<T, crate::error::TunnelError> {
            f.ok_or_else(|| {
                crate::error::TunnelError::InvalidParam(format!("engine vtable: {} is null", name))
            })
        }

        Ok(Self {
            fns: EngineFns {
                init: required(vtable.init, "init")?,
                version: required(vtable.version, "version")?,
                generate_ca: required(vtable.generate_ca, "generate_ca")?,
                start_proxy: required(vtable.start_proxy, "start_proxy")?,
                stop_proxy: required(vtable.stop_proxy, "stop_proxy")?,
                free_string: required(vtable.free_string, "free_string")?,
            },
        })
    }

    /// Copy an engine-owned C string and hand it back to the engine's allocator.
    unsafe fn take_string(&self, ptr: *mut c_char) -> Option<String> {
        if ptr.is_null() {
            return None;
        }
        let s = CStr::from_ptr(ptr).to_string_lossy().into_owned();
        (self.fns.free_string)(ptr);
        Some(s)
    }
}

impl InterceptionEngine for ForeignEngine {
    fn init(&self) {
        unsafe { (self.fns.init)() }
    }

    fn version(&self) -> String {
        unsafe { self.take_string((self.fns.version)()) }.unwrap_or_else(|| {
            log::error!("Failed to get version from interception engine");
            "unknown".to_string()
        })
    }

    fn generate_ca(&self) -> Option<(String, String)> {
        let result = unsafe { (self.fns.generate_ca)() };
        let cert = unsafe { self.take_string(result.r0) };
        let key = unsafe { self.take_string(result.r1) };
        match (cert, key) {
            (Some(cert), Some(key)) => Some((cert, key)),
            _ => None,
        }
    }

    fn start_proxy(
        &self,
        cert_pem: &str,
        key_pem: &str,
        latitude: f64,
        longitude: f64,
        has_coordinates: bool,
    ) -> usize {
        let (cert, key) = match (CString::new(cert_pem), CString::new(key_pem)) {
            (Ok(c), Ok(k)) => (c, k),
            _ => {
                log::error!("CA material contains an interior NUL byte");
                return 0;
            }
        };

        // The engine copies both strings before returning.
        unsafe {
            (self.fns.start_proxy)(
                cert.as_ptr() as *mut c_char,
                key.as_ptr() as *mut c_char,
                latitude,
                longitude,
                if has_coordinates { 1 } else { 0 },
            )
        }
    }

    fn stop_proxy(&self, handle: usize) -> i32 {
        unsafe { (self.fns.stop_proxy)(handle) }
    }
}
