//! Tunnel error types, C error codes, and last-error storage.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use thiserror::Error;

// ── Error codes ─────────────────────────────────────────────────────────────

pub const SUCCESS: i32 = 0;
pub const ERROR_INVALID_PARAM: i32 = -1;
pub const ERROR_NOT_INITIALIZED: i32 = -2;
pub const ERROR_CONFIG_UNAVAILABLE: i32 = -3;
pub const ERROR_RANGE: i32 = -4;
pub const ERROR_CERTIFICATE_UNAVAILABLE: i32 = -5;
pub const ERROR_ENGINE_START_FAILED: i32 = -6;
pub const ERROR_ENGINE_STOP_FAILED: i32 = -7;
pub const ERROR_SETTINGS_REJECTED: i32 = -8;
pub const ERROR_ALREADY_RUNNING: i32 = -9;
pub const ERROR_START_IN_PROGRESS: i32 = -10;
pub const ERROR_TIMEOUT: i32 = -11;
pub const ERROR_ENGINE_UNAVAILABLE: i32 = -12;
pub const ERROR_INTERNAL: i32 = -13;

// ── TunnelError enum ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TunnelError {
    #[error("Shared configuration unavailable: {0}")]
    ConfigUnavailable(String),

    #[error("Coordinate out of range: {0}")]
    Range(String),

    #[error("CA certificate unavailable: {0}")]
    CertificateUnavailable(String),

    #[error("Interception engine failed to start: {0}")]
    EngineStartFailed(String),

    #[error("Interception engine failed to stop (code {0})")]
    EngineStopFailed(i32),

    #[error("Network settings rejected: {0}")]
    SettingsRejected(String),

    #[error("Tunnel already running")]
    AlreadyRunning,

    #[error("Tunnel start already in progress")]
    StartInProgress,

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("Invalid parameter: {0}")]
    InvalidParam(String),

    #[error("Not initialized")]
    NotInitialized,

    #[error("Interception engine not registered")]
    EngineUnavailable,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TunnelError {
    /// Map this error to its integer error code for the C API.
    pub fn code(&self) -> i32 {
        match self {
            TunnelError::ConfigUnavailable(_) => ERROR_CONFIG_UNAVAILABLE,
            TunnelError::Range(_) => ERROR_RANGE,
            TunnelError::CertificateUnavailable(_) => ERROR_CERTIFICATE_UNAVAILABLE,
            TunnelError::EngineStartFailed(_) => ERROR_ENGINE_START_FAILED,
            TunnelError::EngineStopFailed(_) => ERROR_ENGINE_STOP_FAILED,
            TunnelError::SettingsRejected(_) => ERROR_SETTINGS_REJECTED,
            TunnelError::AlreadyRunning => ERROR_ALREADY_RUNNING,
            TunnelError::StartInProgress => ERROR_START_IN_PROGRESS,
            TunnelError::Timeout(_) => ERROR_TIMEOUT,
            TunnelError::InvalidParam(_) => ERROR_INVALID_PARAM,
            TunnelError::NotInitialized => ERROR_NOT_INITIALIZED,
            TunnelError::EngineUnavailable => ERROR_ENGINE_UNAVAILABLE,
            TunnelError::Internal(_) => ERROR_INTERNAL,
        }
    }
}

// ── Last-error storage ──────────────────────────────────────────────────────

static LAST_ERROR: Lazy<Mutex<Option<String>>> = Lazy::new(|| Mutex::new(None));
static LAST_ERROR_CODE: Lazy<Mutex<i32>> = Lazy::new(|| Mutex::new(SUCCESS));

/// Store a `TunnelError`, recording both the message and code.
pub fn set_tunnel_error(err: &TunnelError) {
    *LAST_ERROR_CODE.lock() = err.code();
    *LAST_ERROR.lock() = Some(err.to_string());
}

/// Clear the stored error.
pub fn clear_error() {
    *LAST_ERROR.lock() = None;
    *LAST_ERROR_CODE.lock() = SUCCESS;
}

/// Take the last error message, leaving `None` behind.
pub fn take_last_error() -> Option<String> {
    LAST_ERROR.lock().take()
}

/// Return the last error code without clearing it.
pub fn last_error_code() -> i32 {
    *LAST_ERROR_CODE.lock()
}
