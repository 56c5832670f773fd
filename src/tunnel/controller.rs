//! Tunnel Controller
//!
//! Top-level orchestrator invoked by the host runtime. On start it:
//! - reads the spoof coordinates once from the shared store
//! - ensures CA material exists
//! - starts the interception engine
//! - has the host apply the network settings, and only then reports `Running`
//!
//! Any failure unwinds the sequence: an engine that was started is stopped
//! before the error is reported, and the controller ends in `Stopped`.
//! Coordinates are not reloaded while running; a new pair takes effect on the
//! next stop/start cycle.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use super::applier::SettingsApplier;
use super::settings;
use crate::certificate::{CaCertificate, CertificateStore};
use crate::config::SdkConfig;
use crate::engine::{InterceptionEngine, ProxyHandle, ProxyLifecycleManager};
use crate::error::TunnelError;
use crate::location::{Coordinates, SharedConfigStore};
use crate::store::KeyValueStore;

/// Tunnel lifecycle state
#[derive(Debug, Clone, PartialEq)]
pub enum TunnelState {
    Stopped,
    Starting,
    Running {
        since: DateTime<Utc>,
        handle: ProxyHandle,
        coordinates: Option<Coordinates>,
    },
    Stopping,
    /// Transient: a start failed. Always followed by `Stopped`.
    Faulted(String),
}

impl TunnelState {
    pub fn is_running(&self) -> bool {
        matches!(self, TunnelState::Running { .. })
    }

    pub fn status_text(&self) -> &'static str {
        match self {
            TunnelState::Stopped => "Stopped",
            TunnelState::Starting => "Starting",
            TunnelState::Running { .. } => "Running",
            TunnelState::Stopping => "Stopping",
            TunnelState::Faulted(_) => "Faulted",
        }
    }

    /// Convert to FFI-friendly integer code
    pub fn as_code(&self) -> i32 {
        match self {
            TunnelState::Stopped => 0,
            TunnelState::Starting => 1,
            TunnelState::Running { .. } => 2,
            TunnelState::Stopping => 3,
            TunnelState::Faulted(_) => -1,
        }
    }
}

impl Default for TunnelState {
    fn default() -> Self {
        TunnelState::Stopped
    }
}

/// Why the host is stopping the tunnel. Codes follow the host's provider
/// stop-reason numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    UserInitiated,
    ProviderFailed,
    NoNetwork,
    ConfigurationChanged,
    Superseded,
    Sleep,
    Other(i32),
}

impl StopReason {
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => StopReason::UserInitiated,
            2 => StopReason::ProviderFailed,
            3 => StopReason::NoNetwork,
            10 => StopReason::ConfigurationChanged,
            11 => StopReason::Superseded,
            15 => StopReason::Sleep,
            other => StopReason::Other(other),
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::UserInitiated => write!(f, "user initiated"),
            StopReason::ProviderFailed => write!(f, "provider failed"),
            StopReason::NoNetwork => write!(f, "no network available"),
            StopReason::ConfigurationChanged => write!(f, "configuration changed"),
            StopReason::Superseded => write!(f, "superseded"),
            StopReason::Sleep => write!(f, "sleep"),
            StopReason::Other(code) => write!(f, "code {}", code),
        }
    }
}

/// Snapshot reported to the host as JSON.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TunnelStatus {
    pub state: &'static str,
    pub code: i32,
    pub proxy_running: bool,
    pub coordinates: Option<Coordinates>,
    pub running_since: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Clears the in-flight flag when the start sequence ends, on every path.
struct StartGuard<'a>(&'a AtomicBool);

impl<'a> StartGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| StartGuard(flag))
    }
}

impl Drop for StartGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Run a potentially blocking call on the blocking pool, bounded by `timeout`.
///
/// A call that times out keeps running to completion in the background.
async fn run_blocking<T, F>(
    operation: &'static str,
    timeout: Duration,
    f: F,
) -> Result<T, TunnelError>
where
    F: FnOnce() -> Result<T, TunnelError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::time::timeout(timeout, tokio::task::spawn_blocking(f)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => Err(TunnelError::Internal(format!("{} panicked: {}", operation, e))),
        Err(_) => {
            log::error!("Timed out after {:?} waiting for {}", timeout, operation);
            Err(TunnelError::Timeout(operation))
        }
    }
}

pub struct TunnelController {
    config: SdkConfig,
    shared_config: SharedConfigStore,
    certificates: Arc<CertificateStore>,
    proxy: Arc<ProxyLifecycleManager>,
    applier: Arc<dyn SettingsApplier>,
    engine_version: String,
    state: Mutex<TunnelState>,
    last_error: Mutex<Option<TunnelError>>,
    start_in_flight: AtomicBool,
    /// Orders a stop after an in-flight start.
    lifecycle: tokio::sync::Mutex<()>,
}

impl TunnelController {
    /// Initialize the engine for this process and build the controller.
    ///
    /// `init` and `version` run on the blocking pool, bounded by the engine
    /// timeout.
    pub async fn initialize(
        config: SdkConfig,
        engine: Arc<dyn InterceptionEngine>,
        shared_config: SharedConfigStore,
        certificate_store: Arc<dyn KeyValueStore>,
        applier: Arc<dyn SettingsApplier>,
    ) -> Result<Self, TunnelError> {
        let init_engine = Arc::clone(&engine);
        let engine_version =
            run_blocking("interception engine init", config.engine_timeout(), move || {
                init_engine.init();
                Ok(init_engine.version())
            })
            .await?;
        log::info!("Interception engine version: {}", engine_version);

        Ok(Self {
            config,
            shared_config,
            certificates: Arc::new(CertificateStore::new(certificate_store, Arc::clone(&engine))),
            proxy: Arc::new(ProxyLifecycleManager::new(engine)),
            applier,
            engine_version,
            state: Mutex::new(TunnelState::Stopped),
            last_error: Mutex::new(None),
            start_in_flight: AtomicBool::new(false),
            lifecycle: tokio::sync::Mutex::new(()),
        })
    }

    pub fn state(&self) -> TunnelState {
        self.state.lock().clone()
    }

    pub fn is_proxy_running(&self) -> bool {
        self.proxy.is_running()
    }

    pub fn engine_version(&self) -> &str {
        &self.engine_version
    }

    /// Stored CA pair, generated on first need. Bounded by the engine timeout.
    pub async fn ca_certificate(&self) -> Result<CaCertificate, TunnelError> {
        let certificates = Arc::clone(&self.certificates);
        run_blocking("CA certificate", self.config.engine_timeout(), move || {
            certificates.get_or_create()
        })
        .await
    }

    /// Delete the stored CA pair. Waits behind an in-progress generation,
    /// bounded by the engine timeout.
    pub async fn clear_ca_certificate(&self) -> Result<(), TunnelError> {
        let certificates = Arc::clone(&self.certificates);
        run_blocking("CA certificate", self.config.engine_timeout(), move || {
            certificates.clear()
        })
        .await
    }

    /// Error of the most recent failed start, cleared by the next start.
    pub fn last_error(&self) -> Option<TunnelError> {
        self.last_error.lock().clone()
    }

    pub fn status(&self) -> TunnelStatus {
        let state = self.state();
        let (coordinates, running_since) = match &state {
            TunnelState::Running {
                since, coordinates, ..
            } => (*coordinates, Some(*since)),
            _ => (None, None),
        };
        TunnelStatus {
            state: state.status_text(),
            code: state.as_code(),
            proxy_running: self.is_proxy_running(),
            coordinates,
            running_since,
            error: self.last_error().map(|e| e.to_string()),
        }
    }

    fn set_state(&self, state: TunnelState) {
        log::info!("Tunnel state: {:?}", state);
        let code = state.as_code();
        *self.state.lock() = state;
        crate::callbacks::fire_state_change(code);
    }

    /// Run the start sequence. Resolves once settings are applied (`Running`)
    /// or the sequence failed and was unwound (`Stopped`).
    pub async fn start(&self) -> Result<(), TunnelError> {
        let _in_flight = match StartGuard::acquire(&self.start_in_flight) {
            Some(guard) => guard,
            None => {
                log::warn!("Tunnel start requested while another start is in flight");
                return Err(TunnelError::StartInProgress);
            }
        };
        let _lifecycle = self.lifecycle.lock().await;

        if self.state().is_running() {
            log::warn!("Tunnel start requested while already running");
            return Err(TunnelError::AlreadyRunning);
        }

        log::info!("Tunnel starting...");
        *self.last_error.lock() = None;
        self.set_state(TunnelState::Starting);

        match self.run_start_sequence().await {
            Ok((handle, coordinates)) => {
                self.set_state(TunnelState::Running {
                    since: Utc::now(),
                    handle,
                    coordinates,
                });
                log::info!("Tunnel started successfully");
                Ok(())
            }
            Err(e) => {
                log::error!("Tunnel start failed: {}", e);
                if let Err(stop_err) = self.stop_engine().await {
                    log::warn!("Cleanup stop after failed start: {}", stop_err);
                }
                *self.last_error.lock() = Some(e.clone());
                crate::callbacks::fire_error(e.code(), &e.to_string());
                self.set_state(TunnelState::Faulted(e.to_string()));
                self.set_state(TunnelState::Stopped);
                Err(e)
            }
        }
    }

    async fn run_start_sequence(
        &self,
    ) -> Result<(ProxyHandle, Option<Coordinates>), TunnelError> {
        let engine_timeout = self.config.engine_timeout();

        // Step 1: coordinates, read once for the lifetime of this run
        let shared = self.shared_config.clone();
        let coordinates =
            run_blocking("shared configuration", engine_timeout, move || shared.get()).await?;
        match coordinates {
            Some(c) => log::info!(
                "Location spoofing active: {:.6}, {:.6}",
                c.latitude,
                c.longitude
            ),
            None => log::info!("No coordinates configured - running in transparent mode"),
        }

        // Step 2: CA material
        let certificate = self.ca_certificate().await?;

        // Step 3: engine
        let proxy = Arc::clone(&self.proxy);
        let handle = run_blocking("interception engine start", engine_timeout, move || {
            proxy.start_proxy(&certificate, coordinates)
        })
        .await?;

        // Step 4: network settings, applied by the host
        let settings = settings::build(&self.config.proxy_host, self.config.proxy_port);
        let completion = self.applier.apply(settings);
        match tokio::time::timeout(self.config.settings_timeout(), completion).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(reason))) => {
                log::error!("Failed to set tunnel network settings: {}", reason);
                return Err(TunnelError::SettingsRejected(reason));
            }
            Ok(Err(_)) => {
                return Err(TunnelError::SettingsRejected(
                    "settings request dropped without a result".to_string(),
                ));
            }
            Err(_) => return Err(TunnelError::Timeout("network settings application")),
        }

        Ok((handle, coordinates))
    }

    async fn stop_engine(&self) -> Result<(), TunnelError> {
        let proxy = Arc::clone(&self.proxy);
        run_blocking(
            "interception engine stop",
            self.config.engine_timeout(),
            move || proxy.stop_proxy(),
        )
        .await
    }

    /// Stop the engine and return to `Stopped`. Engine failures are logged,
    /// never escalated, so teardown always completes.
    ///
    /// Stopping releases the running instance's handle. The engine itself is
    /// initialized once per process and stays referenced until the controller
    /// is dropped, so a later start reuses it without a second `init`.
    pub async fn stop(&self, reason: StopReason) {
        let _lifecycle = self.lifecycle.lock().await;

        log::info!("Tunnel stopping, reason: {}", reason);
        self.set_state(TunnelState::Stopping);

        match self.stop_engine().await {
            Ok(()) => log::info!("Interception proxy released"),
            Err(e) => log::error!("Failed to stop interception proxy: {}", e),
        }

        self.set_state(TunnelState::Stopped);
        log::info!("Tunnel stopped");
    }
}
