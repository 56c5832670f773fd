//! Handle-based lifecycle of the interception engine.
//!
//! At most one engine instance is live per manager. Starting while an
//! instance is recorded replaces it: the old handle is stopped first, under
//! the same lock, so two handles are never live at once. The recorded
//! instance is an owned guard that stops the engine when dropped, so a
//! manager going away never leaks a listener.

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;

use parking_lot::Mutex;

use super::InterceptionEngine;
use crate::certificate::CaCertificate;
use crate::error::TunnelError;
use crate::location::Coordinates;

/// Opaque identifier of one running engine instance. Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProxyHandle(NonZeroUsize);

impl ProxyHandle {
    /// Wrap a raw engine handle; `0` is the engine's failure value.
    pub fn from_raw(raw: usize) -> Option<Self> {
        NonZeroUsize::new(raw).map(Self)
    }

    pub fn as_raw(&self) -> usize {
        self.0.get()
    }
}

impl fmt::Display for ProxyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A live engine instance. Stopped on drop unless released first.
struct ActiveProxy {
    handle: ProxyHandle,
    engine: Arc<dyn InterceptionEngine>,
    released: bool,
}

impl ActiveProxy {
    /// Stop the instance and return the engine's result code.
    fn release(mut self) -> i32 {
        self.released = true;
        self.engine.stop_proxy(self.handle.as_raw())
    }
}

impl Drop for ActiveProxy {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        log::warn!("Releasing unstopped proxy handle {} on drop", self.handle);
        let code = self.engine.stop_proxy(self.handle.as_raw());
        if code != 0 {
            log::error!("Engine stop for handle {} returned {}", self.handle, code);
        }
    }
}

pub struct ProxyLifecycleManager {
    engine: Arc<dyn InterceptionEngine>,
    active: Mutex<Option<ActiveProxy>>,
}

impl ProxyLifecycleManager {
    pub fn new(engine: Arc<dyn InterceptionEngine>) -> Self {
        Self {
            engine,
            active: Mutex::new(None),
        }
    }

    /// Start the engine with `certificate` and, when present, the spoof pair.
    ///
    /// Blocks for the duration of the engine calls.
    pub fn start_proxy(
        &self,
        certificate: &CaCertificate,
        coordinates: Option<Coordinates>,
    ) -> Result<ProxyHandle, TunnelError> {
        let mut active = self.active.lock();

        if let Some(previous) = active.take() {
            let handle = previous.handle;
            log::warn!("Proxy already running with handle {}, stopping it first", handle);
            let code = previous.release();
            if code != 0 {
                log::error!(
                    "Failed to stop previous proxy handle {} (code {}), handle released",
                    handle,
                    code
                );
            }
        }

        let (latitude, longitude, has_coordinates) = match coordinates {
            Some(c) => {
                log::info!("Location spoofing coordinates: {}, {}", c.latitude, c.longitude);
                (c.latitude, c.longitude, true)
            }
            None => {
                log::info!("No coordinates provided, running in transparent mode");
                (0.0, 0.0, false)
            }
        };

        log::info!("Starting interception proxy");
        let raw = self.engine.start_proxy(
            &certificate.cert_pem,
            &certificate.key_pem,
            latitude,
            longitude,
            has_coordinates,
        );

        let handle = ProxyHandle::from_raw(raw).ok_or_else(|| {
            log::error!("Interception engine returned an empty handle");
            TunnelError::EngineStartFailed("engine returned handle 0".to_string())
        })?;

        *active = Some(ActiveProxy {
            handle,
            engine: Arc::clone(&self.engine),
            released: false,
        });

        log::info!("Interception proxy started with handle {}", handle);
        Ok(handle)
    }

    /// Stop the recorded instance. A no-op success when nothing is running.
    ///
    /// The handle is forgotten even when the engine reports a failure.
    pub fn stop_proxy(&self) -> Result<(), TunnelError> {
        let mut active = self.active.lock();

        let proxy = match active.take() {
            Some(p) => p,
            None => {
                log::debug!("No proxy handle recorded, nothing to stop");
                return Ok(());
            }
        };

        let handle = proxy.handle;
        log::info!("Stopping interception proxy (handle {})", handle);
        match proxy.release() {
            0 => {
                log::info!("Interception proxy stopped");
                Ok(())
            }
            code => {
                log::error!("Failed to stop interception proxy, error code: {}", code);
                Err(TunnelError::EngineStopFailed(code))
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.active.lock().is_some()
    }

    pub fn current_handle(&self) -> Option<ProxyHandle> {
        self.active.lock().as_ref().map(|p| p.handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::MockEngine;

    fn cert() -> CaCertificate {
        CaCertificate {
            cert_pem: "CERT".to_string(),
            key_pem: "KEY".to_string(),
        }
    }

    fn manager() -> (ProxyLifecycleManager, Arc<MockEngine>) {
        let engine = Arc::new(MockEngine::new());
        (ProxyLifecycleManager::new(engine.clone()), engine)
    }

    #[test]
    fn handle_zero_is_not_a_handle() {
        assert_eq!(ProxyHandle::from_raw(0), None);
        assert_eq!(ProxyHandle::from_raw(7).map(|h| h.as_raw()), Some(7));
    }

    #[test]
    fn transparent_mode_passes_has_coordinates_false() {
        let (manager, engine) = manager();
        manager.start_proxy(&cert(), None).unwrap();

        let call = &engine.start_calls()[0];
        assert!(!call.has_coordinates);
        assert_eq!((call.latitude, call.longitude), (0.0, 0.0));
        assert_eq!((call.cert_pem.as_str(), call.key_pem.as_str()), ("CERT", "KEY"));
    }

    #[test]
    fn zero_coordinates_are_distinct_from_disabled() {
        let (manager, engine) = manager();
        let origin = Coordinates::new(0.0, 0.0).unwrap();
        manager.start_proxy(&cert(), Some(origin)).unwrap();
        assert!(engine.start_calls()[0].has_coordinates);
    }

    #[test]
    fn empty_handle_is_start_failure() {
        let (manager, engine) = manager();
        engine.push_start_handle(0);

        let result = manager.start_proxy(&cert(), None);
        assert!(matches!(result, Err(TunnelError::EngineStartFailed(_))));
        assert!(!manager.is_running());
        assert_eq!(manager.current_handle(), None);
    }

    #[test]
    fn stop_without_handle_is_idempotent() {
        let (manager, engine) = manager();
        assert!(manager.stop_proxy().is_ok());
        assert!(manager.stop_proxy().is_ok());
        assert!(engine.stop_calls().is_empty());
    }

    #[test]
    fn stop_twice_after_start() {
        let (manager, engine) = manager();
        let handle = manager.start_proxy(&cert(), None).unwrap();
        assert!(manager.is_running());

        assert!(manager.stop_proxy().is_ok());
        assert!(manager.stop_proxy().is_ok());
        assert!(!manager.is_running());
        assert_eq!(engine.stop_calls(), vec![handle.as_raw()]);
    }

    #[test]
    fn stop_failure_still_clears_handle() {
        let (manager, engine) = manager();
        manager.start_proxy(&cert(), None).unwrap();
        engine.push_stop_code(2);

        assert_eq!(manager.stop_proxy(), Err(TunnelError::EngineStopFailed(2)));
        assert!(!manager.is_running());
        assert!(manager.stop_proxy().is_ok());
    }

    #[test]
    fn restart_replaces_running_instance() {
        let (manager, engine) = manager();
        let first = manager.start_proxy(&cert(), None).unwrap();
        let second = manager
            .start_proxy(&cert(), Some(Coordinates::new(1.0, 2.0).unwrap()))
            .unwrap();

        assert_ne!(first, second);
        assert_eq!(engine.stop_calls(), vec![first.as_raw()]);
        assert_eq!(engine.max_live_handles(), 1);
        assert_eq!(manager.current_handle(), Some(second));
    }

    #[test]
    fn restart_proceeds_when_old_stop_fails() {
        let (manager, engine) = manager();
        manager.start_proxy(&cert(), None).unwrap();
        engine.push_stop_code(1);

        let second = manager.start_proxy(&cert(), None).unwrap();
        assert_eq!(manager.current_handle(), Some(second));
        assert_eq!(engine.live_handles(), 1);
    }

    #[test]
    fn dropping_manager_stops_engine() {
        let (manager, engine) = manager();
        let handle = manager.start_proxy(&cert(), None).unwrap();
        drop(manager);

        assert_eq!(engine.stop_calls(), vec![handle.as_raw()]);
        assert_eq!(engine.live_handles(), 0);
    }
}
