//! Application of network settings to the OS networking subsystem.
//!
//! Application is asynchronous: `apply` hands the settings to the host and
//! returns a receiver that resolves when the host reports the outcome.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::settings::TunnelNetworkSettings;

/// Outcome of one application: `Err` carries the OS rejection reason.
pub type ApplyResult = Result<(), String>;

pub trait SettingsApplier: Send + Sync {
    fn apply(&self, settings: TunnelNetworkSettings) -> oneshot::Receiver<ApplyResult>;
}

/// Forwards settings to the host's registered apply callback as JSON and
/// waits for `complete` with the matching request id.
#[derive(Default)]
pub struct HostSettingsApplier {
    next_request_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<ApplyResult>>>,
}

impl HostSettingsApplier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a pending request. Returns `false` for unknown or abandoned ids.
    pub fn complete(&self, request_id: u64, result: ApplyResult) -> bool {
        let sender = self.pending.lock().remove(&request_id);
        match sender {
            Some(tx) => tx.send(result).is_ok(),
            None => {
                log::warn!("Settings completion for unknown request {}", request_id);
                false
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

impl SettingsApplier for HostSettingsApplier {
    fn apply(&self, settings: TunnelNetworkSettings) -> oneshot::Receiver<ApplyResult> {
        let (tx, rx) = oneshot::channel();

        let json = match settings.to_json() {
            Ok(j) => j,
            Err(e) => {
                let _ = tx.send(Err(format!("Failed to encode settings: {}", e)));
                return rx;
            }
        };

        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed) + 1;
        {
            let mut pending = self.pending.lock();
            // Drop requests whose waiter gave up (timed out)
            pending.retain(|_, tx| !tx.is_closed());
            pending.insert(request_id, tx);
        }

        log::info!("Applying tunnel network settings (request {})", request_id);
        if !crate::callbacks::fire_apply_settings(request_id, &json) {
            if let Some(tx) = self.pending.lock().remove(&request_id) {
                let _ = tx.send(Err("No settings handler registered".to_string()));
            }
        }

        rx
    }
}
