//! CA certificate material for the interception engine.
//!
//! The pair is generated by the engine on first need, persisted, and reused
//! across restarts. Presence of both PEM strings is taken as validity; the
//! content is not inspected.
//!
//! The generation lock only serializes callers within one process. The
//! configuration surface and the tunnel process can both reach the store, so
//! each re-reads it after generating and adopts a pair the other process
//! stored in the meantime. A write that lands between that re-read and the
//! rename can still replace the other process's pair; there is no
//! cross-process file lock.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::engine::InterceptionEngine;
use crate::error::TunnelError;
use crate::store::{KeyValueStore, StoreError};

pub const CA_CERTIFICATE_KEY: &str = "ca_certificate_pem";
pub const CA_PRIVATE_KEY_KEY: &str = "ca_private_key_pem";

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaCertificate {
    pub cert_pem: String,
    pub key_pem: String,
}

impl fmt::Debug for CaCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaCertificate")
            .field("cert_pem", &format_args!("{} bytes", self.cert_pem.len()))
            .field("key_pem", &"<redacted>")
            .finish()
    }
}

fn unavailable(e: StoreError) -> TunnelError {
    TunnelError::CertificateUnavailable(e.to_string())
}

fn non_empty_string(value: Option<&Value>) -> Option<String> {
    value
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

pub struct CertificateStore {
    store: Arc<dyn KeyValueStore>,
    engine: Arc<dyn InterceptionEngine>,
    /// Held across lookup + generation so concurrent callers generate once.
    generation: Mutex<()>,
}

impl CertificateStore {
    pub fn new(store: Arc<dyn KeyValueStore>, engine: Arc<dyn InterceptionEngine>) -> Self {
        Self {
            store,
            engine,
            generation: Mutex::new(()),
        }
    }

    /// Stored pair, if both halves are present. No side effects.
    pub fn get(&self) -> Result<Option<CaCertificate>, TunnelError> {
        let values = self
            .store
            .get_many(&[CA_CERTIFICATE_KEY, CA_PRIVATE_KEY_KEY])
            .map_err(unavailable)?;

        let cert = non_empty_string(values.first().and_then(|v| v.as_ref()));
        let key = non_empty_string(values.get(1).and_then(|v| v.as_ref()));

        match (cert, key) {
            (Some(cert_pem), Some(key_pem)) => Ok(Some(CaCertificate { cert_pem, key_pem })),
            (None, None) => Ok(None),
            _ => {
                log::warn!("Incomplete CA material in store, treating as absent");
                Ok(None)
            }
        }
    }

    /// Stored pair, generating and persisting a new one when absent.
    ///
    /// Blocks on the engine when generation is needed.
    pub fn get_or_create(&self) -> Result<CaCertificate, TunnelError> {
        let _guard = self.generation.lock();

        if let Some(stored) = self.get()? {
            log::info!("Using stored CA certificate");
            return Ok(stored);
        }

        log::info!("Generating new CA certificate pair");
        let (cert_pem, key_pem) = self.engine.generate_ca().ok_or_else(|| {
            log::error!("Interception engine failed to generate CA certificate");
            TunnelError::CertificateUnavailable("CA generation failed".to_string())
        })?;

        if cert_pem.is_empty() || key_pem.is_empty() {
            return Err(TunnelError::CertificateUnavailable(
                "engine returned empty CA material".to_string(),
            ));
        }

        if let Some(stored) = self.get()? {
            log::warn!("CA certificate stored by another process during generation, using it");
            return Ok(stored);
        }

        self.store
            .set_many(&[
                (CA_CERTIFICATE_KEY, json!(cert_pem)),
                (CA_PRIVATE_KEY_KEY, json!(key_pem)),
            ])
            .map_err(unavailable)?;

        log::info!("New CA certificate pair generated and stored");
        Ok(CaCertificate { cert_pem, key_pem })
    }

    pub fn clear(&self) -> Result<(), TunnelError> {
        let _guard = self.generation.lock();
        self.store
            .remove_many(&[CA_CERTIFICATE_KEY, CA_PRIVATE_KEY_KEY])
            .map_err(unavailable)?;
        log::info!("CA certificate material cleared");
        Ok(())
    }
}
