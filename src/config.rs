//! SDK configuration
//!
//! Passed by the host as an optional JSON string to `geospoof_init`. Every
//! field has a default, so `{}` or a null pointer gives a working setup.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::TunnelError;

pub const DEFAULT_APP_GROUP: &str = "group.dev.duti.location-spoofer";
pub const DEFAULT_PROXY_HOST: &str = "127.0.0.1";
pub const DEFAULT_PROXY_PORT: u16 = 8888;

const SHARED_CONFIG_FILE: &str = "shared_config.json";
const CERTIFICATE_FILE: &str = "ca_material.json";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SdkConfig {
    /// Scope shared by the configuration surface and the tunnel process.
    pub app_group: String,
    /// Root of the persisted stores. Hosts pass their shared container here.
    pub storage_dir: Option<PathBuf>,
    pub proxy_host: String,
    pub proxy_port: u16,
    pub engine_timeout_ms: u64,
    pub settings_timeout_ms: u64,
}

impl Default for SdkConfig {
    fn default() -> Self {
        Self {
            app_group: DEFAULT_APP_GROUP.to_string(),
            storage_dir: None,
            proxy_host: DEFAULT_PROXY_HOST.to_string(),
            proxy_port: DEFAULT_PROXY_PORT,
            engine_timeout_ms: 15_000,
            settings_timeout_ms: 10_000,
        }
    }
}

impl SdkConfig {
    /// Parse from JSON; `None` yields the defaults.
    pub fn from_json(raw: Option<&str>) -> Result<Self, TunnelError> {
        let config: SdkConfig = match raw {
            Some(s) if !s.trim().is_empty() => serde_json::from_str(s)
                .map_err(|e| TunnelError::InvalidParam(format!("Invalid config_json: {}", e)))?,
            _ => SdkConfig::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), TunnelError> {
        if self.app_group.trim().is_empty() && self.storage_dir.is_none() {
            return Err(TunnelError::InvalidParam(
                "app_group must not be empty without storage_dir".into(),
            ));
        }
        if self.proxy_host.trim().is_empty() {
            return Err(TunnelError::InvalidParam("proxy_host must not be empty".into()));
        }
        if self.proxy_port == 0 {
            return Err(TunnelError::InvalidParam("proxy_port must not be 0".into()));
        }
        if self.engine_timeout_ms == 0 || self.settings_timeout_ms == 0 {
            return Err(TunnelError::InvalidParam("timeouts must be positive".into()));
        }
        Ok(())
    }

    /// Directory holding both stores.
    pub fn storage_root(&self) -> Result<PathBuf, TunnelError> {
        match &self.storage_dir {
            Some(dir) => Ok(dir.clone()),
            None => dirs::data_local_dir()
                .map(|d| d.join(&self.app_group))
                .ok_or_else(|| {
                    TunnelError::ConfigUnavailable("Could not determine storage directory".into())
                }),
        }
    }

    pub fn shared_config_path(&self) -> Result<PathBuf, TunnelError> {
        Ok(self.storage_root()?.join(SHARED_CONFIG_FILE))
    }

    pub fn certificate_path(&self) -> Result<PathBuf, TunnelError> {
        Ok(self.storage_root()?.join(CERTIFICATE_FILE))
    }

    pub fn engine_timeout(&self) -> Duration {
        Duration::from_millis(self.engine_timeout_ms)
    }

    pub fn settings_timeout(&self) -> Duration {
        Duration::from_millis(self.settings_timeout_ms)
    }
}
