//! Tunnel orchestration
//!
//! ## Architecture
//!
//! - settings.rs: pure builder for the virtual interface's routing/proxy/DNS settings
//! - applier.rs: asynchronous hand-off of those settings to the host
//! - controller.rs: start/stop state machine driven by the host runtime

pub mod applier;
pub mod controller;
pub mod settings;

pub use applier::{ApplyResult, HostSettingsApplier, SettingsApplier};
pub use controller::{StopReason, TunnelController, TunnelState, TunnelStatus};
pub use settings::{build as build_settings, Ipv4Route, TunnelNetworkSettings};
