//! # argus-settings
//!
//! Layered configuration for the Argus bridge.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`ArgusSettings::default()`]
//! 2. **User file**: `~/.argus/settings.json` or an explicit path, deep-merged over defaults
//! 3. **Environment variables**: `ARGUS_*` overrides (highest priority)
//!
//! ```no_run
//! use argus_settings::get_settings;
//!
//! let settings = get_settings();
//! println!("TCP port: {}", settings.server.tcp_port);
//! ```

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, apply_overrides, deep_merge, load_settings, load_settings_from_path,
    settings_path,
};
pub use types::*;

use std::sync::OnceLock;

static SETTINGS: OnceLock<ArgusSettings> = OnceLock::new();

/// Get the global settings instance.
///
/// On first call, loads settings from `~/.argus/settings.json` with env var
/// overrides, falling back to compiled defaults if loading fails.
pub fn get_settings() -> &'static ArgusSettings {
    SETTINGS.get_or_init(|| load_settings().unwrap_or_default())
}

/// Initialize the global settings with a specific value.
///
/// Returns the settings back if the global was already initialized.
#[allow(clippy::result_large_err)]
pub fn init_settings(settings: ArgusSettings) -> std::result::Result<(), ArgusSettings> {
    SETTINGS.set(settings)
}
