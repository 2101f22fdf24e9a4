//! # stock-settings
//!
//! Configuration for the stockstream service, loaded in three layers
//! (in priority order):
//! 1. **Compiled defaults** - [`StockSettings::default()`]
//! 2. **Settings file** - `$STOCKSTREAM_CONFIG` or `./stockstream.json`
//!    (deep-merged over defaults)
//! 3. **Environment variables** - `STOCKSTREAM_*` overrides (highest priority)
//!
//! Loaded settings must pass [`StockSettings::validate`] before the listener
//! starts; a validation failure is fatal at startup.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, deep_merge, load_settings, load_settings_from_path, settings_path,
    IgnoredEnvVar, LoadedSettings,
};
pub use types::*;
