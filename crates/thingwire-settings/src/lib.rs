//! # thingwire-settings
//!
//! Layered configuration for a thingwire client:
//! 1. **Compiled defaults**: [`ThingwireSettings::default()`]
//! 2. **User file**: `~/.thingwire/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `THINGWIRE_*` overrides (highest priority)

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{apply_env_overrides, deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
