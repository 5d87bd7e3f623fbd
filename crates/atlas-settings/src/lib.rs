//! # atlas-settings
//!
//! Configuration for the Atlas sync engine, loaded from three layers in
//! priority order:
//!
//! 1. **Compiled defaults** — [`AtlasSettings::default()`]
//! 2. **User file** — `~/.atlas/settings.json` (deep-merged over defaults)
//! 3. **Environment variables** — `ATLAS_*` overrides (highest priority)

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
