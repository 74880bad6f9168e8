//! Configuration module for voice-stream.
//!
//! Provides `AppConfig` (top-level settings), sub-configs for playback and
//! capture, `AppPaths` for cross-platform directories, and TOML persistence
//! via `AppConfig::load` / `AppConfig::save`.

pub mod paths;
pub mod settings;

pub use paths::AppPaths;
pub use settings::{AppConfig, CaptureConfig, PlaybackConfig};
