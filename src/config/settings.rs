//! Application settings structs, defaults and TOML persistence.
//!
//! All structs implement `Serialize`, `Deserialize`, `Default` and `Clone`
//! so they can be round-tripped through TOML files.  Missing keys fall back
//! to their defaults, so a hand-written `settings.toml` only needs the values
//! it changes.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::audio::{DEFAULT_CAPACITY_MARGIN_FRAMES, DEFAULT_RESAMPLER_CHUNK_FRAMES};

use super::AppPaths;

// ---------------------------------------------------------------------------
// PlaybackConfig
// ---------------------------------------------------------------------------

/// Settings for the speech output path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Sample rate of the mono batches produced by the speech generator.
    pub source_sample_rate: u32,
    /// Length of one conversion window in milliseconds.  Each window becomes
    /// one scheduled buffer.
    pub chunk_duration_ms: u32,
    /// Minimum extra destination frames allocated on top of the exact
    /// conversion size.  A resampler raises it to one pass plus its delay.
    pub capacity_margin_frames: usize,
    /// Input block size of the FFT resampler.
    pub resampler_chunk_frames: usize,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            source_sample_rate: 24_000,
            chunk_duration_ms: 1_000,
            capacity_margin_frames: DEFAULT_CAPACITY_MARGIN_FRAMES,
            resampler_chunk_frames: DEFAULT_RESAMPLER_CHUNK_FRAMES,
        }
    }
}

// ---------------------------------------------------------------------------
// CaptureConfig
// ---------------------------------------------------------------------------

/// Settings for the microphone tap.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Requested device buffer size in frames; `None` keeps the device
    /// default.
    pub buffer_frames: Option<u32>,
    /// Keep the capture gate closed from startup.
    pub start_muted: bool,
}

// ---------------------------------------------------------------------------
// AppConfig
// ---------------------------------------------------------------------------

/// Root configuration object persisted to `settings.toml`.
///
/// ```rust
/// use voice_stream::config::AppConfig;
///
/// let config = AppConfig::default();
/// assert_eq!(config.playback.source_sample_rate, 24_000);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Speech output settings.
    pub playback: PlaybackConfig,
    /// Microphone tap settings.
    pub capture: CaptureConfig,
}

impl AppConfig {
    /// Load configuration from the platform-appropriate `settings.toml`.
    ///
    /// Returns `Ok(AppConfig::default())` when the file does not exist yet.
    pub fn load() -> Result<Self> {
        Self::load_from(&AppPaths::new().settings_file)
    }

    /// Load from an explicit path (useful for tests).
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to the platform-appropriate `settings.toml`,
    /// creating parent directories as needed.
    pub fn save(&self) -> Result<()> {
        self.save_to(&AppPaths::new().settings_file)
    }

    /// Save to an explicit path (useful for tests).
    pub fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns `true` when no `settings.toml` file exists yet.
    pub fn is_first_run() -> bool {
        !AppPaths::new().settings_file.exists()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
