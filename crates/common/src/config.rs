//! Application configuration.
//!
//! Playback and render preferences are snapshotted by the render engine
//! when a command is armed, so edits to a loaded config never affect a
//! schedule that is already running.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Global application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Realtime playback preferences.
    #[serde(default)]
    pub playback: PlaybackConfig,

    /// Batch and distributed render preferences.
    #[serde(default)]
    pub render: RenderConfig,

    /// Asset cache limits.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Realtime playback preferences.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Audio fragment length in samples at the project rate.
    pub audio_fragment_len: i64,

    /// Render every video frame instead of dropping late ones.
    pub video_every_frame: bool,

    /// Hysteresis budget for the skip and delay counters of the sync loop.
    pub sync_threshold: u32,

    /// Wrap playback around the command range.
    pub loop_playback: bool,
}

/// Batch render preferences.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Warm-up rendered and discarded before each package, in seconds.
    pub render_preroll_secs: f64,

    /// Warm-up for background packages, in video frames.
    pub background_preroll_frames: i64,

    /// Worker count. Also the requested number of buffered video frames.
    pub processors: usize,

    /// Upper bound on buffered video frames per write call.
    pub max_pending_frames: usize,

    /// Audio read granularity in seconds.
    pub audio_read_secs: f64,
}

/// Asset cache limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Memory budget for idle open sources, in bytes.
    pub max_bytes: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "montage::schedule=trace,info").
    pub level: String,

    /// Whether to output structured JSON logs.
    pub json: bool,

    /// Optional log file path.
    pub file: Option<PathBuf>,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            audio_fragment_len: 4096,
            video_every_frame: false,
            sync_threshold: 5,
            loop_playback: false,
        }
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            render_preroll_secs: 0.5,
            background_preroll_frames: 0,
            processors: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            max_pending_frames: 2,
            audio_read_secs: 1.0,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: 64 * 1024 * 1024,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file: None,
        }
    }
}

impl AppConfig {
    /// Load config from the standard location, falling back to defaults.
    pub fn load() -> Self {
        Self::load_from(&config_file_path())
    }

    /// Load config from an explicit path, falling back to defaults.
    pub fn load_from(config_path: &std::path::Path) -> Self {
        if config_path.exists() {
            match std::fs::read_to_string(config_path) {
                Ok(content) => match serde_json::from_str::<AppConfig>(&content) {
                    Ok(config) => return config.sanitized(),
                    Err(e) => {
                        tracing::warn!("Failed to parse config at {:?}: {}", config_path, e);
                    }
                },
                Err(e) => {
                    tracing::warn!("Failed to read config at {:?}: {}", config_path, e);
                }
            }
        }
        Self::default()
    }

    /// Save config to the standard location.
    pub fn save(&self) -> Result<(), std::io::Error> {
        let config_path = config_file_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(config_path, json)
    }

    /// Clamp values that would stall a schedule.
    fn sanitized(mut self) -> Self {
        if self.playback.audio_fragment_len < 1 {
            tracing::warn!(
                value = self.playback.audio_fragment_len,
                "audio_fragment_len must be positive, using default"
            );
            self.playback.audio_fragment_len = PlaybackConfig::default().audio_fragment_len;
        }
        self.render.processors = self.render.processors.max(1);
        self.render.max_pending_frames = self.render.max_pending_frames.max(1);
        if self.render.audio_read_secs <= 0.0 {
            self.render.audio_read_secs = 1.0;
        }
        self.render.render_preroll_secs = self.render.render_preroll_secs.max(0.0);
        self.render.background_preroll_frames = self.render.background_preroll_frames.max(0);
        self
    }
}

/// Standard config file location.
pub fn config_file_path() -> PathBuf {
    let base = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".config")
        });
    base.join("montage").join("config.json")
}
