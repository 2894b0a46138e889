//! Configuration management for the scanner.
//!
//! Loads configuration from TOML files and provides runtime defaults. A
//! loaded [`Config`] is an immutable snapshot: runtime updates arrive as
//! whole-snapshot replacements through the orchestrator, never as partial
//! patches.

use crate::types::{CaptureMode, TargetSignature, WindowId};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{info, warn};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub capture: CaptureConfig,

    #[serde(default)]
    pub scan: ScanConfig,

    #[serde(default)]
    pub roi: RoiConfig,

    #[serde(default)]
    pub templates: TemplatesConfig,

    #[serde(default)]
    pub workers: WorkersConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            capture: CaptureConfig::default(),
            scan: ScanConfig::default(),
            roi: RoiConfig::default(),
            templates: TemplatesConfig::default(),
            workers: WorkersConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Whether the scanner is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Capture mode: "monitor" or "window"
    #[serde(default = "default_mode")]
    pub mode: CaptureMode,

    /// Monitor index when mode = "monitor"
    #[serde(default)]
    pub monitor_index: usize,

    /// Explicit window handle; 0 means unset
    #[serde(default)]
    pub target_hwnd: WindowId,

    /// Window-title fragment, matched case-insensitively as a substring
    #[serde(default)]
    pub window_title: String,

    /// Process-name fragment, matched case-insensitively as a substring
    #[serde(default)]
    pub process_name: String,

    /// Target capture frame rate
    #[serde(default = "default_fps")]
    pub fps: u32,

    /// Include the cursor in captured frames
    #[serde(default)]
    pub include_cursor: bool,

    /// Require the window border/frame in captures
    #[serde(default)]
    pub border_required: bool,

    /// Restore a minimized window after capturing it
    #[serde(default)]
    pub restore_minimized: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            mode: CaptureMode::Monitor,
            monitor_index: 0,
            target_hwnd: 0,
            window_title: String::new(),
            process_name: String::new(),
            fps: default_fps(),
            include_cursor: false,
            border_required: false,
            restore_minimized: false,
        }
    }
}

impl CaptureConfig {
    /// Derive the capture-target signature used to decide whether a config
    /// change needs a session rebuild or can be applied in place.
    pub fn signature(&self) -> TargetSignature {
        match self.mode {
            CaptureMode::Monitor => TargetSignature::Monitor {
                index: self.monitor_index,
            },
            CaptureMode::Window => TargetSignature::Window {
                hwnd: self.target_hwnd,
                title: normalize_fragment(&self.window_title),
                process: normalize_fragment(&self.process_name),
            },
        }
    }
}

/// Normalize a title/process fragment for matching and signatures
pub fn normalize_fragment(s: &str) -> String {
    s.trim().to_lowercase()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Base scan interval in milliseconds (may widen under load)
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Minimum match confidence to accept (0.0..=1.0)
    #[serde(default = "default_threshold")]
    pub threshold: f32,

    /// Match in grayscale instead of full color
    #[serde(default = "default_true")]
    pub grayscale: bool,

    /// Minimum time between two accepted clicks, in milliseconds
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,

    /// Extra debug logging
    #[serde(default)]
    pub debug_mode: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            threshold: default_threshold(),
            grayscale: true,
            cooldown_ms: default_cooldown_ms(),
            debug_mode: false,
        }
    }
}

/// Region of interest within a frame.
///
/// Accepts either explicit edges (`left/top/right/bottom`) or an extent
/// (`x/y/width/height`); edges win when both are present. A zero
/// `right`/`bottom`/`width`/`height` means "to the full frame extent". All
/// values are clamped into frame bounds at crop time, so negative or
/// oversized values are safe.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RoiConfig {
    #[serde(default)]
    pub left: Option<i32>,
    #[serde(default)]
    pub top: Option<i32>,
    #[serde(default)]
    pub right: Option<i32>,
    #[serde(default)]
    pub bottom: Option<i32>,

    #[serde(default)]
    pub x: Option<i32>,
    #[serde(default)]
    pub y: Option<i32>,
    #[serde(default)]
    pub width: Option<i32>,
    #[serde(default)]
    pub height: Option<i32>,
}

impl RoiConfig {
    /// Whether the edge form (`left/top/right/bottom`) is in use
    pub fn uses_edges(&self) -> bool {
        self.left.is_some() || self.top.is_some() || self.right.is_some() || self.bottom.is_some()
    }

    /// A full-frame region (no cropping)
    pub fn full() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplatesConfig {
    /// Template locations: files, directories or glob patterns, resolved
    /// against multiple candidate roots
    #[serde(default)]
    pub paths: Vec<String>,

    /// Pixel offset added to the computed click point
    #[serde(default)]
    pub click_offset: [i32; 2],
}

impl Default for TemplatesConfig {
    fn default() -> Self {
        Self {
            paths: Vec::new(),
            click_offset: [0, 0],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkersConfig {
    /// Upper bound on worker processes; effective N = min(cpu_count, cap)
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Result-poll interval while tasks are outstanding
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Worker exits after this long without work
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Tasks without a result within this horizon are swept
    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            poll_interval_ms: default_poll_interval_ms(),
            idle_timeout_secs: default_idle_timeout_secs(),
            task_timeout_ms: default_task_timeout_ms(),
        }
    }
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_mode() -> CaptureMode {
    CaptureMode::Monitor
}

fn default_fps() -> u32 {
    30
}

fn default_interval_ms() -> u64 {
    33
}

fn default_threshold() -> f32 {
    0.88
}

fn default_cooldown_ms() -> u64 {
    1500
}

fn default_max_workers() -> usize {
    8
}

fn default_poll_interval_ms() -> u64 {
    16
}

fn default_idle_timeout_secs() -> u64 {
    30
}

fn default_task_timeout_ms() -> u64 {
    5000
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Self {
        Self::load_from_path(Self::default_config_path())
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: PathBuf) -> Self {
        match std::fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    info!("Loaded configuration from {:?}", path);
                    config
                }
                Err(e) => {
                    warn!("Failed to parse config file: {}, using defaults", e);
                    Self::default()
                }
            },
            Err(_) => {
                info!("No config file found at {:?}, using defaults", path);
                Self::default()
            }
        }
    }

    /// Get the default configuration file path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("screen-scanner")
            .join("config.toml")
    }

    /// Save configuration to the default path
    pub fn save(&self) -> std::io::Result<()> {
        self.save_to_path(Self::default_config_path())
    }

    /// Save configuration to a specific path
    pub fn save_to_path(&self, path: PathBuf) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;

        std::fs::write(&path, contents)?;
        info!("Saved configuration to {:?}", path);
        Ok(())
    }
}
