//! Core types used throughout the scanner.
//!
//! This module defines the fundamental data structures for frames, match
//! tasks/results, capture-target identity and the scanner event stream.

use image::RgbaImage;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Unique identifier for a submitted match task
pub type TaskId = String;

/// Platform window identifier (HWND on Windows, window id elsewhere)
pub type WindowId = u32;

/// A captured frame: owned pixel buffer plus capture timestamp.
///
/// Produced by the capture stage and consumed at most once by the
/// recognition stage; superseded frames are dropped, never queued.
#[derive(Debug, Clone)]
pub struct Frame {
    /// RGBA pixel data
    pub image: RgbaImage,
    /// When the frame was captured
    pub captured_at: Instant,
}

impl Frame {
    pub fn new(image: RgbaImage) -> Self {
        Self {
            image,
            captured_at: Instant::now(),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Age of the frame at the time of the call
    pub fn age(&self) -> Duration {
        self.captured_at.elapsed()
    }
}

/// Result of a template-match task, correlated 1:1 with its task by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchResult {
    /// Task this result belongs to
    pub task_id: TaskId,
    /// Whether any template scored at or above the threshold
    pub match_found: bool,
    /// Best score across all templates (0.0..=1.0)
    pub confidence: f32,
    /// Screen-space click x (present only when `match_found`)
    pub click_x: Option<i32>,
    /// Screen-space click y (present only when `match_found`)
    pub click_y: Option<i32>,
    /// Time spent matching inside the worker
    pub execution_time_ms: u64,
    /// PID of the worker process that produced the result
    pub worker_pid: u32,
}

/// How the capture target is selected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMode {
    /// Capture a whole monitor by index
    Monitor,
    /// Capture a single window (hwnd, title or process resolution)
    Window,
}

/// Identity of the active capture target.
///
/// Derived from a config snapshot; two snapshots with equal signatures can be
/// applied in place, a signature change requires a session rebuild.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSignature {
    Monitor {
        index: usize,
    },
    Window {
        hwnd: WindowId,
        /// Normalized (trimmed, lowercased) title fragment
        title: String,
        /// Normalized (trimmed, lowercased) process fragment
        process: String,
    },
}

/// Events emitted by the scanner toward the shell
#[derive(Debug, Clone)]
pub enum ScanEvent {
    /// Human-readable status line (tray tooltip style)
    Status(String),
    /// A match was accepted and clicked
    Hit {
        confidence: f32,
        screen_x: i32,
        screen_y: i32,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    /// Free-text log line, carries task ids for correlation
    Log(String),
}

/// Lifecycle state of the scan orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl ScanState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanState::Stopped => "stopped",
            ScanState::Starting => "starting",
            ScanState::Running => "running",
            ScanState::Stopping => "stopping",
        }
    }
}

/// Errors that can occur in the capture-match-act pipeline
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("failed to open capture target: {0}")]
    CaptureOpenFailed(String),

    #[error("frame capture failed")]
    CaptureFrameFailed,

    #[error("template loading failed: {0}")]
    TemplateLoad(String),

    #[error("failed to spawn worker process: {0}")]
    WorkerSpawn(String),

    #[error("worker protocol error: {0}")]
    WorkerProtocol(String),

    #[error("task {task_id} failed: {message}")]
    TaskFailed { task_id: TaskId, message: String },

    #[error("task {0} timed out")]
    TaskTimeout(TaskId),

    #[error("click at ({x}, {y}) was rejected by the input primitive")]
    ClickFailed { x: i32, y: i32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbaImage;

    #[test]
    fn test_frame_dimensions_and_age() {
        let frame = Frame::new(RgbaImage::new(640, 480));
        assert_eq!(frame.width(), 640);
        assert_eq!(frame.height(), 480);
        assert!(frame.age() < Duration::from_secs(1));
    }

    #[test]
    fn test_target_signature_equality() {
        let a = TargetSignature::Window {
            hwnd: 0,
            title: "approve".to_string(),
            process: "".to_string(),
        };
        let b = TargetSignature::Window {
            hwnd: 0,
            title: "approve".to_string(),
            process: "".to_string(),
        };
        assert_eq!(a, b);

        let c = TargetSignature::Monitor { index: 0 };
        assert_ne!(a, c);
    }

    #[test]
    fn test_scan_state_as_str() {
        assert_eq!(ScanState::Stopped.as_str(), "stopped");
        assert_eq!(ScanState::Running.as_str(), "running");
    }

    #[test]
    fn test_match_result_roundtrip() {
        let result = MatchResult {
            task_id: "t1".to_string(),
            match_found: true,
            confidence: 0.97,
            click_x: Some(120),
            click_y: Some(340),
            execution_time_ms: 12,
            worker_pid: 4242,
        };
        let json = serde_json::to_string(&result).unwrap();
        let back: MatchResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back.task_id, "t1");
        assert_eq!(back.click_x, Some(120));
        assert!(back.match_found);
    }
}
