//! Capture backend interface and the periodic capture stage.
//!
//! The graphics backend itself is a collaborator behind [`CaptureBackend`];
//! this module owns target resolution order, the capture tick and the
//! hand-off into the freshest-frame queue.

use crate::config::CaptureConfig;
use crate::frame_queue::FreshestFrameQueue;
use crate::types::{CaptureMode, Frame, ScanError, WindowId};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Floor for the capture tick, whatever the configured fps
const MIN_TICK: Duration = Duration::from_millis(16);

/// How a window capture target is addressed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowTarget {
    /// Explicit platform window handle
    Hwnd(WindowId),
    /// Title fragment
    Title(String),
    /// Process-name fragment
    Process(String),
}

/// Diagnostics snapshot from the backend
#[derive(Debug, Clone, Default)]
pub struct BackendStats {
    /// Resolved window handle, when capturing a window
    pub target_hwnd: Option<WindowId>,
    /// Monitor index, when capturing a monitor
    pub target_monitor: Option<usize>,
    /// Frames produced since the session opened
    pub frames_captured: u64,
}

/// Graphics-capture backend seam.
///
/// Open calls return `true` on success the way the underlying session APIs
/// report it; frame calls return `None` for transient misses and must never
/// block the tick for long.
#[async_trait]
pub trait CaptureBackend: Send {
    /// Apply in-place session parameters
    fn configure(&mut self, fps: u32, include_cursor: bool, border_required: bool, restore_minimized: bool);

    /// Open a capture session against a monitor
    async fn open_monitor(&mut self, index: usize) -> bool;

    /// Open a capture session against a window. `partial_match` enables
    /// case-insensitive substring matching for title/process targets.
    async fn open_window(&mut self, target: WindowTarget, partial_match: bool) -> bool;

    /// One direct capture attempt; `None` is a transient miss
    fn capture_frame(&mut self, restore_after_capture: bool) -> Option<Frame>;

    /// Cheap cached-frame lookup, tried before a direct capture
    fn shared_frame(&mut self, tag: &str, purpose: &str) -> Option<Frame>;

    fn stats(&self) -> BackendStats;

    fn close(&mut self);
}

/// Capture tick period: `clamp(1000/fps, >= 16ms)`
pub fn tick_period(fps: u32) -> Duration {
    let ms = 1000 / fps.max(1) as u64;
    Duration::from_millis(ms).max(MIN_TICK)
}

/// Open the configured target with the standard priority order:
/// monitor index, or hwnd → title partial match → process partial match,
/// first success wins.
pub async fn open_target(backend: &mut dyn CaptureBackend, cfg: &CaptureConfig) -> Result<(), ScanError> {
    backend.configure(
        cfg.fps,
        cfg.include_cursor,
        cfg.border_required,
        cfg.restore_minimized,
    );

    match cfg.mode {
        CaptureMode::Monitor => {
            if backend.open_monitor(cfg.monitor_index).await {
                info!("Monitor capture opened: index {}", cfg.monitor_index);
                return Ok(());
            }
            Err(ScanError::CaptureOpenFailed(format!(
                "monitor {} unavailable",
                cfg.monitor_index
            )))
        }
        CaptureMode::Window => {
            if cfg.target_hwnd != 0
                && backend
                    .open_window(WindowTarget::Hwnd(cfg.target_hwnd), false)
                    .await
            {
                info!("Window capture opened: hwnd {}", cfg.target_hwnd);
                return Ok(());
            }

            let title = cfg.window_title.trim();
            if !title.is_empty()
                && backend
                    .open_window(WindowTarget::Title(title.to_string()), true)
                    .await
            {
                info!("Window capture opened: title ~ {:?}", title);
                return Ok(());
            }

            let process = cfg.process_name.trim();
            if !process.is_empty()
                && backend
                    .open_window(WindowTarget::Process(process.to_string()), true)
                    .await
            {
                info!("Window capture opened: process ~ {:?}", process);
                return Ok(());
            }

            Err(ScanError::CaptureOpenFailed(
                "no window matched hwnd/title/process".to_string(),
            ))
        }
    }
}

/// Periodic frame producer.
///
/// Owns the capture session; the backend is touched only from the tick task
/// (and from `start`/`stop`, which never overlap with a running tick).
pub struct CaptureStage {
    backend: Arc<tokio::sync::Mutex<Box<dyn CaptureBackend>>>,
    queue: Arc<FreshestFrameQueue<Frame>>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl CaptureStage {
    pub fn new(backend: Box<dyn CaptureBackend>, queue: Arc<FreshestFrameQueue<Frame>>) -> Self {
        Self {
            backend: Arc::new(tokio::sync::Mutex::new(backend)),
            queue,
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Backend diagnostics for status lines
    pub async fn stats(&self) -> BackendStats {
        self.backend.lock().await.stats()
    }

    /// Open the session and enter the capture loop.
    ///
    /// On open failure the error is returned, `running` stays false and no
    /// loop is started.
    pub async fn start(&mut self, cfg: &CaptureConfig) -> Result<(), ScanError> {
        if self.is_running() {
            return Ok(());
        }

        {
            let mut backend = self.backend.lock().await;
            open_target(backend.as_mut(), cfg).await?;
        }

        self.running.store(true, Ordering::SeqCst);

        let backend = Arc::clone(&self.backend);
        let queue = Arc::clone(&self.queue);
        let running = Arc::clone(&self.running);
        let restore = cfg.restore_minimized;
        let period = tick_period(cfg.fps);

        self.handle = Some(tokio::spawn(async move {
            debug!("Capture loop started, tick {:?}", period);
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            while running.load(Ordering::SeqCst) {
                interval.tick().await;

                let mut backend = backend.lock().await;
                // Shared/cached frame first, direct capture as fallback;
                // a miss is a silent no-op, never a loop exit.
                let frame = backend
                    .shared_frame("scanner", "detection")
                    .or_else(|| backend.capture_frame(restore));
                drop(backend);

                match frame {
                    Some(frame) => queue.put(frame),
                    None => trace!("Capture tick produced no frame"),
                }
            }

            debug!("Capture loop exited");
        }));

        Ok(())
    }

    /// Cancel the tick, then close the session. Idempotent.
    pub async fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.handle.take() {
            handle.abort();
            let _ = handle.await;
        }

        self.backend.lock().await.close();
        debug!("Capture stage stopped");
    }

    /// Stop-then-restart with the new parameters, for consistency
    pub async fn update_config(&mut self, cfg: &CaptureConfig) -> Result<(), ScanError> {
        self.stop().await;
        self.start(cfg).await
    }

    /// Reconfigure in-place session parameters without reopening
    pub async fn reconfigure(&self, cfg: &CaptureConfig) {
        let mut backend = self.backend.lock().await;
        backend.configure(
            cfg.fps,
            cfg.include_cursor,
            cfg.border_required,
            cfg.restore_minimized,
        );
    }

    /// Close and reopen the session against a new target, keeping the loop
    /// machinery. Used by hot reload when the target signature changed.
    pub async fn reopen_target(&mut self, cfg: &CaptureConfig) -> Result<(), ScanError> {
        self.stop().await;
        match self.start(cfg).await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!("Capture reopen failed: {}", e);
                Err(e)
            }
        }
    }
}

impl Drop for CaptureStage {
    fn drop(&mut self) {
        if self.is_running() {
            warn!("Capture stage dropped while running");
            self.running.store(false, Ordering::SeqCst);
            if let Some(handle) = self.handle.take() {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_backend {
    use super::*;
    use image::RgbaImage;
    use std::sync::Mutex;

    /// Scripted backend recording every call, for stage/orchestrator tests
    pub struct MockBackend {
        pub calls: Arc<Mutex<Vec<String>>>,
        pub open_result: bool,
        pub frame_size: Option<(u32, u32)>,
        pub resolved_hwnd: Option<WindowId>,
    }

    impl MockBackend {
        pub fn new(open_result: bool) -> (Self, Arc<Mutex<Vec<String>>>) {
            let calls = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    calls: Arc::clone(&calls),
                    open_result,
                    frame_size: Some((64, 48)),
                    resolved_hwnd: None,
                },
                calls,
            )
        }

        fn record(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }
    }

    #[async_trait]
    impl CaptureBackend for MockBackend {
        fn configure(&mut self, fps: u32, _: bool, _: bool, _: bool) {
            self.record(format!("configure fps={}", fps));
        }

        async fn open_monitor(&mut self, index: usize) -> bool {
            self.record(format!("open_monitor {}", index));
            self.open_result
        }

        async fn open_window(&mut self, target: WindowTarget, partial: bool) -> bool {
            self.record(format!("open_window {:?} partial={}", target, partial));
            self.open_result
        }

        fn capture_frame(&mut self, _restore: bool) -> Option<Frame> {
            self.record("capture_frame");
            self.frame_size
                .map(|(w, h)| Frame::new(RgbaImage::new(w, h)))
        }

        fn shared_frame(&mut self, _tag: &str, _purpose: &str) -> Option<Frame> {
            None
        }

        fn stats(&self) -> BackendStats {
            BackendStats {
                target_hwnd: self.resolved_hwnd,
                target_monitor: None,
                frames_captured: 0,
            }
        }

        fn close(&mut self) {
            self.record("close");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_backend::MockBackend;
    use super::*;
    use crate::config::CaptureConfig;
    use crate::types::CaptureMode;

    #[test]
    fn test_tick_period_clamps() {
        assert_eq!(tick_period(30), Duration::from_millis(33));
        assert_eq!(tick_period(10), Duration::from_millis(100));
        // 120 fps would be ~8ms, clamped to the 16ms floor
        assert_eq!(tick_period(120), Duration::from_millis(16));
        assert_eq!(tick_period(0), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_open_target_window_priority() {
        let (mut backend, calls) = MockBackend::new(false);
        backend.open_result = false;

        let mut cfg = CaptureConfig::default();
        cfg.mode = CaptureMode::Window;
        cfg.target_hwnd = 42;
        cfg.window_title = "Approve".to_string();
        cfg.process_name = "editor".to_string();

        let result = open_target(&mut backend, &cfg).await;
        assert!(matches!(result, Err(ScanError::CaptureOpenFailed(_))));

        // hwnd first (exact), then title, then process (both partial)
        let recorded = calls.lock().unwrap();
        assert!(recorded[1].contains("Hwnd(42)") && recorded[1].contains("partial=false"));
        assert!(recorded[2].contains("Title(\"Approve\")") && recorded[2].contains("partial=true"));
        assert!(recorded[3].contains("Process(\"editor\")") && recorded[3].contains("partial=true"));
    }

    #[tokio::test]
    async fn test_open_target_first_success_wins() {
        let (mut backend, calls) = MockBackend::new(true);

        let mut cfg = CaptureConfig::default();
        cfg.mode = CaptureMode::Window;
        cfg.target_hwnd = 42;
        cfg.window_title = "unused".to_string();

        open_target(&mut backend, &cfg).await.unwrap();
        let recorded = calls.lock().unwrap();
        // configure + one open attempt, nothing else
        assert_eq!(recorded.len(), 2);
        assert!(recorded[1].contains("Hwnd(42)"));
    }

    #[tokio::test]
    async fn test_start_failure_leaves_stage_stopped() {
        let (backend, _calls) = MockBackend::new(false);
        let queue = Arc::new(FreshestFrameQueue::default());
        let mut stage = CaptureStage::new(Box::new(backend), queue);

        let cfg = CaptureConfig::default();
        assert!(stage.start(&cfg).await.is_err());
        assert!(!stage.is_running());
    }

    #[tokio::test]
    async fn test_capture_loop_feeds_queue() {
        let (backend, _calls) = MockBackend::new(true);
        let queue = Arc::new(FreshestFrameQueue::default());
        let mut stage = CaptureStage::new(Box::new(backend), Arc::clone(&queue));

        let mut cfg = CaptureConfig::default();
        cfg.fps = 60; // 16ms tick
        stage.start(&cfg).await.unwrap();
        assert!(stage.is_running());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(queue.get_latest().is_some());

        stage.stop().await;
        assert!(!stage.is_running());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (backend, calls) = MockBackend::new(true);
        let queue = Arc::new(FreshestFrameQueue::default());
        let mut stage = CaptureStage::new(Box::new(backend), queue);

        stage.start(&CaptureConfig::default()).await.unwrap();
        stage.stop().await;
        stage.stop().await;

        let closes = calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.as_str() == "close")
            .count();
        assert_eq!(closes, 2); // close on an already-closed backend is a no-op there
        assert!(!stage.is_running());
    }
}
