//! Recognition stage: the scan-loop consumer.
//!
//! Runs its own periodic loop, independently scheduled from the capture
//! tick: take the freshest frame, crop the region of interest, submit a
//! match task to the worker pool, forward results over a channel without
//! ever blocking the loop. Sleep time adapts to recent load.

use crate::adaptive::AdaptiveInterval;
use crate::config::{RoiConfig, TemplatesConfig};
use crate::frame_queue::FreshestFrameQueue;
use crate::types::{Frame, MatchResult, ScanError};
use crate::worker_pool::{encode_image, MatchPayload, WorkerPool};
use image::RgbaImage;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Minimal sleep when an iteration already overran its budget, so the loop
/// never busy-spins
const MIN_YIELD: Duration = Duration::from_millis(1);

/// Per-iteration matching parameters, swappable at runtime as a whole
#[derive(Debug, Clone)]
pub struct ScanParams {
    pub threshold: f32,
    pub grayscale: bool,
    pub roi: RoiConfig,
    pub click_offset: (i32, i32),
}

impl Default for ScanParams {
    fn default() -> Self {
        Self {
            threshold: 0.88,
            grayscale: true,
            roi: RoiConfig::full(),
            click_offset: (0, 0),
        }
    }
}

/// Crop `image` to the configured region of interest.
///
/// Returns the crop and its top-left offset within the frame. The result is
/// always fully contained in the frame and never empty; a region that clamps
/// to nothing falls back to the full extent on that axis.
pub fn crop_roi(image: &RgbaImage, roi: &RoiConfig) -> (RgbaImage, (i32, i32)) {
    let (w, h) = (image.width() as i32, image.height() as i32);

    let (x0, x1, y0, y1) = if roi.uses_edges() {
        (
            roi.left.unwrap_or(0),
            edge_or_full(roi.right, w),
            roi.top.unwrap_or(0),
            edge_or_full(roi.bottom, h),
        )
    } else {
        let x = roi.x.unwrap_or(0);
        let y = roi.y.unwrap_or(0);
        (
            x,
            match roi.width {
                Some(width) if width > 0 => x.saturating_add(width),
                _ => w,
            },
            y,
            match roi.height {
                Some(height) if height > 0 => y.saturating_add(height),
                _ => h,
            },
        )
    };

    let (x0, x1) = clamp_axis(x0, x1, w);
    let (y0, y1) = clamp_axis(y0, y1, h);

    let crop = image::imageops::crop_imm(
        image,
        x0 as u32,
        y0 as u32,
        (x1 - x0) as u32,
        (y1 - y0) as u32,
    )
    .to_image();

    (crop, (x0, y0))
}

fn edge_or_full(edge: Option<i32>, full: i32) -> i32 {
    match edge {
        Some(v) if v > 0 => v,
        _ => full,
    }
}

/// Clamp `[lo, hi)` into `[0, extent)`; a degenerate result falls back to
/// the full extent.
fn clamp_axis(lo: i32, hi: i32, extent: i32) -> (i32, i32) {
    let lo = lo.clamp(0, extent);
    let hi = hi.clamp(lo, extent);
    if hi <= lo {
        (0, extent)
    } else {
        (lo, hi)
    }
}

/// Sleep budget for one iteration: the adaptive interval minus the time the
/// iteration took, floored at the minimal yield.
pub(crate) fn throttle_budget(interval: Duration, loop_time: Duration) -> Duration {
    let remaining = interval.saturating_sub(loop_time);
    if remaining.is_zero() {
        MIN_YIELD
    } else {
        remaining
    }
}

/// Load and wire-encode all configured templates.
///
/// Each entry may be a file, a directory (searched for `*.png`) or a glob
/// pattern, resolved against the working directory, the executable's
/// directory and the config directory in that order.
pub fn load_templates(cfg: &TemplatesConfig) -> Result<Vec<String>, ScanError> {
    let roots = candidate_roots();
    let mut encoded = Vec::new();

    for entry in &cfg.paths {
        let files = resolve_entry(entry, &roots);
        if files.is_empty() {
            warn!("Template entry {:?} matched no files", entry);
            continue;
        }
        for file in files {
            let img = image::open(&file)
                .map_err(|e| ScanError::TemplateLoad(format!("{}: {}", file.display(), e)))?
                .to_rgba8();
            if img.width() == 0 || img.height() == 0 {
                warn!("Skipping empty template {:?}", file);
                continue;
            }
            encoded.push(encode_image(&img)?);
            debug!("Loaded template {:?} ({}x{})", file, img.width(), img.height());
        }
    }

    info!("Loaded {} templates", encoded.len());
    Ok(encoded)
}

fn candidate_roots() -> Vec<PathBuf> {
    let mut roots = vec![PathBuf::from(".")];
    if let Some(dir) = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf))
    {
        roots.push(dir);
    }
    if let Some(dir) = crate::config::Config::default_config_path()
        .parent()
        .map(Path::to_path_buf)
    {
        roots.push(dir);
    }
    roots
}

/// Expand one template entry against the candidate roots; the first root
/// with matches wins.
fn resolve_entry(entry: &str, roots: &[PathBuf]) -> Vec<PathBuf> {
    let path = Path::new(entry);
    let patterns: Vec<String> = if path.is_absolute() {
        vec![entry.to_string()]
    } else {
        roots
            .iter()
            .map(|root| root.join(entry).to_string_lossy().into_owned())
            .collect()
    };

    for pattern in patterns {
        // A directory entry means every PNG inside it
        let pattern = if Path::new(&pattern).is_dir() {
            format!("{}/*.png", pattern.trim_end_matches('/'))
        } else {
            pattern
        };

        let mut files: Vec<PathBuf> = match glob::glob(&pattern) {
            Ok(paths) => paths.filter_map(Result::ok).filter(|p| p.is_file()).collect(),
            Err(e) => {
                warn!("Bad template pattern {:?}: {}", pattern, e);
                continue;
            }
        };
        if !files.is_empty() {
            files.sort();
            return files;
        }
    }

    Vec::new()
}

/// Periodic frame consumer feeding the worker pool.
pub struct RecognitionStage {
    queue: Arc<FreshestFrameQueue<Frame>>,
    pool: WorkerPool,
    params: Arc<Mutex<ScanParams>>,
    /// Wire-encoded template images; empty means scanning is a no-op
    templates: Arc<Mutex<Vec<String>>>,
    adaptive: Arc<Mutex<AdaptiveInterval>>,
    results_tx: mpsc::UnboundedSender<Result<MatchResult, ScanError>>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl RecognitionStage {
    pub fn new(
        queue: Arc<FreshestFrameQueue<Frame>>,
        pool: WorkerPool,
        adaptive: Arc<Mutex<AdaptiveInterval>>,
        results_tx: mpsc::UnboundedSender<Result<MatchResult, ScanError>>,
    ) -> Self {
        Self {
            queue,
            pool,
            params: Arc::new(Mutex::new(ScanParams::default())),
            templates: Arc::new(Mutex::new(Vec::new())),
            adaptive,
            results_tx,
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Replace the matching parameters; takes effect on the next iteration
    pub fn set_params(&self, params: ScanParams) {
        *self.params.lock().unwrap_or_else(|e| e.into_inner()) = params;
    }

    /// Reload templates from config. Returns how many were loaded; an empty
    /// set leaves the loop running but idle.
    pub fn reload_templates(&self, cfg: &TemplatesConfig) -> Result<usize, ScanError> {
        let encoded = load_templates(cfg)?;
        let count = encoded.len();
        *self.templates.lock().unwrap_or_else(|e| e.into_inner()) = encoded;
        Ok(count)
    }

    /// Enter the scan loop. Idempotent while running.
    pub fn start(&mut self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let queue = Arc::clone(&self.queue);
        let pool = self.pool.clone();
        let params = Arc::clone(&self.params);
        let templates = Arc::clone(&self.templates);
        let adaptive = Arc::clone(&self.adaptive);
        let results_tx = self.results_tx.clone();
        let running = Arc::clone(&self.running);

        self.handle = Some(tokio::spawn(async move {
            debug!("Recognition loop started");

            while running.load(Ordering::SeqCst) {
                let started = Instant::now();

                let templates_snapshot = {
                    let guard = templates.lock().unwrap_or_else(|e| e.into_inner());
                    guard.clone()
                };

                if !templates_snapshot.is_empty() {
                    if let Some(frame) = queue.get_latest() {
                        let scan = {
                            let guard = params.lock().unwrap_or_else(|e| e.into_inner());
                            guard.clone()
                        };
                        submit_frame(&pool, &results_tx, frame, &scan, templates_snapshot);
                    }
                }

                let interval = {
                    let guard = adaptive.lock().unwrap_or_else(|e| e.into_inner());
                    guard.current()
                };
                tokio::time::sleep(throttle_budget(interval, started.elapsed())).await;
            }

            debug!("Recognition loop exited");
        }));
    }

    /// Leave the scan loop. Idempotent; in-flight tasks are untouched.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        debug!("Recognition stage stopped");
    }
}

/// Crop, encode and submit one frame; the completion handler forwards over
/// the result channel without blocking.
fn submit_frame(
    pool: &WorkerPool,
    results_tx: &mpsc::UnboundedSender<Result<MatchResult, ScanError>>,
    frame: Frame,
    scan: &ScanParams,
    templates_png: Vec<String>,
) {
    let (crop, roi_offset) = crop_roi(&frame.image, &scan.roi);
    let image_png = match encode_image(&crop) {
        Ok(png) => png,
        Err(e) => {
            warn!("Frame encode failed: {}", e);
            return;
        }
    };

    let payload = MatchPayload {
        image_png,
        templates_png,
        threshold: scan.threshold,
        grayscale: scan.grayscale,
        roi_offset,
        click_offset: scan.click_offset,
    };

    let tx = results_tx.clone();
    pool.submit_match(payload, move |outcome| {
        // Unbounded send never blocks; a closed channel means shutdown
        let _ = tx.send(outcome);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    fn frame_image() -> RgbaImage {
        RgbaImage::from_fn(100, 80, |x, y| Rgba([x as u8, y as u8, 0, 255]))
    }

    #[test]
    fn test_crop_full_by_default() {
        let img = frame_image();
        let (crop, offset) = crop_roi(&img, &RoiConfig::full());
        assert_eq!(crop.dimensions(), (100, 80));
        assert_eq!(offset, (0, 0));
    }

    #[test]
    fn test_crop_edges_form() {
        let img = frame_image();
        let roi = RoiConfig {
            left: Some(10),
            top: Some(20),
            right: Some(60),
            bottom: Some(50),
            ..RoiConfig::default()
        };
        let (crop, offset) = crop_roi(&img, &roi);
        assert_eq!(crop.dimensions(), (50, 30));
        assert_eq!(offset, (10, 20));
        // Pixel content comes from the offset region
        assert_eq!(crop.get_pixel(0, 0), img.get_pixel(10, 20));
    }

    #[test]
    fn test_crop_extent_form() {
        let img = frame_image();
        let roi = RoiConfig {
            x: Some(5),
            y: Some(8),
            width: Some(30),
            height: Some(16),
            ..RoiConfig::default()
        };
        let (crop, offset) = crop_roi(&img, &roi);
        assert_eq!(crop.dimensions(), (30, 16));
        assert_eq!(offset, (5, 8));
    }

    #[test]
    fn test_crop_zero_means_full_extent() {
        let img = frame_image();
        let roi = RoiConfig {
            left: Some(40),
            top: Some(0),
            right: Some(0),
            bottom: Some(0),
            ..RoiConfig::default()
        };
        let (crop, offset) = crop_roi(&img, &roi);
        assert_eq!(crop.dimensions(), (60, 80));
        assert_eq!(offset, (40, 0));
    }

    #[test]
    fn test_crop_clamps_wild_values() {
        let img = frame_image();
        let cases = [
            RoiConfig {
                left: Some(-50),
                top: Some(-10),
                right: Some(5000),
                bottom: Some(9000),
                ..RoiConfig::default()
            },
            RoiConfig {
                x: Some(99),
                y: Some(79),
                width: Some(500),
                height: Some(500),
                ..RoiConfig::default()
            },
            RoiConfig {
                left: Some(90),
                right: Some(10), // inverted
                ..RoiConfig::default()
            },
            RoiConfig {
                x: Some(i32::MAX),
                y: Some(1),
                width: Some(i32::MAX),
                height: Some(i32::MAX),
                ..RoiConfig::default()
            },
        ];

        for roi in cases {
            let (crop, (ox, oy)) = crop_roi(&img, &roi);
            let (cw, ch) = crop.dimensions();
            assert!(cw >= 1 && ch >= 1);
            assert!(ox >= 0 && oy >= 0);
            assert!(ox as u32 + cw <= img.width());
            assert!(oy as u32 + ch <= img.height());
        }
    }

    #[test]
    fn test_throttle_budget() {
        let interval = Duration::from_millis(33);
        assert_eq!(
            throttle_budget(interval, Duration::from_millis(10)),
            Duration::from_millis(23)
        );
        // Budget exhausted: minimal yield, never zero
        assert_eq!(throttle_budget(interval, Duration::from_millis(33)), MIN_YIELD);
        assert_eq!(throttle_budget(interval, Duration::from_millis(500)), MIN_YIELD);
    }

    #[test]
    fn test_load_templates_glob_and_directory() {
        let dir = tempfile::tempdir().unwrap();
        let img = RgbaImage::from_pixel(4, 4, Rgba([1, 2, 3, 255]));
        img.save(dir.path().join("a.png")).unwrap();
        img.save(dir.path().join("b.png")).unwrap();

        // Glob pattern
        let cfg = TemplatesConfig {
            paths: vec![format!("{}/*.png", dir.path().display())],
            click_offset: [0, 0],
        };
        assert_eq!(load_templates(&cfg).unwrap().len(), 2);

        // Directory entry
        let cfg = TemplatesConfig {
            paths: vec![dir.path().display().to_string()],
            click_offset: [0, 0],
        };
        assert_eq!(load_templates(&cfg).unwrap().len(), 2);
    }

    #[test]
    fn test_load_templates_missing_entry_is_not_fatal() {
        let cfg = TemplatesConfig {
            paths: vec!["/definitely/not/here/*.png".to_string()],
            click_offset: [0, 0],
        };
        assert_eq!(load_templates(&cfg).unwrap().len(), 0);
    }

    fn test_stage() -> (
        RecognitionStage,
        Arc<FreshestFrameQueue<Frame>>,
        WorkerPool,
    ) {
        let queue = Arc::new(FreshestFrameQueue::default());
        let pool = WorkerPool::new(
            2,
            Duration::from_millis(5),
            Duration::from_secs(30),
            Duration::from_secs(5),
        )
        .with_worker_binary(std::path::PathBuf::from("/nonexistent/match-worker"));
        let adaptive = Arc::new(Mutex::new(AdaptiveInterval::new(Duration::from_millis(5))));
        let (tx, _rx) = mpsc::unbounded_channel();
        let stage = RecognitionStage::new(Arc::clone(&queue), pool.clone(), adaptive, tx);
        (stage, queue, pool)
    }

    #[tokio::test]
    async fn test_loop_idle_without_templates() {
        let (mut stage, queue, pool) = test_stage();
        queue.put(Frame::new(frame_image()));

        stage.start();
        tokio::time::sleep(Duration::from_millis(30)).await;
        stage.stop();

        // No templates, no submissions, frame left for a later consumer
        assert_eq!(pool.active_tasks(), 0);
        assert!(queue.get_latest().is_some());
    }

    #[tokio::test]
    async fn test_loop_submits_frames() {
        let (mut stage, queue, pool) = test_stage();

        let dir = tempfile::tempdir().unwrap();
        let tpl = RgbaImage::from_pixel(4, 4, Rgba([255, 255, 255, 255]));
        tpl.save(dir.path().join("t.png")).unwrap();
        let cfg = TemplatesConfig {
            paths: vec![format!("{}/*.png", dir.path().display())],
            click_offset: [0, 0],
        };
        assert_eq!(stage.reload_templates(&cfg).unwrap(), 1);

        queue.put(Frame::new(frame_image()));
        stage.start();
        tokio::time::sleep(Duration::from_millis(40)).await;
        stage.stop();

        // Dispatch against the nonexistent worker binary fails, so the
        // submission is observable in the queue and registry.
        assert!(pool.active_tasks() >= 1);
        // The frame was consumed by the loop
        assert!(queue.get_latest().is_none());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (mut stage, _queue, _pool) = test_stage();
        stage.start();
        assert!(stage.is_running());
        stage.stop();
        stage.stop();
        assert!(!stage.is_running());
    }
}
