//! Scan orchestrator: lifecycle state machine over the whole pipeline.
//!
//! Composes the capture stage, the recognition stage, the worker pool and
//! the click gate, drains match results in a supervision loop and emits
//! [`ScanEvent`]s toward the shell. Configuration updates arrive as whole
//! snapshots; the capture session is rebuilt only when the target signature
//! actually changed.

use crate::adaptive::AdaptiveInterval;
use crate::capture::{CaptureBackend, CaptureStage};
use crate::click::{ClickDecision, ClickGate, InputInjector};
use crate::config::Config;
use crate::frame_queue::FreshestFrameQueue;
use crate::recognition::{RecognitionStage, ScanParams};
use crate::types::{Frame, MatchResult, ScanError, ScanEvent, ScanState};
use crate::worker_pool::WorkerPool;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// At most one status event per second toward the shell
const STATUS_THROTTLE: Duration = Duration::from_secs(1);

/// How long the supervision loop waits for a result before re-checking state
const SUPERVISION_POLL: Duration = Duration::from_millis(250);

pub struct ScanOrchestrator {
    config: Config,
    state: ScanState,

    capture: CaptureStage,
    recognition: RecognitionStage,
    pool: WorkerPool,

    gate: ClickGate,
    injector: Box<dyn InputInjector>,
    adaptive: Arc<Mutex<AdaptiveInterval>>,

    results_rx: mpsc::UnboundedReceiver<Result<MatchResult, ScanError>>,
    events_tx: mpsc::UnboundedSender<ScanEvent>,

    scan_count: u64,
    last_status: Instant,
}

impl ScanOrchestrator {
    /// Build the pipeline around a capture backend and an input injector.
    /// Returns the orchestrator plus the event stream for the shell.
    pub fn new(
        config: Config,
        backend: Box<dyn CaptureBackend>,
        injector: Box<dyn InputInjector>,
    ) -> (Self, mpsc::UnboundedReceiver<ScanEvent>) {
        let queue = Arc::new(FreshestFrameQueue::<Frame>::default());
        let pool = WorkerPool::new(
            config.workers.max_workers,
            Duration::from_millis(config.workers.poll_interval_ms),
            Duration::from_secs(config.workers.idle_timeout_secs),
            Duration::from_millis(config.workers.task_timeout_ms),
        );
        let adaptive = Arc::new(Mutex::new(AdaptiveInterval::new(Duration::from_millis(
            config.scan.interval_ms,
        ))));

        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let capture = CaptureStage::new(backend, Arc::clone(&queue));
        let recognition = RecognitionStage::new(
            queue,
            pool.clone(),
            Arc::clone(&adaptive),
            results_tx,
        );

        let gate = ClickGate::new(Duration::from_millis(config.scan.cooldown_ms));

        let orchestrator = Self {
            config,
            state: ScanState::Stopped,
            capture,
            recognition,
            pool,
            gate,
            injector,
            adaptive,
            results_rx,
            events_tx,
            scan_count: 0,
            last_status: Instant::now() - STATUS_THROTTLE,
        };

        (orchestrator, events_rx)
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    /// Resolved scan parameters from the current config snapshot
    fn scan_params(&self) -> ScanParams {
        ScanParams {
            threshold: self.config.scan.threshold,
            grayscale: self.config.scan.grayscale,
            roi: self.config.roi,
            click_offset: (
                self.config.templates.click_offset[0],
                self.config.templates.click_offset[1],
            ),
        }
    }

    /// Start the pipeline. A capture-open failure reports "initialization
    /// failed" and returns to STOPPED without entering any loop.
    pub async fn start(&mut self) -> Result<(), ScanError> {
        if self.state != ScanState::Stopped {
            debug!("Start ignored in state {}", self.state.as_str());
            return Ok(());
        }
        self.state = ScanState::Starting;
        self.emit(ScanEvent::Status("starting".to_string()));

        match self.recognition.reload_templates(&self.config.templates) {
            Ok(count) => {
                if count == 0 {
                    warn!("No templates configured, scanning will be idle");
                }
            }
            Err(e) => {
                error!("Template loading failed: {}", e);
                self.emit(ScanEvent::Status("initialization failed".to_string()));
                self.state = ScanState::Stopped;
                return Err(e);
            }
        }

        if let Err(e) = self.capture.start(&self.config.capture).await {
            error!("Capture open failed: {}", e);
            self.emit(ScanEvent::Status("initialization failed".to_string()));
            self.state = ScanState::Stopped;
            return Err(e);
        }

        self.recognition.set_params(self.scan_params());
        self.recognition.start();

        self.gate.reset();
        self.gate
            .set_cooldown(Duration::from_millis(self.config.scan.cooldown_ms));
        {
            let mut adaptive = self.adaptive.lock().unwrap_or_else(|e| e.into_inner());
            adaptive.set_base(Duration::from_millis(self.config.scan.interval_ms));
            adaptive.reset();
        }
        self.scan_count = 0;

        self.state = ScanState::Running;
        self.emit(ScanEvent::Status("running".to_string()));
        info!("Scan pipeline running");
        Ok(())
    }

    /// Stop the pipeline. Idempotent; tasks already at a worker are left to
    /// the timeout sweep.
    pub async fn stop(&mut self) {
        if self.state == ScanState::Stopped {
            return;
        }
        self.state = ScanState::Stopping;

        self.recognition.stop();
        self.capture.stop().await;
        self.pool.cancel_all();
        self.gate.reset();

        self.state = ScanState::Stopped;
        self.emit(ScanEvent::Status("stopped".to_string()));
        info!("Scan pipeline stopped");
    }

    /// Full shutdown: stop the pipeline and terminate the worker pool
    pub async fn shutdown(&mut self) {
        self.stop().await;
        self.pool.stop().await;
    }

    /// Apply a whole new config snapshot while running.
    ///
    /// An unchanged target signature is applied in place; a changed one
    /// rebuilds the capture session (close, then reopen). Templates and scan
    /// parameters are always refreshed.
    pub async fn update_config(&mut self, new: Config) -> Result<(), ScanError> {
        let rebuild = new.capture.signature() != self.config.capture.signature();
        let was = std::mem::replace(&mut self.config, new);

        if self.state == ScanState::Running {
            if rebuild {
                info!(
                    "Capture target changed ({:?} -> {:?}), rebuilding session",
                    was.capture.signature(),
                    self.config.capture.signature()
                );
                self.capture.reopen_target(&self.config.capture).await?;
            } else {
                debug!("Capture target unchanged, reconfiguring in place");
                self.capture.reconfigure(&self.config.capture).await;
            }

            if let Err(e) = self.recognition.reload_templates(&self.config.templates) {
                error!("Template reload failed: {}", e);
                self.emit(ScanEvent::Log(format!("template reload failed: {e}")));
            }
            self.recognition.set_params(self.scan_params());
        }

        self.gate
            .set_cooldown(Duration::from_millis(self.config.scan.cooldown_ms));
        {
            let mut adaptive = self.adaptive.lock().unwrap_or_else(|e| e.into_inner());
            adaptive.set_base(Duration::from_millis(self.config.scan.interval_ms));
        }

        Ok(())
    }

    /// Supervision loop: drain match results until the pipeline leaves the
    /// RUNNING state or the result channel closes.
    pub async fn run(&mut self) {
        while self.state == ScanState::Running {
            match tokio::time::timeout(SUPERVISION_POLL, self.results_rx.recv()).await {
                Ok(Some(outcome)) => self.handle_result(outcome),
                Ok(None) => break,
                Err(_) => {} // periodic state re-check
            }
        }
    }

    /// Route one match result: stats, click gate, events. Errors are logged
    /// and swallowed; they never take the pipeline down.
    pub fn handle_result(&mut self, outcome: Result<MatchResult, ScanError>) {
        let result = match outcome {
            Ok(result) => result,
            Err(e) => {
                debug!("Match task failed: {}", e);
                return;
            }
        };

        self.scan_count += 1;
        {
            let mut adaptive = self.adaptive.lock().unwrap_or_else(|e| e.into_inner());
            adaptive.record(Duration::from_millis(result.execution_time_ms));
        }

        if result.match_found {
            if let (Some(x), Some(y)) = (result.click_x, result.click_y) {
                match self.gate.try_click(self.injector.as_mut(), x, y) {
                    ClickDecision::Clicked => {
                        info!(
                            "Hit: confidence {:.3} clicked at ({}, {}) [{}]",
                            result.confidence, x, y, result.task_id
                        );
                        self.emit(ScanEvent::Hit {
                            confidence: result.confidence,
                            screen_x: x,
                            screen_y: y,
                            timestamp: chrono::Utc::now(),
                        });
                    }
                    ClickDecision::Suppressed => {
                        debug!("Hit within cooldown, suppressed [{}]", result.task_id);
                    }
                    ClickDecision::Failed => {
                        warn!("Click rejected at ({}, {}) [{}]", x, y, result.task_id);
                        self.emit(ScanEvent::Log(format!(
                            "click rejected at ({x}, {y})"
                        )));
                    }
                }
            }
        }

        self.maybe_emit_status(&result);
    }

    /// Status line toward the shell, throttled to one per second
    fn maybe_emit_status(&mut self, result: &MatchResult) {
        if self.last_status.elapsed() < STATUS_THROTTLE {
            return;
        }
        self.last_status = Instant::now();

        let avg_ms = {
            let adaptive = self.adaptive.lock().unwrap_or_else(|e| e.into_inner());
            adaptive.mean_execution_time().as_secs_f64() * 1000.0
        };
        self.emit(ScanEvent::Status(format!(
            "match: {:.3} | avg: {:.1}ms | scans: {}",
            result.confidence, avg_ms, self.scan_count
        )));
    }

    fn emit(&self, event: ScanEvent) {
        // A gone shell just means nobody is listening
        let _ = self.events_tx.send(event);
    }
}
