//! Worker-process pool for template matching.
//!
//! Matching runs in true OS child processes (`match-worker` binary) for real
//! parallelism and fault isolation. The caller side keeps a submission queue
//! of not-yet-dispatched requests, dispatches to idle workers over a
//! JSON-lines stdin/stdout protocol, and drains a shared result channel on a
//! poll timer that runs only while tasks are outstanding.
//!
//! Delivery guarantees: each submitted task id fires its one-shot handler
//! exactly once — on success, on error, or on timeout sweep. Duplicate or
//! late completions find no registration and are dropped with a log line.
//! A crashed worker is invisible at the protocol level; its in-flight task is
//! reclaimed only by the sweep, and the worker slot is respawned lazily on
//! the next dispatch.

use crate::matcher;
use crate::types::{MatchResult, ScanError, TaskId};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Bound on results handled per poll tick, so a burst cannot starve other
/// scheduled work
const MAX_DRAIN_PER_TICK: usize = 10;

/// Grace period for orderly worker shutdown before force-kill
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Request sent to a worker process (one JSON object per line)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkRequest {
    pub task_id: TaskId,
    pub kind: WorkKind,
}

/// Closed set of task kinds a worker can execute.
///
/// The worker switches on the tag; payloads are self-contained structs, so
/// there is no name-based function resolution across the process boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkKind {
    MatchTemplates(MatchPayload),
    /// Orderly shutdown sentinel
    Shutdown,
}

/// Payload for a template-matching task. Immutable once submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchPayload {
    /// Cropped search image, PNG bytes, base64
    pub image_png: String,
    /// Templates, PNG bytes, base64
    pub templates_png: Vec<String>,
    /// Minimum score to report a match
    pub threshold: f32,
    /// Match on luma instead of RGB
    pub grayscale: bool,
    /// Top-left of the crop within the frame
    pub roi_offset: (i32, i32),
    /// Configured pixel offset added to the click point
    pub click_offset: (i32, i32),
}

/// Reply from a worker process (one JSON object per line)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerReply {
    pub task_id: TaskId,
    pub success: bool,
    pub value: Option<MatchResult>,
    pub error: Option<String>,
    pub execution_time_ms: u64,
    pub worker_pid: u32,
}

/// Encode an image as base64 PNG for the wire
pub fn encode_image(image: &RgbaImage) -> Result<String, ScanError> {
    let mut png = Vec::new();
    image
        .write_to(
            &mut std::io::Cursor::new(&mut png),
            image::ImageFormat::Png,
        )
        .map_err(|e| ScanError::WorkerProtocol(format!("png encode: {e}")))?;
    Ok(BASE64.encode(png))
}

/// Decode a base64 PNG wire image
pub fn decode_image(data: &str) -> Result<RgbaImage, ScanError> {
    let png = BASE64
        .decode(data)
        .map_err(|e| ScanError::WorkerProtocol(format!("base64 decode: {e}")))?;
    let img = image::load_from_memory_with_format(&png, image::ImageFormat::Png)
        .map_err(|e| ScanError::WorkerProtocol(format!("png decode: {e}")))?;
    Ok(img.to_rgba8())
}

/// Execute one request. This is the worker-process entry point; it must stay
/// pure computation over the payload.
pub fn execute_request(request: &WorkRequest) -> WorkerReply {
    let started = Instant::now();
    let pid = std::process::id();

    let outcome = match &request.kind {
        WorkKind::MatchTemplates(payload) => run_match(&request.task_id, payload),
        WorkKind::Shutdown => Err("shutdown sentinel is not executable".to_string()),
    };

    let execution_time_ms = started.elapsed().as_millis() as u64;
    match outcome {
        Ok(mut result) => {
            result.execution_time_ms = execution_time_ms;
            result.worker_pid = pid;
            WorkerReply {
                task_id: request.task_id.clone(),
                success: true,
                value: Some(result),
                error: None,
                execution_time_ms,
                worker_pid: pid,
            }
        }
        Err(message) => WorkerReply {
            task_id: request.task_id.clone(),
            success: false,
            value: None,
            error: Some(message),
            execution_time_ms,
            worker_pid: pid,
        },
    }
}

fn run_match(task_id: &str, payload: &MatchPayload) -> Result<MatchResult, String> {
    let image = decode_image(&payload.image_png).map_err(|e| e.to_string())?;
    let templates = payload
        .templates_png
        .iter()
        .map(|t| decode_image(t).map_err(|e| e.to_string()))
        .collect::<Result<Vec<_>, _>>()?;

    let outcome = matcher::match_templates(&image, &templates, payload.grayscale);
    let match_found = outcome.is_match(payload.threshold);

    let (click_x, click_y) = if match_found {
        let point = matcher::click_point(
            payload.roi_offset,
            outcome.location.unwrap_or((0, 0)),
            outcome.template_size.unwrap_or((0, 0)),
            payload.click_offset,
        );
        (Some(point.0), Some(point.1))
    } else {
        (None, None)
    };

    Ok(MatchResult {
        task_id: task_id.to_string(),
        match_found,
        confidence: outcome.score,
        click_x,
        click_y,
        execution_time_ms: 0,
        worker_pid: 0,
    })
}

/// One-shot completion handler for a submitted task
type Completion = Box<dyn FnOnce(Result<MatchResult, ScanError>) + Send + 'static>;

struct Registration {
    submitted_at: Instant,
    on_done: Completion,
}

struct WorkerSlot {
    /// Line sender to the worker's stdin writer task; `None` until spawned
    tx: Option<mpsc::UnboundedSender<String>>,
    /// Child handle kept for shutdown join/kill
    child: Option<Child>,
    /// Task currently dispatched to this worker, if any
    busy: Option<TaskId>,
}

struct PoolState {
    workers: Vec<WorkerSlot>,
    /// Not-yet-dispatched submissions; the only thing `cancel_all` drains
    pending: VecDeque<WorkRequest>,
    registry: HashMap<TaskId, Registration>,
    stopped: bool,
}

struct PoolInner {
    worker_bin: PathBuf,
    idle_timeout: Duration,
    poll_interval: Duration,
    task_timeout: Duration,
    state: Mutex<PoolState>,
    results_tx: mpsc::UnboundedSender<(usize, WorkerReply)>,
    results_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(usize, WorkerReply)>>,
    poll_active: AtomicBool,
}

/// Fixed pool of `match-worker` processes plus the caller-side task/result
/// router. Cheap to clone; all clones share the same pool.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Create a pool of `min(cpu_count, cap)` workers. Workers are spawned
    /// lazily on first dispatch.
    pub fn new(cap: usize, poll_interval: Duration, idle_timeout: Duration, task_timeout: Duration) -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let size = cpus.min(cap.max(1));

        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let workers = (0..size)
            .map(|_| WorkerSlot {
                tx: None,
                child: None,
                busy: None,
            })
            .collect();

        info!("Worker pool created with {} slots", size);

        Self {
            inner: Arc::new(PoolInner {
                worker_bin: default_worker_binary(),
                idle_timeout,
                poll_interval,
                task_timeout,
                state: Mutex::new(PoolState {
                    workers,
                    pending: VecDeque::new(),
                    registry: HashMap::new(),
                    stopped: false,
                }),
                results_tx,
                results_rx: tokio::sync::Mutex::new(results_rx),
                poll_active: AtomicBool::new(false),
            }),
        }
    }

    /// Override the worker binary path (e.g. from config or tests)
    pub fn with_worker_binary(mut self, path: PathBuf) -> Self {
        let inner = Arc::get_mut(&mut self.inner)
            .expect("with_worker_binary must be called before the pool is shared");
        inner.worker_bin = path;
        self
    }

    /// Number of worker slots
    pub fn size(&self) -> usize {
        self.inner.lock_state().workers.len()
    }

    /// Tasks submitted but not yet resolved
    pub fn active_tasks(&self) -> usize {
        self.inner.lock_state().registry.len()
    }

    /// Not-yet-dispatched submissions
    pub fn queued_tasks(&self) -> usize {
        self.inner.lock_state().pending.len()
    }

    /// Submit a match task with a one-shot completion handler.
    ///
    /// Exactly one of success/error reaches `on_done`, exactly once, even if
    /// a worker emits duplicate completions for the same task id. Must be
    /// called from within a tokio runtime.
    pub fn submit_match(
        &self,
        payload: MatchPayload,
        on_done: impl FnOnce(Result<MatchResult, ScanError>) + Send + 'static,
    ) -> TaskId {
        let task_id = format!("match_{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
        let request = WorkRequest {
            task_id: task_id.clone(),
            kind: WorkKind::MatchTemplates(payload),
        };

        {
            let mut state = self.inner.lock_state();
            state.registry.insert(
                task_id.clone(),
                Registration {
                    submitted_at: Instant::now(),
                    on_done: Box::new(on_done),
                },
            );
            state.pending.push_back(request);
            self.inner.dispatch_pending(&mut state);
        }

        debug!(
            "Submitted task {} ({} active, {} queued)",
            task_id,
            self.active_tasks(),
            self.queued_tasks()
        );

        self.ensure_polling();
        task_id
    }

    /// Drop every not-yet-dispatched submission. Tasks already handed to a
    /// worker run to completion (or are swept).
    pub fn cancel_all(&self) {
        let mut state = self.inner.lock_state();
        let dropped = state.pending.len();
        state.pending.clear();
        if dropped > 0 {
            info!("Cancelled {} queued tasks", dropped);
        }
    }

    /// Stop the pool: one shutdown sentinel per worker, a grace period to
    /// join, force-kill for stragglers. Pending and registered tasks are
    /// released with an error.
    pub async fn stop(&self) {
        let (children, orphans) = {
            let mut state = self.inner.lock_state();
            state.stopped = true;
            state.pending.clear();

            let sentinel = serde_json::to_string(&WorkRequest {
                task_id: "shutdown".to_string(),
                kind: WorkKind::Shutdown,
            })
            .expect("sentinel serializes");

            let mut children = Vec::new();
            for slot in state.workers.iter_mut() {
                if let Some(tx) = slot.tx.take() {
                    let _ = tx.send(sentinel.clone());
                }
                if let Some(child) = slot.child.take() {
                    children.push(child);
                }
                slot.busy = None;
            }

            let orphans: Vec<Registration> =
                state.registry.drain().map(|(_, reg)| reg).collect();
            (children, orphans)
        };

        for reg in orphans {
            (reg.on_done)(Err(ScanError::WorkerProtocol("pool stopped".to_string())));
        }

        for mut child in children {
            match tokio::time::timeout(STOP_GRACE, child.wait()).await {
                Ok(Ok(status)) => debug!("Worker exited: {}", status),
                Ok(Err(e)) => warn!("Worker wait failed: {}", e),
                Err(_) => {
                    warn!("Worker did not exit within grace period, killing");
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
            }
        }

        info!("Worker pool stopped");
    }

    /// Start the result-poll task if it is not already running. The poller
    /// pauses itself once no task is outstanding.
    fn ensure_polling(&self) {
        if self.inner.poll_active.swap(true, Ordering::SeqCst) {
            return;
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            debug!("Result polling started");
            let mut rx = inner.results_rx.lock().await;
            loop {
                tokio::time::sleep(inner.poll_interval).await;

                let mut drained = 0;
                while drained < MAX_DRAIN_PER_TICK {
                    match rx.try_recv() {
                        Ok((worker_id, reply)) => {
                            inner.handle_reply(worker_id, reply);
                            drained += 1;
                        }
                        Err(_) => break,
                    }
                }

                inner.sweep_timeouts();

                // Pause when idle; if this tick hit the drain bound the
                // channel may still hold results, keep going.
                let idle = {
                    let state = inner.lock_state();
                    state.registry.is_empty() && state.pending.is_empty()
                };
                if idle && drained < MAX_DRAIN_PER_TICK {
                    inner.poll_active.store(false, Ordering::SeqCst);
                    // A submission may have slipped in between the idle check
                    // and the store; re-acquire and keep polling if so.
                    let busy = {
                        let state = inner.lock_state();
                        !(state.registry.is_empty() && state.pending.is_empty())
                    };
                    if busy && !inner.poll_active.swap(true, Ordering::SeqCst) {
                        continue;
                    }
                    debug!("Result polling paused");
                    break;
                }
            }
        });
    }
}

impl PoolInner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Hand queued requests to idle workers. Called with the state lock held;
    /// does no blocking work.
    fn dispatch_pending(&self, state: &mut PoolState) {
        if state.stopped {
            return;
        }

        for id in 0..state.workers.len() {
            if state.pending.is_empty() {
                break;
            }
            if state.workers[id].busy.is_some() {
                continue;
            }

            let request = match state.pending.pop_front() {
                Some(r) => r,
                None => break,
            };
            let line = match serde_json::to_string(&request) {
                Ok(l) => l,
                Err(e) => {
                    // Unserializable payloads are caught by the sweep
                    error!("Failed to serialize task {}: {}", request.task_id, e);
                    continue;
                }
            };

            if !self.send_line(state, id, &line) {
                // Spawn failed; keep the request queued for a later dispatch
                state.pending.push_front(request);
                break;
            }
            state.workers[id].busy = Some(request.task_id.clone());
        }
    }

    /// Send a line to worker `id`, respawning the process if its pipe is
    /// gone (idle exit or crash). Returns false if the respawn failed.
    fn send_line(&self, state: &mut PoolState, id: usize, line: &str) -> bool {
        if let Some(tx) = &state.workers[id].tx {
            if tx.send(line.to_string()).is_ok() {
                return true;
            }
            debug!("Worker {} pipe closed, respawning", id);
        }

        match self.spawn_worker(id) {
            Ok((tx, child)) => {
                let ok = tx.send(line.to_string()).is_ok();
                state.workers[id].tx = Some(tx);
                state.workers[id].child = Some(child);
                ok
            }
            Err(e) => {
                error!("Failed to spawn worker {}: {}", id, e);
                false
            }
        }
    }

    /// Spawn one worker process plus its stdin writer and stdout reader
    /// tasks. Replies flow into the shared result channel tagged with the
    /// worker slot id.
    fn spawn_worker(
        &self,
        id: usize,
    ) -> Result<(mpsc::UnboundedSender<String>, Child), ScanError> {
        let mut child = Command::new(&self.worker_bin)
            .arg("--idle-timeout-secs")
            .arg(self.idle_timeout.as_secs().to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ScanError::WorkerSpawn(format!("{}: {}", self.worker_bin.display(), e))
            })?;

        let pid = child.id().unwrap_or(0);
        info!("Spawned worker {} (pid {})", id, pid);

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ScanError::WorkerSpawn("worker stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ScanError::WorkerSpawn("worker stdout unavailable".to_string()))?;

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if stdin.write_all(b"\n").await.is_err() {
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
        });

        let results_tx = self.results_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match serde_json::from_str::<WorkerReply>(&line) {
                    Ok(reply) => {
                        if results_tx.send((id, reply)).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Worker {} emitted unparseable reply: {}", id, e),
                }
            }
            debug!("Worker {} stdout closed", id);
        });

        Ok((tx, child))
    }

    /// Route one reply: free the worker slot, unregister the one-shot
    /// handler, dispatch queued work. The handler itself fires after the
    /// state lock is released; a late or duplicate completion finds no
    /// registration and is dropped, log-only.
    fn handle_reply(&self, worker_id: usize, reply: WorkerReply) {
        let registration = {
            let mut state = self.lock_state();

            if let Some(slot) = state.workers.get_mut(worker_id) {
                if slot.busy.as_deref() == Some(reply.task_id.as_str()) {
                    slot.busy = None;
                }
            }

            let registration = state.registry.remove(&reply.task_id);
            self.dispatch_pending(&mut state);
            registration
        };

        let Some(reg) = registration else {
            debug!("Dropping late/duplicate completion for task {}", reply.task_id);
            return;
        };

        let outcome = if reply.success {
            match reply.value {
                Some(result) => Ok(result),
                None => Err(ScanError::WorkerProtocol(format!(
                    "task {} succeeded without a value",
                    reply.task_id
                ))),
            }
        } else {
            Err(ScanError::TaskFailed {
                task_id: reply.task_id.clone(),
                message: reply.error.unwrap_or_else(|| "unknown".to_string()),
            })
        };

        (reg.on_done)(outcome);
    }

    /// Discard bookkeeping for tasks that exceeded the timeout horizon. The
    /// handler fires once with a timeout error; a result arriving later is
    /// ignored. Also reclaims worker slots whose in-flight task was swept.
    fn sweep_timeouts(&self) {
        let expired: Vec<(TaskId, Registration)> = {
            let mut state = self.lock_state();
            let horizon = self.task_timeout;

            let ids: Vec<TaskId> = state
                .registry
                .iter()
                .filter(|(_, reg)| reg.submitted_at.elapsed() > horizon)
                .map(|(id, _)| id.clone())
                .collect();

            let mut expired = Vec::with_capacity(ids.len());
            for task_id in ids {
                for slot in state.workers.iter_mut() {
                    if slot.busy.as_deref() == Some(task_id.as_str()) {
                        slot.busy = None;
                    }
                }
                if let Some(reg) = state.registry.remove(&task_id) {
                    expired.push((task_id, reg));
                }
            }

            // A swept task may never have reached a worker; drop its queued
            // request too, or pending grows without bound while spawning
            // fails and stale frames get matched for nobody.
            let PoolState {
                pending, registry, ..
            } = &mut *state;
            pending.retain(|request| registry.contains_key(&request.task_id));

            self.dispatch_pending(&mut state);
            expired
        };

        for (task_id, reg) in expired {
            warn!("Task {} timed out, sweeping", task_id);
            (reg.on_done)(Err(ScanError::TaskTimeout(task_id)));
        }
    }
}

/// Resolve the match-worker binary next to the running executable, falling
/// back to target directories during development.
fn default_worker_binary() -> PathBuf {
    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|p| p.to_path_buf()))
        .unwrap_or_else(|| PathBuf::from("."));

    let candidates = [
        exe_dir.join("match-worker"),
        PathBuf::from("target/release/match-worker"),
        PathBuf::from("target/debug/match-worker"),
    ];

    for path in &candidates {
        if path.exists() {
            return path.clone();
        }
    }

    PathBuf::from("match-worker")
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};
    use std::sync::atomic::AtomicUsize;

    fn test_pool() -> WorkerPool {
        // Nonexistent binary: dispatch fails, tasks stay queued/registered,
        // which is exactly what the routing tests need.
        WorkerPool::new(
            2,
            Duration::from_millis(5),
            Duration::from_secs(30),
            Duration::from_millis(200),
        )
        .with_worker_binary(PathBuf::from("/nonexistent/match-worker"))
    }

    fn small_payload() -> MatchPayload {
        let img = RgbaImage::from_pixel(4, 4, Rgba([10, 20, 30, 255]));
        MatchPayload {
            image_png: encode_image(&img).unwrap(),
            templates_png: vec![encode_image(&img).unwrap()],
            threshold: 0.9,
            grayscale: true,
            roi_offset: (0, 0),
            click_offset: (0, 0),
        }
    }

    fn success_reply(task_id: &str, confidence: f32) -> WorkerReply {
        WorkerReply {
            task_id: task_id.to_string(),
            success: true,
            value: Some(MatchResult {
                task_id: task_id.to_string(),
                match_found: true,
                confidence,
                click_x: Some(10),
                click_y: Some(20),
                execution_time_ms: 3,
                worker_pid: 111,
            }),
            error: None,
            execution_time_ms: 3,
            worker_pid: 111,
        }
    }

    fn error_reply(task_id: &str) -> WorkerReply {
        WorkerReply {
            task_id: task_id.to_string(),
            success: false,
            value: None,
            error: Some("boom".to_string()),
            execution_time_ms: 1,
            worker_pid: 111,
        }
    }

    #[test]
    fn test_image_wire_roundtrip() {
        let img = RgbaImage::from_fn(9, 7, |x, y| Rgba([x as u8, y as u8, 5, 255]));
        let encoded = encode_image(&img).unwrap();
        let decoded = decode_image(&encoded).unwrap();
        assert_eq!(decoded.dimensions(), (9, 7));
        assert_eq!(decoded.get_pixel(3, 4), img.get_pixel(3, 4));
    }

    #[test]
    fn test_execute_request_match() {
        let mut scene = RgbaImage::from_fn(32, 32, |x, y| Rgba([(x * 7) as u8, (y * 3) as u8, 0, 255]));
        for dy in 0..6 {
            for dx in 0..6 {
                scene.put_pixel(10 + dx, 8 + dy, Rgba([255, 255, 255, 255]));
            }
        }
        let tpl = RgbaImage::from_pixel(6, 6, Rgba([255, 255, 255, 255]));

        let request = WorkRequest {
            task_id: "t_exec".to_string(),
            kind: WorkKind::MatchTemplates(MatchPayload {
                image_png: encode_image(&scene).unwrap(),
                templates_png: vec![encode_image(&tpl).unwrap()],
                threshold: 0.8,
                grayscale: true,
                roi_offset: (100, 200),
                click_offset: (1, 2),
            }),
        };

        let reply = execute_request(&request);
        assert!(reply.success);
        let result = reply.value.unwrap();
        assert!(result.match_found);
        // roi offset + location + template center + click offset
        assert_eq!(result.click_x, Some(100 + 10 + 3 + 1));
        assert_eq!(result.click_y, Some(200 + 8 + 3 + 2));
        assert_eq!(result.worker_pid, std::process::id());
    }

    #[test]
    fn test_execute_request_bad_payload_is_error() {
        let request = WorkRequest {
            task_id: "t_bad".to_string(),
            kind: WorkKind::MatchTemplates(MatchPayload {
                image_png: "not base64 at all!!!".to_string(),
                templates_png: vec![],
                threshold: 0.8,
                grayscale: true,
                roi_offset: (0, 0),
                click_offset: (0, 0),
            }),
        };
        let reply = execute_request(&request);
        assert!(!reply.success);
        assert!(reply.error.is_some());
    }

    #[test]
    fn test_work_request_wire_format() {
        let request = WorkRequest {
            task_id: "t1".to_string(),
            kind: WorkKind::Shutdown,
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"shutdown\""));
        let back: WorkRequest = serde_json::from_str(&json).unwrap();
        assert!(matches!(back.kind, WorkKind::Shutdown));
    }

    #[tokio::test]
    async fn test_exactly_once_delivery_mixed_outcomes() {
        let pool = test_pool();
        let successes = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(AtomicUsize::new(0));

        let mut ids = Vec::new();
        for _ in 0..3 {
            let s = Arc::clone(&successes);
            let e = Arc::clone(&errors);
            ids.push(pool.submit_match(small_payload(), move |outcome| match outcome {
                Ok(_) => {
                    s.fetch_add(1, Ordering::SeqCst);
                }
                Err(_) => {
                    e.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        assert_eq!(pool.active_tasks(), 3);

        // Two succeed, one errors
        pool.inner.handle_reply(0, success_reply(&ids[0], 0.95));
        pool.inner.handle_reply(0, success_reply(&ids[1], 0.99));
        pool.inner.handle_reply(1, error_reply(&ids[2]));

        // Duplicate and late completions for already-resolved ids
        pool.inner.handle_reply(0, success_reply(&ids[0], 0.95));
        pool.inner.handle_reply(1, error_reply(&ids[1]));

        assert_eq!(successes.load(Ordering::SeqCst), 2);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(pool.active_tasks(), 0);
    }

    #[tokio::test]
    async fn test_timeout_sweep_fires_error_once() {
        let pool = test_pool();
        let outcomes = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&outcomes);
        let id = pool.submit_match(small_payload(), move |outcome| {
            sink.lock().unwrap().push(outcome.is_err());
        });

        tokio::time::sleep(Duration::from_millis(250)).await;
        pool.inner.sweep_timeouts();
        // Late result for the swept task is ignored
        pool.inner.handle_reply(0, success_reply(&id, 0.99));

        let recorded = outcomes.lock().unwrap();
        assert_eq!(recorded.as_slice(), &[true]);
        assert_eq!(pool.active_tasks(), 0);
    }

    #[tokio::test]
    async fn test_sweep_drops_undispatched_requests() {
        let pool = test_pool();
        let errors = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let e = Arc::clone(&errors);
            pool.submit_match(small_payload(), move |outcome| {
                if outcome.is_err() {
                    e.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
        // Spawn fails against the nonexistent binary, so everything queues
        assert_eq!(pool.queued_tasks(), 5);

        tokio::time::sleep(Duration::from_millis(250)).await;
        pool.inner.sweep_timeouts();

        // The sweep releases the handlers AND the queued requests; nothing
        // is left to pile up or be dispatched to nobody later.
        assert_eq!(errors.load(Ordering::SeqCst), 5);
        assert_eq!(pool.active_tasks(), 0);
        assert_eq!(pool.queued_tasks(), 0);
    }

    #[tokio::test]
    async fn test_cancel_all_drains_only_undispatched() {
        let pool = test_pool();
        for _ in 0..4 {
            pool.submit_match(small_payload(), |_| {});
        }
        // Spawn fails against the nonexistent binary, so everything queues
        assert_eq!(pool.queued_tasks(), 4);

        pool.cancel_all();
        assert_eq!(pool.queued_tasks(), 0);
        // Registrations survive until a reply or the sweep
        assert_eq!(pool.active_tasks(), 4);
    }

    #[tokio::test]
    async fn test_stop_releases_registrations() {
        let pool = test_pool();
        let errors = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let e = Arc::clone(&errors);
            pool.submit_match(small_payload(), move |outcome| {
                if outcome.is_err() {
                    e.fetch_add(1, Ordering::SeqCst);
                }
            });
        }

        pool.stop().await;
        assert_eq!(errors.load(Ordering::SeqCst), 2);
        assert_eq!(pool.active_tasks(), 0);

        // Stop is safe to repeat
        pool.stop().await;
    }

    #[test]
    fn test_pool_size_respects_cap() {
        let pool = WorkerPool::new(
            1,
            Duration::from_millis(16),
            Duration::from_secs(30),
            Duration::from_secs(5),
        );
        assert_eq!(pool.size(), 1);
    }
}
