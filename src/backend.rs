//! Concrete capture backend built on `xcap`.
//!
//! Covers both capture modes: whole monitors by index and single windows
//! resolved by handle, title fragment or process-name fragment. Title and
//! process matching is case-insensitive substring matching.

use crate::capture::{BackendStats, CaptureBackend, WindowTarget};
use crate::config::normalize_fragment;
use crate::types::{Frame, WindowId};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};
use xcap::{Monitor, Window};

/// How long a captured frame stays valid for `shared_frame` consumers
const SHARED_FRAME_TTL: Duration = Duration::from_millis(8);

enum Session {
    None,
    Monitor(Monitor),
    Window(Window),
}

/// Screen/window capture via the `xcap` crate
pub struct XcapBackend {
    session: Session,
    monitor_index: Option<usize>,
    frames_captured: u64,
    /// Most recent frame, served to shared-frame lookups within the TTL
    last_frame: Option<Frame>,
}

impl XcapBackend {
    pub fn new() -> Self {
        Self {
            session: Session::None,
            monitor_index: None,
            frames_captured: 0,
            last_frame: None,
        }
    }

    fn find_window(target: &WindowTarget, partial: bool) -> Option<Window> {
        let windows = match Window::all() {
            Ok(w) => w,
            Err(e) => {
                warn!("Window enumeration failed: {}", e);
                return None;
            }
        };

        windows.into_iter().find(|w| match target {
            WindowTarget::Hwnd(hwnd) => w.id() == *hwnd,
            WindowTarget::Title(fragment) => {
                let needle = normalize_fragment(fragment);
                let title = normalize_fragment(&w.title());
                if partial {
                    !needle.is_empty() && title.contains(&needle)
                } else {
                    title == needle
                }
            }
            WindowTarget::Process(fragment) => {
                let needle = normalize_fragment(fragment);
                let name = normalize_fragment(&w.app_name());
                if partial {
                    !needle.is_empty() && name.contains(&needle)
                } else {
                    name == needle
                }
            }
        })
    }
}

impl Default for XcapBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CaptureBackend for XcapBackend {
    fn configure(
        &mut self,
        fps: u32,
        include_cursor: bool,
        border_required: bool,
        restore_minimized: bool,
    ) {
        // xcap snapshots per call; fps pacing lives in the capture stage and
        // the remaining flags have no equivalent here.
        debug!(
            "Backend configured: fps={} cursor={} border={} restore={}",
            fps, include_cursor, border_required, restore_minimized
        );
    }

    async fn open_monitor(&mut self, index: usize) -> bool {
        let monitors = match Monitor::all() {
            Ok(m) => m,
            Err(e) => {
                warn!("Monitor enumeration failed: {}", e);
                return false;
            }
        };

        match monitors.into_iter().nth(index) {
            Some(monitor) => {
                self.session = Session::Monitor(monitor);
                self.monitor_index = Some(index);
                self.frames_captured = 0;
                true
            }
            None => {
                warn!("Monitor index {} out of range", index);
                false
            }
        }
    }

    async fn open_window(&mut self, target: WindowTarget, partial: bool) -> bool {
        match Self::find_window(&target, partial) {
            Some(window) => {
                debug!("Resolved window {:?} to id {}", target, window.id());
                self.session = Session::Window(window);
                self.monitor_index = None;
                self.frames_captured = 0;
                true
            }
            None => false,
        }
    }

    fn capture_frame(&mut self, _restore_after_capture: bool) -> Option<Frame> {
        let image = match &self.session {
            Session::None => return None,
            Session::Monitor(monitor) => monitor.capture_image().ok()?,
            Session::Window(window) => window.capture_image().ok()?,
        };

        self.frames_captured += 1;
        let frame = Frame::new(image);
        self.last_frame = Some(frame.clone());
        Some(frame)
    }

    fn shared_frame(&mut self, _tag: &str, _purpose: &str) -> Option<Frame> {
        match &self.last_frame {
            Some(frame) if frame.age() <= SHARED_FRAME_TTL => Some(frame.clone()),
            _ => None,
        }
    }

    fn stats(&self) -> BackendStats {
        let target_hwnd: Option<WindowId> = match &self.session {
            Session::Window(window) => Some(window.id()),
            _ => None,
        };

        BackendStats {
            target_hwnd,
            target_monitor: self.monitor_index,
            frames_captured: self.frames_captured,
        }
    }

    fn close(&mut self) {
        self.session = Session::None;
        self.monitor_index = None;
        self.last_frame = None;
    }
}
