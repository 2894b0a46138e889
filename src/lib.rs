//! screen-scanner: capture, match, act.
//!
//! A scheduling pipeline that continuously captures a monitor or window,
//! searches frames for configured image templates in a pool of worker
//! processes, and fires a throttled synthetic click on confident matches.

pub mod adaptive;
pub mod backend;
pub mod capture;
pub mod click;
pub mod config;
pub mod frame_queue;
pub mod matcher;
pub mod orchestrator;
pub mod recognition;
pub mod types;
pub mod worker_pool;

pub use config::Config;
pub use orchestrator::ScanOrchestrator;
pub use types::{Frame, MatchResult, ScanError, ScanEvent, ScanState};
