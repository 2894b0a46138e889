//! Input injection seam and click throttling.
//!
//! A confident match only becomes a click when the gate allows it. The gate
//! advances its cooldown window solely on a click the primitive *reported*
//! as successful; a rejected click leaves the window open so the match may
//! retry.

use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Input-injection primitive: synthesize one click at screen coordinates.
/// Returns whether the primitive reported success.
pub trait InputInjector: Send {
    fn click(&mut self, x: i32, y: i32) -> bool;
}

/// Injector that only logs; stands in where no platform primitive is wired
pub struct LogInjector;

impl InputInjector for LogInjector {
    fn click(&mut self, x: i32, y: i32) -> bool {
        info!("Click (log-only) at ({}, {})", x, y);
        true
    }
}

/// Decision produced by the gate for one confident match
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClickDecision {
    /// Click fired and the primitive reported success
    Clicked,
    /// Within the cooldown window; counted, not clicked
    Suppressed,
    /// The primitive reported failure; cooldown not advanced
    Failed,
}

/// Click-throttling state machine.
///
/// Mutated only by the match-result handler. Lives for the orchestrator
/// lifetime; reset only on explicit stop/start.
pub struct ClickGate {
    cooldown: Duration,
    next_allowed: Instant,
    consecutive_hits: u64,
    suppressed: u64,
}

impl ClickGate {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            next_allowed: Instant::now(),
            consecutive_hits: 0,
            suppressed: 0,
        }
    }

    /// Accepted clicks so far
    pub fn consecutive_hits(&self) -> u64 {
        self.consecutive_hits
    }

    /// Matches suppressed by the cooldown (diagnostics)
    pub fn suppressed(&self) -> u64 {
        self.suppressed
    }

    /// Update the cooldown without touching the current window
    pub fn set_cooldown(&mut self, cooldown: Duration) {
        self.cooldown = cooldown;
    }

    /// Reset counters and reopen the gate (explicit stop/start only)
    pub fn reset(&mut self) {
        self.next_allowed = Instant::now();
        self.consecutive_hits = 0;
        self.suppressed = 0;
    }

    /// Run one confident match through the gate, clicking via `injector`
    /// when permitted.
    pub fn try_click(&mut self, injector: &mut dyn InputInjector, x: i32, y: i32) -> ClickDecision {
        self.try_click_at(injector, x, y, Instant::now())
    }

    /// Gate decision at an explicit `now`, for deterministic tests
    pub fn try_click_at(
        &mut self,
        injector: &mut dyn InputInjector,
        x: i32,
        y: i32,
        now: Instant,
    ) -> ClickDecision {
        if now < self.next_allowed {
            self.suppressed += 1;
            debug!(
                "Click at ({}, {}) suppressed, {:?} of cooldown remaining",
                x,
                y,
                self.next_allowed - now
            );
            return ClickDecision::Suppressed;
        }

        if injector.click(x, y) {
            // Only a reported success advances the window
            self.next_allowed = now + self.cooldown;
            self.consecutive_hits += 1;
            ClickDecision::Clicked
        } else {
            ClickDecision::Failed
        }
    }
}
