//! GPS acquisition with accuracy refinement.
//!
//! Subscribes to the device watch, takes the first fix of each subscription,
//! and keeps refining until a fix is accurate enough, enough fixes have been
//! seen, or the overall budget runs out. Every subscription is cleared before
//! the next is opened, so at most one watch is live at any time.

use super::geolocation::{Geolocation, WatchGuard, WatchOptions};
use super::types::{Fix, GeoErrorCode, LocationError};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, sleep_until, timeout, Instant};

/// Thresholds for the refinement loop.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionPolicy {
    /// A fix at or below this radius is accepted immediately.
    pub accuracy_threshold_m: f64,
    /// Accept the best fix seen once this many have arrived.
    pub max_fixes: usize,
    /// Whole acquisition, across resubscriptions.
    pub overall_budget: Duration,
    /// Wait for a single fix before the watch is considered failed.
    pub per_fix_timeout: Duration,
    /// Pause between one subscription and the next.
    pub resubscribe_pause: Duration,
    pub high_accuracy: bool,
}

impl Default for AcquisitionPolicy {
    fn default() -> Self {
        Self {
            accuracy_threshold_m: 50.0,
            max_fixes: 3,
            overall_budget: Duration::from_secs(30),
            per_fix_timeout: Duration::from_secs(15),
            resubscribe_pause: Duration::from_secs(2),
            high_accuracy: true,
        }
    }
}

impl AcquisitionPolicy {
    pub fn watch_options(&self) -> WatchOptions {
        WatchOptions {
            high_accuracy: self.high_accuracy,
            maximum_age: Duration::ZERO,
            timeout: self.per_fix_timeout,
        }
    }
}

// ─── Fix selection ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    Accept(Fix),
    Continue,
}

/// Tracks the most accurate fix seen and decides when to stop.
#[derive(Debug, Clone)]
pub struct FixAccumulator {
    threshold_m: f64,
    max_fixes: usize,
    best: Option<Fix>,
    received: usize,
}

impl FixAccumulator {
    pub fn new(threshold_m: f64, max_fixes: usize) -> Self {
        Self {
            threshold_m,
            max_fixes: max_fixes.max(1),
            best: None,
            received: 0,
        }
    }

    pub fn from_policy(policy: &AcquisitionPolicy) -> Self {
        Self::new(policy.accuracy_threshold_m, policy.max_fixes)
    }

    pub fn offer(&mut self, fix: Fix) -> Verdict {
        // A negative or non-finite radius is worse than any real one.
        let fix = if fix.accuracy.is_finite() && fix.accuracy >= 0.0 {
            fix
        } else {
            Fix { accuracy: f64::INFINITY, ..fix }
        };
        self.received += 1;

        let best = match self.best {
            Some(best) if best.accuracy <= fix.accuracy => best,
            _ => fix,
        };
        self.best = Some(best);

        if best.accuracy <= self.threshold_m || self.received >= self.max_fixes {
            Verdict::Accept(best)
        } else {
            Verdict::Continue
        }
    }

    pub fn best(&self) -> Option<Fix> {
        self.best
    }

    pub fn received(&self) -> usize {
        self.received
    }
}

// ─── Acquisition loop ───────────────────────────────────────────

/// Acquire one fix. A watch error, a per-fix timeout or a hung-up source fails
/// the whole acquisition; only expiry of the overall budget falls back to the
/// best fix seen so far.
pub async fn acquire_fix(geo: Arc<dyn Geolocation>, policy: &AcquisitionPolicy) -> Result<Fix, LocationError> {
    let deadline = Instant::now() + policy.overall_budget;
    let options = policy.watch_options();
    let mut fixes = FixAccumulator::from_policy(policy);

    loop {
        let mut watch = WatchGuard::start(Arc::clone(&geo), &options);
        let event = tokio::select! {
            biased;
            event = timeout(policy.per_fix_timeout, watch.next()) => Some(event),
            _ = sleep_until(deadline) => None,
        };
        watch.clear();

        let fix = match event {
            None => return budget_expired(&fixes),
            Some(Ok(Some(Ok(fix)))) => fix,
            Some(Ok(Some(Err(code)))) => {
                tracing::warn!(%code, "position watch failed");
                return Err(code.into());
            }
            Some(Ok(None)) => return Err(GeoErrorCode::PositionUnavailable.into()),
            Some(Err(_)) => {
                tracing::warn!(timeout = ?policy.per_fix_timeout, "no fix within per-fix timeout");
                return Err(GeoErrorCode::Timeout.into());
            }
        };

        match fixes.offer(fix) {
            Verdict::Accept(best) => {
                tracing::info!(accuracy = best.accuracy, fixes = fixes.received(), "GPS fix accepted");
                return Ok(best);
            }
            Verdict::Continue => {
                tracing::debug!(accuracy = fix.accuracy, fixes = fixes.received(), "fix too coarse, refining");
            }
        }

        tokio::select! {
            biased;
            _ = sleep_until(deadline) => return budget_expired(&fixes),
            _ = sleep(policy.resubscribe_pause) => {}
        }
    }
}

fn budget_expired(fixes: &FixAccumulator) -> Result<Fix, LocationError> {
    match fixes.best() {
        Some(best) => {
            tracing::info!(accuracy = best.accuracy, fixes = fixes.received(), "GPS budget spent, using best fix");
            Ok(best)
        }
        None => Err(GeoErrorCode::Timeout.into()),
    }
}
