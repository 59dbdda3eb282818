//! [`SafetyMonitor`] – sensed-state interlock.
//!
//! Before a motion is forwarded to the driver layer, the current telemetry
//! snapshot is passed through [`SafetyMonitor::evaluate`].  A missing
//! snapshot is an immediate violation; otherwise every registered
//! [`SafetyRule`] is evaluated in order and the first violation wins.
//!
//! Two built-in rules are provided:
//! - [`FreshnessRule`] – the bundle must be younger than the staleness
//!   threshold.
//! - [`HallFloorRule`] – every configured winch must report a hall value at
//!   or above the minimum.

use std::time::{Duration, Instant};

use cablebot_types::{FaultCause, SafetyRejection, SafetyThresholds, SensorBundle};

/// A failed check: the fault to latch and the rejection to report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub cause: FaultCause,
    pub rejection: SafetyRejection,
}

impl Violation {
    fn stale() -> Self {
        Self {
            cause: FaultCause::StaleData,
            rejection: SafetyRejection::StaleTelemetry,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Rule trait
// ────────────────────────────────────────────────────────────────────────────

/// A single sensed-state invariant.
pub trait SafetyRule: Send + Sync {
    /// Name used in log output.
    fn name(&self) -> &str;

    fn check(&self, bundle: &SensorBundle, now: Instant) -> Result<(), Violation>;
}

// ────────────────────────────────────────────────────────────────────────────
// SafetyMonitor
// ────────────────────────────────────────────────────────────────────────────

/// # Example
///
/// ```
/// use std::time::Instant;
/// use cablebot_kernel::SafetyMonitor;
/// use cablebot_types::{SafetyThresholds, SensorBundle, WinchReading};
///
/// let monitor = SafetyMonitor::standard(SafetyThresholds::default(), &[1, 2]);
/// let bundle = SensorBundle {
///     seq: 1,
///     captured_at: Instant::now(),
///     winches: vec![
///         WinchReading { winch: 1, hall_raw: 1600, ..Default::default() },
///         WinchReading { winch: 2, hall_raw: 1550, ..Default::default() },
///     ],
///     imu: None,
///     distance: None,
/// };
/// assert!(monitor.evaluate(Some(&bundle), Instant::now()).is_ok());
/// assert!(monitor.evaluate(None, Instant::now()).is_err());
/// ```
#[derive(Default)]
pub struct SafetyMonitor {
    rules: Vec<Box<dyn SafetyRule>>,
}

impl SafetyMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Freshness, then hall floor for `winch_ids`.
    pub fn standard(thresholds: SafetyThresholds, winch_ids: &[u8]) -> Self {
        let mut monitor = Self::new();
        monitor.add_rule(Box::new(FreshnessRule {
            max_age: thresholds.max_age,
        }));
        monitor.add_rule(Box::new(HallFloorRule {
            min_hall: thresholds.min_hall,
            winch_ids: winch_ids.to_vec(),
        }));
        monitor
    }

    /// Rules are evaluated in insertion order.
    pub fn add_rule(&mut self, rule: Box<dyn SafetyRule>) {
        self.rules.push(rule);
    }

    pub fn rule_names(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(|r| r.name())
    }

    pub fn evaluate(&self, bundle: Option<&SensorBundle>, now: Instant) -> Result<(), Violation> {
        let bundle = bundle.ok_or_else(Violation::stale)?;
        for rule in &self.rules {
            rule.check(bundle, now)?;
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Built-in rules
// ────────────────────────────────────────────────────────────────────────────

pub struct FreshnessRule {
    pub max_age: Duration,
}

impl SafetyRule for FreshnessRule {
    fn name(&self) -> &str {
        "freshness"
    }

    fn check(&self, bundle: &SensorBundle, now: Instant) -> Result<(), Violation> {
        // A bundle exactly `max_age` old is already stale.
        if bundle.age_at(now) >= self.max_age {
            return Err(Violation::stale());
        }
        Ok(())
    }
}

/// A winch missing from the bundle counts as a zero reading.
pub struct HallFloorRule {
    pub min_hall: u16,
    pub winch_ids: Vec<u8>,
}

impl SafetyRule for HallFloorRule {
    fn name(&self) -> &str {
        "hall_floor"
    }

    fn check(&self, bundle: &SensorBundle, _now: Instant) -> Result<(), Violation> {
        let unsafe_reading = |winch: u8, value: u16| Violation {
            cause: FaultCause::HallThresholdViolation,
            rejection: SafetyRejection::HallUnsafe {
                winch,
                value,
                min: self.min_hall,
            },
        };

        if let Some(r) = bundle.first_hall_below(self.min_hall) {
            return Err(unsafe_reading(r.winch, r.hall_raw));
        }
        for &winch in &self.winch_ids {
            if !bundle.winches.iter().any(|r| r.winch == winch) {
                return Err(unsafe_reading(winch, 0));
            }
        }
        Ok(())
    }
}
