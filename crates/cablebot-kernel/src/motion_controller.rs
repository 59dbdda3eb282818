//! [`MotionController`] – mode/fault state machine and motion gate.
//!
//! Every motor command in the system passes through
//! [`MotionController::request_motion`], which evaluates, in this order and
//! stopping at the first failure:
//!
//! 1. **Fault latch** – a latched fault refuses everything with
//!    [`SafetyRejection::Faulted`].
//! 2. **Freshness** – the newest bundle on the feed must exist and be younger
//!    than the staleness threshold (a bundle exactly that old is stale), otherwise the controller latches
//!    [`FaultCause::StaleData`] and stops all motors.
//! 3. **Hall floor** – every winch must read at or above `min_hall`,
//!    otherwise [`FaultCause::HallThresholdViolation`] is latched.
//! 4. **Mode** – jogs and hall runs need `Setup`, directional moves need
//!    `Test`.  A mismatch is refused without touching the fault latch.
//! 5. **Drive** – the command is forwarded to the driver layer.  A bus error
//!    is returned to the caller and the motors are stopped on a best-effort
//!    basis, but no fault is latched.
//!
//! Sensed-state checks come before the mode check so that telemetry
//! problems always surface as faults, whatever the operator asked for.
//!
//! The controller never performs telemetry I/O.  It reads one `Arc`
//! snapshot per evaluation from the link's `watch` feed, so a concurrent
//! poll can never mix readings from two bundles.

use std::sync::Arc;

use cablebot_hal::DriverLayer;
use cablebot_types::{
    ControlError, ControllerStatus, DriverError, FaultCause, HallRunProfile, MAX_WINCHES, Mode,
    MotionCommand, MotionRequest, MotorAction, SafetyRejection, SafetyThresholds, SensorBundle,
    Spin,
};
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::safety::SafetyMonitor;

/// Receiving side of the telemetry link's bundle feed.
pub type BundleFeed = watch::Receiver<Option<Arc<SensorBundle>>>;

/// How winch speeds are chosen for a motion.
#[derive(Debug, Clone, Copy)]
enum Speed {
    Fixed(u16),
    /// Per winch, from its hall reading.
    HallScaled,
}

struct ActiveMotion {
    request_id: Uuid,
    label: String,
    /// Soft-stop time for timed motions.
    deadline: Option<Instant>,
    /// Set for hall runs, whose speeds are re-derived on every tick.
    hall_pattern: Option<[Spin; MAX_WINCHES]>,
}

pub struct MotionController {
    driver: DriverLayer,
    feed: BundleFeed,
    monitor: SafetyMonitor,
    hall_floor: u16,
    hall_profile: HallRunProfile,
    mode: Mode,
    fault: Option<FaultCause>,
    fault_since: Option<DateTime<Utc>>,
    active: Option<ActiveMotion>,
    last_driver_error: Option<String>,
    status: watch::Sender<ControllerStatus>,
}

impl MotionController {
    /// Build a controller with the standard freshness and hall-floor checks
    /// for every winch the driver layer knows.
    pub fn new(driver: DriverLayer, feed: BundleFeed, thresholds: SafetyThresholds) -> Self {
        let winch_ids: Vec<u8> = driver.winch_ids().collect();
        if winch_ids.len() > MAX_WINCHES {
            error!(
                winches = winch_ids.len(),
                max = MAX_WINCHES,
                "more winches than motion patterns cover; every motion will be refused"
            );
        }
        let monitor = SafetyMonitor::standard(thresholds, &winch_ids);
        let controller = Self {
            driver,
            feed,
            monitor,
            hall_floor: thresholds.min_hall,
            hall_profile: HallRunProfile::default(),
            mode: Mode::Idle,
            fault: None,
            fault_since: None,
            active: None,
            last_driver_error: None,
            status: watch::Sender::new(ControllerStatus::default()),
        };
        controller.status.send_replace(controller.status());
        controller
    }

    /// Speed mapping used by hall runs.
    pub fn with_hall_profile(mut self, profile: HallRunProfile) -> Self {
        self.hall_profile = profile;
        self
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn fault(&self) -> Option<FaultCause> {
        self.fault
    }

    /// Label of the motion currently commanded, if any.
    pub fn active_motion(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.label.as_str())
    }

    /// Current status, with the bundle age computed now.
    pub fn status(&self) -> ControllerStatus {
        let snapshot = self.feed.borrow().clone();
        ControllerStatus {
            mode: self.mode,
            fault: self.fault,
            fault_since: self.fault_since,
            last_bundle_age_ms: snapshot.as_ref().map(|b| b.age().as_millis() as u64),
            hall: snapshot
                .map(|b| b.hall_values().collect::<Vec<u16>>())
                .unwrap_or_default(),
            motion: self.active.as_ref().map(|a| a.label.clone()),
            last_driver_error: self.last_driver_error.clone(),
        }
    }

    /// Pushed on every state change.  The bundle age in a pushed snapshot is
    /// as of the push; call [`status`](Self::status) for a current value.
    pub fn subscribe_status(&self) -> watch::Receiver<ControllerStatus> {
        self.status.subscribe()
    }

    // ────────────────────────────────────────────────────────────────────
    // Operations
    // ────────────────────────────────────────────────────────────────────

    /// Change mode.  Motors are stopped before the new mode takes effect.
    ///
    /// Entering `Fault` always succeeds.  Leaving a latched fault requires
    /// [`clear_fault`](Self::clear_fault) first.
    pub async fn request_mode(&mut self, mode: Mode) -> Result<(), ControlError> {
        if mode == Mode::Fault {
            let _ = self.latch_fault(FaultCause::ManualTrigger).await;
            return Ok(());
        }
        if let Some(cause) = self.fault {
            info!(requested = %mode, %cause, "mode change refused while faulted");
            return Err(SafetyRejection::StillFaulted(cause).into());
        }

        // A failed stop is logged but does not block the mode change.
        let _ = self.stop_motors().await;
        let from = self.mode;
        self.mode = mode;
        info!(%from, to = %mode, "mode changed");
        self.publish();
        Ok(())
    }

    /// Clear the fault latch and return to `Idle`.  Sensor state is not
    /// re-checked here; the next motion request evaluates fresh data.
    pub async fn clear_fault(&mut self) -> Result<(), ControlError> {
        let Some(cause) = self.fault else {
            return Err(SafetyRejection::NotFaulted.into());
        };
        let _ = self.stop_motors().await;
        self.fault = None;
        self.fault_since = None;
        self.mode = Mode::Idle;
        info!(%cause, "fault cleared by operator");
        self.publish();
        Ok(())
    }

    /// Evaluate and, if every check passes, execute `request`.
    ///
    /// Stop and mode-change requests are routed to [`stop`](Self::stop),
    /// [`emergency_stop`](Self::emergency_stop) and
    /// [`request_mode`](Self::request_mode); they are never gated.
    pub async fn request_motion(&mut self, request: &MotionRequest) -> Result<(), ControlError> {
        let (required, pattern, speed, duration) = match request.command {
            MotionCommand::Stop => return self.stop().await,
            MotionCommand::StopAll => return self.emergency_stop().await,
            MotionCommand::SetMode(mode) => return self.request_mode(mode).await,
            MotionCommand::Jog(p) => (
                Mode::Setup,
                p.direction.pattern(),
                Speed::Fixed(p.rpm),
                p.duration,
            ),
            MotionCommand::HallRun(p) => (
                Mode::Setup,
                p.direction.pattern(),
                Speed::HallScaled,
                p.duration,
            ),
            MotionCommand::TestMove(p) => (
                Mode::Test,
                p.direction.pattern(),
                Speed::Fixed(p.rpm),
                p.duration,
            ),
        };
        let label = request.command.label();

        if let Some(cause) = self.fault {
            info!(id = %request.id, source = %request.source, motion = %label, %cause, "motion refused: faulted");
            return Err(SafetyRejection::Faulted(cause).into());
        }

        let snapshot = self.feed.borrow().clone();
        if let Err(violation) = self
            .monitor
            .evaluate(snapshot.as_deref(), std::time::Instant::now())
        {
            warn!(
                id = %request.id,
                source = %request.source,
                motion = %label,
                rejection = %violation.rejection,
                "motion refused by safety gate"
            );
            let _ = self.latch_fault(violation.cause).await;
            return Err(violation.rejection.into());
        }

        if self.mode != required {
            info!(id = %request.id, motion = %label, mode = %self.mode, "motion refused: wrong mode");
            return Err(SafetyRejection::ModeMismatch {
                action: label,
                current: self.mode,
            }
            .into());
        }

        let winches = self.driver.winch_count();
        if winches > MAX_WINCHES {
            let e = DriverError::InvalidTarget(format!(
                "motion patterns cover {MAX_WINCHES} winches, rig has {winches}"
            ));
            warn!(id = %request.id, motion = %label, error = %e, "motion refused");
            return Err(e.into());
        }

        let runs = self.plan_runs(&pattern, speed, snapshot.as_deref());
        if let Err(e) = self.driver.drive_each(&runs).await {
            error!(id = %request.id, motion = %label, error = %e, "drive failed; stopping winches");
            self.last_driver_error = Some(e.to_string());
            let _ = self.stop_motors().await;
            self.publish();
            return Err(e.into());
        }

        info!(
            id = %request.id,
            source = %request.source,
            motion = %label,
            rpm = ?runs.iter().map(|&(_, rpm)| rpm).collect::<Vec<u16>>(),
            duration_ms = duration.map(|d| d.as_millis() as u64),
            "motion started"
        );
        self.active = Some(ActiveMotion {
            request_id: request.id,
            label,
            deadline: duration.map(|d| Instant::now() + d),
            hall_pattern: matches!(speed, Speed::HallScaled).then_some(pattern),
        });
        self.publish();
        Ok(())
    }

    /// Soft stop: every motor is stopped, mode and fault are unchanged.
    pub async fn stop(&mut self) -> Result<(), ControlError> {
        let result = self.stop_motors().await;
        info!("soft stop");
        self.publish();
        result.map_err(Into::into)
    }

    /// Emergency stop: every motor is stopped and the fault latch is set
    /// with [`FaultCause::ManualTrigger`].  The fault is latched even when
    /// the stop itself fails; the bus error is still returned.
    pub async fn emergency_stop(&mut self) -> Result<(), ControlError> {
        warn!("emergency stop requested");
        self.latch_fault(FaultCause::ManualTrigger)
            .await
            .map_err(Into::into)
    }

    /// Per-tick supervision of the active motion.
    ///
    /// Re-checks freshness and hall safety on the current snapshot while
    /// motors run, latching a fault on any violation.  A timed motion is
    /// soft-stopped once its duration has elapsed, and a hall run has its
    /// speeds updated from the snapshot.
    pub async fn supervise(&mut self) {
        let (id, label, deadline, hall_pattern) = match &self.active {
            Some(a) => (a.request_id, a.label.clone(), a.deadline, a.hall_pattern),
            None => {
                self.publish();
                return;
            }
        };

        let snapshot = self.feed.borrow().clone();
        if let Err(violation) = self
            .monitor
            .evaluate(snapshot.as_deref(), std::time::Instant::now())
        {
            warn!(%id, motion = %label, cause = %violation.cause, "safety violation during motion");
            let _ = self.latch_fault(violation.cause).await;
            return;
        }

        if deadline.is_some_and(|d| Instant::now() >= d) {
            info!(%id, motion = %label, "timed motion complete");
            let _ = self.stop_motors().await;
        } else if let Some(pattern) = hall_pattern
            && let Err(e) = self.follow_hall(&pattern, snapshot.as_deref()).await
        {
            error!(%id, motion = %label, error = %e, "hall run update failed; stopping winches");
            self.last_driver_error = Some(e.to_string());
            let _ = self.stop_motors().await;
        }
        self.publish();
    }

    /// The telemetry link reported a failed exchange.  Fatal while motors
    /// are running; otherwise the next motion request's freshness check
    /// decides.
    pub async fn report_comm_failure(&mut self, detail: &str) {
        if self.active.is_some() && self.fault.is_none() {
            error!(detail, "telemetry link failed during motion");
            let _ = self.latch_fault(FaultCause::CommFailure).await;
        } else {
            debug!(detail, "telemetry link failure with motors idle");
        }
    }

    // ────────────────────────────────────────────────────────────────────
    // Internals
    // ────────────────────────────────────────────────────────────────────

    /// One run per winch, in winch order.  Rigs with fewer than four
    /// winches use the leading pattern entries.
    fn plan_runs(&self, pattern: &[Spin], speed: Speed, bundle: Option<&SensorBundle>) -> Vec<(Spin, u16)> {
        self.driver
            .winch_ids()
            .zip(pattern)
            .map(|(winch, &spin)| {
                let rpm = match speed {
                    Speed::Fixed(rpm) => rpm,
                    Speed::HallScaled => {
                        let hall = bundle
                            .and_then(|b| b.winches.iter().find(|r| r.winch == winch))
                            .map_or(0, |r| r.hall_raw);
                        self.hall_profile.rpm_for(hall, self.hall_floor)
                    }
                };
                (spin, rpm)
            })
            .collect()
    }

    /// Re-command only the winches whose hall-derived speed changed.
    async fn follow_hall(
        &mut self,
        pattern: &[Spin],
        bundle: Option<&SensorBundle>,
    ) -> Result<(), DriverError> {
        let runs = self.plan_runs(pattern, Speed::HallScaled, bundle);
        let winches: Vec<u8> = self.driver.winch_ids().collect();
        for (winch, (spin, rpm)) in winches.into_iter().zip(runs) {
            let action = MotorAction::Run { spin, rpm };
            if self.driver.last_action(winch) != Some(action) {
                debug!(winch, rpm, "hall run speed update");
                self.driver.command_motor(winch, action).await?;
            }
        }
        Ok(())
    }

    async fn stop_motors(&mut self) -> Result<(), DriverError> {
        self.active = None;
        let result = self.driver.stop_all().await;
        if let Err(ref e) = result {
            error!(error = %e, "stop_all reported a bus error");
            self.last_driver_error = Some(e.to_string());
        }
        result
    }

    /// Stop everything, then latch.  An existing fault keeps its cause.
    async fn latch_fault(&mut self, cause: FaultCause) -> Result<(), DriverError> {
        let result = self.stop_motors().await;
        match self.fault {
            None => {
                self.fault = Some(cause);
                self.fault_since = Some(Utc::now());
                warn!(%cause, "fault latched");
            }
            Some(existing) => debug!(%existing, ignored = %cause, "fault already latched"),
        }
        self.mode = Mode::Fault;
        self.publish();
        result
    }

    fn publish(&self) {
        let next = self.status();
        self.status.send_if_modified(|current| {
            let changed = current.mode != next.mode
                || current.fault != next.fault
                || current.fault_since != next.fault_since
                || current.hall != next.hall
                || current.motion != next.motion
                || current.last_driver_error != next.last_driver_error
                || current.last_bundle_age_ms.is_some() != next.last_bundle_age_ms.is_some();
            if changed {
                *current = next;
            }
            changed
        });
    }
}
