//! [`ControlLoop`] – the task that owns the motion controller.
//!
//! All operations reach the controller through two bounded queues.  Stop
//! and emergency-stop requests travel on a dedicated priority queue that the
//! loop always drains first, so a stop issued while other requests are still
//! waiting is applied before any of them.  Between requests the loop runs
//! [`MotionController::supervise`] on a fixed tick and reacts to link-health
//! changes pushed by the telemetry poller.
//!
//! When every [`ControllerHandle`] has been dropped the loop stops the
//! motors and exits.

use std::time::Duration;

use cablebot_kernel::MotionController;
use cablebot_link::LinkHealth;
use cablebot_types::{ControlError, ControllerStatus, MotionRequest};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::handle::ControllerHandle;

const PRIORITY_QUEUE_DEPTH: usize = 8;
const QUEUE_DEPTH: usize = 32;

pub(crate) type Reply<T> = oneshot::Sender<T>;

/// A unit of work for the loop.
pub(crate) enum Command {
    Submit {
        request: MotionRequest,
        reply: Reply<Result<(), ControlError>>,
    },
    ClearFault {
        reply: Reply<Result<(), ControlError>>,
    },
    Status {
        reply: Reply<ControllerStatus>,
    },
}

enum Event {
    Command(Command),
    Health(LinkHealth),
    HealthClosed,
    Tick,
    Shutdown,
}

pub struct ControlLoop {
    controller: MotionController,
    priority_rx: mpsc::Receiver<Command>,
    normal_rx: mpsc::Receiver<Command>,
    health_rx: Option<watch::Receiver<LinkHealth>>,
    tick: Duration,
}

impl ControlLoop {
    /// Spawn the loop on the current runtime.
    ///
    /// `health` is the telemetry link's health feed; pass `None` when the
    /// controller runs without a link (tests, dry runs).
    pub fn spawn(
        controller: MotionController,
        health: Option<watch::Receiver<LinkHealth>>,
        tick: Duration,
    ) -> (ControllerHandle, JoinHandle<()>) {
        let (priority_tx, priority_rx) = mpsc::channel(PRIORITY_QUEUE_DEPTH);
        let (normal_tx, normal_rx) = mpsc::channel(QUEUE_DEPTH);
        let status_rx = controller.subscribe_status();

        let control_loop = Self {
            controller,
            priority_rx,
            normal_rx,
            health_rx: health,
            tick,
        };
        let task = tokio::spawn(control_loop.run());
        (
            ControllerHandle::new(priority_tx, normal_tx, status_rx),
            task,
        )
    }

    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(tick_ms = self.tick.as_millis() as u64, "control loop started");

        loop {
            let event = tokio::select! {
                biased;
                cmd = self.priority_rx.recv() => cmd.map_or(Event::Shutdown, Event::Command),
                cmd = self.normal_rx.recv() => cmd.map_or(Event::Shutdown, Event::Command),
                health = next_health(&mut self.health_rx) => {
                    health.map_or(Event::HealthClosed, Event::Health)
                }
                _ = ticker.tick() => Event::Tick,
            };

            match event {
                Event::Command(cmd) => self.handle(cmd).await,
                Event::Health(health) => self.on_health(health).await,
                Event::HealthClosed => {
                    warn!("telemetry health feed closed");
                    self.health_rx = None;
                }
                Event::Tick => self.controller.supervise().await,
                Event::Shutdown => break,
            }
        }

        if let Err(e) = self.controller.stop().await {
            warn!(error = %e, "final stop failed");
        }
        info!("control loop stopped");
    }

    async fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Submit { request, reply } => {
                debug!(id = %request.id, source = %request.source, command = %request.command.label(), "request dequeued");
                let result = self.controller.request_motion(&request).await;
                let _ = reply.send(result);
            }
            Command::ClearFault { reply } => {
                let _ = reply.send(self.controller.clear_fault().await);
            }
            Command::Status { reply } => {
                let _ = reply.send(self.controller.status());
            }
        }
    }

    async fn on_health(&mut self, health: LinkHealth) {
        if health.consecutive_failures == 0 {
            return;
        }
        let detail = health
            .last_error
            .unwrap_or_else(|| "telemetry exchange failed".to_string());
        self.controller.report_comm_failure(&detail).await;
    }
}

/// Next health update, or `None` once the sender is gone.  Pends forever
/// when there is no feed.
async fn next_health(rx: &mut Option<watch::Receiver<LinkHealth>>) -> Option<LinkHealth> {
    match rx {
        Some(rx) => match rx.changed().await {
            Ok(()) => Some(rx.borrow_and_update().clone()),
            Err(_) => None,
        },
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use cablebot_hal::sim::{SimBus, SimBusProbe};
    use cablebot_hal::{DriverLayer, WinchTarget};
    use cablebot_types::{
        FaultCause, JogDirection, JogParams, Mode, MotionCommand, SafetyThresholds, SensorBundle,
        WinchReading,
    };

    struct Rig {
        handle: ControllerHandle,
        task: JoinHandle<()>,
        probe: SimBusProbe,
        feed: watch::Sender<Option<Arc<SensorBundle>>>,
        health: watch::Sender<LinkHealth>,
    }

    fn safe_bundle() -> Arc<SensorBundle> {
        Arc::new(SensorBundle {
            seq: 1,
            captured_at: std::time::Instant::now(),
            winches: (1..=4)
                .map(|winch| WinchReading {
                    winch,
                    hall_raw: 1600,
                    ..Default::default()
                })
                .collect(),
            imu: None,
            distance: None,
        })
    }

    fn rig(tick: Duration) -> Rig {
        let bus = SimBus::new();
        let probe = bus.probe();
        let driver = DriverLayer::new(Box::new(bus), WinchTarget::sequential(&[1, 2, 3, 4]));
        let (feed, feed_rx) = watch::channel(Some(safe_bundle()));
        let (health, health_rx) = watch::channel(LinkHealth::default());
        let controller = MotionController::new(driver, feed_rx, SafetyThresholds::default());
        let (handle, task) = ControlLoop::spawn(controller, Some(health_rx), tick);
        Rig {
            handle,
            task,
            probe,
            feed,
            health,
        }
    }

    fn jog(duration: Option<Duration>) -> JogParams {
        JogParams {
            direction: JogDirection::Forward,
            rpm: 200,
            duration,
        }
    }

    #[tokio::test]
    async fn requests_reach_the_controller() {
        let r = rig(Duration::from_secs(60));
        r.handle.set_mode(Mode::Setup).await.unwrap();
        r.handle.jog(jog(None)).await.unwrap();

        assert!(r.probe.any_running());
        let status = r.handle.get_status().await;
        assert_eq!(status.mode, Mode::Setup);
        assert_eq!(status.motion.as_deref(), Some("jog_forward"));
    }

    #[tokio::test]
    async fn tick_ends_timed_motion() {
        let r = rig(Duration::from_millis(10));
        r.handle.set_mode(Mode::Setup).await.unwrap();
        r.handle.jog(jog(Some(Duration::from_millis(30)))).await.unwrap();
        assert!(r.probe.any_running());

        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(!r.probe.any_running());
        let status = r.handle.get_status().await;
        assert!(status.motion.is_none());
        assert!(!status.is_faulted());
    }

    #[tokio::test]
    async fn tick_catches_hall_drop_during_motion() {
        let r = rig(Duration::from_millis(10));
        r.handle.set_mode(Mode::Setup).await.unwrap();
        r.handle.jog(jog(None)).await.unwrap();

        let mut low = (*safe_bundle()).clone();
        low.winches[2].hall_raw = 1200;
        r.feed.send_replace(Some(Arc::new(low)));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            r.handle.get_status().await.fault,
            Some(FaultCause::HallThresholdViolation)
        );
        assert!(!r.probe.any_running());
    }

    #[tokio::test]
    async fn link_failure_during_motion_faults() {
        let r = rig(Duration::from_secs(60));
        r.handle.set_mode(Mode::Setup).await.unwrap();
        r.handle.jog(jog(None)).await.unwrap();

        r.health.send_replace(LinkHealth {
            connected: false,
            consecutive_failures: 1,
            total_failures: 1,
            last_error: Some("read timed out".into()),
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let status = r.handle.get_status().await;
        assert_eq!(status.fault, Some(FaultCause::CommFailure));
        assert!(!r.probe.any_running());
    }

    #[tokio::test]
    async fn link_failure_while_idle_is_not_a_fault() {
        let r = rig(Duration::from_secs(60));
        r.health.send_replace(LinkHealth {
            connected: false,
            consecutive_failures: 3,
            total_failures: 3,
            last_error: None,
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!r.handle.get_status().await.is_faulted());
    }

    #[tokio::test]
    async fn dropping_every_handle_stops_motors_and_exits() {
        let r = rig(Duration::from_secs(60));
        r.handle.set_mode(Mode::Setup).await.unwrap();
        r.handle.jog(jog(None)).await.unwrap();
        assert!(r.probe.any_running());

        drop(r.handle);
        tokio::time::timeout(Duration::from_secs(1), r.task)
            .await
            .expect("loop should exit")
            .unwrap();
        assert!(!r.probe.any_running());
    }

    #[tokio::test]
    async fn stop_all_wins_over_concurrent_jogs() {
        let r = rig(Duration::from_secs(60));
        r.handle.set_mode(Mode::Setup).await.unwrap();

        let jogs: Vec<_> = (0..4)
            .map(|_| {
                let h = r.handle.clone();
                tokio::spawn(async move { h.jog(jog(None)).await })
            })
            .collect();
        tokio::task::yield_now().await;
        r.handle.stop_all().await.unwrap();

        for j in jogs {
            let _ = j.await.unwrap();
        }
        assert!(!r.probe.any_running());
        assert_eq!(
            r.handle.get_status().await.fault,
            Some(FaultCause::ManualTrigger)
        );
    }

    #[tokio::test]
    async fn priority_queue_is_drained_first() {
        let r = rig(Duration::from_secs(60));
        r.handle.set_mode(Mode::Setup).await.unwrap();

        let (normal_reply, normal_rx) = oneshot::channel();
        let (stop_reply, stop_rx) = oneshot::channel();
        // Both queued before the loop next runs: the normal request first.
        r.handle
            .enqueue(Command::Submit {
                request: MotionRequest::new(MotionCommand::Jog(jog(None)), "test"),
                reply: normal_reply,
            })
            .unwrap();
        r.handle
            .enqueue(Command::Submit {
                request: MotionRequest::new(MotionCommand::StopAll, "test"),
                reply: stop_reply,
            })
            .unwrap();

        stop_rx.await.unwrap().unwrap();
        let jog_result = normal_rx.await.unwrap();
        assert!(matches!(jog_result, Err(ControlError::Rejected(_))));
        assert!(!r.probe.any_running());
    }
}
