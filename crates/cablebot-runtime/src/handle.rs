//! [`ControllerHandle`] – the operator-facing control facade.
//!
//! Every front end (console, web UI) talks to the controller through a
//! handle.  Handles are cheap to clone; each call becomes one request on the
//! control loop's queues and the caller awaits its outcome.  Rejections come
//! back as [`ControlError::Rejected`] carrying the reason, and a loop that
//! has gone away yields [`ControlError::Unavailable`].

use cablebot_types::{
    ControlError, ControllerStatus, HallRunParams, JogParams, Mode, MotionCommand, MotionRequest,
    TestMoveParams,
};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::warn;

use crate::control_loop::Command;

#[derive(Clone)]
pub struct ControllerHandle {
    priority_tx: mpsc::Sender<Command>,
    normal_tx: mpsc::Sender<Command>,
    status_rx: watch::Receiver<ControllerStatus>,
    source: String,
}

impl ControllerHandle {
    pub(crate) fn new(
        priority_tx: mpsc::Sender<Command>,
        normal_tx: mpsc::Sender<Command>,
        status_rx: watch::Receiver<ControllerStatus>,
    ) -> Self {
        Self {
            priority_tx,
            normal_tx,
            status_rx,
            source: "api".to_string(),
        }
    }

    /// A clone whose requests are tagged with `source` in logs.
    pub fn with_source(&self, source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ..self.clone()
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Current mode, fault, telemetry and motion state.
    ///
    /// Never fails: if the loop cannot answer, the last pushed snapshot is
    /// returned.
    pub async fn get_status(&self) -> ControllerStatus {
        let (reply, rx) = oneshot::channel();
        if self.normal_tx.send(Command::Status { reply }).await.is_ok()
            && let Ok(status) = rx.await
        {
            return status;
        }
        self.status_rx.borrow().clone()
    }

    /// Pushed on every mode, fault or motion change.
    pub fn subscribe_status(&self) -> watch::Receiver<ControllerStatus> {
        self.status_rx.clone()
    }

    pub async fn set_mode(&self, mode: Mode) -> Result<(), ControlError> {
        self.submit_command(MotionCommand::SetMode(mode)).await
    }

    pub async fn clear_fault(&self) -> Result<(), ControlError> {
        let (reply, rx) = oneshot::channel();
        self.call(Command::ClearFault { reply }, rx).await?
    }

    /// Soft stop.
    pub async fn stop(&self) -> Result<(), ControlError> {
        self.submit_command(MotionCommand::Stop).await
    }

    /// Emergency stop: stops every winch and latches a manual fault.
    pub async fn stop_all(&self) -> Result<(), ControlError> {
        self.submit_command(MotionCommand::StopAll).await
    }

    /// Setup-mode jog of all winches.
    pub async fn jog(&self, params: JogParams) -> Result<(), ControlError> {
        self.submit_command(MotionCommand::Jog(params)).await
    }

    /// Setup-mode run with speeds following each winch's hall reading.
    pub async fn hall_run(&self, params: HallRunParams) -> Result<(), ControlError> {
        self.submit_command(MotionCommand::HallRun(params)).await
    }

    /// Test-mode directional move.
    pub async fn test_move(&self, params: TestMoveParams) -> Result<(), ControlError> {
        self.submit_command(MotionCommand::TestMove(params)).await
    }

    /// Wrap `command` in a request tagged with this handle's source.
    pub async fn submit_command(&self, command: MotionCommand) -> Result<(), ControlError> {
        self.submit(MotionRequest::new(command, self.source.as_str()))
            .await
    }

    /// Submit a fully formed request.  Stops go on the priority queue.
    pub async fn submit(&self, request: MotionRequest) -> Result<(), ControlError> {
        let (reply, rx) = oneshot::channel();
        self.call(Command::Submit { request, reply }, rx).await?
    }

    /// Queue an emergency stop without waiting for the outcome.
    ///
    /// Safe to call from outside the async runtime, e.g. a signal handler.
    pub fn trigger_stop_all(&self) -> Result<(), ControlError> {
        let (reply, _rx) = oneshot::channel();
        let request = MotionRequest::new(MotionCommand::StopAll, self.source.as_str());
        self.enqueue(Command::Submit { request, reply })
    }

    // ────────────────────────────────────────────────────────────────────
    // Internals
    // ────────────────────────────────────────────────────────────────────

    fn queue_for(&self, cmd: &Command) -> &mpsc::Sender<Command> {
        match cmd {
            Command::Submit { request, .. } if request.command.is_stop() => &self.priority_tx,
            _ => &self.normal_tx,
        }
    }

    async fn call<T>(&self, cmd: Command, rx: oneshot::Receiver<T>) -> Result<T, ControlError> {
        self.queue_for(&cmd)
            .send(cmd)
            .await
            .map_err(|_| ControlError::Unavailable)?;
        rx.await.map_err(|_| ControlError::Unavailable)
    }

    pub(crate) fn enqueue(&self, cmd: Command) -> Result<(), ControlError> {
        self.queue_for(&cmd).try_send(cmd).map_err(|e| {
            warn!(source = %self.source, error = %e, "control queue refused request");
            ControlError::Unavailable
        })
    }
}
