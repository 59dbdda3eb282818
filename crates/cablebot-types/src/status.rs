//! Operator-facing status snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::mode::{FaultCause, Mode};

/// What `get_status` reports.  Always reflects the true mode and fault state.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ControllerStatus {
    pub mode: Mode,
    pub fault: Option<FaultCause>,
    pub fault_since: Option<DateTime<Utc>>,
    /// Age of the newest sensor bundle in milliseconds; `None` before the
    /// first successful poll.
    pub last_bundle_age_ms: Option<u64>,
    /// Hall values of the newest bundle, in winch order.
    pub hall: Vec<u16>,
    /// Label of the motion currently commanded, if motors are running.
    pub motion: Option<String>,
    pub last_driver_error: Option<String>,
}

impl ControllerStatus {
    pub fn is_faulted(&self) -> bool {
        self.fault.is_some()
    }
}
