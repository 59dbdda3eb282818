//! Sensor telemetry snapshots.
//!
//! A [`SensorBundle`] is built by the telemetry link from one poll of the
//! sensor bridge and is never modified afterwards; the next poll replaces it
//! as a whole.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Everything the bridge reports for one winch in a single exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct WinchReading {
    pub winch: u8,
    pub flags: u8,
    /// Encoder count since power-up.
    pub total_count: i32,
    /// Encoder count since the previous read.
    pub delta_count: i32,
    /// Raw hall-effect sensor value; proxy for cable tension.
    pub hall_raw: u16,
    pub dist_mm: u16,
    pub strength: u16,
    pub temp_raw: u16,
    pub age_ms: u16,
    pub bus_mv: u16,
    pub current_ma: i16,
    pub power_mw: u32,
    /// How old the bridge's own cached sample was when it answered.
    pub cache_age_ms: u32,
}

/// Orientation and motion sample from the platform IMU.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ImuReading {
    pub gyro: [f32; 3],
    pub accel: [f32; 3],
    pub temp_c: f32,
    pub pitch: f32,
    pub roll: f32,
    pub yaw: f32,
    pub cache_age_ms: u32,
}

/// Range-finder sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct DistanceReading {
    /// Non-zero when the range finder reported a valid measurement.
    pub ok: u8,
    pub dist_mm: u16,
    pub strength: u16,
    pub temp_raw: u16,
    pub age_ms: u16,
    pub cache_age_ms: u32,
}

/// One consistent snapshot of all sensor readings.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorBundle {
    /// Monotonic poll counter assigned by the telemetry link.
    pub seq: u64,
    /// When the poll that produced this bundle completed.
    pub captured_at: Instant,
    /// One reading per configured winch, in configuration order.
    pub winches: Vec<WinchReading>,
    pub imu: Option<ImuReading>,
    pub distance: Option<DistanceReading>,
}

impl SensorBundle {
    /// Hall values in winch order.
    pub fn hall_values(&self) -> impl Iterator<Item = u16> + '_ {
        self.winches.iter().map(|w| w.hall_raw)
    }

    /// Time elapsed since the bundle was captured.
    pub fn age(&self) -> Duration {
        self.age_at(Instant::now())
    }

    /// Age relative to `now`.  Saturates at zero for instants before capture.
    pub fn age_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.captured_at)
    }

    /// First winch whose hall value is below `min_hall`, if any.
    pub fn first_hall_below(&self, min_hall: u16) -> Option<&WinchReading> {
        self.winches.iter().find(|w| w.hall_raw < min_hall)
    }
}

/// Safety limits derived from configuration.  Read-only at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SafetyThresholds {
    /// Lowest acceptable hall reading on any winch.
    pub min_hall: u16,
    /// Telemetry is stale once it is this old.
    pub max_age: Duration,
}

impl Default for SafetyThresholds {
    fn default() -> Self {
        Self {
            min_hall: 1500,
            max_age: Duration::from_millis(150),
        }
    }
}
