//! Configuration – reads `~/.cablebot/config.toml` (or `$CABLEBOT_CONFIG`).
//!
//! The file is read once at startup.  Everything below the binary receives
//! plain values built from it: a [`LinkConfig`], [`SafetyThresholds`] and
//! the winch-to-address map.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use cablebot_hal::WinchTarget;
use cablebot_link::LinkConfig;
use cablebot_types::{HallRunProfile, MAX_RPM, MAX_WINCHES, SafetyThresholds};

/// How the motor field bus is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BusTransport {
    /// RS-485 to TCP gateway.
    #[default]
    Tcp,
    /// Serial device node, already configured for 9600 8N1.
    Device,
}

impl std::fmt::Display for BusTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BusTransport::Tcp => write!(f, "tcp"),
            BusTransport::Device => write!(f, "device"),
        }
    }
}

/// `[bridge]` – the sensor bridge link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub reconnect_attempts: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_factor: f64,
    pub use_imu: bool,
    pub use_distance: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: "192.168.2.123".to_string(),
            port: 5000,
            connect_timeout_ms: 500,
            request_timeout_ms: 200,
            reconnect_attempts: 2,
            backoff_initial_ms: 200,
            backoff_max_ms: 2000,
            backoff_factor: 1.5,
            use_imu: true,
            use_distance: false,
        }
    }
}

/// `[motion]` – winches, safety limits and operator presets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    pub winch_ids: Vec<u8>,
    /// Modbus address per winch, in `winch_ids` order.  Defaults to the
    /// winch id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modbus_addresses: Option<Vec<u8>>,
    pub min_hall: u16,
    pub poll_interval_ms: u64,
    pub stale_timeout_ms: u64,
    pub jog_rpm: u16,
    pub jog_ms: u64,
    pub test_rpm: u16,
    pub test_ms: u64,
    /// Hall reading at which a hall run reaches `hall_rpm_max`.
    pub hall_max: u16,
    pub hall_rpm_min: u16,
    pub hall_rpm_max: u16,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            winch_ids: vec![1, 2, 3, 4],
            modbus_addresses: None,
            min_hall: 1500,
            poll_interval_ms: 50,
            stale_timeout_ms: 150,
            jog_rpm: 200,
            jog_ms: 1000,
            test_rpm: 350,
            test_ms: 6000,
            hall_max: 2800,
            hall_rpm_min: 200,
            hall_rpm_max: 1500,
        }
    }
}

/// `[bus]` – the motor field bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub transport: BusTransport,
    /// Gateway `host:port` for the `tcp` transport.
    pub address: String,
    /// Device path for the `device` transport.
    pub device: String,
    pub timeout_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            transport: BusTransport::Tcp,
            address: "127.0.0.1:4196".to_string(),
            device: "/dev/ttyUSB0".to_string(),
            timeout_ms: 150,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bridge: BridgeConfig,
    pub motion: MotionConfig,
    pub bus: BusConfig,
}

impl Config {
    pub fn bridge_addr(&self) -> String {
        format!("{}:{}", self.bridge.host, self.bridge.port)
    }

    pub fn link_config(&self) -> LinkConfig {
        let b = &self.bridge;
        LinkConfig {
            addr: self.bridge_addr(),
            connect_timeout: Duration::from_millis(b.connect_timeout_ms),
            request_timeout: Duration::from_millis(b.request_timeout_ms),
            reconnect_attempts: b.reconnect_attempts,
            backoff_initial: Duration::from_millis(b.backoff_initial_ms),
            backoff_max: Duration::from_millis(b.backoff_max_ms),
            backoff_factor: b.backoff_factor,
            winch_ids: self.motion.winch_ids.clone(),
            use_imu: b.use_imu,
            use_distance: b.use_distance,
        }
    }

    pub fn thresholds(&self) -> SafetyThresholds {
        SafetyThresholds {
            min_hall: self.motion.min_hall,
            max_age: Duration::from_millis(self.motion.stale_timeout_ms),
        }
    }

    pub fn hall_profile(&self) -> HallRunProfile {
        HallRunProfile {
            hall_max: self.motion.hall_max,
            rpm_min: self.motion.hall_rpm_min,
            rpm_max: self.motion.hall_rpm_max,
        }
    }

    pub fn winch_targets(&self) -> Vec<WinchTarget> {
        match &self.motion.modbus_addresses {
            Some(addrs) => self
                .motion
                .winch_ids
                .iter()
                .zip(addrs)
                .map(|(&winch, &slave)| WinchTarget::new(winch, slave))
                .collect(),
            None => WinchTarget::sequential(&self.motion.winch_ids),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.motion.poll_interval_ms)
    }

    pub fn bus_timeout(&self) -> Duration {
        Duration::from_millis(self.bus.timeout_ms)
    }

    /// Reject settings the controller cannot run with.
    pub fn validate(&self) -> Result<(), String> {
        let m = &self.motion;
        if m.winch_ids.is_empty() {
            return Err("motion.winch_ids must name at least one winch".to_string());
        }
        if m.winch_ids.len() > MAX_WINCHES {
            return Err(format!(
                "motion.winch_ids names {} winches; at most {MAX_WINCHES} are supported",
                m.winch_ids.len()
            ));
        }
        let mut ids = m.winch_ids.clone();
        ids.sort_unstable();
        ids.dedup();
        if ids.len() != m.winch_ids.len() {
            return Err("motion.winch_ids contains duplicates".to_string());
        }
        if let Some(addrs) = &m.modbus_addresses
            && addrs.len() != m.winch_ids.len()
        {
            return Err(format!(
                "motion.modbus_addresses has {} entries for {} winches",
                addrs.len(),
                m.winch_ids.len()
            ));
        }
        for (name, value) in [
            ("bridge.connect_timeout_ms", self.bridge.connect_timeout_ms),
            ("bridge.request_timeout_ms", self.bridge.request_timeout_ms),
            ("motion.poll_interval_ms", m.poll_interval_ms),
            ("motion.stale_timeout_ms", m.stale_timeout_ms),
            ("bus.timeout_ms", self.bus.timeout_ms),
        ] {
            if value == 0 {
                return Err(format!("{name} must be greater than zero"));
            }
        }
        if m.stale_timeout_ms < m.poll_interval_ms {
            return Err(format!(
                "motion.stale_timeout_ms ({}) is shorter than the poll interval ({})",
                m.stale_timeout_ms, m.poll_interval_ms
            ));
        }
        if [m.jog_rpm, m.test_rpm, m.hall_rpm_min, m.hall_rpm_max]
            .iter()
            .any(|&rpm| rpm > MAX_RPM)
        {
            return Err(format!("motion rpm settings must not exceed {MAX_RPM}"));
        }
        if m.hall_rpm_min > m.hall_rpm_max {
            return Err("motion.hall_rpm_min is above motion.hall_rpm_max".to_string());
        }
        let factor = self.bridge.backoff_factor;
        if !(factor.is_finite() && factor >= 1.0) {
            return Err(format!(
                "bridge.backoff_factor must be a finite number of at least 1.0, got {factor}"
            ));
        }
        Ok(())
    }
}

/// `$CABLEBOT_CONFIG`, else `~/.cablebot/config.toml`.
pub fn config_path() -> PathBuf {
    if let Ok(p) = std::env::var("CABLEBOT_CONFIG") {
        return PathBuf::from(p);
    }
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".cablebot").join("config.toml")
}

/// Load, apply environment overrides and validate.  A missing file yields
/// the defaults.
pub fn load() -> Result<Config, String> {
    let mut cfg = load_from(&config_path())?.unwrap_or_default();
    apply_env_overrides(&mut cfg);
    cfg.validate()?;
    Ok(cfg)
}

/// Parse the file at `path`.  Returns `None` if it does not exist.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    Ok(Some(cfg))
}

/// Apply `CABLEBOT_*` environment overrides.  Unparsable numbers are ignored.
///
/// | Variable | Config field |
/// |---|---|
/// | `CABLEBOT_BRIDGE_HOST` | `bridge.host` |
/// | `CABLEBOT_BRIDGE_PORT` | `bridge.port` |
/// | `CABLEBOT_BUS_ADDRESS` | `bus.address` |
/// | `CABLEBOT_MIN_HALL` | `motion.min_hall` |
/// | `CABLEBOT_STALE_TIMEOUT_MS` | `motion.stale_timeout_ms` |
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("CABLEBOT_BRIDGE_HOST") {
        cfg.bridge.host = v;
    }
    if let Ok(v) = std::env::var("CABLEBOT_BRIDGE_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.bridge.port = port;
    }
    if let Ok(v) = std::env::var("CABLEBOT_BUS_ADDRESS") {
        cfg.bus.address = v;
    }
    if let Ok(v) = std::env::var("CABLEBOT_MIN_HALL")
        && let Ok(min) = v.parse::<u16>()
    {
        cfg.motion.min_hall = min;
    }
    if let Ok(v) = std::env::var("CABLEBOT_STALE_TIMEOUT_MS")
        && let Ok(ms) = v.parse::<u64>()
    {
        cfg.motion.stale_timeout_ms = ms;
    }
}

/// Write `cfg` to `path`, creating the parent directory.  Refuses to
/// overwrite an existing file.
pub fn write_new(cfg: &Config, path: &Path) -> Result<(), String> {
    if path.exists() {
        return Err(format!("{} already exists", path.display()));
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
    }
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))
}
